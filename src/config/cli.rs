use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the respond-first binary.
#[derive(Debug, Parser)]
#[command(
    name = "respond-first",
    version,
    about = "Full-page cache that answers with the previous page and regenerates afterwards"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "RESPOND_FIRST_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching reverse proxy.
    Serve(Box<ServeArgs>),
    /// Show the stored entry for a URL and how it would be served now.
    Inspect(EntryArgs),
    /// Remove the stored entry for a URL.
    Purge(EntryArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct EntryArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Absolute URL of the page, e.g. `https://example.com/blog?page=2`.
    #[arg(value_name = "URL", value_hint = ValueHint::Url)]
    pub url: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the entry store directory.
    #[arg(long = "cache-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub directory: Option<PathBuf>,

    /// Override the fixed entry lifetime in seconds (`none` disables it).
    #[arg(long = "cache-ttl", value_name = "SECONDS|none")]
    pub ttl: Option<String>,

    /// Override the refresh schedule (`none` disables it).
    #[arg(long = "cache-schedule", value_name = "PATTERN|none")]
    pub schedule: Option<String>,

    /// Override the timezone used to read the refresh schedule.
    #[arg(long = "cache-timezone", value_name = "TZ")]
    pub timezone: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle gzip for clients that accept it.
    #[arg(
        long = "cache-compression",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_compression: Option<bool>,

    /// Override the origin requests are forwarded to.
    #[arg(long = "upstream-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub upstream_url: Option<String>,
}
