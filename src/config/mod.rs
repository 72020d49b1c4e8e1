//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use chrono_tz::Tz;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::SchedulePattern;

mod cli;

pub use cli::{CacheOverrides, CliArgs, Command, EntryArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "respond-first";
const ENV_PREFIX: &str = "RESPOND_FIRST";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_BODY_LIMIT_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DISABLED: &str = "none";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Validated `[cache]` table.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub ttl: Option<Duration>,
    pub schedule: Option<SchedulePattern>,
    pub timezone: Tz,
    pub compression: bool,
    pub body_limit_bytes: usize,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Inspect(args)) | Some(Command::Purge(args)) => {
            raw.apply_cache_overrides(&args.cache)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(compression) = overrides.cache_compression {
            self.cache.compression = Some(compression);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(directory) = overrides.directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(ttl) = overrides.ttl.as_ref() {
            self.cache.ttl = Some(RawSeconds::Text(ttl.clone()));
        }
        if let Some(schedule) = overrides.schedule.as_ref() {
            self.cache.schedule = Some(schedule.clone());
        }
        if let Some(timezone) = overrides.timezone.as_ref() {
            self.cache.timezone = Some(timezone.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            upstream,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let upstream = build_upstream_settings(upstream)?;

        Ok(Self {
            server,
            logging,
            cache,
            upstream,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    let ttl = match cache.ttl {
        None => Some(Duration::from_secs(DEFAULT_CACHE_TTL_SECS)),
        Some(raw) => raw.into_duration("cache.ttl")?,
    };

    let schedule = match cache.schedule.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) if value.eq_ignore_ascii_case(DISABLED) => None,
        Some(value) => Some(
            SchedulePattern::parse(value)
                .map_err(|err| LoadError::invalid("cache.schedule", err.to_string()))?,
        ),
    };

    let timezone = match cache.timezone.as_deref().map(str::trim) {
        None | Some("") => Tz::UTC,
        Some(value) => Tz::from_str(value).map_err(|err| {
            LoadError::invalid("cache.timezone", format!("unknown timezone `{value}`: {err}"))
        })?,
    };

    let body_limit = cache
        .body_limit_bytes
        .unwrap_or(DEFAULT_CACHE_BODY_LIMIT_BYTES);
    if body_limit == 0 {
        return Err(LoadError::invalid(
            "cache.body_limit_bytes",
            "must be greater than zero",
        ));
    }
    let body_limit_bytes = usize::try_from(body_limit).map_err(|_| {
        LoadError::invalid(
            "cache.body_limit_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    let content_type = cache
        .content_type
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    if axum::http::HeaderValue::from_str(&content_type).is_err() {
        return Err(LoadError::invalid(
            "cache.content_type",
            "not a valid header value",
        ));
    }

    Ok(CacheSettings {
        directory,
        ttl,
        schedule,
        timezone,
        compression: cache.compression.unwrap_or(true),
        body_limit_bytes,
        content_type,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    let url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("upstream.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    directory: Option<PathBuf>,
    ttl: Option<RawSeconds>,
    schedule: Option<String>,
    timezone: Option<String>,
    compression: Option<bool>,
    body_limit_bytes: Option<u64>,
    content_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

/// A duration in seconds that can also be switched off with `none`.
/// Environment variables always arrive as text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawSeconds {
    Seconds(u64),
    Text(String),
}

impl RawSeconds {
    fn into_duration(self, key: &'static str) -> Result<Option<Duration>, LoadError> {
        let seconds = match self {
            RawSeconds::Seconds(seconds) => seconds,
            RawSeconds::Text(text) => {
                let text = text.trim();
                if text.is_empty() || text.eq_ignore_ascii_case(DISABLED) {
                    return Ok(None);
                }
                text.parse::<u64>().map_err(|err| {
                    LoadError::invalid(key, format!("expected seconds or `none`: {err}"))
                })?
            }
        };

        if seconds == 0 {
            return Err(LoadError::invalid(
                key,
                "must be greater than zero; use `none` to disable",
            ));
        }
        Ok(Some(Duration::from_secs(seconds)))
    }
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
