use std::process;

use chrono::{DateTime, Utc};
use respond_first::{
    cache::{CacheConfig, CacheState, Clock, EntryStore, FsEntryStore, RequestIdentity, SystemClock},
    config,
    error::AppError,
    infra::{error::InfraError, http, proxy::UpstreamState, telemetry},
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Inspect(args) => run_inspect(settings, args).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = CacheState::open(CacheConfig::from(&settings.cache))?;
    let upstream = UpstreamState::new(&settings.upstream)?;

    info!(
        target = "respond_first::serve",
        store = %cache.config.store_dir.display(),
        ttl_secs = cache.config.ttl.map(|ttl| ttl.as_secs()),
        schedule = cache.config.schedule.as_ref().map(|pattern| pattern.as_str()),
        timezone = %cache.config.timezone,
        upstream = %upstream.origin(),
        "Starting respond-first proxy"
    );

    if !cache.config.expires() {
        warn!(
            target = "respond_first::serve",
            "Neither a TTL nor a refresh schedule is configured; entries never go stale"
        );
    }

    let router = http::build_router(cache, upstream);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    http::serve(listener, router).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct EntryReport {
    url: String,
    identity: String,
    key: String,
    path: String,
    stored: bool,
    stored_at: Option<DateTime<Utc>>,
    body_bytes: Option<usize>,
    is_stale: Option<bool>,
    effective_ttl_secs: Option<u64>,
    max_age_secs: Option<u64>,
    next_refresh: Option<DateTime<Utc>>,
}

async fn run_inspect(settings: config::Settings, args: config::EntryArgs) -> Result<(), AppError> {
    let config = CacheConfig::from(&settings.cache);
    let policy = config.expiry_policy();
    let store = open_store(&config)?;
    let url = parse_entry_url(&args.url)?;
    let identity = RequestIdentity::from_url(&url);
    let key = identity.key();

    let now = SystemClock.now();
    let entry = store.get(&key).await?;
    let decision = entry
        .as_ref()
        .map(|entry| (entry, policy.evaluate(entry.stored_at, now)));

    let report = EntryReport {
        url: url.to_string(),
        identity: identity.canonical(),
        key: key.to_string(),
        path: store.path_for(&key).display().to_string(),
        stored: entry.is_some(),
        stored_at: entry.as_ref().map(|entry| entry.stored_at),
        body_bytes: entry.as_ref().map(|entry| entry.body.len()),
        is_stale: decision.as_ref().map(|(_, decision)| decision.is_stale),
        effective_ttl_secs: decision
            .as_ref()
            .and_then(|(_, decision)| decision.effective_ttl)
            .map(|ttl| ttl.as_secs()),
        max_age_secs: decision
            .as_ref()
            .and_then(|(entry, decision)| decision.max_age(entry.stored_at, now))
            .map(|age| age.as_secs()),
        next_refresh: decision
            .as_ref()
            .and_then(|(_, decision)| decision.next_refresh),
    };

    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::validation(format!("failed to render report: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_purge(settings: config::Settings, args: config::EntryArgs) -> Result<(), AppError> {
    let config = CacheConfig::from(&settings.cache);
    let store = open_store(&config)?;
    let url = parse_entry_url(&args.url)?;
    let key = RequestIdentity::from_url(&url).key();

    store.delete(&key).await?;

    info!(
        target = "respond_first::purge",
        url = %url,
        key = %key,
        "Entry purged"
    );
    Ok(())
}

fn open_store(config: &CacheConfig) -> Result<FsEntryStore, AppError> {
    FsEntryStore::new(config.store_dir.clone()).map_err(|err| AppError::from(InfraError::from(err)))
}

fn parse_entry_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|err| AppError::validation(format!("invalid URL `{raw}`: {err}")))?;
    if url.host_str().is_none() {
        return Err(AppError::validation(format!("URL `{raw}` has no host")));
    }
    Ok(url)
}
