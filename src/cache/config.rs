//! Cache configuration.
//!
//! Controls the entry store, the expiry signals and transmission via
//! `respond-first.toml`.

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use super::schedule::SchedulePattern;
use super::staleness::ExpiryPolicy;

// Default values for cache configuration
const DEFAULT_STORE_DIR: &str = "cache";
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_BODY_LIMIT_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Cache configuration resolved from `[cache]` settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory of the filesystem entry store.
    pub store_dir: PathBuf,
    /// Fixed lifetime of an entry; `None` disables TTL expiry.
    pub ttl: Option<Duration>,
    /// Recurring refresh schedule; `None` disables schedule expiry.
    pub schedule: Option<SchedulePattern>,
    /// Timezone the schedule's calendar fields are read in.
    pub timezone: Tz,
    /// Gzip bodies for clients that accept it.
    pub compression: bool,
    /// Largest handler body that will be captured.
    pub body_limit_bytes: usize,
    /// `Content-Type` of bodies served from the store.
    pub content_type: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            ttl: Some(Duration::from_secs(DEFAULT_TTL_SECS)),
            schedule: None,
            timezone: Tz::UTC,
            compression: true,
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            store_dir: settings.directory.clone(),
            ttl: settings.ttl,
            schedule: settings.schedule.clone(),
            timezone: settings.timezone,
            compression: settings.compression,
            body_limit_bytes: settings.body_limit_bytes,
            content_type: settings.content_type.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns true if at least one expiry signal is configured.
    pub fn expires(&self) -> bool {
        self.ttl.is_some() || self.schedule.is_some()
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.ttl, self.schedule.clone(), self.timezone)
    }
}
