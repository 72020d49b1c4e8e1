//! Respond-first response cache.
//!
//! A stored page is answered straight from the entry store. Once it goes
//! stale it is still answered straight away, and the handler runs afterwards
//! to replace it for the next visitor. Only a plain `200` replaces an entry;
//! anything else the handler settles on erases it.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `respond-first.toml`:
//!
//! ```toml
//! [cache]
//! directory = "cache"
//! ttl = 300                  # seconds, or "none"
//! schedule = "0 * * * * *"   # minute hour day month weekday year, or "none"
//! timezone = "Europe/Berlin"
//! ```

mod clock;
mod config;
mod controller;
mod encoding;
mod headers;
mod keys;
mod lock;
mod middleware;
mod observer;
mod schedule;
mod staleness;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use controller::{
    Capture, CaptureBuffer, CaptureOutput, Controller, Lookup, Outcome, RequestContext, Served,
    Settlement,
};
pub use encoding::{BodyFilter, Encoded, accepts_gzip, encode_for_client};
pub use headers::{CacheStatus, X_CACHE_STATUS, http_date};
pub use keys::{EntryKey, RequestIdentity};
pub use middleware::{CacheBuildError, CacheState, respond_first_layer};
pub use observer::{CancelReason, StatusObserver, Verdict};
pub use schedule::{Field, ScheduleError, SchedulePattern, ScheduleSpec, parse_schedule};
pub use staleness::{ExpiryPolicy, StalenessDecision, is_stale, next_occurrence};
pub use store::{CachedEntry, EntryStore, FsEntryStore, MemoryEntryStore, StoreError};
