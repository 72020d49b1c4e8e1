use std::sync::RwLock;

use chrono::{DateTime, TimeDelta, Utc};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::clock";

/// Source of "now" for staleness decisions and write timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *rw_write(&self.now, SOURCE, "manual_set") = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = rw_write(&self.now, SOURCE, "manual_advance");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *rw_read(&self.now, SOURCE, "manual_now")
    }
}
