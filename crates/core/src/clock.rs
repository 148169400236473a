use std::sync::atomic::{AtomicI64, Ordering};

use crate::CoreError;
use crate::timestamp::{Timestamp, physical_now};

/// Source of pipeline time. Shared by every worker.
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<Timestamp, CoreError>;
}

/// Wall-clock time that never runs backwards within one process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Result<Timestamp, CoreError> {
        let now = physical_now()?;
        let prev = self.last_ms.fetch_max(now, Ordering::AcqRel);
        Ok(Timestamp::from_millis(prev.max(now)))
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            ms: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, to: Timestamp) {
        self.ms.store(to.as_millis(), Ordering::Release);
    }

    pub fn advance_ms(&self, ms: u64) -> Timestamp {
        let delta = i64::try_from(ms).unwrap_or(i64::MAX);
        let prev = self.ms.fetch_add(delta, Ordering::AcqRel);
        Timestamp::from_millis(prev.saturating_add(delta))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Result<Timestamp, CoreError> {
        Ok(Timestamp::from_millis(self.ms.load(Ordering::Acquire)))
    }
}
