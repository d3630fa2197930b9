//! Time sources.
//!
//! Due dates, lock expirations and historic timestamps all come from a
//! [`Clock`]. Production uses [`SystemClock`]; tests pin time with
//! [`FrozenClock`] so that entries written in one step share a timestamp and
//! due dates can be asserted exactly.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Abstraction over the wall clock.
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock handle shared between the engine, the executor and handlers.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
///
/// Cloning yields a handle to the same instant.
#[derive(Debug, Clone)]
pub struct FrozenClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FrozenClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Freeze at the current wall-clock instant, truncated to whole seconds.
    pub fn now_truncated() -> Self {
        let now = Utc::now();
        Self::at(DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
