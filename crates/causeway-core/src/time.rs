//! Time source abstraction
//!
//! Token expiry, heartbeat windows, and election timeouts all read time
//! through [`TimeSource`] so tests can drive the clock deterministically.
//! Causal ordering never consults this clock; it exists only for leases and
//! liveness windows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Production time source backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced time source for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Create a manual source starting at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Advance the clock by `delta_millis`.
    pub fn advance(&self, delta_millis: u64) {
        self.now.fetch_add(delta_millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
