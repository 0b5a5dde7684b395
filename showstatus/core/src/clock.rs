//! Time Sources
//!
//! Every age, expiry and curfew decision in the core reads time through the
//! [`Clock`] trait so that derivations stay deterministic under test.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Timelike;

/// Source of wall-clock time for the core
pub trait Clock: Send + Sync {
    /// Current time as Unix epoch milliseconds
    fn now_ms(&self) -> u64;

    /// Current local hour of day (0-23)
    fn local_hour(&self) -> u32;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time and local timezone
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }

    fn local_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

/// Manually driven clock for tests and replay tooling
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
    hour: AtomicU32,
}

impl ManualClock {
    /// Create a clock frozen at `now_ms` and local hour `hour`
    #[must_use]
    pub fn new(now_ms: u64, hour: u32) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            hour: AtomicU32::new(hour),
        }
    }

    /// Create a shared handle
    #[must_use]
    pub fn shared(now_ms: u64, hour: u32) -> Arc<Self> {
        Arc::new(Self::new(now_ms, hour))
    }

    /// Move time forward
    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    /// Change the local hour
    pub fn set_hour(&self, hour: u32) {
        self.hour.store(hour % 24, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn local_hour(&self) -> u32 {
        self.hour.load(Ordering::SeqCst)
    }
}

/// Get current Unix timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000, 18);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set_hour(25);
        assert_eq!(clock.local_hour(), 1);
    }

    #[test]
    fn test_system_clock_is_sane() {
        let clock = SystemClock;
        assert!(clock.now_ms() > 1_600_000_000_000);
        assert!(clock.local_hour() < 24);
    }
}
