//! Per-Action Gating
//!
//! Two small local throttles that sit in front of user actions:
//!
//! - [`CooldownTracker`]: per-song expiry after a successful request. A repeat
//!   attempt before expiry is rejected without touching the network.
//! - [`SingleFlight`]: at most one user action in flight. The RAII
//!   [`FlightGuard`] releases the slot on every exit path, including early
//!   returns, panics and dropped futures.
//!
//! Neither is persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;

// =============================================================================
// Cooldown
// =============================================================================

/// Local per-song request throttle
#[derive(Debug)]
pub struct CooldownTracker {
    cooldown: Duration,
    expiries: DashMap<String, u64>,
}

impl CooldownTracker {
    /// Create a tracker with the given cooldown period
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            expiries: DashMap::new(),
        }
    }

    /// Seconds left on `song_id`'s cooldown, rounded up; `None` when clear
    #[must_use]
    pub fn remaining_secs(&self, song_id: &str, now_ms: u64) -> Option<u64> {
        let expiry = *self.expiries.get(song_id)?;
        if expiry <= now_ms {
            self.expiries.remove(song_id);
            return None;
        }
        Some((expiry - now_ms).div_ceil(1_000))
    }

    /// Start the cooldown for `song_id`
    pub fn record(&self, song_id: &str, now_ms: u64) {
        let expiry = now_ms + self.cooldown.as_millis() as u64;
        self.expiries.insert(song_id.to_string(), expiry);
    }

    /// Drop expired entries
    pub fn prune(&self, now_ms: u64) {
        self.expiries.retain(|_, expiry| *expiry > now_ms);
    }

    /// Number of songs currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }
}

// =============================================================================
// Single flight
// =============================================================================

/// Allows one action at a time
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    /// Create an idle guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot; `None` while another action holds it
    pub fn try_start(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    /// Whether an action is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`SingleFlight`] slot when dropped
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}
