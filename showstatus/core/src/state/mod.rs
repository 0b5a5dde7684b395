//! State Machine - The Canonical Snapshot
//!
//! [`StateMachine`] owns the single authoritative [`Snapshot`]. Every other
//! component (poller, speaker coordinator, action controller, presentation)
//! holds an `Arc<StateMachine>` and writes through [`StateMachine::set_state`].
//!
//! # Update Semantics
//!
//! - `set_state` shallow-merges a [`StatePatch`] under the internal lock, so a
//!   patch fully replaces the sub-trees it names and leaves the rest alone.
//! - The lock is released before subscribers run. Subscribers are called
//!   synchronously, in registration order, and may themselves call
//!   `set_state`; the nested call runs to completion before the outer fan-out
//!   continues. Nesting is not bounded, only logged past a configured depth.
//! - A subscriber that errors or panics is logged and skipped.
//! - After the fan-out, the same [`StateChange`] is published on a broadcast
//!   channel for consumers that prefer message passing ([`StateMachine::watch`]).

mod derive;

pub use derive::{
    derive_view, determine_state_from_data, health_score, ConnectivityState, DerivedState,
    DisplayStatus, FailureCounters, Feed, StateThresholds,
};

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::config::StatusConfig;
use crate::envelope::{ErrorCode, ResultEnvelope};
use crate::model::{ControllerData, ShowData, SpeakerSession, VisitorSession};

/// Reasons used by the core when committing state
pub mod reason {
    /// Combined commit at the end of a poll cycle
    pub const POLL_UPDATE: &str = "POLL_UPDATE";
    /// Speaker sub-record replaced from the hardware feed
    pub const SPEAKER_UPDATE: &str = "SPEAKER_UPDATE";
    /// Speaker enabled by a viewer command
    pub const SPEAKER_ENABLED: &str = "SPEAKER_ENABLED";
    /// Speaker session extended by a viewer command
    pub const SPEAKER_EXTENDED: &str = "SPEAKER_EXTENDED";
    /// One countdown second elapsed
    pub const SPEAKER_TICK: &str = "SPEAKER_TICK";
    /// Local proximity confirmation changed
    pub const PROXIMITY: &str = "PROXIMITY";
    /// Song request accepted
    pub const REQUEST_SUCCESS: &str = "REQUEST_SUCCESS";
    /// Notice posted or cleared
    pub const NOTICE: &str = "NOTICE";
}

// ============================================================================
// Snapshot
// ============================================================================

/// Cached results for one feed
///
/// `last` is the most recent envelope; `last_good` the most recent successful
/// one. A failing call replaces `last` only, so cached data survives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedSlot<T> {
    /// Most recent envelope
    pub last: Option<ResultEnvelope<T>>,
    /// Most recent successful envelope
    pub last_good: Option<ResultEnvelope<T>>,
}

impl<T> Default for FeedSlot<T> {
    fn default() -> Self {
        Self {
            last: None,
            last_good: None,
        }
    }
}

impl<T: Clone> FeedSlot<T> {
    /// Record a new envelope
    pub fn record(&mut self, envelope: ResultEnvelope<T>) {
        if envelope.success {
            self.last_good = Some(envelope.clone());
        }
        self.last = Some(envelope);
    }

    /// Envelope to feed into connectivity derivation
    ///
    /// The latest envelope when it succeeded, else the last good one so its
    /// age keeps growing, else the latest failure.
    #[must_use]
    pub fn effective(&self) -> Option<&ResultEnvelope<T>> {
        match &self.last {
            Some(last) if last.success => Some(last),
            last => self.last_good.as_ref().or(last.as_ref()),
        }
    }
}

impl<T> FeedSlot<T> {
    /// Last known good payload
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        self.last_good.as_ref().and_then(ResultEnvelope::data)
    }

    /// Error from the latest envelope, if it failed
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.last
            .as_ref()
            .filter(|e| !e.success)
            .and_then(|e| e.error.as_deref())
    }

    /// Error code from the latest envelope, if it failed
    #[must_use]
    pub fn error_code(&self) -> Option<&ErrorCode> {
        self.last
            .as_ref()
            .filter(|e| !e.success)
            .and_then(|e| e.error_code.as_ref())
    }

    /// Age of the last good envelope
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_good.as_ref().map(|e| e.age_ms(now_ms))
    }
}

/// A brief, dismissible user-visible notice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Unique id (used to clear exactly this notice)
    pub id: u64,
    /// Error code behind the notice, if any
    pub code: Option<ErrorCode>,
    /// Message key or text
    pub message: String,
    /// When it was posted (Unix timestamp ms)
    pub created_at: u64,
    /// When it auto-clears (Unix timestamp ms)
    pub expires_at: u64,
}

/// One connectivity transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    /// When the transition happened (Unix timestamp ms)
    pub timestamp: u64,
    /// Reason passed to `set_state`
    pub reason: String,
    /// Previous state
    pub from_state: ConnectivityState,
    /// New state
    pub to_state: ConnectivityState,
}

/// The canonical state snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current connectivity state
    pub connectivity: ConnectivityState,
    /// State before the last transition
    pub previous_state: Option<ConnectivityState>,
    /// When the current state was entered (Unix timestamp ms)
    pub state_entered_at: u64,
    /// When the snapshot last changed (Unix timestamp ms)
    pub last_updated: u64,
    /// Show-control feed cache
    pub show: FeedSlot<ShowData>,
    /// Playback-controller feed cache
    pub controller: FeedSlot<ControllerData>,
    /// Speaker-hardware feed cache
    pub speaker_feed: FeedSlot<SpeakerSession>,
    /// Live speaker session
    pub speaker: SpeakerSession,
    /// Consecutive failures per feed
    pub failures: FailureCounters,
    /// Visitor identity and activity
    pub visitor: VisitorSession,
    /// Notice currently shown
    pub notice: Option<Notice>,
    /// Number of poll cycles committed
    pub poll_cycle: u64,
}

impl Snapshot {
    fn initial(visitor: VisitorSession, now_ms: u64) -> Self {
        Self {
            connectivity: ConnectivityState::Loading,
            previous_state: None,
            state_entered_at: now_ms,
            last_updated: now_ms,
            show: FeedSlot::default(),
            controller: FeedSlot::default(),
            speaker_feed: FeedSlot::default(),
            speaker: SpeakerSession::default(),
            failures: FailureCounters::default(),
            visitor,
            notice: None,
            poll_cycle: 0,
        }
    }
}

/// Partial update for [`StateMachine::set_state`]
///
/// Each `Some` field replaces the corresponding snapshot field wholesale.
#[derive(Clone, Debug, Default)]
pub struct StatePatch {
    /// New connectivity state
    pub connectivity: Option<ConnectivityState>,
    /// New show feed cache
    pub show: Option<FeedSlot<ShowData>>,
    /// New controller feed cache
    pub controller: Option<FeedSlot<ControllerData>>,
    /// New speaker feed cache
    pub speaker_feed: Option<FeedSlot<SpeakerSession>>,
    /// New speaker session
    pub speaker: Option<SpeakerSession>,
    /// New failure counters
    pub failures: Option<FailureCounters>,
    /// New visitor session
    pub visitor: Option<VisitorSession>,
    /// Set (`Some(Some)`) or clear (`Some(None)`) the notice
    pub notice: Option<Option<Notice>>,
    /// New poll cycle number
    pub poll_cycle: Option<u64>,
}

impl StatePatch {
    /// Empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the connectivity state
    #[must_use]
    pub fn connectivity(mut self, state: ConnectivityState) -> Self {
        self.connectivity = Some(state);
        self
    }

    /// Replace the show feed cache
    #[must_use]
    pub fn show(mut self, slot: FeedSlot<ShowData>) -> Self {
        self.show = Some(slot);
        self
    }

    /// Replace the controller feed cache
    #[must_use]
    pub fn controller(mut self, slot: FeedSlot<ControllerData>) -> Self {
        self.controller = Some(slot);
        self
    }

    /// Replace the speaker feed cache
    #[must_use]
    pub fn speaker_feed(mut self, slot: FeedSlot<SpeakerSession>) -> Self {
        self.speaker_feed = Some(slot);
        self
    }

    /// Replace the speaker session
    #[must_use]
    pub fn speaker(mut self, session: SpeakerSession) -> Self {
        self.speaker = Some(session);
        self
    }

    /// Replace the failure counters
    #[must_use]
    pub fn failures(mut self, failures: FailureCounters) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Replace the visitor session
    #[must_use]
    pub fn visitor(mut self, visitor: VisitorSession) -> Self {
        self.visitor = Some(visitor);
        self
    }

    /// Set or clear the notice
    #[must_use]
    pub fn notice(mut self, notice: Option<Notice>) -> Self {
        self.notice = Some(notice);
        self
    }

    /// Replace the poll cycle number
    #[must_use]
    pub fn poll_cycle(mut self, cycle: u64) -> Self {
        self.poll_cycle = Some(cycle);
        self
    }

    fn apply_to(self, snapshot: &mut Snapshot) {
        if let Some(v) = self.connectivity {
            snapshot.connectivity = v;
        }
        if let Some(v) = self.show {
            snapshot.show = v;
        }
        if let Some(v) = self.controller {
            snapshot.controller = v;
        }
        if let Some(v) = self.speaker_feed {
            snapshot.speaker_feed = v;
        }
        if let Some(v) = self.speaker {
            snapshot.speaker = v;
        }
        if let Some(v) = self.failures {
            snapshot.failures = v;
        }
        if let Some(v) = self.visitor {
            snapshot.visitor = v;
        }
        if let Some(v) = self.notice {
            snapshot.notice = v;
        }
        if let Some(v) = self.poll_cycle {
            snapshot.poll_cycle = v;
        }
    }
}

// ============================================================================
// Change notification
// ============================================================================

/// Emitted once per `set_state` call
#[derive(Clone, Debug)]
pub struct StateChange {
    /// Reason passed to `set_state`
    pub reason: String,
    /// Connectivity before the update
    pub from: ConnectivityState,
    /// Connectivity after the update
    pub to: ConnectivityState,
    /// When the update was applied (Unix timestamp ms)
    pub timestamp: u64,
    /// Snapshot right after the update
    pub snapshot: Arc<Snapshot>,
}

impl StateChange {
    /// Whether the connectivity state changed
    #[must_use]
    pub fn transitioned(&self) -> bool {
        self.from != self.to
    }
}

/// Registration token returned by [`StateMachine::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Subscriber = Arc<dyn Fn(&StateChange) -> anyhow::Result<()> + Send + Sync>;

thread_local! {
    static FANOUT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct Inner {
    snapshot: Snapshot,
    history: VecDeque<StateHistoryEntry>,
}

// ============================================================================
// StateMachine
// ============================================================================

/// Owner of the canonical snapshot
pub struct StateMachine {
    config: StatusConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    next_notice: AtomicU64,
    events: broadcast::Sender<StateChange>,
}

impl StateMachine {
    /// Create a state machine with a freshly generated visitor
    #[must_use]
    pub fn new(config: StatusConfig, clock: SharedClock) -> Self {
        let visitor = VisitorSession::new(clock.now_ms());
        Self::with_visitor(config, clock, visitor)
    }

    /// Create a state machine seeded with a restored visitor session
    #[must_use]
    pub fn with_visitor(config: StatusConfig, clock: SharedClock, visitor: VisitorSession) -> Self {
        let now = clock.now_ms();
        let (events, _) = broadcast::channel(64);
        tracing::debug!(visitor_id = %visitor.visitor_id, "State machine initialised");
        Self {
            inner: Mutex::new(Inner {
                snapshot: Snapshot::initial(visitor, now),
                history: VecDeque::with_capacity(config.history_capacity),
            }),
            config,
            clock,
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            next_notice: AtomicU64::new(1),
            events,
        }
    }

    /// Configuration this machine was built with
    #[must_use]
    pub fn config(&self) -> &StatusConfig {
        &self.config
    }

    /// Clock used for all timestamps
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Owned copy of the current snapshot
    #[must_use]
    pub fn get_state(&self) -> Snapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Current connectivity state
    #[must_use]
    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.lock().snapshot.connectivity
    }

    /// Transition history, oldest first
    #[must_use]
    pub fn get_state_history(&self) -> Vec<StateHistoryEntry> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Merge `patch` into the snapshot and notify subscribers
    pub fn set_state(&self, patch: StatePatch, reason: &str) -> StateChange {
        self.update_state(reason, |_| patch)
    }

    /// Like [`set_state`](Self::set_state), with the patch built from the
    /// current snapshot under the lock
    ///
    /// `build` must not call back into the machine.
    pub fn update_state<F>(&self, reason: &str, build: F) -> StateChange
    where
        F: FnOnce(&Snapshot) -> StatePatch,
    {
        let now = self.clock.now_ms();
        let change = {
            let mut inner = self.inner.lock();
            let from = inner.snapshot.connectivity;
            let patch = build(&inner.snapshot);
            let sets_notice = patch.notice.is_some();

            patch.apply_to(&mut inner.snapshot);
            inner.snapshot.last_updated = now;
            if !sets_notice && inner.snapshot.notice.as_ref().is_some_and(|n| n.expires_at <= now) {
                inner.snapshot.notice = None;
            }

            let to = inner.snapshot.connectivity;
            if to != from {
                inner.snapshot.previous_state = Some(from);
                inner.snapshot.state_entered_at = now;
                while inner.history.len() >= self.config.history_capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(StateHistoryEntry {
                    timestamp: now,
                    reason: reason.to_string(),
                    from_state: from,
                    to_state: to,
                });
                tracing::info!(from = %from, to = %to, reason = reason, "Connectivity state changed");
            }

            StateChange {
                reason: reason.to_string(),
                from,
                to,
                timestamp: now,
                snapshot: Arc::new(inner.snapshot.clone()),
            }
        };

        self.notify(&change);
        // No receivers is fine
        let _ = self.events.send(change.clone());
        change
    }

    fn notify(&self, change: &StateChange) {
        let depth = FANOUT_DEPTH.with(|d| {
            d.set(d.get() + 1);
            d.get()
        });
        if depth > self.config.reentrancy_warn_depth {
            tracing::warn!(
                depth = depth,
                reason = %change.reason,
                "Deeply nested set_state from subscribers"
            );
        }

        let subscribers: Vec<(SubscriptionId, Subscriber)> = self.subscribers.read().clone();
        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(subscription = %id, error = %e, "State subscriber failed");
                }
                Err(_) => {
                    tracing::error!(subscription = %id, "State subscriber panicked");
                }
            }
        }

        FANOUT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }

    /// Register a synchronous subscriber
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().push((id, Arc::new(callback)));
        tracing::debug!(subscription = %id, "Subscriber registered");
        id
    }

    /// Remove a subscriber; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Receive every [`StateChange`] over a broadcast channel
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Derive connectivity from feed envelopes using this machine's thresholds and clock
    #[must_use]
    pub fn determine_state_from_data(
        &self,
        show: Option<&ResultEnvelope<ShowData>>,
        controller: Option<&ResultEnvelope<ControllerData>>,
        failures: &FailureCounters,
    ) -> ConnectivityState {
        determine_state_from_data(
            show,
            controller,
            failures,
            &self.config.thresholds,
            self.clock.now_ms(),
        )
    }

    /// UI guard flags for the current snapshot
    #[must_use]
    pub fn get_derived_state(&self) -> DerivedState {
        let snapshot = self.get_state();
        derive_view(&snapshot, self.clock.now_ms())
    }

    /// Show a notice that clears itself after the configured ttl
    ///
    /// Returns the notice id. The timer needs a tokio runtime; without one the
    /// notice is dropped lazily by the first `set_state` after it expires.
    pub fn post_notice(
        self: &Arc<Self>,
        code: Option<ErrorCode>,
        message: impl Into<String>,
    ) -> u64 {
        let now = self.clock.now_ms();
        let ttl = self.config.notice_ttl;
        let id = self.next_notice.fetch_add(1, Ordering::SeqCst);
        let notice = Notice {
            id,
            code,
            message: message.into(),
            created_at: now,
            expires_at: now + ttl.as_millis() as u64,
        };
        self.set_state(StatePatch::new().notice(Some(notice)), reason::NOTICE);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let machine = Arc::downgrade(self);
            handle.spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(machine) = machine.upgrade() {
                    machine.clear_notice(id);
                }
            });
        }
        id
    }

    /// Clear the notice if it is still `id`
    pub fn clear_notice(&self, id: u64) -> bool {
        let current = self.inner.lock().snapshot.notice.as_ref().map(|n| n.id);
        if current != Some(id) {
            return false;
        }
        self.set_state(StatePatch::new().notice(None), reason::NOTICE);
        true
    }

    /// Dismiss whatever notice is showing
    pub fn dismiss_notice(&self) {
        if self.inner.lock().snapshot.notice.is_some() {
            self.set_state(StatePatch::new().notice(None), reason::NOTICE);
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateMachine")
            .field("connectivity", &inner.snapshot.connectivity)
            .field("history_len", &inner.history.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::clock::ManualClock;
    use crate::model::ShowStatus;

    const NOW: u64 = 1_700_000_000_000;

    fn machine() -> (Arc<StateMachine>, Arc<ManualClock>) {
        let clock = ManualClock::shared(NOW, 18);
        let machine = Arc::new(StateMachine::new(StatusConfig::default(), clock.clone()));
        (machine, clock)
    }

    #[test]
    fn test_initial_state_is_loading() {
        let (machine, _) = machine();
        let state = machine.get_state();
        assert_eq!(state.connectivity, ConnectivityState::Loading);
        assert!(state.visitor.visitor_id.starts_with("v_"));
        assert!(machine.get_state_history().is_empty());
    }

    #[test]
    fn test_get_state_is_a_copy() {
        let (machine, _) = machine();
        let mut copy = machine.get_state();
        copy.connectivity = ConnectivityState::Ended;
        copy.speaker.enabled = true;
        let fresh = machine.get_state();
        assert_eq!(fresh.connectivity, ConnectivityState::Loading);
        assert!(!fresh.speaker.enabled);
    }

    #[test]
    fn test_speaker_patch_leaves_siblings_untouched() {
        let (machine, _) = machine();
        let mut show = FeedSlot::default();
        show.record(ResultEnvelope::ok(
            ShowData {
                now_playing: Some("Carol of the Bells".into()),
                ..ShowData::default()
            },
            NOW,
        ));
        machine.set_state(
            StatePatch::new()
                .show(show.clone())
                .failures(FailureCounters::new(1, 0)),
            "TEST",
        );

        let speaker = SpeakerSession {
            enabled: true,
            remaining_seconds: 90,
            ..SpeakerSession::default()
        };
        machine.set_state(StatePatch::new().speaker(speaker.clone()), "TEST");

        let state = machine.get_state();
        assert_eq!(state.speaker, speaker);
        assert_eq!(state.show, show);
        assert_eq!(state.failures, FailureCounters::new(1, 0));
    }

    #[test]
    fn test_transition_records_previous_state_and_history() {
        let (machine, clock) = machine();
        clock.advance_ms(500);
        let change = machine.set_state(
            StatePatch::new().connectivity(ConnectivityState::Active),
            reason::POLL_UPDATE,
        );
        assert!(change.transitioned());

        let state = machine.get_state();
        assert_eq!(state.previous_state, Some(ConnectivityState::Loading));
        assert_eq!(state.state_entered_at, NOW + 500);

        let history = machine.get_state_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "POLL_UPDATE");
        assert_eq!(history[0].from_state, ConnectivityState::Loading);
        assert_eq!(history[0].to_state, ConnectivityState::Active);

        // Same state again is not a transition
        let change = machine.set_state(
            StatePatch::new().connectivity(ConnectivityState::Active),
            reason::POLL_UPDATE,
        );
        assert!(!change.transitioned());
        assert_eq!(machine.get_state_history().len(), 1);
    }

    #[test]
    fn test_history_keeps_fifty_most_recent() {
        let (machine, clock) = machine();
        let states = [ConnectivityState::Active, ConnectivityState::Idle];
        for i in 0..60 {
            clock.advance_ms(1);
            machine.set_state(
                StatePatch::new().connectivity(states[i % 2]),
                &format!("T{i}"),
            );
        }

        let history = machine.get_state_history();
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].reason, "T10");
        assert_eq!(history[49].reason, "T59");
        assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_subscribers_called_in_order_and_unsubscribe() {
        let (machine, _) = machine();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = log.clone();
        let first = machine.subscribe(move |_| {
            l1.lock().push(1);
            Ok(())
        });
        let l2 = log.clone();
        machine.subscribe(move |_| {
            l2.lock().push(2);
            Ok(())
        });

        machine.set_state(StatePatch::new(), "A");
        assert!(machine.unsubscribe(first));
        assert!(!machine.unsubscribe(first));
        machine.set_state(StatePatch::new(), "B");

        assert_eq!(*log.lock(), vec![1, 2, 2]);
    }

    #[test]
    fn test_failing_subscribers_do_not_stop_fanout() {
        let (machine, _) = machine();
        let reached = Arc::new(AtomicUsize::new(0));

        machine.subscribe(|_| anyhow::bail!("render failed"));
        machine.subscribe(|_| panic!("subscriber bug"));
        let r = reached.clone();
        machine.subscribe(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        machine.set_state(
            StatePatch::new().connectivity(ConnectivityState::Idle),
            "TEST",
        );

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(machine.connectivity(), ConnectivityState::Idle);
        // Still usable after the panic
        machine.set_state(StatePatch::new(), "AGAIN");
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reentrant_set_state_runs_to_completion() {
        let (machine, _) = machine();
        let weak = Arc::downgrade(&machine);
        let seen = Arc::new(Mutex::new(Vec::new()));

        machine.subscribe(move |change| {
            if change.to == ConnectivityState::Ended {
                if let Some(m) = weak.upgrade() {
                    m.set_state(
                        StatePatch::new().connectivity(ConnectivityState::Idle),
                        "FOLLOW_UP",
                    );
                }
            }
            Ok(())
        });
        let s = seen.clone();
        machine.subscribe(move |change| {
            s.lock().push(change.reason.clone());
            Ok(())
        });

        machine.set_state(
            StatePatch::new().connectivity(ConnectivityState::Ended),
            "END",
        );

        // Nested update completes (and is observed) before the outer fan-out resumes
        assert_eq!(*seen.lock(), vec!["FOLLOW_UP".to_string(), "END".to_string()]);
        assert_eq!(machine.connectivity(), ConnectivityState::Idle);
        assert_eq!(machine.get_state_history().len(), 2);
    }

    #[test]
    fn test_watch_receives_changes() {
        let (machine, _) = machine();
        let mut rx = machine.watch();
        machine.set_state(
            StatePatch::new().connectivity(ConnectivityState::Degraded),
            "WATCHED",
        );
        let change = rx.try_recv().unwrap();
        assert_eq!(change.reason, "WATCHED");
        assert_eq!(change.snapshot.connectivity, ConnectivityState::Degraded);
    }

    #[test]
    fn test_machine_determine_uses_clock() {
        let (machine, clock) = machine();
        let show = ResultEnvelope::ok(
            ShowData {
                show_status: ShowStatus::Ended,
                ..ShowData::default()
            },
            NOW,
        );
        let failures = FailureCounters::default();
        assert_eq!(
            machine.determine_state_from_data(Some(&show), None, &failures),
            ConnectivityState::Ended
        );
        clock.advance_ms(60_001);
        assert_eq!(
            machine.determine_state_from_data(Some(&show), None, &failures),
            ConnectivityState::Degraded
        );
    }

    #[test]
    fn test_feed_slot_keeps_last_good_data() {
        let mut slot: FeedSlot<u32> = FeedSlot::default();
        slot.record(ResultEnvelope::ok(5, 100));
        slot.record(ResultEnvelope::err(ErrorCode::Http, "503", 200));
        assert_eq!(slot.data(), Some(&5));
        assert_eq!(slot.error(), Some("503"));
        assert_eq!(slot.error_code(), Some(&ErrorCode::Http));
        assert_eq!(slot.effective().map(|e| e.timestamp), Some(100));
        assert_eq!(slot.age_ms(1_100), Some(1_000));

        slot.record(ResultEnvelope::ok(6, 300));
        assert_eq!(slot.error(), None);
        assert_eq!(slot.effective().map(|e| e.timestamp), Some(300));
    }

    #[test]
    fn test_derived_state_health_score() {
        let (machine, clock) = machine();
        let derived = machine.get_derived_state();
        // Never-succeeded feeds count as stale: 100 - 15 - 15 - 15
        assert_eq!(derived.health_score, 55);
        assert_eq!(derived.display_status, DisplayStatus::Connecting);

        let mut show = FeedSlot::default();
        show.record(ResultEnvelope::ok(
            ShowData {
                requests_enabled: true,
                viewer_control_enabled: true,
                available_songs: vec![crate::model::Song {
                    song_id: "s1".into(),
                    ..crate::model::Song::default()
                }],
                ..ShowData::default()
            },
            NOW,
        ));
        show.record(ResultEnvelope::err(ErrorCode::Network, "timeout", NOW));
        let mut controller = FeedSlot::default();
        controller.record(ResultEnvelope::ok(ControllerData::default(), NOW));

        machine.set_state(
            StatePatch::new()
                .show(show)
                .controller(controller)
                .failures(FailureCounters::new(1, 0))
                .connectivity(ConnectivityState::Active),
            "TEST",
        );
        clock.advance_ms(31_000);

        let derived = machine.get_derived_state();
        // 100 - 20 (show error) - 15 (show > 30s) - 5 (one failure)
        assert_eq!(derived.health_score, 60);
        assert!(derived.can_make_request);
        assert!(derived.show_surprise_me);
        assert!(derived.show_grid);
        assert_eq!(derived.display_status, DisplayStatus::Live);
    }

    #[test]
    fn test_health_score_floors_at_zero() {
        let (machine, _) = machine();
        machine.set_state(
            StatePatch::new().failures(FailureCounters::new(40, 40)),
            "TEST",
        );
        assert_eq!(machine.get_derived_state().health_score, 0);
    }

    #[test]
    fn test_expired_notice_cleared_lazily() {
        let (machine, clock) = machine();
        let id = machine.post_notice(Some(ErrorCode::Network), "connection trouble");
        assert_eq!(machine.get_state().notice.map(|n| n.id), Some(id));

        clock.advance_ms(6_000);
        machine.set_state(StatePatch::new(), "TICK");
        assert!(machine.get_state().notice.is_none());
        assert!(!machine.clear_notice(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_auto_clears_after_ttl() {
        let (machine, _) = machine();
        let id = machine.post_notice(None, "request failed");

        tokio::time::sleep(Duration::from_millis(5_900)).await;
        assert_eq!(machine.get_state().notice.map(|n| n.id), Some(id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(machine.get_state().notice.is_none());
    }

    #[test]
    fn test_newer_notice_survives_old_timer() {
        let (machine, _) = machine();
        let first = machine.post_notice(None, "first");
        let second = machine.post_notice(None, "second");
        assert!(!machine.clear_notice(first));
        assert_eq!(machine.get_state().notice.map(|n| n.id), Some(second));
        machine.dismiss_notice();
        assert!(machine.get_state().notice.is_none());
    }
}
