//! Connectivity Derivation
//!
//! Pure functions that turn feed envelopes and failure counters into a single
//! [`ConnectivityState`], and a snapshot into the guard flags a presentation
//! layer renders from. Nothing here reads the clock; callers pass `now_ms`.
//!
//! # Decision Order
//!
//! ```text
//! both counters >= offline_failures        -> Offline
//! either counter >= degraded_failures
//!   or either envelope older than stale    -> Degraded
//! show feed says "ended"                   -> Ended
//! both feeds succeeded
//!   viewer control on and playing/idle     -> Active
//!   otherwise                              -> Idle
//! anything else                            -> Loading
//! ```
//!
//! Failure and staleness run first so a feed that still answers but has gone
//! stale cannot look healthy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::ResultEnvelope;
use crate::model::{ControllerData, ShowData, ShowStatus};

use super::Snapshot;

/// Overall reachability/liveness of the show
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// No verdict yet
    #[default]
    Loading,
    /// Show running and accepting viewers
    Active,
    /// Feeds failing or stale
    Degraded,
    /// Both feeds down
    Offline,
    /// Show over for the night
    Ended,
    /// Feeds healthy, viewer control unavailable
    Idle,
}

impl ConnectivityState {
    /// Wire/log label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "LOADING",
            Self::Active => "ACTIVE",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
            Self::Ended => "ENDED",
            Self::Idle => "IDLE",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream data source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    /// Show-control / request queue service
    Show,
    /// Lighting-sequence playback controller
    Controller,
    /// Speaker hardware
    Speaker,
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Show => "show",
            Self::Controller => "controller",
            Self::Speaker => "speaker",
        })
    }
}

/// Consecutive failure counts per feed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounters {
    /// Show-control feed
    pub show: u32,
    /// Playback-controller feed
    pub controller: u32,
    /// Speaker-hardware feed
    pub speaker: u32,
}

impl FailureCounters {
    /// Counter pair for the two connectivity feeds
    #[must_use]
    pub fn new(show: u32, controller: u32) -> Self {
        Self {
            show,
            controller,
            speaker: 0,
        }
    }

    /// Reset on success, increment on failure
    pub fn record(&mut self, feed: Feed, success: bool) {
        let counter = self.get_mut(feed);
        if success {
            *counter = 0;
        } else {
            *counter = counter.saturating_add(1);
        }
    }

    /// Current count for a feed
    #[must_use]
    pub fn get(&self, feed: Feed) -> u32 {
        match feed {
            Feed::Show => self.show,
            Feed::Controller => self.controller,
            Feed::Speaker => self.speaker,
        }
    }

    fn get_mut(&mut self, feed: Feed) -> &mut u32 {
        match feed {
            Feed::Show => &mut self.show,
            Feed::Controller => &mut self.controller,
            Feed::Speaker => &mut self.speaker,
        }
    }
}

/// Thresholds for connectivity derivation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateThresholds {
    /// Both feeds at or above this count -> Offline
    pub offline_failures: u32,
    /// Either feed at or above this count -> Degraded
    pub degraded_failures: u32,
    /// Envelope age (ms) beyond which a feed is stale
    pub stale_after_ms: u64,
}

impl Default for StateThresholds {
    fn default() -> Self {
        Self {
            offline_failures: 3,
            degraded_failures: 2,
            stale_after_ms: 60_000,
        }
    }
}

/// Derive the connectivity state from the two feeds
///
/// Pure: the result depends only on the arguments.
#[must_use]
pub fn determine_state_from_data(
    show: Option<&ResultEnvelope<ShowData>>,
    controller: Option<&ResultEnvelope<ControllerData>>,
    failures: &FailureCounters,
    thresholds: &StateThresholds,
    now_ms: u64,
) -> ConnectivityState {
    if failures.show >= thresholds.offline_failures
        && failures.controller >= thresholds.offline_failures
    {
        return ConnectivityState::Offline;
    }

    let stale = |age: Option<u64>| age.is_some_and(|a| a > thresholds.stale_after_ms);
    if failures.show >= thresholds.degraded_failures
        || failures.controller >= thresholds.degraded_failures
        || stale(show.map(|e| e.age_ms(now_ms)))
        || stale(controller.map(|e| e.age_ms(now_ms)))
    {
        return ConnectivityState::Degraded;
    }

    let show_data = show.and_then(ResultEnvelope::data);
    if show_data.is_some_and(|d| d.show_status == ShowStatus::Ended) {
        return ConnectivityState::Ended;
    }

    let controller_data = controller.and_then(ResultEnvelope::data);
    if let (Some(show_data), Some(controller_data)) = (show_data, controller_data) {
        if show_data.viewer_control_enabled && controller_data.mode.is_active_ready() {
            return ConnectivityState::Active;
        }
        return ConnectivityState::Idle;
    }

    ConnectivityState::Loading
}

/// Status label key for the presentation layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    /// Waiting for the first verdict
    Connecting,
    /// Show live and interactive
    Live,
    /// Working from partial or stale data
    LimitedConnectivity,
    /// Nothing reachable
    Offline,
    /// Show over
    ShowEnded,
    /// Show reachable, nothing to interact with
    Standby,
}

impl From<ConnectivityState> for DisplayStatus {
    fn from(state: ConnectivityState) -> Self {
        match state {
            ConnectivityState::Loading => Self::Connecting,
            ConnectivityState::Active => Self::Live,
            ConnectivityState::Degraded => Self::LimitedConnectivity,
            ConnectivityState::Offline => Self::Offline,
            ConnectivityState::Ended => Self::ShowEnded,
            ConnectivityState::Idle => Self::Standby,
        }
    }
}

/// UI guard flags projected from a snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedState {
    /// Show the per-song request buttons
    pub show_request_button: bool,
    /// Show the surprise-me button
    pub show_surprise_me: bool,
    /// Show the speaker control
    pub show_speaker_button: bool,
    /// Show the request queue
    pub show_queue: bool,
    /// Show the song grid
    pub show_grid: bool,
    /// Requests may be submitted
    pub can_make_request: bool,
    /// Status label key
    pub display_status: DisplayStatus,
    /// 0-100 connection health
    pub health_score: u8,
}

/// Project a snapshot into UI guard flags
#[must_use]
pub fn derive_view(snapshot: &Snapshot, now_ms: u64) -> DerivedState {
    let state = snapshot.connectivity;
    let show = snapshot.show.data();
    let reachable = matches!(
        state,
        ConnectivityState::Active | ConnectivityState::Degraded | ConnectivityState::Idle
    );

    let can_make_request =
        state == ConnectivityState::Active && show.is_some_and(|s| s.requests_enabled);
    let has_requestable = show.is_some_and(|s| s.requestable_songs(now_ms).next().is_some());

    DerivedState {
        show_request_button: can_make_request,
        show_surprise_me: can_make_request && has_requestable,
        show_speaker_button: reachable,
        show_queue: reachable && show.is_some(),
        show_grid: reachable && show.is_some_and(|s| !s.available_songs.is_empty()),
        can_make_request,
        display_status: DisplayStatus::from(state),
        health_score: health_score(snapshot, now_ms),
    }
}

/// 0-100 health score for the two connectivity feeds
///
/// Starts at 100; -20 per feed currently reporting an error; -15 when the show
/// feed is older than 30s and another -15 past 60s; -15 when the controller
/// feed is older than 60s; -5 per consecutive failure per feed.
#[must_use]
pub fn health_score(snapshot: &Snapshot, now_ms: u64) -> u8 {
    let mut score: i64 = 100;

    if snapshot.show.error().is_some() {
        score -= 20;
    }
    if snapshot.controller.error().is_some() {
        score -= 20;
    }

    let show_age = snapshot.show.age_ms(now_ms).unwrap_or(u64::MAX);
    if show_age > 30_000 {
        score -= 15;
    }
    if show_age > 60_000 {
        score -= 15;
    }
    if snapshot.controller.age_ms(now_ms).unwrap_or(u64::MAX) > 60_000 {
        score -= 15;
    }

    score -= 5 * i64::from(snapshot.failures.show);
    score -= 5 * i64::from(snapshot.failures.controller);

    score.clamp(0, 100) as u8
}
