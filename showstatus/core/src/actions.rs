//! User Actions
//!
//! [`ActionController`] runs the visitor's actions (song request, surprise
//! me, speaker enable/extend) behind the local gates:
//!
//! - one action in flight at a time; extra attempts come back
//!   [`ActionOutcome::Ignored`] without side effects
//! - per-song cooldown, duplicate and availability checks before any network
//!   call
//!
//! Every failure posts a notice. Successful song requests update the visitor
//! record in the snapshot and persist it.

use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::adapters::ShowControlAdapter;
use crate::envelope::ErrorCode;
use crate::gating::{CooldownTracker, SingleFlight};
use crate::model::{RecentRequest, SongRequest, SpeakerSession, VisitorSession};
use crate::session_store::SessionStore;
use crate::speaker::{SpeakerCoordinator, SpeakerError};
use crate::state::{reason, StateMachine, StatePatch};

/// How an action ended when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome<T> {
    /// The action ran
    Completed(T),
    /// Another action was in flight; nothing happened
    Ignored,
}

impl<T> ActionOutcome<T> {
    /// The completed value, if any
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Ignored => None,
        }
    }

    /// Whether the action was skipped
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored)
    }
}

/// A failed action
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct ActionError {
    /// Error code (local or from the adapter)
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Seconds until a retry can succeed, for cooldowns
    pub retry_after_secs: Option<u64>,
}

impl ActionError {
    /// Create an error
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Local cooldown still running
    #[must_use]
    pub fn cooldown(remaining_secs: u64) -> Self {
        Self {
            code: ErrorCode::Cooldown,
            message: format!("Please wait {remaining_secs}s before requesting this song again"),
            retry_after_secs: Some(remaining_secs),
        }
    }
}

impl From<SpeakerError> for ActionError {
    fn from(err: SpeakerError) -> Self {
        match err {
            SpeakerError::Denied(denial) => {
                Self::new(ErrorCode::from(denial.as_str()), denial.to_string())
            }
            SpeakerError::Rejected { code, message } => Self::new(code, message),
        }
    }
}

/// Result type for actions
pub type ActionResult<T> = Result<ActionOutcome<T>, ActionError>;

/// A song that was queued
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestedSong {
    /// Song id
    pub song_id: String,
    /// Song title
    pub title: String,
    /// Queue position reported by the server
    pub queue_position: Option<u32>,
}

/// Runs user actions against the shared state
pub struct ActionController {
    machine: Arc<StateMachine>,
    show: Arc<dyn ShowControlAdapter>,
    speaker: Arc<SpeakerCoordinator>,
    store: Arc<dyn SessionStore>,
    cooldowns: CooldownTracker,
    flight: SingleFlight,
}

impl ActionController {
    /// Create a controller
    #[must_use]
    pub fn new(
        machine: Arc<StateMachine>,
        show: Arc<dyn ShowControlAdapter>,
        speaker: Arc<SpeakerCoordinator>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let cooldowns = CooldownTracker::new(machine.config().song_cooldown);
        Self {
            machine,
            show,
            speaker,
            store,
            cooldowns,
            flight: SingleFlight::new(),
        }
    }

    /// Whether an action is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.flight.is_busy()
    }

    /// Seconds left on a song's local cooldown
    #[must_use]
    pub fn cooldown_remaining(&self, song_id: &str) -> Option<u64> {
        self.cooldowns
            .remaining_secs(song_id, self.machine.clock().now_ms())
    }

    /// Request a song
    ///
    /// # Errors
    ///
    /// `COOLDOWN`, `DUPLICATE` or `UNAVAILABLE` from the local checks (no
    /// network call), otherwise the adapter's code (`UNKNOWN` when it gave
    /// none).
    pub async fn request_song(&self, song_id: &str) -> ActionResult<RequestedSong> {
        let Some(_flight) = self.flight.try_start() else {
            tracing::debug!(song_id = song_id, "Request ignored; action in flight");
            return Ok(ActionOutcome::Ignored);
        };
        self.submit(song_id).await.map(ActionOutcome::Completed)
    }

    /// Request a random song
    ///
    /// Picks uniformly among songs that are available, visible, not queued
    /// and not cooling down.
    ///
    /// # Errors
    ///
    /// `NO_SONGS` when nothing qualifies (no network call), otherwise as
    /// [`request_song`](Self::request_song).
    pub async fn surprise_me(&self) -> ActionResult<RequestedSong> {
        let Some(_flight) = self.flight.try_start() else {
            return Ok(ActionOutcome::Ignored);
        };

        let now = self.machine.clock().now_ms();
        let state = self.machine.get_state();
        let candidates: Vec<String> = state
            .show
            .data()
            .map(|show| {
                show.requestable_songs(now)
                    .filter(|s| !show.is_queued(&s.song_id))
                    .filter(|s| self.cooldowns.remaining_secs(&s.song_id, now).is_none())
                    .map(|s| s.song_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let Some(song_id) = candidates.choose(&mut rand::thread_rng()).cloned() else {
            return Err(self.fail(ActionError::new(
                ErrorCode::NoSongs,
                "No songs are available right now",
            )));
        };
        tracing::debug!(song_id = %song_id, pool = candidates.len(), "Surprise pick");
        self.submit(&song_id).await.map(ActionOutcome::Completed)
    }

    /// Turn the speaker on
    ///
    /// # Errors
    ///
    /// The guard denial or the adapter's code.
    pub async fn enable_speaker(&self) -> ActionResult<SpeakerSession> {
        let Some(_flight) = self.flight.try_start() else {
            return Ok(ActionOutcome::Ignored);
        };
        match self.speaker.enable_speaker().await {
            Ok(session) => Ok(ActionOutcome::Completed(session)),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Extend the running speaker session
    ///
    /// # Errors
    ///
    /// The guard denial or the adapter's code.
    pub async fn extend_speaker(&self) -> ActionResult<SpeakerSession> {
        let Some(_flight) = self.flight.try_start() else {
            return Ok(ActionOutcome::Ignored);
        };
        match self.speaker.extend_speaker().await {
            Ok(session) => Ok(ActionOutcome::Completed(session)),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    async fn submit(&self, song_id: &str) -> Result<RequestedSong, ActionError> {
        let now = self.machine.clock().now_ms();
        if let Some(remaining) = self.cooldowns.remaining_secs(song_id, now) {
            return Err(self.fail(ActionError::cooldown(remaining)));
        }

        let state = self.machine.get_state();
        let show = state.show.data();
        if show.is_some_and(|s| s.is_queued(song_id)) {
            return Err(self.fail(ActionError::new(
                ErrorCode::Duplicate,
                "That song is already in the queue",
            )));
        }
        let Some(song) = show
            .and_then(|s| s.song(song_id))
            .filter(|s| s.is_requestable(now))
        else {
            return Err(self.fail(ActionError::new(
                ErrorCode::Unavailable,
                "That song can't be requested right now",
            )));
        };
        let title = song.title.clone();

        let request = SongRequest {
            song_id: song_id.to_string(),
            visitor_id: Some(state.visitor.visitor_id.clone()),
        };
        let envelope = self.show.request_song(&request).await;
        if !envelope.success {
            let code = envelope.error_code.unwrap_or(ErrorCode::Unknown);
            let message = envelope
                .error
                .unwrap_or_else(|| "Request failed".to_string());
            return Err(self.fail(ActionError::new(code, message)));
        }

        let completed_at = self.machine.clock().now_ms();
        let queue_position = envelope.data.and_then(|r| r.queue_position);
        self.cooldowns.prune(completed_at);
        self.cooldowns.record(song_id, completed_at);

        let recent = RecentRequest {
            song_id: song_id.to_string(),
            title: title.clone(),
            timestamp: completed_at,
            queue_position,
        };
        let change = self
            .machine
            .update_state(reason::REQUEST_SUCCESS, |snapshot| {
                StatePatch::new().visitor(VisitorSession {
                    interaction_count: snapshot.visitor.interaction_count.saturating_add(1),
                    recent_request: Some(recent),
                    ..snapshot.visitor.clone()
                })
            });
        if let Err(e) = self.store.save(&change.snapshot.visitor).await {
            tracing::warn!(error = %e, "Could not persist visitor session");
        }

        tracing::info!(song_id = song_id, queue_position = ?queue_position, "Song requested");
        Ok(RequestedSong {
            song_id: song_id.to_string(),
            title,
            queue_position,
        })
    }

    fn fail(&self, err: ActionError) -> ActionError {
        tracing::info!(code = %err.code, message = %err.message, "Action failed");
        self.machine.post_notice(Some(err.code.clone()), err.message.clone());
        err
    }
}

impl fmt::Debug for ActionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionController")
            .field("show", &self.show.name())
            .field("busy", &self.flight.is_busy())
            .field("cooldowns", &self.cooldowns.len())
            .finish()
    }
}
