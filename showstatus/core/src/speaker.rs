//! Speaker Coordinator
//!
//! Gates the physical speaker output. The hardware service is the authority
//! on the session; this module only derives what to show, decides whether a
//! command may be sent, and runs the local one-second countdown between
//! polls.
//!
//! # Display Modes
//!
//! ```text
//! OFF                                  ON
//! curfew active      -> Curfew         graceful shutoff  -> Protection
//! tier >= 4          -> GeoBlocked     0 < left <= 30    -> Extension
//! controller stopped -> FppOffline     otherwise         -> Active
//! otherwise          -> Off
//! ```
//!
//! # Countdown
//!
//! One tokio task ticks every `countdown_tick` while the speaker is enabled
//! with time left. The coordinator subscribes to the state machine and
//! re-evaluates after every commit, so the task starts and stops from
//! observed state alone. Under a graceful shutoff the tick leaves the
//! number alone; the controller's remaining seconds are shown instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::adapters::SpeakerAdapter;
use crate::envelope::ErrorCode;
use crate::model::{ControllerData, SpeakerCommand, SpeakerSession};
use crate::state::{reason, StateChange, StateMachine, StatePatch, SubscriptionId};

// ============================================================================
// Display derivation
// ============================================================================

/// What the speaker control looks like right now
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerDisplayMode {
    /// Off and available
    Off,
    /// Off because of the noise curfew
    Curfew,
    /// Off because the visitor is too far away
    GeoBlocked,
    /// Off because the controller is not playing
    FppOffline,
    /// On, but the controller is forcing a shutdown
    Protection,
    /// On and inside the extension window
    Extension,
    /// On
    Active,
}

/// Which button the control offers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerAction {
    /// Turn the speaker on
    Enable,
    /// Add time to the running session
    Extend,
}

/// Where a displayed countdown comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownSource {
    /// The local session countdown
    Session,
    /// The playback controller's remaining time
    Controller,
}

/// A countdown to render
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    /// Seconds left
    pub seconds: u32,
    /// Which clock it follows
    pub source: CountdownSource,
}

/// Projection of the speaker session for the presentation layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerDisplay {
    /// Display mode
    pub mode: SpeakerDisplayMode,
    /// Button offered, if any
    pub action: Option<SpeakerAction>,
    /// Whether the button can be pressed
    pub button_enabled: bool,
    /// Point the visitor at FM / stream instead
    pub emphasize_alternatives: bool,
    /// Countdown to show, if any
    pub countdown: Option<Countdown>,
    /// Show the "I'm nearby" button
    pub show_proximity_confirm: bool,
}

/// Whether the controller is playing, falling back to the hardware's view
fn controller_playing(session: &SpeakerSession, controller: Option<&ControllerData>) -> bool {
    controller.map_or(session.fpp_playing, |c| c.mode.is_playing())
}

fn in_extension_window(remaining: u32, window: u32) -> bool {
    remaining > 0 && remaining <= window
}

/// Derive the speaker display
///
/// Pure: depends only on the session, the latest controller data and the
/// local hour.
#[must_use]
pub fn derive_display(
    session: &SpeakerSession,
    controller: Option<&ControllerData>,
    hour: u32,
    extension_window_secs: u32,
) -> SpeakerDisplay {
    let show_proximity_confirm = session.needs_proximity_confirmation();

    if !session.enabled {
        let (mode, emphasize) = if session.curfew_active(hour) {
            (SpeakerDisplayMode::Curfew, true)
        } else if session.proximity_tier >= 4 {
            (SpeakerDisplayMode::GeoBlocked, true)
        } else if !controller_playing(session, controller) {
            (SpeakerDisplayMode::FppOffline, false)
        } else {
            (SpeakerDisplayMode::Off, false)
        };
        return SpeakerDisplay {
            mode,
            action: Some(SpeakerAction::Enable),
            button_enabled: mode == SpeakerDisplayMode::Off,
            emphasize_alternatives: emphasize,
            countdown: None,
            show_proximity_confirm,
        };
    }

    if session.graceful_shutoff {
        let seconds = controller.map_or(session.remaining_seconds, |c| c.seconds_remaining);
        return SpeakerDisplay {
            mode: SpeakerDisplayMode::Protection,
            action: None,
            button_enabled: false,
            emphasize_alternatives: false,
            countdown: Some(Countdown {
                seconds,
                source: CountdownSource::Controller,
            }),
            show_proximity_confirm,
        };
    }

    let countdown = Some(Countdown {
        seconds: session.remaining_seconds,
        source: CountdownSource::Session,
    });
    if in_extension_window(session.remaining_seconds, extension_window_secs) {
        return SpeakerDisplay {
            mode: SpeakerDisplayMode::Extension,
            action: Some(SpeakerAction::Extend),
            button_enabled: !session.max_session_reached,
            emphasize_alternatives: false,
            countdown,
            show_proximity_confirm,
        };
    }

    SpeakerDisplay {
        mode: SpeakerDisplayMode::Active,
        action: None,
        button_enabled: false,
        emphasize_alternatives: false,
        countdown,
        show_proximity_confirm,
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Why a speaker command is not allowed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeakerDenial {
    /// Noise curfew in effect
    #[error("speaker is unavailable during the noise curfew")]
    Curfew,
    /// Speaker is already on
    #[error("speaker is already on")]
    AlreadyOn,
    /// Controller is not playing
    #[error("show is not playing right now")]
    FppOffline,
    /// Far-away tier without confirmation
    #[error("confirm you are near the show first")]
    GeoBlocked,
    /// Nothing to extend
    #[error("speaker is not on")]
    NotOn,
    /// Controller is forcing a shutdown
    #[error("speaker is shutting down")]
    ProtectionMode,
    /// Too early or too late to extend
    #[error("extension is only available near the end of a session")]
    NotInExtensionWindow,
    /// Per-session cap reached
    #[error("session limit reached")]
    SessionCap,
}

impl SpeakerDenial {
    /// Stable code for logs and notices
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Curfew => "CURFEW",
            Self::AlreadyOn => "ALREADY_ON",
            Self::FppOffline => "FPP_OFFLINE",
            Self::GeoBlocked => "GEO_BLOCKED",
            Self::NotOn => "NOT_ON",
            Self::ProtectionMode => "PROTECTION_MODE",
            Self::NotInExtensionWindow => "NOT_IN_EXTENSION_WINDOW",
            Self::SessionCap => "SESSION_CAP",
        }
    }
}

/// Whether the speaker may be turned on
///
/// # Errors
///
/// The first failing rule, checked as curfew, already on, controller
/// offline, then unconfirmed far-away tier.
pub fn check_can_use(
    session: &SpeakerSession,
    controller: Option<&ControllerData>,
    hour: u32,
) -> Result<(), SpeakerDenial> {
    if session.curfew_active(hour) {
        return Err(SpeakerDenial::Curfew);
    }
    if session.enabled {
        return Err(SpeakerDenial::AlreadyOn);
    }
    if !controller_playing(session, controller) {
        return Err(SpeakerDenial::FppOffline);
    }
    if session.needs_proximity_confirmation() {
        return Err(SpeakerDenial::GeoBlocked);
    }
    Ok(())
}

/// Whether the running session may be extended
///
/// # Errors
///
/// The first failing rule, checked as not on, protection mode, outside the
/// window, then session cap.
pub fn check_can_extend(
    session: &SpeakerSession,
    extension_window_secs: u32,
) -> Result<(), SpeakerDenial> {
    if !session.enabled {
        return Err(SpeakerDenial::NotOn);
    }
    if session.graceful_shutoff {
        return Err(SpeakerDenial::ProtectionMode);
    }
    if !in_extension_window(session.remaining_seconds, extension_window_secs) {
        return Err(SpeakerDenial::NotInExtensionWindow);
    }
    if session.max_session_reached {
        return Err(SpeakerDenial::SessionCap);
    }
    Ok(())
}

// ============================================================================
// Coordinator
// ============================================================================

/// Failure of an enable/extend command
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SpeakerError {
    /// Rejected locally; no command was sent
    #[error("{0}")]
    Denied(SpeakerDenial),

    /// The hardware service refused or failed
    #[error("{message} ({code})")]
    Rejected {
        /// Code from the adapter, or `SPEAKER_FAILED`
        code: ErrorCode,
        /// Adapter message
        message: String,
    },
}

impl SpeakerError {
    /// Error code for notices
    #[must_use]
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Denied(_) => None,
            Self::Rejected { code, .. } => Some(code),
        }
    }
}

struct CountdownTask {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CountdownTask {
    fn is_live(&self) -> bool {
        !self.stop.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

/// Coordinates speaker commands and the local countdown
pub struct SpeakerCoordinator {
    machine: Arc<StateMachine>,
    adapter: Arc<dyn SpeakerAdapter>,
    countdown: Mutex<Option<CountdownTask>>,
    subscription: SubscriptionId,
    weak_self: Weak<SpeakerCoordinator>,
}

impl SpeakerCoordinator {
    /// Create a coordinator and subscribe it to `machine`
    pub fn new(machine: Arc<StateMachine>, adapter: Arc<dyn SpeakerAdapter>) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|weak: &Weak<Self>| {
            let observer = weak.clone();
            // Nested commits can deliver changes out of order, so always
            // decide from the live snapshot rather than the delivered one.
            let subscription = machine.subscribe(move |_: &StateChange| {
                if let Some(coordinator) = observer.upgrade() {
                    coordinator.sync_countdown();
                }
                Ok(())
            });
            Self {
                machine,
                adapter,
                countdown: Mutex::new(None),
                subscription,
                weak_self: weak.clone(),
            }
        });
        coordinator.sync_countdown();
        coordinator
    }

    fn hour(&self) -> u32 {
        self.machine.clock().local_hour()
    }

    fn window(&self) -> u32 {
        self.machine.config().extension_window_secs
    }

    /// Current speaker display
    #[must_use]
    pub fn display(&self) -> SpeakerDisplay {
        let state = self.machine.get_state();
        derive_display(
            &state.speaker,
            state.controller.data(),
            self.hour(),
            self.window(),
        )
    }

    /// Whether the speaker may be turned on
    ///
    /// # Errors
    ///
    /// See [`check_can_use`].
    pub fn can_use_speaker(&self) -> Result<(), SpeakerDenial> {
        let state = self.machine.get_state();
        check_can_use(&state.speaker, state.controller.data(), self.hour())
    }

    /// Whether the running session may be extended
    ///
    /// # Errors
    ///
    /// See [`check_can_extend`].
    pub fn can_extend_speaker(&self) -> Result<(), SpeakerDenial> {
        check_can_extend(&self.machine.get_state().speaker, self.window())
    }

    /// Far-away tier that has not been confirmed
    #[must_use]
    pub fn needs_proximity_confirmation(&self) -> bool {
        self.machine.get_state().speaker.needs_proximity_confirmation()
    }

    /// Record that the visitor confirmed they are nearby
    pub fn confirm_proximity(&self) {
        self.set_proximity(true);
    }

    fn set_proximity(&self, confirmed: bool) {
        self.machine.update_state(reason::PROXIMITY, |snapshot| {
            StatePatch::new().speaker(SpeakerSession {
                proximity_confirmed: confirmed,
                ..snapshot.speaker.clone()
            })
        });
    }

    /// Replace the speaker session wholesale
    pub fn apply_speaker_session(&self, session: SpeakerSession, reason: &str) -> StateChange {
        tracing::debug!(
            enabled = session.enabled,
            remaining = session.remaining_seconds,
            graceful_shutoff = session.graceful_shutoff,
            reason = reason,
            "Speaker session replaced"
        );
        self.machine
            .set_state(StatePatch::new().speaker(session), reason)
    }

    /// Turn the speaker on
    ///
    /// # Errors
    ///
    /// [`SpeakerError::Denied`] when a guard fails (nothing is sent), or
    /// [`SpeakerError::Rejected`] with the adapter's code.
    pub async fn enable_speaker(&self) -> Result<SpeakerSession, SpeakerError> {
        self.can_use_speaker().map_err(SpeakerError::Denied)?;
        self.send(false, reason::SPEAKER_ENABLED).await
    }

    /// Extend the running session
    ///
    /// # Errors
    ///
    /// As [`enable_speaker`](Self::enable_speaker).
    pub async fn extend_speaker(&self) -> Result<SpeakerSession, SpeakerError> {
        self.can_extend_speaker().map_err(SpeakerError::Denied)?;
        self.send(true, reason::SPEAKER_EXTENDED).await
    }

    async fn send(
        &self,
        extension: bool,
        commit_reason: &str,
    ) -> Result<SpeakerSession, SpeakerError> {
        let confirmed = self.machine.get_state().speaker.proximity_confirmed;
        let command = SpeakerCommand::viewer(extension, confirmed);
        let envelope = self.adapter.send_command(&command).await;

        if envelope.success {
            let session = envelope.data.unwrap_or_default();
            self.apply_speaker_session(session.clone(), commit_reason);
            return Ok(session);
        }

        let code = envelope.error_code.unwrap_or(ErrorCode::SpeakerFailed);
        let message = envelope
            .error
            .unwrap_or_else(|| "speaker command failed".to_string());
        tracing::warn!(
            adapter = self.adapter.name(),
            extension = extension,
            code = %code,
            "Speaker command rejected"
        );
        if code == ErrorCode::ProximityRequired {
            self.set_proximity(false);
        }
        Err(SpeakerError::Rejected { code, message })
    }

    // ------------------------------------------------------------------------
    // Countdown
    // ------------------------------------------------------------------------

    /// Advance the countdown by one second
    ///
    /// Returns whether the countdown should keep running.
    pub fn tick(&self) -> bool {
        let current = self.machine.get_state().speaker;
        if !current.enabled || current.remaining_seconds == 0 {
            return false;
        }
        if current.graceful_shutoff {
            return true;
        }

        let change = self.machine.update_state(reason::SPEAKER_TICK, |snapshot| {
            let speaker = &snapshot.speaker;
            if !speaker.enabled || speaker.graceful_shutoff || speaker.remaining_seconds == 0 {
                return StatePatch::new();
            }
            StatePatch::new().speaker(SpeakerSession {
                remaining_seconds: speaker.remaining_seconds - 1,
                ..speaker.clone()
            })
        });
        let speaker = &change.snapshot.speaker;
        speaker.enabled && speaker.remaining_seconds > 0
    }

    /// Whether the countdown task is running
    #[must_use]
    pub fn is_countdown_running(&self) -> bool {
        self.countdown.lock().as_ref().is_some_and(CountdownTask::is_live)
    }

    /// Start or stop the countdown to match the current speaker session
    pub fn sync_countdown(&self) {
        let speaker = self.machine.get_state().speaker;
        let should_run = speaker.enabled && speaker.remaining_seconds > 0;
        let mut slot = self.countdown.lock();
        let running = slot.as_ref().is_some_and(CountdownTask::is_live);

        match (should_run, running) {
            (true, false) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    tracing::debug!("No runtime; countdown not started");
                    return;
                };
                let stop = Arc::new(AtomicBool::new(false));
                let handle = runtime.spawn(run_countdown(
                    self.weak_self.clone(),
                    stop.clone(),
                    self.machine.config().countdown_tick,
                ));
                tracing::debug!(
                    remaining = speaker.remaining_seconds,
                    "Speaker countdown started"
                );
                *slot = Some(CountdownTask { stop, handle });
            }
            (false, true) => {
                if let Some(task) = slot.take() {
                    task.cancel();
                }
                tracing::debug!("Speaker countdown stopped");
            }
            _ => {}
        }
    }
}

async fn run_countdown(
    coordinator: Weak<SpeakerCoordinator>,
    stop: Arc<AtomicBool>,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        if !coordinator.tick() {
            stop.store(true, Ordering::SeqCst);
            break;
        }
    }
}

impl Drop for SpeakerCoordinator {
    fn drop(&mut self) {
        self.machine.unsubscribe(self.subscription);
        if let Some(task) = self.countdown.get_mut().take() {
            task.cancel();
        }
    }
}

impl fmt::Debug for SpeakerCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeakerCoordinator")
            .field("adapter", &self.adapter.name())
            .field("subscription", &self.subscription)
            .field("countdown_running", &self.is_countdown_running())
            .finish()
    }
}
