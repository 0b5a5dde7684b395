//! Scripted Adapters
//!
//! In-memory feed adapters that replay scripted outcomes. Each call pops the
//! next queued outcome, or falls back to a standing one, and stamps the
//! envelope with the shared clock. Call counters make "no network call was
//! issued" observable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PlaybackAdapter, ShowControlAdapter, SpeakerAdapter};
use crate::clock::SharedClock;
use crate::envelope::{ErrorCode, ResultEnvelope};
use crate::model::{
    ControllerData, RequestReceipt, ShowData, SongRequest, SpeakerCommand, SpeakerSession,
};

/// What a scripted call should produce
pub type Outcome<T> = Result<T, (ErrorCode, String)>;

/// Failure outcome helper
pub fn failure<T>(code: ErrorCode, message: impl Into<String>) -> Outcome<T> {
    Err((code, message.into()))
}

struct Script<T> {
    queued: VecDeque<Outcome<T>>,
    standing: Outcome<T>,
    calls: usize,
    delay: Option<Duration>,
}

impl<T: Clone> Script<T> {
    fn new(standing: Outcome<T>) -> Self {
        Self {
            queued: VecDeque::new(),
            standing,
            calls: 0,
            delay: None,
        }
    }

    fn next(&mut self) -> (Outcome<T>, Option<Duration>) {
        self.calls += 1;
        let outcome = self
            .queued
            .pop_front()
            .unwrap_or_else(|| self.standing.clone());
        (outcome, self.delay)
    }
}

async fn play<T: Clone>(script: &Mutex<Script<T>>, clock: &SharedClock) -> ResultEnvelope<T> {
    let (outcome, delay) = script.lock().next();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let now = clock.now_ms();
    match outcome {
        Ok(data) => ResultEnvelope::ok(data, now),
        Err((code, message)) => ResultEnvelope::err(code, message, now),
    }
}

// ============================================================================
// Show-control
// ============================================================================

/// Scripted show-control service
pub struct ScriptedShowAdapter {
    clock: SharedClock,
    fetches: Mutex<Script<ShowData>>,
    requests: Mutex<Script<RequestReceipt>>,
    last_request: Mutex<Option<SongRequest>>,
}

impl ScriptedShowAdapter {
    /// Adapter that answers with `show` until told otherwise
    #[must_use]
    pub fn new(clock: SharedClock, show: ShowData) -> Self {
        Self {
            clock,
            fetches: Mutex::new(Script::new(Ok(show))),
            requests: Mutex::new(Script::new(Ok(RequestReceipt {
                queue_position: Some(1),
            }))),
            last_request: Mutex::new(None),
        }
    }

    /// Replace the standing fetch outcome
    pub fn set_show(&self, outcome: Outcome<ShowData>) {
        self.fetches.lock().standing = outcome;
    }

    /// Queue a one-shot fetch outcome
    pub fn push_show(&self, outcome: Outcome<ShowData>) {
        self.fetches.lock().queued.push_back(outcome);
    }

    /// Replace the standing request outcome
    pub fn set_request_outcome(&self, outcome: Outcome<RequestReceipt>) {
        self.requests.lock().standing = outcome;
    }

    /// Make song requests take `delay` to answer
    pub fn set_request_delay(&self, delay: Duration) {
        self.requests.lock().delay = Some(delay);
    }

    /// Number of fetches issued
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().calls
    }

    /// Number of song requests issued
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().calls
    }

    /// Most recent song request body
    #[must_use]
    pub fn last_request(&self) -> Option<SongRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl ShowControlAdapter for ScriptedShowAdapter {
    fn name(&self) -> &str {
        "scripted-show"
    }

    async fn fetch_show(&self) -> ResultEnvelope<ShowData> {
        play(&self.fetches, &self.clock).await
    }

    async fn request_song(&self, request: &SongRequest) -> ResultEnvelope<RequestReceipt> {
        *self.last_request.lock() = Some(request.clone());
        play(&self.requests, &self.clock).await
    }
}

// ============================================================================
// Playback controller
// ============================================================================

/// Scripted playback controller
pub struct ScriptedPlaybackAdapter {
    clock: SharedClock,
    fetches: Mutex<Script<ControllerData>>,
}

impl ScriptedPlaybackAdapter {
    /// Adapter that answers with `data` until told otherwise
    #[must_use]
    pub fn new(clock: SharedClock, data: ControllerData) -> Self {
        Self {
            clock,
            fetches: Mutex::new(Script::new(Ok(data))),
        }
    }

    /// Replace the standing fetch outcome
    pub fn set_playback(&self, outcome: Outcome<ControllerData>) {
        self.fetches.lock().standing = outcome;
    }

    /// Queue a one-shot fetch outcome
    pub fn push_playback(&self, outcome: Outcome<ControllerData>) {
        self.fetches.lock().queued.push_back(outcome);
    }

    /// Make fetches take `delay` to answer
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetches.lock().delay = Some(delay);
    }

    /// Number of fetches issued
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().calls
    }
}

#[async_trait]
impl PlaybackAdapter for ScriptedPlaybackAdapter {
    fn name(&self) -> &str {
        "scripted-controller"
    }

    async fn fetch_playback(&self) -> ResultEnvelope<ControllerData> {
        play(&self.fetches, &self.clock).await
    }
}

// ============================================================================
// Speaker
// ============================================================================

/// Scripted speaker hardware
pub struct ScriptedSpeakerAdapter {
    clock: SharedClock,
    fetches: Mutex<Script<SpeakerSession>>,
    commands: Mutex<Script<SpeakerSession>>,
    last_command: Mutex<Option<SpeakerCommand>>,
    command_calls: AtomicUsize,
}

impl ScriptedSpeakerAdapter {
    /// Adapter that reports `session` for both fetches and commands
    #[must_use]
    pub fn new(clock: SharedClock, session: SpeakerSession) -> Self {
        Self {
            clock,
            fetches: Mutex::new(Script::new(Ok(session.clone()))),
            commands: Mutex::new(Script::new(Ok(session))),
            last_command: Mutex::new(None),
            command_calls: AtomicUsize::new(0),
        }
    }

    /// Replace the standing fetch outcome
    pub fn set_speaker(&self, outcome: Outcome<SpeakerSession>) {
        self.fetches.lock().standing = outcome;
    }

    /// Replace the standing command outcome
    pub fn set_command_outcome(&self, outcome: Outcome<SpeakerSession>) {
        self.commands.lock().standing = outcome;
    }

    /// Make commands take `delay` to answer
    pub fn set_command_delay(&self, delay: Duration) {
        self.commands.lock().delay = Some(delay);
    }

    /// Number of fetches issued
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().calls
    }

    /// Number of commands issued
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.command_calls.load(Ordering::SeqCst)
    }

    /// Most recent command body
    #[must_use]
    pub fn last_command(&self) -> Option<SpeakerCommand> {
        self.last_command.lock().clone()
    }
}

#[async_trait]
impl SpeakerAdapter for ScriptedSpeakerAdapter {
    fn name(&self) -> &str {
        "scripted-speaker"
    }

    async fn fetch_speaker(&self) -> ResultEnvelope<SpeakerSession> {
        play(&self.fetches, &self.clock).await
    }

    async fn send_command(&self, command: &SpeakerCommand) -> ResultEnvelope<SpeakerSession> {
        self.command_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_command.lock() = Some(command.clone());
        play(&self.commands, &self.clock).await
    }
}
