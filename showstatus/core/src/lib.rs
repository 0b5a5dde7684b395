//! Show Status Core - Connectivity and Speaker Coordination for a Light Show
//!
//! This crate reconciles the feeds of a holiday light show into one status
//! the visitor-facing surface can render: a show-control / request-queue
//! service, a lighting playback controller, and a speaker with timed,
//! rule-gated sessions. It has no UI dependencies; a presentation layer
//! renders from [`DerivedState`] and [`SpeakerDisplay`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Upstream feeds                            │
//! │   show-control          playback controller        speaker        │
//! └──────┬───────────────────────┬──────────────────────────┬────────┘
//!        │ ShowControlAdapter    │ PlaybackAdapter          │ SpeakerAdapter
//!        │   (ResultEnvelope)    │                          │
//! ┌──────┴───────────────────────┴──────────────────────────┴────────┐
//! │  Poller ── fetch-all every 15 s ── one POLL_UPDATE per cycle      │
//! │     │                                                     │       │
//! │     ▼                                                     ▼       │
//! │  ┌─────────────────────────────┐        ┌──────────────────────┐  │
//! │  │        StateMachine         │◄───────│  SpeakerCoordinator  │  │
//! │  │  snapshot · history · subs  │───────►│  guards · countdown  │  │
//! │  └──────────────┬──────────────┘        └──────────────────────┘  │
//! │                 │          ▲                        ▲             │
//! │                 │          └──── ActionController ──┘             │
//! │                 │                cooldown · single-flight         │
//! └─────────────────┼─────────────────────────────────────────────────┘
//!                   ▼
//!        subscribers / watch() → presentation, logging
//! ```
//!
//! # Key Types
//!
//! - [`StateMachine`]: owns the canonical [`Snapshot`]; all writes go through
//!   [`StateMachine::set_state`]
//! - [`Poller`]: periodic fetch-all cycle
//! - [`SpeakerCoordinator`]: speaker display, guards and countdown
//! - [`ActionController`]: song requests, surprise me, speaker commands
//! - [`ResultEnvelope`]: uniform adapter result
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use showstatus_core::{
//!     adapters::{HttpPlaybackAdapter, HttpShowAdapter, HttpSpeakerAdapter},
//!     Poller, SpeakerCoordinator, StateMachine, StatusConfig, SystemClock,
//! };
//!
//! let config = showstatus_core::config::load_config()?;
//! let clock = Arc::new(SystemClock);
//! let machine = Arc::new(StateMachine::new(config.clone(), clock.clone()));
//! let speaker = Arc::new(HttpSpeakerAdapter::new(config.endpoints.speaker_url.clone(), config.endpoints.timeout, clock.clone()));
//! let coordinator = SpeakerCoordinator::new(machine.clone(), speaker.clone());
//! let poller = Poller::new(machine.clone(), show, playback, speaker, Some(coordinator));
//! poller.start_polling();
//! ```
//!
//! # Module Overview
//!
//! - [`actions`]: user actions behind the local gates
//! - [`adapters`]: feed traits, HTTP and scripted implementations
//! - [`clock`]: time sources
//! - [`config`]: TOML / environment configuration
//! - [`envelope`]: result envelope and error codes
//! - [`gating`]: per-song cooldown and single-flight guard
//! - [`model`]: feed payloads and the visitor record
//! - [`poller`]: fetch-all cycle
//! - [`session_store`]: visitor persistence
//! - [`speaker`]: speaker coordinator
//! - [`state`]: state machine and connectivity derivation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actions;
pub mod adapters;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod gating;
pub mod model;
pub mod poller;
pub mod session_store;
pub mod speaker;
pub mod state;

// Re-exports for convenience
pub use actions::{ActionController, ActionError, ActionOutcome, ActionResult, RequestedSong};
pub use adapters::{PlaybackAdapter, ShowControlAdapter, SpeakerAdapter};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ConfigSource, StatusConfig};
pub use envelope::{ErrorCode, ResultEnvelope};
pub use gating::{CooldownTracker, FlightGuard, SingleFlight};
pub use model::{
    ControllerData, PlaybackMode, QueueEntry, RecentRequest, ShowData, ShowStatus, Song,
    SpeakerConfig, SpeakerSession, VisitorSession,
};
pub use poller::Poller;
pub use session_store::{FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError};
pub use speaker::{
    derive_display, SpeakerCoordinator, SpeakerDenial, SpeakerDisplay, SpeakerDisplayMode,
    SpeakerError,
};
pub use state::{
    determine_state_from_data, ConnectivityState, DerivedState, DisplayStatus, FailureCounters,
    FeedSlot, Snapshot, StateChange, StateHistoryEntry, StateMachine, StatePatch, StateThresholds,
};
