//! Upstream Adapters
//!
//! Trait definitions for the three upstream feeds. The core only ever talks to
//! these traits; implementations normalize whatever the upstream returns into
//! a [`ResultEnvelope`] and never fail past their boundary.
//!
//! # Available Adapters
//!
//! - **HTTP**: `reqwest`-based JSON adapters ([`HttpShowAdapter`],
//!   [`HttpPlaybackAdapter`], [`HttpSpeakerAdapter`])
//! - **Scripted**: in-memory adapters with call counters for tests and demos
//!   (see [`scripted`])

mod http;
pub mod scripted;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::model::{
    ControllerData, RequestReceipt, ShowData, SongRequest, SpeakerCommand, SpeakerSession,
};

pub use http::{HttpPlaybackAdapter, HttpShowAdapter, HttpSpeakerAdapter};

/// Show-control / request-queue service
#[async_trait]
pub trait ShowControlAdapter: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Fetch the show status, queue and song list
    async fn fetch_show(&self) -> ResultEnvelope<ShowData>;

    /// Submit a song request
    async fn request_song(&self, request: &SongRequest) -> ResultEnvelope<RequestReceipt>;
}

/// Lighting-sequence playback controller
#[async_trait]
pub trait PlaybackAdapter: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Fetch the current playback status
    async fn fetch_playback(&self) -> ResultEnvelope<ControllerData>;
}

/// Speaker hardware service
#[async_trait]
pub trait SpeakerAdapter: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Fetch the current speaker session
    async fn fetch_speaker(&self) -> ResultEnvelope<SpeakerSession>;

    /// Enable or extend the speaker
    async fn send_command(&self, command: &SpeakerCommand) -> ResultEnvelope<SpeakerSession>;
}
