//! Feed Data Model
//!
//! Payload types for the three upstream feeds and the visitor record. Field
//! names follow the upstream JSON (camelCase) so adapters can deserialize
//! responses directly.

use serde::{Deserialize, Serialize};

// ============================================================================
// Show-control feed
// ============================================================================

/// Overall show status as reported by the show-control service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowStatus {
    /// Show is between sequences or not started
    #[default]
    Idle,
    /// Show is running and accepting viewer control
    Active,
    /// Show is running but viewer control is off
    RunningNoControl,
    /// Show has ended for the night
    Ended,
}

/// One entry of the request queue
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueEntry {
    /// Song identifier
    pub song_id: String,
    /// Display title
    pub title: String,
    /// Artist, if known
    pub artist: Option<String>,
    /// Who requested it
    pub requested_by: Option<String>,
    /// 1-based position in the queue
    pub position: u32,
}

/// A song that viewers may request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Song {
    /// Song identifier
    pub song_id: String,
    /// Display title
    pub title: String,
    /// Artist, if known
    pub artist: Option<String>,
    /// Length in seconds
    pub duration: Option<u32>,
    /// Grouping category
    pub category: Option<String>,
    /// Whether the show-control service currently offers it
    pub is_available: bool,
    /// Server-side cooldown expiry (Unix timestamp ms)
    pub cooldown_until: Option<u64>,
    /// Hidden from the request grid
    pub hidden: bool,
}

impl Default for Song {
    fn default() -> Self {
        Self {
            song_id: String::new(),
            title: String::new(),
            artist: None,
            duration: None,
            category: None,
            is_available: true,
            cooldown_until: None,
            hidden: false,
        }
    }
}

impl Song {
    /// Whether this song is available and visible at `now_ms`
    #[must_use]
    pub fn is_requestable(&self, now_ms: u64) -> bool {
        self.is_available && !self.hidden && self.cooldown_until.map_or(true, |t| t <= now_ms)
    }
}

/// Payload of the show-control feed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShowData {
    /// Title of the sequence playing now
    pub now_playing: Option<String>,
    /// Title of the next sequence
    pub up_next: Option<String>,
    /// Viewer request queue
    pub queue: Vec<QueueEntry>,
    /// Songs viewers may request
    pub available_songs: Vec<Song>,
    /// Overall show status
    pub show_status: ShowStatus,
    /// Whether song requests are accepted
    pub requests_enabled: bool,
    /// Whether viewers may control playback at all
    pub viewer_control_enabled: bool,
}

impl ShowData {
    /// Look up a song by id
    #[must_use]
    pub fn song(&self, song_id: &str) -> Option<&Song> {
        self.available_songs.iter().find(|s| s.song_id == song_id)
    }

    /// Whether a song is already waiting in the queue
    #[must_use]
    pub fn is_queued(&self, song_id: &str) -> bool {
        self.queue.iter().any(|e| e.song_id == song_id)
    }

    /// Songs that may be requested right now
    pub fn requestable_songs(&self, now_ms: u64) -> impl Iterator<Item = &Song> {
        self.available_songs
            .iter()
            .filter(move |s| s.is_requestable(now_ms))
    }
}

// ============================================================================
// Playback-controller feed
// ============================================================================

/// Playback mode reported by the sequence controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// A sequence is playing
    Playing,
    /// Controller is up and between sequences
    Idle,
    /// Playback paused
    Paused,
    /// Playback fully stopped
    #[default]
    Stopped,
    /// Any mode this client does not know about
    #[serde(other)]
    Unknown,
}

impl PlaybackMode {
    /// Whether a sequence is audibly playing
    #[must_use]
    pub fn is_playing(self) -> bool {
        matches!(self, Self::Playing)
    }

    /// Playing or between songs; both count as ready for viewers
    #[must_use]
    pub fn is_active_ready(self) -> bool {
        matches!(self, Self::Playing | Self::Idle)
    }
}

/// Payload of the playback-controller feed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerData {
    /// Current playback mode
    pub mode: PlaybackMode,
    /// Sequence file currently loaded
    pub current_sequence: Option<String>,
    /// Seconds into the current sequence
    pub seconds_elapsed: u32,
    /// Seconds left in the current sequence
    pub seconds_remaining: u32,
}

// ============================================================================
// Speaker-hardware feed
// ============================================================================

/// Static speaker configuration reported by the hardware service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeakerConfig {
    /// FM frequency for in-car listening
    pub fm_frequency: Option<String>,
    /// Audio stream URL
    pub stream_url: Option<String>,
    /// Local hour at which the noise curfew starts
    pub noise_curfew_hour: u32,
    /// Whether the curfew is enforced
    pub noise_curfew_enabled: bool,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            fm_frequency: None,
            stream_url: None,
            noise_curfew_hour: 22,
            noise_curfew_enabled: false,
        }
    }
}

/// Speaker session as reported by the hardware service
///
/// Always replaced wholesale from adapter responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeakerSession {
    /// Speaker is on
    pub enabled: bool,
    /// Seconds left in the current session
    pub remaining_seconds: u32,
    /// When the current session started (Unix timestamp ms)
    pub session_started_at: Option<u64>,
    /// When the lifetime window started (Unix timestamp ms)
    pub session_lifetime_started_at: Option<u64>,
    /// Operator override is active
    #[serde(rename = "override")]
    pub override_active: bool,
    /// Hardware mode label
    pub mode: Option<String>,
    /// Who turned the speaker on
    pub source: Option<String>,
    /// Hardware service believes the controller is playing
    pub fpp_playing: bool,
    /// Geofencing risk level (1 = closest)
    pub proximity_tier: u8,
    /// Visitor confirmed they are nearby
    pub proximity_confirmed: bool,
    /// Per-session cap reached; no more extensions
    pub max_session_reached: bool,
    /// Lifetime cap reached
    pub lifetime_cap_reached: bool,
    /// Controller is forcing a shutdown
    pub graceful_shutoff: bool,
    /// Static configuration
    pub config: SpeakerConfig,
}

impl Default for SpeakerSession {
    fn default() -> Self {
        Self {
            enabled: false,
            remaining_seconds: 0,
            session_started_at: None,
            session_lifetime_started_at: None,
            override_active: false,
            mode: None,
            source: None,
            fpp_playing: false,
            proximity_tier: 1,
            proximity_confirmed: false,
            max_session_reached: false,
            lifetime_cap_reached: false,
            graceful_shutoff: false,
            config: SpeakerConfig::default(),
        }
    }
}

impl SpeakerSession {
    /// Whether the noise curfew applies at `hour`
    #[must_use]
    pub fn curfew_active(&self, hour: u32) -> bool {
        self.config.noise_curfew_enabled && hour >= self.config.noise_curfew_hour
    }

    /// Far-away tier that has not been confirmed
    #[must_use]
    pub fn needs_proximity_confirmation(&self) -> bool {
        self.proximity_tier >= 4 && !self.proximity_confirmed
    }
}

/// Body of a speaker enable/extend command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerCommand {
    /// Always "viewer" for commands issued from this client
    pub source: String,
    /// Extending a running session instead of starting one
    pub extension: bool,
    /// Visitor confirmed proximity
    pub proximity_confirmed: bool,
}

impl SpeakerCommand {
    /// Build a viewer command
    #[must_use]
    pub fn viewer(extension: bool, proximity_confirmed: bool) -> Self {
        Self {
            source: "viewer".to_string(),
            extension,
            proximity_confirmed,
        }
    }
}

// ============================================================================
// Song requests and the visitor record
// ============================================================================

/// Body of a song request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongRequest {
    /// Song to queue
    pub song_id: String,
    /// Requesting visitor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
}

/// Successful song request response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestReceipt {
    /// Position the song landed at
    pub queue_position: Option<u32>,
}

/// The visitor's most recent successful request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentRequest {
    /// Requested song
    pub song_id: String,
    /// Its title
    pub title: String,
    /// When it was requested (Unix timestamp ms)
    pub timestamp: u64,
    /// Queue position reported by the server
    pub queue_position: Option<u32>,
}

/// Visitor identity and activity, persisted across runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSession {
    /// Opaque visitor id (collision-tolerant)
    pub visitor_id: String,
    /// When this session started (Unix timestamp ms)
    #[serde(default)]
    pub session_started_at: u64,
    /// Number of successful actions
    #[serde(default)]
    pub interaction_count: u32,
    /// Last successful request
    #[serde(default)]
    pub recent_request: Option<RecentRequest>,
}

impl VisitorSession {
    /// Start a new session with a freshly generated id
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            visitor_id: generate_visitor_id(now_ms),
            session_started_at: now_ms,
            interaction_count: 0,
            recent_request: None,
        }
    }
}

/// Generate a visitor id: base36 timestamp plus a random suffix
#[must_use]
pub fn generate_visitor_id(now_ms: u64) -> String {
    use rand::Rng;

    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("v_{}_{}", to_base36(now_ms), suffix)
}

fn to_base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
