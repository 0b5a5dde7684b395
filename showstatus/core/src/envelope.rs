//! Result Envelopes
//!
//! Every upstream adapter call resolves to a [`ResultEnvelope`]. Adapters never
//! fail past their boundary: transport failures, bad status codes and parse
//! errors are all folded into an envelope with `success == false` and an
//! [`ErrorCode`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error code carried by envelopes and action errors
///
/// Known codes get their own variant; anything else an adapter reports is kept
/// verbatim in [`ErrorCode::Other`] so it can be surfaced unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// Adapter is misconfigured (missing endpoint, bad URL)
    Config,
    /// Upstream answered with a non-2xx status
    Http,
    /// Transport or parse failure
    Network,
    /// Show-control service rejected a song request
    RequestRejected,
    /// Speaker hardware API reported a failure
    SpeakerApiFailed,
    /// Speaker activation needs proximity confirmation first
    ProximityRequired,
    /// Local per-song throttle is still running
    Cooldown,
    /// Song is already in the queue
    Duplicate,
    /// Song cannot be requested right now
    Unavailable,
    /// Too many requests
    RateLimit,
    /// Surprise-me found nothing to pick from
    NoSongs,
    /// Failure without a more specific classification
    Unknown,
    /// Speaker command failed without an adapter code
    SpeakerFailed,
    /// Any other code reported by an adapter
    Other(String),
}

impl ErrorCode {
    /// Wire representation of this code
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Config => "CONFIG_ERROR",
            Self::Http => "HTTP_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::RequestRejected => "REQUEST_REJECTED",
            Self::SpeakerApiFailed => "SPEAKER_API_FAILED",
            Self::ProximityRequired => "PROXIMITY_REQUIRED",
            Self::Cooldown => "COOLDOWN",
            Self::Duplicate => "DUPLICATE",
            Self::Unavailable => "UNAVAILABLE",
            Self::RateLimit => "RATE_LIMIT",
            Self::NoSongs => "NO_SONGS",
            Self::Unknown => "UNKNOWN",
            Self::SpeakerFailed => "SPEAKER_FAILED",
            Self::Other(code) => code,
        }
    }

    /// Whether this code is produced locally, without a network round trip
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Cooldown
                | Self::Duplicate
                | Self::Unavailable
                | Self::RateLimit
                | Self::NoSongs
                | Self::Unknown
                | Self::SpeakerFailed
        )
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "CONFIG_ERROR" => Self::Config,
            "HTTP_ERROR" => Self::Http,
            "NETWORK_ERROR" => Self::Network,
            "REQUEST_REJECTED" => Self::RequestRejected,
            "SPEAKER_API_FAILED" => Self::SpeakerApiFailed,
            "PROXIMITY_REQUIRED" => Self::ProximityRequired,
            "COOLDOWN" => Self::Cooldown,
            "DUPLICATE" => Self::Duplicate,
            "UNAVAILABLE" => Self::Unavailable,
            "RATE_LIMIT" => Self::RateLimit,
            "NO_SONGS" => Self::NoSongs,
            "UNKNOWN" => Self::Unknown,
            "SPEAKER_FAILED" => Self::SpeakerFailed,
            _ => Self::Other(code),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::from(code.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Other(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform wrapper returned by every adapter call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope<T> {
    /// Whether the call succeeded
    pub success: bool,
    /// When the result was produced (Unix timestamp ms)
    pub timestamp: u64,
    /// Payload on success
    pub data: Option<T>,
    /// Human-readable error on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Machine-readable error code on failure
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
}

impl<T> ResultEnvelope<T> {
    /// Successful envelope carrying `data`
    pub fn ok(data: T, timestamp: u64) -> Self {
        Self {
            success: true,
            timestamp,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    /// Failed envelope
    pub fn err(code: ErrorCode, error: impl Into<String>, timestamp: u64) -> Self {
        Self {
            success: false,
            timestamp,
            data: None,
            error: Some(error.into()),
            error_code: Some(code),
        }
    }

    /// Age of this envelope relative to `now_ms`
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }

    /// Successful payload, if any
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        if self.success {
            self.data.as_ref()
        } else {
            None
        }
    }

    /// Transform the payload, keeping the envelope metadata
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResultEnvelope<U> {
        ResultEnvelope {
            success: self.success,
            timestamp: self.timestamp,
            data: self.data.map(f),
            error: self.error,
            error_code: self.error_code,
        }
    }
}
