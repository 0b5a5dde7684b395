//! Visitor Session Persistence
//!
//! Durable record of the visitor identity and last successful request. Read
//! once at startup, written after each request action.
//!
//! # Format
//!
//! One JSON document:
//!
//! ```json
//! {"visitorId":"v_lq2x8k0_a81kd02m","sessionStartedAt":1700000000000,
//!  "interactionCount":3,"recentRequest":null}
//! ```
//!
//! A `recentRequest` older than the configured ttl (300 s by default) is
//! discarded on restore. A missing or unreadable record yields a fresh
//! session; persistence problems never block startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::model::VisitorSession;

/// Errors from a [`SessionStore`]
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// Reading or writing the record failed
    #[error("Session file I/O failed at {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The record could not be encoded or decoded
    #[error("Session record is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

/// Durable storage for the visitor record
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the stored record, `None` when nothing has been saved
    async fn load(&self) -> Result<Option<VisitorSession>, SessionStoreError>;

    /// Replace the stored record
    async fn save(&self, session: &VisitorSession) -> Result<(), SessionStoreError>;
}

// ============================================================================
// File-backed store
// ============================================================================

/// JSON file store
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store backed by `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SessionStoreError {
        SessionStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<VisitorSession>, SessionStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, session: &VisitorSession) -> Result<(), SessionStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }
        let json = serde_json::to_vec_pretty(session)?;

        // Write-then-rename so a crash never leaves a truncated record
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        tracing::debug!(path = %self.path.display(), "Visitor session saved");
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store that keeps the record in memory
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<VisitorSession>>,
    saves: Mutex<usize>,
}

impl MemorySessionStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `session`
    #[must_use]
    pub fn with_session(session: VisitorSession) -> Self {
        Self {
            record: Mutex::new(Some(session)),
            saves: Mutex::new(0),
        }
    }

    /// Last saved record
    #[must_use]
    pub fn snapshot(&self) -> Option<VisitorSession> {
        self.record.lock().clone()
    }

    /// Number of saves performed
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<VisitorSession>, SessionStoreError> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, session: &VisitorSession) -> Result<(), SessionStoreError> {
        *self.record.lock() = Some(session.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

// ============================================================================
// Restore
// ============================================================================

/// Clean up a loaded record, or start a new session when there is none
///
/// Drops a `recent_request` older than `recent_request_ttl`.
#[must_use]
pub fn restore_visitor(
    loaded: Option<VisitorSession>,
    now_ms: u64,
    recent_request_ttl: Duration,
) -> VisitorSession {
    let Some(mut session) = loaded.filter(|s| !s.visitor_id.is_empty()) else {
        return VisitorSession::new(now_ms);
    };
    let ttl_ms = recent_request_ttl.as_millis() as u64;
    if session
        .recent_request
        .as_ref()
        .is_some_and(|r| now_ms.saturating_sub(r.timestamp) > ttl_ms)
    {
        tracing::debug!(visitor_id = %session.visitor_id, "Discarding stale recent request");
        session.recent_request = None;
    }
    session
}

/// Load and restore the visitor, falling back to a fresh session on any error
pub async fn load_visitor(
    store: &dyn SessionStore,
    now_ms: u64,
    recent_request_ttl: Duration,
) -> VisitorSession {
    let loaded = match store.load().await {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::warn!(error = %e, "Could not restore visitor session; starting fresh");
            None
        }
    };
    restore_visitor(loaded, now_ms, recent_request_ttl)
}
