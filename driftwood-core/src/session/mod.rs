//! Session model and process-wide session registry.
//!
//! A session is one end-to-end managed stream (LIVE or STATIC) with its own
//! manifest, tracks, and retrieval state. Sessions are created from control
//! messages or manifest-on-demand requests, and are removed by explicit
//! teardown, sweep-job eviction, or unrecoverable fetch failure.

pub mod registry;
pub mod sweeper;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub use registry::SessionRegistry;
pub use sweeper::register_sweep_job;

/// Unique identifier for a relay session.
///
/// Immutable after creation; exactly one session per id exists in the
/// registry at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a session relays a perpetual live source or a bounded file.
///
/// LIVE sessions are expected to run until the source disappears; STATIC
/// sessions are expected to end on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Live,
    Static,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Live => write!(f, "LIVE"),
            StreamType::Static => write!(f, "STATIC"),
        }
    }
}

/// Elementary stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "AUDIO"),
            TrackKind::Video => write!(f, "VIDEO"),
        }
    }
}

/// Lifecycle state of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, retrieval not yet started
    Created,
    /// Retrieval tasks are running
    Running,
    /// Terminal: retrieval ended but the record stays queryable
    Stopped,
}

/// One managed stream instance.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session id, immutable after creation
    pub id: SessionId,
    /// LIVE or STATIC, immutable after creation
    pub stream_type: StreamType,
    /// Where the source manifest lives
    pub source_uri: String,
    /// Local path the republished manifest is written to
    pub manifest_path: PathBuf,
    /// Set once at creation; the sweep job computes age from it
    pub created_at: Instant,
    /// Expiry epoch carried by the session-begin control message, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// minBufferTime from the parsed manifest
    pub min_buffer_time: Option<Duration>,
    /// mediaPresentationDuration from the parsed manifest
    pub media_duration: Option<Duration>,
    /// Lifecycle state
    pub state: SessionState,
}

impl Session {
    /// Creates a new session record in the `Created` state.
    pub fn new(
        id: SessionId,
        stream_type: StreamType,
        source_uri: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            stream_type,
            source_uri: source_uri.into(),
            manifest_path: manifest_path.into(),
            created_at: Instant::now(),
            expires_at: None,
            min_buffer_time: None,
            media_duration: None,
            state: SessionState::Created,
        }
    }

    /// Sets the expiry epoch from a control message.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Time elapsed since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Errors that can occur during session and retrieval operations.
///
/// Transient fetch failures are recovered inside the engine via retry and
/// never surface past it; the variants here are the structural outcomes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {id} already exists")]
    DuplicateSession { id: SessionId },

    #[error("Session {id} not found")]
    SessionNotFound { id: SessionId },

    #[error("Retrieval already running for session {id}")]
    AlreadyRunning { id: SessionId },

    #[error("Failed to parse manifest: {reason}")]
    ManifestParse { reason: String },

    #[error("Manifest validation failed: {path}")]
    ManifestValidation { path: PathBuf },

    #[error("Fetch for {url} failed with status {status}")]
    FetchFailed {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("No response for {url} within the idle window")]
    IdleTimeout { url: String },

    #[error("{target} exhausted {attempts} fetch attempts")]
    RetriesExhausted { target: String, attempts: u32 },

    #[error("Segment name undefined for representation {representation}")]
    SegmentNameUndefined { representation: String },

    #[error("Segmentation tool failed: {reason}")]
    ToolInvocation { reason: String },

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("Media store error")]
    Media(#[from] crate::media::MediaStoreError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("URL parsing error")]
    Url(#[from] url::ParseError),
}
