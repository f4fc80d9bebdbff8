//! Driftwood Core - DASH relay engine
//!
//! This crate provides the building blocks of the relay: the session
//! retrieval engine with its per-track state machines, the manifest and
//! segment-sequence tracker, the timer/priority scheduler, the binary
//! session control protocol, and media persistence.

pub mod config;
pub mod engine;
pub mod fetch;
pub mod manifest;
pub mod media;
pub mod protocol;
pub mod scheduler;
pub mod segmenter;
pub mod session;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::DriftwoodConfig;
pub use engine::{CreateSessionRequest, EngineHandle, spawn_relay_engine};
pub use manifest::SegmentTracker;
pub use media::{MediaStore, MediaStoreError};
pub use protocol::{ControlCodec, ControlMessage, DecodeError};
pub use scheduler::{Scheduler, SchedulerError};
pub use session::{Session, SessionError, SessionId, SessionRegistry};

/// Errors that can bubble up from any driftwood subsystem.
#[derive(Debug, thiserror::Error)]
pub enum DriftwoodError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Control message error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Media store error: {0}")]
    Media(#[from] MediaStoreError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriftwoodError>;
