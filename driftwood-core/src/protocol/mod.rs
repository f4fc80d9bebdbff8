//! Binary control-message protocol for session lifecycle signaling.
//!
//! Cooperating processes exchange fixed-layout messages over a byte-stream
//! or datagram transport to begin and end relay sessions. All integer fields
//! are fixed-width, network byte order:
//!
//! ```text
//! [ header: 22 bytes - magic, version, type discriminator, total length ]
//! [ source ip: 15 bytes, ASCII, padding preserved as-is                 ]
//! [ uri length: 4-byte unsigned                                         ]
//! [ uri: uriLength bytes, UTF-8 (absent when length is 0)               ]
//! [ expiry epoch: 8-byte signed - SessionBegin only                     ]
//! ```

pub mod messages;

pub use messages::{ControlCodec, ControlMessage};

/// Message frame magic, "DWCM".
pub const MESSAGE_MAGIC: u32 = 0x4457_434D;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header size: magic(4) + version(2) + type(4) + length(8) + reserved(4).
pub const HEADER_SIZE: usize = 22;

/// Fixed width of the source ip field.
pub const SOURCE_IP_LEN: usize = 15;

/// Type discriminator for SessionBegin.
pub const TYPE_SESSION_BEGIN: u32 = 1;

/// Type discriminator for SessionEnd.
pub const TYPE_SESSION_END: u32 = 2;

/// Minimum encoded size of a SessionBegin: header + ip + uriLength + expiry.
pub const SESSION_BEGIN_MIN_SIZE: usize = HEADER_SIZE + SOURCE_IP_LEN + 4 + 8;

/// Minimum encoded size of a SessionEnd: header + ip + uriLength.
pub const SESSION_END_MIN_SIZE: usize = HEADER_SIZE + SOURCE_IP_LEN + 4;

/// Errors produced while encoding or decoding control messages.
///
/// A decode failure drops the offending message; the channel stays open.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("Bad message magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown message type: {0}")]
    UnknownType(u32),

    #[error("Declared length {declared} does not match encoded size {actual}")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("URI is not valid UTF-8")]
    InvalidUri(#[from] std::string::FromUtf8Error),

    #[error("Source ip longer than {SOURCE_IP_LEN} bytes: {0}")]
    SourceIpTooLong(usize),
}
