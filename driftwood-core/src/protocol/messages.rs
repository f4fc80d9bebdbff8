//! Control message serialization and deserialization.

use bytes::{Buf, BufMut};

use super::{
    DecodeError, HEADER_SIZE, MESSAGE_MAGIC, PROTOCOL_VERSION, SESSION_BEGIN_MIN_SIZE,
    SESSION_END_MIN_SIZE, SOURCE_IP_LEN, TYPE_SESSION_BEGIN, TYPE_SESSION_END,
};

/// Session lifecycle control message.
///
/// Immutable once decoded; constructed fresh for encoding. The source ip is
/// kept as the raw 15-byte field so padding survives a round trip untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Requests that a relay session be created for `uri`.
    SessionBegin {
        source_ip: [u8; SOURCE_IP_LEN],
        uri: Option<String>,
        /// Epoch seconds after which the session is considered stale even
        /// absent the sweep job.
        expires_at_epoch: i64,
    },
    /// Requests immediate teardown of the session relaying `uri`.
    SessionEnd {
        source_ip: [u8; SOURCE_IP_LEN],
        uri: Option<String>,
    },
}

impl ControlMessage {
    /// Builds a SessionBegin, zero-padding the source ip to 15 bytes.
    ///
    /// # Errors
    /// - `DecodeError::SourceIpTooLong` - ip text exceeds the fixed field
    pub fn session_begin(
        source_ip: &str,
        uri: Option<String>,
        expires_at_epoch: i64,
    ) -> Result<Self, DecodeError> {
        Ok(ControlMessage::SessionBegin {
            source_ip: pad_source_ip(source_ip)?,
            uri,
            expires_at_epoch,
        })
    }

    /// Builds a SessionEnd, zero-padding the source ip to 15 bytes.
    ///
    /// # Errors
    /// - `DecodeError::SourceIpTooLong` - ip text exceeds the fixed field
    pub fn session_end(source_ip: &str, uri: Option<String>) -> Result<Self, DecodeError> {
        Ok(ControlMessage::SessionEnd {
            source_ip: pad_source_ip(source_ip)?,
            uri,
        })
    }

    /// Source ip with trailing padding stripped.
    pub fn source_ip_str(&self) -> &str {
        let raw = match self {
            ControlMessage::SessionBegin { source_ip, .. } => source_ip,
            ControlMessage::SessionEnd { source_ip, .. } => source_ip,
        };
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end]).unwrap_or("").trim_end()
    }

    /// The request uri, if present.
    pub fn uri(&self) -> Option<&str> {
        match self {
            ControlMessage::SessionBegin { uri, .. } => uri.as_deref(),
            ControlMessage::SessionEnd { uri, .. } => uri.as_deref(),
        }
    }

    fn type_discriminator(&self) -> u32 {
        match self {
            ControlMessage::SessionBegin { .. } => TYPE_SESSION_BEGIN,
            ControlMessage::SessionEnd { .. } => TYPE_SESSION_END,
        }
    }

    fn min_size(&self) -> usize {
        match self {
            ControlMessage::SessionBegin { .. } => SESSION_BEGIN_MIN_SIZE,
            ControlMessage::SessionEnd { .. } => SESSION_END_MIN_SIZE,
        }
    }
}

fn pad_source_ip(source_ip: &str) -> Result<[u8; SOURCE_IP_LEN], DecodeError> {
    let raw = source_ip.as_bytes();
    if raw.len() > SOURCE_IP_LEN {
        return Err(DecodeError::SourceIpTooLong(raw.len()));
    }
    let mut field = [0u8; SOURCE_IP_LEN];
    field[..raw.len()].copy_from_slice(raw);
    Ok(field)
}

/// Fixed-layout codec for control messages.
pub struct ControlCodec;

impl ControlCodec {
    /// Serializes a control message.
    ///
    /// Always emits a buffer of exactly `min_size + uri_len` bytes.
    pub fn encode(message: &ControlMessage) -> Vec<u8> {
        let uri_len = message.uri().map_or(0, |uri| uri.len());
        let total = message.min_size() + uri_len;
        let mut buf = Vec::with_capacity(total);

        buf.put_u32(MESSAGE_MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u32(message.type_discriminator());
        buf.put_u64(total as u64);
        buf.put_u32(0); // reserved

        match message {
            ControlMessage::SessionBegin {
                source_ip,
                uri,
                expires_at_epoch,
            } => {
                buf.extend_from_slice(source_ip);
                buf.put_u32(uri_len as u32);
                if let Some(uri) = uri {
                    buf.extend_from_slice(uri.as_bytes());
                }
                buf.put_i64(*expires_at_epoch);
            }
            ControlMessage::SessionEnd { source_ip, uri } => {
                buf.extend_from_slice(source_ip);
                buf.put_u32(uri_len as u32);
                if let Some(uri) = uri {
                    buf.extend_from_slice(uri.as_bytes());
                }
            }
        }

        debug_assert_eq!(buf.len(), total);
        buf
    }

    /// Deserializes a control message.
    ///
    /// # Errors
    /// - `DecodeError::TooShort` - Input below the minimum size for its type
    /// - `DecodeError::BadMagic` / `UnsupportedVersion` / `UnknownType`
    /// - `DecodeError::LengthMismatch` - Header length disagrees with layout
    /// - `DecodeError::InvalidUri` - URI bytes are not UTF-8
    pub fn decode(data: &[u8]) -> Result<ControlMessage, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort {
                needed: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != MESSAGE_MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = buf.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let message_type = buf.get_u32();
        let declared_length = buf.get_u64();
        let _reserved = buf.get_u32();

        let min_size = match message_type {
            TYPE_SESSION_BEGIN => SESSION_BEGIN_MIN_SIZE,
            TYPE_SESSION_END => SESSION_END_MIN_SIZE,
            other => return Err(DecodeError::UnknownType(other)),
        };
        if data.len() < min_size {
            return Err(DecodeError::TooShort {
                needed: min_size,
                got: data.len(),
            });
        }

        let mut source_ip = [0u8; SOURCE_IP_LEN];
        buf.copy_to_slice(&mut source_ip);

        let uri_len = buf.get_u32() as usize;
        if data.len() < min_size + uri_len {
            return Err(DecodeError::TooShort {
                needed: min_size + uri_len,
                got: data.len(),
            });
        }
        if declared_length != (min_size + uri_len) as u64 {
            return Err(DecodeError::LengthMismatch {
                declared: declared_length,
                actual: min_size + uri_len,
            });
        }

        // A zero uriLength means the uri is absent, not empty.
        let uri = if uri_len > 0 {
            Some(String::from_utf8(buf[..uri_len].to_vec())?)
        } else {
            None
        };
        if uri_len > 0 {
            buf.advance(uri_len);
        }

        match message_type {
            TYPE_SESSION_BEGIN => {
                let expires_at_epoch = buf.get_i64();
                Ok(ControlMessage::SessionBegin {
                    source_ip,
                    uri,
                    expires_at_epoch,
                })
            }
            TYPE_SESSION_END => Ok(ControlMessage::SessionEnd { source_ip, uri }),
            _ => unreachable!("type checked above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_begin_roundtrip() {
        let message = ControlMessage::session_begin(
            "192.168.100.254",
            Some("rtmp://origin/live/cam-7".to_string()),
            1_735_689_600,
        )
        .unwrap();

        let encoded = ControlCodec::encode(&message);
        assert_eq!(
            encoded.len(),
            SESSION_BEGIN_MIN_SIZE + "rtmp://origin/live/cam-7".len()
        );

        let decoded = ControlCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.source_ip_str(), "192.168.100.254");
    }

    #[test]
    fn test_session_end_roundtrip() {
        let message =
            ControlMessage::session_end("10.0.0.1", Some("x".to_string())).unwrap();
        let encoded = ControlCodec::encode(&message);
        assert_eq!(encoded.len(), SESSION_END_MIN_SIZE + 1);
        assert_eq!(ControlCodec::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_zero_length_uri_decodes_absent() {
        let message = ControlMessage::session_begin("10.0.0.1", None, 0).unwrap();
        let encoded = ControlCodec::encode(&message);
        assert_eq!(encoded.len(), SESSION_BEGIN_MIN_SIZE);

        let decoded = ControlCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.uri(), None);
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_large_uri_roundtrip() {
        // Over 64 KiB, past any u16 length assumption.
        let uri = "a".repeat(70_000);
        let message = ControlMessage::session_end("10.0.0.1", Some(uri.clone())).unwrap();

        let encoded = ControlCodec::encode(&message);
        assert_eq!(encoded.len(), SESSION_END_MIN_SIZE + 70_000);

        let decoded = ControlCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.uri(), Some(uri.as_str()));
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_too_short_rejected() {
        let message = ControlMessage::session_begin("10.0.0.1", None, 42).unwrap();
        let encoded = ControlCodec::encode(&message);

        for cut in [0, 1, HEADER_SIZE, SESSION_BEGIN_MIN_SIZE - 1] {
            let result = ControlCodec::decode(&encoded[..cut]);
            assert!(
                matches!(result, Err(DecodeError::TooShort { .. })),
                "cut at {cut} should be too short"
            );
        }
    }

    #[test]
    fn test_truncated_uri_rejected() {
        let message = ControlMessage::session_end("10.0.0.1", Some("abcdef".to_string())).unwrap();
        let encoded = ControlCodec::encode(&message);

        // Keep the header and fixed fields but drop uri bytes.
        let result = ControlCodec::decode(&encoded[..SESSION_END_MIN_SIZE + 2]);
        assert!(matches!(result, Err(DecodeError::TooShort { .. })));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let message = ControlMessage::session_end("10.0.0.1", None).unwrap();
        let mut encoded = ControlCodec::encode(&message);
        encoded[6..10].copy_from_slice(&99u32.to_be_bytes());

        assert!(matches!(
            ControlCodec::decode(&encoded),
            Err(DecodeError::UnknownType(99))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let message = ControlMessage::session_end("10.0.0.1", None).unwrap();
        let mut encoded = ControlCodec::encode(&message);
        encoded[0] = 0xFF;

        assert!(matches!(
            ControlCodec::decode(&encoded),
            Err(DecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn test_source_ip_padding_preserved() {
        // "1.2.3.4" leaves eight bytes of zero padding in the fixed field.
        let message = ControlMessage::session_end("1.2.3.4", None).unwrap();
        let decoded = ControlCodec::decode(&ControlCodec::encode(&message)).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.source_ip_str(), "1.2.3.4");
    }

    #[test]
    fn test_source_ip_too_long() {
        let result = ControlMessage::session_end("255.255.255.2555", None);
        assert!(matches!(result, Err(DecodeError::SourceIpTooLong(16))));
    }
}
