//! Transport control frames (bincode-encoded).
//!
//! - [`Beacon`]: plaintext multicast advertisement
//! - [`SessionFrame`]: carried inside Noise transport messages on a link

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discovery advertisement sent to the multicast group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub service: String,
    pub peer_id: Uuid,
    pub display_name: String,
    /// TCP port of the advertiser's session listener
    pub session_port: u16,
}

/// Frames exchanged over an established, encrypted peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionFrame {
    /// Identity exchange right after the Noise handshake
    Hello {
        peer_id: Uuid,
        display_name: String,
        service: String,
    },
    /// Opaque application payload
    Payload(Vec<u8>),
    /// Clean close
    Goodbye,
}

/// Frame encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Frame encode error: {e}"),
            Self::Decode(e) => write!(f, "Frame decode error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| FrameError::Encode(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, FrameError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(value)
}

impl Beacon {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode(bytes)
    }
}

impl SessionFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_roundtrip() {
        let beacon = Beacon {
            service: "location-share".into(),
            peer_id: Uuid::new_v4(),
            display_name: "Antonio's iPhone".into(),
            session_port: 50123,
        };
        let decoded = Beacon::decode(&beacon.encode().unwrap()).unwrap();
        assert_eq!(decoded, beacon);
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = SessionFrame::Hello {
            peer_id: Uuid::new_v4(),
            display_name: "iPad".into(),
            service: "location-share".into(),
        };
        assert_eq!(SessionFrame::decode(&hello.encode().unwrap()).unwrap(), hello);
    }

    #[test]
    fn test_payload_frame_small_overhead() {
        let frame = SessionFrame::Payload(vec![7u8; 300]);
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 310, "Payload frame too large: {} bytes", encoded.len());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(SessionFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Beacon::decode(&[]).is_err());
    }
}
