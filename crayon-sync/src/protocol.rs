//! Wire codec for pose broadcasts.
//!
//! Each payload is one JSON document:
//! ```text
//! {"pingType":"update_ping","columnsArray":[["w","x","y","z"], ... × 4]}
//! ```
//!
//! - `pingType` is `"update_ping"` for routine per-frame poses and
//!   `"sync_ping"` for calibration pings.
//! - `columnsArray` holds the four pose columns in order. Within a column the
//!   components are written **w first**, then x, y, z. This is not the usual
//!   `(x, y, z, w)` order; do not transpose it.
//! - Every number is a decimal string using the shortest representation that
//!   parses back to the same `f32`.
//!
//! There is no version field and no length prefix: the session transport
//! delivers each payload whole.

use serde::{Deserialize, Serialize};
use serde_json::error::Category;

use crate::pose::Pose;

const UPDATE_TAG: &str = "update_ping";
const SYNC_TAG: &str = "sync_ping";

/// Kind discriminator of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Routine per-frame pose broadcast
    PoseUpdate,
    /// Manually triggered calibration: "this pose is our shared origin"
    SyncPing,
}

impl MessageKind {
    /// Tag written on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::PoseUpdate => UPDATE_TAG,
            MessageKind::SyncPing => SYNC_TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            UPDATE_TAG => Some(MessageKind::PoseUpdate),
            SYNC_TAG => Some(MessageKind::SyncPing),
            _ => None,
        }
    }
}

/// The unit transmitted between peers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub pose: Pose,
}

impl Envelope {
    pub fn new(kind: MessageKind, pose: Pose) -> Self {
        Self { kind, pose }
    }

    pub fn pose_update(pose: Pose) -> Self {
        Self::new(MessageKind::PoseUpdate, pose)
    }

    pub fn sync_ping(pose: Pose) -> Self {
        Self::new(MessageKind::SyncPing, pose)
    }

    /// Serialize to the wire format. Deterministic for a given envelope.
    pub fn encode(&self) -> Vec<u8> {
        let columns_array = self
            .pose
            .columns()
            .iter()
            .map(|&[x, y, z, w]| vec![w.to_string(), x.to_string(), y.to_string(), z.to_string()])
            .collect();
        let wire = WireEnvelope {
            ping_type: Some(self.kind.tag().to_string()),
            columns_array,
        };
        // Strings and sequences only; serialization into a Vec cannot fail.
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    /// Parse a payload received from a peer.
    ///
    /// Never panics: every malformed input maps to a [`DecodeError`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(|e| match e.classify() {
            Category::Eof => DecodeError::Truncated,
            _ => DecodeError::Malformed(e.to_string()),
        })?;

        let tag = wire
            .ping_type
            .ok_or_else(|| DecodeError::Malformed("missing pingType".to_string()))?;
        let kind = MessageKind::from_tag(&tag)
            .ok_or_else(|| DecodeError::Malformed(format!("unknown pingType {tag:?}")))?;

        let columns = &wire.columns_array;
        if columns.len() > 4 || columns.iter().any(|c| c.len() > 4) {
            return Err(DecodeError::Malformed("more than 16 pose fields".to_string()));
        }
        if columns.len() < 4 || columns.iter().any(|c| c.len() < 4) {
            return Err(DecodeError::Truncated);
        }

        let mut parsed = [[0.0f32; 4]; 4];
        for (out, column) in parsed.iter_mut().zip(columns) {
            let [w, x, y, z] = [
                parse_component(&column[0])?,
                parse_component(&column[1])?,
                parse_component(&column[2])?,
                parse_component(&column[3])?,
            ];
            *out = [x, y, z, w];
        }

        Ok(Self::new(kind, Pose::from_columns(parsed)))
    }
}

fn parse_component(text: &str) -> Result<f32, DecodeError> {
    text.trim()
        .parse::<f32>()
        .map_err(|_| DecodeError::Malformed(format!("invalid float {text:?}")))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default)]
    ping_type: Option<String>,
    #[serde(default)]
    columns_array: Vec<Vec<String>>,
}

/// Errors from [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Unknown or missing kind tag, unparseable number, or wrong shape
    Malformed(String),
    /// Fewer than 16 pose fields, or the payload ends early
    Truncated,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed payload: {e}"),
            Self::Truncated => write!(f, "Truncated payload"),
        }
    }
}

impl std::error::Error for DecodeError {}
