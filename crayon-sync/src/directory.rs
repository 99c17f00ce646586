//! Peer directory: tracks known peers and derives the connected roster.
//!
//! Records only move forward, `Connecting → Connected → Disconnected`.
//! A peer that goes backwards (for example drops from `Connected` to
//! `Connecting` while the link re-establishes) has its current record ended
//! and a fresh one started, so roster order always reflects the first
//! connection of the *current* record.
//!
//! The directory is a plain single-threaded structure; callers that share it
//! across tasks wrap it in one mutex.

use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Stable identity of a peer for the lifetime of its process.
pub type PeerId = Uuid;

/// Connection state of a peer as reported by the session transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A peer known to the directory.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: String,
    pub state: PeerState,
    /// When this record entered `Connected` (None until then).
    pub connected_at: Option<Instant>,
}

impl PeerRecord {
    fn new(id: PeerId, display_name: String, state: PeerState) -> Self {
        Self {
            id,
            display_name,
            state,
            connected_at: (state == PeerState::Connected).then(Instant::now),
        }
    }
}

/// Known peers plus the derived roster of connected display names.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: HashMap<PeerId, PeerRecord>,
    /// Connected peer ids in order of first connection.
    roster: Vec<PeerId>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a state change reported by the transport.
    ///
    /// Returns `true` if the roster changed, so callers can suppress
    /// redundant notifications.
    pub fn on_peer_state_changed(
        &mut self,
        peer_id: PeerId,
        display_name: &str,
        new_state: PeerState,
    ) -> bool {
        let before = self.current_roster();

        match self.records.get(&peer_id).map(|r| r.state) {
            None => {
                if new_state == PeerState::Disconnected {
                    log::debug!("Ignoring disconnect of unknown peer {display_name} ({peer_id})");
                } else {
                    self.insert(PeerRecord::new(peer_id, display_name.to_string(), new_state));
                }
            }
            Some(current) if current == new_state => {
                if let Some(record) = self.records.get_mut(&peer_id) {
                    record.display_name = display_name.to_string();
                }
            }
            Some(current) if new_state > current => {
                if new_state == PeerState::Disconnected {
                    self.end_record(&peer_id);
                } else if let Some(record) = self.records.get_mut(&peer_id) {
                    // Connecting -> Connected
                    record.state = new_state;
                    record.display_name = display_name.to_string();
                    record.connected_at = Some(Instant::now());
                    self.roster.push(peer_id);
                }
            }
            Some(current) => {
                log::debug!(
                    "Peer {display_name} ({peer_id}) went back from {current} to {new_state}; starting a new record"
                );
                self.end_record(&peer_id);
                self.insert(PeerRecord::new(peer_id, display_name.to_string(), new_state));
            }
        }

        self.current_roster() != before
    }

    /// Snapshot of connected display names, ordered by first connection.
    pub fn current_roster(&self) -> Vec<String> {
        self.roster
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.display_name.clone())
            .collect()
    }

    /// Look up a peer's current record.
    pub fn record(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer_id)
    }

    /// Number of peers currently connected.
    pub fn connected_count(&self) -> usize {
        self.roster.len()
    }

    /// Number of live records (connecting or connected).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, record: PeerRecord) {
        if record.state == PeerState::Connected {
            self.roster.push(record.id);
        }
        self.records.insert(record.id, record);
    }

    fn end_record(&mut self, peer_id: &PeerId) {
        self.records.remove(peer_id);
        self.roster.retain(|id| id != peer_id);
    }
}
