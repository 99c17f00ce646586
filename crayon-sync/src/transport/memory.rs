//! In-process session transport.
//!
//! A shared [`MemoryMesh`] broker connects several [`MemoryTransport`]s in
//! one process, with the same discovery and invitation semantics as the LAN
//! transport but no sockets: payloads are handed straight to the remote
//! peer's event queue. Discovery happens when a transport starts: it sees
//! every advertising peer of its service and is seen by every browsing one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    lock, should_invite, AtomicTransportStats, DiscoveryError, EventSink, SendError,
    SessionTransport, TransportEvent, TransportStats,
};
use crate::config::{ConfigError, SessionConfig};
use crate::directory::{PeerId, PeerState};

/// Shared broker routing discovery and payloads between memory transports.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<Mutex<MeshState>>,
}

#[derive(Default)]
struct MeshState {
    /// Every transport created on this mesh
    members: HashMap<PeerId, Weak<MemoryShared>>,
    /// Transports currently advertising and browsing
    running: HashSet<PeerId>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports currently advertising.
    pub fn advertising_count(&self) -> usize {
        lock(&self.inner).running.len()
    }

    /// Drop the link between two peers; both sides observe `Disconnected`.
    ///
    /// Returns `false` if the peers were not linked.
    pub fn sever(&self, a: PeerId, b: PeerId) -> bool {
        let (left, right) = {
            let state = lock(&self.inner);
            let get = |id: &PeerId| state.members.get(id).and_then(Weak::upgrade);
            match (get(&a), get(&b)) {
                (Some(left), Some(right)) => (left, right),
                _ => return false,
            }
        };
        let removed_left = left.drop_link(&right.peer_id);
        let removed_right = right.drop_link(&left.peer_id);
        removed_left || removed_right
    }

    fn register(&self, shared: &Arc<MemoryShared>) {
        lock(&self.inner)
            .members
            .insert(shared.peer_id, Arc::downgrade(shared));
    }

    /// Start advertising; returns the peers discovered, or `None` if the
    /// transport was already running.
    fn advertise(&self, shared: &Arc<MemoryShared>) -> Option<Vec<Arc<MemoryShared>>> {
        let mut state = lock(&self.inner);
        if !state.running.insert(shared.peer_id) {
            return None;
        }
        let found = state
            .running
            .iter()
            .filter(|id| **id != shared.peer_id)
            .filter_map(|id| state.members.get(id).and_then(Weak::upgrade))
            .filter(|remote| remote.service == shared.service)
            .collect();
        Some(found)
    }

    fn withdraw(&self, peer_id: &PeerId) -> bool {
        lock(&self.inner).running.remove(peer_id)
    }

    fn forget(&self, peer_id: &PeerId) {
        let mut state = lock(&self.inner);
        state.running.remove(peer_id);
        state.members.remove(peer_id);
    }
}

/// State of one memory transport, reachable from its linked peers.
struct MemoryShared {
    peer_id: PeerId,
    display_name: String,
    service: String,
    events: EventSink,
    links: Mutex<HashMap<PeerId, MemoryLink>>,
    stats: AtomicTransportStats,
}

struct MemoryLink {
    display_name: String,
    remote: Weak<MemoryShared>,
}

impl MemoryShared {
    fn emit_state(&self, peer: &MemoryShared, state: PeerState) {
        log::debug!("{}: peer {} is {state}", self.display_name, peer.display_name);
        self.events.emit_state(TransportEvent::PeerStateChanged {
            peer_id: peer.peer_id,
            display_name: peer.display_name.clone(),
            state,
        });
    }

    fn is_linked(&self, peer_id: &PeerId) -> bool {
        lock(&self.links).contains_key(peer_id)
    }

    fn add_link(&self, remote: &Arc<MemoryShared>) {
        let mut links = lock(&self.links);
        links.insert(
            remote.peer_id,
            MemoryLink {
                display_name: remote.display_name.clone(),
                remote: Arc::downgrade(remote),
            },
        );
        self.stats
            .active_peers
            .store(links.len(), std::sync::atomic::Ordering::Relaxed);
    }

    /// Remove a link and report the peer disconnected. Returns whether a
    /// link existed.
    fn drop_link(&self, peer_id: &PeerId) -> bool {
        let removed = {
            let mut links = lock(&self.links);
            let removed = links.remove(peer_id);
            self.stats
                .active_peers
                .store(links.len(), std::sync::atomic::Ordering::Relaxed);
            removed
        };
        match removed {
            Some(link) => {
                self.events.emit_state(TransportEvent::PeerStateChanged {
                    peer_id: *peer_id,
                    display_name: link.display_name,
                    state: PeerState::Disconnected,
                });
                true
            }
            None => false,
        }
    }

    fn deliver(&self, from: PeerId, payload: &[u8]) -> bool {
        let event = TransportEvent::PayloadReceived {
            from,
            payload: payload.to_vec(),
        };
        if self.events.offer_payload(event) {
            AtomicTransportStats::bump(&self.stats.payloads_received);
            true
        } else {
            log::debug!("{}: event queue full, inbound payload dropped", self.display_name);
            false
        }
    }
}

/// Invite `invitee` into `inviter`'s session. Invitations are always
/// accepted.
fn invite(inviter: &Arc<MemoryShared>, invitee: &Arc<MemoryShared>) {
    if inviter.is_linked(&invitee.peer_id) {
        return;
    }
    log::debug!("{}: inviting {}", inviter.display_name, invitee.display_name);
    AtomicTransportStats::bump(&inviter.stats.invitations_sent);
    inviter.emit_state(invitee, PeerState::Connecting);
    invitee.emit_state(inviter, PeerState::Connecting);

    log::info!(
        "{}: accepting invitation from {} without authentication",
        invitee.display_name,
        inviter.display_name
    );
    AtomicTransportStats::bump(&invitee.stats.invitations_accepted);
    inviter.add_link(invitee);
    invitee.add_link(inviter);
    inviter.emit_state(invitee, PeerState::Connected);
    invitee.emit_state(inviter, PeerState::Connected);
}

/// Session transport over a [`MemoryMesh`].
pub struct MemoryTransport {
    mesh: MemoryMesh,
    shared: Arc<MemoryShared>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MemoryTransport {
    pub fn new(mesh: &MemoryMesh, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, events_rx) = EventSink::channel(config.event_capacity);
        let shared = Arc::new(MemoryShared {
            peer_id: Uuid::new_v4(),
            display_name: config.display_name,
            service: config.service_type,
            events,
            links: Mutex::new(HashMap::new()),
            stats: AtomicTransportStats::default(),
        });
        mesh.register(&shared);
        Ok(Self {
            mesh: mesh.clone(),
            shared,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Convenience constructor with a default config and the given name.
    pub fn named(mesh: &MemoryMesh, display_name: &str) -> Result<Self, ConfigError> {
        Self::new(mesh, SessionConfig::with_display_name(display_name))
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// Ids of currently linked peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.links).keys().copied().collect()
    }
}

impl SessionTransport for MemoryTransport {
    fn local_peer(&self) -> (PeerId, String) {
        (self.shared.peer_id, self.shared.display_name.clone())
    }

    fn start(&self) -> Result<(), DiscoveryError> {
        let Some(found) = self.mesh.advertise(&self.shared) else {
            log::debug!("{}: already advertising", self.shared.display_name);
            return Ok(());
        };
        log::info!(
            "{}: advertising and browsing for {:?}",
            self.shared.display_name,
            self.shared.service
        );
        for remote in found {
            if should_invite(self.shared.peer_id, remote.peer_id) {
                invite(&self.shared, &remote);
            } else {
                invite(&remote, &self.shared);
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if self.mesh.withdraw(&self.shared.peer_id) {
            log::info!("{}: stopped advertising and browsing", self.shared.display_name);
        }
    }

    fn shutdown(&self) {
        self.stop();
        let links: Vec<(PeerId, Weak<MemoryShared>)> = lock(&self.shared.links)
            .iter()
            .map(|(id, link)| (*id, link.remote.clone()))
            .collect();
        for (peer_id, remote) in links {
            self.shared.drop_link(&peer_id);
            if let Some(remote) = remote.upgrade() {
                remote.drop_link(&self.shared.peer_id);
            }
        }
    }

    fn send_to_all(&self, payload: Arc<Vec<u8>>) -> Result<usize, SendError> {
        let targets: Vec<(PeerId, Weak<MemoryShared>)> = lock(&self.shared.links)
            .iter()
            .map(|(id, link)| (*id, link.remote.clone()))
            .collect();
        if targets.is_empty() {
            return Err(SendError::NoConnectedPeers);
        }

        let mut queued = 0;
        for (peer_id, remote) in targets {
            match remote.upgrade() {
                Some(remote) if remote.deliver(self.shared.peer_id, &payload) => {
                    AtomicTransportStats::bump(&self.shared.stats.payloads_sent);
                    queued += 1;
                }
                Some(_) => AtomicTransportStats::bump(&self.shared.stats.payloads_dropped),
                None => {
                    log::warn!("{}: peer {peer_id} is gone", self.shared.display_name);
                    AtomicTransportStats::bump(&self.shared.stats.payloads_dropped);
                    self.shared.drop_link(&peer_id);
                }
            }
        }
        Ok(queued)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        lock(&self.events_rx).take()
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
        self.mesh.forget(&self.shared.peer_id);
    }
}
