//! Session transport: discovery, invitation and the encrypted peer session.
//!
//! ```text
//!   Idle ── start() ──► Advertising + Browsing
//!                              │ peer found (smaller id invites)
//!                              ▼
//!                          Inviting ── timeout / failure ──► Disconnected
//!                              │ accepted
//!                              ▼
//!                        SessionActive ── link closed ──► Disconnected
//! ```
//!
//! Every peer runs its own copy of the lower half of this machine; they
//! share one session per transport. Two implementations are provided:
//!
//! - [`LanTransport`]: multicast beacons, WebSocket links, Noise encryption
//! - [`MemoryTransport`]: in-process mesh for tests and simulations
//!
//! Transports report to their single consumer through a
//! [`TransportEvent`] channel obtained with [`SessionTransport::take_events`].

pub mod frame;
pub mod lan;
pub mod memory;
pub mod noise;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::directory::{PeerId, PeerState};

pub use lan::LanTransport;
pub use memory::{MemoryMesh, MemoryTransport};

/// Signals a transport raises towards the sync coordinator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer's connection state changed
    PeerStateChanged {
        peer_id: PeerId,
        display_name: String,
        state: PeerState,
    },
    /// A whole payload arrived from a connected peer
    PayloadReceived { from: PeerId, payload: Vec<u8> },
}

/// A session transport: one live session shared by all peer links.
pub trait SessionTransport: Send + Sync + 'static {
    /// Local peer identity and display name.
    fn local_peer(&self) -> (PeerId, String);

    /// Begin advertising and browsing. Calling it while already running is a
    /// no-op; calling it after a failure retries.
    fn start(&self) -> Result<(), DiscoveryError>;

    /// Halt advertising and browsing. Established links keep running.
    fn stop(&self);

    /// Stop discovery and close every peer link.
    fn shutdown(&self);

    /// Queue a payload for every connected peer without waiting for delivery.
    ///
    /// Returns the number of links the payload was queued on. Individual
    /// broken or saturated links are logged and skipped.
    fn send_to_all(&self, payload: Arc<Vec<u8>>) -> Result<usize, SendError>;

    /// Take the event receiver (can only be called once).
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Snapshot of transport counters.
    fn stats(&self) -> TransportStats;
}

/// Transport counters for monitoring session health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub invitations_sent: u64,
    pub invitations_accepted: u64,
    pub payloads_sent: u64,
    pub payloads_dropped: u64,
    pub payloads_received: u64,
    pub active_peers: usize,
}

/// Lock-free counters updated on the send and receive paths.
#[derive(Debug, Default)]
pub(crate) struct AtomicTransportStats {
    pub invitations_sent: AtomicU64,
    pub invitations_accepted: AtomicU64,
    pub payloads_sent: AtomicU64,
    pub payloads_dropped: AtomicU64,
    pub payloads_received: AtomicU64,
    pub active_peers: AtomicUsize,
}

impl AtomicTransportStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            invitations_sent: self.invitations_sent.load(Ordering::Relaxed),
            invitations_accepted: self.invitations_accepted.load(Ordering::Relaxed),
            payloads_sent: self.payloads_sent.load(Ordering::Relaxed),
            payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            active_peers: self.active_peers.load(Ordering::Relaxed),
        }
    }
}

/// Transport side of the event channel.
///
/// Peer-state events are never shed: when the channel is full they wait in
/// an overflow queue that a background task drains in order. Payloads are
/// shed instead, and only admitted while `payload_reserve` slots stay free.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<TransportEvent>,
    overflow: Arc<Mutex<VecDeque<TransportEvent>>>,
    payload_reserve: usize,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx,
            overflow: Arc::default(),
            payload_reserve: capacity / 4,
        };
        (sink, rx)
    }

    /// Queue a peer-state event without blocking.
    pub fn emit_state(&self, event: TransportEvent) {
        let mut overflow = lock(&self.overflow);
        if overflow.is_empty() {
            match self.tx.try_send(event) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(event)) => overflow.push_back(event),
            }
        } else {
            overflow.push_back(event);
        }
        if overflow.len() > 1 {
            // A drain task is already running.
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                log::debug!("Event queue full; deferring peer state event");
                runtime.spawn(drain_overflow(self.tx.clone(), self.overflow.clone()));
            }
            Err(_) => {
                log::warn!("Event queue full outside a runtime; dropping peer state event");
                overflow.clear();
            }
        }
    }

    /// Queue a payload unless the channel is too full. Returns whether it was
    /// queued.
    pub fn offer_payload(&self, event: TransportEvent) -> bool {
        if self.tx.capacity() <= self.payload_reserve || !lock(&self.overflow).is_empty() {
            return false;
        }
        self.tx.try_send(event).is_ok()
    }

    /// Queue a payload, waiting for room. Returns `false` once the receiver
    /// is gone.
    pub async fn send_payload(&self, event: TransportEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

async fn drain_overflow(
    tx: mpsc::Sender<TransportEvent>,
    overflow: Arc<Mutex<VecDeque<TransportEvent>>>,
) {
    loop {
        // Keep the event queued until sent so new events cannot overtake it.
        let Some(next) = lock(&overflow).front().cloned() else {
            return;
        };
        if tx.send(next).await.is_err() {
            lock(&overflow).clear();
            return;
        }
        let mut queue = lock(&overflow);
        queue.pop_front();
        if queue.is_empty() {
            return;
        }
    }
}

/// Exactly one side of a discovered pair sends the invitation.
pub(crate) fn should_invite(local: PeerId, remote: PeerId) -> bool {
    local < remote
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors from [`SessionTransport::send_to_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The session has no connected peer
    NoConnectedPeers,
    /// The session refused the payload (not running, or too large)
    TransportRejected(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoConnectedPeers => write!(f, "No connected peers"),
            Self::TransportRejected(e) => write!(f, "Transport rejected payload: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Errors from [`SessionTransport::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    AdvertiseFailed(String),
    BrowseFailed(String),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdvertiseFailed(e) => write!(f, "Advertising failed: {e}"),
            Self::BrowseFailed(e) => write!(f, "Browsing failed: {e}"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_exactly_one_side_invites() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(should_invite(a, b), should_invite(b, a));
        assert!(!should_invite(a, a));
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = AtomicTransportStats::default();
        AtomicTransportStats::bump(&stats.payloads_sent);
        AtomicTransportStats::bump(&stats.payloads_sent);
        AtomicTransportStats::bump(&stats.invitations_sent);
        stats.active_peers.store(3, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.payloads_sent, 2);
        assert_eq!(snap.invitations_sent, 1);
        assert_eq!(snap.active_peers, 3);
        assert_eq!(snap.payloads_dropped, 0);
    }

    fn state_event(state: PeerState) -> TransportEvent {
        TransportEvent::PeerStateChanged {
            peer_id: Uuid::nil(),
            display_name: "B".into(),
            state,
        }
    }

    fn payload_event(byte: u8) -> TransportEvent {
        TransportEvent::PayloadReceived {
            from: Uuid::nil(),
            payload: vec![byte],
        }
    }

    #[test]
    fn test_payloads_leave_room_for_state() {
        let (sink, mut rx) = EventSink::channel(4);
        let admitted = (0..10).filter(|i| sink.offer_payload(payload_event(*i))).count();
        assert_eq!(admitted, 3);

        sink.emit_state(state_event(PeerState::Disconnected));
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(TransportEvent::PeerStateChanged { state: PeerState::Disconnected, .. })
        ));
    }

    #[tokio::test]
    async fn test_state_events_overflow_in_order() {
        let (sink, mut rx) = EventSink::channel(1);
        let states = [PeerState::Connecting, PeerState::Connected, PeerState::Disconnected];
        for state in states {
            sink.emit_state(state_event(state));
        }
        assert!(!sink.offer_payload(payload_event(0)));

        for expected in states {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                TransportEvent::PeerStateChanged { state, .. } => assert_eq!(state, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(SendError::NoConnectedPeers.to_string(), "No connected peers");
        assert_eq!(
            DiscoveryError::BrowseFailed("no multicast".into()).to_string(),
            "Browsing failed: no multicast"
        );
    }
}
