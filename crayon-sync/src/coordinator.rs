//! Sync coordinator: the API the rendering layer talks to.
//!
//! Owns a [`SessionTransport`] and a [`PeerDirectory`]. Outbound calls
//! encode an [`Envelope`] and hand it to the transport without waiting;
//! inbound transport events are processed on a dispatch task and surface as
//! [`SyncEvent`]s on the channel returned by [`SyncCoordinator::new`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::directory::{PeerDirectory, PeerId};
use crate::pose::Pose;
use crate::protocol::{Envelope, MessageKind};
use crate::transport::{lock, DiscoveryError, SendError, SessionTransport, TransportEvent};

/// Default capacity of the collaborator-facing event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events raised towards the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Display names of connected peers, in order of first connection
    RosterChanged(Vec<String>),
    /// A peer's latest camera pose
    PoseUpdate { from: PeerId, pose: Pose },
    /// A peer declared its current pose as the shared origin
    SyncReceived { from: PeerId, pose: Pose },
}

pub struct SyncCoordinator<T: SessionTransport> {
    transport: T,
    directory: Arc<Mutex<PeerDirectory>>,
    events_tx: mpsc::Sender<SyncEvent>,
    transport_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    name: String,
}

impl<T: SessionTransport> SyncCoordinator<T> {
    /// Wrap a transport. The returned receiver carries every [`SyncEvent`].
    pub fn new(transport: T) -> (Self, mpsc::Receiver<SyncEvent>) {
        Self::with_capacity(transport, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(transport: T, capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let transport_rx = transport.take_events();
        if transport_rx.is_none() {
            log::warn!("Transport events were already taken; inbound traffic will be ignored");
        }
        let (_, name) = transport.local_peer();
        let coordinator = Self {
            transport,
            directory: Arc::new(Mutex::new(PeerDirectory::new())),
            events_tx,
            transport_rx: Mutex::new(transport_rx),
            dispatch: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            name,
        };
        (coordinator, events_rx)
    }

    /// Begin discovery and start processing inbound events.
    ///
    /// Calling it again while running is a no-op. A discovery failure is
    /// logged and returned so the caller can retry. Fails once
    /// [`shutdown`](Self::shutdown) has been called.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        if self.shut_down.load(Ordering::Acquire) {
            let e = DiscoveryError::AdvertiseFailed("coordinator shut down".into());
            log::error!("{}: cannot start: {e}", self.name);
            return Err(e);
        }
        {
            let mut dispatch = lock(&self.dispatch);
            if dispatch.is_none() {
                let runtime = Handle::try_current().map_err(|e| {
                    let e = DiscoveryError::AdvertiseFailed(format!("no tokio runtime: {e}"));
                    log::error!("{}: cannot start: {e}", self.name);
                    e
                })?;
                let transport_rx = lock(&self.transport_rx).take();
                if let Some(rx) = transport_rx {
                    *dispatch = Some(runtime.spawn(dispatch_loop(
                        self.name.clone(),
                        rx,
                        self.directory.clone(),
                        self.events_tx.clone(),
                    )));
                }
            }
        }

        self.transport.start().map_err(|e| {
            log::error!("{}: discovery failed to start: {e}", self.name);
            e
        })
    }

    /// Stop advertising and browsing. Established peers stay connected.
    pub fn stop(&self) {
        self.transport.stop();
    }

    /// Close the session and stop processing events. The roster empties and
    /// the coordinator cannot be started again.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.transport.shutdown();
        if let Some(task) = lock(&self.dispatch).take() {
            task.abort();
        }

        let had_peers = {
            let mut directory = lock(&self.directory);
            let had_peers = directory.connected_count() > 0;
            *directory = PeerDirectory::new();
            had_peers
        };
        if had_peers {
            if let Err(e) = self.events_tx.try_send(SyncEvent::RosterChanged(Vec::new())) {
                log::debug!("{}: final empty roster not delivered: {e}", self.name);
            }
        }
    }

    /// Send the local camera pose to every connected peer.
    ///
    /// Returns the number of peers it was queued for. Never blocks.
    pub fn broadcast_pose(&self, pose: Pose) -> usize {
        self.broadcast(Envelope::pose_update(pose))
    }

    /// Declare `pose` the shared origin for every connected peer.
    pub fn broadcast_sync(&self, pose: Pose) -> usize {
        let sent = self.broadcast(Envelope::sync_ping(pose));
        log::info!("{}: sync ping sent to {sent} peer(s)", self.name);
        sent
    }

    /// Connected display names in order of first connection.
    pub fn roster(&self) -> Vec<String> {
        lock(&self.directory).current_roster()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn broadcast(&self, envelope: Envelope) -> usize {
        if lock(&self.directory).connected_count() == 0 {
            return 0;
        }
        match self.transport.send_to_all(Arc::new(envelope.encode())) {
            Ok(sent) => sent,
            Err(SendError::NoConnectedPeers) => {
                log::debug!("{}: no connected peers for {}", self.name, envelope.kind.tag());
                0
            }
            Err(e) => {
                log::warn!("{}: {} not sent: {e}", self.name, envelope.kind.tag());
                0
            }
        }
    }
}

impl<T: SessionTransport> Drop for SyncCoordinator<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch_loop(
    name: String,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    directory: Arc<Mutex<PeerDirectory>>,
    events_tx: mpsc::Sender<SyncEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        match event {
            TransportEvent::PeerStateChanged {
                peer_id,
                display_name,
                state,
            } => {
                let roster = {
                    let mut directory = lock(&directory);
                    directory
                        .on_peer_state_changed(peer_id, &display_name, state)
                        .then(|| directory.current_roster())
                };
                if let Some(roster) = roster {
                    log::info!("{name}: roster is now {roster:?}");
                    let _ = events_tx.send(SyncEvent::RosterChanged(roster)).await;
                }
            }
            TransportEvent::PayloadReceived { from, payload } => {
                let envelope = match Envelope::decode(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::warn!("{name}: dropping payload from {from}: {e}");
                        continue;
                    }
                };
                match envelope.kind {
                    MessageKind::PoseUpdate => {
                        let event = SyncEvent::PoseUpdate {
                            from,
                            pose: envelope.pose,
                        };
                        if let Err(TrySendError::Full(_)) = events_tx.try_send(event) {
                            log::debug!("{name}: consumer busy, dropping pose from {from}");
                        }
                    }
                    MessageKind::SyncPing => {
                        log::info!("{name}: sync ping from {from}");
                        let event = SyncEvent::SyncReceived {
                            from,
                            pose: envelope.pose,
                        };
                        let _ = events_tx.send(event).await;
                    }
                }
            }
        }
    }
    log::debug!("{name}: transport event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PeerState;
    use crate::transport::{MemoryMesh, MemoryTransport, TransportStats};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Transport that records sends and lets the test inject events.
    struct RecordingTransport {
        peer_id: PeerId,
        sends: Arc<AtomicUsize>,
        starts: Arc<AtomicUsize>,
        events_tx: mpsc::Sender<TransportEvent>,
        events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            let (events_tx, events_rx) = mpsc::channel(64);
            Self {
                peer_id: Uuid::new_v4(),
                sends: Arc::new(AtomicUsize::new(0)),
                starts: Arc::new(AtomicUsize::new(0)),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }
        }
    }

    impl SessionTransport for RecordingTransport {
        fn local_peer(&self) -> (PeerId, String) {
            (self.peer_id, "recorder".into())
        }
        fn start(&self) -> Result<(), DiscoveryError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) {}
        fn shutdown(&self) {}
        fn send_to_all(&self, _payload: Arc<Vec<u8>>) -> Result<usize, SendError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
        fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
            lock(&self.events_rx).take()
        }
        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn connect_peer(transport: &RecordingTransport, name: &str) -> PeerId {
        let id = Uuid::new_v4();
        for state in [PeerState::Connecting, PeerState::Connected] {
            transport
                .events_tx
                .send(TransportEvent::PeerStateChanged {
                    peer_id: id,
                    display_name: name.into(),
                    state,
                })
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_broadcast_with_empty_roster_is_noop() {
        let transport = RecordingTransport::new();
        let sends = transport.sends.clone();
        let (coordinator, _events) = SyncCoordinator::new(transport);
        coordinator.start().unwrap();

        assert_eq!(coordinator.broadcast_pose(Pose::IDENTITY), 0);
        assert_eq!(coordinator.broadcast_sync(Pose::IDENTITY), 0);
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_transport_once_connected() {
        let transport = RecordingTransport::new();
        let sends = transport.sends.clone();
        let (coordinator, mut events) = SyncCoordinator::new(transport);
        coordinator.start().unwrap();

        connect_peer(coordinator.transport(), "iPad").await;
        assert_eq!(next_event(&mut events).await, SyncEvent::RosterChanged(vec!["iPad".into()]));

        assert_eq!(coordinator.broadcast_pose(Pose::from_translation(1.0, 0.0, 0.0)), 1);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.roster(), vec!["iPad".to_string()]);
    }

    #[tokio::test]
    async fn test_start_twice_spawns_one_dispatch() {
        let transport = RecordingTransport::new();
        let starts = transport.starts.clone();
        let (coordinator, mut events) = SyncCoordinator::new(transport);
        coordinator.start().unwrap();
        coordinator.start().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        connect_peer(coordinator.transport(), "iPad").await;
        assert!(matches!(next_event(&mut events).await, SyncEvent::RosterChanged(_)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (coordinator, _events) = SyncCoordinator::new(RecordingTransport::new());
        assert!(coordinator.start().is_err());
        assert!(lock(&coordinator.transport_rx).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_payload_dropped() {
        let transport = RecordingTransport::new();
        let (coordinator, mut events) = SyncCoordinator::new(transport);
        coordinator.start().unwrap();
        let from = connect_peer(coordinator.transport(), "iPad").await;
        next_event(&mut events).await;

        let pose = Pose::from_translation(0.5, 1.5, -2.0);
        for payload in [b"{not json".to_vec(), Envelope::pose_update(pose).encode()] {
            coordinator
                .transport()
                .events_tx
                .send(TransportEvent::PayloadReceived { from, payload })
                .await
                .unwrap();
        }
        assert_eq!(next_event(&mut events).await, SyncEvent::PoseUpdate { from, pose });
    }

    #[tokio::test]
    async fn test_full_consumer_drops_poses_keeps_sync() {
        let transport = RecordingTransport::new();
        let (coordinator, mut events) = SyncCoordinator::with_capacity(transport, 1);
        coordinator.start().unwrap();
        let from = connect_peer(coordinator.transport(), "iPad").await;
        next_event(&mut events).await;

        // Nothing reads `events` while these are dispatched.
        let tx = coordinator.transport().events_tx.clone();
        for i in 0..3 {
            let payload = Envelope::pose_update(Pose::from_translation(i as f32, 0.0, 0.0)).encode();
            tx.send(TransportEvent::PayloadReceived { from, payload }).await.unwrap();
        }
        let payload = Envelope::sync_ping(Pose::IDENTITY).encode();
        tx.send(TransportEvent::PayloadReceived { from, payload }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut received = vec![next_event(&mut events).await, next_event(&mut events).await];
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        let poses = received
            .iter()
            .filter(|e| matches!(e, SyncEvent::PoseUpdate { .. }))
            .count();
        let syncs = received
            .iter()
            .filter(|e| matches!(e, SyncEvent::SyncReceived { .. }))
            .count();
        assert!(poses < 3, "expected dropped poses, got {poses}");
        assert_eq!(syncs, 1);
        assert_eq!(
            received.first(),
            Some(&SyncEvent::PoseUpdate { from, pose: Pose::from_translation(0.0, 0.0, 0.0) })
        );
        assert_eq!(
            received.last(),
            Some(&SyncEvent::SyncReceived { from, pose: Pose::IDENTITY })
        );
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let mesh = MemoryMesh::new();
        let (a, _events_a) = SyncCoordinator::new(MemoryTransport::named(&mesh, "A").unwrap());
        a.start().unwrap();
        a.shutdown();

        assert!(matches!(a.start(), Err(DiscoveryError::AdvertiseFailed(_))));
        assert_eq!(mesh.advertising_count(), 0);

        let (b, _events_b) = SyncCoordinator::new(MemoryTransport::named(&mesh, "B").unwrap());
        b.start().unwrap();
        assert!(a.transport().connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_roster() {
        let mesh = MemoryMesh::new();
        let (a, mut events_a) = SyncCoordinator::new(MemoryTransport::named(&mesh, "A").unwrap());
        let (b, _events_b) = SyncCoordinator::new(MemoryTransport::named(&mesh, "B").unwrap());
        a.start().unwrap();
        b.start().unwrap();
        assert_eq!(next_event(&mut events_a).await, SyncEvent::RosterChanged(vec!["B".into()]));

        a.shutdown();
        assert_eq!(next_event(&mut events_a).await, SyncEvent::RosterChanged(vec![]));
        assert!(a.roster().is_empty());
        assert_eq!(a.broadcast_pose(Pose::IDENTITY), 0);
    }
}
