//! LAN session transport: multicast discovery, WebSocket links, Noise
//! encryption.
//!
//! ```text
//!  advertise task ──► Beacon ──► 239.255.77.14:47774 ──► browse task (remote)
//!                                                          │ smaller id invites
//!                                                          ▼
//!  accept loop ◄── TCP ── WebSocket ── Noise NN ── Hello ⇄ Hello
//!       │
//!       ▼
//!  link task (one per peer): select! { inbound frame | outbound payload | close }
//! ```
//!
//! Each WebSocket binary message is exactly one Noise message, so payload
//! boundaries survive the trip. Plaintext is never accepted after the
//! handshake.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::frame::{Beacon, FrameError, SessionFrame};
use super::noise::{NoiseError, NoiseHandshake, NoiseSession, MAX_PLAINTEXT};
use super::{
    lock, should_invite, AtomicTransportStats, DiscoveryError, EventSink, SendError,
    SessionTransport, TransportEvent, TransportStats,
};
use crate::config::{ConfigError, SessionConfig};
use crate::directory::{PeerId, PeerState};

type PeerSocket = WebSocketStream<TcpStream>;

/// Bytes reserved for the bincode `Payload` frame header.
const FRAME_OVERHEAD: usize = 16;
const MAX_DATAGRAM: usize = 1500;
/// Pause after a failed accept or datagram receive.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

/// Link setup and link I/O failures. Logged, never surfaced to callers.
#[derive(Debug)]
pub enum LinkError {
    Io(std::io::Error),
    WebSocket(String),
    Noise(NoiseError),
    Frame(FrameError),
    Protocol(String),
    Closed,
    Timeout,
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::Noise(e) => write!(f, "{e}"),
            Self::Frame(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "Protocol violation: {e}"),
            Self::Closed => write!(f, "Link closed"),
            Self::Timeout => write!(f, "Invitation timed out"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

impl From<NoiseError> for LinkError {
    fn from(e: NoiseError) -> Self {
        Self::Noise(e)
    }
}

impl From<FrameError> for LinkError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// An established, encrypted link to one peer.
struct LanLink {
    link_id: Uuid,
    display_name: String,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
    close: Option<oneshot::Sender<()>>,
}

/// Resources that exist while the session or discovery is running.
#[derive(Default)]
struct Lifecycle {
    runtime: Option<Handle>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    discovery_tasks: Vec<JoinHandle<()>>,
    running: bool,
}

struct LanShared {
    config: SessionConfig,
    peer_id: PeerId,
    events: EventSink,
    session_open: AtomicBool,
    links: Mutex<HashMap<PeerId, LanLink>>,
    /// Peers with an invitation in flight
    pending: Mutex<HashSet<PeerId>>,
    lifecycle: Mutex<Lifecycle>,
    stats: AtomicTransportStats,
}

/// Session transport over the local network.
pub struct LanTransport {
    shared: Arc<LanShared>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl LanTransport {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, events_rx) = EventSink::channel(config.event_capacity);
        Ok(Self {
            shared: Arc::new(LanShared {
                config,
                peer_id: Uuid::new_v4(),
                events,
                session_open: AtomicBool::new(false),
                links: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
                stats: AtomicTransportStats::default(),
            }),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// Address of the session listener, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.lifecycle).local_addr
    }

    /// Invite the peer listening at `addr` into the session.
    ///
    /// Returns `false` if the session has not been started.
    pub fn invite(&self, addr: SocketAddr) -> bool {
        let Some(runtime) = lock(&self.shared.lifecycle).runtime.clone() else {
            return false;
        };
        if !self.shared.session_open.load(Ordering::Acquire) {
            return false;
        }
        runtime.spawn(LanShared::invite(self.shared.clone(), addr, None));
        true
    }

    /// Ids of currently linked peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.links).keys().copied().collect()
    }
}

impl SessionTransport for LanTransport {
    fn local_peer(&self) -> (PeerId, String) {
        (self.shared.peer_id, self.shared.config.display_name.clone())
    }

    fn start(&self) -> Result<(), DiscoveryError> {
        let runtime = Handle::try_current()
            .map_err(|e| DiscoveryError::AdvertiseFailed(format!("no tokio runtime: {e}")))?;
        let _guard = runtime.enter();
        let shared = &self.shared;
        let config = &shared.config;

        let mut lifecycle = lock(&shared.lifecycle);
        if lifecycle.running {
            log::debug!("{}: already advertising", config.display_name);
            return Ok(());
        }

        // The session (listener) outlives stop(); only shutdown() releases it.
        if lifecycle.local_addr.is_none() {
            let listener = bind_listener(config.listen_addr)?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| DiscoveryError::AdvertiseFailed(e.to_string()))?;
            lifecycle.local_addr = Some(local_addr);
            lifecycle.accept_task = Some(runtime.spawn(LanShared::accept_loop(shared.clone(), listener)));
            shared.session_open.store(true, Ordering::Release);
            log::info!("{}: session listening on {local_addr}", config.display_name);
        }
        lifecycle.runtime = Some(runtime.clone());

        if config.discovery {
            let socket = Arc::new(open_discovery_socket(config.discovery_group)?);
            let session_port = lifecycle.local_addr.map_or(0, |a| a.port());
            let beacon = Beacon {
                service: config.service_type.clone(),
                peer_id: shared.peer_id,
                display_name: config.display_name.clone(),
                session_port,
            }
            .encode()
            .map_err(|e| DiscoveryError::AdvertiseFailed(e.to_string()))?;

            lifecycle.discovery_tasks = vec![
                runtime.spawn(LanShared::advertise_loop(shared.clone(), socket.clone(), beacon)),
                runtime.spawn(LanShared::browse_loop(shared.clone(), socket)),
            ];
            log::info!(
                "{}: advertising and browsing for {:?} on {}",
                config.display_name,
                config.service_type,
                config.discovery_group
            );
        }
        lifecycle.running = true;
        Ok(())
    }

    fn stop(&self) {
        let mut lifecycle = lock(&self.shared.lifecycle);
        for task in lifecycle.discovery_tasks.drain(..) {
            task.abort();
        }
        if std::mem::take(&mut lifecycle.running) {
            log::info!("{}: stopped advertising and browsing", self.shared.config.display_name);
        }
    }

    fn shutdown(&self) {
        self.stop();
        self.shared.session_open.store(false, Ordering::Release);
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if let Some(task) = lifecycle.accept_task.take() {
                task.abort();
            }
            lifecycle.local_addr = None;
        }

        let links: Vec<(PeerId, LanLink)> = {
            let mut links = lock(&self.shared.links);
            self.shared.stats.active_peers.store(0, Ordering::Relaxed);
            links.drain().collect()
        };
        for (peer_id, mut link) in links {
            if let Some(close) = link.close.take() {
                let _ = close.send(());
            }
            self.shared.emit_state(peer_id, link.display_name, PeerState::Disconnected);
        }
        lock(&self.shared.pending).clear();
    }

    fn send_to_all(&self, payload: Arc<Vec<u8>>) -> Result<usize, SendError> {
        if !self.shared.session_open.load(Ordering::Acquire) {
            return Err(SendError::TransportRejected("session not started".into()));
        }
        if payload.len() > MAX_PLAINTEXT - FRAME_OVERHEAD {
            return Err(SendError::TransportRejected(format!(
                "payload of {} bytes exceeds session frame limit",
                payload.len()
            )));
        }

        let targets: Vec<(String, mpsc::Sender<Arc<Vec<u8>>>)> = lock(&self.shared.links)
            .values()
            .map(|link| (link.display_name.clone(), link.outbound.clone()))
            .collect();
        if targets.is_empty() {
            return Err(SendError::NoConnectedPeers);
        }

        let mut queued = 0;
        for (name, outbound) in targets {
            match outbound.try_send(payload.clone()) {
                Ok(()) => {
                    AtomicTransportStats::bump(&self.shared.stats.payloads_sent);
                    queued += 1;
                }
                Err(e) => {
                    log::warn!("Dropping payload for {name}: {e}");
                    AtomicTransportStats::bump(&self.shared.stats.payloads_dropped);
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

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LanShared {
    fn name(&self) -> &str {
        &self.config.display_name
    }

    fn emit_state(&self, peer_id: PeerId, display_name: String, state: PeerState) {
        log::debug!("{}: peer {display_name} is {state}", self.name());
        self.events.emit_state(TransportEvent::PeerStateChanged {
            peer_id,
            display_name,
            state,
        });
    }

    /// Remove the link if it is still the one identified by `link_id`.
    fn remove_link(&self, peer_id: &PeerId, link_id: Uuid) -> Option<String> {
        let mut links = lock(&self.links);
        if links.get(peer_id).map(|l| l.link_id) != Some(link_id) {
            return None;
        }
        let link = links.remove(peer_id)?;
        self.stats.active_peers.store(links.len(), Ordering::Relaxed);
        Some(link.display_name)
    }

    // ── Discovery ──────────────────────────────────────────────────

    async fn advertise_loop(self: Arc<Self>, socket: Arc<UdpSocket>, beacon: Vec<u8>) {
        let target = SocketAddr::V4(self.config.discovery_group);
        let mut ticker = tokio::time::interval(self.config.beacon_interval);
        let mut warned = false;
        loop {
            ticker.tick().await;
            match socket.send_to(&beacon, target).await {
                Ok(_) => warned = false,
                Err(e) if !warned => {
                    log::warn!("{}: beacon send failed: {e}", self.name());
                    warned = true;
                }
                Err(e) => log::debug!("{}: beacon send failed: {e}", self.name()),
            }
        }
    }

    async fn browse_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("{}: discovery receive failed: {e}", self.name());
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                    continue;
                }
            };
            let Ok(beacon) = Beacon::decode(&buf[..len]) else {
                log::debug!("{}: ignoring unreadable datagram from {from}", self.name());
                continue;
            };
            if beacon.peer_id == self.peer_id || beacon.service != self.config.service_type {
                continue;
            }
            if !should_invite(self.peer_id, beacon.peer_id) {
                continue;
            }
            if lock(&self.links).contains_key(&beacon.peer_id) {
                continue;
            }
            if !lock(&self.pending).insert(beacon.peer_id) {
                continue;
            }

            log::info!("{}: found peer {} at {from}", self.name(), beacon.display_name);
            let addr = SocketAddr::new(from.ip(), beacon.session_port);
            let expected = (beacon.peer_id, beacon.display_name);
            tokio::spawn(Self::invite(self.clone(), addr, Some(expected)));
        }
    }

    // ── Invitations ────────────────────────────────────────────────

    /// Invite a peer; `expected` carries the identity learned from its beacon.
    async fn invite(self: Arc<Self>, addr: SocketAddr, expected: Option<(PeerId, String)>) {
        AtomicTransportStats::bump(&self.stats.invitations_sent);
        if let Some((id, name)) = &expected {
            log::info!("{}: inviting {name} at {addr}", self.name());
            self.emit_state(*id, name.clone(), PeerState::Connecting);
        }

        let expected_id = expected.as_ref().map(|(id, _)| *id);
        let outcome = tokio::time::timeout(self.config.invite_timeout, self.initiate(addr, expected_id))
            .await
            .unwrap_or(Err(LinkError::Timeout));

        match outcome {
            Ok((peer_id, display_name, ws, noise)) => {
                if expected.is_none() {
                    self.emit_state(peer_id, display_name.clone(), PeerState::Connecting);
                }
                self.clone().register_link(peer_id, display_name, ws, noise).await;
            }
            Err(e) => {
                log::warn!("{}: invitation to {addr} failed: {e}", self.name());
                if let Some((id, name)) = &expected {
                    self.emit_state(*id, name.clone(), PeerState::Disconnected);
                }
            }
        }
        if let Some(id) = expected_id {
            lock(&self.pending).remove(&id);
        }
    }

    async fn initiate(
        &self,
        addr: SocketAddr,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, String, PeerSocket, NoiseSession), LinkError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let url = format!("ws://{addr}/{}", self.config.service_type);
        let (mut ws, _) = tokio_tungstenite::client_async(url, stream).await?;

        let mut handshake = NoiseHandshake::initiator()?;
        ws.send(Message::Binary(handshake.write_message()?.into())).await?;
        handshake.read_message(&next_binary(&mut ws).await?)?;
        let mut noise = handshake.into_session()?;

        send_frame(&mut ws, &mut noise, &self.hello()).await?;
        let (peer_id, display_name) = self.check_hello(recv_frame(&mut ws, &mut noise).await?)?;
        if expected.is_some_and(|id| id != peer_id) {
            return Err(LinkError::Protocol(format!(
                "{display_name} answered with an unexpected peer id"
            )));
        }
        Ok((peer_id, display_name, ws, noise))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("{}: accept failed: {e}", self.name());
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                    continue;
                }
            };
            log::debug!("{}: incoming connection from {addr}", self.name());

            let shared = self.clone();
            tokio::spawn(async move {
                let outcome = tokio::time::timeout(shared.config.invite_timeout, shared.respond(stream))
                    .await
                    .unwrap_or(Err(LinkError::Timeout));
                match outcome {
                    Ok((peer_id, display_name, ws, noise)) => {
                        AtomicTransportStats::bump(&shared.stats.invitations_accepted);
                        shared.register_link(peer_id, display_name, ws, noise).await;
                    }
                    Err(e) => log::warn!("{}: invitation from {addr} failed: {e}", shared.name()),
                }
            });
        }
    }

    async fn respond(
        &self,
        stream: TcpStream,
    ) -> Result<(PeerId, String, PeerSocket, NoiseSession), LinkError> {
        stream.set_nodelay(true)?;
        let mut ws = tokio_tungstenite::accept_async(stream).await?;

        let mut handshake = NoiseHandshake::responder()?;
        handshake.read_message(&next_binary(&mut ws).await?)?;
        ws.send(Message::Binary(handshake.write_message()?.into())).await?;
        let mut noise = handshake.into_session()?;

        let (peer_id, display_name) = self.check_hello(recv_frame(&mut ws, &mut noise).await?)?;
        self.emit_state(peer_id, display_name.clone(), PeerState::Connecting);

        log::info!(
            "{}: accepting invitation from {display_name} without authentication",
            self.name()
        );
        if let Err(e) = send_frame(&mut ws, &mut noise, &self.hello()).await {
            self.emit_state(peer_id, display_name, PeerState::Disconnected);
            return Err(e);
        }
        Ok((peer_id, display_name, ws, noise))
    }

    fn hello(&self) -> SessionFrame {
        SessionFrame::Hello {
            peer_id: self.peer_id,
            display_name: self.config.display_name.clone(),
            service: self.config.service_type.clone(),
        }
    }

    fn check_hello(&self, frame: SessionFrame) -> Result<(PeerId, String), LinkError> {
        match frame {
            SessionFrame::Hello { service, .. } if service != self.config.service_type => {
                Err(LinkError::Protocol(format!("peer speaks service {service:?}")))
            }
            SessionFrame::Hello { peer_id, .. } if peer_id == self.peer_id => {
                Err(LinkError::Protocol("connected to self".into()))
            }
            SessionFrame::Hello {
                peer_id,
                display_name,
                ..
            } => Ok((peer_id, display_name)),
            other => Err(LinkError::Protocol(format!("expected hello, got {other:?}"))),
        }
    }

    // ── Links ──────────────────────────────────────────────────────

    async fn register_link(
        self: Arc<Self>,
        peer_id: PeerId,
        display_name: String,
        mut ws: PeerSocket,
        mut noise: NoiseSession,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let link_id = Uuid::new_v4();

        let accepted = {
            let mut links = lock(&self.links);
            if !self.session_open.load(Ordering::Acquire) || links.contains_key(&peer_id) {
                false
            } else {
                links.insert(
                    peer_id,
                    LanLink {
                        link_id,
                        display_name: display_name.clone(),
                        outbound: outbound_tx,
                        close: Some(close_tx),
                    },
                );
                self.stats.active_peers.store(links.len(), Ordering::Relaxed);
                true
            }
        };

        if !accepted {
            log::debug!("{}: discarding redundant link to {display_name}", self.name());
            let _ = send_frame(&mut ws, &mut noise, &SessionFrame::Goodbye).await;
            let _ = ws.close(None).await;
            // A link that is already up keeps the peer connected.
            let still_linked = lock(&self.links).contains_key(&peer_id);
            if !still_linked {
                self.emit_state(peer_id, display_name, PeerState::Disconnected);
            }
            return;
        }

        log::info!("{}: connected to {display_name}", self.name());
        self.emit_state(peer_id, display_name.clone(), PeerState::Connected);
        tokio::spawn(self.run_link(peer_id, link_id, ws, noise, outbound_rx, close_rx));
    }

    async fn run_link(
        self: Arc<Self>,
        peer_id: PeerId,
        link_id: Uuid,
        ws: PeerSocket,
        mut noise: NoiseSession,
        mut outbound_rx: mpsc::Receiver<Arc<Vec<u8>>>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                biased;

                _ = &mut close_rx => {
                    if let Ok(goodbye) = SessionFrame::Goodbye.encode() {
                        if let Ok(sealed) = noise.seal(&goodbye) {
                            let _ = sink.send(Message::Binary(sealed.into())).await;
                        }
                    }
                    let _ = sink.close().await;
                    break;
                }

                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = noise
                            .open(&bytes)
                            .map_err(LinkError::from)
                            .and_then(|plain| SessionFrame::decode(&plain).map_err(LinkError::from));
                        match frame {
                            Ok(SessionFrame::Payload(payload)) => {
                                AtomicTransportStats::bump(&self.stats.payloads_received);
                                let event = TransportEvent::PayloadReceived { from: peer_id, payload };
                                if !self.events.send_payload(event).await {
                                    log::debug!("{}: event receiver dropped", self.name());
                                }
                            }
                            Ok(SessionFrame::Goodbye) => {
                                log::debug!("{}: peer {peer_id} said goodbye", self.name());
                                break;
                            }
                            Ok(SessionFrame::Hello { .. }) => {
                                log::debug!("{}: ignoring repeated hello from {peer_id}", self.name());
                            }
                            Err(e) => {
                                // Noise nonces are out of step after a bad message.
                                log::warn!("{}: closing link to {peer_id}: {e}", self.name());
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("{}: link to {peer_id} failed: {e}", self.name());
                        break;
                    }
                },

                out = outbound_rx.recv() => {
                    let Some(payload) = out else { break };
                    let sealed = SessionFrame::Payload(payload.to_vec())
                        .encode()
                        .map_err(LinkError::from)
                        .and_then(|plain| noise.seal(&plain).map_err(LinkError::from));
                    let result = match sealed {
                        Ok(sealed) => sink.send(Message::Binary(sealed.into())).await.map_err(LinkError::from),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        log::warn!("{}: send to {peer_id} failed: {e}", self.name());
                        break;
                    }
                }
            }
        }

        if let Some(display_name) = self.remove_link(&peer_id, link_id) {
            log::info!("{}: disconnected from {display_name}", self.name());
            self.emit_state(peer_id, display_name, PeerState::Disconnected);
        }
    }
}

// ── Socket helpers ─────────────────────────────────────────────────

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, DiscoveryError> {
    let advertise_err = |e: std::io::Error| DiscoveryError::AdvertiseFailed(format!("listener on {addr}: {e}"));
    let listener = std::net::TcpListener::bind(addr).map_err(advertise_err)?;
    listener.set_nonblocking(true).map_err(advertise_err)?;
    TcpListener::from_std(listener).map_err(advertise_err)
}

/// UDP socket bound to the discovery port with address reuse, joined to the
/// multicast group, looping back so peers on the same host see each other.
fn open_discovery_socket(group: SocketAddrV4) -> Result<UdpSocket, DiscoveryError> {
    let advertise_err = |e: std::io::Error| DiscoveryError::AdvertiseFailed(format!("discovery socket: {e}"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(advertise_err)?;
    socket.set_reuse_address(true).map_err(advertise_err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(advertise_err)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()));
    socket.bind(&bind_addr.into()).map_err(advertise_err)?;

    socket
        .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| DiscoveryError::BrowseFailed(format!("joining {}: {e}", group.ip())))?;
    socket.set_multicast_loop_v4(true).map_err(advertise_err)?;
    socket.set_nonblocking(true).map_err(advertise_err)?;

    UdpSocket::from_std(socket.into()).map_err(advertise_err)
}

async fn next_binary(ws: &mut PeerSocket) -> Result<Vec<u8>, LinkError> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Binary(data) => return Ok(data.into()),
            Message::Close(_) => return Err(LinkError::Closed),
            _ => continue,
        }
    }
    Err(LinkError::Closed)
}

async fn send_frame(
    ws: &mut PeerSocket,
    noise: &mut NoiseSession,
    frame: &SessionFrame,
) -> Result<(), LinkError> {
    let sealed = noise.seal(&frame.encode()?)?;
    ws.send(Message::Binary(sealed.into())).await?;
    Ok(())
}

async fn recv_frame(ws: &mut PeerSocket, noise: &mut NoiseSession) -> Result<SessionFrame, LinkError> {
    let sealed = next_binary(ws).await?;
    Ok(SessionFrame::decode(&noise.open(&sealed)?)?)
}
