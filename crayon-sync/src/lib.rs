//! # crayon-sync: Peer-to-peer camera pose sharing
//!
//! Discovers nearby peers, joins them into one encrypted session and streams
//! camera poses plus one-shot "sync" calibration pings between them.
//!
//! ## Architecture
//!
//! ```text
//!  rendering layer
//!    │ broadcast_pose / broadcast_sync          ▲ SyncEvent
//!    ▼                                          │
//! ┌──────────────────┐   Envelope (JSON)   ┌────┴─────────────┐
//! │ SyncCoordinator  │ ──────────────────► │ dispatch task    │
//! │                  │                     │  decode, roster  │
//! └────────┬─────────┘                     └────▲─────────────┘
//!          │ send_to_all                        │ TransportEvent
//!          ▼                                    │
//! ┌──────────────────────────────────────────────┴───┐
//! │ SessionTransport                                 │
//! │  LanTransport: multicast beacons, WebSocket,     │
//! │                Noise NN per link                 │
//! │  MemoryTransport: in-process mesh                │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`pose`]: 4×4 camera transform
//! - [`protocol`]: JSON wire envelope (`update_ping` / `sync_ping`)
//! - [`directory`]: peer records and the connected roster
//! - [`transport`]: discovery, invitation and encrypted peer links
//! - [`coordinator`]: public API and event dispatch
//! - [`config`]: session configuration and validation

pub mod config;
pub mod coordinator;
pub mod directory;
pub mod pose;
pub mod protocol;
pub mod transport;

pub use config::{ConfigError, SessionConfig, DEFAULT_SERVICE_TYPE};
pub use coordinator::{SyncCoordinator, SyncEvent};
pub use directory::{PeerDirectory, PeerId, PeerRecord, PeerState};
pub use pose::Pose;
pub use protocol::{DecodeError, Envelope, MessageKind};
pub use transport::{
    DiscoveryError, LanTransport, MemoryMesh, MemoryTransport, SendError, SessionTransport,
    TransportEvent, TransportStats,
};
