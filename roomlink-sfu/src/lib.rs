//! `RoomLink` SFU coordinator
//!
//! Signaling-side coordination for a selective forwarding unit. Peers join
//! rooms, negotiate WebRTC transports, publish producers and receive paused
//! consumers; packet forwarding itself is left to a media engine behind the
//! [`engine`] traits.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: media workers, round-robin router placement, death reports
//! - **`RoomRegistry`**: one room (and router) per room id, empty-room policy
//! - **`Room`**: arena of peers, transports, producers and consumers with close cascades
//! - **`TransportFsm`**: `created -> connecting -> connected -> closed`
//! - **`PeerSession`**: per-connection entry point used by the signaling layer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomlink_sfu::{LocalEngine, PeerSession, RoomRegistry, SfuConfig, WorkerPool};
//!
//! let config = SfuConfig::default();
//! let pool = WorkerPool::start(Arc::new(LocalEngine::new()), &config).await?;
//! let registry = RoomRegistry::new(Arc::new(config), pool);
//!
//! let (mut session, events) = PeerSession::new(registry, None);
//! let caps = session.create_room(None).await?;
//! ```

mod config;
pub mod engine;
mod error;
mod events;
mod registry;
mod room;
pub mod rtp;
mod session;
mod transport;
mod types;
mod worker_pool;

pub use config::{default_media_codecs, EmptyRoomPolicy, SfuConfig};
pub use engine::{EngineError, LocalEngine, LocalWorker, MediaEngine};
pub use error::{Result, SfuError};
pub use events::{PeerEvent, PeerEventReceiver, PeerEventSender};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{ConsumerInfo, ProducerInfo, Room, RoomStats, TransportInfo};
pub use session::PeerSession;
pub use transport::{TransportFsm, TransportState};
pub use types::{
    ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, RouterId, TransportId, WorkerId,
};
pub use worker_pool::{WorkerDeath, WorkerPool};
