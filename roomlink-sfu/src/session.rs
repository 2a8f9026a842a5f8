//! Peer session
//!
//! One session per signaling connection. It owns the peer id, the room the
//! peer joined (if any) and the event channel the room uses to reach the peer.
//! Every signaling operation enters the coordinator through here, so the room
//! id is threaded explicitly instead of living in process-wide state.

use crate::error::{Result, SfuError};
use crate::events::{PeerEvent, PeerEventReceiver, PeerEventSender};
use crate::registry::RoomRegistry;
use crate::room::{ConsumerInfo, ProducerInfo, Room, TransportInfo};
use crate::rtp::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct PeerSession {
    peer_id: PeerId,
    registry: Arc<RoomRegistry>,
    /// Room named in the connection URL, used when `createRoom` has no id
    room_hint: Option<RoomId>,
    room: Option<Arc<Room>>,
    events: PeerEventSender,
}

impl PeerSession {
    pub fn new(registry: Arc<RoomRegistry>, room_hint: Option<RoomId>) -> (Self, PeerEventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let peer_id = PeerId::random();
        debug!(peer_id = %peer_id, room_hint = ?room_hint, "Peer session created");
        (
            Self {
                peer_id,
                registry,
                room_hint,
                room: None,
                events,
            },
            receiver,
        )
    }

    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref().map(|room| room.id())
    }

    fn target_room(&self) -> RoomId {
        self.room_hint
            .clone()
            .unwrap_or_else(|| self.registry.config().default_room.clone())
    }

    /// Whether the room this connection targets already has a producer
    pub fn exists_producer(&self) -> bool {
        self.registry
            .get(&self.target_room())
            .is_some_and(|room| room.has_producer())
    }

    fn room(&self) -> Result<&Arc<Room>> {
        self.room
            .as_ref()
            .ok_or_else(|| SfuError::protocol("not in a room; call createRoom first"))
    }

    /// Join (creating if needed) a room and return its router capabilities.
    /// Repeating the call for the current room is a no-op.
    pub async fn create_room(&mut self, room_id: Option<RoomId>) -> Result<RtpCapabilities> {
        let room_id = room_id.unwrap_or_else(|| self.target_room());

        if let Some(current) = &self.room {
            if !current.is_closed() {
                if current.id() == &room_id {
                    return Ok(current.rtp_capabilities());
                }
                return Err(SfuError::protocol(format!(
                    "already in room {}; one room per connection",
                    current.id()
                )));
            }
            // the old room was invalidated, start over
            self.room = None;
        }

        let room = self
            .registry
            .join(&room_id, &self.peer_id, self.events.clone())
            .await?;
        let capabilities = room.rtp_capabilities();
        self.room = Some(room);
        Ok(capabilities)
    }

    pub fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        Ok(self.room()?.rtp_capabilities())
    }

    pub async fn create_transport(&self, sender: bool) -> Result<TransportInfo> {
        let direction = if sender { Direction::Send } else { Direction::Recv };
        self.room()?
            .create_transport(&self.peer_id, direction)
            .await
    }

    pub async fn connect_transport(
        &self,
        direction: Direction,
        transport_id: Option<&TransportId>,
        dtls_parameters: DtlsParameters,
    ) -> Result<TransportId> {
        self.room()?
            .connect_transport(&self.peer_id, direction, transport_id, dtls_parameters)
            .await
    }

    pub async fn produce(
        &self,
        transport_id: Option<&TransportId>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        self.room()?
            .produce(&self.peer_id, transport_id, kind, rtp_parameters)
            .await
    }

    pub async fn consume(
        &self,
        transport_id: Option<&TransportId>,
        producer_id: Option<&ProducerId>,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        self.room()?
            .consume(&self.peer_id, transport_id, producer_id, rtp_capabilities)
            .await
    }

    pub async fn resume(&self, consumer_id: Option<&ConsumerId>) -> Result<bool> {
        self.room()?.resume(&self.peer_id, consumer_id).await
    }

    pub fn list_producers(&self) -> Result<Vec<ProducerInfo>> {
        Ok(self.room()?.list_producers(&self.peer_id))
    }

    pub fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        self.room()?.close_producer(&self.peer_id, producer_id)
    }

    pub fn close_transport(&self, transport_id: &TransportId) -> Result<()> {
        self.room()?.close_transport(&self.peer_id, transport_id)
    }

    /// Bookkeeping for events on their way to the peer
    pub fn on_event(&mut self, event: &PeerEvent) {
        if let PeerEvent::RejoinRequired { room_id, reason } = event {
            if self.room_id() == Some(room_id) {
                info!(peer_id = %self.peer_id, room_id = %room_id, reason = %reason, "Room lost, peer must rejoin");
                self.room = None;
            }
        }
    }

    /// Leave the room, closing everything the peer owns
    pub fn disconnect(&mut self) {
        if let Some(room) = self.room.take() {
            self.registry.leave(&room, &self.peer_id);
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::engine::LocalEngine;
    use crate::room::tests::{dtls, vp8};
    use crate::worker_pool::WorkerPool;

    async fn registry() -> Arc<RoomRegistry> {
        let config = SfuConfig {
            num_workers: 1,
            ..Default::default()
        };
        let pool = WorkerPool::start(Arc::new(LocalEngine::new()), &config)
            .await
            .unwrap();
        RoomRegistry::new(Arc::new(config), pool)
    }

    #[tokio::test]
    async fn test_requests_before_create_room_are_rejected() {
        let registry = registry().await;
        let (session, _events) = PeerSession::new(registry, None);
        assert!(matches!(
            session.create_transport(true).await,
            Err(SfuError::ProtocolViolation(_))
        ));
        assert!(matches!(
            session.rtp_capabilities(),
            Err(SfuError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_room_uses_hint_and_is_idempotent() {
        let registry = registry().await;
        let (mut session, _events) = PeerSession::new(Arc::clone(&registry), Some(RoomId::from("lobby")));

        let first = session.create_room(None).await.unwrap();
        assert_eq!(session.room_id(), Some(&RoomId::from("lobby")));
        let second = session.create_room(Some(RoomId::from("lobby"))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.routers_created(), 1);

        assert!(matches!(
            session.create_room(Some(RoomId::from("other"))).await,
            Err(SfuError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_exists_producer_and_drop_cleanup() {
        let registry = registry().await;
        let (mut a, _a_events) = PeerSession::new(Arc::clone(&registry), None);
        let (observer, _o_events) = PeerSession::new(Arc::clone(&registry), None);
        assert!(!observer.exists_producer());

        a.create_room(None).await.unwrap();
        a.create_transport(true).await.unwrap();
        a.connect_transport(Direction::Send, None, dtls()).await.unwrap();
        a.produce(None, MediaKind::Video, vp8()).await.unwrap();
        assert!(observer.exists_producer());

        drop(a);
        assert!(!observer.exists_producer());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_invalidation() {
        let registry = registry().await;
        let (mut session, _events) = PeerSession::new(Arc::clone(&registry), None);
        session.create_room(None).await.unwrap();
        let room_id = session.room_id().cloned().unwrap();
        let worker_id = registry.get(&room_id).unwrap().worker_id().clone();

        registry.invalidate_worker(&worker_id, "test");
        assert!(matches!(
            session.create_transport(true).await,
            Err(SfuError::EngineFatal(_))
        ));

        session.on_event(&PeerEvent::RejoinRequired {
            room_id: room_id.clone(),
            reason: "test".to_string(),
        });
        assert!(session.room_id().is_none());
        // the worker itself is still alive, so a fresh room can be built on it
        session.create_room(None).await.unwrap();
        assert!(session.create_transport(true).await.is_ok());
    }
}
