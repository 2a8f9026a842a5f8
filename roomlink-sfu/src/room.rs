//! SFU Room management
//!
//! A room owns one router and an arena of everything negotiated inside it:
//! peers, transports, producers and consumers, all cross-referenced by id.
//! Mutation goes through a single short-lived lock per room. The lock is never
//! held across an engine call; results that come back after their parent was
//! torn down are closed on the spot.

use crate::config::SfuConfig;
use crate::engine::{
    EngineConsumer, EngineProducer, EngineRouter, EngineTransport, ListenIp,
    WebRtcTransportOptions,
};
use crate::error::{Result, SfuError};
use crate::events::{PeerEvent, PeerEventSender};
use crate::rtp::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, RtpCapabilities, RtpParameters,
};
use crate::transport::{DtlsOutcome, TransportFsm, TransportState};
use crate::types::{
    ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, RouterId, TransportId, WorkerId,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Answer to a transport creation request, relayed verbatim to the peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub transport_id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub peer_count: usize,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub created_at: DateTime<Utc>,
}

struct PeerEntry {
    events: PeerEventSender,
    send_transport: Option<TransportId>,
    recv_transports: Vec<TransportId>,
    /// Transports of this peer that were already torn down
    closed_transports: HashSet<TransportId>,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

struct TransportEntry {
    owner: PeerId,
    direction: Direction,
    fsm: TransportFsm,
    handle: Arc<dyn EngineTransport>,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

struct ProducerEntry {
    owner: PeerId,
    transport_id: TransportId,
    kind: MediaKind,
    handle: Arc<dyn EngineProducer>,
    consumers: Vec<ConsumerId>,
    seq: u64,
}

struct ConsumerEntry {
    owner: PeerId,
    transport_id: TransportId,
    producer_id: ProducerId,
    handle: Arc<dyn EngineConsumer>,
}

/// Engine objects to close once the room lock is released
#[derive(Default)]
struct Teardown {
    transports: Vec<Arc<dyn EngineTransport>>,
    producers: Vec<Arc<dyn EngineProducer>>,
    consumers: Vec<Arc<dyn EngineConsumer>>,
}

impl Teardown {
    fn run(self) {
        for consumer in self.consumers {
            consumer.close();
        }
        for producer in self.producers {
            producer.close();
        }
        for transport in self.transports {
            transport.close();
        }
    }
}

struct RoomState {
    closed: bool,
    invalidated: Option<String>,
    empty_since: Option<Instant>,
    next_seq: u64,
    peers: HashMap<PeerId, PeerEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

pub struct Room {
    id: RoomId,
    worker_id: WorkerId,
    router: Arc<dyn EngineRouter>,
    capabilities: RtpCapabilities,
    config: Arc<SfuConfig>,
    created_at: DateTime<Utc>,
    me: Weak<Room>,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(
        id: RoomId,
        worker_id: WorkerId,
        router: Arc<dyn EngineRouter>,
        config: Arc<SfuConfig>,
    ) -> Arc<Self> {
        let capabilities = router.rtp_capabilities();
        Arc::new_cyclic(|me| Self {
            id,
            worker_id,
            router,
            capabilities,
            config,
            created_at: Utc::now(),
            me: me.clone(),
            state: Mutex::new(RoomState {
                closed: false,
                invalidated: None,
                empty_since: Some(Instant::now()),
                next_seq: 0,
                peers: HashMap::new(),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            }),
        })
    }

    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    pub const fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn router_id(&self) -> &RouterId {
        self.router.id()
    }

    /// Router capabilities handed to peers on `createRoom`
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Reason the room was torn down by a worker death, if it was
    pub fn invalidation_reason(&self) -> Option<String> {
        self.state.lock().invalidated.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.state.lock().peers.contains_key(peer_id)
    }

    pub fn has_producer(&self) -> bool {
        !self.state.lock().producers.is_empty()
    }

    /// How long the room has had no peers
    pub fn empty_for(&self) -> Option<Duration> {
        self.state.lock().empty_since.map(|since| since.elapsed())
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Option<Arc<dyn EngineProducer>> {
        self.state
            .lock()
            .producers
            .get(producer_id)
            .map(|entry| Arc::clone(&entry.handle))
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<dyn EngineConsumer>> {
        self.state
            .lock()
            .consumers
            .get(consumer_id)
            .map(|entry| Arc::clone(&entry.handle))
    }

    pub fn transport_state(&self, transport_id: &TransportId) -> Option<TransportState> {
        self.state
            .lock()
            .transports
            .get(transport_id)
            .map(|entry| entry.fsm.state())
    }

    /// Producers of every peer except `except`, oldest first
    pub fn list_producers(&self, except: &PeerId) -> Vec<ProducerInfo> {
        let state = self.state.lock();
        let mut producers: Vec<_> = state
            .producers
            .iter()
            .filter(|(_, entry)| &entry.owner != except)
            .collect();
        producers.sort_by_key(|(_, entry)| entry.seq);
        producers
            .into_iter()
            .map(|(id, entry)| ProducerInfo {
                producer_id: id.clone(),
                peer_id: entry.owner.clone(),
                kind: entry.kind,
            })
            .collect()
    }

    pub fn stats(&self) -> RoomStats {
        let state = self.state.lock();
        let audio_producers = state
            .producers
            .values()
            .filter(|entry| entry.kind == MediaKind::Audio)
            .count();
        RoomStats {
            peer_count: state.peers.len(),
            transport_count: state.transports.len(),
            producer_count: state.producers.len(),
            consumer_count: state.consumers.len(),
            audio_producers,
            video_producers: state.producers.len() - audio_producers,
            created_at: self.created_at,
        }
    }

    /// Add a peer; `Ok(false)` means the room closed underneath and the caller should retry
    pub(crate) fn add_peer(&self, peer_id: &PeerId, events: PeerEventSender) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        if state.peers.contains_key(peer_id) {
            return Ok(true);
        }
        let max = self.config.max_peers_per_room;
        if max > 0 && state.peers.len() >= max {
            warn!(room_id = %self.id, max_peers = max, "Peer limit reached for room");
            return Err(SfuError::ResourceExhausted(format!(
                "room {} is full ({max} peers)",
                self.id
            )));
        }

        state.peers.insert(
            peer_id.clone(),
            PeerEntry {
                events,
                send_transport: None,
                recv_transports: Vec::new(),
                closed_transports: HashSet::new(),
                producers: Vec::new(),
                consumers: Vec::new(),
            },
        );
        state.empty_since = None;
        debug!(room_id = %self.id, peer_id = %peer_id, peers = state.peers.len(), "Peer joined room");
        Ok(true)
    }

    /// Remove a peer and everything it owns; returns whether the room is now empty
    pub(crate) fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let mut teardown = Teardown::default();
        let empty = {
            let mut state = self.state.lock();
            if let Some(peer) = state.peers.remove(peer_id) {
                let transports = peer.send_transport.into_iter().chain(peer.recv_transports);
                for transport_id in transports {
                    state.close_transport(&transport_id, &mut teardown);
                }
                debug!(room_id = %self.id, peer_id = %peer_id, peers = state.peers.len(), "Peer left room");
            }
            let empty = state.peers.is_empty();
            if empty && state.empty_since.is_none() {
                state.empty_since = Some(Instant::now());
            }
            empty
        };
        teardown.run();
        empty
    }

    /// Close the room if nobody is in it; returns whether the room is closed afterwards
    pub(crate) fn close_if_empty(&self) -> bool {
        {
            let state = self.state.lock();
            if state.closed {
                return true;
            }
            if !state.peers.is_empty() {
                return false;
            }
        }
        self.shutdown(None)
    }

    /// Tear the room down without notifying anybody
    pub fn close(&self) {
        self.shutdown(None);
    }

    /// Tear the room down after its worker died; every peer is told to rejoin
    pub(crate) fn invalidate(&self, reason: &str) {
        self.shutdown(Some(reason));
    }

    fn shutdown(&self, invalidated: Option<&str>) -> bool {
        let mut teardown = Teardown::default();
        {
            let mut state = self.state.lock();
            if state.closed {
                return true;
            }
            state.closed = true;
            if let Some(reason) = invalidated {
                state.invalidated = Some(reason.to_string());
                for peer in state.peers.values() {
                    let _ = peer.events.send(PeerEvent::RejoinRequired {
                        room_id: self.id.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
            state.peers.clear();
            let transport_ids: Vec<_> = state.transports.keys().cloned().collect();
            for transport_id in transport_ids {
                state.close_transport(&transport_id, &mut teardown);
            }
        }
        teardown.run();
        self.router.close();

        info!(
            room_id = %self.id,
            router_id = %self.router.id(),
            invalidated = invalidated.is_some(),
            "Room closed"
        );
        true
    }

    fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: self.config.listen_ip,
                announced_address: self.config.announced_address.clone(),
            }],
            enable_udp: self.config.enable_udp,
            enable_tcp: self.config.enable_tcp,
            prefer_udp: self.config.prefer_udp,
        }
    }

    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportInfo> {
        {
            let state = self.state.lock();
            state.ensure_open(&self.id)?;
            state.ensure_send_slot(peer_id, direction)?;
        }

        let handle = self
            .router
            .create_webrtc_transport(&self.transport_options())
            .await?;
        let transport_id = handle.id().clone();

        let registered = {
            let mut state = self.state.lock();
            state.ensure_open(&self.id).and_then(|()| {
                state.ensure_send_slot(peer_id, direction)?;
                state.transports.insert(
                    transport_id.clone(),
                    TransportEntry {
                        owner: peer_id.clone(),
                        direction,
                        fsm: TransportFsm::new(transport_id.clone()),
                        handle: Arc::clone(&handle),
                        producers: Vec::new(),
                        consumers: Vec::new(),
                    },
                );
                if let Some(peer) = state.peers.get_mut(peer_id) {
                    match direction {
                        Direction::Send => peer.send_transport = Some(transport_id.clone()),
                        Direction::Recv => peer.recv_transports.push(transport_id.clone()),
                    }
                }
                Ok(())
            })
        };
        if let Err(err) = registered {
            handle.close();
            return Err(err);
        }

        let room = self.me.clone();
        let id = transport_id.clone();
        handle.on_dtls_state_change(Arc::new(move |dtls| {
            if let Some(room) = room.upgrade() {
                room.on_dtls_state(&id, dtls);
            }
        }));

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            direction = %direction,
            "Transport created"
        );

        Ok(TransportInfo {
            transport_id,
            ice_parameters: handle.ice_parameters(),
            ice_candidates: handle.ice_candidates(),
            dtls_parameters: handle.dtls_parameters(),
        })
    }

    /// DTLS state report from the engine
    pub(crate) fn on_dtls_state(&self, transport_id: &TransportId, dtls: DtlsState) {
        let mut teardown = Teardown::default();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.transports.get_mut(transport_id) else {
                return;
            };
            match entry.fsm.on_dtls_state(dtls) {
                DtlsOutcome::Unchanged => {}
                DtlsOutcome::Advanced(new_state) => {
                    debug!(room_id = %self.id, transport_id = %transport_id, state = ?new_state, "Transport state changed");
                }
                DtlsOutcome::Close => {
                    let owner = entry.owner.clone();
                    state.close_transport(transport_id, &mut teardown);
                    state.notify(
                        &owner,
                        PeerEvent::TransportClosed {
                            transport_id: transport_id.clone(),
                        },
                    );
                    info!(room_id = %self.id, transport_id = %transport_id, dtls = ?dtls, "Transport closed by DTLS state");
                }
            }
        }
        teardown.run();
    }

    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        transport_id: Option<&TransportId>,
        dtls_parameters: DtlsParameters,
    ) -> Result<TransportId> {
        let (transport_id, handle) = {
            let mut state = self.state.lock();
            state.ensure_open(&self.id)?;
            let transport_id =
                state.resolve_transport(peer_id, direction, transport_id, TransportState::Created)?;
            let entry = state.transport_mut(&transport_id)?;
            entry.fsm.begin_connect()?;
            (transport_id, Arc::clone(&entry.handle))
        };

        match handle.connect(dtls_parameters).await {
            Ok(()) => {
                debug!(room_id = %self.id, peer_id = %peer_id, transport_id = %transport_id, "Transport connect accepted");
                Ok(transport_id)
            }
            Err(err) => {
                if let Some(entry) = self.state.lock().transports.get_mut(&transport_id) {
                    entry.fsm.abort_connect();
                }
                warn!(room_id = %self.id, transport_id = %transport_id, error = %err, "Transport connect failed");
                Err(err.into())
            }
        }
    }

    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: Option<&TransportId>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let (transport_id, handle) = {
            let state = self.state.lock();
            state.ensure_open(&self.id)?;
            let transport_id = state.resolve_transport(
                peer_id,
                Direction::Send,
                transport_id,
                TransportState::Connected,
            )?;
            let entry = state.transport(&transport_id)?;
            entry.fsm.require_connected()?;
            (transport_id, Arc::clone(&entry.handle))
        };

        if rtp_parameters.media_codecs().next().is_none() {
            return Err(SfuError::protocol("rtpParameters carry no media codec"));
        }
        if let Some(codec) = rtp_parameters
            .media_codecs()
            .find(|codec| MediaKind::from_mime_type(&codec.mime_type) != Some(kind))
        {
            return Err(SfuError::protocol(format!(
                "codec {} cannot carry {kind}",
                codec.mime_type
            )));
        }
        if !self.capabilities.supports_all(&rtp_parameters) {
            return Err(SfuError::CapabilityMismatch(format!(
                "room {} router does not support the offered codecs",
                self.id
            )));
        }

        let producer = handle.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().clone();

        let attached = {
            let mut state = self.state.lock();
            let usable = !state.closed
                && state.peers.contains_key(peer_id)
                && state
                    .transports
                    .get(&transport_id)
                    .is_some_and(|entry| !entry.fsm.is_closed());
            if usable {
                let seq = state.next_seq();
                state.producers.insert(
                    producer_id.clone(),
                    ProducerEntry {
                        owner: peer_id.clone(),
                        transport_id: transport_id.clone(),
                        kind,
                        handle: Arc::clone(&producer),
                        consumers: Vec::new(),
                        seq,
                    },
                );
                if let Some(entry) = state.transports.get_mut(&transport_id) {
                    entry.producers.push(producer_id.clone());
                }
                if let Some(peer) = state.peers.get_mut(peer_id) {
                    peer.producers.push(producer_id.clone());
                }
            }
            usable
        };
        if !attached {
            producer.close();
            return Err(SfuError::protocol(format!(
                "transport {transport_id} closed while the producer was being created"
            )));
        }

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: Option<&TransportId>,
        producer_id: Option<&ProducerId>,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let (transport_id, producer_id, handle) = {
            let state = self.state.lock();
            state.ensure_open(&self.id)?;
            let transport_id = state.resolve_transport(
                peer_id,
                Direction::Recv,
                transport_id,
                TransportState::Connected,
            )?;
            let entry = state.transport(&transport_id)?;
            entry.fsm.require_connected()?;

            let producer_id = match producer_id {
                Some(producer_id) if state.producers.contains_key(producer_id) => {
                    producer_id.clone()
                }
                Some(producer_id) => {
                    return Err(SfuError::protocol(format!(
                        "producer {producer_id} does not exist in room {}",
                        self.id
                    )));
                }
                None => state.default_producer(peer_id).ok_or_else(|| {
                    SfuError::protocol(format!("room {} has no producer to consume", self.id))
                })?,
            };

            let duplicate = entry.consumers.iter().any(|consumer_id| {
                state
                    .consumers
                    .get(consumer_id)
                    .is_some_and(|consumer| consumer.producer_id == producer_id)
            });
            if duplicate {
                return Err(SfuError::protocol(format!(
                    "producer {producer_id} is already consumed on transport {transport_id}"
                )));
            }

            if !self.router.can_consume(&producer_id, rtp_capabilities) {
                return Err(SfuError::CapabilityMismatch(format!(
                    "receiver capabilities cannot decode producer {producer_id}"
                )));
            }
            (transport_id, producer_id, Arc::clone(&entry.handle))
        };

        let consumer = handle.consume(&producer_id, rtp_capabilities, true).await?;
        let consumer_id = consumer.id().clone();

        let attached = {
            let mut state = self.state.lock();
            let usable = !state.closed
                && state.peers.contains_key(peer_id)
                && state.producers.contains_key(&producer_id)
                && state
                    .transports
                    .get(&transport_id)
                    .is_some_and(|entry| !entry.fsm.is_closed());
            if usable {
                state.consumers.insert(
                    consumer_id.clone(),
                    ConsumerEntry {
                        owner: peer_id.clone(),
                        transport_id: transport_id.clone(),
                        producer_id: producer_id.clone(),
                        handle: Arc::clone(&consumer),
                    },
                );
                if let Some(entry) = state.producers.get_mut(&producer_id) {
                    entry.consumers.push(consumer_id.clone());
                }
                if let Some(entry) = state.transports.get_mut(&transport_id) {
                    entry.consumers.push(consumer_id.clone());
                }
                if let Some(peer) = state.peers.get_mut(peer_id) {
                    peer.consumers.push(consumer_id.clone());
                }
            }
            usable
        };
        if !attached {
            consumer.close();
            return Err(SfuError::protocol(format!(
                "producer {producer_id} or transport {transport_id} closed while consuming"
            )));
        }

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );
        Ok(ConsumerInfo {
            id: consumer_id,
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Resume a paused consumer; `Ok(false)` when it was already running
    pub async fn resume(&self, peer_id: &PeerId, consumer_id: Option<&ConsumerId>) -> Result<bool> {
        let (consumer_id, handle) = {
            let state = self.state.lock();
            state.ensure_open(&self.id)?;
            let peer = state.peer(peer_id)?;
            let consumer_id = match consumer_id {
                Some(consumer_id) => consumer_id.clone(),
                None => peer.consumers.last().cloned().ok_or_else(|| {
                    SfuError::protocol("no consumer to resume; call consume first")
                })?,
            };
            let entry = state
                .consumers
                .get(&consumer_id)
                .filter(|entry| &entry.owner == peer_id)
                .ok_or_else(|| {
                    SfuError::protocol(format!(
                        "consumer {consumer_id} does not exist or belongs to another peer"
                    ))
                })?;
            state.transport(&entry.transport_id)?.fsm.require_connected()?;
            if !entry.handle.is_paused() {
                return Ok(false);
            }
            (consumer_id, Arc::clone(&entry.handle))
        };

        handle.resume().await?;
        info!(room_id = %self.id, peer_id = %peer_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(true)
    }

    pub fn close_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        let mut teardown = Teardown::default();
        {
            let mut state = self.state.lock();
            state.ensure_open(&self.id)?;
            if !state
                .producers
                .get(producer_id)
                .is_some_and(|entry| &entry.owner == peer_id)
            {
                return Err(SfuError::protocol(format!(
                    "producer {producer_id} does not exist or belongs to another peer"
                )));
            }
            state.close_producer(producer_id, &mut teardown);
        }
        teardown.run();
        info!(room_id = %self.id, peer_id = %peer_id, producer_id = %producer_id, "Producer closed");
        Ok(())
    }

    pub fn close_transport(&self, peer_id: &PeerId, transport_id: &TransportId) -> Result<()> {
        let mut teardown = Teardown::default();
        {
            let mut state = self.state.lock();
            state.ensure_open(&self.id)?;
            if !state
                .transports
                .get(transport_id)
                .is_some_and(|entry| &entry.owner == peer_id)
            {
                // close is terminal; repeating it on an own transport is a no-op
                if state
                    .peers
                    .get(peer_id)
                    .is_some_and(|peer| peer.closed_transports.contains(transport_id))
                {
                    debug!(room_id = %self.id, peer_id = %peer_id, transport_id = %transport_id, "Transport already closed");
                    return Ok(());
                }
                return Err(SfuError::protocol(format!(
                    "transport {transport_id} does not exist or belongs to another peer"
                )));
            }
            state.close_transport(transport_id, &mut teardown);
        }
        teardown.run();
        info!(room_id = %self.id, peer_id = %peer_id, transport_id = %transport_id, "Transport closed");
        Ok(())
    }
}

impl RoomState {
    fn ensure_open(&self, room_id: &RoomId) -> Result<()> {
        if let Some(reason) = &self.invalidated {
            return Err(SfuError::EngineFatal(format!(
                "room {room_id} was lost ({reason}); rejoin required"
            )));
        }
        if self.closed {
            return Err(SfuError::protocol(format!("room {room_id} is closed")));
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn peer(&self, peer_id: &PeerId) -> Result<&PeerEntry> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SfuError::protocol(format!("peer {peer_id} is not in this room")))
    }

    fn transport(&self, transport_id: &TransportId) -> Result<&TransportEntry> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| SfuError::protocol(format!("transport {transport_id} does not exist")))
    }

    fn transport_mut(&mut self, transport_id: &TransportId) -> Result<&mut TransportEntry> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| SfuError::protocol(format!("transport {transport_id} does not exist")))
    }

    /// A peer holds at most one live send transport
    fn ensure_send_slot(&self, peer_id: &PeerId, direction: Direction) -> Result<()> {
        let peer = self.peer(peer_id)?;
        if direction == Direction::Send && peer.send_transport.is_some() {
            return Err(SfuError::protocol(format!(
                "peer {peer_id} already has a send transport"
            )));
        }
        Ok(())
    }

    /// Resolve the transport a request applies to. Without an explicit id the
    /// peer's send transport is used, or for receiving the newest transport in
    /// `prefer` state (falling back to the newest one).
    fn resolve_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        explicit: Option<&TransportId>,
        prefer: TransportState,
    ) -> Result<TransportId> {
        let peer = self.peer(peer_id)?;

        if let Some(transport_id) = explicit {
            let entry = self
                .transports
                .get(transport_id)
                .filter(|entry| &entry.owner == peer_id)
                .ok_or_else(|| {
                    SfuError::protocol(format!(
                        "transport {transport_id} does not exist or belongs to another peer"
                    ))
                })?;
            if entry.direction != direction {
                return Err(SfuError::protocol(format!(
                    "transport {transport_id} is a {} transport, not {direction}",
                    entry.direction
                )));
            }
            return Ok(transport_id.clone());
        }

        match direction {
            Direction::Send => peer.send_transport.clone().ok_or_else(|| {
                SfuError::protocol("no send transport; call createSendTransport with sender=true")
            }),
            Direction::Recv => peer
                .recv_transports
                .iter()
                .rev()
                .find(|id| {
                    self.transports
                        .get(*id)
                        .is_some_and(|entry| entry.fsm.state() == prefer)
                })
                .or_else(|| peer.recv_transports.last())
                .cloned()
                .ok_or_else(|| {
                    SfuError::protocol(
                        "no receive transport; call createSendTransport with sender=false",
                    )
                }),
        }
    }

    /// Newest producer of another peer that `peer_id` does not consume yet
    fn default_producer(&self, peer_id: &PeerId) -> Option<ProducerId> {
        let consumed: Vec<&ProducerId> = self
            .peers
            .get(peer_id)
            .map(|peer| {
                peer.consumers
                    .iter()
                    .filter_map(|id| self.consumers.get(id))
                    .map(|consumer| &consumer.producer_id)
                    .collect()
            })
            .unwrap_or_default();

        self.producers
            .iter()
            .filter(|(id, entry)| &entry.owner != peer_id && !consumed.contains(id))
            .max_by_key(|(_, entry)| entry.seq)
            .map(|(id, _)| id.clone())
    }

    fn notify(&self, peer_id: &PeerId, event: PeerEvent) {
        if let Some(peer) = self.peers.get(peer_id) {
            // receiver gone means the connection is already tearing down
            let _ = peer.events.send(event);
        }
    }

    fn close_transport(&mut self, transport_id: &TransportId, teardown: &mut Teardown) {
        let Some(mut entry) = self.transports.remove(transport_id) else {
            return;
        };
        entry.fsm.close();
        for producer_id in std::mem::take(&mut entry.producers) {
            self.close_producer(&producer_id, teardown);
        }
        for consumer_id in std::mem::take(&mut entry.consumers) {
            self.close_consumer(&consumer_id, teardown);
        }
        if let Some(peer) = self.peers.get_mut(&entry.owner) {
            if peer.send_transport.as_ref() == Some(transport_id) {
                peer.send_transport = None;
            }
            peer.recv_transports.retain(|id| id != transport_id);
            peer.closed_transports.insert(transport_id.clone());
        }
        teardown.transports.push(entry.handle);
    }

    fn close_producer(&mut self, producer_id: &ProducerId, teardown: &mut Teardown) {
        let Some(entry) = self.producers.remove(producer_id) else {
            return;
        };
        for consumer_id in &entry.consumers {
            self.close_consumer(consumer_id, teardown);
        }
        if let Some(transport) = self.transports.get_mut(&entry.transport_id) {
            transport.producers.retain(|id| id != producer_id);
        }
        if let Some(peer) = self.peers.get_mut(&entry.owner) {
            peer.producers.retain(|id| id != producer_id);
        }
        self.notify(
            &entry.owner,
            PeerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            },
        );
        teardown.producers.push(entry.handle);
    }

    fn close_consumer(&mut self, consumer_id: &ConsumerId, teardown: &mut Teardown) {
        let Some(entry) = self.consumers.remove(consumer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&entry.transport_id) {
            transport.consumers.retain(|id| id != consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&entry.producer_id) {
            producer.consumers.retain(|id| id != consumer_id);
        }
        if let Some(peer) = self.peers.get_mut(&entry.owner) {
            peer.consumers.retain(|id| id != consumer_id);
        }
        self.notify(
            &entry.owner,
            PeerEvent::ConsumerClosed {
                consumer_id: consumer_id.clone(),
                producer_id: entry.producer_id.clone(),
            },
        );
        teardown.consumers.push(entry.handle);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::engine::{LocalEngine, MediaEngine, WorkerSettings};
    use crate::events::PeerEventReceiver;
    use crate::rtp::{CodecParameters, DtlsFingerprint, DtlsRole, RtpCodecParameters};
    use tokio::sync::mpsc;

    pub(crate) fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC".to_string(),
            }],
        }
    }

    pub(crate) fn vp8() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    async fn room() -> Arc<Room> {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
            })
            .await
            .unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        Room::new(
            RoomId::from("r1"),
            worker.id().clone(),
            router,
            Arc::new(SfuConfig::default()),
        )
    }

    fn join(room: &Room, name: &str) -> (PeerId, PeerEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_id = PeerId::from(name);
        assert!(room.add_peer(&peer_id, tx).unwrap());
        (peer_id, rx)
    }

    /// Peer with a connected send transport and one video producer
    async fn producing_peer(room: &Room, name: &str) -> (PeerId, PeerEventReceiver, TransportId, ProducerId) {
        let (peer, rx) = join(room, name);
        let transport = room.create_transport(&peer, Direction::Send).await.unwrap();
        room.connect_transport(&peer, Direction::Send, None, dtls())
            .await
            .unwrap();
        let producer = room
            .produce(&peer, None, MediaKind::Video, vp8())
            .await
            .unwrap();
        (peer, rx, transport.transport_id, producer)
    }

    /// Peer with a connected receive transport
    async fn receiving_peer(room: &Room, name: &str) -> (PeerId, PeerEventReceiver, TransportId) {
        let (peer, rx) = join(room, name);
        let transport = room.create_transport(&peer, Direction::Recv).await.unwrap();
        room.connect_transport(&peer, Direction::Recv, None, dtls())
            .await
            .unwrap();
        (peer, rx, transport.transport_id)
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let room = room().await;
        let (peer, _rx) = join(&room, "a");
        let transport = room.create_transport(&peer, Direction::Send).await.unwrap();
        assert_eq!(
            room.transport_state(&transport.transport_id),
            Some(TransportState::Created)
        );

        let err = room
            .produce(&peer, None, MediaKind::Video, vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotReady(_)));

        room.connect_transport(&peer, Direction::Send, None, dtls())
            .await
            .unwrap();
        assert_eq!(
            room.transport_state(&transport.transport_id),
            Some(TransportState::Connected)
        );
        assert!(room.produce(&peer, None, MediaKind::Video, vp8()).await.is_ok());
    }

    #[tokio::test]
    async fn test_single_send_transport_per_peer() {
        let room = room().await;
        let (peer, _rx) = join(&room, "a");
        room.create_transport(&peer, Direction::Send).await.unwrap();
        let err = room.create_transport(&peer, Direction::Send).await.unwrap_err();
        assert!(matches!(err, SfuError::ProtocolViolation(_)));
        // receive transports are unlimited
        room.create_transport(&peer, Direction::Recv).await.unwrap();
        room.create_transport(&peer, Direction::Recv).await.unwrap();
        assert_eq!(room.stats().transport_count, 3);
    }

    #[tokio::test]
    async fn test_consume_pairs_with_producer_and_starts_paused() {
        let room = room().await;
        let (_a, _arx, _, producer_id) = producing_peer(&room, "a").await;
        let (b, _brx, _) = receiving_peer(&room, "b").await;

        let info = room
            .consume(&b, None, None, &room.rtp_capabilities())
            .await
            .unwrap();
        assert_eq!(info.producer_id, producer_id);
        assert_eq!(info.kind, MediaKind::Video);

        let consumer = room.consumer(&info.id).unwrap();
        assert!(consumer.is_paused());
        assert!(!consumer.is_forwarding());

        assert!(room.resume(&b, None).await.unwrap());
        assert!(!room.resume(&b, Some(&info.id)).await.unwrap());
        assert!(consumer.is_forwarding());
    }

    #[tokio::test]
    async fn test_capability_mismatch_creates_nothing() {
        let room = room().await;
        producing_peer(&room, "a").await;
        let (b, _brx, _) = receiving_peer(&room, "b").await;

        let audio_only = RtpCapabilities {
            codecs: vec![room.rtp_capabilities().codecs[0].clone()],
            header_extensions: Vec::new(),
        };
        let err = room.consume(&b, None, None, &audio_only).await.unwrap_err();
        assert!(matches!(err, SfuError::CapabilityMismatch(_)));
        assert_eq!(room.stats().consumer_count, 0);
    }

    #[tokio::test]
    async fn test_consume_on_unconnected_transport_is_not_ready() {
        let room = room().await;
        producing_peer(&room, "a").await;
        let (b, _brx) = join(&room, "b");
        room.create_transport(&b, Direction::Recv).await.unwrap();
        let err = room
            .consume(&b, None, None, &room.rtp_capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_duplicate_consume_is_rejected() {
        let room = room().await;
        let (_a, _arx, _, producer_id) = producing_peer(&room, "a").await;
        let (b, _brx, _) = receiving_peer(&room, "b").await;
        let caps = room.rtp_capabilities();
        room.consume(&b, None, Some(&producer_id), &caps).await.unwrap();
        let err = room
            .consume(&b, None, Some(&producer_id), &caps)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_closing_send_transport_cascades() {
        let room = room().await;
        let (a, _arx, send_id, producer_id) = producing_peer(&room, "a").await;
        let (b, mut brx, _) = receiving_peer(&room, "b").await;
        let info = room
            .consume(&b, None, None, &room.rtp_capabilities())
            .await
            .unwrap();
        let producer = room.producer(&producer_id).unwrap();
        let consumer = room.consumer(&info.id).unwrap();

        room.close_transport(&a, &send_id).unwrap();

        assert!(producer.is_closed());
        assert!(consumer.is_closed());
        assert!(room.consumer(&info.id).is_none());
        assert!(room.producer(&producer_id).is_none());
        assert_eq!(
            brx.try_recv().unwrap(),
            PeerEvent::ConsumerClosed {
                consumer_id: info.id,
                producer_id,
            }
        );
        // closing again is a no-op for the owner
        assert!(room.close_transport(&a, &send_id).is_ok());
        assert!(brx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_after_dtls_closed_is_noop() {
        let room = room().await;
        let (a, _arx) = join(&room, "a");
        let (b, _brx) = join(&room, "b");
        let transport = room.create_transport(&a, Direction::Send).await.unwrap();
        let transport_id = transport.transport_id;
        room.connect_transport(&a, Direction::Send, None, dtls())
            .await
            .unwrap();

        room.on_dtls_state(&transport_id, DtlsState::Closed);
        assert!(room.transport_state(&transport_id).is_none());

        assert!(room.close_transport(&a, &transport_id).is_ok());
        // other peers and unknown ids still get a protocol error
        let err = room.close_transport(&b, &transport_id).unwrap_err();
        assert!(matches!(err, SfuError::ProtocolViolation(_)));
        let err = room
            .close_transport(&a, &TransportId::from("never-existed"))
            .unwrap_err();
        assert!(matches!(err, SfuError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_peer_removal_only_touches_its_objects() {
        let room = room().await;
        let (a, _arx, _, a_producer) = producing_peer(&room, "a").await;
        let (c, _crx, _, c_producer) = producing_peer(&room, "c").await;
        let (b, _brx, _) = receiving_peer(&room, "b").await;
        let caps = room.rtp_capabilities();
        let from_a = room.consume(&b, None, Some(&a_producer), &caps).await.unwrap();
        let from_c = room.consume(&b, None, Some(&c_producer), &caps).await.unwrap();

        assert!(!room.remove_peer(&a));

        assert!(room.producer(&a_producer).is_none());
        assert!(room.consumer(&from_a.id).is_none());
        assert!(room.producer(&c_producer).is_some());
        assert!(room.consumer(&from_c.id).is_some());
        assert!(room.has_peer(&b));
        assert!(room.has_peer(&c));
        assert!(!room.has_peer(&a));
        assert_eq!(room.list_producers(&b).len(), 1);
    }

    #[tokio::test]
    async fn test_dtls_failure_closes_transport_and_notifies_owner() {
        let room = room().await;
        let (a, mut arx, send_id, producer_id) = producing_peer(&room, "a").await;

        room.on_dtls_state(&send_id, DtlsState::Failed);

        assert!(room.transport_state(&send_id).is_none());
        assert!(room.producer(&producer_id).is_none());
        let mut events = Vec::new();
        while let Ok(event) = arx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&PeerEvent::TransportClosed {
            transport_id: send_id
        }));
        // the peer may open a new send transport afterwards
        assert!(room.create_transport(&a, Direction::Send).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_transport_is_rejected() {
        let room = room().await;
        let (_a, _arx, send_id, _) = producing_peer(&room, "a").await;
        let (b, _brx) = join(&room, "b");
        let err = room
            .produce(&b, Some(&send_id), MediaKind::Video, vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_invalidate_notifies_and_blocks() {
        let room = room().await;
        let (a, mut arx, _, _) = producing_peer(&room, "a").await;

        room.invalidate("worker died");

        assert!(matches!(
            arx.try_recv().unwrap(),
            PeerEvent::RejoinRequired { .. }
        ));
        assert!(room.is_closed());
        let err = room.create_transport(&a, Direction::Send).await.unwrap_err();
        assert!(matches!(err, SfuError::EngineFatal(_)));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!room.add_peer(&PeerId::from("late"), tx).unwrap());
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40001,
            })
            .await
            .unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let config = SfuConfig {
            max_peers_per_room: 1,
            ..Default::default()
        };
        let room = Room::new(RoomId::from("r"), worker.id().clone(), router, Arc::new(config));
        join(&room, "a");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            room.add_peer(&PeerId::from("b"), tx),
            Err(SfuError::ResourceExhausted(_))
        ));
    }

    /// Holds engine produce/consume results until released, so the room can
    /// be changed while a creation is in flight
    #[derive(Default)]
    struct Gate {
        enabled: std::sync::atomic::AtomicBool,
        parked: tokio::sync::Notify,
        release: tokio::sync::Notify,
        produced: Mutex<Option<Arc<dyn EngineProducer>>>,
        consumed: Mutex<Option<Arc<dyn EngineConsumer>>>,
    }

    impl Gate {
        fn enable(&self) {
            self.enabled.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        async fn hold(&self) {
            if self.enabled.load(std::sync::atomic::Ordering::SeqCst) {
                self.parked.notify_one();
                self.release.notified().await;
            }
        }
    }

    struct GatedRouter {
        inner: Arc<dyn EngineRouter>,
        gate: Arc<Gate>,
    }

    #[async_trait::async_trait]
    impl EngineRouter for GatedRouter {
        fn id(&self) -> &RouterId {
            self.inner.id()
        }

        fn rtp_capabilities(&self) -> RtpCapabilities {
            self.inner.rtp_capabilities()
        }

        fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
            self.inner.can_consume(producer_id, rtp_capabilities)
        }

        async fn create_webrtc_transport(
            &self,
            options: &WebRtcTransportOptions,
        ) -> crate::engine::EngineResult<Arc<dyn EngineTransport>> {
            let inner = self.inner.create_webrtc_transport(options).await?;
            Ok(Arc::new(GatedTransport {
                inner,
                gate: Arc::clone(&self.gate),
            }))
        }

        fn close(&self) {
            self.inner.close();
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    struct GatedTransport {
        inner: Arc<dyn EngineTransport>,
        gate: Arc<Gate>,
    }

    #[async_trait::async_trait]
    impl EngineTransport for GatedTransport {
        fn id(&self) -> &TransportId {
            self.inner.id()
        }

        fn ice_parameters(&self) -> IceParameters {
            self.inner.ice_parameters()
        }

        fn ice_candidates(&self) -> Vec<IceCandidate> {
            self.inner.ice_candidates()
        }

        fn dtls_parameters(&self) -> DtlsParameters {
            self.inner.dtls_parameters()
        }

        fn dtls_state(&self) -> DtlsState {
            self.inner.dtls_state()
        }

        async fn connect(&self, remote: DtlsParameters) -> crate::engine::EngineResult<()> {
            self.inner.connect(remote).await
        }

        async fn produce(
            &self,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
        ) -> crate::engine::EngineResult<Arc<dyn EngineProducer>> {
            let producer = self.inner.produce(kind, rtp_parameters).await?;
            *self.gate.produced.lock() = Some(Arc::clone(&producer));
            self.gate.hold().await;
            Ok(producer)
        }

        async fn consume(
            &self,
            producer_id: &ProducerId,
            rtp_capabilities: &RtpCapabilities,
            paused: bool,
        ) -> crate::engine::EngineResult<Arc<dyn EngineConsumer>> {
            let consumer = self
                .inner
                .consume(producer_id, rtp_capabilities, paused)
                .await?;
            *self.gate.consumed.lock() = Some(Arc::clone(&consumer));
            self.gate.hold().await;
            Ok(consumer)
        }

        fn on_dtls_state_change(&self, handler: crate::engine::DtlsStateHandler) {
            self.inner.on_dtls_state_change(handler);
        }

        fn close(&self) {
            self.inner.close();
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    async fn gated_room() -> (Arc<Room>, Arc<Gate>) {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
            })
            .await
            .unwrap();
        let inner = worker.create_router(&default_media_codecs()).await.unwrap();
        let gate = Arc::new(Gate::default());
        let router: Arc<dyn EngineRouter> = Arc::new(GatedRouter {
            inner,
            gate: Arc::clone(&gate),
        });
        let room = Room::new(
            RoomId::from("gated"),
            worker.id().clone(),
            router,
            Arc::new(SfuConfig::default()),
        );
        (room, gate)
    }

    #[tokio::test]
    async fn test_producer_finished_after_transport_close_is_discarded() {
        let (room, gate) = gated_room().await;
        let (a, _arx) = join(&room, "a");
        let transport_id = room
            .create_transport(&a, Direction::Send)
            .await
            .unwrap()
            .transport_id;
        room.connect_transport(&a, Direction::Send, None, dtls())
            .await
            .unwrap();
        gate.enable();

        let (result, ()) = tokio::join!(
            room.produce(&a, None, MediaKind::Video, vp8()),
            async {
                gate.parked.notified().await;
                room.close_transport(&a, &transport_id).unwrap();
                gate.release.notify_one();
            }
        );

        assert!(matches!(result, Err(SfuError::ProtocolViolation(_))));
        let producer = gate.produced.lock().take().unwrap();
        assert!(producer.is_closed());
        assert!(room.producer(producer.id()).is_none());
        assert_eq!(room.stats().producer_count, 0);
    }

    #[tokio::test]
    async fn test_consumer_finished_after_transport_close_is_discarded() {
        let (room, gate) = gated_room().await;
        let (_a, _arx, _, producer_id) = producing_peer(&room, "a").await;
        let (b, _brx, recv_id) = receiving_peer(&room, "b").await;
        gate.enable();

        let caps = room.rtp_capabilities();
        let (result, ()) = tokio::join!(
            room.consume(&b, None, Some(&producer_id), &caps),
            async {
                gate.parked.notified().await;
                room.close_transport(&b, &recv_id).unwrap();
                gate.release.notify_one();
            }
        );

        assert!(matches!(result, Err(SfuError::ProtocolViolation(_))));
        let consumer = gate.consumed.lock().take().unwrap();
        assert!(consumer.is_closed());
        assert!(room.consumer(consumer.id()).is_none());
        assert_eq!(room.stats().consumer_count, 0);
        // the producer itself is untouched
        assert!(room.producer(&producer_id).is_some());
    }
}
