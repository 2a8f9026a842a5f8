//! In-process media engine
//!
//! Performs everything the coordinator observes from a media engine: port
//! accounting per worker, ICE/DTLS parameter generation, the DTLS state
//! sequence on connect, producer/consumer bookkeeping with close cascades,
//! capability intersection and worker death. It does not move RTP.

use super::{
    DtlsStateHandler, EngineConsumer, EngineError, EngineProducer, EngineResult, EngineRouter,
    EngineTransport, EngineWorker, MediaEngine, WebRtcTransportOptions, WorkerDiedHandler,
    WorkerSettings,
};
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    TransportProtocol,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// First dynamic payload type handed to router codecs without a preference
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// In-process media engine
#[derive(Default)]
pub struct LocalEngine {
    workers: Mutex<Vec<Weak<LocalWorker>>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers created by this engine that are still referenced
    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        let mut workers = self.workers.lock();
        workers.retain(|worker| worker.strong_count() > 0);
        workers.iter().filter_map(Weak::upgrade).collect()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn EngineWorker>> {
        if settings.rtc_min_port == 0 || settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::InvalidParameters(format!(
                "invalid RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let worker = Arc::new(LocalWorker {
            id: WorkerId::generate(),
            ports: Arc::new(PortAllocator::new(settings.rtc_min_port, settings.rtc_max_port)),
            alive: AtomicBool::new(true),
            routers: Mutex::new(Vec::new()),
            died_handlers: Mutex::new(Vec::new()),
        });
        self.workers.lock().push(Arc::downgrade(&worker));

        info!(
            worker_id = %worker.id,
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Media worker created"
        );
        Ok(worker)
    }
}

struct PortAllocator {
    min: u16,
    max: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    const fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate(&self) -> EngineResult<u16> {
        let mut used = self.used.lock();
        let port = (self.min..=self.max)
            .find(|port| !used.contains(port))
            .ok_or(EngineError::PortsExhausted {
                min: self.min,
                max: self.max,
            })?;
        used.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.used.lock().remove(&port);
    }

    fn in_use(&self) -> usize {
        self.used.lock().len()
    }
}

pub struct LocalWorker {
    id: WorkerId,
    ports: Arc<PortAllocator>,
    alive: AtomicBool,
    routers: Mutex<Vec<Arc<LocalRouter>>>,
    died_handlers: Mutex<Vec<WorkerDiedHandler>>,
}

impl LocalWorker {
    /// Simulate an unexpected worker crash: routers die with it and the
    /// `on_died` handlers fire.
    pub fn kill(&self, reason: impl Into<String>) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        warn!(worker_id = %self.id, reason = %reason, "Media worker died");

        self.close_routers();
        let handlers = std::mem::take(&mut *self.died_handlers.lock());
        for handler in handlers {
            handler(reason.clone());
        }
    }

    pub fn router_count(&self) -> usize {
        self.routers
            .lock()
            .iter()
            .filter(|router| !router.is_closed())
            .count()
    }

    /// Number of RTC ports currently held by transports on this worker
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }

    fn close_routers(&self) {
        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers {
            router.close();
        }
    }
}

#[async_trait]
impl EngineWorker for LocalWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn EngineRouter>> {
        if !self.is_alive() {
            return Err(EngineError::WorkerDied(self.id.clone()));
        }

        let capabilities = router_capabilities(media_codecs)?;
        let router = Arc::new_cyclic(|me| LocalRouter {
            id: RouterId::generate(),
            capabilities,
            ports: Arc::clone(&self.ports),
            me: me.clone(),
            closed: AtomicBool::new(false),
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
        });

        {
            let mut routers = self.routers.lock();
            routers.retain(|existing| !existing.is_closed());
            routers.push(Arc::clone(&router));
        }

        debug!(worker_id = %self.id, router_id = %router.id, "Router created");
        Ok(router)
    }

    fn on_died(&self, handler: WorkerDiedHandler) {
        if self.is_alive() {
            self.died_handlers.lock().push(handler);
        }
    }

    fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.died_handlers.lock().clear();
            self.close_routers();
            debug!(worker_id = %self.id, "Media worker closed");
        }
    }
}

/// Fill in payload types and validate kinds for the router codec set
fn router_capabilities(media_codecs: &[RtpCodecCapability]) -> EngineResult<RtpCapabilities> {
    let mut taken: BTreeSet<u8> = media_codecs
        .iter()
        .filter_map(|codec| codec.preferred_payload_type)
        .collect();
    let mut next = FIRST_DYNAMIC_PAYLOAD_TYPE;
    let mut codecs = Vec::with_capacity(media_codecs.len());

    for codec in media_codecs {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
            return Err(EngineError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                codec.mime_type, codec.kind
            )));
        }

        let mut codec = codec.clone();
        if codec.preferred_payload_type.is_none() {
            while taken.contains(&next) {
                next = next
                    .checked_add(1)
                    .filter(|pt| *pt < 128)
                    .ok_or_else(|| EngineError::InvalidParameters("out of payload types".into()))?;
            }
            taken.insert(next);
            codec.preferred_payload_type = Some(next);
        }
        codecs.push(codec);
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: Vec::new(),
    })
}

pub struct LocalRouter {
    id: RouterId,
    capabilities: RtpCapabilities,
    ports: Arc<PortAllocator>,
    me: Weak<LocalRouter>,
    closed: AtomicBool,
    transports: Mutex<HashMap<TransportId, Arc<LocalTransport>>>,
    producers: Mutex<HashMap<ProducerId, Arc<LocalProducer>>>,
}

impl LocalRouter {
    fn live_producer(&self, producer_id: &ProducerId) -> Option<Arc<LocalProducer>> {
        self.producers
            .lock()
            .get(producer_id)
            .filter(|producer| !producer.is_closed())
            .cloned()
    }
}

#[async_trait]
impl EngineRouter for LocalRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.live_producer(producer_id)
            .is_some_and(|producer| rtp_capabilities.supports_any(&producer.rtp_parameters))
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        if self.is_closed() {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        if options.listen_ips.is_empty() || (!options.enable_udp && !options.enable_tcp) {
            return Err(EngineError::InvalidParameters(
                "transport needs a listen address and a protocol".into(),
            ));
        }

        let port = self.ports.allocate()?;
        let transport = Arc::new(LocalTransport {
            id: TransportId::generate(),
            router: self.me.clone(),
            ports: Arc::clone(&self.ports),
            port,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: ice_candidates(options, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![local_fingerprint()],
            },
            inner: Mutex::new(TransportInner {
                dtls_state: DtlsState::New,
                closed: false,
                producers: Vec::new(),
                consumers: Vec::new(),
                next_mid: 0,
            }),
            handlers: Mutex::new(Vec::new()),
        });

        self.transports
            .lock()
            .insert(transport.id.clone(), Arc::clone(&transport));
        if self.is_closed() {
            transport.close();
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }

        debug!(router_id = %self.id, transport_id = %transport.id, port, "WebRTC transport created");
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = self.transports.lock().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.close();
        }
        self.producers.lock().clear();
        debug!(router_id = %self.id, "Router closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn random_token(len: usize) -> String {
    let mut token = String::with_capacity(len);
    while token.len() < len {
        token.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    token.truncate(len);
    token
}

fn local_fingerprint() -> DtlsFingerprint {
    let digest = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
    let value = digest
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

fn ice_candidates(options: &WebRtcTransportOptions, port: u16) -> Vec<IceCandidate> {
    // Host candidate priorities: the preferred protocol gets the higher one
    let (udp_priority, tcp_priority) = if options.prefer_udp {
        (1_076_302_079, 1_076_276_479)
    } else {
        (1_076_276_479, 1_076_302_079)
    };

    let mut candidates = Vec::new();
    for listen in &options.listen_ips {
        let address = listen
            .announced_address
            .clone()
            .unwrap_or_else(|| listen.ip.to_string());
        if options.enable_udp {
            candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                address: address.clone(),
                port,
                protocol: TransportProtocol::Udp,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                address,
                port,
                protocol: TransportProtocol::Tcp,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }
    }
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    candidates
}

struct TransportInner {
    dtls_state: DtlsState,
    closed: bool,
    producers: Vec<Arc<LocalProducer>>,
    consumers: Vec<Arc<LocalConsumer>>,
    next_mid: u32,
}

pub struct LocalTransport {
    id: TransportId,
    router: Weak<LocalRouter>,
    ports: Arc<PortAllocator>,
    port: u16,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    inner: Mutex<TransportInner>,
    handlers: Mutex<Vec<DtlsStateHandler>>,
}

impl LocalTransport {
    fn set_dtls_state(&self, state: DtlsState) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.dtls_state = state;
        }
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler(state);
        }
    }

    fn router(&self) -> EngineResult<Arc<LocalRouter>> {
        self.router
            .upgrade()
            .filter(|router| !router.is_closed())
            .ok_or_else(|| EngineError::Closed(format!("router of transport {}", self.id)))
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.inner.lock().closed {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn dtls_state(&self) -> DtlsState {
        self.inner.lock().dtls_state
    }

    async fn connect(&self, remote: DtlsParameters) -> EngineResult<()> {
        {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(EngineError::Closed(format!("transport {}", self.id)));
            }
            if inner.dtls_state != DtlsState::New {
                return Err(EngineError::InvalidParameters(format!(
                    "transport {} already connected",
                    self.id
                )));
            }
        }
        if remote.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "remote DTLS parameters carry no fingerprint".into(),
            ));
        }

        self.set_dtls_state(DtlsState::Connecting);
        self.set_dtls_state(DtlsState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        self.ensure_open()?;
        let router = self.router()?;

        if rtp_parameters.media_codecs().next().is_none() {
            return Err(EngineError::InvalidParameters("no media codecs given".into()));
        }
        if let Some(codec) = rtp_parameters
            .media_codecs()
            .find(|codec| MediaKind::from_mime_type(&codec.mime_type) != Some(kind))
        {
            return Err(EngineError::InvalidParameters(format!(
                "codec {} cannot carry {kind}",
                codec.mime_type
            )));
        }
        if !router.capabilities.supports_all(&rtp_parameters) {
            let mimes: Vec<_> = rtp_parameters
                .media_codecs()
                .map(|codec| codec.mime_type.as_str())
                .collect();
            return Err(EngineError::UnsupportedCodec(mimes.join(", ")));
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&router),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        });
        router
            .producers
            .lock()
            .insert(producer.id.clone(), Arc::clone(&producer));

        let attached = {
            let mut inner = self.inner.lock();
            if inner.closed {
                false
            } else {
                inner.producers.push(Arc::clone(&producer));
                true
            }
        };
        if !attached {
            producer.close();
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }

        debug!(transport_id = %self.id, producer_id = %producer.id, kind = %kind, "Producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        self.ensure_open()?;
        let router = self.router()?;
        let producer = router
            .live_producer(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;

        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .media_codecs()
            .filter_map(|codec| {
                rtp_capabilities.find_codec(codec).map(|capability| RtpCodecParameters {
                    payload_type: capability.preferred_payload_type.unwrap_or(codec.payload_type),
                    ..codec.clone()
                })
            })
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::UnsupportedCodec(format!(
                "receiver cannot decode producer {producer_id}"
            )));
        }

        let mid = {
            let mut inner = self.inner.lock();
            let mid = inner.next_mid;
            inner.next_mid += 1;
            mid
        };
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(uuid::Uuid::new_v4().as_u128() as u32),
                ..Default::default()
            }],
            rtcp: producer.rtp_parameters.rtcp.clone(),
        };

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });

        if !producer.attach(&consumer) {
            consumer.close();
            return Err(EngineError::ProducerNotFound(producer_id.clone()));
        }
        let attached = {
            let mut inner = self.inner.lock();
            if inner.closed {
                false
            } else {
                inner.consumers.push(Arc::clone(&consumer));
                true
            }
        };
        if !attached {
            consumer.close();
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }

        debug!(
            transport_id = %self.id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            paused,
            "Consumer created"
        );
        Ok(consumer)
    }

    fn on_dtls_state_change(&self, handler: DtlsStateHandler) {
        self.handlers.lock().push(handler);
    }

    fn close(&self) {
        let (producers, consumers) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.dtls_state = DtlsState::Closed;
            (
                std::mem::take(&mut inner.producers),
                std::mem::take(&mut inner.consumers),
            )
        };
        self.handlers.lock().clear();

        for producer in producers {
            producer.close();
        }
        for consumer in consumers {
            consumer.close();
        }
        self.ports.release(self.port);
        if let Some(router) = self.router.upgrade() {
            router.transports.lock().remove(&self.id);
        }
        debug!(transport_id = %self.id, "WebRTC transport closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<LocalRouter>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalProducer {
    fn attach(&self, consumer: &Arc<LocalConsumer>) -> bool {
        let mut consumers = self.consumers.lock();
        if self.is_closed() {
            return false;
        }
        consumers.push(Arc::clone(consumer));
        true
    }
}

impl EngineProducer for LocalProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn close(&self) {
        let consumers = {
            let mut consumers = self.consumers.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *consumers)
        };
        for consumer in consumers {
            consumer.close();
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.lock().remove(&self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
