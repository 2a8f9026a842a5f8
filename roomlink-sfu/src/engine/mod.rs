//! Media engine adapter
//!
//! The coordinator never touches media packets. Everything it needs from the
//! engine (workers, routers, WebRTC transports, producers, consumers and their
//! lifecycle events) goes through the traits below. All allocation is async and
//! fallible; closing is synchronous and idempotent so it can run from cleanup
//! paths and `Drop`.
//!
//! [`LocalEngine`] is the in-process implementation used by the server binary
//! and the tests.

mod local;

pub use local::{LocalEngine, LocalWorker};

use crate::rtp::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, RtpCapabilities, RtpCodecCapability,
    RtpParameters,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No free RTC port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Worker {0} died")]
    WorkerDied(WorkerId),

    #[error("{0} is closed")]
    Closed(String),

    #[error("Producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Failed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Settings applied to every worker in the pool
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Debug, Clone)]
pub struct ListenIp {
    pub ip: IpAddr,
    pub announced_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

pub type DtlsStateHandler = Arc<dyn Fn(DtlsState) + Send + Sync>;
pub type WorkerDiedHandler = Box<dyn FnOnce(String) + Send>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn EngineWorker>>;
}

#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn id(&self) -> &WorkerId;

    fn is_alive(&self) -> bool;

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn EngineRouter>>;

    /// Called once if the worker dies unexpectedly (never on `close`)
    fn on_died(&self, handler: WorkerDiedHandler);

    fn close(&self);
}

#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> &RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Capability intersection test between a live producer and a receiver
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    fn dtls_state(&self) -> DtlsState;

    /// Hand the remote DTLS parameters to the engine and start the handshake
    async fn connect(&self, remote: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>>;

    fn on_dtls_state_change(&self, handler: DtlsStateHandler);

    /// Closes the transport and every producer and consumer created on it
    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Closes the producer and every consumer fed by it
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    /// Start forwarding; resuming a running consumer is a no-op
    async fn resume(&self) -> EngineResult<()>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Whether the engine is currently sending packets to the receiver
    fn is_forwarding(&self) -> bool {
        !self.is_paused() && !self.is_closed()
    }
}
