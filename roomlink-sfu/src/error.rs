use crate::engine::EngineError;
use thiserror::Error;

/// Failure of a signaling operation, reported back to the requesting peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    /// Transport exists but DTLS has not completed yet
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Ports, rooms or room seats ran out
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The worker hosting this room died, the peer must rejoin
    #[error("Media engine failure: {0}")]
    EngineFatal(String),

    /// Unknown id, foreign object, or request out of order
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

impl SfuError {
    /// Stable code sent on the wire
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotReady(_) => "notReady",
            Self::CapabilityMismatch(_) => "capabilityMismatch",
            Self::ResourceExhausted(_) => "resourceExhausted",
            Self::EngineFatal(_) => "engineFatal",
            Self::ProtocolViolation(_) => "protocolViolation",
            Self::Engine(_) => "internal",
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady(message.into())
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::PortsExhausted { .. } => Self::ResourceExhausted(err.to_string()),
            EngineError::WorkerDied(_) => Self::EngineFatal(err.to_string()),
            EngineError::UnsupportedCodec(_) => Self::CapabilityMismatch(err.to_string()),
            EngineError::Closed(_)
            | EngineError::ProducerNotFound(_)
            | EngineError::InvalidParameters(_) => Self::ProtocolViolation(err.to_string()),
            EngineError::Failed(_) => Self::Engine(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
