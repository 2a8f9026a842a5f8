//! Transport negotiation state machine
//!
//! ```text
//! created --connect--> connecting --dtls connected--> connected
//!    \                     |                               |
//!     +---------------- closed <----- close / dtls failed -+
//! ```
//!
//! Only a connected transport may carry produce, consume or resume. Requests
//! that arrive earlier fail with `NotReady` instead of waiting.

use crate::error::{Result, SfuError};
use crate::rtp::DtlsState;
use crate::types::TransportId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// What the owner of the state machine has to do after a DTLS report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsOutcome {
    /// Nothing changed
    Unchanged,
    /// State advanced, nothing else to do
    Advanced(TransportState),
    /// The engine lost the DTLS session, the transport must be torn down
    Close,
}

#[derive(Debug)]
pub struct TransportFsm {
    id: TransportId,
    state: TransportState,
}

impl TransportFsm {
    #[must_use]
    pub const fn new(id: TransportId) -> Self {
        Self {
            id,
            state: TransportState::Created,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TransportState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == TransportState::Closed
    }

    /// Remote DTLS parameters received: `created -> connecting`
    pub fn begin_connect(&mut self) -> Result<()> {
        match self.state {
            TransportState::Created => {
                self.state = TransportState::Connecting;
                Ok(())
            }
            TransportState::Connecting | TransportState::Connected => Err(SfuError::protocol(
                format!("transport {} is already connecting or connected", self.id),
            )),
            TransportState::Closed => Err(self.closed_error()),
        }
    }

    /// The engine rejected the remote parameters, the peer may try again
    pub fn abort_connect(&mut self) {
        if self.state == TransportState::Connecting {
            self.state = TransportState::Created;
        }
    }

    pub fn on_dtls_state(&mut self, dtls: DtlsState) -> DtlsOutcome {
        match (self.state, dtls) {
            (TransportState::Closed, _) | (_, DtlsState::New) => DtlsOutcome::Unchanged,
            (_, DtlsState::Failed | DtlsState::Closed) => DtlsOutcome::Close,
            (TransportState::Created, DtlsState::Connecting) => {
                self.state = TransportState::Connecting;
                DtlsOutcome::Advanced(self.state)
            }
            (TransportState::Created | TransportState::Connecting, DtlsState::Connected) => {
                self.state = TransportState::Connected;
                DtlsOutcome::Advanced(self.state)
            }
            _ => DtlsOutcome::Unchanged,
        }
    }

    /// Gate for produce, consume and resume
    pub fn require_connected(&self) -> Result<()> {
        match self.state {
            TransportState::Connected => Ok(()),
            TransportState::Created | TransportState::Connecting => Err(SfuError::not_ready(
                format!("transport {} is {}", self.id, self.state_name()),
            )),
            TransportState::Closed => Err(self.closed_error()),
        }
    }

    /// Terminal and idempotent; returns whether this call closed it
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = TransportState::Closed;
        true
    }

    const fn state_name(&self) -> &'static str {
        match self.state {
            TransportState::Created => "not connected yet",
            TransportState::Connecting => "still connecting",
            TransportState::Connected => "connected",
            TransportState::Closed => "closed",
        }
    }

    fn closed_error(&self) -> SfuError {
        SfuError::protocol(format!("transport {} is closed", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm() -> TransportFsm {
        TransportFsm::new(TransportId::from("t1"))
    }

    #[test]
    fn test_happy_path() {
        let mut fsm = fsm();
        assert_eq!(fsm.state(), TransportState::Created);
        fsm.begin_connect().unwrap();
        assert_eq!(fsm.state(), TransportState::Connecting);
        assert_eq!(
            fsm.on_dtls_state(DtlsState::Connecting),
            DtlsOutcome::Unchanged
        );
        assert_eq!(
            fsm.on_dtls_state(DtlsState::Connected),
            DtlsOutcome::Advanced(TransportState::Connected)
        );
        assert!(fsm.require_connected().is_ok());
    }

    #[test]
    fn test_not_ready_before_connected() {
        let mut fsm = fsm();
        assert!(matches!(fsm.require_connected(), Err(SfuError::NotReady(_))));
        fsm.begin_connect().unwrap();
        assert!(matches!(fsm.require_connected(), Err(SfuError::NotReady(_))));
    }

    #[test]
    fn test_double_connect_is_a_protocol_violation() {
        let mut fsm = fsm();
        fsm.begin_connect().unwrap();
        assert!(matches!(
            fsm.begin_connect(),
            Err(SfuError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_abort_connect_allows_retry() {
        let mut fsm = fsm();
        fsm.begin_connect().unwrap();
        fsm.abort_connect();
        assert_eq!(fsm.state(), TransportState::Created);
        assert!(fsm.begin_connect().is_ok());
    }

    #[test]
    fn test_dtls_failure_requests_close() {
        let mut fsm = fsm();
        fsm.begin_connect().unwrap();
        fsm.on_dtls_state(DtlsState::Connected);
        assert_eq!(fsm.on_dtls_state(DtlsState::Failed), DtlsOutcome::Close);
        assert_eq!(fsm.on_dtls_state(DtlsState::Closed), DtlsOutcome::Close);
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let mut fsm = fsm();
        assert!(fsm.close());
        assert!(!fsm.close());
        assert_eq!(fsm.on_dtls_state(DtlsState::Connected), DtlsOutcome::Unchanged);
        assert!(matches!(
            fsm.require_connected(),
            Err(SfuError::ProtocolViolation(_))
        ));
        assert!(fsm.begin_connect().is_err());
    }
}
