//! Notifications pushed to a peer outside the request/response flow

use crate::types::{ConsumerId, ProducerId, RoomId, TransportId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PeerEvent {
    /// One of the peer's consumers was closed because its producer or transport went away
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },

    /// One of the peer's producers was closed by a transport teardown
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },

    /// The engine closed one of the peer's transports (DTLS failed or closed)
    #[serde(rename_all = "camelCase")]
    TransportClosed { transport_id: TransportId },

    /// The room is gone (worker died); the peer must send `createRoom` again
    #[serde(rename_all = "camelCase")]
    RejoinRequired { room_id: RoomId, reason: String },
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = PeerEvent::ConsumerClosed {
            consumer_id: ConsumerId::from("c1"),
            producer_id: ProducerId::from("p1"),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "event": "consumerClosed", "data": { "consumerId": "c1", "producerId": "p1" } })
        );
    }
}
