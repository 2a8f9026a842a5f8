//! Signaling wire protocol
//!
//! Requests: `{ "id": 7, "method": "createRoom", "roomId": "r1" }`
//! Responses: `{ "id": 7, "ok": true, "data": { ... } }` or
//! `{ "id": 7, "ok": false, "error": { "code": "notReady", "message": "..." } }`
//! Events: `{ "event": "consumerClosed", "data": { ... } }`

use roomlink_sfu::rtp::{DtlsParameters, RtpCapabilities, RtpParameters};
use roomlink_sfu::{
    ConsumerId, MediaKind, PeerEvent, PeerId, ProducerId, ProducerInfo, RoomId, SfuError,
    TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(default)]
        room_id: Option<RoomId>,
    },

    GetRouterRtpCapabilities,

    /// `sender: true` opens the send transport, `false` a receive transport
    CreateSendTransport { sender: bool },

    #[serde(rename_all = "camelCase")]
    TransportConnect {
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },

    #[serde(rename_all = "camelCase")]
    TransportProduce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },

    #[serde(rename_all = "camelCase")]
    TransportRecvConnect {
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },

    #[serde(rename_all = "camelCase")]
    Consume {
        rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        producer_id: Option<ProducerId>,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerResume {
        #[serde(default)]
        consumer_id: Option<ConsumerId>,
    },

    ListProducers,

    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    CloseTransport { transport_id: TransportId },
}

impl Request {
    /// Wire name, for logs
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "createRoom",
            Self::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Self::CreateSendTransport { .. } => "createSendTransport",
            Self::TransportConnect { .. } => "transportConnect",
            Self::TransportProduce { .. } => "transportProduce",
            Self::TransportRecvConnect { .. } => "transportRecvConnect",
            Self::Consume { .. } => "consume",
            Self::ConsumerResume { .. } => "consumerResume",
            Self::ListProducers => "listProducers",
            Self::CloseProducer { .. } => "closeProducer",
            Self::CloseTransport { .. } => "closeTransport",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    #[must_use]
    pub const fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: u64, err: &SfuError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(err.into()),
        }
    }
}

/// Events owned by the connection itself rather than a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess {
        peer_id: PeerId,
        exists_producer: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Session(SessionEvent),
    Peer(PeerEvent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesData {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerIdData {
    pub producer_id: ProducerId,
}

#[derive(Debug, Serialize)]
pub struct ProducersData {
    pub producers: Vec<ProducerInfo>,
}

/// A frame that could not be turned into a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DecodeError {
    /// Request id if one could be read from the frame, 0 otherwise
    pub id: u64,
    pub message: String,
}

pub struct JsonCodec;

impl JsonCodec {
    pub fn decode_request(frame: &str) -> Result<ClientRequest, DecodeError> {
        let value: Value = serde_json::from_str(frame).map_err(|e| DecodeError {
            id: 0,
            message: format!("Malformed JSON: {e}"),
        })?;
        let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);

        serde_json::from_value(value).map_err(|e| DecodeError {
            id,
            message: format!("Invalid request: {e}"),
        })
    }

    pub fn encode_server_message(message: &ServerMessage) -> Result<String, String> {
        serde_json::to_string(message).map_err(|e| format!("Failed to encode message: {e}"))
    }

    pub fn decode_server_message(frame: &str) -> Result<ServerMessage, String> {
        serde_json::from_str(frame).map_err(|e| format!("Failed to decode message: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_request_variants() {
        let req = JsonCodec::decode_request(r#"{"id":1,"method":"createRoom","roomId":"r1"}"#).unwrap();
        assert_eq!(req.id, 1);
        assert!(matches!(
            req.request,
            Request::CreateRoom { room_id: Some(ref id) } if id.as_str() == "r1"
        ));

        let req = JsonCodec::decode_request(r#"{"id":2,"method":"createRoom"}"#).unwrap();
        assert!(matches!(req.request, Request::CreateRoom { room_id: None }));

        let req = JsonCodec::decode_request(r#"{"id":3,"method":"createSendTransport","sender":false}"#)
            .unwrap();
        assert!(matches!(req.request, Request::CreateSendTransport { sender: false }));

        let req = JsonCodec::decode_request(r#"{"id":4,"method":"listProducers"}"#).unwrap();
        assert_eq!(req.request.method(), "listProducers");

        let req = JsonCodec::decode_request(r#"{"id":5,"method":"consumerResume"}"#).unwrap();
        assert!(matches!(req.request, Request::ConsumerResume { consumer_id: None }));
    }

    #[test]
    fn test_decode_error_recovers_id() {
        let err = JsonCodec::decode_request(r#"{"id":9,"method":"teleport"}"#).unwrap_err();
        assert_eq!(err.id, 9);

        let err = JsonCodec::decode_request(r#"{"id":10,"method":"createSendTransport"}"#).unwrap_err();
        assert_eq!(err.id, 10);

        let err = JsonCodec::decode_request("not json").unwrap_err();
        assert_eq!(err.id, 0);
    }

    #[test]
    fn test_response_shape() {
        let ok = Response::ok(3, json!({ "producerId": "p1" }));
        assert_eq!(
            serde_json::to_value(ServerMessage::Response(ok)).unwrap(),
            json!({ "id": 3, "ok": true, "data": { "producerId": "p1" } })
        );

        let err = Response::error(4, &SfuError::not_ready("transport t1 is still connecting"));
        assert_eq!(
            serde_json::to_value(ServerMessage::Response(err)).unwrap(),
            json!({
                "id": 4,
                "ok": false,
                "error": { "code": "notReady", "message": "Not ready: transport t1 is still connecting" }
            })
        );
    }

    #[test]
    fn test_server_message_decoding_picks_the_right_variant() {
        let event = JsonCodec::decode_server_message(
            r#"{"event":"connectionSuccess","data":{"peerId":"abc","existsProducer":true}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerMessage::Session(SessionEvent::ConnectionSuccess {
                peer_id: PeerId::from("abc"),
                exists_producer: true,
            })
        );

        let event = JsonCodec::decode_server_message(
            r#"{"event":"producerClosed","data":{"producerId":"p1"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerMessage::Peer(PeerEvent::ProducerClosed {
                producer_id: ProducerId::from("p1")
            })
        );
    }
}
