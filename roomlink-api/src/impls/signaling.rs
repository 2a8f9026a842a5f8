//! Transport-agnostic signaling loop
//!
//! The HTTP layer only adapts its socket to [`SignalStream`]; everything else
//! (session lifecycle, request dispatch, event forwarding, cleanup) lives in
//! [`SignalingHandler::run`].
//!
//! Requests of one connection are handled strictly one after another, so a
//! peer's handshake steps can never overtake each other. Different
//! connections run in their own tasks.

use std::sync::Arc;

use roomlink_sfu::{Direction, PeerSession, RoomId, RoomRegistry, SfuError};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::protocol::{
    JsonCodec, ProducerIdData, ProducersData, Request, Response, RtpCapabilitiesData,
    ServerMessage, SessionEvent,
};

/// Bidirectional text frame stream of one signaling connection
#[async_trait::async_trait]
pub trait SignalStream: Send {
    /// Receive the next frame
    ///
    /// Returns None when the connection is closed
    async fn recv(&mut self) -> Option<Result<String, String>>;

    /// Queue a message for the peer
    fn send(&self, message: ServerMessage) -> Result<(), String>;
}

pub struct SignalingHandler {
    registry: Arc<RoomRegistry>,
    room_hint: Option<RoomId>,
}

impl SignalingHandler {
    pub const fn new(registry: Arc<RoomRegistry>, room_hint: Option<RoomId>) -> Self {
        Self {
            registry,
            room_hint,
        }
    }

    /// Run the connection until the peer goes away or the stream breaks.
    /// All of the peer's transports, producers and consumers are closed on exit,
    /// including early returns (the session cleans up on drop).
    pub async fn run<S: SignalStream>(&self, stream: &mut S) -> Result<(), String> {
        let (mut session, mut events) =
            PeerSession::new(Arc::clone(&self.registry), self.room_hint.clone());
        let peer_id = session.peer_id().clone();
        info!(peer_id = %peer_id, room_hint = ?self.room_hint, "Peer connected");

        stream.send(ServerMessage::Session(SessionEvent::ConnectionSuccess {
            peer_id: peer_id.clone(),
            exists_producer: session.exists_producer(),
        }))?;

        let result = loop {
            tokio::select! {
                frame = stream.recv() => match frame {
                    Some(Ok(frame)) => {
                        let response = self.handle_frame(&mut session, &frame).await;
                        if let Err(e) = stream.send(ServerMessage::Response(response)) {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(peer_id = %peer_id, error = %e, "Signaling stream error");
                        break Err(e);
                    }
                    None => break Ok(()),
                },

                Some(event) = events.recv() => {
                    session.on_event(&event);
                    if let Err(e) = stream.send(ServerMessage::Peer(event)) {
                        break Err(e);
                    }
                }
            }
        };

        session.disconnect();
        info!(peer_id = %peer_id, "Peer disconnected");
        result
    }

    /// Decode and execute one frame; every outcome becomes a response
    async fn handle_frame(&self, session: &mut PeerSession, frame: &str) -> Response {
        let request = match JsonCodec::decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer_id = %session.peer_id(), error = %e, "Undecodable signaling frame");
                return Response::error(e.id, &SfuError::protocol(e.message));
            }
        };

        let id = request.id;
        let method = request.request.method();
        debug!(peer_id = %session.peer_id(), id, method, "Handling request");

        match dispatch(session, request.request).await {
            Ok(data) => Response::ok(id, data),
            Err(err) => {
                warn!(
                    peer_id = %session.peer_id(),
                    id,
                    method,
                    code = err.code(),
                    error = %err,
                    "Request failed"
                );
                Response::error(id, &err)
            }
        }
    }
}

async fn dispatch(session: &mut PeerSession, request: Request) -> Result<Value, SfuError> {
    match request {
        Request::CreateRoom { room_id } => {
            let rtp_capabilities = session.create_room(room_id).await?;
            to_data(&RtpCapabilitiesData { rtp_capabilities })
        }
        Request::GetRouterRtpCapabilities => {
            let rtp_capabilities = session.rtp_capabilities()?;
            to_data(&RtpCapabilitiesData { rtp_capabilities })
        }
        Request::CreateSendTransport { sender } => to_data(&session.create_transport(sender).await?),
        Request::TransportConnect {
            dtls_parameters,
            transport_id,
        } => {
            session
                .connect_transport(Direction::Send, transport_id.as_ref(), dtls_parameters)
                .await?;
            Ok(json!({}))
        }
        Request::TransportProduce {
            kind,
            rtp_parameters,
            transport_id,
        } => {
            let producer_id = session
                .produce(transport_id.as_ref(), kind, rtp_parameters)
                .await?;
            to_data(&ProducerIdData { producer_id })
        }
        Request::TransportRecvConnect {
            dtls_parameters,
            transport_id,
        } => {
            session
                .connect_transport(Direction::Recv, transport_id.as_ref(), dtls_parameters)
                .await?;
            Ok(json!({}))
        }
        Request::Consume {
            rtp_capabilities,
            producer_id,
            transport_id,
        } => {
            let consumer = session
                .consume(transport_id.as_ref(), producer_id.as_ref(), &rtp_capabilities)
                .await?;
            to_data(&consumer)
        }
        Request::ConsumerResume { consumer_id } => {
            session.resume(consumer_id.as_ref()).await?;
            Ok(json!({}))
        }
        Request::ListProducers => to_data(&ProducersData {
            producers: session.list_producers()?,
        }),
        Request::CloseProducer { producer_id } => {
            session.close_producer(&producer_id)?;
            Ok(json!({}))
        }
        Request::CloseTransport { transport_id } => {
            session.close_transport(&transport_id)?;
            Ok(json!({}))
        }
    }
}

fn to_data<T: Serialize>(data: &T) -> Result<Value, SfuError> {
    serde_json::to_value(data).map_err(|e| SfuError::Engine(format!("Failed to encode response: {e}")))
}
