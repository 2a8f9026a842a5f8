//! WebSocket signaling endpoint
//!
//! Adapts axum's WebSocket to the `SignalStream` trait; the signaling loop
//! itself lives in `impls::signaling`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitStream, SinkExt, StreamExt};
use roomlink_sfu::RoomId;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::http::AppState;
use crate::impls::{SignalStream, SignalingHandler};
use crate::protocol::{JsonCodec, ServerMessage};

/// Outbound frames buffered per connection before the peer counts as too slow
const OUTBOUND_BUFFER: usize = 1000;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Room targeted by `existsProducer` and by `createRoom` without an id
    pub room_id: Option<String>,
}

/// WebSocket stream implementation of `SignalStream`
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl SignalStream for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(message)) => {
                    if let Some(frame) = frame_text(message) {
                        return Some(frame);
                    }
                    // ping/pong are answered by axum
                }
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
            }
        }
    }

    fn send(&self, message: ServerMessage) -> Result<(), String> {
        let text = JsonCodec::encode_server_message(&message)?;

        // try_send gives backpressure: a client that stops reading gets dropped
        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: WebSocket client disconnected".to_string()
            }
        })
    }
}

/// Payload of a data frame, `None` for control frames
fn frame_text(message: Message) -> Option<Result<String, String>> {
    match message {
        Message::Text(text) => Some(Ok(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| format!("Binary frame is not valid UTF-8: {e}")),
        ),
        _ => None,
    }
}

/// `GET /ws?roomId=...`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(ws, state, query.room_id.map(RoomId::from))
}

/// `GET /ws/{room_id}`
pub async fn room_websocket_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(ws, state, Some(RoomId::from(room_id)))
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, room_hint: Option<RoomId>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, room_hint))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_hint: Option<RoomId>) {
    let (mut sink, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    // Server messages -> WebSocket
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut stream = WebSocketStream {
        receiver,
        sender: tx,
    };
    let handler = SignalingHandler::new(state.registry, room_hint);
    if let Err(e) = handler.run(&mut stream).await {
        error!("Signaling handler error: {}", e);
    }

    // dropping the stream closes the channel and lets the writer flush and exit
    drop(stream);
    let _ = writer.await;
    info!("WebSocket connection closed");
}
