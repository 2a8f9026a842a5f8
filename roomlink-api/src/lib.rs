//! `RoomLink` signaling API
//!
//! - `protocol`: JSON request/response/event envelopes
//! - `impls`: transport-agnostic signaling loop
//! - `http`: axum routes (WebSocket upgrade, health, room inspection)

pub mod http;
pub mod impls;
pub mod protocol;
