// Module: impls
// Connection logic shared by every transport the signaling can run over

pub mod signaling;

pub use signaling::{SignalStream, SignalingHandler};
