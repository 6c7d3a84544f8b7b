//! Signaling Module - WebSocket Kanal für Offer/Answer/ICE
//!
//! Wird von der Peer-Verbindung benutzt, um Session-Beschreibungen und
//! ICE-Candidates mit der Gegenseite auszutauschen.

mod client;
mod messages;

pub use client::{send_message, SignalingClient, SignalingError, SignalingEvent};
pub use messages::SignalingMessage;
