//! Transport-Abstraktion
//!
//! Beide Transporte (Peer-Verbindung und Media-Stream) implementieren
//! `Transport`, damit der Store transport-agnostisch bleibt.

use super::handlers::SessionHandlers;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Mikrofon oder Audio-Gerät nicht verfügbar
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Kanal konnte nicht geöffnet werden
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Vorübergehender Fehler auf dem offenen Kanal
    #[error("WebSocket connection error")]
    Connection,

    #[error("Failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Peer connection failed")]
    PeerConnectionFailed,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Failed to process message: {0}")]
    Protocol(String),

    #[error("Mute is not supported by this transport")]
    MuteUnsupported,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Teardown failed: {0}")]
    Teardown(String),
}

impl TransportError {
    /// Fatal bedeutet: die Sitzung ist vorbei und wird nicht wiederhergestellt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::MediaAcquisition(_)
                | TransportError::ConnectionFailed(_)
                | TransportError::ReconnectExhausted { .. }
                | TransportError::PeerConnectionFailed
        )
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Direkte WebRTC-Verbindung
    Peer,
    /// Server-relayed Media-Stream über WebSocket
    MediaStream,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Peer => write!(f, "peer"),
            TransportKind::MediaStream => write!(f, "media-stream"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Baut die Verbindung auf
    ///
    /// `target` ist die Session-ID (Peer) bzw. die Szenario-ID (Media-Stream).
    /// Resolved, sobald der Kanal steht. Bei Fehlern ist alles wieder
    /// freigegeben.
    async fn connect(
        &self,
        target: &str,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Result<(), TransportError>;

    /// Schaltet Mute um und gibt den neuen Mute-Status zurück
    async fn toggle_mute(&self) -> Result<bool, TransportError>;

    /// Baut die Verbindung ab. Darf in jedem Zustand aufgerufen werden.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
