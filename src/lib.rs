//! Call Session - Echtzeit-Anrufe für das Call-Dashboard
//!
//! Baut den Audio-Kanal zum Call-Backend auf und hält ihn am Leben:
//! - WebRTC Peer-Verbindung mit Signaling über WebSocket
//! - Server-relayed Media-Stream mit automatischer Reconnection
//! - Dekodierung und Wiedergabe des eingehenden Audios
//! - Call Store als einzige Quelle für den Anruf-Lebenszyklus

pub mod api;
pub mod audio;
pub mod call_engine;
pub mod config;
pub mod media_stream;
pub mod session;
pub mod signaling;

pub use api::{ApiError, CallApi, CustomCallConfig, CustomCallResponse};
pub use config::{AppConfig, ConfigError};
pub use session::{
    CallError, CallSession, CallStore, SessionEvent, SessionHandlers, StoreEvent, Transport,
    TransportError, TransportKind,
};

use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "call_session=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Mehrfacher Aufruf ist harmlos, nur der erste Subscriber gilt.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
