//! Server-relayed Media-Stream
//!
//! WebSocket zum Call-Backend, über den eingehendes Audio als JSON-Events
//! ankommt. Verbindungsabbrüche werden mit exponentiellem Backoff
//! wiederhergestellt.

mod client;
mod messages;
mod reconnect;

pub use client::{ConnectionEvent, MediaStreamClient, MediaStreamError, StreamPhase};
pub use messages::{MessageError, StreamEvent};
pub use reconnect::{ConnectionAttemptState, ReconnectPolicy};
