//! Session Module - Anruf-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - Den Callback-Vertrag zwischen Store und Transport
//! - Die Transport-Abstraktion (Peer / Media-Stream)
//! - Den Call Store mit aktivem Anruf und Audio-Kontext

mod handlers;
mod store;
mod transport;

pub use handlers::{SessionEvent, SessionHandlers};
pub use store::{CallError, CallSession, CallStore, StoreEvent};
pub use transport::{Transport, TransportError, TransportKind};
