//! Call Engine Module - WebRTC Peer-Sitzung
//!
//! Dieses Modul verwaltet:
//! - WebRTC Peer Connections (PCMU)
//! - Audio Capture (Mikrofon)
//! - Offer/Answer/ICE über den Signaling-Kanal

mod engine;
mod microphone;

pub use engine::{PeerSessionClient, PeerSessionConfig, PeerSessionError, PeerState};
pub use microphone::{CpalMicrophone, LocalAudioTrack, LocalMediaStream, Microphone};
