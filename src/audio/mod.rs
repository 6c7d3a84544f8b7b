//! Audio Module - Dekodierung und Wiedergabe
//!
//! Dieses Modul verwaltet:
//! - G.711 µ-law / PCM Dekodierung
//! - Audio-Kontext pro Anruf (Lautsprecher über cpal)
//! - Decode & Play für eingehende Frames

mod codec;
mod output;
mod player;

pub use codec::{
    encode_mu_law, resample_linear, PayloadFormat, MULAW_FRAME_SAMPLES, MULAW_SAMPLE_RATE,
};
pub use output::{AudioBackend, AudioSink, CpalBackend};
pub(crate) use output::select_best_config;
pub use player::{AudioPayload, FramePlayer, InboundAudioFrame, PlaybackStats};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to decode audio frame: {0}")]
    Decode(String),

    #[error("Audio output already closed")]
    Closed,
}

impl From<base64::DecodeError> for AudioError {
    fn from(e: base64::DecodeError) -> Self {
        AudioError::Decode(e.to_string())
    }
}
