//! Decode & Play
//!
//! Nimmt eingehende Frames entgegen, dekodiert sie und spielt sie sofort
//! über den Audio-Kontext des aktiven Anrufs ab. Ein kaputter Frame wird
//! geloggt und verworfen, der Stream läuft weiter.

use super::codec::PayloadFormat;
use super::output::AudioSink;
use super::AudioError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// FRAME TYPES
// ============================================================================

/// Kodierte Nutzdaten eines Frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    /// Base64-Text, wie ihn der Media-Stream liefert
    Base64(String),
    /// Rohe Bytes (RTP-Payload auf dem Peer-Pfad)
    Binary(Vec<u8>),
}

/// Ein eingehender Audio-Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudioFrame {
    pub payload: AudioPayload,
    /// Logische Reihenfolge (Timestamp des Senders)
    pub timestamp: u64,
}

impl InboundAudioFrame {
    pub fn base64(payload: impl Into<String>, timestamp: u64) -> Self {
        Self {
            payload: AudioPayload::Base64(payload.into()),
            timestamp,
        }
    }

    pub fn binary(payload: Vec<u8>, timestamp: u64) -> Self {
        Self {
            payload: AudioPayload::Binary(payload),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub played: u64,
    pub dropped: u64,
}

// ============================================================================
// FRAME PLAYER
// ============================================================================

/// Audio-Kontext eines Anrufs
///
/// Besitzt den `AudioSink` und schließt ihn beim Drop.
pub struct FramePlayer {
    sink: Box<dyn AudioSink>,
    format: PayloadFormat,
    played: AtomicU64,
    dropped: AtomicU64,
}

impl FramePlayer {
    pub fn new(sink: Box<dyn AudioSink>, format: PayloadFormat) -> Self {
        Self {
            sink,
            format,
            played: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Dekodiert einen Frame und startet die Wiedergabe
    ///
    /// Fehler werden nur geloggt.
    pub fn decode_and_play(&self, frame: &InboundAudioFrame) {
        match self.try_decode_and_play(frame) {
            Ok(()) => {
                self.played.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping audio frame (ts={}): {}", frame.timestamp, e);
            }
        }
    }

    fn try_decode_and_play(&self, frame: &InboundAudioFrame) -> Result<(), AudioError> {
        let samples = match &frame.payload {
            AudioPayload::Base64(text) => self.format.decode(&BASE64.decode(text)?)?,
            AudioPayload::Binary(bytes) => self.format.decode(bytes)?,
        };
        self.sink.play(&samples, self.format.sample_rate())
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            played: self.played.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FramePlayer {
    fn drop(&mut self) {
        self.sink.close();
        let stats = self.stats();
        tracing::debug!(
            "Audio context closed ({} frames played, {} dropped)",
            stats.played,
            stats.dropped
        );
    }
}

impl std::fmt::Debug for FramePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePlayer")
            .field("format", &self.format)
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Arc<Mutex<Vec<(usize, u32)>>>,
        closed: Arc<Mutex<u32>>,
    }

    impl AudioSink for RecordingSink {
        fn play(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
            self.chunks.lock().push((samples.len(), sample_rate));
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock() += 1;
        }
    }

    #[test]
    fn test_corrupt_frame_does_not_stop_playback() {
        let sink = RecordingSink::default();
        let chunks = Arc::clone(&sink.chunks);
        let player = FramePlayer::new(Box::new(sink), PayloadFormat::default());

        let valid = BASE64.encode([0xFFu8; 160]);
        player.decode_and_play(&InboundAudioFrame::base64(valid.clone(), 1));
        player.decode_and_play(&InboundAudioFrame::base64("!!not base64!!", 2));
        player.decode_and_play(&InboundAudioFrame::base64(valid, 3));

        assert_eq!(
            player.stats(),
            PlaybackStats {
                played: 2,
                dropped: 1
            }
        );
        assert_eq!(*chunks.lock(), vec![(160, 8000), (160, 8000)]);
    }

    #[test]
    fn test_binary_payload_and_empty_frame() {
        let player = FramePlayer::new(Box::new(RecordingSink::default()), PayloadFormat::default());

        player.decode_and_play(&InboundAudioFrame::binary(vec![0x7F; 80], 0));
        player.decode_and_play(&InboundAudioFrame::binary(Vec::new(), 1));

        assert_eq!(player.stats().played, 1);
        assert_eq!(player.stats().dropped, 1);
    }

    #[test]
    fn test_drop_closes_sink() {
        let sink = RecordingSink::default();
        let closed = Arc::clone(&sink.closed);
        {
            let _player = FramePlayer::new(Box::new(sink), PayloadFormat::default());
        }
        assert_eq!(*closed.lock(), 1);
    }
}
