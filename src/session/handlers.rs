//! Callback-Vertrag zwischen Store und Transport

use super::transport::TransportError;
use crate::audio::InboundAudioFrame;
use tokio::sync::mpsc;

/// Callbacks, die ein Transport während einer Sitzung aufruft
///
/// Der Store besitzt die Handler. Ein Transport hält nur eine Referenz bis
/// zum Teardown und verwirft sie danach.
pub trait SessionHandlers: Send + Sync {
    /// Das Backend hat mit dem Streaming begonnen
    fn on_session_started(&self, stream_id: &str);

    fn on_audio_frame(&self, frame: InboundAudioFrame);

    fn on_error(&self, error: TransportError);

    /// Kanonisches Ende-Signal, genau einmal pro Sitzung
    fn on_session_ended(&self);
}

/// Handler-Aufrufe als Werte, z.B. für Channels
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { stream_id: String },
    AudioFrame(InboundAudioFrame),
    Error(TransportError),
    Ended,
}

impl SessionHandlers for mpsc::UnboundedSender<SessionEvent> {
    fn on_session_started(&self, stream_id: &str) {
        let _ = self.send(SessionEvent::Started {
            stream_id: stream_id.to_string(),
        });
    }

    fn on_audio_frame(&self, frame: InboundAudioFrame) {
        let _ = self.send(SessionEvent::AudioFrame(frame));
    }

    fn on_error(&self, error: TransportError) {
        let _ = self.send(SessionEvent::Error(error));
    }

    fn on_session_ended(&self) {
        let _ = self.send(SessionEvent::Ended);
    }
}
