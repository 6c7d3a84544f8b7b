//! Message Types für den Media-Stream
//!
//! Das Backend sendet JSON-Text-Frames mit einem `event`-Feld. Sie werden
//! einmal an der Kanalgrenze in `StreamEvent` übersetzt.

use crate::audio::InboundAudioFrame;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event '{0}' is missing its payload")]
    MissingField(&'static str),
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Ein dekodiertes Event vom Media-Stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Backend hat mit dem Streaming begonnen
    Start { stream_sid: String },
    /// Ein Audio-Frame
    Media(InboundAudioFrame),
    /// Marker ohne Bedeutung für den Client
    Mark,
    /// Unbekanntes Event, wird nur geloggt
    Unknown,
}

impl StreamEvent {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let event = match serde_json::from_str::<WireMessage>(text)? {
            WireMessage::Start { stream_sid } => StreamEvent::Start {
                stream_sid: stream_sid.ok_or(MessageError::MissingField("start"))?,
            },
            WireMessage::Media { media } => {
                let media = media.ok_or(MessageError::MissingField("media"))?;
                StreamEvent::Media(InboundAudioFrame::base64(media.payload, media.timestamp))
            }
            WireMessage::Mark { .. } => StreamEvent::Mark,
            WireMessage::Unknown => StreamEvent::Unknown,
        };
        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireMessage {
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: Option<String>,
    },
    Media {
        media: Option<MediaPayload>,
    },
    Mark {
        #[allow(dead_code)]
        mark: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
    #[serde(default, deserialize_with = "number_or_string")]
    timestamp: u64,
}

/// Timestamps kommen je nach Backend als Zahl oder als String
fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ============================================================================
// TESTS
// ============================================================================
