//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt `{"type": ..., "payload": ...}`.
//! SDP und ICE-Candidates werden direkt in der WebRTC-Form übertragen.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Offer/Answer/ICE in beide Richtungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    IceCandidate(RTCIceCandidateInit),
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) => "ice-candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ice_candidate_wire_format() {
        let msg = SignalingMessage::IceCandidate(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_parse_answer() {
        let raw = json!({
            "type": "answer",
            "payload": { "type": "answer", "sdp": "v=0\r\n" }
        });

        let msg: SignalingMessage = serde_json::from_value(raw).unwrap();
        match msg {
            SignalingMessage::Answer(desc) => assert_eq!(desc.sdp, "v=0\r\n"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"bye","payload":{}}"#;
        assert!(serde_json::from_str::<SignalingMessage>(raw).is_err());
    }
}
