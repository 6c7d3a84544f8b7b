//! WebSocket Client für den Signaling-Server
//!
//! Eine Verbindung pro Session (`?sessionId=`). Eingehende Nachrichten
//! landen als `SignalingEvent` in einem Channel, ausgehende laufen über
//! einen eigenen Write-Task.

use super::messages::SignalingMessage;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Obergrenze für den WebSocket-Handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Message(SignalingMessage),

    /// Verbindung getrennt
    Disconnected,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    url: Url,
    connected: Arc<RwLock<bool>>,
    tx: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    /// Verbindet mit dem Signaling-Server
    ///
    /// Gibt den Client und den Receiver für eingehende Events zurück.
    pub async fn connect(
        server_url: &str,
        session_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let url = session_url(server_url, session_id)?;

        tracing::info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SignalingError::ConnectionFailed("handshake timed out".to_string()))?
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(RwLock::new(true));

        // Read-Task
        let connected_clone = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalingMessage>(&text) {
                        Ok(msg) => {
                            let _ = event_tx.send(SignalingEvent::Message(msg));
                        }
                        Err(e) => tracing::warn!("Ignoring signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signaling closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Signaling WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            *connected_clone.write() = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task, endet wenn alle Sender weg sind
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send signaling message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok((
            Self {
                url,
                connected,
                tx,
                tasks: vec![reader, writer],
            },
            event_rx,
        ))
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Sender für ausgehende Nachrichten, siehe `send_message`
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.tx.clone()
    }

    /// Trennt die Verbindung
    pub fn disconnect(self) {
        tracing::info!("Signaling disconnected");
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        *self.connected.write() = false;
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("url", &self.url.as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Serialisiert eine Nachricht und reiht sie beim Write-Task ein
pub async fn send_message(
    tx: &mpsc::Sender<String>,
    msg: &SignalingMessage,
) -> Result<(), SignalingError> {
    let text =
        serde_json::to_string(msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

    tracing::debug!("Sending {} over signaling", msg.kind());
    tx.send(text)
        .await
        .map_err(|e| SignalingError::SendFailed(e.to_string()))
}

/// Hängt `sessionId` an die Server-URL; http/https werden zu ws/wss
pub fn session_url(server_url: &str, session_id: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;
    url.query_pairs_mut().append_pair("sessionId", session_id);

    Ok(url)
}
