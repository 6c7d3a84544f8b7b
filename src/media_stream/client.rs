//! WebSocket Client für den Media-Stream
//!
//! Verwaltet die Verbindung zum Call-Backend pro Szenario:
//! - Event-Dispatch (`start` / `media` / `mark`)
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Generationen gegen veraltete Reconnect-Timer

use super::messages::StreamEvent;
use super::reconnect::{ConnectionAttemptState, ReconnectPolicy};
use crate::session::{SessionHandlers, Transport, TransportError, TransportKind};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wie lange `disconnect` auf das saubere Schließen wartet
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Obergrenze für den WebSocket-Handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaStreamError {
    #[error("Invalid media stream URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection superseded by a newer connect or disconnect")]
    Superseded,
}

impl From<MediaStreamError> for TransportError {
    fn from(e: MediaStreamError) -> Self {
        match e {
            MediaStreamError::Superseded => TransportError::NotConnected,
            other => TransportError::ConnectionFailed(other.to_string()),
        }
    }
}

// ============================================================================
// EVENTS & STATE
// ============================================================================

/// Verbindungs-Events für Beobachter (UI, Tests)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    ReconnectScheduled { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

/// Zustand des Kanals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Connecting,
    Open,
    /// Unerwartet geschlossen, Reconnect ist geplant
    Closed,
    Reconnecting,
    /// Alle Versuche aufgebraucht
    Terminated,
}

struct ClientState {
    phase: StreamPhase,
    generation: u64,
    attempts: ConnectionAttemptState,
    handlers: Option<Arc<dyn SessionHandlers>>,
    url: Option<Url>,
    reader: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<ClientState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

// ============================================================================
// MEDIA STREAM CLIENT
// ============================================================================

/// Client für den server-relayed Media-Stream
pub struct MediaStreamClient {
    base_url: String,
    inner: Arc<Inner>,
}

impl MediaStreamClient {
    pub fn new(base_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            base_url: base_url.into(),
            inner: Arc::new(Inner {
                state: Mutex::new(ClientState {
                    phase: StreamPhase::Idle,
                    generation: 0,
                    attempts: ConnectionAttemptState::new(policy),
                    handlers: None,
                    url: None,
                    reader: None,
                    shutdown: None,
                    retry: None,
                }),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn state(&self) -> StreamPhase {
        self.inner.state.lock().phase
    }

    pub fn attempt_state(&self) -> ConnectionAttemptState {
        self.inner.state.lock().attempts.clone()
    }

    pub fn has_handlers(&self) -> bool {
        self.inner.state.lock().handlers.is_some()
    }

    /// Verbindet mit dem Media-Stream eines Szenarios
    ///
    /// Resolved, sobald der WebSocket-Handshake durch ist. Schlägt das erste
    /// Öffnen fehl, gibt es keinen Reconnect.
    pub async fn connect(
        &self,
        scenario_id: &str,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Result<(), MediaStreamError> {
        if self.state() != StreamPhase::Idle {
            tracing::warn!("connect() while a stream is active, disconnecting first");
            self.disconnect().await;
        }

        let url = stream_url(&self.base_url, scenario_id)?;

        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.phase = StreamPhase::Connecting;
            state.attempts.reset();
            state.handlers = Some(handlers);
            state.url = Some(url.clone());
            state.generation
        };

        tracing::info!("Connecting to media stream: {}", url);

        match open(&url).await {
            Ok(ws) => Inner::mark_open(&self.inner, generation, ws),
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.generation == generation {
                    state.phase = StreamPhase::Idle;
                    state.handlers = None;
                    state.url = None;
                }
                Err(e)
            }
        }
    }

    /// Trennt die Verbindung explizit
    ///
    /// Bricht geplante Reconnects ab, setzt den Zähler zurück und gibt die
    /// Handler frei. Darf beliebig oft aufgerufen werden.
    pub async fn disconnect(&self) {
        let (reader, shutdown, retry, handlers) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.phase = StreamPhase::Idle;
            state.attempts.reset();
            state.url = None;
            (
                state.reader.take(),
                state.shutdown.take(),
                state.retry.take(),
                state.handlers.take(),
            )
        };

        if let Some(retry) = retry {
            retry.abort();
        }

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }

        if let Some(mut reader) = reader {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                tracing::warn!("Media stream reader did not stop in time, aborting");
                reader.abort();
            }
        }

        if let Some(handlers) = handlers {
            tracing::info!("Media stream disconnected");
            handlers.on_session_ended();
        }
    }
}

impl Inner {
    /// Kanal ist offen: Zähler zurücksetzen und Reader starten
    fn mark_open(
        this: &Arc<Self>,
        generation: u64,
        ws: WsStream,
    ) -> Result<(), MediaStreamError> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut state = this.state.lock();
        if state.generation != generation {
            // ws wird gedroppt, der Kanal ist damit zu
            return Err(MediaStreamError::Superseded);
        }

        state.phase = StreamPhase::Open;
        state.attempts.reset();
        state.shutdown = Some(shutdown_tx);
        state.reader = Some(tokio::spawn(Self::run_reader(
            Arc::clone(this),
            generation,
            ws,
            shutdown_rx,
        )));
        drop(state);

        tracing::info!("Media stream connected");
        let _ = this.event_tx.send(ConnectionEvent::Opened);
        Ok(())
    }

    /// Liest Nachrichten in Ankunftsreihenfolge bis zum Close
    async fn run_reader(
        this: Arc<Self>,
        generation: u64,
        mut ws: WsStream,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = ws.close(None).await;
                    return;
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => this.dispatch(generation, &text),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Media stream closed by server: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("Media stream error: {}", e);
                        if let Some(handlers) = this.handlers_for(generation) {
                            handlers.on_error(TransportError::Connection);
                        }
                        break;
                    }
                    None => break,
                }
            }
        }

        Self::handle_close(&this, generation);
    }

    fn dispatch(&self, generation: u64, text: &str) {
        let Some(handlers) = self.handlers_for(generation) else {
            return;
        };

        match StreamEvent::parse(text) {
            Ok(StreamEvent::Start { stream_sid }) => {
                tracing::info!("Media stream started: {}", stream_sid);
                handlers.on_session_started(&stream_sid);
            }
            Ok(StreamEvent::Media(frame)) => handlers.on_audio_frame(frame),
            Ok(StreamEvent::Mark) => tracing::debug!("Mark event received"),
            Ok(StreamEvent::Unknown) => tracing::warn!("Unknown message event: {}", text),
            Err(e) => {
                tracing::warn!("Error handling media stream message: {}", e);
                handlers.on_error(TransportError::Protocol(e.to_string()));
            }
        }
    }

    fn handlers_for(&self, generation: u64) -> Option<Arc<dyn SessionHandlers>> {
        let state = self.state.lock();
        if state.generation == generation {
            state.handlers.clone()
        } else {
            None
        }
    }

    /// Unerwarteter Close: Reconnect planen
    fn handle_close(this: &Arc<Self>, generation: u64) {
        let mut state = this.state.lock();
        if state.generation != generation || state.phase != StreamPhase::Open {
            return;
        }

        state.phase = StreamPhase::Closed;
        state.reader = None;
        state.shutdown = None;
        tracing::info!("Media stream closed");
        let _ = this.event_tx.send(ConnectionEvent::Closed);

        Self::schedule_reconnect(this, state, generation);
    }

    fn schedule_reconnect(
        this: &Arc<Self>,
        mut state: parking_lot::MutexGuard<'_, ClientState>,
        generation: u64,
    ) {
        match state.attempts.record_failure() {
            Some(delay) => {
                let attempt = state.attempts.attempt_count();
                tracing::info!(
                    "Attempting to reconnect ({}/{}) in {:?}...",
                    attempt,
                    state.attempts.max_attempts(),
                    delay
                );

                let inner = Arc::clone(this);
                state.retry = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::retry(inner, generation).await;
                }));
                drop(state);

                let _ = this
                    .event_tx
                    .send(ConnectionEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                let attempts = state.attempts.attempt_count();
                state.phase = StreamPhase::Terminated;
                state.url = None;
                let handlers = state.handlers.take();
                drop(state);

                tracing::error!("Failed to reconnect after {} attempts", attempts);
                let _ = this.event_tx.send(ConnectionEvent::GaveUp { attempts });
                if let Some(handlers) = handlers {
                    handlers.on_error(TransportError::ReconnectExhausted { attempts });
                    handlers.on_session_ended();
                }
            }
        }
    }

    /// Führt einen geplanten Reconnect aus, falls er noch aktuell ist
    async fn retry(this: Arc<Self>, scheduled_generation: u64) {
        let (generation, url) = {
            let mut state = this.state.lock();
            if state.generation != scheduled_generation || state.phase != StreamPhase::Closed {
                tracing::debug!("Ignoring stale reconnect timer");
                return;
            }
            let Some(url) = state.url.clone() else {
                return;
            };
            state.generation += 1;
            state.phase = StreamPhase::Reconnecting;
            // Handle gehört zu diesem Task
            state.retry = None;
            (state.generation, url)
        };

        match open(&url).await {
            Ok(ws) => {
                let _ = Self::mark_open(&this, generation, ws);
            }
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                let mut state = this.state.lock();
                if state.generation != generation {
                    return;
                }
                state.phase = StreamPhase::Closed;
                Self::schedule_reconnect(&this, state, generation);
            }
        }
    }
}

impl Drop for MediaStreamClient {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for MediaStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MediaStreamClient")
            .field("base_url", &self.base_url)
            .field("phase", &state.phase)
            .field("attempts", &state.attempts.attempt_count())
            .finish()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[async_trait]
impl Transport for MediaStreamClient {
    fn kind(&self) -> TransportKind {
        TransportKind::MediaStream
    }

    async fn connect(
        &self,
        target: &str,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Result<(), TransportError> {
        MediaStreamClient::connect(self, target, handlers)
            .await
            .map_err(Into::into)
    }

    /// Der Client empfängt nur Audio, es gibt keinen lokalen Track
    async fn toggle_mute(&self) -> Result<bool, TransportError> {
        Err(TransportError::MuteUnsupported)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        MediaStreamClient::disconnect(self).await;
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// `{base}/media-stream-custom/{scenario_id}` mit ws/wss statt http/https
pub fn stream_url(base_url: &str, scenario_id: &str) -> Result<Url, MediaStreamError> {
    let mut url = Url::parse(base_url).map_err(|e| MediaStreamError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(MediaStreamError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MediaStreamError::InvalidUrl(base_url.to_string()))?;

    url.path_segments_mut()
        .map_err(|_| MediaStreamError::InvalidUrl(base_url.to_string()))?
        .pop_if_empty()
        .push("media-stream-custom")
        .push(scenario_id);

    Ok(url)
}

async fn open(url: &Url) -> Result<WsStream, MediaStreamError> {
    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| MediaStreamError::ConnectionFailed("handshake timed out".to_string()))?
        .map_err(|e| MediaStreamError::ConnectionFailed(e.to_string()))?;
    Ok(ws)
}

// ============================================================================
// TESTS
// ============================================================================
