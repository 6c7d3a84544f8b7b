//! Call Session Store
//!
//! Einzige Quelle für den Anruf-Lebenszyklus. Besitzt den Transport und
//! den Audio-Kontext des aktiven Anrufs.

use super::handlers::SessionHandlers;
use super::transport::{Transport, TransportError, TransportKind};
use crate::audio::{AudioBackend, FramePlayer, InboundAudioFrame, PayloadFormat, PlaybackStats};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Failed to start call: {0}")]
    Start(TransportError),

    #[error("Failed to end call: {0}")]
    End(TransportError),

    #[error("Failed to toggle mute: {0}")]
    ToggleMute(TransportError),

    #[error("{0}")]
    Transport(TransportError),
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Der aktive Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    pub session_id: String,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub is_muted: bool,
    /// Vom Backend gemeldete Stream-ID
    pub stream_sid: Option<String>,
    #[serde(serialize_with = "serialize_kind")]
    pub transport: TransportKind,
}

fn serialize_kind<S: serde::Serializer>(kind: &TransportKind, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(kind)
}

/// Events für UI-Oberflächen
#[derive(Debug, Clone)]
pub enum StoreEvent {
    CallStarted(CallSession),
    StreamStarted { stream_sid: String },
    MuteChanged { muted: bool },
    CallEnded,
    Error(CallError),
}

#[derive(Default)]
struct StoreState {
    active_call: Option<CallSession>,
    is_connecting: bool,
    last_error: Option<CallError>,
    player: Option<Arc<FramePlayer>>,
    pending_stream_sid: Option<String>,
    /// Wird bei jedem Start und Ende erhöht, alte Handler werden damit ignoriert
    generation: u64,
}

struct StoreInner {
    transport: Arc<dyn Transport>,
    audio: Arc<dyn AudioBackend>,
    format: PayloadFormat,
    state: RwLock<StoreState>,
    event_tx: broadcast::Sender<StoreEvent>,
    /// Serialisiert start/end/mute
    op_lock: tokio::sync::Mutex<()>,
    /// Generation des zuletzt abgebrochenen Verbindungsaufbaus
    cancelled: watch::Sender<u64>,
}

// ============================================================================
// CALL STORE
// ============================================================================

#[derive(Clone)]
pub struct CallStore {
    inner: Arc<StoreInner>,
}

impl CallStore {
    pub fn new(transport: Arc<dyn Transport>, audio: Arc<dyn AudioBackend>) -> Self {
        Self::with_payload_format(transport, audio, PayloadFormat::default())
    }

    pub fn with_payload_format(
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioBackend>,
        format: PayloadFormat,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(StoreInner {
                transport,
                audio,
                format,
                state: RwLock::new(StoreState::default()),
                event_tx,
                op_lock: tokio::sync::Mutex::new(()),
                cancelled: watch::channel(0).0,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn active_call(&self) -> Option<CallSession> {
        self.inner.state.read().active_call.clone()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state.read().is_connecting
    }

    pub fn last_error(&self) -> Option<CallError> {
        self.inner.state.read().last_error.clone()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Statistik des aktuellen Audio-Kontexts
    pub fn playback_stats(&self) -> Option<PlaybackStats> {
        self.inner.state.read().player.as_ref().map(|p| p.stats())
    }

    /// Startet einen Anruf
    ///
    /// Der Peer-Transport verbindet sich mit der Session-ID, der Media-Stream
    /// mit dem Szenario.
    pub async fn start_call(
        &self,
        session_id: &str,
        scenario: &str,
    ) -> Result<CallSession, CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let generation = {
            let mut state = inner.state.write();
            if state.active_call.is_some() || state.is_connecting {
                return Err(CallError::AlreadyInCall);
            }
            state.is_connecting = true;
            state.last_error = None;
            state.pending_stream_sid = None;
            state.generation += 1;
            state.generation
        };

        tracing::info!(
            "Starting call {} (scenario {}) over {}",
            session_id,
            scenario,
            inner.transport.kind()
        );

        // Audio-Kontext vor dem Verbinden öffnen
        let sink = match inner.audio.open_output() {
            Ok(sink) => sink,
            Err(e) => {
                return Err(inner.fail_start(TransportError::MediaAcquisition(e.to_string())));
            }
        };
        inner.state.write().player = Some(Arc::new(FramePlayer::new(sink, inner.format)));

        let target = match inner.transport.kind() {
            TransportKind::Peer => session_id,
            TransportKind::MediaStream => scenario,
        };
        let handlers = Arc::new(StoreHandlers {
            inner: Arc::downgrade(inner),
            generation,
        });

        let mut cancelled = inner.cancelled.subscribe();
        tokio::select! {
            result = inner.transport.connect(target, handlers) => {
                if let Err(e) = result {
                    return Err(inner.fail_start(e));
                }
            }
            _ = async { let _ = cancelled.wait_for(|g| *g > generation).await; } => {
                tracing::info!("Call {} cancelled while connecting", session_id);
            }
        }

        let session = {
            let mut state = inner.state.write();
            if state.generation != generation {
                None
            } else {
                let session = CallSession {
                    session_id: session_id.to_string(),
                    scenario: scenario.to_string(),
                    started_at: Utc::now(),
                    is_muted: false,
                    stream_sid: state.pending_stream_sid.take(),
                    transport: inner.transport.kind(),
                };
                state.active_call = Some(session.clone());
                state.is_connecting = false;
                Some(session)
            }
        };

        // Während des Verbindens vom Transport beendet
        let Some(session) = session else {
            let _ = inner.transport.disconnect().await;
            return Err(inner.fail_start(TransportError::NotConnected));
        };

        tracing::info!("Call {} started", session.session_id);
        let _ = inner.event_tx.send(StoreEvent::CallStarted(session.clone()));
        Ok(session)
    }

    /// Beendet den Anruf
    ///
    /// Der Zustand wird in jedem Fall zurückgesetzt, auch wenn der Abbau des
    /// Transports fehlschlägt.
    pub async fn end_call(&self) -> Result<(), CallError> {
        // Ein laufender Start hält op_lock, er wird zuerst abgebrochen
        {
            let mut state = self.inner.state.write();
            if state.is_connecting {
                state.generation += 1;
                self.inner.cancelled.send_replace(state.generation);
            }
        }

        let _op = self.inner.op_lock.lock().await;
        self.inner.end_current().await
    }

    /// Schaltet Mute um und gibt den neuen Status zurück
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        if inner.state.read().active_call.is_none() {
            return Err(CallError::NoActiveCall);
        }

        match inner.transport.toggle_mute().await {
            Ok(muted) => {
                if let Some(call) = inner.state.write().active_call.as_mut() {
                    call.is_muted = muted;
                }
                let _ = inner.event_tx.send(StoreEvent::MuteChanged { muted });
                Ok(muted)
            }
            Err(e) => {
                tracing::warn!("Failed to toggle mute: {}", e);
                let err = CallError::ToggleMute(e);
                inner.record_error(err.clone());
                Err(err)
            }
        }
    }
}

impl StoreInner {
    fn record_error(&self, err: CallError) {
        self.state.write().last_error = Some(err.clone());
        let _ = self.event_tx.send(StoreEvent::Error(err));
    }

    /// Start fehlgeschlagen: Audio-Kontext freigeben, Fehler merken
    fn fail_start(&self, e: TransportError) -> CallError {
        tracing::error!("Failed to start call: {}", e);
        let player = {
            let mut state = self.state.write();
            state.is_connecting = false;
            state.pending_stream_sid = None;
            state.generation += 1;
            state.player.take()
        };
        drop(player);

        let err = CallError::Start(e);
        self.record_error(err.clone());
        err
    }

    /// Muss unter `op_lock` laufen
    async fn end_current(&self) -> Result<(), CallError> {
        // Events aus dem Abbau gehören schon nicht mehr zum Anruf
        self.state.write().generation += 1;

        let result = self.transport.disconnect().await;

        let (had_call, player) = {
            let mut state = self.state.write();
            state.is_connecting = false;
            state.pending_stream_sid = None;
            (state.active_call.take().is_some(), state.player.take())
        };
        drop(player);

        if had_call {
            tracing::info!("Call ended");
            let _ = self.event_tx.send(StoreEvent::CallEnded);
        }

        result.map_err(|e| {
            tracing::error!("Failed to end call: {}", e);
            let err = CallError::End(e);
            self.record_error(err.clone());
            err
        })
    }

    /// Vom Transport beendet: abbauen, falls der Anruf noch aktuell ist
    fn end_from_transport(self: Arc<Self>, generation: u64) {
        tokio::spawn(async move {
            let _op = self.op_lock.lock().await;
            if self.state.read().generation != generation {
                return;
            }
            let _ = self.end_current().await;
        });
    }
}

impl std::fmt::Debug for CallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("CallStore")
            .field("transport", &self.inner.transport.kind())
            .field("active_call", &state.active_call)
            .field("is_connecting", &state.is_connecting)
            .field("last_error", &state.last_error)
            .finish()
    }
}

// ============================================================================
// STORE HANDLERS
// ============================================================================

/// Handler, die der Store einem Transport übergibt
///
/// Gebunden an die Generation des Anrufs, für den sie erzeugt wurden.
struct StoreHandlers {
    inner: Weak<StoreInner>,
    generation: u64,
}

impl StoreHandlers {
    fn current(&self) -> Option<Arc<StoreInner>> {
        let inner = self.inner.upgrade()?;
        if inner.state.read().generation == self.generation {
            Some(inner)
        } else {
            tracing::debug!("Ignoring event from a superseded call");
            None
        }
    }
}

impl SessionHandlers for StoreHandlers {
    fn on_session_started(&self, stream_id: &str) {
        let Some(inner) = self.current() else {
            return;
        };

        {
            let mut state = inner.state.write();
            match state.active_call.as_mut() {
                Some(call) => call.stream_sid = Some(stream_id.to_string()),
                None => state.pending_stream_sid = Some(stream_id.to_string()),
            }
        }

        let _ = inner.event_tx.send(StoreEvent::StreamStarted {
            stream_sid: stream_id.to_string(),
        });
    }

    fn on_audio_frame(&self, frame: InboundAudioFrame) {
        let Some(inner) = self.current() else {
            return;
        };
        let player = inner.state.read().player.clone();

        if let Some(player) = player {
            player.decode_and_play(&frame);
        }
    }

    fn on_error(&self, error: TransportError) {
        let Some(inner) = self.current() else {
            return;
        };

        let fatal = error.is_fatal();
        if fatal {
            tracing::error!("Transport error, ending call: {}", error);
        } else {
            tracing::warn!("Transport error: {}", error);
        }

        inner.record_error(CallError::Transport(error));
        if fatal {
            inner.end_from_transport(self.generation);
        }
    }

    fn on_session_ended(&self) {
        if let Some(inner) = self.current() {
            tracing::info!("Session ended by transport");
            inner.end_from_transport(self.generation);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, AudioSink};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct FakeTransport {
        connect_error: Mutex<Option<TransportError>>,
        disconnect_error: Mutex<Option<TransportError>>,
        handlers: Mutex<Option<Arc<dyn SessionHandlers>>>,
        targets: Mutex<Vec<String>>,
        muted: AtomicBool,
        disconnects: AtomicUsize,
        /// connect kehrt nie zurück
        hang_connect: AtomicBool,
    }

    impl FakeTransport {
        fn handlers(&self) -> Arc<dyn SessionHandlers> {
            self.handlers.lock().clone().expect("not connected")
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::MediaStream
        }

        async fn connect(
            &self,
            target: &str,
            handlers: Arc<dyn SessionHandlers>,
        ) -> Result<(), TransportError> {
            self.targets.lock().push(target.to_string());
            if self.hang_connect.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if let Some(e) = self.connect_error.lock().take() {
                return Err(e);
            }
            *self.handlers.lock() = Some(handlers);
            Ok(())
        }

        async fn toggle_mute(&self) -> Result<bool, TransportError> {
            let muted = !self.muted.load(Ordering::SeqCst);
            self.muted.store(muted, Ordering::SeqCst);
            Ok(muted)
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if let Some(handlers) = self.handlers.lock().take() {
                handlers.on_session_ended();
            }
            match self.disconnect_error.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        fail: AtomicBool,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        played: Arc<Mutex<Vec<usize>>>,
    }

    struct RecordingSink {
        closed: Arc<AtomicUsize>,
        played: Arc<Mutex<Vec<usize>>>,
    }

    impl AudioSink for RecordingSink {
        fn play(&self, samples: &[f32], _sample_rate: u32) -> Result<(), AudioError> {
            self.played.lock().push(samples.len());
            Ok(())
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AudioBackend for RecordingBackend {
        fn open_output(&self) -> Result<Box<dyn AudioSink>, AudioError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AudioError::NoOutputDevice);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingSink {
                closed: Arc::clone(&self.closed),
                played: Arc::clone(&self.played),
            }))
        }
    }

    fn store() -> (CallStore, Arc<FakeTransport>, Arc<RecordingBackend>) {
        let transport = Arc::new(FakeTransport::default());
        let audio = Arc::new(RecordingBackend::default());
        let store = CallStore::new(transport.clone(), audio.clone());
        (store, transport, audio)
    }

    async fn wait_for_end(events: &mut broadcast::Receiver<StoreEvent>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(StoreEvent::CallEnded) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .expect("call did not end");
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_call_creates_exactly_one_session() {
        let (store, transport, audio) = store();

        let before = Utc::now();
        let call = store.start_call("sess-1", "abc123").await.unwrap();
        assert_eq!(call.session_id, "sess-1");
        assert_eq!(call.scenario, "abc123");
        assert!(call.started_at >= before);
        assert!(!call.is_muted);
        assert!(!store.is_connecting());
        assert_eq!(*transport.targets.lock(), vec!["abc123".to_string()]);

        let second = store.start_call("sess-2", "other").await;
        assert_eq!(second, Err(CallError::AlreadyInCall));
        assert_eq!(store.active_call(), Some(call));
        assert_eq!(audio.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_session() {
        let (store, transport, audio) = store();
        *transport.connect_error.lock() = Some(TransportError::ConnectionFailed("refused".into()));

        let err = store.start_call("sess-1", "abc123").await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to start call: "));
        assert_eq!(store.active_call(), None);
        assert!(!store.is_connecting());
        assert_eq!(store.last_error(), Some(err));
        assert_eq!(audio.closed.load(Ordering::SeqCst), 1);

        // Danach ist ein neuer Versuch möglich
        store.start_call("sess-1", "abc123").await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_output_failure_is_start_error() {
        let (store, transport, audio) = store();
        audio.fail.store(true, Ordering::SeqCst);

        let err = store.start_call("sess-1", "abc123").await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Start(TransportError::MediaAcquisition(_))
        ));
        assert!(transport.targets.lock().is_empty());
        assert_eq!(store.active_call(), None);
    }

    #[tokio::test]
    async fn test_end_call_resets_state_even_if_teardown_fails() {
        let (store, transport, audio) = store();
        let mut events = store.subscribe();
        store.start_call("sess-1", "abc123").await.unwrap();

        *transport.disconnect_error.lock() = Some(TransportError::Teardown("socket busy".into()));
        let err = store.end_call().await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to end call: Teardown failed: socket busy");
        assert_eq!(store.active_call(), None);
        assert_eq!(audio.closed.load(Ordering::SeqCst), 1);
        assert_eq!(store.last_error(), Some(err));

        // Wiederholter Abbau bleibt im freigegebenen Zustand
        store.end_call().await.unwrap();
        store.end_call().await.unwrap();
        assert_eq!(store.active_call(), None);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 3);

        wait_for_end(&mut events).await;
    }

    #[tokio::test]
    async fn test_toggle_mute_twice_restores_state() {
        let (store, _transport, _audio) = store();
        assert_eq!(store.toggle_mute().await, Err(CallError::NoActiveCall));

        store.start_call("sess-1", "abc123").await.unwrap();
        assert!(store.toggle_mute().await.unwrap());
        assert!(store.active_call().unwrap().is_muted);
        assert!(!store.toggle_mute().await.unwrap());
        assert!(!store.active_call().unwrap().is_muted);
    }

    #[tokio::test]
    async fn test_frames_play_through_call_audio_context() {
        let (store, transport, audio) = store();
        store.start_call("sess-1", "abc123").await.unwrap();
        let handlers = transport.handlers();

        handlers.on_session_started("xyz");
        assert_eq!(
            store.active_call().unwrap().stream_sid.as_deref(),
            Some("xyz")
        );

        let valid = BASE64.encode([0xFFu8; 160]);
        handlers.on_audio_frame(InboundAudioFrame::base64(valid.clone(), 1));
        handlers.on_audio_frame(InboundAudioFrame::base64("%%%", 2));
        handlers.on_audio_frame(InboundAudioFrame::base64(valid, 3));

        assert_eq!(*audio.played.lock(), vec![160, 160]);
        assert_eq!(
            store.playback_stats(),
            Some(PlaybackStats {
                played: 2,
                dropped: 1
            })
        );
        assert!(store.active_call().is_some());
    }

    #[tokio::test]
    async fn test_non_fatal_error_keeps_call() {
        let (store, transport, _audio) = store();
        store.start_call("sess-1", "abc123").await.unwrap();

        transport.handlers().on_error(TransportError::Connection);
        assert!(store.active_call().is_some());
        assert_eq!(
            store.last_error(),
            Some(CallError::Transport(TransportError::Connection))
        );
    }

    #[tokio::test]
    async fn test_fatal_error_ends_call() {
        let (store, transport, audio) = store();
        let mut events = store.subscribe();
        store.start_call("sess-1", "abc123").await.unwrap();

        let handlers = transport.handlers();
        handlers.on_error(TransportError::ReconnectExhausted { attempts: 5 });
        handlers.on_session_ended();

        wait_for_end(&mut events).await;
        assert_eq!(store.active_call(), None);
        assert_eq!(audio.closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.last_error(),
            Some(CallError::Transport(TransportError::ReconnectExhausted {
                attempts: 5
            }))
        );
    }

    #[tokio::test]
    async fn test_events_from_superseded_call_are_ignored() {
        let (store, transport, audio) = store();
        store.start_call("sess-1", "abc123").await.unwrap();
        let stale = transport.handlers();
        store.end_call().await.unwrap();

        store.start_call("sess-2", "abc123").await.unwrap();
        stale.on_audio_frame(InboundAudioFrame::binary(vec![0xFF; 160], 0));
        stale.on_error(TransportError::PeerConnectionFailed);
        stale.on_session_ended();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.active_call().unwrap().session_id, "sess-2");
        assert!(audio.played.lock().is_empty());
        assert_eq!(store.last_error(), None);
    }
    #[tokio::test]
    async fn test_end_call_cancels_pending_connect() {
        let (store, transport, audio) = store();
        transport.hang_connect.store(true, Ordering::SeqCst);

        let start = tokio::spawn({
            let store = store.clone();
            async move { store.start_call("sess-1", "abc123").await }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.targets.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(store.is_connecting());

        tokio::time::timeout(Duration::from_secs(2), store.end_call())
            .await
            .expect("end_call blocked behind connect")
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(CallError::Start(TransportError::NotConnected)));
        assert!(!store.is_connecting());
        assert_eq!(store.active_call(), None);
        assert!(store.playback_stats().is_none());
        assert_eq!(audio.closed.load(Ordering::SeqCst), 1);
        assert!(transport.disconnects.load(Ordering::SeqCst) >= 1);

        // Der nächste Start läuft normal
        transport.hang_connect.store(false, Ordering::SeqCst);
        let call = store.start_call("sess-2", "abc123").await.unwrap();
        assert_eq!(call.session_id, "sess-2");
        store.end_call().await.unwrap();
    }
}
