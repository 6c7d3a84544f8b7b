//! WebRTC Peer Session
//!
//! Verwaltet die Peer Connection einer Sitzung und koordiniert
//! Signaling, Mikrofon und eingehendes Audio.
//!
//! Es wird nur PCMU (G.711 µ-law, 8kHz) registriert. Dadurch landen beide
//! Richtungen auf demselben Codec wie der Media-Stream.

use super::microphone::{LocalMediaStream, Microphone};
use crate::audio::{encode_mu_law, AudioError, InboundAudioFrame, MULAW_SAMPLE_RATE};
use crate::session::{SessionHandlers, Transport, TransportError, TransportKind};
use crate::signaling::{
    send_message, SignalingClient, SignalingError, SignalingEvent, SignalingMessage,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Dauer eines Mikrofon-Frames
const FRAME_DURATION: Duration = Duration::from_millis(20);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerSessionError {
    #[error("Peer session already active")]
    AlreadyActive,

    #[error("No active peer session")]
    NoActiveSession,

    #[error("Peer session closed during negotiation")]
    Cancelled,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Microphone error: {0}")]
    Microphone(#[from] AudioError),

    #[error("WebRTC error: {0}")]
    WebRTC(String),
}

impl From<PeerSessionError> for TransportError {
    fn from(e: PeerSessionError) -> Self {
        match e {
            PeerSessionError::Microphone(e) => TransportError::MediaAcquisition(e.to_string()),
            PeerSessionError::Signaling(e) => TransportError::ConnectionFailed(e.to_string()),
            PeerSessionError::WebRTC(msg) => TransportError::Negotiation(msg),
            PeerSessionError::NoActiveSession | PeerSessionError::Cancelled => {
                TransportError::NotConnected
            }
            PeerSessionError::AlreadyActive => {
                TransportError::ConnectionFailed(PeerSessionError::AlreadyActive.to_string())
            }
        }
    }
}

fn webrtc_err(e: webrtc::Error) -> PeerSessionError {
    PeerSessionError::WebRTC(e.to_string())
}

// ============================================================================
// STATE & CONFIGURATION
// ============================================================================

/// Zustand der Peer-Sitzung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Uninitialized,
    Negotiating,
    Connected,
    Closed,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

#[derive(Debug, Clone)]
pub struct PeerSessionConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<RTCIceServer>,
    /// Loopback-Candidates sammeln (lokale Verbindungen ohne Netzwerk)
    pub include_loopback: bool,
}

impl PeerSessionConfig {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ice_servers: default_ice_servers(),
            include_loopback: false,
        }
    }

    /// ICE Server aus einer Liste von URLs
    pub fn with_ice_urls(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };
        self
    }
}

// ============================================================================
// SESSION LIFECYCLE
// ============================================================================

/// Handler einer Sitzung, geteilt mit den WebRTC-Callbacks
///
/// Nach `finish` sind die Handler weg, spätere Callbacks laufen ins Leere.
struct SessionLifecycle {
    session_id: String,
    handlers: Mutex<Option<Arc<dyn SessionHandlers>>>,
    state: Arc<Mutex<PeerState>>,
}

impl SessionLifecycle {
    fn handlers(&self) -> Option<Arc<dyn SessionHandlers>> {
        self.handlers.lock().clone()
    }

    fn connected(&self) {
        if let Some(handlers) = self.handlers() {
            *self.state.lock() = PeerState::Connected;
            handlers.on_session_started(&self.session_id);
        }
    }

    fn failed(&self) {
        if let Some(handlers) = self.handlers() {
            handlers.on_error(TransportError::PeerConnectionFailed);
        }
        self.finish();
    }

    /// Kanonisches Ende, höchstens einmal
    fn finish(&self) {
        let handlers = self.handlers.lock().take();
        if let Some(handlers) = handlers {
            *self.state.lock() = PeerState::Closed;
            handlers.on_session_ended();
        }
    }
}

struct ActiveSession {
    peer_connection: Arc<RTCPeerConnection>,
    signaling: SignalingClient,
    local_stream: LocalMediaStream,
    lifecycle: Arc<SessionLifecycle>,
    tasks: Vec<JoinHandle<()>>,
}

// ============================================================================
// PEER SESSION CLIENT
// ============================================================================

/// Direkte WebRTC-Verbindung mit Signaling über WebSocket
pub struct PeerSessionClient {
    config: PeerSessionConfig,
    microphone: Arc<dyn Microphone>,
    state: Arc<Mutex<PeerState>>,
    active: Mutex<Option<ActiveSession>>,
    /// Wird von `close_connection` erhöht, laufende Aufbauten verfallen damit
    generation: AtomicU64,
}

impl PeerSessionClient {
    pub fn new(config: PeerSessionConfig, microphone: Arc<dyn Microphone>) -> Self {
        Self {
            config,
            microphone,
            state: Arc::new(Mutex::new(PeerState::Uninitialized)),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// Keine Peer Connection, kein Signaling, kein Mikrofon
    pub fn is_released(&self) -> bool {
        self.active.lock().is_none()
    }

    /// Baut Signaling, Mikrofon und Peer Connection auf
    ///
    /// Entweder steht danach alles oder nichts: bei einem Fehler sind
    /// Mikrofon und Signaling wieder freigegeben.
    pub async fn initialize_call(
        &self,
        session_id: &str,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Result<(), PeerSessionError> {
        // Reste einer fehlgeschlagenen Sitzung abräumen
        if self.state() == PeerState::Closed && !self.is_released() {
            let _ = self.close_connection().await;
        }

        let generation = {
            let mut state = self.state.lock();
            if *state == PeerState::Negotiating || *state == PeerState::Connected {
                return Err(PeerSessionError::AlreadyActive);
            }
            *state = PeerState::Negotiating;
            self.generation.load(Ordering::SeqCst)
        };

        let session = match self.build_session(session_id, handlers).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to initialize peer session: {}", e);
                if self.generation.load(Ordering::SeqCst) == generation {
                    *self.state.lock() = PeerState::Uninitialized;
                }
                return Err(e);
            }
        };

        // Nur übernehmen, wenn zwischendurch niemand geschlossen hat
        let stale = {
            let mut active = self.active.lock();
            if self.generation.load(Ordering::SeqCst) == generation {
                *active = Some(session);
                None
            } else {
                Some(session)
            }
        };

        match stale {
            None => {
                tracing::info!("Peer session {} initialized", session_id);
                Ok(())
            }
            Some(session) => {
                tracing::info!("Peer session {} closed during negotiation", session_id);
                // Kein Ende-Signal für eine Sitzung, die nie übergeben wurde
                session.lifecycle.handlers.lock().take();
                let _ = Self::release(session).await;
                Err(PeerSessionError::Cancelled)
            }
        }
    }

    async fn build_session(
        &self,
        session_id: &str,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Result<ActiveSession, PeerSessionError> {
        let (signaling, signaling_events) =
            SignalingClient::connect(&self.config.signaling_url, session_id).await?;

        // Ab hier räumen Drop-Impls Signaling und Mikrofon bei Fehlern auf
        let mut local_stream = self.microphone.acquire().await?;

        let pc = self.create_peer_connection().await?;

        let lifecycle = Arc::new(SessionLifecycle {
            session_id: session_id.to_string(),
            handlers: Mutex::new(Some(handlers)),
            state: Arc::clone(&self.state),
        });

        match Self::attach(&pc, &signaling, &mut local_stream, &lifecycle, signaling_events).await {
            Ok(tasks) => Ok(ActiveSession {
                peer_connection: pc,
                signaling,
                local_stream,
                lifecycle,
                tasks,
            }),
            Err(e) => {
                // Handler vor dem Schließen lösen, sonst meldet der Closed-Callback ein Ende
                lifecycle.handlers.lock().take();
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    /// Erstellt eine neue Peer Connection mit PCMU
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, PeerSessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: 0,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_include_loopback_candidate(self.config.include_loopback);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }

    /// Lokaler Track, Callbacks und Hintergrund-Tasks
    async fn attach(
        pc: &Arc<RTCPeerConnection>,
        signaling: &SignalingClient,
        local_stream: &mut LocalMediaStream,
        lifecycle: &Arc<SessionLifecycle>,
        signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> Result<Vec<JoinHandle<()>>, PeerSessionError> {
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_string(),
            "call-session".to_string(),
        ));

        let rtp_sender = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        let mut tasks = Vec::new();

        // RTCP lesen, damit Interceptors (NACK etc.) arbeiten
        tasks.push(tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        }));

        // Connection State Handler
        let lc = Arc::clone(lifecycle);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            match s {
                RTCPeerConnectionState::Connected => lc.connected(),
                RTCPeerConnectionState::Failed => lc.failed(),
                RTCPeerConnectionState::Closed => lc.finish(),
                _ => {}
            }
            Box::pin(async {})
        }));

        // Lokale ICE Candidates über Signaling weiterreichen
        let signaling_tx = signaling.sender();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling_tx = signaling_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let result = match candidate.to_json() {
                    Ok(init) => {
                        send_message(&signaling_tx, &SignalingMessage::IceCandidate(init)).await
                    }
                    Err(e) => Err(SignalingError::SendFailed(e.to_string())),
                };
                if let Err(e) = result {
                    tracing::warn!("Failed to relay ICE candidate: {}", e);
                }
            })
        }));

        // Eingehendes Audio als Frames an die Handler
        let lc = Arc::clone(lifecycle);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let lc = Arc::clone(&lc);
            Box::pin(async move {
                tracing::info!("Received track: {}", track.codec().capability.mime_type);
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        let Some(handlers) = lc.handlers() else {
                            break;
                        };
                        handlers.on_audio_frame(InboundAudioFrame::binary(
                            packet.payload.to_vec(),
                            packet.header.timestamp as u64,
                        ));
                    }
                });
            })
        }));

        tasks.push(tokio::spawn(Self::run_signaling(
            Arc::clone(pc),
            signaling.sender(),
            Arc::clone(lifecycle),
            signaling_events,
        )));

        if let Some(frames) = local_stream.take_frames() {
            let track = local_stream.audio_tracks().first().cloned();
            tasks.push(tokio::spawn(async move {
                let mut frames = frames;
                while let Some(mut frame) = frames.recv().await {
                    if track.as_ref().is_some_and(|t| !t.is_enabled()) {
                        frame.iter_mut().for_each(|s| *s = 0.0);
                    }
                    let sample = Sample {
                        data: Bytes::from(encode_mu_law(&frame)),
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = audio_track.write_sample(&sample).await {
                        tracing::debug!("Failed to write microphone sample: {}", e);
                    }
                }
            }));
        }

        tracing::debug!("Peer connection attached ({} Hz PCMU)", MULAW_SAMPLE_RATE);
        Ok(tasks)
    }

    /// Verarbeitet Signaling-Nachrichten in Ankunftsreihenfolge
    async fn run_signaling(
        pc: Arc<RTCPeerConnection>,
        signaling_tx: mpsc::Sender<String>,
        lifecycle: Arc<SessionLifecycle>,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::Message(SignalingMessage::Offer(offer)) => {
                    if let Err(e) = Self::answer_offer(&pc, &signaling_tx, offer).await {
                        tracing::error!("Error handling offer: {}", e);
                        if let Some(handlers) = lifecycle.handlers() {
                            handlers.on_error(TransportError::Negotiation(e.to_string()));
                        }
                    }
                }
                SignalingEvent::Message(SignalingMessage::Answer(answer)) => {
                    if let Err(e) = pc.set_remote_description(answer).await {
                        tracing::error!("Error handling answer: {}", e);
                        if let Some(handlers) = lifecycle.handlers() {
                            handlers.on_error(TransportError::Negotiation(e.to_string()));
                        }
                    }
                }
                SignalingEvent::Message(SignalingMessage::IceCandidate(candidate)) => {
                    Self::add_candidate(&pc, candidate).await;
                }
                SignalingEvent::Disconnected => {
                    tracing::warn!("Signaling channel closed");
                    break;
                }
            }
        }
    }

    async fn answer_offer(
        pc: &RTCPeerConnection,
        signaling_tx: &mpsc::Sender<String>,
        offer: RTCSessionDescription,
    ) -> Result<(), PeerSessionError> {
        pc.set_remote_description(offer).await.map_err(webrtc_err)?;
        let answer = pc.create_answer(None).await.map_err(webrtc_err)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        send_message(signaling_tx, &SignalingMessage::Answer(answer)).await?;
        Ok(())
    }

    async fn add_candidate(pc: &RTCPeerConnection, candidate: RTCIceCandidateInit) {
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            tracing::warn!("Error adding ICE candidate: {}", e);
        }
    }

    /// Erstellt ein Offer und schickt es an die Gegenseite
    pub async fn send_offer(&self) -> Result<(), PeerSessionError> {
        let (pc, signaling_tx) = {
            let active = self.active.lock();
            let session = active.as_ref().ok_or(PeerSessionError::NoActiveSession)?;
            (
                Arc::clone(&session.peer_connection),
                session.signaling.sender(),
            )
        };

        let offer = pc.create_offer(None).await.map_err(webrtc_err)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        send_message(&signaling_tx, &SignalingMessage::Offer(offer)).await?;
        Ok(())
    }

    /// Schaltet den ersten Audio-Track um und gibt den neuen Mute-Status zurück
    pub fn toggle_mute(&self) -> bool {
        let active = self.active.lock();
        let Some(track) = active
            .as_ref()
            .and_then(|s| s.local_stream.audio_tracks().first())
        else {
            return false;
        };

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::info!("Microphone {}", if enabled { "unmuted" } else { "muted" });
        !enabled
    }

    /// Gibt Mikrofon, Peer Connection und Signaling frei. Idempotent.
    ///
    /// Während eines laufenden `initialize_call` verwirft das den Aufbau:
    /// `initialize_call` gibt dann `Cancelled` zurück und hinterlässt nichts.
    pub async fn close_connection(&self) -> Result<(), PeerSessionError> {
        let session = {
            let mut active = self.active.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            active.take()
        };

        let Some(session) = session else {
            let mut state = self.state.lock();
            if *state == PeerState::Negotiating {
                tracing::info!("Peer session closed during negotiation");
                *state = PeerState::Closed;
            }
            return Ok(());
        };

        let lifecycle = Arc::clone(&session.lifecycle);
        let result = Self::release(session).await;
        lifecycle.finish();
        *self.state.lock() = PeerState::Closed;

        tracing::info!("Peer session {} closed", lifecycle.session_id);
        result
    }

    async fn release(session: ActiveSession) -> Result<(), PeerSessionError> {
        let ActiveSession {
            peer_connection,
            signaling,
            mut local_stream,
            tasks,
            ..
        } = session;

        local_stream.stop_all();
        for task in &tasks {
            task.abort();
        }

        let result = peer_connection.close().await.map_err(webrtc_err);
        signaling.disconnect();
        result
    }
}

impl std::fmt::Debug for PeerSessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSessionClient")
            .field("signaling_url", &self.config.signaling_url)
            .field("state", &self.state())
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[async_trait]
impl Transport for PeerSessionClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Peer
    }

    async fn connect(
        &self,
        target: &str,
        handlers: Arc<dyn SessionHandlers>,
    ) -> Result<(), TransportError> {
        self.initialize_call(target, handlers)
            .await
            .map_err(Into::into)
    }

    async fn toggle_mute(&self) -> Result<bool, TransportError> {
        if self.is_released() {
            return Err(TransportError::NotConnected);
        }
        Ok(PeerSessionClient::toggle_mute(self))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.close_connection()
            .await
            .map_err(|e| TransportError::Teardown(e.to_string()))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub(crate) fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_string(),
        clock_rate: MULAW_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

// ============================================================================
// TESTS
// ============================================================================
