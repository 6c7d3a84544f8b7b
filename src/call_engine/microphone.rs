//! Mikrofon-Zugriff
//!
//! `Microphone` liefert einen `LocalMediaStream`: Audio-Tracks mit
//! Enabled-Flag plus einen Channel mit 20ms-Frames (160 Samples @ 8kHz).

use crate::audio::{
    resample_linear, select_best_config, AudioError, MULAW_FRAME_SAMPLES, MULAW_SAMPLE_RATE,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bevorzugte Capture-Rate des Geräts
const PREFERRED_INPUT_RATE: u32 = 48000;

/// Gepufferte Frames bevor neue verworfen werden (1 Sekunde)
const FRAME_QUEUE: usize = 50;

// ============================================================================
// TRACKS & STREAM
// ============================================================================

/// Ein lokaler Audio-Track
#[derive(Debug)]
pub struct LocalAudioTrack {
    id: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deaktivierte Tracks senden Stille
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

// cpal::Stream ist nicht Send. Er wird nur gehalten und beim Stoppen gedroppt.
struct CaptureStream(#[allow(dead_code)] Stream);
unsafe impl Send for CaptureStream {}
unsafe impl Sync for CaptureStream {}

/// Lokale Medien einer Sitzung
pub struct LocalMediaStream {
    tracks: Vec<Arc<LocalAudioTrack>>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    capture: Option<CaptureStream>,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<Arc<LocalAudioTrack>>, frames: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            tracks,
            frames: Some(frames),
            capture: None,
        }
    }

    pub fn audio_tracks(&self) -> &[Arc<LocalAudioTrack>] {
        &self.tracks
    }

    /// Übernimmt den Frame-Receiver (nur einmal möglich)
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    /// Stoppt alle Tracks und gibt das Gerät frei
    pub fn stop_all(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        self.frames = None;
        if self.capture.take().is_some() {
            tracing::info!("Microphone released");
        }
    }
}

impl Drop for LocalMediaStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("tracks", &self.tracks)
            .field("capturing", &self.capture.is_some())
            .finish()
    }
}

// ============================================================================
// MICROPHONE
// ============================================================================

#[async_trait]
pub trait Microphone: Send + Sync {
    /// Fordert das Mikrofon an
    async fn acquire(&self) -> Result<LocalMediaStream, AudioError>;
}

/// Standard-Eingabegerät über cpal
#[derive(Debug, Default, Clone)]
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self) -> Result<LocalMediaStream, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::PermissionDenied(e.to_string()))?;
        let config = select_best_config(configs.collect(), PREFERRED_INPUT_RATE)?;

        let source_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            source_rate,
            channels
        );

        let track = Arc::new(LocalAudioTrack::new(uuid::Uuid::new_v4().to_string()));
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let mut pending: Vec<f32> = Vec::with_capacity(MULAW_FRAME_SAMPLES * 2);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Auf Mono heruntermischen
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();

                    pending.extend(resample_linear(&mono, source_rate, MULAW_SAMPLE_RATE));

                    while pending.len() >= MULAW_FRAME_SAMPLES {
                        let frame: Vec<f32> = pending.drain(..MULAW_FRAME_SAMPLES).collect();
                        // Voller Channel: Frame verwerfen statt den Audio-Thread zu blockieren
                        let _ = frame_tx.try_send(frame);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        let mut local = LocalMediaStream::new(vec![track], frame_rx);
        local.capture = Some(CaptureStream(stream));
        Ok(local)
    }
}
