//! Audio-Ausgabe (Lautsprecher)
//!
//! Ein `AudioSink` entspricht einem Audio-Kontext: genau einer pro aktivem
//! Anruf. Die cpal-Implementierung spielt aus einem Ring-Buffer, in den
//! dekodierte Frames geschrieben werden.

use super::codec::resample_linear;
use super::AudioError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte Ausgabe-Rate
const PREFERRED_OUTPUT_RATE: u32 = 48000;

/// Puffer für zwei Sekunden Audio bei der Geräte-Rate
const BUFFER_SECONDS: usize = 2;

// ============================================================================
// TRAITS
// ============================================================================

/// Ziel für dekodierte Samples
pub trait AudioSink: Send + Sync {
    /// Reiht Mono-Samples mit der angegebenen Rate zur sofortigen Wiedergabe ein
    fn play(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError>;

    /// Gibt das Ausgabegerät frei. Mehrfacher Aufruf ist erlaubt.
    fn close(&self);
}

/// Erzeugt Audio-Kontexte
pub trait AudioBackend: Send + Sync {
    fn open_output(&self) -> Result<Box<dyn AudioSink>, AudioError>;
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Standard-Ausgabegerät über cpal
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_output(&self) -> Result<Box<dyn AudioSink>, AudioError> {
        Ok(Box::new(SpeakerOutput::open()?))
    }
}

/// Lautsprecher-Ausgabe mit Ring-Buffer
///
/// Note: Stream ist nicht Send, daher wird er hinter einem Mutex gehalten
pub struct SpeakerOutput {
    stream: Mutex<Option<Stream>>,
    buffer: Arc<Mutex<HeapRb<f32>>>,
    device_rate: u32,
}

// cpal::Stream ist nicht Send/Sync. Der Stream wird nur beim Schließen
// angefasst, und das geschieht unter dem Mutex.
unsafe impl Send for SpeakerOutput {}
unsafe impl Sync for SpeakerOutput {}

impl SpeakerOutput {
    /// Öffnet das Standard-Ausgabegerät und startet die Wiedergabe
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let config = find_best_output_config(&device)?;
        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Opening audio output: {} Hz, {} channels",
            device_rate,
            channels
        );

        let buffer = Arc::new(Mutex::new(HeapRb::new(
            device_rate as usize * BUFFER_SECONDS,
        )));
        let playback_buffer = Arc::clone(&buffer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    // Mono auf alle Kanäle verteilen
                    for frame in data.chunks_mut(channels) {
                        let sample = buffer.try_pop().unwrap_or(0.0);
                        for s in frame.iter_mut() {
                            *s = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            buffer,
            device_rate,
        })
    }
}

impl AudioSink for SpeakerOutput {
    fn play(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
        if self.stream.lock().is_none() {
            return Err(AudioError::Closed);
        }

        let resampled = resample_linear(samples, sample_rate, self.device_rate);
        let mut buffer = self.buffer.lock();
        let mut overflow = 0usize;
        for sample in resampled {
            if buffer.try_push(sample).is_err() {
                overflow += 1;
            }
        }
        if overflow > 0 {
            tracing::debug!("Playback buffer full, dropped {} samples", overflow);
        }
        Ok(())
    }

    fn close(&self) {
        if self.stream.lock().take().is_some() {
            tracing::info!("Audio output closed");
        }
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// DEVICE CONFIGURATION
// ============================================================================

fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect(), PREFERRED_OUTPUT_RATE)
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: Ziel-Rate mit F32 > F32 mit beliebiger Rate > erste Konfiguration
pub(crate) fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    preferred_rate: u32,
) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(preferred_rate);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    if let Some(config) = configs.first() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}
