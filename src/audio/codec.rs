//! Codec-Hilfsfunktionen
//!
//! G.711 µ-law (PCMU) in beide Richtungen, 16-bit PCM und ein einfaches
//! lineares Resampling. Das Media-Stream-Backend liefert µ-law mit 8kHz,
//! der Peer-Pfad verhandelt ebenfalls PCMU.

use super::AudioError;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate von G.711
pub const MULAW_SAMPLE_RATE: u32 = 8000;

/// Samples pro 20ms Frame bei 8kHz
pub const MULAW_FRAME_SAMPLES: usize = 160;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

// ============================================================================
// PAYLOAD FORMAT
// ============================================================================

/// Kodierung der eingehenden Audio-Payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// G.711 µ-law, mono
    MuLaw { sample_rate: u32 },
    /// Signed 16-bit little-endian PCM, mono
    Pcm16Le { sample_rate: u32 },
}

impl PayloadFormat {
    pub fn sample_rate(&self) -> u32 {
        match self {
            PayloadFormat::MuLaw { sample_rate } | PayloadFormat::Pcm16Le { sample_rate } => {
                *sample_rate
            }
        }
    }

    /// Dekodiert rohe Bytes zu f32-Samples im Bereich [-1.0, 1.0]
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, AudioError> {
        if bytes.is_empty() {
            return Err(AudioError::Decode("empty audio frame".to_string()));
        }

        match self {
            PayloadFormat::MuLaw { .. } => Ok(bytes
                .iter()
                .map(|&b| i16_to_f32(mu_law_to_linear(b)))
                .collect()),
            PayloadFormat::Pcm16Le { .. } => {
                if bytes.len() % 2 != 0 {
                    return Err(AudioError::Decode(format!(
                        "PCM16 frame has odd length {}",
                        bytes.len()
                    )));
                }
                Ok(bytes
                    .chunks_exact(2)
                    .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
                    .collect())
            }
        }
    }
}

impl Default for PayloadFormat {
    fn default() -> Self {
        PayloadFormat::MuLaw {
            sample_rate: MULAW_SAMPLE_RATE,
        }
    }
}

// ============================================================================
// G.711 µ-LAW
// ============================================================================

/// Wandelt ein lineares PCM-Sample in µ-law um
fn linear_to_mu_law(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };

    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Wandelt ein µ-law Byte in ein lineares PCM-Sample um
fn mu_law_to_linear(byte: u8) -> i16 {
    let inverted = !byte;
    let negative = (inverted & 0x80) != 0;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = (inverted & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if negative {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Kodiert f32-Samples als µ-law
pub fn encode_mu_law(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| linear_to_mu_law(f32_to_i16(s)))
        .collect()
}

// ============================================================================
// SAMPLE HELPERS
// ============================================================================

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Einfaches lineares Resampling (Mono)
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = ((samples.len() as f32) * ratio) as usize;

    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = samples.get(idx).copied().unwrap_or(0.0);
            let s2 = samples.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mu_law_reference_values() {
        assert_eq!(linear_to_mu_law(0), 0xFF);
        assert_eq!(mu_law_to_linear(0xFF), 0);
        assert_eq!(mu_law_to_linear(0x00), -32124);
        assert_eq!(mu_law_to_linear(0x80), 32124);
    }

    #[test]
    fn test_mu_law_quantization_error_is_small() {
        for &sample in &[-30000i16, -1000, -100, 0, 50, 1000, 12345, 30000] {
            let decoded = mu_law_to_linear(linear_to_mu_law(sample));
            let error = (decoded as i32 - sample as i32).abs();
            assert!(
                error <= (sample as i32).abs() / 8 + 16,
                "sample {} decoded to {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_odd_frames() {
        assert!(PayloadFormat::default().decode(&[]).is_err());

        let pcm = PayloadFormat::Pcm16Le { sample_rate: 16000 };
        assert!(pcm.decode(&[0x01, 0x02, 0x03]).is_err());
        let samples = pcm.decode(&[0x00, 0x40, 0x00, 0xC0]).unwrap();
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_resample_changes_length_by_ratio() {
        let samples = vec![0.25f32; MULAW_FRAME_SAMPLES];
        let upsampled = resample_linear(&samples, MULAW_SAMPLE_RATE, 48000);
        assert_eq!(upsampled.len(), MULAW_FRAME_SAMPLES * 6);
        assert!(upsampled.iter().all(|s| (*s - 0.25).abs() < f32::EPSILON));

        let same = resample_linear(&samples, 8000, 8000);
        assert_eq!(same.len(), samples.len());
    }
}
