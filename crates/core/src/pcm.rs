//! Conversion between floating point samples and 16-bit little-endian PCM.

use bytes::Bytes;
use std::time::Duration;

// Standard sample rates of the live-chat relay.
pub const RELAY_INPUT_SAMPLE_RATE: u32 = 16_000;
pub const RELAY_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Magnitude of the most negative PCM16 value; one quantization step is `1 / PCM16_SCALE`.
pub const PCM16_SCALE: f32 = 32768.0;

/// Quantizes one sample, saturating at both ends of the i16 range. NaN maps to 0.
pub fn encode_sample(sample: f32) -> i16 {
    // `as` saturates on overflow and maps NaN to zero.
    (sample * PCM16_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Maps one PCM16 value linearly into `[-1.0, 1.0)`.
pub fn decode_sample(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32.iter().map(|&s| encode_sample(s)).collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&s| decode_sample(s)).collect()
}

/// Encodes f32 samples into a little-endian PCM16 byte buffer ready for the wire.
pub fn encode_f32_to_pcm16(pcm32: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(pcm32.len() * 2);
    for &sample in pcm32 {
        out.extend_from_slice(&encode_sample(sample).to_le_bytes());
    }
    Bytes::from(out)
}

/// Decodes a little-endian PCM16 byte buffer into f32 samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_pcm16_to_f32(pcm16_bytes: &[u8]) -> Vec<f32> {
    let chunks = pcm16_bytes.chunks_exact(2);
    if !chunks.remainder().is_empty() {
        tracing::debug!(len = pcm16_bytes.len(), "PCM16 payload has a trailing odd byte");
    }
    chunks
        .map(|c| decode_sample(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// One decoded unit of audio, produced by capture or by the network.
///
/// Blocks are immutable once built and move by value from producer to
/// consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decodes a raw PCM16 LE payload received from the relay.
    pub fn decode(payload: &[u8], sample_rate: u32) -> Self {
        Self::new(decode_pcm16_to_f32(payload), sample_rate)
    }

    /// Encodes this block for transmission.
    pub fn encode(&self) -> Bytes {
        encode_f32_to_pcm16(&self.samples)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wall-clock length of the block when played at its sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}
