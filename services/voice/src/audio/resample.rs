//! Sample-rate conversion between audio devices and the relay.

use crate::error::AudioError;
use livechat_core::pcm::AudioBlock;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Input frames fed to the resampler per call.
const RESAMPLER_CHUNK: usize = 512;
/// Smaller chunks for playback keep the held-back tail short.
const STREAM_CHUNK: usize = 64;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: u32,
    out_sampling_rate: u32,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, AudioError> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate as f64 / in_sampling_rate as f64,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Converts one continuous signal, such as a session's playback, block by block.
///
/// A single resampler lives for the whole stream, so its filter history
/// carries across block boundaries. Input that does not fill a resampler
/// chunk is held until the next call. The resampler's start-up delay is
/// trimmed from the first output after creation or [`reset`](Self::reset).
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    skip: usize,
}

impl StreamResampler {
    pub fn new(in_sampling_rate: u32, out_sampling_rate: u32) -> Result<Self, AudioError> {
        let resampler = if in_sampling_rate == out_sampling_rate {
            None
        } else {
            Some(create_resampler(in_sampling_rate, out_sampling_rate, STREAM_CHUNK)?)
        };
        let skip = resampler.as_ref().map_or(0, |r| r.output_delay());
        Ok(Self {
            resampler,
            pending: Vec::new(),
            skip,
        })
    }

    /// Converts the next stretch of the signal.
    pub fn process(&mut self, samples: Vec<f32>) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples);
        };
        self.pending.extend_from_slice(&samples);

        let chunks = self.pending.len() / resampler.input_frames_next();
        let mut out = Vec::with_capacity(chunks * resampler.output_frames_max());
        let mut consumed = 0;
        while self.pending.len() - consumed >= resampler.input_frames_next() {
            let next = consumed + resampler.input_frames_next();
            let res = resampler.process(&[&self.pending[consumed..next]], None)?;
            out.extend_from_slice(&res[0]);
            consumed = next;
        }
        self.pending.drain(..consumed);

        let trimmed = self.skip.min(out.len());
        self.skip -= trimmed;
        out.drain(..trimmed);
        Ok(out)
    }

    /// Forgets held input and filter history, e.g. after playback was cut.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
            self.skip = resampler.output_delay();
        }
    }
}

/// Turns a continuous stream of device samples into fixed-size session blocks.
///
/// Samples are converted from the device rate to the session rate on the
/// way in; leftovers are carried over until the next push.
pub struct BlockFramer {
    resampler: Option<FastFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
    block_size: usize,
    sample_rate: u32,
}

impl BlockFramer {
    pub fn new(device_rate: u32, session_rate: u32, block_size: usize) -> Result<Self, AudioError> {
        let resampler = if device_rate == session_rate {
            None
        } else {
            Some(create_resampler(device_rate, session_rate, RESAMPLER_CHUNK)?)
        };
        Ok(Self {
            resampler,
            pending_in: Vec::new(),
            pending_out: Vec::with_capacity(block_size * 2),
            block_size: block_size.max(1),
            sample_rate: session_rate,
        })
    }

    /// Feeds device samples and returns every block that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<AudioBlock>, AudioError> {
        match &mut self.resampler {
            None => self.pending_out.extend_from_slice(samples),
            Some(resampler) => {
                self.pending_in.extend_from_slice(samples);
                while self.pending_in.len() >= resampler.input_frames_next() {
                    let chunk: Vec<f32> =
                        self.pending_in.drain(..resampler.input_frames_next()).collect();
                    let res = resampler.process(&[chunk], None)?;
                    self.pending_out.extend_from_slice(&res[0]);
                }
            }
        }

        let mut blocks = Vec::new();
        while self.pending_out.len() >= self.block_size {
            let rest = self.pending_out.split_off(self.block_size);
            let block = std::mem::replace(&mut self.pending_out, rest);
            blocks.push(AudioBlock::new(block, self.sample_rate));
        }
        Ok(blocks)
    }
}
