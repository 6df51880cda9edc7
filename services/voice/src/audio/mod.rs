//! Audio device abstractions used by the voice session.
//!
//! The session only talks to [`AudioInput`] and [`AudioOutput`], so the cpal
//! backend in [`local`] can be swapped for any other source or sink.

pub mod local;
pub mod resample;

use crate::error::AudioError;
use async_trait::async_trait;
use livechat_core::pcm::AudioBlock;
use tokio::sync::{mpsc, oneshot};

/// Parameters for acquiring the microphone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSpec {
    /// Rate of the blocks handed to the session, regardless of the device rate.
    pub sample_rate: u32,
    /// Samples per block.
    pub block_size: usize,
}

/// Parameters for acquiring the output sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaybackSpec {
    /// Rate of the blocks the session will play.
    pub sample_rate: u32,
}

/// A microphone that can be acquired for one session.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Opens the device and starts delivering mono blocks of `spec.block_size` samples.
    ///
    /// Blocks are offered with `try_send`; a block the session is not ready
    /// for is dropped at the source.
    async fn acquire(
        &self,
        spec: CaptureSpec,
        blocks: mpsc::Sender<AudioBlock>,
    ) -> Result<Box<dyn InputHandle>, AudioError>;
}

/// Ownership of an open microphone stream.
pub trait InputHandle: Send {
    /// Stops the stream and gives the device back.
    fn release(self: Box<Self>) -> Result<(), AudioError>;
}

/// A speaker that can be acquired for one session.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn acquire(&self, spec: PlaybackSpec) -> Result<Box<dyn OutputSink>, AudioError>;
}

/// Ownership of an open output stream that plays one block at a time.
pub trait OutputSink: Send {
    /// Starts playing `block`, replacing anything still playing.
    ///
    /// `done` fires once the last sample has been handed to the device.
    fn play(&mut self, block: AudioBlock, done: oneshot::Sender<()>) -> Result<(), AudioError>;

    /// Silences the sink immediately, abandoning the current block.
    fn halt(&mut self) -> Result<(), AudioError>;

    /// Stops the stream and gives the device back.
    fn release(self: Box<Self>) -> Result<(), AudioError>;
}
