//! Ordered playback of the agent's audio.
//!
//! Inbound PCM frames are decoded into blocks and queued. Exactly one block
//! is handed to the output sink at a time; the next one starts only after
//! the sink signals that the previous block has finished.

use super::InterruptPolicy;
use crate::audio::OutputSink;
use livechat_core::pcm::AudioBlock;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub struct PlaybackDecoder {
    queue: VecDeque<AudioBlock>,
    in_flight: Option<oneshot::Receiver<()>>,
    sample_rate: u32,
    policy: InterruptPolicy,
    played: u64,
}

impl PlaybackDecoder {
    pub fn new(sample_rate: u32, policy: InterruptPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            sample_rate,
            policy,
            played: 0,
        }
    }

    /// Decodes one inbound frame and queues it behind anything already waiting.
    pub fn enqueue(&mut self, payload: &[u8], sink: &mut dyn OutputSink) {
        if payload.is_empty() {
            trace!("Ignoring empty audio frame.");
            return;
        }
        let block = AudioBlock::decode(payload, self.sample_rate);
        trace!(samples = block.len(), queued = self.queue.len(), "Queued agent audio.");
        self.queue.push_back(block);
        self.pump(sink);
    }

    /// Blocks waiting behind the one currently playing.
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_playing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Blocks handed to the sink so far.
    pub fn played(&self) -> u64 {
        self.played
    }

    /// Resolves when the in-flight block finishes. Pends forever when idle,
    /// so it can sit in a `select!` next to other event sources.
    pub async fn finished(&mut self) {
        match self.in_flight.as_mut() {
            // A dropped sender means the sink abandoned the block; treat it as finished.
            Some(done) => {
                let _ = done.await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Advances to the next block once [`finished`](Self::finished) resolves.
    pub fn on_finished(&mut self, sink: &mut dyn OutputSink) {
        self.in_flight = None;
        self.pump(sink);
    }

    /// Discards every queued block and returns how many were dropped.
    ///
    /// The in-flight block keeps playing unless the policy is
    /// [`InterruptPolicy::CutCurrent`].
    pub fn interrupt(&mut self, sink: &mut dyn OutputSink) -> usize {
        let discarded = self.clear();
        if self.policy == InterruptPolicy::CutCurrent && self.in_flight.take().is_some() {
            if let Err(e) = sink.halt() {
                warn!(error = %e, "Failed to halt output sink.");
            }
        }
        debug!(discarded, "Playback interrupted.");
        discarded
    }

    /// Drops all queued audio without touching the sink.
    pub fn clear(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        discarded
    }

    fn pump(&mut self, sink: &mut dyn OutputSink) {
        while self.in_flight.is_none() {
            let Some(block) = self.queue.pop_front() else {
                return;
            };
            let (done_tx, done_rx) = oneshot::channel();
            trace!(millis = block.duration().as_millis() as u64, "Starting block.");
            match sink.play(block, done_tx) {
                Ok(()) => {
                    self.played += 1;
                    self.in_flight = Some(done_rx);
                }
                Err(e) => warn!(error = %e, "Output sink rejected a block; skipping it."),
            }
        }
    }
}
