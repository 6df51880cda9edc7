//! Turns microphone blocks into outbound PCM frames.

use super::BackpressurePolicy;
use super::channel::{AudioSender, Submit};
use bytes::Bytes;
use livechat_core::{level, pcm::AudioBlock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const STOP_GRACE: Duration = Duration::from_millis(500);

/// Frame counts for one capture run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Meters a block and encodes it for the wire.
pub fn encode_block(block: &AudioBlock, level: &watch::Sender<f32>) -> Bytes {
    level.send_replace(level::rms(block.samples()));
    block.encode()
}

/// The running encoder task for one session.
pub struct CaptureEncoder {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<CaptureStats>,
}

impl CaptureEncoder {
    /// Starts forwarding every block from `blocks` to the relay.
    pub fn spawn(
        blocks: mpsc::Receiver<AudioBlock>,
        sender: AudioSender,
        level: Arc<watch::Sender<f32>>,
        policy: BackpressurePolicy,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(blocks, sender, level, policy, stop_rx));
        Self {
            stop: Some(stop_tx),
            task,
        }
    }

    /// Stops the encoder. Blocks not yet encoded are discarded.
    pub async fn stop(mut self) -> CaptureStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let abort = self.task.abort_handle();
        match tokio::time::timeout(STOP_GRACE, &mut self.task).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                warn!(error = %e, "Capture encoder task failed.");
                CaptureStats::default()
            }
            Err(_) => {
                warn!("Capture encoder did not stop in time; aborting.");
                abort.abort();
                CaptureStats::default()
            }
        }
    }
}

async fn run(
    mut blocks: mpsc::Receiver<AudioBlock>,
    sender: AudioSender,
    level: Arc<watch::Sender<f32>>,
    policy: BackpressurePolicy,
    mut stop: oneshot::Receiver<()>,
) -> CaptureStats {
    let mut stats = CaptureStats::default();
    loop {
        let block = tokio::select! {
            biased;
            _ = &mut stop => break,
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };
        let frame = encode_block(&block, &level);
        let outcome = tokio::select! {
            biased;
            _ = &mut stop => break,
            outcome = sender.submit(frame, policy) => outcome,
        };
        match outcome {
            Submit::Sent => stats.sent += 1,
            Submit::Dropped => {
                stats.dropped += 1;
                trace!(dropped = stats.dropped, "Connection busy; dropped capture frame.");
            }
            Submit::Closed => {
                debug!("Outbound channel closed; capture encoder exiting.");
                break;
            }
        }
    }
    debug!(sent = stats.sent, dropped = stats.dropped, "Capture encoder stopped.");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use livechat_core::pcm::decode_pcm16_to_f32;

    fn level_channel() -> (Arc<watch::Sender<f32>>, watch::Receiver<f32>) {
        let (tx, rx) = watch::channel(0.0);
        (Arc::new(tx), rx)
    }

    #[test]
    fn test_encode_block_updates_level() {
        let (level, rx) = level_channel();
        let block = AudioBlock::new(vec![0.5, -0.5, 0.5, -0.5], 16_000);

        let frame = encode_block(&block, &level);

        assert_eq!(frame.len(), 8);
        assert_eq!(decode_pcm16_to_f32(&frame), vec![0.5, -0.5, 0.5, -0.5]);
        assert_relative_eq!(*rx.borrow(), 0.5, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_frames_follow_capture_order() {
        let (level, rx) = level_channel();
        let (blocks_tx, blocks_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let encoder = CaptureEncoder::spawn(
            blocks_rx,
            AudioSender::new(out_tx),
            level,
            BackpressurePolicy::Drop,
        );

        blocks_tx.send(AudioBlock::new(vec![0.25; 4096], 16_000)).await.unwrap();
        blocks_tx.send(AudioBlock::new(vec![-0.75; 4096], 16_000)).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.len(), 8192);
        assert_eq!(decode_pcm16_to_f32(&first)[0], 0.25);
        assert_eq!(decode_pcm16_to_f32(&second)[0], -0.75);
        assert_relative_eq!(*rx.borrow(), 0.75, epsilon = 1e-6);

        drop(blocks_tx);
        let stats = encoder.stop().await;
        assert_eq!(stats, CaptureStats { sent: 2, dropped: 0 });
    }

    #[tokio::test]
    async fn test_drop_policy_discards_when_connection_is_busy() {
        let (level, _rx) = level_channel();
        let (blocks_tx, blocks_rx) = mpsc::channel(4);
        // Nobody reads the outbound side; only one frame fits.
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let encoder = CaptureEncoder::spawn(
            blocks_rx,
            AudioSender::new(out_tx),
            level,
            BackpressurePolicy::Drop,
        );

        for value in [0.125, 0.25, 0.375] {
            blocks_tx.send(AudioBlock::new(vec![value; 8], 16_000)).await.unwrap();
        }
        drop(blocks_tx);

        let stats = tokio::time::timeout(Duration::from_secs(5), encoder.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, CaptureStats { sent: 1, dropped: 2 });
        let kept = out_rx.recv().await.unwrap();
        assert_eq!(decode_pcm16_to_f32(&kept)[0], 0.125);
    }

    #[tokio::test]
    async fn test_wait_policy_keeps_every_frame() {
        let (level, _rx) = level_channel();
        let (blocks_tx, blocks_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let encoder = CaptureEncoder::spawn(
            blocks_rx,
            AudioSender::new(out_tx),
            level,
            BackpressurePolicy::Wait,
        );

        for value in [0.125, 0.25, 0.375] {
            blocks_tx.send(AudioBlock::new(vec![value; 8], 16_000)).await.unwrap();
        }
        drop(blocks_tx);

        let mut received = Vec::new();
        while let Some(frame) = out_rx.recv().await {
            received.push(decode_pcm16_to_f32(&frame)[0]);
        }
        assert_eq!(received, vec![0.125, 0.25, 0.375]);
        assert_eq!(encoder.stop().await, CaptureStats { sent: 3, dropped: 0 });
    }
}
