//! The duplex WebSocket connection to the live-chat relay.
//!
//! Binary frames carry raw PCM16 in both directions. Text frames from the
//! relay carry JSON control messages. The socket is split into a writer task
//! fed by a bounded queue and a reader task that classifies inbound frames
//! and forwards them in arrival order.

use super::BackpressurePolicy;
use crate::error::SessionError;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, stream::SplitStream};
use livechat_core::protocol::{ControlMessage, InboundFrame};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, instrument, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the writer gets to flush and send a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Inbound frames buffered between the reader task and the controller.
const INBOUND_QUEUE: usize = 64;

/// Something the relay did.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(InboundFrame),
    /// The connection ended, with the reason if it was not a clean close.
    Closed(Option<String>),
}

/// Result of offering one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Sent,
    Dropped,
    Closed,
}

/// Cloneable handle for pushing audio frames to the relay.
#[derive(Clone, Debug)]
pub struct AudioSender {
    tx: mpsc::Sender<Bytes>,
}

impl AudioSender {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queues `frame` for the writer, following `policy` when the queue is full.
    pub async fn submit(&self, frame: Bytes, policy: BackpressurePolicy) -> Submit {
        match policy {
            BackpressurePolicy::Drop => match self.tx.try_send(frame) {
                Ok(()) => Submit::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => Submit::Dropped,
                Err(mpsc::error::TrySendError::Closed(_)) => Submit::Closed,
            },
            BackpressurePolicy::Wait => match self.tx.send(frame).await {
                Ok(()) => Submit::Sent,
                Err(_) => Submit::Closed,
            },
        }
    }
}

pub struct ControlChannel {
    outbound: Option<mpsc::Sender<Bytes>>,
    events: mpsc::Receiver<ChannelEvent>,
    closed: bool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ControlChannel {
    /// Connects to `endpoint` and starts the reader and writer tasks.
    ///
    /// `frame_buffer` bounds how many outbound frames may wait for the socket.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn open(
        endpoint: &str,
        timeout: Duration,
        frame_buffer: usize,
    ) -> Result<Self, SessionError> {
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(endpoint))
            .await
            .map_err(|_| SessionError::ChannelOpen("handshake timed out".to_string()))?
            .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;
        info!("Connected to live-chat relay.");

        let (ws_tx, ws_rx) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(frame_buffer.max(1));
        let (events_tx, events_rx) = mpsc::channel(INBOUND_QUEUE);

        let writer = tokio::spawn(write_frames(ws_tx, outbound_rx, events_tx.clone()));
        let reader = tokio::spawn(read_frames(ws_rx, events_tx));

        Ok(Self {
            outbound: Some(outbound_tx),
            events: events_rx,
            closed: false,
            reader,
            writer,
        })
    }

    /// A handle for the capture encoder.
    pub fn audio_sender(&self) -> Option<AudioSender> {
        self.outbound.clone().map(AudioSender::new)
    }

    /// Next inbound event. Yields `Closed(None)` forever once the relay is gone.
    pub async fn next_event(&mut self) -> ChannelEvent {
        if self.closed {
            return ChannelEvent::Closed(None);
        }
        let event = self.events.recv().await.unwrap_or(ChannelEvent::Closed(None));
        if matches!(event, ChannelEvent::Closed(_)) {
            self.closed = true;
        }
        event
    }

    /// Closes the connection, giving the writer a moment to send a close frame.
    pub async fn close(mut self) {
        self.outbound.take();
        let abort = self.writer.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, &mut self.writer).await.is_err() {
            debug!("Writer did not finish closing in time; aborting.");
            abort.abort();
        }
        self.reader.abort();
        info!("Disconnected from live-chat relay.");
    }
}

async fn write_frames(
    mut ws_tx: futures_util::stream::SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<ChannelEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        trace!(bytes = frame.len(), "Sending audio frame.");
        if let Err(e) = ws_tx.send(WsMessage::Binary(frame)).await {
            let _ = events
                .send(ChannelEvent::Closed(Some(format!("send failed: {}", e))))
                .await;
            return;
        }
    }
    let _ = ws_tx.close().await;
}

async fn read_frames(mut ws_rx: SplitStream<WsStream>, events: mpsc::Sender<ChannelEvent>) {
    while let Some(msg) = ws_rx.next().await {
        let event = match msg {
            Ok(msg) => match classify(msg) {
                Classified::Frame(frame) => ChannelEvent::Frame(frame),
                Classified::Skip => continue,
                Classified::Closed(reason) => ChannelEvent::Closed(reason),
            },
            Err(e) => ChannelEvent::Closed(Some(e.to_string())),
        };
        let closed = matches!(event, ChannelEvent::Closed(_));
        if events.send(event).await.is_err() || closed {
            return;
        }
    }
    let _ = events.send(ChannelEvent::Closed(None)).await;
}

#[derive(Debug, PartialEq)]
enum Classified {
    Frame(InboundFrame),
    Skip,
    Closed(Option<String>),
}

fn classify(msg: WsMessage) -> Classified {
    match msg {
        WsMessage::Binary(data) => Classified::Frame(InboundFrame::Audio(data)),
        WsMessage::Text(text) => match ControlMessage::parse(text.as_str()) {
            Ok(ControlMessage::Unknown) => {
                debug!("Ignoring control message of unknown type.");
                Classified::Skip
            }
            Ok(message) => Classified::Frame(InboundFrame::Control(message)),
            Err(e) => {
                let error = SessionError::from(e);
                warn!(%error, "Dropping control message.");
                Classified::Skip
            }
        },
        WsMessage::Close(frame) => match frame {
            Some(frame) if u16::from(frame.code) != 1000 => Classified::Closed(Some(format!(
                "closed by relay ({}): {}",
                u16::from(frame.code),
                frame.reason.as_str()
            ))),
            _ => Classified::Closed(None),
        },
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Classified::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::Relay;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

    #[test]
    fn test_classify_frames() {
        assert_eq!(
            classify(WsMessage::Binary(Bytes::from_static(&[1, 2]))),
            Classified::Frame(InboundFrame::Audio(Bytes::from_static(&[1, 2])))
        );
        assert_eq!(
            classify(WsMessage::Text(r#"{"type":"turn_complete"}"#.into())),
            Classified::Frame(InboundFrame::Control(ControlMessage::TurnComplete))
        );
        assert_eq!(classify(WsMessage::Text(r#"{"type":"x"}"#.into())), Classified::Skip);
        assert_eq!(classify(WsMessage::Text("not json".into())), Classified::Skip);
        assert_eq!(classify(WsMessage::Ping(Bytes::new())), Classified::Skip);
        assert_eq!(classify(WsMessage::Close(None)), Classified::Closed(None));

        let abnormal = CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        };
        match classify(WsMessage::Close(Some(abnormal))) {
            Classified::Closed(Some(reason)) => assert!(reason.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_and_malformed_are_dropped() {
        let relay = Relay::bind().await;
        let url = relay.url.clone();
        let (channel, mut peer) = tokio::join!(
            ControlChannel::open(&url, Duration::from_secs(5), 1),
            relay.accept()
        );
        let mut channel = channel.unwrap();

        peer.send_json(json!({"type": "text", "text": "Hi"})).await;
        peer.send_text("{oops").await;
        peer.send_audio(vec![0, 0, 0, 64]).await;
        peer.send_json(json!({"type": "turn_complete"})).await;

        assert_eq!(
            channel.next_event().await,
            ChannelEvent::Frame(InboundFrame::Control(ControlMessage::Text {
                text: "Hi".to_string()
            }))
        );
        assert_eq!(
            channel.next_event().await,
            ChannelEvent::Frame(InboundFrame::Audio(Bytes::from_static(&[0, 0, 0, 64])))
        );
        assert_eq!(
            channel.next_event().await,
            ChannelEvent::Frame(InboundFrame::Control(ControlMessage::TurnComplete))
        );

        peer.close().await;
        assert_eq!(channel.next_event().await, ChannelEvent::Closed(None));
        assert_eq!(channel.next_event().await, ChannelEvent::Closed(None));
        channel.close().await;
    }

    #[tokio::test]
    async fn test_outbound_audio_is_binary() {
        let relay = Relay::bind().await;
        let url = relay.url.clone();
        let (channel, mut peer) = tokio::join!(
            ControlChannel::open(&url, Duration::from_secs(5), 4),
            relay.accept()
        );
        let channel = channel.unwrap();
        let sender = channel.audio_sender().unwrap();

        let outcome = sender
            .submit(Bytes::from_static(&[1, 0, 2, 0]), BackpressurePolicy::Wait)
            .await;
        assert_eq!(outcome, Submit::Sent);
        assert_eq!(peer.next_binary().await, Some(vec![1, 0, 2, 0]));

        drop(sender);
        channel.close().await;
        peer.closed().await;
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ControlChannel::open(&format!("ws://{}/", addr), Duration::from_secs(5), 1)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::ChannelOpen(_)));
    }
}
