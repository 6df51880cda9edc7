//! Fakes shared by the session tests: scripted devices and a loopback relay.

use super::SessionHandler;
use crate::audio::{AudioInput, AudioOutput, CaptureSpec, InputHandle, OutputSink, PlaybackSpec};
use crate::error::{AudioError, SessionError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use livechat_core::{SessionState, pcm::AudioBlock};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

pub const WAIT: Duration = Duration::from_secs(5);

/// Polls `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Waits until the state channel reports `wanted`.
pub async fn wait_state(state: &mut watch::Receiver<SessionState>, wanted: SessionState) {
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted))
        .expect("controller stopped publishing state");
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

/// Counts device acquisitions and releases.
#[derive(Default, Debug)]
pub struct DeviceLedger {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    held: AtomicUsize,
    pub max_held: AtomicUsize,
}

impl DeviceLedger {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let held = self.held.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_held.fetch_max(held, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.held.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }
}

/// A microphone whose blocks are pushed by the test.
#[derive(Default)]
pub struct FakeInput {
    pub ledger: Arc<DeviceLedger>,
    pub deny: bool,
    blocks: Arc<Mutex<Option<mpsc::Sender<AudioBlock>>>>,
}

impl FakeInput {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Offers a block the way a device callback would.
    pub fn speak(&self, block: AudioBlock) -> bool {
        match self.blocks.lock().unwrap().as_ref() {
            Some(tx) => tx.try_send(block).is_ok(),
            None => false,
        }
    }
}

struct FakeInputHandle {
    ledger: Arc<DeviceLedger>,
    blocks: Arc<Mutex<Option<mpsc::Sender<AudioBlock>>>>,
}

impl InputHandle for FakeInputHandle {
    fn release(self: Box<Self>) -> Result<(), AudioError> {
        self.blocks.lock().unwrap().take();
        self.ledger.release();
        Ok(())
    }
}

#[async_trait]
impl AudioInput for FakeInput {
    async fn acquire(
        &self,
        _spec: CaptureSpec,
        blocks: mpsc::Sender<AudioBlock>,
    ) -> Result<Box<dyn InputHandle>, AudioError> {
        if self.deny {
            return Err(AudioError::Device("permission denied".to_string()));
        }
        self.ledger.acquire();
        *self.blocks.lock().unwrap() = Some(blocks);
        Ok(Box::new(FakeInputHandle {
            ledger: self.ledger.clone(),
            blocks: self.blocks.clone(),
        }))
    }
}

/// A block handed to the fake speaker, with the means to finish it.
pub struct PlayedBlock {
    pub block: AudioBlock,
    pub done: oneshot::Sender<()>,
}

/// A speaker that reports every block it is asked to play.
pub struct FakeOutput {
    pub ledger: Arc<DeviceLedger>,
    pub halts: Arc<AtomicUsize>,
    pub deny: bool,
    played: mpsc::UnboundedSender<PlayedBlock>,
}

impl FakeOutput {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlayedBlock>) {
        let (played, rx) = mpsc::unbounded_channel();
        let output = Self {
            ledger: Arc::default(),
            halts: Arc::default(),
            deny: false,
            played,
        };
        (output, rx)
    }

    /// A speaker that refuses to open.
    pub fn denied() -> Self {
        let (output, _played) = Self::new();
        Self {
            deny: true,
            ..output
        }
    }

    pub fn sink(&self) -> FakeSink {
        self.ledger.acquire();
        FakeSink {
            ledger: self.ledger.clone(),
            halts: self.halts.clone(),
            played: self.played.clone(),
        }
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn acquire(&self, _spec: PlaybackSpec) -> Result<Box<dyn OutputSink>, AudioError> {
        if self.deny {
            return Err(AudioError::Device("output device busy".to_string()));
        }
        Ok(Box::new(self.sink()))
    }
}

pub struct FakeSink {
    ledger: Arc<DeviceLedger>,
    pub halts: Arc<AtomicUsize>,
    played: mpsc::UnboundedSender<PlayedBlock>,
}

impl OutputSink for FakeSink {
    fn play(&mut self, block: AudioBlock, done: oneshot::Sender<()>) -> Result<(), AudioError> {
        self.played
            .send(PlayedBlock { block, done })
            .map_err(|_| AudioError::Stream("speaker gone".to_string()))
    }

    fn halt(&mut self) -> Result<(), AudioError> {
        self.halts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<(), AudioError> {
        self.ledger.release();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    ToolCall(String, serde_json::Value),
    Text(String),
    TurnComplete,
    Error(String),
}

/// Keeps every callback in arrival order.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<Recorded>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }
}

impl SessionHandler for RecordingHandler {
    fn on_tool_call(&self, name: &str, result: &serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::ToolCall(name.to_string(), result.clone()));
    }

    fn on_ai_text(&self, text: &str) {
        self.events.lock().unwrap().push(Recorded::Text(text.to_string()));
    }

    fn on_turn_complete(&self) {
        self.events.lock().unwrap().push(Recorded::TurnComplete);
    }

    fn on_error(&self, error: &SessionError) {
        let tag = match error {
            SessionError::DeviceAcquisition(_) => "device",
            SessionError::ChannelOpen(_) => "channel_open",
            SessionError::ChannelRuntime(_) => "channel_runtime",
            SessionError::MalformedControlMessage(_) => "malformed",
            SessionError::ControllerGone => "gone",
        };
        self.events.lock().unwrap().push(Recorded::Error(tag.to_string()));
    }
}

/// A loopback relay on an ephemeral port.
pub struct Relay {
    listener: TcpListener,
    pub url: String,
}

impl Relay {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/public/test/live-chat", listener.local_addr().unwrap());
        Self { listener, url }
    }

    /// Accepts the next client and completes the WebSocket handshake.
    pub async fn accept(&self) -> RelayPeer {
        let (tcp, _) = within(self.listener.accept()).await.unwrap();
        let ws = within(accept_async(tcp)).await.unwrap();
        RelayPeer { ws }
    }

    /// True when no client connects within `quiet`.
    pub async fn stays_quiet(&self, quiet: Duration) -> bool {
        tokio::time::timeout(quiet, self.listener.accept()).await.is_err()
    }

    /// Accepts the TCP connection but never answers the handshake.
    pub async fn accept_and_stall(&self) -> TcpStream {
        let (tcp, _) = within(self.listener.accept()).await.unwrap();
        tcp
    }
}

pub struct RelayPeer {
    pub ws: WebSocketStream<TcpStream>,
}

impl RelayPeer {
    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    pub async fn send_text(&mut self, raw: &str) {
        self.ws.send(Message::Text(raw.into())).await.unwrap();
    }

    pub async fn send_audio(&mut self, payload: Vec<u8>) {
        self.ws.send(Message::Binary(payload.into())).await.unwrap();
    }

    /// Next binary frame from the client, skipping control frames.
    pub async fn next_binary(&mut self) -> Option<Vec<u8>> {
        loop {
            match within(self.ws.next()).await? {
                Ok(Message::Binary(data)) => return Some(data.to_vec()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Waits for the client to go away.
    pub async fn closed(&mut self) {
        loop {
            match within(self.ws.next()).await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
