//! The session state machine.
//!
//! A [`SessionController`] is a handle to a single actor task. The task owns
//! every resource a session acquires and is the only place state changes
//! happen. Host commands, relay frames and playback completions are all
//! multiplexed into that one task, so they are handled strictly one at a time.

use super::{
    SessionConfig, SessionHandler,
    capture::CaptureEncoder,
    channel::{ChannelEvent, ControlChannel},
    playback::PlaybackDecoder,
};
use crate::audio::{AudioInput, AudioOutput, CaptureSpec, InputHandle, OutputSink, PlaybackSpec};
use crate::error::SessionError;
use livechat_core::{
    SessionState,
    protocol::{ControlMessage, InboundFrame},
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Toggle,
    Start,
    Stop,
    Shutdown,
}

/// Host-facing handle to the voice session.
///
/// Commands are queued and applied in order: a `toggle()` issued while a
/// transition is in progress takes effect once that transition settles.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    level: watch::Receiver<f32>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Spawns the controller task. Must be called within a Tokio runtime.
    pub fn new(
        config: SessionConfig,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (level_tx, level_rx) = watch::channel(0.0f32);

        let actor = SessionActor {
            config,
            input,
            output,
            handler,
            commands: commands_rx,
            state: state_tx,
            level: Arc::new(level_tx),
            sessions: 0,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            level: level_rx,
            task,
        }
    }

    /// Starts a session when idle or closed, stops it otherwise.
    pub fn toggle(&self) -> Result<(), SessionError> {
        self.send(Command::Toggle)
    }

    /// Starts a session unless one is already running.
    pub fn start(&self) -> Result<(), SessionError> {
        self.send(Command::Start)
    }

    /// Stops the running session, if any.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(Command::Stop)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    /// Latest microphone level in `[0, 1]`.
    pub fn level(&self) -> f32 {
        *self.level.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    /// Tears down any running session and stops the controller task.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        let _ = commands.send(Command::Shutdown);
        if let Err(e) = task.await {
            warn!(error = %e, "Session controller task failed.");
        }
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ControllerGone)
    }
}

/// What the controller does after a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Why a session start did not reach `Live`.
enum Abort {
    Failed(SessionError),
    Cancelled(Flow),
}

impl From<SessionError> for Abort {
    fn from(error: SessionError) -> Self {
        Abort::Failed(error)
    }
}

/// Everything one session holds. Filled in as the start sequence progresses
/// so teardown releases exactly what was acquired.
struct SessionResources {
    capture: Option<CaptureEncoder>,
    channel: Option<ControlChannel>,
    output: Option<Box<dyn OutputSink>>,
    input: Option<Box<dyn InputHandle>>,
    playback: PlaybackDecoder,
}

impl SessionResources {
    fn new(config: &SessionConfig) -> Self {
        Self {
            capture: None,
            channel: None,
            output: None,
            input: None,
            playback: PlaybackDecoder::new(config.output_sample_rate, config.interrupt),
        }
    }
}

struct SessionActor {
    config: SessionConfig,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    handler: Arc<dyn SessionHandler>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SessionState>,
    level: Arc<watch::Sender<f32>>,
    sessions: u64,
}

impl SessionActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Toggle | Command::Start => {
                    self.sessions += 1;
                    if self.run_session(self.sessions).await == Flow::Shutdown {
                        break;
                    }
                }
                Command::Stop => trace!("No session to stop."),
                Command::Shutdown => break,
            }
        }
        debug!("Session controller stopped.");
    }

    #[instrument(name = "voice_session", skip(self))]
    async fn run_session(&mut self, session: u64) -> Flow {
        self.state.send_replace(SessionState::Connecting);
        info!("Starting voice session.");

        let mut resources = SessionResources::new(&self.config);
        let outcome = match self.connect(&mut resources).await {
            Ok(()) => {
                self.state.send_replace(SessionState::Live);
                info!("Voice session is live.");
                Ok(self.drive(&mut resources).await)
            }
            Err(abort) => Err(abort),
        };

        self.teardown(resources).await;

        match outcome {
            Ok(flow) => flow,
            Err(Abort::Cancelled(flow)) => {
                info!("Voice session cancelled while connecting.");
                flow
            }
            Err(Abort::Failed(error)) => {
                warn!(%error, "Voice session failed to start.");
                self.handler.on_error(&error);
                Flow::Continue
            }
        }
    }

    /// Acquires the microphone, the output sink and the relay connection, in that order.
    async fn connect(&mut self, resources: &mut SessionResources) -> Result<(), Abort> {
        let (blocks_tx, blocks_rx) = mpsc::channel(self.config.frame_buffer.max(1));
        let capture_spec = CaptureSpec {
            sample_rate: self.config.input_sample_rate,
            block_size: self.config.block_size,
        };
        let mic = until_cancelled(&mut self.commands, self.input.acquire(capture_spec, blocks_tx))
            .await?;
        resources.input = Some(mic);

        let playback_spec = PlaybackSpec {
            sample_rate: self.config.output_sample_rate,
        };
        let sink = until_cancelled(&mut self.commands, self.output.acquire(playback_spec)).await?;
        resources.output = Some(sink);

        let channel = until_cancelled(
            &mut self.commands,
            ControlChannel::open(
                &self.config.endpoint,
                self.config.connect_timeout,
                self.config.frame_buffer,
            ),
        )
        .await?;

        let sender = channel.audio_sender().ok_or_else(|| {
            SessionError::ChannelOpen("outbound queue closed before capture started".to_string())
        })?;
        resources.channel = Some(channel);
        resources.capture = Some(CaptureEncoder::spawn(
            blocks_rx,
            sender,
            self.level.clone(),
            self.config.backpressure,
        ));
        Ok(())
    }

    /// Runs a live session until the host stops it or the relay goes away.
    async fn drive(&mut self, resources: &mut SessionResources) -> Flow {
        let (Some(channel), Some(sink)) = (resources.channel.as_mut(), resources.output.as_mut())
        else {
            return Flow::Continue;
        };
        let playback = &mut resources.playback;

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Start) => trace!("Session already live."),
                    Some(Command::Toggle | Command::Stop) => {
                        info!("Stopping voice session.");
                        return Flow::Continue;
                    }
                    Some(Command::Shutdown) | None => return Flow::Shutdown,
                },
                event = channel.next_event() => match event {
                    ChannelEvent::Frame(frame) => self.dispatch(frame, playback, &mut **sink),
                    ChannelEvent::Closed(None) => {
                        info!("Relay closed the connection.");
                        return Flow::Continue;
                    }
                    ChannelEvent::Closed(Some(reason)) => {
                        let error = SessionError::ChannelRuntime(reason);
                        warn!(%error, "Ending voice session.");
                        return Flow::Continue;
                    }
                },
                _ = playback.finished() => playback.on_finished(&mut **sink),
            }
        }
    }

    fn dispatch(&self, frame: InboundFrame, playback: &mut PlaybackDecoder, sink: &mut dyn OutputSink) {
        match frame {
            InboundFrame::Audio(payload) => playback.enqueue(&payload, sink),
            InboundFrame::Control(ControlMessage::ToolCall { name, result }) => {
                debug!(tool = %name, "Agent called a tool.");
                self.handler.on_tool_call(&name, &result);
            }
            InboundFrame::Control(ControlMessage::Text { text }) => {
                if !text.is_empty() {
                    self.handler.on_ai_text(&text);
                }
            }
            InboundFrame::Control(ControlMessage::TurnComplete) => self.handler.on_turn_complete(),
            InboundFrame::Control(ControlMessage::Interrupted) => {
                playback.interrupt(sink);
            }
            InboundFrame::Control(ControlMessage::Unknown) => {}
        }
    }

    /// Releases everything in a fixed order. Every step runs even if an
    /// earlier one failed.
    async fn teardown(&self, resources: SessionResources) {
        let SessionResources {
            capture,
            channel,
            output,
            input,
            mut playback,
        } = resources;

        if let Some(capture) = capture {
            let stats = capture.stop().await;
            debug!(sent = stats.sent, dropped = stats.dropped, "Capture stopped.");
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(output) = output {
            if let Err(e) = output.release() {
                warn!(error = %e, "Failed to release output sink.");
            }
        }
        if let Some(input) = input {
            if let Err(e) = input.release() {
                warn!(error = %e, "Failed to release microphone.");
            }
        }
        let discarded = playback.clear();
        self.level.send_replace(0.0);
        self.state.send_replace(SessionState::Closed);
        info!(discarded, played = playback.played(), "Voice session closed.");
    }
}

/// Awaits `fut` unless a stop or shutdown command arrives first.
async fn until_cancelled<T, E, F>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    fut: F,
) -> Result<T, Abort>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SessionError>,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Start) => trace!("Session already starting."),
                Some(Command::Toggle | Command::Stop) => return Err(Abort::Cancelled(Flow::Continue)),
                Some(Command::Shutdown) | None => return Err(Abort::Cancelled(Flow::Shutdown)),
            },
            result = &mut fut => return result.map_err(|e| Abort::Failed(e.into())),
        }
    }
}
