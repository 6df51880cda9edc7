//! Real-time Voice Session
//!
//! This module contains everything that runs while a shopper talks to the
//! storefront agent. It is structured into submodules:
//!
//! - `channel`: The duplex WebSocket connection to the live-chat relay.
//! - `capture`: Meters and encodes microphone blocks into outbound frames.
//! - `playback`: Decodes inbound audio and plays it strictly in order.
//! - `controller`: The state machine that owns and tears down all of the above.

pub mod capture;
pub mod channel;
pub mod controller;
pub mod playback;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::SessionError;
use livechat_core::pcm::{RELAY_INPUT_SAMPLE_RATE, RELAY_OUTPUT_SAMPLE_RATE};
use std::{str::FromStr, time::Duration};

pub use controller::SessionController;

/// What the capture encoder does when the relay connection cannot take another frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Drop the frame and keep capturing in real time.
    #[default]
    Drop,
    /// Wait for the connection to accept the frame.
    Wait,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "wait" => Ok(Self::Wait),
            other => Err(format!("'{}' is not one of: drop, wait", other)),
        }
    }
}

/// What happens to the block that is already playing when the agent is interrupted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Let the in-flight block finish; only queued blocks are discarded.
    #[default]
    FinishCurrent,
    /// Halt the output sink immediately as well.
    CutCurrent,
}

impl FromStr for InterruptPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "finish" => Ok(Self::FinishCurrent),
            "cut" => Ok(Self::CutCurrent),
            other => Err(format!("'{}' is not one of: finish, cut", other)),
        }
    }
}

/// Settings fixed for the lifetime of one session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Fully built relay URL, including any identity parameters.
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Rate of the PCM sent to the relay.
    pub input_sample_rate: u32,
    /// Rate of the PCM received from the relay.
    pub output_sample_rate: u32,
    /// Samples per capture block.
    pub block_size: usize,
    /// Frames allowed in flight between capture and the socket.
    pub frame_buffer: usize,
    pub backpressure: BackpressurePolicy,
    pub interrupt: InterruptPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            connect_timeout: Duration::from_secs(10),
            input_sample_rate: RELAY_INPUT_SAMPLE_RATE,
            output_sample_rate: RELAY_OUTPUT_SAMPLE_RATE,
            block_size: 4096,
            frame_buffer: 1,
            backpressure: BackpressurePolicy::default(),
            interrupt: InterruptPolicy::default(),
        }
    }
}

/// The callback surface a host supplies to receive session side effects.
///
/// Callbacks run on the controller task and should return quickly.
#[cfg_attr(test, mockall::automock)]
pub trait SessionHandler: Send + Sync {
    /// The agent ran a tool; `result` is the tool's structured output.
    fn on_tool_call(&self, name: &str, result: &serde_json::Value);

    /// A fragment of the agent's transcript.
    fn on_ai_text(&self, text: &str);

    /// The agent finished its turn.
    fn on_turn_complete(&self);

    /// A session failed to start. Runtime failures end the session quietly instead.
    fn on_error(&self, _error: &SessionError) {}
}
