//! Defines the message protocol between the live-chat relay and the voice client.
//!
//! Text frames carry a JSON object tagged by `type`; binary frames carry raw
//! PCM16 little-endian mono audio.

use bytes::Bytes;
use serde::Deserialize;

/// Control messages sent from the relay to the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The agent invoked a tool; `result` is forwarded to the host untouched.
    ToolCall {
        name: String,
        #[serde(default)]
        result: serde_json::Value,
    },
    /// A transcript fragment of the agent's reply.
    Text {
        #[serde(default)]
        text: String,
    },
    /// The agent finished its turn.
    TurnComplete,
    /// The user barged in; queued agent audio should be discarded.
    Interrupted,
    /// Any tag this client does not understand.
    #[serde(other)]
    Unknown,
}

/// Why a text frame could not be turned into a [`ControlMessage`].
#[derive(Debug, thiserror::Error)]
#[error("malformed control message: {0}")]
pub struct MalformedFrame(#[from] pub serde_json::Error);

impl ControlMessage {
    /// Parses the body of a text frame.
    pub fn parse(text: &str) -> Result<Self, MalformedFrame> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlMessage),
    Audio(Bytes),
}
