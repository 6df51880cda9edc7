//! Livechat Voice Library Crate
//!
//! This library contains the real-time voice session used by the storefront
//! assistant: device acquisition, the duplex relay connection, capture
//! encoding, sequential playback and the controller that owns them all.
//! The `livechat` binary is a thin console host around this library.

pub mod audio;
pub mod config;
pub mod error;
pub mod session;

pub use error::SessionError;
pub use session::{SessionConfig, SessionController, SessionHandler};
