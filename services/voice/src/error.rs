//! Error types for the voice session and its audio devices.

use livechat_core::protocol::MalformedFrame;

/// Failures a voice session can run into.
///
/// Only the start-time variants (`DeviceAcquisition`, `ChannelOpen`) are
/// surfaced to the host; everything else degrades to a clean stop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Audio device unavailable: {0}")]
    DeviceAcquisition(#[from] AudioError),

    #[error("Failed to open relay connection: {0}")]
    ChannelOpen(String),

    #[error("Relay connection lost: {0}")]
    ChannelRuntime(String),

    #[error(transparent)]
    MalformedControlMessage(#[from] MalformedFrame),

    #[error("Session controller is no longer running")]
    ControllerGone,
}

/// Errors reported by audio input and output backends.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Resampler error: {0}")]
    Resample(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for AudioError {
    fn from(err: cpal::DevicesError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::DeviceNameError> for AudioError {
    fn from(err: cpal::DeviceNameError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::Stream(err.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for AudioError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        AudioError::Resample(err.to_string())
    }
}

impl From<rubato::ResampleError> for AudioError {
    fn from(err: rubato::ResampleError) -> Self {
        AudioError::Resample(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::from(AudioError::Device("permission denied".to_string()));
        assert_eq!(
            err.to_string(),
            "Audio device unavailable: Audio device error: permission denied"
        );

        let err = SessionError::ChannelOpen("timed out after 10s".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to open relay connection: timed out after 10s"
        );

        let parse_err = livechat_core::protocol::ControlMessage::parse("{").unwrap_err();
        let err = SessionError::from(parse_err);
        assert!(err.to_string().starts_with("malformed control message"));
    }
}
