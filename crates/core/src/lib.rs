pub mod level;
pub mod pcm;
pub mod protocol;

/// Lifecycle of a single voice session as seen by the host.
///
/// A controller starts in `Idle`, moves through `Connecting` while devices
/// and the channel are being acquired, sits in `Live` while audio flows, and
/// ends in `Closed` once every resource has been released. `Closed` is a
/// valid starting point for a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Live,
    Closed,
}

impl SessionState {
    /// Whether a `toggle` from this state starts a new session.
    pub fn is_startable(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }
}
