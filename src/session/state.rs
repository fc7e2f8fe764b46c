//! Session lifecycle states

use std::fmt;

/// `Disconnected → Connecting → Connected → ChannelOpening → Ready`
///
/// A transient failure in any state returns the session to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ChannelOpening,
    Ready,
}

impl SessionState {
    /// Transport is up (channel may or may not be open)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::ChannelOpening | SessionState::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::ChannelOpening => "channel_opening",
            SessionState::Ready => "ready",
        };
        f.write_str(s)
    }
}
