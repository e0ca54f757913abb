use super::error::VoiceError;

/// Session state machine, shared by capture and playback sessions.
///
/// State transitions:
/// ```text
/// uninitialized → running → stopping → stopped
///                    ↓                    ↑
///                 failed ─── stop() ──────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Running,
    Stopping,
    Stopped,
    Failed(VoiceError),
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// No further audio will flow in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    pub fn error(&self) -> Option<&VoiceError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Lifecycle of the backend stream owned by a session.
///
/// ```text
/// closed → opening → running → closing → closed
///             ↓         ↓
///          closed     failed → closing → closed
/// ```
///
/// `Failed` never releases resources by itself; the owner still has to
/// close the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opening,
    Running,
    Failed,
    Closing,
}

impl StreamState {
    /// Whether the backend still holds OS audio resources.
    pub fn holds_device(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Closing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_state_carries_error() {
        let state = SessionState::Failed(VoiceError::BackendError("unplugged".into()));
        assert!(state.is_failed());
        assert!(state.is_terminal());
        assert_eq!(
            state.error(),
            Some(&VoiceError::BackendError("unplugged".into()))
        );
    }

    #[test]
    fn running_is_not_terminal() {
        assert!(SessionState::Running.is_running());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Stopping.is_terminal());
        assert!(SessionState::Stopped.is_terminal());
    }

    #[test]
    fn failed_stream_still_holds_device() {
        assert!(StreamState::Failed.holds_device());
        assert!(StreamState::Running.holds_device());
        assert!(!StreamState::Closed.holds_device());
        assert!(!StreamState::Opening.holds_device());
    }
}
