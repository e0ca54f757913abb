use thiserror::Error;

/// Errors produced by the voice I/O engine.
///
/// Returned synchronously from session creation, or drained as a terminal
/// value from a running session's receive channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("audio device unavailable")]
    DeviceUnavailable,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("acoustic echo cancellation not supported on this device")]
    AecNotSupported,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend error: {0}")]
    BackendError(String),
}

pub type VoiceResult<T> = Result<T, VoiceError>;

impl VoiceError {
    /// Status code on the C handle surface. Every engine error is terminal
    /// for the handle it was observed on.
    pub fn status_code(&self) -> i32 {
        crate::handles::STATUS_BACKEND_ERROR
    }
}
