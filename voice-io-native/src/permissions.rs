//! Classification of WASAPI failures into engine errors.
//!
//! On Windows 10 1803+ microphone access is governed by Settings > Privacy >
//! Microphone. Unpackaged desktop apps get no consent prompt; a disabled
//! toggle surfaces as `E_ACCESSDENIED` when the capture client is activated
//! or initialized.

use windows::core::{Error, HRESULT};
use windows::Win32::Foundation::{E_ACCESSDENIED, E_NOTFOUND};
use windows::Win32::Media::Audio::{
    AUDCLNT_E_DEVICE_INVALIDATED, AUDCLNT_E_DEVICE_IN_USE, AUDCLNT_E_ENDPOINT_CREATE_FAILED,
    AUDCLNT_E_SERVICE_NOT_RUNNING,
};

use voice_io_core::models::error::VoiceError;

/// Errors from endpoint lookup and activation.
pub fn map_device_error(error: &Error) -> VoiceError {
    classify(error.code()).unwrap_or_else(|| VoiceError::BackendError(error.to_string()))
}

/// Errors from a named WASAPI call; unknown codes keep the call name.
pub fn map_call_error(call: &str, error: &Error) -> VoiceError {
    classify(error.code())
        .unwrap_or_else(|| VoiceError::BackendError(format!("{call} failed: {error}")))
}

fn classify(code: HRESULT) -> Option<VoiceError> {
    match code {
        E_ACCESSDENIED => Some(VoiceError::PermissionDenied),
        E_NOTFOUND
        | AUDCLNT_E_DEVICE_INVALIDATED
        | AUDCLNT_E_DEVICE_IN_USE
        | AUDCLNT_E_ENDPOINT_CREATE_FAILED
        | AUDCLNT_E_SERVICE_NOT_RUNNING => Some(VoiceError::DeviceUnavailable),
        _ => None,
    }
}

/// Errors raised while a stream is running. These are terminal for the
/// session and always surface as `BackendError`.
pub fn map_stream_error(call: &str, error: &Error) -> VoiceError {
    if error.code() == AUDCLNT_E_DEVICE_INVALIDATED {
        VoiceError::BackendError("audio endpoint was removed".into())
    } else {
        VoiceError::BackendError(format!("{call} failed: {error}"))
    }
}
