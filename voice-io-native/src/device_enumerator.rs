//! Endpoint lookup via the MMDevice API.
//!
//! Voice streams bind to the `eCommunications` role so they follow the
//! device the user picked for calls, falling back to the console default.

use windows::core::*;
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

use voice_io_core::models::error::{VoiceError, VoiceResult};

use crate::permissions::map_device_error;

/// Wraps `IMMDeviceEnumerator`. COM must be initialized on the calling
/// thread.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    pub fn new() -> VoiceResult<Self> {
        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL).map_err(|e| {
                    VoiceError::BackendError(format!("failed to create device enumerator: {e}"))
                })?;
            Ok(Self { enumerator })
        }
    }

    /// Default microphone for voice communication.
    pub fn default_capture(&self) -> VoiceResult<IMMDevice> {
        self.default_endpoint(eCapture)
    }

    /// Default speaker for voice communication, the AEC echo reference.
    pub fn default_render(&self) -> VoiceResult<IMMDevice> {
        self.default_endpoint(eRender)
    }

    fn default_endpoint(&self, flow: EDataFlow) -> VoiceResult<IMMDevice> {
        unsafe {
            self.enumerator
                .GetDefaultAudioEndpoint(flow, eCommunications)
                .or_else(|_| self.enumerator.GetDefaultAudioEndpoint(flow, eConsole))
                .map_err(|e| map_device_error(&e))
        }
    }

    /// Endpoint ID string, as accepted by
    /// `IAcousticEchoCancellationControl::SetEchoCancellationRenderEndpoint`.
    pub fn device_id(device: &IMMDevice) -> VoiceResult<HSTRING> {
        unsafe {
            let raw = device
                .GetId()
                .map_err(|e| VoiceError::BackendError(format!("GetId failed: {e}")))?;
            let id = raw.to_hstring();
            CoTaskMemFree(Some(raw.0 as *const _));
            Ok(id)
        }
    }

    /// PKEY_Device_FriendlyName, for logs.
    pub fn friendly_name(device: &IMMDevice) -> Option<String> {
        unsafe {
            let store = device.OpenPropertyStore(STGM_READ).ok()?;
            let value = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
            let name = value.to_string();
            (!name.is_empty()).then_some(name)
        }
    }
}
