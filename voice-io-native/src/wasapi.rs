//! COM and WASAPI plumbing shared by the capture and render streams.

use std::mem::size_of;
use std::ptr;

use windows::core::*;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Media::Audio::*;
use windows::Win32::Media::KernelStreaming::{
    KSDATAFORMAT_SUBTYPE_IEEE_FLOAT, WAVEFORMATEXTENSIBLE, WAVE_FORMAT_EXTENSIBLE,
};
use windows::Win32::Media::Multimedia::WAVE_FORMAT_IEEE_FLOAT;
use windows::Win32::System::Com::*;
use windows::Win32::System::Threading::*;

use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::sample_format::SampleEncoding;

use crate::permissions::{map_call_error, map_device_error};

/// Shared-mode buffer length in 100-ns units (100 ms).
pub const BUFFER_DURATION: i64 = 1_000_000;

/// Upper bound on how long a device thread sleeps before re-checking for
/// close when the endpoint stops signalling.
pub const EVENT_TIMEOUT_MS: u32 = 100;

/// Initializes COM (MTA) on the current thread and uninitializes on drop.
pub struct ComGuard;

impl ComGuard {
    pub fn init() -> VoiceResult<Self> {
        unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED)
                .ok()
                .map_err(|e| VoiceError::BackendError(format!("CoInitializeEx failed: {e}")))?;
        }
        Ok(Self)
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}

/// MMCSS "Pro Audio" registration for the current thread.
pub struct MmcssGuard(Option<HANDLE>);

impl MmcssGuard {
    pub fn register() -> Self {
        let mut task_index = 0u32;
        match unsafe { AvSetMmThreadCharacteristicsW(w!("Pro Audio"), &mut task_index) } {
            Ok(handle) => Self(Some(handle)),
            Err(e) => {
                log::warn!("MMCSS registration failed, running at normal priority: {}", e);
                Self(None)
            }
        }
    }
}

impl Drop for MmcssGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            unsafe {
                let _ = AvRevertMmThreadCharacteristics(handle);
            }
        }
    }
}

/// Auto-reset event signalled by the audio engine once per period.
pub struct EventHandle(HANDLE);

impl EventHandle {
    pub fn new() -> VoiceResult<Self> {
        unsafe {
            CreateEventW(None, false, false, PCWSTR::null())
                .map(Self)
                .map_err(|e| VoiceError::BackendError(format!("CreateEventW failed: {e}")))
        }
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }

    /// True when signalled, false on timeout.
    pub fn wait(&self, timeout_ms: u32) -> bool {
        unsafe { WaitForSingleObject(self.0, timeout_ms) == WAIT_OBJECT_0 }
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Engine mix format returned by `GetMixFormat`, freed on drop.
pub struct MixFormat(*mut WAVEFORMATEX);

impl MixFormat {
    pub fn query(client: &IAudioClient) -> VoiceResult<Self> {
        unsafe {
            client
                .GetMixFormat()
                .map(Self)
                .map_err(|e| map_call_error("GetMixFormat", &e))
        }
    }

    pub fn as_ptr(&self) -> *const WAVEFORMATEX {
        self.0
    }

    pub fn rate(&self) -> u32 {
        unsafe { (*self.0).nSamplesPerSec }
    }

    pub fn channels(&self) -> usize {
        unsafe { (*self.0).nChannels as usize }
    }

    pub fn bits(&self) -> u16 {
        unsafe { (*self.0).wBitsPerSample }
    }

    pub fn block_align(&self) -> usize {
        unsafe { (*self.0).nBlockAlign as usize }
    }

    /// Sample container type, or `None` for formats the decoder lacks.
    pub fn encoding(&self) -> Option<SampleEncoding> {
        let tag = unsafe { (*self.0).wFormatTag } as u32;
        let is_float = if tag == WAVE_FORMAT_EXTENSIBLE {
            let extensible = self.0 as *const WAVEFORMATEXTENSIBLE;
            let sub_format = unsafe { ptr::addr_of!((*extensible).SubFormat).read_unaligned() };
            sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT
        } else {
            tag == WAVE_FORMAT_IEEE_FLOAT
        };
        SampleEncoding::from_format(self.bits(), is_float)
    }
}

impl Drop for MixFormat {
    fn drop(&mut self) {
        unsafe {
            CoTaskMemFree(Some(self.0 as *const _));
        }
    }
}

/// Packed 32-bit float PCM at `rate` with `channels` channels.
pub fn float_format(rate: u32, channels: u16) -> WAVEFORMATEX {
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_IEEE_FLOAT as u16,
        nChannels: channels,
        nSamplesPerSec: rate,
        nAvgBytesPerSec: rate * channels as u32 * 4,
        nBlockAlign: channels * 4,
        wBitsPerSample: 32,
        cbSize: 0,
    }
}

/// Activate an audio client on `device` tagged as a communications stream,
/// which routes it through the endpoint's voice processing (AEC, noise
/// suppression, AGC).
pub fn activate_voice_client(device: &IMMDevice) -> VoiceResult<IAudioClient2> {
    unsafe {
        let client: IAudioClient2 = device
            .Activate(CLSCTX_ALL, None)
            .map_err(|e| map_device_error(&e))?;

        let properties = AudioClientProperties {
            cbSize: size_of::<AudioClientProperties>() as u32,
            bIsOffload: false.into(),
            eCategory: AudioCategory_Communications,
            Options: AUDCLNT_STREAMOPTIONS_NONE,
        };
        client
            .SetClientProperties(&properties)
            .map_err(|e| map_call_error("SetClientProperties", &e))?;
        Ok(client)
    }
}

/// Frames per engine period for a client at `rate`.
pub fn period_frames(client: &IAudioClient, rate: u32) -> usize {
    let mut period = 0i64;
    let queried = unsafe { client.GetDevicePeriod(Some(&mut period), None) };
    match queried {
        Ok(()) if period > 0 => (rate as i64 * period / 10_000_000) as usize,
        _ => (rate / 100) as usize,
    }
}
