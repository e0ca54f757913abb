//! # voice-io-native
//!
//! Platform backends for voice-io and the C handle surface.
//!
//! Provides:
//! - `WasapiCapture` / `WasapiRender`: Windows, Communications stream category + AEC render reference
//! - `VoiceProcessingCapture` / `VoiceProcessingPlayback`: macOS `VoiceProcessingIO` audio units
//! - `AvAudioCapture` / `AvAudioPlayback`: iOS `AVAudioEngine` in VoiceChat mode
//! - `PulseCapture` / `PulsePlayback`: Linux `module-echo-cancel` devices (`pulseaudio` feature)
//! - `OboeCapture` / `OboePlayback`: Android `VoiceCommunication` preset
//! - `ffi`: `capture_start` / `capture_recv` / `capture_sample_rate` / `capture_play` / `capture_stop`
//!
//! The backend for the build target is exported as `PlatformCapture` /
//! `PlatformPlayback`; every other target gets `Unsupported`, whose `open`
//! fails with `AecNotSupported`.
//!
//! ## Usage
//! ```ignore
//! use voice_io_native::VoiceCapture;
//! use voice_io_native::voice_io_core::VoiceConfig;
//!
//! let capture = VoiceCapture::create(VoiceConfig::new(16000))?;
//! println!("device runs at {} Hz", capture.native_rate());
//! while let Some(frames) = capture.recv_blocking() {
//!     let frames = frames?;
//!     // feed frames.samples() to the recognizer
//! }
//! ```

pub use voice_io_core;

use voice_io_core::{CaptureSession, PlaybackSession};

#[cfg_attr(
    not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "ios",
        target_os = "android",
        all(target_os = "linux", feature = "pulseaudio")
    )),
    allow(dead_code)
)]
mod device_thread;
pub mod ffi;
pub mod unsupported;

#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod permissions;
#[cfg(target_os = "windows")]
mod wasapi;
#[cfg(target_os = "windows")]
pub mod wasapi_capture;
#[cfg(target_os = "windows")]
pub mod wasapi_render;

#[cfg(target_os = "macos")]
pub mod core_audio;

#[cfg(target_os = "ios")]
pub mod av_audio;

#[cfg(all(target_os = "linux", feature = "pulseaudio"))]
pub mod pulse;

#[cfg(target_os = "android")]
pub mod oboe_stream;

#[cfg(target_os = "windows")]
pub use wasapi_capture::WasapiCapture as PlatformCapture;
#[cfg(target_os = "windows")]
pub use wasapi_render::WasapiRender as PlatformPlayback;

#[cfg(target_os = "macos")]
pub use core_audio::VoiceProcessingCapture as PlatformCapture;
#[cfg(target_os = "macos")]
pub use core_audio::VoiceProcessingPlayback as PlatformPlayback;

#[cfg(target_os = "ios")]
pub use av_audio::AvAudioCapture as PlatformCapture;
#[cfg(target_os = "ios")]
pub use av_audio::AvAudioPlayback as PlatformPlayback;

#[cfg(all(target_os = "linux", feature = "pulseaudio"))]
pub use pulse::PulseCapture as PlatformCapture;
#[cfg(all(target_os = "linux", feature = "pulseaudio"))]
pub use pulse::PulsePlayback as PlatformPlayback;

#[cfg(target_os = "android")]
pub use oboe_stream::OboeCapture as PlatformCapture;
#[cfg(target_os = "android")]
pub use oboe_stream::OboePlayback as PlatformPlayback;

#[cfg(not(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "ios",
    target_os = "android",
    all(target_os = "linux", feature = "pulseaudio")
)))]
pub use unsupported::Unsupported as PlatformCapture;
#[cfg(not(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "ios",
    target_os = "android",
    all(target_os = "linux", feature = "pulseaudio")
)))]
pub use unsupported::Unsupported as PlatformPlayback;

/// Echo-cancelled microphone capture on this platform.
pub type VoiceCapture = CaptureSession<PlatformCapture>;

/// Far-end playback on this platform, feeding the echo canceller's
/// reference.
pub type VoicePlayback = PlaybackSession<PlatformPlayback>;
