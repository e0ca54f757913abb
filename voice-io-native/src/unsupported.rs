//! Backend for targets without a voice processing audio path.
//!
//! Also used on Linux when the crate is built without the `pulseaudio`
//! feature. `open` always fails, so the type is never instantiated.

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::ring_buffer::FrameProducer;
use voice_io_core::traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

pub enum Unsupported {}

impl CaptureBackend for Unsupported {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        log::warn!("no echo-cancelling capture backend on this target");
        Err(VoiceError::AecNotSupported)
    }

    fn native_rate(&self) -> u32 {
        match *self {}
    }

    fn period_frames(&self) -> usize {
        match *self {}
    }

    fn start(&mut self, _producer: FrameProducer) -> VoiceResult<()> {
        match *self {}
    }

    fn close(&mut self) {
        match *self {}
    }
}

impl PlaybackBackend for Unsupported {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        Err(VoiceError::AecNotSupported)
    }

    fn native_rate(&self) -> u32 {
        match *self {}
    }

    fn period_frames(&self) -> usize {
        match *self {}
    }

    fn start(&mut self, _source: SampleSource) -> VoiceResult<()> {
        match *self {}
    }

    fn close(&mut self) {
        match *self {}
    }
}
