use crate::models::config::VoiceConfig;
use crate::models::error::{VoiceError, VoiceResult};
use crate::processing::ring_buffer::{FrameConsumer, FrameProducer};

/// A voice-processing capture stream on one platform audio subsystem.
///
/// Implemented once per OS (WASAPI, CoreAudio, AVAudioEngine, PulseAudio,
/// Oboe) and selected at build time. Sessions are generic over this trait.
pub trait CaptureBackend: Send + Sized + 'static {
    /// Acquire the input device, engage the platform's voice-processing /
    /// AEC mode and negotiate a native format. No frames are delivered yet.
    fn open(config: &VoiceConfig) -> VoiceResult<Self>;

    /// Rate the hardware negotiated. Fixed for the lifetime of the backend.
    fn native_rate(&self) -> u32;

    /// Frames per device callback.
    fn period_frames(&self) -> usize;

    /// Begin delivering mono frames into `producer` at the device cadence.
    ///
    /// The callback must only call `FrameProducer::push`; device faults are
    /// reported with `FrameProducer::fail`.
    fn start(&mut self, producer: FrameProducer) -> VoiceResult<()>;

    /// Release the device. Idempotent; once this returns no callback fires.
    fn close(&mut self);
}

/// A voice-processing output stream, used to play the echo reference.
pub trait PlaybackBackend: Send + Sized + 'static {
    fn open(config: &VoiceConfig) -> VoiceResult<Self>;

    fn native_rate(&self) -> u32;

    fn period_frames(&self) -> usize;

    /// Begin pulling audio from `source` at the device cadence.
    fn start(&mut self, source: SampleSource) -> VoiceResult<()>;

    /// Release the device. Idempotent; once this returns no callback fires.
    fn close(&mut self);
}

/// Real-time side of a playback stream.
#[derive(Debug)]
pub struct SampleSource {
    consumer: FrameConsumer,
}

impl SampleSource {
    pub fn new(consumer: FrameConsumer) -> Self {
        Self { consumer }
    }

    /// Fill an interleaved device buffer of `device_channels` channels with
    /// queued mono audio, duplicated across channels. Missing frames are
    /// rendered as silence.
    ///
    /// Lock-free and allocation-free. Returns the number of frames taken
    /// from the queue.
    pub fn fill(&mut self, out: &mut [f32], device_channels: usize) -> usize {
        let device_channels = device_channels.max(1);
        let frames = out.len() / device_channels;
        let popped = self.consumer.pop_into(&mut out[..frames]).samples;

        // Expand in place from the back so no source sample is overwritten
        // before it is read.
        if device_channels > 1 {
            for i in (0..popped).rev() {
                let sample = out[i];
                out[i * device_channels..(i + 1) * device_channels].fill(sample);
            }
        }
        out[popped * device_channels..].fill(0.0);
        popped
    }

    /// Report a terminal device fault to the writer.
    pub fn fail(&self, error: VoiceError) {
        self.consumer.ring().fail(error);
    }

    pub fn is_closed(&self) -> bool {
        self.consumer.is_closed()
    }
}
