//! Android voice I/O through Oboe.
//!
//! The `VoiceCommunication` input preset selects the platform's AEC, noise
//! suppression and AGC chain; output streams use the matching usage so the
//! far-end signal is the echo reference. Streams are owned by a
//! `DeviceThread`; Oboe calls the handlers on its own audio thread.

use crossbeam_channel::{bounded, Receiver};
use oboe::{
    AudioInputCallback, AudioInputStreamSafe, AudioOutputCallback, AudioOutputStreamSafe,
    AudioStream, AudioStreamBase, AudioStreamBuilder, ContentType, DataCallbackResult, Input,
    InputPreset, Mono, Output, PerformanceMode, SampleRateConversionQuality, SharingMode, Usage,
};

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::ring_buffer::FrameProducer;
use voice_io_core::traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

use crate::device_thread::{DeviceContext, DeviceThread, StreamInfo};

const PREFERRED_RATE: i32 = 48000;

fn map_error(call: &str, error: oboe::Error) -> VoiceError {
    match error {
        oboe::Error::Disconnected | oboe::Error::Unavailable | oboe::Error::NoService => {
            VoiceError::DeviceUnavailable
        }
        other => VoiceError::BackendError(format!("Oboe {call} failed: {other:?}")),
    }
}

/// Slot for a sink handed over after the stream is built. The audio thread
/// picks it up with a non-blocking `try_recv`.
struct Handoff<S> {
    pending: Receiver<S>,
    sink: Option<S>,
}

impl<S> Handoff<S> {
    fn sink(&mut self) -> Option<&mut S> {
        if self.sink.is_none() {
            self.sink = self.pending.try_recv().ok();
        }
        self.sink.as_mut()
    }
}

struct InputHandler(Handoff<FrameProducer>);

impl AudioInputCallback for InputHandler {
    type FrameType = (f32, Mono);

    fn on_audio_ready(
        &mut self,
        _stream: &mut dyn AudioInputStreamSafe,
        frames: &[f32],
    ) -> DataCallbackResult {
        if let Some(producer) = self.0.sink() {
            producer.push(frames);
        }
        DataCallbackResult::Continue
    }

    fn on_error_after_close(&mut self, _stream: &mut dyn AudioInputStreamSafe, error: oboe::Error) {
        if let Some(producer) = self.0.sink() {
            producer.fail(VoiceError::BackendError(format!("input stream closed: {error:?}")));
        }
    }
}

struct OutputHandler(Handoff<SampleSource>);

impl AudioOutputCallback for OutputHandler {
    type FrameType = (f32, Mono);

    fn on_audio_ready(
        &mut self,
        _stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [f32],
    ) -> DataCallbackResult {
        match self.0.sink() {
            Some(source) => {
                source.fill(frames, 1);
            }
            None => frames.fill(0.0),
        }
        DataCallbackResult::Continue
    }

    fn on_error_after_close(&mut self, _stream: &mut dyn AudioOutputStreamSafe, error: oboe::Error) {
        if let Some(source) = self.0.sink() {
            source.fail(VoiceError::BackendError(format!("output stream closed: {error:?}")));
        }
    }
}

/// Microphone capture with the `VoiceCommunication` preset.
pub struct OboeCapture {
    device: DeviceThread<FrameProducer>,
}

impl CaptureBackend for OboeCapture {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("oboe-capture", capture_thread)?;
        Ok(Self { device })
    }

    fn native_rate(&self) -> u32 {
        self.device.info().rate
    }

    fn period_frames(&self) -> usize {
        self.device.info().period_frames
    }

    fn start(&mut self, producer: FrameProducer) -> VoiceResult<()> {
        self.device.start(producer)
    }

    fn close(&mut self) {
        self.device.close();
    }
}

fn capture_thread(ctx: DeviceContext<FrameProducer>) {
    let (handoff_tx, pending) = bounded(1);
    let opened = AudioStreamBuilder::default()
        .set_direction::<Input>()
        .set_usage(Usage::VoiceCommunication)
        .set_input_preset(InputPreset::VoiceCommunication)
        .set_performance_mode(PerformanceMode::LowLatency)
        .set_sharing_mode(SharingMode::Shared)
        .set_sample_rate(PREFERRED_RATE)
        .set_sample_rate_conversion_quality(SampleRateConversionQuality::Medium)
        .set_format::<f32>()
        .set_mono()
        .set_callback(InputHandler(Handoff {
            pending,
            sink: None,
        }))
        .open_stream();
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => return ctx.opened(Err(map_error("open input", e))),
    };

    let info = StreamInfo {
        rate: stream.get_sample_rate() as u32,
        period_frames: stream.get_frames_per_burst().max(1) as usize,
    };
    log::info!(
        "Oboe capture: {} Hz, {} frames per burst, input preset VoiceCommunication",
        info.rate,
        info.period_frames
    );
    ctx.opened(Ok(info));

    let Some(producer) = ctx.wait_for_start() else {
        return;
    };
    let _ = handoff_tx.send(producer);
    if let Err(e) = stream.start() {
        return ctx.started(Err(map_error("start input", e)));
    }
    ctx.started(Ok(()));

    ctx.wait_for_stop();
    let _ = stream.stop();
}

/// Far-end playback with the `VoiceCommunication` usage.
pub struct OboePlayback {
    device: DeviceThread<SampleSource>,
}

impl PlaybackBackend for OboePlayback {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("oboe-playback", playback_thread)?;
        Ok(Self { device })
    }

    fn native_rate(&self) -> u32 {
        self.device.info().rate
    }

    fn period_frames(&self) -> usize {
        self.device.info().period_frames
    }

    fn start(&mut self, source: SampleSource) -> VoiceResult<()> {
        self.device.start(source)
    }

    fn close(&mut self) {
        self.device.close();
    }
}

fn playback_thread(ctx: DeviceContext<SampleSource>) {
    let (handoff_tx, pending) = bounded(1);
    let opened = AudioStreamBuilder::default()
        .set_direction::<Output>()
        .set_usage(Usage::VoiceCommunication)
        .set_content_type(ContentType::Speech)
        .set_performance_mode(PerformanceMode::LowLatency)
        .set_sharing_mode(SharingMode::Shared)
        .set_sample_rate(PREFERRED_RATE)
        .set_sample_rate_conversion_quality(SampleRateConversionQuality::Medium)
        .set_format::<f32>()
        .set_mono()
        .set_callback(OutputHandler(Handoff {
            pending,
            sink: None,
        }))
        .open_stream();
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => return ctx.opened(Err(map_error("open output", e))),
    };

    ctx.opened(Ok(StreamInfo {
        rate: stream.get_sample_rate() as u32,
        period_frames: stream.get_frames_per_burst().max(1) as usize,
    }));

    let Some(source) = ctx.wait_for_start() else {
        return;
    };
    let _ = handoff_tx.send(source);
    if let Err(e) = stream.start() {
        return ctx.started(Err(map_error("start output", e)));
    }
    ctx.started(Ok(()));

    ctx.wait_for_stop();
    let _ = stream.stop();
}
