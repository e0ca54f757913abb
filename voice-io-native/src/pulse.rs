//! Linux voice I/O through PulseAudio (or PipeWire's pulse server).
//!
//! Echo cancellation on Linux is done by the server's `module-echo-cancel`,
//! which exposes a processed source and sink. Streams attach to those when
//! present and fall back to the default devices otherwise. Both directions
//! use the blocking simple API on a `DeviceThread` at 48 kHz mono f32 with
//! 10 ms periods.

use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::ring_buffer::FrameProducer;
use voice_io_core::processing::sample_format::{decode_to_mono, SampleEncoding};
use voice_io_core::traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

use crate::device_thread::{DeviceContext, DeviceThread, StreamInfo};

const SAMPLE_RATE: u32 = 48000;
const PERIOD_FRAMES: usize = 480;
const APP_NAME: &str = "voice-io";

const ECHO_CANCEL_SOURCE: &str = "echo-cancel-source";
const ECHO_CANCEL_SINK: &str = "echo-cancel-sink";

const INFO: StreamInfo = StreamInfo {
    rate: SAMPLE_RATE,
    period_frames: PERIOD_FRAMES,
};

fn map_error(error: PAErr) -> VoiceError {
    if error == PAErr::from(Code::Access) {
        VoiceError::PermissionDenied
    } else if error == PAErr::from(Code::ConnectionRefused) || error == PAErr::from(Code::NoEntity) {
        VoiceError::DeviceUnavailable
    } else {
        VoiceError::BackendError(format!("PulseAudio: {}", error.to_string().unwrap_or_default()))
    }
}

/// Connect a stream, preferring the echo-cancel device. Returns the stream
/// and whether it is echo cancelled.
fn connect(direction: Direction, echo_device: &str, stream_name: &str, require_aec: bool) -> VoiceResult<(Simple, bool)> {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: SAMPLE_RATE,
    };
    if !spec.is_valid() {
        return Err(VoiceError::InvalidConfig("invalid PulseAudio sample spec".into()));
    }

    let open = |device: Option<&str>| {
        Simple::new(None, APP_NAME, direction, device, stream_name, &spec, None, None)
    };

    match open(Some(echo_device)) {
        Ok(simple) => Ok((simple, true)),
        Err(e) if e == PAErr::from(Code::NoEntity) => {
            if require_aec {
                return Err(VoiceError::AecNotSupported);
            }
            log::warn!(
                "{} not loaded; {} runs without echo cancellation",
                echo_device,
                stream_name
            );
            open(None).map(|simple| (simple, false)).map_err(map_error)
        }
        Err(e) => Err(map_error(e)),
    }
}

/// Microphone capture from the echo-cancel source.
pub struct PulseCapture {
    device: DeviceThread<FrameProducer>,
}

impl CaptureBackend for PulseCapture {
    fn open(config: &VoiceConfig) -> VoiceResult<Self> {
        let require_aec = config.require_aec;
        let device = DeviceThread::spawn("pulse-capture", move |ctx| {
            capture_thread(ctx, require_aec)
        })?;
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

fn capture_thread(ctx: DeviceContext<FrameProducer>, require_aec: bool) {
    let simple = match connect(Direction::Record, ECHO_CANCEL_SOURCE, "voice capture", require_aec) {
        Ok((simple, aec)) => {
            log::info!("PulseAudio capture: {} Hz mono, echo cancel {}", SAMPLE_RATE, aec);
            simple
        }
        Err(e) => return ctx.opened(Err(e)),
    };
    ctx.opened(Ok(INFO));

    let Some(mut producer) = ctx.wait_for_start() else {
        return;
    };
    ctx.started(Ok(()));

    let mut bytes = vec![0u8; PERIOD_FRAMES * 4];
    let mut frames = vec![0.0f32; PERIOD_FRAMES];
    while ctx.is_running() {
        if let Err(e) = simple.read(&mut bytes) {
            let e = map_error(e);
            log::error!("PulseAudio capture stopped: {}", e);
            producer.fail(VoiceError::BackendError(e.to_string()));
            return;
        }
        let count = decode_to_mono(&bytes, SampleEncoding::F32, 1, &mut frames);
        producer.push(&frames[..count]);
    }
}

/// Far-end playback into the echo-cancel sink.
pub struct PulsePlayback {
    device: DeviceThread<SampleSource>,
}

impl PlaybackBackend for PulsePlayback {
    fn open(config: &VoiceConfig) -> VoiceResult<Self> {
        let require_aec = config.require_aec;
        let device = DeviceThread::spawn("pulse-playback", move |ctx| {
            playback_thread(ctx, require_aec)
        })?;
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

fn playback_thread(ctx: DeviceContext<SampleSource>, require_aec: bool) {
    let simple = match connect(Direction::Playback, ECHO_CANCEL_SINK, "voice playback", require_aec) {
        Ok((simple, _)) => simple,
        Err(e) => return ctx.opened(Err(e)),
    };
    ctx.opened(Ok(INFO));

    let Some(mut source) = ctx.wait_for_start() else {
        return;
    };
    ctx.started(Ok(()));

    let mut frames = vec![0.0f32; PERIOD_FRAMES];
    let mut bytes = vec![0u8; PERIOD_FRAMES * 4];
    while ctx.is_running() {
        source.fill(&mut frames, 1);
        for (chunk, sample) in bytes.chunks_exact_mut(4).zip(&frames) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        // Blocks until the server has room, pacing the loop.
        if let Err(e) = simple.write(&bytes) {
            let e = map_error(e);
            log::error!("PulseAudio playback stopped: {}", e);
            source.fail(VoiceError::BackendError(e.to_string()));
            return;
        }
    }
    let _ = simple.drain();
}
