//! macOS voice processing through the `VoiceProcessingIO` audio unit.
//!
//! The unit applies the system echo canceller, noise suppression and AGC to
//! the default input, using what the machine plays as its echo reference.
//! Capture and playback each own one unit, created and torn down on a
//! `DeviceThread`; CoreAudio invokes the callbacks on its own IO thread.

use coreaudio::audio_unit::audio_format::LinearPcmFlags;
use coreaudio::audio_unit::render_callback::{self, data};
use coreaudio::audio_unit::types::IOType;
use coreaudio::audio_unit::{AudioUnit, Element, SampleFormat, Scope, StreamFormat};
use coreaudio::sys::{kAudioOutputUnitProperty_EnableIO, kAudioUnitProperty_MaximumFramesPerSlice};

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::ring_buffer::FrameProducer;
use voice_io_core::traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

use crate::device_thread::{DeviceContext, DeviceThread, StreamInfo};

const DEFAULT_SLICE_FRAMES: u32 = 512;

type Interleaved = render_callback::Args<data::Interleaved<f32>>;

fn unit_error(call: &str, error: coreaudio::Error) -> VoiceError {
    match error {
        coreaudio::Error::NoMatchingDefaultAudioUnitFound | coreaudio::Error::NoKnownSubtype => {
            VoiceError::AecNotSupported
        }
        other => VoiceError::BackendError(format!("{call}: {other:?}")),
    }
}

/// Create a voice processing unit with input switched on or off and the
/// client side of `element` set to mono f32 at the unit's native rate.
fn open_unit(input: bool, scope: Scope, element: Element) -> VoiceResult<(AudioUnit, StreamInfo)> {
    let mut unit = AudioUnit::new(IOType::VoiceProcessingIO)
        .map_err(|e| unit_error("create VoiceProcessingIO", e))?;

    // Properties can only be changed while uninitialized.
    let _ = unit.uninitialize();

    let enable_input = u32::from(input);
    unit.set_property(
        kAudioOutputUnitProperty_EnableIO,
        Scope::Input,
        Element::Input,
        Some(&enable_input),
    )
    .map_err(|e| unit_error("enable input", e))?;

    let native = unit
        .stream_format(scope, element)
        .map_err(|e| unit_error("query stream format", e))?;
    let format = StreamFormat {
        sample_rate: native.sample_rate,
        sample_format: SampleFormat::F32,
        flags: LinearPcmFlags::IS_FLOAT | LinearPcmFlags::IS_PACKED,
        channels: 1,
    };
    unit.set_stream_format(format, scope, element)
        .map_err(|e| unit_error("set stream format", e))?;

    let slice: u32 = unit
        .get_property(
            kAudioUnitProperty_MaximumFramesPerSlice,
            Scope::Global,
            Element::Output,
        )
        .unwrap_or(DEFAULT_SLICE_FRAMES);

    let info = StreamInfo {
        rate: native.sample_rate as u32,
        period_frames: slice as usize,
    };
    Ok((unit, info))
}

fn start_unit(unit: &mut AudioUnit) -> VoiceResult<()> {
    unit.initialize()
        .map_err(|e| unit_error("initialize", e))?;
    unit.start().map_err(|e| unit_error("start", e))
}

/// Microphone capture through `VoiceProcessingIO`.
pub struct VoiceProcessingCapture {
    device: DeviceThread<FrameProducer>,
}

impl CaptureBackend for VoiceProcessingCapture {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("coreaudio-capture", capture_thread)?;
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
    let (mut unit, info) = match open_unit(true, Scope::Output, Element::Input) {
        Ok(opened) => opened,
        Err(e) => return ctx.opened(Err(e)),
    };
    log::info!("VoiceProcessingIO capture: {} Hz, {} frames per slice", info.rate, info.period_frames);
    ctx.opened(Ok(info));

    let Some(mut producer) = ctx.wait_for_start() else {
        return;
    };
    let installed = unit
        .set_input_callback(move |args: Interleaved| {
            producer.push(args.data.buffer);
            Ok(())
        })
        .map_err(|e| unit_error("set input callback", e));
    if let Err(e) = installed.and_then(|()| start_unit(&mut unit)) {
        return ctx.started(Err(e));
    }
    ctx.started(Ok(()));

    ctx.wait_for_stop();
    let _ = unit.stop();
}

/// Far-end playback through a second `VoiceProcessingIO` unit.
pub struct VoiceProcessingPlayback {
    device: DeviceThread<SampleSource>,
}

impl PlaybackBackend for VoiceProcessingPlayback {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("coreaudio-playback", playback_thread)?;
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
    let (mut unit, info) = match open_unit(false, Scope::Input, Element::Output) {
        Ok(opened) => opened,
        Err(e) => return ctx.opened(Err(e)),
    };
    ctx.opened(Ok(info));

    let Some(mut source) = ctx.wait_for_start() else {
        return;
    };
    let installed = unit
        .set_render_callback(move |args: Interleaved| {
            source.fill(args.data.buffer, 1);
            Ok(())
        })
        .map_err(|e| unit_error("set render callback", e));
    if let Err(e) = installed.and_then(|()| start_unit(&mut unit)) {
        return ctx.started(Err(e));
    }
    ctx.started(Ok(()));

    ctx.wait_for_stop();
    let _ = unit.stop();
}
