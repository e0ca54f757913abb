//! WASAPI voice capture.
//!
//! Opens the communications capture endpoint in shared, event-driven mode
//! and points its echo canceller at the default render endpoint. Packets of
//! any mix format are downmixed to mono into a preallocated scratch buffer
//! on a dedicated MMCSS-registered thread.

use std::ptr;
use std::slice;

use windows::core::*;
use windows::Win32::Media::Audio::*;

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::ring_buffer::FrameProducer;
use voice_io_core::processing::sample_format::{decode_to_mono, SampleEncoding};
use voice_io_core::traits::backend::CaptureBackend;

use crate::device_enumerator::DeviceEnumerator;
use crate::device_thread::{DeviceContext, DeviceThread, StreamInfo};
use crate::permissions::{map_call_error, map_stream_error};
use crate::wasapi::{
    activate_voice_client, period_frames, ComGuard, EventHandle, MixFormat, MmcssGuard,
    BUFFER_DURATION, EVENT_TIMEOUT_MS,
};

/// Voice-processed microphone capture through WASAPI.
pub struct WasapiCapture {
    device: DeviceThread<FrameProducer>,
}

impl CaptureBackend for WasapiCapture {
    fn open(config: &VoiceConfig) -> VoiceResult<Self> {
        let require_aec = config.require_aec;
        let device = DeviceThread::spawn("wasapi-capture", move |ctx| {
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
    let _com = match ComGuard::init() {
        Ok(guard) => guard,
        Err(e) => return ctx.opened(Err(e)),
    };

    let mut stream = match CaptureStream::open(require_aec) {
        Ok(stream) => stream,
        Err(e) => return ctx.opened(Err(e)),
    };
    ctx.opened(Ok(stream.info));

    let Some(producer) = ctx.wait_for_start() else {
        return;
    };
    let _mmcss = MmcssGuard::register();
    if let Err(e) = unsafe { stream.client.Start() } {
        return ctx.started(Err(map_call_error("IAudioClient::Start", &e)));
    }
    ctx.started(Ok(()));

    stream.run(&ctx, producer);

    unsafe {
        let _ = stream.client.Stop();
    }
}

struct CaptureStream {
    client: IAudioClient2,
    capture: IAudioCaptureClient,
    event: EventHandle,
    info: StreamInfo,
    encoding: SampleEncoding,
    channels: usize,
    block_align: usize,
    scratch: Vec<f32>,
}

impl CaptureStream {
    /// Sequence:
    /// 1. Resolve the communications capture and render endpoints
    /// 2. Activate IAudioClient2 with the Communications category
    /// 3. Initialize shared, event-driven, at the engine mix format
    /// 4. Point IAcousticEchoCancellationControl at the render endpoint
    /// 5. Get IAudioCaptureClient and size the scratch buffer
    fn open(require_aec: bool) -> VoiceResult<Self> {
        let enumerator = DeviceEnumerator::new()?;
        let device = enumerator.default_capture()?;
        let render = enumerator.default_render().ok();

        let client = activate_voice_client(&device)?;
        let format = MixFormat::query(&client)?;
        let encoding = format.encoding().ok_or_else(|| {
            VoiceError::BackendError(format!(
                "unsupported capture mix format: {} bits per sample",
                format.bits()
            ))
        })?;

        unsafe {
            client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK | AUDCLNT_STREAMFLAGS_NOPERSIST,
                    BUFFER_DURATION,
                    0,
                    format.as_ptr(),
                    None,
                )
                .map_err(|e| map_call_error("IAudioClient::Initialize", &e))?;
        }

        let aec = set_echo_reference(&client, render.as_ref());
        if require_aec && !aec {
            return Err(VoiceError::AecNotSupported);
        }

        let event = EventHandle::new()?;
        let (capture, buffer_frames) = unsafe {
            client
                .SetEventHandle(event.raw())
                .map_err(|e| map_call_error("SetEventHandle", &e))?;
            let capture: IAudioCaptureClient = client
                .GetService()
                .map_err(|e| map_call_error("GetService(IAudioCaptureClient)", &e))?;
            let buffer_frames = client
                .GetBufferSize()
                .map_err(|e| map_call_error("GetBufferSize", &e))?;
            (capture, buffer_frames as usize)
        };

        let rate = format.rate();
        let info = StreamInfo {
            rate,
            period_frames: period_frames(&client, rate),
        };

        log::info!(
            "WASAPI capture on '{}': {} Hz, {} ch, {:?}, echo reference {}",
            DeviceEnumerator::friendly_name(&device).unwrap_or_else(|| "default".into()),
            rate,
            format.channels(),
            encoding,
            if aec { "set" } else { "unavailable" }
        );

        Ok(Self {
            client,
            capture,
            event,
            info,
            encoding,
            channels: format.channels(),
            block_align: format.block_align(),
            scratch: vec![0.0; buffer_frames.max(info.period_frames)],
        })
    }

    fn run(&mut self, ctx: &DeviceContext<FrameProducer>, mut producer: FrameProducer) {
        while ctx.is_running() {
            if !self.event.wait(EVENT_TIMEOUT_MS) {
                continue;
            }
            if let Err(e) = self.drain(&mut producer) {
                log::error!("WASAPI capture stopped: {}", e);
                producer.fail(e);
                return;
            }
        }
    }

    /// Move every queued packet into the producer.
    fn drain(&mut self, producer: &mut FrameProducer) -> VoiceResult<()> {
        loop {
            let mut data: *mut u8 = ptr::null_mut();
            let mut frames = 0u32;
            let mut flags = 0u32;

            unsafe {
                self.capture
                    .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                    .map_err(|e| map_stream_error("GetBuffer", &e))?;
            }
            if frames == 0 {
                return Ok(());
            }

            let count = (frames as usize).min(self.scratch.len());
            let out = &mut self.scratch[..count];
            if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 || data.is_null() {
                out.fill(0.0);
            } else {
                let bytes = unsafe { slice::from_raw_parts(data, count * self.block_align) };
                decode_to_mono(bytes, self.encoding, self.channels, out);
            }

            unsafe {
                self.capture
                    .ReleaseBuffer(frames)
                    .map_err(|e| map_stream_error("ReleaseBuffer", &e))?;
            }
            producer.push(&self.scratch[..count]);
        }
    }
}

/// Route the render endpoint into the capture stream's echo canceller.
/// Needs Windows 11 22H2; older systems still apply the endpoint's default
/// communications processing.
fn set_echo_reference(client: &IAudioClient2, render: Option<&IMMDevice>) -> bool {
    let control: IAcousticEchoCancellationControl = match unsafe { client.GetService() } {
        Ok(control) => control,
        Err(e) => {
            log::debug!("IAcousticEchoCancellationControl unavailable: {}", e);
            return false;
        }
    };

    let Some(render) = render else {
        log::warn!("no render endpoint for the echo reference");
        return false;
    };
    let id = match DeviceEnumerator::device_id(render) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("render endpoint id unavailable: {}", e);
            return false;
        }
    };

    match unsafe { control.SetEchoCancellationRenderEndpoint(&id) } {
        Ok(()) => true,
        Err(e) => {
            log::warn!("SetEchoCancellationRenderEndpoint failed: {}", e);
            false
        }
    }
}
