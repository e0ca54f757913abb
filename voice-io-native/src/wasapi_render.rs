//! WASAPI voice render.
//!
//! Plays the far-end signal on the communications render endpoint, which
//! is the stream the capture side's echo canceller uses as its reference.
//! The engine converts from packed f32 at the mix rate, so the render
//! buffer is filled straight from the `SampleSource`.

use std::slice;

use windows::Win32::Media::Audio::*;

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::VoiceResult;
use voice_io_core::traits::backend::{PlaybackBackend, SampleSource};

use crate::device_enumerator::DeviceEnumerator;
use crate::device_thread::{DeviceContext, DeviceThread, StreamInfo};
use crate::permissions::{map_call_error, map_stream_error};
use crate::wasapi::{
    activate_voice_client, float_format, period_frames, ComGuard, EventHandle, MixFormat,
    MmcssGuard, BUFFER_DURATION, EVENT_TIMEOUT_MS,
};

pub struct WasapiRender {
    device: DeviceThread<SampleSource>,
}

impl PlaybackBackend for WasapiRender {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("wasapi-render", render_thread)?;
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

fn render_thread(ctx: DeviceContext<SampleSource>) {
    let _com = match ComGuard::init() {
        Ok(guard) => guard,
        Err(e) => return ctx.opened(Err(e)),
    };

    let stream = match RenderStream::open() {
        Ok(stream) => stream,
        Err(e) => return ctx.opened(Err(e)),
    };
    ctx.opened(Ok(stream.info));

    let Some(mut source) = ctx.wait_for_start() else {
        return;
    };
    let _mmcss = MmcssGuard::register();
    if let Err(e) = stream.start(&mut source) {
        return ctx.started(Err(e));
    }
    ctx.started(Ok(()));

    if let Err(e) = stream.run(&ctx, &mut source) {
        log::error!("WASAPI render stopped: {}", e);
        source.fail(e);
    }

    unsafe {
        let _ = stream.client.Stop();
    }
}

struct RenderStream {
    client: IAudioClient2,
    render: IAudioRenderClient,
    event: EventHandle,
    info: StreamInfo,
    channels: usize,
    buffer_frames: u32,
}

impl RenderStream {
    fn open() -> VoiceResult<Self> {
        let enumerator = DeviceEnumerator::new()?;
        let device = enumerator.default_render()?;
        let client = activate_voice_client(&device)?;

        let (rate, channels) = {
            let mix = MixFormat::query(&client)?;
            (mix.rate(), mix.channels())
        };
        let format = float_format(rate, channels as u16);

        let event = EventHandle::new()?;
        let (render, buffer_frames) = unsafe {
            client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK
                        | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM
                        | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY
                        | AUDCLNT_STREAMFLAGS_NOPERSIST,
                    BUFFER_DURATION,
                    0,
                    &format,
                    None,
                )
                .map_err(|e| map_call_error("IAudioClient::Initialize", &e))?;
            client
                .SetEventHandle(event.raw())
                .map_err(|e| map_call_error("SetEventHandle", &e))?;
            let render: IAudioRenderClient = client
                .GetService()
                .map_err(|e| map_call_error("GetService(IAudioRenderClient)", &e))?;
            let buffer_frames = client
                .GetBufferSize()
                .map_err(|e| map_call_error("GetBufferSize", &e))?;
            (render, buffer_frames)
        };

        log::info!(
            "WASAPI render on '{}': {} Hz, {} ch",
            DeviceEnumerator::friendly_name(&device).unwrap_or_else(|| "default".into()),
            rate,
            channels
        );

        Ok(Self {
            info: StreamInfo {
                rate,
                period_frames: period_frames(&client, rate),
            },
            client,
            render,
            event,
            channels,
            buffer_frames,
        })
    }

    /// Pre-roll the whole buffer so the first period is not a glitch, then
    /// start the engine.
    fn start(&self, source: &mut SampleSource) -> VoiceResult<()> {
        self.fill(source, self.buffer_frames)?;
        unsafe {
            self.client
                .Start()
                .map_err(|e| map_call_error("IAudioClient::Start", &e))
        }
    }

    fn run(&self, ctx: &DeviceContext<SampleSource>, source: &mut SampleSource) -> VoiceResult<()> {
        while ctx.is_running() {
            if !self.event.wait(EVENT_TIMEOUT_MS) {
                continue;
            }
            let padding = unsafe {
                self.client
                    .GetCurrentPadding()
                    .map_err(|e| map_stream_error("GetCurrentPadding", &e))?
            };
            let available = self.buffer_frames.saturating_sub(padding);
            if available > 0 {
                self.fill(source, available)?;
            }
        }
        Ok(())
    }

    fn fill(&self, source: &mut SampleSource, frames: u32) -> VoiceResult<()> {
        unsafe {
            let data = self
                .render
                .GetBuffer(frames)
                .map_err(|e| map_stream_error("GetBuffer", &e))?;
            let out = slice::from_raw_parts_mut(data as *mut f32, frames as usize * self.channels);
            source.fill(out, self.channels);
            self.render
                .ReleaseBuffer(frames, 0)
                .map_err(|e| map_stream_error("ReleaseBuffer", &e))
        }
    }
}
