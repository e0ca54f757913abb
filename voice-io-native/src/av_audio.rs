//! iOS voice processing through `AVAudioSession` and `AVAudioEngine`.
//!
//! The audio session is put in the PlayAndRecord category with the
//! VoiceChat mode, which selects the voice processing IO unit. Voice
//! processing is also switched on explicitly on the engine's input node.
//! Engines are created, driven and released on a `DeviceThread`.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;

use block2::RcBlock;
use objc2::rc::{Allocated, Retained};
use objc2::runtime::{AnyObject, Bool};
use objc2::{class, msg_send};
use objc2_foundation::{NSError, NSString};

use voice_io_core::models::config::VoiceConfig;
use voice_io_core::models::error::{VoiceError, VoiceResult};
use voice_io_core::processing::ring_buffer::FrameProducer;
use voice_io_core::traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

use crate::device_thread::{DeviceContext, DeviceThread, StreamInfo};

/// Tap size; about 21 ms at 48 kHz.
const TAP_FRAMES: u32 = 1024;

const CATEGORY_PLAY_AND_RECORD: &str = "AVAudioSessionCategoryPlayAndRecord";
const MODE_VOICE_CHAT: &str = "AVAudioSessionModeVoiceChat";

/// `AVAudioSessionRecordPermissionDenied` ('deny').
const RECORD_PERMISSION_DENIED: usize = 0x6465_6e79;

type TapBlock = RcBlock<dyn Fn(*mut AnyObject, *mut AnyObject)>;
type RenderBlock = RcBlock<dyn Fn(*mut Bool, *const c_void, u32, *mut c_void) -> i32>;

#[repr(C)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut f32,
}

/// Head of an `AudioBufferList`; a mono float format carries one buffer.
#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1],
}

fn error_message(error: *mut NSError) -> String {
    if error.is_null() {
        return "unknown error".into();
    }
    unsafe {
        let description: Retained<NSString> = msg_send![error, localizedDescription];
        description.to_string()
    }
}

/// Put the shared audio session into voice chat mode and activate it.
fn configure_session(needs_input: bool) -> VoiceResult<Retained<AnyObject>> {
    unsafe {
        let session: Retained<AnyObject> = msg_send![class!(AVAudioSession), sharedInstance];

        if needs_input {
            let permission: usize = msg_send![&session, recordPermission];
            if permission == RECORD_PERMISSION_DENIED {
                return Err(VoiceError::PermissionDenied);
            }
        }

        let category = NSString::from_str(CATEGORY_PLAY_AND_RECORD);
        let mode = NSString::from_str(MODE_VOICE_CHAT);
        let mut error: *mut NSError = ptr::null_mut();
        let configured: bool = msg_send![
            &session,
            setCategory: &*category,
            mode: &*mode,
            options: 0usize,
            error: &mut error
        ];
        if !configured {
            return Err(VoiceError::BackendError(format!(
                "failed to set audio session category: {}",
                error_message(error)
            )));
        }

        let mut error: *mut NSError = ptr::null_mut();
        let activated: bool = msg_send![&session, setActive: true, error: &mut error];
        if !activated {
            return Err(VoiceError::BackendError(format!(
                "failed to activate audio session: {}",
                error_message(error)
            )));
        }
        Ok(session)
    }
}

/// New engine with voice processing enabled on its IO unit.
fn voice_engine() -> VoiceResult<(Retained<AnyObject>, Retained<AnyObject>)> {
    unsafe {
        let engine: Retained<AnyObject> = msg_send![class!(AVAudioEngine), new];
        let input: Retained<AnyObject> = msg_send![&engine, inputNode];

        let mut error: *mut NSError = ptr::null_mut();
        let enabled: bool = msg_send![&input, setVoiceProcessingEnabled: true, error: &mut error];
        if !enabled {
            log::warn!("setVoiceProcessingEnabled failed: {}", error_message(error));
            return Err(VoiceError::AecNotSupported);
        }
        Ok((engine, input))
    }
}

fn start_engine(engine: &AnyObject) -> VoiceResult<()> {
    let mut error: *mut NSError = ptr::null_mut();
    let started: bool = unsafe { msg_send![engine, startAndReturnError: &mut error] };
    if started {
        Ok(())
    } else {
        Err(VoiceError::BackendError(format!(
            "engine start failed: {}",
            error_message(error)
        )))
    }
}

/// Microphone capture from the voice-processed input node.
pub struct AvAudioCapture {
    device: DeviceThread<FrameProducer>,
}

impl CaptureBackend for AvAudioCapture {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("avaudio-capture", capture_thread)?;
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
    let opened = configure_session(true).and_then(|session| {
        let (engine, input) = voice_engine()?;
        let format: Retained<AnyObject> = unsafe { msg_send![&input, outputFormatForBus: 0usize] };
        let rate: f64 = unsafe { msg_send![&format, sampleRate] };
        if rate <= 0.0 {
            return Err(VoiceError::DeviceUnavailable);
        }
        Ok((session, engine, input, format, rate as u32))
    });
    let (_session, engine, input, format, rate) = match opened {
        Ok(opened) => opened,
        Err(e) => return ctx.opened(Err(e)),
    };
    log::info!("AVAudioEngine capture: {} Hz, voice processing on", rate);
    ctx.opened(Ok(StreamInfo {
        rate,
        period_frames: TAP_FRAMES as usize,
    }));

    let Some(producer) = ctx.wait_for_start() else {
        return;
    };
    let tap = install_tap(&input, &format, producer);
    if let Err(e) = start_engine(&engine) {
        unsafe {
            let _: () = msg_send![&input, removeTapOnBus: 0usize];
        }
        return ctx.started(Err(e));
    }
    ctx.started(Ok(()));

    ctx.wait_for_stop();

    unsafe {
        let _: () = msg_send![&input, removeTapOnBus: 0usize];
        let _: () = msg_send![&engine, stop];
    }
    drop(tap);
}

/// Tap the input node and push its first channel into `producer`.
fn install_tap(input: &AnyObject, format: &AnyObject, producer: FrameProducer) -> TapBlock {
    let producer = RefCell::new(producer);
    let block: TapBlock = RcBlock::new(move |buffer: *mut AnyObject, _when: *mut AnyObject| {
        if buffer.is_null() {
            return;
        }
        unsafe {
            let frames: u32 = msg_send![buffer, frameLength];
            let channels: *const *const f32 = msg_send![buffer, floatChannelData];
            if frames == 0 || channels.is_null() || (*channels).is_null() {
                return;
            }
            let mono = std::slice::from_raw_parts(*channels, frames as usize);
            producer.borrow_mut().push(mono);
        }
    });

    unsafe {
        let _: () = msg_send![
            input,
            installTapOnBus: 0usize,
            bufferSize: TAP_FRAMES,
            format: format,
            block: &*block
        ];
    }
    block
}

/// Far-end playback through an `AVAudioSourceNode` on a voice-processed
/// engine.
pub struct AvAudioPlayback {
    device: DeviceThread<SampleSource>,
}

impl PlaybackBackend for AvAudioPlayback {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let device = DeviceThread::spawn("avaudio-playback", playback_thread)?;
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
    let opened = configure_session(false).and_then(|session| {
        let (engine, _input) = voice_engine()?;
        let output: Retained<AnyObject> = unsafe { msg_send![&engine, outputNode] };
        let hardware: Retained<AnyObject> = unsafe { msg_send![&output, outputFormatForBus: 0usize] };
        let rate: f64 = unsafe { msg_send![&hardware, sampleRate] };
        if rate <= 0.0 {
            return Err(VoiceError::DeviceUnavailable);
        }
        Ok((session, engine, rate))
    });
    let (_session, engine, rate) = match opened {
        Ok(opened) => opened,
        Err(e) => return ctx.opened(Err(e)),
    };
    ctx.opened(Ok(StreamInfo {
        rate: rate as u32,
        period_frames: TAP_FRAMES as usize,
    }));

    let Some(source) = ctx.wait_for_start() else {
        return;
    };
    let (node, render) = attach_source_node(&engine, rate, source);
    if let Err(e) = start_engine(&engine) {
        return ctx.started(Err(e));
    }
    ctx.started(Ok(()));

    ctx.wait_for_stop();

    unsafe {
        let _: () = msg_send![&engine, stop];
        let _: () = msg_send![&engine, detachNode: &*node];
    }
    drop(render);
}

/// Attach a mono source node rendering from `source` to the main mixer.
fn attach_source_node(
    engine: &AnyObject,
    rate: f64,
    source: SampleSource,
) -> (Retained<AnyObject>, RenderBlock) {
    let source = RefCell::new(source);
    let render: RenderBlock = RcBlock::new(
        move |_silence: *mut Bool, _time: *const c_void, frames: u32, data: *mut c_void| -> i32 {
            let list = data as *mut AudioBufferList;
            if list.is_null() {
                return 0;
            }
            unsafe {
                if (*list).number_buffers == 0 {
                    return 0;
                }
                let buffer = &mut (*list).buffers[0];
                if buffer.data.is_null() {
                    return 0;
                }
                let capacity = buffer.data_byte_size as usize / std::mem::size_of::<f32>();
                let out = std::slice::from_raw_parts_mut(buffer.data, (frames as usize).min(capacity));
                source.borrow_mut().fill(out, 1);
            }
            0
        },
    );

    unsafe {
        let format: Allocated<AnyObject> = msg_send![class!(AVAudioFormat), alloc];
        let format: Retained<AnyObject> =
            msg_send![format, initStandardFormatWithSampleRate: rate, channels: 1u32];

        let node: Allocated<AnyObject> = msg_send![class!(AVAudioSourceNode), alloc];
        let node: Retained<AnyObject> =
            msg_send![node, initWithFormat: &*format, renderBlock: &*render];

        let mixer: Retained<AnyObject> = msg_send![engine, mainMixerNode];
        let _: () = msg_send![engine, attachNode: &*node];
        let _: () = msg_send![engine, connect: &*node, to: &*mixer, format: &*format];
        (node, render)
    }
}
