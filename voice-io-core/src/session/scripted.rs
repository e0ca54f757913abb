//! Deterministic in-process backends for session tests.
//!
//! A `Script` is installed on the test thread right before the session is
//! created; `open` picks it up from a thread-local so tests can run in
//! parallel without sharing configuration.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::config::VoiceConfig;
use crate::models::error::{VoiceError, VoiceResult};
use crate::processing::ring_buffer::FrameProducer;
use crate::traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

thread_local! {
    static NEXT_SCRIPT: RefCell<Option<Script>> = const { RefCell::new(None) };
}

/// Observations shared between a scripted backend and its test.
#[derive(Debug, Default)]
pub(crate) struct Probe {
    opens: AtomicUsize,
    starts: AtomicUsize,
    closes: AtomicUsize,
    callbacks: AtomicUsize,
    callback_after_close: AtomicBool,
    closed: AtomicBool,
    played: Mutex<Vec<f32>>,
}

impl Probe {
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn callbacks(&self) -> usize {
        self.callbacks.load(Ordering::SeqCst)
    }

    pub(crate) fn callback_after_close(&self) -> bool {
        self.callback_after_close.load(Ordering::SeqCst)
    }

    /// Everything a scripted playback device has rendered, silence excluded.
    pub(crate) fn played(&self) -> Vec<f32> {
        self.played.lock().clone()
    }

    fn callback(&self) {
        if self.closed.load(Ordering::SeqCst) {
            self.callback_after_close.store(true, Ordering::SeqCst);
        }
        self.callbacks.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Script {
    native_rate: u32,
    period_frames: usize,
    interval: Duration,
    batches: Option<usize>,
    open_error: Option<VoiceError>,
    start_error: Option<VoiceError>,
    fail_with: Option<VoiceError>,
    probe: Arc<Probe>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            native_rate: 48000,
            period_frames: 480,
            interval: Duration::from_millis(1),
            batches: None,
            open_error: None,
            start_error: None,
            fail_with: None,
            probe: Arc::new(Probe::default()),
        }
    }
}

impl Script {
    pub(crate) fn native_rate(mut self, rate: u32) -> Self {
        self.native_rate = rate;
        self
    }

    pub(crate) fn period(mut self, frames: usize) -> Self {
        self.period_frames = frames;
        self
    }

    pub(crate) fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop producing after `n` callbacks; the stream stays open.
    pub(crate) fn batches(mut self, n: usize) -> Self {
        self.batches = Some(n);
        self
    }

    pub(crate) fn open_error(mut self, error: VoiceError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub(crate) fn start_error(mut self, error: VoiceError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Raise `error` once the scripted batches are exhausted.
    pub(crate) fn fail_with(mut self, error: VoiceError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub(crate) fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }

    /// Use this script for the next backend opened on this thread.
    pub(crate) fn install(self) {
        NEXT_SCRIPT.with(|next| *next.borrow_mut() = Some(self));
    }

    fn take() -> Self {
        NEXT_SCRIPT
            .with(|next| next.borrow_mut().take())
            .unwrap_or_default()
    }
}

/// Device thread shared by both scripted directions.
struct Worker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(interval: Duration, mut tick: impl FnMut(usize) -> bool + Send + 'static) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::spawn(move || {
            let mut next = Instant::now();
            let mut index = 0;
            while flag.load(Ordering::SeqCst) {
                if !tick(index) {
                    thread::sleep(interval);
                    continue;
                }
                index += 1;
                next += interval;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
        });
        Self {
            running,
            thread: Some(thread),
        }
    }

    fn join(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) struct ScriptedCapture {
    script: Script,
    worker: Option<Worker>,
    closed: bool,
}

impl CaptureBackend for ScriptedCapture {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let script = Script::take();
        if let Some(e) = script.open_error.clone() {
            return Err(e);
        }
        script.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            script,
            worker: None,
            closed: false,
        })
    }

    fn native_rate(&self) -> u32 {
        self.script.native_rate
    }

    fn period_frames(&self) -> usize {
        self.script.period_frames
    }

    fn start(&mut self, mut producer: FrameProducer) -> VoiceResult<()> {
        if let Some(e) = self.script.start_error.clone() {
            return Err(e);
        }
        self.script.probe.starts.fetch_add(1, Ordering::SeqCst);

        let period = self.script.period_frames;
        let batches = self.script.batches;
        let mut failure = self.script.fail_with.clone();
        let probe = self.script.probe();
        let mut batch = vec![0.0f32; period];

        self.worker = Some(Worker::spawn(self.script.interval, move |index| {
            if batches.is_some_and(|n| index >= n) {
                if let Some(e) = failure.take() {
                    producer.fail(e);
                }
                return false;
            }
            // Sample values count frames so tests can check ordering.
            for (i, s) in batch.iter_mut().enumerate() {
                *s = (index * period + i) as f32;
            }
            producer.push(&batch);
            probe.callback();
            true
        }));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut worker) = self.worker.take() {
            worker.join();
        }
        self.script.probe.closed.store(true, Ordering::SeqCst);
        self.script.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedPlayback {
    script: Script,
    worker: Option<Worker>,
    closed: bool,
}

impl PlaybackBackend for ScriptedPlayback {
    fn open(_config: &VoiceConfig) -> VoiceResult<Self> {
        let script = Script::take();
        if let Some(e) = script.open_error.clone() {
            return Err(e);
        }
        script.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            script,
            worker: None,
            closed: false,
        })
    }

    fn native_rate(&self) -> u32 {
        self.script.native_rate
    }

    fn period_frames(&self) -> usize {
        self.script.period_frames
    }

    fn start(&mut self, mut source: SampleSource) -> VoiceResult<()> {
        if let Some(e) = self.script.start_error.clone() {
            return Err(e);
        }
        self.script.probe.starts.fetch_add(1, Ordering::SeqCst);

        let batches = self.script.batches;
        let mut failure = self.script.fail_with.clone();
        let probe = self.script.probe();
        let mut device = vec![0.0f32; self.script.period_frames * 2];

        self.worker = Some(Worker::spawn(self.script.interval, move |index| {
            if batches.is_some_and(|n| index >= n) {
                if let Some(e) = failure.take() {
                    source.fail(e);
                }
                return false;
            }
            probe.callback();
            let frames = source.fill(&mut device, 2);
            probe
                .played
                .lock()
                .extend(device[..frames * 2].iter().step_by(2));
            true
        }));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut worker) = self.worker.take() {
            worker.join();
        }
        self.script.probe.closed.store(true, Ordering::SeqCst);
        self.script.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}
