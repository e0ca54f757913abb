use std::future;
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::config::{Channels, VoiceConfig};
use crate::models::error::{VoiceError, VoiceResult};
use crate::models::frames::{CaptureStats, Frames, RecvInto};
use crate::models::state::{SessionState, StreamState};
use crate::processing::ring_buffer::{
    frame_channel, FrameConsumer, FrameProducer, RingBuffer, ThreadWaker,
};
use crate::traits::backend::CaptureBackend;

/// Deregisters the receiver's waker when a receive call returns or its
/// future is dropped, so the audio thread never drops the last reference.
struct Registration<'a>(&'a RingBuffer);

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.0.clear_data_waker();
    }
}

/// Session and stream state, protected by one `parking_lot::Mutex`.
///
/// Only touched by create/stop and state queries, never by the audio
/// callback.
pub(crate) struct Lifecycle {
    pub(crate) session: SessionState,
    pub(crate) stream: StreamState,
}

impl Lifecycle {
    /// Backend opened, stream not yet started.
    pub(crate) fn new() -> Self {
        Self {
            session: SessionState::Uninitialized,
            stream: StreamState::Opening,
        }
    }

    pub(crate) fn started(&mut self) {
        self.session = SessionState::Running;
        self.stream = StreamState::Running;
    }

    /// Effective state, folding in a terminal error raised by the backend.
    pub(crate) fn observe(&self, error: Option<&VoiceError>) -> (SessionState, StreamState) {
        match (&self.session, error) {
            (SessionState::Running, Some(e)) => (SessionState::Failed(e.clone()), StreamState::Failed),
            (session, _) => (session.clone(), self.stream),
        }
    }
}

/// Voice-processed microphone capture.
///
/// Owns one backend stream and one ring buffer. The backend's callback is
/// the only producer; receive calls on any thread share the single consumer
/// cursor, so each frame is delivered exactly once.
///
/// ```text
/// [OS callback] → FrameProducer → [RingBuffer] → FrameConsumer → recv_blocking / try_recv / recv_async
/// ```
pub struct CaptureSession<B: CaptureBackend> {
    id: Uuid,
    config: VoiceConfig,
    native_rate: u32,
    period_frames: usize,
    backend: Mutex<Option<B>>,
    ring: Arc<RingBuffer>,
    consumer: Mutex<FrameConsumer>,
    lifecycle: Mutex<Lifecycle>,
}

impl<B: CaptureBackend> CaptureSession<B> {
    /// Open the backend and start moving frames into the ring buffer.
    ///
    /// Configuration and permission problems fail here; the frame callback
    /// is never registered when this returns an error.
    pub fn create(config: VoiceConfig) -> VoiceResult<Self> {
        config.validate().map_err(VoiceError::InvalidConfig)?;

        let id = Uuid::new_v4();
        log::debug!(
            "session={} opening capture (requested {} Hz, {:?})",
            id,
            config.sample_rate,
            config.channels
        );

        let mut backend = B::open(&config).inspect_err(|e| {
            log::warn!("session={} capture open failed: {}", id, e);
        })?;

        let native_rate = backend.native_rate();
        if native_rate == 0 {
            backend.close();
            return Err(VoiceError::BackendError(
                "backend negotiated a zero sample rate".into(),
            ));
        }

        let period_frames = backend.period_frames();
        let capacity = config.ring_capacity_frames(native_rate, period_frames);
        let (producer, consumer) = frame_channel(capacity, config.channels);
        let ring = Arc::clone(consumer.ring());

        let session = Self {
            id,
            config,
            native_rate,
            period_frames,
            backend: Mutex::new(Some(backend)),
            ring,
            consumer: Mutex::new(consumer),
            lifecycle: Mutex::new(Lifecycle::new()),
        };
        session.start(producer)?;

        log::info!(
            "session={} capture running at {} Hz ({} Hz requested), period {} frames, ring {} frames",
            id,
            native_rate,
            session.config.sample_rate,
            period_frames,
            capacity
        );
        Ok(session)
    }

    /// Uninitialized → Running. A failed start closes the backend here, so
    /// dropping the session afterwards does not close it again.
    fn start(&self, producer: FrameProducer) -> VoiceResult<()> {
        let mut backend = self.backend.lock();
        let Some(stream) = backend.as_mut() else {
            return Err(VoiceError::BackendError("capture stopped".into()));
        };
        if let Err(e) = stream.start(producer) {
            log::warn!("session={} capture start failed: {}", self.id, e);
            if let Some(mut stream) = backend.take() {
                stream.close();
            }
            return Err(e);
        }
        self.lifecycle.lock().started();
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    /// Rate the device actually runs at. Use this, not the requested rate,
    /// to interpret received samples.
    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn channels(&self) -> Channels {
        self.config.channels
    }

    /// Frames per device callback.
    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().observe(self.ring.error()).0
    }

    pub fn stream_state(&self) -> StreamState {
        self.lifecycle.lock().observe(self.ring.error()).1
    }

    pub fn is_stopped(&self) -> bool {
        self.backend.lock().is_none()
    }

    pub fn stats(&self) -> CaptureStats {
        self.ring.stats()
    }

    /// Frames waiting to be received.
    pub fn available_frames(&self) -> usize {
        self.ring.available_frames()
    }

    /// Return queued frames, a terminal error, or `None` without blocking.
    ///
    /// `None` means no data yet, or the session is stopped and drained.
    pub fn try_recv(&self) -> Option<VoiceResult<Frames>> {
        let mut consumer = self.consumer.lock();
        Self::take_ready(&mut consumer)
    }

    /// Copy at most `out.len()` samples (whole frames) into `out`.
    ///
    /// Frames that do not fit stay queued for the next call.
    pub fn try_recv_into(&self, out: &mut [f32]) -> Option<VoiceResult<RecvInto>> {
        let mut consumer = self.consumer.lock();
        if let Some(e) = consumer.error() {
            return Some(Err(e.clone()));
        }
        let popped = consumer.pop_into(out);
        (popped.samples > 0).then_some(Ok(RecvInto {
            samples: popped.samples,
            overrun: popped.overrun,
        }))
    }

    /// Block the calling thread until frames arrive, the backend fails, or
    /// the session stops. Returns `None` once stopped with nothing left.
    pub fn recv_blocking(&self) -> Option<VoiceResult<Frames>> {
        let waker = ThreadWaker::current();
        let _registration = Registration(&self.ring);
        loop {
            match self.poll_recv(&waker) {
                Poll::Ready(item) => return item,
                Poll::Pending => thread::park(),
            }
        }
    }

    /// Like `recv_blocking`, giving up after `timeout` with `None`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<VoiceResult<Frames>> {
        let deadline = Instant::now() + timeout;
        let waker = ThreadWaker::current();
        let _registration = Registration(&self.ring);
        loop {
            match self.poll_recv(&waker) {
                Poll::Ready(item) => return item,
                Poll::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Wait for frames without blocking the executor thread.
    ///
    /// Woken by the producer's push, a backend failure, or `stop()`.
    pub async fn recv_async(&self) -> Option<VoiceResult<Frames>> {
        let _registration = Registration(&self.ring);
        future::poll_fn(|cx| self.poll_recv(cx.waker())).await
    }

    fn poll_recv(&self, waker: &Waker) -> Poll<Option<VoiceResult<Frames>>> {
        let mut consumer = self.consumer.lock();
        if let Some(item) = Self::take_ready(&mut consumer) {
            return Poll::Ready(Some(item));
        }
        if consumer.is_closed() {
            return Poll::Ready(Self::take_ready(&mut consumer));
        }

        consumer.register_waker(waker);

        // A push may have landed between the first check and registration.
        if let Some(item) = Self::take_ready(&mut consumer) {
            return Poll::Ready(Some(item));
        }
        if consumer.is_closed() {
            return Poll::Ready(Self::take_ready(&mut consumer));
        }
        Poll::Pending
    }

    /// A backend error outranks queued data and is reported on every call.
    fn take_ready(consumer: &mut FrameConsumer) -> Option<VoiceResult<Frames>> {
        if let Some(e) = consumer.error() {
            return Some(Err(e.clone()));
        }
        consumer.pop_all().map(Ok)
    }

    /// Stop capture and release the device.
    ///
    /// Idempotent and callable from any thread. When this returns the
    /// backend callback can no longer fire, and every blocked or suspended
    /// receive has been woken. Concurrent callers wait for the first one to
    /// finish tearing down.
    pub fn stop(&self) {
        let mut backend = self.backend.lock();
        let Some(mut stream) = backend.take() else {
            return;
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.session = SessionState::Stopping;
            lifecycle.stream = StreamState::Closing;
        }

        stream.close();
        drop(stream);
        self.ring.close();

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.session = SessionState::Stopped;
            lifecycle.stream = StreamState::Closed;
        }
        drop(backend);

        let stats = self.ring.stats();
        log::info!(
            "session={} capture stopped ({} callbacks, {} frames, {} dropped in {} overruns)",
            self.id,
            stats.callback_count,
            stats.frames_produced,
            stats.frames_dropped,
            stats.overrun_count
        );
    }
}

impl<B: CaptureBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::scripted::{Script, ScriptedCapture};
    use approx::assert_abs_diff_eq;

    fn session(script: Script) -> CaptureSession<ScriptedCapture> {
        script.install();
        CaptureSession::create(VoiceConfig::default()).expect("scripted open")
    }

    fn collect_blocking(session: &CaptureSession<ScriptedCapture>, frames: usize) -> Vec<f32> {
        let mut out = Vec::new();
        while out.len() < frames {
            match session.recv_blocking() {
                Some(Ok(batch)) => out.extend_from_slice(&batch),
                Some(Err(e)) => panic!("unexpected error: {e}"),
                None => break,
            }
        }
        out
    }

    #[test]
    fn reports_negotiated_rate_not_request() {
        Script::default().native_rate(48000).install();
        let session = CaptureSession::<ScriptedCapture>::create(VoiceConfig::new(16000)).unwrap();

        assert_eq!(session.native_rate(), 48000);
        assert_eq!(session.config().sample_rate, 16000);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.stream_state(), StreamState::Running);
    }

    #[test]
    fn hundred_ms_of_callbacks_yields_4800_frames() {
        Script::default()
            .native_rate(48000)
            .period(480)
            .batches(10)
            .install();
        let session = CaptureSession::<ScriptedCapture>::create(VoiceConfig::new(16000)).unwrap();

        let samples = collect_blocking(&session, 4800);
        assert_eq!(samples.len(), 4800);
        assert_eq!(session.native_rate(), 48000);
    }

    #[test]
    fn blocking_receive_preserves_order() {
        let session = session(Script::default().period(64).batches(40));
        let samples = collect_blocking(&session, 64 * 40);

        assert_eq!(samples.len(), 64 * 40);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(*s, i as f32, "frame {i} out of order");
        }
    }

    #[test]
    fn try_recv_never_blocks() {
        let session = session(Script::default().batches(0));
        assert!(session.try_recv().is_none());
        assert!(session.try_recv().is_none());
    }

    #[test]
    fn stereo_duplicates_mono_signal() {
        Script::default().period(32).batches(2).install();
        let config = VoiceConfig {
            channels: Channels::Stereo,
            ..VoiceConfig::default()
        };
        let session = CaptureSession::<ScriptedCapture>::create(config).unwrap();

        let samples = collect_blocking(&session, 128);
        assert_eq!(samples.len(), 128);
        for (i, frame) in samples.chunks_exact(2).enumerate() {
            assert_abs_diff_eq!(frame[0], i as f32);
            assert_abs_diff_eq!(frame[1], frame[0]);
        }
    }

    #[test]
    fn permission_denied_never_invokes_callback() {
        let script = Script::default().open_error(VoiceError::PermissionDenied);
        let probe = script.probe();
        script.install();

        let result = CaptureSession::<ScriptedCapture>::create(VoiceConfig::default());
        assert_eq!(result.err(), Some(VoiceError::PermissionDenied));
        assert_eq!(probe.callbacks(), 0);
        assert_eq!(probe.starts(), 0);
    }

    #[test]
    fn invalid_config_fails_before_open() {
        let script = Script::default();
        let probe = script.probe();
        script.install();

        let result = CaptureSession::<ScriptedCapture>::create(VoiceConfig::new(0));
        assert!(matches!(result, Err(VoiceError::InvalidConfig(_))));
        assert_eq!(probe.opens(), 0);
    }

    #[test]
    fn lifecycle_starts_uninitialized() {
        let mut lifecycle = Lifecycle::new();
        let error = VoiceError::DeviceUnavailable;
        assert_eq!(
            lifecycle.observe(Some(&error)),
            (SessionState::Uninitialized, StreamState::Opening)
        );

        lifecycle.started();
        assert_eq!(
            lifecycle.observe(None),
            (SessionState::Running, StreamState::Running)
        );
        assert_eq!(
            lifecycle.observe(Some(&error)),
            (SessionState::Failed(error.clone()), StreamState::Failed)
        );
    }

    #[test]
    fn start_failure_closes_backend() {
        let script = Script::default().start_error(VoiceError::DeviceUnavailable);
        let probe = script.probe();
        script.install();

        let result = CaptureSession::<ScriptedCapture>::create(VoiceConfig::default());
        assert_eq!(result.err(), Some(VoiceError::DeviceUnavailable));
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_drop_does_not_close_twice() {
        let script = Script::default();
        let probe = script.probe();
        script.install();
        let session = CaptureSession::<ScriptedCapture>::create(VoiceConfig::default()).unwrap();

        session.stop();
        session.stop();
        assert!(session.is_stopped());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stream_state(), StreamState::Closed);
        drop(session);

        assert_eq!(probe.closes(), 1);
        assert!(!probe.callback_after_close());
    }

    #[test]
    fn drop_implies_stop() {
        let script = Script::default();
        let probe = script.probe();
        script.install();
        drop(CaptureSession::<ScriptedCapture>::create(VoiceConfig::default()).unwrap());

        assert_eq!(probe.closes(), 1);
        assert!(!probe.callback_after_close());
    }

    #[test]
    fn stop_wakes_blocked_receiver() {
        let session = Arc::new(session(Script::default().batches(0)));
        let receiver = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.recv_blocking())
        };

        thread::sleep(Duration::from_millis(30));
        let stopped_at = Instant::now();
        session.stop();

        assert!(receiver.join().unwrap().is_none());
        assert!(stopped_at.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn stop_from_another_thread_while_streaming() {
        let session = Arc::new(session(Script::default().period(16)));
        let stopper = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                session.stop();
            })
        };

        let mut last = -1.0f32;
        while let Some(item) = session.recv_blocking() {
            for &s in item.unwrap().iter() {
                assert!(s > last);
                last = s;
            }
        }
        stopper.join().unwrap();
        assert!(session.is_stopped());
    }

    #[test]
    fn buffered_frames_drain_after_stop() {
        let session = session(Script::default().period(100).batches(3));
        while session.available_frames() < 300 {
            thread::sleep(Duration::from_millis(1));
        }
        session.stop();

        let samples = collect_blocking(&session, 300);
        assert_eq!(samples.len(), 300);
        assert!(session.recv_blocking().is_none());
        assert!(session.try_recv().is_none());
    }

    #[test]
    fn device_failure_is_terminal_and_repeats() {
        let err = VoiceError::BackendError("device removed".into());
        let session = session(Script::default().batches(3).fail_with(err.clone()));

        let first = loop {
            match session.recv_blocking() {
                Some(Ok(_)) => continue,
                other => break other,
            }
        };
        assert_eq!(first, Some(Err(err.clone())));
        assert_eq!(session.try_recv(), Some(Err(err.clone())));
        assert_eq!(session.recv_blocking(), Some(Err(err.clone())));
        assert_eq!(session.state(), SessionState::Failed(err.clone()));
        assert_eq!(session.stream_state(), StreamState::Failed);

        let mut buf = [0.0f32; 8];
        assert_eq!(session.try_recv_into(&mut buf), Some(Err(err.clone())));

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.try_recv(), Some(Err(err)));
    }

    #[test]
    fn overrun_flag_seen_once() {
        let script = Script::default().period(200).batches(5);
        let probe = script.probe();
        script.install();
        let config = VoiceConfig {
            buffer_ms: 10,
            ..VoiceConfig::default()
        };
        // 10 ms at 48 kHz is 480 frames, raised to two periods (400 -> 480).
        let session = CaptureSession::<ScriptedCapture>::create(config).unwrap();

        while probe.callbacks() < 5 {
            thread::sleep(Duration::from_millis(1));
        }

        let first = session.try_recv().unwrap().unwrap();
        assert!(first.overrun());
        assert_eq!(first.len(), 480);
        // Oldest evicted: the newest 480 of 1000 frames remain.
        assert_eq!(first[0], 520.0);
        assert_eq!(session.stats().frames_dropped, 520);
        assert!(session.try_recv().is_none());
    }

    #[test]
    fn recv_into_respects_capacity() {
        let session = session(Script::default().period(50).batches(1));
        while session.available_frames() < 50 {
            thread::sleep(Duration::from_millis(1));
        }

        for capacity in [0usize, 1, 7, 20] {
            let mut buf = vec![-7.0f32; capacity + 4];
            let got = session.try_recv_into(&mut buf[..capacity]);
            let written = got.map(|r| r.unwrap().samples).unwrap_or(0);
            assert!(written <= capacity);
            assert!(buf[capacity..].iter().all(|&s| s == -7.0));
        }
        assert_eq!(session.available_frames(), 50 - 28);
    }

    #[test]
    fn recv_timeout_expires_without_data() {
        let session = session(Script::default().batches(0));
        let started = Instant::now();
        assert!(session.recv_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!session.is_stopped());
    }

    #[test]
    fn async_receive_with_block_on() {
        let session = session(Script::default().period(10).batches(3));
        let mut total = 0;
        while total < 30 {
            let frames = futures::executor::block_on(session.recv_async())
                .expect("stream open")
                .expect("no error");
            total += frames.len();
        }
        assert_eq!(total, 30);
    }

    struct Tracked;

    impl std::task::Wake for Tracked {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn receive_releases_its_waker_on_return() {
        let session = session(Script::default().period(64).batches(1));
        while session.available_frames() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let tracked = Arc::new(Tracked);
        let waker = Waker::from(Arc::clone(&tracked));
        let mut cx = std::task::Context::from_waker(&waker);
        let mut pending = Box::pin(session.recv_async());
        assert!(matches!(
            std::future::Future::poll(pending.as_mut(), &mut cx),
            Poll::Ready(Some(Ok(_)))
        ));
        drop(pending);
        drop(waker);
        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn cancelled_async_receive_releases_its_waker() {
        let session = session(Script::default().batches(0));

        let tracked = Arc::new(Tracked);
        let waker = Waker::from(Arc::clone(&tracked));
        let mut cx = std::task::Context::from_waker(&waker);
        let mut pending = Box::pin(session.recv_async());
        assert!(std::future::Future::poll(pending.as_mut(), &mut cx).is_pending());
        assert_eq!(Arc::strong_count(&tracked), 3);

        drop(pending);
        drop(waker);
        assert_eq!(Arc::strong_count(&tracked), 1);
        session.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_receive_is_woken_by_stop() {
        let session = Arc::new(session(Script::default().batches(0)));
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.recv_async().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("suspended receive returned after stop")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn async_receive_does_not_block_the_runtime() {
        let session = Arc::new(session(Script::default().period(48).batches(4)));
        let mut received = 0;
        while received < 48 * 4 {
            let frames = session.recv_async().await.unwrap().unwrap();
            received += frames.frame_count();
        }
        assert_eq!(received, 192);
    }
}
