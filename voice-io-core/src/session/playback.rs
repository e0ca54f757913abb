use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use uuid::Uuid;

use super::capture::Lifecycle;
use crate::models::config::{Channels, VoiceConfig};
use crate::models::error::{VoiceError, VoiceResult};
use crate::models::state::{SessionState, StreamState};
use crate::processing::ring_buffer::{frame_channel, FrameProducer, RingBuffer, ThreadWaker};
use crate::traits::backend::{PlaybackBackend, SampleSource};

/// Deregisters a blocked writer's waker when `write` returns.
struct SpaceRegistration<'a>(&'a RingBuffer);

impl Drop for SpaceRegistration<'_> {
    fn drop(&mut self) {
        self.0.clear_space_waker();
    }
}

/// Output stream for the far-end signal, routed through the same voice
/// processing unit as capture so it serves as the echo reference.
///
/// Writers queue mono samples; the device callback drains them and renders
/// silence on underflow.
pub struct PlaybackSession<B: PlaybackBackend> {
    id: Uuid,
    config: VoiceConfig,
    native_rate: u32,
    backend: Mutex<Option<B>>,
    ring: Arc<RingBuffer>,
    producer: Mutex<FrameProducer>,
    lifecycle: Mutex<Lifecycle>,
}

impl<B: PlaybackBackend> PlaybackSession<B> {
    pub fn create(config: VoiceConfig) -> VoiceResult<Self> {
        config.validate().map_err(VoiceError::InvalidConfig)?;

        let id = Uuid::new_v4();
        let mut backend = B::open(&config).inspect_err(|e| {
            log::warn!("session={} playback open failed: {}", id, e);
        })?;

        let native_rate = backend.native_rate();
        if native_rate == 0 {
            backend.close();
            return Err(VoiceError::BackendError(
                "backend negotiated a zero sample rate".into(),
            ));
        }

        let capacity = config.ring_capacity_frames(native_rate, backend.period_frames());
        let (producer, consumer) = frame_channel(capacity, Channels::Mono);
        let ring = Arc::clone(producer.ring());

        let session = Self {
            id,
            config,
            native_rate,
            backend: Mutex::new(Some(backend)),
            ring,
            producer: Mutex::new(producer),
            lifecycle: Mutex::new(Lifecycle::new()),
        };
        session.start(SampleSource::new(consumer))?;

        log::info!(
            "session={} playback running at {} Hz, queue {} frames",
            id,
            native_rate,
            capacity
        );
        Ok(session)
    }

    fn start(&self, source: SampleSource) -> VoiceResult<()> {
        let mut backend = self.backend.lock();
        let Some(stream) = backend.as_mut() else {
            return Err(VoiceError::BackendError("playback stopped".into()));
        };
        if let Err(e) = stream.start(source) {
            log::warn!("session={} playback start failed: {}", self.id, e);
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

    /// The only rate `write` accepts.
    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().observe(self.ring.error()).0
    }

    pub fn stream_state(&self) -> StreamState {
        self.lifecycle.lock().observe(self.ring.error()).1
    }

    /// Frames queued but not yet rendered.
    pub fn pending_frames(&self) -> usize {
        self.ring.available_frames()
    }

    /// Queue mono samples at `sample_rate` for playback.
    ///
    /// Blocks while the device queue is full and returns once every sample
    /// is queued. Audio at any other rate than `native_rate()` is rejected;
    /// there is no resampler.
    pub fn write(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<()> {
        if sample_rate != self.native_rate {
            return Err(VoiceError::InvalidConfig(format!(
                "playback runs at {} Hz, got {} Hz audio",
                self.native_rate, sample_rate
            )));
        }

        let mut producer = self.producer.lock();
        let waker = ThreadWaker::current();
        let _registration = SpaceRegistration(&self.ring);
        let mut remaining = samples;

        while !remaining.is_empty() {
            if let Some(e) = self.ring.error() {
                return Err(e.clone());
            }
            if self.ring.is_closed() {
                return Err(VoiceError::BackendError("playback stopped".into()));
            }

            let free = producer.free_frames();
            if free == 0 {
                self.ring.register_space_waker(&waker);
                if producer.free_frames() == 0
                    && !self.ring.is_closed()
                    && self.ring.error().is_none()
                {
                    thread::park();
                }
                continue;
            }

            let n = free.min(remaining.len());
            producer.push(&remaining[..n]);
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Stop rendering and release the output device. Idempotent; a writer
    /// blocked in `write` returns an error.
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

        log::info!(
            "session={} playback stopped ({} frames unplayed)",
            self.id,
            self.ring.available_frames()
        );
    }
}

impl<B: PlaybackBackend> Drop for PlaybackSession<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
