//! Lock-free single-producer/single-consumer frame ring.
//!
//! The producer half runs on the OS audio callback thread: `push` never
//! locks, blocks or allocates. Samples are stored as `f32` bit patterns in
//! atomic slots so a consumer racing a lapping producer reads stale or new
//! values, never undefined ones.
//!
//! Overflow behavior: the producer never waits for the consumer. When the
//! consumer falls more than `capacity` frames behind, the oldest unread
//! frames are overwritten and the consumer reports an overrun on its next
//! non-empty read. Only the producer advances the write position and only
//! the consumer advances the read position.
//!
//! Torn reads are detected seqlock-style: the producer publishes the end of
//! the range it is about to overwrite (`claimed`) before touching slots, and
//! the consumer re-checks `claimed` after copying, discarding any prefix the
//! producer may have overwritten underneath it.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

use futures::task::AtomicWaker;

use crate::models::config::Channels;
use crate::models::error::VoiceError;
use crate::models::frames::{CaptureStats, Frames};

/// Shared state between a `FrameProducer` and its `FrameConsumer`.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Box<[AtomicU32]>,
    /// Capacity in samples, a multiple of `channels`.
    capacity: u64,
    channels: usize,
    claimed: AtomicU64,
    written: AtomicU64,
    read: AtomicU64,
    closed: AtomicBool,
    /// Set by the producer when it had to discard part of an oversized batch.
    truncated: AtomicBool,
    error: OnceLock<VoiceError>,
    data_waker: AtomicWaker,
    space_waker: AtomicWaker,
    callback_count: AtomicU64,
    frames_produced: AtomicU64,
    frames_dropped: AtomicU64,
    overrun_count: AtomicU64,
}

/// Create a ring holding `capacity_frames` frames of `channels` samples.
///
/// A capacity of zero is rounded up to one frame.
pub fn frame_channel(capacity_frames: usize, channels: Channels) -> (FrameProducer, FrameConsumer) {
    let ring = Arc::new(RingBuffer::new(capacity_frames.max(1), channels.count()));
    (
        FrameProducer {
            ring: Arc::clone(&ring),
            written: 0,
        },
        FrameConsumer {
            ring,
            read: 0,
            overrun_pending: false,
        },
    )
}

impl RingBuffer {
    fn new(capacity_frames: usize, channels: usize) -> Self {
        let capacity = capacity_frames * channels;
        Self {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            capacity: capacity as u64,
            channels,
            claimed: AtomicU64::new(0),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            truncated: AtomicBool::new(false),
            error: OnceLock::new(),
            data_waker: AtomicWaker::new(),
            space_waker: AtomicWaker::new(),
            callback_count: AtomicU64::new(0),
            frames_produced: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            overrun_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &AtomicU32 {
        &self.slots[(position % self.capacity) as usize]
    }

    pub fn capacity_frames(&self) -> usize {
        (self.capacity / self.channels as u64) as usize
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Stop accepting frames and wake both sides. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data_waker.wake();
        self.space_waker.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record a terminal error. The first error wins; later ones are ignored.
    pub fn fail(&self, error: VoiceError) {
        let _ = self.error.set(error);
        self.data_waker.wake();
        self.space_waker.wake();
    }

    pub fn error(&self) -> Option<&VoiceError> {
        self.error.get()
    }

    /// Frames currently queued for the consumer.
    pub fn available_frames(&self) -> usize {
        let written = self.written.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (written.saturating_sub(read).min(self.capacity) / self.channels as u64) as usize
    }

    pub fn register_space_waker(&self, waker: &Waker) {
        self.space_waker.register(waker);
    }

    /// Drop the registered space waker on the calling thread, so the audio
    /// thread never releases the last reference to it.
    pub fn clear_space_waker(&self) {
        drop(self.space_waker.take());
    }

    /// Same as `clear_space_waker`, for the consumer's data waker.
    pub fn clear_data_waker(&self) {
        drop(self.data_waker.take());
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            callback_count: self.callback_count.load(Ordering::Relaxed),
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            overrun_count: self.overrun_count.load(Ordering::Relaxed),
        }
    }
}

/// Writing half, owned by the real-time callback.
#[derive(Debug)]
pub struct FrameProducer {
    ring: Arc<RingBuffer>,
    written: u64,
}

impl FrameProducer {
    /// Append mono samples, one frame each, duplicated across the ring's
    /// channels.
    ///
    /// Real-time safe. If `mono` is longer than the ring, only its newest
    /// `capacity` frames are kept. Ignored once the ring is closed.
    pub fn push(&mut self, mono: &[f32]) {
        let ring = &*self.ring;
        if mono.is_empty() || ring.is_closed() {
            return;
        }

        let capacity_frames = ring.capacity_frames();
        let (frames, skipped) = if mono.len() > capacity_frames {
            let skipped = mono.len() - capacity_frames;
            (&mono[skipped..], skipped)
        } else {
            (mono, 0)
        };

        let channels = ring.channels as u64;
        let start = self.written;
        let end = start + frames.len() as u64 * channels;

        ring.claimed.store(end, Ordering::Relaxed);
        fence(Ordering::Release);

        let mut position = start;
        for &sample in frames {
            let bits = sample.to_bits();
            for _ in 0..channels {
                ring.slot(position).store(bits, Ordering::Relaxed);
                position += 1;
            }
        }

        ring.written.store(end, Ordering::Release);
        self.written = end;

        ring.callback_count.fetch_add(1, Ordering::Relaxed);
        ring.frames_produced
            .fetch_add(mono.len() as u64, Ordering::Relaxed);
        if skipped > 0 {
            ring.frames_dropped
                .fetch_add(skipped as u64, Ordering::Relaxed);
            ring.overrun_count.fetch_add(1, Ordering::Relaxed);
            ring.truncated.store(true, Ordering::Relaxed);
        }

        ring.data_waker.wake();
    }

    /// Frames that can be pushed without evicting unread ones.
    pub fn free_frames(&self) -> usize {
        let ring = &*self.ring;
        let read = ring.read.load(Ordering::Acquire);
        let used = self.written.saturating_sub(read).min(ring.capacity);
        ((ring.capacity - used) / ring.channels as u64) as usize
    }

    pub fn fail(&self, error: VoiceError) {
        self.ring.fail(error);
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }
}

/// Outcome of `FrameConsumer::pop_into`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Popped {
    /// Samples written to the front of the output slice (whole frames).
    pub samples: usize,
    /// Older frames were evicted since the previous non-empty read.
    pub overrun: bool,
}

/// Reading half. Holds the only read cursor of the ring.
#[derive(Debug)]
pub struct FrameConsumer {
    ring: Arc<RingBuffer>,
    read: u64,
    overrun_pending: bool,
}

impl FrameConsumer {
    /// Copy up to `out.len()` samples (rounded down to whole frames) of the
    /// oldest queued audio into `out`.
    ///
    /// Lock-free and allocation-free; never writes past `out.len()`.
    pub fn pop_into(&mut self, out: &mut [f32]) -> Popped {
        let ring = &*self.ring;
        let written = ring.written.load(Ordering::Acquire);

        let mut start = self.read;
        if written.saturating_sub(start) > ring.capacity {
            start = written - ring.capacity;
        }

        let limit = (out.len() / ring.channels * ring.channels) as u64;
        let mut len = written.saturating_sub(start).min(limit);
        for (i, dst) in out.iter_mut().take(len as usize).enumerate() {
            *dst = f32::from_bits(ring.slot(start + i as u64).load(Ordering::Relaxed));
        }

        fence(Ordering::Acquire);
        let oldest_intact = ring
            .claimed
            .load(Ordering::Relaxed)
            .saturating_sub(ring.capacity);
        if oldest_intact > start {
            let torn = (oldest_intact - start).min(len);
            out.copy_within(torn as usize..len as usize, 0);
            len -= torn;
            start = oldest_intact;
        }

        if ring.truncated.swap(false, Ordering::Relaxed) {
            self.overrun_pending = true;
        }

        let lost = start.saturating_sub(self.read);
        if lost > 0 {
            self.overrun_pending = true;
            ring.overrun_count.fetch_add(1, Ordering::Relaxed);
            ring.frames_dropped
                .fetch_add(lost / ring.channels as u64, Ordering::Relaxed);
        }

        self.read = start + len;
        ring.read.store(self.read, Ordering::Release);

        let overrun = if len > 0 {
            ring.space_waker.wake();
            std::mem::take(&mut self.overrun_pending)
        } else {
            false
        };

        Popped {
            samples: len as usize,
            overrun,
        }
    }

    /// Drain everything currently queued. Returns `None` when empty.
    pub fn pop_all(&mut self) -> Option<Frames> {
        let available = self.ring.available_frames();
        if available == 0 {
            return None;
        }

        let mut samples = vec![0.0f32; available * self.ring.channels];
        let popped = self.pop_into(&mut samples);
        if popped.samples == 0 {
            return None;
        }
        samples.truncate(popped.samples);

        let channels = if self.ring.channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };
        Some(Frames::new(samples, channels, popped.overrun))
    }

    /// Register the task or thread to wake on the next push, failure or
    /// close. Only the most recently registered waker is kept.
    pub fn register_waker(&self, waker: &Waker) {
        self.ring.data_waker.register(waker);
    }

    pub fn available_frames(&self) -> usize {
        self.ring.available_frames()
    }

    pub fn error(&self) -> Option<&VoiceError> {
        self.ring.error()
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }
}

/// Waker that unparks a blocked OS thread.
pub struct ThreadWaker(Thread);

thread_local! {
    static THREAD_WAKER: Waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
}

impl ThreadWaker {
    /// Waker for the calling thread. One instance per thread, so a clone
    /// held by the other side of the ring is never the last reference.
    pub fn current() -> Waker {
        THREAD_WAKER.with(Waker::clone)
    }
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}
