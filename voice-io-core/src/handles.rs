//! Opaque-handle registry backing the C surface.
//!
//! Foreign callers only ever see a non-zero integer. Each handle encodes a
//! slot index and that slot's generation; removing an entry bumps the
//! generation, so a handle that was stopped (or whose slot has since been
//! reused) never resolves again.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::config::VoiceConfig;
use crate::models::error::VoiceError;
use crate::session::capture::CaptureSession;
use crate::session::playback::PlaybackSession;
use crate::traits::backend::{CaptureBackend, PlaybackBackend};

/// `play` accepted the samples.
pub const STATUS_OK: i32 = 0;
/// `recv` found no frames; try again later.
pub const STATUS_NO_DATA: i32 = 0;
/// Null, unknown or already-stopped handle.
pub const STATUS_INVALID_HANDLE: i32 = -1;
/// The session failed; the handle should be stopped.
pub const STATUS_BACKEND_ERROR: i32 = -2;
/// Bad buffer or sample rate passed to `play`.
pub const STATUS_INVALID_ARGUMENT: i32 = -3;

/// 32-bit targets trade concurrent handles for a wider generation.
const INDEX_BITS: u32 = if usize::BITS >= 64 { 32 } else { 10 };
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: usize = usize::MAX >> INDEX_BITS;

struct Entry<T> {
    generation: usize,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: Vec<usize>,
    /// Slots whose generation is exhausted. They are never reused, so a
    /// stale handle cannot alias a later session after a wrap.
    retired: usize,
}

/// Generation-checked table of shared values addressed by `usize` handles.
pub struct HandleTable<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                retired: 0,
            }),
        }
    }

    /// Store `value` and return its handle, or 0 when the table is full.
    pub fn insert(&self, value: T) -> usize {
        let mut slots = self.slots.lock();
        let value = Some(Arc::new(value));

        if let Some(index) = slots.free.pop() {
            let entry = &mut slots.entries[index];
            entry.value = value;
            return encode(index, entry.generation);
        }

        let index = slots.entries.len();
        if index >= INDEX_MASK {
            return 0;
        }
        slots.entries.push(Entry {
            generation: 0,
            value,
        });
        encode(index, 0)
    }

    pub fn get(&self, handle: usize) -> Option<Arc<T>> {
        let (index, generation) = decode(handle)?;
        let slots = self.slots.lock();
        slots
            .entries
            .get(index)
            .filter(|entry| entry.generation == generation)
            .and_then(|entry| entry.value.clone())
    }

    /// Detach the value from its handle. Callers still holding an `Arc`
    /// from `get` keep it alive until they drop it.
    pub fn remove(&self, handle: usize) -> Option<Arc<T>> {
        let (index, generation) = decode(handle)?;
        let mut slots = self.slots.lock();
        let entry = slots
            .entries
            .get_mut(index)
            .filter(|entry| entry.generation == generation)?;
        let value = entry.value.take()?;
        if entry.generation == GENERATION_MASK {
            slots.retired += 1;
        } else {
            entry.generation += 1;
            slots.free.push(index);
        }
        Some(value)
    }

    /// Handles currently resolving to a value.
    pub fn live_count(&self) -> usize {
        let slots = self.slots.lock();
        slots.entries.len() - slots.free.len() - slots.retired
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(index: usize, generation: usize) -> usize {
    (generation << INDEX_BITS) | (index + 1)
}

fn decode(handle: usize) -> Option<(usize, usize)> {
    let low = handle & INDEX_MASK;
    if low == 0 {
        return None;
    }
    Some((low - 1, handle >> INDEX_BITS))
}

/// Lazily opened playback of an endpoint. Once `stopped` is set no new
/// session is opened, even by a `play` that looked the handle up earlier.
struct PlaybackSlot<P: PlaybackBackend> {
    session: Option<Arc<PlaybackSession<P>>>,
    stopped: bool,
}

/// One capture session plus the playback session opened for it on demand.
struct Endpoint<C: CaptureBackend, P: PlaybackBackend> {
    capture: CaptureSession<C>,
    playback: Mutex<PlaybackSlot<P>>,
}

impl<C: CaptureBackend, P: PlaybackBackend> Endpoint<C, P> {
    fn new(capture: CaptureSession<C>) -> Self {
        Self {
            capture,
            playback: Mutex::new(PlaybackSlot {
                session: None,
                stopped: false,
            }),
        }
    }

    fn playback(&self) -> Result<Arc<PlaybackSession<P>>, VoiceError> {
        let mut slot = self.playback.lock();
        if slot.stopped {
            return Err(VoiceError::BackendError("capture handle stopped".into()));
        }
        if let Some(session) = slot.session.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(PlaybackSession::create(self.capture.config().clone())?);
        slot.session = Some(Arc::clone(&session));
        Ok(session)
    }

    fn stop(&self) {
        self.capture.stop();
        let playback = {
            let mut slot = self.playback.lock();
            slot.stopped = true;
            slot.session.take()
        };
        if let Some(playback) = playback {
            playback.stop();
        }
    }
}

/// Integer-status operations over a table of capture endpoints.
///
/// This is the whole behavior of the C surface minus pointer handling, so it
/// can be exercised with any backend pair.
pub struct HandleEngine<C: CaptureBackend, P: PlaybackBackend> {
    table: HandleTable<Endpoint<C, P>>,
}

impl<C: CaptureBackend, P: PlaybackBackend> HandleEngine<C, P> {
    pub fn new() -> Self {
        Self {
            table: HandleTable::new(),
        }
    }

    /// Start mono capture at `sample_rate` and return its handle, or 0 on
    /// failure.
    pub fn start(&self, sample_rate: u32) -> usize {
        let config = VoiceConfig::new(sample_rate);
        let capture = match CaptureSession::<C>::create(config) {
            Ok(capture) => capture,
            Err(e) => {
                log::warn!("capture_start({}) failed: {}", sample_rate, e);
                return 0;
            }
        };

        let handle = self.table.insert(Endpoint::new(capture));
        if handle == 0 {
            log::error!("capture handle table exhausted");
        }
        handle
    }

    /// Copy queued samples into `out`. Returns the sample count,
    /// `STATUS_NO_DATA`, `STATUS_INVALID_HANDLE` or `STATUS_BACKEND_ERROR`.
    pub fn recv(&self, handle: usize, out: &mut [f32]) -> i32 {
        let Some(endpoint) = self.table.get(handle) else {
            return STATUS_INVALID_HANDLE;
        };

        let limit = out.len().min(i32::MAX as usize);
        match endpoint.capture.try_recv_into(&mut out[..limit]) {
            Some(Ok(received)) => received.samples as i32,
            Some(Err(e)) => e.status_code(),
            None => STATUS_NO_DATA,
        }
    }

    /// Negotiated device rate, or 0 for an invalid handle.
    pub fn native_rate(&self, handle: usize) -> u32 {
        self.table
            .get(handle)
            .map_or(0, |endpoint| endpoint.capture.native_rate())
    }

    /// Queue far-end audio on the handle's playback stream, opening it on
    /// first use. Blocks while the output queue is full.
    pub fn play(&self, handle: usize, samples: &[f32], sample_rate: u32) -> i32 {
        let Some(endpoint) = self.table.get(handle) else {
            return STATUS_INVALID_HANDLE;
        };

        let result = endpoint
            .playback()
            .and_then(|playback| playback.write(samples, sample_rate));
        match result {
            Ok(()) => STATUS_OK,
            Err(VoiceError::InvalidConfig(reason)) => {
                log::debug!("capture_play rejected: {}", reason);
                STATUS_INVALID_ARGUMENT
            }
            Err(e) => e.status_code(),
        }
    }

    /// Stop and forget the handle. Unknown handles are ignored.
    pub fn stop(&self, handle: usize) {
        if let Some(endpoint) = self.table.remove(handle) {
            endpoint.stop();
        }
    }

    /// Handles started and not yet stopped.
    pub fn live_handles(&self) -> usize {
        self.table.live_count()
    }
}

impl<C: CaptureBackend, P: PlaybackBackend> Default for HandleEngine<C, P> {
    fn default() -> Self {
        Self::new()
    }
}
