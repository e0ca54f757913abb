//! C surface over the platform sessions.
//!
//! Handles are opaque `void*` values that are never dereferenced; they
//! encode a generation-checked slot in a process-wide table, so a stale or
//! forged handle is rejected with -1 rather than touching freed memory.
//!
//! Status codes:
//! - `capture_recv`: sample count (> 0), 0 no data, -1 invalid handle or
//!   buffer, -2 backend error (terminal, stop the handle)
//! - `capture_play`: 0 ok, -1 invalid handle, -2 backend error, -3 invalid
//!   buffer or sample rate

use std::ffi::c_void;
use std::slice;
use std::sync::LazyLock;

use voice_io_core::handles::{HandleEngine, STATUS_INVALID_ARGUMENT, STATUS_INVALID_HANDLE};

use crate::{PlatformCapture, PlatformPlayback};

static ENGINE: LazyLock<HandleEngine<PlatformCapture, PlatformPlayback>> =
    LazyLock::new(HandleEngine::new);

fn handle_of(handle: *mut c_void) -> usize {
    handle as usize
}

/// Start echo-cancelled capture. `sample_rate` is a preference; query
/// `capture_sample_rate` for the rate samples actually arrive at.
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn capture_start(sample_rate: u32) -> *mut c_void {
    ENGINE.start(sample_rate) as *mut c_void
}

/// Copy up to `buffer_len` queued mono samples into `buffer` without
/// blocking.
///
/// # Safety
/// `buffer` must be null or valid for writes of `buffer_len` floats.
#[no_mangle]
pub unsafe extern "C" fn capture_recv(handle: *mut c_void, buffer: *mut f32, buffer_len: usize) -> i32 {
    if buffer.is_null() {
        if buffer_len != 0 {
            return STATUS_INVALID_HANDLE;
        }
        return ENGINE.recv(handle_of(handle), &mut []);
    }
    let out = slice::from_raw_parts_mut(buffer, buffer_len);
    ENGINE.recv(handle_of(handle), out)
}

/// Device rate of a running handle, 0 if the handle is invalid.
#[no_mangle]
pub extern "C" fn capture_sample_rate(handle: *mut c_void) -> u32 {
    ENGINE.native_rate(handle_of(handle))
}

/// Play mono far-end audio at `sample_rate` (must equal the playback
/// device rate, usually `capture_sample_rate`). Blocks while the output
/// queue is full.
///
/// # Safety
/// `samples` must be null or valid for reads of `len` floats.
#[no_mangle]
pub unsafe extern "C" fn capture_play(
    handle: *mut c_void,
    samples: *const f32,
    len: usize,
    sample_rate: u32,
) -> i32 {
    if samples.is_null() {
        if len != 0 {
            return STATUS_INVALID_ARGUMENT;
        }
        return ENGINE.play(handle_of(handle), &[], sample_rate);
    }
    let input = slice::from_raw_parts(samples, len);
    ENGINE.play(handle_of(handle), input, sample_rate)
}

/// Stop capture (and playback, if started) and invalidate the handle.
/// Null and already-stopped handles are ignored.
#[no_mangle]
pub extern "C" fn capture_stop(handle: *mut c_void) {
    ENGINE.stop(handle_of(handle));
}
