use std::ffi::c_void;
use std::ptr;

use voice_io_native::ffi::{capture_play, capture_recv, capture_sample_rate, capture_start, capture_stop};

fn bogus_handle() -> *mut c_void {
    // Non-zero generation on an unused slot: never issued by a fresh process.
    ((7usize << (usize::BITS / 2)) | 42) as *mut c_void
}

#[test]
fn zero_sample_rate_returns_null() {
    assert!(capture_start(0).is_null());
}

#[test]
fn null_handle_is_invalid() {
    let mut buffer = [0.0f32; 64];
    let status = unsafe { capture_recv(ptr::null_mut(), buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!(status, -1);
    assert_eq!(capture_sample_rate(ptr::null_mut()), 0);

    let samples = [0.25f32; 32];
    let status = unsafe { capture_play(ptr::null_mut(), samples.as_ptr(), samples.len(), 48000) };
    assert_eq!(status, -1);
}

#[test]
fn unknown_handle_is_invalid() {
    let mut buffer = [0.0f32; 16];
    let status = unsafe { capture_recv(bogus_handle(), buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!(status, -1);
    assert_eq!(capture_sample_rate(bogus_handle()), 0);
    assert!(buffer.iter().all(|&s| s == 0.0));
}

#[test]
fn null_buffer_with_length_is_rejected() {
    let status = unsafe { capture_recv(bogus_handle(), ptr::null_mut(), 128) };
    assert_eq!(status, -1);

    let status = unsafe { capture_play(bogus_handle(), ptr::null(), 128, 48000) };
    assert_eq!(status, -3);
}

#[test]
fn empty_null_buffer_checks_the_handle() {
    let status = unsafe { capture_recv(ptr::null_mut(), ptr::null_mut(), 0) };
    assert_eq!(status, -1);

    let status = unsafe { capture_play(ptr::null_mut(), ptr::null(), 0, 48000) };
    assert_eq!(status, -1);
}

#[test]
fn stop_ignores_null_and_unknown_handles() {
    capture_stop(ptr::null_mut());
    capture_stop(bogus_handle());
    capture_stop(bogus_handle());
}

#[test]
#[ignore = "needs an audio device with echo cancellation"]
fn live_handle_round_trip() {
    let handle = capture_start(48000);
    assert!(!handle.is_null());
    let rate = capture_sample_rate(handle);
    assert!(rate > 0);

    let tone: Vec<f32> = (0..rate as usize / 10)
        .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / rate as f32).sin() * 0.2)
        .collect();
    assert_eq!(unsafe { capture_play(handle, tone.as_ptr(), tone.len(), rate) }, 0);
    assert_eq!(unsafe { capture_play(handle, tone.as_ptr(), tone.len(), rate + 1) }, -3);

    let mut buffer = vec![0.0f32; 4096];
    let mut received = 0;
    for _ in 0..100 {
        let status = unsafe { capture_recv(handle, buffer.as_mut_ptr(), buffer.len()) };
        assert!(status >= 0, "capture failed with {status}");
        received += status as usize;
        if received > 0 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(received > 0);

    capture_stop(handle);
    let status = unsafe { capture_recv(handle, buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!(status, -1);
    assert_eq!(capture_sample_rate(handle), 0);
}
