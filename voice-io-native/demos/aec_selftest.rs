//! Echo cancellation self-test.
//!
//! Captures one second of room noise, then plays a 440 Hz tone through the
//! voice output while capturing again, and prints both levels. With working
//! AEC the level during the tone stays close to the noise floor.
//!
//! ```text
//! RUST_LOG=debug cargo run -p voice-io-native --example aec_selftest
//! ```

use std::error::Error;
use std::f32::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

use voice_io_native::voice_io_core::processing::levels::{peak_level, rms_level, to_dbfs};
use voice_io_native::voice_io_core::VoiceConfig;
use voice_io_native::{VoiceCapture, VoicePlayback};

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.3;
const PHASE: Duration = Duration::from_secs(1);

fn collect(capture: &VoiceCapture, duration: Duration) -> Result<Vec<f32>, Box<dyn Error>> {
    let deadline = Instant::now() + duration;
    let mut samples = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match capture.recv_timeout(remaining) {
            Some(frames) => {
                let frames = frames?;
                if frames.overrun() {
                    log::warn!("capture overrun; frames were dropped");
                }
                samples.extend_from_slice(frames.samples());
            }
            None => break,
        }
    }
    Ok(samples)
}

fn report(label: &str, samples: &[f32], rate: u32) {
    println!(
        "{:<10} {:>6} ms  rms {:>7.1} dBFS  peak {:>7.1} dBFS",
        label,
        samples.len() as u64 * 1000 / rate.max(1) as u64,
        to_dbfs(rms_level(samples)),
        to_dbfs(peak_level(samples)),
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = VoiceConfig {
        require_aec: true,
        ..VoiceConfig::new(48000)
    };
    let capture = VoiceCapture::create(config.clone())?;
    let playback = VoicePlayback::create(config)?;
    let rate = capture.native_rate();
    let out_rate = playback.native_rate();
    println!("capture {} Hz, playback {} Hz", rate, out_rate);

    let quiet = collect(&capture, PHASE)?;
    report("silence", &quiet, rate);

    let tone: Vec<f32> = (0..out_rate as usize)
        .map(|i| (2.0 * PI * TONE_HZ * i as f32 / out_rate as f32).sin() * TONE_AMPLITUDE)
        .collect();

    let (played, echoed) = thread::scope(|scope| {
        let player = scope.spawn(|| playback.write(&tone, out_rate));
        let echoed = collect(&capture, PHASE);
        (player.join(), echoed)
    });
    played.map_err(|_| "playback thread panicked")??;
    let echoed = echoed?;
    report("tone", &echoed, rate);

    let suppression = to_dbfs(rms_level(&echoed)) - to_dbfs(TONE_AMPLITUDE / 2f32.sqrt());
    println!("echo level relative to played tone: {:.1} dB", suppression);

    let stats = capture.stats();
    println!(
        "callbacks {}  frames {}  dropped {}",
        stats.callback_count, stats.frames_produced, stats.frames_dropped
    );

    playback.stop();
    capture.stop();
    Ok(())
}
