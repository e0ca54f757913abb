use std::ops::Deref;

use super::config::Channels;

/// A batch of captured audio returned by one receive call.
///
/// Samples are interleaved, `channels.count()` per frame, at the session's
/// native rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Frames {
    samples: Vec<f32>,
    channels: Channels,
    overrun: bool,
}

impl Frames {
    pub fn new(samples: Vec<f32>, channels: Channels, overrun: bool) -> Self {
        Self {
            samples,
            channels,
            overrun,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// Number of frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.count()
    }

    /// True when older frames were evicted before this batch because the
    /// consumer fell behind. Reported once per eviction episode.
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.samples
    }
}

impl Deref for Frames {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.samples
    }
}

/// Result of a bounded receive into a caller-provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInto {
    /// Samples written to the front of the buffer.
    pub samples: usize,
    pub overrun: bool,
}

/// Producer-side counters for a capture session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub callback_count: u64,
    pub frames_produced: u64,
    pub frames_dropped: u64,
    pub overrun_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_respects_layout() {
        let frames = Frames::new(vec![0.1, 0.1, 0.2, 0.2], Channels::Stereo, false);
        assert_eq!(frames.frame_count(), 2);
        assert_eq!(frames.len(), 4);
        assert!(!frames.overrun());
    }

    #[test]
    fn derefs_to_samples() {
        let frames = Frames::new(vec![0.5, -0.5], Channels::Mono, true);
        let total: f32 = frames.iter().sum();
        assert_eq!(total, 0.0);
        assert!(frames.overrun());
        assert_eq!(frames.into_vec(), vec![0.5, -0.5]);
    }
}
