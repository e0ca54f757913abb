use serde::{Deserialize, Serialize};

/// Output channel layout.
///
/// `Stereo` duplicates the voice-processed mono signal into both channels;
/// it is not true stereo capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    /// Samples per frame.
    pub fn count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// Configuration for a capture or playback session.
///
/// Immutable once a session has been created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Requested sample rate in Hz (default: 48000).
    ///
    /// Advisory: the backend reports the rate it actually negotiated via
    /// `native_rate()`, and buffer contents are always at that rate.
    pub sample_rate: u32,

    /// Output channel layout (default: mono).
    pub channels: Channels,

    /// Ring buffer depth in milliseconds at the negotiated rate (default: 250).
    pub buffer_ms: u32,

    /// Fail with `AecNotSupported` instead of capturing unprocessed audio
    /// when the platform cannot engage voice processing (default: false).
    pub require_aec: bool,
}

impl VoiceConfig {
    pub const MIN_BUFFER_MS: u32 = 10;
    pub const MAX_BUFFER_MS: u32 = 10_000;

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample rate must be positive".into());
        }
        if !(Self::MIN_BUFFER_MS..=Self::MAX_BUFFER_MS).contains(&self.buffer_ms) {
            return Err(format!(
                "buffer_ms must be within {}..={}, got {}",
                Self::MIN_BUFFER_MS,
                Self::MAX_BUFFER_MS,
                self.buffer_ms
            ));
        }
        Ok(())
    }

    /// Ring buffer capacity in frames for a stream negotiated at
    /// `native_rate` with callbacks of `period_frames`.
    ///
    /// Always holds at least two device periods.
    pub fn ring_capacity_frames(&self, native_rate: u32, period_frames: usize) -> usize {
        let by_duration = native_rate as u64 * self.buffer_ms as u64 / 1000;
        (by_duration as usize).max(period_frames * 2).max(1)
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: Channels::Mono,
            buffer_ms: 250,
            require_aec: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = VoiceConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, Channels::Mono);
        assert_eq!(config.buffer_ms, 250);
        assert!(!config.require_aec);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_rate_rejected() {
        let err = VoiceConfig::new(0).validate().unwrap_err();
        assert!(err.contains("sample rate"));
    }

    #[test]
    fn buffer_bounds_checked() {
        let mut config = VoiceConfig::default();
        config.buffer_ms = 5;
        assert!(config.validate().is_err());
        config.buffer_ms = 20_000;
        assert!(config.validate().is_err());
        config.buffer_ms = VoiceConfig::MAX_BUFFER_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn capacity_follows_native_rate_not_request() {
        let config = VoiceConfig::new(16000);
        // 250 ms at 48 kHz
        assert_eq!(config.ring_capacity_frames(48000, 480), 12000);
    }

    #[test]
    fn capacity_covers_two_periods() {
        let mut config = VoiceConfig::default();
        config.buffer_ms = 10;
        assert_eq!(config.ring_capacity_frames(8000, 1024), 2048);
    }

    #[test]
    fn channel_counts() {
        assert_eq!(Channels::Mono.count(), 1);
        assert_eq!(Channels::Stereo.count(), 2);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: VoiceConfig =
            serde_json::from_str(r#"{ "sample_rate": 16000, "channels": "stereo" }"#).unwrap();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, Channels::Stereo);
        assert_eq!(config.buffer_ms, 250);
    }
}
