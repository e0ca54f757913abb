//! Signal level metering.

/// RMS level of `samples`, 0.0 for an empty slice.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Absolute peak of `samples`.
pub fn peak_level(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// Level in dBFS, floored at -120.
pub fn to_dbfs(level: f32) -> f32 {
    if level <= 1e-6 {
        return -120.0;
    }
    20.0 * level.log10()
}
