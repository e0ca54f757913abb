/// Native sample encodings delivered by device mix formats.
///
/// All conversions read little-endian interleaved frames, average the
/// channels down to mono, and write into a caller-owned buffer so they can
/// run on an audio thread without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    F32,
    I16,
    I24,
    I32,
}

impl SampleEncoding {
    /// Pick the encoding for a PCM/float format description.
    pub fn from_format(bits_per_sample: u16, is_float: bool) -> Option<Self> {
        match (bits_per_sample, is_float) {
            (32, true) => Some(Self::F32),
            (16, false) => Some(Self::I16),
            (24, false) => Some(Self::I24),
            (32, false) => Some(Self::I32),
            _ => None,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::I16 => 2,
            Self::I24 => 3,
            Self::F32 | Self::I32 => 4,
        }
    }

    #[inline]
    fn decode(self, b: &[u8]) -> f32 {
        match self {
            Self::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Self::I16 => i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0,
            Self::I24 => {
                let sign = if b[2] & 0x80 != 0 { 0xFF } else { 0 };
                i32::from_le_bytes([b[0], b[1], b[2], sign]) as f32 / 8_388_608.0
            }
            Self::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0,
        }
    }
}

/// Decode interleaved `bytes` into mono frames in `out`.
///
/// Returns the number of frames written, at most `out.len()`. Trailing
/// partial frames are ignored.
pub fn decode_to_mono(bytes: &[u8], encoding: SampleEncoding, channels: usize, out: &mut [f32]) -> usize {
    if channels == 0 {
        return 0;
    }
    let frame_bytes = encoding.bytes_per_sample() * channels;
    let mut written = 0;
    for (frame, dst) in bytes.chunks_exact(frame_bytes).zip(out.iter_mut()) {
        let sum: f32 = frame
            .chunks_exact(encoding.bytes_per_sample())
            .map(|s| encoding.decode(s))
            .sum();
        *dst = sum / channels as f32;
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn encoding_lookup() {
        assert_eq!(SampleEncoding::from_format(32, true), Some(SampleEncoding::F32));
        assert_eq!(SampleEncoding::from_format(24, false), Some(SampleEncoding::I24));
        assert_eq!(SampleEncoding::from_format(64, true), None);
        assert_eq!(SampleEncoding::from_format(8, false), None);
    }

    #[test]
    fn f32_mono_passthrough() {
        let bytes: Vec<u8> = [0.5f32, -0.25].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = [0.0f32; 4];
        assert_eq!(decode_to_mono(&bytes, SampleEncoding::F32, 1, &mut out), 2);
        assert_eq!(&out[..2], &[0.5, -0.25]);
    }

    #[test]
    fn i16_stereo_is_averaged() {
        let bytes: Vec<u8> = [16384i16, 0, -32768, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut out = [0.0f32; 2];
        assert_eq!(decode_to_mono(&bytes, SampleEncoding::I16, 2, &mut out), 2);
        assert_abs_diff_eq!(out[0], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn i24_sign_extension() {
        // -4194304 (0xC00000) is -0.5 full scale
        let bytes = [0x00, 0x00, 0xC0, 0x00, 0x00, 0x40];
        let mut out = [0.0f32; 2];
        assert_eq!(decode_to_mono(&bytes, SampleEncoding::I24, 1, &mut out), 2);
        assert_abs_diff_eq!(out[0], -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn i32_full_scale() {
        let bytes = i32::MIN.to_le_bytes();
        let mut out = [0.0f32; 1];
        decode_to_mono(&bytes, SampleEncoding::I32, 1, &mut out);
        assert_abs_diff_eq!(out[0], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn output_capacity_bounds_decode() {
        let bytes = vec![0u8; 2 * 10];
        let mut out = [1.0f32; 3];
        assert_eq!(decode_to_mono(&bytes, SampleEncoding::I16, 1, &mut out), 3);
    }

    #[test]
    fn partial_trailing_frame_ignored() {
        let bytes = vec![0u8; 5];
        let mut out = [0.0f32; 4];
        assert_eq!(decode_to_mono(&bytes, SampleEncoding::I16, 2, &mut out), 1);
    }
}
