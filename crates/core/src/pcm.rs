//! PCM codec utilities: stateless conversions between f32 samples, 16-bit
//! little-endian PCM, base64 strings, and sample rates.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Error raised when a base64 audio payload cannot be decoded, even after
/// alphabet/padding normalization. Carries both the original and cleaned
/// lengths for diagnostics; decoding never returns partial data.
#[derive(Debug, thiserror::Error)]
#[error("invalid base64 payload ({original_len} chars, {cleaned_len} after cleanup): {source}")]
pub struct DecodeError {
    pub original_len: usize,
    pub cleaned_len: usize,
    #[source]
    pub source: base64::DecodeError,
}

/// Converts f32 samples in [-1, 1] to little-endian PCM16 bytes.
///
/// Values are clamped first, then scaled asymmetrically (0x7FFF for positive
/// values, 0x8000 for negative) so that 0.0, 1.0 and -1.0 map exactly onto
/// 0, i16::MAX and i16::MIN.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let v = if s >= 0.0 {
            (s * 0x7FFF as f32) as i16
        } else {
            (s * 0x8000 as f32) as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Converts little-endian PCM16 bytes back to f32 samples using the same
/// asymmetric scale factors as [`f32_to_pcm16`]. A trailing odd byte is
/// ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            if v >= 0 {
                v as f32 / 0x7FFF as f32
            } else {
                v as f32 / 0x8000 as f32
            }
        })
        .collect()
}

/// Linearly resamples mono f32 audio from `from_hz` to `to_hz`.
///
/// A no-op when the rates match. Otherwise samples the input at ratio
/// `from_hz / to_hz`; the output length is `floor(len / ratio)`.
pub fn resample_linear(samples: &[f32], from_hz: u32, to_hz: u32) -> Vec<f32> {
    if from_hz == to_hz || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_hz as f64 / to_hz as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = if idx + 1 < samples.len() {
            samples[idx + 1]
        } else {
            a
        };
        out.push(a + (b - a) * frac);
    }
    out
}

/// Encodes bytes with the standard base64 alphabet.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a base64 string, tolerating the URL-safe alphabet and missing
/// padding. The input is normalized (whitespace stripped, `-`/`_` mapped to
/// `+`/`/`, padding restored) before decoding with the standard engine.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, DecodeError> {
    let original_len = input.len();
    let mut cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    let cleaned_len = cleaned.len();
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|source| DecodeError {
            original_len,
            cleaned_len,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine_wave(len: usize, freq_hz: f32, rate_hz: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq_hz * i as f32 / rate_hz).sin())
            .collect()
    }

    #[test]
    fn pcm16_round_trip_within_one_quantization_step() {
        let wave = sine_wave(480, 440.0, 16_000.0);
        let decoded = pcm16_to_f32(&f32_to_pcm16(&wave));
        assert_eq!(decoded.len(), wave.len());
        for (a, b) in wave.iter().zip(decoded.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1.0 / 32_767.0);
        }
    }

    #[test]
    fn pcm16_extremes_and_zero_are_exact() {
        let decoded = pcm16_to_f32(&f32_to_pcm16(&[0.0, 1.0, -1.0]));
        assert_eq!(decoded, vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn pcm16_clamps_out_of_range_input() {
        let decoded = pcm16_to_f32(&f32_to_pcm16(&[2.0, -3.0]));
        assert_eq!(decoded, vec![1.0, -1.0]);
    }

    #[test]
    fn pcm16_ignores_trailing_odd_byte() {
        assert!(pcm16_to_f32(&[0x12]).is_empty());
        let decoded = pcm16_to_f32(&[0x00, 0x40, 0x55]);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn empty_inputs_do_not_panic() {
        assert!(f32_to_pcm16(&[]).is_empty());
        assert!(pcm16_to_f32(&[]).is_empty());
        assert!(resample_linear(&[], 16_000, 24_000).is_empty());
        assert_eq!(encode_base64(&[]), "");
        assert!(decode_base64("").unwrap().is_empty());
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let wave = sine_wave(256, 440.0, 16_000.0);
        assert_eq!(resample_linear(&wave, 16_000, 16_000), wave);
    }

    #[test]
    fn resample_halves_length_on_2x_downsample() {
        let wave = sine_wave(4096, 200.0, 32_000.0);
        let out = resample_linear(&wave, 32_000, 16_000);
        assert_eq!(out.len(), 2048);
        // Even-indexed input samples land exactly on output positions.
        assert_abs_diff_eq!(out[10], wave[20], epsilon = 1e-6);
    }

    #[test]
    fn resample_interpolates_on_upsample() {
        let out = resample_linear(&[0.0, 1.0], 16_000, 32_000);
        assert_eq!(out.len(), 4);
        assert_abs_diff_eq!(out[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out[2], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn base64_decodes_url_safe_and_unpadded_variants() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let standard = encode_base64(&bytes);
        let url_safe = standard.replace('+', "-").replace('/', "_");
        let unpadded = standard.trim_end_matches('=').to_string();

        assert_eq!(decode_base64(&standard).unwrap(), bytes);
        assert_eq!(decode_base64(&url_safe).unwrap(), bytes);
        assert_eq!(decode_base64(&unpadded).unwrap(), bytes);
    }

    #[test]
    fn base64_decode_failure_reports_lengths() {
        let err = decode_base64("!!not base64!!").unwrap_err();
        assert_eq!(err.original_len, 14);
        // Whitespace is stripped before padding is restored.
        assert_eq!(err.cleaned_len, 16);
    }

    #[test]
    fn full_audio_round_trip() {
        let wave = sine_wave(1024, 330.0, 16_000.0);
        let encoded = encode_base64(&f32_to_pcm16(&wave));
        let decoded = pcm16_to_f32(&decode_base64(&encoded).unwrap());
        for (a, b) in wave.iter().zip(decoded.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1.0 / 32_767.0);
        }
    }
}
