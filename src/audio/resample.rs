//! Channel downmix, linear-interpolation resampling, and signal helpers.
//!
//! The resampler trades fidelity for cost: speech stays intelligible through
//! linear interpolation, and the pipeline avoids pulling a DSP dependency
//! into the hot ingress path.

/// Downmix interleaved multi-channel PCM to mono by signed arithmetic mean.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / ch as i32) as i16
        })
        .collect()
}

/// Resample PCM16 by linear interpolation. Output length is
/// `ceil(input_len * to_rate / from_rate)`.
pub fn resample(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let out_len = ((input.len() as u64 * to_rate as u64) + from_rate as u64 - 1)
        / from_rate as u64;
    let step = from_rate as f64 / to_rate as f64;

    let mut output = Vec::with_capacity(out_len as usize);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;

        let a = input[idx.min(input.len() - 1)] as f64;
        let b = input[(idx + 1).min(input.len() - 1)] as f64;
        output.push((a + (b - a) * frac).round() as i16);
    }
    output
}

/// Root-mean-square level of a sample window. Returns 0 for empty input.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Interpret little-endian PCM16 bytes as samples. Odd trailing bytes are
/// dropped.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Serialize samples to little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
