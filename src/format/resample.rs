//! Sample rate conversion between the 8 kHz mono radio world and the
//! 48 kHz stereo Discord world.
//!
//! Both directions run a windowed-sinc low-pass at the 8 kHz Nyquist edge,
//! so upsampling does not image and downsampling does not alias. The factor
//! is fixed at 6 (8000 -> 48000), which keeps the filter polyphase-friendly
//! and avoids fractional interpolation entirely.

use std::sync::OnceLock;

use super::FormatError;

/// Resampling factor between 8 kHz and 48 kHz.
const FACTOR: usize = 6;

/// Filter length. 97 taps puts the transition band comfortably inside the
/// 3.4 kHz voice passband to 4 kHz stop edge.
const TAPS: usize = 97;

/// Low-pass prototype: cutoff at 4 kHz of a 48 kHz stream, Hamming window,
/// normalised to unity DC gain.
fn lowpass_taps() -> &'static [f32; TAPS] {
    static TAPS_CELL: OnceLock<[f32; TAPS]> = OnceLock::new();
    TAPS_CELL.get_or_init(|| {
        let mut taps = [0.0f32; TAPS];
        let mid = (TAPS - 1) as f64 / 2.0;
        let cutoff = 1.0 / FACTOR as f64; // 4 kHz / 24 kHz Nyquist
        let mut sum = 0.0f64;
        for (n, tap) in taps.iter_mut().enumerate() {
            let x = n as f64 - mid;
            let sinc = if x == 0.0 {
                cutoff
            } else {
                (std::f64::consts::PI * cutoff * x).sin() / (std::f64::consts::PI * x)
            };
            let window = 0.54
                - 0.46 * (2.0 * std::f64::consts::PI * n as f64 / (TAPS - 1) as f64).cos();
            let value = sinc * window;
            sum += value;
            *tap = value as f32;
        }
        for tap in &mut taps {
            *tap = (f64::from(*tap) / sum) as f32;
        }
        taps
    })
}

fn clamp_sample(value: f32) -> i16 {
    value.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Upsamples 8 kHz mono PCM to 48 kHz interleaved stereo.
///
/// Output length is exactly `input.len() * 6 * 2`. Both stereo channels
/// carry the same signal. Samples outside the input are treated as zero, so
/// the first and last milliseconds of a stream taper rather than wrap.
pub fn upsample_8k_to_48k_stereo(mono_8k: &[i16]) -> Vec<i16> {
    if mono_8k.is_empty() {
        return Vec::new();
    }
    let taps = lowpass_taps();
    let mut out = Vec::with_capacity(mono_8k.len() * FACTOR * 2);

    // Polyphase: output index n draws on taps n % 6, 6 apart, over the
    // zero-stuffed input. Gain of FACTOR restores the energy the zero
    // stuffing removed.
    for n in 0..mono_8k.len() * FACTOR {
        let mut acc = 0.0f32;
        let mut k = n % FACTOR;
        while k < TAPS {
            let idx = (n as isize - k as isize) / FACTOR as isize;
            if idx >= 0 {
                if let Some(&sample) = mono_8k.get(idx as usize) {
                    acc += taps[k] * f32::from(sample);
                }
            }
            k += FACTOR;
        }
        let sample = clamp_sample(acc * FACTOR as f32);
        out.push(sample);
        out.push(sample);
    }
    out
}

/// Downsamples 48 kHz interleaved stereo PCM to 8 kHz mono.
///
/// The stereo pair is mixed to mono, low-passed below 4 kHz, then decimated
/// by 6. Output length is `input.len() / 2 / 6` (truncating).
pub fn downsample_48k_stereo_to_8k(stereo_48k: &[i16]) -> Result<Vec<i16>, FormatError> {
    if stereo_48k.len() % 2 != 0 {
        return Err(FormatError::OddSampleCount {
            count: stereo_48k.len(),
        });
    }
    let mono: Vec<f32> = stereo_48k
        .chunks_exact(2)
        .map(|pair| (f32::from(pair[0]) + f32::from(pair[1])) / 2.0)
        .collect();

    let taps = lowpass_taps();
    let out_len = mono.len() / FACTOR;
    let mut out = Vec::with_capacity(out_len);
    for j in 0..out_len {
        let center = j * FACTOR;
        let mut acc = 0.0f32;
        for (k, &tap) in taps.iter().enumerate() {
            let idx = center as isize - k as isize + (TAPS / 2) as isize;
            if idx >= 0 {
                if let Some(&sample) = mono.get(idx as usize) {
                    acc += tap * sample;
                }
            }
        }
        out.push(clamp_sample(acc));
    }
    Ok(out)
}
