//! PCM sample/byte conversion and channel mixing.
//!
//! Everything crossing the hub as `pcm` is signed 16-bit little-endian, the
//! byte order the USRP voice payload uses. These helpers are the only place
//! that packing lives.

mod resample;

pub use resample::{downsample_48k_stereo_to_8k, upsample_8k_to_48k_stereo};

/// Errors from format conversion helpers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    /// Interleaved stereo input must contain whole left/right pairs.
    #[error("odd sample count for stereo input: {count}")]
    OddSampleCount {
        /// The offending sample count.
        count: usize,
    },
}

/// Packs samples into little-endian PCM bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Unpacks little-endian PCM bytes into samples.
///
/// A trailing odd byte is ignored; UDP ingress hands us whatever arrived.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Mixes interleaved stereo down to mono by averaging channels.
pub fn stereo_to_mono(stereo: &[i16]) -> Result<Vec<i16>, FormatError> {
    if stereo.len() % 2 != 0 {
        return Err(FormatError::OddSampleCount {
            count: stereo.len(),
        });
    }
    Ok(stereo
        .chunks_exact(2)
        .map(|pair| {
            let left = i32::from(pair[0]);
            let right = i32::from(pair[1]);
            ((left + right) / 2) as i16
        })
        .collect())
}

/// Duplicates mono samples into interleaved stereo.
pub fn mono_to_stereo(mono: &[i16]) -> Vec<i16> {
    mono.iter().flat_map(|&s| [s, s]).collect()
}

/// Root-mean-square level of a sample buffer.
///
/// Used as the voice-activity gate for endpoints whose wire carries no PTT
/// flag. This is a plain level check, not voice-activity detection.
pub fn rms_level(samples: &[i16]) -> i16 {
    if samples.is_empty() {
        return 0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let s = f64::from(s);
            s * s
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as i16
}
