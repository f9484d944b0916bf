//! The transcode façade: PCM ↔ Opus ↔ Ogg/Opus.
//!
//! Destination-bound encoding goes through the [`Transcoder`] trait so the
//! hub never sees codec internals. Implementations are streaming: a call may
//! produce zero, one, or several output frames as internal buffers fill.
//! They are **not** thread-safe; the hub serialises access behind
//! [`SharedTranscoder`].

mod ogg;

pub use ogg::OggOpusTranscoder;

use bytes::Bytes;
use opus::{Application, Bitrate, Channels};

use crate::config::TranscodeFormat;
use crate::error::TranscodeError;
use crate::frame::AudioFormat;
use crate::usrp::VOICE_SAMPLES;

/// Sample rate of the radio side of every transcoder.
pub(crate) const RADIO_RATE: u32 = 8000;

/// Scratch size for one encoded Opus packet (the codec's hard ceiling is
/// 1275 bytes; leave headroom).
pub(crate) const MAX_PACKET_SIZE: usize = 4000;

/// Scratch size for one decoded Opus frame: 120 ms at 8 kHz mono.
pub(crate) const MAX_DECODED_SAMPLES: usize = 960;

/// A 20 ms block of 8 kHz mono PCM, the unit `format_to_pcm` emits.
pub type VoiceBlock = [i16; VOICE_SAMPLES];

/// Bidirectional streaming converter between USRP voice PCM and one
/// compressed format.
pub trait Transcoder: Send {
    /// Feeds 8 kHz mono PCM and returns zero or more encoded packets.
    ///
    /// Input shorter than the 20 ms encoder frame is buffered until enough
    /// accumulates, so one call may return nothing and a later call two
    /// packets.
    fn pcm_to_format(&mut self, samples: &[i16]) -> Result<Vec<Bytes>, TranscodeError>;

    /// Feeds encoded bytes and returns zero or more whole voice blocks as
    /// the decoder's buffer fills.
    fn format_to_pcm(&mut self, data: &[u8]) -> Result<Vec<VoiceBlock>, TranscodeError>;

    /// The format `pcm_to_format` produces.
    fn output_format(&self) -> AudioFormat;

    /// Releases the codec. Further calls return [`TranscodeError::Closed`].
    fn close(&mut self);
}

/// The hub-side handle: one transcoder, access serialised by a lock.
pub type SharedTranscoder = parking_lot::Mutex<Box<dyn Transcoder>>;

/// Builds the transcoder for the configured output format.
pub fn create_transcoder(
    format: TranscodeFormat,
    bitrate: u32,
) -> Result<Box<dyn Transcoder>, TranscodeError> {
    Ok(match format {
        TranscodeFormat::Opus => Box::new(OpusTranscoder::new(bitrate)?),
        TranscodeFormat::Ogg => Box::new(OggOpusTranscoder::new(bitrate)?),
    })
}

/// Raw-Opus transcoder: each 20 ms PCM block becomes one Opus packet and
/// each packet decodes back to PCM.
pub struct OpusTranscoder {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
    /// PCM waiting for a full encoder frame.
    pcm_in: Vec<i16>,
    /// Decoded PCM waiting to fill whole voice blocks.
    pcm_out: Vec<i16>,
    encode_scratch: Vec<u8>,
    decode_scratch: Vec<i16>,
    closed: bool,
}

impl OpusTranscoder {
    /// Creates an 8 kHz mono voice transcoder at the given bitrate.
    pub fn new(bitrate: u32) -> Result<Self, TranscodeError> {
        let mut encoder = opus::Encoder::new(RADIO_RATE, Channels::Mono, Application::Voip)
            .map_err(codec_err)?;
        encoder
            .set_bitrate(Bitrate::Bits(bitrate as i32))
            .map_err(codec_err)?;
        let decoder = opus::Decoder::new(RADIO_RATE, Channels::Mono).map_err(codec_err)?;

        Ok(Self {
            encoder,
            decoder,
            pcm_in: Vec::with_capacity(VOICE_SAMPLES * 4),
            pcm_out: Vec::with_capacity(VOICE_SAMPLES * 4),
            encode_scratch: vec![0u8; MAX_PACKET_SIZE],
            decode_scratch: vec![0i16; MAX_DECODED_SAMPLES],
            closed: false,
        })
    }
}

impl Transcoder for OpusTranscoder {
    fn pcm_to_format(&mut self, samples: &[i16]) -> Result<Vec<Bytes>, TranscodeError> {
        if self.closed {
            return Err(TranscodeError::Closed);
        }
        self.pcm_in.extend_from_slice(samples);

        let mut packets = Vec::new();
        while self.pcm_in.len() >= VOICE_SAMPLES {
            let frame: Vec<i16> = self.pcm_in.drain(..VOICE_SAMPLES).collect();
            let written = self
                .encoder
                .encode(&frame, &mut self.encode_scratch)
                .map_err(codec_err)?;
            packets.push(Bytes::copy_from_slice(&self.encode_scratch[..written]));
        }
        Ok(packets)
    }

    fn format_to_pcm(&mut self, data: &[u8]) -> Result<Vec<VoiceBlock>, TranscodeError> {
        if self.closed {
            return Err(TranscodeError::Closed);
        }
        let decoded = self
            .decoder
            .decode(data, &mut self.decode_scratch, false)
            .map_err(codec_err)?;
        self.pcm_out.extend_from_slice(&self.decode_scratch[..decoded]);
        Ok(drain_voice_blocks(&mut self.pcm_out))
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Opus
    }

    fn close(&mut self) {
        self.closed = true;
        self.pcm_in.clear();
        self.pcm_out.clear();
    }
}

/// Pulls whole 160-sample blocks off the front of a PCM buffer.
pub(crate) fn drain_voice_blocks(pcm: &mut Vec<i16>) -> Vec<VoiceBlock> {
    let mut blocks = Vec::new();
    while pcm.len() >= VOICE_SAMPLES {
        let mut block = [0i16; VOICE_SAMPLES];
        block.copy_from_slice(&pcm[..VOICE_SAMPLES]);
        pcm.drain(..VOICE_SAMPLES);
        blocks.push(block);
    }
    blocks
}

pub(crate) fn codec_err(err: opus::Error) -> TranscodeError {
    TranscodeError::Codec(err.to_string())
}
