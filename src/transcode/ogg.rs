//! Ogg encapsulation for Opus voice streams.
//!
//! The page framing here is the bit-exact subset of RFC 3533 this crate
//! needs: one Opus packet per audio page, `OpusHead`/`OpusTags` stream
//! headers up front, CRC verified on read. Granule positions count 48 kHz
//! samples per RFC 7845 regardless of the 8 kHz input rate.
//!
//! ```text
//! offset  size  field
//!      0     4  capture pattern "OggS"
//!      4     1  version (0)
//!      5     1  header type (0x01 cont, 0x02 BOS, 0x04 EOS)
//!      6     8  granule position, little-endian
//!     14     4  stream serial, little-endian
//!     18     4  page sequence, little-endian
//!     22     4  CRC over the page with this field zeroed
//!     26     1  segment count
//!     27     n  lacing table, then segment data
//! ```

use std::sync::OnceLock;

use bytes::Bytes;
use opus::{Application, Bitrate, Channels};

use crate::error::TranscodeError;
use crate::frame::AudioFormat;
use crate::transcode::{
    codec_err, drain_voice_blocks, Transcoder, VoiceBlock, MAX_DECODED_SAMPLES, MAX_PACKET_SIZE,
    RADIO_RATE,
};
use crate::usrp::VOICE_SAMPLES;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_TYPE_BOS: u8 = 0x02;
/// 48 kHz granule units per 20 ms packet.
const GRANULE_PER_PACKET: u64 = 960;

/// Ogg CRC-32: polynomial 0x04c11db7, no reflection, zero init, zero xorout.
fn crc32_ogg(data: &[u8]) -> u32 {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04c1_1db7
                } else {
                    crc << 1
                };
            }
            *entry = crc;
        }
        table
    });
    let mut crc = 0u32;
    for &byte in data {
        crc = (crc << 8) ^ table[((crc >> 24) ^ u32::from(byte)) as usize];
    }
    crc
}

/// Writes single-packet Ogg pages for one logical stream.
struct PageWriter {
    serial: u32,
    page_seq: u32,
    granule: u64,
}

impl PageWriter {
    fn new(serial: u32) -> Self {
        Self {
            serial,
            page_seq: 0,
            granule: 0,
        }
    }

    fn write_page(&mut self, packet: &[u8], header_type: u8, granule: u64) -> Vec<u8> {
        let full_segments = packet.len() / 255;
        let segment_count = full_segments + 1;
        let mut page = Vec::with_capacity(27 + segment_count + packet.len());
        page.extend_from_slice(CAPTURE_PATTERN);
        page.push(0); // version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.page_seq.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]); // CRC placeholder
        page.push(segment_count as u8);
        for _ in 0..full_segments {
            page.push(255);
        }
        page.push((packet.len() % 255) as u8);
        page.extend_from_slice(packet);

        let crc = crc32_ogg(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        self.page_seq += 1;
        page
    }

    /// Audio page carrying one packet; advances the granule clock.
    fn audio_page(&mut self, packet: &[u8]) -> Vec<u8> {
        self.granule += GRANULE_PER_PACKET;
        self.write_page(packet, 0, self.granule)
    }
}

fn opus_head_packet() -> Vec<u8> {
    let mut packet = Vec::with_capacity(19);
    packet.extend_from_slice(b"OpusHead");
    packet.push(1); // version
    packet.push(1); // channel count
    packet.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
    packet.extend_from_slice(&RADIO_RATE.to_le_bytes()); // input sample rate
    packet.extend_from_slice(&0i16.to_le_bytes()); // output gain
    packet.push(0); // channel mapping family
    packet
}

fn opus_tags_packet() -> Vec<u8> {
    let vendor = b"radio-hub";
    let mut packet = Vec::with_capacity(8 + 4 + vendor.len() + 4);
    packet.extend_from_slice(b"OpusTags");
    packet.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    packet.extend_from_slice(vendor);
    packet.extend_from_slice(&0u32.to_le_bytes()); // comment count
    packet
}

/// Incremental Ogg page parser: feed bytes, take whole packets.
#[derive(Default)]
struct PageReader {
    buf: Vec<u8>,
    /// Packet bytes continued from a previous page.
    partial: Vec<u8>,
}

impl PageReader {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extracts all packets completed by the buffered pages.
    fn take_packets(&mut self) -> Result<Vec<Vec<u8>>, TranscodeError> {
        let mut packets = Vec::new();
        loop {
            // Resync to the capture pattern if junk leads the buffer.
            if let Some(start) = find_capture(&self.buf) {
                if start > 0 {
                    self.buf.drain(..start);
                }
            } else {
                // No capture pattern: keep at most 3 trailing bytes in case
                // a pattern straddles the next datagram.
                let keep = self.buf.len().min(3);
                self.buf.drain(..self.buf.len() - keep);
                return Ok(packets);
            }
            if self.buf.len() < 27 {
                return Ok(packets);
            }
            let segment_count = self.buf[26] as usize;
            let header_len = 27 + segment_count;
            if self.buf.len() < header_len {
                return Ok(packets);
            }
            let body_len: usize = self.buf[27..header_len]
                .iter()
                .map(|&l| l as usize)
                .sum();
            let total = header_len + body_len;
            if self.buf.len() < total {
                return Ok(packets);
            }

            let mut page: Vec<u8> = self.buf.drain(..total).collect();
            let stated = u32::from_le_bytes([page[22], page[23], page[24], page[25]]);
            page[22..26].fill(0);
            if crc32_ogg(&page) != stated {
                return Err(TranscodeError::Codec("ogg page crc mismatch".into()));
            }

            let lacing = page[27..header_len].to_vec();
            let mut offset = header_len;
            for &segment in &lacing {
                let segment = segment as usize;
                self.partial.extend_from_slice(&page[offset..offset + segment]);
                offset += segment;
                if segment < 255 {
                    packets.push(std::mem::take(&mut self.partial));
                }
            }
        }
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == CAPTURE_PATTERN)
}

/// Ogg/Opus transcoder: PCM in, Ogg pages out, and back.
pub struct OggOpusTranscoder {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
    writer: PageWriter,
    reader: PageReader,
    /// Stream headers are emitted once, before the first audio page.
    headers_sent: bool,
    pcm_in: Vec<i16>,
    pcm_out: Vec<i16>,
    encode_scratch: Vec<u8>,
    decode_scratch: Vec<i16>,
    closed: bool,
}

impl OggOpusTranscoder {
    /// Creates an 8 kHz mono Ogg/Opus transcoder at the given bitrate.
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
            // Fixed serial: one logical stream per transcoder lifetime.
            writer: PageWriter::new(0x5241_4448), // "RADH"
            reader: PageReader::default(),
            headers_sent: false,
            pcm_in: Vec::with_capacity(VOICE_SAMPLES * 4),
            pcm_out: Vec::with_capacity(VOICE_SAMPLES * 4),
            encode_scratch: vec![0u8; MAX_PACKET_SIZE],
            decode_scratch: vec![0i16; MAX_DECODED_SAMPLES],
            closed: false,
        })
    }
}

impl Transcoder for OggOpusTranscoder {
    fn pcm_to_format(&mut self, samples: &[i16]) -> Result<Vec<Bytes>, TranscodeError> {
        if self.closed {
            return Err(TranscodeError::Closed);
        }
        self.pcm_in.extend_from_slice(samples);

        let mut pages = Vec::new();
        if !self.headers_sent && self.pcm_in.len() >= VOICE_SAMPLES {
            pages.push(Bytes::from(self.writer.write_page(
                &opus_head_packet(),
                HEADER_TYPE_BOS,
                0,
            )));
            pages.push(Bytes::from(self.writer.write_page(&opus_tags_packet(), 0, 0)));
            self.headers_sent = true;
        }
        while self.pcm_in.len() >= VOICE_SAMPLES {
            let frame: Vec<i16> = self.pcm_in.drain(..VOICE_SAMPLES).collect();
            let written = self
                .encoder
                .encode(&frame, &mut self.encode_scratch)
                .map_err(codec_err)?;
            pages.push(Bytes::from(
                self.writer.audio_page(&self.encode_scratch[..written]),
            ));
        }
        Ok(pages)
    }

    fn format_to_pcm(&mut self, data: &[u8]) -> Result<Vec<VoiceBlock>, TranscodeError> {
        if self.closed {
            return Err(TranscodeError::Closed);
        }
        self.reader.push(data);
        for packet in self.reader.take_packets()? {
            if packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags") {
                continue;
            }
            let decoded = self
                .decoder
                .decode(&packet, &mut self.decode_scratch, false)
                .map_err(codec_err)?;
            self.pcm_out.extend_from_slice(&self.decode_scratch[..decoded]);
        }
        Ok(drain_voice_blocks(&mut self.pcm_out))
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::Ogg
    }

    fn close(&mut self) {
        self.closed = true;
        self.pcm_in.clear();
        self.pcm_out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(samples: usize) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                let t = i as f32 / RADIO_RATE as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_crc_known_properties() {
        // Zero input gives zero CRC with this polynomial configuration.
        assert_eq!(crc32_ogg(&[]), 0);
        assert_eq!(crc32_ogg(&[0, 0, 0, 0]), 0);
        // And it is sensitive to every byte.
        assert_ne!(crc32_ogg(b"OggS"), crc32_ogg(b"OggT"));
    }

    #[test]
    fn test_page_structure() {
        let mut writer = PageWriter::new(7);
        let page = writer.write_page(b"hello", HEADER_TYPE_BOS, 0);
        assert_eq!(&page[0..4], b"OggS");
        assert_eq!(page[4], 0);
        assert_eq!(page[5], HEADER_TYPE_BOS);
        assert_eq!(&page[14..18], &7u32.to_le_bytes());
        assert_eq!(page[26], 1); // one segment
        assert_eq!(page[27], 5); // lacing value
        assert_eq!(&page[28..], b"hello");
    }

    #[test]
    fn test_page_lacing_for_multiple_of_255() {
        let mut writer = PageWriter::new(1);
        let page = writer.write_page(&vec![0xAB; 255], 0, 0);
        // 255-byte packet needs a 255 lacing value plus a terminating 0.
        assert_eq!(page[26], 2);
        assert_eq!(page[27], 255);
        assert_eq!(page[28], 0);
    }

    #[test]
    fn test_reader_roundtrips_writer_pages() {
        let mut writer = PageWriter::new(3);
        let mut reader = PageReader::default();

        reader.push(&writer.write_page(b"first", HEADER_TYPE_BOS, 0));
        reader.push(&writer.write_page(&vec![0x42; 600], 0, 960));

        let packets = reader.take_packets().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], b"first");
        assert_eq!(packets[1], vec![0x42; 600]);
    }

    #[test]
    fn test_reader_handles_split_delivery() {
        let mut writer = PageWriter::new(3);
        let page = writer.write_page(b"split across reads", 0, 0);

        let mut reader = PageReader::default();
        reader.push(&page[..10]);
        assert!(reader.take_packets().unwrap().is_empty());
        reader.push(&page[10..]);
        let packets = reader.take_packets().unwrap();
        assert_eq!(packets, vec![b"split across reads".to_vec()]);
    }

    #[test]
    fn test_reader_rejects_corrupt_crc() {
        let mut writer = PageWriter::new(3);
        let mut page = writer.write_page(b"payload", 0, 0);
        let last = page.len() - 1;
        page[last] ^= 0xFF;

        let mut reader = PageReader::default();
        reader.push(&page);
        assert!(matches!(
            reader.take_packets(),
            Err(TranscodeError::Codec(_))
        ));
    }

    #[test]
    fn test_first_output_carries_stream_headers() {
        let mut tc = OggOpusTranscoder::new(64_000).unwrap();
        let pages = tc.pcm_to_format(&tone(VOICE_SAMPLES)).unwrap();
        // OpusHead page, OpusTags page, one audio page.
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0][5], HEADER_TYPE_BOS);

        // Headers only once.
        let more = tc.pcm_to_format(&tone(VOICE_SAMPLES)).unwrap();
        assert_eq!(more.len(), 1);
    }

    #[test]
    fn test_ogg_opus_roundtrip() {
        let mut tc = OggOpusTranscoder::new(64_000).unwrap();
        let pages = tc.pcm_to_format(&tone(VOICE_SAMPLES * 3)).unwrap();

        let mut blocks = Vec::new();
        for page in &pages {
            blocks.extend(tc.format_to_pcm(page).unwrap());
        }
        assert_eq!(blocks.len(), 3);
        let energy: i64 = blocks[2].iter().map(|&s| i64::from(s).abs()).sum();
        assert!(energy > 0);
    }
}
