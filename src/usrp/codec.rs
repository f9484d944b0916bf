//! Frame types and their wire encodings.
//!
//! Each frame type owns a [`Header`] plus its payload and provides
//! `encode`/`decode`/`validate`. [`Packet`] is the tagged union used where a
//! packet of any type may arrive; [`Packet::decode`] dispatches on the
//! peeked type field.

use crate::error::ProtocolError;
use crate::usrp::{
    is_valid_dtmf_digit, tlv_tag, Header, PacketType, HEADER_SIZE, VOICE_PAYLOAD_SIZE,
    VOICE_SAMPLES,
};

/// Voice audio: 160 signed 16-bit samples, little-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceFrame {
    /// Packet header.
    pub header: Header,
    /// 20 ms of 8 kHz mono PCM.
    pub audio: [i16; VOICE_SAMPLES],
}

impl VoiceFrame {
    /// Creates a silent voice frame with the given sequence number.
    pub fn new(seq: u32) -> Self {
        Self {
            header: Header::new(PacketType::Voice, seq),
            audio: [0; VOICE_SAMPLES],
        }
    }

    /// Encodes to the 352-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + VOICE_PAYLOAD_SIZE);
        self.header.write_to(&mut buf);
        for sample in &self.audio {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
        buf
    }

    /// Decodes from wire bytes; requires the full 320-byte PCM payload.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        let payload = &data[HEADER_SIZE..];
        if payload.len() < VOICE_PAYLOAD_SIZE {
            return Err(ProtocolError::ShortPayload {
                packet_type: PacketType::Voice,
                got: payload.len(),
                need: VOICE_PAYLOAD_SIZE,
            });
        }
        let mut audio = [0i16; VOICE_SAMPLES];
        for (sample, bytes) in audio.iter_mut().zip(payload.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        Ok(Self { header, audio })
    }

    /// Checks that the header type field matches VOICE.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::Voice)
    }
}

/// DTMF signalling: a single digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfFrame {
    /// Packet header.
    pub header: Header,
    /// The digit, one of `0-9`, `A-D`, `*`, `#`.
    pub digit: u8,
}

impl DtmfFrame {
    /// Creates a DTMF frame. The digit is not validated here; call
    /// [`validate`](Self::validate) before trusting it.
    pub fn new(seq: u32, digit: u8) -> Self {
        Self {
            header: Header::new(PacketType::Dtmf, seq),
            digit,
        }
    }

    /// Encodes to the 33-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 1);
        self.header.write_to(&mut buf);
        buf.push(self.digit);
        buf
    }

    /// Decodes from wire bytes. The digit is validated on decode.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        let payload = &data[HEADER_SIZE..];
        if payload.is_empty() {
            return Err(ProtocolError::ShortPayload {
                packet_type: PacketType::Dtmf,
                got: 0,
                need: 1,
            });
        }
        let digit = payload[0];
        if !is_valid_dtmf_digit(digit) {
            return Err(ProtocolError::InvalidDtmfDigit { digit });
        }
        Ok(Self { header, digit })
    }

    /// Checks the type field and the digit set.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::Dtmf)?;
        if !is_valid_dtmf_digit(self.digit) {
            return Err(ProtocolError::InvalidDtmfDigit { digit: self.digit });
        }
        Ok(())
    }
}

/// Text / metadata: a variable-length byte payload with no required encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    /// Packet header.
    pub header: Header,
    /// The text bytes.
    pub text: Vec<u8>,
}

impl TextFrame {
    /// Creates a text frame from the given bytes.
    pub fn new(seq: u32, text: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Header::new(PacketType::Text, seq),
            text: text.into(),
        }
    }

    /// Encodes to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.text.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.text);
        buf
    }

    /// Decodes from wire bytes; the whole payload is the text.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        Ok(Self {
            header,
            text: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Checks that the header type field matches TEXT.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::Text)
    }
}

/// Ping / keepalive: header only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    /// Packet header.
    pub header: Header,
}

impl PingFrame {
    /// Creates a ping frame.
    pub fn new(seq: u32) -> Self {
        Self {
            header: Header::new(PacketType::Ping, seq),
        }
    }

    /// Encodes to the 32-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.header.write_to(&mut buf);
        buf
    }

    /// Decodes from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            header: Header::parse(data)?,
        })
    }

    /// Checks that the header type field matches PING.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::Ping)
    }
}

/// One Type-Length-Value item: tag byte, big-endian u16 length, value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvItem {
    /// The tag byte (see [`tlv_tag`]).
    pub tag: u8,
    /// The value; its length is the wire length field.
    pub value: Vec<u8>,
}

/// TLV metadata: a sequence of items running to the end of the packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlvFrame {
    /// Packet header.
    pub header: Header,
    /// The items, in wire order.
    pub items: Vec<TlvItem>,
}

impl TlvFrame {
    /// Creates an empty TLV frame.
    pub fn new(seq: u32) -> Self {
        Self {
            header: Header::new(PacketType::Tlv, seq),
            items: Vec::new(),
        }
    }

    /// Appends an item.
    pub fn add_item(&mut self, tag: u8, value: impl Into<Vec<u8>>) {
        self.items.push(TlvItem {
            tag,
            value: value.into(),
        });
    }

    /// Returns the first item with the given tag.
    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|item| item.tag == tag)
            .map(|item| item.value.as_slice())
    }

    /// Stores a callsign under the `SET_INFO` tag, length-prefixed by the
    /// item length (no NUL terminator).
    pub fn set_callsign(&mut self, callsign: &str) {
        self.add_item(tlv_tag::SET_INFO, callsign.as_bytes());
    }

    /// Returns the callsign from the first `SET_INFO` item, if present.
    pub fn callsign(&self) -> Option<String> {
        self.get(tlv_tag::SET_INFO)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// Encodes to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len: usize = self.items.iter().map(|item| 3 + item.value.len()).sum();
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload_len);
        self.header.write_to(&mut buf);
        for item in &self.items {
            buf.push(item.tag);
            buf.extend_from_slice(&(item.value.len() as u16).to_be_bytes());
            buf.extend_from_slice(&item.value);
        }
        buf
    }

    /// Decodes from wire bytes.
    ///
    /// Parsing stops cleanly at a trailing fragment shorter than the 3-byte
    /// item header; an item whose declared length runs past the end of the
    /// buffer is a [`ProtocolError::TruncatedTlv`].
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        let mut items = Vec::new();
        let mut rest = &data[HEADER_SIZE..];
        while rest.len() >= 3 {
            let tag = rest[0];
            let declared = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            let remaining = rest.len() - 3;
            if declared > remaining {
                return Err(ProtocolError::TruncatedTlv {
                    declared,
                    remaining,
                });
            }
            items.push(TlvItem {
                tag,
                value: rest[3..3 + declared].to_vec(),
            });
            rest = &rest[3 + declared..];
        }
        Ok(Self { header, items })
    }

    /// Checks that the header type field matches TLV.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::Tlv)
    }
}

/// µ-law voice: 160 one-byte samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceUlawFrame {
    /// Packet header.
    pub header: Header,
    /// 20 ms of µ-law audio.
    pub audio: [u8; VOICE_SAMPLES],
}

impl VoiceUlawFrame {
    /// Creates a µ-law frame of silence.
    pub fn new(seq: u32) -> Self {
        Self {
            header: Header::new(PacketType::VoiceUlaw, seq),
            audio: [0; VOICE_SAMPLES],
        }
    }

    /// Encodes to the 192-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + VOICE_SAMPLES);
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.audio);
        buf
    }

    /// Decodes from wire bytes; requires the full 160-byte payload.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        let payload = &data[HEADER_SIZE..];
        if payload.len() < VOICE_SAMPLES {
            return Err(ProtocolError::ShortPayload {
                packet_type: PacketType::VoiceUlaw,
                got: payload.len(),
                need: VOICE_SAMPLES,
            });
        }
        let mut audio = [0u8; VOICE_SAMPLES];
        audio.copy_from_slice(&payload[..VOICE_SAMPLES]);
        Ok(Self { header, audio })
    }

    /// Checks that the header type field matches VOICE_ULAW.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::VoiceUlaw)
    }
}

/// ADPCM voice: variable-length compressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceAdpcmFrame {
    /// Packet header.
    pub header: Header,
    /// The compressed audio bytes.
    pub audio: Vec<u8>,
}

impl VoiceAdpcmFrame {
    /// Creates an ADPCM frame from the given bytes.
    pub fn new(seq: u32, audio: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Header::new(PacketType::VoiceAdpcm, seq),
            audio: audio.into(),
        }
    }

    /// Encodes to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.audio.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.audio);
        buf
    }

    /// Decodes from wire bytes; the whole payload is the ADPCM data.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        Ok(Self {
            header,
            audio: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Checks that the header type field matches VOICE_ADPCM.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        expect_type(&self.header, PacketType::VoiceAdpcm)
    }
}

/// A USRP packet of any type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Voice PCM.
    Voice(VoiceFrame),
    /// DTMF digit.
    Dtmf(DtmfFrame),
    /// Text bytes.
    Text(TextFrame),
    /// Keepalive.
    Ping(PingFrame),
    /// TLV metadata.
    Tlv(TlvFrame),
    /// ADPCM voice.
    VoiceAdpcm(VoiceAdpcmFrame),
    /// µ-law voice.
    VoiceUlaw(VoiceUlawFrame),
}

impl Packet {
    /// Decodes any packet by dispatching on the peeked type field.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        match crate::usrp::peek_type(data)? {
            PacketType::Voice => VoiceFrame::decode(data).map(Self::Voice),
            PacketType::Dtmf => DtmfFrame::decode(data).map(Self::Dtmf),
            PacketType::Text => TextFrame::decode(data).map(Self::Text),
            PacketType::Ping => PingFrame::decode(data).map(Self::Ping),
            PacketType::Tlv => TlvFrame::decode(data).map(Self::Tlv),
            PacketType::VoiceAdpcm => VoiceAdpcmFrame::decode(data).map(Self::VoiceAdpcm),
            PacketType::VoiceUlaw => VoiceUlawFrame::decode(data).map(Self::VoiceUlaw),
        }
    }

    /// Encodes to wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Voice(f) => f.encode(),
            Self::Dtmf(f) => f.encode(),
            Self::Text(f) => f.encode(),
            Self::Ping(f) => f.encode(),
            Self::Tlv(f) => f.encode(),
            Self::VoiceAdpcm(f) => f.encode(),
            Self::VoiceUlaw(f) => f.encode(),
        }
    }

    /// The packet's header.
    pub fn header(&self) -> &Header {
        match self {
            Self::Voice(f) => &f.header,
            Self::Dtmf(f) => &f.header,
            Self::Text(f) => &f.header,
            Self::Ping(f) => &f.header,
            Self::Tlv(f) => &f.header,
            Self::VoiceAdpcm(f) => &f.header,
            Self::VoiceUlaw(f) => &f.header,
        }
    }

    /// The packet's type tag.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Voice(_) => PacketType::Voice,
            Self::Dtmf(_) => PacketType::Dtmf,
            Self::Text(_) => PacketType::Text,
            Self::Ping(_) => PacketType::Ping,
            Self::Tlv(_) => PacketType::Tlv,
            Self::VoiceAdpcm(_) => PacketType::VoiceAdpcm,
            Self::VoiceUlaw(_) => PacketType::VoiceUlaw,
        }
    }

    /// Runs the type-specific consistency checks.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Voice(f) => f.validate(),
            Self::Dtmf(f) => f.validate(),
            Self::Text(f) => f.validate(),
            Self::Ping(f) => f.validate(),
            Self::Tlv(f) => f.validate(),
            Self::VoiceAdpcm(f) => f.validate(),
            Self::VoiceUlaw(f) => f.validate(),
        }
    }
}

fn expect_type(header: &Header, want: PacketType) -> Result<(), ProtocolError> {
    if header.packet_type != want as u32 {
        return Err(ProtocolError::InvalidType {
            value: header.packet_type,
        });
    }
    Ok(())
}
