//! USRP wire protocol: the 32-byte framed packets exchanged with
//! AllStarLink-compatible nodes.
//!
//! The framing is bit-exact with AllStarLink's `chan_usrp.c`: a fixed
//! 32-byte header whose fields are network-order (big-endian), followed by a
//! type-specific payload. The one deliberate asymmetry is that VOICE PCM
//! samples are **little-endian** on the wire while every header field is
//! big-endian; both encoders and decoders here enforce it.
//!
//! ```text
//! offset  size  field
//!      0     4  eye        literal "USRP"
//!      4     4  seq        u32, monotonic per sender
//!      8     4  memory     u32, opaque
//!     12     4  keyup      u32, nonzero = PTT active
//!     16     4  talkgroup  u32
//!     20     4  type       u32, one of the seven packet types
//!     24     4  mpxid      u32, reserved
//!     28     4  reserved   u32
//! ```

mod codec;

pub use codec::{
    DtmfFrame, Packet, PingFrame, TextFrame, TlvFrame, TlvItem, VoiceAdpcmFrame, VoiceFrame,
    VoiceUlawFrame,
};

use crate::error::ProtocolError;

/// The 4-byte magic at the start of every USRP packet.
pub const MAGIC: &[u8; 4] = b"USRP";

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Samples per voice frame (20 ms at 8 kHz mono).
pub const VOICE_SAMPLES: usize = 160;

/// Bytes of PCM payload in a voice frame (160 x i16).
pub const VOICE_PAYLOAD_SIZE: usize = VOICE_SAMPLES * 2;

/// Upper bound on payload size accepted from the wire.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// TLV tags defined by the protocol.
pub mod tlv_tag {
    /// AMBE vocoder data.
    pub const AMBE: u8 = 0x01;
    /// DTMF tone.
    pub const DTMF: u8 = 0x02;
    /// Primary metadata tag (callsign and friends).
    pub const SET_INFO: u8 = 0x08;
}

/// The seven packet types carried in the header's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    /// Voice audio, 160 signed 16-bit samples.
    Voice = 0,
    /// DTMF signalling, one digit.
    Dtmf = 1,
    /// Text / metadata bytes.
    Text = 2,
    /// Ping / keepalive, header only.
    Ping = 3,
    /// Type-Length-Value metadata items.
    Tlv = 4,
    /// ADPCM-compressed voice, variable length.
    VoiceAdpcm = 5,
    /// µ-law voice, 160 bytes.
    VoiceUlaw = 6,
}

impl PacketType {
    /// Maps a raw header type field to a packet type.
    pub fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Voice),
            1 => Ok(Self::Dtmf),
            2 => Ok(Self::Text),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Tlv),
            5 => Ok(Self::VoiceAdpcm),
            6 => Ok(Self::VoiceUlaw),
            value => Err(ProtocolError::InvalidType { value }),
        }
    }
}

/// The fixed 32-byte USRP packet header.
///
/// The `eye` magic is implicit: encoders always emit `USRP`, decoders reject
/// anything else. The type field is kept as the raw `u32` from the wire so a
/// frame's `validate()` can detect type mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Sequence counter, monotonic per sender.
    pub seq: u32,
    /// Sender-defined memory id; treated as opaque.
    pub memory: u32,
    /// PTT state; nonzero means active. Use [`set_ptt`](Self::set_ptt) /
    /// [`is_ptt`](Self::is_ptt) rather than touching this directly.
    pub keyup: u32,
    /// Talkgroup id.
    pub talkgroup: u32,
    /// Raw packet type field.
    pub packet_type: u32,
    /// Reserved for future use.
    pub mpxid: u32,
    /// Reserved for future use.
    pub reserved: u32,
}

impl Header {
    /// Creates a header for the given packet type and sequence number.
    pub fn new(packet_type: PacketType, seq: u32) -> Self {
        Self {
            seq,
            packet_type: packet_type as u32,
            ..Self::default()
        }
    }

    /// Sets the PTT (push-to-talk) state.
    pub fn set_ptt(&mut self, on: bool) {
        self.keyup = u32::from(on);
    }

    /// Returns `true` if PTT is active.
    pub fn is_ptt(&self) -> bool {
        self.keyup != 0
    }

    /// Appends the 32-byte wire form (magic + big-endian fields).
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.memory.to_be_bytes());
        buf.extend_from_slice(&self.keyup.to_be_bytes());
        buf.extend_from_slice(&self.talkgroup.to_be_bytes());
        buf.extend_from_slice(&self.packet_type.to_be_bytes());
        buf.extend_from_slice(&self.mpxid.to_be_bytes());
        buf.extend_from_slice(&self.reserved.to_be_bytes());
    }

    /// Parses the header, checking length and magic.
    pub(crate) fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "packet too short: {} bytes (need {HEADER_SIZE})",
                data.len()
            )));
        }
        if &data[0..4] != MAGIC {
            return Err(ProtocolError::malformed("bad magic"));
        }
        Ok(Self {
            seq: be_u32(&data[4..8]),
            memory: be_u32(&data[8..12]),
            keyup: be_u32(&data[12..16]),
            talkgroup: be_u32(&data[16..20]),
            packet_type: be_u32(&data[20..24]),
            mpxid: be_u32(&data[24..28]),
            reserved: be_u32(&data[28..32]),
        })
    }
}

/// Returns the packet type after verifying the magic and the 32-byte
/// minimum, without decoding the payload.
pub fn peek_type(data: &[u8]) -> Result<PacketType, ProtocolError> {
    let header = Header::parse(data)?;
    PacketType::from_wire(header.packet_type)
}

fn be_u32(bytes: &[u8]) -> u32 {
    // Callers always hand a 4-byte slice out of a length-checked header.
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Returns `true` for digits in `0-9`, `A-D`, `*`, `#`.
pub fn is_valid_dtmf_digit(digit: u8) -> bool {
    digit.is_ascii_digit() || (b'A'..=b'D').contains(&digit) || digit == b'*' || digit == b'#'
}
