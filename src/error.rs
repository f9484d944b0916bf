//! Error types for radio-hub.
//!
//! Errors are split along the propagation policy:
//! - **Fatal errors** ([`ConfigError`], [`RouterError`]): prevent the router
//!   from starting.
//! - **Per-frame errors** ([`ProtocolError`], [`TranscodeError`],
//!   [`EgressError`]): local to one endpoint or one destination. They are
//!   counted and logged; the hub never terminates on them.

use crate::frame::AudioFormat;
use crate::usrp;

/// Wire-level decode and validation failures for USRP packets.
///
/// Every variant maps to a dropped frame and an incremented endpoint error
/// counter; none of them are fatal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The packet is shorter than the 32-byte header or does not start with
    /// the `USRP` magic.
    #[error("malformed header: {reason}")]
    MalformedHeader {
        /// What was wrong with the header.
        reason: String,
    },

    /// The header type field is not one of the seven known packet types.
    #[error("invalid packet type: {value}")]
    InvalidType {
        /// The raw type field value.
        value: u32,
    },

    /// The payload is shorter than the fixed size required by the packet type.
    #[error("short payload for {packet_type:?}: got {got} bytes, need {need}")]
    ShortPayload {
        /// The packet type being decoded.
        packet_type: usrp::PacketType,
        /// Bytes available after the header.
        got: usize,
        /// Bytes required by the type.
        need: usize,
    },

    /// A TLV item declared a length that runs past the end of the packet.
    #[error("TLV item length {declared} exceeds remaining {remaining} bytes")]
    TruncatedTlv {
        /// The declared item length.
        declared: usize,
        /// Bytes actually remaining in the buffer.
        remaining: usize,
    },

    /// A DTMF digit outside `0-9`, `A-D`, `*`, `#`.
    #[error("invalid DTMF digit: {digit:#04x}")]
    InvalidDtmfDigit {
        /// The offending byte.
        digit: u8,
    },
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            reason: reason.into(),
        }
    }
}

/// Failures inside the transcode façade.
///
/// Transcode errors are destination-local: the hub skips the affected
/// destination, counts a conversion error, and carries on.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// The façade was used after `close()`.
    #[error("transcoder is closed")]
    Closed,

    /// The underlying codec rejected the data.
    #[error("codec error: {0}")]
    Codec(String),

    /// The façade did not produce output within its bounded deadline.
    #[error("transcode timed out")]
    Timeout,

    /// The façade cannot produce or consume this format.
    #[error("unsupported format: {format}")]
    Unsupported {
        /// The format that was requested.
        format: AudioFormat,
    },
}

/// Failures delivering a frame to one destination endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    /// The endpoint has no remote address configured; it cannot send.
    #[error("no remote address configured")]
    NotConfigured,

    /// The frame's format does not match the destination profile and no
    /// transcoder is available. This is a silent non-delivery, not an
    /// error counter increment.
    #[error("format {have} does not match destination format {want}")]
    FormatMismatch {
        /// Format carried by the frame.
        have: AudioFormat,
        /// Format the destination expects.
        want: AudioFormat,
    },

    /// Transcoding for this destination failed.
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// The network send failed.
    #[error("network send failed: {0}")]
    Network(#[from] std::io::Error),

    /// The destination's bounded delivery queue is full; the frame is
    /// skipped for this destination only.
    #[error("destination queue full")]
    QueueFull,

    /// The destination's delivery channel is gone (external client hung up).
    #[error("delivery channel closed")]
    ChannelClosed,
}

/// Configuration problems detected during validation. Always fatal: the
/// router refuses to start on any of these.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Two services share the same id.
    #[error("duplicate service id: {id}")]
    DuplicateServiceId {
        /// The id that appeared more than once.
        id: String,
    },

    /// A routing priority outside the 0-10 range.
    #[error("service {id}: priority {priority} out of range (0-10)")]
    PriorityOutOfRange {
        /// The offending service.
        id: String,
        /// The configured priority.
        priority: u8,
    },

    /// A listen address was given without a port.
    #[error("service {id}: listen address configured without a port")]
    IncompleteListenBinding {
        /// The offending service.
        id: String,
    },

    /// A remote address was given without a port.
    #[error("service {id}: remote address configured without a port")]
    IncompleteRemoteBinding {
        /// The offending service.
        id: String,
    },

    /// The hub channel capacity is zero.
    #[error("buffer_size must be greater than zero")]
    ZeroBufferSize,
}

/// Errors returned from [`Router::start`](crate::Router::start).
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
