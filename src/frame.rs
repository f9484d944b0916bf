//! The internal audio frame shared by all endpoints.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::config::ServiceType;

/// Unique identifier for a configured service endpoint.
///
/// Uses `Arc<str>` internally so cloning a `ServiceId` (which happens for
/// every frame) is a pointer copy, not a heap allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(Arc<str>);

impl ServiceId {
    /// Creates a new service id from a string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for ServiceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Logical audio payload formats crossing the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Signed 16-bit little-endian PCM.
    #[default]
    Pcm,
    /// Raw Opus packets.
    Opus,
    /// Opus packets in Ogg pages.
    Ogg,
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcm => write!(f, "pcm"),
            Self::Opus => write!(f, "opus"),
            Self::Ogg => write!(f, "ogg"),
        }
    }
}

/// An audio frame flowing through the hub.
///
/// Frames are value-typed: an endpoint creates one, hands it to the hub, and
/// must not touch it afterwards. The payload is a [`Bytes`] buffer so the
/// hub can fan a frame out to several destinations without copying; a
/// destination may observe the same buffer concurrently but never writes
/// through it.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Id of the endpoint that produced the frame.
    pub source_id: ServiceId,
    /// Type of the producing endpoint.
    pub source_type: ServiceType,
    /// Human-readable name of the producing endpoint.
    pub source_name: Arc<str>,

    /// The audio payload in `format`.
    pub payload: Bytes,
    /// Payload format.
    pub format: AudioFormat,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono, 2 = stereo).
    pub channels: u16,

    /// When the frame was read from the wire.
    pub timestamp: Instant,
    /// Sequence number assigned by the source.
    pub sequence: u32,
    /// Push-to-talk state.
    pub ptt_active: bool,
    /// Source callsign, when known.
    pub callsign: Option<String>,
    /// Talkgroup id.
    pub talkgroup: u32,
    /// Routing priority, 0-10; higher wins preemption.
    pub priority: u8,

    /// Frame-level destination filter: when non-empty, only endpoints of
    /// these types are candidates.
    pub route_to_types: Vec<ServiceType>,
    /// Frame-level exclusion: endpoints with these ids never receive it.
    pub exclude_ids: Vec<ServiceId>,
}

impl AudioFrame {
    /// Creates a frame with the common metadata filled in and the routing
    /// filters empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: ServiceId,
        source_type: ServiceType,
        source_name: Arc<str>,
        payload: Bytes,
        format: AudioFormat,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            source_id,
            source_type,
            source_name,
            payload,
            format,
            sample_rate,
            channels,
            timestamp: Instant::now(),
            sequence: 0,
            ptt_active: false,
            callsign: None,
            talkgroup: 0,
            priority: 0,
            route_to_types: Vec::new(),
            exclude_ids: Vec::new(),
        }
    }

    /// Returns `true` if the frame carries no payload bytes.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
