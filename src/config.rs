//! Router and service configuration.
//!
//! The CLI flag / config-file loader lives outside this crate; it
//! deserialises these structures (everything here is `serde::Deserialize`)
//! and hands them to [`Router::start`](crate::Router::start), which runs
//! [`RouterConfig::validate`] before touching the network. After validation
//! the configuration is read-only.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::frame::AudioFormat;

/// The kinds of audio service an endpoint can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// AllStarLink node speaking the USRP wire protocol.
    Usrp,
    /// WhoTalkie-style Opus-over-UDP endpoint.
    #[serde(rename = "whotalkie")]
    WhoTalkie,
    /// Discord voice, bridged through an external gateway client.
    Discord,
    /// Anything else that can move raw audio bytes over UDP/TCP.
    Generic,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usrp => write!(f, "usrp"),
            Self::WhoTalkie => write!(f, "whotalkie"),
            Self::Discord => write!(f, "discord"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Transport protocol for a service's network binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// Datagrams; the default everywhere.
    #[default]
    Udp,
    /// Stream transport, one connection handler per accepted socket.
    Tcp,
}

/// Global routing posture applied before per-service filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DefaultRouting {
    /// Every remaining source/destination pair is permitted.
    #[default]
    #[serde(rename = "all-to-all")]
    AllToAll,
    /// Reserved; currently permits no pairs.
    #[serde(rename = "hub-only")]
    HubOnly,
    /// No routing at all.
    #[serde(rename = "none")]
    None,
}

/// Formats the transcode façade can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeFormat {
    /// Raw Opus packets.
    #[default]
    Opus,
    /// Opus packets in Ogg pages.
    Ogg,
}

impl TranscodeFormat {
    /// The [`AudioFormat`] this façade output corresponds to.
    pub fn audio_format(self) -> AudioFormat {
        match self {
            Self::Opus => AudioFormat::Opus,
            Self::Ogg => AudioFormat::Ogg,
        }
    }
}

/// Network binding for one service.
///
/// A service with a listen binding ingests audio; one with a remote binding
/// can be a destination. Either, both, or neither may be configured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    /// Transport protocol.
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Local address to listen on, e.g. `0.0.0.0`. Empty = don't listen.
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Local port to listen on.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Remote address to send to. Empty = don't send.
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Remote port to send to.
    #[serde(default)]
    pub remote_port: Option<u16>,
}

impl NetworkConfig {
    /// `host:port` to bind, when a listen binding is configured.
    pub fn listen_addr_port(&self) -> Option<String> {
        match (&self.listen_addr, self.listen_port) {
            (Some(addr), Some(port)) if !addr.is_empty() => Some(format!("{addr}:{port}")),
            _ => None,
        }
    }

    /// `host:port` to send to, when a remote binding is configured.
    pub fn remote_addr_port(&self) -> Option<String> {
        match (&self.remote_addr, self.remote_port) {
            (Some(addr), Some(port)) if !addr.is_empty() => Some(format!("{addr}:{port}")),
            _ => None,
        }
    }
}

/// Audio profile of a service: the format it speaks on its own wire.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioProfile {
    /// Payload format.
    #[serde(default)]
    pub format: AudioFormat,
    /// Sample rate in Hz. Zero means "use the per-type default".
    #[serde(default)]
    pub sample_rate: u32,
    /// Channel count. Zero means "use the per-type default".
    #[serde(default)]
    pub channels: u16,
    /// Bitrate in bits/s for compressed formats.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bitrate() -> u32 {
    64_000
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            format: AudioFormat::Pcm,
            sample_rate: 0,
            channels: 0,
            bitrate: default_bitrate(),
        }
    }
}

/// Per-service routing policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingPolicy {
    /// Whether the service may inject frames into the hub.
    #[serde(default = "default_true")]
    pub can_send: bool,
    /// Whether the service may be a destination.
    #[serde(default = "default_true")]
    pub can_receive: bool,
    /// Source-side type filter: when non-empty, destinations must be of one
    /// of these types.
    #[serde(default)]
    pub send_to_types: Vec<ServiceType>,
    /// Destination-side type filter: when non-empty, sources must be of one
    /// of these types.
    #[serde(default)]
    pub receive_from: Vec<ServiceType>,
    /// Destination ids this service never sends to.
    #[serde(default)]
    pub exclude_services: Vec<String>,
    /// Priority 0-10; higher may preempt at the concurrency cap.
    #[serde(default)]
    pub priority: u8,
}

fn default_true() -> bool {
    true
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            can_send: true,
            can_receive: true,
            send_to_types: Vec::new(),
            receive_from: Vec::new(),
            exclude_services: Vec::new(),
            priority: 0,
        }
    }
}

/// One configured service endpoint. Immutable after validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstance {
    /// Unique id. When empty, validation synthesises `<type>_<index>`.
    #[serde(default)]
    pub id: String,
    /// Service kind.
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    /// Human-readable name for logs and the status surface.
    #[serde(default)]
    pub name: String,
    /// Disabled services are ignored entirely.
    #[serde(default)]
    pub enabled: bool,
    /// Network binding.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Audio profile.
    #[serde(default)]
    pub audio: AudioProfile,
    /// Routing policy.
    #[serde(default)]
    pub routing: RoutingPolicy,
    /// RMS level above which non-PTT audio counts as an active
    /// transmission. Used by endpoints whose wire carries no PTT flag.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: i16,
    /// Opaque type-specific settings; parsed into a typed record by the
    /// endpoint constructor (e.g. Discord guild/channel ids).
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

fn default_vad_threshold() -> i16 {
    1000
}

impl ServiceInstance {
    /// Creates an enabled instance with per-type audio defaults, mainly for
    /// embedding and tests.
    pub fn new(id: impl Into<String>, service_type: ServiceType) -> Self {
        let mut instance = Self {
            id: id.into(),
            service_type,
            name: String::new(),
            enabled: true,
            network: NetworkConfig::default(),
            audio: AudioProfile::default(),
            routing: RoutingPolicy::default(),
            vad_threshold: default_vad_threshold(),
            settings: serde_json::Map::new(),
        };
        instance.apply_audio_defaults();
        instance
    }

    /// Fills in zero/empty audio fields from the per-type defaults:
    /// USRP pcm/8000/1, WhoTalkie opus/48000/1, Discord pcm/48000/2,
    /// Generic pcm/8000/1.
    fn apply_audio_defaults(&mut self) {
        let (format, rate, channels) = match self.service_type {
            ServiceType::Usrp => (AudioFormat::Pcm, 8000, 1),
            ServiceType::WhoTalkie => (AudioFormat::Opus, 48_000, 1),
            ServiceType::Discord => (AudioFormat::Pcm, 48_000, 2),
            ServiceType::Generic => (AudioFormat::Pcm, 8000, 1),
        };
        if self.audio.sample_rate == 0 {
            self.audio.sample_rate = rate;
            // A service that never set a rate gets the whole type default.
            self.audio.format = format;
        }
        if self.audio.channels == 0 {
            self.audio.channels = channels;
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Hub channel capacity.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum simultaneous PTT sessions.
    #[serde(default = "default_max_concurrent_tx")]
    pub max_concurrent_tx: usize,
    /// Seconds of inactivity after which a PTT session expires.
    #[serde(default = "default_tx_timeout_seconds")]
    pub tx_timeout_seconds: u64,
    /// Whether to build the transcode façade at startup.
    #[serde(default = "default_true")]
    pub enable_conversion: bool,
    /// Format the façade produces.
    #[serde(default)]
    pub default_format: TranscodeFormat,
    /// Informational; self-id exclusion is unconditional regardless.
    #[serde(default = "default_true")]
    pub prevent_loops: bool,
    /// Whether a higher-priority frame may preempt at the concurrency cap.
    #[serde(default = "default_true")]
    pub enable_priority_rules: bool,
    /// Global routing posture.
    #[serde(default)]
    pub default_routing: DefaultRouting,
    /// The configured services.
    #[serde(default)]
    pub services: Vec<ServiceInstance>,
}

fn default_buffer_size() -> usize {
    1000
}

fn default_max_concurrent_tx() -> usize {
    3
}

fn default_tx_timeout_seconds() -> u64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_concurrent_tx: default_max_concurrent_tx(),
            tx_timeout_seconds: default_tx_timeout_seconds(),
            enable_conversion: true,
            default_format: TranscodeFormat::Opus,
            prevent_loops: true,
            enable_priority_rules: true,
            default_routing: DefaultRouting::AllToAll,
            services: Vec::new(),
        }
    }
}

impl RouterConfig {
    /// Validates and normalises the configuration in place.
    ///
    /// Synthesises missing service ids as `<type>_<index>`, applies per-type
    /// audio defaults, and rejects duplicate ids, out-of-range priorities,
    /// incomplete bindings and a zero-capacity hub channel. Any error here
    /// is fatal: the router refuses to start.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        let mut seen = std::collections::HashSet::new();
        for (index, service) in self.services.iter_mut().enumerate() {
            if service.id.is_empty() {
                service.id = format!("{}_{}", service.service_type, index + 1);
            }
            if service.name.is_empty() {
                service.name = service.id.clone();
            }
            if !seen.insert(service.id.clone()) {
                return Err(ConfigError::DuplicateServiceId {
                    id: service.id.clone(),
                });
            }
            if service.routing.priority > 10 {
                return Err(ConfigError::PriorityOutOfRange {
                    id: service.id.clone(),
                    priority: service.routing.priority,
                });
            }
            let listen_addr_set =
                matches!(&service.network.listen_addr, Some(a) if !a.is_empty());
            if listen_addr_set && service.network.listen_port.is_none() {
                return Err(ConfigError::IncompleteListenBinding {
                    id: service.id.clone(),
                });
            }
            let remote_addr_set =
                matches!(&service.network.remote_addr, Some(a) if !a.is_empty());
            if remote_addr_set && service.network.remote_port.is_none() {
                return Err(ConfigError::IncompleteRemoteBinding {
                    id: service.id.clone(),
                });
            }
            service.apply_audio_defaults();
        }
        Ok(())
    }
}
