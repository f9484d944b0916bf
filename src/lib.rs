//! # radio-hub
//!
//! Real-time audio routing between amateur-radio voice services.
//!
//! `radio-hub` accepts voice and signalling frames from heterogeneous
//! sources (AllStarLink-compatible USRP nodes, WhoTalkie-style Opus
//! endpoints, Discord voice via an external gateway client, and generic
//! UDP/TCP services), mediates concurrent transmissions with a priority
//! table, and forwards each frame to the peers the routing rules allow,
//! transcoding formats on the way out.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use radio_hub::{Router, RouterConfig};
//!
//! let config: RouterConfig = serde_json::from_str(&config_json)?;
//! let handle = Router::builder(config)
//!     .on_event(|event| tracing::info!(?event, "router event"))
//!     .start()
//!     .await?;
//!
//! // ... traffic flows between endpoints ...
//! println!("{} frames routed", handle.snapshot().routed_messages);
//!
//! handle.stop().await;
//! ```
//!
//! ## Architecture
//!
//! The crate is a hub and spokes:
//!
//! - **Endpoint workers** own their sockets and translate between each
//!   service's wire format and the internal [`AudioFrame`].
//! - **The hub channel** is a bounded queue with many producers and one
//!   consumer; a full hub drops frames rather than block the network.
//! - **The hub dispatcher** is a single task, which makes per-source frame
//!   ordering free; it consults the transmission table and the routing
//!   rules, then hands frames to each destination's egress.
//!
//! Frames are value-typed and payloads are shared [`bytes::Bytes`], so a
//! three-way fan-out copies routing metadata, never audio.

#![warn(missing_docs)]
// Audio code casts freely between sample widths and byte counts.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only.
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod config;
mod endpoint;
mod error;
mod event;
pub mod format;
mod frame;
mod hub;
mod router;
mod stats;
pub mod transcode;
pub mod usrp;

pub use config::{
    AudioProfile, DefaultRouting, NetworkConfig, RouterConfig, RoutingPolicy, ServiceInstance,
    ServiceType, TranscodeFormat, TransportProtocol,
};
pub use endpoint::{DiscordLink, Egress, Endpoint};
pub use error::{ConfigError, EgressError, ProtocolError, RouterError, TranscodeError};
pub use event::{event_callback, EventCallback, RouterEvent};
pub use frame::{AudioFormat, AudioFrame, ServiceId};
pub use router::{Router, RouterBuilder, RouterHandle};
pub use stats::{EndpointSnapshot, StatsSnapshot, TransmissionSnapshot};
pub use transcode::{OggOpusTranscoder, OpusTranscoder, SharedTranscoder, Transcoder};
