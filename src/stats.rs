//! Hub-wide and per-endpoint counters, and the read-only snapshot served to
//! the external status surface.
//!
//! Counters are atomics so workers increment them without locks; a snapshot
//! is a point-in-time copy, coherent enough for a status page.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ServiceType;
use crate::frame::ServiceId;

/// Hub-wide counters.
#[derive(Debug)]
pub struct HubStats {
    /// Frames pulled off the hub channel.
    pub total_messages: AtomicU64,
    /// Frames delivered to at least one destination.
    pub routed_messages: AtomicU64,
    /// Frames dropped: backpressure, concurrency rejection, or no
    /// accepting destination.
    pub dropped_messages: AtomicU64,
    /// Destination-local transcode failures.
    pub conversion_errors: AtomicU64,
    /// Enabled endpoints, refreshed by housekeeping.
    pub active_services: AtomicUsize,
    /// Live entries in the transmission table.
    pub active_transmissions: AtomicUsize,
    started_at: Instant,
}

impl HubStats {
    /// Creates zeroed counters with the uptime clock started now.
    pub fn new() -> Self {
        Self {
            total_messages: AtomicU64::new(0),
            routed_messages: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            conversion_errors: AtomicU64::new(0),
            active_services: AtomicUsize::new(0),
            active_transmissions: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }

    /// Time since the router started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for HubStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-endpoint counters.
#[derive(Debug, Default)]
pub struct EndpointStats {
    /// Messages read from the endpoint's wire.
    pub messages_in: AtomicU64,
    /// Messages sent out the endpoint's wire.
    pub messages_out: AtomicU64,
    /// Bytes read.
    pub bytes_in: AtomicU64,
    /// Bytes sent.
    pub bytes_out: AtomicU64,
    /// Decode, send and backpressure errors.
    pub errors: AtomicU64,
    last_activity: Mutex<Option<Instant>>,
}

impl EndpointStats {
    /// Records an inbound message of `bytes` bytes.
    pub fn record_in(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_activity.lock() = Some(Instant::now());
    }

    /// Records an outbound message of `bytes` bytes.
    pub fn record_out(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_activity.lock() = Some(Instant::now());
    }

    /// Records one error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last in/out activity, if any.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity.lock().map(|at| at.elapsed())
    }
}

/// Point-in-time copy of one endpoint's counters.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    /// Endpoint id.
    pub id: ServiceId,
    /// Endpoint type.
    pub service_type: ServiceType,
    /// Human-readable name.
    pub name: String,
    /// Messages read from the wire.
    pub messages_in: u64,
    /// Messages sent.
    pub messages_out: u64,
    /// Bytes read.
    pub bytes_in: u64,
    /// Bytes sent.
    pub bytes_out: u64,
    /// Errors recorded.
    pub errors: u64,
    /// Time since last activity.
    pub idle_for: Option<Duration>,
}

/// One in-flight PTT session, as seen by the status surface.
#[derive(Debug, Clone)]
pub struct TransmissionSnapshot {
    /// The transmitting source.
    pub source_id: ServiceId,
    /// Age of the most recent PTT-on frame.
    pub age: Duration,
}

/// Point-in-time copy of everything the status surface reads.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Router uptime.
    pub uptime: Duration,
    /// Frames seen by the hub.
    pub total_messages: u64,
    /// Frames delivered to at least one destination.
    pub routed_messages: u64,
    /// Frames dropped.
    pub dropped_messages: u64,
    /// Transcode failures.
    pub conversion_errors: u64,
    /// Enabled endpoints.
    pub active_services: usize,
    /// Live PTT sessions.
    pub active_transmissions: usize,
    /// Per-endpoint counters.
    pub endpoints: Vec<EndpointSnapshot>,
    /// Live PTT session details.
    pub transmissions: Vec<TransmissionSnapshot>,
}

impl HubStats {
    /// Copies the hub counters into a snapshot shell; the caller fills in
    /// endpoint and transmission details.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            routed_messages: self.routed_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            active_services: self.active_services.load(Ordering::Relaxed),
            active_transmissions: self.active_transmissions.load(Ordering::Relaxed),
            endpoints: Vec::new(),
            transmissions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_stats_snapshot() {
        let stats = HubStats::new();
        stats.total_messages.fetch_add(5, Ordering::Relaxed);
        stats.routed_messages.fetch_add(4, Ordering::Relaxed);
        stats.dropped_messages.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_messages, 5);
        assert_eq!(snapshot.routed_messages, 4);
        assert_eq!(snapshot.dropped_messages, 1);
        assert!(snapshot.endpoints.is_empty());
    }

    #[test]
    fn test_endpoint_stats_accumulate() {
        let stats = EndpointStats::default();
        assert_eq!(stats.idle_for(), None);

        stats.record_in(352);
        stats.record_in(352);
        stats.record_out(100);
        stats.record_error();

        assert_eq!(stats.messages_in.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), 704);
        assert_eq!(stats.messages_out.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), 100);
        assert_eq!(stats.errors.load(Ordering::Relaxed), 1);
        assert!(stats.idle_for().is_some());
    }
}
