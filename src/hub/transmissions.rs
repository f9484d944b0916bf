//! The transmission table: who is keyed up right now.
//!
//! Enforces the concurrency cap and priority preemption over in-flight PTT
//! sessions. Per source id the states are simple: IDLE -> ACTIVE on an
//! admitted PTT-on frame, refreshed by further PTT-on frames, back to IDLE
//! on PTT-off or after `timeout` of inactivity. Every call sweeps expired
//! entries first, so a wedged sender cannot hold a slot forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::frame::{AudioFrame, ServiceId};
use crate::stats::TransmissionSnapshot;

struct Entry {
    priority: u8,
    last_active: Instant,
}

/// Tracks active PTT sessions and decides admission.
pub(crate) struct TransmissionTable {
    max_concurrent: usize,
    timeout: Duration,
    priority_rules: bool,
    entries: HashMap<ServiceId, Entry>,
}

impl TransmissionTable {
    pub(crate) fn new(max_concurrent: usize, timeout: Duration, priority_rules: bool) -> Self {
        Self {
            max_concurrent,
            timeout,
            priority_rules,
            entries: HashMap::new(),
        }
    }

    /// Decides whether a frame may proceed, updating the table.
    ///
    /// PTT-off frames always pass and clear their source's entry. PTT-on
    /// frames from an already-active source refresh it. A new source is
    /// admitted while slots remain; at the cap it is admitted only when
    /// priority rules are on and it outranks at least one current session.
    /// Preemption does not evict the outranked session: it will age out or
    /// key off on its own, and the table may briefly exceed the cap.
    pub(crate) fn admit(&mut self, frame: &AudioFrame) -> bool {
        let now = Instant::now();
        self.sweep(now);

        if !frame.ptt_active {
            self.entries.remove(&frame.source_id);
            return true;
        }

        if let Some(entry) = self.entries.get_mut(&frame.source_id) {
            entry.last_active = now;
            entry.priority = frame.priority;
            return true;
        }

        if self.entries.len() >= self.max_concurrent {
            let outranks_someone = self
                .entries
                .values()
                .any(|entry| frame.priority > entry.priority);
            if !(self.priority_rules && outranks_someone) {
                return false;
            }
        }

        self.entries.insert(
            frame.source_id.clone(),
            Entry {
                priority: frame.priority,
                last_active: now,
            },
        );
        true
    }

    /// Drops entries idle past the timeout; housekeeping calls this so the
    /// gauge stays honest between frames.
    pub(crate) fn sweep_expired(&mut self) {
        self.sweep(Instant::now());
    }

    fn sweep(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_active) <= timeout);
    }

    /// Number of live sessions.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Source ids and ages for the status surface.
    pub(crate) fn snapshot(&self) -> Vec<TransmissionSnapshot> {
        self.entries
            .iter()
            .map(|(source_id, entry)| TransmissionSnapshot {
                source_id: source_id.clone(),
                age: entry.last_active.elapsed(),
            })
            .collect()
    }
}
