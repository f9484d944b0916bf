//! Runtime events for monitoring router health.
//!
//! Events are non-fatal notifications. The router keeps running after every
//! one of them; they exist for logging, metrics, and control integrations
//! (DTMF), not for error handling.

use std::sync::Arc;

use crate::frame::ServiceId;

/// Runtime events emitted while the router runs.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A DTMF digit arrived from a USRP endpoint.
    ///
    /// DTMF is signalling, not audio: it is never mixed into the voice path.
    /// Embedders wire this to command handling (link, unlink, macros).
    DtmfReceived {
        /// Endpoint that received the digit.
        source_id: ServiceId,
        /// The digit, one of `0-9`, `A-D`, `*`, `#`.
        digit: char,
        /// Talkgroup from the carrying packet.
        talkgroup: u32,
    },

    /// A frame could not be enqueued because the hub channel was full.
    ///
    /// The frame is dropped; the network is never blocked on the hub.
    HubBackpressure {
        /// Endpoint whose frame was dropped.
        source_id: ServiceId,
    },

    /// The transmission table refused a frame at the concurrency cap.
    TransmissionRejected {
        /// Endpoint whose transmission was refused.
        source_id: ServiceId,
        /// Priority the frame carried.
        priority: u8,
    },

    /// An inbound packet failed to decode and was dropped.
    DecodeError {
        /// Endpoint that read the packet.
        source_id: ServiceId,
        /// Description of the failure.
        error: String,
    },

    /// Delivery to one destination failed; other destinations unaffected.
    EgressFailed {
        /// The destination that failed.
        destination_id: ServiceId,
        /// Description of the failure.
        error: String,
    },

    /// An endpoint worker started.
    EndpointStarted {
        /// The endpoint's id.
        id: ServiceId,
    },

    /// An endpoint worker stopped.
    EndpointStopped {
        /// The endpoint's id.
        id: ServiceId,
        /// Why it stopped.
        reason: String,
    },
}

/// Callback type for receiving runtime events.
pub type EventCallback = Arc<dyn Fn(RouterEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure without spelling out the
/// `Arc` wrapping.
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(RouterEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invokes the callback if one is configured.
pub(crate) fn emit(callback: &Option<EventCallback>, event: RouterEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}
