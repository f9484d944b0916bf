//! The routing core: a single task drains the hub channel and fans each
//! frame out to the destinations the routing rules allow.
//!
//! Because exactly one task dispatches, per-source frame order is preserved
//! end-to-end for any given destination; no ordering is defined between
//! sources. The dispatcher never blocks on the network: every egress is
//! prompt by contract, and every per-frame failure is local to one
//! destination.

mod transmissions;

pub(crate) use transmissions::TransmissionTable;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::DefaultRouting;
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::EgressError;
use crate::event::{emit, EventCallback, RouterEvent};
use crate::frame::AudioFrame;
use crate::stats::HubStats;
use crate::transcode::SharedTranscoder;

/// The hub dispatcher and the state routing decisions consult.
pub(crate) struct Hub {
    pub registry: Arc<EndpointRegistry>,
    pub stats: Arc<HubStats>,
    pub transmissions: Arc<Mutex<TransmissionTable>>,
    pub transcoder: Option<Arc<SharedTranscoder>>,
    pub default_routing: DefaultRouting,
    pub events: Option<EventCallback>,
}

impl Hub {
    /// Drains the hub channel until shutdown or channel close.
    pub(crate) async fn run(
        self,
        mut hub_rx: mpsc::Receiver<AudioFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Route whatever is already queued before going down.
                    while let Ok(frame) = hub_rx.try_recv() {
                        self.route_frame(frame).await;
                    }
                    break;
                }
                frame = hub_rx.recv() => match frame {
                    Some(frame) => self.route_frame(frame).await,
                    None => break,
                },
            }
        }
        tracing::debug!("hub dispatcher stopped");
    }

    /// Routes one frame: admission, destination set, per-destination egress.
    pub(crate) async fn route_frame(&self, frame: AudioFrame) {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);

        let admitted = {
            let mut table = self.transmissions.lock();
            let admitted = table.admit(&frame);
            self.stats
                .active_transmissions
                .store(table.len(), Ordering::Relaxed);
            admitted
        };
        if !admitted {
            tracing::debug!(source = %frame.source_id, "transmission rejected at concurrency cap");
            self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            emit(
                &self.events,
                RouterEvent::TransmissionRejected {
                    source_id: frame.source_id.clone(),
                    priority: frame.priority,
                },
            );
            return;
        }

        let destinations = self.destinations(&frame);
        if destinations.is_empty() {
            return;
        }

        // Destinations are independent: deliver to all of them
        // concurrently. Per-source ordering still holds because only one
        // frame is in flight at a time.
        let deliveries = destinations
            .iter()
            .map(|destination| self.dispatch(&frame, destination));
        let accepted = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        if accepted > 0 {
            self.stats.routed_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Computes the destination set for a frame.
    ///
    /// A destination survives when it is enabled, can receive, is neither
    /// the source nor excluded by the frame or the source's policy, and
    /// passes the global posture plus all three type filters.
    fn destinations(&self, frame: &AudioFrame) -> Vec<Arc<Endpoint>> {
        let source = self.registry.get(&frame.source_id);
        let source_instance = source.as_ref().map(|endpoint| &endpoint.instance);

        self.registry
            .all()
            .into_iter()
            .filter(|dest| {
                let instance = &dest.instance;
                if !instance.enabled || !instance.routing.can_receive {
                    return false;
                }
                // Self-loop suppression is unconditional.
                if dest.id == frame.source_id {
                    return false;
                }
                if frame.exclude_ids.contains(&dest.id) {
                    return false;
                }
                if let Some(src) = source_instance {
                    if src
                        .routing
                        .exclude_services
                        .iter()
                        .any(|excluded| excluded == dest.id.as_str())
                    {
                        return false;
                    }
                }
                self.should_route(source_instance, instance, frame)
            })
            .collect()
    }

    fn should_route(
        &self,
        source: Option<&crate::config::ServiceInstance>,
        dest: &crate::config::ServiceInstance,
        frame: &AudioFrame,
    ) -> bool {
        match self.default_routing {
            DefaultRouting::AllToAll => {}
            // hub-only is reserved; like none it currently permits nothing.
            DefaultRouting::HubOnly | DefaultRouting::None => return false,
        }

        if let Some(source) = source {
            if !source.routing.send_to_types.is_empty()
                && !source.routing.send_to_types.contains(&dest.service_type)
            {
                return false;
            }
        }

        if !dest.routing.receive_from.is_empty() {
            match source {
                Some(source) if dest.routing.receive_from.contains(&source.service_type) => {}
                _ => return false,
            }
        }

        if !frame.route_to_types.is_empty() && !frame.route_to_types.contains(&dest.service_type) {
            return false;
        }

        true
    }

    /// Sends to one destination; returns whether it accepted the frame.
    async fn dispatch(&self, frame: &AudioFrame, destination: &Arc<Endpoint>) -> bool {
        let Some(egress) = destination.egress.as_ref() else {
            return false;
        };
        let transcoder = self.transcoder.as_deref();
        match egress.send(frame, transcoder).await {
            Ok(bytes) => {
                destination.stats.record_out(bytes as usize);
                true
            }
            // Silent non-delivery: nowhere to send, or a format this
            // destination cannot take without conversion.
            Err(EgressError::NotConfigured) | Err(EgressError::FormatMismatch { .. }) => {
                tracing::debug!(destination = %destination.id, "frame not deliverable");
                false
            }
            Err(EgressError::Transcode(err)) => {
                tracing::warn!(destination = %destination.id, %err, "transcode failed");
                self.stats.conversion_errors.fetch_add(1, Ordering::Relaxed);
                emit(
                    &self.events,
                    RouterEvent::EgressFailed {
                        destination_id: destination.id.clone(),
                        error: err.to_string(),
                    },
                );
                false
            }
            Err(err) => {
                tracing::warn!(destination = %destination.id, %err, "send failed");
                destination.stats.record_error();
                emit(
                    &self.events,
                    RouterEvent::EgressFailed {
                        destination_id: destination.id.clone(),
                        error: err.to_string(),
                    },
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceInstance, ServiceType};
    use crate::frame::{AudioFormat, ServiceId};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    /// Egress that forwards frames to an mpsc channel, like a network-less
    /// destination.
    struct ChannelEgress {
        tx: mpsc::Sender<AudioFrame>,
    }

    #[async_trait]
    impl crate::endpoint::Egress for ChannelEgress {
        async fn send(
            &self,
            frame: &AudioFrame,
            _transcoder: Option<&SharedTranscoder>,
        ) -> Result<u64, EgressError> {
            self.tx
                .send(frame.clone())
                .await
                .map_err(|_| EgressError::ChannelClosed)?;
            Ok(frame.payload.len() as u64)
        }
    }

    struct TestHub {
        hub: Hub,
        outputs: std::collections::HashMap<String, mpsc::Receiver<AudioFrame>>,
    }

    fn build_hub(services: &[(&str, ServiceType)], max_tx: usize, priority_rules: bool) -> TestHub {
        let registry = Arc::new(EndpointRegistry::default());
        let mut outputs = std::collections::HashMap::new();
        for (id, service_type) in services {
            let (tx, rx) = mpsc::channel(64);
            let instance = ServiceInstance::new(*id, *service_type);
            let endpoint = Arc::new(Endpoint::new(
                instance,
                Some(Box::new(ChannelEgress { tx })),
            ));
            registry.insert(endpoint);
            outputs.insert((*id).to_string(), rx);
        }
        let hub = Hub {
            registry,
            stats: Arc::new(HubStats::new()),
            transmissions: Arc::new(Mutex::new(TransmissionTable::new(
                max_tx,
                Duration::from_secs(30),
                priority_rules,
            ))),
            transcoder: None,
            default_routing: DefaultRouting::AllToAll,
            events: None,
        };
        TestHub { hub, outputs }
    }

    fn frame_from(hub: &Hub, source: &str, ptt: bool, priority: u8) -> AudioFrame {
        let endpoint = hub.registry.get(&ServiceId::new(source)).unwrap();
        let mut frame = AudioFrame::new(
            endpoint.id.clone(),
            endpoint.instance.service_type,
            endpoint.name.clone(),
            Bytes::from_static(&[0u8; 320]),
            AudioFormat::Pcm,
            8000,
            1,
        );
        frame.ptt_active = ptt;
        frame.priority = priority;
        frame
    }

    fn drain(rx: &mut mpsc::Receiver<AudioFrame>) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_fan_out_excludes_source() {
        let mut test = build_hub(
            &[
                ("usrp_1", ServiceType::Usrp),
                ("wt_1", ServiceType::WhoTalkie),
                ("disc_1", ServiceType::Discord),
            ],
            3,
            true,
        );

        let frame = frame_from(&test.hub, "usrp_1", true, 0);
        test.hub.route_frame(frame).await;

        assert_eq!(drain(test.outputs.get_mut("wt_1").unwrap()).len(), 1);
        assert_eq!(drain(test.outputs.get_mut("disc_1").unwrap()).len(), 1);
        assert!(drain(test.outputs.get_mut("usrp_1").unwrap()).is_empty());
        assert_eq!(test.hub.stats.routed_messages.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exclude_ids_honoured() {
        let mut test = build_hub(
            &[
                ("a", ServiceType::Generic),
                ("b", ServiceType::Generic),
                ("c", ServiceType::Generic),
            ],
            3,
            true,
        );

        let mut frame = frame_from(&test.hub, "a", true, 0);
        frame.exclude_ids = vec![ServiceId::new("b")];
        test.hub.route_frame(frame).await;

        assert!(drain(test.outputs.get_mut("b").unwrap()).is_empty());
        assert_eq!(drain(test.outputs.get_mut("c").unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_source_exclude_services_honoured() {
        let registry = Arc::new(EndpointRegistry::default());
        let mut outputs = std::collections::HashMap::new();

        let mut source = ServiceInstance::new("a", ServiceType::Generic);
        source.routing.exclude_services = vec!["b".to_string()];
        registry.insert(Arc::new(Endpoint::new(source, None)));

        for id in ["b", "c"] {
            let (tx, rx) = mpsc::channel(8);
            registry.insert(Arc::new(Endpoint::new(
                ServiceInstance::new(id, ServiceType::Generic),
                Some(Box::new(ChannelEgress { tx })),
            )));
            outputs.insert(id.to_string(), rx);
        }

        let hub = Hub {
            registry,
            stats: Arc::new(HubStats::new()),
            transmissions: Arc::new(Mutex::new(TransmissionTable::new(
                3,
                Duration::from_secs(30),
                true,
            ))),
            transcoder: None,
            default_routing: DefaultRouting::AllToAll,
            events: None,
        };

        let frame = frame_from(&hub, "a", true, 0);
        hub.route_frame(frame).await;

        assert!(drain(outputs.get_mut("b").unwrap()).is_empty());
        assert_eq!(drain(outputs.get_mut("c").unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_types_filter() {
        let registry = Arc::new(EndpointRegistry::default());
        let mut outputs = std::collections::HashMap::new();

        let mut source = ServiceInstance::new("usrp_1", ServiceType::Usrp);
        source.routing.send_to_types = vec![ServiceType::WhoTalkie];
        registry.insert(Arc::new(Endpoint::new(source, None)));

        for (id, service_type) in [
            ("wt_1", ServiceType::WhoTalkie),
            ("disc_1", ServiceType::Discord),
        ] {
            let (tx, rx) = mpsc::channel(8);
            registry.insert(Arc::new(Endpoint::new(
                ServiceInstance::new(id, service_type),
                Some(Box::new(ChannelEgress { tx })),
            )));
            outputs.insert(id.to_string(), rx);
        }

        let hub = Hub {
            registry,
            stats: Arc::new(HubStats::new()),
            transmissions: Arc::new(Mutex::new(TransmissionTable::new(
                3,
                Duration::from_secs(30),
                true,
            ))),
            transcoder: None,
            default_routing: DefaultRouting::AllToAll,
            events: None,
        };

        let frame = frame_from(&hub, "usrp_1", true, 0);
        hub.route_frame(frame).await;

        assert_eq!(drain(outputs.get_mut("wt_1").unwrap()).len(), 1);
        assert!(drain(outputs.get_mut("disc_1").unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_receive_from_filter() {
        let registry = Arc::new(EndpointRegistry::default());
        let mut outputs = std::collections::HashMap::new();

        registry.insert(Arc::new(Endpoint::new(
            ServiceInstance::new("disc_1", ServiceType::Discord),
            None,
        )));

        let (tx, rx) = mpsc::channel(8);
        let mut dest = ServiceInstance::new("usrp_1", ServiceType::Usrp);
        dest.routing.receive_from = vec![ServiceType::WhoTalkie];
        registry.insert(Arc::new(Endpoint::new(
            dest,
            Some(Box::new(ChannelEgress { tx })),
        )));
        outputs.insert("usrp_1".to_string(), rx);

        let hub = Hub {
            registry,
            stats: Arc::new(HubStats::new()),
            transmissions: Arc::new(Mutex::new(TransmissionTable::new(
                3,
                Duration::from_secs(30),
                true,
            ))),
            transcoder: None,
            default_routing: DefaultRouting::AllToAll,
            events: None,
        };

        // Discord is not in usrp_1's receive_from list.
        let frame = frame_from(&hub, "disc_1", true, 0);
        hub.route_frame(frame).await;
        assert!(drain(outputs.get_mut("usrp_1").unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_frame_route_to_types_filter() {
        let mut test = build_hub(
            &[
                ("a", ServiceType::Generic),
                ("wt_1", ServiceType::WhoTalkie),
                ("disc_1", ServiceType::Discord),
            ],
            3,
            true,
        );

        let mut frame = frame_from(&test.hub, "a", true, 0);
        frame.route_to_types = vec![ServiceType::Discord];
        test.hub.route_frame(frame).await;

        assert!(drain(test.outputs.get_mut("wt_1").unwrap()).is_empty());
        assert_eq!(drain(test.outputs.get_mut("disc_1").unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_routing_none_drops_everything() {
        let mut test = build_hub(
            &[("a", ServiceType::Generic), ("b", ServiceType::Generic)],
            3,
            true,
        );
        test.hub.default_routing = DefaultRouting::None;

        let frame = frame_from(&test.hub, "a", true, 0);
        test.hub.route_frame(frame).await;
        assert!(drain(test.outputs.get_mut("b").unwrap()).is_empty());
        assert_eq!(test.hub.stats.routed_messages.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_concurrency_cap_drops_third_source() {
        let mut test = build_hub(
            &[
                ("a", ServiceType::Generic),
                ("b", ServiceType::Generic),
                ("c", ServiceType::Generic),
                ("sink", ServiceType::Generic),
            ],
            2,
            false,
        );

        for source in ["a", "b", "c"] {
            let frame = frame_from(&test.hub, source, true, 0);
            test.hub.route_frame(frame).await;
        }

        let delivered = drain(test.outputs.get_mut("sink").unwrap());
        let sources: Vec<_> = delivered
            .iter()
            .map(|frame| frame.source_id.as_str().to_string())
            .collect();
        assert!(sources.contains(&"a".to_string()));
        assert!(sources.contains(&"b".to_string()));
        assert!(!sources.contains(&"c".to_string()));
        assert_eq!(test.hub.stats.dropped_messages.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_preemption_admits_both() {
        let mut test = build_hub(
            &[
                ("a", ServiceType::Generic),
                ("b", ServiceType::Generic),
                ("sink", ServiceType::Generic),
            ],
            1,
            true,
        );

        let frame = frame_from(&test.hub, "a", true, 3);
        test.hub.route_frame(frame).await;
        let frame = frame_from(&test.hub, "b", true, 7);
        test.hub.route_frame(frame).await;

        let delivered = drain(test.outputs.get_mut("sink").unwrap());
        assert_eq!(delivered.len(), 2);
        assert_eq!(test.hub.stats.dropped_messages.load(Ordering::Relaxed), 0);
        assert_eq!(
            test.hub.stats.active_transmissions.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_per_source_ordering_preserved() {
        let mut test = build_hub(
            &[("a", ServiceType::Generic), ("sink", ServiceType::Generic)],
            3,
            true,
        );

        for seq in 1..=5u32 {
            let mut frame = frame_from(&test.hub, "a", true, 0);
            frame.sequence = seq;
            test.hub.route_frame(frame).await;
        }

        let delivered = drain(test.outputs.get_mut("sink").unwrap());
        let sequences: Vec<u32> = delivered.iter().map(|frame| frame.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_no_accepting_destination_counts_dropped() {
        // Destination exists but has no egress: the frame goes nowhere.
        let registry = Arc::new(EndpointRegistry::default());
        registry.insert(Arc::new(Endpoint::new(
            ServiceInstance::new("a", ServiceType::Generic),
            None,
        )));
        registry.insert(Arc::new(Endpoint::new(
            ServiceInstance::new("b", ServiceType::Generic),
            None,
        )));

        let hub = Hub {
            registry,
            stats: Arc::new(HubStats::new()),
            transmissions: Arc::new(Mutex::new(TransmissionTable::new(
                3,
                Duration::from_secs(30),
                true,
            ))),
            transcoder: None,
            default_routing: DefaultRouting::AllToAll,
            events: None,
        };

        let frame = frame_from(&hub, "a", true, 0);
        hub.route_frame(frame).await;
        assert_eq!(hub.stats.routed_messages.load(Ordering::Relaxed), 0);
        assert_eq!(hub.stats.dropped_messages.load(Ordering::Relaxed), 1);
    }
}
