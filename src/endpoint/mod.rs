//! Endpoint workers: one per configured service.
//!
//! A worker owns its network socket and two logical paths. **Ingress** reads
//! the wire, decodes into [`AudioFrame`]s via a per-service
//! [`IngressAdapter`], and enqueues on the hub with a bounded deadline.
//! **Egress** is the [`Egress`] trait, invoked by the hub dispatcher for each
//! destination; it encodes to the service's wire format and transmits
//! without ever blocking the hub.

mod discord;
mod generic;
mod usrp;
mod whotalkie;

pub use discord::DiscordLink;
pub(crate) use discord::{discord_channels, run_discord_ingress, DiscordEgress, DiscordSettings};
pub(crate) use generic::{GenericEgress, GenericIngress};
pub(crate) use usrp::{UsrpEgress, UsrpIngress};
pub(crate) use whotalkie::{WhoTalkieEgress, WhoTalkieIngress};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

use crate::config::ServiceInstance;
use crate::error::{EgressError, ProtocolError};
use crate::event::{emit, EventCallback, RouterEvent};
use crate::frame::{AudioFrame, ServiceId};
use crate::stats::{EndpointStats, HubStats};
use crate::transcode::SharedTranscoder;

/// Ingress socket read deadline; loops re-check shutdown this often.
pub(crate) const INGRESS_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-read deadline on accepted TCP connections; an idle connection is
/// closed when it expires.
pub(crate) const TCP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for handing a frame to the hub; beyond it the frame is dropped.
pub(crate) const HUB_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive buffer size; comfortably above the largest USRP packet.
pub(crate) const MAX_DATAGRAM: usize = 4096;

/// A destination for routed frames.
///
/// Implementations encode the frame to their service's wire format and
/// transmit it. `send` is called from the hub dispatcher and must not block
/// indefinitely: UDP sends are naturally prompt, channel-backed egress uses
/// a bounded queue. The shared transcoder, when present, converts between
/// the frame's format and the destination's.
#[async_trait]
pub trait Egress: Send + Sync {
    /// Delivers one frame; returns the bytes written to the wire.
    async fn send(
        &self,
        frame: &AudioFrame,
        transcoder: Option<&SharedTranscoder>,
    ) -> Result<u64, EgressError>;
}

/// A running endpoint: its validated configuration, counters, and optional
/// egress. Shared read-only between the hub and the endpoint's own tasks.
pub struct Endpoint {
    /// The validated service configuration.
    pub instance: ServiceInstance,
    /// The service id as a cheap-clone handle.
    pub id: ServiceId,
    /// The service name as a cheap-clone handle.
    pub name: Arc<str>,
    /// Per-endpoint counters.
    pub stats: EndpointStats,
    /// Where routed frames go, when a remote is configured.
    pub egress: Option<Box<dyn Egress>>,
}

impl Endpoint {
    /// Creates an endpoint from a validated instance and optional egress.
    pub fn new(instance: ServiceInstance, egress: Option<Box<dyn Egress>>) -> Self {
        let id = ServiceId::new(instance.id.as_str());
        let name: Arc<str> = Arc::from(instance.name.as_str());
        Self {
            instance,
            id,
            name,
            stats: EndpointStats::default(),
            egress,
        }
    }
}

/// The endpoint registry: read-heavy, written only at start/stop.
#[derive(Default)]
pub(crate) struct EndpointRegistry {
    inner: RwLock<HashMap<ServiceId, Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub(crate) fn insert(&self, endpoint: Arc<Endpoint>) {
        self.inner.write().insert(endpoint.id.clone(), endpoint);
    }

    pub(crate) fn get(&self, id: &ServiceId) -> Option<Arc<Endpoint>> {
        self.inner.read().get(id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Endpoint>> {
        self.inner.read().values().cloned().collect()
    }

    pub(crate) fn enabled_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|endpoint| endpoint.instance.enabled)
            .count()
    }
}

/// Everything an ingress loop needs besides its socket.
#[derive(Clone)]
pub(crate) struct IngressContext {
    pub hub_tx: mpsc::Sender<AudioFrame>,
    pub hub_stats: Arc<HubStats>,
    pub events: Option<EventCallback>,
    pub shutdown: watch::Receiver<bool>,
}

/// What a service adaptor made of one inbound packet.
pub(crate) enum Decoded {
    /// An audio frame bound for the hub.
    Frame(AudioFrame),
    /// A DTMF control digit; surfaced as an event, never routed as audio.
    Dtmf { digit: u8, talkgroup: u32 },
    /// A packet this service ignores (pings, unsupported types).
    Ignored,
}

/// Per-service wire-to-frame translation. Stateful: adaptors track
/// last-heard callsigns and local sequence counters.
pub(crate) trait IngressAdapter: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Decoded, ProtocolError>;
}

/// Builds a fresh adaptor; TCP ingress needs one per accepted connection.
pub(crate) type AdapterFactory = Arc<dyn Fn() -> Box<dyn IngressAdapter> + Send + Sync>;

/// UDP ingress: blocking reads with a deadline, cancellation between reads.
pub(crate) async fn run_udp_ingress(
    socket: UdpSocket,
    make_adapter: AdapterFactory,
    endpoint: Arc<Endpoint>,
    mut cx: IngressContext,
) {
    let mut adapter = make_adapter();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if *cx.shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = cx.shutdown.changed() => break,
            read = tokio::time::timeout(INGRESS_READ_TIMEOUT, socket.recv_from(&mut buf)) => {
                match read {
                    // Deadline: loop around to re-check cancellation.
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        tracing::warn!(endpoint = %endpoint.id, %err, "udp read error");
                        endpoint.stats.record_error();
                    }
                    Ok(Ok((len, _peer))) => {
                        handle_packet(&buf[..len], adapter.as_mut(), &endpoint, &cx).await;
                    }
                }
            }
        }
    }
    tracing::debug!(endpoint = %endpoint.id, "udp ingress stopped");
}

/// TCP ingress: accept loop with a deadline, one handler task per
/// connection.
pub(crate) async fn run_tcp_ingress(
    listener: TcpListener,
    make_adapter: AdapterFactory,
    endpoint: Arc<Endpoint>,
    mut cx: IngressContext,
) {
    loop {
        if *cx.shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = cx.shutdown.changed() => break,
            accepted = tokio::time::timeout(INGRESS_READ_TIMEOUT, listener.accept()) => {
                match accepted {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        tracing::warn!(endpoint = %endpoint.id, %err, "tcp accept error");
                        endpoint.stats.record_error();
                    }
                    Ok(Ok((stream, peer))) => {
                        tracing::debug!(endpoint = %endpoint.id, %peer, "tcp connection accepted");
                        tokio::spawn(run_tcp_connection(
                            stream,
                            make_adapter(),
                            endpoint.clone(),
                            cx.clone(),
                        ));
                    }
                }
            }
        }
    }
    tracing::debug!(endpoint = %endpoint.id, "tcp ingress stopped");
}

async fn run_tcp_connection(
    mut stream: TcpStream,
    mut adapter: Box<dyn IngressAdapter>,
    endpoint: Arc<Endpoint>,
    mut cx: IngressContext,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cx.shutdown.changed() => break,
            read = tokio::time::timeout(TCP_READ_TIMEOUT, stream.read(&mut buf)) => {
                match read {
                    // Idle past the payload deadline: drop the connection.
                    Err(_) => break,
                    Ok(Err(err)) => {
                        tracing::debug!(endpoint = %endpoint.id, %err, "tcp read error");
                        endpoint.stats.record_error();
                        break;
                    }
                    Ok(Ok(0)) => break,
                    Ok(Ok(len)) => {
                        handle_packet(&buf[..len], adapter.as_mut(), &endpoint, &cx).await;
                    }
                }
            }
        }
    }
}

/// Decodes one inbound packet and routes the outcome: frames to the hub,
/// DTMF to the event callback, errors to counters.
pub(crate) async fn handle_packet(
    data: &[u8],
    adapter: &mut dyn IngressAdapter,
    endpoint: &Endpoint,
    cx: &IngressContext,
) {
    endpoint.stats.record_in(data.len());
    match adapter.decode(data) {
        Ok(Decoded::Frame(frame)) => enqueue_frame(frame, endpoint, cx).await,
        Ok(Decoded::Dtmf { digit, talkgroup }) => {
            tracing::debug!(endpoint = %endpoint.id, digit = %(digit as char), "dtmf received");
            emit(
                &cx.events,
                RouterEvent::DtmfReceived {
                    source_id: endpoint.id.clone(),
                    digit: digit as char,
                    talkgroup,
                },
            );
        }
        Ok(Decoded::Ignored) => {}
        Err(err) => {
            tracing::info!(endpoint = %endpoint.id, %err, "dropping undecodable packet");
            endpoint.stats.record_error();
            emit(
                &cx.events,
                RouterEvent::DecodeError {
                    source_id: endpoint.id.clone(),
                    error: err.to_string(),
                },
            );
        }
    }
}

/// Hands a frame to the hub within the enqueue deadline. A full hub is a
/// counted drop, never fatal, and never blocks the network read loop for
/// longer than the deadline.
pub(crate) async fn enqueue_frame(frame: AudioFrame, endpoint: &Endpoint, cx: &IngressContext) {
    if !endpoint.instance.routing.can_send {
        return;
    }
    let send = cx.hub_tx.send_timeout(frame, HUB_ENQUEUE_TIMEOUT);
    if send.await.is_err() {
        tracing::warn!(endpoint = %endpoint.id, "hub full, dropping frame");
        endpoint.stats.record_error();
        cx.hub_stats
            .dropped_messages
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        emit(
            &cx.events,
            RouterEvent::HubBackpressure {
                source_id: endpoint.id.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    fn test_endpoint(id: &str) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            ServiceInstance::new(id, ServiceType::Generic),
            None,
        ))
    }

    fn test_context(
        capacity: usize,
    ) -> (IngressContext, mpsc::Receiver<AudioFrame>, watch::Sender<bool>) {
        let (hub_tx, hub_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            IngressContext {
                hub_tx,
                hub_stats: Arc::new(HubStats::new()),
                events: None,
                shutdown: shutdown_rx,
            },
            hub_rx,
            shutdown_tx,
        )
    }

    fn test_frame(endpoint: &Endpoint) -> AudioFrame {
        AudioFrame::new(
            endpoint.id.clone(),
            endpoint.instance.service_type,
            endpoint.name.clone(),
            Bytes::from_static(&[0u8; 4]),
            crate::frame::AudioFormat::Pcm,
            8000,
            1,
        )
    }

    #[tokio::test]
    async fn test_enqueue_delivers_frame() {
        let endpoint = test_endpoint("gen_1");
        let (cx, mut hub_rx, _shutdown) = test_context(4);

        enqueue_frame(test_frame(&endpoint), &endpoint, &cx).await;

        let frame = hub_rx.recv().await.unwrap();
        assert_eq!(frame.source_id, endpoint.id);
        assert_eq!(cx.hub_stats.dropped_messages.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_backpressure_drops() {
        let endpoint = test_endpoint("gen_1");
        let (cx, _hub_rx, _shutdown) = test_context(1);

        // Fill the single-slot channel; the second frame must drop after the
        // enqueue deadline.
        enqueue_frame(test_frame(&endpoint), &endpoint, &cx).await;
        enqueue_frame(test_frame(&endpoint), &endpoint, &cx).await;

        assert_eq!(cx.hub_stats.dropped_messages.load(Ordering::Relaxed), 1);
        assert_eq!(endpoint.stats.errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_enqueue_respects_can_send() {
        let mut instance = ServiceInstance::new("muted", ServiceType::Generic);
        instance.routing.can_send = false;
        let endpoint = Arc::new(Endpoint::new(instance, None));
        let (cx, mut hub_rx, _shutdown) = test_context(4);

        enqueue_frame(test_frame(&endpoint), &endpoint, &cx).await;
        assert!(hub_rx.try_recv().is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = EndpointRegistry::default();
        let endpoint = test_endpoint("gen_1");
        registry.insert(endpoint.clone());

        assert!(registry.get(&ServiceId::new("gen_1")).is_some());
        assert!(registry.get(&ServiceId::new("missing")).is_none());
        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.enabled_count(), 1);
    }
}
