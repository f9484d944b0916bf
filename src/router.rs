//! Router lifecycle: validate, bind, spawn, drain, stop.
//!
//! Startup order follows the shape of the system: validate the config,
//! build the hub channel, construct the transcode façade (soft-fail), start
//! the hub dispatcher, then each enabled endpoint worker and the
//! housekeeping ticker. Shutdown flips one shared `watch` signal; every
//! loop selects on it, so the whole router winds down within one ingress
//! deadline.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{RouterConfig, ServiceInstance, ServiceType, TransportProtocol};
use crate::endpoint::{
    run_discord_ingress, run_tcp_ingress, run_udp_ingress, AdapterFactory, DiscordEgress,
    DiscordLink, DiscordSettings, Egress, Endpoint, EndpointRegistry, GenericEgress,
    GenericIngress, IngressAdapter, IngressContext, UsrpEgress, UsrpIngress, WhoTalkieEgress,
    WhoTalkieIngress,
};
use crate::error::RouterError;
use crate::event::{emit, EventCallback, RouterEvent};
use crate::frame::{AudioFrame, ServiceId};
use crate::hub::{Hub, TransmissionTable};
use crate::stats::{EndpointSnapshot, HubStats, StatsSnapshot};
use crate::transcode::{create_transcoder, SharedTranscoder};

/// Housekeeping cadence: refresh gauges, sweep expired transmissions.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// How long `stop()` waits for each task before giving up on it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bitrate handed to the transcode façade.
const TRANSCODE_BITRATE: u32 = 64_000;

/// Capacity of each Discord link channel.
const DISCORD_LINK_CAPACITY: usize = 100;

/// Entry point: `Router::builder(config).start().await`.
pub struct Router;

impl Router {
    /// Starts configuring a router.
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder {
            config,
            events: None,
        }
    }

    /// Starts a router with no event callback.
    pub async fn start(config: RouterConfig) -> Result<RouterHandle, RouterError> {
        Self::builder(config).start().await
    }
}

/// Configures and starts a [`RouterHandle`].
pub struct RouterBuilder {
    config: RouterConfig,
    events: Option<EventCallback>,
}

impl RouterBuilder {
    /// Registers a callback for [`RouterEvent`]s.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(RouterEvent) + Send + Sync + 'static,
    {
        self.events = Some(Arc::new(callback));
        self
    }

    /// Validates the configuration and brings the router up.
    pub async fn start(self) -> Result<RouterHandle, RouterError> {
        let RouterBuilder { mut config, events } = self;
        config.validate()?;

        let (hub_tx, hub_rx) = mpsc::channel::<AudioFrame>(config.buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // The façade is optional equipment: failure to build it disables
        // conversion but never blocks startup.
        let transcoder: Option<Arc<SharedTranscoder>> = if config.enable_conversion {
            match create_transcoder(config.default_format, TRANSCODE_BITRATE) {
                Ok(transcoder) => Some(Arc::new(Mutex::new(transcoder))),
                Err(err) => {
                    tracing::warn!(%err, "transcoder unavailable, conversion disabled");
                    None
                }
            }
        } else {
            None
        };

        let registry = Arc::new(EndpointRegistry::default());
        let stats = Arc::new(HubStats::new());
        let transmissions = Arc::new(Mutex::new(TransmissionTable::new(
            config.max_concurrent_tx,
            Duration::from_secs(config.tx_timeout_seconds),
            config.enable_priority_rules,
        )));

        let hub = Hub {
            registry: registry.clone(),
            stats: stats.clone(),
            transmissions: transmissions.clone(),
            transcoder: transcoder.clone(),
            default_routing: config.default_routing,
            events: events.clone(),
        };
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(hub.run(hub_rx, shutdown_rx.clone())));

        let mut discord_links: HashMap<ServiceId, DiscordLink> = HashMap::new();
        for instance in config.services.iter().filter(|s| s.enabled).cloned() {
            let cx = IngressContext {
                hub_tx: hub_tx.clone(),
                hub_stats: stats.clone(),
                events: events.clone(),
                shutdown: shutdown_rx.clone(),
            };
            start_service(instance, &registry, cx, &mut tasks, &mut discord_links).await?;
        }
        stats
            .active_services
            .store(registry.enabled_count(), Ordering::Relaxed);

        tasks.push(tokio::spawn(run_housekeeping(
            registry.clone(),
            stats.clone(),
            transmissions.clone(),
            shutdown_rx,
        )));

        for endpoint in registry.all() {
            tracing::info!(
                id = %endpoint.id,
                service_type = %endpoint.instance.service_type,
                "service started"
            );
            emit(
                &events,
                RouterEvent::EndpointStarted {
                    id: endpoint.id.clone(),
                },
            );
        }

        Ok(RouterHandle {
            shutdown_tx,
            tasks,
            hub_tx,
            registry,
            stats,
            transmissions,
            transcoder,
            discord_links,
        })
    }
}

/// Binds sockets and spawns the ingress worker for one service.
async fn start_service(
    instance: ServiceInstance,
    registry: &Arc<EndpointRegistry>,
    cx: IngressContext,
    tasks: &mut Vec<JoinHandle<()>>,
    discord_links: &mut HashMap<ServiceId, DiscordLink>,
) -> Result<(), RouterError> {
    let remote = instance.network.remote_addr_port();
    let service_type = instance.service_type;

    // Discord runs over the external client's link, not its own socket.
    if service_type == ServiceType::Discord {
        let settings = DiscordSettings::from_settings(&instance.settings);
        let (link, ingest_rx, egress_tx) = crate::endpoint::discord_channels(DISCORD_LINK_CAPACITY);
        let endpoint = Arc::new(Endpoint::new(
            instance,
            Some(Box::new(DiscordEgress::new(egress_tx))),
        ));
        registry.insert(endpoint.clone());
        discord_links.insert(endpoint.id.clone(), link);
        tracing::info!(
            id = %endpoint.id,
            guild = %settings.guild_id,
            channel = %settings.channel_id,
            "discord link ready"
        );
        tasks.push(tokio::spawn(run_discord_ingress(ingest_rx, endpoint, cx)));
        return Ok(());
    }

    let egress: Option<Box<dyn Egress>> = match (&remote, service_type) {
        (None, _) => None,
        (Some(remote), ServiceType::Usrp) => Some(Box::new(UsrpEgress::new(
            bind_egress_socket().await?,
            remote.clone(),
        ))),
        (Some(remote), ServiceType::WhoTalkie) => Some(Box::new(WhoTalkieEgress::new(
            bind_egress_socket().await?,
            remote.clone(),
        ))),
        (Some(remote), ServiceType::Generic) => {
            Some(match instance.network.protocol {
                TransportProtocol::Udp => {
                    Box::new(GenericEgress::udp(bind_egress_socket().await?, remote.clone()))
                }
                TransportProtocol::Tcp => Box::new(GenericEgress::tcp(remote.clone())),
            })
        }
        (Some(_), ServiceType::Discord) => unreachable!("discord handled above"),
    };

    let listen = instance.network.listen_addr_port();
    let protocol = instance.network.protocol;
    let endpoint = Arc::new(Endpoint::new(instance, egress));
    registry.insert(endpoint.clone());

    let Some(listen) = listen else {
        return Ok(());
    };

    let make_adapter: AdapterFactory = {
        let endpoint = endpoint.clone();
        match service_type {
            ServiceType::Usrp => Arc::new(move || {
                Box::new(UsrpIngress::new(endpoint.clone())) as Box<dyn IngressAdapter>
            }),
            ServiceType::WhoTalkie => Arc::new(move || {
                Box::new(WhoTalkieIngress::new(endpoint.clone())) as Box<dyn IngressAdapter>
            }),
            ServiceType::Generic => Arc::new(move || {
                Box::new(GenericIngress::new(endpoint.clone())) as Box<dyn IngressAdapter>
            }),
            ServiceType::Discord => unreachable!("discord handled above"),
        }
    };

    match protocol {
        TransportProtocol::Udp => {
            let socket = UdpSocket::bind(&listen).await.map_err(|source| {
                RouterError::Bind {
                    addr: listen.clone(),
                    source,
                }
            })?;
            tracing::info!(id = %endpoint.id, %listen, "udp listener bound");
            tasks.push(tokio::spawn(run_udp_ingress(
                socket,
                make_adapter,
                endpoint,
                cx,
            )));
        }
        TransportProtocol::Tcp => {
            let listener = TcpListener::bind(&listen).await.map_err(|source| {
                RouterError::Bind {
                    addr: listen.clone(),
                    source,
                }
            })?;
            tracing::info!(id = %endpoint.id, %listen, "tcp listener bound");
            tasks.push(tokio::spawn(run_tcp_ingress(
                listener,
                make_adapter,
                endpoint,
                cx,
            )));
        }
    }
    Ok(())
}

/// Egress sockets bind an ephemeral local port once and `send_to` the
/// configured remote per frame.
async fn bind_egress_socket() -> Result<UdpSocket, RouterError> {
    UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|source| RouterError::Bind {
            addr: "0.0.0.0:0".to_string(),
            source,
        })
}

async fn run_housekeeping(
    registry: Arc<EndpointRegistry>,
    stats: Arc<HubStats>,
    transmissions: Arc<Mutex<TransmissionTable>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                stats
                    .active_services
                    .store(registry.enabled_count(), Ordering::Relaxed);
                let live = {
                    let mut table = transmissions.lock();
                    table.sweep_expired();
                    table.len()
                };
                stats.active_transmissions.store(live, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to a running router.
///
/// Holds the shutdown signal and every task the router spawned. Dropping
/// the handle without `stop()` aborts nothing: call
/// [`stop`](RouterHandle::stop) for a drained shutdown.
pub struct RouterHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    hub_tx: mpsc::Sender<AudioFrame>,
    registry: Arc<EndpointRegistry>,
    stats: Arc<HubStats>,
    transmissions: Arc<Mutex<TransmissionTable>>,
    transcoder: Option<Arc<SharedTranscoder>>,
    discord_links: HashMap<ServiceId, DiscordLink>,
}

impl RouterHandle {
    /// A sender for injecting frames straight into the hub, for embedders
    /// that produce frames outside any network endpoint.
    pub fn frame_sender(&self) -> mpsc::Sender<AudioFrame> {
        self.hub_tx.clone()
    }

    /// Takes the embedder's half of a Discord endpoint's link.
    pub fn take_discord_link(&mut self, id: &str) -> Option<DiscordLink> {
        self.discord_links.remove(&ServiceId::new(id))
    }

    /// Read-only snapshot for the status surface: hub counters, endpoint
    /// counters, and active transmissions with their ages.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.endpoints = self
            .registry
            .all()
            .into_iter()
            .map(|endpoint| EndpointSnapshot {
                id: endpoint.id.clone(),
                service_type: endpoint.instance.service_type,
                name: endpoint.instance.name.clone(),
                messages_in: endpoint.stats.messages_in.load(Ordering::Relaxed),
                messages_out: endpoint.stats.messages_out.load(Ordering::Relaxed),
                bytes_in: endpoint.stats.bytes_in.load(Ordering::Relaxed),
                bytes_out: endpoint.stats.bytes_out.load(Ordering::Relaxed),
                errors: endpoint.stats.errors.load(Ordering::Relaxed),
                idle_for: endpoint.stats.idle_for(),
            })
            .collect();
        snapshot.transmissions = self.transmissions.lock().snapshot();
        snapshot
    }

    /// Signals every worker, waits for them to drain, and closes the
    /// transcode façade.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        // Ingress contexts hold clones of the hub sender; dropping ours lets
        // the channel close once the workers exit.
        drop(self.hub_tx);

        for task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("worker did not stop within timeout");
            }
        }
        if let Some(transcoder) = &self.transcoder {
            transcoder.lock().close();
        }
        tracing::info!("router stopped");
    }
}
