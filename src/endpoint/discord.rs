//! Discord endpoint adaptor.
//!
//! The Discord gateway client is an external collaborator: this crate only
//! sees the pair of bounded channels in [`DiscordLink`]. The client pushes
//! 48 kHz stereo PCM in; routed frames come back out, upsampled to the same
//! profile. The wire carries no PTT flag, so ingress gates on RMS level
//! (threshold per endpoint; true voice-activity detection is out of scope).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::endpoint::{enqueue_frame, Egress, Endpoint, IngressContext};
use crate::error::EgressError;
use crate::format;
use crate::frame::{AudioFormat, AudioFrame};
use crate::transcode::SharedTranscoder;

/// 20 ms of 48 kHz stereo PCM: the block size ingress gates and enqueues.
const INGEST_BLOCK_SAMPLES: usize = 1920;

/// Typed view of a Discord service's `settings` bag.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct DiscordSettings {
    /// Guild the external client joins.
    #[serde(default)]
    pub guild_id: String,
    /// Voice channel the external client joins.
    #[serde(default)]
    pub channel_id: String,
}

impl DiscordSettings {
    /// Parses the opaque settings map; missing keys become empty strings,
    /// unknown keys are ignored.
    pub(crate) fn from_settings(settings: &serde_json::Map<String, serde_json::Value>) -> Self {
        serde_json::from_value(serde_json::Value::Object(settings.clone())).unwrap_or_default()
    }
}

/// The embedder's side of a Discord endpoint.
///
/// Obtained from [`RouterHandle::take_discord_link`]; the external gateway
/// client feeds captured voice in with [`send_pcm`](Self::send_pcm) and
/// plays out whatever [`recv`](Self::recv) yields.
///
/// [`RouterHandle::take_discord_link`]: crate::RouterHandle::take_discord_link
pub struct DiscordLink {
    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: mpsc::Receiver<AudioFrame>,
}

impl DiscordLink {
    /// Injects 48 kHz stereo little-endian PCM captured from Discord.
    pub async fn send_pcm(&self, pcm: Bytes) -> Result<(), EgressError> {
        self.audio_tx
            .send(pcm)
            .await
            .map_err(|_| EgressError::ChannelClosed)
    }

    /// Receives the next frame routed to this Discord endpoint, already in
    /// the endpoint's 48 kHz stereo PCM profile.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.audio_rx.recv().await
    }
}

/// Builds the link and the router-side channel halves.
pub(crate) fn discord_channels(
    capacity: usize,
) -> (DiscordLink, mpsc::Receiver<Bytes>, mpsc::Sender<AudioFrame>) {
    let (audio_tx, ingest_rx) = mpsc::channel(capacity);
    let (egress_tx, audio_rx) = mpsc::channel(capacity);
    (
        DiscordLink { audio_tx, audio_rx },
        ingest_rx,
        egress_tx,
    )
}

/// Ingress: chop the client's PCM into 20 ms blocks, gate on RMS level,
/// wrap what passes as active-transmission frames.
pub(crate) async fn run_discord_ingress(
    mut ingest_rx: mpsc::Receiver<Bytes>,
    endpoint: Arc<Endpoint>,
    mut cx: IngressContext,
) {
    let threshold = endpoint.instance.vad_threshold;
    let mut pending: Vec<i16> = Vec::with_capacity(INGEST_BLOCK_SAMPLES * 2);
    let mut seq: u32 = 0;

    loop {
        let pcm = tokio::select! {
            _ = cx.shutdown.changed() => break,
            received = ingest_rx.recv() => match received {
                Some(pcm) => pcm,
                None => break,
            },
        };
        endpoint.stats.record_in(pcm.len());
        pending.extend(format::bytes_to_samples(&pcm));

        while pending.len() >= INGEST_BLOCK_SAMPLES {
            let block: Vec<i16> = pending.drain(..INGEST_BLOCK_SAMPLES).collect();
            if format::rms_level(&block) < threshold {
                continue;
            }
            seq = seq.wrapping_add(1);
            let instance = &endpoint.instance;
            let mut frame = AudioFrame::new(
                endpoint.id.clone(),
                instance.service_type,
                endpoint.name.clone(),
                Bytes::from(format::samples_to_bytes(&block)),
                AudioFormat::Pcm,
                instance.audio.sample_rate,
                instance.audio.channels,
            );
            frame.sequence = seq;
            frame.ptt_active = true;
            frame.priority = instance.routing.priority;
            enqueue_frame(frame, &endpoint, &cx).await;
        }
    }
    tracing::debug!(endpoint = %endpoint.id, "discord ingress stopped");
}

/// Egress: hook into the external client. Radio-rate PCM is upsampled to
/// the Discord profile; delivery is a non-blocking push onto the bounded
/// link queue.
pub(crate) struct DiscordEgress {
    egress_tx: mpsc::Sender<AudioFrame>,
}

impl DiscordEgress {
    pub(crate) fn new(egress_tx: mpsc::Sender<AudioFrame>) -> Self {
        Self { egress_tx }
    }
}

#[async_trait]
impl Egress for DiscordEgress {
    async fn send(
        &self,
        frame: &AudioFrame,
        _transcoder: Option<&SharedTranscoder>,
    ) -> Result<u64, EgressError> {
        let out = if frame.format == AudioFormat::Pcm && frame.sample_rate == 8000 {
            let mono = format::bytes_to_samples(&frame.payload);
            let stereo = format::upsample_8k_to_48k_stereo(&mono);
            let mut out = frame.clone();
            out.payload = Bytes::from(format::samples_to_bytes(&stereo));
            out.sample_rate = 48_000;
            out.channels = 2;
            out
        } else {
            frame.clone()
        };

        let bytes = out.payload.len() as u64;
        match self.egress_tx.try_send(out) {
            Ok(()) => Ok(bytes),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EgressError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EgressError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceInstance, ServiceType};
    use crate::stats::HubStats;
    use tokio::sync::watch;

    fn discord_endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            ServiceInstance::new("disc_1", ServiceType::Discord),
            None,
        ))
    }

    fn ingress_context(
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

    #[test]
    fn test_settings_parse() {
        let mut map = serde_json::Map::new();
        map.insert("guild_id".into(), serde_json::json!("123"));
        map.insert("channel_id".into(), serde_json::json!("456"));
        map.insert("bot_token".into(), serde_json::json!("ignored-here"));

        let settings = DiscordSettings::from_settings(&map);
        assert_eq!(settings.guild_id, "123");
        assert_eq!(settings.channel_id, "456");
    }

    #[test]
    fn test_settings_missing_keys_default() {
        let settings = DiscordSettings::from_settings(&serde_json::Map::new());
        assert!(settings.guild_id.is_empty());
    }

    #[tokio::test]
    async fn test_ingress_gates_silence_and_passes_voice() {
        let endpoint = discord_endpoint();
        let (cx, mut hub_rx, _shutdown) = ingress_context(16);
        let (link, ingest_rx, _egress_tx) = discord_channels(16);

        let worker = tokio::spawn(run_discord_ingress(ingest_rx, endpoint.clone(), cx));

        // One block of silence, then one loud block.
        let silence = vec![0i16; INGEST_BLOCK_SAMPLES];
        link.send_pcm(Bytes::from(format::samples_to_bytes(&silence)))
            .await
            .unwrap();
        let loud: Vec<i16> = (0..INGEST_BLOCK_SAMPLES)
            .map(|i| if i % 2 == 0 { 9000 } else { -9000 })
            .collect();
        link.send_pcm(Bytes::from(format::samples_to_bytes(&loud)))
            .await
            .unwrap();

        let frame = hub_rx.recv().await.unwrap();
        assert_eq!(frame.source_id.as_str(), "disc_1");
        assert_eq!(frame.sample_rate, 48_000);
        assert_eq!(frame.channels, 2);
        assert!(frame.ptt_active);
        // The silent block never produced a frame.
        assert!(hub_rx.try_recv().is_err());

        drop(link);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_ingress_accumulates_partial_blocks() {
        let endpoint = discord_endpoint();
        let (cx, mut hub_rx, _shutdown) = ingress_context(16);
        let (link, ingest_rx, _egress_tx) = discord_channels(16);

        let worker = tokio::spawn(run_discord_ingress(ingest_rx, endpoint.clone(), cx));

        // Two half blocks of loud audio complete one 20 ms block.
        let half: Vec<i16> = (0..INGEST_BLOCK_SAMPLES / 2)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();
        let bytes = Bytes::from(format::samples_to_bytes(&half));
        link.send_pcm(bytes.clone()).await.unwrap();
        link.send_pcm(bytes).await.unwrap();

        let frame = hub_rx.recv().await.unwrap();
        assert_eq!(
            frame.payload.len(),
            INGEST_BLOCK_SAMPLES * 2 // i16 -> bytes
        );

        drop(link);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_egress_upsamples_radio_pcm() {
        let (egress_tx, mut out_rx) = mpsc::channel(4);
        let egress = DiscordEgress::new(egress_tx);
        let endpoint = discord_endpoint();

        let mono: Vec<i16> = vec![1000; 160];
        let frame = AudioFrame::new(
            endpoint.id.clone(),
            ServiceType::Usrp,
            endpoint.name.clone(),
            Bytes::from(format::samples_to_bytes(&mono)),
            AudioFormat::Pcm,
            8000,
            1,
        );

        egress.send(&frame, None).await.unwrap();
        let out = out_rx.recv().await.unwrap();
        assert_eq!(out.sample_rate, 48_000);
        assert_eq!(out.channels, 2);
        assert_eq!(out.payload.len(), 160 * 6 * 2 * 2);
    }

    #[tokio::test]
    async fn test_egress_full_queue_is_reported() {
        let (egress_tx, _out_rx) = mpsc::channel(1);
        let egress = DiscordEgress::new(egress_tx);
        let endpoint = discord_endpoint();

        let frame = AudioFrame::new(
            endpoint.id.clone(),
            ServiceType::Discord,
            endpoint.name.clone(),
            Bytes::from_static(&[0, 0]),
            AudioFormat::Pcm,
            48_000,
            2,
        );
        egress.send(&frame, None).await.unwrap();
        assert!(matches!(
            egress.send(&frame, None).await,
            Err(EgressError::QueueFull)
        ));
    }
}
