//! WhoTalkie endpoint adaptor: Opus packets over UDP.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::endpoint::{Decoded, Egress, Endpoint, IngressAdapter};
use crate::error::{EgressError, ProtocolError};
use crate::format;
use crate::frame::{AudioFormat, AudioFrame};
use crate::transcode::SharedTranscoder;

/// Ingress: every datagram is one Opus packet belonging to an active
/// transmission. The WhoTalkie wire carries no PTT flag, so `ptt_active` is
/// always set; silence suppression happens sender-side.
pub(crate) struct WhoTalkieIngress {
    endpoint: Arc<Endpoint>,
    seq: u32,
}

impl WhoTalkieIngress {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint, seq: 0 }
    }
}

impl IngressAdapter for WhoTalkieIngress {
    fn decode(&mut self, data: &[u8]) -> Result<Decoded, ProtocolError> {
        self.seq = self.seq.wrapping_add(1);
        let instance = &self.endpoint.instance;
        let mut frame = AudioFrame::new(
            self.endpoint.id.clone(),
            instance.service_type,
            self.endpoint.name.clone(),
            Bytes::copy_from_slice(data),
            instance.audio.format,
            instance.audio.sample_rate,
            instance.audio.channels,
        );
        frame.sequence = self.seq;
        frame.ptt_active = true;
        frame.priority = instance.routing.priority;
        Ok(Decoded::Frame(frame))
    }
}

/// Egress: Opus passes through; PCM is transcoded when a façade exists,
/// otherwise sent as-is and left to the far side.
pub(crate) struct WhoTalkieEgress {
    socket: UdpSocket,
    remote: String,
}

impl WhoTalkieEgress {
    pub(crate) fn new(socket: UdpSocket, remote: String) -> Self {
        Self { socket, remote }
    }

    async fn send_datagram(&self, data: &[u8]) -> Result<u64, EgressError> {
        self.socket.send_to(data, self.remote.as_str()).await?;
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl Egress for WhoTalkieEgress {
    async fn send(
        &self,
        frame: &AudioFrame,
        transcoder: Option<&SharedTranscoder>,
    ) -> Result<u64, EgressError> {
        if frame.format == AudioFormat::Pcm {
            if let Some(transcoder) = transcoder {
                // Bring wideband stereo down to the radio rate before the
                // voice encoder sees it.
                let mut samples = format::bytes_to_samples(&frame.payload);
                if frame.sample_rate == 48_000 && frame.channels == 2 {
                    samples = format::downsample_48k_stereo_to_8k(&samples)
                        .map_err(|err| EgressError::Network(std::io::Error::other(err)))?;
                }
                let packets = transcoder.lock().pcm_to_format(&samples)?;
                let mut sent = 0u64;
                for packet in packets {
                    sent += self.send_datagram(&packet).await?;
                }
                return Ok(sent);
            }
        }
        self.send_datagram(&frame.payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceInstance, ServiceType, TranscodeFormat};
    use crate::transcode::create_transcoder;
    use crate::usrp::VOICE_SAMPLES;

    fn wt_endpoint() -> Arc<Endpoint> {
        let mut instance = ServiceInstance::new("wt_1", ServiceType::WhoTalkie);
        instance.routing.priority = 3;
        Arc::new(Endpoint::new(instance, None))
    }

    #[test]
    fn test_ingress_wraps_as_opus_with_ptt() {
        let mut adapter = WhoTalkieIngress::new(wt_endpoint());
        let Decoded::Frame(frame) = adapter.decode(&[0xAA, 0xBB, 0xCC]).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.format, AudioFormat::Opus);
        assert_eq!(frame.sample_rate, 48_000);
        assert!(frame.ptt_active);
        assert_eq!(frame.priority, 3);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_ingress_sequence_increments() {
        let mut adapter = WhoTalkieIngress::new(wt_endpoint());
        let Decoded::Frame(first) = adapter.decode(&[1]).unwrap() else {
            panic!()
        };
        let Decoded::Frame(second) = adapter.decode(&[2]).unwrap() else {
            panic!()
        };
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[tokio::test]
    async fn test_egress_passes_opus_through() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap().to_string();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let egress = WhoTalkieEgress::new(socket, remote);

        let endpoint = wt_endpoint();
        let frame = AudioFrame::new(
            endpoint.id.clone(),
            ServiceType::WhoTalkie,
            endpoint.name.clone(),
            Bytes::from_static(&[9, 8, 7]),
            AudioFormat::Opus,
            48_000,
            1,
        );
        let sent = egress.send(&frame, None).await.unwrap();
        assert_eq!(sent, 3);

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[9, 8, 7]);
    }

    #[tokio::test]
    async fn test_egress_transcodes_pcm() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap().to_string();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let egress = WhoTalkieEgress::new(socket, remote);
        let transcoder: SharedTranscoder = parking_lot::Mutex::new(
            create_transcoder(TranscodeFormat::Opus, 64_000).unwrap(),
        );

        let endpoint = wt_endpoint();
        let pcm: Vec<i16> = (0..VOICE_SAMPLES)
            .map(|i| ((i as f32 * 0.3).sin() * 9000.0) as i16)
            .collect();
        let frame = AudioFrame::new(
            endpoint.id.clone(),
            ServiceType::Usrp,
            endpoint.name.clone(),
            Bytes::from(format::samples_to_bytes(&pcm)),
            AudioFormat::Pcm,
            8000,
            1,
        );

        let sent = egress.send(&frame, Some(&transcoder)).await.unwrap();
        assert!(sent > 0);

        let mut buf = [0u8; 4096];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        // Opus output, not the raw PCM we fed in.
        assert!(len < pcm.len() * 2);
    }

    #[tokio::test]
    async fn test_egress_pcm_without_transcoder_passes_through() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap().to_string();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let egress = WhoTalkieEgress::new(socket, remote);

        let endpoint = wt_endpoint();
        let frame = AudioFrame::new(
            endpoint.id.clone(),
            ServiceType::Generic,
            endpoint.name.clone(),
            Bytes::from_static(&[1, 0, 2, 0]),
            AudioFormat::Pcm,
            8000,
            1,
        );
        let sent = egress.send(&frame, None).await.unwrap();
        assert_eq!(sent, 4);
    }
}
