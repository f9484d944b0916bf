//! Generic endpoint adaptor: raw audio bytes over UDP or TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use crate::endpoint::{Decoded, Egress, Endpoint, IngressAdapter};
use crate::error::{EgressError, ProtocolError};
use crate::frame::AudioFrame;
use crate::transcode::SharedTranscoder;

/// Bound on establishing the lazy TCP connection, so a dead remote cannot
/// stall the hub dispatcher.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Ingress: bytes pass through as the configured format, assumed to belong
/// to an active transmission.
pub(crate) struct GenericIngress {
    endpoint: Arc<Endpoint>,
    seq: u32,
}

impl GenericIngress {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint, seq: 0 }
    }
}

impl IngressAdapter for GenericIngress {
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

enum Transport {
    Udp {
        socket: UdpSocket,
        remote: String,
    },
    /// Connection is established lazily on first send and re-established
    /// after any write error.
    Tcp {
        remote: String,
        stream: Mutex<Option<TcpStream>>,
    },
}

/// Egress: payload bytes as-is over the configured transport.
pub(crate) struct GenericEgress {
    transport: Transport,
}

impl GenericEgress {
    pub(crate) fn udp(socket: UdpSocket, remote: String) -> Self {
        Self {
            transport: Transport::Udp { socket, remote },
        }
    }

    pub(crate) fn tcp(remote: String) -> Self {
        Self {
            transport: Transport::Tcp {
                remote,
                stream: Mutex::new(None),
            },
        }
    }
}

#[async_trait]
impl Egress for GenericEgress {
    async fn send(
        &self,
        frame: &AudioFrame,
        _transcoder: Option<&SharedTranscoder>,
    ) -> Result<u64, EgressError> {
        match &self.transport {
            Transport::Udp { socket, remote } => {
                socket.send_to(&frame.payload, remote.as_str()).await?;
                Ok(frame.payload.len() as u64)
            }
            Transport::Tcp { remote, stream } => {
                let mut guard = stream.lock().await;
                if guard.is_none() {
                    let connect = TcpStream::connect(remote.as_str());
                    let connected = tokio::time::timeout(TCP_CONNECT_TIMEOUT, connect)
                        .await
                        .map_err(|_| {
                            EgressError::Network(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "tcp connect timed out",
                            ))
                        })??;
                    *guard = Some(connected);
                }
                // Write through the cached connection; drop it on failure so
                // the next frame reconnects.
                let Some(mut conn) = guard.take() else {
                    return Err(EgressError::NotConfigured);
                };
                match conn.write_all(&frame.payload).await {
                    Ok(()) => {
                        *guard = Some(conn);
                        Ok(frame.payload.len() as u64)
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceInstance, ServiceType};
    use crate::frame::AudioFormat;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn generic_endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            ServiceInstance::new("gen_1", ServiceType::Generic),
            None,
        ))
    }

    fn test_frame(endpoint: &Endpoint, payload: &'static [u8]) -> AudioFrame {
        AudioFrame::new(
            endpoint.id.clone(),
            ServiceType::Generic,
            endpoint.name.clone(),
            Bytes::from_static(payload),
            AudioFormat::Pcm,
            8000,
            1,
        )
    }

    #[test]
    fn test_ingress_wraps_profile_format() {
        let mut adapter = GenericIngress::new(generic_endpoint());
        let Decoded::Frame(frame) = adapter.decode(&[1, 2, 3, 4]).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.format, AudioFormat::Pcm);
        assert_eq!(frame.sample_rate, 8000);
        assert!(frame.ptt_active);
        assert_eq!(frame.sequence, 1);
    }

    #[tokio::test]
    async fn test_udp_egress_sends_raw_bytes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap().to_string();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let egress = GenericEgress::udp(socket, remote);

        let endpoint = generic_endpoint();
        let sent = egress
            .send(&test_frame(&endpoint, &[0xCA, 0xFE]), None)
            .await
            .unwrap();
        assert_eq!(sent, 2);

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0xCA, 0xFE]);
    }

    #[tokio::test]
    async fn test_tcp_egress_connects_lazily_and_reuses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap().to_string();
        let egress = GenericEgress::tcp(remote);

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8];
            conn.read_exact(&mut buf[..4]).await.unwrap();
            conn.read_exact(&mut buf[4..]).await.unwrap();
            buf
        });

        let endpoint = generic_endpoint();
        egress
            .send(&test_frame(&endpoint, &[1, 2, 3, 4]), None)
            .await
            .unwrap();
        // Second send reuses the same connection: the server only accepts
        // once.
        egress
            .send(&test_frame(&endpoint, &[5, 6, 7, 8]), None)
            .await
            .unwrap();

        assert_eq!(server.await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_tcp_egress_reports_dead_remote() {
        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap().to_string();
        drop(listener);

        let egress = GenericEgress::tcp(remote);
        let endpoint = generic_endpoint();
        assert!(matches!(
            egress.send(&test_frame(&endpoint, &[0]), None).await,
            Err(EgressError::Network(_))
        ));
    }
}
