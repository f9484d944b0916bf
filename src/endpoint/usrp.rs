//! USRP (AllStarLink) endpoint adaptor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::endpoint::{Decoded, Egress, Endpoint, IngressAdapter};
use crate::error::{EgressError, ProtocolError};
use crate::format;
use crate::frame::{AudioFormat, AudioFrame};
use crate::transcode::SharedTranscoder;
use crate::usrp::{
    self, DtmfFrame, PacketType, TlvFrame, VoiceFrame, HEADER_SIZE, VOICE_PAYLOAD_SIZE,
};

/// Ingress: peeks the packet type and routes to the right decoder.
///
/// VOICE becomes a PCM [`AudioFrame`] (the wire payload already is
/// little-endian PCM, so it is reused without repacking). DTMF surfaces as a
/// control event. TLV `SET_INFO` updates the last-heard callsign, attached
/// to subsequent voice frames. Everything else is ignored.
pub(crate) struct UsrpIngress {
    endpoint: Arc<Endpoint>,
    last_callsign: Option<String>,
}

impl UsrpIngress {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            last_callsign: None,
        }
    }
}

impl IngressAdapter for UsrpIngress {
    fn decode(&mut self, data: &[u8]) -> Result<Decoded, ProtocolError> {
        match usrp::peek_type(data)? {
            PacketType::Voice => {
                let voice = VoiceFrame::decode(data)?;
                // The voice payload on the wire is exactly the little-endian
                // PCM the hub carries; copy the slice once, straight into
                // the frame.
                let payload =
                    Bytes::copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + VOICE_PAYLOAD_SIZE]);
                let instance = &self.endpoint.instance;
                let mut frame = AudioFrame::new(
                    self.endpoint.id.clone(),
                    instance.service_type,
                    self.endpoint.name.clone(),
                    payload,
                    AudioFormat::Pcm,
                    instance.audio.sample_rate,
                    instance.audio.channels,
                );
                frame.sequence = voice.header.seq;
                frame.ptt_active = voice.header.is_ptt();
                frame.talkgroup = voice.header.talkgroup;
                frame.callsign = self.last_callsign.clone();
                frame.priority = instance.routing.priority;
                Ok(Decoded::Frame(frame))
            }
            PacketType::Dtmf => {
                let dtmf = DtmfFrame::decode(data)?;
                Ok(Decoded::Dtmf {
                    digit: dtmf.digit,
                    talkgroup: dtmf.header.talkgroup,
                })
            }
            PacketType::Tlv => {
                let tlv = TlvFrame::decode(data)?;
                if let Some(callsign) = tlv.callsign() {
                    tracing::debug!(endpoint = %self.endpoint.id, %callsign, "callsign update");
                    self.last_callsign = Some(callsign);
                }
                Ok(Decoded::Ignored)
            }
            // Pings keep NAT bindings warm; µ-law/ADPCM ingest is not wired.
            PacketType::Ping
            | PacketType::Text
            | PacketType::VoiceUlaw
            | PacketType::VoiceAdpcm => Ok(Decoded::Ignored),
        }
    }
}

/// Egress: builds VOICE packets and sends them to the configured remote.
///
/// Sequence numbers come from this sender's own counter, not the source's:
/// several sources may fan into one remote, and the remote only requires
/// per-sender monotonicity.
pub(crate) struct UsrpEgress {
    socket: UdpSocket,
    remote: String,
    seq: AtomicU32,
}

impl UsrpEgress {
    pub(crate) fn new(socket: UdpSocket, remote: String) -> Self {
        Self {
            socket,
            remote,
            seq: AtomicU32::new(0),
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Builds one VOICE packet from up to 320 payload bytes. Short payloads
    /// zero-fill, long payloads truncate.
    fn voice_packet(&self, frame: &AudioFrame, pcm: &[u8]) -> Vec<u8> {
        let mut voice = VoiceFrame::new(self.next_seq());
        voice.header.set_ptt(frame.ptt_active);
        voice.header.talkgroup = frame.talkgroup;
        for (sample, bytes) in voice.audio.iter_mut().zip(pcm.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        voice.encode()
    }

    async fn send_packet(&self, packet: &[u8]) -> Result<u64, EgressError> {
        self.socket.send_to(packet, self.remote.as_str()).await?;
        Ok(packet.len() as u64)
    }
}

#[async_trait]
impl Egress for UsrpEgress {
    async fn send(
        &self,
        frame: &AudioFrame,
        transcoder: Option<&SharedTranscoder>,
    ) -> Result<u64, EgressError> {
        match frame.format {
            AudioFormat::Pcm => {
                // Wideband stereo sources (Discord) come down to the radio
                // rate first; 8 kHz mono passes straight through.
                let pcm: Bytes = if frame.sample_rate == 48_000 && frame.channels == 2 {
                    let samples = format::bytes_to_samples(&frame.payload);
                    let mono = format::downsample_48k_stereo_to_8k(&samples)
                        .map_err(|err| EgressError::Network(std::io::Error::other(err)))?;
                    Bytes::from(format::samples_to_bytes(&mono))
                } else {
                    frame.payload.clone()
                };

                // One VOICE frame per send: short payloads zero-fill, long
                // payloads truncate at 320 bytes.
                let block = &pcm[..pcm.len().min(VOICE_PAYLOAD_SIZE)];
                self.send_packet(&self.voice_packet(frame, block)).await
            }
            AudioFormat::Opus | AudioFormat::Ogg => {
                let Some(transcoder) = transcoder else {
                    return Err(EgressError::FormatMismatch {
                        have: frame.format,
                        want: AudioFormat::Pcm,
                    });
                };
                let blocks = transcoder.lock().format_to_pcm(&frame.payload)?;
                let mut sent = 0u64;
                for block in blocks {
                    let pcm = format::samples_to_bytes(&block);
                    sent += self.send_packet(&self.voice_packet(frame, &pcm)).await?;
                }
                Ok(sent)
            }
        }
    }
}
