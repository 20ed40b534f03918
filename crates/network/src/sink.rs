//! Pair de réception minimal
//!
//! Acquitte les handshakes, compte les paquets audio et suit l'état annoncé
//! de chaque session. Sert de cible à la commande `listen` et aux tests du
//! transport UDP ; il ne décode ni ne joue l'audio.

use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use audio::ActivityState;

use crate::transport::{decode_packet, encode_packet};
use crate::{NetworkResult, PacketType, VoicePacket};

/// Vue d'une session côté récepteur
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SinkSession {
    pub peer: Option<SocketAddr>,
    pub audio_packets: u64,
    pub audio_bytes: u64,
    pub state: ActivityState,
    pub state_changes: u64,
    pub closed: bool,
}

/// Statistiques publiées après chaque datagramme traité
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SinkStats {
    pub sessions: HashMap<u32, SinkSession>,
    pub invalid_packets: u64,
}

impl SinkStats {
    /// Total des paquets audio reçus, toutes sessions confondues
    pub fn total_audio_packets(&self) -> u64 {
        self.sessions.values().map(|s| s.audio_packets).sum()
    }
}

/// Récepteur UDP
pub struct PacketSink {
    socket: UdpSocket,
    stats: watch::Sender<SinkStats>,
}

impl PacketSink {
    pub async fn bind(port: u16) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let (stats, _) = watch::channel(SinkStats::default());
        Ok(Self { socket, stats })
    }

    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Abonnement aux statistiques
    pub fn subscribe(&self) -> watch::Receiver<SinkStats> {
        self.stats.subscribe()
    }

    /// Boucle de réception, jusqu'à erreur du socket
    pub async fn run(self) -> NetworkResult<()> {
        let mut buffer = vec![0u8; VoicePacket::MAX_PACKET_SIZE];
        info!(addr = ?self.socket.local_addr().ok(), "Récepteur en écoute");

        loop {
            let (len, source) = self.socket.recv_from(&mut buffer).await?;

            let packet = match decode_packet(&buffer[..len], source) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(%source, error = %e, "Paquet invalide");
                    self.stats.send_modify(|s| s.invalid_packets += 1);
                    continue;
                }
            };

            if packet.packet_type == PacketType::Handshake {
                let ack = encode_packet(&VoicePacket::handshake(packet.session_id))?;
                self.socket.send_to(&ack, source).await?;
                info!(%source, session_id = packet.session_id, "Session ouverte");
            }

            self.stats.send_modify(|stats| record(stats, &packet, source));
        }
    }
}

fn record(stats: &mut SinkStats, packet: &VoicePacket, source: SocketAddr) {
    let session = stats.sessions.entry(packet.session_id).or_default();
    session.peer = Some(source);

    match packet.packet_type {
        PacketType::Handshake => session.closed = false,
        PacketType::Audio => {
            session.audio_packets += 1;
            session.audio_bytes += packet.payload.len() as u64;
        }
        PacketType::Speaking => {
            if let Some(state) = packet.speaking_state() {
                debug!(session_id = packet.session_id, ?state, "Changement d'état");
                session.state = state;
                session.state_changes += 1;
            }
        }
        PacketType::Disconnect => {
            info!(session_id = packet.session_id, "Session fermée");
            session.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelTarget, NetworkConfig, UdpVoiceTransport, VoiceTransport};
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_record_updates_session() {
        let mut stats = SinkStats::default();
        let source: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        record(&mut stats, &VoicePacket::handshake(3), source);
        record(&mut stats, &VoicePacket::audio(3, 0, vec![1, 2, 3]), source);
        record(&mut stats, &VoicePacket::speaking(3, 1, ActivityState::Speaking), source);
        record(&mut stats, &VoicePacket::disconnect(3), source);

        let session = &stats.sessions[&3];
        assert_eq!(session.audio_packets, 1);
        assert_eq!(session.audio_bytes, 3);
        assert_eq!(session.state, ActivityState::Speaking);
        assert!(session.closed);
    }

    #[tokio::test]
    async fn test_udp_round_trip_through_sink() {
        let sink = PacketSink::bind(0).await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let mut stats = sink.subscribe();
        tokio::spawn(sink.run());

        let transport = UdpVoiceTransport::bind(NetworkConfig::test_config()).await.unwrap();
        let target = ChannelTarget::new("local", SocketAddr::from(([127, 0, 0, 1], port)));

        let handle = timeout(Duration::from_secs(2), transport.connect(&target))
            .await
            .expect("timeout handshake")
            .unwrap();

        transport.signal_state(&handle, ActivityState::Speaking).await.unwrap();
        transport.send(&handle, &[0xF8, 0xFF, 0xFE]).await.unwrap();

        let received = timeout(Duration::from_secs(2), async {
            loop {
                if stats.borrow().total_audio_packets() >= 1 {
                    return stats.borrow().clone();
                }
                if stats.changed().await.is_err() {
                    return stats.borrow().clone();
                }
            }
        })
        .await
        .expect("aucun paquet reçu");

        let session = &received.sessions[&handle.id()];
        assert_eq!(session.audio_packets, 1);
        assert_eq!(session.state, ActivityState::Speaking);
    }
}
