//! Transports vocaux
//!
//! - UdpVoiceTransport : paquets bincode sur un socket UDP tokio partagé
//!   par toutes les sessions
//! - SimulatedTransport : transport en mémoire, avec injection de pannes,
//!   qui enregistre chaque appel pour les tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use audio::ActivityState;

use crate::{
    ChannelTarget, ConnectionHandle, NetworkConfig, NetworkError, NetworkResult, PacketType,
    VoicePacket, VoiceTransport,
};

/// Sérialise un paquet avec bincode et vérifie sa taille
pub(crate) fn encode_packet(packet: &VoicePacket) -> NetworkResult<Vec<u8>> {
    let bytes = bincode::serialize(packet)?;
    if bytes.len() > VoicePacket::MAX_PACKET_SIZE {
        return Err(NetworkError::PacketTooLarge {
            size: bytes.len(),
            max: VoicePacket::MAX_PACKET_SIZE,
        });
    }
    Ok(bytes)
}

/// Désérialise un datagramme et valide version et checksum
pub(crate) fn decode_packet(data: &[u8], source: SocketAddr) -> NetworkResult<VoicePacket> {
    let invalid = || NetworkError::InvalidPacketFormat { addr: source.to_string() };

    let packet: VoicePacket = bincode::deserialize(data).map_err(|_| invalid())?;
    if packet.protocol_version != VoicePacket::CURRENT_PROTOCOL_VERSION || !packet.verify_checksum() {
        return Err(invalid());
    }
    Ok(packet)
}

/// Transport UDP vers des serveurs vocaux
///
/// Un seul socket sert toutes les sessions ; chaque session est identifiée
/// par un identifiant aléatoire échangé lors du handshake.
///
/// # Example
/// ```rust,no_run
/// use network::{UdpVoiceTransport, NetworkConfig, VoiceTransport, ChannelTarget};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = UdpVoiceTransport::bind(NetworkConfig::default()).await?;
/// let target = ChannelTarget::new("general", "192.168.1.100:9001".parse()?);
/// let handle = transport.connect(&target).await?;
/// transport.send(&handle, &[0xF8, 0xFF, 0xFE]).await?;
/// # Ok(())
/// # }
/// ```
pub struct UdpVoiceTransport {
    socket: Arc<UdpSocket>,

    /// Un seul handshake à la fois : les acquittements arrivent sur le socket partagé
    handshake_lock: Mutex<()>,

    local_addr: Option<SocketAddr>,
}

impl UdpVoiceTransport {
    /// Crée le socket UDP sur le port local configuré
    pub async fn bind(config: NetworkConfig) -> NetworkResult<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.local_port));
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr().ok();

        info!(local_addr = ?local_addr, "Transport UDP prêt");

        Ok(Self {
            socket: Arc::new(socket),
            handshake_lock: Mutex::new(()),
            local_addr,
        })
    }

    /// Adresse locale d'émission
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn send_to(&self, packet: &VoicePacket, addr: SocketAddr) -> NetworkResult<()> {
        let bytes = encode_packet(packet)?;
        let sent = self.socket.send_to(&bytes, addr).await?;
        if sent != bytes.len() {
            return Err(NetworkError::IoError(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "Envoi incomplet",
            )));
        }
        Ok(())
    }

    /// Attend l'acquittement du handshake d'une session
    async fn wait_handshake_ack(&self, endpoint: SocketAddr, session_id: u32) -> NetworkResult<()> {
        let mut buffer = vec![0u8; VoicePacket::MAX_PACKET_SIZE];
        loop {
            let (len, source) = self.socket.recv_from(&mut buffer).await?;
            if source != endpoint {
                continue;
            }
            match decode_packet(&buffer[..len], source) {
                Ok(packet) if packet.packet_type == PacketType::Handshake && packet.session_id == session_id => {
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => trace!(error = %e, "Datagramme ignoré pendant le handshake"),
            }
        }
    }
}

#[async_trait]
impl VoiceTransport for UdpVoiceTransport {
    async fn connect(&self, target: &ChannelTarget) -> NetworkResult<ConnectionHandle> {
        let _guard = self.handshake_lock.lock().await;
        let session_id = fastrand::u32(1..=u32::MAX);

        self.send_to(&VoicePacket::handshake(session_id), target.endpoint)
            .await
            .map_err(|e| NetworkError::connect_failed(&target.name, e))?;

        self.wait_handshake_ack(target.endpoint, session_id)
            .await
            .map_err(|e| NetworkError::connect_failed(&target.name, e))?;

        debug!(target = %target, session_id, "Handshake acquitté");
        Ok(ConnectionHandle::new(session_id, target.clone()))
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> NetworkResult<()> {
        handle.mark_disconnected();
        let target = handle.target();

        self.send_to(&VoicePacket::disconnect(handle.id()), target.endpoint)
            .await
            .map_err(|e| NetworkError::disconnect_failed(&target.name, e))
    }

    async fn send(&self, handle: &ConnectionHandle, packet: &[u8]) -> NetworkResult<()> {
        let target = handle.target();
        if !handle.is_connected() {
            return Err(NetworkError::NotConnected { target: target.name.clone() });
        }

        let packet = VoicePacket::audio(handle.id(), handle.next_sequence(), packet.to_vec());
        self.send_to(&packet, target.endpoint)
            .await
            .map_err(|e| NetworkError::send_failed(&target.name, e))
    }

    async fn signal_state(&self, handle: &ConnectionHandle, state: ActivityState) -> NetworkResult<()> {
        let target = handle.target();
        if !handle.is_connected() {
            return Err(NetworkError::NotConnected { target: target.name.clone() });
        }

        let packet = VoicePacket::speaking(handle.id(), handle.next_sequence(), state);
        self.send_to(&packet, target.endpoint)
            .await
            .map_err(|e| NetworkError::signal_failed(&target.name, e))
    }

    fn transport_info(&self) -> String {
        match self.local_addr {
            Some(addr) => format!("UDP {}", addr),
            None => "UDP".to_string(),
        }
    }
}

/// Transport simulé pour les tests
///
/// Chaque salon peut être configuré pour échouer à la connexion, à l'envoi,
/// au signalement ou à la déconnexion, ou pour bloquer indéfiniment à la
/// connexion, à l'envoi ou au signalement (afin de tester les délais). Tous les appels réussis sont enregistrés.
pub struct SimulatedTransport {
    state: Mutex<SimulationState>,
}

#[derive(Default)]
struct SimulationState {
    failing_connects: HashSet<String>,
    failing_sends: HashSet<String>,
    failing_signals: HashSet<String>,
    failing_disconnects: HashSet<String>,
    stalled_connects: HashSet<String>,
    stalled_sends: HashSet<String>,
    stalled_signals: HashSet<String>,
    loss_rate: f32,

    handles: HashMap<String, ConnectionHandle>,
    connect_attempts: HashMap<String, usize>,
    sent: HashMap<String, Vec<Vec<u8>>>,
    signals: HashMap<String, Vec<ActivityState>>,
    disconnects: Vec<String>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self { state: Mutex::new(SimulationState::default()) }
    }

    pub async fn fail_connect(&self, channel: &str) {
        self.state.lock().await.failing_connects.insert(channel.to_string());
    }

    pub async fn fail_send(&self, channel: &str) {
        self.state.lock().await.failing_sends.insert(channel.to_string());
    }

    pub async fn fail_signal(&self, channel: &str) {
        self.state.lock().await.failing_signals.insert(channel.to_string());
    }

    pub async fn fail_disconnect(&self, channel: &str) {
        self.state.lock().await.failing_disconnects.insert(channel.to_string());
    }

    /// Les connexions vers ce salon ne se terminent jamais
    pub async fn stall_connect(&self, channel: &str) {
        self.state.lock().await.stalled_connects.insert(channel.to_string());
    }

    /// Les envois vers ce salon ne se terminent jamais
    pub async fn stall_sends(&self, channel: &str) {
        self.state.lock().await.stalled_sends.insert(channel.to_string());
    }

    /// Les annonces d'état vers ce salon ne se terminent jamais
    pub async fn stall_signals(&self, channel: &str) {
        self.state.lock().await.stalled_signals.insert(channel.to_string());
    }

    /// Fraction des paquets audio perdus silencieusement (0.0 à 1.0)
    pub async fn set_loss_rate(&self, loss_rate: f32) {
        self.state.lock().await.loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    /// Retire toutes les pannes configurées pour un salon
    pub async fn heal(&self, channel: &str) {
        let mut state = self.state.lock().await;
        state.failing_connects.remove(channel);
        state.failing_sends.remove(channel);
        state.failing_signals.remove(channel);
        state.failing_disconnects.remove(channel);
        state.stalled_connects.remove(channel);
        state.stalled_sends.remove(channel);
        state.stalled_signals.remove(channel);
    }

    /// Simule la perte de la connexion côté serveur
    pub async fn drop_peer(&self, channel: &str) {
        if let Some(handle) = self.state.lock().await.handles.get(channel) {
            handle.mark_disconnected();
        }
    }

    /// Nombre de tentatives de connexion vers un salon
    pub async fn connect_attempts(&self, channel: &str) -> usize {
        self.state.lock().await.connect_attempts.get(channel).copied().unwrap_or(0)
    }

    /// Paquets reçus par un salon, dans l'ordre
    pub async fn sent_packets(&self, channel: &str) -> Vec<Vec<u8>> {
        self.state.lock().await.sent.get(channel).cloned().unwrap_or_default()
    }

    /// États annoncés à un salon, dans l'ordre
    pub async fn signals(&self, channel: &str) -> Vec<ActivityState> {
        self.state.lock().await.signals.get(channel).cloned().unwrap_or_default()
    }

    /// Salons quittés, dans l'ordre
    pub async fn disconnects(&self) -> Vec<String> {
        self.state.lock().await.disconnects.clone()
    }
}

#[async_trait]
impl VoiceTransport for SimulatedTransport {
    async fn connect(&self, target: &ChannelTarget) -> NetworkResult<ConnectionHandle> {
        let stalled = {
            let mut state = self.state.lock().await;
            *state.connect_attempts.entry(target.name.clone()).or_default() += 1;

            if state.failing_connects.contains(&target.name) {
                return Err(NetworkError::connect_failed(&target.name, "connexion refusée (simulation)"));
            }
            state.stalled_connects.contains(&target.name)
        };

        if stalled {
            std::future::pending::<()>().await;
        }

        let handle = ConnectionHandle::new(fastrand::u32(1..=u32::MAX), target.clone());
        self.state.lock().await.handles.insert(target.name.clone(), handle.clone());
        Ok(handle)
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> NetworkResult<()> {
        handle.mark_disconnected();
        let name = &handle.target().name;
        let mut state = self.state.lock().await;
        state.handles.remove(name);

        if state.failing_disconnects.contains(name) {
            return Err(NetworkError::disconnect_failed(name, "fermeture refusée (simulation)"));
        }
        state.disconnects.push(name.clone());
        Ok(())
    }

    async fn send(&self, handle: &ConnectionHandle, packet: &[u8]) -> NetworkResult<()> {
        let name = handle.target().name.clone();
        if !handle.is_connected() {
            return Err(NetworkError::NotConnected { target: name });
        }

        let stalled = {
            let mut state = self.state.lock().await;
            if state.failing_sends.contains(&name) {
                return Err(NetworkError::send_failed(&name, "lien coupé (simulation)"));
            }
            let stalled = state.stalled_sends.contains(&name);
            if !stalled && (state.loss_rate == 0.0 || fastrand::f32() >= state.loss_rate) {
                state.sent.entry(name).or_default().push(packet.to_vec());
            }
            stalled
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn signal_state(&self, handle: &ConnectionHandle, state_to_signal: ActivityState) -> NetworkResult<()> {
        let name = handle.target().name.clone();
        if !handle.is_connected() {
            return Err(NetworkError::NotConnected { target: name });
        }

        let stalled = {
            let mut state = self.state.lock().await;
            if state.failing_signals.contains(&name) {
                return Err(NetworkError::signal_failed(&name, "passerelle injoignable (simulation)"));
            }
            let stalled = state.stalled_signals.contains(&name);
            if !stalled {
                state.signals.entry(name).or_default().push(state_to_signal);
            }
            stalled
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn transport_info(&self) -> String {
        "Transport simulé".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> ChannelTarget {
        ChannelTarget::new(name, "127.0.0.1:9001".parse().unwrap())
    }

    #[test]
    fn test_packet_codec() {
        let packet = VoicePacket::audio(12, 4, vec![1, 2, 3]);
        let bytes = encode_packet(&packet).unwrap();
        let source: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        assert_eq!(decode_packet(&bytes, source).unwrap(), packet);
        assert!(decode_packet(b"invalid packet data", source).is_err());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let packet = VoicePacket::audio(1, 0, vec![0u8; VoicePacket::MAX_PACKET_SIZE]);
        assert!(matches!(encode_packet(&packet), Err(NetworkError::PacketTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_simulated_records_calls() {
        let transport = SimulatedTransport::new();
        let handle = transport.connect(&target("general")).await.unwrap();

        transport.send(&handle, &[1, 2]).await.unwrap();
        transport.signal_state(&handle, ActivityState::Speaking).await.unwrap();
        transport.disconnect(&handle).await.unwrap();

        assert_eq!(transport.sent_packets("general").await, vec![vec![1, 2]]);
        assert_eq!(transport.signals("general").await, vec![ActivityState::Speaking]);
        assert_eq!(transport.disconnects().await, vec!["general".to_string()]);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let transport = SimulatedTransport::new();
        transport.fail_connect("a").await;
        assert!(transport.connect(&target("a")).await.is_err());
        assert_eq!(transport.connect_attempts("a").await, 1);

        transport.heal("a").await;
        let handle = transport.connect(&target("a")).await.unwrap();

        transport.fail_send("a").await;
        assert!(matches!(
            transport.send(&handle, &[0]).await,
            Err(NetworkError::SendFailed { .. })
        ));

        transport.drop_peer("a").await;
        assert!(matches!(
            transport.signal_state(&handle, ActivityState::Silent).await,
            Err(NetworkError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_simulated_total_loss() {
        let transport = SimulatedTransport::new();
        transport.set_loss_rate(1.0).await;
        let handle = transport.connect(&target("b")).await.unwrap();

        assert!(transport.send(&handle, &[9]).await.is_ok());
        assert!(transport.sent_packets("b").await.is_empty());
    }

    #[tokio::test]
    async fn test_udp_transport_bind() {
        let transport = UdpVoiceTransport::bind(NetworkConfig::test_config()).await.unwrap();
        assert!(transport.local_addr().is_some());
        assert!(transport.transport_info().starts_with("UDP"));
    }

    #[tokio::test]
    async fn test_udp_send_requires_connection() {
        let transport = UdpVoiceTransport::bind(NetworkConfig::test_config()).await.unwrap();
        let handle = ConnectionHandle::new(1, target("x"));
        handle.mark_disconnected();

        assert!(matches!(
            transport.send(&handle, &[1]).await,
            Err(NetworkError::NotConnected { .. })
        ));
    }
}
