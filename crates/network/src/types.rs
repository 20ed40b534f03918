//! Types de données pour le système réseau
//!
//! - ChannelTarget : salon vocal cible d'une session
//! - ConnectionHandle : connexion ouverte par un transport
//! - VoicePacket : paquet UDP du transport intégré
//! - NetworkConfig : délais des opérations réseau

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use audio::ActivityState;

/// Salon vocal cible
///
/// Identifié par son nom ; l'adresse est celle du serveur vocal qui le porte.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTarget {
    /// Nom du salon (identité de la session dans le registre)
    pub name: String,

    /// Adresse du serveur vocal
    pub endpoint: SocketAddr,
}

impl ChannelTarget {
    pub fn new(name: impl Into<String>, endpoint: SocketAddr) -> Self {
        Self { name: name.into(), endpoint }
    }
}

impl std::fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.endpoint)
    }
}

/// Connexion ouverte vers un salon
///
/// Le handle est partagé entre le transport et le registre : quand le
/// transport détecte une perte de connexion, il le marque déconnecté et le
/// registre retire la session à la frame suivante.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: u32,
    target: ChannelTarget,
    connected: AtomicBool,
    sequence: AtomicU64,
}

impl ConnectionHandle {
    /// Crée un handle connecté avec un identifiant de session
    pub fn new(id: u32, target: ChannelTarget) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                target,
                connected: AtomicBool::new(true),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Identifiant de session attribué à la connexion
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.inner.target
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Marque la connexion comme fermée (déconnexion ou perte du pair)
    pub fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    /// Numéro de séquence du prochain paquet envoyé sur cette connexion
    pub fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// Paquet UDP du transport intégré
///
/// Structure du paquet :
/// - Header : version, type, session, séquence, checksum
/// - Payload : paquet Opus tel que produit par l'encodeur
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoicePacket {
    /// Version du protocole pour compatibilité future
    pub protocol_version: u8,

    /// Type de paquet
    pub packet_type: PacketType,

    /// Identifiant de session
    pub session_id: u32,

    /// Numéro de séquence dans la session
    pub sequence: u64,

    /// Données Opus (vide hors paquets audio)
    pub payload: Vec<u8>,

    /// Checksum simple pour détecter la corruption
    pub checksum: u32,
}

impl VoicePacket {
    /// Version actuelle du protocole
    pub const CURRENT_PROTOCOL_VERSION: u8 = 1;

    /// Taille maximum autorisée pour un paquet (MTU safe)
    pub const MAX_PACKET_SIZE: usize = 1400;

    fn build(packet_type: PacketType, session_id: u32, sequence: u64, payload: Vec<u8>) -> Self {
        let mut packet = Self {
            protocol_version: Self::CURRENT_PROTOCOL_VERSION,
            packet_type,
            session_id,
            sequence,
            payload,
            checksum: 0,
        };
        packet.checksum = packet.calculate_checksum();
        packet
    }

    pub fn handshake(session_id: u32) -> Self {
        Self::build(PacketType::Handshake, session_id, 0, Vec::new())
    }

    pub fn audio(session_id: u32, sequence: u64, payload: Vec<u8>) -> Self {
        Self::build(PacketType::Audio, session_id, sequence, payload)
    }

    pub fn speaking(session_id: u32, sequence: u64, state: ActivityState) -> Self {
        Self::build(PacketType::Speaking, session_id, sequence, vec![state.is_speaking() as u8])
    }

    pub fn disconnect(session_id: u32) -> Self {
        Self::build(PacketType::Disconnect, session_id, 0, Vec::new())
    }

    /// Calcule un checksum XOR sur l'en-tête et les données
    pub fn calculate_checksum(&self) -> u32 {
        let mut checksum = 0u32;
        checksum ^= self.protocol_version as u32;
        checksum ^= self.packet_type as u32;
        checksum ^= self.session_id;
        checksum ^= self.sequence as u32;
        checksum ^= (self.sequence >> 32) as u32;

        for chunk in self.payload.chunks(4) {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            checksum ^= u32::from_le_bytes(bytes);
        }

        checksum
    }

    /// Vérifie l'intégrité du paquet
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// État annoncé par un paquet Speaking
    pub fn speaking_state(&self) -> Option<ActivityState> {
        match (self.packet_type, self.payload.first()) {
            (PacketType::Speaking, Some(1)) => Some(ActivityState::Speaking),
            (PacketType::Speaking, Some(_)) => Some(ActivityState::Silent),
            _ => None,
        }
    }
}

/// Types de paquets réseau
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Ouverture de session (et son acquittement)
    Handshake = 1,
    /// Paquet Opus
    Audio = 2,
    /// Changement d'état parle / silence
    Speaking = 3,
    /// Fermeture propre de la session
    Disconnect = 4,
}

/// Configuration du système réseau
///
/// Chaque opération réseau a un délai borné ; son expiration est un échec de
/// l'opération concernée, jamais une faute du pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port UDP local (0 = choisi par le système)
    pub local_port: u16,

    /// Délai max pour rejoindre un salon
    pub connect_timeout_ms: u64,

    /// Délai max pour l'envoi d'un paquet audio
    pub send_timeout_ms: u64,

    /// Délai max pour annoncer un changement d'état
    pub signal_timeout_ms: u64,

    /// Délai max pour quitter un salon
    pub disconnect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            connect_timeout_ms: 5000,
            send_timeout_ms: 10,      // Une frame dure 20ms
            signal_timeout_ms: 10,
            disconnect_timeout_ms: 2000,
        }
    }
}

impl NetworkConfig {
    /// Configuration pour tests (paramètres accélérés)
    pub fn test_config() -> Self {
        Self {
            connect_timeout_ms: 200,
            send_timeout_ms: 50,
            signal_timeout_ms: 50,
            disconnect_timeout_ms: 200,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ChannelTarget {
        ChannelTarget::new("general", "127.0.0.1:9001".parse().unwrap())
    }

    #[test]
    fn test_handle_lifecycle() {
        let handle = ConnectionHandle::new(42, target());
        let shared = handle.clone();

        assert!(handle.is_connected());
        assert_eq!(handle.next_sequence(), 0);
        assert_eq!(shared.next_sequence(), 1);

        shared.mark_disconnected();
        assert!(!handle.is_connected());
        assert_eq!(handle.id(), 42);
    }

    #[test]
    fn test_checksum_verification() {
        let packet = VoicePacket::audio(7, 3, vec![1, 2, 3, 4, 5]);
        assert!(packet.verify_checksum());

        let mut corrupted = packet.clone();
        corrupted.payload[4] = 99;
        assert!(!corrupted.verify_checksum());
    }

    #[test]
    fn test_speaking_packet() {
        let speaking = VoicePacket::speaking(1, 0, ActivityState::Speaking);
        let silent = VoicePacket::speaking(1, 1, ActivityState::Silent);

        assert_eq!(speaking.speaking_state(), Some(ActivityState::Speaking));
        assert_eq!(silent.speaking_state(), Some(ActivityState::Silent));
        assert_eq!(VoicePacket::handshake(1).speaking_state(), None);
    }

    #[test]
    fn test_network_config_presets() {
        let default = NetworkConfig::default();
        let test = NetworkConfig::test_config();

        // Envoi et annonce tiennent dans une frame de 20ms
        assert!(default.send_timeout() + default.signal_timeout() <= Duration::from_millis(20));
        assert!(test.connect_timeout() < default.connect_timeout());
        assert_eq!(test.send_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target().to_string(), "general (127.0.0.1:9001)");
    }
}
