//! Traits abstraits pour le système réseau
//!
//! Le transport vocal (handshake, authentification, protocole de la passerelle)
//! est un collaborateur externe. Le pipeline ne le voit qu'à travers ce trait.

use async_trait::async_trait;

use audio::ActivityState;

use crate::{ChannelTarget, ConnectionHandle, NetworkResult};

/// Trait pour le transport vocal sortant
///
/// Implémentations :
/// - UdpVoiceTransport : transport UDP réel avec tokio
/// - SimulatedTransport : transport en mémoire pour les tests
///
/// Toutes les opérations sont faillibles. Les délais sont appliqués par
/// l'appelant (registre des sessions), pas par le transport.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Rejoint un salon vocal et retourne la connexion ouverte
    ///
    /// # Erreurs
    /// - `NetworkError::ConnectFailed` : le salon a refusé ou n'a pas répondu
    async fn connect(&self, target: &ChannelTarget) -> NetworkResult<ConnectionHandle>;

    /// Quitte un salon
    ///
    /// Le handle est marqué déconnecté même si la fermeture échoue.
    async fn disconnect(&self, handle: &ConnectionHandle) -> NetworkResult<()>;

    /// Envoie un paquet encodé sur une connexion
    ///
    /// # Erreurs
    /// - `NetworkError::NotConnected` : connexion fermée
    /// - `NetworkError::SendFailed` : erreur de transmission
    async fn send(&self, handle: &ConnectionHandle, packet: &[u8]) -> NetworkResult<()>;

    /// Annonce un changement d'état parle / silence
    async fn signal_state(&self, handle: &ConnectionHandle, state: ActivityState) -> NetworkResult<()>;

    /// Description courte du transport
    fn transport_info(&self) -> String {
        "Transport vocal".to_string()
    }
}
