//! Gestion d'erreurs pour le système réseau
//!
//! Ce module suit les mêmes patterns que le module audio. Toutes ces erreurs
//! sont locales à une session et à une opération : aucune n'arrête le pipeline.

use thiserror::Error;

/// Énumération de toutes les erreurs possibles côté transmission
#[derive(Error, Debug)]
pub enum NetworkError {
    /// La connexion à un salon a échoué : la session n'est pas enregistrée
    #[error("Connexion à {target} impossible: {reason}")]
    ConnectFailed { target: String, reason: String },

    /// Une opération réseau n'a pas abouti dans le délai imparti
    #[error("Timeout de l'opération {operation} vers {target} après {timeout_ms}ms")]
    ConnectionTimeout { operation: &'static str, target: String, timeout_ms: u64 },

    /// Envoi d'un paquet audio impossible pour une session
    #[error("Envoi vers {target} impossible: {reason}")]
    SendFailed { target: String, reason: String },

    /// Annonce de l'état "parle / silence" impossible pour une session
    #[error("Signalement d'état vers {target} impossible: {reason}")]
    SignalFailed { target: String, reason: String },

    /// La déconnexion d'une session a échoué (la session est tout de même retirée)
    #[error("Déconnexion de {target} impossible: {reason}")]
    DisconnectFailed { target: String, reason: String },

    /// Opération sur une session dont la connexion est fermée
    #[error("Session {target} non connectée")]
    NotConnected { target: String },

    /// Paquet trop volumineux pour un datagramme
    #[error("Paquet trop volumineux: {size} bytes (max autorisé: {max} bytes)")]
    PacketTooLarge { size: usize, max: usize },

    /// Paquet reçu illisible ou de version incompatible
    #[error("Format de paquet invalide reçu de {addr}")]
    InvalidPacketFormat { addr: String },

    /// Adresse IP ou port invalide fourni par l'utilisateur
    #[error("Adresse invalide: {addr}")]
    InvalidAddress { addr: String },

    /// Erreur lors de la sérialisation/désérialisation des paquets
    #[error("Erreur de sérialisation: {0}")]
    SerializationError(#[from] bincode::Error),

    /// Erreur générale d'entrée/sortie réseau
    #[error("Erreur IO réseau: {0}")]
    IoError(#[from] std::io::Error),
}

/// Conversion automatique des erreurs de parsing d'adresses
impl From<std::net::AddrParseError> for NetworkError {
    fn from(err: std::net::AddrParseError) -> Self {
        NetworkError::InvalidAddress {
            addr: format!("Erreur de parsing: {}", err)
        }
    }
}

/// Type Result personnalisé pour notre crate network
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Fonctions utilitaires pour créer des erreurs communes
impl NetworkError {
    pub fn connect_failed(target: impl ToString, reason: impl ToString) -> Self {
        Self::ConnectFailed { target: target.to_string(), reason: reason.to_string() }
    }

    pub fn send_failed(target: impl ToString, reason: impl ToString) -> Self {
        Self::SendFailed { target: target.to_string(), reason: reason.to_string() }
    }

    pub fn signal_failed(target: impl ToString, reason: impl ToString) -> Self {
        Self::SignalFailed { target: target.to_string(), reason: reason.to_string() }
    }

    pub fn disconnect_failed(target: impl ToString, reason: impl ToString) -> Self {
        Self::DisconnectFailed { target: target.to_string(), reason: reason.to_string() }
    }

    pub fn timeout(operation: &'static str, target: impl ToString, timeout: std::time::Duration) -> Self {
        Self::ConnectionTimeout {
            operation,
            target: target.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Opération réseau concernée par l'erreur
    pub fn operation(&self) -> &'static str {
        match self {
            NetworkError::ConnectFailed { .. } => "connect",
            NetworkError::ConnectionTimeout { operation, .. } => *operation,
            NetworkError::SendFailed { .. } | NetworkError::PacketTooLarge { .. } => "send",
            NetworkError::SignalFailed { .. } => "signal",
            NetworkError::DisconnectFailed { .. } => "disconnect",
            NetworkError::InvalidPacketFormat { .. } => "receive",
            NetworkError::InvalidAddress { .. } => "parse",
            NetworkError::NotConnected { .. }
            | NetworkError::SerializationError(_)
            | NetworkError::IoError(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let error = NetworkError::connect_failed("general", "refusé");
        assert!(error.to_string().contains("general"));
        assert!(error.to_string().contains("refusé"));

        let error = NetworkError::timeout("send", "musique", Duration::from_millis(250));
        assert_eq!(error.to_string(), "Timeout de l'opération send vers musique après 250ms");
    }

    #[test]
    fn test_operation() {
        assert_eq!(NetworkError::timeout("signal", "a", Duration::from_millis(5)).operation(), "signal");
        assert_eq!(NetworkError::disconnect_failed("a", "io").operation(), "disconnect");
        assert_eq!(NetworkError::connect_failed("a", "io").operation(), "connect");
    }

    #[test]
    fn test_addr_parse_conversion() {
        let err: NetworkError = "pas une adresse".parse::<std::net::SocketAddr>().unwrap_err().into();
        assert!(matches!(err, NetworkError::InvalidAddress { .. }));
    }
}
