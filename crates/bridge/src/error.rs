//! Erreurs du pont micro → sessions vocales
//!
//! Regroupe les erreurs audio et réseau remontées à l'appelant des
//! opérations du contrôleur. Aucune de ces erreurs n'arrête la boucle du
//! pipeline : elle continue tant qu'on ne lui demande pas de s'arrêter.

use thiserror::Error;

use audio::AudioError;
use network::NetworkError;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Erreur de capture ou d'encodage
    #[error("Erreur audio: {0}")]
    Audio(#[from] AudioError),

    /// Erreur de session (join, envoi, signalement)
    #[error("Erreur réseau: {0}")]
    Network(#[from] NetworkError),

    /// Fichier de configuration illisible ou valeurs incohérentes
    #[error("Configuration invalide: {0}")]
    Config(String),

    /// Lecture du fichier de configuration impossible
    #[error("Lecture de {path} impossible: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Join abandonné par un leave du même salon avant la fin de la connexion
    #[error("Join de {channel} annulé")]
    JoinCancelled { channel: String },

    /// La boucle du contrôleur ne répond plus aux commandes
    #[error("Contrôleur arrêté")]
    ControllerStopped,
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl BridgeError {
    /// Vrai pour les erreurs de périphérique de capture
    pub fn is_device_error(&self) -> bool {
        matches!(self, BridgeError::Audio(e) if e.is_device_error())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        let err: BridgeError = AudioError::DeviceNotFound {
            host_api: "ALSA".to_string(),
            device: "USB".to_string(),
        }
        .into();
        assert!(err.is_device_error());
        assert!(err.to_string().contains("USB"));

        let err: BridgeError = NetworkError::connect_failed("general", "refusé").into();
        assert!(!err.is_device_error());
        assert!(matches!(err, BridgeError::Network(NetworkError::ConnectFailed { .. })));
    }
}
