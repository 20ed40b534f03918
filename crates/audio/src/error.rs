//! Gestion d'erreurs pour le système audio
//!
//! Ce module regroupe les erreurs de la capture (énumération des périphériques,
//! ouverture du stream) et de l'encodeur Opus.
//! En Rust, nous utilisons le type Result<T, E> pour gérer les erreurs de façon explicite.

use thiserror::Error;

/// Énumération de toutes les erreurs possibles dans le système audio
///
/// Les variantes `UnknownHostApi`, `DeviceNotFound`, `StreamBuild` et
/// `StreamStart` forment la famille "erreur périphérique" : elles sont
/// remontées à l'appelant et aucun stream partiel n'est conservé.
#[derive(Error, Debug)]
pub enum AudioError {
    /// L'API hôte demandée (ALSA, WASAPI, CoreAudio...) n'existe pas sur ce système
    #[error("API audio inconnue: {0}")]
    UnknownHostApi(String),

    /// Aucun périphérique d'entrée ne correspond au couple (API hôte, nom)
    #[error("Périphérique d'entrée introuvable: {device} ({host_api})")]
    DeviceNotFound { host_api: String, device: String },

    /// Le backend audio a refusé de construire le stream de capture
    #[error("Impossible de construire le stream de capture: {0}")]
    StreamBuild(String),

    /// Le stream a été construit mais n'a pas pu démarrer
    #[error("Impossible de démarrer le stream de capture: {0}")]
    StreamStart(#[from] cpal::PlayStreamError),

    /// Erreur lors de l'énumération des périphériques
    #[error("Erreur d'énumération des périphériques: {0}")]
    Enumeration(String),

    /// Erreur de configuration des paramètres audio (sample rate, etc.)
    #[error("Erreur de configuration audio: {0}")]
    ConfigError(String),

    /// Erreur lors de l'encodage Opus
    #[error("Erreur Opus: {0}")]
    OpusError(String),
}

impl AudioError {
    /// Indique si l'erreur concerne le périphérique de capture
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            AudioError::UnknownHostApi(_)
                | AudioError::DeviceNotFound { .. }
                | AudioError::StreamBuild(_)
                | AudioError::StreamStart(_)
                | AudioError::Enumeration(_)
        )
    }
}

/// Conversion automatique des erreurs Opus vers AudioError
///
/// Cela nous permet d'utiliser l'opérateur `?` avec les fonctions Opus
impl From<opus::Error> for AudioError {
    fn from(err: opus::Error) -> Self {
        AudioError::OpusError(format!("{:?}", err))
    }
}

/// Conversion des erreurs cpal::BuildStreamError
impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::StreamBuild(err.to_string())
    }
}

impl From<cpal::DevicesError> for AudioError {
    fn from(err: cpal::DevicesError) -> Self {
        AudioError::Enumeration(err.to_string())
    }
}

impl From<cpal::HostUnavailable> for AudioError {
    fn from(err: cpal::HostUnavailable) -> Self {
        AudioError::Enumeration(err.to_string())
    }
}

/// Type Result personnalisé pour notre crate
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AudioError::DeviceNotFound {
            host_api: "ALSA".to_string(),
            device: "USB Mic".to_string(),
        };
        assert_eq!(error.to_string(), "Périphérique d'entrée introuvable: USB Mic (ALSA)");

        let error = AudioError::ConfigError("Test".to_string());
        assert_eq!(error.to_string(), "Erreur de configuration audio: Test");
    }

    #[test]
    fn test_device_error_family() {
        assert!(AudioError::UnknownHostApi("JACK".into()).is_device_error());
        assert!(AudioError::StreamBuild("busy".into()).is_device_error());
        assert!(!AudioError::OpusError("bad".into()).is_device_error());
        assert!(!AudioError::ConfigError("bad".into()).is_device_error());
    }
}
