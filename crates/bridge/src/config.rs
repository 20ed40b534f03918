//! Configuration du pont
//!
//! Chargée depuis un fichier TOML ; chaque section est optionnelle et les
//! valeurs absentes prennent leur défaut. Les options de la ligne de
//! commande sont appliquées par-dessus.
//!
//! ```toml
//! start_muted = false
//! host_api = "ALSA"
//! device = "default"
//!
//! [audio]
//! bitrate_kbps = 96
//! fec = true
//!
//! [network]
//! send_timeout_ms = 8
//!
//! [[channels]]
//! name = "general"
//! endpoint = "192.168.1.20:9001"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use audio::AudioConfig;
use network::{ChannelTarget, NetworkConfig};

use crate::{BridgeError, BridgeResult};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Format de capture et réglages initiaux de l'encodeur
    pub audio: AudioConfig,

    /// Délais des opérations réseau
    pub network: NetworkConfig,

    /// Démarre en sourdine
    pub start_muted: bool,

    /// API hôte de capture (défaut : celle de cpal)
    pub host_api: Option<String>,

    /// Périphérique d'entrée (défaut : celui de l'API hôte)
    pub device: Option<String>,

    /// Salons rejoints au démarrage
    pub channels: Vec<ChannelTarget>,
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> BridgeResult<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Vérifie la cohérence de la configuration
    ///
    /// Le bitrate hors bornes n'est pas une erreur : il est borné à l'application.
    pub fn validate(&self) -> BridgeResult<()> {
        self.audio.validate().map_err(BridgeError::Config)?;

        let mut names = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(BridgeError::Config("Salon sans nom".to_string()));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(BridgeError::Config(format!("Salon en double: {}", channel.name)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.audio.bitrate_kbps, 128);
        assert!(!config.audio.fec);
    }

    #[test]
    fn test_partial_sections() {
        let config = BridgeConfig::from_toml_str(
            r#"
            start_muted = true
            device = "USB Mic"

            [audio]
            bitrate_kbps = 96
            fec = true

            [network]
            send_timeout_ms = 8

            [[channels]]
            name = "general"
            endpoint = "127.0.0.1:9001"

            [[channels]]
            name = "musique"
            endpoint = "127.0.0.1:9002"
            "#,
        )
        .unwrap();

        assert!(config.start_muted);
        assert_eq!(config.device.as_deref(), Some("USB Mic"));
        assert_eq!(config.host_api, None);
        assert_eq!(config.audio.bitrate_kbps, 96);
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.network.send_timeout_ms, 8);
        assert_eq!(config.network.connect_timeout_ms, NetworkConfig::default().connect_timeout_ms);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[1].endpoint.port(), 9002);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let result = BridgeConfig::from_toml_str(
            r#"
            [[channels]]
            name = "general"
            endpoint = "127.0.0.1:9001"

            [[channels]]
            name = "general"
            endpoint = "127.0.0.1:9002"
            "#,
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            BridgeConfig::from_toml_str("[audio\nbitrate_kbps = "),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[[channels]]\nname = \"a\"\nendpoint = \"pas une adresse\""),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = BridgeConfig::load("/nulle/part/mic-bridge.toml");
        assert!(matches!(result, Err(BridgeError::ConfigRead { .. })));
    }
}
