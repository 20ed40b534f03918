//! Configuration audio du pont micro → sessions vocales
//!
//! Le format de capture est fixe (48 kHz, stéréo, f32, blocs de 20 ms) : c'est
//! celui qu'attend l'encodeur Opus côté transmission. Seuls les réglages de
//! l'encodeur (bitrate, FEC, perte attendue) sont modifiables à chaud.

use serde::{Deserialize, Serialize};

/// Bitrate minimal accepté par l'encodeur, en kbps
pub const MIN_BITRATE_KBPS: u32 = 12;

/// Bitrate maximal accepté par l'encodeur, en kbps
pub const MAX_BITRATE_KBPS: u32 = 512;

/// Configuration principale du système audio
///
/// `#[serde(default)]` permet de ne préciser qu'une partie des champs
/// dans le fichier de configuration TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Fréquence d'échantillonnage en Hz
    pub sample_rate: u32,

    /// Nombre de canaux (2 = stéréo, échantillons entrelacés)
    pub channels: u16,

    /// Durée de chaque frame audio en millisecondes
    pub frame_duration_ms: u16,

    /// Débit cible de l'encodeur en kbps (borné à [12, 512])
    pub bitrate_kbps: u32,

    /// Forward error correction intégrée à Opus
    ///
    /// Désactivée par défaut : elle n'aide que sur la voix et dégrade
    /// sensiblement la musique.
    pub fec: bool,

    /// Pourcentage de perte de paquets attendu (0-100)
    pub expected_packet_loss: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,         // 48 kHz - fréquence native d'Opus
            channels: 2,                // Stéréo
            frame_duration_ms: 20,      // 20ms - standard VoIP
            bitrate_kbps: 128,          // 128 kbps
            fec: false,
            expected_packet_loss: 0,
        }
    }
}

impl AudioConfig {
    /// Calcule le nombre d'échantillons par canal dans une frame
    ///
    /// Exemple : (48000 * 20) / 1000 = 960 échantillons
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Nombre total d'échantillons entrelacés dans une frame
    pub fn frame_len(&self) -> usize {
        self.samples_per_frame() * self.channels as usize
    }

    /// Taille en bytes d'une frame brute (f32 = 4 bytes)
    pub fn frame_size_bytes(&self) -> usize {
        self.frame_len() * 4
    }

    /// Taille maximale d'un paquet encodé
    ///
    /// On réserve autant que la frame brute, comme le fait libopus dans le pire cas.
    pub fn max_packet_size(&self) -> usize {
        self.frame_size_bytes()
    }

    /// Ramène un bitrate quelconque dans l'intervalle accepté
    pub fn clamp_bitrate_kbps(kbps: u32) -> u32 {
        kbps.clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS)
    }

    /// Ramène un pourcentage de perte dans [0, 100]
    pub fn clamp_packet_loss(percent: u8) -> u8 {
        percent.min(100)
    }

    /// Valide que la configuration est cohérente
    ///
    /// Un bitrate hors bornes n'est pas une erreur : il est borné silencieusement
    /// à l'application. Seul le format de capture est vérifié ici.
    pub fn validate(&self) -> Result<(), String> {
        if ![8000, 12000, 16000, 24000, 48000].contains(&self.sample_rate) {
            return Err(format!("Sample rate invalide: {} (non supporté par Opus)", self.sample_rate));
        }

        if self.channels == 0 || self.channels > 2 {
            return Err(format!("Nombre de canaux invalide: {} (doit être 1 ou 2)", self.channels));
        }

        if ![10, 20, 40, 60].contains(&self.frame_duration_ms) {
            return Err(format!("Durée de frame invalide: {}ms (10, 20, 40 ou 60)", self.frame_duration_ms));
        }

        Ok(())
    }
}
