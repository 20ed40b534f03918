//! Encodeur Opus
//!
//! Ce module implémente le trait VoiceEncoder avec la librairie Opus.
//! Une seule instance est partagée par toutes les sessions : le paquet
//! produit pour une frame est diffusé tel quel à chacune d'elles.
//!
//! 1 kbps = 1000 bps : le bitrate est transmis à libopus en bits par seconde.

use opus::{Application, Bitrate, Channels, Encoder};
use tracing::{debug, info};

use crate::{
    AudioConfig, AudioError, AudioFrame, AudioResult, CompressedFrame, VoiceEncoder,
};

/// Encodeur Opus configuré pour la transmission vocale temps réel
///
/// L'application `Audio` est utilisée plutôt que `Voip` : le flux peut
/// contenir de la musique et on ne veut pas du traitement spécifique voix.
pub struct OpusEncoder {
    /// Encodeur libopus
    encoder: Encoder,

    /// Configuration audio utilisée (format + réglages courants)
    config: AudioConfig,

    /// Buffer de sortie pré-alloué
    packet_buffer: Vec<u8>,
}

impl OpusEncoder {
    /// Crée un nouvel encodeur Opus
    ///
    /// Les réglages initiaux (bitrate, FEC, perte attendue) sont pris dans la
    /// configuration ; le bitrate est borné à [12, 512] kbps.
    ///
    /// # Erreurs
    /// - `AudioError::ConfigError` si le format n'est pas supporté
    /// - `AudioError::OpusError` si libopus refuse l'initialisation
    pub fn new(config: AudioConfig) -> AudioResult<Self> {
        config.validate().map_err(AudioError::ConfigError)?;

        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(AudioError::ConfigError(format!(
                    "Nombre de canaux non supporté par Opus: {}", other
                )))
            }
        };

        let encoder = Encoder::new(config.sample_rate, channels, Application::Audio)
            .map_err(|e| AudioError::OpusError(format!("Impossible de créer l'encodeur: {:?}", e)))?;

        let packet_buffer = vec![0u8; config.max_packet_size()];

        let mut opus = Self {
            encoder,
            config,
            packet_buffer,
        };

        let bitrate = opus.config.bitrate_kbps;
        let fec = opus.config.fec;
        let loss = opus.config.expected_packet_loss;
        opus.set_bitrate(bitrate)?;
        opus.set_fec(fec)?;
        opus.set_expected_loss(loss)?;

        info!(
            sample_rate = opus.config.sample_rate,
            channels = opus.config.channels,
            bitrate_kbps = opus.config.bitrate_kbps,
            fec = opus.config.fec,
            "Encodeur Opus initialisé"
        );

        Ok(opus)
    }

    /// Configuration courante de l'encodeur
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }
}

impl VoiceEncoder for OpusEncoder {
    fn set_bitrate(&mut self, kbps: u32) -> AudioResult<u32> {
        let kbps = AudioConfig::clamp_bitrate_kbps(kbps);
        self.encoder.set_bitrate(Bitrate::Bits((kbps * 1000) as i32))?;
        self.config.bitrate_kbps = kbps;
        debug!(bitrate_kbps = kbps, "Bitrate Opus mis à jour");
        Ok(kbps)
    }

    fn set_fec(&mut self, enabled: bool) -> AudioResult<()> {
        self.encoder.set_inband_fec(enabled)?;
        self.config.fec = enabled;
        Ok(())
    }

    fn set_expected_loss(&mut self, percent: u8) -> AudioResult<()> {
        let percent = AudioConfig::clamp_packet_loss(percent);
        self.encoder.set_packet_loss_perc(percent as i32)?;
        self.config.expected_packet_loss = percent;
        Ok(())
    }

    fn reset_state(&mut self) -> AudioResult<()> {
        self.encoder.reset_state()?;
        debug!("État de l'encodeur Opus réinitialisé");
        Ok(())
    }

    fn encode(&mut self, frame: &AudioFrame) -> AudioResult<CompressedFrame> {
        let expected_samples = self.config.frame_len();
        if frame.samples.len() != expected_samples {
            return Err(AudioError::OpusError(format!(
                "Taille de frame incorrecte: {} échantillons (attendu: {})",
                frame.samples.len(),
                expected_samples
            )));
        }

        let encoded_size = self.encoder
            .encode_float(&frame.samples, &mut self.packet_buffer)
            .map_err(|e| AudioError::OpusError(format!("Erreur encodage: {:?}", e)))?;

        Ok(CompressedFrame::new(
            self.packet_buffer[..encoded_size].to_vec(),
            frame.samples.len(),
            frame.timestamp,
            frame.sequence_number,
        ))
    }

    fn bitrate_kbps(&self) -> u32 {
        self.config.bitrate_kbps
    }

    fn codec_info(&self) -> String {
        format!(
            "Opus - {}Hz, {} ch, {} kbps, FEC {}",
            self.config.sample_rate,
            self.config.channels,
            self.config.bitrate_kbps,
            if self.config.fec { "on" } else { "off" }
        )
    }
}
