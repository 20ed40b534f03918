//! Traits abstraits pour le système audio
//!
//! L'encodeur est consommé comme une capacité opaque : le pipeline pilote sa
//! configuration (bitrate, FEC, perte attendue, reset) et lui confie les frames
//! à transmettre, sans jamais connaître le format du bitstream.

use crate::{AudioFrame, AudioResult, CompressedFrame};

/// Trait pour un encodeur vocal avec état
///
/// Implémentations :
/// - OpusEncoder : encodeur Opus réel
/// - encodeurs factices dans les tests du pipeline
///
/// Tous les appels sont faits séquentiellement depuis la boucle du pipeline :
/// aucune implémentation n'a à gérer un `encode` concurrent d'un réglage.
pub trait VoiceEncoder: Send {
    /// Règle le débit cible
    ///
    /// La valeur est bornée à [12, 512] kbps ; le débit réellement appliqué
    /// est retourné.
    fn set_bitrate(&mut self, kbps: u32) -> AudioResult<u32>;

    /// Active ou désactive la forward error correction
    fn set_fec(&mut self, enabled: bool) -> AudioResult<()>;

    /// Indique à l'encodeur le pourcentage de perte attendu (borné à 100)
    fn set_expected_loss(&mut self, percent: u8) -> AudioResult<()>;

    /// Réinitialise l'état interne du codec (prédictions, historique)
    ///
    /// Appelé à chaque nouvelle session pour que le flux reparte proprement.
    fn reset_state(&mut self) -> AudioResult<()>;

    /// Encode une frame brute en paquet prêt à être diffusé
    ///
    /// # Erreurs
    /// - `AudioError::OpusError` : frame de mauvaise taille ou erreur du codec
    fn encode(&mut self, frame: &AudioFrame) -> AudioResult<CompressedFrame>;

    /// Débit actuellement configuré, en kbps
    fn bitrate_kbps(&self) -> u32;

    /// Description courte de l'encodeur
    fn codec_info(&self) -> String {
        "Encodeur vocal".to_string()
    }
}
