//! Types de données pour le système audio
//!
//! - AudioFrame : bloc de 20 ms d'audio brut capturé
//! - CompressedFrame : paquet produit par l'encodeur, envoyé tel quel aux sessions
//! - Sample : type d'un échantillon

use std::time::Instant;

/// Type pour un échantillon audio
///
/// Valeurs entre -1.0 et +1.0, 0.0 = silence. La capture se fait sans
/// écrêtage : des valeurs hors de cet intervalle sont conservées telles quelles.
pub type Sample = f32;

/// Frame d'audio brute (non compressée)
///
/// Une frame contient 20 ms d'audio entrelacé [L, R, L, R, ...].
/// Elle est immuable une fois capturée et passe de main en main :
/// callback de capture → slot de transfert → pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Les échantillons audio entrelacés
    pub samples: Vec<Sample>,

    /// Instant de capture (fin du bloc)
    pub timestamp: Instant,

    /// Numéro de séquence attribué par la capture
    ///
    /// Un trou dans la séquence côté pipeline signale des frames perdues au transfert.
    pub sequence_number: u64,
}

impl AudioFrame {
    /// Crée une nouvelle frame audio
    ///
    /// # Example
    /// ```rust
    /// use audio::AudioFrame;
    ///
    /// let frame = AudioFrame::new(vec![0.1, 0.2, -0.1, 0.0], 42);
    /// assert!(!frame.is_digital_silence());
    /// ```
    pub fn new(samples: Vec<Sample>, sequence_number: u64) -> Self {
        Self {
            samples,
            timestamp: Instant::now(),
            sequence_number,
        }
    }

    /// Crée une frame de silence numérique
    pub fn silence(sample_count: usize, sequence_number: u64) -> Self {
        Self::new(vec![0.0; sample_count], sequence_number)
    }

    /// Copie muette de cette frame : même taille et même séquence, tout à zéro
    pub fn muted(&self) -> Self {
        Self {
            samples: vec![0.0; self.samples.len()],
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
        }
    }

    /// Vrai si chaque échantillon vaut exactement zéro
    ///
    /// Aucun seuil n'est appliqué : un bruit de fond, même très faible,
    /// compte comme de la parole.
    pub fn is_digital_silence(&self) -> bool {
        self.samples.iter().all(|&sample| sample == 0.0)
    }
}

/// Paquet audio encodé
///
/// Ce sont exactement ces bytes qui sont diffusés à toutes les sessions connectées.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedFrame {
    /// Données Opus (format opaque)
    pub data: Vec<u8>,

    /// Nombre d'échantillons de la frame d'origine
    pub original_sample_count: usize,

    /// Instant de capture de la frame d'origine
    pub timestamp: Instant,

    /// Numéro de séquence de la frame d'origine
    pub sequence_number: u64,
}

impl CompressedFrame {
    /// Crée une nouvelle frame compressée
    pub fn new(
        data: Vec<u8>,
        original_sample_count: usize,
        timestamp: Instant,
        sequence_number: u64,
    ) -> Self {
        Self {
            data,
            original_sample_count,
            timestamp,
            sequence_number,
        }
    }
}
