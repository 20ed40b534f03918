//! Détection d'activité vocale par frame
//!
//! Le gate classe chaque frame (muette, silencieuse ou parlée) et en déduit
//! deux décisions : l'état "en train de parler" annoncé aux sessions, et
//! s'il faut encoder et transmettre la frame.
//!
//! ```text
//! silence consécutif :  0   1   2   3   4 ...
//! état               :  S   S   -   -   -      (S = Speaking, - = Silent)
//! transmission       :  oui oui oui non non
//! ```
//!
//! Une seule frame silencieuse ne fait pas basculer l'état (hangover d'une
//! frame), et la dernière frame transmise est celle qui annonce Silent.

use serde::{Deserialize, Serialize};

use crate::AudioFrame;

/// État d'activité annoncé aux sessions
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityState {
    /// L'utilisateur parle
    Speaking,
    /// Aucun son transmis
    #[default]
    Silent,
}

impl ActivityState {
    pub fn is_speaking(self) -> bool {
        matches!(self, ActivityState::Speaking)
    }
}

/// Résultat de la classification d'une frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GateDecision {
    /// État à annoncer pour cette frame
    pub state: ActivityState,

    /// Vrai si la frame doit être encodée puis diffusée
    pub should_transmit: bool,

    /// Valeur du compteur de silence après cette frame
    pub consecutive_silence: u32,
}

/// Gate d'activité avec hangover
///
/// Le compteur de silence consécutif appartient à l'instance : deux pipelines
/// indépendants ont chacun leur propre gate.
#[derive(Clone, Debug, Default)]
pub struct ActivityGate {
    consecutive_silence: u32,
}

impl ActivityGate {
    /// Nombre de frames silencieuses tolérées avant de passer à Silent
    pub const SPEAKING_HANGOVER: u32 = 1;

    /// Nombre de frames silencieuses encore transmises
    pub const TRANSMIT_HANGOVER: u32 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Compteur de silence consécutif courant
    pub fn consecutive_silence(&self) -> u32 {
        self.consecutive_silence
    }

    /// Classe une frame et met à jour le compteur
    ///
    /// Une frame muette est traitée comme une frame de zéros, quel que soit
    /// son contenu réel. Le compteur sature plutôt que de déborder.
    pub fn classify(&mut self, frame: &AudioFrame, muted: bool) -> GateDecision {
        if muted || frame.is_digital_silence() {
            self.consecutive_silence = self.consecutive_silence.saturating_add(1);
        } else {
            self.consecutive_silence = 0;
        }

        Self::decide(self.consecutive_silence)
    }

    /// Décision pure à partir d'une valeur du compteur
    pub fn decide(consecutive_silence: u32) -> GateDecision {
        let state = if consecutive_silence <= Self::SPEAKING_HANGOVER {
            ActivityState::Speaking
        } else {
            ActivityState::Silent
        };

        GateDecision {
            state,
            should_transmit: consecutive_silence <= Self::TRANSMIT_HANGOVER,
            consecutive_silence,
        }
    }
}
