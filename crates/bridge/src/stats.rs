//! Compteurs du pipeline

use std::fmt;

use audio::InputDevice;
use network::ChannelTarget;

/// Statistiques cumulées depuis la création du contrôleur
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames proposées par la capture au slot de transfert
    pub frames_captured: u64,

    /// Frames sorties du slot de transfert et classées
    pub frames_processed: u64,

    /// Frames encodées et diffusées
    pub frames_transmitted: u64,

    /// Frames écartées par le gate (silence prolongé)
    pub frames_skipped: u64,

    /// Frames jetées à l'entrée du slot faute de place
    pub frames_dropped: u64,

    pub encode_failures: u64,
    pub send_failures: u64,
    pub signal_failures: u64,

    /// Sessions retirées après perte de connexion
    pub sessions_pruned: u64,
}

impl PipelineStats {
    /// Part des frames capturées qui ont été diffusées, en pourcentage
    pub fn transmit_ratio(&self) -> f32 {
        if self.frames_captured == 0 {
            return 0.0;
        }
        self.frames_transmitted as f32 * 100.0 / self.frames_captured as f32
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames: {} capturées, {} traitées, {} diffusées, {} écartées, {} perdues | échecs: {} envoi, {} signal, {} encodage",
            self.frames_captured,
            self.frames_processed,
            self.frames_transmitted,
            self.frames_skipped,
            self.frames_dropped,
            self.send_failures,
            self.signal_failures,
            self.encode_failures,
        )
    }
}

/// Photographie de l'état du contrôleur
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerStatus {
    pub muted: bool,
    pub bitrate_kbps: u32,
    pub recording: Option<InputDevice>,
    pub channels: Vec<ChannelTarget>,
    pub stats: PipelineStats,
}
