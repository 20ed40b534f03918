//! Crate audio du pont micro → sessions vocales
//!
//! Ce crate gère le côté capture de la chaîne :
//! - Énumération des périphériques et capture microphone avec cpal
//! - Slot de transfert entre le thread temps réel et la boucle tokio
//! - Détection d'activité (silence, mute, hangover)
//! - Encodage Opus

pub mod config;      // Configuration audio
pub mod types;       // Types de données (AudioFrame, CompressedFrame)
pub mod traits;      // Trait de l'encodeur
pub mod activity;    // Gate d'activité vocale
pub mod handoff;     // Slot de transfert temps réel → pipeline
pub mod capture;     // Implémentation capture avec cpal
pub mod codec;       // Implémentation Opus
pub mod error;       // Gestion d'erreurs

// Réexports pour faciliter l'utilisation
pub use config::*;
pub use types::*;
pub use traits::*;
pub use error::*;
pub use activity::{ActivityGate, ActivityState, GateDecision};
pub use handoff::{frame_handoff, FrameConsumer, FrameProducer};

// Réexports des implémentations principales
pub use capture::{default_host_api, list_host_apis, list_input_devices, CaptureStream, InputDevice};
pub use codec::OpusEncoder;
