//! Crate bridge - Pont micro → sessions vocales
//!
//! Assemble la capture et l'encodage (crate `audio`) avec les sessions
//! sortantes (crate `network`) dans un pipeline piloté frame par frame.
//!
//! - `config` : configuration TOML complète du pont
//! - `controller` : boucle du pipeline, réglages et poignée de commande
//! - `stats` : compteurs et photographie de l'état
//! - `error` : erreurs remontées aux appelants

mod config;
mod controller;
mod error;
mod stats;

pub use config::BridgeConfig;
pub use controller::{ControllerHandle, PipelineController};
pub use error::{BridgeError, BridgeResult};
pub use stats::{ControllerStatus, PipelineStats};
