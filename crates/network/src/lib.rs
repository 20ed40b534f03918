//! Crate network - Sessions vocales sortantes
//!
//! Ce crate porte tout ce qui se passe après l'encodage : l'ouverture et la
//! fermeture des sessions vers les salons, la diffusion des paquets Opus et
//! l'annonce de l'état parle / silence.
//!
//! # Architecture
//!
//! - `error` : erreurs réseau, toutes locales à une session
//! - `types` : salons, connexions, paquets et délais
//! - `traits` : le trait `VoiceTransport`, seule vue du pipeline sur le transport
//! - `transport` : transport UDP réel et transport simulé pour les tests
//! - `session` : registre ordonné des sessions et diffusion des paquets
//! - `dispatcher` : annonce de l'état aux seules sessions concernées
//! - `sink` : pair de réception minimal pour le transport UDP
//!
//! # Exemple
//!
//! ```rust,no_run
//! use network::{ChannelTarget, NetworkConfig, SessionRegistry, UdpVoiceTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NetworkConfig::default();
//! let transport = UdpVoiceTransport::bind(config.clone()).await?;
//! let mut registry = SessionRegistry::new(config);
//!
//! registry.join(&transport, ChannelTarget::new("general", "192.168.1.100:9001".parse()?)).await?;
//! let report = registry.fan_out(&transport, &[0xF8, 0xFF, 0xFE]).await;
//! println!("{} session(s) servie(s)", report.delivered);
//! # Ok(())
//! # }
//! ```

// Modules internes
mod error;
mod types;
mod traits;
mod transport;
mod session;
mod dispatcher;
mod sink;

// Re-exports publics
pub use error::{NetworkError, NetworkResult};

pub use types::{ChannelTarget, ConnectionHandle, NetworkConfig, PacketType, VoicePacket};

pub use traits::VoiceTransport;

pub use transport::{SimulatedTransport, UdpVoiceTransport};

pub use session::{close_session, open_session, FanOutReport, JoinOutcome, LeaveReport, SessionRegistry, VoiceSession};

pub use dispatcher::{DispatchReport, SpeakingStateDispatcher};

pub use sink::{PacketSink, SinkSession, SinkStats};

/// Fonctions utilitaires pour l'utilisateur final
pub mod utils {
    use super::*;
    use std::net::SocketAddr;

    /// Parse une adresse IP:PORT depuis une string
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    ///
    /// let addr = utils::parse_address("192.168.1.100:9001").unwrap();
    /// assert_eq!(addr.port(), 9001);
    /// ```
    pub fn parse_address(addr_str: &str) -> NetworkResult<SocketAddr> {
        addr_str.trim().parse().map_err(|_| NetworkError::InvalidAddress {
            addr: addr_str.to_string(),
        })
    }

    /// Parse un salon au format "NOM=IP:PORT"
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    ///
    /// let target = utils::parse_target("general=127.0.0.1:9001").unwrap();
    /// assert_eq!(target.name, "general");
    /// ```
    pub fn parse_target(spec: &str) -> NetworkResult<ChannelTarget> {
        let (name, addr) = spec.split_once('=').ok_or_else(|| NetworkError::InvalidAddress {
            addr: spec.to_string(),
        })?;

        let name = name.trim();
        if name.is_empty() {
            return Err(NetworkError::InvalidAddress { addr: spec.to_string() });
        }

        Ok(ChannelTarget::new(name, parse_address(addr)?))
    }

    /// Formate une taille en bytes de façon lisible
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    ///
    /// assert_eq!(utils::format_bytes(1024), "1.0 KB");
    /// assert_eq!(utils::format_bytes(500), "500 B");
    /// ```
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB"];

        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", bytes, UNITS[unit_index])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }
}
