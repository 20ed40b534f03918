//! Registre des sessions vocales sortantes
//!
//! Une session existe entre un `join` réussi et le `leave` correspondant (ou
//! la perte de sa connexion). Le registre est la cible de la diffusion : le
//! même paquet encodé part vers chaque session connectée, et l'échec d'une
//! session n'empêche jamais la livraison aux autres.
//!
//! Les envois d'une frame partent en parallèle : le coût d'une frame est
//! borné par un seul délai d'envoi, quel que soit le nombre de sessions lentes.

use std::time::Duration;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use audio::ActivityState;

use crate::{ChannelTarget, ConnectionHandle, NetworkConfig, NetworkError, NetworkResult, VoiceTransport};

/// Session connectée à un salon
#[derive(Clone, Debug)]
pub struct VoiceSession {
    handle: ConnectionHandle,

    /// Dernier état annoncé au salon (Silent à la création)
    last_state: ActivityState,
}

impl VoiceSession {
    fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            last_state: ActivityState::Silent,
        }
    }

    pub fn target(&self) -> &ChannelTarget {
        self.handle.target()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn last_state(&self) -> ActivityState {
        self.last_state
    }

    pub(crate) fn set_last_state(&mut self, state: ActivityState) {
        self.last_state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}

/// Ouvre une connexion vers un salon, bornée par `limit`
///
/// Ne touche à aucun registre : l'appelant enregistre le handle obtenu avec
/// `SessionRegistry::insert`, éventuellement depuis une autre tâche.
pub async fn open_session(
    transport: &dyn VoiceTransport,
    target: &ChannelTarget,
    limit: Duration,
) -> NetworkResult<ConnectionHandle> {
    match timeout(limit, transport.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::timeout("connect", &target.name, limit)),
    }
}

/// Ferme une connexion, bornée par `limit`
///
/// Le handle est marqué déconnecté même si la fermeture n'aboutit pas.
pub async fn close_session(transport: &dyn VoiceTransport, handle: &ConnectionHandle, limit: Duration) -> NetworkResult<()> {
    match timeout(limit, transport.disconnect(handle)).await {
        Ok(result) => result,
        Err(_) => {
            handle.mark_disconnected();
            Err(NetworkError::timeout("disconnect", &handle.target().name, limit))
        }
    }
}

/// Résultat d'un join réussi
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Nouvelle session ouverte
    Joined,
    /// Le salon était déjà rejoint : aucune nouvelle connexion
    AlreadyJoined,
}

/// Résultat d'un leave
#[derive(Debug, Default)]
pub struct LeaveReport {
    /// Vrai si une session a été retirée du registre
    pub removed: bool,

    /// Échecs de déconnexion (la session est retirée malgré tout)
    pub failures: Vec<NetworkError>,
}

/// Résultat de la diffusion d'un paquet
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Nombre de sessions ayant reçu le paquet
    pub delivered: usize,

    /// Échecs par session
    pub failures: Vec<NetworkError>,
}

/// Registre ordonné des sessions
pub struct SessionRegistry {
    sessions: Vec<VoiceSession>,
    config: NetworkConfig,
}

impl SessionRegistry {
    pub fn new(config: NetworkConfig) -> Self {
        Self { sessions: Vec::new(), config }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.get(channel).is_some()
    }

    pub fn get(&self, channel: &str) -> Option<&VoiceSession> {
        self.sessions.iter().find(|s| s.target().name == channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VoiceSession> {
        self.sessions.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut VoiceSession> {
        self.sessions.iter_mut()
    }

    /// Salons rejoints, dans l'ordre des joins
    pub fn targets(&self) -> Vec<ChannelTarget> {
        self.sessions.iter().map(|s| s.target().clone()).collect()
    }

    /// Rejoint un salon
    ///
    /// Idempotent : si le salon est déjà rejoint, aucune connexion n'est tentée.
    /// En cas d'échec (ou de délai dépassé) la session n'est pas enregistrée.
    pub async fn join(&mut self, transport: &dyn VoiceTransport, target: ChannelTarget) -> NetworkResult<JoinOutcome> {
        if self.contains(&target.name) {
            debug!(channel = %target.name, "Salon déjà rejoint");
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let handle = open_session(transport, &target, self.config.connect_timeout()).await?;
        Ok(self.insert(handle))
    }

    /// Enregistre une connexion déjà ouverte
    ///
    /// Si le salon est déjà rejoint, la session existante est conservée et
    /// la connexion en trop est marquée déconnectée.
    pub fn insert(&mut self, handle: ConnectionHandle) -> JoinOutcome {
        if self.contains(&handle.target().name) {
            handle.mark_disconnected();
            return JoinOutcome::AlreadyJoined;
        }

        info!(channel = %handle.target(), session_id = handle.id(), "Salon rejoint");
        self.sessions.push(VoiceSession::new(handle));
        JoinOutcome::Joined
    }

    /// Retire une session sans la déconnecter
    pub fn remove(&mut self, channel: &str) -> Option<VoiceSession> {
        let index = self.sessions.iter().position(|s| s.target().name == channel)?;
        Some(self.sessions.remove(index))
    }

    /// Quitte un salon
    ///
    /// Sans effet si le salon n'est pas rejoint. La session est retirée du
    /// registre avant la déconnexion : un échec de fermeture est collecté mais
    /// ne la garde pas enregistrée.
    pub async fn leave(&mut self, transport: &dyn VoiceTransport, channel: &str) -> LeaveReport {
        let Some(session) = self.remove(channel) else {
            debug!(channel, "Leave ignoré : salon non rejoint");
            return LeaveReport::default();
        };

        let mut report = LeaveReport { removed: true, failures: Vec::new() };

        if let Err(e) = close_session(transport, session.handle(), self.config.disconnect_timeout()).await {
            warn!(channel, error = %e, "Déconnexion en échec, session retirée quand même");
            report.failures.push(e);
        }

        info!(channel, "Salon quitté");
        report
    }

    /// Quitte tous les salons et retourne les échecs de déconnexion
    pub async fn leave_all(&mut self, transport: &dyn VoiceTransport) -> Vec<NetworkError> {
        let limit = self.config.disconnect_timeout();
        let sessions = std::mem::take(&mut self.sessions);
        let closing = sessions.iter().map(|session| close_session(transport, session.handle(), limit));

        let mut failures = Vec::new();
        for (session, result) in sessions.iter().zip(join_all(closing).await) {
            if let Err(e) = result {
                warn!(channel = %session.target().name, error = %e, "Déconnexion en échec");
                failures.push(e);
            }
        }
        failures
    }

    /// Retire les sessions dont la connexion a été perdue
    pub fn prune_disconnected(&mut self) -> Vec<ChannelTarget> {
        let mut pruned = Vec::new();
        self.sessions.retain(|session| {
            if session.is_connected() {
                true
            } else {
                pruned.push(session.target().clone());
                false
            }
        });

        for target in &pruned {
            info!(channel = %target, "Session perdue, retirée du registre");
        }
        pruned
    }

    /// Diffuse un paquet à toutes les sessions connectées
    ///
    /// Les envois partent ensemble, chacun avec son propre délai ; un échec
    /// est journalisé et collecté sans retarder les autres sessions.
    pub async fn fan_out(&self, transport: &dyn VoiceTransport, packet: &[u8]) -> FanOutReport {
        let limit = self.config.send_timeout();
        let sends = self.sessions.iter().filter(|s| s.is_connected()).map(|session| async move {
            match timeout(limit, transport.send(session.handle(), packet)).await {
                Ok(result) => (session, result),
                Err(_) => (session, Err(NetworkError::timeout("send", &session.target().name, limit))),
            }
        });

        let mut report = FanOutReport::default();
        for (session, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(channel = %session.target().name, operation = e.operation(), error = %e, "Envoi audio en échec");
                    report.failures.push(e);
                }
            }
        }

        report
    }
}
