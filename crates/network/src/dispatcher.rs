//! Diffusion de l'état parle / silence
//!
//! Une session n'est notifiée que lorsque l'état diffère du dernier état qui
//! lui a été annoncé. Le dernier état est mis à jour même si l'annonce échoue :
//! une passerelle injoignable ne reçoit pas la même annonce à chaque frame.
//!
//! Les annonces d'une même frame partent ensemble : une passerelle lente ne
//! retarde pas les autres, et la frame attend au plus un délai d'annonce.

use std::time::Duration;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, warn};

use audio::ActivityState;

use crate::{NetworkError, SessionRegistry, VoiceTransport};

/// Résultat d'une diffusion d'état
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Sessions notifiées avec succès
    pub signaled: usize,

    /// Échecs d'annonce
    pub failures: Vec<NetworkError>,
}

impl DispatchReport {
    /// Nombre de sessions dont l'état a changé
    pub fn attempted(&self) -> usize {
        self.signaled + self.failures.len()
    }
}

pub struct SpeakingStateDispatcher {
    timeout: Duration,
}

impl SpeakingStateDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Annonce `state` à chaque session connectée dont le dernier état diffère
    pub async fn dispatch(
        &self,
        registry: &mut SessionRegistry,
        state: ActivityState,
        transport: &dyn VoiceTransport,
    ) -> DispatchReport {
        let mut changed = Vec::new();
        for session in registry.iter_mut() {
            if session.last_state() == state || !session.is_connected() {
                continue;
            }
            session.set_last_state(state);
            changed.push(session.handle().clone());
        }

        let limit = self.timeout;
        let signals = changed.iter().map(|handle| async move {
            match timeout(limit, transport.signal_state(handle, state)).await {
                Ok(result) => (handle, result),
                Err(_) => (handle, Err(NetworkError::timeout("signal", &handle.target().name, limit))),
            }
        });

        let mut report = DispatchReport::default();
        for (handle, result) in join_all(signals).await {
            let channel = &handle.target().name;
            match result {
                Ok(()) => {
                    debug!(channel = %channel, ?state, "État annoncé");
                    report.signaled += 1;
                }
                Err(e) => {
                    warn!(channel = %channel, ?state, error = %e, "Annonce d'état en échec");
                    report.failures.push(e);
                }
            }
        }

        report
    }
}
