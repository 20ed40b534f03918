//! Contrôleur du pipeline micro → sessions vocales
//!
//! Le contrôleur possède tout l'état mutable du pipeline : le gate
//! d'activité, le drapeau de sourdine, l'encodeur partagé, le registre des
//! sessions et le stream de capture. Tout s'exécute séquentiellement dans sa
//! boucle `run`, sur une seule tâche :
//!
//! ```text
//! capture (thread temps réel) ──offer──► slot ──► run ──► gate ──► dispatcher
//!                                                  │                    │
//!                                                  └──► encodeur ──► fan-out
//! ```
//!
//! Les autres tâches (entrée utilisateur, signaux) pilotent le contrôleur
//! à travers un `ControllerHandle` : les commandes passent par un canal et
//! sont traitées entre deux frames, l'arrêt passe par un `CancellationToken`
//! consulté avant chaque attente.
//!
//! Les connexions et déconnexions des salons tournent dans leurs propres
//! tâches : pendant qu'un salon met du temps à répondre, les frames
//! continuent de partir vers les sessions déjà ouvertes. Une connexion
//! terminée revient à la boucle, qui enregistre la session.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use audio::{
    default_host_api, frame_handoff, list_host_apis, list_input_devices, ActivityGate, AudioConfig,
    AudioError, AudioFrame, CaptureStream, FrameConsumer, FrameProducer, GateDecision, InputDevice,
    OpusEncoder, VoiceEncoder,
};
use network::{
    close_session, open_session, ChannelTarget, ConnectionHandle, JoinOutcome, LeaveReport, NetworkConfig,
    NetworkError, NetworkResult, SessionRegistry, SpeakingStateDispatcher, VoiceTransport,
};

use crate::{BridgeConfig, BridgeError, BridgeResult, ControllerStatus, PipelineStats};

/// Commandes en attente au-delà desquelles `ControllerHandle` patiente
const COMMAND_CAPACITY: usize = 32;

enum ControlCommand {
    Join { target: ChannelTarget, reply: oneshot::Sender<BridgeResult<JoinOutcome>> },
    Leave { channel: String, reply: oneshot::Sender<LeaveReport> },
    SetMuted(bool),
    SetBitrate { kbps: u32, reply: oneshot::Sender<BridgeResult<u32>> },
    SetFec { enabled: bool, reply: oneshot::Sender<BridgeResult<()>> },
    SetExpectedLoss { percent: u8, reply: oneshot::Sender<BridgeResult<()>> },
    StartRecording { host_api: String, device: String, reply: oneshot::Sender<BridgeResult<InputDevice>> },
    StopRecording,
    Status { reply: oneshot::Sender<ControllerStatus> },
}

type JoinReply = oneshot::Sender<BridgeResult<JoinOutcome>>;

/// Connexion en cours vers un salon
struct PendingJoin {
    id: u64,
    waiters: Vec<JoinReply>,
    task: AbortHandle,
}

/// Connexion terminée, renvoyée à la boucle
struct JoinCompletion {
    id: u64,
    target: ChannelTarget,
    result: NetworkResult<ConnectionHandle>,
}

pub struct PipelineController {
    audio: AudioConfig,
    transport: Arc<dyn VoiceTransport>,

    /// Encodeur unique, partagé par toutes les sessions
    encoder: Box<dyn VoiceEncoder>,

    registry: SessionRegistry,
    dispatcher: SpeakingStateDispatcher,
    gate: ActivityGate,
    muted: bool,

    producer: FrameProducer,
    frames: Option<FrameConsumer>,

    /// Au plus un stream ouvert
    stream: Option<CaptureStream>,

    stats: PipelineStats,

    commands: mpsc::Receiver<ControlCommand>,
    command_tx: mpsc::Sender<ControlCommand>,
    stop: CancellationToken,

    /// Au plus une connexion en cours par salon
    pending_joins: HashMap<String, PendingJoin>,
    next_join_id: u64,
    completions: mpsc::UnboundedReceiver<JoinCompletion>,
    completion_tx: mpsc::UnboundedSender<JoinCompletion>,
}

impl PipelineController {
    pub fn new(
        audio: AudioConfig,
        network: NetworkConfig,
        transport: Arc<dyn VoiceTransport>,
        encoder: Box<dyn VoiceEncoder>,
    ) -> Self {
        let (producer, frames) = frame_handoff();
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (completion_tx, completions) = mpsc::unbounded_channel();

        Self {
            audio,
            transport,
            encoder,
            dispatcher: SpeakingStateDispatcher::new(network.signal_timeout()),
            registry: SessionRegistry::new(network),
            gate: ActivityGate::new(),
            muted: false,
            producer,
            frames: Some(frames),
            stream: None,
            stats: PipelineStats::default(),
            commands,
            command_tx,
            stop: CancellationToken::new(),
            pending_joins: HashMap::new(),
            next_join_id: 0,
            completions,
            completion_tx,
        }
    }

    /// Crée un contrôleur avec un encodeur Opus configuré depuis le fichier
    pub fn from_config(config: &BridgeConfig, transport: Arc<dyn VoiceTransport>) -> BridgeResult<Self> {
        let encoder = OpusEncoder::new(config.audio.clone())?;
        info!(codec = %encoder.codec_info(), transport = %transport.transport_info(), "Contrôleur créé");

        let mut controller = Self::new(config.audio.clone(), config.network.clone(), transport, Box::new(encoder));
        controller.muted = config.start_muted;
        Ok(controller)
    }

    /// Poignée de commande, utilisable depuis n'importe quelle tâche
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            commands: self.command_tx.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Entrée du slot de transfert (celle que reçoit le stream de capture)
    pub fn producer(&self) -> FrameProducer {
        self.producer.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.encoder.bitrate_kbps()
    }

    pub fn is_recording(&self) -> bool {
        self.stream.is_some()
    }

    pub fn recording_device(&self) -> Option<&InputDevice> {
        self.stream.as_ref().map(CaptureStream::device)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            muted: self.muted,
            bitrate_kbps: self.bitrate_kbps(),
            recording: self.recording_device().cloned(),
            channels: self.registry.targets(),
            stats: self.stats.clone(),
        }
    }

    pub fn list_host_apis() -> Vec<String> {
        list_host_apis()
    }

    pub fn list_input_devices(host_api: &str) -> Vec<InputDevice> {
        list_input_devices(host_api)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Rejoint un salon et attend la fin de la connexion
    ///
    /// Un nouveau join réinitialise l'encodeur partagé, y compris pour les
    /// sessions déjà ouvertes. Depuis la boucle `run`, les joins passent par
    /// `ControllerHandle::join` et ne bloquent pas les frames.
    pub async fn join(&mut self, target: ChannelTarget) -> BridgeResult<JoinOutcome> {
        let (reply, mut response) = oneshot::channel();
        self.begin_join(target, reply);

        loop {
            match response.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Closed) => return Err(BridgeError::ControllerStopped),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            let completion = self.completions.recv().await.ok_or(BridgeError::ControllerStopped)?;
            self.complete_join(completion);
        }
    }

    /// Lance la connexion à un salon dans sa propre tâche
    ///
    /// Un salon déjà rejoint répond tout de suite ; un salon dont la
    /// connexion est en cours ajoute le demandeur à la liste d'attente, sans
    /// nouvelle tentative.
    fn begin_join(&mut self, target: ChannelTarget, reply: JoinReply) {
        if self.registry.contains(&target.name) {
            debug!(channel = %target.name, "Salon déjà rejoint");
            let _ = reply.send(Ok(JoinOutcome::AlreadyJoined));
            return;
        }

        if let Some(pending) = self.pending_joins.get_mut(&target.name) {
            debug!(channel = %target.name, "Connexion déjà en cours");
            pending.waiters.push(reply);
            return;
        }

        let id = self.next_join_id;
        self.next_join_id += 1;

        let name = target.name.clone();
        let transport = Arc::clone(&self.transport);
        let completions = self.completion_tx.clone();
        let limit = self.registry.config().connect_timeout();

        let task = tokio::spawn(async move {
            let result = open_session(transport.as_ref(), &target, limit).await;
            let _ = completions.send(JoinCompletion { id, target, result });
        });

        self.pending_joins.insert(name, PendingJoin { id, waiters: vec![reply], task: task.abort_handle() });
    }

    /// Enregistre la session d'une connexion terminée et répond aux demandeurs
    fn complete_join(&mut self, completion: JoinCompletion) {
        let JoinCompletion { id, target, result } = completion;

        let mut pending = match self.pending_joins.remove(&target.name) {
            Some(pending) if pending.id == id => pending,
            other => {
                // Join annulé entre-temps : la connexion obtenue est refermée
                if let Some(current) = other {
                    self.pending_joins.insert(target.name.clone(), current);
                }
                if let Ok(handle) = result {
                    self.close_in_background(handle);
                }
                return;
            }
        };

        match result {
            Ok(handle) => {
                let outcome = self.registry.insert(handle);
                if outcome == JoinOutcome::Joined {
                    if let Err(e) = self.encoder.reset_state() {
                        warn!(error = %e, "Réinitialisation de l'encodeur impossible");
                    }
                }

                for waiter in pending.waiters.drain(1..) {
                    let _ = waiter.send(Ok(JoinOutcome::AlreadyJoined));
                }
                if let Some(first) = pending.waiters.pop() {
                    let _ = first.send(Ok(outcome));
                }
            }
            Err(e) => {
                warn!(channel = %target.name, error = %e, "Join impossible");
                for waiter in pending.waiters.drain(1..) {
                    let _ = waiter.send(Err(same_failure(&target.name, &e).into()));
                }
                if let Some(first) = pending.waiters.pop() {
                    let _ = first.send(Err(e.into()));
                }
            }
        }
    }

    /// Abandonne la connexion en cours vers un salon
    fn cancel_join(&mut self, channel: &str) {
        let Some(pending) = self.pending_joins.remove(channel) else {
            return;
        };

        pending.task.abort();
        info!(channel, "Connexion en cours abandonnée");
        for waiter in pending.waiters {
            let _ = waiter.send(Err(BridgeError::JoinCancelled { channel: channel.to_string() }));
        }
    }

    /// Abandonne toutes les connexions en cours ; les demandeurs reçoivent
    /// `ControllerStopped`
    fn abandon_pending_joins(&mut self) {
        for (_, pending) in self.pending_joins.drain() {
            pending.task.abort();
        }
    }

    fn close_in_background(&self, handle: ConnectionHandle) {
        let transport = Arc::clone(&self.transport);
        let limit = self.registry.config().disconnect_timeout();

        tokio::spawn(async move {
            if let Err(e) = close_session(transport.as_ref(), &handle, limit).await {
                warn!(channel = %handle.target().name, error = %e, "Fermeture d'une connexion abandonnée en échec");
            }
        });
    }

    /// Quitte un salon (sans effet s'il n'est pas rejoint)
    ///
    /// Une connexion encore en cours vers ce salon est abandonnée.
    pub async fn leave(&mut self, channel: &str) -> LeaveReport {
        self.cancel_join(channel);
        self.registry.leave(self.transport.as_ref(), channel).await
    }

    /// Retire la session tout de suite et la ferme dans sa propre tâche
    fn begin_leave(&mut self, channel: String, reply: oneshot::Sender<LeaveReport>) {
        self.cancel_join(&channel);

        let Some(session) = self.registry.remove(&channel) else {
            debug!(channel = %channel, "Leave ignoré : salon non rejoint");
            let _ = reply.send(LeaveReport::default());
            return;
        };

        let transport = Arc::clone(&self.transport);
        let limit = self.registry.config().disconnect_timeout();

        tokio::spawn(async move {
            let mut report = LeaveReport { removed: true, failures: Vec::new() };
            if let Err(e) = close_session(transport.as_ref(), session.handle(), limit).await {
                warn!(channel = %channel, error = %e, "Déconnexion en échec, session retirée quand même");
                report.failures.push(e);
            }
            info!(channel = %channel, "Salon quitté");
            let _ = reply.send(report);
        });
    }

    // ------------------------------------------------------------------
    // Réglages, effectifs dès la frame suivante
    // ------------------------------------------------------------------

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            info!(muted, "Sourdine");
        }
        self.muted = muted;
    }

    /// Règle le débit ; retourne la valeur bornée à [12, 512] kbps
    pub fn set_bitrate(&mut self, kbps: u32) -> BridgeResult<u32> {
        let applied = self.encoder.set_bitrate(kbps)?;
        if applied != kbps {
            debug!(requested = kbps, applied, "Bitrate borné");
        }
        Ok(applied)
    }

    pub fn set_fec(&mut self, enabled: bool) -> BridgeResult<()> {
        Ok(self.encoder.set_fec(enabled)?)
    }

    /// Règle la perte attendue ; l'encodeur la borne à [0, 100] %
    pub fn set_expected_loss(&mut self, percent: u8) -> BridgeResult<()> {
        Ok(self.encoder.set_expected_loss(percent)?)
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    /// Ouvre la capture sur un périphérique
    ///
    /// Le stream courant est fermé avant l'ouverture du nouveau ; en cas
    /// d'échec le contrôleur reste sans stream.
    pub fn start_recording(&mut self, host_api: &str, device: &str) -> BridgeResult<InputDevice> {
        self.stop_recording();

        match CaptureStream::open(host_api, device, &self.audio, self.producer.clone()) {
            Ok(stream) => {
                let opened = stream.device().clone();
                self.stream = Some(stream);
                Ok(opened)
            }
            Err(e) => {
                warn!(host_api, device, error = %e, "Ouverture de la capture impossible");
                Err(e.into())
            }
        }
    }

    /// Ouvre la capture en complétant l'API hôte et le périphérique par leurs défauts
    pub fn start_default_recording(&mut self, host_api: Option<&str>, device: Option<&str>) -> BridgeResult<InputDevice> {
        let host_api = host_api.map(str::to_string).unwrap_or_else(default_host_api);

        let device = match device {
            Some(device) => device.to_string(),
            None => list_input_devices(&host_api)
                .into_iter()
                .find(|d| d.is_default)
                .map(|d| d.name)
                .ok_or_else(|| AudioError::DeviceNotFound {
                    host_api: host_api.clone(),
                    device: "(défaut)".to_string(),
                })?,
        };

        self.start_recording(&host_api, &device)
    }

    pub fn stop_recording(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    /// Traite une frame : gate, annonce d'état, encodage puis diffusion
    ///
    /// Aucune erreur ne remonte : les échecs par session sont journalisés
    /// et comptés.
    pub async fn process_frame(&mut self, frame: AudioFrame) -> GateDecision {
        self.stats.frames_processed += 1;
        self.stats.sessions_pruned += self.registry.prune_disconnected().len() as u64;

        let decision = self.gate.classify(&frame, self.muted);

        let report = self
            .dispatcher
            .dispatch(&mut self.registry, decision.state, self.transport.as_ref())
            .await;
        self.stats.signal_failures += report.failures.len() as u64;

        if !decision.should_transmit {
            self.stats.frames_skipped += 1;
            return decision;
        }

        let encoded = if self.muted {
            self.encoder.encode(&frame.muted())
        } else {
            self.encoder.encode(&frame)
        };

        let packet = match encoded {
            Ok(packet) => packet,
            Err(e) => {
                warn!(sequence = frame.sequence_number, error = %e, "Encodage impossible, frame ignorée");
                self.stats.encode_failures += 1;
                return decision;
            }
        };

        let report = self.registry.fan_out(self.transport.as_ref(), &packet.data).await;
        self.stats.frames_transmitted += 1;
        self.stats.send_failures += report.failures.len() as u64;

        decision
    }

    /// Boucle principale
    ///
    /// Traite les frames et les commandes jusqu'à la demande d'arrêt. La
    /// frame en cours est terminée avant de sortir. Ne peut être lancée
    /// qu'une fois : les commandes envoyées après la sortie échouent avec
    /// `BridgeError::ControllerStopped`.
    pub async fn run(&mut self) -> BridgeResult<()> {
        let mut frames = self.frames.take().ok_or(BridgeError::ControllerStopped)?;
        info!(muted = self.muted, bitrate_kbps = self.bitrate_kbps(), "Pipeline démarré");

        loop {
            self.record_handoff(&frames);
            if self.stop.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,
                Some(completion) = self.completions.recv() => self.complete_join(completion),
                Some(command) = self.commands.recv() => self.handle_command(command),
                frame = frames.next_frame() => match frame {
                    Some(frame) => {
                        self.process_frame(frame).await;
                    }
                    None => {
                        debug!("Slot de transfert fermé");
                        break;
                    }
                },
            }
        }

        // Les frames proposées après l'arrêt sont refusées et comptées
        frames.close();
        if frames.try_next().is_some() {
            debug!("Frame en attente abandonnée à l'arrêt");
        }
        self.record_handoff(&frames);

        self.commands.close();
        while self.commands.try_recv().is_ok() {}
        self.abandon_pending_joins();

        info!(stats = %self.stats, "Pipeline arrêté");
        Ok(())
    }

    fn record_handoff(&mut self, frames: &FrameConsumer) {
        self.stats.frames_captured = frames.offered_frames();
        self.stats.frames_dropped = frames.dropped_frames();
    }

    fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Join { target, reply } => self.begin_join(target, reply),
            ControlCommand::Leave { channel, reply } => self.begin_leave(channel, reply),
            ControlCommand::SetMuted(muted) => self.set_muted(muted),
            ControlCommand::SetBitrate { kbps, reply } => {
                let _ = reply.send(self.set_bitrate(kbps));
            }
            ControlCommand::SetFec { enabled, reply } => {
                let _ = reply.send(self.set_fec(enabled));
            }
            ControlCommand::SetExpectedLoss { percent, reply } => {
                let _ = reply.send(self.set_expected_loss(percent));
            }
            ControlCommand::StartRecording { host_api, device, reply } => {
                let _ = reply.send(self.start_recording(&host_api, &device));
            }
            ControlCommand::StopRecording => self.stop_recording(),
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Arrête le pipeline, ferme la capture et quitte tous les salons
    ///
    /// Retourne les échecs de déconnexion ; les sessions sont retirées dans
    /// tous les cas. Les connexions encore en cours sont abandonnées.
    pub async fn shutdown(&mut self) -> Vec<NetworkError> {
        self.stop.cancel();
        self.stop_recording();

        self.abandon_pending_joins();
        let mut stray = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            if let Ok(handle) = completion.result {
                stray.push(handle);
            }
        }

        let mut failures = self.registry.leave_all(self.transport.as_ref()).await;
        let limit = self.registry.config().disconnect_timeout();
        for handle in stray {
            if let Err(e) = close_session(self.transport.as_ref(), &handle, limit).await {
                failures.push(e);
            }
        }
        info!(failures = failures.len(), "Arrêt terminé");
        failures
    }
}

/// Copie d'un échec de connexion pour les demandeurs en attente du même salon
fn same_failure(channel: &str, error: &NetworkError) -> NetworkError {
    match error {
        NetworkError::ConnectionTimeout { operation, target, timeout_ms } => NetworkError::ConnectionTimeout {
            operation: *operation,
            target: target.clone(),
            timeout_ms: *timeout_ms,
        },
        other => NetworkError::connect_failed(channel, other),
    }
}

/// Poignée de commande du contrôleur
///
/// Clonable et `Send` : le contrôleur lui-même reste sur sa tâche (le stream
/// de capture n'est pas forcément `Send`).
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControlCommand>,
    stop: CancellationToken,
}

impl ControllerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand) -> BridgeResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BridgeError::ControllerStopped)?;
        response.await.map_err(|_| BridgeError::ControllerStopped)
    }

    async fn notify(&self, command: ControlCommand) -> BridgeResult<()> {
        self.commands.send(command).await.map_err(|_| BridgeError::ControllerStopped)
    }

    pub async fn join(&self, target: ChannelTarget) -> BridgeResult<JoinOutcome> {
        self.request(|reply| ControlCommand::Join { target, reply }).await?
    }

    pub async fn leave(&self, channel: impl Into<String>) -> BridgeResult<LeaveReport> {
        let channel = channel.into();
        self.request(|reply| ControlCommand::Leave { channel, reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> BridgeResult<()> {
        self.notify(ControlCommand::SetMuted(muted)).await
    }

    pub async fn set_bitrate(&self, kbps: u32) -> BridgeResult<u32> {
        self.request(|reply| ControlCommand::SetBitrate { kbps, reply }).await?
    }

    pub async fn set_fec(&self, enabled: bool) -> BridgeResult<()> {
        self.request(|reply| ControlCommand::SetFec { enabled, reply }).await?
    }

    pub async fn set_expected_loss(&self, percent: u8) -> BridgeResult<()> {
        self.request(|reply| ControlCommand::SetExpectedLoss { percent, reply }).await?
    }

    pub async fn start_recording(&self, host_api: impl Into<String>, device: impl Into<String>) -> BridgeResult<InputDevice> {
        let (host_api, device) = (host_api.into(), device.into());
        self.request(|reply| ControlCommand::StartRecording { host_api, device, reply }).await?
    }

    pub async fn stop_recording(&self) -> BridgeResult<()> {
        self.notify(ControlCommand::StopRecording).await
    }

    pub async fn status(&self) -> BridgeResult<ControllerStatus> {
        self.request(|reply| ControlCommand::Status { reply }).await
    }

    /// Demande l'arrêt de la boucle (sans attendre)
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio::{ActivityState, AudioResult, CompressedFrame};
    use network::SimulatedTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const FRAME_LEN: usize = 1920;

    #[derive(Clone, Default)]
    struct EncoderProbe {
        encodes: Arc<AtomicUsize>,
        silent_encodes: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        expected_loss: Arc<AtomicUsize>,
    }

    impl EncoderProbe {
        fn encodes(&self) -> usize {
            self.encodes.load(Ordering::SeqCst)
        }
        fn silent_encodes(&self) -> usize {
            self.silent_encodes.load(Ordering::SeqCst)
        }
        fn resets(&self) -> usize {
            self.resets.load(Ordering::SeqCst)
        }
        fn expected_loss(&self) -> usize {
            self.expected_loss.load(Ordering::SeqCst)
        }
    }

    /// Encodeur factice : compte les appels, le paquet est le numéro de séquence
    struct CountingEncoder {
        probe: EncoderProbe,
        bitrate: u32,
    }

    impl VoiceEncoder for CountingEncoder {
        fn set_bitrate(&mut self, kbps: u32) -> AudioResult<u32> {
            self.bitrate = AudioConfig::clamp_bitrate_kbps(kbps);
            Ok(self.bitrate)
        }

        fn set_fec(&mut self, _enabled: bool) -> AudioResult<()> {
            Ok(())
        }

        fn set_expected_loss(&mut self, percent: u8) -> AudioResult<()> {
            self.probe.expected_loss.store(percent as usize, Ordering::SeqCst);
            Ok(())
        }

        fn reset_state(&mut self) -> AudioResult<()> {
            self.probe.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn encode(&mut self, frame: &AudioFrame) -> AudioResult<CompressedFrame> {
            self.probe.encodes.fetch_add(1, Ordering::SeqCst);
            if frame.is_digital_silence() {
                self.probe.silent_encodes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(CompressedFrame::new(
                vec![frame.sequence_number as u8],
                frame.samples.len(),
                frame.timestamp,
                frame.sequence_number,
            ))
        }

        fn bitrate_kbps(&self) -> u32 {
            self.bitrate
        }
    }

    fn controller() -> (PipelineController, Arc<SimulatedTransport>, EncoderProbe) {
        let transport = Arc::new(SimulatedTransport::new());
        let probe = EncoderProbe::default();
        let encoder = CountingEncoder { probe: probe.clone(), bitrate: 128 };

        let controller = PipelineController::new(
            AudioConfig::default(),
            NetworkConfig::test_config(),
            transport.clone(),
            Box::new(encoder),
        );
        (controller, transport, probe)
    }

    fn target(name: &str) -> ChannelTarget {
        ChannelTarget::new(name, "127.0.0.1:9001".parse().unwrap())
    }

    fn voiced(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.25; FRAME_LEN], seq)
    }

    fn silent(seq: u64) -> AudioFrame {
        AudioFrame::silence(FRAME_LEN, seq)
    }

    async fn wait_processed(handle: &ControllerHandle, count: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.status().await.unwrap().stats.frames_processed < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("frames non traitées");
    }

    #[tokio::test]
    async fn test_speech_then_silence_scenario() {
        let (mut controller, transport, probe) = controller();
        controller.join(target("a")).await.unwrap();

        let frames: Vec<AudioFrame> = (0..5).map(voiced).chain((5..9).map(silent)).collect();
        let expected_signals = [1, 1, 1, 1, 1, 1, 2, 2, 2];
        let mut decisions = Vec::new();

        for (frame, expected) in frames.into_iter().zip(expected_signals) {
            decisions.push(controller.process_frame(frame).await);
            assert_eq!(transport.signals("a").await.len(), expected);
        }

        assert_eq!(
            transport.signals("a").await,
            vec![ActivityState::Speaking, ActivityState::Silent]
        );
        assert_eq!(probe.encodes(), 7);
        assert_eq!(transport.sent_packets("a").await.len(), 7);

        assert!(decisions[5].should_transmit && decisions[5].state == ActivityState::Speaking);
        assert!(decisions[6].should_transmit && decisions[6].state == ActivityState::Silent);
        assert!(!decisions[7].should_transmit && !decisions[8].should_transmit);

        let stats = controller.stats();
        assert_eq!(stats.frames_processed, 9);
        assert_eq!(stats.frames_transmitted, 7);
        assert_eq!(stats.frames_skipped, 2);
    }

    #[tokio::test]
    async fn test_bitrate_clamped() {
        let (mut controller, _, _) = controller();

        assert_eq!(controller.set_bitrate(1000).unwrap(), 512);
        assert_eq!(controller.bitrate_kbps(), 512);
        assert_eq!(controller.set_bitrate(0).unwrap(), 12);
        assert_eq!(controller.set_bitrate(64).unwrap(), 64);
    }

    #[tokio::test]
    async fn test_expected_loss_left_to_encoder() {
        let (mut controller, _, probe) = controller();

        controller.set_expected_loss(250).unwrap();

        // Le contrôleur transmet la valeur telle quelle, l'encodeur la borne
        assert_eq!(probe.expected_loss(), 250);
    }

    #[tokio::test]
    async fn test_leave_never_joined() {
        let (mut controller, transport, _) = controller();
        controller.join(target("a")).await.unwrap();

        let report = controller.leave("b").await;

        assert!(!report.removed);
        assert!(report.failures.is_empty());
        assert_eq!(controller.registry().targets(), vec![target("a")]);
        assert!(transport.disconnects().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_isolated() {
        let (mut controller, transport, _) = controller();
        controller.join(target("a")).await.unwrap();
        controller.join(target("b")).await.unwrap();
        transport.fail_send("a").await;

        controller.process_frame(voiced(0)).await;

        assert!(transport.sent_packets("a").await.is_empty());
        assert_eq!(transport.sent_packets("b").await, vec![vec![0u8]]);
        assert_eq!(controller.stats().send_failures, 1);
        assert_eq!(controller.stats().frames_transmitted, 1);
    }

    #[tokio::test]
    async fn test_stalled_send_bounded() {
        let (mut controller, transport, _) = controller();
        controller.join(target("lent")).await.unwrap();
        controller.join(target("b")).await.unwrap();
        transport.stall_sends("lent").await;

        let started = std::time::Instant::now();
        controller.process_frame(voiced(3)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.sent_packets("b").await, vec![vec![3u8]]);
        assert_eq!(controller.stats().send_failures, 1);
    }

    #[tokio::test]
    async fn test_signal_failure_does_not_block_frame() {
        let (mut controller, transport, probe) = controller();
        controller.join(target("a")).await.unwrap();
        transport.fail_signal("a").await;

        controller.process_frame(voiced(0)).await;
        controller.process_frame(voiced(1)).await;

        assert_eq!(probe.encodes(), 2);
        assert_eq!(transport.sent_packets("a").await.len(), 2);
        assert_eq!(controller.stats().signal_failures, 1);
    }

    #[tokio::test]
    async fn test_join_resets_shared_encoder() {
        let (mut controller, transport, probe) = controller();

        assert_eq!(controller.join(target("a")).await.unwrap(), JoinOutcome::Joined);
        assert_eq!(controller.join(target("a")).await.unwrap(), JoinOutcome::AlreadyJoined);
        assert_eq!(probe.resets(), 1);
        assert_eq!(transport.connect_attempts("a").await, 1);

        controller.join(target("b")).await.unwrap();
        assert_eq!(probe.resets(), 2);

        transport.fail_connect("c").await;
        let result = controller.join(target("c")).await;
        assert!(matches!(result, Err(BridgeError::Network(NetworkError::ConnectFailed { .. }))));
        assert_eq!(controller.registry().targets(), vec![target("a"), target("b")]);
        assert_eq!(probe.resets(), 2);
    }

    #[tokio::test]
    async fn test_muted_frames_sent_as_silence() {
        let (mut controller, transport, probe) = controller();
        controller.join(target("a")).await.unwrap();
        controller.process_frame(voiced(0)).await;

        controller.set_muted(true);
        for seq in 1..5 {
            controller.process_frame(voiced(seq)).await;
        }

        // 1 frame parlée + 2 frames de hangover encodées comme du silence
        assert_eq!(probe.encodes(), 3);
        assert_eq!(probe.silent_encodes(), 2);
        assert_eq!(transport.signals("a").await, vec![ActivityState::Speaking, ActivityState::Silent]);

        controller.set_muted(false);
        let decision = controller.process_frame(voiced(5)).await;
        assert_eq!(decision.state, ActivityState::Speaking);
        assert_eq!(decision.consecutive_silence, 0);
    }

    #[tokio::test]
    async fn test_lost_session_pruned() {
        let (mut controller, transport, _) = controller();
        controller.join(target("a")).await.unwrap();
        controller.join(target("b")).await.unwrap();

        transport.drop_peer("a").await;
        controller.process_frame(voiced(0)).await;

        assert_eq!(controller.registry().targets(), vec![target("b")]);
        assert_eq!(controller.stats().sessions_pruned, 1);
        assert_eq!(controller.stats().send_failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_host_api_leaves_no_stream() {
        let (mut controller, _, _) = controller();

        let result = controller.start_recording("API-inexistante", "micro");

        assert!(matches!(&result, Err(e) if e.is_device_error()));
        assert!(!controller.is_recording());
        assert!(controller.recording_device().is_none());
    }

    #[tokio::test]
    async fn test_run_with_handle_then_stop() {
        let (mut controller, transport, _) = controller();
        let handle = controller.handle();
        let producer = controller.producer();

        let driver = async {
            assert_eq!(handle.join(target("a")).await.unwrap(), JoinOutcome::Joined);
            for seq in 0..3 {
                assert!(producer.offer(voiced(seq)));
                wait_processed(&handle, seq + 1).await;
            }

            assert_eq!(handle.set_bitrate(9999).await.unwrap(), 512);
            handle.set_fec(true).await.unwrap();
            handle.set_expected_loss(250).await.unwrap();
            handle.set_muted(true).await.unwrap();

            let status = handle.status().await.unwrap();
            assert!(status.muted);
            assert_eq!(status.bitrate_kbps, 512);
            assert_eq!(status.channels, vec![target("a")]);

            handle.stop();
        };

        let (result, ()) = tokio::join!(controller.run(), driver);
        result.unwrap();

        assert!(handle.is_stopped());
        assert_eq!(transport.sent_packets("a").await.len(), 3);
        assert!(matches!(handle.status().await, Err(BridgeError::ControllerStopped)));
        assert!(matches!(controller.run().await, Err(BridgeError::ControllerStopped)));
    }

    #[tokio::test]
    async fn test_stalled_join_keeps_audio_flowing() {
        let (mut controller, transport, probe) = controller();
        controller.join(target("a")).await.unwrap();
        transport.stall_connect("lent").await;

        let handle = controller.handle();
        let producer = controller.producer();

        let driver = async {
            let joins = async { tokio::join!(handle.join(target("lent")), handle.join(target("lent"))) };
            let frames = async {
                for seq in 0..5 {
                    assert!(producer.offer(voiced(seq)));
                    wait_processed(&handle, seq + 1).await;
                }
                transport.sent_packets("a").await.len()
            };

            let ((first, second), delivered_while_joining) = tokio::join!(joins, frames);

            assert_eq!(delivered_while_joining, 5);
            for result in [first, second] {
                assert!(matches!(
                    result,
                    Err(BridgeError::Network(NetworkError::ConnectionTimeout { operation: "connect", .. }))
                ));
            }
            handle.stop();
        };

        let (result, ()) = tokio::join!(controller.run(), driver);
        result.unwrap();

        assert_eq!(transport.connect_attempts("lent").await, 1);
        assert_eq!(controller.registry().targets(), vec![target("a")]);
        assert_eq!(controller.stats().frames_dropped, 0);
        assert_eq!(probe.resets(), 1);
    }

    #[tokio::test]
    async fn test_join_from_handle_registers_session() {
        let (mut controller, transport, probe) = controller();
        let handle = controller.handle();

        let driver = async {
            let (first, second) = tokio::join!(handle.join(target("a")), handle.join(target("a")));
            assert_eq!(first.unwrap(), JoinOutcome::Joined);
            assert_eq!(second.unwrap(), JoinOutcome::AlreadyJoined);

            let report = handle.leave("a").await.unwrap();
            assert!(report.removed);
            assert!(report.failures.is_empty());
            handle.stop();
        };

        let (result, ()) = tokio::join!(controller.run(), driver);
        result.unwrap();

        assert_eq!(transport.connect_attempts("a").await, 1);
        assert_eq!(transport.disconnects().await, vec!["a".to_string()]);
        assert!(controller.registry().is_empty());
        assert_eq!(probe.resets(), 1);
    }

    #[tokio::test]
    async fn test_leave_cancels_pending_join() {
        let (mut controller, transport, _) = controller();
        transport.stall_connect("lent").await;
        let handle = controller.handle();

        let driver = async {
            let join = handle.join(target("lent"));
            let leave = async {
                while transport.connect_attempts("lent").await == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                handle.leave("lent").await.unwrap()
            };

            let (joined, report) = tokio::join!(join, leave);
            assert!(matches!(joined, Err(BridgeError::JoinCancelled { channel }) if channel == "lent"));
            assert!(!report.removed);
            handle.stop();
        };

        let (result, ()) = tokio::join!(controller.run(), driver);
        result.unwrap();
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let (mut controller, _, probe) = controller();
        let producer = controller.producer();
        controller.handle().stop();

        producer.offer(voiced(0));
        controller.run().await.unwrap();

        assert_eq!(controller.stats().frames_processed, 0);
        assert_eq!(probe.encodes(), 0);
    }

    #[test]
    fn test_run_waits_until_stopped() {
        let (mut controller, _, _) = controller();
        let handle = controller.handle();

        let mut run = tokio_test::task::spawn(controller.run());
        tokio_test::assert_pending!(run.poll());

        handle.stop();
        assert!(run.is_woken());
        tokio_test::assert_ready_ok!(run.poll());
    }

    #[tokio::test]
    async fn test_handoff_drops_counted() {
        let (mut controller, _, _) = controller();
        let handle = controller.handle();
        let producer = controller.producer();

        assert!(producer.offer(voiced(0)));
        assert!(!producer.offer(voiced(1)));

        let driver = async {
            wait_processed(&handle, 1).await;
            let status = handle.status().await.unwrap();
            assert_eq!(status.stats.frames_dropped, 1);
            handle.stop();
        };

        let (result, ()) = tokio::join!(controller.run(), driver);
        result.unwrap();
        assert_eq!(controller.stats().frames_processed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_everything() {
        let (mut controller, transport, _) = controller();
        controller.join(target("a")).await.unwrap();
        controller.join(target("b")).await.unwrap();
        transport.fail_disconnect("a").await;

        let failures = controller.shutdown().await;

        assert_eq!(failures.len(), 1);
        assert!(controller.registry().is_empty());
        assert_eq!(transport.disconnects().await, vec!["b".to_string()]);
        assert!(controller.handle().is_stopped());
    }
}
