//! Slot de transfert entre le callback temps réel et la boucle du pipeline
//!
//! Le callback de capture tourne sur un thread temps réel géré par le backend
//! audio : il ne doit jamais attendre. Le pipeline, lui, tourne dans la
//! boucle tokio. Entre les deux, un canal de capacité 1 :
//!
//! - côté producteur, `try_send` : si le slot est occupé, la nouvelle frame
//!   est jetée et comptée ;
//! - côté consommateur, `recv().await` : point de suspension du pipeline.
//!
//! Sous charge, on perd des frames au lieu d'accumuler de la latence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::AudioFrame;

/// Capacité du slot : au plus une frame non consommée
pub const HANDOFF_CAPACITY: usize = 1;

/// Compteurs partagés entre les deux côtés du slot
#[derive(Debug, Default)]
struct HandoffCounters {
    offered: AtomicU64,
    dropped: AtomicU64,
}

/// Crée un slot de transfert et retourne ses deux extrémités
///
/// # Example
/// ```rust
/// use audio::{frame_handoff, AudioFrame};
///
/// let (producer, mut consumer) = frame_handoff();
/// assert!(producer.offer(AudioFrame::silence(4, 0)));
/// assert!(!producer.offer(AudioFrame::silence(4, 1))); // slot occupé
/// assert_eq!(consumer.try_next().unwrap().sequence_number, 0);
/// ```
pub fn frame_handoff() -> (FrameProducer, FrameConsumer) {
    let (sender, receiver) = mpsc::channel(HANDOFF_CAPACITY);
    let counters = Arc::new(HandoffCounters::default());

    (
        FrameProducer { sender, counters: Arc::clone(&counters) },
        FrameConsumer { receiver, counters },
    )
}

/// Extrémité producteur, utilisée depuis le callback temps réel
///
/// Clonable : chaque nouveau stream de capture en reçoit une copie.
#[derive(Clone, Debug)]
pub struct FrameProducer {
    sender: mpsc::Sender<AudioFrame>,
    counters: Arc<HandoffCounters>,
}

impl FrameProducer {
    /// Dépose une frame sans jamais bloquer
    ///
    /// Retourne `false` si la frame a été jetée (slot occupé ou pipeline arrêté).
    pub fn offer(&self, frame: AudioFrame) -> bool {
        self.counters.offered.fetch_add(1, Ordering::Relaxed);

        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Extrémité consommateur, possédée par la boucle du pipeline
#[derive(Debug)]
pub struct FrameConsumer {
    receiver: mpsc::Receiver<AudioFrame>,
    counters: Arc<HandoffCounters>,
}

impl FrameConsumer {
    /// Attend la prochaine frame
    ///
    /// Retourne `None` quand tous les producteurs ont été libérés ou que le
    /// slot a été fermé : c'est la sentinelle d'arrêt du pipeline.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.receiver.recv().await
    }

    /// Récupère une frame si elle est déjà disponible
    pub fn try_next(&mut self) -> Option<AudioFrame> {
        match self.receiver.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Ferme le slot : les dépôts suivants échouent, la frame en attente reste lisible
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Nombre de frames jetées faute de place
    pub fn dropped_frames(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Nombre total de frames proposées par la capture
    pub fn offered_frames(&self) -> u64 {
        self.counters.offered.load(Ordering::Relaxed)
    }
}
