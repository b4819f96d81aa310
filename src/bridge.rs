use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::Clip;

/// Action-tagged messages exchanged between execution contexts (page,
/// popup, background poller).
///
/// Delivery is best-effort and at-most-once; a message published while no
/// listener is subscribed is lost. Authoritative state transitions are
/// always also written to the state store, so a late-attached context can
/// reconstruct everything without having received any message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    ExtractClips {
        prompt: String,
    },
    SeekTo {
        timestamp: f64,
    },
    #[serde(rename_all = "camelCase")]
    ExtractionComplete {
        video_id: String,
        job_id: String,
        clips: Vec<Clip>,
    },
    #[serde(rename_all = "camelCase")]
    ExtractionError {
        video_id: String,
        job_id: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    JobStarted {
        video_id: String,
        job_id: String,
    },
}

const BUS_CAPACITY: usize = 32;

/// Best-effort notification channel over a broadcast queue.
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes to whoever is currently listening. No listeners means the
    /// message is dropped, not queued.
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
