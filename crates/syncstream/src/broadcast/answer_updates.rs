//! Answer broadcaster for streamed query results.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::progress::AnswerSnapshot;

/// Fans the latest answer snapshot out to listeners.
#[derive(Clone)]
pub struct AnswerBroadcaster {
    sender: Arc<broadcast::Sender<AnswerSnapshot>>,
}

impl AnswerBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, snapshot: AnswerSnapshot) {
        let _ = self.sender.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnswerSnapshot> {
        self.sender.subscribe()
    }
}

impl Default for AnswerBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
