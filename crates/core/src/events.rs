use kora_shared::{KoraEvent, KoraEventData, KoraId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out channel for lifecycle events with a bounded replay history.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<KoraEvent>>,
    history: Arc<RwLock<VecDeque<Arc<KoraEvent>>>>,
    max_history_size: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(max_history_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Arc::new(RwLock::new(VecDeque::new())),
            max_history_size,
        }
    }

    pub async fn publish(&self, data: KoraEventData) {
        self.publish_event(KoraEvent::new(data)).await;
    }

    pub async fn publish_traced(&self, trace_id: KoraId, data: KoraEventData) {
        self.publish_event(KoraEvent::with_trace(trace_id, data)).await;
    }

    async fn publish_event(&self, event: KoraEvent) {
        let event = Arc::new(event);
        {
            let mut history = self.history.write().await;
            history.push_back(event.clone());
            while history.len() > self.max_history_size {
                history.pop_front();
            }
        }
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            debug!("Event published with no active subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<KoraEvent>> {
        self.tx.subscribe()
    }

    /// Live events as a stream. Lagged gaps are skipped.
    pub fn stream(&self) -> impl Stream<Item = Arc<KoraEvent>> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(Result::ok)
    }

    /// The most recent `limit` events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<Arc<KoraEvent>> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}
