use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use goodable_protocol::StreamEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

type Channels = HashMap<String, broadcast::Sender<StreamEvent>>;

/// Per-project fan-out. Best effort: no replay, lagging subscribers skip ahead.
#[derive(Clone, Default)]
pub struct StreamPublisher {
    channels: Arc<Mutex<Channels>>,
}

impl StreamPublisher {
    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, project_id: &str, event: StreamEvent) {
        let mut channels = self.lock();
        let Some(tx) = channels.get(project_id) else {
            return;
        };
        if tx.send(event).is_err() {
            channels.remove(project_id);
        }
    }

    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.lock();
        channels
            .entry(project_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.lock()
            .get(project_id)
            .map_or(0, |tx| tx.receiver_count())
    }
}
