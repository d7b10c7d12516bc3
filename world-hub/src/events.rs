use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;
use world_hub_core::{Response, UserId};

/// A request the authority accepted, tagged with the session that sent it.
#[derive(Clone, Debug)]
pub struct Applied {
    pub origin: Uuid,
    pub response: Response,
    /// For top-level deletes, who could view each id before it was removed.
    pub prior_viewers: HashMap<String, Vec<UserId>>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Applied>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Applied> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: Applied) {
        let _ = self.tx.send(event);
    }
}
