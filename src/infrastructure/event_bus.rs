use crate::domain::events::{EngineEvent, EventListener};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fan-out of engine events to every subscribed listener.
///
/// Clones share the listener list, so one bus can be handed to the scheduler
/// and its tasks while the composition root keeps subscribing.
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Deliver an event to all listeners, in subscription order.
    pub async fn publish(&self, event: EngineEvent) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}
