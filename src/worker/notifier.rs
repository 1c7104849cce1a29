use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};

use crate::message::EventEnvelope;
use crate::worker::state::{DeviceStatus, StateName};

pub type StateHandler = Box<dyn Fn(&DeviceStatus) + Send + Sync>;

/// In-process observers keyed by state name.
///
/// Handlers run synchronously, in registration order, each time the worker
/// publishes a snapshot for their state.
#[derive(Default)]
pub struct Notifier {
    handlers: RwLock<HashMap<StateName, Vec<StateHandler>>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<F>(&self, state: StateName, handler: F)
    where
        F: Fn(&DeviceStatus) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .await
            .entry(state)
            .or_default()
            .push(Box::new(handler));
    }

    pub async fn publish(&self, status: &DeviceStatus) {
        let handlers = self.handlers.read().await;
        if let Some(handlers) = handlers.get(&status.state.name) {
            for handler in handlers {
                handler(status);
            }
        }
    }
}

/// Push channel feeding the worker's event stream.
#[derive(Debug, Clone)]
pub struct PushTransport {
    tx: broadcast::Sender<EventEnvelope>,
}

impl PushTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Wrap the snapshot in an event named after its state and broadcast it.
    /// Having no listeners is not an error.
    pub fn forward(&self, status: &DeviceStatus) {
        let payload = match serde_json::to_value(status) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode status event");
                return;
            }
        };
        let _ = self
            .tx
            .send(EventEnvelope::new(status.state.name.as_str(), payload));
    }
}
