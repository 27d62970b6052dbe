//! Background listeners that run while infrastructure is being created
//!
//! A provider reports two streams through [`ProvisionEvents`]: human-readable
//! progress lines and resource-inventory snapshots. Both go through bounded
//! channels, so a slow consumer applies backpressure to the provider. One
//! task relays progress to the log and another persists each inventory
//! snapshot to disk. [`EventListeners::shutdown`] waits for both to drain once
//! the provider is done.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::inventory::InventoryFile;

/// Capacity of each event queue
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Sending side handed to `InfraProvisioner::create`
#[derive(Clone, Debug)]
pub struct ProvisionEvents {
    progress: mpsc::Sender<String>,
    inventory: mpsc::Sender<Value>,
}

impl ProvisionEvents {
    pub fn new(progress: mpsc::Sender<String>, inventory: mpsc::Sender<Value>) -> Self {
        Self {
            progress,
            inventory,
        }
    }

    /// Events that go nowhere
    #[cfg(test)]
    pub(crate) fn discard() -> Self {
        let (progress, _) = mpsc::channel(1);
        let (inventory, _) = mpsc::channel(1);
        Self::new(progress, inventory)
    }

    /// Report a progress line
    pub async fn progress(&self, message: impl Into<String>) {
        // Closed receivers just mean nobody is listening
        let _ = self.progress.send(message.into()).await;
    }

    /// Report the full current inventory
    pub async fn record_inventory(&self, snapshot: Value) {
        let _ = self.inventory.send(snapshot).await;
    }
}

/// Handles of the relay and persister tasks
pub struct EventListeners {
    progress: JoinHandle<()>,
    inventory: JoinHandle<()>,
}

impl EventListeners {
    /// Start both listeners for `instance`, persisting inventory to `file`
    pub fn spawn(instance: &str, file: InventoryFile) -> (ProvisionEvents, Self) {
        let (progress_tx, progress_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (inventory_tx, inventory_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let listeners = Self {
            progress: spawn_progress_relay(instance.to_string(), progress_rx),
            inventory: spawn_inventory_persister(file, inventory_rx),
        };
        (ProvisionEvents::new(progress_tx, inventory_tx), listeners)
    }

    /// Wait for queued events to be handled
    ///
    /// Returns once every [`ProvisionEvents`] clone has been dropped and the
    /// queues are empty.
    pub async fn shutdown(self) {
        if let Err(e) = self.progress.await {
            warn!(error = %e, "progress relay task failed");
        }
        if let Err(e) = self.inventory.await {
            warn!(error = %e, "inventory persister task failed");
        }
    }
}

fn spawn_progress_relay(instance: String, mut rx: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            info!(target: "keel::progress", instance = %instance, "{}", message);
        }
    })
}

fn spawn_inventory_persister(file: InventoryFile, mut rx: mpsc::Receiver<Value>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            if let Err(e) = file.write(&snapshot) {
                warn!(path = %file.path().display(), error = %e, "failed to persist resource inventory");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_snapshot_is_persisted_before_shutdown_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = InventoryFile::for_instance(dir.path(), "prod");
        let (events, listeners) = EventListeners::spawn("prod", file.clone());

        events.progress("deploying stack eksctl-prod-cluster").await;
        events.record_inventory(json!({"stacks": ["a"]})).await;
        events.record_inventory(json!({"stacks": ["a", "b"]})).await;
        drop(events);
        listeners.shutdown().await;

        assert_eq!(
            file.read().expect("read"),
            Some(json!({"stacks": ["a", "b"]}))
        );
    }

    #[tokio::test]
    async fn discarded_events_never_block() {
        let events = ProvisionEvents::discard();
        for i in 0..10 {
            events.progress(format!("line {}", i)).await;
        }
        events.record_inventory(json!({})).await;
    }
}
