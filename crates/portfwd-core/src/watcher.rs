//! Configuration watcher: drives the forwarding manager from a store.
//!
//! Applies the stored rules once at startup and again on every change
//! notification. Reads are best effort: a missing or unreadable blob is
//! applied as an empty configuration, which leaves nothing running.

use crate::manager::ForwardingManager;
use crate::rules::CONFIG_KEY;
use crate::store::ConfigStore;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConfigWatcher {
    store: Arc<dyn ConfigStore>,
    manager: Arc<ForwardingManager>,
    key: String,
}

impl ConfigWatcher {
    pub fn new(store: Arc<dyn ConfigStore>, manager: Arc<ForwardingManager>) -> Self {
        Self {
            store,
            manager,
            key: CONFIG_KEY.to_string(),
        }
    }

    /// Read rules from `key` instead of the default `config`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Read the current blob and apply it.
    pub async fn reload(&self) {
        let blob = match self.store.get(&self.key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!(key = %self.key, "no stored configuration");
                String::new()
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "reading configuration failed");
                String::new()
            }
        };
        // Parse failures are already logged by the manager.
        let _ = self.manager.apply(blob.as_bytes()).await;
    }

    /// Apply now and on every change until `shutdown` fires, then close
    /// everything the manager has open.
    pub async fn run(self, shutdown: CancellationToken) {
        // Subscribe first so a change racing the initial load is not lost.
        let mut changes = self.store.subscribe();
        self.reload().await;

        let mut watching = true;
        while watching {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = changes.recv() => match received {
                    Ok(change) => {
                        info!(key = %change.key, "configuration changed, resetting");
                        self.reload().await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "change notifications coalesced");
                        self.reload().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("configuration store closed, keeping current rules");
                        watching = false;
                    }
                },
            }
        }
        if !watching {
            shutdown.cancelled().await;
        }

        let summary = self.manager.shutdown().await;
        info!(
            listeners = summary.listeners,
            conns = summary.conns,
            "forwarding stopped"
        );
    }
}
