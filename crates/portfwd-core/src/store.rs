//! Configuration storage.
//!
//! The forwarding core only needs two things from wherever the rules are
//! kept: read the blob under a key, and be told when anything changed.
//! [`MemoryStore`] keeps values in a map (embedding hosts, tests);
//! [`FileStore`] serves the [`CONFIG_KEY`](crate::rules::CONFIG_KEY) blob
//! from a JSON file and polls it for changes.

use crate::error::{FwdError, FwdResult};
use crate::rules::CONFIG_KEY;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the change-notification channel. Subscribers that fall
/// further behind see a lag, which the watcher folds into one reapply.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Notification that a stored value may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
}

/// Key-value storage with change notifications.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current value under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> FwdResult<Option<String>>;

    /// Subscribe to change notifications for the lifetime of the store.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-memory store.
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.values.lock().insert(key.clone(), value.into());
        self.notify(key);
    }

    pub fn remove(&self, key: &str) {
        if self.values.lock().remove(key).is_some() {
            self.notify(key.to_string());
        }
    }

    fn notify(&self, key: String) {
        // No subscribers is fine.
        let _ = self.changes.send(ChangeEvent { key });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> FwdResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

/// Modification time and length, or `None` when the file is missing.
type Fingerprint = Option<(Option<SystemTime>, u64)>;

/// Serves the rule blob from a single JSON file.
pub struct FileStore {
    path: PathBuf,
    changes: broadcast::Sender<ChangeEvent>,
    last_seen: Mutex<Fingerprint>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            changes,
            last_seen: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the rule blob on disk and notify subscribers.
    pub async fn set(&self, value: &str) -> FwdResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, value).await?;
        let written = fingerprint(&self.path).await;
        *self.last_seen.lock() = written;
        let _ = self.changes.send(ChangeEvent {
            key: CONFIG_KEY.to_string(),
        });
        Ok(())
    }

    /// Start polling the file every `interval` until `shutdown` fires.
    ///
    /// A change in modification time or length, including the file
    /// appearing or disappearing, produces one notification.
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let initial = fingerprint(&store.path).await;
            *store.last_seen.lock() = initial;
            info!(path = %store.path.display(), ?interval, "watching rule file");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let current = fingerprint(&store.path).await;
                let changed = {
                    let mut last = store.last_seen.lock();
                    let changed = *last != current;
                    *last = current;
                    changed
                };
                if changed {
                    debug!(path = %store.path.display(), "rule file changed");
                    let _ = store.changes.send(ChangeEvent {
                        key: CONFIG_KEY.to_string(),
                    });
                }
            }
            debug!(path = %store.path.display(), "rule file poller stopped");
        })
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self, key: &str) -> FwdResult<Option<String>> {
        if key != CONFIG_KEY {
            return Ok(None);
        }
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "rule file not found");
                Ok(None)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read rule file");
                Err(FwdError::Store(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

async fn fingerprint(path: &Path) -> Fingerprint {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok(), meta.len()))
}
