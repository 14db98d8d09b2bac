//! Forwarding manager: applies configuration snapshots.
//!
//! Every apply starts from a clean slate. All listeners and connections
//! known to the registry are closed, the socket table is swept for anything
//! that escaped registration, and only then is the new snapshot parsed and
//! one listener worker started per enabled rule. A snapshot that fails to
//! parse leaves nothing running.
//!
//! In-flight relays are not awaited. Closing their sockets is the
//! cancellation signal; they unwind on their own, and their activity
//! counters are frozen first so late updates never reach the sink.

use crate::error::FwdResult;
use crate::events::EventSink;
use crate::listener::ListenerWorker;
use crate::registry::{Registry, ResetSummary};
use crate::rules::Snapshot;
use crate::sockets::SocketTable;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Behaviour switches for a [`ForwardingManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Count tunnels per rule and emit `connectionCount` events. When off,
    /// only listen/connect errors are reported.
    pub track_activity: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            track_activity: true,
        }
    }
}

/// Owns the registry and socket table and decides when a snapshot is
/// applied.
pub struct ForwardingManager {
    registry: Arc<Registry>,
    sockets: Arc<SocketTable>,
    sink: Arc<dyn EventSink>,
    options: ManagerOptions,
    /// Parent of every activity counter for the current snapshot.
    activity: Mutex<CancellationToken>,
    current: Mutex<Option<Snapshot>>,
    /// One latch per listener worker that has not finished binding yet.
    starting: Mutex<Vec<CancellationToken>>,
    /// Serialises applies so two resets never interleave with a spawn.
    apply_lock: tokio::sync::Mutex<()>,
}

impl ForwardingManager {
    pub fn new(sink: Arc<dyn EventSink>, options: ManagerOptions) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            sockets: SocketTable::new(),
            sink,
            options,
            activity: Mutex::new(CancellationToken::new()),
            current: Mutex::new(None),
            starting: Mutex::new(Vec::new()),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Tear everything down, then parse `bytes` and start a listener for
    /// each enabled rule.
    ///
    /// Returns the number of listener workers started. A parse failure is
    /// logged and returned as
    /// [`FwdError::ConfigParse`](crate::error::FwdError::ConfigParse); no event is
    /// emitted and nothing is left running.
    pub async fn apply(&self, bytes: &[u8]) -> FwdResult<usize> {
        let _guard = self.apply_lock.lock().await;
        self.teardown().await;

        let snapshot = match Snapshot::parse(bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "ignoring configuration, nothing forwarded");
                return Err(e);
            }
        };
        Ok(self.start(snapshot))
    }

    /// Same as [`apply`](Self::apply) for an already parsed snapshot.
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> usize {
        let _guard = self.apply_lock.lock().await;
        self.teardown().await;
        self.start(snapshot)
    }

    /// Close every listener and connection without starting anything new.
    pub async fn shutdown(&self) -> ResetSummary {
        let _guard = self.apply_lock.lock().await;
        self.teardown().await
    }

    /// Local addresses of the listeners currently bound.
    pub fn active_listeners(&self) -> Vec<SocketAddr> {
        self.registry.listener_addrs()
    }

    /// The snapshot applied by the last successful apply, if any.
    pub fn current_snapshot(&self) -> Option<Snapshot> {
        self.current.lock().clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sockets(&self) -> &Arc<SocketTable> {
        &self.sockets
    }

    pub fn options(&self) -> ManagerOptions {
        self.options
    }

    async fn teardown(&self) -> ResetSummary {
        let previous = std::mem::replace(&mut *self.activity.lock(), CancellationToken::new());
        previous.cancel();
        self.current.lock().take();

        // A worker still binding would otherwise hold its port past the
        // sweep and collide with its successor.
        let starting = std::mem::take(&mut *self.starting.lock());
        for settled in starting {
            settled.cancelled().await;
        }
        self.registry.reset_all(&self.sockets).await
    }

    fn start(&self, snapshot: Snapshot) -> usize {
        let generation = self.registry.generation();
        let activity = self
            .options
            .track_activity
            .then(|| self.activity.lock().clone());

        let mut started = 0;
        for (index, rule) in snapshot.enabled() {
            let settled = CancellationToken::new();
            self.starting.lock().push(settled.clone());
            let worker = ListenerWorker {
                index,
                local: rule.local.clone(),
                remote: rule.remote.clone(),
                generation,
                registry: Arc::clone(&self.registry),
                sockets: Arc::clone(&self.sockets),
                sink: Arc::clone(&self.sink),
                activity: activity.clone(),
                settled: Some(settled.drop_guard()),
            };
            tokio::spawn(worker.run());
            started += 1;
        }

        info!(
            rules = snapshot.forwards.len(),
            enabled = started,
            "configuration applied"
        );
        *self.current.lock() = Some(snapshot);
        started
    }
}

impl Drop for ForwardingManager {
    fn drop(&mut self) {
        self.activity.lock().cancel();
        let registered = self.registry.listeners();
        for handle in registered.iter().chain(self.registry.conns().iter()) {
            handle.close();
        }
        for id in self.sockets.open_sockets() {
            self.sockets.force_close(id);
        }
    }
}
