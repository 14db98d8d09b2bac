//! Listener workers: one per enabled rule.
//!
//! A worker binds the rule's local address, then accepts connections in a
//! loop. Each accepted connection is paired with a fresh connection to the
//! rule's remote address and handed to two relay tasks. The worker stops
//! once its listener has been closed by a reset; any other accept error is
//! logged and the accept is retried after a short pause.

use crate::counter::ActivityCounter;
use crate::error::FwdError;
use crate::events::{Event, EventSink};
use crate::registry::Registry;
use crate::relay::spawn_tunnel;
use crate::sockets::{SocketTable, TrackedStream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Pause before retrying a failed accept (e.g. out of file descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a listener worker needs for one rule.
pub struct ListenerWorker {
    pub index: usize,
    pub local: String,
    pub remote: String,
    /// Registry generation this worker was started under.
    pub generation: u64,
    pub registry: Arc<Registry>,
    pub sockets: Arc<SocketTable>,
    pub sink: Arc<dyn EventSink>,
    /// Parent token for the rule's activity counter, cancelled when the
    /// snapshot is torn down. `None` disables connection counting.
    pub activity: Option<CancellationToken>,
    /// Dropped once the bind has either failed or been registered, so a
    /// reset can wait for in-flight binds before sweeping.
    pub settled: Option<DropGuard>,
}

impl ListenerWorker {
    /// Run until the listener is closed.
    pub async fn run(mut self) {
        let settled = self.settled.take();
        let listener = match self.sockets.listen(&self.local).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = FwdError::Listen {
                    addr: self.local.clone(),
                    source,
                };
                warn!(index = self.index, local = %self.local, error = %err, "listen failed");
                self.sink.emit(Event::ListenError {
                    index: self.index,
                    message: err.event_message(),
                });
                return;
            }
        };

        let handle = listener.handle();
        if !self.registry.register_listener(self.generation, handle.clone()) {
            debug!(index = self.index, local = %self.local, "superseded before start");
            return;
        }
        drop(settled);

        let counter = self.activity.as_ref().map(|parent| {
            Arc::new(ActivityCounter::new(
                self.index,
                Arc::clone(&self.sink),
                parent.child_token(),
            ))
        });

        info!(
            index = self.index,
            local = %listener.local_addr(),
            remote = %self.remote,
            "forwarding"
        );

        loop {
            match listener.accept().await {
                Ok(accepted) => self.forward(accepted, counter.as_ref()).await,
                Err(e) if handle.is_closed() => {
                    debug!(index = self.index, error = %e, "accept ended");
                    break;
                }
                Err(e) => {
                    warn!(index = self.index, error = %e, "accept failed, retrying");
                    tokio::select! {
                        _ = handle.close_requested() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }

        handle.close();
        drop(listener);
        self.registry.unregister_listener(&handle);
        if let Some(counter) = &counter {
            counter.cancel();
        }
        info!(index = self.index, local = %self.local, "listener stopped");
    }

    /// Dial the remote for one accepted connection and start its relays.
    async fn forward(&self, accepted: TrackedStream, counter: Option<&Arc<ActivityCounter>>) {
        let accepted_handle = accepted.handle();
        if !self
            .registry
            .register_conn(self.generation, accepted_handle.clone())
        {
            return;
        }
        debug!(index = self.index, peer = %accepted.peer_addr(), "connection accepted");

        let dialed = tokio::select! {
            result = self.sockets.dial(&self.remote) => result,
            _ = accepted_handle.close_requested() => {
                self.registry.unregister_conn(&accepted_handle);
                return;
            }
        };

        match dialed {
            Ok(dialed) => {
                if !self
                    .registry
                    .register_conn(self.generation, dialed.handle())
                {
                    self.registry.unregister_conn(&accepted_handle);
                    return;
                }
                debug!(index = self.index, remote = %self.remote, "tunnel opened");
                spawn_tunnel(
                    accepted,
                    dialed,
                    Arc::clone(&self.registry),
                    counter.cloned(),
                );
            }
            Err(source) => {
                let err = FwdError::Connect {
                    addr: self.remote.clone(),
                    source,
                };
                warn!(index = self.index, remote = %self.remote, error = %err, "dial failed");
                self.sink.emit(Event::ConnectError {
                    index: self.index,
                    message: err.event_message(),
                });
                accepted_handle.close();
                drop(accepted);
                self.registry.unregister_conn(&accepted_handle);
            }
        }
    }
}
