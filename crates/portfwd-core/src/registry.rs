//! Connection registry: bookkeeping of every live listener and connection
//! so they can be force-closed together on reset.
//!
//! Each registration is stamped with the generation the caller was started
//! under. [`Registry::reset_all`] bumps the generation, so a worker from an
//! older apply that finishes binding after a reset gets its handle closed
//! on registration instead of leaking into the new state.

use crate::sockets::{SocketHandle, SocketId, SocketTable};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Live listener and connection handles, guarded by one lock.
///
/// The lock is only held for in-memory mutation, never across a socket
/// close or any other await point.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    generation: u64,
    listeners: Vec<SocketHandle>,
    conns: Vec<SocketHandle>,
}

/// What a [`Registry::reset_all`] call closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResetSummary {
    pub listeners: usize,
    pub conns: usize,
    /// Sockets still open in the socket table that the registry did not
    /// know about.
    pub stray: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation new workers should register under.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Register a listener. Returns `false` (and closes the handle) if a
    /// reset happened since `generation`.
    pub fn register_listener(&self, generation: u64, handle: SocketHandle) -> bool {
        self.register(generation, handle, |inner| &mut inner.listeners)
    }

    /// Register a connection. Returns `false` (and closes the handle) if a
    /// reset happened since `generation`.
    pub fn register_conn(&self, generation: u64, handle: SocketHandle) -> bool {
        self.register(generation, handle, |inner| &mut inner.conns)
    }

    pub fn unregister_conn(&self, handle: &SocketHandle) {
        self.inner.lock().conns.retain(|h| h != handle);
    }

    pub fn unregister_listener(&self, handle: &SocketHandle) {
        self.inner.lock().listeners.retain(|h| h != handle);
    }

    pub fn listeners(&self) -> Vec<SocketHandle> {
        self.inner.lock().listeners.clone()
    }

    pub fn conns(&self) -> Vec<SocketHandle> {
        self.inner.lock().conns.clone()
    }

    /// Local addresses of all registered listeners.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .lock()
            .listeners
            .iter()
            .map(|h| h.local_addr())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.listeners.is_empty() && inner.conns.is_empty()
    }

    /// Close everything registered, then sweep `sockets` for anything still
    /// open and close that too.
    ///
    /// Returns once every registered listener has released its OS socket,
    /// so the caller may immediately rebind the same addresses. Untracked
    /// sockets found by the sweep and all connections are only asked to
    /// close; their owners drop them on their own time.
    pub async fn reset_all(&self, sockets: &SocketTable) -> ResetSummary {
        let (listeners, conns) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            (
                std::mem::take(&mut inner.listeners),
                std::mem::take(&mut inner.conns),
            )
        };

        for handle in listeners.iter().chain(conns.iter()) {
            handle.close();
        }

        let known: HashSet<SocketId> = listeners
            .iter()
            .chain(conns.iter())
            .map(|h| h.id())
            .collect();
        let mut stray = 0;
        for id in sockets.open_sockets() {
            let Some(handle) = sockets.force_close(id) else {
                continue;
            };
            if known.contains(&id) {
                continue;
            }
            stray += 1;
            debug!(socket_id = %id, kind = ?handle.kind(), "closing untracked socket");
        }

        for handle in &listeners {
            handle.released().await;
        }

        let summary = ResetSummary {
            listeners: listeners.len(),
            conns: conns.len(),
            stray,
        };
        info!(
            listeners = summary.listeners,
            conns = summary.conns,
            stray = summary.stray,
            "registry reset"
        );
        summary
    }

    fn register(
        &self,
        generation: u64,
        handle: SocketHandle,
        set: impl FnOnce(&mut RegistryInner) -> &mut Vec<SocketHandle>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            drop(inner);
            debug!(socket_id = %handle.id(), "stale registration, closing");
            handle.close();
            return false;
        }
        set(&mut *inner).push(handle);
        true
    }
}
