//! Relay workers: directional byte copies between the two sockets of a
//! tunnel.
//!
//! A tunnel is one accepted connection paired with its dialed remote
//! connection. It runs as two relay tasks, one per direction. Either task
//! finishing (EOF, I/O error, or a close request from a reset) closes both
//! sockets, which in turn stops the other task. Nothing is retried.

use crate::counter::ActivityCounter;
use crate::registry::Registry;
use crate::sockets::{ReadHalf, TrackedStream, WriteHalf};
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

/// Which way a relay copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted client to dialed remote.
    Outbound,
    /// Dialed remote back to accepted client.
    Inbound,
}

/// Spawn both relay tasks for a freshly dialed tunnel.
///
/// Both sockets must already be registered in `registry`; each relay
/// unregisters them when it ends.
pub fn spawn_tunnel(
    accepted: TrackedStream,
    dialed: TrackedStream,
    registry: Arc<Registry>,
    counter: Option<Arc<ActivityCounter>>,
) {
    let (client_read, client_write) = accepted.into_split();
    let (remote_read, remote_write) = dialed.into_split();

    tokio::spawn(relay(
        Direction::Outbound,
        client_read,
        remote_write,
        Arc::clone(&registry),
        counter.clone(),
    ));
    tokio::spawn(relay(
        Direction::Inbound,
        remote_read,
        client_write,
        registry,
        counter,
    ));
}

/// Copy bytes from `src` to `dst` until EOF, error, or a close request on
/// either socket, then tear both sockets down.
pub async fn relay(
    direction: Direction,
    mut src: ReadHalf,
    mut dst: WriteHalf,
    registry: Arc<Registry>,
    counter: Option<Arc<ActivityCounter>>,
) {
    if let Some(counter) = &counter {
        counter.increment();
    }

    let src_handle = src.handle().clone();
    let dst_handle = dst.handle().clone();
    trace!(?direction, src = %src_handle.id(), dst = %dst_handle.id(), "relay started");

    let result = tokio::select! {
        result = tokio::io::copy(&mut src, &mut dst) => result,
        _ = src_handle.close_requested() => Err(closed()),
        _ = dst_handle.close_requested() => Err(closed()),
    };

    src_handle.close();
    dst_handle.close();
    drop(src);
    drop(dst);
    registry.unregister_conn(&src_handle);
    registry.unregister_conn(&dst_handle);

    if let Some(counter) = &counter {
        counter.decrement();
    }

    match result {
        Ok(bytes) => debug!(?direction, bytes, "relay finished"),
        Err(e) => debug!(?direction, error = %e, "relay ended"),
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}
