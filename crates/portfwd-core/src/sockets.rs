//! Socket provider: tracked TCP listeners and streams.
//!
//! Every socket created through a [`SocketTable`] gets a [`SocketId`] and
//! stays enumerable via [`SocketTable::open_sockets`] until the OS socket is
//! dropped, whether or not anyone registered it anywhere else. This is what
//! lets a reset sweep up sockets that escaped the registry.
//!
//! Closing is cooperative. A [`SocketHandle`] carries two one-shot latches:
//!
//! - **shutdown**: set by [`SocketHandle::close`]. Blocked `accept` calls
//!   and relay copies observe it and return, which drops the socket.
//! - **released**: set when the OS socket has actually been dropped.
//!   [`SocketHandle::released`] waits on it, so a caller can be sure a
//!   listening port is free before rebinding it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identifier assigned by a [`SocketTable`] to each socket it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Listener,
    Stream,
}

/// Cheap, cloneable reference to a tracked socket.
///
/// Holding a handle does not keep the socket open; only the owning
/// [`TrackedListener`] / [`TrackedStream`] (or its halves) does.
#[derive(Clone)]
pub struct SocketHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: SocketId,
    kind: SocketKind,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    released: CancellationToken,
}

impl SocketHandle {
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    pub fn kind(&self) -> SocketKind {
        self.inner.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Ask the owner of this socket to drop it. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn close_requested(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Resolves once the OS socket has been dropped.
    pub async fn released(&self) {
        self.inner.released.cancelled().await
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.is_cancelled()
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for SocketHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SocketHandle {}

/// Ties a table entry to the lifetime of an OS socket.
///
/// Dropped together with the socket: removes the table entry and fires
/// the handle's `released` latch.
pub struct SocketLease {
    handle: SocketHandle,
    table: Weak<SocketTable>,
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.forget(self.handle.id());
        }
        self.handle.inner.released.cancel();
        trace!(socket_id = %self.handle.id(), "socket released");
    }
}

/// Creates tracked sockets and enumerates the ones still open.
pub struct SocketTable {
    next_id: AtomicU64,
    open: Mutex<HashMap<SocketId, SocketHandle>>,
}

impl SocketTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Bind a listening socket on `addr`.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> io::Result<TrackedListener> {
        let listener = TcpListener::bind(addr).await?;
        let lease = self.track(SocketKind::Listener, listener.local_addr()?);
        Ok(TrackedListener {
            listener,
            lease,
            table: Arc::clone(self),
        })
    }

    /// Open a stream connection to `addr`.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> io::Result<TrackedStream> {
        let stream = TcpStream::connect(addr).await?;
        self.wrap_stream(stream)
    }

    /// Ids of every socket created by this table that is still open.
    pub fn open_sockets(&self) -> Vec<SocketId> {
        let mut ids: Vec<SocketId> = self.open.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Request closure of a socket by id. Returns its handle if it was
    /// still open.
    pub fn force_close(&self, id: SocketId) -> Option<SocketHandle> {
        let handle = self.open.lock().get(&id).cloned()?;
        handle.close();
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wrap_stream(self: &Arc<Self>, stream: TcpStream) -> io::Result<TrackedStream> {
        let peer_addr = stream.peer_addr()?;
        let lease = self.track(SocketKind::Stream, stream.local_addr()?);
        Ok(TrackedStream {
            stream,
            lease,
            peer_addr,
        })
    }

    fn track(self: &Arc<Self>, kind: SocketKind, local_addr: SocketAddr) -> SocketLease {
        let id = SocketId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = SocketHandle {
            inner: Arc::new(HandleInner {
                id,
                kind,
                local_addr,
                shutdown: CancellationToken::new(),
                released: CancellationToken::new(),
            }),
        };
        self.open.lock().insert(id, handle.clone());
        trace!(socket_id = %id, ?kind, %local_addr, "socket opened");
        SocketLease {
            handle,
            table: Arc::downgrade(self),
        }
    }

    fn forget(&self, id: SocketId) {
        self.open.lock().remove(&id);
    }
}

/// A listening socket created by a [`SocketTable`].
pub struct TrackedListener {
    listener: TcpListener,
    lease: SocketLease,
    table: Arc<SocketTable>,
}

impl TrackedListener {
    pub fn handle(&self) -> SocketHandle {
        self.lease.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.lease.handle.local_addr()
    }

    /// Accept the next inbound connection.
    ///
    /// Returns `ConnectionAborted` once the handle has been closed; the
    /// caller is expected to drop the listener at that point. Connections
    /// that are already gone by the time they are accepted are skipped.
    pub async fn accept(&self) -> io::Result<TrackedStream> {
        let shutdown = &self.lease.handle.inner.shutdown;
        loop {
            let stream = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed"));
                }
                result = self.listener.accept() => result?.0,
            };
            match self.table.wrap_stream(stream) {
                Ok(tracked) => return Ok(tracked),
                Err(e) => debug!(error = %e, "peer closed before accept completed"),
            }
        }
    }
}

/// A connected stream created by a [`SocketTable`].
pub struct TrackedStream {
    stream: TcpStream,
    lease: SocketLease,
    peer_addr: SocketAddr,
}

impl TrackedStream {
    pub fn handle(&self) -> SocketHandle {
        self.lease.handle.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Split into independently owned halves. The socket stays open (and
    /// listed in the table) until both halves are dropped.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        let handle = self.lease.handle.clone();
        let lease = Arc::new(self.lease);
        let (read, write) = self.stream.into_split();
        (
            ReadHalf {
                inner: read,
                handle: handle.clone(),
                _lease: Arc::clone(&lease),
            },
            WriteHalf {
                inner: write,
                handle,
                _lease: lease,
            },
        )
    }
}

pub struct ReadHalf {
    inner: OwnedReadHalf,
    handle: SocketHandle,
    _lease: Arc<SocketLease>,
}

impl ReadHalf {
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }
}

impl AsyncRead for ReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

pub struct WriteHalf {
    inner: OwnedWriteHalf,
    handle: SocketHandle,
    _lease: Arc<SocketLease>,
}

impl WriteHalf {
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }
}

impl AsyncWrite for WriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
