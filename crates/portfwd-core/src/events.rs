//! Outward notifications to the host.
//!
//! The forwarding core reports three kinds of events, each tagged with the
//! index of the rule it concerns. Delivery is fire-and-forget: sinks must
//! not block, and nothing waits for an acknowledgement.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// An event emitted by the forwarding core.
///
/// Serializes with a `type` discriminator, e.g.
/// `{"type":"connectionCount","index":0,"current":1,"total":4}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// The rule's local address could not be bound.
    ListenError { index: usize, message: String },
    /// The rule's remote address could not be dialed for one connection.
    ConnectError { index: usize, message: String },
    /// Tunnel counts for a rule changed.
    ConnectionCount {
        index: usize,
        current: u64,
        total: u64,
    },
}

impl Event {
    pub fn index(&self) -> usize {
        match self {
            Event::ListenError { index, .. }
            | Event::ConnectError { index, .. }
            | Event::ConnectionCount { index, .. } => *index,
        }
    }
}

/// One-way channel to the host layer.
///
/// `emit` is called from worker tasks, sometimes while a counter lock is
/// held, so implementations must return without blocking.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // Receiver gone means the host stopped listening.
        let _ = self.tx.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}
