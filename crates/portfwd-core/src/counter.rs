//! Per-rule connection counter.
//!
//! Every tunnel runs two directional relays, and each relay increments the
//! counter when it starts and decrements it when it stops. The raw counts
//! are therefore direction-level; they are halved only when reported, and
//! an update is emitted only when the live count is even, i.e. after both
//! directions of a tunnel have opened or closed. That gives one
//! `connectionCount` event per tunnel transition.

use crate::events::{Event, EventSink};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Live and cumulative directional-relay counts for one rule.
pub struct ActivityCounter {
    index: usize,
    state: Mutex<Counts>,
    cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    live: u64,
    cumulative: u64,
}

/// Tunnel-level view of a counter, as reported in events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelCounts {
    pub current: u64,
    pub total: u64,
}

impl ActivityCounter {
    /// Create a counter for rule `index`. Cancelling `cancel` (or any
    /// parent token) freezes the counter.
    pub fn new(index: usize, sink: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self {
            index,
            state: Mutex::new(Counts::default()),
            cancel,
            sink,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// One directional relay started.
    pub fn increment(&self) {
        self.update(|c| {
            c.live += 1;
            c.cumulative += 1;
        });
    }

    /// One directional relay stopped.
    pub fn decrement(&self) {
        self.update(|c| c.live = c.live.saturating_sub(1));
    }

    /// Freeze the counter. Later increments and decrements are ignored, so
    /// relays outliving a reset cannot report against a rule index that
    /// may now mean something else.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> TunnelCounts {
        let counts = *self.state.lock();
        TunnelCounts {
            current: counts.live / 2,
            total: counts.cumulative / 2,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Counts)) {
        let mut counts = self.state.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        apply(&mut counts);
        if counts.live % 2 == 0 {
            // Emitted under the lock so updates reach the sink in order.
            self.sink.emit(Event::ConnectionCount {
                index: self.index,
                current: counts.live / 2,
                total: counts.cumulative / 2,
            });
        }
    }
}
