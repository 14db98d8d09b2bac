//! portfwd-core: dynamically reconfigurable multi-rule TCP forwarding.
//!
//! A [`ForwardingManager`] applies snapshots of forwarding rules (local
//! listen address to remote target). Each apply closes every listener and
//! connection from the previous snapshot before starting one listener
//! worker per enabled rule. Accepted connections are paired with a dialed
//! connection to the rule's remote and relayed verbatim in both directions.
//! A [`ConfigWatcher`] re-applies whenever the backing [`ConfigStore`]
//! reports a change, and outward notifications go to an [`EventSink`].

pub mod counter;
pub mod error;
pub mod events;
pub mod listener;
pub mod manager;
pub mod registry;
pub mod relay;
pub mod rules;
pub mod sockets;
pub mod store;
pub mod watcher;

// Re-export commonly used items at crate root.
pub use error::{FwdError, FwdResult};
pub use events::{ChannelSink, Event, EventSink, NullSink};
pub use manager::{ForwardingManager, ManagerOptions};
pub use registry::{Registry, ResetSummary};
pub use rules::{Rule, Snapshot, CONFIG_KEY};
pub use sockets::{SocketHandle, SocketId, SocketTable};
pub use store::{ChangeEvent, ConfigStore, FileStore, MemoryStore};
pub use watcher::ConfigWatcher;
