use thiserror::Error;

/// Errors produced by the forwarding core.
///
/// None of these are fatal to the process. Each one is scoped to the
/// smallest unit it affects (one snapshot, one rule, one connection) and is
/// turned into a log line or an outward [`Event`](crate::events::Event) at
/// the point where it happens.
#[derive(Debug, Error)]
pub enum FwdError {
    /// The rule blob was missing, empty or not valid JSON.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// A rule's local address could not be bound.
    #[error("listen on {addr} failed: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote target of a rule could not be dialed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration store failed to read or notify.
    #[error("config store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FwdError {
    /// The underlying I/O error message for listen/connect failures, as
    /// reported to the host in `listenError` / `connectError` events.
    pub fn event_message(&self) -> String {
        match self {
            FwdError::Listen { source, .. } | FwdError::Connect { source, .. } => {
                source.to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type FwdResult<T> = Result<T, FwdError>;
