//! Forwarding rules and configuration snapshots.
//!
//! A snapshot is parsed from a single JSON blob of the form
//!
//! ```json
//! {"forwards": [{"enabled": true, "local": "127.0.0.1:8080", "remote": "10.0.0.5:80"}]}
//! ```
//!
//! Parsing is all-or-nothing: either the whole blob yields a [`Snapshot`]
//! or an error is returned and nothing is applied. Rules are identified by
//! their position in the snapshot, which is the `index` carried in events.

use crate::error::{FwdError, FwdResult};
use serde::{Deserialize, Deserializer, Serialize};

/// Store key under which the serialized rule list lives.
pub const CONFIG_KEY: &str = "config";

/// One local-to-remote forwarding mapping.
///
/// Missing fields take their zero values. The capitalised field names
/// written by older front-ends are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, alias = "Enabled")]
    pub enabled: bool,
    /// Address to listen on, `host:port`.
    #[serde(default, alias = "Local")]
    pub local: String,
    /// Address to dial for every accepted connection, `host:port`.
    #[serde(default, alias = "Remote")]
    pub remote: String,
}

impl Rule {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            enabled: true,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The ordered rule list in effect after one successful apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, alias = "Forwards", deserialize_with = "null_as_empty")]
    pub forwards: Vec<Rule>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Rule>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Snapshot {
    pub fn new(forwards: Vec<Rule>) -> Self {
        Self { forwards }
    }

    /// Parse a snapshot from raw bytes.
    ///
    /// Empty input is treated as a parse failure rather than "no rules"
    /// so the caller can log why nothing is running. A JSON `null`, at the
    /// top level or for the rule list, means no rules.
    pub fn parse(bytes: &[u8]) -> FwdResult<Self> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(FwdError::ConfigParse("empty configuration".to_string()));
        }
        serde_json::from_slice::<Option<Self>>(bytes)
            .map(Option::unwrap_or_default)
            .map_err(|e| FwdError::ConfigParse(e.to_string()))
    }

    /// Enabled rules together with their snapshot index.
    pub fn enabled(&self) -> impl Iterator<Item = (usize, &Rule)> {
        self.forwards.iter().enumerate().filter(|(_, r)| r.enabled)
    }

    /// Serialize back into the blob format accepted by [`Snapshot::parse`].
    pub fn to_json(&self) -> FwdResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
