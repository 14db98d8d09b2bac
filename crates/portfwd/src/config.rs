//! Daemon settings: TOML file + CLI overrides.
//!
//! These settings only describe how the daemon runs (where the rule file
//! lives, how often it is polled, whether events are reported). The
//! forwarding rules themselves live in the rule file and are reloaded on
//! every change.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level settings file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub events: EventsSection,
}

/// `[store]` section of the settings TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_rules_path")]
    pub path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_rules_path(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `[events]` section of the settings TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_rules_path() -> String {
    "~/.portfwd/rules.json".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

/// Shortest accepted poll interval.
const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Resolved daemon settings (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct Settings {
    pub rules_path: PathBuf,
    pub poll_interval: Duration,
    pub events: bool,
}

impl Settings {
    /// Load settings from a TOML file, then apply CLI overrides. A missing
    /// file means defaults.
    pub fn load(
        settings_path: Option<&Path>,
        cli_rules: Option<&str>,
        cli_poll_interval_ms: Option<u64>,
        cli_no_events: bool,
    ) -> Result<Self> {
        let file = match settings_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading settings file");
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                toml::from_str::<SettingsFile>(&content)
                    .with_context(|| format!("cannot parse {}", path.display()))?
            }
            Some(path) => {
                info!(path = %path.display(), "settings file not found, using defaults");
                SettingsFile::default()
            }
            None => SettingsFile::default(),
        };

        let rules = cli_rules
            .map(|s| s.to_string())
            .unwrap_or(file.store.path);
        let poll_interval_ms = cli_poll_interval_ms.unwrap_or(file.store.poll_interval_ms);
        if poll_interval_ms < MIN_POLL_INTERVAL_MS {
            bail!(
                "poll interval must be at least {MIN_POLL_INTERVAL_MS} ms, got {poll_interval_ms}"
            );
        }

        Ok(Self {
            rules_path: expand_tilde_str(&rules),
            poll_interval: Duration::from_millis(poll_interval_ms),
            events: file.events.enabled && !cli_no_events,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
