//! Relay configuration
//!
//! Settings come from three layers, highest priority first: command line
//! flags (or their `MESHD_*` environment variables), an optional JSON file,
//! built-in defaults.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::registry::{DEFAULT_MAX_PEERS, DEFAULT_OUTBOUND_QUEUE};
use crate::relay::{DEFAULT_FORWARD_TIMEOUT, MAX_FORWARD_TIMEOUT};

/// Default listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8082";

/// One layer of optional settings, as read from a file or the command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: Option<SocketAddr>,
    pub forward_timeout_ms: Option<u64>,
    pub max_forward_timeout_ms: Option<u64>,
    pub outbound_queue: Option<usize>,
    pub max_peers: Option<usize>,
}

impl RelayConfig {
    /// Load relay config from JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file as JSON: {}", path.display()))
    }
}

/// Fully resolved relay settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub forward_timeout: Duration,
    pub max_forward_timeout: Duration,
    pub outbound_queue: usize,
    pub max_peers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8082)),
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            max_forward_timeout: MAX_FORWARD_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

impl Settings {
    /// Merge `overrides` over `file` over the defaults, then validate
    pub fn resolve(overrides: &RelayConfig, file: Option<&RelayConfig>) -> Result<Self> {
        let defaults = Settings::default();
        let file = file.cloned().unwrap_or_default();

        let settings = Settings {
            listen: overrides.listen.or(file.listen).unwrap_or(defaults.listen),
            forward_timeout: overrides
                .forward_timeout_ms
                .or(file.forward_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.forward_timeout),
            max_forward_timeout: overrides
                .max_forward_timeout_ms
                .or(file.max_forward_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_forward_timeout),
            outbound_queue: overrides
                .outbound_queue
                .or(file.outbound_queue)
                .unwrap_or(defaults.outbound_queue),
            max_peers: overrides
                .max_peers
                .or(file.max_peers)
                .unwrap_or(defaults.max_peers),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.forward_timeout.is_zero() {
            bail!("Forward timeout must be greater than zero");
        }
        if self.max_forward_timeout < self.forward_timeout {
            bail!(
                "Maximum forward timeout ({:?}) is below the default forward timeout ({:?})",
                self.max_forward_timeout,
                self.forward_timeout
            );
        }
        if self.outbound_queue == 0 {
            bail!("Outbound queue depth must be at least 1");
        }
        if self.max_peers == 0 {
            bail!("Peer limit must be at least 1");
        }
        Ok(())
    }
}
