use clap::Parser;
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::PathBuf;

use super::config::{RelayConfig, Settings};

/// Mesh relay - maps node tunnels to correlation tokens and forwards REST
/// requests over them
///
/// Nodes connect to `/v1/tunnel` over websocket. REST clients post
/// `{ip, port, body, timeoutMs}` to `/v1/forward` and get the node's answer.
#[derive(Parser, Debug)]
#[command(name = "meshd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Load settings from a JSON file
    ///
    /// JSON format:
    /// ```json
    /// {
    ///   "listen": "0.0.0.0:8082",
    ///   "forwardTimeoutMs": 5000,
    ///   "maxForwardTimeoutMs": 60000,
    ///   "outboundQueue": 32,
    ///   "maxPeers": 1024
    /// }
    /// ```
    ///
    /// Command line flags and environment variables override the file.
    #[arg(long, short = 'c', value_name = "PATH", env = "MESHD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on for tunnels and REST requests (default: 127.0.0.1:8082)
    #[arg(long, short = 'P', value_name = "ADDR", env = "MESHD_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Default time to wait for a node's response, in milliseconds (default: 5000)
    /// Used when a forward request carries no timeout
    #[arg(long, value_name = "MS", env = "MESHD_FORWARD_TIMEOUT_MS")]
    pub forward_timeout_ms: Option<u64>,

    /// Upper bound on any requested forward timeout, in milliseconds (default: 60000)
    #[arg(long, value_name = "MS", env = "MESHD_MAX_FORWARD_TIMEOUT_MS")]
    pub max_forward_timeout_ms: Option<u64>,

    /// Frames buffered per peer before forwards are refused (default: 32)
    #[arg(long, value_name = "COUNT", env = "MESHD_OUTBOUND_QUEUE")]
    pub outbound_queue: Option<usize>,

    /// Most peers tracked at once; new peers beyond it are refused (default: 1024)
    #[arg(long, value_name = "COUNT", env = "MESHD_MAX_PEERS")]
    pub max_peers: Option<usize>,

    /// Log level: TRACE, DEBUG, INFO, WARN or ERROR
    /// `RUST_LOG` still takes precedence when set
    #[arg(
        long,
        short = 'l',
        value_name = "LEVEL",
        env = "MESHD_LOG_LEVEL",
        default_value = "info"
    )]
    pub level: LevelFilter,
}

impl Cli {
    /// Settings given on the command line or through the environment
    pub fn overrides(&self) -> RelayConfig {
        RelayConfig {
            listen: self.listen,
            forward_timeout_ms: self.forward_timeout_ms,
            max_forward_timeout_ms: self.max_forward_timeout_ms,
            outbound_queue: self.outbound_queue,
            max_peers: self.max_peers,
        }
    }

    /// Resolve the effective settings: flags/env, then config file, then defaults
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let file = self
            .config
            .as_deref()
            .map(RelayConfig::from_file)
            .transpose()?;

        Settings::resolve(&self.overrides(), file.as_ref())
    }
}
