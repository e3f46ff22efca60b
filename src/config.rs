//! Configuration for peerdrop
//!
//! CLI arguments and environment variable handling for the relay binary using clap,
//! plus the plain config structs a peer is built from.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

/// Default relay listen address
pub const DEFAULT_LISTEN: &str = "0.0.0.0:3001";

/// Default maximum number of registered peers
pub const DEFAULT_MAX_PEERS: usize = 32768;

/// Default maximum inbound frame size accepted by the relay
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Reference chunk size for file transfers (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default time a sender waits for `file-accept` / `file-reject`
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time a client waits for the relay's `init` frame
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// peerdrop-relay - rendezvous relay for peer discovery and signaling
#[derive(Parser, Debug, Clone)]
#[command(name = "peerdrop-relay")]
#[command(about = "Rendezvous relay: assigns peer ids, broadcasts peer lists, forwards signals")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Maximum concurrently registered peers
    #[arg(long, env = "RELAY_MAX_PEERS", default_value_t = DEFAULT_MAX_PEERS)]
    pub max_peers: usize,

    /// Maximum size of a single inbound frame; larger frames are dropped
    #[arg(long, env = "RELAY_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_peers == 0 {
            return Err("RELAY_MAX_PEERS must be greater than zero".to_string());
        }
        if self.max_message_bytes == 0 {
            return Err("RELAY_MAX_MESSAGE_BYTES must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Relay limits derived from the arguments
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_peers: self.max_peers,
            max_message_bytes: self.max_message_bytes,
        }
    }
}

/// Limits enforced by the relay server
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_peers: usize,
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// File transfer tuning
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per `file-chunk` message (last chunk may be shorter)
    pub chunk_size: usize,
    /// How long a sender waits for the receiver's decision
    pub response_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than zero".to_string());
        }
        if self.response_timeout.is_zero() {
            return Err("response_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Everything a peer needs to join a relay
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// WebSocket URL of the relay, e.g. `ws://localhost:3001`
    pub relay_url: String,
    /// How long to wait for the relay's `init` frame
    pub init_timeout: Duration,
    pub transfer: TransferConfig,
}

impl PeerConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            transfer: TransferConfig::default(),
        }
    }
}
