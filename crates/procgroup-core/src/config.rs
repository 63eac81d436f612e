//! Centralized configuration for procgroup.
//!
//! Constant holders for the transport and the control channel, plus the
//! runtime [`GroupConfig`] describing which group this process joins.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ProcessError, Result};
use crate::transport::{Rank, CONTROLLER_RANK};

/// Transport-level constants.
pub struct TransportConfig;

impl TransportConfig {
    /// Largest envelope accepted from a peer.
    pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;
    /// How long a rank keeps retrying to reach a peer at startup.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
}

/// Control channel constants (controller side JSON-RPC server).
pub struct ControlConfig;

impl ControlConfig {
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 16;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Depth of the queue between the control server and the controller.
    pub const REQUEST_QUEUE_DEPTH: usize = 64;
}

/// Environment variables read by [`GroupConfig::from_env`].
pub struct EnvConfig;

impl EnvConfig {
    pub const RANK: &'static str = "PROCGROUP_RANK";
    pub const PEERS: &'static str = "PROCGROUP_PEERS";
    pub const INTERACTIVE: &'static str = "PROCGROUP_INTERACTIVE";
}

/// Membership of this process in a process group.
///
/// `peers[r]` is the listen address of rank `r`; the group size is the
/// number of peers. An empty peer list describes a single-process group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub rank: Rank,
    pub peers: Vec<SocketAddr>,
    /// When false the controller finishes as soon as the group is up.
    pub interactive: bool,
    pub connect_timeout: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::single_process()
    }
}

impl GroupConfig {
    /// A group made of this process alone.
    pub fn single_process() -> Self {
        Self {
            rank: CONTROLLER_RANK,
            peers: Vec::new(),
            interactive: true,
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
        }
    }

    /// A networked group.
    pub fn networked(rank: Rank, peers: Vec<SocketAddr>) -> Self {
        Self {
            rank,
            peers,
            ..Self::single_process()
        }
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Number of processes in the group.
    pub fn size(&self) -> usize {
        self.peers.len().max(1)
    }

    /// Check `0 <= rank < size`.
    pub fn validate(&self) -> Result<()> {
        if self.rank >= self.size() {
            return Err(ProcessError::Config {
                message: format!(
                    "rank {} is outside of a group of {}",
                    self.rank,
                    self.size()
                ),
            });
        }
        Ok(())
    }

    /// Parse a comma separated peer list such as `127.0.0.1:7000,127.0.0.1:7001`.
    pub fn parse_peers(list: &str) -> Result<Vec<SocketAddr>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<SocketAddr>().map_err(|e| ProcessError::Config {
                    message: format!("invalid peer address '{}': {}", s, e),
                })
            })
            .collect()
    }

    /// Build a configuration from `PROCGROUP_RANK`, `PROCGROUP_PEERS` and
    /// `PROCGROUP_INTERACTIVE`. Missing variables mean a single-process group.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::single_process();

        if let Some(peers) = lookup(EnvConfig::PEERS) {
            config.peers = Self::parse_peers(&peers)?;
        }

        if let Some(rank) = lookup(EnvConfig::RANK) {
            config.rank = rank.trim().parse().map_err(|_| ProcessError::Config {
                message: format!("{} must be a non-negative integer, got '{}'", EnvConfig::RANK, rank),
            })?;
        }

        if let Some(flag) = lookup(EnvConfig::INTERACTIVE) {
            config.interactive = !matches!(flag.trim(), "0" | "false" | "no" | "off");
        }

        config.validate()?;
        Ok(config)
    }
}
