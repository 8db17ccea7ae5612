//! Configuration types for beamlink.
//! Parsed from ~/.beamlink/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use beamlink_crypto::Cookie;
use beamlink_protocol::{DistParams, DEFAULT_PARAMS};

use crate::{expand_tilde, NodeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub peer: PeerSection,
    #[serde(default)]
    pub distribution: DistributionSection,
    #[serde(default)]
    pub rpc: RpcSection,
    #[serde(default)]
    pub code: CodeSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub startup: StartupSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Append a random suffix so several tools can talk to one peer.
    #[serde(default = "default_true")]
    pub unique_suffix: bool,
    /// Inline cookie; takes precedence over `cookie_file`.
    pub cookie: Option<String>,
    #[serde(default = "default_cookie_file")]
    pub cookie_file: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            host: default_host(),
            unique_suffix: true,
            cookie: None,
            cookie_file: default_cookie_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    #[serde(default = "default_peer_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            name: default_peer_name(),
            host: default_host(),
        }
    }
}

/// Overrides for the distribution parameters. Unset keys keep the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributionSection {
    pub epmd_port: Option<u16>,
    pub discovery_interval_ms: Option<u64>,
    pub discovery_max_tries: Option<u32>,
    pub handshake_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub net_ticktime_secs: Option<u64>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSection {
    #[serde(default = "default_rpc_timeout")]
    pub default_timeout: RpcTimeout,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            default_timeout: default_rpc_timeout(),
        }
    }
}

/// Milliseconds, or the keyword `"infinity"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcTimeout {
    Millis(u64),
    Keyword(TimeoutKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutKeyword {
    Infinity,
}

impl RpcTimeout {
    /// `None` means wait forever.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            RpcTimeout::Millis(ms) => Some(Duration::from_millis(*ms)),
            RpcTimeout::Keyword(TimeoutKeyword::Infinity) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSection {
    /// Poll the peer's code server after connecting.
    #[serde(default = "default_true")]
    pub wait_for_code_server: bool,
    #[serde(default)]
    pub load_paths: Vec<LoadPath>,
}

impl Default for CodeSection {
    fn default() -> Self {
        Self {
            wait_for_code_server: true,
            load_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPath {
    pub path: String,
    #[serde(default)]
    pub position: PathPosition,
}

/// Where a directory goes in the peer's code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathPosition {
    /// Front of the path (`add_patha`).
    A,
    /// End of the path (`add_pathz`).
    #[default]
    Z,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
    /// Registered name of the mailbox the peer publishes events to.
    #[serde(default = "default_event_mailbox")]
    pub mailbox: String,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            mailbox: default_event_mailbox(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupSection {
    /// Cast once the connection is up.
    pub initial_call: Option<InitialCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialCall {
    pub module: String,
    pub function: String,
    /// Parsed like command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

// Default value functions
fn default_node_name() -> String {
    "beamlink".into()
}
fn default_peer_name() -> String {
    "backend".into()
}
fn default_host() -> String {
    "localhost".into()
}
fn default_cookie_file() -> String {
    "~/.erlang.cookie".into()
}
fn default_event_mailbox() -> String {
    "rex".into()
}
fn default_rpc_timeout() -> RpcTimeout {
    RpcTimeout::Millis(DEFAULT_PARAMS.default_rpc_timeout_ms)
}
fn default_true() -> bool {
    true
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Our full node name. With `unique_suffix` each call picks a new suffix,
    /// so resolve it once per node.
    pub fn node_name(&self) -> String {
        let alive = if self.node.unique_suffix {
            format!("{}_{}", self.node.name, hex::encode(rand::random::<[u8; 3]>()))
        } else {
            self.node.name.clone()
        };
        format!("{alive}@{}", self.node.host)
    }

    pub fn peer_name(&self) -> String {
        format!("{}@{}", self.peer.name, self.peer.host)
    }

    /// Distribution parameters with the `[distribution]` overrides applied.
    pub fn params(&self) -> DistParams {
        let d = &self.distribution;
        let mut params = DEFAULT_PARAMS;
        if let Some(v) = d.epmd_port {
            params.epmd_port = v;
        }
        if let Some(v) = d.discovery_interval_ms {
            params.discovery_interval_ms = v;
        }
        if let Some(v) = d.discovery_max_tries {
            params.discovery_max_tries = v;
        }
        if let Some(v) = d.handshake_timeout_ms {
            params.handshake_timeout_ms = v;
        }
        if let Some(v) = d.connect_timeout_ms {
            params.connect_timeout_ms = v;
        }
        if let Some(v) = d.net_ticktime_secs {
            params.net_ticktime_secs = v.max(1);
        }
        if let Some(v) = d.max_frame_bytes {
            params.max_frame_bytes = v;
        }
        if let RpcTimeout::Millis(ms) = self.rpc.default_timeout {
            params.default_rpc_timeout_ms = ms;
        }
        params
    }

    /// The inline cookie, or the cookie file (created if absent).
    pub fn load_cookie(&self) -> Result<Cookie, NodeError> {
        match &self.node.cookie {
            Some(value) => Ok(Cookie::new(value.as_str())?),
            None => Ok(Cookie::load_or_create(&expand_tilde(&self.node.cookie_file))?),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            peer: PeerSection::default(),
            distribution: DistributionSection::default(),
            rpc: RpcSection::default(),
            code: CodeSection::default(),
            events: EventsSection::default(),
            startup: StartupSection::default(),
        }
    }
}
