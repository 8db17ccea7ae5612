//! Distribution parameters -- timing and size limits a connection runs under.
//!
//! These are the defaults; `beamlink-node` config can override individual
//! values at node construction. Nothing here is mutated after a connection
//! has been set up.

use std::time::Duration;

/// A named set of timing and size parameters for distribution connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistParams {
    // -- Discovery --
    /// Port of the node discovery service.
    pub epmd_port: u16,
    /// Milliseconds between discovery liveness probes.
    pub discovery_interval_ms: u64,
    /// Probes before giving up on the discovery service.
    pub discovery_max_tries: u32,

    // -- Handshake --
    /// Upper bound on the whole handshake exchange.
    pub handshake_timeout_ms: u64,
    /// Upper bound on the TCP connect to the peer.
    pub connect_timeout_ms: u64,

    // -- Liveness --
    /// Seconds of silence after which a peer is declared dead.
    /// Ticks are sent every quarter of this.
    pub net_ticktime_secs: u64,

    // -- Transport --
    /// Largest accepted frame on a connected socket.
    pub max_frame_bytes: usize,

    // -- RPC --
    /// Default call timeout in milliseconds.
    pub default_rpc_timeout_ms: u64,
    /// Attempts when waiting for the peer's code server after connect.
    pub code_server_poll_tries: u32,
    /// Milliseconds between code server polls.
    pub code_server_poll_interval_ms: u64,
}

impl DistParams {
    /// Interval between outgoing ticks.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.net_ticktime_secs * 1000 / 4)
    }

    /// Silence tolerated on the read side before closing.
    pub const fn net_ticktime(&self) -> Duration {
        Duration::from_secs(self.net_ticktime_secs)
    }

    pub const fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Defaults matching a stock peer runtime (60s net tick time, port 4369).
pub const DEFAULT_PARAMS: DistParams = DistParams {
    // Discovery: 50 probes at 100ms, about 5s while the peer starts up
    epmd_port: 4369,
    discovery_interval_ms: 100,
    discovery_max_tries: 50,

    // Handshake
    handshake_timeout_ms: 10_000,
    connect_timeout_ms: 5_000,

    // Liveness
    net_ticktime_secs: 60,

    // Transport
    max_frame_bytes: 64 * 1024 * 1024,

    // RPC
    default_rpc_timeout_ms: 9_000,
    code_server_poll_tries: 10,
    code_server_poll_interval_ms: 200,
};
