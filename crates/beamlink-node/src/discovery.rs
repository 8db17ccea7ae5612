//! Peer discovery -- waiting for the discovery service and resolving node
//! names to ports.
//!
//! The service answers one request per TCP connection and closes the socket,
//! so every lookup opens a fresh connection and reads to EOF.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use beamlink_protocol::{epmd, DistParams};

use crate::NodeError;

/// How often and how long to probe for the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_tries: u32,
}

impl RetryPolicy {
    pub fn from_params(params: &DistParams) -> Self {
        Self {
            interval: params.discovery_interval(),
            max_tries: params.discovery_max_tries,
        }
    }

    /// Enough tries at `interval` to cover `max_wait` (at least one).
    pub fn for_max_wait(max_wait: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let tries = max_wait.as_millis().div_ceil(interval_ms).max(1);
        Self {
            interval,
            max_tries: u32::try_from(tries).unwrap_or(u32::MAX),
        }
    }
}

/// Where a resolved node listens, as reported by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_type: u8,
    pub protocol: u8,
    pub highest_version: u16,
    pub lowest_version: u16,
}

impl NodeAddress {
    pub fn is_hidden(&self) -> bool {
        self.node_type == epmd::NODE_TYPE_HIDDEN
    }
}

/// Probe until the discovery service accepts a TCP connection.
///
/// Cancel by dropping the future, or bound it with `tokio::time::timeout`.
pub async fn await_discovery_service(
    host: &str,
    port: u16,
    policy: RetryPolicy,
) -> Result<(), NodeError> {
    for attempt in 1..=policy.max_tries {
        match TcpStream::connect((host, port)).await {
            Ok(_) => {
                tracing::debug!(host, port, attempt, "discovery: service reachable");
                return Ok(());
            }
            Err(e) => {
                tracing::trace!(host, port, attempt, error = %e, "discovery: probe failed");
            }
        }
        if attempt < policy.max_tries {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(NodeError::Connection(format!(
        "discovery unreachable at {host}:{port} after {} tries",
        policy.max_tries
    )))
}

/// [`await_discovery_service`] with a maximum wait instead of a try count.
pub async fn await_discovery_service_for(
    host: &str,
    port: u16,
    max_wait: Duration,
    interval: Duration,
) -> Result<(), NodeError> {
    await_discovery_service(host, port, RetryPolicy::for_max_wait(max_wait, interval)).await
}

async fn exchange(host: &str, port: u16, request: &[u8]) -> Result<Vec<u8>, NodeError> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| NodeError::Connection(format!("discovery unreachable at {host}:{port}: {e}")))?;
    stream.write_all(request).await?;
    let mut resp = Vec::new();
    stream.read_to_end(&mut resp).await?;
    Ok(resp)
}

/// Look up the port of `alive` (the part of a node name before `@`).
pub async fn resolve(host: &str, port: u16, alive: &str) -> Result<NodeAddress, NodeError> {
    let resp = exchange(host, port, &epmd::encode_port_please(alive)).await?;
    match epmd::decode_port2_resp(&resp)? {
        Some(entry) => {
            tracing::debug!(
                node = alive,
                host,
                port = entry.port,
                highest = entry.highest_version,
                lowest = entry.lowest_version,
                "discovery: resolved"
            );
            Ok(NodeAddress {
                host: host.to_string(),
                port: entry.port,
                node_type: entry.node_type,
                protocol: entry.protocol,
                highest_version: entry.highest_version,
                lowest_version: entry.lowest_version,
            })
        }
        None => Err(NodeError::Connection(format!(
            "node {alive} is not registered with discovery at {host}:{port}"
        ))),
    }
}

/// All node names registered on `host`.
pub async fn names(host: &str, port: u16) -> Result<Vec<(String, u16)>, NodeError> {
    let resp = exchange(host, port, &epmd::encode_names_req()).await?;
    let (_, nodes) = epmd::parse_names(&resp)?;
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// One-shot service that answers every request with `resp`.
    async fn serve(resp: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut req = [0u8; 64];
                let _ = sock.read(&mut req).await;
                let _ = sock.write_all(&resp).await;
            }
        });
        port
    }

    #[test]
    fn test_policy_for_max_wait() {
        let p = RetryPolicy::for_max_wait(Duration::from_secs(5), Duration::from_millis(100));
        assert_eq!(p.max_tries, 50);
        let p = RetryPolicy::for_max_wait(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(p.max_tries, 1);
        let p = RetryPolicy::for_max_wait(Duration::from_millis(250), Duration::from_millis(100));
        assert_eq!(p.max_tries, 3);
    }

    #[tokio::test]
    async fn test_reachable_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            max_tries: 3,
        };
        await_discovery_service("127.0.0.1", port, policy).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_service_gives_up() {
        let port = free_port().await;
        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            max_tries: 3,
        };
        let err = await_discovery_service("127.0.0.1", port, policy)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("discovery unreachable"));
    }

    #[tokio::test]
    async fn test_service_that_starts_late() {
        let port = free_port().await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });
        await_discovery_service_for(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_by_timeout() {
        let port = free_port().await;
        let policy = RetryPolicy {
            interval: Duration::from_secs(1),
            max_tries: 1000,
        };
        let res = tokio::time::timeout(
            Duration::from_millis(50),
            await_discovery_service("127.0.0.1", port, policy),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_resolve_and_names() {
        let entry = epmd::NodeEntry {
            port: 40_000,
            node_type: epmd::NODE_TYPE_NORMAL,
            protocol: 0,
            highest_version: 6,
            lowest_version: 5,
            name: "backend".into(),
            extra: vec![],
        };
        let port = serve(epmd::encode_port2_resp(Some(&entry)).to_vec()).await;
        let addr = resolve("127.0.0.1", port, "backend").await.unwrap();
        assert_eq!(addr.port, 40_000);
        assert_eq!((addr.lowest_version, addr.highest_version), (5, 6));
        assert!(!addr.is_hidden());

        let port = serve(epmd::encode_port2_resp(None).to_vec()).await;
        assert!(resolve("127.0.0.1", port, "ghost").await.is_err());

        let port = serve(epmd::encode_names_resp(4369, &[("backend".into(), 40_000)]).to_vec()).await;
        assert_eq!(
            names("127.0.0.1", port).await.unwrap(),
            vec![("backend".to_string(), 40_000)]
        );
    }
}
