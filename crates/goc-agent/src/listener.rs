// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listen-port selection and the listen-address sidecar file.
//!
//! The agent tries to come back on the port it used in its previous life so a
//! center that cached the old address can still reach the restarted process.

use reqwest::Url;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tokio::net::{lookup_host, TcpListener, UdpSocket};
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind coverage agent to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid agent listen address {0}")]
    InvalidAddress(String),
}

/// A bound listener plus what was persisted for it.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub port: u16,
    /// `host:port` written to the sidecar file, if it could be resolved.
    pub advertised: Option<String>,
}

pub struct ListenerManager {
    agent_port: Option<String>,
    listen_addr_file: PathBuf,
    center: Option<Url>,
}

impl ListenerManager {
    pub fn new(config: &Config) -> Self {
        ListenerManager {
            agent_port: config.agent_port.clone(),
            listen_addr_file: config.listen_addr_file.clone(),
            center: config.center_url(),
        }
    }

    /// Binds a listener and records its reachable address in the sidecar file.
    ///
    /// Resolution order: the fixed agent port (fails loudly), the port of the
    /// previous session (falls through on any failure), an ephemeral port.
    pub async fn acquire(&self) -> Result<BoundListener, ListenerError> {
        let listener = self.bind().await?;
        let port = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind {
                addr: "local address".to_string(),
                source,
            })?
            .port();

        let advertised = match real_host(self.center.as_ref(), port).await {
            Ok(host) => {
                persist_listen_addr(&self.listen_addr_file, &host);
                Some(host)
            }
            Err(e) => {
                warn!("Unable to resolve the local address for port {port}: {e}");
                None
            }
        };

        Ok(BoundListener {
            listener,
            port,
            advertised,
        })
    }

    async fn bind(&self) -> Result<TcpListener, ListenerError> {
        if let Some(agent_port) = self.agent_port.as_deref() {
            let addr = resolve_agent_addr(agent_port).await?;
            return TcpListener::bind(addr)
                .await
                .map_err(|source| ListenerError::Bind {
                    addr: addr.to_string(),
                    source,
                });
        }

        if let Some(port) = read_previous_addr(&self.listen_addr_file)
            .as_deref()
            .and_then(port_of)
        {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    debug!("Reusing previous listen port {port}");
                    return Ok(listener);
                }
                Err(e) => debug!("Previous listen port {port} unavailable: {e}"),
            }
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })
    }
}

/// Accepts `:port`, `port` or `host:port`; an empty host means all
/// interfaces, a hostname is resolved to its first IPv4 address.
pub async fn resolve_agent_addr(agent_port: &str) -> Result<SocketAddr, ListenerError> {
    let agent_port = agent_port.trim();
    let invalid = || ListenerError::InvalidAddress(agent_port.to_string());
    let (host, port) = match agent_port.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", agent_port),
    };
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    if host.is_empty() {
        return Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)));
    }
    lookup_host((host, port))
        .await
        .map_err(|_| invalid())?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(invalid)
}

fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit(':').next()?.trim().parse().ok()
}

/// First line of the sidecar file, or `None` when it cannot be read.
pub fn read_previous_addr(path: &Path) -> Option<String> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("No previous listen address at {}: {e}", path.display());
            return None;
        }
    };
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).ok()?;
    let line = line.trim_end_matches(['\r', '\n']);
    (!line.is_empty()).then(|| line.to_string())
}

/// Overwrites the sidecar file with `host:port`. Failures are logged only.
pub fn persist_listen_addr(path: &Path, host: &str) {
    match fs::write(path, host) {
        Ok(()) => debug!("Listen address {host} saved to {}", path.display()),
        Err(e) => warn!("Failed to save listen address to {}: {e}", path.display()),
    }
}

/// Local IPv4 address the kernel would use to reach `target`.
pub async fn local_ipv4_towards(target: &str) -> io::Result<Ipv4Addr> {
    let remote = lookup_host((target, 80))
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for {target}"),
            )
        })?;

    // connect() on UDP only selects a route, nothing is sent
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(remote).await?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("unexpected IPv6 local address {addr}"),
        )),
    }
}

/// `host:port` under which the center can reach this agent.
pub async fn real_host(center: Option<&Url>, port: u16) -> io::Result<String> {
    let target = center
        .and_then(Url::host_str)
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or("127.0.0.1");
    let ip = local_ipv4_towards(target).await?;
    Ok(format!("{ip}:{port}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Config, CoverMode};
    use std::net::TcpListener as StdTcpListener;

    fn test_config(file: &Path) -> Config {
        let mut config = Config::new(Some("http://127.0.0.1:7777".to_string()), CoverMode::Count);
        config.listen_addr_file = file.to_path_buf();
        config
    }

    fn free_port() -> u16 {
        let listener = StdTcpListener::bind("0.0.0.0:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_resolve_agent_addr() {
        assert_eq!(
            resolve_agent_addr(":7777").await.unwrap(),
            "0.0.0.0:7777".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_agent_addr("7777").await.unwrap(),
            "0.0.0.0:7777".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_agent_addr("127.0.0.1:7777").await.unwrap(),
            "127.0.0.1:7777".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve_agent_addr("localhost:http").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_agent_addr_hostname() {
        let addr = resolve_agent_addr("localhost:7777").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 7777);
    }

    #[test]
    fn test_read_previous_addr_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc_profile_listen_addr");
        fs::write(&file, "10.0.0.3:4567\ngarbage").unwrap();
        assert_eq!(read_previous_addr(&file).as_deref(), Some("10.0.0.3:4567"));
        assert_eq!(read_previous_addr(&dir.path().join("missing")), None);
    }

    #[tokio::test]
    async fn test_real_host_defaults_to_loopback_route() {
        let host = real_host(None, 4321).await.unwrap();
        assert_eq!(host, "127.0.0.1:4321");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_real_host_resolves_center_hostname() {
        let center = Url::parse("http://localhost:7777").unwrap();
        let host = real_host(Some(&center), 4321).await.unwrap();
        assert_eq!(host, "127.0.0.1:4321");
    }

    #[tokio::test]
    async fn test_reuses_free_previous_port() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc_profile_listen_addr");
        let port = free_port();
        fs::write(&file, format!("127.0.0.1:{port}")).unwrap();

        let bound = ListenerManager::new(&test_config(&file))
            .acquire()
            .await
            .unwrap();
        assert_eq!(bound.port, port);
    }

    #[tokio::test]
    async fn test_occupied_previous_port_falls_back_to_ephemeral() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc_profile_listen_addr");
        let occupied = StdTcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        fs::write(&file, format!("127.0.0.1:{port}")).unwrap();

        let bound = ListenerManager::new(&test_config(&file))
            .acquire()
            .await
            .unwrap();
        assert_ne!(bound.port, port);
        assert_ne!(bound.port, 0);
    }

    #[tokio::test]
    async fn test_unreadable_previous_addr_falls_back_to_ephemeral() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc_profile_listen_addr");
        fs::write(&file, "not-an-address").unwrap();

        let bound = ListenerManager::new(&test_config(&file))
            .acquire()
            .await
            .unwrap();
        assert_ne!(bound.port, 0);
    }

    #[tokio::test]
    async fn test_acquire_persists_address() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc_profile_listen_addr");
        fs::write(&file, "stale content that is longer than an address").unwrap();

        let bound = ListenerManager::new(&test_config(&file))
            .acquire()
            .await
            .unwrap();
        let persisted = fs::read_to_string(&file).unwrap();
        assert_eq!(persisted, format!("127.0.0.1:{}", bound.port));
        assert_eq!(bound.advertised.as_deref(), Some(persisted.as_str()));
    }

    #[tokio::test]
    async fn test_fixed_port_fails_loudly_when_taken() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = StdTcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let mut config = test_config(&dir.path().join("svc_profile_listen_addr"));
        config.agent_port = Some(format!(":{port}"));

        let result = ListenerManager::new(&config).acquire().await;
        assert!(matches!(result, Err(ListenerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_fixed_port_binds_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let mut config = test_config(&dir.path().join("svc_profile_listen_addr"));
        config.agent_port = Some(format!(":{port}"));

        let bound = ListenerManager::new(&config).acquire().await.unwrap();
        assert_eq!(bound.port, port);
    }
}
