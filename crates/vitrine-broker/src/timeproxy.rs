//! Time proxy: one UDP exchange with the upstream time server per query.
//!
//! Displays have no network egress of their own; their time-protocol
//! datagrams arrive tunneled over the event channel and are relayed here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

/// Address family restriction for the upstream exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeProtocol {
    /// Either family, first resolved address wins.
    #[default]
    Udp,
    /// IPv4 only.
    Udp4,
    /// IPv6 only.
    Udp6,
}

impl TimeProtocol {
    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            TimeProtocol::Udp => true,
            TimeProtocol::Udp4 => addr.is_ipv4(),
            TimeProtocol::Udp6 => addr.is_ipv6(),
        }
    }
}

/// Failures of a single upstream exchange. The error text travels back to
/// the querying display as an `ntp-error` payload.
#[derive(Debug, Error)]
pub enum TimeProxyError {
    /// The time server host did not resolve.
    #[error("cannot resolve time server {host}: {source}")]
    Resolve {
        /// Configured upstream host.
        host: String,
        /// Underlying resolver failure.
        source: std::io::Error,
    },

    /// Resolution succeeded but produced no usable address.
    #[error("no usable address for time server {host}")]
    NoAddress {
        /// Configured upstream host.
        host: String,
    },

    /// Binding or connecting the socket failed.
    #[error("cannot reach time server {addr}: {source}")]
    Dial {
        /// Resolved upstream address.
        addr: SocketAddr,
        /// Underlying socket failure.
        source: std::io::Error,
    },

    /// Setting the requested TTL failed.
    #[error("cannot set TTL {ttl} on time query socket: {source}")]
    Ttl {
        /// Requested TTL.
        ttl: u32,
        /// Underlying socket failure.
        source: std::io::Error,
    },

    /// Sending the request datagram failed.
    #[error("cannot send time query: {0}")]
    Write(std::io::Error),

    /// Receiving the response datagram failed.
    #[error("cannot read time response: {0}")]
    Read(std::io::Error),

    /// No response arrived within the configured timeout.
    #[error("time query timed out after {0:?}")]
    Timeout(Duration),
}

/// Time proxy configuration.
#[derive(Clone, Debug)]
pub struct TimeProxyConfig {
    /// Upstream time server host.
    pub host: String,
    /// Upstream port.
    pub port: u16,
    /// Address family restriction.
    pub protocol: TimeProtocol,
    /// Local address to bind, if the broker host is multi-homed.
    pub local_addr: Option<IpAddr>,
    /// IPv4 TTL for the query packet, if restricted.
    pub ttl: Option<u32>,
    /// Deadline for the whole send/receive exchange.
    pub timeout: Duration,
}

impl TimeProxyConfig {
    /// Defaults for `host`: NTP port, either family, 5 s timeout.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 123,
            protocol: TimeProtocol::default(),
            local_addr: None,
            ttl: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Parse an upstream spec: `host`, `host:port` or `[v6]:port`. A spec
    /// without a port uses the NTP default.
    pub fn from_spec(spec: &str) -> Self {
        let (host, port) = split_host_port(spec);
        let mut config = Self::for_host(host);
        if let Some(port) = port {
            config.port = port;
        }
        config
    }
}

fn split_host_port(spec: &str) -> (String, Option<u16>) {
    if let Some(rest) = spec.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            if let Ok(port) = port.parse() {
                return (host.to_owned(), Some(port));
            }
        }
        if let Some(host) = rest.strip_suffix(']') {
            return (host.to_owned(), None);
        }
    } else if spec.matches(':').count() == 1 {
        if let Some((host, port)) = spec.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return (host.to_owned(), Some(port));
            }
        }
    }
    (spec.to_owned(), None)
}

/// Performs one query against the configured upstream per call.
#[derive(Clone, Debug)]
pub struct TimeProxy {
    config: TimeProxyConfig,
}

impl TimeProxy {
    /// Create a proxy from its configuration.
    pub fn new(config: TimeProxyConfig) -> Self {
        Self { config }
    }

    /// Send `request` upstream and return the response datagram.
    ///
    /// The response buffer is sized to the request (time-protocol
    /// exchanges are symmetric); the bytes actually received are returned.
    pub async fn query(&self, request: &[u8]) -> Result<Vec<u8>, TimeProxyError> {
        let config = &self.config;
        let mut addrs = lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|source| TimeProxyError::Resolve {
                host: config.host.clone(),
                source,
            })?;
        let remote = addrs
            .find(|addr| config.protocol.admits(addr))
            .ok_or_else(|| TimeProxyError::NoAddress {
                host: config.host.clone(),
            })?;

        let bind_addr: SocketAddr = match config.local_addr {
            Some(ip) => SocketAddr::new(ip, 0),
            None if remote.is_ipv4() => (Ipv4Addr::UNSPECIFIED, 0).into(),
            None => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TimeProxyError::Dial {
                addr: remote,
                source,
            })?;
        socket
            .connect(remote)
            .await
            .map_err(|source| TimeProxyError::Dial {
                addr: remote,
                source,
            })?;
        if let Some(ttl) = config.ttl {
            socket
                .set_ttl(ttl)
                .map_err(|source| TimeProxyError::Ttl { ttl, source })?;
        }

        debug!(remote = %remote, len = request.len(), "forwarding time query");
        let exchange = async {
            socket.send(request).await.map_err(TimeProxyError::Write)?;
            let mut response = vec![0u8; request.len()];
            let received = socket.recv(&mut response).await.map_err(TimeProxyError::Read)?;
            response.truncate(received);
            Ok(response)
        };
        tokio::time::timeout(config.timeout, exchange)
            .await
            .map_err(|_| TimeProxyError::Timeout(config.timeout))?
    }
}
