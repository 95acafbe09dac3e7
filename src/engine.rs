//! The consumed proxy-engine contract.
//!
//! The bridge never routes, resolves or sniffs by itself: every adopted
//! flow is described by a [`Session`] and handed to the engine through
//! [`ProxyEngine::dial`] / [`ProxyEngine::dial_udp`]. Sniffing and fake-DNS
//! are advertised as preferences on the session; executing them is the
//! engine's business.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{PacketConn, ProxyStream};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Dial destination.
///
/// The NAT only ever surfaces IP endpoints, so the bridge always hands the
/// engine an `Ip` target. `Domain` exists for the outbound direction: the
/// engine dials its own servers by hostname through the protected system
/// dialer, which resolves via the host resolver before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

/// Sniffing preferences attached to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffingRequest {
    /// Only metadata sniffers (fake-DNS) may run; payload is not delayed.
    pub metadata_only: bool,
    /// Sniffed protocol may influence routing but not the destination.
    pub route_only: bool,
    /// Protocols whose sniffed result may override the destination.
    pub override_destination_for: Vec<&'static str>,
}

/// 连接会话元数据
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    /// "tun" for ordinary flows, "dns-in" for hijacked resolver traffic.
    pub inbound_tag: &'static str,
    pub network: Network,
    pub source: SocketAddr,
    pub target: Address,
    /// Owning application uid, when resolvable.
    pub uid: Option<u32>,
    pub package_name: Option<String>,
    /// Host network info (wifi/cellular, SSID) as reported by the app.
    pub network_type: Option<String>,
    pub ssid: Option<String>,
    pub sniffing: Option<SniffingRequest>,
}

impl Session {
    pub fn new(network: Network, source: SocketAddr, target: Address) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            inbound_tag: "tun",
            network,
            source,
            target,
            uid: None,
            package_name: None,
            network_type: None,
            ssid: None,
            sniffing: None,
        }
    }
}

/// 代理引擎 trait：由宿主注入的拨号能力
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Open a stream to `session.target` through the proxy pipeline.
    async fn dial(&self, session: &Session) -> Result<ProxyStream>;

    /// Open a packet connection for `session.target`; the engine closes it
    /// after `idle_timeout` without traffic.
    async fn dial_udp(&self, session: &Session, idle_timeout: Duration)
        -> Result<Arc<dyn PacketConn>>;
}

/// Host-application resolver used by the protected dialer.
#[async_trait]
pub trait LocalResolver: Send + Sync {
    /// Resolve `host`; returns a comma-separated address list.
    async fn lookup_ip(&self, network: &str, host: &str) -> Result<String>;

    fn supports_exchange(&self) -> bool {
        false
    }

    /// Raw DNS wire exchange, when supported.
    async fn exchange(&self, _query: &[u8]) -> Result<Vec<u8>> {
        anyhow::bail!("exchange not supported")
    }
}
