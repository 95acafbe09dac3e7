//! The bridge: glue between the system NAT and the proxy engine.
//!
//! [`TunBridge`] owns the datapath lifecycle. Its inner core implements
//! [`Handler`]: every accepted TCP connection and every UDP flow surfaced
//! by the NAT is turned into an engine [`Session`], dialed, relayed,
//! accounted and cleaned up here.

pub mod stats;
pub mod uid;

use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::{
    CondTable, CountedPacketConn, CountedStream, Flight, PacketConn, ProxyStream,
};
use crate::engine::{Address, LocalResolver, Network, ProxyEngine, Session, SniffingRequest};
use crate::nat::{Ipv6PolicyFn, NatOptions, SystemNat};
use crate::pcap::PcapWriter;
use crate::protect::{
    dialer::ProtectedDialer, server::ProtectServer, set_system_dialer, NoopProtector, Protector,
};
use crate::tun::{Handler, TunInterface, WriteBack};
use stats::{ActiveConn, AppStats, StatsRegistry};
use uid::UidDumper;

/// UDP 空闲超时，传给引擎的 dial_udp
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Plain bridge settings; capability objects travel in [`Platform`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// TUN file descriptor handed over by the host VpnService.
    #[serde(rename = "tun-fd")]
    pub tun_fd: i32,

    pub mtu: u16,

    /// Virtual NIC addresses; the local listeners bind here.
    pub addr4: Ipv4Addr,
    pub addr6: Ipv6Addr,

    /// Virtual DNS addresses; matching flows are tagged `dns-in`.
    pub dns4: Option<IpAddr>,
    pub dns6: Option<IpAddr>,

    #[serde(rename = "enable-ipv6")]
    pub enable_ipv6: bool,

    pub fakedns: bool,
    pub sniffing: bool,
    #[serde(rename = "override-destination")]
    pub override_destination: bool,

    #[serde(rename = "dump-uid")]
    pub dump_uid: bool,
    #[serde(rename = "traffic-stats")]
    pub traffic_stats: bool,
    /// Fall back to /proc/net scanning when the uid dumper has no answer.
    #[serde(rename = "use-procfs")]
    pub use_procfs: bool,

    #[serde(rename = "discard-icmp")]
    pub discard_icmp: bool,

    /// Path for the fd-protect unix socket; None disables the server.
    #[serde(rename = "protect-path")]
    pub protect_path: Option<String>,

    #[serde(rename = "pcap-snaplen")]
    pub pcap_snaplen: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tun_fd: -1,
            mtu: 1500,
            addr4: Ipv4Addr::new(172, 19, 0, 1),
            addr6: "fdfe:dcba:9876::1".parse().expect("valid addr6"),
            dns4: None,
            dns6: None,
            enable_ipv6: false,
            fakedns: false,
            sniffing: false,
            override_destination: false,
            dump_uid: false,
            traffic_stats: false,
            use_procfs: false,
            discard_icmp: false,
            protect_path: None,
            pcap_snaplen: crate::pcap::DEFAULT_SNAPLEN,
        }
    }
}

/// Host-injected capabilities.
pub struct Platform {
    pub protector: Option<Arc<dyn Protector>>,
    pub uid_dumper: Option<Arc<dyn UidDumper>>,
    pub resolver: Option<Arc<dyn LocalResolver>>,
    /// Capture sink for everything crossing the TUN fd.
    pub pcap_sink: Option<Box<dyn Write + Send>>,
    /// Dynamic IPv6 verdict, re-evaluated per packet.
    pub ipv6_policy: Option<Ipv6PolicyFn>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            protector: None,
            uid_dumper: None,
            resolver: None,
            pcap_sink: None,
            ipv6_policy: None,
        }
    }
}

pub struct TunBridge {
    nat: Arc<SystemNat>,
    core: Arc<BridgeCore>,
    protect_server: Option<ProtectServer>,
    dialer_installed: bool,
}

impl TunBridge {
    pub async fn new(
        engine: Arc<dyn ProxyEngine>,
        settings: BridgeSettings,
        platform: Platform,
    ) -> Result<Self> {
        if settings.tun_fd < 0 {
            anyhow::bail!("invalid tun fd: {}", settings.tun_fd);
        }

        let pcap = match platform.pcap_sink {
            Some(sink) => Some(Arc::new(PcapWriter::new(sink, settings.pcap_snaplen)?)),
            None => None,
        };
        let tun = Arc::new(TunInterface::new(
            settings.tun_fd,
            settings.mtu as usize,
            pcap,
        )?);

        let cancel = CancellationToken::new();
        let core = Arc::new(BridgeCore {
            engine,
            mtu: settings.mtu as usize,
            dns4: settings.dns4,
            dns6: settings.dns6,
            fakedns: settings.fakedns,
            sniffing: settings.sniffing,
            override_destination: settings.override_destination,
            dump_uid: settings.dump_uid,
            traffic_stats: settings.traffic_stats,
            use_procfs: settings.use_procfs,
            uid_dumper: platform.uid_dumper,
            udp_table: Mutex::new(HashMap::new()),
            lock_table: CondTable::new(),
            stats: StatsRegistry::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            host: HostNetwork::default(),
            cancel: cancel.clone(),
        });

        let nat = SystemNat::new(
            tun,
            core.clone(),
            NatOptions {
                addr4: settings.addr4,
                addr6: settings.addr6,
                enable_ipv6: settings.enable_ipv6,
                discard_icmp: settings.discard_icmp,
                ipv6_policy: platform.ipv6_policy,
            },
        )
        .await?;

        let protector = platform
            .protector
            .unwrap_or_else(|| Arc::new(NoopProtector));

        let protect_server = match &settings.protect_path {
            Some(path) => Some(ProtectServer::serve(path, protector.clone())?),
            None => None,
        };

        let mut dialer_installed = false;
        if let Some(resolver) = platform.resolver {
            set_system_dialer(Some(Box::new(ProtectedDialer::new(protector, resolver))));
            dialer_installed = true;
        }

        info!(
            mtu = settings.mtu,
            port4 = nat.tcp_port4(),
            port6 = nat.tcp_port6(),
            "tun bridge started"
        );

        Ok(Self {
            nat,
            core,
            protect_server,
            dialer_installed,
        })
    }

    /// Update the host network info attached to new sessions.
    pub fn set_network_info(&self, network_type: Option<String>, ssid: Option<String>) {
        self.core.host.network_type.store(network_type.map(Arc::new));
        self.core.host.ssid.store(ssid.map(Arc::new));
    }

    pub fn app_stats(&self, uid: u32) -> Option<Arc<AppStats>> {
        self.core.stats.get(uid)
    }

    pub fn stats_snapshot(&self) -> Vec<(u32, Arc<AppStats>)> {
        self.core.stats.snapshot()
    }

    pub fn tcp_port4(&self) -> u16 {
        self.nat.tcp_port4()
    }

    pub fn tcp_port6(&self) -> u16 {
        self.nat.tcp_port6()
    }

    /// Tear everything down: the dialer override, the NAT loops, every
    /// adopted session and the protect server.
    pub fn close(&mut self) {
        if self.dialer_installed {
            set_system_dialer(None);
            self.dialer_installed = false;
        }
        self.nat.close();
        self.core.cancel.cancel();
        self.core.registry.close_all();
        if let Some(server) = self.protect_server.take() {
            server.close();
        }
        info!("tun bridge closed");
    }
}

impl Drop for TunBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct HostNetwork {
    network_type: ArcSwapOption<String>,
    ssid: ArcSwapOption<String>,
}

pub(crate) struct BridgeCore {
    engine: Arc<dyn ProxyEngine>,
    mtu: usize,
    dns4: Option<IpAddr>,
    dns6: Option<IpAddr>,
    fakedns: bool,
    sniffing: bool,
    override_destination: bool,
    dump_uid: bool,
    traffic_stats: bool,
    use_procfs: bool,
    uid_dumper: Option<Arc<dyn UidDumper>>,
    /// natKey (client source) → proxy packet connection
    udp_table: Mutex<HashMap<SocketAddr, Arc<dyn PacketConn>>>,
    /// Coalesces concurrent UDP dials per natKey.
    lock_table: CondTable<SocketAddr>,
    stats: StatsRegistry,
    registry: Arc<ConnectionRegistry>,
    host: HostNetwork,
    cancel: CancellationToken,
}

struct ResolvedUid {
    uid: Option<u32>,
    is_self: bool,
    package_name: Option<String>,
}

impl BridgeCore {
    fn is_dns_address(&self, destination: SocketAddr) -> bool {
        let ip = destination.ip();
        self.dns4 == Some(ip) || self.dns6 == Some(ip)
    }

    fn resolve_uid(
        &self,
        network: Network,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> ResolvedUid {
        if !(self.dump_uid || self.traffic_stats) {
            return ResolvedUid {
                uid: None,
                is_self: false,
                package_name: None,
            };
        }
        let mut uid = None;
        if let Some(dumper) = &self.uid_dumper {
            uid = dumper.dump_uid(network, source, destination).ok();
        }
        if uid.is_none() && self.use_procfs {
            uid = uid::query_uid_from_procfs(network, source);
        }
        let is_self = uid.map(|u| u == process_uid()).unwrap_or(false);
        let package_name = match (&self.uid_dumper, uid) {
            (Some(dumper), Some(u)) if !is_self => dumper.package_name(u),
            _ => None,
        };
        ResolvedUid {
            uid,
            is_self,
            package_name,
        }
    }

    fn sniffing_request(&self, network: Network) -> Option<SniffingRequest> {
        if !(self.sniffing || self.fakedns) {
            return None;
        }
        let mut protocols = Vec::new();
        if self.fakedns {
            protocols.push("fakedns");
        }
        if self.sniffing {
            match network {
                Network::Tcp => protocols.extend(["http", "tls"]),
                Network::Udp => protocols.push("quic"),
            }
        }
        Some(SniffingRequest {
            metadata_only: self.fakedns && !self.sniffing,
            route_only: !self.override_destination,
            override_destination_for: protocols,
        })
    }

    fn build_session(
        &self,
        network: Network,
        source: SocketAddr,
        destination: SocketAddr,
        is_dns: bool,
    ) -> (Session, ResolvedUid) {
        let mut session = Session::new(network, source, Address::Ip(destination));
        if is_dns {
            session.inbound_tag = "dns-in";
        }
        session.network_type = self
            .host
            .network_type
            .load_full()
            .map(|s| s.as_ref().clone());
        session.ssid = self.host.ssid.load_full().map(|s| s.as_ref().clone());

        let resolved = self.resolve_uid(network, source, destination);
        session.uid = resolved.uid;
        session.package_name = resolved.package_name.clone();

        if let (Some(uid), false) = (resolved.uid, resolved.is_self) {
            match &resolved.package_name {
                Some(package) => info!(
                    session = session.id,
                    uid,
                    package = package.as_str(),
                    "[{}] {} ==> {}",
                    network.as_str().to_uppercase(),
                    source,
                    destination
                ),
                None => info!(
                    session = session.id,
                    uid,
                    "[{}] {} ==> {}",
                    network.as_str().to_uppercase(),
                    source,
                    destination
                ),
            }
        }

        if !is_dns {
            session.sniffing = self.sniffing_request(network);
        }
        (session, resolved)
    }

    /// Fast path: forward one datagram over an existing association.
    /// Returns false when no association exists.
    async fn send_to_existing(
        &self,
        nat_key: SocketAddr,
        destination: SocketAddr,
        payload: &[u8],
    ) -> bool {
        let conn = {
            let table = match self.udp_table.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match table.get(&nat_key) {
                Some(conn) => conn.clone(),
                None => return false,
            }
        };
        if let Err(e) = conn.send_to(payload, destination).await {
            debug!(error = %e, key = %nat_key, "udp forward failed, dropping association");
            let _ = conn.close().await;
            self.remove_udp(nat_key);
        }
        true
    }

    fn insert_udp(&self, nat_key: SocketAddr, conn: Arc<dyn PacketConn>) {
        match self.udp_table.lock() {
            Ok(mut table) => {
                table.insert(nat_key, conn);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(nat_key, conn);
            }
        }
    }

    fn remove_udp(&self, nat_key: SocketAddr) {
        match self.udp_table.lock() {
            Ok(mut table) => {
                table.remove(&nat_key);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&nat_key);
            }
        }
    }
}

#[async_trait]
impl Handler for BridgeCore {
    async fn new_stream(&self, source: SocketAddr, destination: SocketAddr, conn: TcpStream) {
        let is_dns = self.is_dns_address(destination);
        if is_dns && destination.port() != 53 {
            // 非 53 端口打到虚拟 DNS 地址：直接断开
            return;
        }

        let (session, resolved) = self.build_session(Network::Tcp, source, destination, is_dns);

        let mut active = None;
        let client: ProxyStream = if self.traffic_stats && !resolved.is_self && !is_dns {
            let stats = self.stats.get_or_create(session.uid.unwrap_or(0)).await;
            active = Some(ActiveConn::begin(stats.clone(), Network::Tcp));
            Box::new(CountedStream::new(
                conn,
                stats.uplink.clone(),
                stats.downlink.clone(),
            ))
        } else {
            Box::new(conn)
        };

        let guard = self.registry.register(&self.cancel);

        let proxy = match self.engine.dial(&session).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(session = session.id, target = %session.target, error = %e, "proxy dial failed");
                return;
            }
        };

        relay(client, proxy, guard.token.clone()).await;
        drop(active);
    }

    async fn new_packet(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        write_back: Arc<dyn WriteBack>,
    ) {
        let nat_key = source;

        if self.send_to_existing(nat_key, destination, &payload).await {
            return;
        }

        let flight = match self.lock_table.join(nat_key).await {
            Flight::Leader(guard) => guard,
            Flight::Follower => {
                // The winner has published (or failed); one more try, then
                // give the datagram up.
                self.send_to_existing(nat_key, destination, &payload).await;
                return;
            }
        };

        let is_dns = self.is_dns_address(destination);
        if is_dns && destination.port() != 53 {
            return;
        }

        let (session, resolved) = self.build_session(Network::Udp, source, destination, is_dns);

        let conn = match self.engine.dial_udp(&session, UDP_IDLE_TIMEOUT).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(session = session.id, target = %session.target, error = %e, "proxy udp dial failed");
                return;
            }
        };

        let mut active = None;
        let conn: Arc<dyn PacketConn> = if self.traffic_stats && !resolved.is_self && !is_dns {
            let stats = self.stats.get_or_create(session.uid.unwrap_or(0)).await;
            active = Some(ActiveConn::begin(stats.clone(), Network::Udp));
            Arc::new(CountedPacketConn::new(
                conn,
                stats.uplink.clone(),
                stats.downlink.clone(),
            ))
        } else {
            conn
        };

        let guard = self.registry.register(&self.cancel);
        self.insert_udp(nat_key, conn.clone());
        drop(flight);

        if let Err(e) = conn.send_to(&payload, destination).await {
            debug!(session = session.id, error = %e, "initial udp send failed");
        }
        drop(payload);

        // Reply pump: one per association, ends on read error, write-back
        // failure or bridge shutdown.
        let mut buf = vec![0u8; self.mtu];
        loop {
            tokio::select! {
                _ = guard.token.cancelled() => break,
                received = conn.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            debug!(session = session.id, error = %e, "udp association closed");
                            break;
                        }
                    };
                    let from = if is_dns { None } else { Some(from) };
                    if let Err(e) = write_back.write_back(&buf[..n], from) {
                        debug!(session = session.id, error = %e, "udp write back failed");
                        break;
                    }
                }
            }
        }

        let _ = conn.close().await;
        self.remove_udp(nat_key);
        drop(active);
    }
}

/// 双向数据转发，关闭信号到达时中止
async fn relay(mut client: ProxyStream, mut proxy: ProxyStream, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut client, &mut proxy) => {
            match result {
                Ok((up, down)) => {
                    debug!("relay finished: client->proxy {}B, proxy->client {}B", up, down)
                }
                Err(e) => debug!(error = %e, "relay ended"),
            }
        }
    }
}

fn process_uid() -> u32 {
    unsafe { libc::getuid() }
}

/// Registry of live adopted sessions, for bulk close on shutdown.
pub(crate) struct ConnectionRegistry {
    next: AtomicU64,
    conns: Mutex<HashMap<u64, CancellationToken>>,
}

pub(crate) struct SessionGuard {
    id: u64,
    pub token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionRegistry {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn register(self: &Arc<Self>, parent: &CancellationToken) -> SessionGuard {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        match self.conns.lock() {
            Ok(mut conns) => {
                conns.insert(id, token.clone());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, token.clone());
            }
        }
        SessionGuard {
            id,
            token,
            registry: self.clone(),
        }
    }

    fn close_all(&self) {
        let conns = match self.conns.lock() {
            Ok(mut conns) => std::mem::take(&mut *conns),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (_, token) in conns {
            token.cancel();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.conns.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        match self.registry.conns.lock() {
            Ok(mut conns) => {
                conns.remove(&self.id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.id);
            }
        }
    }
}
