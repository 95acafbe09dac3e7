//! TCP redirect: header rewriting plus the pair of local listeners that
//! impersonate every remote endpoint.
//!
//! Outbound client segments are rewritten so the kernel sees a connection
//! from the real destination towards the listener; the accepted socket's
//! remote address is then the lookup key that recovers the original
//! endpoints. Reply segments from the listener are rewritten back so the
//! client sees the destination it originally targeted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Error, LruCache};
use crate::nat::packet::{Ipv4Packet, Ipv6Packet, TcpSegment};
use crate::tun::{Handler, TunInterface};

/// Session entry TTL; refreshed by every matching segment.
const SESSION_TTL_SECS: i64 = 300;
/// Grace before dropping the session entry, for in-flight FIN/ACK rewrites.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Key: the endpoint the accepted socket appears to come from
/// (original destination address, original client source port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeerKey {
    pub addr: IpAddr,
    pub port: u16,
}

/// What the key recovers: the client address and the real destination port.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerSession {
    pub source: IpAddr,
    pub dest_port: u16,
}

pub(crate) struct TcpForwarder {
    tun: Arc<TunInterface>,
    handler: Arc<dyn Handler>,
    addr4: Ipv4Addr,
    addr6: Ipv6Addr,
    port4: u16,
    port6: u16,
    listener4: TcpListener,
    listener6: Option<TcpListener>,
    sessions: Arc<LruCache<PeerKey, PeerSession>>,
}

impl TcpForwarder {
    pub(crate) async fn new(
        tun: Arc<TunInterface>,
        handler: Arc<dyn Handler>,
        addr4: Ipv4Addr,
        addr6: Ipv6Addr,
        enable_ipv6: bool,
    ) -> Result<Arc<Self>> {
        let listener4 = TcpListener::bind(SocketAddr::new(IpAddr::V4(addr4), 0))
            .await
            .with_context(|| format!("failed to create tcp forwarder at {}", addr4))?;
        let port4 = listener4.local_addr()?.port();
        debug!(addr = %addr4, port = port4, "tcp forwarder started");

        let mut listener6 = None;
        let mut port6 = 0;
        if enable_ipv6 {
            let listener = TcpListener::bind(SocketAddr::new(IpAddr::V6(addr6), 0))
                .await
                .with_context(|| format!("failed to create tcp forwarder at {}", addr6))?;
            port6 = listener.local_addr()?.port();
            debug!(addr = %addr6, port = port6, "tcp forwarder started");
            listener6 = Some(listener);
        }

        Ok(Arc::new(Self {
            tun,
            handler,
            addr4,
            addr6,
            port4,
            port6,
            listener4,
            listener6,
            sessions: Arc::new(LruCache::new(SESSION_TTL_SECS, true)),
        }))
    }

    pub(crate) fn port4(&self) -> u16 {
        self.port4
    }

    pub(crate) fn port6(&self) -> u16 {
        self.port6
    }

    pub(crate) fn spawn_accept_loops(self: &Arc<Self>, cancel: &CancellationToken) {
        {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.accept_loop(false, cancel).await });
        }
        if self.listener6.is_some() {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.accept_loop(true, cancel).await });
        }
    }

    async fn accept_loop(self: Arc<Self>, v6: bool, cancel: CancellationToken) {
        let listener = if v6 {
            self.listener6.as_ref().expect("v6 loop without listener")
        } else {
            &self.listener4
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer)) => self.dispatch(conn, peer, &cancel),
                        Err(e) => {
                            debug!(error = %e, "tcp forwarder accept failed");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Recover the original endpoints for an accepted socket and hand the
    /// stream to the session manager.
    fn dispatch(self: &Arc<Self>, conn: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        let key = PeerKey {
            addr: peer.ip(),
            port: peer.port(),
        };
        let session = match self.sessions.get(&key) {
            Some(session) => session,
            None => {
                debug!(
                    port = key.port,
                    dest = %key.addr,
                    "dropped unknown tcp session"
                );
                return;
            }
        };

        let source = SocketAddr::new(session.source, key.port);
        let destination = SocketAddr::new(key.addr, session.dest_port);

        let handler = self.handler.clone();
        let sessions = self.sessions.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handler.new_stream(source, destination, conn).await;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(SESSION_CLOSE_GRACE) => {}
            }
            sessions.remove(&key);
        });
    }

    /// Rewrite one IPv4 TCP packet in place and reinject it.
    pub(crate) fn process_ipv4(&self, packet: &mut [u8]) -> Result<(), Error> {
        let header_len = Ipv4Packet::new(packet)?.header_len();
        let (ip_bytes, tcp_bytes) = packet.split_at_mut(header_len);
        let mut ip = Ipv4Packet::new(ip_bytes)?;
        let mut tcp = TcpSegment::new(tcp_bytes)?;

        let source = ip.src();
        let destination = ip.dst();
        let src_port = tcp.src_port();
        let dst_port = tcp.dst_port();

        if src_port != self.port4 {
            // client → internet
            let key = PeerKey {
                addr: IpAddr::V4(destination),
                port: src_port,
            };
            if self.sessions.get(&key).is_none() {
                self.sessions.insert(
                    key,
                    PeerSession {
                        source: IpAddr::V4(source),
                        dest_port: dst_port,
                    },
                );
            }
            ip.set_src(destination);
            ip.set_dst(self.addr4);
            tcp.set_dst_port(self.port4);
        } else {
            // listener → client
            let key = PeerKey {
                addr: IpAddr::V4(destination),
                port: dst_port,
            };
            let session = match self.sessions.get(&key) {
                Some(session) => session,
                None => {
                    warn!(
                        port = dst_port,
                        dest = %destination,
                        "unknown tcp session"
                    );
                    return Ok(());
                }
            };
            let client = match session.source {
                IpAddr::V4(addr) => addr,
                IpAddr::V6(_) => return Err(Error::Packet("session family mismatch".into())),
            };
            ip.set_src(destination);
            tcp.set_src_port(session.dest_port);
            ip.set_dst(client);
        }

        ip.update_checksum();
        tcp.update_checksum(IpAddr::V4(ip.src()), IpAddr::V4(ip.dst()));

        self.tun.write_packet(packet)?;
        Ok(())
    }

    /// Rewrite one IPv6 TCP packet in place and reinject it.
    /// `transport_offset` comes from the extension-chain walk.
    pub(crate) fn process_ipv6(
        &self,
        packet: &mut [u8],
        transport_offset: usize,
    ) -> Result<(), Error> {
        let (ip_bytes, tcp_bytes) = packet.split_at_mut(transport_offset);
        let mut ip = Ipv6Packet::new(ip_bytes)?;
        let mut tcp = TcpSegment::new(tcp_bytes)?;

        let source = ip.src();
        let destination = ip.dst();
        let src_port = tcp.src_port();
        let dst_port = tcp.dst_port();

        if src_port != self.port6 {
            let key = PeerKey {
                addr: IpAddr::V6(destination),
                port: src_port,
            };
            if self.sessions.get(&key).is_none() {
                self.sessions.insert(
                    key,
                    PeerSession {
                        source: IpAddr::V6(source),
                        dest_port: dst_port,
                    },
                );
            }
            ip.set_src(destination);
            ip.set_dst(self.addr6);
            tcp.set_dst_port(self.port6);
        } else {
            let key = PeerKey {
                addr: IpAddr::V6(destination),
                port: dst_port,
            };
            let session = match self.sessions.get(&key) {
                Some(session) => session,
                None => {
                    warn!(
                        port = dst_port,
                        dest = %destination,
                        "unknown tcp session"
                    );
                    return Ok(());
                }
            };
            let client = match session.source {
                IpAddr::V6(addr) => addr,
                IpAddr::V4(_) => return Err(Error::Packet("session family mismatch".into())),
            };
            ip.set_src(destination);
            tcp.set_src_port(session.dest_port);
            ip.set_dst(client);
        }

        // no header checksum on ipv6
        tcp.update_checksum(IpAddr::V6(ip.src()), IpAddr::V6(ip.dst()));

        self.tun.write_packet(packet)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn sessions(&self) -> &LruCache<PeerKey, PeerSession> {
        self.sessions.as_ref()
    }
}
