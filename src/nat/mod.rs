//! System NAT: the userspace bridge between the TUN descriptor and the
//! kernel sockets the session manager adopts.
//!
//! A single reader owns the TUN fd. Each datagram is demuxed on the IP
//! version nibble and transport protocol: TCP goes through the header
//! rewriter and straight back into TUN, UDP transfers buffer ownership to
//! the dispatcher and the handler, ICMP echoes are answered locally,
//! everything else is dropped.

pub mod icmp;
pub mod packet;
pub mod tcp;
pub mod udp;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::tun::{Handler, TunInterface};
use packet::{
    ip_version, Ipv4Packet, Ipv6Packet, IPV6_HEADER_LEN, PROTO_ICMPV4, PROTO_ICMPV6, PROTO_TCP,
    PROTO_UDP,
};
use tcp::TcpForwarder;

/// Per-packet verdict for IPv6 traffic, re-evaluated on every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Policy {
    Forward,
    Drop,
    /// 只保留 TCP（移动网络下常见的降级模式）
    DropExceptTcp,
}

pub type Ipv6PolicyFn = Arc<dyn Fn() -> Ipv6Policy + Send + Sync>;

pub struct NatOptions {
    /// Virtual NIC addresses; the TCP listeners bind here.
    pub addr4: Ipv4Addr,
    pub addr6: Ipv6Addr,
    pub enable_ipv6: bool,
    /// Drop all ICMP without answering echoes.
    pub discard_icmp: bool,
    /// Dynamic IPv6 verdict; `None` means forward.
    pub ipv6_policy: Option<Ipv6PolicyFn>,
}

pub struct SystemNat {
    tun: Arc<TunInterface>,
    handler: Arc<dyn Handler>,
    tcp: Arc<TcpForwarder>,
    options: NatOptions,
    cancel: CancellationToken,
}

impl SystemNat {
    /// Builds the forwarder listeners and starts the accept and dispatch
    /// loops. The returned handle only needs `close` called on teardown.
    pub async fn new(
        tun: Arc<TunInterface>,
        handler: Arc<dyn Handler>,
        options: NatOptions,
    ) -> Result<Arc<Self>> {
        let tcp = TcpForwarder::new(
            tun.clone(),
            handler.clone(),
            options.addr4,
            options.addr6,
            options.enable_ipv6,
        )
        .await?;

        let cancel = CancellationToken::new();
        let nat = Arc::new(Self {
            tun,
            handler,
            tcp,
            options,
            cancel,
        });
        nat.tcp.spawn_accept_loops(&nat.cancel);
        {
            let nat = nat.clone();
            tokio::spawn(async move { nat.dispatch_loop().await });
        }
        Ok(nat)
    }

    pub fn tcp_port4(&self) -> u16 {
        self.tcp.port4()
    }

    pub fn tcp_port6(&self) -> u16 {
        self.tcp.port6()
    }

    /// Fires when the NAT has shut down (close call or fatal TUN error).
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.tun.mtu()];
        info!(mtu = self.tun.mtu(), "system nat started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.tun.read_packet(&mut buf) => {
                    let n = match read {
                        Ok(0) => continue,
                        Ok(n) => n,
                        Err(e) => {
                            // The TUN fd is gone; nothing to recover.
                            error!(error = %e, "tun read failed, shutting down");
                            self.cancel.cancel();
                            break;
                        }
                    };
                    self.deliver(&mut buf[..n]);
                }
            }
        }
        info!("system nat stopped");
    }

    fn deliver(self: &Arc<Self>, packet: &mut [u8]) {
        match ip_version(packet) {
            Some(4) => self.deliver_ipv4(packet),
            Some(6) => self.deliver_ipv6(packet),
            other => {
                debug!(version = ?other, "dropping packet with unknown ip version");
            }
        }
    }

    fn deliver_ipv4(self: &Arc<Self>, packet: &mut [u8]) {
        let (protocol, total_len) = match Ipv4Packet::new(packet) {
            Ok(ip) => (ip.protocol(), ip.total_len() as usize),
            Err(e) => {
                debug!(error = %e, "malformed ipv4 packet");
                return;
            }
        };
        if total_len > packet.len() {
            debug!(total_len, actual = packet.len(), "truncated ipv4 packet");
            return;
        }
        let packet = &mut packet[..total_len];

        match protocol {
            PROTO_TCP => {
                if let Err(e) = self.tcp.process_ipv4(packet) {
                    debug!(error = %e, "tcp rewrite failed");
                }
            }
            PROTO_UDP => self.dispatch_udp_v4(packet),
            PROTO_ICMPV4 => {
                if self.options.discard_icmp {
                    return;
                }
                match icmp::icmpv4_echo_reply(packet) {
                    Ok(true) => {
                        if let Err(e) = self.tun.write_packet(packet) {
                            debug!(error = %e, "icmp reply write failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "malformed icmpv4 packet"),
                }
            }
            proto => {
                debug!(protocol = proto, "unsupported ipv4 protocol");
            }
        }
    }

    fn deliver_ipv6(self: &Arc<Self>, packet: &mut [u8]) {
        if !self.options.enable_ipv6 {
            return;
        }
        let verdict = self
            .options
            .ipv6_policy
            .as_ref()
            .map(|policy| policy())
            .unwrap_or(Ipv6Policy::Forward);
        if verdict == Ipv6Policy::Drop {
            return;
        }

        let (protocol, transport_offset, payload_len) = {
            let ip = match Ipv6Packet::new(packet) {
                Ok(ip) => ip,
                Err(e) => {
                    debug!(error = %e, "malformed ipv6 packet");
                    return;
                }
            };
            let payload_len = ip.payload_len() as usize;
            match ip.transport() {
                Ok((proto, offset)) => (proto, offset, payload_len),
                Err(e) => {
                    debug!(error = %e, "undecodable ipv6 extension chain");
                    return;
                }
            }
        };
        let total_len = IPV6_HEADER_LEN + payload_len;
        if total_len > packet.len() || transport_offset > total_len {
            debug!(total_len, actual = packet.len(), "truncated ipv6 packet");
            return;
        }
        let packet = &mut packet[..total_len];

        if verdict == Ipv6Policy::DropExceptTcp && protocol != PROTO_TCP {
            return;
        }

        match protocol {
            PROTO_TCP => {
                if let Err(e) = self.tcp.process_ipv6(packet, transport_offset) {
                    debug!(error = %e, "tcp rewrite failed");
                }
            }
            PROTO_UDP => self.dispatch_udp_v6(packet, transport_offset),
            PROTO_ICMPV6 => {
                if self.options.discard_icmp {
                    return;
                }
                match icmp::icmpv6_echo_reply(packet, transport_offset) {
                    Ok(true) => {
                        if let Err(e) = self.tun.write_packet(packet) {
                            debug!(error = %e, "icmp reply write failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "malformed icmpv6 packet"),
                }
            }
            proto => {
                debug!(protocol = proto, "unsupported ipv6 protocol");
            }
        }
    }

    fn dispatch_udp_v4(self: &Arc<Self>, packet: &mut [u8]) {
        match udp::prepare_ipv4(&self.tun, packet) {
            Ok(flow) => self.spawn_udp(flow),
            Err(e) => debug!(error = %e, "udp dispatch failed"),
        }
    }

    fn dispatch_udp_v6(self: &Arc<Self>, packet: &mut [u8], transport_offset: usize) {
        match udp::prepare_ipv6(&self.tun, packet, transport_offset) {
            Ok(flow) => self.spawn_udp(flow),
            Err(e) => debug!(error = %e, "udp dispatch failed"),
        }
    }

    /// The proxy dial must not stall the packet loop; each flow goes to its
    /// own task.
    fn spawn_udp(&self, flow: udp::UdpFlow) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler
                .new_packet(flow.source, flow.destination, flow.payload, flow.write_back)
                .await;
        });
    }
}
