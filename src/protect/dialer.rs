//! Protected outbound dialer.
//!
//! Every socket is created first, handed to the protector, given its
//! socket options, and only then connected (TCP) or bound (UDP). Domain
//! targets resolve through the injected host resolver; candidates are
//! tried in order and the combined failures surface in one error.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use super::{Protector, SystemDialer};
use crate::common::Error;
use crate::engine::{Address, LocalResolver};

/// Socket options applied between protect and connect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerOptions {
    /// Linux SO_MARK / fwmark.
    #[serde(rename = "routing-mark")]
    pub routing_mark: Option<u32>,

    /// Bind outbound sockets to a specific interface (SO_BINDTODEVICE).
    #[serde(rename = "interface-name")]
    pub interface_name: Option<String>,
}

pub struct ProtectedDialer {
    protector: Arc<dyn Protector>,
    resolver: Arc<dyn LocalResolver>,
    options: DialerOptions,
}

impl ProtectedDialer {
    pub fn new(protector: Arc<dyn Protector>, resolver: Arc<dyn LocalResolver>) -> Self {
        Self {
            protector,
            resolver,
            options: DialerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DialerOptions) -> Self {
        self.options = options;
        self
    }

    async fn resolve(&self, destination: &Address) -> Result<Vec<IpAddr>> {
        match destination {
            Address::Ip(addr) => Ok(vec![addr.ip()]),
            Address::Domain(host, _) => {
                let response = self
                    .resolver
                    .lookup_ip("ip", host)
                    .await
                    .map_err(|e| Error::DnsResolution(e.to_string()))?;
                if response.is_empty() {
                    return Err(Error::EmptyDnsResponse.into());
                }
                let ips: Vec<IpAddr> = response
                    .split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect();
                if ips.is_empty() {
                    return Err(Error::EmptyDnsResponse.into());
                }
                Ok(ips)
            }
        }
    }

    async fn dial_tcp_once(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if !self.protector.protect(socket.as_raw_fd()) {
            return Err(Error::ProtectFailed.into());
        }
        self.apply_options(socket.as_raw_fd())?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    #[cfg(target_os = "linux")]
    fn apply_options(&self, fd: std::os::fd::RawFd) -> Result<()> {
        if let Some(mark) = self.options.routing_mark {
            let mark = mark as libc::c_int;
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_MARK,
                    &mark as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                anyhow::bail!("failed to set SO_MARK: {}", std::io::Error::last_os_error());
            }
        }
        if let Some(interface) = &self.options.interface_name {
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_BINDTODEVICE,
                    interface.as_ptr().cast(),
                    interface.len() as libc::socklen_t,
                )
            };
            if ret != 0 {
                anyhow::bail!(
                    "failed to bind to {}: {}",
                    interface,
                    std::io::Error::last_os_error()
                );
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_options(&self, _fd: std::os::fd::RawFd) -> Result<()> {
        if self.options.routing_mark.is_some() || self.options.interface_name.is_some() {
            debug!("socket options unsupported on this platform, skipped");
        }
        Ok(())
    }
}

#[async_trait]
impl SystemDialer for ProtectedDialer {
    async fn dial_tcp(&self, destination: &Address) -> Result<TcpStream> {
        let ips = self.resolve(destination).await?;
        let port = destination.port();

        let mut failures = Vec::new();
        for ip in ips {
            let addr = SocketAddr::new(ip, port);
            match self.dial_tcp_once(addr).await {
                Ok(stream) => {
                    debug!(addr = %addr, "protected dial connected");
                    return Ok(stream);
                }
                Err(e) => failures.push(format!("{}: {}", addr, e)),
            }
        }
        anyhow::bail!(
            "failed to connect to {}: [{}]",
            destination,
            failures.join("; ")
        )
    }

    /// UDP sockets are always dual-stack v6, bound unconnected, like the
    /// engine expects for its packet connections.
    async fn bind_udp(&self, destination: &Address) -> Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        if !self.protector.protect(socket.as_raw_fd()) {
            return Err(Error::ProtectFailed.into());
        }
        self.apply_options(socket.as_raw_fd())?;
        socket.set_only_v6(false)?;
        let bind_addr: SocketAddr = "[::]:0".parse().expect("valid any addr");
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind udp socket for {}", destination))?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}
