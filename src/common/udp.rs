use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Proxied packet connection, as produced by the engine's UDP dial.
///
/// `recv_from` yields one datagram and the peer it came from; `send_to`
/// forwards one datagram towards `addr` through the proxy path. `close`
/// must wake any blocked `recv_from` with an error so reply pumps exit.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}

/// Byte-counting wrapper around a proxy-side packet connection.
///
/// Sends (client → proxy) add to `uplink`, receives (proxy → client) add to
/// `downlink`.
pub struct CountedPacketConn {
    inner: Arc<dyn PacketConn>,
    uplink: Arc<AtomicU64>,
    downlink: Arc<AtomicU64>,
}

impl CountedPacketConn {
    pub fn new(
        inner: Arc<dyn PacketConn>,
        uplink: Arc<AtomicU64>,
        downlink: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            uplink,
            downlink,
        }
    }
}

#[async_trait]
impl PacketConn for CountedPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        self.downlink.fetch_add(n as u64, Ordering::Relaxed);
        Ok((n, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let n = self.inner.send_to(buf, addr).await?;
        self.uplink.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
