//! TUN endpoint and the handler seam.
//!
//! [`TunInterface`] owns the layer-3 file descriptor handed over by the
//! host application: every read yields exactly one IP datagram, every write
//! injects exactly one. Writes are non-blocking and a short write is an
//! error, matching the device contract.
//!
//! [`Handler`] is the contract between a packet backend and the session
//! manager. The system NAT implements the backend side; any userland-stack
//! backend that produces accepted streams and datagram flows can drive the
//! same handler.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;

use crate::pcap::PcapWriter;

/// Reinjection capability handed to the session manager together with each
/// new UDP flow.
pub trait WriteBack: Send + Sync {
    /// Rewrite one reply datagram into an IP packet and inject it towards
    /// the client. `from` is the reply source address; `None` keeps the
    /// association's original destination as the source.
    fn write_back(&self, payload: &[u8], from: Option<SocketAddr>) -> io::Result<usize>;
}

/// Consumer of flows surfaced by a packet backend.
#[async_trait]
pub trait Handler: Send + Sync {
    /// An accepted TCP connection, with its recovered original endpoints.
    async fn new_stream(&self, source: SocketAddr, destination: SocketAddr, stream: TcpStream);

    /// The first datagram of a (possibly new) UDP flow. The payload buffer
    /// is owned by the callee; replies travel through `write_back`.
    async fn new_packet(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        write_back: Arc<dyn WriteBack>,
    );
}

struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// The TUN file descriptor: async packet reads, non-blocking packet writes.
pub struct TunInterface {
    fd: AsyncFd<TunFd>,
    mtu: usize,
    pcap: Option<Arc<PcapWriter>>,
}

impl TunInterface {
    /// Takes ownership of `fd`. The descriptor is switched to non-blocking
    /// mode and closed on drop.
    pub fn new(fd: RawFd, mtu: usize, pcap: Option<Arc<PcapWriter>>) -> Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self {
            fd: AsyncFd::new(TunFd(fd))?,
            mtu,
            pcap,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Read one IP datagram into `buf`.
    pub async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => {
                    let n = result?;
                    if let Some(pcap) = &self.pcap {
                        pcap.write_packet(&buf[..n]);
                    }
                    return Ok(n);
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Inject one IP datagram. Non-blocking; a short write is an error.
    pub fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.get_ref().as_raw_fd(),
                packet.as_ptr().cast(),
                packet.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial write to tun",
            ));
        }
        if let Some(pcap) = &self.pcap {
            pcap.write_packet(packet);
        }
        Ok(n as usize)
    }

    /// Inject one IP datagram assembled from `header` and `payload` as a
    /// single gathered write.
    pub fn write_gathered(&self, header: &[u8], payload: &[u8]) -> io::Result<usize> {
        let iov = [
            libc::iovec {
                iov_base: header.as_ptr() as *mut _,
                iov_len: header.len(),
            },
            libc::iovec {
                iov_base: payload.as_ptr() as *mut _,
                iov_len: payload.len(),
            },
        ];
        let n = unsafe { libc::writev(self.fd.get_ref().as_raw_fd(), iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let total = header.len() + payload.len();
        if n as usize != total {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial write to tun",
            ));
        }
        if let Some(pcap) = &self.pcap {
            let mut whole = Vec::with_capacity(total);
            whole.extend_from_slice(header);
            whole.extend_from_slice(payload);
            pcap.write_packet(&whole);
        }
        Ok(total)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
