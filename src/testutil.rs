//! Shared helpers for unit tests: a datagram socketpair standing in for
//! the TUN fd, and a recording `Handler`.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::tun::{Handler, WriteBack};

/// AF_UNIX datagram socketpair: preserves packet boundaries like a TUN fd.
pub(crate) fn packet_pair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "socketpair failed");
    (fds[0], fds[1])
}

/// Blocking read of one datagram; the test must have produced it already.
pub(crate) fn read_fd(fd: RawFd) -> Vec<u8> {
    let mut buf = vec![0u8; 65535];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert!(n >= 0, "read failed");
    buf.truncate(n as usize);
    buf
}

/// Non-blocking read of one datagram, None when nothing is queued.
pub(crate) fn try_read_fd(fd: RawFd) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 65535];
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return None;
    }
    buf.truncate(n as usize);
    Some(buf)
}

/// Write one datagram into the peer side of the pair.
pub(crate) fn write_fd(fd: RawFd, data: &[u8]) {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    assert_eq!(n as usize, data.len(), "short write");
}

type StreamEvent = (SocketAddr, SocketAddr);
type PacketEvent = (SocketAddr, SocketAddr, Bytes, Arc<dyn WriteBack>);

pub(crate) struct RecordingHandler {
    stream_tx: UnboundedSender<StreamEvent>,
    stream_rx: Mutex<UnboundedReceiver<StreamEvent>>,
    packet_tx: UnboundedSender<PacketEvent>,
    packet_rx: Mutex<UnboundedReceiver<PacketEvent>>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        let (stream_tx, stream_rx) = unbounded_channel();
        let (packet_tx, packet_rx) = unbounded_channel();
        Self {
            stream_tx,
            stream_rx: Mutex::new(stream_rx),
            packet_tx,
            packet_rx: Mutex::new(packet_rx),
        }
    }
}

impl RecordingHandler {
    pub(crate) async fn wait_stream(&self) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), self.stream_rx.lock().await.recv())
            .await
            .expect("timed out waiting for stream")
            .expect("handler dropped")
    }

    pub(crate) async fn wait_packet(&self) -> PacketEvent {
        tokio::time::timeout(Duration::from_secs(5), self.packet_rx.lock().await.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("handler dropped")
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn new_stream(&self, source: SocketAddr, destination: SocketAddr, _stream: TcpStream) {
        let _ = self.stream_tx.send((source, destination));
    }

    async fn new_packet(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        write_back: Arc<dyn WriteBack>,
    ) {
        let _ = self.packet_tx.send((source, destination, payload, write_back));
    }
}
