use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Marker for the duplex byte streams the bridge relays: the adopted
/// client socket on one side, whatever the engine's dial returns on the
/// other. Both only need to feed `copy_bidirectional`.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed stream as returned by [`ProxyEngine::dial`].
///
/// [`ProxyEngine::dial`]: crate::engine::ProxyEngine::dial
pub type ProxyStream = Box<dyn AsyncStream>;

/// Byte-counting wrapper around a client-side stream.
///
/// Reads (client → proxy) add to `uplink`, writes (proxy → client) add to
/// `downlink`. The counters are shared with the owning per-app stats record.
pub struct CountedStream<S> {
    inner: S,
    uplink: Arc<AtomicU64>,
    downlink: Arc<AtomicU64>,
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, uplink: Arc<AtomicU64>, downlink: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            uplink,
            downlink,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.uplink.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                self.downlink.fetch_add(*n as u64, Ordering::Relaxed);
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
