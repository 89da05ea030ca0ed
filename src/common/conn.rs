//! The duplex connection capability shared by both sides of a splice.
//!
//! Guest-facing connections come from the virtual stack, host-facing ones
//! from the real network. Both are trait objects with the same fixed
//! capability set, so the splicer never branches on the concrete type.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use super::Network;

/// 连接类型别名
pub type BoxConnection = Box<dyn Connection>;

/// Read, write, close (`AsyncWriteExt::shutdown` then drop), close with
/// reset, and the two endpoints.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    fn network(&self) -> Network;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Make the next close abortive (TCP RST instead of FIN). No-op for
    /// datagram connections.
    fn set_reset_on_close(&mut self);

    /// Single-shot session: tear down right after the first write.
    fn close_on_write(&self) -> bool {
        false
    }
}

/// Host-side TCP connection.
pub struct HostTcpConn {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
}

impl HostTcpConn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream,
            local,
            remote,
        })
    }
}

impl Connection for HostTcpConn {
    fn network(&self) -> Network {
        Network::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn set_reset_on_close(&mut self) {
        // SO_LINGER with a zero timeout makes close() send RST.
        if let Err(e) = socket2::SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            tracing::debug!(error = %e, remote = %self.remote, "set_linger(0) failed");
        }
    }
}

impl AsyncRead for HostTcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for HostTcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Host-side connected UDP socket. One read returns one datagram, one
/// write sends one datagram. Empty datagrams are skipped on read so that
/// a zero-length read always means end-of-stream.
pub struct HostUdpConn {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl HostUdpConn {
    /// `socket` must already be connected.
    pub fn new(socket: UdpSocket) -> io::Result<Self> {
        let local = socket.local_addr()?;
        let remote = socket.peer_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local,
            remote,
        })
    }
}

impl Connection for HostUdpConn {
    fn network(&self) -> Network {
        Network::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn set_reset_on_close(&mut self) {}
}

impl AsyncRead for HostUdpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let before = buf.filled().len();
            match self.socket.poll_recv(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before => continue,
                other => return other,
            }
        }
    }
}

impl AsyncWrite for HostUdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Wraps any byte stream as a [`Connection`] with fixed endpoints.
///
/// Used for in-memory pipes and for adapters whose stream type does not
/// know its own addresses.
pub struct StreamConn<S> {
    inner: S,
    network: Network,
    local: SocketAddr,
    remote: SocketAddr,
    close_on_write: bool,
    reset_on_close: bool,
}

impl<S> StreamConn<S> {
    pub fn new(inner: S, network: Network, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            inner,
            network,
            local,
            remote,
            close_on_write: false,
            reset_on_close: false,
        }
    }

    pub fn with_close_on_write(mut self, close_on_write: bool) -> Self {
        self.close_on_write = close_on_write;
        self
    }

    pub fn reset_on_close(&self) -> bool {
        self.reset_on_close
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Connection for StreamConn<S> {
    fn network(&self) -> Network {
        self.network
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn set_reset_on_close(&mut self) {
        self.reset_on_close = true;
    }

    fn close_on_write(&self) -> bool {
        self.close_on_write
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StreamConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StreamConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
