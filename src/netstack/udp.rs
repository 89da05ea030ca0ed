use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::packet::build_udp_packet;
use super::stack::{lock, Stack};
use super::{EndpointOptions, FlowId, UdpFlowRequest};
use crate::common::{BoxConnection, Connection, GatewayError, Network};

/// Datagrams buffered per session; excess is dropped.
pub(super) const UDP_QUEUE: usize = 128;

/// One {guest, local} datagram pair.
pub(super) struct UdpSession {
    pub(super) guest: SocketAddr,
    pub(super) local: SocketAddr,
    last_active: Mutex<Instant>,
}

impl UdpSession {
    pub(super) fn new(guest: SocketAddr, local: SocketAddr) -> Self {
        Self {
            guest,
            local,
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub(super) fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    pub(super) fn idle_since(&self) -> Instant {
        *lock(&self.last_active)
    }
}

/// Table entry. The sender lives only here so that removing the entry
/// ends the reader with end-of-stream.
pub(super) struct UdpEntry {
    pub(super) session: Arc<UdpSession>,
    pub(super) deliver: mpsc::Sender<Bytes>,
}

/// First datagram of a new pair, waiting for the router.
pub(super) struct PendingUdp {
    stack: Arc<Stack>,
    session: Arc<UdpSession>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl PendingUdp {
    pub(super) fn new(
        stack: Arc<Stack>,
        session: Arc<UdpSession>,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            stack,
            session,
            rx: Some(rx),
        }
    }
}

impl UdpFlowRequest for PendingUdp {
    fn id(&self) -> FlowId {
        FlowId {
            src: self.session.guest,
            dst: self.session.local,
        }
    }

    fn create_endpoint(
        mut self: Box<Self>,
        options: EndpointOptions,
    ) -> Result<BoxConnection, GatewayError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| GatewayError::Endpoint(format!("{} already consumed", self.id())))?;
        Ok(Box::new(StackUdpConn::new(
            self.stack.clone(),
            self.session.clone(),
            rx,
            options,
        )))
    }
}

impl Drop for PendingUdp {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.stack.remove_udp(&self.session);
        }
    }
}

/// Guest-facing datagram endpoint. One read is one datagram from the
/// guest, one write is one datagram to the guest.
pub(super) struct StackUdpConn {
    stack: Arc<Stack>,
    session: Arc<UdpSession>,
    rx: mpsc::Receiver<Bytes>,
    options: EndpointOptions,
    closed: bool,
}

impl StackUdpConn {
    pub(super) fn new(
        stack: Arc<Stack>,
        session: Arc<UdpSession>,
        rx: mpsc::Receiver<Bytes>,
        options: EndpointOptions,
    ) -> Self {
        Self {
            stack,
            session,
            rx,
            options,
            closed: false,
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stack.remove_udp(&self.session);
        }
    }
}

impl Connection for StackUdpConn {
    fn network(&self) -> Network {
        Network::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.session.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.session.guest
    }

    fn set_reset_on_close(&mut self) {}

    fn close_on_write(&self) -> bool {
        self.options.close_on_write
    }
}

impl AsyncRead for StackUdpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                // 缓冲区不够时截断，与 recv(2) 一致
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for StackUdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let max = self.stack.max_udp_payload(self.session.local.ip());
        if buf.len() > max {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds the {} byte limit", buf.len(), max),
            )));
        }

        let packet = build_udp_packet(self.session.local, self.session.guest, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        // 队列满时按 UDP 语义丢弃
        if !self.stack.emit(packet) {
            debug!(
                guest = %self.session.guest,
                len = buf.len(),
                "device queue full, datagram dropped"
            );
        }
        self.session.touch();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for StackUdpConn {
    fn drop(&mut self) {
        self.close();
    }
}
