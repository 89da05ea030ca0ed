//! TCP flows of the user-space stack.
//!
//! The stack side never keeps out-of-order data: anything that is not
//! the next expected byte is answered with a duplicate ACK, and data is
//! only ACKed once it has been queued for the reader. Outbound data is
//! kept until ACKed and retransmitted on a timer.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use super::packet::{
    build_tcp_packet, seq_le, seq_lt, TcpFields, TcpSegment, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST,
    TCP_SYN,
};
use super::stack::{lock, FlowKey, Stack};
use super::{EndpointOptions, FlowId, TcpFlowRequest};
use crate::common::{BoxConnection, Connection, GatewayError, Network};

/// Segments queued per flow before the stack stops ACKing.
pub(super) const RECV_QUEUE: usize = 64;
/// Upper bound on unacknowledged outbound bytes.
const MAX_IN_FLIGHT: u32 = 256 * 1024;
const WINDOW: u16 = 65535;
const RTO_MIN: Duration = Duration::from_millis(500);
const RTO_MAX: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 8;
/// How long a locally closed flow waits for the guest to finish.
const CLOSE_LINGER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TcpState {
    /// Guest SYN seen, SYN-ACK sent once the endpoint exists.
    SynReceived,
    /// Stack-initiated SYN sent.
    SynSent,
    Established,
    Closed,
}

pub(super) enum Segment {
    Data(Bytes),
    Fin,
}

pub(super) struct TcpFlow {
    pub(super) guest: SocketAddr,
    pub(super) local: SocketAddr,
    inner: Mutex<TcpInner>,
}

struct TcpInner {
    state: TcpState,
    iss: u32,
    rcv_nxt: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    mss: usize,
    unacked: BytesMut,
    deliver: Option<mpsc::Sender<Segment>>,
    reset: bool,
    fin_sent: bool,
    fin_received: bool,
    local_closed: bool,
    last_activity: Instant,
    last_progress: Instant,
    retries: u32,
    write_waker: Option<Waker>,
    connected: Option<oneshot::Sender<Result<(), GatewayError>>>,
}

impl TcpInner {
    fn new(state: TcpState, iss: u32, mss: usize) -> Self {
        let now = Instant::now();
        Self {
            state,
            iss,
            rcv_nxt: 0,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            mss,
            unacked: BytesMut::new(),
            deliver: None,
            reset: false,
            fin_sent: false,
            fin_received: false,
            local_closed: false,
            last_activity: now,
            last_progress: now,
            retries: 0,
            write_waker: None,
            connected: None,
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    /// Drop the flow without any further packets.
    fn abort(&mut self, reason: GatewayError) {
        self.reset = true;
        self.state = TcpState::Closed;
        self.deliver = None;
        self.unacked.clear();
        if let Some(tx) = self.connected.take() {
            let _ = tx.send(Err(reason));
        }
        self.wake_writer();
    }

    fn on_ack(&mut self, ack: u32, window: u16) {
        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            let acked = ack.wrapping_sub(self.snd_una) as usize;
            let data = acked.min(self.unacked.len());
            self.unacked.advance(data);
            self.snd_una = ack;
            self.last_progress = Instant::now();
            self.retries = 0;
        }
        self.snd_wnd = window as u32;
        self.wake_writer();
    }

    fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    fn finished(&self) -> bool {
        self.fin_received && self.fin_sent && self.snd_una == self.snd_nxt
    }

    fn rto(&self) -> Duration {
        (RTO_MIN * 2u32.saturating_pow(self.retries)).min(RTO_MAX)
    }
}

impl TcpFlow {
    /// Flow for a guest SYN.
    pub(super) fn accepting(
        guest: SocketAddr,
        local: SocketAddr,
        syn: &TcpSegment<'_>,
        our_mss: usize,
    ) -> Self {
        let mut inner = TcpInner::new(TcpState::SynReceived, rand::random(), peer_mss(syn, our_mss));
        inner.rcv_nxt = syn.seq.wrapping_add(1);
        inner.snd_wnd = syn.window as u32;
        Self {
            guest,
            local,
            inner: Mutex::new(inner),
        }
    }

    /// Flow for a stack-initiated connect.
    pub(super) fn connecting(
        guest: SocketAddr,
        local: SocketAddr,
        our_mss: usize,
        deliver: mpsc::Sender<Segment>,
        connected: oneshot::Sender<Result<(), GatewayError>>,
    ) -> Self {
        let mut inner = TcpInner::new(TcpState::SynSent, rand::random(), our_mss);
        inner.snd_nxt = inner.iss.wrapping_add(1);
        inner.deliver = Some(deliver);
        inner.connected = Some(connected);
        Self {
            guest,
            local,
            inner: Mutex::new(inner),
        }
    }

    pub(super) fn key(&self) -> FlowKey {
        (self.guest, self.local)
    }

    fn packet(&self, stack: &Stack, fields: TcpFields, payload: &[u8]) {
        match build_tcp_packet(self.local, self.guest, fields, payload) {
            Ok(packet) => {
                stack.emit(packet);
            }
            Err(e) => debug!(error = %e, guest = %self.guest, "failed to build tcp segment"),
        }
    }

    fn send(&self, stack: &Stack, inner: &TcpInner, seq: u32, flags: u8, payload: &[u8]) {
        let fields = TcpFields {
            seq,
            ack: inner.rcv_nxt,
            flags: flags | TCP_ACK,
            window: WINDOW,
            mss: None,
        };
        self.packet(stack, fields, payload);
    }

    fn send_ack(&self, stack: &Stack, inner: &TcpInner) {
        self.send(stack, inner, inner.snd_nxt, 0, &[]);
    }

    fn send_rst(&self, stack: &Stack, inner: &TcpInner) {
        self.send(stack, inner, inner.snd_nxt, TCP_RST, &[]);
    }

    pub(super) fn send_syn(&self, stack: &Stack) {
        let inner = lock(&self.inner);
        let fields = TcpFields {
            seq: inner.iss,
            ack: 0,
            flags: TCP_SYN,
            window: WINDOW,
            mss: Some(inner.mss as u16),
        };
        self.packet(stack, fields, &[]);
    }

    fn send_syn_ack(&self, stack: &Stack, inner: &TcpInner, our_mss: usize) {
        let fields = TcpFields {
            seq: inner.iss,
            ack: inner.rcv_nxt,
            flags: TCP_SYN | TCP_ACK,
            window: WINDOW,
            mss: Some(our_mss as u16),
        };
        self.packet(stack, fields, &[]);
    }

    /// Process one segment from the guest. Returns true when the flow
    /// should be removed from the table.
    pub(super) fn on_segment(&self, stack: &Stack, seg: &TcpSegment<'_>) -> bool {
        let mut inner = lock(&self.inner);
        inner.last_activity = Instant::now();

        if seg.has(TCP_RST) {
            debug!(guest = %self.guest, local = %self.local, "tcp reset by guest");
            let reason = match inner.state {
                TcpState::SynSent => GatewayError::ConnectionRefused(self.guest.to_string()),
                _ => GatewayError::ConnectionReset(self.guest.to_string()),
            };
            inner.abort(reason);
            return true;
        }

        match inner.state {
            TcpState::Closed => return true,
            TcpState::SynSent => {
                if seg.has(TCP_SYN) && seg.has(TCP_ACK) && seg.ack == inner.iss.wrapping_add(1) {
                    inner.rcv_nxt = seg.seq.wrapping_add(1);
                    inner.snd_una = seg.ack;
                    inner.snd_wnd = seg.window as u32;
                    inner.mss = peer_mss(seg, inner.mss);
                    inner.state = TcpState::Established;
                    inner.last_progress = Instant::now();
                    self.send_ack(stack, &inner);
                    if let Some(tx) = inner.connected.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else if seg.has(TCP_ACK) {
                    let fields = TcpFields {
                        seq: seg.ack,
                        ack: 0,
                        flags: TCP_RST,
                        window: 0,
                        mss: None,
                    };
                    self.packet(stack, fields, &[]);
                }
                return false;
            }
            TcpState::SynReceived => {
                if inner.deliver.is_none() {
                    // 还没有 endpoint，等待路由决定
                    return false;
                }
                if seg.has(TCP_SYN) {
                    let mss = inner.mss;
                    self.send_syn_ack(stack, &inner, mss);
                    return false;
                }
                if !(seg.has(TCP_ACK) && seg.ack == inner.iss.wrapping_add(1)) {
                    return false;
                }
                inner.state = TcpState::Established;
            }
            TcpState::Established => {}
        }

        if seg.has(TCP_SYN) {
            // Our ACK of their SYN-ACK was lost.
            self.send_ack(stack, &inner);
            return false;
        }

        if seg.has(TCP_ACK) {
            inner.on_ack(seg.ack, seg.window);
        }

        let mut need_ack = false;

        if !seg.payload.is_empty() {
            need_ack = true;
            let offset = inner.rcv_nxt.wrapping_sub(seg.seq) as usize;
            if seq_le(seg.seq, inner.rcv_nxt) && offset < seg.payload.len() && !inner.fin_received
            {
                let fresh = &seg.payload[offset..];
                let sent = match &inner.deliver {
                    Some(tx) => tx.try_send(Segment::Data(Bytes::copy_from_slice(fresh))),
                    None => Err(mpsc::error::TrySendError::Closed(Segment::Fin)),
                };
                match sent {
                    Ok(()) => inner.rcv_nxt = inner.rcv_nxt.wrapping_add(fresh.len() as u32),
                    // Reader is behind; withhold the ACK so the guest retransmits.
                    Err(mpsc::error::TrySendError::Full(_)) => return false,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(guest = %self.guest, "data for closed tcp endpoint, resetting");
                        self.send_rst(stack, &inner);
                        inner.abort(GatewayError::ConnectionReset(self.guest.to_string()));
                        return true;
                    }
                }
            }
        }

        if seg.has(TCP_FIN) {
            need_ack = true;
            let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
            if fin_seq == inner.rcv_nxt && !inner.fin_received {
                let delivered = match &inner.deliver {
                    Some(tx) => !matches!(
                        tx.try_send(Segment::Fin),
                        Err(mpsc::error::TrySendError::Full(_))
                    ),
                    None => true,
                };
                if !delivered {
                    return false;
                }
                inner.rcv_nxt = inner.rcv_nxt.wrapping_add(1);
                inner.fin_received = true;
                inner.deliver = None;
            }
        }

        if need_ack {
            self.send_ack(stack, &inner);
        }

        if inner.finished() {
            inner.state = TcpState::Closed;
            return true;
        }
        false
    }

    /// Timer work. Returns true when the flow should be removed.
    pub(super) fn on_tick(&self, stack: &Stack, now: Instant) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            TcpState::Closed => return true,
            TcpState::SynSent => return false,
            TcpState::SynReceived => {
                if inner.deliver.is_none() || now.duration_since(inner.last_progress) < inner.rto() {
                    return false;
                }
                if inner.retries >= MAX_RETRIES {
                    inner.abort(GatewayError::ConnectionTimeout(self.guest.to_string()));
                    return true;
                }
                inner.retries += 1;
                inner.last_progress = now;
                let mss = inner.mss;
                self.send_syn_ack(stack, &inner, mss);
                return false;
            }
            TcpState::Established => {}
        }

        if inner.in_flight() > 0 && now.duration_since(inner.last_progress) >= inner.rto() {
            if inner.retries >= MAX_RETRIES {
                debug!(guest = %self.guest, local = %self.local, "tcp retransmit limit reached");
                self.send_rst(stack, &inner);
                inner.abort(GatewayError::ConnectionTimeout(self.guest.to_string()));
                return true;
            }
            inner.retries += 1;
            inner.last_progress = now;

            let len = inner.unacked.len().min(inner.mss);
            if len > 0 {
                let chunk = inner.unacked[..len].to_vec();
                let seq = inner.snd_una;
                self.send(stack, &inner, seq, TCP_PSH, &chunk);
            } else if inner.fin_sent {
                let seq = inner.snd_nxt.wrapping_sub(1);
                self.send(stack, &inner, seq, TCP_FIN, &[]);
            }
        }

        if inner.local_closed && now.duration_since(inner.last_activity) >= CLOSE_LINGER {
            inner.state = TcpState::Closed;
            return true;
        }
        false
    }

    /// Stack shutdown: reset the guest and wake everything waiting on the flow.
    pub(super) fn shutdown(&self, stack: &Stack) {
        let mut inner = lock(&self.inner);
        let synced = match inner.state {
            TcpState::Established => true,
            TcpState::SynReceived => inner.deliver.is_some(),
            _ => false,
        };
        if synced {
            self.send_rst(stack, &inner);
        }
        inner.abort(GatewayError::ConnectionReset("stack stopped".into()));
    }

    /// Refuse a pending SYN.
    fn refuse(&self, stack: &Stack, reset: bool) {
        let mut inner = lock(&self.inner);
        if reset && !inner.reset {
            let fields = TcpFields {
                seq: 0,
                ack: inner.rcv_nxt,
                flags: TCP_RST | TCP_ACK,
                window: 0,
                mss: None,
            };
            self.packet(stack, fields, &[]);
        }
        inner.state = TcpState::Closed;
        inner.deliver = None;
    }
}

fn peer_mss(seg: &TcpSegment<'_>, our_mss: usize) -> usize {
    // RFC 9293 default when the option is absent.
    let peer = seg.mss.map(|m| m as usize).unwrap_or(536);
    peer.min(our_mss).max(64)
}

/// A guest SYN waiting for the router.
pub(super) struct PendingTcp {
    stack: Arc<Stack>,
    flow: Arc<TcpFlow>,
    resolved: bool,
}

impl PendingTcp {
    pub(super) fn new(stack: Arc<Stack>, flow: Arc<TcpFlow>) -> Self {
        Self {
            stack,
            flow,
            resolved: false,
        }
    }

    fn refuse(&mut self, reset: bool) {
        self.resolved = true;
        self.flow.refuse(&self.stack, reset);
        self.stack.remove_tcp(&self.flow);
    }
}

impl TcpFlowRequest for PendingTcp {
    fn id(&self) -> FlowId {
        FlowId {
            src: self.flow.guest,
            dst: self.flow.local,
        }
    }

    fn create_endpoint(
        mut self: Box<Self>,
        options: EndpointOptions,
    ) -> Result<BoxConnection, GatewayError> {
        self.resolved = true;
        let rx = {
            let mut inner = lock(&self.flow.inner);
            if inner.reset || inner.state != TcpState::SynReceived {
                return Err(GatewayError::Endpoint(format!(
                    "{} was reset before accept",
                    self.id()
                )));
            }
            let (tx, rx) = mpsc::channel(RECV_QUEUE);
            inner.deliver = Some(tx);
            let our_mss = self.stack.mss_for(self.flow.local.ip());
            self.flow.send_syn_ack(&self.stack, &inner, our_mss);
            inner.snd_nxt = inner.iss.wrapping_add(1);
            inner.last_progress = Instant::now();
            rx
        };
        Ok(Box::new(StackTcpConn::new(
            self.stack.clone(),
            self.flow.clone(),
            rx,
            options,
        )))
    }

    fn complete(mut self: Box<Self>, reset: bool) {
        self.refuse(reset);
    }
}

impl Drop for PendingTcp {
    fn drop(&mut self) {
        if !self.resolved {
            self.refuse(true);
        }
    }
}

/// Guest-facing TCP stream.
pub(super) struct StackTcpConn {
    stack: Arc<Stack>,
    flow: Arc<TcpFlow>,
    rx: mpsc::Receiver<Segment>,
    pending: Bytes,
    read_eof: bool,
    options: EndpointOptions,
    reset_on_close: bool,
    closed: bool,
}

impl StackTcpConn {
    pub(super) fn new(
        stack: Arc<Stack>,
        flow: Arc<TcpFlow>,
        rx: mpsc::Receiver<Segment>,
        options: EndpointOptions,
    ) -> Self {
        Self {
            stack,
            flow,
            rx,
            pending: Bytes::new(),
            read_eof: false,
            options,
            reset_on_close: false,
            closed: false,
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let remove = {
            let mut inner = lock(&self.flow.inner);
            inner.local_closed = true;
            inner.last_activity = Instant::now();
            match inner.state {
                TcpState::Closed => true,
                _ if inner.reset => true,
                TcpState::Established if !self.reset_on_close => {
                    if !inner.fin_sent {
                        if inner.in_flight() == 0 {
                            inner.last_progress = Instant::now();
                        }
                        let seq = inner.snd_nxt;
                        self.flow.send(&self.stack, &inner, seq, TCP_FIN, &[]);
                        inner.snd_nxt = seq.wrapping_add(1);
                        inner.fin_sent = true;
                    }
                    if inner.finished() {
                        inner.state = TcpState::Closed;
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    // reset requested, or the handshake never finished
                    self.flow.send_rst(&self.stack, &inner);
                    inner.abort(GatewayError::ConnectionReset(self.flow.guest.to_string()));
                    true
                }
            }
        };
        if remove {
            self.stack.remove_tcp(&self.flow);
        }
    }
}

impl Connection for StackTcpConn {
    fn network(&self) -> Network {
        Network::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.flow.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.flow.guest
    }

    fn set_reset_on_close(&mut self) {
        self.reset_on_close = true;
    }

    fn close_on_write(&self) -> bool {
        self.options.close_on_write
    }
}

impl AsyncRead for StackTcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        if self.read_eof {
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Segment::Data(mut data))) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                data.advance(n);
                self.pending = data;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Segment::Fin)) => {
                self.read_eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.read_eof = true;
                if lock(&self.flow.inner).reset {
                    Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for StackTcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let mut inner = lock(&this.flow.inner);
        if inner.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if inner.fin_sent || this.closed || inner.state == TcpState::Closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if inner.state != TcpState::Established {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let window = inner.snd_wnd.min(MAX_IN_FLIGHT);
        let room = window.saturating_sub(inner.in_flight()) as usize;
        if room == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(room);
        if inner.in_flight() == 0 {
            inner.last_progress = Instant::now();
        }
        for chunk in buf[..n].chunks(inner.mss) {
            let seq = inner.snd_nxt;
            this.flow.send(&this.stack, &inner, seq, TCP_PSH, chunk);
            inner.snd_nxt = seq.wrapping_add(chunk.len() as u32);
        }
        inner.unacked.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for StackTcpConn {
    fn drop(&mut self) {
        self.close();
    }
}
