use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::device::{DeviceMode, TunDevice};
use super::ethernet::{EthernetLink, LinkInput, ETHERNET_HEADER_LEN, GATEWAY_MAC};
use super::packet::{
    parse_ip_packet, parse_tcp, udp_payload, verify_transport_checksum, IpProtocol, ParsedPacket,
    TcpFields, TcpSegment, IPV4_HEADER_LEN, IPV6_HEADER_LEN, TCP_ACK, TCP_HEADER_LEN, TCP_RST,
    TCP_SYN, UDP_HEADER_LEN,
};
use super::tcp::{PendingTcp, StackTcpConn, TcpFlow, RECV_QUEUE};
use super::udp::{PendingUdp, StackUdpConn, UdpEntry, UdpSession, UDP_QUEUE};
use super::{EndpointOptions, TcpFlowHandler, UdpFlowHandler};
use crate::common::{BoxConnection, GatewayError, Network};
use crate::config::StackConfig;

/// (guest endpoint, stack-side endpoint)
pub(super) type FlowKey = (SocketAddr, SocketAddr);

/// Packets the stack wants written to the device.
pub type PacketReceiver = mpsc::Receiver<Vec<u8>>;

/// Packets queued for the device before further ones are dropped.
pub const OUT_QUEUE: usize = 4096;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const SYN_RTO: Duration = Duration::from_secs(1);
const SYN_RETRIES: u32 = 4;
const MAX_PACKET: usize = 65535;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 协议栈参数
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub mtu: u32,
    /// Source address of stack-initiated IPv4 flows.
    pub gateway_v4: Ipv4Addr,
    /// Source address of stack-initiated IPv6 flows.
    pub gateway_v6: Ipv6Addr,
    pub udp_timeout: Duration,
}

impl StackOptions {
    /// `mtu` is what the device reported, already overridden by the config.
    pub fn from_config(config: &StackConfig, mtu: u32) -> Result<Self> {
        Ok(Self {
            mtu,
            gateway_v4: config.gateway_v4_net()?.addr(),
            gateway_v6: config.gateway_v6_net()?.addr(),
            udp_timeout: config.udp_session_timeout(),
        })
    }
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            mtu: 1500,
            gateway_v4: Ipv4Addr::new(10, 0, 2, 2),
            gateway_v6: Ipv6Addr::new(0x2001, 2, 0, 0, 0, 0, 0, 2),
            udp_timeout: Duration::from_secs(120),
        }
    }
}

/// The user-space stack. Packets go in through [`Stack::input`] and come
/// out of the [`PacketReceiver`] returned by [`Stack::new`].
pub struct Stack {
    options: StackOptions,
    out: mpsc::Sender<Vec<u8>>,
    tcp: Mutex<HashMap<FlowKey, Arc<TcpFlow>>>,
    udp: Mutex<HashMap<FlowKey, UdpEntry>>,
    tcp_handler: RwLock<Option<Arc<dyn TcpFlowHandler>>>,
    udp_handler: RwLock<Option<Arc<dyn UdpFlowHandler>>>,
    stopped: AtomicBool,
}

impl Stack {
    pub fn new(options: StackOptions) -> (Arc<Self>, PacketReceiver) {
        let (out, rx) = mpsc::channel(OUT_QUEUE);
        let stack = Arc::new(Self {
            options,
            out,
            tcp: Mutex::new(HashMap::new()),
            udp: Mutex::new(HashMap::new()),
            tcp_handler: RwLock::new(None),
            udp_handler: RwLock::new(None),
            stopped: AtomicBool::new(false),
        });
        (stack, rx)
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    pub fn set_tcp_handler(&self, handler: Arc<dyn TcpFlowHandler>) {
        *self
            .tcp_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_udp_handler(&self, handler: Arc<dyn UdpFlowHandler>) {
        *self
            .udp_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn tcp_flow_count(&self) -> usize {
        lock(&self.tcp).len()
    }

    pub fn udp_session_count(&self) -> usize {
        lock(&self.udp).len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Pump packets between the device and the stack until cancelled.
    ///
    /// On a TAP device packets are wrapped in Ethernet frames and ARP for
    /// the IPv4 gateway is answered. Packets queued by [`Stack::shutdown`]
    /// are still written before this returns.
    pub async fn run(
        self: Arc<Self>,
        device: Arc<dyn TunDevice>,
        mut outbound: PacketReceiver,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mode = device.mode();
        info!(
            device = device.name(),
            mode = mode.as_str(),
            mtu = self.options.mtu,
            gateway_v4 = %self.options.gateway_v4,
            gateway_v6 = %self.options.gateway_v6,
            "stack started"
        );

        let link = match mode {
            DeviceMode::Tap => Some(Arc::new(EthernetLink::new(
                GATEWAY_MAC,
                self.options.gateway_v4,
            ))),
            DeviceMode::Tun => None,
        };

        let drained = CancellationToken::new();
        let writer = {
            let device = device.clone();
            let link = link.clone();
            let drained = drained.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        packet = outbound.recv() => {
                            let Some(packet) = packet else { break };
                            write_out(device.as_ref(), link.as_deref(), &packet).await;
                        }
                        _ = drained.cancelled() => {
                            while let Ok(packet) = outbound.try_recv() {
                                write_out(device.as_ref(), link.as_deref(), &packet).await;
                            }
                            break;
                        }
                    }
                }
            })
        };

        let mut buf = vec![0u8; MAX_PACKET + ETHERNET_HEADER_LEN];
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.maintain(Instant::now()),
                result = device.read_packet(&mut buf) => {
                    match result {
                        Ok(0) => continue,
                        Ok(n) => match link.as_deref() {
                            None => self.input(&buf[..n]),
                            Some(link) => match link.input(&buf[..n]) {
                                LinkInput::Ip(packet) => self.input(packet),
                                LinkInput::Reply(frame) => {
                                    if let Err(e) = device.write_packet(&frame).await {
                                        debug!(error = %e, "device write failed");
                                    }
                                }
                                LinkInput::Ignore => {}
                            },
                        },
                        Err(e) => {
                            error!(error = %e, "device read failed");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }

        self.shutdown();
        drained.cancel();
        if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
            debug!("device writer did not drain in time");
        }
        info!(device = device.name(), "stack stopped");
        Ok(())
    }

    /// Handle one IP packet from the guest.
    pub fn input(self: &Arc<Self>, packet: &[u8]) {
        if self.is_stopped() {
            return;
        }
        let parsed = match parse_ip_packet(packet) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping malformed packet");
                return;
            }
        };

        match parsed.protocol {
            IpProtocol::Tcp | IpProtocol::Udp => {}
            other => {
                debug!(protocol = ?other, src = %parsed.src_ip, dst = %parsed.dst_ip, "dropping non tcp/udp packet");
                return;
            }
        }
        if !verify_transport_checksum(packet, &parsed) {
            debug!(src = %parsed.src(), dst = %parsed.dst(), "dropping packet with bad checksum");
            return;
        }

        match parsed.protocol {
            IpProtocol::Tcp => match parse_tcp(packet, &parsed) {
                Ok(seg) => self.input_tcp(&parsed, &seg),
                Err(e) => debug!(error = %e, "dropping malformed tcp segment"),
            },
            IpProtocol::Udp => match udp_payload(packet, &parsed) {
                Ok(payload) => self.input_udp(&parsed, payload),
                Err(e) => debug!(error = %e, "dropping malformed udp datagram"),
            },
            _ => {}
        }
    }

    fn input_tcp(self: &Arc<Self>, parsed: &ParsedPacket, seg: &TcpSegment<'_>) {
        let key = (parsed.src(), parsed.dst());
        let existing = lock(&self.tcp).get(&key).cloned();

        if let Some(flow) = existing {
            if flow.on_segment(self, seg) {
                self.remove_tcp(&flow);
            }
            return;
        }

        if seg.has(TCP_RST) {
            return;
        }
        if !seg.has(TCP_SYN) || seg.has(TCP_ACK) {
            self.reset_unknown(key, seg);
            return;
        }

        let handler = self
            .tcp_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            self.reset_unknown(key, seg);
            return;
        };

        let flow = Arc::new(TcpFlow::accepting(
            key.0,
            key.1,
            seg,
            self.mss_for(key.1.ip()),
        ));
        lock(&self.tcp).insert(key, flow.clone());
        debug!(guest = %key.0, dst = %key.1, "tcp syn");

        handler.on_tcp_flow(Box::new(PendingTcp::new(self.clone(), flow)));
    }

    /// RST for a segment that belongs to no flow.
    fn reset_unknown(&self, (guest, local): FlowKey, seg: &TcpSegment<'_>) {
        let fields = if seg.has(TCP_ACK) {
            TcpFields {
                seq: seg.ack,
                ack: 0,
                flags: TCP_RST,
                window: 0,
                mss: None,
            }
        } else {
            TcpFields {
                seq: 0,
                ack: seg.seq.wrapping_add(seg.seq_len()),
                flags: TCP_RST | TCP_ACK,
                window: 0,
                mss: None,
            }
        };
        match super::packet::build_tcp_packet(local, guest, fields, &[]) {
            Ok(packet) => {
                self.emit(packet);
            }
            Err(e) => debug!(error = %e, "failed to build rst"),
        }
    }

    fn input_udp(self: &Arc<Self>, parsed: &ParsedPacket, payload: &[u8]) {
        let key = (parsed.src(), parsed.dst());
        if payload.is_empty() {
            debug!(guest = %key.0, dst = %key.1, "dropping empty datagram");
            return;
        }
        let datagram = Bytes::copy_from_slice(payload);

        let existing = lock(&self.udp)
            .get(&key)
            .map(|e| (e.session.clone(), e.deliver.clone()));
        if let Some((session, deliver)) = existing {
            session.touch();
            if deliver.try_send(datagram).is_err() {
                debug!(guest = %key.0, dst = %key.1, "udp session queue full, datagram dropped");
            }
            return;
        }

        let handler = self
            .udp_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return;
        };

        let session = Arc::new(UdpSession::new(key.0, key.1));
        let (deliver, rx) = mpsc::channel(UDP_QUEUE);
        // 首包先入队，endpoint 创建后第一个读到
        let _ = deliver.try_send(datagram);
        lock(&self.udp).insert(
            key,
            UdpEntry {
                session: session.clone(),
                deliver,
            },
        );
        debug!(guest = %key.0, dst = %key.1, "udp session");

        handler.on_udp_flow(Box::new(PendingUdp::new(self.clone(), session, rx)));
    }

    /// Open a TCP connection from the gateway address to `dst` inside the
    /// namespace.
    pub async fn connect_tcp(self: &Arc<Self>, dst: SocketAddr) -> Result<BoxConnection, GatewayError> {
        if self.is_stopped() {
            return Err(GatewayError::ConnectionReset("stack stopped".into()));
        }
        let local = self.allocate_local(dst, Network::Tcp)?;
        let (deliver, rx) = mpsc::channel(RECV_QUEUE);
        let (connected_tx, mut connected) = oneshot::channel();
        let flow = Arc::new(TcpFlow::connecting(
            dst,
            local,
            self.mss_for(dst.ip()),
            deliver,
            connected_tx,
        ));
        lock(&self.tcp).insert(flow.key(), flow.clone());

        for attempt in 0..SYN_RETRIES {
            flow.send_syn(self);
            match tokio::time::timeout(SYN_RTO * 2u32.pow(attempt), &mut connected).await {
                Ok(Ok(Ok(()))) => {
                    debug!(local = %local, guest = %dst, "tcp connect established");
                    let options = EndpointOptions {
                        no_delay: true,
                        close_on_write: false,
                    };
                    return Ok(Box::new(StackTcpConn::new(self.clone(), flow, rx, options)));
                }
                Ok(Ok(Err(e))) => {
                    self.remove_tcp(&flow);
                    return Err(e);
                }
                Ok(Err(_)) => {
                    self.remove_tcp(&flow);
                    return Err(GatewayError::ConnectionReset("stack stopped".into()));
                }
                Err(_) => continue,
            }
        }

        flow.shutdown(self);
        self.remove_tcp(&flow);
        Err(GatewayError::ConnectionTimeout(format!(
            "{} after {} SYN attempts",
            dst, SYN_RETRIES
        )))
    }

    /// Open a UDP session from the gateway address to `dst`.
    pub fn connect_udp(self: &Arc<Self>, dst: SocketAddr) -> Result<BoxConnection, GatewayError> {
        if self.is_stopped() {
            return Err(GatewayError::ConnectionReset("stack stopped".into()));
        }
        let local = self.allocate_local(dst, Network::Udp)?;
        let session = Arc::new(UdpSession::new(dst, local));
        let (deliver, rx) = mpsc::channel(UDP_QUEUE);
        lock(&self.udp).insert(
            (dst, local),
            UdpEntry {
                session: session.clone(),
                deliver,
            },
        );
        Ok(Box::new(StackUdpConn::new(
            self.clone(),
            session,
            rx,
            EndpointOptions::default(),
        )))
    }

    fn allocate_local(&self, dst: SocketAddr, network: Network) -> Result<SocketAddr, GatewayError> {
        let ip = match dst.ip() {
            IpAddr::V4(_) => IpAddr::V4(self.options.gateway_v4),
            IpAddr::V6(_) => IpAddr::V6(self.options.gateway_v6),
        };
        for _ in 0..64 {
            let local = SocketAddr::new(ip, rand::random::<u16>() | 0x8000);
            let key = (dst, local);
            let taken = match network {
                Network::Tcp => lock(&self.tcp).contains_key(&key),
                Network::Udp => lock(&self.udp).contains_key(&key),
            };
            if !taken {
                return Ok(local);
            }
        }
        Err(GatewayError::Endpoint(format!("no free {} port toward {}", network, dst)))
    }

    /// Retransmissions, lingering closes and UDP idle expiry.
    pub fn maintain(&self, now: Instant) {
        let flows: Vec<Arc<TcpFlow>> = lock(&self.tcp).values().cloned().collect();
        for flow in flows {
            if flow.on_tick(self, now) {
                self.remove_tcp(&flow);
            }
        }

        let timeout = self.options.udp_timeout;
        lock(&self.udp).retain(|key, entry| {
            let keep = now.duration_since(entry.session.idle_since()) < timeout;
            if !keep {
                debug!(guest = %key.0, dst = %key.1, "udp session expired");
            }
            keep
        });
    }

    /// Reset every flow and refuse new ones.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let flows: Vec<Arc<TcpFlow>> = lock(&self.tcp).drain().map(|(_, f)| f).collect();
        for flow in &flows {
            flow.shutdown(self);
        }
        let sessions = {
            let mut udp = lock(&self.udp);
            let n = udp.len();
            udp.clear();
            n
        };
        debug!(tcp = flows.len(), udp = sessions, "stack flows dropped");
    }

    /// Queue a packet for the device. A full queue drops it and returns
    /// false; TCP recovers by retransmission.
    pub(super) fn emit(&self, packet: Vec<u8>) -> bool {
        match self.out.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("device queue full, packet dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(super) fn remove_tcp(&self, flow: &Arc<TcpFlow>) {
        let mut table = lock(&self.tcp);
        let key = flow.key();
        if table.get(&key).is_some_and(|f| Arc::ptr_eq(f, flow)) {
            table.remove(&key);
        }
    }

    pub(super) fn remove_udp(&self, session: &Arc<UdpSession>) {
        let mut table = lock(&self.udp);
        let key = (session.guest, session.local);
        if table
            .get(&key)
            .is_some_and(|e| Arc::ptr_eq(&e.session, session))
        {
            table.remove(&key);
        }
    }

    fn ip_header_len(ip: IpAddr) -> usize {
        match ip {
            IpAddr::V4(_) => IPV4_HEADER_LEN,
            IpAddr::V6(_) => IPV6_HEADER_LEN,
        }
    }

    pub(super) fn mss_for(&self, ip: IpAddr) -> usize {
        (self.options.mtu as usize)
            .saturating_sub(Self::ip_header_len(ip) + TCP_HEADER_LEN)
            .clamp(64, u16::MAX as usize)
    }

    pub(super) fn max_udp_payload(&self, ip: IpAddr) -> usize {
        (self.options.mtu as usize).saturating_sub(Self::ip_header_len(ip) + UDP_HEADER_LEN)
    }
}

async fn write_out(device: &dyn TunDevice, link: Option<&EthernetLink>, packet: &[u8]) {
    let result = match link {
        None => device.write_packet(packet).await.map(|_| ()),
        Some(link) => {
            let mut result = Ok(());
            for frame in link.encapsulate(packet) {
                if let Err(e) = device.write_packet(&frame).await {
                    result = Err(e);
                    break;
                }
            }
            result
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "device write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::packet::{build_tcp_packet, build_udp_packet, TCP_FIN, TCP_PSH};
    use crate::netstack::{TcpFlowRequest, UdpFlowRequest};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct Collect {
        tcp: StdMutex<Vec<Box<dyn TcpFlowRequest>>>,
        udp: StdMutex<Vec<Box<dyn UdpFlowRequest>>>,
    }

    impl TcpFlowHandler for Collect {
        fn on_tcp_flow(&self, request: Box<dyn TcpFlowRequest>) {
            self.tcp.lock().unwrap().push(request);
        }
    }

    impl UdpFlowHandler for Collect {
        fn on_udp_flow(&self, request: Box<dyn UdpFlowRequest>) {
            self.udp.lock().unwrap().push(request);
        }
    }

    fn setup() -> (Arc<Stack>, PacketReceiver, Arc<Collect>) {
        let (stack, out) = Stack::new(StackOptions::default());
        let collect = Arc::new(Collect::default());
        stack.set_tcp_handler(collect.clone());
        stack.set_udp_handler(collect.clone());
        (stack, out, collect)
    }

    fn guest_tcp(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let fields = TcpFields {
            seq,
            ack,
            flags,
            window: 65535,
            mss: if flags & TCP_SYN != 0 { Some(1460) } else { None },
        };
        build_tcp_packet(sa("10.0.2.100:40000"), sa("93.184.216.34:80"), fields, payload).unwrap()
    }

    fn next_tcp(out: &mut PacketReceiver) -> (u32, u32, u8, Vec<u8>) {
        let packet = out.try_recv().expect("expected a packet from the stack");
        let parsed = parse_ip_packet(&packet).unwrap();
        assert!(verify_transport_checksum(&packet, &parsed));
        let seg = parse_tcp(&packet, &parsed).unwrap();
        (seg.seq, seg.ack, seg.flags, seg.payload.to_vec())
    }

    #[tokio::test]
    async fn tcp_handshake_data_and_close() {
        let (stack, mut out, collect) = setup();

        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        assert_eq!(request.id().src, sa("10.0.2.100:40000"));
        assert_eq!(request.id().dst, sa("93.184.216.34:80"));
        assert!(out.try_recv().is_err(), "no SYN-ACK before the verdict");

        let mut conn = request
            .create_endpoint(EndpointOptions {
                no_delay: true,
                close_on_write: false,
            })
            .unwrap();
        let (iss, ack, flags, _) = next_tcp(&mut out);
        assert_eq!(flags, TCP_SYN | TCP_ACK);
        assert_eq!(ack, 1001);

        stack.input(&guest_tcp(1001, iss.wrapping_add(1), TCP_ACK | TCP_PSH, b"GET /"));
        let (_, ack, flags, _) = next_tcp(&mut out);
        assert_eq!(flags, TCP_ACK);
        assert_eq!(ack, 1006);

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET /");

        conn.write_all(b"200 OK").await.unwrap();
        let (seq, _, flags, payload) = next_tcp(&mut out);
        assert_eq!(seq, iss.wrapping_add(1));
        assert_eq!(flags, TCP_ACK | TCP_PSH);
        assert_eq!(payload, b"200 OK");

        // Guest acks and closes.
        stack.input(&guest_tcp(1006, iss.wrapping_add(7), TCP_ACK | TCP_FIN, b""));
        let (_, ack, _, _) = next_tcp(&mut out);
        assert_eq!(ack, 1007);
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        conn.shutdown().await.unwrap();
        let (seq, _, flags, _) = next_tcp(&mut out);
        assert_eq!(flags, TCP_ACK | TCP_FIN);
        assert_eq!(seq, iss.wrapping_add(7));
        assert_eq!(stack.tcp_flow_count(), 1);

        stack.input(&guest_tcp(1007, iss.wrapping_add(8), TCP_ACK, b""));
        assert_eq!(stack.tcp_flow_count(), 0);
    }

    #[tokio::test]
    async fn refused_syn_gets_reset() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(5000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        request.complete(true);

        let (seq, ack, flags, _) = next_tcp(&mut out);
        assert_eq!(flags, TCP_RST | TCP_ACK);
        assert_eq!(seq, 0);
        assert_eq!(ack, 5001);
        assert_eq!(stack.tcp_flow_count(), 0);
    }

    #[tokio::test]
    async fn dropped_request_is_reset() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(5000, 0, TCP_SYN, b""));
        drop(collect.tcp.lock().unwrap().pop());
        let (_, _, flags, _) = next_tcp(&mut out);
        assert!(flags & TCP_RST != 0);
    }

    #[tokio::test]
    async fn unknown_segment_is_reset() {
        let (stack, mut out, _collect) = setup();
        stack.input(&guest_tcp(10, 777, TCP_ACK, b"stray"));
        let (seq, _, flags, _) = next_tcp(&mut out);
        assert_eq!(flags, TCP_RST);
        assert_eq!(seq, 777);
    }

    #[tokio::test]
    async fn out_of_order_data_is_not_delivered() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let (iss, _, _, _) = next_tcp(&mut out);
        stack.input(&guest_tcp(1001, iss.wrapping_add(1), TCP_ACK, b""));

        // Gap: bytes 1001..1004 missing.
        stack.input(&guest_tcp(1004, iss.wrapping_add(1), TCP_ACK, b"later"));
        let (_, ack, _, _) = next_tcp(&mut out);
        assert_eq!(ack, 1001);

        stack.input(&guest_tcp(1001, iss.wrapping_add(1), TCP_ACK, b"abc"));
        let (_, ack, _, _) = next_tcp(&mut out);
        assert_eq!(ack, 1004);

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[tokio::test]
    async fn reset_on_close_sends_rst() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let _ = next_tcp(&mut out);

        conn.set_reset_on_close();
        conn.shutdown().await.unwrap();
        let (_, _, flags, _) = next_tcp(&mut out);
        assert!(flags & TCP_RST != 0);
        assert_eq!(stack.tcp_flow_count(), 0);
    }

    #[tokio::test]
    async fn guest_reset_surfaces_as_error() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let (iss, _, _, _) = next_tcp(&mut out);
        stack.input(&guest_tcp(1001, iss.wrapping_add(1), TCP_ACK, b""));

        stack.input(&guest_tcp(1001, 0, TCP_RST, b""));
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert!(conn.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn large_write_is_segmented() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let (iss, _, _, _) = next_tcp(&mut out);
        stack.input(&guest_tcp(1001, iss.wrapping_add(1), TCP_ACK, b""));

        let data = vec![7u8; 4000];
        conn.write_all(&data).await.unwrap();
        let mut total = 0;
        while let Ok(packet) = out.try_recv() {
            let parsed = parse_ip_packet(&packet).unwrap();
            let seg = parse_tcp(&packet, &parsed).unwrap();
            assert!(seg.payload.len() <= 1460);
            total += seg.payload.len();
        }
        assert_eq!(total, 4000);
    }

    #[tokio::test]
    async fn unacked_data_is_retransmitted() {
        let (stack, mut out, collect) = setup();
        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let (iss, _, _, _) = next_tcp(&mut out);
        stack.input(&guest_tcp(1001, iss.wrapping_add(1), TCP_ACK, b""));

        conn.write_all(b"hello").await.unwrap();
        let _ = next_tcp(&mut out);

        stack.maintain(Instant::now() + Duration::from_secs(2));
        let (seq, _, _, payload) = next_tcp(&mut out);
        assert_eq!(seq, iss.wrapping_add(1));
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn udp_first_datagram_reaches_endpoint() {
        let (stack, mut out, collect) = setup();
        let query = build_udp_packet(sa("10.0.2.100:5353"), sa("1.1.1.1:53"), b"query").unwrap();
        stack.input(&query);

        let request = collect.udp.lock().unwrap().pop().unwrap();
        assert_eq!(request.id().dst, sa("1.1.1.1:53"));
        let mut conn = request
            .create_endpoint(EndpointOptions {
                no_delay: false,
                close_on_write: true,
            })
            .unwrap();
        assert!(conn.close_on_write());

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");

        // Second datagram of the same pair goes to the same session.
        stack.input(&query);
        assert!(collect.udp.lock().unwrap().is_empty());
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);

        conn.write_all(b"answer").await.unwrap();
        let packet = out.try_recv().unwrap();
        let parsed = parse_ip_packet(&packet).unwrap();
        assert_eq!(parsed.src(), sa("1.1.1.1:53"));
        assert_eq!(parsed.dst(), sa("10.0.2.100:5353"));
        assert_eq!(udp_payload(&packet, &parsed).unwrap(), b"answer");
    }

    #[tokio::test]
    async fn udp_session_expires() {
        let (stack, _out, collect) = setup();
        let query = build_udp_packet(sa("10.0.2.100:5353"), sa("1.1.1.1:53"), b"q").unwrap();
        stack.input(&query);
        let request = collect.udp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let mut buf = [0u8; 8];
        conn.read(&mut buf).await.unwrap();

        stack.maintain(Instant::now() + Duration::from_secs(121));
        assert_eq!(stack.udp_session_count(), 0);
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_udp_is_dropped_silently() {
        let (stack, mut out, collect) = setup();
        let query = build_udp_packet(sa("10.0.2.100:5353"), sa("10.1.1.1:53"), b"q").unwrap();
        stack.input(&query);
        drop(collect.udp.lock().unwrap().pop());
        assert_eq!(stack.udp_session_count(), 0);
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_tcp_completes_on_syn_ack() {
        let (stack, mut out, _collect) = setup();
        let guest = sa("10.0.2.100:22");
        let connecting = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.connect_tcp(guest).await })
        };

        let packet = loop {
            if let Ok(p) = out.try_recv() {
                break p;
            }
            tokio::task::yield_now().await;
        };
        let parsed = parse_ip_packet(&packet).unwrap();
        let syn = parse_tcp(&packet, &parsed).unwrap();
        assert_eq!(syn.flags, TCP_SYN);
        assert_eq!(parsed.src_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)));
        let local = parsed.src();

        let fields = TcpFields {
            seq: 9000,
            ack: syn.seq.wrapping_add(1),
            flags: TCP_SYN | TCP_ACK,
            window: 65535,
            mss: Some(1460),
        };
        stack.input(&build_tcp_packet(guest, local, fields, b"").unwrap());

        let conn = connecting.await.unwrap().unwrap();
        assert_eq!(conn.remote_addr(), guest);
        assert_eq!(conn.local_addr(), local);
        let (_, ack, flags, _) = next_tcp(&mut out);
        assert_eq!(flags, TCP_ACK);
        assert_eq!(ack, 9001);
    }

    #[tokio::test]
    async fn connect_tcp_refused_by_rst() {
        let (stack, mut out, _collect) = setup();
        let guest = sa("10.0.2.100:23");
        let connecting = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.connect_tcp(guest).await })
        };
        let packet = loop {
            if let Ok(p) = out.try_recv() {
                break p;
            }
            tokio::task::yield_now().await;
        };
        let parsed = parse_ip_packet(&packet).unwrap();
        let syn = parse_tcp(&packet, &parsed).unwrap();
        let fields = TcpFields {
            seq: 0,
            ack: syn.seq.wrapping_add(1),
            flags: TCP_RST | TCP_ACK,
            window: 0,
            mss: None,
        };
        stack.input(&build_tcp_packet(guest, parsed.src(), fields, b"").unwrap());

        let err = connecting.await.unwrap().err().unwrap();
        assert_eq!(err.kind(), crate::common::ErrorKind::ConnectionRefused);
        assert_eq!(stack.tcp_flow_count(), 0);
    }

    #[test]
    fn options_from_config() {
        let config = StackConfig {
            gateway_v4: "192.168.7.1/24".into(),
            udp_session_timeout: 30,
            ..Default::default()
        };
        let options = StackOptions::from_config(&config, 9000).unwrap();
        assert_eq!(options.gateway_v4, Ipv4Addr::new(192, 168, 7, 1));
        assert_eq!(options.gateway_v6, StackOptions::default().gateway_v6);
        assert_eq!(options.udp_timeout, Duration::from_secs(30));
        assert_eq!(options.mtu, 9000);
    }

    #[tokio::test]
    async fn shutdown_resets_flows_and_refuses_new_ones() {
        let (stack, _out, collect) = setup();
        stack.input(&guest_tcp(1000, 0, TCP_SYN, b""));
        let request = collect.tcp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();

        stack.shutdown();
        assert!(stack.is_stopped());
        assert_eq!(stack.tcp_flow_count(), 0);
        let mut buf = [0u8; 4];
        assert!(conn.read(&mut buf).await.is_err());
        assert!(stack.connect_udp(sa("10.0.2.100:53")).is_err());

        stack.input(&guest_tcp(2000, 0, TCP_SYN, b""));
        assert!(collect.tcp.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_device_queue_drops_udp_datagrams() {
        let (stack, mut out, collect) = setup();
        stack.input(&build_udp_packet(sa("10.0.2.100:5353"), sa("1.1.1.1:53"), b"q").unwrap());
        let request = collect.udp.lock().unwrap().pop().unwrap();
        let mut conn = request.create_endpoint(EndpointOptions::default()).unwrap();

        // writes never block on the device, the overflow is discarded
        for _ in 0..OUT_QUEUE + 10 {
            tokio::time::timeout(Duration::from_secs(1), conn.write_all(b"flood"))
                .await
                .expect("udp write blocked on a full queue")
                .unwrap();
        }
        let mut queued = 0;
        while out.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, OUT_QUEUE);

        conn.write_all(b"again").await.unwrap();
        assert!(out.try_recv().is_ok());
    }

    #[tokio::test]
    async fn resets_queued_at_shutdown_reach_the_device() {
        let (stack, out, collect) = setup();
        let (device, mut handle) = crate::netstack::ChannelDevice::pair("test0", 1500);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(stack.clone().run(Arc::new(device), out, cancel.clone()));

        handle.inbound.send(guest_tcp(1000, 0, TCP_SYN, b"")).await.unwrap();
        let request = loop {
            if let Some(r) = collect.tcp.lock().unwrap().pop() {
                break r;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let _conn = request.create_endpoint(EndpointOptions::default()).unwrap();
        let syn_ack = handle.outbound.recv().await.unwrap();
        let parsed = parse_ip_packet(&syn_ack).unwrap();
        assert!(parse_tcp(&syn_ack, &parsed).unwrap().has(TCP_SYN));

        cancel.cancel();
        running.await.unwrap().unwrap();

        let rst = handle.outbound.try_recv().expect("reset not written before exit");
        let parsed = parse_ip_packet(&rst).unwrap();
        assert_eq!(parsed.dst(), sa("10.0.2.100:40000"));
        assert!(parse_tcp(&rst, &parsed).unwrap().has(TCP_RST));
    }
}
