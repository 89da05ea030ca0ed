//! IPv4/IPv6 header parsing and TCP/UDP packet construction on top of
//! `smoltcp::wire`.
//!
//! Only what the stack needs: fixed headers, no IPv4 options on output,
//! no IPv6 extension headers, no fragmentation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, Result};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol as WireProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address,
    Ipv6Packet, Ipv6Repr, TcpOption, TcpPacket, TcpSeqNumber, UdpPacket,
};

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const MSS_OPTION_LEN: usize = 4;
const HOP_LIMIT: u8 = 64;

/// IP 协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 | 58 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Other(other),
        }
    }
}

impl From<WireProtocol> for IpProtocol {
    fn from(protocol: WireProtocol) -> Self {
        Self::from_number(u8::from(protocol))
    }
}

/// IP 包解析结果
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: u8,
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the transport header.
    pub payload_offset: usize,
    /// Length of the IP packet as declared by its header.
    pub total_len: usize,
}

impl ParsedPacket {
    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }

    fn transport<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.payload_offset..self.total_len]
    }
}

/// The TCP header fields the stack acts on.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Sequence space consumed: payload plus one each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.has(TCP_SYN) as u32 + self.has(TCP_FIN) as u32
    }
}

/// 解析 IP 包头部
pub fn parse_ip_packet(data: &[u8]) -> Result<ParsedPacket> {
    match data.first().map(|b| b >> 4) {
        Some(4) => parse_ipv4_packet(data),
        Some(6) => parse_ipv6_packet(data),
        Some(version) => anyhow::bail!("unsupported IP version: {}", version),
        None => anyhow::bail!("empty packet"),
    }
}

fn parse_ipv4_packet(data: &[u8]) -> Result<ParsedPacket> {
    let ip = Ipv4Packet::new_checked(data)
        .map_err(|_| anyhow!("malformed IPv4 header ({} bytes)", data.len()))?;
    if !ip.verify_checksum() {
        anyhow::bail!("bad IPv4 header checksum");
    }
    // 不处理分片
    if ip.more_frags() || ip.frag_offset() != 0 {
        anyhow::bail!("IPv4 fragments are not supported");
    }

    let protocol = IpProtocol::from(ip.next_header());
    let (src_port, dst_port) = transport_ports(ip.payload(), protocol);
    Ok(ParsedPacket {
        version: 4,
        protocol,
        src_ip: IpAddr::V4(Ipv4Addr::from(ip.src_addr())),
        dst_ip: IpAddr::V4(Ipv4Addr::from(ip.dst_addr())),
        src_port,
        dst_port,
        payload_offset: ip.header_len() as usize,
        total_len: ip.total_len() as usize,
    })
}

fn parse_ipv6_packet(data: &[u8]) -> Result<ParsedPacket> {
    let ip = Ipv6Packet::new_checked(data)
        .map_err(|_| anyhow!("malformed IPv6 header ({} bytes)", data.len()))?;

    let protocol = IpProtocol::from(ip.next_header());
    let (src_port, dst_port) = transport_ports(ip.payload(), protocol);
    Ok(ParsedPacket {
        version: 6,
        protocol,
        src_ip: IpAddr::V6(Ipv6Addr::from(ip.src_addr())),
        dst_ip: IpAddr::V6(Ipv6Addr::from(ip.dst_addr())),
        src_port,
        dst_port,
        payload_offset: IPV6_HEADER_LEN,
        total_len: IPV6_HEADER_LEN + ip.payload_len() as usize,
    })
}

fn transport_ports(transport: &[u8], protocol: IpProtocol) -> (u16, u16) {
    let ports = match protocol {
        IpProtocol::Tcp => TcpPacket::new_checked(transport)
            .ok()
            .map(|tcp| (tcp.src_port(), tcp.dst_port())),
        IpProtocol::Udp => UdpPacket::new_checked(transport)
            .ok()
            .map(|udp| (udp.src_port(), udp.dst_port())),
        _ => None,
    };
    ports.unwrap_or((0, 0))
}

/// Decode the TCP header of a parsed packet.
pub fn parse_tcp<'a>(packet: &'a [u8], parsed: &ParsedPacket) -> Result<TcpSegment<'a>> {
    let segment = parsed.transport(packet);
    let tcp = TcpPacket::new_checked(segment)
        .map_err(|_| anyhow!("malformed TCP header ({} bytes)", segment.len()))?;

    let flags = [
        (tcp.fin(), TCP_FIN),
        (tcp.syn(), TCP_SYN),
        (tcp.rst(), TCP_RST),
        (tcp.psh(), TCP_PSH),
        (tcp.ack(), TCP_ACK),
    ]
    .iter()
    .filter(|(set, _)| *set)
    .fold(0u8, |acc, (_, bit)| acc | bit);

    Ok(TcpSegment {
        seq: tcp.seq_number().0 as u32,
        ack: tcp.ack_number().0 as u32,
        flags,
        window: tcp.window_len(),
        mss: mss_option(tcp.options()),
        payload: tcp.payload(),
    })
}

fn mss_option(mut options: &[u8]) -> Option<u16> {
    while !options.is_empty() {
        let (rest, option) = TcpOption::parse(options).ok()?;
        match option {
            TcpOption::EndOfList => return None,
            TcpOption::MaxSegmentSize(mss) => return Some(mss),
            _ => options = rest,
        }
    }
    None
}

/// UDP payload of a parsed packet.
pub fn udp_payload<'a>(packet: &'a [u8], parsed: &ParsedPacket) -> Result<&'a [u8]> {
    let datagram = parsed.transport(packet);
    let udp = UdpPacket::new_checked(datagram)
        .map_err(|_| anyhow!("malformed UDP header ({} bytes)", datagram.len()))?;
    Ok(udp.payload())
}

/// Outgoing TCP segment description.
#[derive(Debug, Clone, Copy)]
pub struct TcpFields {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Emit an MSS option (SYN and SYN-ACK only).
    pub mss: Option<u16>,
}

pub fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    fields: TcpFields,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let header_len = TCP_HEADER_LEN + fields.mss.map_or(0, |_| MSS_OPTION_LEN);
    emit_ip(
        src.ip(),
        dst.ip(),
        WireProtocol::Tcp,
        header_len + payload.len(),
        |buf, src_addr, dst_addr| {
            let mut tcp = TcpPacket::new_unchecked(buf);
            tcp.set_src_port(src.port());
            tcp.set_dst_port(dst.port());
            tcp.set_seq_number(TcpSeqNumber(fields.seq as i32));
            tcp.set_ack_number(TcpSeqNumber(fields.ack as i32));
            tcp.set_header_len(header_len as u8);
            tcp.clear_flags();
            tcp.set_fin(fields.flags & TCP_FIN != 0);
            tcp.set_syn(fields.flags & TCP_SYN != 0);
            tcp.set_rst(fields.flags & TCP_RST != 0);
            tcp.set_psh(fields.flags & TCP_PSH != 0);
            tcp.set_ack(fields.flags & TCP_ACK != 0);
            tcp.set_window_len(fields.window);
            tcp.set_urgent_at(0);
            if let Some(mss) = fields.mss {
                TcpOption::MaxSegmentSize(mss).emit(tcp.options_mut());
            }
            tcp.payload_mut().copy_from_slice(payload);
            tcp.fill_checksum(src_addr, dst_addr);
        },
    )
}

pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        anyhow::bail!("udp datagram too large: {} bytes", udp_len);
    }

    emit_ip(src.ip(), dst.ip(), WireProtocol::Udp, udp_len, |buf, src_addr, dst_addr| {
        let mut udp = UdpPacket::new_unchecked(buf);
        udp.set_src_port(src.port());
        udp.set_dst_port(dst.port());
        udp.set_len(udp_len as u16);
        udp.payload_mut().copy_from_slice(payload);
        // 校验和为 0 时 smoltcp 会写 0xFFFF
        udp.fill_checksum(src_addr, dst_addr);
    })
}

/// Allocate one packet, emit the IP header and let `fill` write the
/// transport segment into the payload area.
fn emit_ip<F>(
    src: IpAddr,
    dst: IpAddr,
    protocol: WireProtocol,
    transport_len: usize,
    fill: F,
) -> Result<Vec<u8>>
where
    F: FnOnce(&mut [u8], &IpAddress, &IpAddress),
{
    if transport_len > u16::MAX as usize {
        anyhow::bail!("transport segment too large: {} bytes", transport_len);
    }
    let (src_addr, dst_addr) = (wire_addr(src), wire_addr(dst));

    match (src_addr, dst_addr) {
        (IpAddress::Ipv4(s), IpAddress::Ipv4(d)) => {
            let repr = Ipv4Repr {
                src_addr: s,
                dst_addr: d,
                next_header: protocol,
                payload_len: transport_len,
                hop_limit: HOP_LIMIT,
            };
            let total_len = repr.buffer_len() + transport_len;
            if total_len > u16::MAX as usize {
                anyhow::bail!("IPv4 packet too large: {} bytes", total_len);
            }
            let mut packet = vec![0u8; total_len];
            let mut ip = Ipv4Packet::new_unchecked(&mut packet[..]);
            repr.emit(&mut ip, &ChecksumCapabilities::default());
            fill(ip.payload_mut(), &src_addr, &dst_addr);
            Ok(packet)
        }
        (IpAddress::Ipv6(s), IpAddress::Ipv6(d)) => {
            let repr = Ipv6Repr {
                src_addr: s,
                dst_addr: d,
                next_header: protocol,
                payload_len: transport_len,
                hop_limit: HOP_LIMIT,
            };
            let mut packet = vec![0u8; repr.buffer_len() + transport_len];
            let mut ip = Ipv6Packet::new_unchecked(&mut packet[..]);
            repr.emit(&mut ip);
            fill(ip.payload_mut(), &src_addr, &dst_addr);
            Ok(packet)
        }
        _ => anyhow::bail!("address family mismatch: {} -> {}", src, dst),
    }
}

fn wire_addr(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            IpAddress::Ipv4(Ipv4Address::new(o[0], o[1], o[2], o[3]))
        }
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6.octets())),
    }
}

/// Check the TCP or UDP checksum of a received segment against its
/// pseudo header.
pub fn verify_transport_checksum(packet: &[u8], parsed: &ParsedPacket) -> bool {
    let transport = parsed.transport(packet);
    let (src, dst) = (wire_addr(parsed.src_ip), wire_addr(parsed.dst_ip));
    match parsed.protocol {
        IpProtocol::Tcp => {
            TcpPacket::new_checked(transport).is_ok_and(|tcp| tcp.verify_checksum(&src, &dst))
        }
        IpProtocol::Udp => {
            UdpPacket::new_checked(transport).is_ok_and(|udp| udp.verify_checksum(&src, &dst))
        }
        _ => false,
    }
}

/// Signed distance comparison in sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}
