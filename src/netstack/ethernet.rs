//! Ethernet framing for TAP interfaces.
//!
//! Frames from the guest are stripped down to their IP packet, packets
//! from the stack get a link header addressed to the learned neighbor.
//! ARP requests for the IPv4 gateway are answered with [`GATEWAY_MAC`].

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address, Ipv4Packet, Ipv6Packet,
};
use tracing::{debug, trace};

use super::stack::lock;

/// Hardware address of the gateway on a TAP link.
pub const GATEWAY_MAC: [u8; 6] = [0x70, 0x71, 0xaa, 0x4b, 0x29, 0xaa];

pub const ETHERNET_HEADER_LEN: usize = 14;

/// 以太网帧解封装结果
#[derive(Debug, PartialEq, Eq)]
pub(super) enum LinkInput<'a> {
    /// IP packet for the stack.
    Ip(&'a [u8]),
    /// Frame to write straight back to the device.
    Reply(Vec<u8>),
    Ignore,
}

pub(super) struct EthernetLink {
    mac: EthernetAddress,
    gateway_v4: Ipv4Addr,
    neighbors: Mutex<HashMap<IpAddr, EthernetAddress>>,
    /// IPv4 neighbors an ARP request already went out for.
    resolving: Mutex<HashSet<Ipv4Addr>>,
}

impl EthernetLink {
    pub(super) fn new(mac: [u8; 6], gateway_v4: Ipv4Addr) -> Self {
        Self {
            mac: EthernetAddress(mac),
            gateway_v4,
            neighbors: Mutex::new(HashMap::new()),
            resolving: Mutex::new(HashSet::new()),
        }
    }

    pub(super) fn input<'a>(&self, frame: &'a [u8]) -> LinkInput<'a> {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return LinkInput::Ignore;
        };
        let dst = eth.dst_addr();
        if dst != self.mac && !dst.is_broadcast() && !dst.is_multicast() {
            return LinkInput::Ignore;
        }

        let src = eth.src_addr();
        let payload = eth.payload();
        match eth.ethertype() {
            EthernetProtocol::Ipv4 => {
                if let Ok(ip) = Ipv4Packet::new_checked(payload) {
                    self.learn(IpAddr::V4(Ipv4Addr::from(ip.src_addr())), src);
                }
                LinkInput::Ip(payload)
            }
            EthernetProtocol::Ipv6 => {
                if let Ok(ip) = Ipv6Packet::new_checked(payload) {
                    self.learn(IpAddr::V6(Ipv6Addr::from(ip.src_addr())), src);
                }
                LinkInput::Ip(payload)
            }
            EthernetProtocol::Arp => self.input_arp(payload),
            other => {
                trace!(ethertype = ?other, "ignoring frame");
                LinkInput::Ignore
            }
        }
    }

    fn input_arp(&self, payload: &[u8]) -> LinkInput<'static> {
        let repr = match ArpPacket::new_checked(payload).and_then(|p| ArpRepr::parse(&p)) {
            Ok(repr) => repr,
            Err(_) => return LinkInput::Ignore,
        };
        #[allow(irrefutable_let_patterns)]
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            return LinkInput::Ignore;
        };

        self.learn(
            IpAddr::V4(Ipv4Addr::from(source_protocol_addr)),
            source_hardware_addr,
        );
        if operation != ArpOperation::Request
            || Ipv4Addr::from(target_protocol_addr) != self.gateway_v4
        {
            return LinkInput::Ignore;
        }

        let reply = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: self.mac,
            source_protocol_addr: target_protocol_addr,
            target_hardware_addr: source_hardware_addr,
            target_protocol_addr: source_protocol_addr,
        };
        LinkInput::Reply(self.arp_frame(source_hardware_addr, &reply))
    }

    /// Frames to write for one IP packet from the stack: an ARP request
    /// first when the IPv4 neighbor is not known yet.
    pub(super) fn encapsulate(&self, packet: &[u8]) -> Vec<Vec<u8>> {
        let (ethertype, dst) = match packet.first().map(|b| b >> 4) {
            Some(4) => match Ipv4Packet::new_checked(packet) {
                Ok(ip) => (
                    EthernetProtocol::Ipv4,
                    IpAddr::V4(Ipv4Addr::from(ip.dst_addr())),
                ),
                Err(_) => return Vec::new(),
            },
            Some(6) => match Ipv6Packet::new_checked(packet) {
                Ok(ip) => (
                    EthernetProtocol::Ipv6,
                    IpAddr::V6(Ipv6Addr::from(ip.dst_addr())),
                ),
                Err(_) => return Vec::new(),
            },
            _ => return Vec::new(),
        };

        let mut frames = Vec::with_capacity(2);
        let known = lock(&self.neighbors).get(&dst).copied();
        let dst_mac = match known {
            Some(mac) => mac,
            None => {
                if let IpAddr::V4(v4) = dst {
                    if lock(&self.resolving).insert(v4) {
                        frames.push(self.arp_request(v4));
                    }
                }
                EthernetAddress::BROADCAST
            }
        };
        frames.push(self.frame(dst_mac, ethertype, packet.len(), |buf| {
            buf.copy_from_slice(packet)
        }));
        frames
    }

    fn learn(&self, ip: IpAddr, mac: EthernetAddress) {
        if ip.is_unspecified() || !mac.is_unicast() {
            return;
        }
        let previous = lock(&self.neighbors).insert(ip, mac);
        if previous != Some(mac) {
            debug!(ip = %ip, mac = %mac, "neighbor learned");
        }
        if let IpAddr::V4(v4) = ip {
            lock(&self.resolving).remove(&v4);
        }
    }

    fn arp_request(&self, target: Ipv4Addr) -> Vec<u8> {
        let request = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: self.mac,
            source_protocol_addr: wire_v4(self.gateway_v4),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: wire_v4(target),
        };
        self.arp_frame(EthernetAddress::BROADCAST, &request)
    }

    fn arp_frame(&self, dst: EthernetAddress, repr: &ArpRepr) -> Vec<u8> {
        self.frame(dst, EthernetProtocol::Arp, repr.buffer_len(), |buf| {
            repr.emit(&mut ArpPacket::new_unchecked(buf))
        })
    }

    fn frame<F>(
        &self,
        dst: EthernetAddress,
        ethertype: EthernetProtocol,
        len: usize,
        fill: F,
    ) -> Vec<u8>
    where
        F: FnOnce(&mut [u8]),
    {
        let repr = EthernetRepr {
            src_addr: self.mac,
            dst_addr: dst,
            ethertype,
        };
        let mut buf = vec![0u8; repr.buffer_len() + len];
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        repr.emit(&mut frame);
        fill(frame.payload_mut());
        buf
    }
}

fn wire_v4(ip: Ipv4Addr) -> Ipv4Address {
    let o = ip.octets();
    Ipv4Address::new(o[0], o[1], o[2], o[3])
}
