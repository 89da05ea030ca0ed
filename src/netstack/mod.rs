//! User-space TCP/UDP responder over a TUN device.
//!
//! The stack terminates every flow the guest opens and hands it to a
//! registered handler as a pending request. The handler decides whether
//! to create an endpoint (a [`Connection`](crate::common::Connection))
//! or to refuse it.

pub mod device;
mod ethernet;
pub mod packet;
pub mod stack;
mod tcp;
mod udp;

use std::fmt;
use std::net::SocketAddr;

use crate::common::{BoxConnection, GatewayError};

pub use device::{open_device, ChannelDevice, DeviceHandle, DeviceMode, DeviceOptions, TunDevice};
pub use ethernet::GATEWAY_MAC;
pub use stack::{PacketReceiver, Stack, StackOptions, OUT_QUEUE};

/// Endpoints of a flow as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Guest address and port.
    pub src: SocketAddr,
    /// Address and port the guest connected to.
    pub dst: SocketAddr,
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Fixed at endpoint creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointOptions {
    /// Disable write coalescing.
    pub no_delay: bool,
    /// Single-shot session; see [`Connection::close_on_write`](crate::common::Connection::close_on_write).
    pub close_on_write: bool,
}

/// A TCP handshake waiting for a verdict.
///
/// Dropping the request without calling either method resets it.
pub trait TcpFlowRequest: Send {
    fn id(&self) -> FlowId;

    /// Finish the handshake (SYN-ACK) and return the guest-facing stream.
    fn create_endpoint(self: Box<Self>, options: EndpointOptions)
        -> Result<BoxConnection, GatewayError>;

    /// Refuse the flow; with `reset` the guest gets an RST, otherwise the
    /// SYN is silently forgotten.
    fn complete(self: Box<Self>, reset: bool);
}

/// The first datagram of a new UDP pair. Dropping it discards the datagram.
pub trait UdpFlowRequest: Send {
    fn id(&self) -> FlowId;

    /// Open the session. The triggering datagram is the first one read.
    fn create_endpoint(self: Box<Self>, options: EndpointOptions)
        -> Result<BoxConnection, GatewayError>;
}

/// Called synchronously from the packet loop; must not block.
pub trait TcpFlowHandler: Send + Sync {
    fn on_tcp_flow(&self, request: Box<dyn TcpFlowRequest>);
}

/// Called synchronously from the packet loop; must not block.
pub trait UdpFlowHandler: Send + Sync {
    fn on_udp_flow(&self, request: Box<dyn UdpFlowRequest>);
}
