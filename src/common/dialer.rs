//! Outbound dialer for the host side of a flow.
//!
//! Opens real (non-virtual) TCP connections and connected UDP sockets,
//! applying the socket-level options from [`DialerConfig`]:
//!
//! - Bind to a specific source address
//! - Routing mark (fwmark / SO_MARK)
//! - Connect timeout
//! - Keep-alive settings

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use super::conn::{BoxConnection, HostTcpConn, HostUdpConn};
use super::error::GatewayError;
use super::Network;

/// Dialer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// Routing mark (Linux SO_MARK / fwmark).
    #[serde(rename = "routing-mark")]
    pub routing_mark: Option<u32>,

    /// Connect timeout in milliseconds. Default: 5000.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,

    /// TCP keep-alive interval in seconds. 0 = disabled.
    #[serde(rename = "tcp-keep-alive")]
    pub tcp_keep_alive_secs: Option<u64>,
}

impl DialerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(5000))
    }

    pub fn bind_ip(&self) -> Result<Option<IpAddr>, GatewayError> {
        match &self.bind_address {
            None => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|e| {
                GatewayError::Config(format!("invalid bind address '{}': {}", s, e))
            }),
        }
    }
}

/// Opens the host-facing half of a flow.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    async fn dial(&self, network: Network, target: SocketAddr)
        -> Result<BoxConnection, GatewayError>;
}

/// Dialer on the host's real network stack.
pub struct HostDialer {
    config: DialerConfig,
    bind_ip: Option<IpAddr>,
}

impl HostDialer {
    pub fn new(config: DialerConfig) -> Result<Self, GatewayError> {
        let bind_ip = config.bind_ip()?;
        Ok(Self { config, bind_ip })
    }

    /// Create a dialer with default settings.
    pub fn default_dialer() -> Self {
        Self {
            config: DialerConfig::default(),
            bind_ip: None,
        }
    }

    pub async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream, GatewayError> {
        let timeout = self.config.connect_timeout();

        let stream = tokio::time::timeout(timeout, self.connect_tcp_inner(addr))
            .await
            .map_err(|_| {
                GatewayError::ConnectionTimeout(format!("{} after {:?}", addr, timeout))
            })??;

        self.apply_post_connect(&stream)?;

        debug!(addr = %addr, "dialer connected");
        Ok(stream)
    }

    pub async fn connect_udp(&self, addr: SocketAddr) -> Result<UdpSocket, GatewayError> {
        let local = match (self.bind_ip, addr) {
            (Some(ip), _) => SocketAddr::new(ip, 0),
            (None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
            (None, SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(local).await?;

        #[cfg(target_os = "linux")]
        if let Some(mark) = self.config.routing_mark {
            socket2::SockRef::from(&socket).set_mark(mark)?;
        }

        // connect() on UDP only fixes the peer; ICMP errors surface on the
        // first send/recv, which the splice records.
        socket.connect(addr).await?;
        Ok(socket)
    }

    async fn connect_tcp_inner(&self, addr: SocketAddr) -> Result<TcpStream, GatewayError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(ip) = self.bind_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        #[cfg(target_os = "linux")]
        if let Some(mark) = self.config.routing_mark {
            socket2::SockRef::from(&socket).set_mark(mark)?;
        }

        Ok(socket.connect(addr).await?)
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> Result<(), GatewayError> {
        if let Some(interval) = self.config.tcp_keep_alive_secs {
            if interval > 0 {
                let sock_ref = socket2::SockRef::from(stream);
                let keepalive =
                    socket2::TcpKeepalive::new().with_time(Duration::from_secs(interval));
                sock_ref.set_tcp_keepalive(&keepalive)?;
            }
        }

        // Relayed traffic is already segmented by the guest.
        stream.set_nodelay(true)?;
        Ok(())
    }
}

#[async_trait]
impl Dial for HostDialer {
    async fn dial(
        &self,
        network: Network,
        target: SocketAddr,
    ) -> Result<BoxConnection, GatewayError> {
        match network {
            Network::Tcp => {
                let stream = self.connect_tcp(target).await?;
                Ok(Box::new(HostTcpConn::new(stream)?))
            }
            Network::Udp => {
                let socket = self.connect_udp(target).await?;
                Ok(Box::new(HostUdpConn::new(socket)?))
            }
        }
    }
}
