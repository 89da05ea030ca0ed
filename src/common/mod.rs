pub mod addr;
pub mod conn;
pub mod dialer;
pub mod error;

pub use addr::Network;
pub use conn::{BoxConnection, Connection, HostTcpConn, HostUdpConn, StreamConn};
pub use dialer::{Dial, DialerConfig, HostDialer};
pub use error::{ErrorKind, GatewayError};
