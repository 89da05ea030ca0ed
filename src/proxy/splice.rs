use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{BoxConnection, ErrorKind, GatewayError};

const BUF_SIZE: usize = 64 * 1024;
/// Replies checked for after a close-on-write session ends, for the log only.
const DISCARD_CHECK_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Guest,
    Host,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Guest => "guest",
            Side::Host => "host",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Connect,
    Read,
    Write,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Connect => "connect",
            Op::Read => "read",
            Op::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Eof,
    Error(ErrorKind),
    CloseOnWrite,
    Cancelled,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Eof => f.write_str("eof"),
            Cause::Error(kind) => write!(f, "error({})", kind.as_str()),
            Cause::CloseOnWrite => f.write_str("close-on-write"),
            Cause::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Where and why one direction of a splice stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub side: Side,
    pub op: Op,
    pub cause: Cause,
}

impl Termination {
    pub fn new(side: Side, op: Op, cause: Cause) -> Self {
        Self { side, op, cause }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.side.as_str(), self.op.as_str(), self.cause)
    }
}

/// 转发结果，仅用于日志
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOutcome {
    pub first: Option<Termination>,
    pub second: Option<Termination>,
    pub guest_to_host: u64,
    pub host_to_guest: u64,
}

impl ProxyOutcome {
    /// Outcome of a flow whose host side could not be opened.
    pub fn connect_failed(err: &GatewayError) -> Self {
        Self {
            first: Some(Termination::new(Side::Host, Op::Connect, Cause::Error(err.kind()))),
            ..Default::default()
        }
    }

    /// Error category of the first termination, if it was an error.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.first?.cause {
            Cause::Error(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.first {
            Some(t) => write!(f, "first={}", t)?,
            None => f.write_str("first=-")?,
        }
        if let Some(t) = &self.second {
            write!(f, " second={}", t)?;
        }
        write!(f, " up={}B down={}B", self.guest_to_host, self.host_to_guest)
    }
}

/// Relay bytes between the guest-facing and host-facing connections until
/// either direction stops, then close both.
///
/// When the guest connection is close-on-write the session ends right
/// after the first host→guest write.
pub async fn splice(guest: BoxConnection, host: BoxConnection) -> ProxyOutcome {
    let close_on_write = guest.close_on_write();
    let (mut guest_r, mut guest_w) = tokio::io::split(guest);
    let (mut host_r, mut host_w) = tokio::io::split(host);

    let cancel = CancellationToken::new();
    let first_done = AtomicBool::new(false);

    let upstream = async {
        let (term, n) = pump(&mut guest_r, &mut host_w, Side::Guest, Side::Host, false, &cancel).await;
        let first = !first_done.swap(true, Ordering::AcqRel);
        cancel.cancel();
        (term, n, first)
    };
    let downstream = async {
        let (term, n) =
            pump(&mut host_r, &mut guest_w, Side::Host, Side::Guest, close_on_write, &cancel).await;
        let first = !first_done.swap(true, Ordering::AcqRel);
        cancel.cancel();
        (term, n, first)
    };
    let ((up, up_bytes, up_first), (down, down_bytes, _)) = tokio::join!(upstream, downstream);

    if down.cause == Cause::CloseOnWrite {
        let discarded = count_discarded(&mut host_r).await;
        if discarded > 0 {
            debug!(discarded, "close-on-write session ended, later replies dropped");
        }
    }

    let (first, second) = if up_first { (up, down) } else { (down, up) };

    let mut guest = guest_r.unsplit(guest_w);
    let mut host = host_r.unsplit(host_w);
    // 一侧被 reset，另一侧也以 reset 关闭
    if first.cause == Cause::Error(ErrorKind::ConnectionReset) {
        match first.side {
            Side::Host => guest.set_reset_on_close(),
            Side::Guest => host.set_reset_on_close(),
        }
    }
    let _ = guest.shutdown().await;
    let _ = host.shutdown().await;

    ProxyOutcome {
        first: Some(first),
        second: Some(second),
        guest_to_host: up_bytes,
        host_to_guest: down_bytes,
    }
}

/// One direction. Returns what stopped it and the bytes written.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Side,
    to: Side,
    close_on_write: bool,
    cancel: &CancellationToken,
) -> (Termination, u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return (Termination::new(from, Op::Read, Cause::Cancelled), total);
            }
            r = reader.read(&mut buf) => r,
        };
        let n = match read {
            Ok(0) => return (Termination::new(from, Op::Read, Cause::Eof), total),
            Ok(n) => n,
            Err(e) => {
                let cause = Cause::Error(ErrorKind::from_io(&e));
                return (Termination::new(from, Op::Read, cause), total);
            }
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return (Termination::new(to, Op::Write, Cause::Cancelled), total);
            }
            r = writer.write_all(&buf[..n]) => r,
        };
        if let Err(e) = written {
            let cause = Cause::Error(ErrorKind::from_io(&e));
            return (Termination::new(to, Op::Write, cause), total);
        }
        total += n as u64;

        if close_on_write {
            return (Termination::new(to, Op::Write, Cause::CloseOnWrite), total);
        }
    }
}

/// Count replies already waiting on the host side without blocking.
async fn count_discarded<R: AsyncRead + Unpin>(reader: &mut R) -> usize {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut count = 0;
    while count < DISCARD_CHECK_LIMIT {
        match tokio::time::timeout(Duration::ZERO, reader.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => count += 1,
            _ => break,
        }
    }
    count
}
