//! ConnectionSplicer over real loopback sockets.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use nsgate::common::{
    BoxConnection, Connection, ErrorKind, HostTcpConn, HostUdpConn, Network, StreamConn,
};
use nsgate::proxy::{splice, Cause, Op, Side, Termination};

/// Duplex-backed connection that records `set_reset_on_close`.
struct FlaggedConn {
    inner: DuplexStream,
    reset: Arc<AtomicBool>,
}

/// Connection whose reads or writes fail with a fixed error. Without a
/// read error, reads never complete.
struct FailingConn {
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    reset: Arc<AtomicBool>,
}

fn flagged() -> (FlaggedConn, DuplexStream, Arc<AtomicBool>) {
    let (inner, peer) = tokio::io::duplex(16 * 1024);
    let reset = Arc::new(AtomicBool::new(false));
    let conn = FlaggedConn {
        inner,
        reset: reset.clone(),
    };
    (conn, peer, reset)
}

fn failing(
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
) -> (FailingConn, Arc<AtomicBool>) {
    let reset = Arc::new(AtomicBool::new(false));
    let conn = FailingConn {
        read_error,
        write_error,
        reset: reset.clone(),
    };
    (conn, reset)
}

impl Connection for FlaggedConn {
    fn network(&self) -> Network {
        Network::Tcp
    }
    fn local_addr(&self) -> SocketAddr {
        "10.0.2.2:80".parse().unwrap()
    }
    fn remote_addr(&self) -> SocketAddr {
        "10.0.2.100:40000".parse().unwrap()
    }
    fn set_reset_on_close(&mut self) {
        self.reset.store(true, Ordering::SeqCst);
    }
}

impl AsyncRead for FlaggedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlaggedConn {
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

impl Connection for FailingConn {
    fn network(&self) -> Network {
        Network::Tcp
    }
    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }
    fn remote_addr(&self) -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }
    fn set_reset_on_close(&mut self) {
        self.reset.store(true, Ordering::SeqCst);
    }
}

impl AsyncRead for FailingConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.read_error {
            Some(kind) => Poll::Ready(Err(kind.into())),
            None => Poll::Pending,
        }
    }
}

impl AsyncWrite for FailingConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.write_error {
            Some(kind) => Poll::Ready(Err(kind.into())),
            None => Poll::Ready(Ok(buf.len())),
        }
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connected pair: (our end as a host connection, the far end).
async fn tcp_pair() -> (BoxConnection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let conn: BoxConnection = Box::new(HostTcpConn::new(client.unwrap()).unwrap());
    (conn, accepted.unwrap().0)
}

fn guest_pipe(close_on_write: bool) -> (BoxConnection, tokio::io::DuplexStream) {
    let (inner, peer) = tokio::io::duplex(16 * 1024);
    let conn = StreamConn::new(
        inner,
        Network::Tcp,
        "10.0.2.2:80".parse::<SocketAddr>().unwrap(),
        "10.0.2.100:40000".parse::<SocketAddr>().unwrap(),
    )
    .with_close_on_write(close_on_write);
    (Box::new(conn), peer)
}

#[tokio::test]
async fn relays_large_payloads_both_ways() {
    let (guest, guest_peer) = guest_pipe(false);
    let (host, mut host_peer) = tcp_pair().await;
    let task = tokio::spawn(splice(guest, host));

    let up: Vec<u8> = (0..300_000u32).map(|i| (i * 7) as u8).collect();
    let down: Vec<u8> = (0..200_000u32).map(|i| (i * 13) as u8).collect();

    let (up_copy, down_copy) = (up.clone(), down.clone());
    let guest_side = tokio::spawn(async move {
        let (mut r, mut w) = tokio::io::split(guest_peer);
        let writer = async {
            w.write_all(&up_copy).await.unwrap();
        };
        let reader = async {
            let mut got = vec![0u8; down_copy.len()];
            r.read_exact(&mut got).await.unwrap();
            got
        };
        let (_, got) = tokio::join!(writer, reader);
        (r.unsplit(w), got)
    });
    let host_side = tokio::spawn(async move {
        let (mut r, mut w) = host_peer.split();
        let writer = async {
            w.write_all(&down).await.unwrap();
        };
        let reader = async {
            let mut got = vec![0u8; up.len()];
            r.read_exact(&mut got).await.unwrap();
            got
        };
        let (_, got) = tokio::join!(writer, reader);
        (host_peer, got)
    });

    let (mut guest_peer, got_down) = guest_side.await.unwrap();
    let (host_peer, got_up) = host_side.await.unwrap();
    assert_eq!(got_up.len(), 300_000);
    assert_eq!(got_down.len(), 200_000);
    assert_eq!(got_up[..10], (0..10u32).map(|i| (i * 7) as u8).collect::<Vec<_>>()[..]);

    drop(host_peer);
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("splice did not return")
        .unwrap();
    let first = outcome.first.unwrap();
    assert_eq!(first.side, Side::Host);
    assert_eq!(first.op, Op::Read);
    assert_eq!(outcome.guest_to_host, 300_000);
    assert_eq!(outcome.host_to_guest, 200_000);

    // guest side was torn down too
    let mut rest = Vec::new();
    guest_peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn host_abort_ends_splice() {
    let (guest, _guest_peer) = guest_pipe(false);
    let (host, host_peer) = tcp_pair().await;
    let task = tokio::spawn(splice(guest, host));

    // SO_LINGER 0 makes the close abortive.
    socket2::SockRef::from(&host_peer)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(host_peer);

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome.first,
        Some(Termination::new(
            Side::Host,
            Op::Read,
            Cause::Error(ErrorKind::ConnectionReset)
        ))
    );
}

#[tokio::test]
async fn host_write_failure_resets_the_guest() {
    let (guest, mut guest_peer, guest_reset) = flagged();
    let (host, host_reset) = failing(None, Some(io::ErrorKind::BrokenPipe));
    let task = tokio::spawn(splice(Box::new(guest), Box::new(host)));

    guest_peer.write_all(b"request").await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("splice did not return")
        .unwrap();
    assert_eq!(
        outcome.first,
        Some(Termination::new(
            Side::Host,
            Op::Write,
            Cause::Error(ErrorKind::ConnectionReset)
        ))
    );
    assert_eq!(
        outcome.second,
        Some(Termination::new(Side::Host, Op::Read, Cause::Cancelled))
    );
    assert_eq!(outcome.guest_to_host, 0);
    assert!(guest_reset.load(Ordering::SeqCst));
    assert!(!host_reset.load(Ordering::SeqCst));
}

#[tokio::test]
async fn host_read_reset_resets_the_guest() {
    let (guest, _guest_peer, guest_reset) = flagged();
    let (host, host_reset) = failing(Some(io::ErrorKind::ConnectionReset), None);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        splice(Box::new(guest), Box::new(host)),
    )
    .await
    .expect("splice did not return");
    assert_eq!(
        outcome.first,
        Some(Termination::new(
            Side::Host,
            Op::Read,
            Cause::Error(ErrorKind::ConnectionReset)
        ))
    );
    assert!(guest_reset.load(Ordering::SeqCst));
    assert!(!host_reset.load(Ordering::SeqCst));
}

#[tokio::test]
async fn guest_read_reset_resets_the_host() {
    let (guest, guest_reset) = failing(Some(io::ErrorKind::ConnectionReset), None);
    let (host, _host_peer, host_reset) = flagged();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        splice(Box::new(guest), Box::new(host)),
    )
    .await
    .expect("splice did not return");
    assert_eq!(
        outcome.first,
        Some(Termination::new(
            Side::Guest,
            Op::Read,
            Cause::Error(ErrorKind::ConnectionReset)
        ))
    );
    assert!(host_reset.load(Ordering::SeqCst));
    assert!(!guest_reset.load(Ordering::SeqCst));
}

#[tokio::test]
async fn plain_io_error_does_not_reset() {
    let (guest, _guest_peer, guest_reset) = flagged();
    let (host, _) = failing(Some(io::ErrorKind::Other), None);

    let outcome = splice(Box::new(guest), Box::new(host)).await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Io));
    assert!(!guest_reset.load(Ordering::SeqCst));
}

#[tokio::test]
async fn udp_close_on_write_ignores_later_replies() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server.local_addr().unwrap()).await.unwrap();
    let host: BoxConnection = Box::new(HostUdpConn::new(client).unwrap());

    let (guest, mut guest_peer) = guest_pipe(true);
    let task = tokio::spawn(splice(guest, host));

    guest_peer.write_all(b"ntp?").await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ntp?");
    server.send_to(b"one", from).await.unwrap();
    server.send_to(b"two", from).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.first.unwrap().cause, Cause::CloseOnWrite);
    assert_eq!(outcome.host_to_guest, 3);

    let mut got = Vec::new();
    guest_peer.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, b"one");
}
