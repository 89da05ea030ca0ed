//! Local-initiated forwards: host listeners whose clients are connected
//! into the namespace through the virtual stack.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::splice::{splice, ProxyOutcome};
use crate::common::{BoxConnection, Connection, GatewayError, HostTcpConn, Network};
use crate::netstack::Stack;
use crate::router::forward::ForwardSpec;

const CLIENT_QUEUE: usize = 128;
const MAX_DATAGRAM: usize = 65535;
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// A bound `-L` forward.
pub struct LocalForward {
    spec: ForwardSpec,
    listener: Listener,
}

impl LocalForward {
    /// Bind the host side. Failing here is a setup error.
    pub async fn bind(spec: ForwardSpec) -> Result<Self> {
        let listener = match spec.network {
            Network::Tcp => Listener::Tcp(TcpListener::bind(spec.bind).await.map_err(|e| {
                GatewayError::Setup(format!("local forward {}: bind failed: {}", spec, e))
            })?),
            Network::Udp => Listener::Udp(Arc::new(UdpSocket::bind(spec.bind).await.map_err(
                |e| GatewayError::Setup(format!("local forward {}: bind failed: {}", spec, e)),
            )?)),
        };
        Ok(Self { spec, listener })
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Actual bound address (differs from the spec when port 0 was asked for).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(s) => s.local_addr(),
        }
    }

    /// Serve until cancelled. Per-client tasks go on `tracker`.
    pub async fn run(self, stack: Arc<Stack>, tracker: TaskTracker, cancel: CancellationToken) {
        let addr = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.spec.bind.to_string());
        info!(forward = %self.spec, addr = %addr, "local forward listening");

        match self.listener {
            Listener::Tcp(listener) => serve_tcp(self.spec, listener, stack, tracker, cancel).await,
            Listener::Udp(socket) => serve_udp(self.spec, socket, stack, tracker, cancel).await,
        }
        debug!(addr = %addr, "local forward stopped");
    }
}

async fn serve_tcp(
    spec: ForwardSpec,
    listener: TcpListener,
    stack: Arc<Stack>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        let (stream, client) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => {
                    failures = 0;
                    v
                }
                Err(e) => {
                    // EMFILE 之类的错误会立即重复，退避后再试
                    let delay = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    error!(
                        error = %e,
                        forward = %spec,
                        retry_ms = delay.as_millis() as u64,
                        "accept failed"
                    );
                    let stop = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if stop {
                        break;
                    }
                    continue;
                }
            },
        };

        let host = match HostTcpConn::new(stream) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, client = %client, "dropping local client");
                continue;
            }
        };
        let stack = stack.clone();
        let target = spec.target;
        tracker.spawn(async move {
            info!(network = "tcp", client = %client, target = %target, "local forward opened");
            let mut host: BoxConnection = Box::new(host);
            let outcome = match stack.connect_tcp(target).await {
                Ok(guest) => splice(guest, host).await,
                Err(e) => {
                    warn!(
                        network = "tcp",
                        client = %client,
                        target = %target,
                        error = %e,
                        error_code = e.kind().as_str(),
                        "connect into namespace failed"
                    );
                    host.set_reset_on_close();
                    ProxyOutcome::connect_failed(&e)
                }
            };
            info!(network = "tcp", client = %client, target = %target, outcome = %outcome, "local forward closed");
        });
    }
}

async fn serve_udp(
    spec: ForwardSpec,
    socket: Arc<UdpSocket>,
    stack: Arc<Stack>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let clients: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, client) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, forward = %spec, "recv_from failed");
                    continue;
                }
            },
        };
        if n == 0 {
            continue;
        }
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        let existing = clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .cloned();
        if let Some(tx) = existing {
            if tx.try_send(datagram).is_err() {
                debug!(client = %client, "local udp client queue full, datagram dropped");
            }
            continue;
        }

        let guest = match stack.connect_udp(spec.target) {
            Ok(g) => g,
            Err(e) => {
                warn!(client = %client, target = %spec.target, error = %e, "udp session into namespace failed");
                continue;
            }
        };
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let _ = tx.try_send(datagram);
        clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client, tx);

        let host = LocalUdpClient {
            socket: socket.clone(),
            client,
            rx,
        };
        let clients = clients.clone();
        let target = spec.target;
        tracker.spawn(async move {
            info!(network = "udp", client = %client, target = %target, "local forward opened");
            let outcome = splice(guest, Box::new(host)).await;
            clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&client);
            info!(network = "udp", client = %client, target = %target, outcome = %outcome, "local forward closed");
        });
    }
}

/// One client of a shared listening UDP socket.
struct LocalUdpClient {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
}

impl Connection for LocalUdpClient {
    fn network(&self) -> Network {
        Network::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap_or(self.client)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.client
    }

    fn set_reset_on_close(&mut self) {}
}

impl AsyncRead for LocalUdpClient {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for LocalUdpClient {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send_to(cx, buf, self.client)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.rx.close();
        Poll::Ready(Ok(()))
    }
}

/// Pause after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.min(8))
        .min(ACCEPT_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::forward::Direction;

    #[test]
    fn accept_errors_back_off_up_to_a_cap() {
        assert_eq!(accept_backoff(0), Duration::from_millis(5));
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert!(accept_backoff(3) > accept_backoff(2));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn bind_reports_actual_address() {
        let spec = ForwardSpec::parse(Direction::LocalInitiated, "tcp://127.0.0.1:0:80").unwrap();
        let forward = LocalForward::bind(spec).await.unwrap();
        let addr = forward.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(forward.spec().target.port(), 80);
    }

    #[tokio::test]
    async fn bind_conflict_is_setup_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let spec =
            ForwardSpec::parse(Direction::LocalInitiated, &format!("127.0.0.1:{}:22", port)).unwrap();
        let err = LocalForward::bind(spec).await.err().unwrap();
        assert_eq!(
            GatewayError::classify(&err),
            crate::common::ErrorKind::Setup
        );
    }
}
