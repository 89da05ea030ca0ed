pub mod forward;
pub mod policy;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::common::{BoxConnection, Dial, Network};
use crate::netstack::{
    EndpointOptions, FlowId, TcpFlowHandler, TcpFlowRequest, UdpFlowHandler, UdpFlowRequest,
};
use crate::proxy::splice::{splice, ProxyOutcome};

pub use forward::{Direction, ForwardSpec, ForwardTable};
pub use policy::{AddressPolicy, Decision, RejectReason};

/// Request/response UDP services; their sessions end after the first reply.
pub const UDP_RPC_PORTS: &[u16] = &[53, 123];

pub fn is_udp_rpc_port(port: u16) -> bool {
    UDP_RPC_PORTS.contains(&port)
}

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Accepted {
        target: SocketAddr,
        /// Set when a remote forward matched and the policy was bypassed.
        forward: Option<ForwardSpec>,
        close_on_write: bool,
    },
    Rejected(RejectReason),
}

/// Decides the fate of every new flow from the namespace and runs the
/// accepted ones.
pub struct Router {
    policy: Arc<AddressPolicy>,
    forwards: Arc<ForwardTable>,
    dialer: Arc<dyn Dial>,
    tracker: TaskTracker,
}

impl Router {
    pub fn new(
        policy: Arc<AddressPolicy>,
        forwards: Arc<ForwardTable>,
        dialer: Arc<dyn Dial>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            policy,
            forwards,
            dialer,
            tracker,
        }
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    pub fn forwards(&self) -> &ForwardTable {
        &self.forwards
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Forward table first (bypasses the policy), then deny, then allow.
    pub fn route(&self, network: Network, dst: SocketAddr) -> RouteDecision {
        if let Some(spec) = self.forwards.lookup(network, &dst) {
            let close_on_write =
                network == Network::Udp && (spec.rpc || is_udp_rpc_port(dst.port()));
            return RouteDecision::Accepted {
                target: spec.target,
                forward: Some(spec.clone()),
                close_on_write,
            };
        }

        if let Err(reason) = self.policy.check(dst.ip()) {
            return RouteDecision::Rejected(reason);
        }

        RouteDecision::Accepted {
            target: dst,
            forward: None,
            close_on_write: network == Network::Udp && is_udp_rpc_port(dst.port()),
        }
    }

    fn spawn_forward(
        &self,
        network: Network,
        guest: BoxConnection,
        id: FlowId,
        target: SocketAddr,
        forward: Option<ForwardSpec>,
    ) {
        let dialer = self.dialer.clone();
        self.tracker
            .spawn(forward_flow(dialer, network, guest, id, target, forward));
    }
}

/// Dial the host side and splice. Never fails: every outcome is logged.
async fn forward_flow(
    dialer: Arc<dyn Dial>,
    network: Network,
    mut guest: BoxConnection,
    id: FlowId,
    target: SocketAddr,
    forward: Option<ForwardSpec>,
) {
    let kind = if forward.is_some() {
        "remote-forward"
    } else {
        "routing"
    };
    info!(network = %network, guest = %id.src, dst = %id.dst, target = %target, kind, "flow opened");

    let outcome = match dialer.dial(network, target).await {
        Ok(host) => splice(guest, host).await,
        Err(e) => {
            warn!(
                network = %network,
                guest = %id.src,
                target = %target,
                error = %e,
                error_code = e.kind().as_str(),
                "dial failed"
            );
            guest.set_reset_on_close();
            let _ = guest.shutdown().await;
            ProxyOutcome::connect_failed(&e)
        }
    };

    info!(network = %network, guest = %id.src, target = %target, kind, outcome = %outcome, "flow closed");
}

/// TCP handler registered with the stack.
pub struct TcpRouter(Arc<Router>);

impl TcpRouter {
    pub fn new(router: Arc<Router>) -> Self {
        Self(router)
    }
}

impl TcpFlowHandler for TcpRouter {
    fn on_tcp_flow(&self, request: Box<dyn TcpFlowRequest>) {
        let id = request.id();
        match self.0.route(Network::Tcp, id.dst) {
            RouteDecision::Rejected(reason) => {
                debug!(network = "tcp", guest = %id.src, dst = %id.dst, reason = %reason, "flow rejected");
                request.complete(true);
            }
            RouteDecision::Accepted {
                target, forward, ..
            } => {
                let options = EndpointOptions {
                    no_delay: true,
                    close_on_write: false,
                };
                match request.create_endpoint(options) {
                    Ok(guest) => self.0.spawn_forward(Network::Tcp, guest, id, target, forward),
                    Err(e) => warn!(network = "tcp", flow = %id, error = %e, "create endpoint failed"),
                }
            }
        }
    }
}

/// UDP handler registered with the stack.
pub struct UdpRouter(Arc<Router>);

impl UdpRouter {
    pub fn new(router: Arc<Router>) -> Self {
        Self(router)
    }
}

impl UdpFlowHandler for UdpRouter {
    fn on_udp_flow(&self, request: Box<dyn UdpFlowRequest>) {
        let id = request.id();
        match self.0.route(Network::Udp, id.dst) {
            RouteDecision::Rejected(reason) => {
                // 静默丢弃
                debug!(network = "udp", guest = %id.src, dst = %id.dst, reason = %reason, "flow rejected");
            }
            RouteDecision::Accepted {
                target,
                forward,
                close_on_write,
            } => {
                let options = EndpointOptions {
                    no_delay: false,
                    close_on_write,
                };
                match request.create_endpoint(options) {
                    Ok(guest) => self.0.spawn_forward(Network::Udp, guest, id, target, forward),
                    Err(e) => warn!(network = "udp", flow = %id, error = %e, "create endpoint failed"),
                }
            }
        }
    }
}
