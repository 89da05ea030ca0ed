//! Config file → policy and forward table → routing decisions.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::task::TaskTracker;

use nsgate::common::{HostDialer, Network};
use nsgate::config::load_config;
use nsgate::router::{Decision, RejectReason, RouteDecision, Router};

fn sa(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn write_config(body: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nsgate.yaml");
    std::fs::write(&path, body).unwrap();
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

fn router_from(path: &str) -> Router {
    let config = load_config(path).unwrap();
    Router::new(
        Arc::new(config.address_policy().unwrap()),
        Arc::new(config.forward_table().unwrap()),
        Arc::new(HostDialer::default_dialer()),
        TaskTracker::new(),
    )
}

#[test]
fn custom_lists_replace_defaults() {
    let (_dir, path) = write_config(
        r#"
policy:
  deny: ["192.168.0.0/16", "fd00::/8"]
  allow: ["192.168.0.0/16", "203.0.113.0/24", "2001:db8::/32"]
forwards:
  remote:
    - "10.0.2.2:2222:192.168.1.10:22"
"#,
    );
    let router = router_from(&path);

    // deny wins over an equal allow
    match router.route(Network::Tcp, sa("192.168.4.4:80")) {
        RouteDecision::Rejected(RejectReason::Denied(net)) => {
            assert_eq!(net.to_string(), "192.168.0.0/16")
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        router.route(Network::Tcp, sa("198.51.100.1:443")),
        RouteDecision::Rejected(RejectReason::NotAllowed)
    );
    assert_eq!(
        router.route(Network::Udp, sa("[2001:db8::1]:9000")),
        RouteDecision::Accepted {
            target: sa("[2001:db8::1]:9000"),
            forward: None,
            close_on_write: false,
        }
    );

    // loopback is no longer denied, but also not allowed
    assert_eq!(router.policy().decide("127.0.0.1".parse().unwrap()), Decision::Deny);

    // remote forward bypasses the deny list
    match router.route(Network::Tcp, sa("10.0.2.2:2222")) {
        RouteDecision::Accepted {
            target, forward, ..
        } => {
            assert_eq!(target, sa("192.168.1.10:22"));
            assert!(forward.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    // only for the protocol it was declared on
    assert!(matches!(
        router.route(Network::Udp, sa("10.0.2.2:2222")),
        RouteDecision::Rejected(_)
    ));
}

#[test]
fn default_policy_blocks_host_local_ranges() {
    let (_dir, path) = write_config("{}\n");
    let router = router_from(&path);

    for dst in [
        "127.0.0.1:22",
        "10.0.2.2:80",
        "169.254.169.254:80",
        "[::1]:22",
        "[fe80::1]:22",
        "[::ffff:127.0.0.1]:22",
    ] {
        assert!(
            matches!(router.route(Network::Tcp, sa(dst)), RouteDecision::Rejected(_)),
            "{} should be rejected",
            dst
        );
    }
    assert!(matches!(
        router.route(Network::Tcp, sa("93.184.216.34:443")),
        RouteDecision::Accepted { .. }
    ));
}

#[test]
fn udp_rpc_ports_close_after_reply() {
    let (_dir, path) = write_config("forwards:\n  remote: [\"udprpc://10.0.2.2:5300:127.0.0.1:5300\"]\n");
    let router = router_from(&path);

    let close = |dst: &str, network| match router.route(network, sa(dst)) {
        RouteDecision::Accepted { close_on_write, .. } => close_on_write,
        other => panic!("unexpected {:?}", other),
    };
    assert!(close("8.8.8.8:53", Network::Udp));
    assert!(close("192.0.2.1:123", Network::Udp));
    assert!(!close("8.8.8.8:443", Network::Udp));
    assert!(!close("8.8.8.8:53", Network::Tcp));
    assert!(close("10.0.2.2:5300", Network::Udp));
}

#[test]
fn invalid_files_are_rejected() {
    for body in [
        "forwards:\n  remote: [\"80:8080\", \"10.0.2.2:80:9090\"]\n",
        "forwards:\n  local: [\"2222:22\", \"tcp://2222:10.0.2.15:22\"]\n",
        "stack:\n  mtu: 0\n",
        "stack:\n  udp-session-timeout: 0\n",
        "policy:\n  allow: [\"not-a-prefix\"]\n",
        "forwards:\n  remote: [\"sctp://80:80\"]\n",
    ] {
        let (_dir, path) = write_config(body);
        assert!(load_config(&path).is_err(), "accepted: {}", body);
    }
}
