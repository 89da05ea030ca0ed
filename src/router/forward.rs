use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;

use crate::common::addr::{endpoint_key, parse_ip, parse_port, split_fields};
use crate::common::Network;

/// Default bind address of local-initiated (`-L`) forwards.
pub const LOCAL_DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
/// Default target of local-initiated forwards: the guest.
pub const LOCAL_DEFAULT_TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 100));
/// Default bind address of remote-initiated (`-R`) forwards: the gateway.
pub const REMOTE_DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2));
/// Default target of remote-initiated forwards: host loopback.
pub const REMOTE_DEFAULT_TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

/// Which side opens the forwarded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host clients connect to a host listener, the gateway dials the guest.
    LocalInitiated,
    /// The guest connects to a gateway address, the gateway dials the host.
    RemoteInitiated,
}

impl Direction {
    fn defaults(self) -> (IpAddr, IpAddr) {
        match self {
            Direction::LocalInitiated => (LOCAL_DEFAULT_BIND, LOCAL_DEFAULT_TARGET),
            Direction::RemoteInitiated => (REMOTE_DEFAULT_BIND, REMOTE_DEFAULT_TARGET),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::LocalInitiated => "local",
            Direction::RemoteInitiated => "remote",
        }
    }
}

/// One administrator-declared bind → target mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub network: Network,
    pub bind: SocketAddr,
    pub target: SocketAddr,
    /// Single-shot UDP session (close after the first reply).
    pub rpc: bool,
    pub direction: Direction,
}

impl ForwardSpec {
    /// Parse `[scheme://][bind_addr:]bind_port:[target_addr:]target_port`.
    ///
    /// ```text
    /// 8080:80                      bind_port:target_port
    /// 8080:10.0.2.15:80            bind_port:target_addr:target_port
    /// 10.0.2.2:53:53               bind_addr:bind_port:target_port
    /// udp://[2001:2::2]:53:[::1]:53
    /// ```
    pub fn parse(direction: Direction, text: &str) -> Result<Self> {
        let text = text.trim();
        let (network, rpc, rest) = match text.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" => (Network::Tcp, false, rest),
                "udp" => (Network::Udp, false, rest),
                "udprpc" => (Network::Udp, true, rest),
                other => anyhow::bail!("unknown forward scheme '{}' in '{}'", other, text),
            },
            None => (Network::Tcp, false, text),
        };

        let fields = split_fields(rest)
            .map_err(|e| anyhow::anyhow!("invalid forward '{}': {}", text, e))?;
        let (default_bind, default_target) = direction.defaults();

        let (bind_ip, bind_port, target_ip, target_port) = match fields.as_slice() {
            [bp, tp] => (default_bind, parse_port(bp)?, default_target, parse_port(tp)?),
            [first, second, third] => {
                if let Ok(bp) = first.parse::<u16>() {
                    (default_bind, bp, parse_ip(second)?, parse_port(third)?)
                } else {
                    (parse_ip(first)?, parse_port(second)?, default_target, parse_port(third)?)
                }
            }
            [ba, bp, ta, tp] => (parse_ip(ba)?, parse_port(bp)?, parse_ip(ta)?, parse_port(tp)?),
            _ => anyhow::bail!(
                "invalid forward '{}': expected [bind_addr:]bind_port:[target_addr:]target_port",
                text
            ),
        };

        Ok(Self {
            network,
            bind: SocketAddr::new(bind_ip, bind_port),
            target: SocketAddr::new(target_ip, target_port),
            rpc,
            direction,
        })
    }

    pub fn scheme(&self) -> &'static str {
        match (self.network, self.rpc) {
            (Network::Udp, true) => "udprpc",
            (network, _) => network.as_str(),
        }
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{} -> {}", self.scheme(), self.bind, self.target)
    }
}

/// Forward entries keyed by bind endpoint, one map per protocol, plus
/// the local-initiated entries that need host listeners.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Default)]
pub struct ForwardTable {
    tcp: HashMap<String, ForwardSpec>,
    udp: HashMap<String, ForwardSpec>,
    local: Vec<ForwardSpec>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(specs: impl IntoIterator<Item = ForwardSpec>) -> Result<Self> {
        let mut table = Self::new();
        for spec in specs {
            table.insert(spec)?;
        }
        Ok(table)
    }

    /// Parse `-L` and `-R` style strings into a table.
    pub fn from_strings<L, R>(local: &[L], remote: &[R]) -> Result<Self>
    where
        L: AsRef<str>,
        R: AsRef<str>,
    {
        let local = local
            .iter()
            .map(|s| ForwardSpec::parse(Direction::LocalInitiated, s.as_ref()));
        let remote = remote
            .iter()
            .map(|s| ForwardSpec::parse(Direction::RemoteInitiated, s.as_ref()));
        Self::build(local.chain(remote).collect::<Result<Vec<_>>>()?)
    }

    pub fn insert(&mut self, spec: ForwardSpec) -> Result<()> {
        match spec.direction {
            Direction::LocalInitiated => {
                if let Some(prev) = self
                    .local
                    .iter()
                    .find(|s| s.network == spec.network && s.bind == spec.bind)
                {
                    anyhow::bail!("duplicate local forward bind {} ({} and {})", spec.bind, prev, spec);
                }
                self.local.push(spec);
            }
            Direction::RemoteInitiated => {
                let key = endpoint_key(&spec.bind);
                let map = match spec.network {
                    Network::Tcp => &mut self.tcp,
                    Network::Udp => &mut self.udp,
                };
                if let Some(prev) = map.get(&key) {
                    anyhow::bail!("duplicate remote forward bind {} ({} and {})", key, prev, spec);
                }
                map.insert(key, spec);
            }
        }
        Ok(())
    }

    /// Remote-initiated entry whose bind endpoint is exactly `bind`.
    pub fn lookup(&self, network: Network, bind: &SocketAddr) -> Option<&ForwardSpec> {
        let map = match network {
            Network::Tcp => &self.tcp,
            Network::Udp => &self.udp,
        };
        map.get(&endpoint_key(bind))
    }

    pub fn local_specs(&self) -> &[ForwardSpec] {
        &self.local
    }

    pub fn remote_specs(&self) -> impl Iterator<Item = &ForwardSpec> {
        self.tcp.values().chain(self.udp.values())
    }

    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_two_fields_uses_direction_defaults() {
        let r = ForwardSpec::parse(Direction::RemoteInitiated, "8080:80").unwrap();
        assert_eq!(r.network, Network::Tcp);
        assert_eq!(r.bind, sa("10.0.2.2:8080"));
        assert_eq!(r.target, sa("127.0.0.1:80"));
        assert!(!r.rpc);

        let l = ForwardSpec::parse(Direction::LocalInitiated, "2222:22").unwrap();
        assert_eq!(l.bind, sa("127.0.0.1:2222"));
        assert_eq!(l.target, sa("10.0.2.100:22"));
    }

    #[test]
    fn parse_three_fields_numeric_first_is_bind_port() {
        let s = ForwardSpec::parse(Direction::RemoteInitiated, "80:192.168.1.5:8080").unwrap();
        assert_eq!(s.bind, sa("10.0.2.2:80"));
        assert_eq!(s.target, sa("192.168.1.5:8080"));

        let s = ForwardSpec::parse(Direction::RemoteInitiated, "10.0.2.100:80:8080").unwrap();
        assert_eq!(s.bind, sa("10.0.2.100:80"));
        assert_eq!(s.target, sa("127.0.0.1:8080"));
    }

    #[test]
    fn parse_schemes_and_ipv6() {
        let s = ForwardSpec::parse(Direction::RemoteInitiated, "udprpc://53:8.8.8.8:53").unwrap();
        assert_eq!(s.network, Network::Udp);
        assert!(s.rpc);
        assert_eq!(s.scheme(), "udprpc");

        let s = ForwardSpec::parse(
            Direction::RemoteInitiated,
            "udp://[2001:2::2]:53:[::1]:5353",
        )
        .unwrap();
        assert_eq!(s.network, Network::Udp);
        assert!(!s.rpc);
        assert_eq!(s.bind, sa("[2001:2::2]:53"));
        assert_eq!(s.target, sa("[::1]:5353"));
        assert_eq!(s.to_string(), "udp://[2001:2::2]:53 -> [::1]:5353");
    }

    #[test]
    fn parse_rejects_bad_input() {
        for bad in [
            "80",
            "sctp://80:80",
            "70000:80",
            "a:b:c:d:e",
            "80:example.com:80",
            "1.2.3.4:80:example.com:80",
            "tcp://",
        ] {
            assert!(
                ForwardSpec::parse(Direction::RemoteInitiated, bad).is_err(),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn lookup_is_per_protocol() {
        let table = ForwardTable::from_strings::<&str, &str>(
            &[],
            &["10.0.2.100:80:192.168.1.5:8080", "udp://53:1.1.1.1:53"],
        )
        .unwrap();

        let hit = table.lookup(Network::Tcp, &sa("10.0.2.100:80")).unwrap();
        assert_eq!(hit.target, sa("192.168.1.5:8080"));
        assert!(table.lookup(Network::Udp, &sa("10.0.2.100:80")).is_none());
        assert!(table.lookup(Network::Udp, &sa("10.0.2.2:53")).is_some());
        assert!(table.lookup(Network::Tcp, &sa("10.0.2.2:53")).is_none());
        assert!(table.lookup(Network::Tcp, &sa("10.0.2.100:81")).is_none());
    }

    #[test]
    fn lookup_folds_mapped_addresses() {
        let table = ForwardTable::from_strings::<&str, &str>(&[], &["80:8080"]).unwrap();
        assert!(table
            .lookup(Network::Tcp, &sa("[::ffff:10.0.2.2]:80"))
            .is_some());
    }

    #[test]
    fn duplicate_remote_bind_is_rejected() {
        let err = ForwardTable::from_strings::<&str, &str>(&[], &["80:8080", "10.0.2.2:80:9090"])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        // Same port on different protocols is fine.
        assert!(ForwardTable::from_strings::<&str, &str>(&[], &["53:53", "udp://53:53"]).is_ok());
    }

    #[test]
    fn local_specs_are_kept_separately() {
        let table = ForwardTable::from_strings(&["2222:22"], &["80:8080"]).unwrap();
        assert_eq!(table.local_specs().len(), 1);
        assert_eq!(table.remote_specs().count(), 1);
        assert_eq!(table.len(), 2);
        // Local specs never answer guest-side lookups.
        assert!(table.lookup(Network::Tcp, &sa("127.0.0.1:2222")).is_none());
    }
}
