use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::Result;

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => anyhow::bail!("unsupported network: {}", other),
        }
    }
}

/// Key used by the forward table: the display form of the endpoint.
///
/// IPv4-mapped IPv6 addresses are folded to plain IPv4 first so that
/// `[::ffff:10.0.2.2]:53` and `10.0.2.2:53` name the same bind endpoint.
pub fn endpoint_key(addr: &SocketAddr) -> String {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port()).to_string()
}

/// IPv4-mapped IPv6 → IPv4, everything else unchanged.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Split `a:b:c` style text on colons, keeping bracketed IPv6 literals
/// (`[2001:db8::1]`) together as one field without the brackets.
pub fn split_fields(s: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut rest = s;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after
                .find(']')
                .ok_or_else(|| anyhow::anyhow!("unterminated '[' in '{}'", s))?;
            fields.push(after[..end].to_string());
            rest = &after[end + 1..];
            match rest.strip_prefix(':') {
                Some(r) => rest = r,
                None if rest.is_empty() => {}
                None => anyhow::bail!("expected ':' after ']' in '{}'", s),
            }
            continue;
        }

        match rest.find(':') {
            Some(i) => {
                fields.push(rest[..i].to_string());
                rest = &rest[i + 1..];
                if rest.is_empty() {
                    anyhow::bail!("trailing ':' in '{}'", s);
                }
            }
            None => {
                fields.push(rest.to_string());
                rest = "";
            }
        }
    }

    if fields.iter().any(|f| f.is_empty()) {
        anyhow::bail!("empty field in '{}'", s);
    }
    Ok(fields)
}

pub fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|e| anyhow::anyhow!("invalid port '{}': {}", s, e))
}

pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse::<IpAddr>()
        .map_err(|e| anyhow::anyhow!("invalid IP address '{}': {}", s, e))
}
