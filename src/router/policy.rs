use std::fmt;
use std::net::IpAddr;

use anyhow::Result;
use ipnet::IpNet;

use crate::common::addr::canonical_ip;
use crate::config::types::PolicyConfig;

/// Non-routable and reserved ranges that must never be reached from
/// inside the namespace unless a forward says so.
///
/// See https://idea.popcount.org/2019-12-06-addressing/
pub const DEFAULT_DENY: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "::/96",
    "::ffff:0:0:0/96",
    "64:ff9b::/96",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
    "fec0::/10",
];

pub const DEFAULT_ALLOW: &[&str] = &["0.0.0.0/0", "::/0"];

/// 防火墙判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny,
}

/// Why a destination was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Destination is inside this deny prefix.
    Denied(IpNet),
    /// Destination matched no allow prefix.
    NotAllowed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Denied(net) => write!(f, "denied by {}", net),
            RejectReason::NotAllowed => f.write_str("not in allow list"),
        }
    }
}

/// Ordered deny and allow prefix lists, evaluated deny-before-allow.
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    deny: Vec<IpNet>,
    allow: Vec<IpNet>,
}

impl AddressPolicy {
    pub fn new(deny: Vec<IpNet>, allow: Vec<IpNet>) -> Self {
        Self { deny, allow }
    }

    pub fn with_defaults() -> Self {
        // DEFAULT_* are literals covered by tests.
        Self {
            deny: parse_prefixes(DEFAULT_DENY).unwrap_or_default(),
            allow: parse_prefixes(DEFAULT_ALLOW).unwrap_or_default(),
        }
    }

    /// Lists given in the config replace the defaults wholesale.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let deny = match &config.deny {
            Some(list) => parse_prefixes(list.as_slice())?,
            None => parse_prefixes(DEFAULT_DENY)?,
        };
        let allow = match &config.allow {
            Some(list) => parse_prefixes(list.as_slice())?,
            None => parse_prefixes(DEFAULT_ALLOW)?,
        };
        Ok(Self::new(deny, allow))
    }

    pub fn decide(&self, dst: IpAddr) -> Decision {
        match self.check(dst) {
            Ok(_) => Decision::Permit,
            Err(_) => Decision::Deny,
        }
    }

    /// Deny list first, then the allow list. Returns the allow prefix that
    /// admitted `dst`, or why it was refused.
    pub fn check(&self, dst: IpAddr) -> Result<&IpNet, RejectReason> {
        if let Some(net) = self.matching_deny(dst) {
            return Err(RejectReason::Denied(*net));
        }
        self.matching_allow(dst).ok_or(RejectReason::NotAllowed)
    }

    /// First deny prefix containing `dst`, in declared order.
    pub fn matching_deny(&self, dst: IpAddr) -> Option<&IpNet> {
        first_match(&self.deny, dst)
    }

    /// First allow prefix containing `dst`, in declared order.
    pub fn matching_allow(&self, dst: IpAddr) -> Option<&IpNet> {
        first_match(&self.allow, dst)
    }

    pub fn deny_list(&self) -> &[IpNet] {
        &self.deny
    }

    pub fn allow_list(&self) -> &[IpNet] {
        &self.allow
    }
}

impl Default for AddressPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Display for AddressPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |v: &[IpNet]| {
            v.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(f, "deny({}) allow({})", join(&self.deny), join(&self.allow))
    }
}

fn first_match(nets: &[IpNet], dst: IpAddr) -> Option<&IpNet> {
    let folded = canonical_ip(dst);
    nets.iter()
        .find(|net| net.contains(&dst) || (folded != dst && net.contains(&folded)))
}

pub fn parse_prefixes<S: AsRef<str>>(values: &[S]) -> Result<Vec<IpNet>> {
    values
        .iter()
        .map(|s| {
            let s = s.as_ref().trim();
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                .map_err(|e| anyhow::anyhow!("invalid network prefix '{}': {}", s, e))
        })
        .collect()
}
