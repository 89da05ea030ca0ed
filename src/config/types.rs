use std::time::Duration;

use anyhow::Result;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;

use crate::common::DialerConfig;
use crate::router::forward::ForwardTable;
use crate::router::policy::AddressPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log: LogConfig,
    pub stack: StackConfig,
    pub policy: PolicyConfig,
    pub forwards: ForwardsConfig,
    pub dialer: DialerConfig,
    /// Seconds to wait for in-flight flows on shutdown.
    pub shutdown_grace: Option<u64>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.address_policy()?;
        self.forward_table()?;

        if self.stack.mtu == Some(0) {
            anyhow::bail!("stack.mtu must be greater than zero");
        }
        if self.stack.interface.is_empty() {
            anyhow::bail!("stack.interface must not be empty");
        }
        if self.stack.udp_session_timeout == 0 {
            anyhow::bail!("stack.udp-session-timeout must be greater than zero");
        }
        self.stack.gateway_v4_net()?;
        self.stack.gateway_v6_net()?;
        self.dialer.bind_ip()?;
        Ok(())
    }

    pub fn address_policy(&self) -> Result<AddressPolicy> {
        AddressPolicy::from_config(&self.policy)
    }

    pub fn forward_table(&self) -> Result<ForwardTable> {
        ForwardTable::from_strings(self.forwards.local.as_slice(), self.forwards.remote.as_slice())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace.unwrap_or(5))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `nsgate=debug`.
    pub level: Option<String>,
    /// File (or directory ending in `/`) to mirror log output into.
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StackConfig {
    /// Path of the network namespace to open the device in
    /// (e.g. `/proc/<pid>/ns/net`). Current namespace when unset.
    pub netns: Option<String>,
    pub interface: String,
    /// Overrides the MTU read from the interface.
    pub mtu: Option<u32>,
    pub gateway_v4: String,
    pub gateway_v6: String,
    /// Idle seconds before a UDP session is dropped.
    pub udp_session_timeout: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            netns: None,
            interface: "tun0".to_string(),
            mtu: None,
            gateway_v4: "10.0.2.2/24".to_string(),
            gateway_v6: "2001:2::2/32".to_string(),
            udp_session_timeout: 120,
        }
    }
}

impl StackConfig {
    pub fn gateway_v4_net(&self) -> Result<Ipv4Net> {
        self.gateway_v4
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid stack.gateway-v4 '{}': {}", self.gateway_v4, e))
    }

    pub fn gateway_v6_net(&self) -> Result<Ipv6Net> {
        self.gateway_v6
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid stack.gateway-v6 '{}': {}", self.gateway_v6, e))
    }

    pub fn udp_session_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_session_timeout)
    }
}

/// Prefix lists; a list that is present replaces the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub deny: Option<Vec<String>>,
    pub allow: Option<Vec<String>>,
}

/// Forward strings in `-L` / `-R` syntax.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwardsConfig {
    pub local: Vec<String>,
    pub remote: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_yml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.stack.interface, "tun0");
        assert_eq!(config.stack.udp_session_timeout, 120);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(
            config.stack.gateway_v4_net().unwrap().addr().to_string(),
            "10.0.2.2"
        );
        assert!(config.forward_table().unwrap().is_empty());
    }

    #[test]
    fn full_document() {
        let yaml = r#"
log:
  level: debug
stack:
  netns: /proc/1234/ns/net
  interface: tap9
  mtu: 1400
  udp-session-timeout: 30
policy:
  deny: ["10.0.0.0/8"]
forwards:
  local: ["2222:22"]
  remote: ["udprpc://53:8.8.8.8:53", "80:192.168.1.5:8080"]
dialer:
  connect-timeout: 2000
shutdown-grace: 1
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.stack.netns.as_deref(), Some("/proc/1234/ns/net"));
        assert_eq!(config.stack.mtu, Some(1400));
        assert_eq!(config.stack.udp_session_timeout(), Duration::from_secs(30));
        assert_eq!(config.address_policy().unwrap().deny_list().len(), 1);
        assert_eq!(config.forward_table().unwrap().len(), 3);
        assert_eq!(config.dialer.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(1));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cases = [
            "policy:\n  allow: [\"not-a-prefix\"]\n",
            "forwards:\n  remote: [\"80:8080\", \"80:9090\"]\n",
            "forwards:\n  local: [\"garbage\"]\n",
            "stack:\n  mtu: 0\n",
            "stack:\n  gateway-v4: \"10.0.2.2\"\n",
            "stack:\n  udp-session-timeout: 0\n",
            "dialer:\n  bind-address: \"nope\"\n",
        ];
        for yaml in cases {
            let config: Config = serde_yml::from_str(yaml).unwrap();
            assert!(config.validate().is_err(), "{}", yaml);
        }
    }
}
