//! Cluster discovery and join configuration

use crate::config::duration_millis;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Used when neither a bootstrap address nor a DNS name is configured
pub const DEFAULT_BOOTSTRAP_ADDRESS: &str = "localhost:5701";
pub const DEFAULT_PORT: u16 = 5701;
pub const DEFAULT_CLUSTER_NAME_PREFIX: &str = "history";

/// Ports tried when auto-increment is on: `port .. port + port_count`
pub const DEFAULT_PORT_COUNT: u16 = 100;
pub const PORT_COUNT_MAX: u16 = 1000;

pub const JOIN_ATTEMPTS_DEFAULT: u32 = 3;
pub const JOIN_ATTEMPTS_MAX: u32 = 20;

const CONNECT_TIMEOUT_MS_DEFAULT: u64 = 2_000;
const BACKOFF_BASE_MS_DEFAULT: u64 = 200;
const BACKOFF_MAX_MS_DEFAULT: u64 = 5_000;

/// How this node finds its peers, decided once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "target", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// Explicit `host:port` of an existing member
    Static(String),
    /// Symbolic name resolved to peer addresses (Kubernetes headless service)
    Dns(String),
    /// Built-in bootstrap address, falling back to a cluster of one
    Default,
}

impl DiscoveryStrategy {
    /// Pick the discovery mode; both modes at once is a configuration error
    pub fn from_settings(bootstrap_address: Option<&str>, dns_name: Option<&str>) -> Result<Self> {
        let bootstrap_address = bootstrap_address.map(str::trim).filter(|s| !s.is_empty());
        let dns_name = dns_name.map(str::trim).filter(|s| !s.is_empty());

        match (bootstrap_address, dns_name) {
            (Some(addr), Some(name)) => Err(Error::invalid_config(format!(
                "bootstrap address '{}' and DNS name '{}' are both set; configure one discovery mode",
                addr, name
            ))),
            (Some(addr), None) => {
                if !addr.contains(':') {
                    return Err(Error::invalid_config(format!(
                        "bootstrap address '{}' must be host:port",
                        addr
                    )));
                }
                Ok(DiscoveryStrategy::Static(addr.to_string()))
            }
            (None, Some(name)) => Ok(DiscoveryStrategy::Dns(name.to_string())),
            (None, None) => Ok(DiscoveryStrategy::Default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub bootstrap_address: Option<String>,
    pub dns_name: Option<String>,
    /// Membership listener port
    pub port: u16,
    pub port_auto_increment: bool,
    pub port_count: u16,
    /// Cluster name; peers with a different name are rejected
    pub cluster_name_prefix: String,
    /// Interface the membership listener binds to
    pub bind_host: String,
    /// Host announced to peers; defaults to `bind_host`
    pub advertise_host: Option<String>,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    pub join_attempts: u32,
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            bootstrap_address: None,
            dns_name: None,
            port: DEFAULT_PORT,
            port_auto_increment: true,
            port_count: DEFAULT_PORT_COUNT,
            cluster_name_prefix: DEFAULT_CLUSTER_NAME_PREFIX.to_string(),
            bind_host: "0.0.0.0".to_string(),
            advertise_host: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS_DEFAULT),
            join_attempts: JOIN_ATTEMPTS_DEFAULT,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS_DEFAULT),
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS_DEFAULT),
        }
    }
}

impl ClusterConfig {
    /// Loopback-only config with short timeouts
    pub fn test() -> Self {
        ClusterConfig {
            bind_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_millis(500),
            join_attempts: 2,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            ..Default::default()
        }
    }

    pub fn discovery(&self) -> Result<DiscoveryStrategy> {
        DiscoveryStrategy::from_settings(self.bootstrap_address.as_deref(), self.dns_name.as_deref())
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name_prefix
    }

    pub fn advertise_host(&self) -> &str {
        match self.advertise_host.as_deref() {
            Some(host) => host,
            None if self.bind_host == "0.0.0.0" => "127.0.0.1",
            None => &self.bind_host,
        }
    }

    /// Number of ports the listener may try
    pub fn bind_attempts(&self) -> u16 {
        if self.port_auto_increment && self.port != 0 {
            self.port_count.clamp(1, PORT_COUNT_MAX)
        } else {
            1
        }
    }

    /// Delay before join round `attempt` (0-based): base * 2^attempt, capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    pub fn validate(&self) -> Result<()> {
        self.discovery()?;
        if self.cluster_name_prefix.trim().is_empty() {
            return Err(Error::invalid_config("cluster name prefix must not be empty"));
        }
        if self.port_auto_increment && self.port_count == 0 {
            return Err(Error::invalid_config("port_count must be positive with port auto-increment"));
        }
        if self.join_attempts == 0 || self.join_attempts > JOIN_ATTEMPTS_MAX {
            return Err(Error::invalid_config(format!(
                "join_attempts must be in 1..={}, got {}",
                JOIN_ATTEMPTS_MAX, self.join_attempts
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect timeout must be positive"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::invalid_config("backoff base exceeds backoff max"));
        }
        self.verify_invariants();
        Ok(())
    }

    #[inline]
    fn verify_invariants(&self) {
        debug_assert!(
            self.bootstrap_address.is_none() || self.dns_name.is_none(),
            "Invariant: at most one discovery mode"
        );
        debug_assert!(
            self.port_count <= PORT_COUNT_MAX || !self.port_auto_increment,
            "Invariant: port_count {} exceeds max {}",
            self.port_count,
            PORT_COUNT_MAX
        );
        debug_assert!(
            self.join_attempts <= JOIN_ATTEMPTS_MAX,
            "Invariant: join_attempts {} exceeds max {}",
            self.join_attempts,
            JOIN_ATTEMPTS_MAX
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_discovery() {
        let config = ClusterConfig::default();
        assert_eq!(config.discovery().unwrap(), DiscoveryStrategy::Default);
        assert_eq!(config.port, 5701);
        assert!(config.port_auto_increment);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_static_and_dns_modes() {
        assert_eq!(
            DiscoveryStrategy::from_settings(Some("10.0.0.1:5701"), None).unwrap(),
            DiscoveryStrategy::Static("10.0.0.1:5701".to_string())
        );
        assert_eq!(
            DiscoveryStrategy::from_settings(None, Some("history.default.svc.cluster.local")).unwrap(),
            DiscoveryStrategy::Dns("history.default.svc.cluster.local".to_string())
        );
        // Blank values count as unset
        assert_eq!(
            DiscoveryStrategy::from_settings(Some("  "), Some("")).unwrap(),
            DiscoveryStrategy::Default
        );
    }

    #[test]
    fn test_conflicting_discovery_is_rejected() {
        let config = ClusterConfig {
            bootstrap_address: Some("localhost:5701".to_string()),
            dns_name: Some("history".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_bootstrap_requires_port() {
        assert!(DiscoveryStrategy::from_settings(Some("localhost"), None).is_err());
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = ClusterConfig::default();
        assert_eq!(config.backoff_for(0), Duration::from_millis(200));
        assert_eq!(config.backoff_for(1), Duration::from_millis(400));
        assert_eq!(config.backoff_for(3), Duration::from_millis(1_600));
        assert_eq!(config.backoff_for(10), Duration::from_millis(5_000));
        assert_eq!(config.backoff_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_bind_attempts() {
        let mut config = ClusterConfig::default();
        assert_eq!(config.bind_attempts(), DEFAULT_PORT_COUNT);
        config.port_auto_increment = false;
        assert_eq!(config.bind_attempts(), 1);
        config.port_auto_increment = true;
        config.port = 0;
        assert_eq!(config.bind_attempts(), 1);
    }

    #[test]
    fn test_serde_roundtrip_with_durations() {
        let config = ClusterConfig::test();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"connect_timeout\":500"));
        let parsed: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
