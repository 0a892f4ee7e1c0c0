use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::error::{CadenceError, CadenceResult};

/// Top-level configuration for the cadence server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

/// Settings shared by every bucket, plus the bucket layout itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Default capacity in cost units. Buckets may override it.
    #[serde(default = "default_burst")]
    pub burst: f64,
    /// Default per-bucket entry cap applied by each eviction cycle.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entries idle for this long are dropped by the next eviction cycle.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
    /// Peers allowed to override the client address through forwarded headers.
    /// Each item is a bare IP address or a CIDR range.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Headers scanned, in order, for a proxy-supplied client address.
    #[serde(default = "default_forwarded_headers")]
    pub forwarded_headers: Vec<String>,
    #[serde(default = "default_buckets")]
    pub buckets: Vec<BucketConfig>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            max_entries: default_max_entries(),
            idle_ttl_secs: default_idle_ttl(),
            eviction_interval_secs: default_eviction_interval(),
            trusted_proxies: vec![],
            forwarded_headers: default_forwarded_headers(),
            buckets: default_buckets(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    pub strategy: BucketStrategy,
    /// Prefix length for `subnet` buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<u8>,
    /// Sustained budget in cost units per second.
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketStrategy {
    Subnet,
    UserAgent,
}

// Default value helpers
fn default_admin_listen() -> String {
    "127.0.0.1:29999".to_string()
}
fn default_burst() -> f64 {
    30.0
}
fn default_max_entries() -> usize {
    10_000
}
fn default_idle_ttl() -> u64 {
    60
}
fn default_eviction_interval() -> u64 {
    60
}
fn default_forwarded_headers() -> Vec<String> {
    vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()]
}
fn default_buckets() -> Vec<BucketConfig> {
    let subnet = |name: &str, netmask: u8, rate: f64| BucketConfig {
        name: name.to_string(),
        strategy: BucketStrategy::Subnet,
        netmask: Some(netmask),
        rate,
        burst: None,
        max_entries: None,
    };
    vec![
        subnet("slash32", 32, 1.0),
        subnet("slash24", 24, 2.0),
        subnet("slash16", 16, 4.0),
        BucketConfig {
            name: "user_agent".to_string(),
            strategy: BucketStrategy::UserAgent,
            netmask: None,
            rate: 2.0,
            burst: None,
            max_entries: None,
        },
    ]
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.admin.listen.parse::<SocketAddr>().is_err() {
            anyhow::bail!(
                "admin.listen '{}' is not a socket address",
                self.admin.listen
            );
        }
        self.ledger.validate()?;
        Ok(())
    }
}

impl LedgerConfig {
    /// Check every value the ledger's arithmetic depends on.
    ///
    /// Non-positive or non-finite rates and capacities are rejected rather
    /// than clamped, so a bad reload never reaches a running bucket.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.buckets.is_empty() {
            return Err(config_err("at least one bucket must be configured"));
        }
        if !is_positive(self.burst) {
            return Err(config_err(format!(
                "burst must be a positive number, got {}",
                self.burst
            )));
        }
        if self.max_entries == 0 {
            return Err(config_err("max_entries must be at least 1"));
        }
        if self.idle_ttl_secs == 0 {
            return Err(config_err("idle_ttl_secs must be at least 1"));
        }
        if self.eviction_interval_secs == 0 {
            return Err(config_err("eviction_interval_secs must be at least 1"));
        }

        self.trusted_networks()?;

        let mut names = HashSet::new();
        for bucket in &self.buckets {
            if bucket.name.is_empty() {
                return Err(config_err("bucket name must not be empty"));
            }
            if !names.insert(bucket.name.as_str()) {
                return Err(config_err(format!("duplicate bucket '{}'", bucket.name)));
            }
            if !is_positive(bucket.rate) {
                return Err(config_err(format!(
                    "bucket '{}': rate must be a positive number, got {}",
                    bucket.name, bucket.rate
                )));
            }
            let burst = self.burst_for(bucket);
            if !is_positive(burst) {
                return Err(config_err(format!(
                    "bucket '{}': burst must be a positive number, got {}",
                    bucket.name, burst
                )));
            }
            if self.max_entries_for(bucket) == 0 {
                return Err(config_err(format!(
                    "bucket '{}': max_entries must be at least 1",
                    bucket.name
                )));
            }
            match (bucket.strategy, bucket.netmask) {
                (BucketStrategy::Subnet, Some(bits)) if bits <= 32 => {}
                (BucketStrategy::Subnet, Some(bits)) => {
                    return Err(config_err(format!(
                        "bucket '{}': netmask /{} is out of range (0..=32)",
                        bucket.name, bits
                    )));
                }
                (BucketStrategy::Subnet, None) => {
                    return Err(config_err(format!(
                        "bucket '{}': subnet strategy requires a netmask",
                        bucket.name
                    )));
                }
                (BucketStrategy::UserAgent, Some(_)) => {
                    return Err(config_err(format!(
                        "bucket '{}': user_agent strategy does not take a netmask",
                        bucket.name
                    )));
                }
                (BucketStrategy::UserAgent, None) => {}
            }
        }

        Ok(())
    }

    /// Parse `trusted_proxies` into networks.
    ///
    /// Bare addresses are widened to /32 (IPv4) or /128 (IPv6).
    pub fn trusted_networks(&self) -> CadenceResult<Vec<IpNet>> {
        self.trusted_proxies
            .iter()
            .map(|item| {
                let trimmed = item.trim();
                if let Ok(network) = trimmed.parse::<IpNet>() {
                    Ok(network)
                } else if let Ok(addr) = trimmed.parse::<IpAddr>() {
                    let prefix = match addr {
                        IpAddr::V4(_) => 32,
                        IpAddr::V6(_) => 128,
                    };
                    IpNet::new(addr, prefix)
                        .map_err(|e| config_err(format!("invalid trusted proxy '{}': {}", item, e)))
                } else {
                    Err(config_err(format!("invalid trusted proxy '{}'", item)))
                }
            })
            .collect()
    }

    /// Effective capacity for a bucket, in cost units.
    pub fn burst_for(&self, bucket: &BucketConfig) -> f64 {
        bucket.burst.unwrap_or(self.burst)
    }

    /// Effective entry cap for a bucket.
    pub fn max_entries_for(&self, bucket: &BucketConfig) -> usize {
        bucket.max_entries.unwrap_or(self.max_entries)
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn config_err(message: impl Into<String>) -> CadenceError {
    CadenceError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
admin:
  listen: "0.0.0.0:29999"
ledger:
  burst: 20
  trusted_proxies: ["10.0.0.1", "10.1.0.0/16"]
  buckets:
    - { name: slash24, strategy: subnet, netmask: 24, rate: 1.5 }
    - { name: ua, strategy: user_agent, rate: 3, max_entries: 50 }
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        let ledger = &config.ledger;
        assert_eq!(ledger.burst, 20.0);
        assert_eq!(ledger.idle_ttl_secs, 60);
        assert_eq!(ledger.eviction_interval_secs, 60);
        assert_eq!(ledger.forwarded_headers, vec!["x-forwarded-for", "x-real-ip"]);
        assert_eq!(ledger.buckets.len(), 2);
        assert_eq!(ledger.buckets[0].strategy, BucketStrategy::Subnet);
        assert_eq!(ledger.buckets[0].netmask, Some(24));
        assert_eq!(ledger.buckets[1].strategy, BucketStrategy::UserAgent);
        assert_eq!(ledger.max_entries_for(&ledger.buckets[1]), 50);
        assert_eq!(ledger.max_entries_for(&ledger.buckets[0]), 10_000);
        assert_eq!(ledger.burst_for(&ledger.buckets[0]), 20.0);
    }

    #[test]
    fn default_config_is_valid() {
        let config = LedgerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.buckets.len(), 4);
        assert_eq!(config.burst, 30.0);
    }

    #[test]
    fn trusted_networks_accept_ips_and_cidrs() {
        let config = LedgerConfig {
            trusted_proxies: vec!["10.0.0.1".into(), "192.168.0.0/16".into(), "::1".into()],
            ..LedgerConfig::default()
        };
        let nets = config.trusted_networks().unwrap();
        assert_eq!(nets[0].to_string(), "10.0.0.1/32");
        assert_eq!(nets[1].to_string(), "192.168.0.0/16");
        assert_eq!(nets[2].to_string(), "::1/128");
    }

    #[test]
    fn rejects_bad_trusted_proxy() {
        let config = LedgerConfig {
            trusted_proxies: vec!["not-an-ip".into()],
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CadenceError::Config(_))));
    }

    #[test]
    fn rejects_non_positive_rate() {
        let mut config = LedgerConfig::default();
        config.buckets[0].rate = 0.0;
        assert!(config.validate().is_err());

        config.buckets[0].rate = f64::NAN;
        assert!(config.validate().is_err());

        config.buckets[0].rate = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_burst() {
        let mut config = LedgerConfig::default();
        config.buckets[1].burst = Some(0.0);
        assert!(config.validate().is_err());

        let config = LedgerConfig {
            burst: -5.0,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_netmask_combinations() {
        let mut config = LedgerConfig::default();
        config.buckets[0].netmask = Some(33);
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.buckets[0].netmask = None;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.buckets[3].netmask = Some(24);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_and_empty_layouts() {
        let mut config = LedgerConfig::default();
        config.buckets[1].name = "slash32".into();
        assert!(config.validate().is_err());

        let config = LedgerConfig {
            buckets: vec![],
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_caps_and_intervals() {
        let config = LedgerConfig {
            max_entries: 0,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LedgerConfig {
            eviction_interval_secs: 0,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_admin_listen() {
        let config = AppConfig {
            admin: AdminConfig {
                listen: "localhost".into(),
            },
            ledger: LedgerConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
