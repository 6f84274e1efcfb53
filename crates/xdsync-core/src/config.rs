//! Configuration types for xdsync

use crate::error::{Result, XdsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_CLUSTER_ID: &str = "Kubernetes";

const POD_NAME_ENV: &str = "POD_NAME";
const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
const INSTANCE_IP_ENV: &str = "INSTANCE_IP";

/// How the engine answers a response whose resources failed to decode
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge every response, decodable or not
    #[default]
    AlwaysAck,

    /// Reject responses containing undecodable resources
    NackOnDecodeError,
}

/// Main configuration for the discovery client
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct XdsConfig {
    /// Whether durable subscriptions are re-fetched periodically
    pub polling_enabled: bool,

    /// Fixed resync interval
    #[serde(with = "duration_secs")]
    pub polling_interval: Duration,

    /// Maximum resync ticks firing at once
    pub polling_pool_size: usize,

    /// Default bound on a blocking fetch
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Log every response and acknowledgement at info level
    pub log_xds: bool,

    pub ack_policy: AckPolicy,

    /// Node identity inputs
    pub node: NodeConfig,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            polling_enabled: true,
            polling_interval: Duration::from_secs(30),
            polling_pool_size: 10,
            request_timeout: Duration::from_secs(30),
            log_xds: true,
            ack_policy: AckPolicy::AlwaysAck,
            node: NodeConfig::default(),
        }
    }
}

impl XdsConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    /// and unknown fields are ignored
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling_interval.is_zero() {
            return Err(XdsError::Config("polling_interval must be positive".into()));
        }
        if self.polling_pool_size == 0 {
            return Err(XdsError::Config("polling_pool_size must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(XdsError::Config("request_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Inputs for the node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub pod_name: String,
    pub namespace: String,
    pub pod_ip: String,
    pub cluster_id: String,
    pub metadata: BTreeMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pod_name: env_or(POD_NAME_ENV, "xdsync"),
            namespace: env_or(POD_NAMESPACE_ENV, DEFAULT_NAMESPACE),
            pod_ip: env_or(INSTANCE_IP_ENV, "127.0.0.1"),
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
