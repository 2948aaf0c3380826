//! Cluster and sync thread configuration.

use serde::{Deserialize, Serialize};

use crate::cluster::MAX_CLUSTER_CHAINS;
use crate::error::{ClusterError, ClusterResult};

/// Configuration for the synchronization thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncThrConfig {
    /// Capacity of the control message channel.
    pub channel_capacity: usize,
    /// Interval between re-checks while waiting for an acknowledgement.
    pub ack_poll_interval_ms: u64,
    /// Periodic driver wakeup; 0 parks until a message arrives.
    pub idle_interval_ms: u64,
}

impl Default for SyncThrConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            ack_poll_interval_ms: 1000,
            idle_interval_ms: 0,
        }
    }
}

/// Configuration for a filesystem instance's cluster layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Maximum number of replicas per cluster.
    pub max_chains: usize,
    /// Sync thread settings.
    pub syncthr: SyncThrConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_chains: MAX_CLUSTER_CHAINS,
            syncthr: SyncThrConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> ClusterResult<Self> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.max_chains == 0 || self.max_chains > MAX_CLUSTER_CHAINS {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "max_chains {} outside 1..={}",
                    self.max_chains, MAX_CLUSTER_CHAINS
                ),
            });
        }
        if self.syncthr.channel_capacity == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "syncthr.channel_capacity must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ClusterConfig::default();
        assert_eq!(config.max_chains, 8);
        assert_eq!(config.syncthr.channel_capacity, 64);
        assert_eq!(config.syncthr.ack_poll_interval_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = ClusterConfig::default();
        config.max_chains = 0;
        assert!(config.validate().is_err());
        config.max_chains = MAX_CLUSTER_CHAINS + 1;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.syncthr.channel_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ClusterError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_from_json_partial() {
        let config = ClusterConfig::from_json(r#"{"max_chains": 3, "syncthr": {"idle_interval_ms": 50}}"#)
            .unwrap();
        assert_eq!(config.max_chains, 3);
        assert_eq!(config.syncthr.idle_interval_ms, 50);
        assert_eq!(config.syncthr.channel_capacity, 64);
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(
            ClusterConfig::from_json("not json"),
            Err(ClusterError::ConfigParse(_))
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{"max_chains": 99}"#),
            Err(ClusterError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ClusterConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ClusterConfig::from_json(&json).unwrap(), config);
    }
}
