use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::raid::{RaidGeometry, RaidType};
use crate::{rekey_error, Result};

/// Engine tuning shared by every raid group a scheduler runs.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RekeyConfig {
    /// Chunks completed between two writes of the nonpaged checkpoint.
    #[serde(default = "default_persist_interval_chunks")]
    pub persist_interval_chunks: u64,
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
    #[serde(default = "default_peer_ack_timeout_ms")]
    pub peer_ack_timeout_ms: u64,
    #[serde(default = "default_peer_propagation_interval_chunks")]
    pub peer_propagation_interval_chunks: u64,
    #[serde(default = "default_rebuild_timeout_ms")]
    pub rebuild_timeout_ms: u64,
    #[serde(default = "default_paged_retry_delay_ms")]
    pub paged_retry_delay_ms: u64,
    /// Degraded positions each raid type may carry while rekey keeps going.
    #[serde(default = "default_degraded_tolerance")]
    pub degraded_tolerance: BTreeMap<RaidType, usize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            persist_interval_chunks: default_persist_interval_chunks(),
            io_retries: default_io_retries(),
            io_timeout_ms: default_io_timeout_ms(),
            quiesce_timeout_ms: default_quiesce_timeout_ms(),
            peer_ack_timeout_ms: default_peer_ack_timeout_ms(),
            peer_propagation_interval_chunks: default_peer_propagation_interval_chunks(),
            rebuild_timeout_ms: default_rebuild_timeout_ms(),
            paged_retry_delay_ms: default_paged_retry_delay_ms(),
            degraded_tolerance: default_degraded_tolerance(),
            workers: default_workers(),
        }
    }
}

impl RekeyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.persist_interval_chunks == 0 {
            return Err(rekey_error!(InvalidParameter {
                description: "persist_interval_chunks must be at least 1".to_string(),
            }));
        }
        if self.peer_propagation_interval_chunks == 0 {
            return Err(rekey_error!(InvalidParameter {
                description: "peer_propagation_interval_chunks must be at least 1".to_string(),
            }));
        }
        if self.io_retries > 100 {
            return Err(rekey_error!(InvalidParameter {
                description: format!("io_retries {} is out of range (must be 0..=100)", self.io_retries),
            }));
        }
        for (name, value) in [
            ("io_timeout_ms", self.io_timeout_ms),
            ("quiesce_timeout_ms", self.quiesce_timeout_ms),
            ("peer_ack_timeout_ms", self.peer_ack_timeout_ms),
            ("rebuild_timeout_ms", self.rebuild_timeout_ms),
        ] {
            if value == 0 {
                return Err(rekey_error!(InvalidParameter {
                    description: format!("{name} must be non-zero"),
                }));
            }
        }
        if self.workers == 0 || self.workers > 64 {
            return Err(rekey_error!(InvalidParameter {
                description: format!("workers {} is out of range (must be 1..=64)", self.workers),
            }));
        }
        Ok(())
    }

    /// Checks the tolerance entry for `geometry` against what its raid type
    /// can actually survive.
    pub fn validate_for(&self, geometry: &RaidGeometry) -> Result<()> {
        let tolerance = self.rekey_tolerance(geometry.raid_type);
        if tolerance != 0 && tolerance >= geometry.fault_tolerance() {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "degraded_tolerance {tolerance} for {} must stay below its fault tolerance {}",
                    geometry.raid_type,
                    geometry.fault_tolerance()
                ),
            }));
        }
        Ok(())
    }

    pub fn rekey_tolerance(&self, raid_type: RaidType) -> usize {
        self.degraded_tolerance.get(&raid_type).copied().unwrap_or(0)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    pub fn peer_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_ack_timeout_ms)
    }

    pub fn rebuild_timeout(&self) -> Duration {
        Duration::from_millis(self.rebuild_timeout_ms)
    }

    pub fn paged_retry_delay(&self) -> Duration {
        Duration::from_millis(self.paged_retry_delay_ms)
    }
}

fn default_persist_interval_chunks() -> u64 {
    8
}

fn default_io_retries() -> u32 {
    5
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_quiesce_timeout_ms() -> u64 {
    10_000
}

fn default_peer_ack_timeout_ms() -> u64 {
    5_000
}

fn default_peer_propagation_interval_chunks() -> u64 {
    4
}

fn default_rebuild_timeout_ms() -> u64 {
    3_600_000
}

fn default_paged_retry_delay_ms() -> u64 {
    100
}

fn default_degraded_tolerance() -> BTreeMap<RaidType, usize> {
    BTreeMap::from([(RaidType::Raid6, 1)])
}

fn default_workers() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rekey_config_is_valid() {
        let config = RekeyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rekey_tolerance(RaidType::Raid6), 1);
        assert_eq!(config.rekey_tolerance(RaidType::Raid5), 0);
    }

    #[test]
    fn rekey_config_fills_defaults_from_yaml() {
        let config: RekeyConfig = serde_yaml::from_str("io_retries: 2\npersist_interval_chunks: 1\n").unwrap();
        assert_eq!(config.io_retries, 2);
        assert_eq!(config.persist_interval_chunks, 1);
        assert_eq!(config.quiesce_timeout_ms, 10_000);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn rekey_config_rejects_unknown_fields() {
        let res: std::result::Result<RekeyConfig, _> = serde_yaml::from_str("bogus: 1\n");
        assert!(res.is_err());
    }

    #[test]
    fn rekey_config_rejects_zero_intervals() {
        let config = RekeyConfig {
            persist_interval_chunks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RekeyConfig {
            quiesce_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RekeyConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rekey_config_rejects_tolerance_beyond_redundancy() {
        let geometry = RaidGeometry::new(RaidType::Raid5, 5, 8, 4).unwrap();
        let mut config = RekeyConfig::default();
        assert!(config.validate_for(&geometry).is_ok());
        config.degraded_tolerance.insert(RaidType::Raid5, 1);
        assert!(config.validate_for(&geometry).is_err());

        let raid6 = RaidGeometry::new(RaidType::Raid6, 6, 8, 4).unwrap();
        assert!(config.validate_for(&raid6).is_ok());
    }
}
