mod raid_group;
mod rekey;

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use raid_group::{KeyConfig, RaidGroupConfig, XtsKeyPair};
pub use rekey::RekeyConfig;

use crate::{rekey_error, Result};

/// Top-level configuration of the simulator binary.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default)]
    pub engine: RekeyConfig,
    pub raid_groups: Vec<RaidGroupConfig>,
    /// Key-encryption key file protecting the keys below.
    #[serde(default)]
    pub kek: Option<PathBuf>,
    /// Where the final status report is written, besides stdout.
    #[serde(default)]
    pub status_path: Option<PathBuf>,
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SimConfig = serde_yaml::from_str(&contents).map_err(|e| {
            rekey_error!(InvalidParameter {
                description: format!("Error parsing config file {}: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.raid_groups.is_empty() {
            return Err(rekey_error!(InvalidParameter {
                description: "At least one raid group must be configured".to_string(),
            }));
        }
        for (i, rg) in self.raid_groups.iter().enumerate() {
            rg.validate()?;
            self.engine.validate_for(&rg.geometry()?)?;
            if self.raid_groups[..i].iter().any(|other| other.id == rg.id) {
                return Err(rekey_error!(InvalidParameter {
                    description: format!("Duplicate raid group id {}", rg.id),
                }));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_sim_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "engine:\n  persist_interval_chunks: 2\nraid_groups:\n  - id: 1\n    raid_type: raid6\n    width: 6\n    chunk_count: 12\n  - id: 2\n    raid_type: raid1\n    width: 2\n    chunk_count: 4\n"
        )
        .unwrap();
        let config = SimConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.persist_interval_chunks, 2);
        assert_eq!(config.raid_groups.len(), 2);
        assert_eq!(config.raid_groups[0].chunks_per_paged_block, 64);
        assert!(config.kek.is_none());
    }

    #[test]
    fn test_duplicate_raid_group_ids_rejected() {
        let config: SimConfig = serde_yaml::from_str(
            "raid_groups:\n  - id: 1\n    raid_type: raid0\n    width: 2\n    chunk_count: 4\n  - id: 1\n    raid_type: raid0\n    width: 2\n    chunk_count: 4\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate raid group id 1"));
    }

    #[test]
    fn test_empty_raid_group_list_rejected() {
        let config: SimConfig = serde_yaml::from_str("raid_groups: []\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "raid_groups: 12").unwrap();
        let err = SimConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Error parsing config file"));
    }
}
