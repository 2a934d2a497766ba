use std::path::{Path, PathBuf};

use clap::Args;
use log::info;

use crate::config::SimConfig;
use crate::sim::{default_config, Scenario, ScenarioReport, SimRunner};
use crate::{rekey_error, KeyEncryptionCipher, Result};

#[derive(Args, Debug, Clone)]
/// Common command-line arguments of the simulator binaries.
pub struct CommonArgs {
    /// Path to the configuration YAML file. Built-in demo raid groups are
    /// used when absent.
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Path to the key encryption key file. Overrides `kek` in the config.
    #[arg(short = 'k', long = "kek")]
    pub kek: Option<PathBuf>,
}

pub fn load_config_and_kek(common: &CommonArgs) -> Result<(SimConfig, KeyEncryptionCipher)> {
    let config = match &common.config {
        Some(path) => SimConfig::load(path)?,
        None => {
            info!("No config file given, using built-in raid groups");
            default_config()
        }
    };
    let kek_path = common.kek.as_deref().or(config.kek.as_deref());
    let kek = KeyEncryptionCipher::load(kek_path)?;
    Ok((config, kek))
}

/// Runs `scenario`, or every scenario when `None`, in order.
pub fn run_scenarios(
    config: SimConfig,
    kek: KeyEncryptionCipher,
    scenario: Option<Scenario>,
) -> Result<Vec<ScenarioReport>> {
    let runner = SimRunner::new(config, kek)?;
    match scenario {
        Some(scenario) => Ok(vec![runner.run(scenario)?]),
        None => runner.run_all(),
    }
}

pub fn write_status(path: &Path, reports: &[ScenarioReport]) -> Result<()> {
    let json = serde_json::to_string_pretty(reports).map_err(|e| {
        rekey_error!(InvalidParameter {
            description: format!("Failed to encode status report: {e}"),
        })
    })?;
    std::fs::write(path, json)?;
    info!("Status written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_config() {
        let common = CommonArgs {
            config: None,
            kek: None,
        };
        let (config, _) = load_config_and_kek(&common).unwrap();
        assert_eq!(config, default_config());
    }

    #[test]
    fn test_config_file_loaded() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "engine:\n  workers: 3\nraid_groups:\n  - id: 7\n    raid_type: raid5\n    width: 3\n    chunk_count: 4\n",
        )
        .unwrap();
        let common = CommonArgs {
            config: Some(file.path().to_path_buf()),
            kek: None,
        };
        let (config, _) = load_config_and_kek(&common).unwrap();
        assert_eq!(config.engine.workers, 3);
        assert_eq!(config.raid_groups[0].id, 7);
    }

    #[test]
    fn test_missing_kek_file_fails() {
        let common = CommonArgs {
            config: None,
            kek: Some(PathBuf::from("/nonexistent/kek.yaml")),
        };
        assert!(load_config_and_kek(&common).is_err());
    }

    #[test]
    fn test_write_status() {
        let file = NamedTempFile::new().unwrap();
        write_status(file.path(), &[]).unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "[]");
    }
}
