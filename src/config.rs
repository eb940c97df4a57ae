use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::constants;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub inputs: InputConfig,
    pub outputs: OutputConfig,
    /// Pinned materialization timestamp for reproducible table contents.
    /// When absent, each run stamps the wall clock at extraction time.
    #[serde(default)]
    pub load_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub wide_csv: PathBuf,
    pub institutions_csv: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub processed_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inputs: InputConfig {
                wide_csv: PathBuf::from("data/raw/ipeds/grad_rates_2004_2023.csv"),
                institutions_csv: PathBuf::from("data/raw/ipeds/institutions.csv"),
            },
            outputs: OutputConfig {
                processed_dir: PathBuf::from("data/processed/canonical"),
            },
            load_ts: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an explicit path, or fall back to
    /// `config.toml` in the working directory, or built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let default_path = Path::new("config.toml");
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn long_table_path(&self) -> PathBuf {
        self.outputs.processed_dir.join(constants::LONG_TABLE_FILE)
    }

    pub fn latest_table_path(&self) -> PathBuf {
        self.outputs.processed_dir.join(constants::LATEST_TABLE_FILE)
    }

    pub fn summary_table_path(&self) -> PathBuf {
        self.outputs.processed_dir.join(constants::SUMMARY_TABLE_FILE)
    }

    pub fn provenance_path(&self) -> PathBuf {
        self.outputs.processed_dir.join(constants::PROVENANCE_FILE)
    }

    pub fn missing_metadata_path(&self) -> PathBuf {
        self.outputs
            .processed_dir
            .join(constants::MISSING_METADATA_FILE)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.outputs.processed_dir.join(constants::RUN_LOG_FILE)
    }

    pub fn run_marker_path(&self) -> PathBuf {
        self.outputs.processed_dir.join(constants::RUN_MARKER_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_paths_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[inputs]\nwide_csv = \"wide.csv\"\ninstitutions_csv = \"hd.csv\"\n\n[outputs]\nprocessed_dir = \"out\"\n"
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.inputs.wide_csv, PathBuf::from("wide.csv"));
        assert_eq!(config.outputs.processed_dir, PathBuf::from("out"));
        assert!(config.load_ts.is_none());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = PipelineConfig::load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn output_paths_join_the_processed_dir() {
        let config = PipelineConfig::default();
        assert!(config
            .long_table_path()
            .ends_with("canonical/ipeds_grad_rates_long.parquet"));
        assert!(config.run_marker_path().ends_with("canonical/.run_in_progress"));
    }
}
