//! Analysis configuration, persisted as TOML.
//!
//! ```toml
//! [cohort]
//! behavior_csv = "VAST_Data_Fluency.csv"
//! lesion_dir = "lesions"
//! max_score = 4.0
//! regress_lesion_volume = true
//!
//! [filter]
//! min_patient_count = "10%"
//! normalize = true
//!
//! [search]
//! c = [50.0, 40.0, 30.0]
//! gamma = [10.0, 5.0]
//! epsilon = [0.1]
//! n_splits = 5
//!
//! [permutation]
//! n_permutations = 1000
//!
//! [output]
//! directory = "results"
//! ```
//!
//! Relative paths are taken relative to the working directory.

use crate::grid_search::Parallelism;
use crate::types::ParamGrid;
use crate::voxel_filter::MinPatientCount;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub cohort: CohortConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub permutation: PermutationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CohortConfig {
    /// Table with `filename` and `behavior` columns; further columns are
    /// covariates.
    pub behavior_csv: PathBuf,
    /// Directory the `filename` column is resolved against.
    pub lesion_dir: PathBuf,
    /// Brain mask volume. The full grid of the first lesion is used when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<PathBuf>,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    #[serde(default = "default_true")]
    pub regress_lesion_volume: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_min_patient_count")]
    pub min_patient_count: MinPatientCount,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_patient_count: default_min_patient_count(),
            normalize: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(flatten)]
    pub grid: ParamGrid,
    #[serde(default = "default_n_splits")]
    pub n_splits: usize,
    #[serde(default)]
    pub parallelism: Parallelism,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermutationConfig {
    #[serde(default = "default_n_permutations")]
    pub n_permutations: usize,
    /// Base seed for reproducible permutations. Unseeded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub parallelism: Parallelism,
}

impl Default for PermutationConfig {
    fn default() -> Self {
        Self {
            n_permutations: default_n_permutations(),
            seed: None,
            parallelism: Parallelism::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    /// Reported in the summary only; the thresholded maps always use the
    /// fixed level table.
    #[serde(default = "default_significance_level")]
    pub significance_level: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            significance_level: default_significance_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_patient_count() -> MinPatientCount {
    MinPatientCount::Percent(10.0)
}

fn default_max_score() -> f64 {
    100.0
}

fn default_n_splits() -> usize {
    5
}

fn default_n_permutations() -> usize {
    1000
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("svrlsm_output")
}

fn default_significance_level() -> f64 {
    0.05
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cohort: CohortConfig {
                behavior_csv: PathBuf::from("behavior.csv"),
                lesion_dir: PathBuf::from("lesions"),
                mask: None,
                max_score: default_max_score(),
                regress_lesion_volume: true,
            },
            filter: FilterConfig::default(),
            search: SearchConfig {
                grid: ParamGrid {
                    c: vec![50.0, 40.0, 30.0, 20.0, 10.0, 5.0],
                    gamma: vec![10.0, 5.0, 4.0, 3.0, 2.0, 1.0],
                    epsilon: vec![0.1],
                },
                n_splits: default_n_splits(),
                parallelism: Parallelism::default(),
            },
            permutation: PermutationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        Ok(config)
    }

    /// Rejects configurations under which no valid analysis can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));
        let grid = &self.search.grid;

        if let Some(axis) = grid.first_empty_axis() {
            return invalid(format!("search.{} must list at least one value", axis.to_lowercase()));
        }
        if let Some((axis, value)) = grid.first_invalid_value() {
            let requirement = if axis == "epsilon" { "non-negative" } else { "positive" };
            return invalid(format!(
                "search.{} values must be {requirement}, found {value}",
                axis.to_lowercase()
            ));
        }
        if self.search.n_splits < 2 {
            return invalid(format!(
                "search.n_splits must be at least 2, found {}",
                self.search.n_splits
            ));
        }
        if self.permutation.n_permutations == 0 {
            return invalid("permutation.n_permutations must be positive".into());
        }
        if !(self.cohort.max_score.is_finite() && self.cohort.max_score > 0.0) {
            return invalid(format!(
                "cohort.max_score must be positive, found {}",
                self.cohort.max_score
            ));
        }
        let alpha = self.output.significance_level;
        if !(alpha > 0.0 && alpha < 1.0) {
            return invalid(format!(
                "output.significance_level must lie in (0, 1), found {alpha}"
            ));
        }
        if let MinPatientCount::Percent(percent) = self.filter.min_patient_count {
            if !percent.is_finite() {
                return invalid("filter.min_patient_count percentage must be finite".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_survives_a_save_load_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analysis.toml");
        let mut config = AnalysisConfig::default();
        config.permutation.seed = Some(17);
        config.cohort.mask = Some(PathBuf::from("mask.txt.gz"));
        config.save(&path).unwrap();

        let loaded = AnalysisConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn minimal_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analysis.toml");
        std::fs::write(
            &path,
            r#"
[cohort]
behavior_csv = "scores.csv"
lesion_dir = "lesions"
max_score = 4.0

[filter]
min_patient_count = 5

[search]
c = [50.0]
gamma = [2.0]
epsilon = [0.1]
parallelism = "sequential"
"#,
        )
        .unwrap();
        let config = AnalysisConfig::load(&path).unwrap();
        assert_eq!(config.filter.min_patient_count, MinPatientCount::Count(5));
        assert!(config.filter.normalize);
        assert!(config.cohort.regress_lesion_volume);
        assert_eq!(config.search.n_splits, 5);
        assert_eq!(config.search.parallelism, Parallelism::Sequential);
        assert_eq!(config.permutation.n_permutations, 1000);
        assert_eq!(config.permutation.seed, None);
        assert_eq!(config.output.significance_level, 0.05);
    }

    #[test]
    fn percentage_strings_are_accepted() {
        let config: AnalysisConfig = toml::from_str(
            r#"
[cohort]
behavior_csv = "scores.csv"
lesion_dir = "lesions"

[filter]
min_patient_count = "10%"

[search]
c = [1.0]
gamma = [1.0]
epsilon = [0.1]
"#,
        )
        .unwrap();
        assert_eq!(
            config.filter.min_patient_count,
            MinPatientCount::Percent(10.0)
        );
    }

    #[test]
    fn invalid_settings_are_configuration_errors() {
        let mut config = AnalysisConfig::default();
        config.search.grid.epsilon.clear();
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("search.epsilon"), "{message}");

        let mut config = AnalysisConfig::default();
        config.search.n_splits = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AnalysisConfig::default();
        config.permutation.n_permutations = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AnalysisConfig::default();
        config.search.grid.gamma = vec![1.0, 0.0];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AnalysisConfig::default();
        config.cohort.max_score = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
