use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    errors::EnsembleError,
    metrics::metric_by_name,
    selection::SelectionSettings,
    store::{results_path, ARTIFACT_FILE},
};

/// Worker id of the optimization master; only it (or a standalone run) builds ensembles.
pub const MASTER_TASK_ID: i64 = 1;
/// Worker id of a standalone, non-distributed run.
pub const STANDALONE_TASK_ID: i64 = -1;

/// Pipeline options recognized by the ensemble nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of ensemble selections; 0 disables ensembling.
    #[serde(default = "default_ensemble_size")]
    pub ensemble_size: usize,
    /// Only consider the n best models; 0 considers all.
    #[serde(default)]
    pub ensemble_only_consider_n_best: usize,
    /// Initialize the ensemble with the n best models; 0 starts empty.
    #[serde(default)]
    pub ensemble_sorted_initialization_n_best: usize,
    /// Whether lower train-metric values are better.
    #[serde(default)]
    pub minimize: bool,
    /// Metric used to score candidates and ensembles.
    #[serde(default = "default_train_metric")]
    pub train_metric: String,
    /// Directory holding the trial log and prediction artifact.
    #[serde(default = "default_result_logger_dir")]
    pub result_logger_dir: PathBuf,
    /// Id of the optimization worker running the pipeline.
    #[serde(default = "default_task_id")]
    pub task_id: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ensemble_size: default_ensemble_size(),
            ensemble_only_consider_n_best: 0,
            ensemble_sorted_initialization_n_best: 0,
            minimize: false,
            train_metric: default_train_metric(),
            result_logger_dir: default_result_logger_dir(),
            task_id: default_task_id(),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// A relative `result_logger_dir` is resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if config.result_logger_dir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.result_logger_dir = base.join(&config.result_logger_dir);
        }
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    /// Rejects nonsensical combinations before any training runs.
    pub fn validate(&self) -> Result<(), EnsembleError> {
        if self.result_logger_dir.as_os_str().is_empty() {
            return Err(EnsembleError::InvalidConfiguration(
                "result_logger_dir must not be empty".into(),
            ));
        }
        metric_by_name(&self.train_metric)?;
        if self.ensemble_enabled()
            && self.ensemble_sorted_initialization_n_best > self.ensemble_size
        {
            return Err(EnsembleError::InvalidConfiguration(format!(
                "ensemble_sorted_initialization_n_best ({}) exceeds ensemble_size ({})",
                self.ensemble_sorted_initialization_n_best, self.ensemble_size
            )));
        }
        Ok(())
    }

    /// Whether ensembling is switched on at all.
    #[must_use]
    pub const fn ensemble_enabled(&self) -> bool {
        self.ensemble_size > 0
    }

    /// Whether this worker is the one that builds the ensemble.
    #[must_use]
    pub const fn is_ensemble_builder(&self) -> bool {
        self.task_id == MASTER_TASK_ID || self.task_id == STANDALONE_TASK_ID
    }

    /// Selection parameters derived from the options.
    #[must_use]
    pub const fn selection_settings(&self) -> SelectionSettings {
        SelectionSettings {
            ensemble_size: self.ensemble_size,
            only_consider_n_best: self.ensemble_only_consider_n_best,
            sorted_initialization_n_best: self.ensemble_sorted_initialization_n_best,
            minimize: self.minimize,
        }
    }

    /// Location of the prediction artifact.
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.result_logger_dir.join(ARTIFACT_FILE)
    }

    /// Location of the trial log.
    #[must_use]
    pub fn results_path(&self) -> PathBuf {
        results_path(&self.result_logger_dir)
    }
}

const fn default_ensemble_size() -> usize {
    3
}

fn default_train_metric() -> String {
    "accuracy".into()
}

fn default_result_logger_dir() -> PathBuf {
    PathBuf::from("results")
}

const fn default_task_id() -> i64 {
    STANDALONE_TASK_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_options() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.ensemble_size, 3);
        assert_eq!(config.ensemble_only_consider_n_best, 0);
        assert_eq!(config.ensemble_sorted_initialization_n_best, 0);
        assert!(config.is_ensemble_builder());
    }

    #[test]
    fn load_resolves_relative_result_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            "ensemble_size = 5\nensemble_only_consider_n_best = 10\nminimize = true\n\
             train_metric = \"log_loss\"\nresult_logger_dir = \"run-1\"\n",
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.result_logger_dir, dir.path().join("run-1"));
        assert_eq!(config.selection_settings().ensemble_size, 5);
        assert!(config.selection_settings().minimize);
        assert_eq!(
            config.artifact_path(),
            dir.path().join("run-1").join(ARTIFACT_FILE)
        );
    }

    #[test]
    fn validate_rejects_bad_options() {
        let unknown_metric = PipelineConfig {
            train_metric: "balanced_accuracy_v9".into(),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            unknown_metric.validate(),
            Err(EnsembleError::InvalidConfiguration(_))
        ));

        let oversized_seed = PipelineConfig {
            ensemble_size: 2,
            ensemble_sorted_initialization_n_best: 4,
            ..PipelineConfig::default()
        };
        assert!(oversized_seed.validate().is_err());

        let disabled = PipelineConfig {
            ensemble_size: 0,
            ensemble_sorted_initialization_n_best: 4,
            ..PipelineConfig::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn only_master_or_standalone_builds() {
        let worker = PipelineConfig {
            task_id: 3,
            ..PipelineConfig::default()
        };
        assert!(!worker.is_ensemble_builder());
        let master = PipelineConfig {
            task_id: MASTER_TASK_ID,
            ..PipelineConfig::default()
        };
        assert!(master.is_ensemble_builder());
    }
}
