use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    combining::PredictionRecord,
    identifiers::ModelIdentifier,
    store::{results_path, PredictionStore, TrialEntry, ARTIFACT_FILE},
    transform::LabelSet,
};

/// Everything the optimizer reports about one finished trial.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    /// Trained model.
    pub identifier: ModelIdentifier,
    /// Individually achieved validation score.
    pub score: f64,
    /// Hyperparameter configuration.
    pub config: Value,
    /// Fold predictions kept for ensembling, if the run collected any.
    pub predictions: Option<PredictionRecord>,
}

/// Sink receiving every finished trial.
pub trait ResultLogger: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Records one trial.
    fn write(&self, record: &TrialRecord) -> Result<()>;
}

impl fmt::Debug for dyn ResultLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultLogger")
            .field("name", &self.name())
            .finish()
    }
}

/// Appends trial scores and configs to `results.jsonl`, the history the builder reads.
#[derive(Debug)]
pub struct TrialLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl TrialLogger {
    /// Opens or creates the trial log inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let path = results_path(dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating results dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening trial log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Path of the trial log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultLogger for TrialLogger {
    fn name(&self) -> &str {
        "trials"
    }

    fn write(&self, record: &TrialRecord) -> Result<()> {
        let entry = TrialEntry::new(record.identifier, record.score, record.config.clone());
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Writes each trial's fold predictions into the prediction store.
#[derive(Debug)]
pub struct EnsembleLogger {
    store: PredictionStore,
}

impl EnsembleLogger {
    /// Opens the prediction artifact inside `dir`, truncating it when `overwrite` is set.
    pub fn new(
        dir: impl AsRef<Path>,
        labels: &LabelSet,
        test_labels: Option<&LabelSet>,
        overwrite: bool,
    ) -> Result<Self> {
        let path = dir.as_ref().join(ARTIFACT_FILE);
        let store = PredictionStore::open_appender(&path, labels, test_labels, overwrite)
            .with_context(|| format!("opening prediction store {}", path.display()))?;
        Ok(Self { store })
    }

    /// Path of the prediction artifact.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }
}

impl ResultLogger for EnsembleLogger {
    fn name(&self) -> &str {
        "ensemble"
    }

    fn write(&self, record: &TrialRecord) -> Result<()> {
        let Some(predictions) = &record.predictions else {
            return Ok(());
        };
        self.store
            .append(predictions)
            .with_context(|| format!("storing predictions of {}", record.identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::TrialHistory, transform::IdentityTransform};
    use ndarray::array;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(n: i64, predictions: Option<PredictionRecord>) -> TrialRecord {
        TrialRecord {
            identifier: ModelIdentifier::new((0, 0, n), 1.0, 0),
            score: 0.1 * n as f64,
            config: json!({ "layers": n }),
            predictions,
        }
    }

    #[test]
    fn trial_logger_feeds_history() {
        let dir = tempdir().unwrap();
        let logger = TrialLogger::new(dir.path()).unwrap();
        logger.write(&record(1, None)).unwrap();
        logger.write(&record(2, None)).unwrap();
        let history = TrialHistory::load(dir.path()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[1].config, json!({ "layers": 2 }));
    }

    #[test]
    fn diverged_trials_load_back_as_nan() {
        let dir = tempdir().unwrap();
        let logger = TrialLogger::new(dir.path()).unwrap();
        let mut diverged = record(2, None);
        diverged.score = f64::NAN;
        logger.write(&record(1, None)).unwrap();
        logger.write(&diverged).unwrap();
        logger.write(&record(3, None)).unwrap();

        let history = TrialHistory::load(dir.path()).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.entries()[1].score.is_nan());
        assert!((history.entries()[2].score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn ensemble_logger_skips_trials_without_predictions() {
        let dir = tempdir().unwrap();
        let labels = LabelSet::from_column(&[1.0]);
        let logger = EnsembleLogger::new(dir.path(), &labels, None, true).unwrap();
        let id = ModelIdentifier::new((0, 0, 1), 1.0, 0);
        logger
            .write(&record(1, Some(PredictionRecord::new(id, vec![array![[0.4]]]))))
            .unwrap();
        logger.write(&record(2, None)).unwrap();

        let stored = PredictionStore::read(logger.path(), &IdentityTransform).unwrap();
        assert_eq!(stored.identifiers(), vec![id]);
    }
}
