use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    errors::{EnsembleError, Result},
    identifiers::ModelIdentifier,
};

/// File name of the trial log inside a results directory.
pub const RESULTS_FILE: &str = "results.jsonl";

/// One finished optimization trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialEntry {
    /// Model the trial trained.
    pub identifier: ModelIdentifier,
    /// Individually achieved validation score; NaN for diverged trials.
    #[serde(with = "crate::floats::value")]
    pub score: f64,
    /// Hyperparameter configuration as reported by the optimizer.
    #[serde(default)]
    pub config: Value,
    /// When the trial finished.
    pub finished_at: DateTime<Utc>,
}

impl TrialEntry {
    /// Creates an entry finishing now.
    #[must_use]
    pub fn new(identifier: ModelIdentifier, score: f64, config: Value) -> Self {
        Self {
            identifier,
            score,
            config,
            finished_at: Utc::now(),
        }
    }
}

/// Append-only history of optimization trials in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialHistory {
    entries: Vec<TrialEntry>,
}

impl TrialHistory {
    /// Builds a history from entries already in arrival order.
    #[must_use]
    pub fn from_entries(entries: Vec<TrialEntry>) -> Self {
        Self { entries }
    }

    /// Loads `results.jsonl` from a results directory; a missing file is an empty history.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_file(results_path(dir))
    }

    /// Loads a history from an explicit JSON-lines file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<TrialEntry>(&line).map_err(|err| {
                EnsembleError::corrupt(
                    None,
                    format!("{} line {}: {err}", path.display(), lineno + 1),
                )
            })?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Appends an entry.
    pub fn push(&mut self, entry: TrialEntry) {
        self.entries.push(entry);
    }

    /// Entries in arrival order.
    #[must_use]
    pub fn entries(&self) -> &[TrialEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no trial has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arrival position of the first entry for `identifier`.
    #[must_use]
    pub fn position(&self, identifier: &ModelIdentifier) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.identifier == identifier)
    }

    /// Individually achieved score of `identifier`.
    #[must_use]
    pub fn score_for(&self, identifier: &ModelIdentifier) -> Option<f64> {
        self.position(identifier).map(|idx| self.entries[idx].score)
    }

    /// Hyperparameter configuration of `identifier`.
    #[must_use]
    pub fn config_for(&self, identifier: &ModelIdentifier) -> Option<&Value> {
        self.position(identifier).map(|idx| &self.entries[idx].config)
    }
}

/// Path of the trial log inside `dir`.
pub fn results_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(RESULTS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn id(n: i64) -> ModelIdentifier {
        ModelIdentifier::new((0, 0, n), 1.0, 0)
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = tempdir().unwrap();
        let history = TrialHistory::load(dir.path()).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn loads_entries_in_arrival_order() {
        let dir = tempdir().unwrap();
        let entries = [
            TrialEntry::new(id(2), 0.8, json!({ "lr": 0.01 })),
            TrialEntry::new(id(1), 0.9, json!({ "lr": 0.1 })),
        ];
        let body = entries
            .iter()
            .map(|entry| serde_json::to_string(entry).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(results_path(dir.path()), format!("{body}\n\n")).unwrap();

        let history = TrialHistory::load(dir.path()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.position(&id(1)), Some(1));
        assert_eq!(history.score_for(&id(2)), Some(0.8));
        assert_eq!(history.config_for(&id(1)), Some(&json!({ "lr": 0.1 })));
        assert_eq!(history.score_for(&id(5)), None);
    }

    #[test]
    fn null_scores_read_as_nan() {
        let dir = tempdir().unwrap();
        let line = r#"{"identifier":{"config_id":[0,0,1],"budget":1.0,"seed":0},"score":null,"config":{},"finished_at":"2026-10-19T06:00:00Z"}"#;
        fs::write(results_path(dir.path()), format!("{line}\n")).unwrap();
        let history = TrialHistory::load(dir.path()).unwrap();
        assert!(history.score_for(&id(1)).unwrap().is_nan());
    }

    #[test]
    fn malformed_lines_are_reported() {
        let dir = tempdir().unwrap();
        fs::write(results_path(dir.path()), "{not json}\n").unwrap();
        assert!(matches!(
            TrialHistory::load(dir.path()),
            Err(EnsembleError::CorruptArtifact { .. })
        ));
    }
}
