use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Per-step selection detail.
    Debug,
    /// Stage boundaries.
    Info,
    /// Recoverable oddities (e.g. identifiers missing from the history).
    Warn,
    /// Failures.
    Error,
}

/// Structured log record written as one JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Ensemble-building run the record belongs to.
    pub run: Uuid,
    /// Component emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Short message, usually a dotted stage name.
    pub message: String,
    /// Free-form fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Builder for [`EnsembleTelemetry`].
#[derive(Debug)]
pub struct EnsembleTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
}

impl EnsembleTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds the telemetry handle, opening the log file in append mode.
    pub fn build(self) -> Result<EnsembleTelemetry> {
        let sink = match &self.log_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating log dir {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log {}", path.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(EnsembleTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                run: Uuid::new_v4(),
                min_level: self.min_level,
                log_path: self.log_path,
                sink,
            }),
        })
    }
}

/// Cloneable telemetry handle shared by the ensemble components.
#[derive(Clone)]
pub struct EnsembleTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    run: Uuid,
    min_level: LogLevel,
    log_path: Option<PathBuf>,
    sink: Option<Mutex<File>>,
}

impl fmt::Debug for EnsembleTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnsembleTelemetry")
            .field("module", &self.inner.module)
            .field("run", &self.inner.run)
            .field("log_path", &self.inner.log_path)
            .finish()
    }
}

impl EnsembleTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EnsembleTelemetryBuilder {
        EnsembleTelemetryBuilder::new(module)
    }

    /// Run id stamped on every record.
    #[must_use]
    pub fn run(&self) -> Uuid {
        self.inner.run
    }

    /// File the records go to, if any.
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.inner.log_path.as_deref()
    }

    /// Logs structured metadata if `level` passes the threshold.
    ///
    /// Each record is rendered first and written with a single call, so handles sharing a
    /// file never split a line.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let Some(sink) = &self.inner.sink else {
            return Ok(());
        };
        if level < self.inner.min_level {
            return Ok(());
        }
        let record = LogRecord {
            timestamp: Utc::now(),
            run: self.inner.run,
            module: self.inner.module.clone(),
            level,
            message: message.into(),
            metadata: match metadata {
                Value::Object(map) => map,
                Value::Null => serde_json::Map::new(),
                other => serde_json::Map::from_iter([("value".to_string(), other)]),
            },
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = sink.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Logs through optional telemetry, ignoring sink failures.
pub(crate) fn log(
    telemetry: Option<&EnsembleTelemetry>,
    level: LogLevel,
    message: &str,
    metadata: Value,
) {
    if let Some(tel) = telemetry {
        let _ = tel.log(level, message, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_json_lines_above_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/ensemble.log");
        let telemetry = EnsembleTelemetry::builder("selection")
            .log_path(&path)
            .min_level(LogLevel::Info)
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "selection.step", json!({ "step": 1 }))
            .unwrap();
        telemetry
            .log(LogLevel::Info, "selection.finished", json!({ "score": 0.9 }))
            .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        let record: LogRecord = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(record.message, "selection.finished");
        assert_eq!(record.run, telemetry.run());
        assert_eq!(record.level, LogLevel::Info);
    }

    #[test]
    fn telemetry_without_sink_is_silent() {
        let telemetry = EnsembleTelemetry::builder("nodes").build().unwrap();
        assert!(telemetry.log_path().is_none());
        telemetry
            .log(LogLevel::Error, "nodes.failed", json!(null))
            .unwrap();
    }

    #[test]
    fn clones_append_to_the_same_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ensemble.log");
        let telemetry = EnsembleTelemetry::builder("builder")
            .log_path(&path)
            .build()
            .unwrap();
        let clone = telemetry.clone();
        telemetry.log(LogLevel::Warn, "builder.unknown_identifiers", json!(3)).unwrap();
        clone.log(LogLevel::Info, "builder.ensemble_built", json!({})).unwrap();
        assert_eq!(clone.log_path(), Some(path.as_path()));

        let content = fs::read_to_string(&path).unwrap();
        let records = content
            .lines()
            .map(|line| serde_json::from_str::<LogRecord>(line).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.run == telemetry.run()));
        assert_eq!(records[0].metadata["value"], json!(3));
    }
}
