use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use indexmap::{map::Entry, IndexMap};
use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    combining::PredictionRecord,
    errors::{EnsembleError, Result},
    identifiers::ModelIdentifier,
    transform::{LabelSet, LabelTransform},
};

/// File name of the prediction artifact inside a results directory.
pub const ARTIFACT_FILE: &str = "predictions_for_ensemble.jsonl";

const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactHeader {
    version: u32,
    labels: LabelSet,
    #[serde(default)]
    test_labels: Option<LabelSet>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ArtifactLine {
    Header(ArtifactHeader),
    Record(PredictionRecord),
}

/// Everything read back from a prediction artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPredictions {
    /// Records merged by identifier, in first-arrival order.
    pub predictions: IndexMap<ModelIdentifier, PredictionRecord>,
    /// Validation labels.
    pub labels: LabelSet,
    /// Test labels, when the run had a test split.
    pub test_labels: Option<LabelSet>,
}

impl StoredPredictions {
    /// Stored identifiers in arrival order.
    #[must_use]
    pub fn identifiers(&self) -> Vec<ModelIdentifier> {
        self.predictions.keys().copied().collect()
    }
}

/// JSON-lines store of per-model prediction folds plus the labels they align with.
///
/// The first line is a header carrying the labels; every following line is one
/// [`PredictionRecord`]. Appenders only ever add whole lines, and readers merge
/// records that share an identifier.
#[derive(Debug)]
pub struct PredictionStore {
    path: PathBuf,
    writer: Mutex<File>,
}

impl PredictionStore {
    /// Writes a complete artifact, replacing any existing file.
    pub fn write(
        path: impl AsRef<Path>,
        predictions: &IndexMap<ModelIdentifier, PredictionRecord>,
        labels: &LabelSet,
        test_labels: Option<&LabelSet>,
    ) -> Result<()> {
        let path = path.as_ref();
        create_parent(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        write_line(&mut writer, &ArtifactLine::Header(make_header(labels, test_labels)))?;
        for record in predictions.values() {
            write_line(&mut writer, &ArtifactLine::Record(record.clone()))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Opens an append-only store, writing the header when the file is new, empty, or
    /// `overwrite` is set.
    pub fn open_appender(
        path: impl Into<PathBuf>,
        labels: &LabelSet,
        test_labels: Option<&LabelSet>,
        overwrite: bool,
    ) -> Result<Self> {
        let path = path.into();
        create_parent(&path)?;
        let existing = if overwrite || !path.exists() {
            None
        } else {
            existing_header(&path)?
        };
        if let Some(header) = &existing {
            if header.labels != *labels || header.test_labels.as_ref() != test_labels {
                return Err(EnsembleError::corrupt(
                    None,
                    format!("labels differ from the header of {}", path.display()),
                ));
            }
        }
        let fresh = existing.is_none();
        let mut file = if overwrite {
            File::create(&path)?
        } else {
            OpenOptions::new().create(true).append(true).open(&path)?
        };
        if fresh {
            write_line(&mut file, &ArtifactLine::Header(make_header(labels, test_labels)))?;
            file.flush()?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Appends one record as a single line.
    pub fn append(&self, record: &PredictionRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        write_line(&mut *writer, &ArtifactLine::Record(record.clone()))?;
        writer.flush()?;
        Ok(())
    }

    /// Path of the artifact.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads an artifact, merging records by identifier and applying `transform` to labels
    /// and every prediction array.
    pub fn read(path: impl AsRef<Path>, transform: &dyn LabelTransform) -> Result<StoredPredictions> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut header: Option<ArtifactHeader> = None;
        let mut predictions: IndexMap<ModelIdentifier, PredictionRecord> = IndexMap::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<ArtifactLine>(&line).map_err(|err| {
                EnsembleError::corrupt(None, format!("line {}: {err}", lineno + 1))
            })?;
            match parsed {
                ArtifactLine::Header(next) => {
                    if let Some(existing) = &header {
                        if existing.labels != next.labels {
                            return Err(EnsembleError::corrupt(None, "conflicting label headers"));
                        }
                    } else if predictions.is_empty() {
                        header = Some(next);
                    } else {
                        return Err(EnsembleError::corrupt(None, "header follows records"));
                    }
                }
                ArtifactLine::Record(record) => {
                    if header.is_none() {
                        return Err(EnsembleError::corrupt(
                            Some(record.identifier),
                            "record precedes header",
                        ));
                    }
                    match predictions.entry(record.identifier) {
                        Entry::Occupied(mut entry) => entry.get_mut().merge(record),
                        Entry::Vacant(entry) => {
                            entry.insert(record);
                        }
                    }
                }
            }
        }

        let header = header.ok_or_else(|| EnsembleError::corrupt(None, "missing header"))?;
        if header.version != ARTIFACT_VERSION {
            return Err(EnsembleError::corrupt(
                None,
                format!("unsupported artifact version {}", header.version),
            ));
        }
        let labels = transform.labels(header.labels);
        let test_labels = header.test_labels.map(|test| transform.labels(test));
        for record in predictions.values_mut() {
            record.validation = apply(transform, std::mem::take(&mut record.validation));
            record.test = apply(transform, std::mem::take(&mut record.test));
        }
        check_consistency(&predictions, &labels, test_labels.as_ref())?;

        Ok(StoredPredictions {
            predictions,
            labels,
            test_labels,
        })
    }
}

fn make_header(labels: &LabelSet, test_labels: Option<&LabelSet>) -> ArtifactHeader {
    ArtifactHeader {
        version: ARTIFACT_VERSION,
        labels: labels.clone(),
        test_labels: test_labels.cloned(),
    }
}

/// Header of an existing artifact; `None` when the file holds no lines yet.
fn existing_header(path: &Path) -> Result<Option<ArtifactHeader>> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        return match serde_json::from_str::<ArtifactLine>(&line) {
            Ok(ArtifactLine::Header(header)) => Ok(Some(header)),
            Ok(ArtifactLine::Record(record)) => Err(EnsembleError::corrupt(
                Some(record.identifier),
                "record precedes header",
            )),
            Err(err) => Err(EnsembleError::corrupt(None, format!("header: {err}"))),
        };
    }
    Ok(None)
}

fn write_line(writer: &mut impl Write, line: &ArtifactLine) -> Result<()> {
    serde_json::to_writer(&mut *writer, line)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn apply(transform: &dyn LabelTransform, folds: Vec<Array2<f64>>) -> Vec<Array2<f64>> {
    folds
        .into_iter()
        .map(|fold| transform.predictions(fold))
        .collect()
}

fn check_consistency(
    predictions: &IndexMap<ModelIdentifier, PredictionRecord>,
    labels: &LabelSet,
    test_labels: Option<&LabelSet>,
) -> Result<()> {
    let mut columns: Option<usize> = None;
    for (identifier, record) in predictions {
        let splits = [
            ("validation", &record.validation, Some(labels)),
            ("test", &record.test, test_labels),
        ];
        for (split, folds, expected) in splits {
            for fold in folds {
                if let Some(expected) = expected {
                    if fold.nrows() != expected.n_samples() {
                        return Err(EnsembleError::corrupt(
                            Some(*identifier),
                            format!(
                                "{split} fold has {} samples but labels have {}",
                                fold.nrows(),
                                expected.n_samples()
                            ),
                        ));
                    }
                }
                match columns {
                    None => columns = Some(fold.ncols()),
                    Some(cols) if cols != fold.ncols() => {
                        return Err(EnsembleError::corrupt(
                            Some(*identifier),
                            format!("{split} fold has {} outputs, expected {cols}", fold.ncols()),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}
