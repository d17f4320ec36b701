//! Upstream dataset boundary: locating, validating and loading merge inputs
//! and the canonical results document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use irec_core::{CanonicalRecord, DatasetKind, DatasetRow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "irec-inputs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingInput {
    pub kind: DatasetKind,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("required input files not found: {}", format_missing(.0))]
    Missing(Vec<MissingInput>),
    #[error("{kind} file is empty: {}", path.display())]
    Empty { kind: DatasetKind, path: PathBuf },
    #[error("{kind} file contains invalid JSON: {}", path.display())]
    InvalidJson {
        kind: DatasetKind,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} file must hold a JSON array: {}", path.display())]
    NotAnArray { kind: DatasetKind, path: PathBuf },
    #[error("reading {kind} file {}", path.display())]
    Io {
        kind: DatasetKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{kind} dataset is not available from this source")]
    Unavailable { kind: DatasetKind },
    #[error("results file not found: {} (run the merge stage first)", .0.display())]
    ResultsMissing(PathBuf),
    #[error("results file contains no records: {}", .0.display())]
    ResultsEmpty(PathBuf),
    #[error("results file has an unrecognised layout: {}", .0.display())]
    ResultsLayout(PathBuf),
    #[error("results file contains invalid JSON: {}", path.display())]
    ResultsInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading results file {}", path.display())]
    ResultsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn format_missing(missing: &[MissingInput]) -> String {
    missing
        .iter()
        .map(|m| format!("{}: {}", m.kind, m.path.display()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// File locations of the six merge inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPaths {
    pub base_issues: PathBuf,
    pub descriptions: PathBuf,
    pub classifications: PathBuf,
    pub similar_issues: PathBuf,
    pub timeline_predictions: PathBuf,
    pub action_recommendations: PathBuf,
}

impl InputPaths {
    pub fn path_for(&self, kind: DatasetKind) -> &Path {
        match kind {
            DatasetKind::BaseIssues => &self.base_issues,
            DatasetKind::Descriptions => &self.descriptions,
            DatasetKind::Classifications => &self.classifications,
            DatasetKind::SimilarIssues => &self.similar_issues,
            DatasetKind::TimelinePredictions => &self.timeline_predictions,
            DatasetKind::ActionRecommendations => &self.action_recommendations,
        }
    }
}

/// Raw rows of every dataset after validation, ready to be typed.
#[derive(Debug, Clone, Default)]
pub struct ValidatedInputs {
    datasets: BTreeMap<DatasetKind, Vec<JsonValue>>,
}

impl ValidatedInputs {
    pub fn counts(&self) -> BTreeMap<DatasetKind, usize> {
        self.datasets.iter().map(|(kind, rows)| (*kind, rows.len())).collect()
    }

    fn take(&mut self, kind: DatasetKind) -> Option<Vec<JsonValue>> {
        self.datasets.remove(&kind)
    }
}

/// Lazily loadable upstream collections, one per [`DatasetKind`].
pub trait DatasetSource: Send + Sync {
    /// Check every dataset up front. Each one is read exactly once; the
    /// rows come back for typing.
    fn validate(&self) -> Result<ValidatedInputs, InputError>;

    fn load_raw(&self, kind: DatasetKind) -> Result<Vec<JsonValue>, InputError>;
}

#[derive(Debug, Clone)]
pub struct JsonFileSource {
    paths: InputPaths,
}

impl JsonFileSource {
    pub fn new(paths: InputPaths) -> Self {
        Self { paths }
    }

    fn read_json(&self, kind: DatasetKind) -> Result<JsonValue, InputError> {
        let path = self.paths.path_for(kind);
        let text = fs::read_to_string(path).map_err(|source| InputError::Io {
            kind,
            path: path.to_path_buf(),
            source,
        })?;
        if text.trim().is_empty() {
            return Err(InputError::Empty {
                kind,
                path: path.to_path_buf(),
            });
        }
        serde_json::from_str(&text).map_err(|source| InputError::InvalidJson {
            kind,
            path: path.to_path_buf(),
            source,
        })
    }
}

impl DatasetSource for JsonFileSource {
    fn validate(&self) -> Result<ValidatedInputs, InputError> {
        let missing = DatasetKind::ALL
            .iter()
            .filter(|kind| !self.paths.path_for(**kind).exists())
            .map(|kind| MissingInput {
                kind: *kind,
                path: self.paths.path_for(*kind).to_path_buf(),
            })
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(InputError::Missing(missing));
        }

        let mut validated = ValidatedInputs::default();
        for kind in DatasetKind::ALL {
            let rows = self.load_raw(kind)?;
            info!(dataset = %kind, records = rows.len(), "validated input");
            validated.datasets.insert(kind, rows);
        }
        Ok(validated)
    }

    fn load_raw(&self, kind: DatasetKind) -> Result<Vec<JsonValue>, InputError> {
        let path = self.paths.path_for(kind);
        match self.read_json(kind)? {
            JsonValue::Array(rows) if rows.is_empty() => Err(InputError::Empty {
                kind,
                path: path.to_path_buf(),
            }),
            JsonValue::Array(rows) => Ok(rows),
            JsonValue::Null => Err(InputError::Empty {
                kind,
                path: path.to_path_buf(),
            }),
            _ => Err(InputError::NotAnArray {
                kind,
                path: path.to_path_buf(),
            }),
        }
    }
}

/// In-process datasets, handy when an upstream stage hands rows over directly.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    datasets: BTreeMap<DatasetKind, Vec<JsonValue>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: DatasetKind, rows: Vec<JsonValue>) -> Self {
        self.datasets.insert(kind, rows);
        self
    }
}

impl DatasetSource for MemorySource {
    fn validate(&self) -> Result<ValidatedInputs, InputError> {
        let mut validated = ValidatedInputs::default();
        for kind in DatasetKind::ALL {
            validated.datasets.insert(kind, self.load_raw(kind)?);
        }
        Ok(validated)
    }

    fn load_raw(&self, kind: DatasetKind) -> Result<Vec<JsonValue>, InputError> {
        match self.datasets.get(&kind) {
            Some(rows) if rows.is_empty() => Err(InputError::Empty {
                kind,
                path: PathBuf::from("<memory>"),
            }),
            Some(rows) => Ok(rows.clone()),
            None => Err(InputError::Unavailable { kind }),
        }
    }
}

/// Typed rows of one dataset. Rows that do not fit the shape are kept as
/// `T::default()` so positions are preserved.
#[derive(Debug, Clone)]
pub struct DatasetRows<T> {
    pub rows: Vec<T>,
    pub malformed: usize,
}

/// Types the validated rows of `T`'s dataset, taking them out of `inputs`.
pub fn load_dataset<T: DatasetRow + Default>(inputs: &mut ValidatedInputs) -> Result<DatasetRows<T>, InputError> {
    let raw = inputs
        .take(T::DATASET)
        .ok_or(InputError::Unavailable { kind: T::DATASET })?;
    let mut rows = Vec::with_capacity(raw.len());
    let mut malformed = 0usize;
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<T>(value) {
            Ok(row) => rows.push(row),
            Err(err) => {
                warn!(dataset = %T::DATASET, index, error = %err, "malformed upstream row");
                malformed += 1;
                rows.push(T::default());
            }
        }
    }
    info!(dataset = %T::DATASET, records = rows.len(), malformed, "loaded dataset");
    Ok(DatasetRows { rows, malformed })
}

fn read_results(path: &Path) -> Result<Vec<JsonValue>, InputError> {
    if !path.exists() {
        return Err(InputError::ResultsMissing(path.to_path_buf()));
    }
    let text = fs::read_to_string(path).map_err(|source| InputError::ResultsIo {
        path: path.to_path_buf(),
        source,
    })?;
    let document: JsonValue =
        serde_json::from_str(&text).map_err(|source| InputError::ResultsInvalid {
            path: path.to_path_buf(),
            source,
        })?;

    let rows = match document {
        JsonValue::Object(mut map) => match map.remove("data") {
            Some(JsonValue::Array(rows)) => rows,
            _ => return Err(InputError::ResultsLayout(path.to_path_buf())),
        },
        JsonValue::Array(rows) => rows,
        _ => return Err(InputError::ResultsLayout(path.to_path_buf())),
    };
    if rows.is_empty() {
        return Err(InputError::ResultsEmpty(path.to_path_buf()));
    }
    Ok(rows)
}

/// Rows of a results document that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedResults {
    path: PathBuf,
    rows: Vec<JsonValue>,
}

impl ValidatedResults {
    /// A row that cannot be read as a record is kept as an empty record so
    /// the writer rejects and counts it.
    pub fn into_records(self) -> Vec<CanonicalRecord> {
        let mut records = Vec::with_capacity(self.rows.len());
        for (index, row) in self.rows.into_iter().enumerate() {
            match serde_json::from_value::<CanonicalRecord>(row) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(index, error = %err, "unreadable results row");
                    records.push(CanonicalRecord::default());
                }
            }
        }
        info!(path = %self.path.display(), records = records.len(), "loaded results file");
        records
    }
}

/// Reads and checks the canonical results document, either
/// `{metadata, data: [...]}` or a bare array.
pub fn validate_results_file(path: &Path) -> Result<ValidatedResults, InputError> {
    let rows = read_results(path)?;
    info!(path = %path.display(), records = rows.len(), "results file validated");
    Ok(ValidatedResults {
        path: path.to_path_buf(),
        rows,
    })
}
