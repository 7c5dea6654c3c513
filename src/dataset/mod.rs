//! Aligned (features, labels, groups) dataset
//!
//! The engine's read-only input: an N x F feature matrix, N class ids, and
//! one or more named grouping vectors (speaker, language, session...), all
//! index-aligned. Loading joins a feature-matrix CSV with a label/group
//! metadata table by instance name.

mod loader;

pub use loader::DatasetLoader;

use crate::error::{EvalError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One categorical grouping of the dataset's instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grouping {
    /// Group vocabulary; ids index into this.
    pub names: Vec<String>,
    /// Per-instance group id.
    pub indices: Vec<usize>,
}

impl Grouping {
    /// Build a grouping from raw per-instance labels. Vocabulary order is
    /// first-appearance order, so it is stable for a fixed input order.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut names: Vec<String> = Vec::new();
        let mut indices = Vec::with_capacity(labels.len());
        for l in labels {
            let l = l.as_ref();
            let id = match names.iter().position(|n| n == l) {
                Some(id) => id,
                None => {
                    names.push(l.to_string());
                    names.len() - 1
                }
            };
            indices.push(id);
        }
        Self { names, indices }
    }

    pub fn n_groups(&self) -> usize {
        self.names.len()
    }
}

/// Optional mapping from raw group labels to coarser bucket labels.
/// Applied only when aggregating metrics, never when partitioning or
/// normalising.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupMap {
    map: BTreeMap<String, String>,
}

impl GroupMap {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Map a raw group label to its bucket; unmapped labels pass through.
    pub fn bucket<'a>(&'a self, raw: &'a str) -> &'a str {
        self.map.get(raw).map(String::as_str).unwrap_or(raw)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The engine's dataset: immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub corpus: String,
    pub feature_set: String,
    /// N x F feature matrix.
    pub x: Array2<f64>,
    /// Per-instance class id into `classes`.
    pub y: Vec<usize>,
    /// Class vocabulary.
    pub classes: Vec<String>,
    /// Named groupings (e.g. "speaker", "language").
    pub groupings: BTreeMap<String, Grouping>,
    /// Instance names, sorted; used only for diagnostics.
    pub names: Vec<String>,
}

impl Dataset {
    /// Construct from in-memory parts, checking alignment.
    pub fn new(
        corpus: &str,
        feature_set: &str,
        x: Array2<f64>,
        y: Vec<usize>,
        classes: Vec<String>,
        groupings: BTreeMap<String, Grouping>,
        names: Vec<String>,
    ) -> Result<Self> {
        let n = x.nrows();
        if y.len() != n {
            return Err(EvalError::DataError(format!(
                "label vector length {} does not match {} instances",
                y.len(),
                n
            )));
        }
        if names.len() != n {
            return Err(EvalError::DataError(format!(
                "name vector length {} does not match {} instances",
                names.len(),
                n
            )));
        }
        for (key, grouping) in &groupings {
            if grouping.indices.len() != n {
                return Err(EvalError::DataError(format!(
                    "grouping '{}' length {} does not match {} instances",
                    key,
                    grouping.indices.len(),
                    n
                )));
            }
        }
        if let Some(&max) = y.iter().max() {
            if max >= classes.len() {
                return Err(EvalError::DataError(format!(
                    "class id {} out of range ({} classes)",
                    max,
                    classes.len()
                )));
            }
        }
        Ok(Self {
            corpus: corpus.to_string(),
            feature_set: feature_set.to_string(),
            x,
            y,
            classes,
            groupings,
            names,
        })
    }

    pub fn n_instances(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// Look up a grouping by key, with a diagnostic naming the key.
    pub fn grouping(&self, key: &str) -> Result<&Grouping> {
        self.groupings.get(key).ok_or_else(|| {
            EvalError::ConfigError(format!(
                "partition: grouping key '{}' not present in dataset (have: {})",
                key,
                self.groupings
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }
}
