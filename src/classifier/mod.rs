//! Classifier trait, configuration, and factory registry
//!
//! The engine never names a concrete model type: classifiers are built from
//! a string id through [`ClassifierRegistry`] and driven through the
//! [`Classifier`] capability trait. Two deterministic baseline backends are
//! bundled; heavier backends register through the same table.

mod centroid;
mod logistic;

pub use centroid::NearestCentroid;
pub use logistic::LogisticRegression;

use crate::error::{EvalError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A single hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// Opaque hyperparameter bag passed to a classifier factory. Owned by the
/// caller; the engine never mutates it. The ordered map keeps the JSON
/// encoding written to results rows canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassifierConfig {
    params: BTreeMap<String, ParamValue>,
}

impl ClassifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: ParamValue) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.params
            .get(key)
            .and_then(|v| v.as_i64())
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Merge `other` over this config, returning the combined bag. Used to
    /// overlay a searched grid point on top of the base configuration.
    pub fn overlaid_with(&self, other: &ClassifierConfig) -> ClassifierConfig {
        let mut params = self.params.clone();
        for (k, v) in &other.params {
            params.insert(k.clone(), v.clone());
        }
        ClassifierConfig { params }
    }

    /// Canonical JSON encoding (key-sorted by construction).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.params)?)
    }

    /// Load a YAML hyperparameter file.
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Capability trait every classifier backend implements.
pub trait Classifier: Send {
    /// Fit on training data. `sample_weight`, when given, reweights each
    /// training instance (used for the `balanced` option).
    fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        n_classes: usize,
        sample_weight: Option<&[f64]>,
    ) -> Result<()>;

    /// Predict class ids.
    fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>>;

    /// Per-class scores, when the backend supports them.
    fn predict_proba(&self, _x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        Ok(None)
    }
}

type BuildFn = fn(&ClassifierConfig) -> Result<Box<dyn Classifier>>;

/// String-keyed factory table mapping a classifier id to a constructor.
pub struct ClassifierRegistry {
    builders: HashMap<String, BuildFn>,
}

impl ClassifierRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: &str, build: BuildFn) {
        self.builders.insert(id.to_string(), build);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.builders.contains_key(id)
    }

    pub fn build(&self, id: &str, config: &ClassifierConfig) -> Result<Box<dyn Classifier>> {
        let build = self
            .builders
            .get(id)
            .ok_or_else(|| EvalError::UnknownClassifier(id.to_string()))?;
        build(config)
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("centroid", |config| {
            Ok(Box::new(NearestCentroid::from_config(config)?))
        });
        registry.register("logistic", |config| {
            Ok(Box::new(LogisticRegression::from_config(config)?))
        });
        registry
    }
}

/// Inverse-frequency sample weights: weight of an instance of class c is
/// n / (k * count(c)), matching scikit-learn's "balanced" heuristic.
pub fn balanced_sample_weights(y: &[usize], n_classes: usize) -> Array1<f64> {
    let mut counts = vec![0usize; n_classes];
    for &c in y {
        counts[c] += 1;
    }
    let n = y.len() as f64;
    let k = counts.iter().filter(|&&c| c > 0).count() as f64;
    Array1::from_iter(
        y.iter()
            .map(|&c| n / (k * counts[c] as f64)),
    )
}
