//! Dataset loading
//!
//! Joins a feature-matrix CSV (column `name` + numeric feature columns)
//! with a metadata CSV (`name`, `label`, plus one column per grouping key)
//! into an aligned [`Dataset`], sorted by instance name.

use crate::error::{EvalError, Result};
use ndarray::Array2;
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use super::{Dataset, Grouping};

/// Loads feature and metadata tables into a [`Dataset`].
pub struct DatasetLoader {
    corpus: String,
    feature_set: String,
    /// Metadata columns to expose as grouping keys; every listed column
    /// must exist in the metadata table.
    group_keys: Vec<String>,
}

impl DatasetLoader {
    pub fn new(corpus: &str, feature_set: &str) -> Self {
        Self {
            corpus: corpus.to_string(),
            feature_set: feature_set.to_string(),
            group_keys: vec!["speaker".to_string()],
        }
    }

    pub fn with_group_keys(mut self, keys: &[&str]) -> Self {
        self.group_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Load and join the two tables.
    pub fn load(&self, features_path: &Path, labels_path: &Path) -> Result<Dataset> {
        let features_df = read_csv(features_path)?;
        let labels_df = read_csv(labels_path)?;

        let names = string_column(&features_df, "name")?;
        let feature_cols: Vec<String> = features_df
            .get_column_names()
            .into_iter()
            .filter(|c| c.as_str() != "name")
            .map(|c| c.to_string())
            .collect();
        if feature_cols.is_empty() {
            return Err(EvalError::DataError(
                "feature table has no feature columns".to_string(),
            ));
        }

        // Metadata keyed by instance name
        let meta_names = string_column(&labels_df, "name")?;
        let meta_labels = string_column(&labels_df, "label")?;
        let mut meta_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in &self.group_keys {
            meta_groups.insert(key.clone(), string_column(&labels_df, key)?);
        }

        let mut meta: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, n) in meta_names.iter().enumerate() {
            meta.insert(n.as_str(), i);
        }

        // Sort instances by name so fold enumeration is independent of the
        // feature file's row order.
        let mut order: Vec<usize> = (0..names.len()).collect();
        order.sort_by(|&a, &b| names[a].cmp(&names[b]));

        let x_raw = feature_matrix(&features_df, &feature_cols)?;
        let n = order.len();
        let mut x = Array2::zeros((n, feature_cols.len()));
        let mut labels = Vec::with_capacity(n);
        let mut sorted_names = Vec::with_capacity(n);
        let mut group_labels: BTreeMap<String, Vec<String>> = self
            .group_keys
            .iter()
            .map(|k| (k.clone(), Vec::with_capacity(n)))
            .collect();

        for (r, &i) in order.iter().enumerate() {
            let name = &names[i];
            let meta_idx = *meta.get(name.as_str()).ok_or_else(|| {
                EvalError::DataError(format!("instance '{}' missing from metadata table", name))
            })?;
            x.row_mut(r).assign(&x_raw.row(i));
            labels.push(meta_labels[meta_idx].clone());
            for key in &self.group_keys {
                group_labels
                    .get_mut(key)
                    .expect("key inserted above")
                    .push(meta_groups[key][meta_idx].clone());
            }
            sorted_names.push(name.clone());
        }

        // Class vocabulary sorted for stable ids across feature sets
        let mut classes: Vec<String> = labels.clone();
        classes.sort();
        classes.dedup();
        let y: Vec<usize> = labels
            .iter()
            .map(|l| classes.iter().position(|c| c == l).expect("class present"))
            .collect();

        let groupings: BTreeMap<String, Grouping> = group_labels
            .into_iter()
            .map(|(k, v)| (k, Grouping::from_labels(&v)))
            .collect();

        Dataset::new(
            &self.corpus,
            &self.feature_set,
            x,
            y,
            classes,
            groupings,
            sorted_names,
        )
    }
}

fn read_csv(path: &Path) -> Result<DataFrame> {
    let file = File::open(path)
        .map_err(|e| EvalError::DataError(format!("{}: {}", path.display(), e)))?;
    // Read every column as String: schema inference would turn
    // numeric-looking names and group labels ("01") into numbers and strip
    // the leading zero. Feature columns are cast to Float64 downstream.
    let reader = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(file);
    reader
        .finish()
        .map_err(|e| EvalError::DataError(format!("{}: {}", path.display(), e)))
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let column = df
        .column(name)
        .map_err(|_| EvalError::DataError(format!("column '{}' not found", name)))?;
    let series = column
        .as_materialized_series()
        .cast(&DataType::String)
        .map_err(|e| EvalError::DataError(e.to_string()))?;
    let ca = series.str().map_err(|e| EvalError::DataError(e.to_string()))?;
    ca.into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.map(|s| s.to_string()).ok_or_else(|| {
                EvalError::DataError(format!("null value in column '{}' at row {}", name, i))
            })
        })
        .collect()
}

/// Extract named numeric columns into a row-major matrix.
fn feature_matrix(df: &DataFrame, col_names: &[String]) -> Result<Array2<f64>> {
    let n_rows = df.height();
    let n_cols = col_names.len();

    let col_data: Vec<Vec<f64>> = col_names
        .iter()
        .map(|col_name| {
            let column = df
                .column(col_name)
                .map_err(|_| EvalError::DataError(format!("column '{}' not found", col_name)))?;
            let series = column
                .as_materialized_series()
                .cast(&DataType::Float64)
                .map_err(|e| EvalError::DataError(e.to_string()))?;
            let ca = series.f64().map_err(|e| EvalError::DataError(e.to_string()))?;
            ca.into_iter()
                .enumerate()
                .map(|(i, v)| {
                    v.ok_or_else(|| {
                        EvalError::DataError(format!(
                            "null feature value in column '{}' at row {}",
                            col_name, i
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<Vec<Vec<f64>>>>()?;

    let col_refs: Vec<&[f64]> = col_data.iter().map(|c| c.as_slice()).collect();
    Ok(Array2::from_shape_fn((n_rows, n_cols), |(r, c)| {
        col_refs[c][r]
    }))
}
