//! Results table persistence
//!
//! One CSV table per results path, one row per outer fold, keyed by
//! (corpus, classifier id, feature set). Overwrite mode replaces every row
//! of the keys being written; append mode adds to them. Rows are written
//! key-sorted, so re-running the same evaluation over its own output is
//! byte-identical.

use crate::dataset::Grouping;
use crate::error::{EvalError, Result};
use crate::runner::FoldOutcome;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const HEADER: &str =
    "corpus,classifier,feature_set,fold,test_groups,n_test,uar,accuracy,status,degenerate,params";

/// One persisted fold outcome. Failed folds keep their row with empty
/// metrics and the failure kind in `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub corpus: String,
    pub classifier: String,
    pub feature_set: String,
    pub fold: usize,
    /// Test group names, `;`-joined.
    pub test_groups: String,
    pub n_test: usize,
    pub uar: Option<f64>,
    pub accuracy: Option<f64>,
    /// `ok`, or the failure kind.
    pub status: String,
    /// True when the test partition missed at least one class, so the UAR
    /// is low-confidence.
    pub degenerate: bool,
    /// Canonical JSON encoding of the fitted hyperparameters.
    pub params: String,
}

impl ResultRow {
    /// Flatten one fold outcome into a row. `grouping` resolves test group
    /// ids back to their names.
    pub fn from_outcome(
        corpus: &str,
        classifier: &str,
        feature_set: &str,
        outcome: &FoldOutcome,
        grouping: &Grouping,
    ) -> Result<Self> {
        let group_names = |ids: &[usize]| -> String {
            ids.iter()
                .map(|&g| grouping.names[g].as_str())
                .collect::<Vec<_>>()
                .join(";")
        };

        match outcome {
            FoldOutcome::Success(r) => Ok(Self {
                corpus: corpus.to_string(),
                classifier: classifier.to_string(),
                feature_set: feature_set.to_string(),
                fold: r.fold_idx,
                test_groups: group_names(&r.test_groups),
                n_test: r.n_test,
                uar: Some(r.uar),
                accuracy: Some(r.accuracy),
                status: "ok".to_string(),
                degenerate: r.degenerate,
                params: r.params.to_json()?,
            }),
            FoldOutcome::Failure {
                fold_idx,
                test_groups,
                kind,
                ..
            } => Ok(Self {
                corpus: corpus.to_string(),
                classifier: classifier.to_string(),
                feature_set: feature_set.to_string(),
                fold: *fold_idx,
                test_groups: group_names(test_groups),
                n_test: 0,
                uar: None,
                accuracy: None,
                status: kind.to_string(),
                degenerate: false,
                params: String::new(),
            }),
        }
    }

    fn key(&self) -> (&str, &str, &str) {
        (&self.corpus, &self.classifier, &self.feature_set)
    }
}

/// CSV-backed store of [`ResultRow`]s.
pub struct ResultsStore {
    path: PathBuf,
}

impl ResultsStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full table; a missing file is an empty table.
    pub fn load(&self) -> Result<Vec<ResultRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        // Schema length 0 reads every column as String; inference would turn
        // numeric-looking group names ("01") into numbers and drop the zero.
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .into_reader_with_file_handle(file)
            .finish()
            .map_err(|e| EvalError::DataError(format!("{}: {}", self.path.display(), e)))?;
        if df.height() == 0 {
            return Ok(Vec::new());
        }

        let corpus = str_col(&df, "corpus")?;
        let classifier = str_col(&df, "classifier")?;
        let feature_set = str_col(&df, "feature_set")?;
        let fold = usize_col(&df, "fold")?;
        let test_groups = str_col(&df, "test_groups")?;
        let n_test = usize_col(&df, "n_test")?;
        let uar = opt_f64_col(&df, "uar")?;
        let accuracy = opt_f64_col(&df, "accuracy")?;
        let status = str_col(&df, "status")?;
        let degenerate = bool_col(&df, "degenerate")?;
        let params = str_col(&df, "params")?;

        Ok((0..df.height())
            .map(|i| ResultRow {
                corpus: corpus[i].clone(),
                classifier: classifier[i].clone(),
                feature_set: feature_set[i].clone(),
                fold: fold[i],
                test_groups: test_groups[i].clone(),
                n_test: n_test[i],
                uar: uar[i],
                accuracy: accuracy[i],
                status: status[i].clone(),
                degenerate: degenerate[i],
                params: params[i].clone(),
            })
            .collect())
    }

    /// Persist `rows`. In overwrite mode (`append == false`) every existing
    /// row sharing a (corpus, classifier, feature_set) key with the new
    /// rows is dropped first; unrelated keys are kept either way. The table
    /// is rewritten key-sorted, so writing the same rows twice leaves the
    /// file byte-identical.
    pub fn save(&self, rows: &[ResultRow], append: bool) -> Result<()> {
        let mut table = self.load()?;
        if !append {
            let new_keys: Vec<(&str, &str, &str)> = rows.iter().map(|r| r.key()).collect();
            table.retain(|r| !new_keys.contains(&r.key()));
        }
        table.extend(rows.iter().cloned());
        table.sort_by(|a, b| {
            a.key()
                .cmp(&b.key())
                .then(a.fold.cmp(&b.fold))
                .then(a.status.cmp(&b.status))
        });

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = File::create(&self.path)?;
        writeln!(file, "{}", HEADER)?;
        for row in &table {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{},{}",
                csv_field(&row.corpus),
                csv_field(&row.classifier),
                csv_field(&row.feature_set),
                row.fold,
                csv_field(&row.test_groups),
                row.n_test,
                row.uar.map(|v| v.to_string()).unwrap_or_default(),
                row.accuracy.map(|v| v.to_string()).unwrap_or_default(),
                csv_field(&row.status),
                row.degenerate,
                csv_field(&row.params),
            )?;
        }
        tracing::info!(path = %self.path.display(), rows = table.len(), "results written");
        Ok(())
    }
}

/// Quote a field when it holds a delimiter, quote, or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn str_col(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = df
        .column(name)
        .map_err(|_| EvalError::DataError(format!("results column '{}' not found", name)))?
        .as_materialized_series()
        .cast(&DataType::String)
        .map_err(|e| EvalError::DataError(e.to_string()))?;
    let ca = series.str().map_err(|e| EvalError::DataError(e.to_string()))?;
    Ok(ca
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

fn usize_col(df: &DataFrame, name: &str) -> Result<Vec<usize>> {
    let series = df
        .column(name)
        .map_err(|_| EvalError::DataError(format!("results column '{}' not found", name)))?
        .as_materialized_series()
        .cast(&DataType::Int64)
        .map_err(|e| EvalError::DataError(e.to_string()))?;
    let ca = series.i64().map_err(|e| EvalError::DataError(e.to_string()))?;
    ca.into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.and_then(|v| usize::try_from(v).ok()).ok_or_else(|| {
                EvalError::DataError(format!("results column '{}' invalid at row {}", name, i))
            })
        })
        .collect()
}

fn bool_col(df: &DataFrame, name: &str) -> Result<Vec<bool>> {
    let values = str_col(df, name)?;
    values
        .iter()
        .enumerate()
        .map(|(i, v)| match v.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(EvalError::DataError(format!(
                "results column '{}' invalid at row {}",
                name, i
            ))),
        })
        .collect()
}

fn opt_f64_col(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = df
        .column(name)
        .map_err(|_| EvalError::DataError(format!("results column '{}' not found", name)))?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .map_err(|e| EvalError::DataError(e.to_string()))?;
    let ca = series.f64().map_err(|e| EvalError::DataError(e.to_string()))?;
    Ok(ca.into_iter().collect())
}
