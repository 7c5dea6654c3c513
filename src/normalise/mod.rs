//! Per-partition feature scaling
//!
//! Standardises features (z-score) with statistics scoped by policy. Apart
//! from the `all` scope, statistics are always derived exclusively from the
//! train partition of the fold in which they are used.

use crate::error::{EvalError, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Normalisation scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormScope {
    /// Identity transform.
    None,
    /// One statistic over the entire dataset, computed once per run. A
    /// documented leak-tolerant baseline, not per-fold leakage.
    All,
    /// One statistic per fold, from that fold's training partition only.
    Online,
    /// Per-group statistics over the named grouping key ("speaker",
    /// "language", ...). Test rows fall back to a train-global statistic
    /// when their group is absent from the training partition.
    PerGroup(String),
}

impl NormScope {
    /// Parse the `normalise` config value. Anything other than the
    /// reserved words names a grouping key.
    pub fn parse(value: &str) -> Self {
        match value {
            "none" => NormScope::None,
            "all" => NormScope::All,
            "online" => NormScope::Online,
            key => NormScope::PerGroup(key.to_string()),
        }
    }
}

/// Per-feature location/scale statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStats {
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl FeatureStats {
    /// Fit mean and population standard deviation per feature column.
    /// Zero variance clamps the scale to 1 so constant features pass
    /// through unchanged.
    pub fn fit(x: ArrayView2<'_, f64>) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(EvalError::DataError(
                "cannot fit normalisation statistics on an empty partition".to_string(),
            ));
        }
        let mean = x.mean_axis(Axis(0)).ok_or_else(|| {
            EvalError::DataError("failed to compute feature means".to_string())
        })?;
        let mut std = x.std_axis(Axis(0), 0.0);
        std.mapv_inplace(|s| if s == 0.0 { 1.0 } else { s });
        Ok(Self { mean, std })
    }

    /// Scale one row in place.
    fn scale_row(&self, row: &mut [f64]) {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (*v - self.mean[j]) / self.std[j];
        }
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn std(&self) -> &Array1<f64> {
        &self.std
    }
}

/// A fitted, fold-scoped transform. Created once per fold, consumed
/// immediately, discarded after the fold.
#[derive(Debug, Clone)]
pub enum FoldTransform {
    Identity,
    Global(FeatureStats),
    PerGroup {
        stats: HashMap<usize, FeatureStats>,
        /// Train-global statistic for test groups unseen in train.
        fallback: FeatureStats,
    },
}

impl FoldTransform {
    /// Transform the rows of `x` selected by `indices`, returning a fresh
    /// matrix. `row_groups` gives the group id of every row of `x` and is
    /// only consulted by the per-group transform.
    pub fn gather(
        &self,
        x: &Array2<f64>,
        indices: &[usize],
        row_groups: Option<&[usize]>,
    ) -> Result<Array2<f64>> {
        let n_features = x.ncols();
        let mut out = Array2::zeros((indices.len(), n_features));

        for (r, &i) in indices.iter().enumerate() {
            let mut row: Vec<f64> = x.row(i).to_vec();
            match self {
                FoldTransform::Identity => {}
                FoldTransform::Global(stats) => stats.scale_row(&mut row),
                FoldTransform::PerGroup { stats, fallback } => {
                    let groups = row_groups.ok_or_else(|| {
                        EvalError::DataError(
                            "per-group transform requires a grouping vector".to_string(),
                        )
                    })?;
                    match stats.get(&groups[i]) {
                        Some(s) => s.scale_row(&mut row),
                        None => fallback.scale_row(&mut row),
                    }
                }
            }
            out.row_mut(r).assign(&Array1::from(row));
        }

        Ok(out)
    }
}

/// Computes fold-scoped transforms under a fixed scope.
pub struct Normaliser {
    scope: NormScope,
    /// Pre-fitted whole-dataset statistic, only under [`NormScope::All`].
    all_stats: Option<FeatureStats>,
}

impl Normaliser {
    /// Create a normaliser. Under the `all` scope the global statistic is
    /// fitted here, once, from the full feature matrix.
    pub fn new(scope: NormScope, x: &Array2<f64>) -> Result<Self> {
        let all_stats = match scope {
            NormScope::All => Some(FeatureStats::fit(x.view())?),
            _ => None,
        };
        Ok(Self { scope, all_stats })
    }

    pub fn scope(&self) -> &NormScope {
        &self.scope
    }

    /// Fit a transform for one fold. Statistics are derived from the rows
    /// of `x` selected by `train_indices` only (`all` scope excepted, by
    /// contract). `row_groups` must cover every row of `x` when the scope
    /// is per-group.
    pub fn fit_fold(
        &self,
        x: &Array2<f64>,
        train_indices: &[usize],
        row_groups: Option<&[usize]>,
    ) -> Result<FoldTransform> {
        match &self.scope {
            NormScope::None => Ok(FoldTransform::Identity),
            NormScope::All => {
                let stats = self
                    .all_stats
                    .clone()
                    .ok_or(EvalError::ModelNotFitted)?;
                Ok(FoldTransform::Global(stats))
            }
            NormScope::Online => {
                let train = gather_rows(x, train_indices);
                Ok(FoldTransform::Global(FeatureStats::fit(train.view())?))
            }
            NormScope::PerGroup(key) => {
                let groups = row_groups.ok_or_else(|| {
                    EvalError::ConfigError(format!(
                        "normalise: grouping key '{}' not supplied for per-group scope",
                        key
                    ))
                })?;

                let train = gather_rows(x, train_indices);
                let fallback = FeatureStats::fit(train.view())?;

                let mut by_group: HashMap<usize, Vec<usize>> = HashMap::new();
                for &i in train_indices {
                    by_group.entry(groups[i]).or_default().push(i);
                }

                let mut stats = HashMap::with_capacity(by_group.len());
                for (g, idx) in by_group {
                    let sub = gather_rows(x, &idx);
                    stats.insert(g, FeatureStats::fit(sub.view())?);
                }

                Ok(FoldTransform::PerGroup { stats, fallback })
            }
        }
    }
}

/// Copy the selected rows of `x` into a fresh matrix.
pub fn gather_rows(x: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    let mut out = Array2::zeros((indices.len(), x.ncols()));
    for (r, &i) in indices.iter().enumerate() {
        out.row_mut(r).assign(&x.row(i));
    }
    out
}
