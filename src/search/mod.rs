//! Nested hyperparameter grid search
//!
//! Searches a parameter grid over inner cross-validation folds drawn from
//! one outer fold's training data only. The Partitioner and Normaliser
//! contracts are reused recursively at exactly one nesting level; the
//! scoring metric is UAR. Ties resolve to the first candidate in grid
//! enumeration order.

use crate::classifier::{ClassifierConfig, ClassifierRegistry, ParamValue};
use crate::error::{EvalError, Result};
use crate::metrics::ConfusionMatrix;
use crate::normalise::Normaliser;
use crate::partition::{stratified_k_fold, GroupKFoldPolicy, GroupPartitioner};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ordered hyperparameter grid. Axis order is the file's key order;
/// expansion varies the last axis fastest, so enumeration order is
/// deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamGrid {
    axes: Vec<(String, Vec<ParamValue>)>,
}

impl ParamGrid {
    pub fn new(axes: Vec<(String, Vec<ParamValue>)>) -> Self {
        Self { axes }
    }

    /// Parse a YAML mapping of `param: [values...]`, preserving key order.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mapping: serde_yaml::Mapping = serde_yaml::from_str(text)?;
        let mut axes = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let name = key
                .as_str()
                .ok_or_else(|| {
                    EvalError::ConfigError("param_grid: axis names must be strings".to_string())
                })?
                .to_string();
            let values: Vec<ParamValue> = serde_yaml::from_value(value).map_err(|e| {
                EvalError::ConfigError(format!(
                    "param_grid: axis '{}' must be a list of scalars: {}",
                    name, e
                ))
            })?;
            if values.is_empty() {
                return Err(EvalError::ConfigError(format!(
                    "param_grid: axis '{}' is empty",
                    name
                )));
            }
            axes.push((name, values));
        }
        Ok(Self { axes })
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn n_candidates(&self) -> usize {
        if self.axes.is_empty() {
            0
        } else {
            self.axes.iter().map(|(_, v)| v.len()).product()
        }
    }

    /// Expand the full grid in enumeration order.
    pub fn candidates(&self) -> Vec<ClassifierConfig> {
        if self.axes.is_empty() {
            return Vec::new();
        }
        let mut out = vec![ClassifierConfig::new()];
        for (name, values) in &self.axes {
            let mut next = Vec::with_capacity(out.len() * values.len());
            for config in &out {
                for v in values {
                    next.push(config.clone().set(name, v.clone()));
                }
            }
            out = next;
        }
        out
    }
}

/// Inner partitioning policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InnerPolicy {
    /// Fold count for the inner split; -1 is leave-one-group-out
    /// (group-aware mode only).
    pub inner_kfold: i32,
    /// Disable group-awareness: ordinary stratified folds. Used when the
    /// training partition's group cardinality is too low for a second
    /// grouping level.
    pub noinner_group: bool,
    pub seed: u64,
}

/// Nested grid search over one outer fold's training data.
pub struct InnerSearch<'a> {
    registry: &'a ClassifierRegistry,
    clf_id: &'a str,
    base_config: &'a ClassifierConfig,
    normaliser: &'a Normaliser,
    policy: InnerPolicy,
}

impl<'a> InnerSearch<'a> {
    pub fn new(
        registry: &'a ClassifierRegistry,
        clf_id: &'a str,
        base_config: &'a ClassifierConfig,
        normaliser: &'a Normaliser,
        policy: InnerPolicy,
    ) -> Self {
        Self {
            registry,
            clf_id,
            base_config,
            normaliser,
            policy,
        }
    }

    /// Select the best grid candidate by mean UAR over the inner folds.
    ///
    /// `x_train` / `y_train` / `groups_train` are the outer fold's training
    /// partition, unnormalised: each inner fold fits its own transform from
    /// its own inner-train rows, so no inner-test statistic ever reaches
    /// training. `norm_groups` carries the normalisation grouping when it
    /// differs from the partition grouping.
    pub fn select(
        &self,
        x_train: &Array2<f64>,
        y_train: &[usize],
        groups_train: &[usize],
        norm_groups: Option<&[usize]>,
        n_classes: usize,
        grid: &ParamGrid,
    ) -> Result<ClassifierConfig> {
        if grid.is_empty() {
            return Err(EvalError::ConfigError(
                "param_grid: grid is empty".to_string(),
            ));
        }

        let splits = self.inner_splits(y_train, groups_train)?;
        if splits.is_empty() {
            return Err(EvalError::ConfigError(
                "inner_kfold: inner split produced no folds".to_string(),
            ));
        }

        let mut best: Option<(f64, ClassifierConfig)> = None;

        for candidate in grid.candidates() {
            let config = self.base_config.overlaid_with(&candidate);
            let mut scores = Vec::with_capacity(splits.len());

            for (inner_train, inner_test) in &splits {
                let score = self.score_split(
                    x_train,
                    y_train,
                    norm_groups,
                    n_classes,
                    &config,
                    inner_train,
                    inner_test,
                )?;
                scores.push(score);
            }

            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            tracing::debug!(candidate = %config.to_json().unwrap_or_default(), uar = mean, "inner fold score");

            // Strictly-greater comparison keeps the first candidate on ties.
            match &best {
                Some((best_score, _)) if mean <= *best_score => {}
                _ => best = Some((mean, config)),
            }
        }

        best.map(|(_, c)| c).ok_or_else(|| {
            EvalError::ConfigError("param_grid: no candidate could be scored".to_string())
        })
    }

    /// Inner train/test index pairs, indices relative to the outer training
    /// partition.
    fn inner_splits(
        &self,
        y_train: &[usize],
        groups_train: &[usize],
    ) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        if self.policy.noinner_group {
            let k = usize::try_from(self.policy.inner_kfold).map_err(|_| {
                EvalError::ConfigError(format!(
                    "inner_kfold: must be positive when noinner_group is set, got {}",
                    self.policy.inner_kfold
                ))
            })?;
            return stratified_k_fold(y_train, k);
        }

        let mut distinct = groups_train.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if self.policy.inner_kfold > 0 && distinct.len() < self.policy.inner_kfold as usize {
            return Err(EvalError::ConfigError(format!(
                "inner_kfold: {} folds requested but only {} distinct groups in the training partition",
                self.policy.inner_kfold,
                distinct.len()
            )));
        }

        let partitioner = GroupPartitioner::new(GroupKFoldPolicy {
            kfold: self.policy.inner_kfold,
            seed: self.policy.seed,
        });
        let plan = partitioner.plan(groups_train)?;
        Ok(plan
            .iter(groups_train, y_train)
            .map(|f| (f.train_indices, f.test_indices))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn score_split(
        &self,
        x_train: &Array2<f64>,
        y_train: &[usize],
        norm_groups: Option<&[usize]>,
        n_classes: usize,
        config: &ClassifierConfig,
        inner_train: &[usize],
        inner_test: &[usize],
    ) -> Result<f64> {
        let transform = self.normaliser.fit_fold(x_train, inner_train, norm_groups)?;
        let x_fit = transform.gather(x_train, inner_train, norm_groups)?;
        let x_eval = transform.gather(x_train, inner_test, norm_groups)?;

        let y_fit: Vec<usize> = inner_train.iter().map(|&i| y_train[i]).collect();
        let y_eval: Vec<usize> = inner_test.iter().map(|&i| y_train[i]).collect();

        let mut model = self.registry.build(self.clf_id, config)?;
        model.fit(&x_fit, &y_fit, n_classes, None).map_err(|e| {
            EvalError::ConfigError(format!(
                "inner fold fit failed for candidate {}: {}",
                config.to_json().unwrap_or_default(),
                e
            ))
        })?;
        let pred = model.predict(&x_eval)?;

        let cm = ConfusionMatrix::from_predictions(&y_eval, &pred, n_classes)?;
        Ok(cm.uar())
    }
}
