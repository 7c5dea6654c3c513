//! Fold execution and run aggregation
//!
//! [`FoldRunner`] drives one outer fold through the fixed pipeline
//! (normalise, optional inner search, fit, score) and turns any per-fold
//! error into a recorded [`FoldOutcome`] instead of aborting the run.
//! [`Aggregator`] executes a whole fold plan, sequentially or across a
//! rayon pool, and collapses the outcomes into a [`RunSummary`].

use crate::classifier::{balanced_sample_weights, Classifier, ClassifierConfig, ClassifierRegistry};
use crate::config::RunConfig;
use crate::dataset::{DatasetLoader, GroupMap, Grouping};
use crate::error::{EvalError, Result};
use crate::metrics::{mean_std, ConfusionMatrix};
use crate::normalise::Normaliser;
use crate::partition::{Fold, FoldPlan};
use crate::search::{InnerPolicy, InnerSearch, ParamGrid};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the driver and any thread
/// that wants to stop the run. Folds already dispatched run to completion;
/// pending folds are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a fold failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Unusable partition data (e.g. a single-class training split).
    Data,
    /// Model training failed.
    Fit,
    /// Prediction or metric computation failed.
    Score,
    /// The fold exceeded its wall-clock budget.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Data => write!(f, "data"),
            FailureKind::Fit => write!(f, "fit"),
            FailureKind::Score => write!(f, "score"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Metrics of one successfully scored fold.
#[derive(Debug, Clone)]
pub struct FoldResult {
    pub fold_idx: usize,
    /// Group ids tested by this fold.
    pub test_groups: Vec<usize>,
    pub n_test: usize,
    /// Partition group id of each test instance, aligned with `predicted`.
    pub instance_groups: Vec<usize>,
    /// Predicted class ids for the test split, in test-index order.
    pub predicted: Vec<usize>,
    /// True class ids for the test split, aligned with `predicted`.
    pub targets: Vec<usize>,
    /// Per-class score matrix, when the backend provides one.
    pub scores: Option<Array2<f64>>,
    pub confusion: ConfusionMatrix,
    pub uar: f64,
    pub accuracy: f64,
    /// The hyperparameters the model was actually fitted with (base config
    /// plus any searched grid point).
    pub params: ClassifierConfig,
    /// Test split held fewer than 2 distinct classes; the UAR is
    /// low-confidence.
    pub degenerate: bool,
    pub elapsed: Duration,
}

/// Terminal state of one fold. Failures carry enough context to be
/// persisted alongside successes.
#[derive(Debug, Clone)]
pub enum FoldOutcome {
    Success(Box<FoldResult>),
    Failure {
        fold_idx: usize,
        test_groups: Vec<usize>,
        kind: FailureKind,
        message: String,
    },
}

impl FoldOutcome {
    pub fn fold_idx(&self) -> usize {
        match self {
            FoldOutcome::Success(r) => r.fold_idx,
            FoldOutcome::Failure { fold_idx, .. } => *fold_idx,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FoldOutcome::Success(_))
    }
}

/// Executes one outer fold: normalise, optionally search, fit, score.
///
/// Holds only shared borrows, so a single runner can be driven from a rayon
/// pool. Every fallible stage is mapped to a [`FoldOutcome::Failure`]; the
/// runner itself never returns an error.
pub struct FoldRunner<'a> {
    x: &'a Array2<f64>,
    y: &'a [usize],
    n_classes: usize,
    /// Partition grouping, one id per instance. Reused for the inner split.
    part_groups: &'a [usize],
    /// Normalisation grouping, when the scope is per-group.
    norm_groups: Option<&'a [usize]>,
    normaliser: &'a Normaliser,
    registry: &'a ClassifierRegistry,
    clf_id: &'a str,
    base_config: &'a ClassifierConfig,
    search: Option<(&'a ParamGrid, InnerPolicy)>,
    balanced: bool,
    timeout: Option<Duration>,
}

impl<'a> FoldRunner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x: &'a Array2<f64>,
        y: &'a [usize],
        n_classes: usize,
        part_groups: &'a [usize],
        normaliser: &'a Normaliser,
        registry: &'a ClassifierRegistry,
        clf_id: &'a str,
        base_config: &'a ClassifierConfig,
    ) -> Self {
        Self {
            x,
            y,
            n_classes,
            part_groups,
            norm_groups: None,
            normaliser,
            registry,
            clf_id,
            base_config,
            search: None,
            balanced: false,
            timeout: None,
        }
    }

    pub fn with_norm_groups(mut self, groups: &'a [usize]) -> Self {
        self.norm_groups = Some(groups);
        self
    }

    pub fn with_search(mut self, grid: &'a ParamGrid, policy: InnerPolicy) -> Self {
        self.search = Some((grid, policy));
        self
    }

    pub fn balanced(mut self, enabled: bool) -> Self {
        self.balanced = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run one fold to its terminal outcome.
    pub fn run(&self, fold: &Fold) -> FoldOutcome {
        let start = Instant::now();
        match self.run_stages(fold, start) {
            Ok(result) => FoldOutcome::Success(Box::new(result)),
            Err((kind, message)) => {
                tracing::warn!(fold = fold.fold_idx, %kind, %message, "fold failed");
                FoldOutcome::Failure {
                    fold_idx: fold.fold_idx,
                    test_groups: fold.test_groups.clone(),
                    kind,
                    message,
                }
            }
        }
    }

    fn run_stages(
        &self,
        fold: &Fold,
        start: Instant,
    ) -> std::result::Result<FoldResult, (FailureKind, String)> {
        let mut train_classes: Vec<usize> =
            fold.train_indices.iter().map(|&i| self.y[i]).collect();
        train_classes.sort_unstable();
        train_classes.dedup();
        if train_classes.len() < 2 {
            return Err((
                FailureKind::Data,
                format!(
                    "training partition holds {} class(es); need at least 2",
                    train_classes.len()
                ),
            ));
        }

        let config = self.resolve_config(fold, start)?;
        self.check_deadline(start, "search")?;

        let transform = self
            .normaliser
            .fit_fold(self.x, &fold.train_indices, self.norm_groups)
            .map_err(|e| (FailureKind::Data, e.to_string()))?;
        let x_train = transform
            .gather(self.x, &fold.train_indices, self.norm_groups)
            .map_err(|e| (FailureKind::Data, e.to_string()))?;
        let x_test = transform
            .gather(self.x, &fold.test_indices, self.norm_groups)
            .map_err(|e| (FailureKind::Data, e.to_string()))?;
        self.check_deadline(start, "normalise")?;

        let y_train: Vec<usize> = fold.train_indices.iter().map(|&i| self.y[i]).collect();
        let y_test: Vec<usize> = fold.test_indices.iter().map(|&i| self.y[i]).collect();

        let mut model = self
            .registry
            .build(self.clf_id, &config)
            .map_err(|e| (FailureKind::Fit, e.to_string()))?;

        let weights = self
            .balanced
            .then(|| balanced_sample_weights(&y_train, self.n_classes));
        self.fit(
            &mut *model,
            &x_train,
            &y_train,
            weights.as_ref().and_then(|w| w.as_slice()),
        )
        .map_err(|e| (FailureKind::Fit, e.to_string()))?;
        self.check_deadline(start, "fit")?;

        let pred = model
            .predict(&x_test)
            .map_err(|e| (FailureKind::Score, e.to_string()))?;
        let scores = model
            .predict_proba(&x_test)
            .map_err(|e| (FailureKind::Score, e.to_string()))?;
        let confusion = ConfusionMatrix::from_predictions(&y_test, &pred, self.n_classes)
            .map_err(|e| (FailureKind::Score, e.to_string()))?;
        self.check_deadline(start, "score")?;

        Ok(FoldResult {
            fold_idx: fold.fold_idx,
            test_groups: fold.test_groups.clone(),
            n_test: fold.test_indices.len(),
            instance_groups: fold
                .test_indices
                .iter()
                .map(|&i| self.part_groups[i])
                .collect(),
            predicted: pred,
            targets: y_test,
            scores,
            uar: confusion.uar(),
            accuracy: confusion.accuracy(),
            confusion,
            params: config,
            degenerate: fold.degenerate,
            elapsed: start.elapsed(),
        })
    }

    fn fit(
        &self,
        model: &mut dyn Classifier,
        x: &Array2<f64>,
        y: &[usize],
        weights: Option<&[f64]>,
    ) -> Result<()> {
        model.fit(x, y, self.n_classes, weights)
    }

    /// Resolve the fold's hyperparameters, running the inner search if a
    /// grid is configured. A misconfigured search (too few groups, empty
    /// grid) falls back to the base configuration instead of failing the
    /// fold.
    fn resolve_config(
        &self,
        fold: &Fold,
        _start: Instant,
    ) -> std::result::Result<ClassifierConfig, (FailureKind, String)> {
        let Some((grid, policy)) = self.search else {
            return Ok(self.base_config.clone());
        };

        let x_train = crate::normalise::gather_rows(self.x, &fold.train_indices);
        let y_train: Vec<usize> = fold.train_indices.iter().map(|&i| self.y[i]).collect();
        let groups_train: Vec<usize> = fold
            .train_indices
            .iter()
            .map(|&i| self.part_groups[i])
            .collect();
        let norm_groups_train: Option<Vec<usize>> = self
            .norm_groups
            .map(|ng| fold.train_indices.iter().map(|&i| ng[i]).collect());

        let search = InnerSearch::new(
            self.registry,
            self.clf_id,
            self.base_config,
            self.normaliser,
            policy,
        );
        match search.select(
            &x_train,
            &y_train,
            &groups_train,
            norm_groups_train.as_deref(),
            self.n_classes,
            grid,
        ) {
            Ok(config) => Ok(config),
            Err(EvalError::ConfigError(msg)) => {
                tracing::warn!(
                    fold = fold.fold_idx,
                    %msg,
                    "inner search not applicable; using base configuration"
                );
                Ok(self.base_config.clone())
            }
            Err(e) => Err((FailureKind::Data, e.to_string())),
        }
    }

    fn check_deadline(
        &self,
        start: Instant,
        stage: &str,
    ) -> std::result::Result<(), (FailureKind, String)> {
        match self.timeout {
            Some(limit) if start.elapsed() > limit => Err((
                FailureKind::Timeout,
                format!(
                    "exceeded {:.1}s budget after {} stage",
                    limit.as_secs_f64(),
                    stage
                ),
            )),
            _ => Ok(()),
        }
    }
}

/// Aggregated view of one complete run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Per-fold outcomes in plan order. Folds skipped by cancellation are
    /// absent.
    pub outcomes: Vec<FoldOutcome>,
    /// Confusion counts pooled over successful folds.
    pub pooled: ConfusionMatrix,
    pub fold_uars: Vec<f64>,
    pub mean_uar: f64,
    pub std_uar: f64,
    pub pooled_uar: f64,
    pub pooled_accuracy: f64,
    /// UAR per aggregation bucket (group-map buckets, or raw group names
    /// when no map is configured).
    pub bucket_uars: BTreeMap<String, f64>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn n_success(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn n_failed(&self) -> usize {
        self.outcomes.len() - self.n_success()
    }
}

/// Drives a fold plan through a [`FoldRunner`] and aggregates the outcomes.
#[derive(Default)]
pub struct Aggregator {
    parallel: bool,
    cancel: CancelToken,
    group_map: Option<GroupMap>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute folds across the rayon pool instead of sequentially.
    pub fn parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Merge fold metrics into coarser buckets (e.g. speakers into
    /// sessions) when reporting per-group UARs. Partitioning and
    /// normalisation always see the raw groups.
    pub fn with_group_map(mut self, map: GroupMap) -> Self {
        self.group_map = Some(map);
        self
    }

    /// Run every fold of `plan` and fold the outcomes into a summary.
    /// `grouping` is the partition grouping the plan was built over.
    pub fn run(
        &self,
        runner: &FoldRunner<'_>,
        plan: &FoldPlan,
        grouping: &Grouping,
        labels: &[usize],
        n_classes: usize,
    ) -> Result<RunSummary> {
        let outcomes = if self.parallel {
            let folds: Vec<Fold> = plan.iter(&grouping.indices, labels).collect();
            folds
                .par_iter()
                .filter_map(|fold| {
                    if self.cancel.is_cancelled() {
                        None
                    } else {
                        Some(runner.run(fold))
                    }
                })
                .collect()
        } else {
            let mut out = Vec::with_capacity(plan.n_folds());
            for fold in plan.iter(&grouping.indices, labels) {
                if self.cancel.is_cancelled() {
                    break;
                }
                out.push(runner.run(&fold));
            }
            out
        };

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            tracing::info!(
                completed = outcomes.len(),
                planned = plan.n_folds(),
                "run cancelled"
            );
        }

        self.summarise(outcomes, grouping, n_classes, cancelled)
    }

    fn summarise(
        &self,
        outcomes: Vec<FoldOutcome>,
        grouping: &Grouping,
        n_classes: usize,
        cancelled: bool,
    ) -> Result<RunSummary> {
        let mut pooled = ConfusionMatrix::new(n_classes);
        let mut fold_uars = Vec::new();
        let mut bucket_cms: BTreeMap<String, ConfusionMatrix> = BTreeMap::new();

        for outcome in &outcomes {
            let FoldOutcome::Success(result) = outcome else {
                continue;
            };
            pooled.merge(&result.confusion)?;
            fold_uars.push(result.uar);

            // Attribute each test instance to its own bucket: a multi-group
            // fold may span buckets, and each bucket must only count the
            // predictions of its own groups.
            for (idx, &g) in result.instance_groups.iter().enumerate() {
                let raw = grouping.names[g].as_str();
                let bucket = match &self.group_map {
                    Some(map) => map.bucket(raw).to_string(),
                    None => raw.to_string(),
                };
                bucket_cms
                    .entry(bucket)
                    .or_insert_with(|| ConfusionMatrix::new(n_classes))
                    .record(result.targets[idx], result.predicted[idx])?;
            }
        }

        let (mean_uar, std_uar) = mean_std(&fold_uars);
        let bucket_uars = bucket_cms
            .into_iter()
            .map(|(bucket, cm)| (bucket, cm.uar()))
            .collect();

        Ok(RunSummary {
            pooled_uar: pooled.uar(),
            pooled_accuracy: pooled.accuracy(),
            pooled,
            fold_uars,
            mean_uar,
            std_uar,
            bucket_uars,
            outcomes,
            cancelled,
        })
    }
}

/// Execute a configured run end to end: load the dataset, plan the folds,
/// evaluate them, persist the result rows, and return the summary.
pub fn execute(config: &RunConfig, cancel: CancelToken) -> Result<RunSummary> {
    config.validate()?;

    let scope = config.norm_scope();
    let mut group_keys = vec![config.partition.as_str()];
    if let crate::normalise::NormScope::PerGroup(key) = &scope {
        if key != &config.partition {
            group_keys.push(key.as_str());
        }
    }
    let dataset = DatasetLoader::new(&config.corpus, &config.feature_set)
        .with_group_keys(&group_keys)
        .load(&config.features, &config.labels)?;
    tracing::info!(
        corpus = %dataset.corpus,
        instances = dataset.n_instances(),
        features = dataset.n_features(),
        classes = dataset.n_classes(),
        "dataset loaded"
    );

    let grouping = dataset.grouping(&config.partition)?;
    let norm_grouping = match &scope {
        crate::normalise::NormScope::PerGroup(key) => Some(dataset.grouping(key)?),
        _ => None,
    };

    let registry = ClassifierRegistry::default();
    if !registry.contains(&config.clf) {
        return Err(EvalError::UnknownClassifier(config.clf.clone()));
    }
    let base_config = config.classifier_config()?;
    let grid = config
        .param_grid
        .as_ref()
        .map(|path| ParamGrid::from_yaml_file(path))
        .transpose()?;

    let plan = crate::partition::GroupPartitioner::new(config.partition_policy())
        .plan(&grouping.indices)?;
    tracing::info!(
        partition = %config.partition,
        groups = grouping.n_groups(),
        folds = plan.n_folds(),
        "fold plan built"
    );

    let normaliser = Normaliser::new(scope, &dataset.x)?;
    let mut runner = FoldRunner::new(
        &dataset.x,
        &dataset.y,
        dataset.n_classes(),
        &grouping.indices,
        &normaliser,
        &registry,
        &config.clf,
        &base_config,
    )
    .balanced(config.balanced);
    if let Some(ng) = norm_grouping {
        runner = runner.with_norm_groups(&ng.indices);
    }
    if let (Some(grid), Some(policy)) = (grid.as_ref(), config.inner_policy()) {
        runner = runner.with_search(grid, policy);
    }
    if let Some(timeout) = config.fold_timeout() {
        runner = runner.with_timeout(timeout);
    }

    let mut aggregator = Aggregator::new()
        .parallel(config.parallel)
        .with_cancel(cancel);
    if let Some(path) = &config.map_groups {
        aggregator = aggregator.with_group_map(GroupMap::from_yaml_file(path)?);
    }

    let summary = aggregator.run(&runner, &plan, grouping, &dataset.y, dataset.n_classes())?;

    let rows: Vec<crate::results::ResultRow> = summary
        .outcomes
        .iter()
        .map(|outcome| {
            crate::results::ResultRow::from_outcome(
                &config.corpus,
                &config.clf,
                &config.feature_set,
                outcome,
                grouping,
            )
        })
        .collect::<Result<_>>()?;
    crate::results::ResultsStore::new(&config.results).save(&rows, config.append)?;

    Ok(summary)
}
