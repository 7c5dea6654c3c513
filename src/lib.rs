//! emocv - Grouped, nested cross-validation evaluation engine
//!
//! Evaluates classification models under speaker-grouped (or otherwise
//! grouped) cross-validation protocols:
//! - Leave-one-group-out and leave-one-group-set-out partitioning
//! - Per-partition feature normalisation (global / per-group / online)
//! - Nested hyperparameter grid search without outer-fold leakage
//! - Per-fold result aggregation and persistence
//!
//! # Modules
//!
//! ## Evaluation engine
//! - [`partition`] - Group-aware fold planning
//! - [`normalise`] - Per-partition feature scaling
//! - [`search`] - Nested hyperparameter grid search
//! - [`runner`] - Fold execution and run aggregation
//! - [`results`] - Results table persistence
//!
//! ## Data & models
//! - [`dataset`] - Aligned (features, labels, groups) loading
//! - [`classifier`] - Classifier trait, config, and factory registry
//! - [`metrics`] - Confusion matrix, accuracy, UAR
//!
//! ## Services
//! - [`config`] - Run configuration (YAML, eagerly validated)
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Evaluation engine
pub mod partition;
pub mod normalise;
pub mod search;
pub mod runner;
pub mod results;

// Data & models
pub mod dataset;
pub mod classifier;
pub mod metrics;

// Services
pub mod config;
pub mod cli;

pub use error::{EvalError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{EvalError, Result};

    // Configuration
    pub use crate::config::RunConfig;

    // Dataset
    pub use crate::dataset::{Dataset, DatasetLoader, GroupMap, Grouping};

    // Partitioning
    pub use crate::partition::{Fold, FoldPlan, GroupKFoldPolicy, GroupPartitioner};

    // Normalisation
    pub use crate::normalise::{FeatureStats, FoldTransform, NormScope, Normaliser};

    // Search
    pub use crate::search::{InnerPolicy, InnerSearch, ParamGrid};

    // Classifiers
    pub use crate::classifier::{Classifier, ClassifierConfig, ClassifierRegistry, ParamValue};

    // Metrics
    pub use crate::metrics::ConfusionMatrix;

    // Running & aggregation
    pub use crate::runner::{
        Aggregator, CancelToken, FailureKind, FoldOutcome, FoldResult, FoldRunner, RunSummary,
    };

    // Persistence
    pub use crate::results::{ResultRow, ResultsStore};
}
