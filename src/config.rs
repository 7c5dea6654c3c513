//! Run configuration
//!
//! One YAML document describes one evaluation run: which dataset, how to
//! partition and normalise it, which classifier, whether to search, and
//! where results go. Validation is eager and names the offending option,
//! so a bad run fails before any fold is dispatched.

use crate::classifier::{ClassifierConfig, ParamValue};
use crate::error::{EvalError, Result};
use crate::normalise::NormScope;
use crate::partition::GroupKFoldPolicy;
use crate::search::InnerPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_partition() -> String {
    "speaker".to_string()
}

fn default_kfold() -> i32 {
    -1
}

fn default_normalise() -> String {
    "online".to_string()
}

/// One evaluation run, as loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub corpus: String,
    /// Feature-matrix CSV (`name` column + numeric feature columns).
    pub features: PathBuf,
    /// Metadata CSV (`name`, `label`, grouping columns).
    pub labels: PathBuf,
    pub feature_set: String,

    /// Grouping key used for the outer partition.
    #[serde(default = "default_partition")]
    pub partition: String,
    /// -1 for leave-one-group-out, otherwise the number of group subsets.
    #[serde(default = "default_kfold")]
    pub kfold: i32,
    /// `none`, `all`, `online`, or a grouping key for per-group scaling.
    #[serde(default = "default_normalise")]
    pub normalise: String,

    /// Inner fold count when a parameter grid is searched; defaults to 2.
    #[serde(default)]
    pub inner_kfold: Option<i32>,
    /// Use stratified instead of group-aware inner folds.
    #[serde(default)]
    pub noinner_group: bool,
    /// Weight training instances inversely to class frequency.
    #[serde(default)]
    pub balanced: bool,

    /// Classifier id in the registry.
    pub clf: String,
    /// YAML file of fixed hyperparameters.
    #[serde(default)]
    pub clf_args: Option<PathBuf>,
    /// Shortcut hyperparameters, overlaid on `clf_args`.
    #[serde(default)]
    pub epochs: Option<u64>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// YAML file mapping parameter names to candidate value lists.
    #[serde(default)]
    pub param_grid: Option<PathBuf>,
    /// YAML file mapping raw group names to aggregation buckets.
    #[serde(default)]
    pub map_groups: Option<PathBuf>,

    pub results: PathBuf,
    #[serde(default)]
    pub append: bool,

    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub parallel: bool,
    /// Per-fold wall-clock budget, checked between pipeline stages.
    #[serde(default)]
    pub fold_timeout_secs: Option<u64>,
}

impl RunConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EvalError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let config: RunConfig = serde_yaml::from_str(&text)
            .map_err(|e| EvalError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Check every option before any data is touched.
    pub fn validate(&self) -> Result<()> {
        if self.corpus.is_empty() {
            return Err(EvalError::ConfigError("corpus: must not be empty".to_string()));
        }
        if self.clf.is_empty() {
            return Err(EvalError::ConfigError("clf: must not be empty".to_string()));
        }
        if self.kfold != -1 && self.kfold <= 0 {
            return Err(EvalError::ConfigError(format!(
                "kfold: must be -1 (leave-one-group-out) or positive, got {}",
                self.kfold
            )));
        }
        if let Some(inner) = self.inner_kfold {
            if inner != -1 && inner <= 0 {
                return Err(EvalError::ConfigError(format!(
                    "inner_kfold: must be -1 or positive, got {}",
                    inner
                )));
            }
            if self.noinner_group && inner == -1 {
                return Err(EvalError::ConfigError(
                    "inner_kfold: leave-one-group-out requires group-aware inner folds; \
                     unset noinner_group or give a positive count"
                        .to_string(),
                ));
            }
        }
        if self.inner_kfold.is_some() && self.param_grid.is_none() {
            return Err(EvalError::ConfigError(
                "inner_kfold: set without a param_grid to search".to_string(),
            ));
        }
        if self.fold_timeout_secs == Some(0) {
            return Err(EvalError::ConfigError(
                "fold_timeout_secs: must be positive when set".to_string(),
            ));
        }

        for (option, path) in [
            ("features", Some(&self.features)),
            ("labels", Some(&self.labels)),
            ("clf_args", self.clf_args.as_ref()),
            ("param_grid", self.param_grid.as_ref()),
            ("map_groups", self.map_groups.as_ref()),
        ] {
            if let Some(path) = path {
                if !path.exists() {
                    return Err(EvalError::ConfigError(format!(
                        "{}: file not found: {}",
                        option,
                        path.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Base hyperparameters: the `clf_args` file, with the shortcut
    /// options overlaid.
    pub fn classifier_config(&self) -> Result<ClassifierConfig> {
        let mut config = match &self.clf_args {
            Some(path) => ClassifierConfig::from_yaml_file(path)?,
            None => ClassifierConfig::new(),
        };
        if let Some(epochs) = self.epochs {
            config = config.set("epochs", ParamValue::Int(epochs as i64));
        }
        if let Some(lr) = self.learning_rate {
            config = config.set("learning_rate", ParamValue::Float(lr));
        }
        Ok(config)
    }

    pub fn partition_policy(&self) -> GroupKFoldPolicy {
        GroupKFoldPolicy {
            kfold: self.kfold,
            seed: self.seed,
        }
    }

    pub fn norm_scope(&self) -> NormScope {
        NormScope::parse(&self.normalise)
    }

    /// Inner search policy; `None` when no grid is configured.
    pub fn inner_policy(&self) -> Option<InnerPolicy> {
        self.param_grid.as_ref().map(|_| InnerPolicy {
            inner_kfold: self.inner_kfold.unwrap_or(2),
            noinner_group: self.noinner_group,
            seed: self.seed,
        })
    }

    pub fn fold_timeout(&self) -> Option<Duration> {
        self.fold_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn minimal_yaml(dir: &TempDir) -> String {
        let features = dir.path().join("features.csv");
        let labels = dir.path().join("labels.csv");
        std::fs::File::create(&features)
            .unwrap()
            .write_all(b"name,f1\n")
            .unwrap();
        std::fs::File::create(&labels)
            .unwrap()
            .write_all(b"name,label,speaker\n")
            .unwrap();
        format!(
            "corpus: emodb\nfeatures: {}\nlabels: {}\nfeature_set: egemaps\n\
             clf: centroid\nresults: {}\n",
            features.display(),
            labels.display(),
            dir.path().join("results.csv").display()
        )
    }

    #[test]
    fn test_defaults_applied() {
        let dir = TempDir::new().unwrap();
        let config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        assert_eq!(config.partition, "speaker");
        assert_eq!(config.kfold, -1);
        assert_eq!(config.normalise, "online");
        assert!(!config.balanced);
        assert!(!config.append);
        assert_eq!(config.seed, 0);
        config.validate().unwrap();
        assert!(config.inner_policy().is_none());
    }

    #[test]
    fn test_invalid_kfold_named_in_error() {
        let dir = TempDir::new().unwrap();
        let mut config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        config.kfold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("kfold"));
    }

    #[test]
    fn test_inner_kfold_requires_grid() {
        let dir = TempDir::new().unwrap();
        let mut config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        config.inner_kfold = Some(2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("param_grid"));
    }

    #[test]
    fn test_missing_file_named_in_error() {
        let dir = TempDir::new().unwrap();
        let mut config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        config.features = PathBuf::from("/nonexistent/features.csv");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("features"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        config.fold_timeout_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shortcut_hyperparameters_overlaid() {
        let dir = TempDir::new().unwrap();
        let mut config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        config.epochs = Some(300);
        config.learning_rate = Some(0.05);
        let params = config.classifier_config().unwrap();
        assert_eq!(params.get_usize("epochs"), Some(300));
        assert_eq!(params.get_f64("learning_rate"), Some(0.05));
    }

    #[test]
    fn test_norm_scope_and_policy_accessors() {
        let dir = TempDir::new().unwrap();
        let mut config: RunConfig = serde_yaml::from_str(&minimal_yaml(&dir)).unwrap();
        config.normalise = "speaker".to_string();
        assert_eq!(config.norm_scope(), NormScope::PerGroup("speaker".into()));
        assert_eq!(config.partition_policy().kfold, -1);
    }
}
