//! Multinomial logistic regression
//!
//! Batch gradient descent on the softmax cross-entropy, zero-initialised
//! weights so training is fully deterministic. Hyperparameters:
//! `learning_rate`, `epochs`, `l2`.

use crate::error::{EvalError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::{Classifier, ClassifierConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    learning_rate: f64,
    epochs: usize,
    l2: f64,
    /// (n_classes x n_features) weight matrix.
    weights: Option<Array2<f64>>,
    bias: Option<Array1<f64>>,
    is_fitted: bool,
}

impl LogisticRegression {
    pub fn new() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 200,
            l2: 0.0,
            weights: None,
            bias: None,
            is_fitted: false,
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let mut model = Self::new();
        if let Some(lr) = config.get_f64("learning_rate") {
            if lr <= 0.0 {
                return Err(EvalError::ConfigError(format!(
                    "learning_rate: must be positive, got {}",
                    lr
                )));
            }
            model.learning_rate = lr;
        }
        if let Some(epochs) = config.get_usize("epochs") {
            model.epochs = epochs;
        }
        if let Some(l2) = config.get_f64("l2") {
            if l2 < 0.0 {
                return Err(EvalError::ConfigError(format!(
                    "l2: must be non-negative, got {}",
                    l2
                )));
            }
            model.l2 = l2;
        }
        Ok(model)
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Row-wise softmax of the logit matrix.
    fn softmax(logits: &Array2<f64>) -> Array2<f64> {
        let mut out = logits.clone();
        for mut row in out.rows_mut() {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }
        out
    }

    fn logits(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let weights = self.weights.as_ref().ok_or(EvalError::ModelNotFitted)?;
        let bias = self.bias.as_ref().ok_or(EvalError::ModelNotFitted)?;
        Ok(x.dot(&weights.t()) + bias)
    }
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for LogisticRegression {
    fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        n_classes: usize,
        sample_weight: Option<&[f64]>,
    ) -> Result<()> {
        let n = x.nrows();
        if n != y.len() {
            return Err(EvalError::ShapeError {
                expected: format!("{} labels", n),
                actual: format!("{}", y.len()),
            });
        }
        if n == 0 {
            return Err(EvalError::DataError("empty training partition".to_string()));
        }

        let mut distinct: Vec<usize> = y.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < 2 {
            return Err(EvalError::FoldError(
                "logistic regression needs at least 2 classes in the training partition"
                    .to_string(),
            ));
        }
        if *distinct.last().unwrap_or(&0) >= n_classes {
            return Err(EvalError::DataError(format!(
                "class id {} out of range ({} classes)",
                distinct.last().unwrap(),
                n_classes
            )));
        }

        let n_features = x.ncols();
        // One-hot targets
        let mut targets = Array2::<f64>::zeros((n, n_classes));
        for (i, &c) in y.iter().enumerate() {
            targets[[i, c]] = 1.0;
        }

        let weights_vec: Array1<f64> = match sample_weight {
            Some(sw) => Array1::from_iter(sw.iter().copied()),
            None => Array1::ones(n),
        };
        let weight_total = weights_vec.sum();

        let mut weights = Array2::<f64>::zeros((n_classes, n_features));
        let mut bias = Array1::<f64>::zeros(n_classes);

        for _ in 0..self.epochs {
            let logits = x.dot(&weights.t()) + &bias;
            let proba = Self::softmax(&logits);

            // Weighted error: (p - t) scaled per instance
            let mut err = &proba - &targets;
            for (i, mut row) in err.rows_mut().into_iter().enumerate() {
                let w = weights_vec[i];
                row.mapv_inplace(|v| v * w);
            }

            let grad_w = err.t().dot(x) / weight_total + &(&weights * self.l2);
            let grad_b = err.sum_axis(Axis(0)) / weight_total;

            weights -= &(&grad_w * self.learning_rate);
            bias -= &(&grad_b * self.learning_rate);
        }

        self.weights = Some(weights);
        self.bias = Some(bias);
        self.is_fitted = true;
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>> {
        let logits = self.logits(x)?;
        Ok(logits
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(c, _)| c)
                    .unwrap_or(0)
            })
            .collect())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        let logits = self.logits(x)?;
        Ok(Some(Self::softmax(&logits)))
    }
}
