//! Classification metrics
//!
//! Confusion matrix, accuracy, per-class recall, and unweighted average
//! recall (UAR, i.e. balanced accuracy) — the fixed scoring metric of the
//! inner search.

use crate::error::{EvalError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Confusion matrix over `n_classes` labels; rows are true classes,
/// columns predicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
    n_classes: usize,
}

impl ConfusionMatrix {
    pub fn new(n_classes: usize) -> Self {
        Self {
            counts: Array2::zeros((n_classes, n_classes)),
            n_classes,
        }
    }

    pub fn from_predictions(
        y_true: &[usize],
        y_pred: &[usize],
        n_classes: usize,
    ) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            return Err(EvalError::ShapeError {
                expected: format!("{} predictions", y_true.len()),
                actual: format!("{}", y_pred.len()),
            });
        }
        let mut cm = Self::new(n_classes);
        for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
            cm.record(t, p)?;
        }
        Ok(cm)
    }

    pub fn record(&mut self, true_class: usize, pred_class: usize) -> Result<()> {
        if true_class >= self.n_classes || pred_class >= self.n_classes {
            return Err(EvalError::DataError(format!(
                "class id out of range: true={} pred={} n_classes={}",
                true_class, pred_class, self.n_classes
            )));
        }
        self.counts[[true_class, pred_class]] += 1;
        Ok(())
    }

    /// Merge another matrix of the same shape into this one.
    pub fn merge(&mut self, other: &ConfusionMatrix) -> Result<()> {
        if other.n_classes != self.n_classes {
            return Err(EvalError::ShapeError {
                expected: format!("{} classes", self.n_classes),
                actual: format!("{} classes", other.n_classes),
            });
        }
        self.counts += &other.counts;
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: u64 = (0..self.n_classes).map(|c| self.counts[[c, c]]).sum();
        correct as f64 / total as f64
    }

    /// Recall per class; `None` for classes with no true instances.
    pub fn per_class_recall(&self) -> Vec<Option<f64>> {
        (0..self.n_classes)
            .map(|c| {
                let support: u64 = self.counts.row(c).sum();
                if support == 0 {
                    None
                } else {
                    Some(self.counts[[c, c]] as f64 / support as f64)
                }
            })
            .collect()
    }

    /// Unweighted average recall over classes with at least one true
    /// instance.
    pub fn uar(&self) -> f64 {
        let recalls: Vec<f64> = self.per_class_recall().into_iter().flatten().collect();
        if recalls.is_empty() {
            return 0.0;
        }
        recalls.iter().sum::<f64>() / recalls.len() as f64
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }
}

/// Mean and standard deviation of per-fold scores.
pub fn mean_std(scores: &[f64]) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_and_uar() {
        let y_true = vec![0, 0, 0, 1, 1, 1];
        let y_pred = vec![0, 0, 0, 1, 0, 0];
        let cm = ConfusionMatrix::from_predictions(&y_true, &y_pred, 2).unwrap();

        assert!((cm.accuracy() - 4.0 / 6.0).abs() < 1e-10);
        // Recall: class 0 = 1.0, class 1 = 1/3
        assert!((cm.uar() - (1.0 + 1.0 / 3.0) / 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_uar_skips_absent_classes() {
        let y_true = vec![0, 0, 0];
        let y_pred = vec![0, 0, 1];
        let cm = ConfusionMatrix::from_predictions(&y_true, &y_pred, 3).unwrap();
        let recalls = cm.per_class_recall();
        assert!(recalls[1].is_none());
        assert!(recalls[2].is_none());
        assert!((cm.uar() - 2.0 / 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_merge() {
        let mut a = ConfusionMatrix::from_predictions(&[0, 1], &[0, 1], 2).unwrap();
        let b = ConfusionMatrix::from_predictions(&[0, 1], &[1, 1], 2).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.total(), 4);
        assert!((a.accuracy() - 0.75).abs() < 1e-10);
    }

    #[test]
    fn test_out_of_range_class_rejected() {
        let result = ConfusionMatrix::from_predictions(&[0, 3], &[0, 0], 2);
        assert!(result.is_err());
    }

    #[test]
    fn test_mean_std() {
        let (m, s) = mean_std(&[1.0, 2.0, 3.0]);
        assert!((m - 2.0).abs() < 1e-10);
        assert!((s - (2.0f64 / 3.0).sqrt()).abs() < 1e-10);
    }
}
