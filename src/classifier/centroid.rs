//! Nearest-centroid classifier
//!
//! Deterministic baseline: each class is represented by the (optionally
//! weighted) mean of its training vectors; prediction picks the nearest
//! centroid by Euclidean distance. Scores are a softmax over negated
//! distances.

use crate::error::{EvalError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{Classifier, ClassifierConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearestCentroid {
    centroids: Option<Array2<f64>>,
    /// Classes with no training instances have no centroid and are never
    /// predicted.
    present: Vec<bool>,
    is_fitted: bool,
}

impl NearestCentroid {
    pub fn new() -> Self {
        Self {
            centroids: None,
            present: Vec::new(),
            is_fitted: false,
        }
    }

    /// The centroid backend has no hyperparameters; the config is accepted
    /// for factory uniformity.
    pub fn from_config(_config: &ClassifierConfig) -> Result<Self> {
        Ok(Self::new())
    }

    fn distances(&self, row: ndarray::ArrayView1<'_, f64>) -> Result<Vec<(usize, f64)>> {
        let centroids = self.centroids.as_ref().ok_or(EvalError::ModelNotFitted)?;
        Ok((0..centroids.nrows())
            .filter(|&c| self.present[c])
            .map(|c| {
                let d: f64 = centroids
                    .row(c)
                    .iter()
                    .zip(row.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                (c, d.sqrt())
            })
            .collect())
    }
}

impl Default for NearestCentroid {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for NearestCentroid {
    fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        n_classes: usize,
        sample_weight: Option<&[f64]>,
    ) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(EvalError::ShapeError {
                expected: format!("{} labels", x.nrows()),
                actual: format!("{}", y.len()),
            });
        }
        if x.nrows() == 0 {
            return Err(EvalError::DataError("empty training partition".to_string()));
        }

        let n_features = x.ncols();
        let mut sums = Array2::<f64>::zeros((n_classes, n_features));
        let mut weights = vec![0.0f64; n_classes];

        for (i, &c) in y.iter().enumerate() {
            if c >= n_classes {
                return Err(EvalError::DataError(format!(
                    "class id {} out of range ({} classes)",
                    c, n_classes
                )));
            }
            let w = sample_weight.map_or(1.0, |sw| sw[i]);
            let mut row = sums.row_mut(c);
            row += &(&x.row(i) * w);
            weights[c] += w;
        }

        let mut centroids = Array2::<f64>::zeros((n_classes, n_features));
        let mut present = vec![false; n_classes];
        for c in 0..n_classes {
            if weights[c] > 0.0 {
                centroids.row_mut(c).assign(&(&sums.row(c) / weights[c]));
                present[c] = true;
            }
        }

        if present.iter().filter(|&&p| p).count() < 2 {
            return Err(EvalError::FoldError(
                "nearest-centroid needs at least 2 classes in the training partition".to_string(),
            ));
        }

        self.centroids = Some(centroids);
        self.present = present;
        self.is_fitted = true;
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>> {
        if !self.is_fitted {
            return Err(EvalError::ModelNotFitted);
        }
        let mut out = Vec::with_capacity(x.nrows());
        for row in x.rows() {
            let dists = self.distances(row)?;
            let best = dists
                .iter()
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(c, _)| *c)
                .ok_or(EvalError::ModelNotFitted)?;
            out.push(best);
        }
        Ok(out)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Option<Array2<f64>>> {
        if !self.is_fitted {
            return Err(EvalError::ModelNotFitted);
        }
        let n_classes = self.present.len();
        let mut proba = Array2::<f64>::zeros((x.nrows(), n_classes));
        for (r, row) in x.rows().into_iter().enumerate() {
            let dists = self.distances(row)?;
            let max_neg = dists
                .iter()
                .map(|(_, d)| -d)
                .fold(f64::NEG_INFINITY, f64::max);
            let mut denom = 0.0;
            let mut scores: Vec<(usize, f64)> = Vec::with_capacity(dists.len());
            for (c, d) in dists {
                let s = (-d - max_neg).exp();
                denom += s;
                scores.push((c, s));
            }
            for (c, s) in scores {
                proba[[r, c]] = s / denom;
            }
        }
        Ok(Some(proba))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fit_predict_two_clusters() {
        let x = array![[0.0, 0.0], [0.2, 0.0], [4.0, 4.0], [4.2, 4.0]];
        let y = vec![0, 0, 1, 1];
        let mut model = NearestCentroid::new();
        model.fit(&x, &y, 2, None).unwrap();

        let pred = model.predict(&array![[0.1, 0.1], [4.1, 3.9]]).unwrap();
        assert_eq!(pred, vec![0, 1]);
    }

    #[test]
    fn test_sample_weights_shift_centroid() {
        // Heavily weighting the far instance drags class 0's centroid
        let x = array![[0.0], [10.0], [100.0]];
        let y = vec![0, 0, 1];
        let mut model = NearestCentroid::new();
        model.fit(&x, &y, 2, Some(&[1.0, 99.0, 1.0])).unwrap();
        // Centroid of class 0 is ~9.9, so 6.0 is nearer to it than to 100
        let pred = model.predict(&array![[6.0]]).unwrap();
        assert_eq!(pred, vec![0]);
    }

    #[test]
    fn test_single_class_train_rejected() {
        let x = array![[0.0], [1.0]];
        let y = vec![0, 0];
        let mut model = NearestCentroid::new();
        assert!(model.fit(&x, &y, 2, None).is_err());
    }

    #[test]
    fn test_proba_sums_to_one() {
        let x = array![[0.0, 0.0], [4.0, 4.0]];
        let y = vec![0, 1];
        let mut model = NearestCentroid::new();
        model.fit(&x, &y, 2, None).unwrap();
        let proba = model.predict_proba(&array![[1.0, 1.0]]).unwrap().unwrap();
        let total: f64 = proba.row(0).sum();
        assert!((total - 1.0).abs() < 1e-10);
        assert!(proba[[0, 0]] > proba[[0, 1]]);
    }

    #[test]
    fn test_unfitted_predict_fails() {
        let model = NearestCentroid::new();
        assert!(matches!(
            model.predict(&array![[0.0]]),
            Err(EvalError::ModelNotFitted)
        ));
    }
}
