//! Group-aware fold planning
//!
//! Turns a grouping vector and a partitioning policy into an ordered, lazy,
//! restartable sequence of (train, test) folds. No group identifier ever
//! appears on both sides of the same fold.

use crate::error::{EvalError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Partitioning policy.
///
/// `kfold == -1` is leave-one-group-out: one fold per distinct group value.
/// `kfold == k > 0` splits the distinct groups into k approximately
/// equal-size disjoint subsets; each subset's instances form one test fold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GroupKFoldPolicy {
    pub kfold: i32,
    /// Seed for the deterministic group shuffle used when `kfold > 0`.
    pub seed: u64,
}

impl GroupKFoldPolicy {
    pub fn leave_one_group_out(seed: u64) -> Self {
        Self { kfold: -1, seed }
    }

    pub fn group_subsets(k: usize, seed: u64) -> Self {
        Self { kfold: k as i32, seed }
    }
}

/// A single outer train/test split.
#[derive(Debug, Clone)]
pub struct Fold {
    pub fold_idx: usize,
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
    /// Group ids whose instances form the test set.
    pub test_groups: Vec<usize>,
    /// Set when the test split holds fewer than 2 distinct classes. The
    /// fold still runs; the aggregator records it as low-confidence.
    pub degenerate: bool,
}

/// A planned fold sequence: which groups land in which test fold.
///
/// The plan stores only the group assignment; instance index sets are
/// materialised lazily, one fold at a time, by [`FoldPlan::iter`]. Calling
/// `iter` again restarts the identical sequence.
#[derive(Debug, Clone)]
pub struct FoldPlan {
    test_groups_per_fold: Vec<Vec<usize>>,
}

impl FoldPlan {
    pub fn n_folds(&self) -> usize {
        self.test_groups_per_fold.len()
    }

    /// Group ids tested by fold `fold_idx`.
    pub fn test_groups(&self, fold_idx: usize) -> &[usize] {
        &self.test_groups_per_fold[fold_idx]
    }

    /// Lazily enumerate folds over the instance-level `groups` vector.
    /// `labels` is used only to flag degenerate test folds.
    pub fn iter<'a>(
        &'a self,
        groups: &'a [usize],
        labels: &'a [usize],
    ) -> impl Iterator<Item = Fold> + 'a {
        self.test_groups_per_fold
            .iter()
            .enumerate()
            .map(move |(fold_idx, test_groups)| {
                let mut train_indices = Vec::new();
                let mut test_indices = Vec::new();
                for (i, g) in groups.iter().enumerate() {
                    if test_groups.contains(g) {
                        test_indices.push(i);
                    } else {
                        train_indices.push(i);
                    }
                }

                let mut test_classes: Vec<usize> =
                    test_indices.iter().map(|&i| labels[i]).collect();
                test_classes.sort_unstable();
                test_classes.dedup();

                Fold {
                    fold_idx,
                    train_indices,
                    test_indices,
                    test_groups: test_groups.clone(),
                    degenerate: test_classes.len() < 2,
                }
            })
    }
}

/// Plans group-aware fold sequences.
pub struct GroupPartitioner {
    policy: GroupKFoldPolicy,
}

impl GroupPartitioner {
    pub fn new(policy: GroupKFoldPolicy) -> Self {
        Self { policy }
    }

    /// Build a fold plan for the given instance-level grouping vector.
    ///
    /// Deterministic: identical inputs and policy yield identical plans.
    pub fn plan(&self, groups: &[usize]) -> Result<FoldPlan> {
        if groups.is_empty() {
            return Err(EvalError::ConfigError(
                "partition: grouping vector is empty".to_string(),
            ));
        }

        let mut unique_groups: Vec<usize> = groups.to_vec();
        unique_groups.sort_unstable();
        unique_groups.dedup();
        let n_groups = unique_groups.len();

        match self.policy.kfold {
            -1 => {
                // Leave-one-group-out, folds ordered by group id.
                let test_groups_per_fold =
                    unique_groups.into_iter().map(|g| vec![g]).collect();
                Ok(FoldPlan { test_groups_per_fold })
            }
            k if k > 0 => {
                let k = k as usize;
                if k > n_groups {
                    return Err(EvalError::ConfigError(format!(
                        "kfold: {} test-group subsets requested but only {} distinct groups present",
                        k, n_groups
                    )));
                }

                // Seeded shuffle so subset membership is stable across runs
                // given the same input order.
                let mut shuffled = unique_groups;
                let mut rng = ChaCha8Rng::seed_from_u64(self.policy.seed);
                shuffled.shuffle(&mut rng);

                let fold_sizes: Vec<usize> = (0..k)
                    .map(|i| {
                        let base = n_groups / k;
                        let remainder = n_groups % k;
                        if i < remainder {
                            base + 1
                        } else {
                            base
                        }
                    })
                    .collect();

                let mut test_groups_per_fold = Vec::with_capacity(k);
                let mut current = 0;
                for size in fold_sizes {
                    let mut subset = shuffled[current..current + size].to_vec();
                    subset.sort_unstable();
                    test_groups_per_fold.push(subset);
                    current += size;
                }

                Ok(FoldPlan { test_groups_per_fold })
            }
            bad => Err(EvalError::ConfigError(format!(
                "kfold: must be -1 (leave-one-group-out) or a positive subset count, got {}",
                bad
            ))),
        }
    }
}

/// Stratified (group-unaware) k-fold over instance labels.
///
/// Used for the inner split when `noinner_group` disables group awareness:
/// samples of each class are dealt round-robin into the folds, preserving
/// the class distribution.
pub fn stratified_k_fold(labels: &[usize], k: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if k < 2 {
        return Err(EvalError::ConfigError(format!(
            "inner_kfold: stratified split needs at least 2 folds, got {}",
            k
        )));
    }
    if labels.len() < k {
        return Err(EvalError::ConfigError(format!(
            "inner_kfold: {} folds requested for {} instances",
            k,
            labels.len()
        )));
    }

    let mut classes: Vec<usize> = labels.to_vec();
    classes.sort_unstable();
    classes.dedup();

    // One counter across all classes: singleton classes rotate through the
    // folds instead of piling into fold 0, so no fold can end up empty.
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut pos = 0;
    for class in classes {
        for (i, &l) in labels.iter().enumerate() {
            if l == class {
                folds[pos % k].push(i);
                pos += 1;
            }
        }
    }

    let splits = (0..k)
        .map(|fold_idx| {
            let mut test = folds[fold_idx].clone();
            test.sort_unstable();
            let mut train: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != fold_idx)
                .flat_map(|(_, f)| f.iter().copied())
                .collect();
            train.sort_unstable();
            (train, test)
        })
        .collect();

    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_group_data() -> (Vec<usize>, Vec<usize>) {
        // 4 groups x 3 instances, 2 classes
        let groups = vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3];
        let labels = vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1];
        (groups, labels)
    }

    #[test]
    fn test_leave_one_group_out_fold_count() {
        let (groups, labels) = four_group_data();
        let plan = GroupPartitioner::new(GroupKFoldPolicy::leave_one_group_out(42))
            .plan(&groups)
            .unwrap();
        assert_eq!(plan.n_folds(), 4);

        for fold in plan.iter(&groups, &labels) {
            assert_eq!(fold.test_groups.len(), 1);
            assert_eq!(fold.test_indices.len(), 3);
            assert_eq!(fold.train_indices.len(), 9);
            // No group leakage: test group absent from train
            for &i in &fold.train_indices {
                assert_ne!(groups[i], fold.test_groups[0]);
            }
        }
    }

    #[test]
    fn test_each_group_tested_exactly_once() {
        let (groups, labels) = four_group_data();
        let plan = GroupPartitioner::new(GroupKFoldPolicy::leave_one_group_out(0))
            .plan(&groups)
            .unwrap();

        let mut tested: Vec<usize> = plan
            .iter(&groups, &labels)
            .flat_map(|f| f.test_groups)
            .collect();
        tested.sort_unstable();
        assert_eq!(tested, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_group_subsets_disjoint_cover() {
        let groups: Vec<usize> = (0..10).flat_map(|g| vec![g; 4]).collect();
        let labels: Vec<usize> = (0..40).map(|i| i % 2).collect();
        let plan = GroupPartitioner::new(GroupKFoldPolicy::group_subsets(3, 7))
            .plan(&groups)
            .unwrap();
        assert_eq!(plan.n_folds(), 3);

        let mut all_tested: Vec<usize> = Vec::new();
        for fold in plan.iter(&groups, &labels) {
            for g in &fold.test_groups {
                assert!(!all_tested.contains(g), "group {} tested twice", g);
            }
            all_tested.extend(fold.test_groups.iter().copied());
        }
        all_tested.sort_unstable();
        assert_eq!(all_tested, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_plan_is_deterministic_and_restartable() {
        let groups: Vec<usize> = (0..8).flat_map(|g| vec![g; 2]).collect();
        let labels = vec![0; 16];
        let partitioner = GroupPartitioner::new(GroupKFoldPolicy::group_subsets(4, 123));

        let a = partitioner.plan(&groups).unwrap();
        let b = partitioner.plan(&groups).unwrap();
        for i in 0..a.n_folds() {
            assert_eq!(a.test_groups(i), b.test_groups(i));
        }

        // Restarting the iterator yields the identical sequence.
        let first: Vec<Vec<usize>> = a.iter(&groups, &labels).map(|f| f.test_indices).collect();
        let second: Vec<Vec<usize>> = a.iter(&groups, &labels).map(|f| f.test_indices).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_degenerate_fold_flagged_not_fatal() {
        // Group 2's instances are all class 0
        let groups = vec![0, 0, 1, 1, 2, 2];
        let labels = vec![0, 1, 0, 1, 0, 0];
        let plan = GroupPartitioner::new(GroupKFoldPolicy::leave_one_group_out(0))
            .plan(&groups)
            .unwrap();

        let folds: Vec<Fold> = plan.iter(&groups, &labels).collect();
        assert_eq!(folds.len(), 3);
        assert!(!folds[0].degenerate);
        assert!(!folds[1].degenerate);
        assert!(folds[2].degenerate);
    }

    #[test]
    fn test_invalid_kfold_rejected() {
        let groups = vec![0, 1, 2];
        assert!(matches!(
            GroupPartitioner::new(GroupKFoldPolicy { kfold: 0, seed: 0 }).plan(&groups),
            Err(EvalError::ConfigError(_))
        ));
        assert!(matches!(
            GroupPartitioner::new(GroupKFoldPolicy { kfold: -2, seed: 0 }).plan(&groups),
            Err(EvalError::ConfigError(_))
        ));
        // More subsets than groups
        assert!(matches!(
            GroupPartitioner::new(GroupKFoldPolicy { kfold: 5, seed: 0 }).plan(&groups),
            Err(EvalError::ConfigError(_))
        ));
    }

    #[test]
    fn test_stratified_k_fold_spreads_singleton_classes() {
        // Every class has a single instance; the deal must still leave no
        // test fold empty.
        let labels = vec![0, 1, 2, 3, 4];
        let splits = stratified_k_fold(&labels, 2).unwrap();
        assert_eq!(splits.len(), 2);
        for (train, test) in &splits {
            assert!(!test.is_empty());
            assert_eq!(train.len() + test.len(), labels.len());
        }
    }

    #[test]
    fn test_stratified_k_fold_preserves_distribution() {
        let labels = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let splits = stratified_k_fold(&labels, 5).unwrap();
        assert_eq!(splits.len(), 5);
        for (train, test) in &splits {
            assert_eq!(test.len(), 2);
            assert_eq!(train.len(), 8);
            // One sample from each class per test fold
            let classes: Vec<usize> = test.iter().map(|&i| labels[i]).collect();
            assert!(classes.contains(&0) && classes.contains(&1));
        }
    }
}
