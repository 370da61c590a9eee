//! # Fold Assignment Policies
//!
//! Cross-validated probability estimation needs every instance in exactly one held-out
//! fold. How instances are grouped is a policy:
//!
//! - [`RandomFolds`]: stratified by noisy label. Each class is shuffled and dealt
//!   round-robin with a single running counter, so fold sizes differ by at most one.
//! - [`SignatureFolds`]: the signature of an instance is the sorted set of rules that
//!   fired on it. Instances sharing a signature form a bucket and always share a fold.
//!   Buckets are shuffled, then placed largest-first into the currently smallest fold.
//! - [`RuleFolds`]: rules are shuffled and dealt round-robin into rule groups, one per
//!   fold. An instance follows the group of its primary rule, the fired rule that comes
//!   first in the shuffled order; instances without a fired rule go to the currently
//!   smallest fold.
//!
//! The two rule-aware policies fall back to random folds when the bucket structure is
//! too coarse to populate every fold.

use crate::config::PsxCalculationMethod;
use crate::error::{DenoiseError, Result};
use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

/// A fold id for every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldPlan {
    assignments: Vec<usize>,
    n_folds: usize,
}

impl FoldPlan {
    /// Builds a plan from explicit assignments, checking that every fold is populated.
    pub fn from_assignments(assignments: Vec<usize>, n_folds: usize) -> Result<Self> {
        let mut sizes = vec![0usize; n_folds];
        for &fold in &assignments {
            if fold >= n_folds {
                return Err(DenoiseError::InvalidInput(format!(
                    "fold id {fold} is out of range for {n_folds} folds"
                )));
            }
            sizes[fold] += 1;
        }
        if let Some(empty) = sizes.iter().position(|&size| size == 0) {
            return Err(DenoiseError::InvalidInput(format!(
                "fold {empty} of {n_folds} holds no instance"
            )));
        }
        Ok(Self {
            assignments,
            n_folds,
        })
    }

    pub fn n_folds(&self) -> usize {
        self.n_folds
    }

    pub fn n_instances(&self) -> usize {
        self.assignments.len()
    }

    pub fn fold_of(&self, instance: usize) -> usize {
        self.assignments[instance]
    }

    /// Instances held out in `fold`, ascending.
    pub fn held_out(&self, fold: usize) -> Vec<usize> {
        self.indices_where(|f| f == fold)
    }

    /// Instances used to train the model of `fold`, ascending.
    pub fn training(&self, fold: usize) -> Vec<usize> {
        self.indices_where(|f| f != fold)
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.n_folds];
        for &fold in &self.assignments {
            sizes[fold] += 1;
        }
        sizes
    }

    fn indices_where(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        self.assignments
            .iter()
            .enumerate()
            .filter(|&(_, &fold)| keep(fold))
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// A fold partitioning policy.
pub trait FoldAssigner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Assigns `rule_matches.nrows()` instances to `n_folds` folds. Callers guarantee
    /// `2 <= n_folds <= n_instances` and `labels.len() == n_instances`.
    fn assign(
        &self,
        rule_matches: ArrayView2<f64>,
        labels: &[usize],
        n_folds: usize,
        rng: &mut StdRng,
    ) -> Result<FoldPlan>;
}

pub fn assigner_for(method: PsxCalculationMethod) -> Box<dyn FoldAssigner> {
    match method {
        PsxCalculationMethod::Random => Box::new(RandomFolds),
        PsxCalculationMethod::Signatures => Box::new(SignatureFolds),
        PsxCalculationMethod::Rules => Box::new(RuleFolds),
    }
}

/// Validates the fold count and runs `assigner`.
pub fn plan_folds(
    assigner: &dyn FoldAssigner,
    rule_matches: ArrayView2<f64>,
    labels: &[usize],
    n_folds: usize,
    rng: &mut StdRng,
) -> Result<FoldPlan> {
    let n = rule_matches.nrows();
    if labels.len() != n {
        return Err(DenoiseError::ShapeMismatch {
            what: "noisy labels vs. rule-match rows",
            expected: n,
            found: labels.len(),
        });
    }
    if n_folds < 2 || n_folds > n {
        return Err(DenoiseError::InvalidInput(format!(
            "cannot split {n} instances into {n_folds} folds (need 2 <= folds <= instances)"
        )));
    }
    let plan = assigner.assign(rule_matches, labels, n_folds, rng)?;
    log::info!(
        "Assigned {} instances to {} folds using {} splitting: sizes {:?}.",
        n,
        n_folds,
        assigner.name(),
        plan.fold_sizes()
    );
    Ok(plan)
}

pub struct RandomFolds;

impl FoldAssigner for RandomFolds {
    fn name(&self) -> &'static str {
        "random"
    }

    fn assign(
        &self,
        rule_matches: ArrayView2<f64>,
        labels: &[usize],
        n_folds: usize,
        rng: &mut StdRng,
    ) -> Result<FoldPlan> {
        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate().take(rule_matches.nrows()) {
            by_class.entry(label).or_default().push(idx);
        }

        let mut assignments = vec![0usize; labels.len()];
        let mut counter = 0usize;
        for members in by_class.values_mut() {
            members.shuffle(rng);
            for &idx in members.iter() {
                assignments[idx] = counter % n_folds;
                counter += 1;
            }
        }
        FoldPlan::from_assignments(assignments, n_folds)
    }
}

/// The sorted rules that fired on `row`.
fn signature(rule_matches: ArrayView2<f64>, row: usize) -> Vec<usize> {
    rule_matches
        .row(row)
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v > 0.0)
        .map(|(rule, _)| rule)
        .collect()
}

/// Index of the smallest fold, lowest id on ties.
fn smallest_fold(sizes: &[usize]) -> usize {
    sizes
        .iter()
        .enumerate()
        .min_by_key(|&(fold, &size)| (size, fold))
        .map(|(fold, _)| fold)
        .unwrap_or(0)
}

fn fall_back_to_random(
    policy: &'static str,
    rule_matches: ArrayView2<f64>,
    labels: &[usize],
    n_folds: usize,
    rng: &mut StdRng,
) -> Result<FoldPlan> {
    log::warn!(
        "{} splitting left at least one of {} folds empty; falling back to random folds.",
        policy,
        n_folds
    );
    RandomFolds.assign(rule_matches, labels, n_folds, rng)
}

pub struct SignatureFolds;

impl FoldAssigner for SignatureFolds {
    fn name(&self) -> &'static str {
        "signatures"
    }

    fn assign(
        &self,
        rule_matches: ArrayView2<f64>,
        labels: &[usize],
        n_folds: usize,
        rng: &mut StdRng,
    ) -> Result<FoldPlan> {
        let mut buckets: BTreeMap<Vec<usize>, Vec<usize>> = BTreeMap::new();
        for row in 0..rule_matches.nrows() {
            buckets
                .entry(signature(rule_matches, row))
                .or_default()
                .push(row);
        }
        let mut buckets: Vec<Vec<usize>> = buckets.into_values().collect();
        if buckets.len() < n_folds {
            return fall_back_to_random(self.name(), rule_matches, labels, n_folds, rng);
        }

        // Shuffle first so equally sized buckets land in a seeded order.
        buckets.shuffle(rng);
        buckets.sort_by_key(|bucket| std::cmp::Reverse(bucket.len()));

        let mut assignments = vec![0usize; rule_matches.nrows()];
        let mut sizes = vec![0usize; n_folds];
        for bucket in &buckets {
            let fold = smallest_fold(&sizes);
            for &idx in bucket {
                assignments[idx] = fold;
            }
            sizes[fold] += bucket.len();
        }
        FoldPlan::from_assignments(assignments, n_folds)
    }
}

pub struct RuleFolds;

impl FoldAssigner for RuleFolds {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn assign(
        &self,
        rule_matches: ArrayView2<f64>,
        labels: &[usize],
        n_folds: usize,
        rng: &mut StdRng,
    ) -> Result<FoldPlan> {
        let n_rules = rule_matches.ncols();
        let mut order: Vec<usize> = (0..n_rules).collect();
        order.shuffle(rng);

        // rank[rule] = position of the rule in the shuffled order.
        let mut rank = vec![0usize; n_rules];
        for (position, &rule) in order.iter().enumerate() {
            rank[rule] = position;
        }

        let mut assignments = vec![0usize; rule_matches.nrows()];
        let mut sizes = vec![0usize; n_folds];
        let mut unmatched = Vec::new();
        for row in 0..rule_matches.nrows() {
            match signature(rule_matches, row)
                .into_iter()
                .min_by_key(|&rule| rank[rule])
            {
                Some(primary) => {
                    let fold = rank[primary] % n_folds;
                    assignments[row] = fold;
                    sizes[fold] += 1;
                }
                None => unmatched.push(row),
            }
        }

        unmatched.shuffle(rng);
        for row in unmatched {
            let fold = smallest_fold(&sizes);
            assignments[row] = fold;
            sizes[fold] += 1;
        }

        if sizes.contains(&0) {
            return fall_back_to_random(self.name(), rule_matches, labels, n_folds, rng);
        }
        FoldPlan::from_assignments(assignments, n_folds)
    }
}
