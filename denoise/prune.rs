//! # Label Error Pruning
//!
//! Converts the confident joint into a prune-count matrix (true label x noisy label)
//! and selects the instances to drop before the final retrain.
//!
//! - `prune_by_noise_rate`: for noisy class `k` and every other class `j`, drop the
//!   `count[j][k]` instances labeled `k` with the largest margin `p(j) - p(k)`.
//! - `prune_by_class`: for noisy class `k`, drop the `sum_j count[j][k]` (j != k)
//!   instances labeled `k` with the lowest self-confidence `p(k)`.
//! - `both`: union or intersection of the two masks.
//!
//! Selected instances whose most probable class equals their noisy label are kept, as
//! are instances without a valid out-of-sample prediction.

use crate::config::{BothCombination, PruneMethod};
use crate::error::{DenoiseError, Result};
use crate::latent::{ConfidentJoint, round_preserving_row_totals};
use crate::model::argmax;
use crate::oos::OutOfSampleProbabilities;
use ndarray::{Array2, Axis};

#[derive(Debug, Clone, PartialEq)]
pub struct PruneSettings {
    pub method: PruneMethod,
    pub combination: BothCombination,
    pub frac_noise: f64,
    pub min_examples_per_class: usize,
    pub perfect_class: Option<usize>,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            method: PruneMethod::PruneByNoiseRate,
            combination: BothCombination::Union,
            frac_noise: 1.0,
            min_examples_per_class: 5,
            perfect_class: None,
        }
    }
}

/// `true` marks an instance excluded from retraining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneMask {
    mask: Vec<bool>,
}

impl PruneMask {
    pub fn as_slice(&self) -> &[bool] {
        &self.mask
    }

    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn is_pruned(&self, instance: usize) -> bool {
        self.mask[instance]
    }

    pub fn n_pruned(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Indices of the instances that survive pruning, ascending.
    pub fn retained(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter(|&(_, &m)| !m)
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// The prune-count matrix `[true][noisy]`.
///
/// Each diagonal entry is lifted to at least `min_examples_per_class`, the lift being
/// taken uniformly from the non-zero off-diagonal entries of the same noisy column.
/// Off-diagonal counts are then scaled by `frac_noise`, with the removed mass returned
/// to the diagonal.
pub fn prune_count_matrix(
    confident_joint: &ConfidentJoint,
    min_examples_per_class: usize,
    frac_noise: f64,
) -> Array2<f64> {
    let counts = confident_joint.counts().t().to_owned();
    let k = counts.nrows();
    let floor = min_examples_per_class as f64;

    let mut lifted = counts.clone();
    for col in 0..k {
        let diagonal = counts[[col, col]];
        let new_diagonal = diagonal.max(floor);
        let lift = new_diagonal - diagonal;
        let non_zero = counts.column(col).iter().filter(|&&v| v != 0.0).count();
        let share = lift / (non_zero as f64 - 1.0).max(1.0);
        for row in 0..k {
            lifted[[row, col]] = (counts[[row, col]] - share).max(0.0);
        }
        lifted[[col, col]] = new_diagonal;
    }

    for col in 0..k {
        let mut removed = 0.0;
        for row in 0..k {
            if row != col {
                let kept = lifted[[row, col]] * frac_noise;
                removed += lifted[[row, col]] - kept;
                lifted[[row, col]] = kept;
            }
        }
        lifted[[col, col]] += removed;
    }

    round_preserving_row_totals(&lifted)
}

/// Per noisy class, the instances with the largest margin towards each other class.
pub fn prune_by_noise_rate(
    noisy_y: &[usize],
    oos: &OutOfSampleProbabilities,
    prune_counts: &Array2<f64>,
    prunable_class: &[bool],
) -> Vec<bool> {
    let psx = oos.psx();
    let k = prune_counts.nrows();
    let mut mask = vec![false; noisy_y.len()];
    for noisy in (0..k).filter(|&c| prunable_class[c]) {
        let members = class_members(noisy_y, oos, noisy);
        for truth in (0..k).filter(|&j| j != noisy) {
            let quota = prune_counts[[truth, noisy]].max(0.0) as usize;
            if quota == 0 {
                continue;
            }
            let mut ranked = members.clone();
            ranked.sort_by(|&a, &b| {
                let margin_a = psx[[a, truth]] - psx[[a, noisy]];
                let margin_b = psx[[b, truth]] - psx[[b, noisy]];
                margin_b.total_cmp(&margin_a).then(a.cmp(&b))
            });
            for &idx in ranked.iter().take(quota) {
                mask[idx] = true;
            }
        }
    }
    mask
}

/// Per noisy class, the `removals[class]` least self-confident instances.
pub fn prune_by_class(
    noisy_y: &[usize],
    oos: &OutOfSampleProbabilities,
    removals: &[usize],
    prunable_class: &[bool],
) -> Vec<bool> {
    let psx = oos.psx();
    let mut mask = vec![false; noisy_y.len()];
    for (noisy, &quota) in removals.iter().enumerate() {
        if quota == 0 || !prunable_class[noisy] {
            continue;
        }
        let mut ranked = class_members(noisy_y, oos, noisy);
        ranked.sort_by(|&a, &b| psx[[a, noisy]].total_cmp(&psx[[b, noisy]]).then(a.cmp(&b)));
        for &idx in ranked.iter().take(quota) {
            mask[idx] = true;
        }
    }
    mask
}

/// Instances with a valid prediction and the given noisy label.
fn class_members(noisy_y: &[usize], oos: &OutOfSampleProbabilities, class: usize) -> Vec<usize> {
    noisy_y
        .iter()
        .enumerate()
        .filter(|&(idx, &label)| label == class && oos.valid()[idx])
        .map(|(idx, _)| idx)
        .collect()
}

/// Builds the prune mask for the configured method.
pub fn prune(
    noisy_y: &[usize],
    oos: &OutOfSampleProbabilities,
    confident_joint: &ConfidentJoint,
    settings: &PruneSettings,
) -> Result<PruneMask> {
    let psx = oos.psx();
    let k = confident_joint.num_classes();
    if psx.nrows() != noisy_y.len() {
        return Err(DenoiseError::ShapeMismatch {
            what: "psx rows vs. noisy labels",
            expected: noisy_y.len(),
            found: psx.nrows(),
        });
    }
    if psx.ncols() != k {
        return Err(DenoiseError::ShapeMismatch {
            what: "psx columns vs. confident joint classes",
            expected: k,
            found: psx.ncols(),
        });
    }
    if let Some(class) = settings.perfect_class {
        if k != 2 || class >= k {
            return Err(DenoiseError::InvalidInput(format!(
                "perfect_class = {class} requires a two-class problem, found {k} classes"
            )));
        }
    }

    let mut class_counts = vec![0usize; k];
    for &label in noisy_y {
        if label >= k {
            return Err(DenoiseError::InvalidClassId {
                class_id: label,
                num_classes: k,
            });
        }
        class_counts[label] += 1;
    }
    let prunable_class: Vec<bool> = (0..k)
        .map(|class| {
            class_counts[class] > settings.min_examples_per_class
                && settings.perfect_class != Some(class)
        })
        .collect();

    let prune_counts = prune_count_matrix(
        confident_joint,
        settings.min_examples_per_class,
        settings.frac_noise,
    );

    let by_noise_rate = || prune_by_noise_rate(noisy_y, oos, &prune_counts, &prunable_class);
    let by_class = || {
        let removals: Vec<usize> = (0..k)
            .map(|noisy| {
                let column_total = prune_counts.column(noisy).sum();
                (column_total - prune_counts[[noisy, noisy]]).max(0.0) as usize
            })
            .collect();
        prune_by_class(noisy_y, oos, &removals, &prunable_class)
    };

    let mut mask = match settings.method {
        PruneMethod::PruneByNoiseRate => by_noise_rate(),
        PruneMethod::PruneByClass => by_class(),
        PruneMethod::Both => {
            let first = by_noise_rate();
            let second = by_class();
            first
                .iter()
                .zip(&second)
                .map(|(&a, &b)| match settings.combination {
                    BothCombination::Union => a || b,
                    BothCombination::Intersection => a && b,
                })
                .collect()
        }
    };

    // Never drop an instance the model agrees with, or one without a valid prediction.
    for (idx, row) in psx.axis_iter(Axis(0)).enumerate() {
        if mask[idx] && (!oos.valid()[idx] || argmax(row) == noisy_y[idx]) {
            mask[idx] = false;
        }
    }

    let mask = PruneMask { mask };
    log::info!(
        "Pruning ({:?}) flagged {} of {} instances as likely mislabeled.",
        settings.method,
        mask.n_pruned(),
        mask.len()
    );
    for class in 0..k {
        let pruned = noisy_y
            .iter()
            .zip(mask.as_slice())
            .filter(|&(&label, &m)| label == class && m)
            .count();
        log::debug!(
            "  - class {}: {} of {} pruned.",
            class,
            pruned,
            class_counts[class]
        );
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::compute_confident_joint;
    use ndarray::array;

    /// Twelve instances, six per noisy class; instances 4, 5 (labeled 0) and 10, 11
    /// (labeled 1) look like the other class.
    fn flipped() -> (Vec<usize>, OutOfSampleProbabilities) {
        let y = vec![0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1];
        let psx = array![
            [0.95, 0.05],
            [0.9, 0.1],
            [0.85, 0.15],
            [0.8, 0.2],
            [0.2, 0.8],
            [0.1, 0.9],
            [0.05, 0.95],
            [0.1, 0.9],
            [0.15, 0.85],
            [0.2, 0.8],
            [0.75, 0.25],
            [0.9, 0.1]
        ];
        (y, OutOfSampleProbabilities::from_matrix(psx))
    }

    fn settings(method: PruneMethod) -> PruneSettings {
        PruneSettings {
            method,
            min_examples_per_class: 0,
            ..PruneSettings::default()
        }
    }

    #[test]
    fn noise_rate_pruning_finds_the_flips() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let mask = prune(&y, &oos, &cj, &settings(PruneMethod::PruneByNoiseRate)).unwrap();
        assert_eq!(mask.n_pruned(), 4);
        for idx in [4, 5, 10, 11] {
            assert!(mask.is_pruned(idx), "instance {idx} should be pruned");
        }
        assert_eq!(mask.retained(), vec![0, 1, 2, 3, 6, 7, 8, 9]);
    }

    #[test]
    fn class_pruning_finds_the_flips() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let mask = prune(&y, &oos, &cj, &settings(PruneMethod::PruneByClass)).unwrap();
        assert_eq!(mask.n_pruned(), 4);
        assert!(mask.is_pruned(5) && mask.is_pruned(11));
    }

    #[test]
    fn both_methods_combine() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let union = prune(&y, &oos, &cj, &settings(PruneMethod::Both)).unwrap();
        let intersection = prune(
            &y,
            &oos,
            &cj,
            &PruneSettings {
                combination: BothCombination::Intersection,
                ..settings(PruneMethod::Both)
            },
        )
        .unwrap();
        assert!(intersection.n_pruned() <= union.n_pruned());
        assert_eq!(union.n_pruned(), 4);
    }

    #[test]
    fn small_classes_are_protected() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let mask = prune(
            &y,
            &oos,
            &cj,
            &PruneSettings {
                min_examples_per_class: 6,
                ..settings(PruneMethod::PruneByNoiseRate)
            },
        )
        .unwrap();
        assert_eq!(mask.n_pruned(), 0);
    }

    #[test]
    fn perfect_class_is_never_pruned() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let mask = prune(
            &y,
            &oos,
            &cj,
            &PruneSettings {
                perfect_class: Some(1),
                ..settings(PruneMethod::PruneByNoiseRate)
            },
        )
        .unwrap();
        assert!(!mask.is_pruned(10) && !mask.is_pruned(11));
        assert!(mask.is_pruned(4) && mask.is_pruned(5));
    }

    #[test]
    fn zero_frac_noise_prunes_nothing() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let mask = prune(
            &y,
            &oos,
            &cj,
            &PruneSettings {
                frac_noise: 0.0,
                ..settings(PruneMethod::Both)
            },
        )
        .unwrap();
        assert_eq!(mask.n_pruned(), 0);
    }

    #[test]
    fn class_pruning_is_monotone_in_the_removal_count() {
        let (y, oos) = flipped();
        let prunable = vec![true, true];
        let mut previous = 0;
        for quota in 0..=6 {
            let mask = prune_by_class(&y, &oos, &[quota, 0], &prunable);
            let pruned = mask.iter().zip(&y).filter(|&(&m, &l)| m && l == 0).count();
            assert!(pruned >= previous);
            assert_eq!(pruned, quota);
            previous = pruned;
        }
    }

    #[test]
    fn lifting_the_diagonal_takes_from_off_diagonals() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        assert_eq!(cj.counts(), &array![[4.0, 2.0], [2.0, 4.0]]);
        let counts = prune_count_matrix(&cj, 5, 1.0);
        assert_eq!(counts, array![[5.0, 1.0], [1.0, 5.0]]);
    }

    #[test]
    fn invalid_rows_are_never_pruned() {
        let (y, oos) = flipped();
        let cj = compute_confident_joint(&y, &oos, 2).unwrap();
        let oos = oos.invalidate(&[5]);
        let mask = prune(&y, &oos, &cj, &settings(PruneMethod::PruneByNoiseRate)).unwrap();
        assert!(!mask.is_pruned(5));
        assert!(mask.is_pruned(4));
        // Instance 3 fills the freed quota slot but agrees with its label.
        assert!(!mask.is_pruned(3));
        assert_eq!(mask.n_pruned(), 3);
    }
}
