// denoise/latent.rs

//! # Latent Label Distribution Estimation
//!
//! Relates the noisy labels `s` to the unobserved true labels `y` using out-of-sample
//! probabilities:
//!
//! 1.  **Per-class thresholds:** `t_j` is the average probability for class `j` among the
//!     instances whose noisy label is `j`. This calibrates for classes the model is
//!     systematically over- or under-confident about.
//! 2.  **Confident joint:** every instance that clears at least one threshold is counted
//!     at `(noisy label, most probable confident class)`. Rows are then calibrated to
//!     the observed noisy class counts and rounded preserving row totals.
//! 3.  **Latent estimate:** priors and noise matrices follow from the confident joint,
//!     optionally refined by fixed-point iteration.

use crate::error::{DenoiseError, Result};
use crate::model::argmax;
use crate::oos::OutOfSampleProbabilities;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Serialize;

/// Slack applied when comparing a probability against its class threshold.
const THRESHOLD_SLACK: f64 = 1e-6;
const INVERSE_NOISE_ITERATIONS: usize = 5;
const NOISE_MATRIX_ITERATIONS: usize = 3;

/// Calibrated counts `C[noisy = i][true = j]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidentJoint {
    counts: Array2<f64>,
    thresholds: Vec<Option<f64>>,
    degenerate_classes: Vec<usize>,
}

impl ConfidentJoint {
    pub fn counts(&self) -> &Array2<f64> {
        &self.counts
    }

    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    /// Per-class thresholds; `None` for classes that never occur as a noisy label.
    pub fn thresholds(&self) -> &[Option<f64>] {
        &self.thresholds
    }

    /// Classes whose threshold was undefined.
    pub fn degenerate_classes(&self) -> &[usize] {
        &self.degenerate_classes
    }

    /// Estimated number of label errors among instances with noisy label `class`.
    pub fn estimated_errors(&self, class: usize) -> f64 {
        self.counts.row(class).sum() - self.counts[[class, class]]
    }

    /// The joint probability estimate `P(s = i, y = j)`.
    pub fn joint_probabilities(&self) -> Array2<f64> {
        let total = self.counts.sum();
        if total > 0.0 {
            &self.counts / total
        } else {
            self.counts.clone()
        }
    }
}

/// Computes per-class thresholds and the calibrated confident joint.
///
/// Rows of `psx` flagged invalid are ignored.
pub fn compute_confident_joint(
    noisy_y: &[usize],
    oos: &OutOfSampleProbabilities,
    num_classes: usize,
) -> Result<ConfidentJoint> {
    let psx = oos.psx();
    if psx.nrows() != noisy_y.len() {
        return Err(DenoiseError::ShapeMismatch {
            what: "psx rows vs. noisy labels",
            expected: noisy_y.len(),
            found: psx.nrows(),
        });
    }
    if psx.ncols() != num_classes {
        return Err(DenoiseError::ShapeMismatch {
            what: "psx columns vs. number of classes",
            expected: num_classes,
            found: psx.ncols(),
        });
    }
    if let Some(&label) = noisy_y.iter().find(|&&label| label >= num_classes) {
        return Err(DenoiseError::InvalidClassId {
            class_id: label,
            num_classes,
        });
    }

    let valid = oos.valid();
    let mut sums = vec![0.0; num_classes];
    let mut class_counts = vec![0usize; num_classes];
    for (idx, &label) in noisy_y.iter().enumerate() {
        if valid[idx] {
            sums[label] += psx[[idx, label]];
            class_counts[label] += 1;
        }
    }

    let mut degenerate_classes = Vec::new();
    let thresholds: Vec<Option<f64>> = (0..num_classes)
        .map(|class| {
            if class_counts[class] == 0 {
                degenerate_classes.push(class);
                None
            } else {
                Some(sums[class] / class_counts[class] as f64)
            }
        })
        .collect();
    for &class in &degenerate_classes {
        log::warn!(
            "Class {} never occurs as a noisy label; its threshold is undefined and nothing is pruned on its account.",
            class
        );
    }

    let mut raw = Array2::<f64>::zeros((num_classes, num_classes));
    for (idx, &label) in noisy_y.iter().enumerate() {
        if !valid[idx] {
            continue;
        }
        if let Some(guess) = confident_guess(psx.row(idx), &thresholds) {
            raw[[label, guess]] += 1.0;
        }
    }

    let counts = calibrate(&raw, &class_counts);
    Ok(ConfidentJoint {
        counts,
        thresholds,
        degenerate_classes,
    })
}

/// The true-label guess for one psx row, or `None` when no class is confident.
fn confident_guess(row: ArrayView1<f64>, thresholds: &[Option<f64>]) -> Option<usize> {
    let confident: Vec<bool> = row
        .iter()
        .zip(thresholds)
        .map(|(&p, threshold)| threshold.is_some_and(|t| p >= t - THRESHOLD_SLACK))
        .collect();
    if !confident.contains(&true) {
        return None;
    }
    // Only confident classes compete for the guess.
    let masked: Array1<f64> = row
        .iter()
        .zip(&confident)
        .map(|(&p, &c)| if c { p } else { f64::NEG_INFINITY })
        .collect();
    Some(argmax(masked.view()))
}

/// Rescales each row to its noisy class count, the whole matrix to the number of
/// counted instances, then rounds preserving row totals.
fn calibrate(raw: &Array2<f64>, class_counts: &[usize]) -> Array2<f64> {
    let k = raw.nrows();
    let mut calibrated = Array2::<f64>::zeros((k, k));
    for class in 0..k {
        let row_total = raw.row(class).sum();
        let target = class_counts[class] as f64;
        if row_total > 0.0 {
            for j in 0..k {
                calibrated[[class, j]] = raw[[class, j]] / row_total * target;
            }
        } else {
            calibrated[[class, class]] = target;
        }
    }

    let expected: f64 = class_counts.iter().sum::<usize>() as f64;
    let total = calibrated.sum();
    if total > 0.0 {
        calibrated.mapv_inplace(|v| v / total * expected);
    }
    round_preserving_row_totals(&calibrated)
}

/// Rounds every entry to an integer so that each row keeps its (rounded) total. The
/// leftover units go to the entries with the largest fractional parts, lowest column
/// first on ties.
pub fn round_preserving_row_totals(matrix: &Array2<f64>) -> Array2<f64> {
    let mut rounded = matrix.mapv(f64::floor);
    for (mut out, row) in rounded.axis_iter_mut(Axis(0)).zip(matrix.axis_iter(Axis(0))) {
        let target = row.sum().round();
        let mut missing = (target - out.sum()).round().max(0.0) as usize;
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| {
            let fa = row[a] - row[a].floor();
            let fb = row[b] - row[b].floor();
            fb.total_cmp(&fa).then(a.cmp(&b))
        });
        for &col in order.iter().cycle().take(row.len() * 2) {
            if missing == 0 {
                break;
            }
            out[col] += 1.0;
            missing -= 1;
        }
    }
    rounded
}

/// Priors and noise rates derived from a confident joint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatentEstimate {
    /// `p(s = i)`.
    pub ps: Array1<f64>,
    /// `p(y = j)`.
    pub py: Array1<f64>,
    /// `P(s = i | y = j)` at `[i, j]`; columns sum to one.
    pub noise_matrix: Array2<f64>,
    /// `P(y = i | s = j)` at `[i, j]`; columns sum to one.
    pub inverse_noise_matrix: Array2<f64>,
}

impl LatentEstimate {
    /// `P(s = i, y = j)` at `[i, j]`.
    pub fn joint(&self) -> Array2<f64> {
        let mut joint = self.noise_matrix.clone();
        for (mut column, &py) in joint.axis_iter_mut(Axis(1)).zip(self.py.iter()) {
            column *= py;
        }
        joint
    }

    /// Estimated probability that an instance of true class `class` keeps its label.
    pub fn label_retention(&self, class: usize) -> f64 {
        self.noise_matrix[[class, class]]
    }
}

/// Derives priors and noise matrices, optionally refined to a fixed point.
pub fn estimate_latent(confident_joint: &ConfidentJoint, converge: bool) -> LatentEstimate {
    let counts = confident_joint.counts();
    let k = counts.nrows();

    let row_sums = counts.sum_axis(Axis(1));
    let total = row_sums.sum();
    let ps = if total > 0.0 {
        &row_sums / total
    } else {
        Array1::from_elem(k, 1.0 / k as f64)
    };

    let noise_matrix = normalize_columns(counts);
    let inverse_noise_matrix = normalize_columns(&counts.t().to_owned());
    let py = inverse_noise_matrix.dot(&ps);

    let mut estimate = LatentEstimate {
        ps,
        py,
        noise_matrix,
        inverse_noise_matrix,
    };
    if converge {
        converge_estimates(&mut estimate);
    }
    estimate
}

/// Column-normalizes and clips to [0, 1]. Empty columns become identity columns.
fn normalize_columns(matrix: &Array2<f64>) -> Array2<f64> {
    let mut out = matrix.clone();
    for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
        let total = column.sum();
        if total > 0.0 {
            column.mapv_inplace(|v| (v / total).clamp(0.0, 1.0));
        } else {
            column.fill(0.0);
            column[j] = 1.0;
        }
    }
    out
}

/// Alternates the Bayes-rule identities linking `p(s)`, `p(y)`, `P(s|y)` and `P(y|s)`
/// until they agree.
fn converge_estimates(estimate: &mut LatentEstimate) {
    let k = estimate.ps.len();
    for _ in 0..INVERSE_NOISE_ITERATIONS {
        for _ in 0..NOISE_MATRIX_ITERATIONS {
            // P(s = i | y = j) = P(y = j | s = i) p(s = i) / p(y = j)
            let mut noise = Array2::<f64>::zeros((k, k));
            for i in 0..k {
                for j in 0..k {
                    noise[[i, j]] = estimate.inverse_noise_matrix[[j, i]] * estimate.ps[i];
                }
            }
            estimate.noise_matrix = normalize_columns(&noise);
            estimate.py = estimate.inverse_noise_matrix.dot(&estimate.ps);
        }
        // P(y = i | s = j) = P(s = j | y = i) p(y = i) / p(s = j)
        let mut inverse = Array2::<f64>::zeros((k, k));
        for i in 0..k {
            for j in 0..k {
                inverse[[i, j]] = estimate.noise_matrix[[j, i]] * estimate.py[i];
            }
        }
        estimate.inverse_noise_matrix = normalize_columns(&inverse);
    }
}
