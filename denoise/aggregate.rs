//! # Noisy Label Aggregation
//!
//! Turns a rule-match matrix `Z` (instances x rules) and a rule-to-label mapping `T`
//! (rules x classes) into one label distribution per instance. Each fired rule casts the
//! votes in its row of `T`; the votes of an instance are normalized into a distribution,
//! or hardened into a one-hot majority vote.
//!
//! Instances on which no rule fired get a one-hot distribution at the configured other
//! class, or stay all-zero ("unlabeled") so they can be filtered out.

use crate::error::{DenoiseError, Result};
use crate::model::{FeatureTable, argmax};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Per-instance noisy label distributions, shape [n_instances, n_classes].
#[derive(Debug, Clone, PartialEq)]
pub struct NoisyLabels {
    probs: Array2<f64>,
}

impl NoisyLabels {
    pub fn probs(&self) -> &Array2<f64> {
        &self.probs
    }

    pub fn n_instances(&self) -> usize {
        self.probs.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.probs.ncols()
    }

    pub fn is_labeled(&self, row: usize) -> bool {
        is_informative(self.probs.row(row))
    }

    pub fn unlabeled_count(&self) -> usize {
        (0..self.n_instances()).filter(|&row| !self.is_labeled(row)).count()
    }

    /// Argmax label per instance (lowest class id on ties); `None` for unlabeled rows.
    pub fn hard_labels(&self) -> Vec<Option<usize>> {
        self.probs
            .axis_iter(Axis(0))
            .map(|row| is_informative(row).then(|| argmax(row)))
            .collect()
    }

    /// Indices of the instances that carry a label, in order.
    pub fn labeled_rows(&self) -> Vec<usize> {
        (0..self.n_instances())
            .filter(|&row| self.is_labeled(row))
            .collect()
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            probs: self.probs.select(Axis(0), rows),
        }
    }
}

fn is_informative(row: ArrayView1<f64>) -> bool {
    let total: f64 = row.sum();
    total.is_finite() && total > 0.0
}

/// Aggregates rule votes into noisy label distributions.
///
/// A strictly positive `Z[i, r]` means rule `r` fired on instance `i`. With
/// `probabilistic = false` every labeled row is one-hot at its majority class, ties
/// going to the lowest class id.
pub fn aggregate(
    z: ArrayView2<f64>,
    t: ArrayView2<f64>,
    other_class_id: Option<usize>,
    probabilistic: bool,
) -> Result<NoisyLabels> {
    if z.ncols() != t.nrows() {
        return Err(DenoiseError::ShapeMismatch {
            what: "rule count of the rule-match matrix vs. the rule-to-label mapping",
            expected: t.nrows(),
            found: z.ncols(),
        });
    }
    let num_classes = t.ncols();
    if let Some(other) = other_class_id {
        if other >= num_classes {
            return Err(DenoiseError::InvalidClassId {
                class_id: other,
                num_classes,
            });
        }
    }
    if z.iter().chain(t.iter()).any(|v| !v.is_finite()) {
        return Err(DenoiseError::InvalidInput(
            "rule matches and rule-to-label mapping must be finite".to_string(),
        ));
    }
    if t.iter().any(|&v| v < 0.0) {
        return Err(DenoiseError::InvalidInput(
            "the rule-to-label mapping must be non-negative".to_string(),
        ));
    }

    let fired = z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    let mut votes = fired.dot(&t);

    let mut uncovered = 0usize;
    for mut row in votes.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        if total > 0.0 {
            if probabilistic {
                row.mapv_inplace(|v| v / total);
            } else {
                let winner = argmax(row.view());
                row.fill(0.0);
                row[winner] = 1.0;
            }
        } else {
            uncovered += 1;
            row.fill(0.0);
            if let Some(other) = other_class_id {
                row[other] = 1.0;
            }
        }
    }

    log::info!(
        "Aggregated {} rules into labels for {} instances ({} without any rule match).",
        z.ncols(),
        z.nrows(),
        uncovered
    );

    Ok(NoisyLabels { probs: votes })
}

/// Removes every instance whose label distribution is empty, keeping features, labels
/// and rule matches aligned and in their original relative order.
pub fn filter_unlabeled<X: FeatureTable>(
    x: &X,
    y: &NoisyLabels,
    z: &Array2<f64>,
) -> Result<(X, NoisyLabels, Array2<f64>)> {
    let n = y.n_instances();
    if x.n_rows() != n {
        return Err(DenoiseError::ShapeMismatch {
            what: "feature rows vs. label rows",
            expected: n,
            found: x.n_rows(),
        });
    }
    if z.nrows() != n {
        return Err(DenoiseError::ShapeMismatch {
            what: "rule-match rows vs. label rows",
            expected: n,
            found: z.nrows(),
        });
    }

    let keep = y.labeled_rows();
    if keep.len() < n {
        log::info!(
            "Filtered {} of {} instances without a rule-derived label.",
            n - keep.len(),
            n
        );
    }
    Ok((
        x.select_rows(&keep),
        y.select_rows(&keep),
        z.select(Axis(0), &keep),
    ))
}
