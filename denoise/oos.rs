// denoise/oos.rs

//! # Cross-Validated Out-of-Sample Probabilities
//!
//! Every instance receives a class-probability row from a model that never saw it:
//!
//! 1.  **Fold plan:** instances are split into `k` disjoint folds by the configured
//!     [`FoldAssigner`](crate::folds::FoldAssigner).
//! 2.  **Fold training:** for each fold a fresh clone of the prototype model is fitted
//!     on the other `k - 1` folds and predicts the held-out fold. Folds run on a
//!     dedicated rayon pool; each owns its model clone.
//! 3.  **Merge:** results are collected in fold order after every fold has finished and
//!     written into the rows of the held-out instances.
//!
//! A failed fold aborts the estimation unless skipping is enabled, in which case its
//! rows are filled with the uniform distribution and flagged as invalid so that later
//! stages ignore them.

use crate::config::PsxCalculationMethod;
use crate::error::{DenoiseError, Result};
use crate::folds::{FoldPlan, assigner_for, plan_folds};
use crate::model::{Classifier, FeatureTable, softmax_rows};
use crate::progress::TrainingProgress;
use ndarray::{Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// Tolerance when checking that predicted probabilities are non-negative.
const NEGATIVE_PROBABILITY_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct OosSettings {
    pub n_folds: usize,
    pub method: PsxCalculationMethod,
    pub num_workers: usize,
    pub skip_failed_folds: bool,
    pub seed: u64,
}

/// The out-of-sample probability matrix (psx) plus per-row validity.
#[derive(Debug, Clone)]
pub struct OutOfSampleProbabilities {
    psx: Array2<f64>,
    valid: Vec<bool>,
    fold_sizes: Vec<usize>,
    skipped_folds: Vec<usize>,
}

impl OutOfSampleProbabilities {
    /// Wraps an externally computed psx; every row is considered valid.
    pub fn from_matrix(psx: Array2<f64>) -> Self {
        let n = psx.nrows();
        Self {
            psx,
            valid: vec![true; n],
            fold_sizes: vec![n],
            skipped_folds: Vec::new(),
        }
    }

    pub fn psx(&self) -> &Array2<f64> {
        &self.psx
    }

    pub fn valid(&self) -> &[bool] {
        &self.valid
    }

    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    pub fn fold_sizes(&self) -> &[usize] {
        &self.fold_sizes
    }

    pub fn skipped_folds(&self) -> &[usize] {
        &self.skipped_folds
    }

    #[cfg(test)]
    pub(crate) fn invalidate(mut self, rows: &[usize]) -> Self {
        for &row in rows {
            self.valid[row] = false;
        }
        self
    }
}

/// Estimates psx with cross-validation.
///
/// `x`, `y_noisy` and the rows of `z` must describe the same instances. The prototype
/// `base_model` is never fitted itself.
pub fn estimate_oos_probabilities<C: Classifier>(
    x: &C::Features,
    y_noisy: &[usize],
    z: ArrayView2<f64>,
    base_model: &C,
    num_classes: usize,
    settings: &OosSettings,
    progress: &dyn TrainingProgress,
) -> Result<OutOfSampleProbabilities> {
    let n = y_noisy.len();
    if x.n_rows() != n {
        return Err(DenoiseError::ShapeMismatch {
            what: "feature rows vs. noisy labels",
            expected: n,
            found: x.n_rows(),
        });
    }
    if let Some(&label) = y_noisy.iter().find(|&&label| label >= num_classes) {
        return Err(DenoiseError::InvalidClassId {
            class_id: label,
            num_classes,
        });
    }

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let assigner = assigner_for(settings.method);
    let plan = plan_folds(assigner.as_ref(), z, y_noisy, settings.n_folds, &mut rng)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.num_workers.max(1))
        .build()?;

    let models: Vec<C> = (0..plan.n_folds()).map(|_| base_model.clone()).collect();
    progress.on_folds_start(plan.n_folds());
    let outcomes: Vec<Result<Array2<f64>>> = pool.install(|| {
        models
            .into_par_iter()
            .enumerate()
            .map(|(fold, model)| {
                let outcome = run_fold(model, fold, &plan, x, y_noisy, num_classes);
                progress.on_fold_finished(fold, plan.held_out(fold).len());
                outcome
            })
            .collect()
    });
    progress.on_folds_finish();

    merge_folds(&plan, outcomes, num_classes, settings.skip_failed_folds, settings.method)
}

/// Trains one fold's model and predicts its held-out instances.
fn run_fold<C: Classifier>(
    mut model: C,
    fold: usize,
    plan: &FoldPlan,
    x: &C::Features,
    y_noisy: &[usize],
    num_classes: usize,
) -> Result<Array2<f64>> {
    let training = plan.training(fold);
    let held_out = plan.held_out(fold);

    let train_x = x.select_rows(&training);
    let train_y: Vec<usize> = training.iter().map(|&idx| y_noisy[idx]).collect();
    model
        .fit(&train_x, &train_y)
        .map_err(|source| DenoiseError::FoldTrainingFailure { fold, source })?;

    let test_x = x.select_rows(&held_out);
    let mut probs = model
        .predict_proba(&test_x)
        .map_err(|source| DenoiseError::FoldTrainingFailure { fold, source })?;

    if probs.nrows() != held_out.len() {
        return Err(DenoiseError::ShapeMismatch {
            what: "predicted rows vs. held-out instances",
            expected: held_out.len(),
            found: probs.nrows(),
        });
    }
    if probs.ncols() != num_classes {
        return Err(DenoiseError::ShapeMismatch {
            what: "predicted columns vs. number of classes",
            expected: num_classes,
            found: probs.ncols(),
        });
    }

    if !model.emits_probabilities() {
        softmax_rows(&mut probs);
    }
    normalize_probability_rows(&mut probs, fold, &held_out)?;

    log::debug!(
        "Fold {} trained on {} instances, predicted {} held-out instances.",
        fold,
        training.len(),
        held_out.len()
    );
    Ok(probs)
}

/// Checks that rows are finite and non-negative and rescales them to sum to one.
fn normalize_probability_rows(
    probs: &mut Array2<f64>,
    fold: usize,
    held_out: &[usize],
) -> Result<()> {
    for (local, mut row) in probs.axis_iter_mut(Axis(0)).enumerate() {
        let invalid = row
            .iter()
            .any(|&v| !v.is_finite() || v < -NEGATIVE_PROBABILITY_TOLERANCE);
        let total: f64 = row.iter().map(|v| v.max(0.0)).sum();
        if invalid || total <= 0.0 {
            return Err(DenoiseError::InvalidProbabilities {
                fold,
                row: held_out[local],
            });
        }
        row.mapv_inplace(|v| v.max(0.0) / total);
    }
    Ok(())
}

fn merge_folds(
    plan: &FoldPlan,
    outcomes: Vec<Result<Array2<f64>>>,
    num_classes: usize,
    skip_failed_folds: bool,
    method: PsxCalculationMethod,
) -> Result<OutOfSampleProbabilities> {
    let n = plan.n_instances();
    let mut psx = Array2::<f64>::from_elem((n, num_classes), 1.0 / num_classes as f64);
    let mut valid = vec![true; n];
    let mut skipped_folds = Vec::new();
    let mut first_failure = None;

    for (fold, outcome) in outcomes.into_iter().enumerate() {
        let held_out = plan.held_out(fold);
        match outcome {
            Ok(probs) => {
                for (local, &idx) in held_out.iter().enumerate() {
                    psx.row_mut(idx).assign(&probs.row(local));
                }
            }
            Err(DenoiseError::FoldTrainingFailure { fold, source }) if skip_failed_folds => {
                log::warn!(
                    "Fold {} failed ({}); its {} instances get no confident prediction.",
                    fold,
                    source,
                    held_out.len()
                );
                for &idx in &held_out {
                    valid[idx] = false;
                }
                skipped_folds.push(fold);
                if first_failure.is_none() {
                    first_failure = Some(DenoiseError::FoldTrainingFailure { fold, source });
                }
            }
            Err(err) => return Err(err),
        }
    }

    if skipped_folds.len() == plan.n_folds() {
        if let Some(err) = first_failure {
            return Err(err);
        }
    }

    log::info!(
        "Out-of-sample probabilities estimated for {} of {} instances ({} folds).",
        valid.iter().filter(|&&v| v).count(),
        n,
        method.describe()
    );

    Ok(OutOfSampleProbabilities {
        psx,
        valid,
        fold_sizes: plan.fold_sizes(),
        skipped_folds,
    })
}
