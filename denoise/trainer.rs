//! # Denoising Trainer
//!
//! Drives one training run end to end:
//!
//! 1.  **Aggregation:** rule matches and the rule-to-label mapping become noisy labels;
//!     instances no rule covers are filtered (or rejected).
//! 2.  **Cross-validation:** out-of-sample probabilities for every remaining instance,
//!     either from clones of the final model or from a dedicated psx model.
//! 3.  **Pruning:** the confident joint and latent noise estimate decide which
//!     instances are likely mislabeled.
//! 4.  **Retraining:** the wrapped model is fitted on the surviving instances, weighted
//!     by the inverse of their class's estimated label retention when supported.
//!
//! Under [`DenoisingStrategy::MajorityVote`] steps 2 and 3 are skipped.

use crate::aggregate::{NoisyLabels, aggregate, filter_unlabeled};
use crate::config::{ConfidentLearningConfig, DenoisingStrategy, TrainerConfig};
use crate::error::{DenoiseError, Result};
use crate::evaluate::{ClassificationReport, LabelMapping, evaluate};
use crate::latent::{ConfidentJoint, LatentEstimate, compute_confident_joint, estimate_latent};
use crate::model::{Classifier, FeatureTable};
use crate::oos::{OosSettings, OutOfSampleProbabilities, estimate_oos_probabilities};
use crate::progress::{NoopProgress, TrainingProgress, TrainingStage};
use crate::prune::{PruneSettings, prune};
use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Configured,
    Aggregating,
    EstimatingOos,
    Pruning,
    Retraining,
    Trained,
    Failed,
}

impl TrainerState {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Aggregating => "aggregating noisy labels",
            Self::EstimatingOos => "estimating out-of-sample probabilities",
            Self::Pruning => "pruning",
            Self::Retraining => "retraining",
            Self::Trained => "trained",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// What survives a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub strategy: &'static str,
    pub seed: u64,
    pub n_instances: usize,
    pub n_filtered: usize,
    pub n_pruned: usize,
    pub n_retained: usize,
    pub fold_sizes: Vec<usize>,
    pub skipped_folds: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confident_joint: Option<ConfidentJoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latent: Option<LatentEstimate>,
}

/// Training instances after aggregation and filtering.
struct LabeledSet<X> {
    x: X,
    z: Array2<f64>,
    y: Vec<usize>,
    kept: Vec<usize>,
    n_filtered: usize,
}

/// Outcome of the denoising step: instances to retrain on and their weights.
struct Selection {
    retained: Vec<usize>,
    weights: Option<Vec<f64>>,
    oos: Option<OutOfSampleProbabilities>,
    confident_joint: Option<ConfidentJoint>,
    latent: Option<LatentEstimate>,
}

/// Trains a classifier of type `M` from rule matches, optionally estimating
/// out-of-sample probabilities with a separate model of type `P`.
pub struct DenoisingTrainer<M: Classifier, P: Classifier = M> {
    model: M,
    features: M::Features,
    mapping: Array2<f64>,
    rule_matches: Array2<f64>,
    config: TrainerConfig,
    label_mapping: Option<LabelMapping>,
    psx: Option<(P, P::Features)>,
    progress: Box<dyn TrainingProgress>,
    state: TrainerState,
}

impl<M: Classifier> DenoisingTrainer<M> {
    /// `mapping` is rules x classes, `rule_matches` instances x rules; the feature rows
    /// must line up with the rows of `rule_matches`.
    pub fn new(
        model: M,
        mapping: Array2<f64>,
        features: M::Features,
        rule_matches: Array2<f64>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if rule_matches.nrows() != features.n_rows() {
            return Err(DenoiseError::ShapeMismatch {
                what: "rule-match rows vs. feature rows",
                expected: features.n_rows(),
                found: rule_matches.nrows(),
            });
        }
        if rule_matches.ncols() != mapping.nrows() {
            return Err(DenoiseError::ShapeMismatch {
                what: "rule-match columns vs. rule-to-label mapping rows",
                expected: mapping.nrows(),
                found: rule_matches.ncols(),
            });
        }
        let num_classes = mapping.ncols();
        if num_classes == 0 {
            return Err(DenoiseError::InvalidInput(
                "the rule-to-label mapping has no classes".to_string(),
            ));
        }
        if let Some(other) = config.other_class_id {
            if other >= num_classes {
                return Err(DenoiseError::InvalidClassId {
                    class_id: other,
                    num_classes,
                });
            }
        }
        if let Some(class) = config.confident_learning().and_then(|cl| cl.perfect_class) {
            if num_classes != 2 || class >= num_classes {
                return Err(DenoiseError::InvalidInput(format!(
                    "perfect_class = {class} requires a two-class problem, found {num_classes} classes"
                )));
            }
        }

        Ok(Self {
            model,
            features,
            mapping,
            rule_matches,
            config,
            label_mapping: None,
            psx: None,
            progress: Box::new(NoopProgress),
            state: TrainerState::Configured,
        })
    }
}

impl<M: Classifier, P: Classifier> DenoisingTrainer<M, P> {
    /// Names the classes in evaluation reports.
    pub fn with_label_mapping(mut self, label_mapping: LabelMapping) -> Self {
        self.label_mapping = Some(label_mapping);
        self
    }

    pub fn with_progress(mut self, progress: impl TrainingProgress + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Estimates out-of-sample probabilities with `model` on `features` instead of
    /// clones of the final model.
    pub fn with_psx_model<Q: Classifier>(
        self,
        model: Q,
        features: Q::Features,
    ) -> Result<DenoisingTrainer<M, Q>> {
        if features.n_rows() != self.rule_matches.nrows() {
            return Err(DenoiseError::ShapeMismatch {
                what: "psx feature rows vs. rule-match rows",
                expected: self.rule_matches.nrows(),
                found: features.n_rows(),
            });
        }
        Ok(DenoisingTrainer {
            model: self.model,
            features: self.features,
            mapping: self.mapping,
            rule_matches: self.rule_matches,
            config: self.config,
            label_mapping: self.label_mapping,
            psx: Some((model, features)),
            progress: self.progress,
            state: self.state,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn num_classes(&self) -> usize {
        self.mapping.ncols()
    }

    pub fn train(&mut self) -> Result<TrainingSummary> {
        if self.state != TrainerState::Configured {
            return Err(DenoiseError::InvalidState {
                operation: "train",
                state: self.state.describe(),
            });
        }
        match self.run() {
            Ok(summary) => {
                self.state = TrainerState::Trained;
                Ok(summary)
            }
            Err(err) => {
                log::warn!("Training failed while {}: {}", self.state, err);
                self.state = TrainerState::Failed;
                Err(err)
            }
        }
    }

    pub fn predict(&self, x: &M::Features) -> Result<Vec<usize>> {
        self.require_trained("predict")?;
        Ok(self.model.predict(x)?)
    }

    pub fn test(&self, x: &M::Features, y: &[usize]) -> Result<ClassificationReport> {
        self.require_trained("test")?;
        let predictions = self.model.predict(x)?;
        Ok(evaluate(
            &predictions,
            y,
            self.label_mapping.as_ref(),
            self.evaluation_other_class(),
        )?)
    }

    /// Fits a fresh clone of the model on every labeled instance, without pruning, and
    /// scores it on the test set. The trainer itself is left untouched.
    pub fn baseline(&self, test_x: &M::Features, test_y: &[usize]) -> Result<ClassificationReport> {
        let labeled = self.labeled_set()?;
        let mut model = self.model.clone();
        model.fit(&labeled.x, &labeled.y)?;
        let predictions = model.predict(test_x)?;
        log::info!(
            "Baseline trained on all {} labeled instances.",
            labeled.y.len()
        );
        Ok(evaluate(
            &predictions,
            test_y,
            self.label_mapping.as_ref(),
            self.evaluation_other_class(),
        )?)
    }

    fn require_trained(&self, operation: &'static str) -> Result<()> {
        if self.state == TrainerState::Trained {
            Ok(())
        } else {
            Err(DenoiseError::InvalidState {
                operation,
                state: self.state.describe(),
            })
        }
    }

    fn evaluation_other_class(&self) -> Option<usize> {
        if !self.config.evaluate_with_other_class {
            return None;
        }
        if self.config.other_class_id.is_none() {
            log::warn!("evaluate_with_other_class is set but no other_class_id is configured.");
        }
        self.config.other_class_id
    }

    fn aggregate_labels(&self) -> Result<NoisyLabels> {
        aggregate(
            self.rule_matches.view(),
            self.mapping.view(),
            self.config.other_class_id,
            self.config.use_probabilistic_labels,
        )
    }

    fn labeled_set(&self) -> Result<LabeledSet<M::Features>> {
        let noisy = self.aggregate_labels()?;
        let n_instances = noisy.n_instances();
        let unlabeled = noisy.unlabeled_count();
        if unlabeled > 0 && !self.config.filter_non_labelled {
            return Err(DenoiseError::UnlabeledInstances { count: unlabeled });
        }

        let kept = noisy.labeled_rows();
        if kept.is_empty() {
            return Err(DenoiseError::EmptyTrainingSet {
                stage: "filtering unlabeled instances",
            });
        }
        let (x, noisy, z) = filter_unlabeled(&self.features, &noisy, &self.rule_matches)?;
        let y: Vec<usize> = noisy.hard_labels().into_iter().flatten().collect();
        Ok(LabeledSet {
            x,
            z,
            y,
            n_filtered: n_instances - kept.len(),
            kept,
        })
    }

    fn run(&mut self) -> Result<TrainingSummary> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        log::info!(
            "Training with {} rules, {} classes and {} instances (seed {}).",
            self.mapping.nrows(),
            self.num_classes(),
            self.rule_matches.nrows(),
            seed
        );

        self.state = TrainerState::Aggregating;
        self.progress.on_stage_start(TrainingStage::Aggregation);
        let labeled = self.labeled_set()?;
        self.progress.on_stage_finish(TrainingStage::Aggregation);

        let (strategy, selection) = match self.config.strategy.clone() {
            DenoisingStrategy::MajorityVote => (
                "majority_vote",
                Selection {
                    retained: (0..labeled.y.len()).collect(),
                    weights: None,
                    oos: None,
                    confident_joint: None,
                    latent: None,
                },
            ),
            DenoisingStrategy::ConfidentLearning(cl) => {
                ("confident_learning", self.denoise(&labeled, &cl, seed)?)
            }
        };

        self.state = TrainerState::Retraining;
        self.progress.on_stage_start(TrainingStage::Retraining);
        let retained = &selection.retained;
        let x = labeled.x.select_rows(retained);
        let y: Vec<usize> = retained.iter().map(|&idx| labeled.y[idx]).collect();
        match &selection.weights {
            Some(weights) => self.model.fit_weighted(&x, &y, weights)?,
            None => self.model.fit(&x, &y)?,
        }
        self.progress.on_stage_finish(TrainingStage::Retraining);
        log::info!(
            "Retrained the final model on {} of {} labeled instances.",
            retained.len(),
            labeled.y.len()
        );

        let (fold_sizes, skipped_folds) = selection
            .oos
            .as_ref()
            .map(|oos| (oos.fold_sizes().to_vec(), oos.skipped_folds().to_vec()))
            .unwrap_or_default();
        Ok(TrainingSummary {
            strategy,
            seed,
            n_instances: self.rule_matches.nrows(),
            n_filtered: labeled.n_filtered,
            n_pruned: labeled.y.len() - retained.len(),
            n_retained: retained.len(),
            fold_sizes,
            skipped_folds,
            confident_joint: selection.confident_joint,
            latent: selection.latent,
        })
    }

    fn denoise(
        &mut self,
        labeled: &LabeledSet<M::Features>,
        cl: &ConfidentLearningConfig,
        seed: u64,
    ) -> Result<Selection> {
        let num_classes = self.num_classes();

        self.state = TrainerState::EstimatingOos;
        self.progress.on_stage_start(TrainingStage::CrossValidation);
        let settings = OosSettings {
            n_folds: cl.cv_n_folds,
            method: cl.psx_calculation_method,
            num_workers: cl.num_workers,
            skip_failed_folds: cl.skip_failed_folds,
            seed,
        };
        let z: ArrayView2<f64> = labeled.z.view();
        let oos = match &self.psx {
            Some((psx_model, psx_features)) => {
                let x = psx_features.select_rows(&labeled.kept);
                estimate_oos_probabilities(
                    &x,
                    &labeled.y,
                    z,
                    psx_model,
                    num_classes,
                    &settings,
                    self.progress.as_ref(),
                )?
            }
            None => estimate_oos_probabilities(
                &labeled.x,
                &labeled.y,
                z,
                &self.model,
                num_classes,
                &settings,
                self.progress.as_ref(),
            )?,
        };
        self.progress.on_stage_finish(TrainingStage::CrossValidation);

        self.state = TrainerState::Pruning;
        self.progress.on_stage_start(TrainingStage::Pruning);
        let confident_joint = compute_confident_joint(&labeled.y, &oos, num_classes)?;
        let latent = estimate_latent(&confident_joint, cl.converge_latent_estimates);
        let mask = prune(
            &labeled.y,
            &oos,
            &confident_joint,
            &PruneSettings {
                method: cl.prune_method,
                combination: cl.both_combination,
                frac_noise: cl.frac_noise,
                min_examples_per_class: cl.min_examples_per_class,
                perfect_class: cl.perfect_class,
            },
        )?;
        self.progress.on_stage_finish(TrainingStage::Pruning);

        let retained = mask.retained();
        if retained.is_empty() {
            return Err(DenoiseError::EmptyTrainingSet { stage: "pruning" });
        }

        let weights = if cl.reweight_by_noise_rate && self.model.supports_sample_weight() {
            Some(
                retained
                    .iter()
                    .map(|&idx| {
                        let retention = latent.label_retention(labeled.y[idx]);
                        if retention > 0.0 { 1.0 / retention } else { 1.0 }
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(Selection {
            retained,
            weights,
            oos: Some(oos),
            confident_joint: Some(confident_joint),
            latent: Some(latent),
        })
    }
}
