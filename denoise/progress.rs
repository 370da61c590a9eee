use std::fmt;

/// Stages of a denoising run, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrainingStage {
    Aggregation,
    CrossValidation,
    Pruning,
    Retraining,
}

impl TrainingStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Aggregation => "noisy label aggregation",
            Self::CrossValidation => "out-of-sample probability estimation",
            Self::Pruning => "label error pruning",
            Self::Retraining => "final retraining",
        }
    }
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress while a run is executing.
///
/// Fold callbacks arrive from worker threads in completion order, hence `&self` and
/// the `Sync` bound.
pub trait TrainingProgress: Sync {
    fn on_stage_start(&self, stage: TrainingStage) {
        let _ = stage;
    }
    fn on_folds_start(&self, n_folds: usize) {
        let _ = n_folds;
    }
    fn on_fold_finished(&self, fold: usize, held_out: usize) {
        let _ = (fold, held_out);
    }
    fn on_folds_finish(&self) {}
    fn on_stage_finish(&self, stage: TrainingStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl TrainingProgress for NoopProgress {}
