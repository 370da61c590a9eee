//! Error taxonomy for the denoising core.
//!
//! Every fatal condition carries the shapes or ids needed to diagnose it. The one
//! recoverable condition, a class that never occurs among the noisy labels, is not an
//! error value: it is recorded on the confident joint and logged as a warning.

use crate::config::ConfigError;
use crate::evaluate::EvaluationError;
use crate::model::ModelError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DenoiseError>;

#[derive(Error, Debug)]
pub enum DenoiseError {
    #[error("Shape mismatch for {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("No training instances remain after {stage}; refusing to train on an empty table.")]
    EmptyTrainingSet { stage: &'static str },

    #[error(
        "{count} instances are not covered by any rule and no other class id is configured. Enable filter_non_labelled or set other_class_id."
    )]
    UnlabeledInstances { count: usize },

    #[error("Training the model for fold {fold} failed: {source}")]
    FoldTrainingFailure {
        fold: usize,
        #[source]
        source: ModelError,
    },

    #[error("Fold {fold} produced an invalid probability row for instance {row} (non-finite or negative).")]
    InvalidProbabilities { fold: usize, row: usize },

    #[error("Class id {class_id} is out of range for {num_classes} classes.")]
    InvalidClassId { class_id: usize, num_classes: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Operation '{operation}' is not allowed while the trainer is {state}.")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Failed to build the fold worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
