#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod aggregate;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod folds;
pub mod latent;
pub mod model;
pub mod oos;
pub mod progress;
pub mod prune;
pub mod trainer;

#[cfg(test)]
mod test_fixtures;

pub use config::{ConfidentLearningConfig, ConfigError, DenoisingStrategy, RunConfig, TrainerConfig};
pub use error::{DenoiseError, Result};
pub use evaluate::{ClassificationReport, LabelMapping, evaluate};
pub use model::{Classifier, FeatureTable, ModelError, SoftmaxConfig, SoftmaxRegression};
pub use progress::{TrainingProgress, TrainingStage};
pub use trainer::{DenoisingTrainer, TrainerState, TrainingSummary};
