//! Trainer configuration.
//!
//! Settings are plain serde structs so a run can be described in a TOML file. The
//! denoising algorithm itself is picked by the tagged [`DenoisingStrategy`] variant
//! rather than by a trainer type.

use crate::model::SoftmaxConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Configuration value {field} = {value} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Which instances a pruning pass removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PruneMethod {
    /// Per noisy class, remove the instances with the largest margin towards each
    /// estimated true class, as many as the confident joint attributes to it.
    #[default]
    PruneByNoiseRate,
    /// Per noisy class, remove the least self-confident instances, as many as the
    /// estimated number of label errors in that class.
    PruneByClass,
    /// Combine both masks, see [`BothCombination`].
    Both,
}

/// How the two masks are combined under [`PruneMethod::Both`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BothCombination {
    #[default]
    Union,
    Intersection,
}

/// How instances are assigned to cross-validation folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PsxCalculationMethod {
    /// Stratified random folds.
    #[default]
    Random,
    /// Instances with identical rule signatures share a fold.
    #[serde(alias = "signature_based", alias = "signature-based")]
    Signatures,
    /// Instances follow the fold of their primary rule.
    #[serde(alias = "rule_based", alias = "rule-based")]
    Rules,
}

impl PsxCalculationMethod {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Signatures => "signatures",
            Self::Rules => "rules",
        }
    }
}

/// Settings of the confident-learning denoiser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfidentLearningConfig {
    pub cv_n_folds: usize,
    pub prune_method: PruneMethod,
    pub both_combination: BothCombination,
    pub psx_calculation_method: PsxCalculationMethod,
    /// Refine the noise matrices with fixed-point iterations.
    pub converge_latent_estimates: bool,
    /// Fraction of the estimated label errors that is actually pruned.
    pub frac_noise: f64,
    /// Noisy classes with at most this many instances are never pruned, and pruning
    /// never leaves a class with fewer confidently labeled instances than this.
    pub min_examples_per_class: usize,
    /// Two-class problems only: the class known to be labeled without errors.
    pub perfect_class: Option<usize>,
    pub num_workers: usize,
    /// Keep going when a fold fails; its instances get no confident prediction.
    pub skip_failed_folds: bool,
    /// Weight retained instances by the inverse of their class's estimated
    /// probability of being labeled correctly, when the model accepts weights.
    pub reweight_by_noise_rate: bool,
}

impl Default for ConfidentLearningConfig {
    fn default() -> Self {
        Self {
            cv_n_folds: 5,
            prune_method: PruneMethod::default(),
            both_combination: BothCombination::default(),
            psx_calculation_method: PsxCalculationMethod::default(),
            converge_latent_estimates: false,
            frac_noise: 1.0,
            min_examples_per_class: 5,
            perfect_class: None,
            num_workers: num_cpus::get().max(1),
            skip_failed_folds: false,
            reweight_by_noise_rate: true,
        }
    }
}

impl ConfidentLearningConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cv_n_folds < 2 {
            return Err(ConfigError::OutOfRange {
                field: "cv_n_folds",
                value: self.cv_n_folds.to_string(),
                reason: "at least two folds are required",
            });
        }
        if self.num_workers == 0 {
            return Err(ConfigError::OutOfRange {
                field: "num_workers",
                value: "0".to_string(),
                reason: "at least one worker is required",
            });
        }
        if !(0.0..=1.0).contains(&self.frac_noise) {
            return Err(ConfigError::OutOfRange {
                field: "frac_noise",
                value: self.frac_noise.to_string(),
                reason: "must lie in [0, 1]",
            });
        }
        Ok(())
    }
}

/// The denoising algorithm applied between aggregation and the final retrain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenoisingStrategy {
    /// Train on every labeled instance with its majority-vote label.
    MajorityVote,
    /// Estimate label errors with cross-validated probabilities and prune them.
    ConfidentLearning(ConfidentLearningConfig),
}

impl Default for DenoisingStrategy {
    fn default() -> Self {
        Self::ConfidentLearning(ConfidentLearningConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainerConfig {
    /// Class assigned to instances no rule fired on.
    pub other_class_id: Option<usize>,
    /// Drop instances whose aggregated label distribution is empty.
    pub filter_non_labelled: bool,
    /// Keep normalized vote distributions instead of one-hot majority votes.
    pub use_probabilistic_labels: bool,
    /// Separate the other class in evaluation reports (needs a label mapping).
    pub evaluate_with_other_class: bool,
    pub seed: Option<u64>,
    pub strategy: DenoisingStrategy,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            other_class_id: None,
            filter_non_labelled: true,
            use_probabilistic_labels: false,
            evaluate_with_other_class: false,
            seed: None,
            strategy: DenoisingStrategy::default(),
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.strategy {
            DenoisingStrategy::MajorityVote => Ok(()),
            DenoisingStrategy::ConfidentLearning(cl) => cl.validate(),
        }
    }

    pub fn confident_learning(&self) -> Option<&ConfidentLearningConfig> {
        match &self.strategy {
            DenoisingStrategy::MajorityVote => None,
            DenoisingStrategy::ConfidentLearning(cl) => Some(cl),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}

/// A complete run description: trainer settings plus the reference model's
/// hyperparameters. This is the file format read by the `sieve` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunConfig {
    pub trainer: TrainerConfig,
    pub model: SoftmaxConfig,
}

impl RunConfig {
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.trainer.validate()?;
        Ok(config)
    }
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}
