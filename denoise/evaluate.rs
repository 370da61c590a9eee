//! Classification reports for trained denoisers.
//!
//! The standard report carries per-class precision, recall, F1 and support, overall
//! accuracy and the macro and weighted averages. When a label mapping and an other
//! class are both known, the other class is reported on its own row and an `in_schema`
//! row summarizes how well the model recognizes instances that belong to a real class.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("{predictions} predictions were given for {gold} gold labels")]
    LengthMismatch { predictions: usize, gold: usize },

    #[error("cannot evaluate an empty set of predictions")]
    EmptyInput,

    #[error("classes {first} and {second} would both be reported as '{name}'")]
    DuplicateClassName {
        name: String,
        first: usize,
        second: usize,
    },
}

/// Class names and their ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    ids: BTreeMap<String, usize>,
}

impl LabelMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, id: usize) {
        self.ids.insert(name.into(), id);
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// The name registered for `id`; the first in name order if several share it.
    pub fn name(&self, id: usize) -> Option<&str> {
        self.ids
            .iter()
            .find(|&(_, &class)| class == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn display_name(&self, id: usize) -> String {
        self.name(id).map_or_else(|| id.to_string(), str::to_owned)
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for LabelMapping {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(|(name, id)| (name.into(), id)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

impl ClassMetrics {
    fn from_counts(true_positives: usize, predicted: usize, support: usize) -> Self {
        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, support);
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1_score,
            support,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: BTreeMap<String, ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other: Option<ClassMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_schema: Option<ClassMetrics>,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Scores `predictions` against `gold`.
///
/// The other-class breakdown is produced only when both `label_mapping` and
/// `other_class_id` are given; an other class without a mapping falls back to the
/// standard report with a warning.
pub fn evaluate(
    predictions: &[usize],
    gold: &[usize],
    label_mapping: Option<&LabelMapping>,
    other_class_id: Option<usize>,
) -> Result<ClassificationReport, EvaluationError> {
    if predictions.len() != gold.len() {
        return Err(EvaluationError::LengthMismatch {
            predictions: predictions.len(),
            gold: gold.len(),
        });
    }
    if gold.is_empty() {
        return Err(EvaluationError::EmptyInput);
    }

    let other = match (label_mapping, other_class_id) {
        (Some(_), Some(id)) => Some(id),
        (None, Some(id)) => {
            log::warn!(
                "Other class {} requested without a label mapping; producing the standard report.",
                id
            );
            None
        }
        _ => None,
    };

    let labels: Vec<usize> = gold.iter().chain(predictions).copied().unique().sorted().collect();
    let per_class: Vec<(usize, ClassMetrics)> = labels
        .iter()
        .map(|&class| {
            let support = gold.iter().filter(|&&g| g == class).count();
            let predicted = predictions.iter().filter(|&&p| p == class).count();
            let hits = predictions
                .iter()
                .zip(gold)
                .filter(|&(&p, &g)| p == class && g == class)
                .count();
            (class, ClassMetrics::from_counts(hits, predicted, support))
        })
        .collect();

    let name_of = |class: usize| {
        label_mapping.map_or_else(|| class.to_string(), |mapping| mapping.display_name(class))
    };

    let mut classes = BTreeMap::new();
    let mut reported_as: BTreeMap<String, usize> = BTreeMap::new();
    let mut other_metrics = None;
    for &(class, metrics) in &per_class {
        if Some(class) == other {
            other_metrics = Some(metrics);
            continue;
        }
        let name = name_of(class);
        // Unnamed ids fall back to their number, which a mapping entry may also use.
        if let Some(&first) = reported_as.get(&name) {
            return Err(EvaluationError::DuplicateClassName {
                name,
                first,
                second: class,
            });
        }
        reported_as.insert(name.clone(), class);
        classes.insert(name, metrics);
    }

    let averaged: Vec<ClassMetrics> = classes.values().copied().collect();
    let macro_avg = macro_average(&averaged);
    let weighted_avg = weighted_average(&averaged);

    let correct = predictions.iter().zip(gold).filter(|&(p, g)| p == g).count();
    let accuracy = ratio(correct, gold.len());

    let in_schema = other.map(|other| {
        let predicted = predictions.iter().filter(|&&p| p != other).count();
        let support = gold.iter().filter(|&&g| g != other).count();
        let hits = predictions
            .iter()
            .zip(gold)
            .filter(|&(&p, &g)| p == g && p != other)
            .count();
        ClassMetrics::from_counts(hits, predicted, support)
    });

    Ok(ClassificationReport {
        classes,
        accuracy,
        macro_avg,
        weighted_avg,
        other: other.map(|_| {
            other_metrics.unwrap_or(ClassMetrics {
                precision: 0.0,
                recall: 0.0,
                f1_score: 0.0,
                support: 0,
            })
        }),
        in_schema,
    })
}

fn macro_average(rows: &[ClassMetrics]) -> ClassMetrics {
    let n = rows.len().max(1) as f64;
    ClassMetrics {
        precision: rows.iter().map(|m| m.precision).sum::<f64>() / n,
        recall: rows.iter().map(|m| m.recall).sum::<f64>() / n,
        f1_score: rows.iter().map(|m| m.f1_score).sum::<f64>() / n,
        support: rows.iter().map(|m| m.support).sum(),
    }
}

fn weighted_average(rows: &[ClassMetrics]) -> ClassMetrics {
    let support: usize = rows.iter().map(|m| m.support).sum();
    let weigh = |value: fn(&ClassMetrics) -> f64| {
        if support == 0 {
            0.0
        } else {
            rows.iter().map(|m| value(m) * m.support as f64).sum::<f64>() / support as f64
        }
    };
    ClassMetrics {
        precision: weigh(|m| m.precision),
        recall: weigh(|m| m.recall),
        f1_score: weigh(|m| m.f1_score),
        support,
    }
}
