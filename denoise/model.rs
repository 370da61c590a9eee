// denoise/model.rs

//! # Model Adapter Layer
//!
//! The denoising core never looks inside a classifier. Anything that can be fitted on a
//! feature table and a label vector, and can emit per-class scores for a feature table,
//! implements [`Classifier`] and can be used both for out-of-sample estimation and for
//! the final retrain.
//!
//! Feature tables are equally opaque: the core only needs to count rows and to select a
//! subset of rows in a given order ([`FeatureTable`]). Dense `ndarray` matrices and plain
//! vectors of per-instance records (token sequences, sparse rows, ...) are supported out
//! of the box.
//!
//! [`SoftmaxRegression`] is the reference classifier: multinomial logistic regression
//! trained with full-batch gradient descent, an L2 penalty and optional sample weights.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by classifiers. External implementations report their own failures
/// through [`ModelError::Fit`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("The model must be fitted before it can predict.")]
    NotFitted,

    #[error("Feature dimension mismatch: the model expects {expected} columns, got {found}.")]
    FeatureMismatch { expected: usize, found: usize },

    #[error("Label {label} is out of range for a model with {num_classes} classes.")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error("Inconsistent training input: {features} feature rows, {labels} labels, {weights} weights.")]
    InputLengthMismatch {
        features: usize,
        labels: usize,
        weights: usize,
    },

    #[error("Cannot fit a model on zero instances.")]
    EmptyInput,

    #[error("Optimization diverged after {epoch} epochs (non-finite parameters).")]
    Diverged { epoch: usize },

    #[error("{0}")]
    Fit(String),
}

/// A table of per-instance features that can be subset by row.
pub trait FeatureTable: Sized + Sync {
    fn n_rows(&self) -> usize;

    /// Returns a new table holding `rows`, in that order.
    fn select_rows(&self, rows: &[usize]) -> Self;
}

impl FeatureTable for Array2<f64> {
    fn n_rows(&self) -> usize {
        self.nrows()
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        self.select(Axis(0), rows)
    }
}

impl<T: Clone + Sync> FeatureTable for Vec<T> {
    fn n_rows(&self) -> usize {
        self.len()
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        rows.iter().map(|&row| self[row].clone()).collect()
    }
}

/// The fit / predict / predict-probability capability the denoising core relies on.
///
/// `fit` must train from scratch: the cross-validation step clones an untrained
/// prototype for every fold, and the final retrain reuses the owned instance.
pub trait Classifier: Clone + Send {
    type Features: FeatureTable;

    fn fit(&mut self, x: &Self::Features, y: &[usize]) -> Result<(), ModelError>;

    /// Per-class scores, one row per instance of `x`.
    fn predict_proba(&self, x: &Self::Features) -> Result<Array2<f64>, ModelError>;

    fn predict(&self, x: &Self::Features) -> Result<Vec<usize>, ModelError> {
        let probs = self.predict_proba(x)?;
        Ok(probs.axis_iter(Axis(0)).map(argmax).collect())
    }

    /// Weighted fit. Models without weight support fall back to an unweighted fit.
    fn fit_weighted(
        &mut self,
        x: &Self::Features,
        y: &[usize],
        weights: &[f64],
    ) -> Result<(), ModelError> {
        let _ = weights;
        self.fit(x, y)
    }

    fn supports_sample_weight(&self) -> bool {
        false
    }

    /// `false` when `predict_proba` returns raw scores that still need a softmax.
    fn emits_probabilities(&self) -> bool {
        true
    }
}

/// Index of the largest finite entry; the lowest index wins ties. Rows without any
/// finite entry map to 0.
pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (idx, &value) in row.iter().enumerate() {
        if value.is_finite() && value > best_value {
            best = idx;
            best_value = value;
        }
    }
    best
}

/// In-place, numerically stable softmax over each row.
pub fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        if !max.is_finite() {
            continue;
        }
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|v| v / total);
        }
    }
}

/// Hyperparameters of the reference classifier, serialized in the `[model]` table of
/// the CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SoftmaxConfig {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2_penalty: f64,
}

impl Default for SoftmaxConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            epochs: 300,
            l2_penalty: 1e-4,
        }
    }
}

#[derive(Debug, Clone)]
struct SoftmaxParams {
    /// Shape: [n_features, n_classes].
    weights: Array2<f64>,
    bias: Array1<f64>,
}

/// Multinomial logistic regression on dense features.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    num_classes: usize,
    config: SoftmaxConfig,
    params: Option<SoftmaxParams>,
}

impl SoftmaxRegression {
    pub fn new(num_classes: usize, config: SoftmaxConfig) -> Self {
        Self {
            num_classes,
            config,
            params: None,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn linear_scores(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        let params = self.params.as_ref().ok_or(ModelError::NotFitted)?;
        if x.ncols() != params.weights.nrows() {
            return Err(ModelError::FeatureMismatch {
                expected: params.weights.nrows(),
                found: x.ncols(),
            });
        }
        Ok(x.dot(&params.weights) + &params.bias)
    }

    fn train(&mut self, x: &Array2<f64>, y: &[usize], weights: &[f64]) -> Result<(), ModelError> {
        let (n, d) = x.dim();
        if n != y.len() || n != weights.len() {
            return Err(ModelError::InputLengthMismatch {
                features: n,
                labels: y.len(),
                weights: weights.len(),
            });
        }
        if n == 0 {
            return Err(ModelError::EmptyInput);
        }
        if let Some(&label) = y.iter().find(|&&label| label >= self.num_classes) {
            return Err(ModelError::LabelOutOfRange {
                label,
                num_classes: self.num_classes,
            });
        }

        let total_weight: f64 = weights.iter().sum();
        if !(total_weight.is_finite() && total_weight > 0.0) {
            return Err(ModelError::Fit(format!(
                "sample weights must sum to a positive finite value, got {total_weight}"
            )));
        }
        let scaled: Array1<f64> = weights.iter().map(|w| w / total_weight).collect();

        let mut targets = Array2::<f64>::zeros((n, self.num_classes));
        for (row, &label) in y.iter().enumerate() {
            targets[[row, label]] = 1.0;
        }

        let mut coef = Array2::<f64>::zeros((d, self.num_classes));
        let mut bias = Array1::<f64>::zeros(self.num_classes);
        let lr = self.config.learning_rate;
        let l2 = self.config.l2_penalty;

        for epoch in 0..self.config.epochs {
            let mut probs = x.dot(&coef) + &bias;
            softmax_rows(&mut probs);

            // Residuals weighted per instance; the loss is the weighted mean cross-entropy.
            let mut residual = probs - &targets;
            for (mut row, &w) in residual.axis_iter_mut(Axis(0)).zip(scaled.iter()) {
                row *= w;
            }

            let grad_coef = x.t().dot(&residual) + &(&coef * l2);
            let grad_bias = residual.sum_axis(Axis(0));
            coef.scaled_add(-lr, &grad_coef);
            bias.scaled_add(-lr, &grad_bias);

            if !coef.iter().chain(bias.iter()).all(|v| v.is_finite()) {
                return Err(ModelError::Diverged { epoch: epoch + 1 });
            }
        }

        log::debug!(
            "Softmax regression fitted on {} instances, {} features, {} classes.",
            n,
            d,
            self.num_classes
        );
        self.params = Some(SoftmaxParams {
            weights: coef,
            bias,
        });
        Ok(())
    }
}

impl Classifier for SoftmaxRegression {
    type Features = Array2<f64>;

    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<(), ModelError> {
        let ones = vec![1.0; y.len()];
        self.train(x, y, &ones)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        let mut scores = self.linear_scores(x)?;
        softmax_rows(&mut scores);
        Ok(scores)
    }

    fn fit_weighted(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        weights: &[f64],
    ) -> Result<(), ModelError> {
        self.train(x, y, weights)
    }

    fn supports_sample_weight(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn separable() -> (Array2<f64>, Vec<usize>) {
        let x = array![
            [0.0, 1.0],
            [0.1, 0.9],
            [0.2, 1.1],
            [1.0, 0.0],
            [0.9, 0.1],
            [1.1, 0.2]
        ];
        (x, vec![0, 0, 0, 1, 1, 1])
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(array![0.2, 0.4, 0.4].view()), 1);
        assert_eq!(argmax(array![f64::NAN, 0.1].view()), 1);
        assert_eq!(argmax(array![f64::NAN, f64::NAN].view()), 0);
    }

    #[test]
    fn softmax_rows_are_stochastic() {
        let mut scores = array![[1000.0, 1001.0], [-3.0, 2.0]];
        softmax_rows(&mut scores);
        for row in scores.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert!(scores[[0, 1]] > scores[[0, 0]]);
    }

    #[test]
    fn softmax_regression_learns_separable_data() {
        let (x, y) = separable();
        let mut model = SoftmaxRegression::new(2, SoftmaxConfig::default());
        model.fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), y);

        let probs = model.predict_proba(&x).unwrap();
        assert_eq!(probs.dim(), (6, 2));
        for row in probs.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn predicting_before_fit_fails() {
        let (x, _) = separable();
        let model = SoftmaxRegression::new(2, SoftmaxConfig::default());
        assert_eq!(model.predict_proba(&x).unwrap_err(), ModelError::NotFitted);
    }

    #[test]
    fn feature_mismatch_is_reported() {
        let (x, y) = separable();
        let mut model = SoftmaxRegression::new(2, SoftmaxConfig::default());
        model.fit(&x, &y).unwrap();
        let wide = Array2::<f64>::zeros((2, 3));
        assert_eq!(
            model.predict_proba(&wide).unwrap_err(),
            ModelError::FeatureMismatch {
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn labels_out_of_range_are_rejected() {
        let (x, _) = separable();
        let mut model = SoftmaxRegression::new(2, SoftmaxConfig::default());
        let err = model.fit(&x, &[0, 1, 2, 0, 1, 0]).unwrap_err();
        assert_eq!(
            err,
            ModelError::LabelOutOfRange {
                label: 2,
                num_classes: 2
            }
        );
    }

    #[test]
    fn zero_weights_silence_instances() {
        // The last instance carries a contradicting label but no weight.
        let x = array![[0.0], [0.0], [0.0], [1.0], [1.0], [0.0]];
        let y = vec![0, 0, 0, 1, 1, 1];
        let weights = vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let mut model = SoftmaxRegression::new(2, SoftmaxConfig::default());
        model.fit_weighted(&x, &y, &weights).unwrap();
        assert_eq!(model.predict(&array![[0.0]]).unwrap(), vec![0]);
    }

    #[test]
    fn vec_feature_table_selects_in_order() {
        let table = vec!["a", "b", "c", "d"];
        assert_eq!(table.select_rows(&[3, 0]), vec!["d", "a"]);
        assert_eq!(FeatureTable::n_rows(&table), 4);
    }
}
