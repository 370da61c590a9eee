use ndarray::Array2;
use sieve::aggregate::aggregate;
use sieve::config::{ConfidentLearningConfig, DenoisingStrategy, PruneMethod, PsxCalculationMethod};
use sieve::latent::compute_confident_joint;
use sieve::oos::{OosSettings, estimate_oos_probabilities};
use sieve::progress::NoopProgress;
use sieve::prune::{PruneSettings, prune};
use sieve::{
    Classifier, DenoiseError, DenoisingTrainer, ModelError, SoftmaxConfig, SoftmaxRegression,
    TrainerConfig, TrainerState,
};

#[path = "../denoise/test_fixtures.rs"]
mod test_fixtures;

use test_fixtures::{WeakDataset, WeakDatasetBuilder};

/// Two well separated blobs with the firing rule flipped at `flip_rate`.
fn noisy_blobs(n: usize, flip_rate: f64, seed: u64) -> WeakDataset {
    WeakDatasetBuilder::new(n)
        .flip_rate(flip_rate)
        .separation(3.0)
        .seed(seed)
        .build()
}

fn confident_learning(cl: ConfidentLearningConfig) -> TrainerConfig {
    TrainerConfig {
        seed: Some(17),
        strategy: DenoisingStrategy::ConfidentLearning(cl),
        ..TrainerConfig::default()
    }
}

fn softmax() -> SoftmaxRegression {
    SoftmaxRegression::new(2, SoftmaxConfig::default())
}

/// Predicts the opposite of the noisy label encoded in the single feature column.
#[derive(Clone)]
struct Contrarian;

impl Classifier for Contrarian {
    type Features = Array2<f64>;

    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<(), ModelError> {
        let _ = (x, y);
        Ok(())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        Ok(Array2::from_shape_fn((x.nrows(), 2), |(row, class)| {
            let label = x[[row, 0]] as usize;
            if class == label { 0.1 } else { 0.9 }
        }))
    }
}

#[test]
fn pruning_everything_is_an_empty_training_set() {
    let n = 10;
    let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
    let features = Array2::from_shape_fn((n, 1), |(row, _)| labels[row] as f64);
    let rule_matches = Array2::from_shape_fn((n, 2), |(row, rule)| {
        if rule == labels[row] { 1.0 } else { 0.0 }
    });
    let mut trainer = DenoisingTrainer::new(
        Contrarian,
        Array2::<f64>::eye(2),
        features,
        rule_matches,
        confident_learning(ConfidentLearningConfig {
            cv_n_folds: 2,
            min_examples_per_class: 0,
            num_workers: 1,
            ..ConfidentLearningConfig::default()
        }),
    )
    .unwrap();

    match trainer.train().unwrap_err() {
        DenoiseError::EmptyTrainingSet { stage } => assert_eq!(stage, "pruning"),
        other => panic!("Expected EmptyTrainingSet, got {:?}", other),
    }
    assert_eq!(trainer.state(), TrainerState::Failed);
}

#[test]
fn pruned_instances_are_mostly_flipped_labels() {
    let data = noisy_blobs(300, 0.2, 1);
    let noisy = aggregate(data.rule_matches.view(), data.mapping.view(), None, false).unwrap();
    let kept = noisy.labeled_rows();
    let y: Vec<usize> = noisy.hard_labels().into_iter().flatten().collect();
    let x = data.features.select(ndarray::Axis(0), &kept);
    let z = data.rule_matches.select(ndarray::Axis(0), &kept);

    let oos = estimate_oos_probabilities(
        &x,
        &y,
        z.view(),
        &softmax(),
        2,
        &OosSettings {
            n_folds: 5,
            method: PsxCalculationMethod::Random,
            num_workers: 2,
            skip_failed_folds: false,
            seed: 4,
        },
        &NoopProgress,
    )
    .unwrap();
    let cj = compute_confident_joint(&y, &oos, 2).unwrap();
    let mask = prune(&y, &oos, &cj, &PruneSettings::default()).unwrap();

    let pruned: Vec<usize> = (0..kept.len()).filter(|&i| mask.is_pruned(i)).collect();
    let flipped_total = kept.iter().filter(|&&i| data.flipped[i]).count();
    let hits = pruned.iter().filter(|&&i| data.flipped[kept[i]]).count();
    assert!(!pruned.is_empty());
    assert!(
        hits as f64 >= 0.75 * pruned.len() as f64,
        "only {hits} of {} pruned instances were flipped",
        pruned.len()
    );
    assert!(
        hits as f64 >= 0.6 * flipped_total as f64,
        "only {hits} of {flipped_total} flipped instances were pruned"
    );
}

#[test]
fn denoising_matches_the_majority_vote_baseline() {
    let train = noisy_blobs(400, 0.3, 7);
    let test = noisy_blobs(200, 0.0, 8);

    for method in [PruneMethod::PruneByNoiseRate, PruneMethod::PruneByClass, PruneMethod::Both] {
        let mut trainer = DenoisingTrainer::new(
            softmax(),
            train.mapping.clone(),
            train.features.clone(),
            train.rule_matches.clone(),
            confident_learning(ConfidentLearningConfig {
                prune_method: method,
                num_workers: 2,
                ..ConfidentLearningConfig::default()
            }),
        )
        .unwrap();
        let summary = trainer.train().unwrap();
        assert!(summary.n_pruned > 0, "{method:?} pruned nothing");

        let denoised = trainer.test(&test.features, &test.gold).unwrap();
        let baseline = trainer.baseline(&test.features, &test.gold).unwrap();
        assert!(denoised.accuracy > 0.9, "{method:?}: {}", denoised.accuracy);
        assert!(
            denoised.accuracy + 0.02 >= baseline.accuracy,
            "{method:?}: denoised {} vs baseline {}",
            denoised.accuracy,
            baseline.accuracy
        );
        assert_eq!(trainer.state(), TrainerState::Trained);
    }
}

#[test]
fn rule_aware_folds_train_end_to_end() {
    let data = noisy_blobs(200, 0.1, 21);
    for method in [PsxCalculationMethod::Signatures, PsxCalculationMethod::Rules] {
        let mut trainer = DenoisingTrainer::new(
            softmax(),
            data.mapping.clone(),
            data.features.clone(),
            data.rule_matches.clone(),
            confident_learning(ConfidentLearningConfig {
                cv_n_folds: 3,
                psx_calculation_method: method,
                num_workers: 2,
                ..ConfidentLearningConfig::default()
            }),
        )
        .unwrap();
        let summary = trainer.train().unwrap();
        assert_eq!(summary.fold_sizes.len(), 3);
        assert!(summary.fold_sizes.iter().all(|&size| size > 0));
        let predictions = trainer.predict(&data.features).unwrap();
        assert_eq!(predictions.len(), 200);
    }
}

/// Nearest-centroid classifier over plain coordinate pairs.
#[derive(Clone, Default)]
struct NearestCentroid {
    centroids: Vec<[f64; 2]>,
}

impl Classifier for NearestCentroid {
    type Features = Vec<[f64; 2]>;

    fn fit(&mut self, x: &Vec<[f64; 2]>, y: &[usize]) -> Result<(), ModelError> {
        let mut sums = [[0.0; 2]; 2];
        let mut counts = [0.0; 2];
        for (point, &label) in x.iter().zip(y) {
            if label >= 2 {
                return Err(ModelError::LabelOutOfRange {
                    label,
                    num_classes: 2,
                });
            }
            sums[label][0] += point[0];
            sums[label][1] += point[1];
            counts[label] += 1.0;
        }
        self.centroids = (0..2)
            .map(|c| {
                let n = f64::max(counts[c], 1.0);
                [sums[c][0] / n, sums[c][1] / n]
            })
            .collect();
        Ok(())
    }

    fn predict_proba(&self, x: &Vec<[f64; 2]>) -> Result<Array2<f64>, ModelError> {
        if self.centroids.is_empty() {
            return Err(ModelError::NotFitted);
        }
        Ok(Array2::from_shape_fn((x.len(), 2), |(row, class)| {
            let c = self.centroids[class];
            let d = (x[row][0] - c[0]).powi(2) + (x[row][1] - c[1]).powi(2);
            -d
        }))
    }

    fn emits_probabilities(&self) -> bool {
        false
    }
}

#[test]
fn a_separate_psx_model_can_use_its_own_features() {
    let data = noisy_blobs(150, 0.15, 33);
    let points: Vec<[f64; 2]> = data
        .features
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1]])
        .collect();

    let mut trainer = DenoisingTrainer::new(
        softmax(),
        data.mapping.clone(),
        data.features.clone(),
        data.rule_matches.clone(),
        confident_learning(ConfidentLearningConfig {
            cv_n_folds: 3,
            num_workers: 2,
            ..ConfidentLearningConfig::default()
        }),
    )
    .unwrap()
    .with_psx_model(NearestCentroid::default(), points)
    .unwrap();

    let summary = trainer.train().unwrap();
    assert!(summary.n_pruned > 0);
    let report = trainer.test(&data.features, &data.gold).unwrap();
    assert!(report.accuracy > 0.9);
}

#[test]
fn psx_features_must_line_up_with_rule_matches() {
    let data = noisy_blobs(20, 0.0, 2);
    let result = DenoisingTrainer::new(
        softmax(),
        data.mapping.clone(),
        data.features.clone(),
        data.rule_matches.clone(),
        TrainerConfig::default(),
    )
    .unwrap()
    .with_psx_model(NearestCentroid::default(), vec![[0.0, 0.0]; 5]);
    assert!(matches!(
        result.err().unwrap(),
        DenoiseError::ShapeMismatch { expected: 20, found: 5, .. }
    ));
}

/// Records the weights of its last weighted fit; predicts like a fixed softmax model.
#[derive(Clone)]
struct WeightRecorder {
    inner: SoftmaxRegression,
    weights: Option<Vec<f64>>,
}

impl Classifier for WeightRecorder {
    type Features = Array2<f64>;

    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<(), ModelError> {
        self.weights = None;
        self.inner.fit(x, y)
    }

    fn fit_weighted(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        weights: &[f64],
    ) -> Result<(), ModelError> {
        self.weights = Some(weights.to_vec());
        self.inner.fit_weighted(x, y, weights)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        self.inner.predict_proba(x)
    }

    fn supports_sample_weight(&self) -> bool {
        true
    }
}

#[test]
fn retained_instances_are_weighted_by_inverse_retention() {
    let data = noisy_blobs(200, 0.2, 5);
    let model = WeightRecorder {
        inner: softmax(),
        weights: None,
    };
    let mut trainer = DenoisingTrainer::new(
        model,
        data.mapping.clone(),
        data.features.clone(),
        data.rule_matches.clone(),
        confident_learning(ConfidentLearningConfig {
            num_workers: 2,
            ..ConfidentLearningConfig::default()
        }),
    )
    .unwrap();
    let summary = trainer.train().unwrap();

    let weights = trainer.model().weights.clone().unwrap();
    assert_eq!(weights.len(), summary.n_retained);
    assert!(weights.iter().all(|&w| w >= 1.0 && w.is_finite()));
    assert!(weights.iter().any(|&w| w > 1.0));
}

#[test]
fn training_twice_is_an_invalid_state() {
    let data = noisy_blobs(60, 0.0, 3);
    let mut trainer = DenoisingTrainer::new(
        softmax(),
        data.mapping.clone(),
        data.features.clone(),
        data.rule_matches.clone(),
        TrainerConfig {
            strategy: DenoisingStrategy::MajorityVote,
            ..TrainerConfig::default()
        },
    )
    .unwrap();
    trainer.train().unwrap();
    assert!(matches!(
        trainer.train().unwrap_err(),
        DenoiseError::InvalidState { operation: "train", state: "trained" }
    ));
}
