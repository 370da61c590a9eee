//! Builders for synthetic weakly labeled datasets, shared by the unit tests and the
//! integration tests.

use ndarray::{Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Two Gaussian blobs labeled by four rules: rules 0 and 1 vote for class 0, rules 2
/// and 3 for class 1.
pub struct WeakDataset {
    pub features: Array2<f64>,
    pub rule_matches: Array2<f64>,
    pub mapping: Array2<f64>,
    pub gold: Vec<usize>,
    /// Whether the rule that fired on an instance votes against its gold label.
    pub flipped: Vec<bool>,
}

pub struct WeakDatasetBuilder {
    n_samples: usize,
    flip_rate: f64,
    coverage: f64,
    separation: f64,
    seed: u64,
}

impl WeakDatasetBuilder {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            flip_rate: 0.1,
            coverage: 0.9,
            separation: 2.0,
            seed: 42,
        }
    }

    /// Probability that the firing rule votes for the wrong class.
    pub fn flip_rate(mut self, p: f64) -> Self {
        self.flip_rate = p.clamp(0.0, 1.0);
        self
    }

    /// Distance of each blob centre from the origin along the first feature.
    pub fn separation(mut self, d: f64) -> Self {
        self.separation = d;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn build(self) -> WeakDataset {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = self.n_samples;

        let gold: Vec<usize> = (0..n).map(|i| i % 2).collect();
        let mut features = Array2::<f64>::zeros((n, 2));
        let mut rule_matches = Array2::<f64>::zeros((n, 4));
        let mut flipped = vec![false; n];
        for (i, &class) in gold.iter().enumerate() {
            let centre = if class == 0 { -self.separation } else { self.separation };
            features[[i, 0]] = centre + rng.sample::<f64, _>(StandardNormal);
            features[[i, 1]] = rng.sample::<f64, _>(StandardNormal);

            if !rng.gen_bool(self.coverage) {
                continue;
            }
            flipped[i] = rng.gen_bool(self.flip_rate);
            let noisy = if flipped[i] { 1 - class } else { class };
            let rule = 2 * noisy + rng.gen_range(0..2);
            rule_matches[[i, rule]] = 1.0;
        }

        WeakDataset {
            features,
            rule_matches,
            mapping: array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]],
            gold,
            flipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flips_only_touch_covered_instances() {
        let data = WeakDatasetBuilder::new(400).flip_rate(0.25).separation(3.0).seed(9).build();
        let mut n_flipped = 0;
        for (i, row) in data.rule_matches.rows().into_iter().enumerate() {
            let fired: Vec<usize> = (0..4).filter(|&r| row[r] > 0.0).collect();
            match fired.as_slice() {
                [] => assert!(!data.flipped[i]),
                [rule] => {
                    let noisy = rule / 2;
                    assert_eq!(noisy != data.gold[i], data.flipped[i]);
                    n_flipped += usize::from(data.flipped[i]);
                }
                _ => panic!("instance {i} has more than one firing rule"),
            }
        }
        assert!(n_flipped > 40 && n_flipped < 140, "{n_flipped} flips");

        let clean = WeakDatasetBuilder::new(100).flip_rate(0.0).build();
        assert!(clean.flipped.iter().all(|&f| !f));
    }
}
