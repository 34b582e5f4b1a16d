//! Binary classification metrics with the anomalous class as positive.

use anyhow::Result;
use anyhow::bail;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ConfusionMatrix {
    /// Labels are `1` for anomalous and anything else for normal.
    pub fn from_labels(truth: &[u8], predicted: &[u8]) -> Result<Self> {
        if truth.len() != predicted.len() {
            bail!(
                "label count mismatch: {} ground truth vs {} predictions",
                truth.len(),
                predicted.len()
            );
        }

        let mut matrix = Self::default();
        for (&actual, &guess) in truth.iter().zip(predicted) {
            match (actual == 1, guess == 1) {
                (true, true) => matrix.true_positives += 1,
                (false, true) => matrix.false_positives += 1,
                (false, false) => matrix.true_negatives += 1,
                (true, false) => matrix.false_negatives += 1,
            }
        }
        Ok(matrix)
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }
}
