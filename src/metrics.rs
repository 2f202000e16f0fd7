//! Running metric accumulators.
//!
//! Explicit state, explicit reset: the trainer owns these and resets them at
//! defined boundaries (epoch start, evaluation-pass start). Nothing here is
//! shared across passes implicitly.

use ndarray::{Array1, Array2, ArrayView1};

pub(crate) fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (idx, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = idx;
        }
    }
    best
}

/// Running mean of scalar values.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    sum: f32,
    count: usize,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f32) {
        self.sum += value;
        self.count += 1;
    }

    pub fn result(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Fraction of examples whose argmax logit matches the argmax label.
#[derive(Debug, Clone, Default)]
pub struct CategoricalAccuracy {
    correct: usize,
    total: usize,
}

impl CategoricalAccuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, labels: &Array2<f32>, logits: &Array2<f32>) {
        for (label_row, logit_row) in labels.rows().into_iter().zip(logits.rows()) {
            if argmax(label_row) == argmax(logit_row) {
                self.correct += 1;
            }
            self.total += 1;
        }
    }

    pub fn result(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }

    pub fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Running element-wise mean of equal-length vectors.
#[derive(Debug, Clone)]
pub struct MeanVector {
    sum: Array1<f32>,
    count: usize,
}

impl MeanVector {
    pub fn new(len: usize) -> Self {
        Self {
            sum: Array1::zeros(len),
            count: 0,
        }
    }

    pub fn update(&mut self, value: ArrayView1<f32>) {
        self.sum += &value;
        self.count += 1;
    }

    pub fn observed(&self) -> bool {
        self.count > 0
    }

    pub fn result(&self) -> Array1<f32> {
        if self.count == 0 {
            Array1::zeros(self.sum.len())
        } else {
            &self.sum / self.count as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum.fill(0.0);
        self.count = 0;
    }
}

/// Per-class mean branch distribution for one routing point: one
/// `MeanVector` per true class, accumulated across an evaluation pass.
#[derive(Debug, Clone)]
pub struct PerClassRouting {
    per_class: Vec<MeanVector>,
}

impl PerClassRouting {
    pub fn new(num_classes: usize, num_branches: usize) -> Self {
        Self {
            per_class: (0..num_classes).map(|_| MeanVector::new(num_branches)).collect(),
        }
    }

    pub fn update(&mut self, class: usize, branch_dist: ArrayView1<f32>) {
        self.per_class[class].update(branch_dist);
    }

    pub fn num_classes(&self) -> usize {
        self.per_class.len()
    }

    pub fn class_observed(&self, class: usize) -> bool {
        self.per_class[class].observed()
    }

    pub fn class_mean(&self, class: usize) -> Array1<f32> {
        self.per_class[class].result()
    }

    pub fn reset(&mut self) {
        for acc in self.per_class.iter_mut() {
            acc.reset();
        }
    }
}

/// The full accumulator set for one pass: accuracy, loss means and the
/// per-class routing ratios for both routing points.
pub struct RunningMetrics {
    pub accuracy: CategoricalAccuracy,
    pub total_loss: Mean,
    pub classification_loss: Mean,
    pub routing_loss: [Mean; 2],
    pub route_usage: [PerClassRouting; 2],
}

impl RunningMetrics {
    pub fn new(num_classes: usize, num_branches: usize) -> Self {
        Self {
            accuracy: CategoricalAccuracy::new(),
            total_loss: Mean::new(),
            classification_loss: Mean::new(),
            routing_loss: [Mean::new(), Mean::new()],
            route_usage: [
                PerClassRouting::new(num_classes, num_branches),
                PerClassRouting::new(num_classes, num_branches),
            ],
        }
    }

    pub fn reset(&mut self) {
        self.accuracy.reset();
        self.total_loss.reset();
        self.classification_loss.reset();
        for m in self.routing_loss.iter_mut() {
            m.reset();
        }
        for usage in self.route_usage.iter_mut() {
            usage.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mean_accumulates_and_resets() {
        let mut mean = Mean::new();
        assert_eq!(mean.result(), 0.0);

        mean.update(1.0);
        mean.update(3.0);
        assert_eq!(mean.result(), 2.0);

        mean.reset();
        assert_eq!(mean.result(), 0.0);
    }

    #[test]
    fn test_categorical_accuracy() {
        let mut acc = CategoricalAccuracy::new();
        let labels = array![[0.0, 1.0], [1.0, 0.0], [1.0, 0.0]];
        let logits = array![[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]];

        acc.update(&labels, &logits);
        assert!((acc.result() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_vector_elementwise() {
        let mut mv = MeanVector::new(2);
        mv.update(array![1.0, 0.0].view());
        mv.update(array![0.0, 1.0].view());

        assert_eq!(mv.result(), array![0.5, 0.5]);
        assert!(mv.observed());
    }

    #[test]
    fn test_per_class_routing_tracks_only_observed_classes() {
        let mut usage = PerClassRouting::new(3, 2);
        usage.update(1, array![0.25, 0.75].view());
        usage.update(1, array![0.75, 0.25].view());

        assert!(!usage.class_observed(0));
        assert!(usage.class_observed(1));
        assert_eq!(usage.class_mean(1), array![0.5, 0.5]);

        usage.reset();
        assert!(!usage.class_observed(1));
    }
}
