use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::adam::Adam;

/// Fully connected layer with optional ReLU and per-matrix Adam state.
///
/// The forward pass records its activations when `training` is set; gradient
/// computation reads those caches without consuming them, so several
/// independent backward passes can run against one recorded forward pass.
/// `clear_trace` releases the recording.
pub struct Dense {
    pub w: Array2<f32>,
    pub b: Array2<f32>,
    relu: bool,
    optimizer_w: Adam,
    cached_input: Option<Array2<f32>>,
    cached_preactivation: Option<Array2<f32>>,
}

impl Dense {
    /// He initialization: std = sqrt(2 / fan_in), zero bias.
    pub fn new(in_dim: usize, out_dim: usize, relu: bool, rng: &mut StdRng) -> Self {
        let std = (2.0 / in_dim as f32).sqrt();
        let normal = Normal::new(0.0, std).unwrap();

        Dense {
            w: Array2::from_shape_fn((in_dim, out_dim), |_| normal.sample(rng)),
            b: Array2::zeros((1, out_dim)),
            relu,
            optimizer_w: Adam::new((in_dim, out_dim)),
            cached_input: None,
            cached_preactivation: None,
        }
    }

    pub fn forward(&mut self, input: &Array2<f32>, training: bool) -> Array2<f32> {
        let pre = input.dot(&self.w) + &self.b;
        let out = if self.relu {
            pre.mapv(|x| x.max(0.0))
        } else {
            pre.clone()
        };

        if training {
            self.cached_input = Some(input.clone());
            self.cached_preactivation = Some(pre);
        }

        out
    }

    /// Gradients from a recorded forward pass. Non-mutating: repeated calls
    /// against the same trace are valid until `clear_trace`.
    ///
    /// Returns `(input_grads, [grad_w, grad_b])`.
    pub fn compute_gradients(&self, output_grads: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let input = self.cached_input.as_ref().unwrap();
        let pre = self.cached_preactivation.as_ref().unwrap();

        let grad_pre = if self.relu {
            let mut g = output_grads.clone();
            g.zip_mut_with(pre, |grad, &p| {
                if p <= 0.0 {
                    *grad = 0.0;
                }
            });
            g
        } else {
            output_grads.clone()
        };

        let grad_w = input.t().dot(&grad_pre);
        let grad_b = grad_pre.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_input = grad_pre.dot(&self.w.t());

        (grad_input, vec![grad_w, grad_b])
    }

    pub fn apply_gradients(&mut self, param_grads: &[Array2<f32>], lr: f32) {
        self.optimizer_w.step(&mut self.w, &param_grads[0], lr);
        self.b -= &(lr * &param_grads[1]);
    }

    pub fn clear_trace(&mut self) {
        self.cached_input = None;
        self.cached_preactivation = None;
    }

    pub fn has_trace(&self) -> bool {
        self.cached_input.is_some()
    }

    pub fn in_dim(&self) -> usize {
        self.w.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.w.ncols()
    }

    pub fn parameters(&self) -> usize {
        self.w.len() + self.b.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_forward_matches_manual_matmul() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut layer = Dense::new(2, 2, false, &mut rng);
        layer.w = array![[1.0, 0.0], [0.0, 2.0]];
        layer.b = array![[0.5, -0.5]];

        let out = layer.forward(&array![[3.0, 4.0]], false);
        assert_eq!(out, array![[3.5, 7.5]]);
    }

    #[test]
    fn test_eval_forward_records_no_trace() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut layer = Dense::new(3, 2, true, &mut rng);

        layer.forward(&array![[1.0, 2.0, 3.0]], false);
        assert!(!layer.has_trace());

        layer.forward(&array![[1.0, 2.0, 3.0]], true);
        assert!(layer.has_trace());

        layer.clear_trace();
        assert!(!layer.has_trace());
    }

    #[test]
    fn test_compute_gradients_twice_from_one_trace() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut layer = Dense::new(2, 2, false, &mut rng);
        layer.forward(&array![[1.0, -1.0], [2.0, 0.5]], true);

        let upstream = array![[1.0, 0.0], [0.0, 1.0]];
        let (gi_first, gp_first) = layer.compute_gradients(&upstream);
        let (gi_second, gp_second) = layer.compute_gradients(&upstream);

        assert_eq!(gi_first, gi_second);
        assert_eq!(gp_first[0], gp_second[0]);
        assert_eq!(gp_first[1], gp_second[1]);
    }

    #[test]
    fn test_relu_blocks_gradient_on_dead_units() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut layer = Dense::new(1, 1, true, &mut rng);
        layer.w = array![[1.0]];
        layer.b = array![[0.0]];

        layer.forward(&array![[-5.0]], true);
        let (grad_input, _) = layer.compute_gradients(&array![[1.0]]);
        assert_eq!(grad_input, array![[0.0]]);
    }
}
