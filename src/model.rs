use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ModelKind, TrainerConfig};
use crate::dense::Dense;
use crate::errors::{Result, TrellisError};
use crate::routing::RoutingStrategy;

/// Branches per routing point. The trellis makes two binary decisions.
pub const NUM_BRANCHES: usize = 2;

/// Disjoint groupings of the trainable parameters, used for gradient
/// decoupling. `SharedBackbone` covers the stem, every branch block and the
/// classifier; each routing head is its own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsetId {
    SharedBackbone,
    RoutingHead0,
    RoutingHead1,
}

/// Raw outputs of one recorded forward pass.
pub struct TrellisOutput {
    /// Routing head 0 raw activations, batch x NUM_BRANCHES.
    pub route_0: Array2<f32>,
    /// Routing head 1 raw activations, batch x NUM_BRANCHES.
    pub route_1: Array2<f32>,
    /// Classifier raw activations, batch x num_classes.
    pub logits: Array2<f32>,
}

/// Parameter gradients from one backward pass, grouped by layer.
///
/// `heads` entries are `None` when the corresponding routing loss was
/// inactive for the step; applying such a gradient set simply skips them.
pub struct TrellisGradients {
    pub stem: Vec<Array2<f32>>,
    pub branches: [Vec<Vec<Array2<f32>>>; 2],
    pub classifier: Vec<Array2<f32>>,
    pub heads: [Option<Vec<Array2<f32>>>; 2],
}

/// Classifier with a shared stem and two routing points of `NUM_BRANCHES`
/// branch blocks each, plus one routing head per point.
///
/// ```text
/// input -> stem -> [branch] -> [branch] -> classifier -> logits
///            \        ^    \       ^
///             head_0 -'     head_1-'   (branch choice per example)
/// ```
///
/// A `training` forward pass records every layer's activations and the
/// per-example branch selections; that recording supports any number of
/// independent backward passes until `clear_trace` releases it.
pub struct TrellisModel {
    stem: Dense,
    heads: [Dense; 2],
    branches: [Vec<Dense>; 2],
    classifier: Dense,
    rng: StdRng,
    selections: [Option<Vec<usize>>; 2],
}

impl TrellisModel {
    pub fn new(
        input_dim: usize,
        num_classes: usize,
        stem_dim: usize,
        mid_dim: usize,
        late_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        let branches_0 = (0..NUM_BRANCHES)
            .map(|_| Dense::new(stem_dim, mid_dim, true, rng))
            .collect();
        let branches_1 = (0..NUM_BRANCHES)
            .map(|_| Dense::new(mid_dim, late_dim, true, rng))
            .collect();

        TrellisModel {
            stem: Dense::new(input_dim, stem_dim, true, rng),
            heads: [
                Dense::new(stem_dim, NUM_BRANCHES, false, rng),
                Dense::new(mid_dim, NUM_BRANCHES, false, rng),
            ],
            branches: [branches_0, branches_1],
            classifier: Dense::new(late_dim, num_classes, false, rng),
            rng: StdRng::from_rng(rng),
            selections: [None, None],
        }
    }

    /// LeNet-scale trellis.
    pub fn lenet(input_dim: usize, num_classes: usize, rng: &mut StdRng) -> Self {
        Self::new(input_dim, num_classes, 128, 64, 32, rng)
    }

    /// Half-width variant of `lenet`.
    pub fn lenet_slim(input_dim: usize, num_classes: usize, rng: &mut StdRng) -> Self {
        Self::new(input_dim, num_classes, 64, 32, 16, rng)
    }

    /// Build the configured model variant. An unimplemented selection is a
    /// configuration error, raised before training starts.
    pub fn from_config(config: &TrainerConfig, input_dim: usize, rng: &mut StdRng) -> Result<Self> {
        match config.model {
            ModelKind::Lenet => Ok(Self::lenet(input_dim, config.num_classes, rng)),
            ModelKind::LenetSlim => Ok(Self::lenet_slim(input_dim, config.num_classes, rng)),
            ModelKind::Resnet18 | ModelKind::Resnet18Slim => Err(TrellisError::Configuration {
                message: format!("MODEL {:?} is not implemented", config.model),
            }),
        }
    }

    /// Run the trellis on a batch.
    ///
    /// When `training` is set the pass is recorded for later backward calls.
    /// Branch selection is per example: `NoRouting` pins branch 0, `Random`
    /// draws uniformly, `InformationGain` takes the routing head's argmax.
    /// Every branch block executes on the full batch and each example keeps
    /// the rows of its selected branch, so the recorded graph stays a plain
    /// sequence of dense matmuls.
    pub fn forward(
        &mut self,
        input: &Array2<f32>,
        strategy: RoutingStrategy,
        _temperature: f32,
        training: bool,
    ) -> TrellisOutput {
        let h0 = self.stem.forward(input, training);

        let route_0 = self.heads[0].forward(&h0, training);
        let selection_0 = self.select_branches(&route_0, strategy);
        let h1 = branch_stage_forward(&mut self.branches[0], &h0, &selection_0, training);

        let route_1 = self.heads[1].forward(&h1, training);
        let selection_1 = self.select_branches(&route_1, strategy);
        let h2 = branch_stage_forward(&mut self.branches[1], &h1, &selection_1, training);

        let logits = self.classifier.forward(&h2, training);

        if training {
            self.selections = [Some(selection_0), Some(selection_1)];
        }

        TrellisOutput {
            route_0,
            route_1,
            logits,
        }
    }

    fn select_branches(&mut self, route_raw: &Array2<f32>, strategy: RoutingStrategy) -> Vec<usize> {
        match strategy {
            RoutingStrategy::NoRouting => vec![0; route_raw.nrows()],
            RoutingStrategy::Random => (0..route_raw.nrows())
                .map(|_| self.rng.random_range(0..NUM_BRANCHES))
                .collect(),
            RoutingStrategy::InformationGain => route_raw
                .rows()
                .into_iter()
                .map(|row| {
                    let mut best = 0;
                    for (idx, &v) in row.iter().enumerate() {
                        if v > row[best] {
                            best = idx;
                        }
                    }
                    best
                })
                .collect(),
        }
    }

    /// One backward pass over the recorded forward computation.
    ///
    /// `grad_logits` is the classification-loss gradient at the classifier
    /// output. `grad_routes` carries the routing-loss gradients at each
    /// head's raw output; a `Some` entry contributes that head's parameter
    /// gradients and lets the head's input gradient flow into the backbone
    /// chain (the coupled-mode semantics). Non-mutating: may be called
    /// repeatedly against one trace.
    pub fn backward_total(
        &self,
        grad_logits: &Array2<f32>,
        grad_routes: [Option<&Array2<f32>>; 2],
    ) -> TrellisGradients {
        let selection_0 = self.selections[0].as_ref().unwrap();
        let selection_1 = self.selections[1].as_ref().unwrap();

        let (grad_h2, classifier_grads) = self.classifier.compute_gradients(grad_logits);

        let (mut grad_h1, branches_1_grads) =
            branch_stage_backward(&self.branches[1], selection_1, &grad_h2);
        let head_1_grads = grad_routes[1].map(|grad_raw| {
            let (grad_head_input, head_grads) = self.heads[1].compute_gradients(grad_raw);
            grad_h1 += &grad_head_input;
            head_grads
        });

        let (mut grad_h0, branches_0_grads) =
            branch_stage_backward(&self.branches[0], selection_0, &grad_h1);
        let head_0_grads = grad_routes[0].map(|grad_raw| {
            let (grad_head_input, head_grads) = self.heads[0].compute_gradients(grad_raw);
            grad_h0 += &grad_head_input;
            head_grads
        });

        let (_, stem_grads) = self.stem.compute_gradients(&grad_h0);

        TrellisGradients {
            stem: stem_grads,
            branches: [branches_0_grads, branches_1_grads],
            classifier: classifier_grads,
            heads: [head_0_grads, head_1_grads],
        }
    }

    /// Backbone-only backward pass: the classification loss differentiated
    /// against the shared-backbone subset, routing heads untouched.
    pub fn backward_classification(&self, grad_logits: &Array2<f32>) -> TrellisGradients {
        self.backward_total(grad_logits, [None, None])
    }

    /// Routing-head-only backward pass: one head's parameter gradients from
    /// its routing loss. The head's input gradient is discarded, so nothing
    /// leaks into the backbone subset.
    pub fn backward_head(&self, point: usize, grad_raw: &Array2<f32>) -> Vec<Array2<f32>> {
        let (_, head_grads) = self.heads[point].compute_gradients(grad_raw);
        head_grads
    }

    /// Apply every gradient present in `grads` as one update call.
    pub fn apply_update(&mut self, grads: &TrellisGradients, lr: f32) {
        self.stem.apply_gradients(&grads.stem, lr);
        for (point, stage) in self.branches.iter_mut().enumerate() {
            for (branch, layer) in stage.iter_mut().enumerate() {
                layer.apply_gradients(&grads.branches[point][branch], lr);
            }
        }
        self.classifier.apply_gradients(&grads.classifier, lr);
        for (point, head_grads) in grads.heads.iter().enumerate() {
            if let Some(head_grads) = head_grads {
                self.heads[point].apply_gradients(head_grads, lr);
            }
        }
    }

    /// Apply one routing head's gradients as a standalone update call.
    pub fn apply_head_update(&mut self, point: usize, head_grads: &[Array2<f32>], lr: f32) {
        self.heads[point].apply_gradients(head_grads, lr);
    }

    /// Release the recorded forward pass. Called by the gradient router on
    /// every exit path so traces never outlive their step.
    pub fn clear_trace(&mut self) {
        self.stem.clear_trace();
        for head in self.heads.iter_mut() {
            head.clear_trace();
        }
        for stage in self.branches.iter_mut() {
            for layer in stage.iter_mut() {
                layer.clear_trace();
            }
        }
        self.classifier.clear_trace();
        self.selections = [None, None];
    }

    pub fn has_trace(&self) -> bool {
        self.stem.has_trace()
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.out_dim()
    }

    pub fn input_dim(&self) -> usize {
        self.stem.in_dim()
    }

    pub fn total_parameters(&self) -> usize {
        let mut total = self.stem.parameters() + self.classifier.parameters();
        for head in self.heads.iter() {
            total += head.parameters();
        }
        for stage in self.branches.iter() {
            for layer in stage.iter() {
                total += layer.parameters();
            }
        }
        total
    }

    /// Names of every trainable matrix, in a stable order.
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameter_partition()
            .into_iter()
            .flat_map(|(_, names)| names)
            .collect()
    }

    /// The subset partition used for gradient decoupling: every trainable
    /// matrix appears under exactly one subset.
    pub fn parameter_partition(&self) -> Vec<(SubsetId, Vec<String>)> {
        let mut backbone = vec!["stem.w".to_string(), "stem.b".to_string()];
        for (point, stage) in self.branches.iter().enumerate() {
            for branch in 0..stage.len() {
                backbone.push(format!("route_{}.branch_{}.w", point, branch));
                backbone.push(format!("route_{}.branch_{}.b", point, branch));
            }
        }
        backbone.push("classifier.w".to_string());
        backbone.push("classifier.b".to_string());

        vec![
            (SubsetId::SharedBackbone, backbone),
            (
                SubsetId::RoutingHead0,
                vec!["head_0.w".to_string(), "head_0.b".to_string()],
            ),
            (
                SubsetId::RoutingHead1,
                vec!["head_1.w".to_string(), "head_1.b".to_string()],
            ),
        ]
    }

    /// Check the partition invariant: subsets are pairwise disjoint and
    /// jointly cover the full trainable-parameter set. Run once before
    /// training starts.
    pub fn validate_partition(&self) -> Result<()> {
        let partition = self.parameter_partition();
        let mut seen = std::collections::HashSet::new();
        for (subset, names) in &partition {
            for name in names {
                if !seen.insert(name.clone()) {
                    return Err(TrellisError::Configuration {
                        message: format!(
                            "parameter {} assigned to more than one subset (last: {:?})",
                            name, subset
                        ),
                    });
                }
            }
        }

        // Two matrices (w, b) per dense layer.
        let num_layers = 2 + self.heads.len() + self.branches.iter().map(Vec::len).sum::<usize>();
        if seen.len() != 2 * num_layers {
            return Err(TrellisError::Configuration {
                message: format!(
                    "parameter partition covers {} matrices, model has {}",
                    seen.len(),
                    2 * num_layers
                ),
            });
        }
        Ok(())
    }
}

/// Run every branch on the full batch, then keep each example's row from its
/// selected branch.
fn branch_stage_forward(
    branches: &mut [Dense],
    input: &Array2<f32>,
    selection: &[usize],
    training: bool,
) -> Array2<f32> {
    let outputs: Vec<Array2<f32>> = branches
        .iter_mut()
        .map(|branch| branch.forward(input, training))
        .collect();

    let mut merged = Array2::zeros((input.nrows(), outputs[0].ncols()));
    for (row, &sel) in selection.iter().enumerate() {
        merged.row_mut(row).assign(&outputs[sel].row(row));
    }
    merged
}

/// Backward through one routing point: each branch sees the upstream gradient
/// only on the rows it was selected for, so parameter updates from one branch
/// never leak into another.
fn branch_stage_backward(
    branches: &[Dense],
    selection: &[usize],
    upstream: &Array2<f32>,
) -> (Array2<f32>, Vec<Vec<Array2<f32>>>) {
    let mut grad_input: Option<Array2<f32>> = None;
    let mut param_grads = Vec::with_capacity(branches.len());

    for (branch_idx, branch) in branches.iter().enumerate() {
        let masked = mask_rows(upstream, selection, branch_idx);
        let (branch_input_grads, branch_param_grads) = branch.compute_gradients(&masked);
        param_grads.push(branch_param_grads);
        grad_input = Some(match grad_input {
            Some(acc) => acc + &branch_input_grads,
            None => branch_input_grads,
        });
    }

    (grad_input.unwrap(), param_grads)
}

fn mask_rows(grads: &Array2<f32>, selection: &[usize], branch: usize) -> Array2<f32> {
    let mut masked = grads.clone();
    for (row, &sel) in selection.iter().enumerate() {
        if sel != branch {
            masked.row_mut(row).fill(0.0);
        }
    }
    masked
}
