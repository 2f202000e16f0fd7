use ndarray::Array2;

use crate::model::{SubsetId, TrellisModel};

/// How per-step losses map onto parameter updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMode {
    /// One total loss differentiated against the full trainable set, one
    /// combined update call.
    Coupled,
    /// The classification loss updates only the shared backbone; each routing
    /// loss updates only its own head.
    Decoupled,
}

/// One parameter update made by the router during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCall {
    Combined,
    Subset(SubsetId),
}

/// Loss gradients at the model's output surfaces for one step.
///
/// Routing entries are `None` when the step's strategy computed no
/// information-gain loss; absent gradients contribute no update, not an
/// error.
pub struct StepGradients {
    pub logits: Array2<f32>,
    pub routes: [Option<Array2<f32>>; 2],
}

/// Applies `(loss-gradient, parameter-subset)` pairs from one recorded
/// forward pass, without updates from one loss leaking into another subset.
///
/// Decoupled mode leans on the trace supporting repeated backward passes:
/// the backbone and each head are differentiated independently against the
/// same recording. The trace is released before `apply_step` returns, on
/// every path, so recordings never accumulate across steps.
pub struct GradientRouter {
    mode: GradientMode,
}

impl GradientRouter {
    pub fn new(mode: GradientMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> GradientMode {
        self.mode
    }

    /// Differentiate and apply this step's gradients. Returns the update
    /// calls that were made, in order.
    pub fn apply_step(
        &self,
        model: &mut TrellisModel,
        grads: &StepGradients,
        lr: f32,
    ) -> Vec<UpdateCall> {
        let calls = match self.mode {
            GradientMode::Coupled => {
                let total = model.backward_total(
                    &grads.logits,
                    [grads.routes[0].as_ref(), grads.routes[1].as_ref()],
                );
                model.apply_update(&total, lr);
                vec![UpdateCall::Combined]
            }
            GradientMode::Decoupled => {
                let mut calls = Vec::with_capacity(3);

                let backbone = model.backward_classification(&grads.logits);
                model.apply_update(&backbone, lr);
                calls.push(UpdateCall::Subset(SubsetId::SharedBackbone));

                let head_subsets = [SubsetId::RoutingHead0, SubsetId::RoutingHead1];
                for point in 0..2 {
                    if let Some(grad_raw) = grads.routes[point].as_ref() {
                        let head_grads = model.backward_head(point, grad_raw);
                        model.apply_head_update(point, &head_grads, lr);
                        calls.push(UpdateCall::Subset(head_subsets[point]));
                    }
                }
                calls
            }
        };

        model.clear_trace();
        calls
    }
}
