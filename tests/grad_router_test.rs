use cigt::{
    GradientMode, GradientRouter, RoutingStrategy, StepGradients, SubsetId, TrellisModel,
    UpdateCall,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn recorded_model() -> (TrellisModel, StepGradients) {
    let mut rng = StdRng::seed_from_u64(21);
    let mut model = TrellisModel::new(4, 2, 8, 8, 8, &mut rng);
    let input = Array2::from_elem((6, 4), 0.3);

    let output = model.forward(&input, RoutingStrategy::InformationGain, 1.0, true);
    let grads = StepGradients {
        logits: Array2::from_elem(output.logits.dim(), 0.01),
        routes: [
            Some(Array2::from_elem(output.route_0.dim(), 0.02)),
            Some(Array2::from_elem(output.route_1.dim(), 0.02)),
        ],
    };
    (model, grads)
}

#[test]
fn test_decoupled_step_makes_three_update_calls() {
    let (mut model, grads) = recorded_model();
    let router = GradientRouter::new(GradientMode::Decoupled);

    let calls = router.apply_step(&mut model, &grads, 0.001);
    assert_eq!(
        calls,
        vec![
            UpdateCall::Subset(SubsetId::SharedBackbone),
            UpdateCall::Subset(SubsetId::RoutingHead0),
            UpdateCall::Subset(SubsetId::RoutingHead1),
        ]
    );
}

#[test]
fn test_coupled_step_makes_one_combined_call() {
    let (mut model, grads) = recorded_model();
    let router = GradientRouter::new(GradientMode::Coupled);

    let calls = router.apply_step(&mut model, &grads, 0.001);
    assert_eq!(calls, vec![UpdateCall::Combined]);
}

#[test]
fn test_inactive_routing_losses_contribute_no_update_call() {
    let (mut model, grads) = recorded_model();
    let inactive = StepGradients {
        logits: grads.logits,
        routes: [None, None],
    };
    let router = GradientRouter::new(GradientMode::Decoupled);

    let calls = router.apply_step(&mut model, &inactive, 0.001);
    assert_eq!(calls, vec![UpdateCall::Subset(SubsetId::SharedBackbone)]);
}

#[test]
fn test_trace_is_released_after_apply() {
    for mode in [GradientMode::Coupled, GradientMode::Decoupled] {
        let (mut model, grads) = recorded_model();
        assert!(model.has_trace());

        let router = GradientRouter::new(mode);
        router.apply_step(&mut model, &grads, 0.001);
        assert!(!model.has_trace());
    }
}
