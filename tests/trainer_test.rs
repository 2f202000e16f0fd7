use cigt::{
    Batch, BatchSet, DatasetSplits, NullSink, SubsetId, Trainer, TrainerConfig, TrellisModel,
    UpdateCall,
};
use ndarray::array;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn test_config(use_routing: bool, decouple: bool) -> TrainerConfig {
    let mut config = TrainerConfig::default();
    config.use_routing = use_routing;
    config.decouple_routing_gradients = decouple;
    config.num_classes = 2;
    config.num_epochs = 2;
    config.batch_size = 4;
    config.random_routing_warmup_steps = 0;
    config.information_gain_weight_initial = 1.0;
    config.information_gain_weight_final = 1.0;
    config.information_gain_weight_ramp_start_step = 0;
    config.information_gain_weight_ramp_end_step = 1;
    config.information_gain_softmax_temperature_initial = 2.0;
    config.validation_interval_epochs = 1;
    config
}

fn fixed_batch() -> Batch {
    Batch {
        inputs: array![
            [0.0, 0.1, 0.9],
            [0.1, 0.0, 0.8],
            [0.9, 0.8, 0.1],
            [0.8, 0.9, 0.0]
        ],
        labels: array![
            [1.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [0.0, 1.0]
        ],
    }
}

fn build_trainer(config: TrainerConfig) -> Trainer {
    let mut rng = StdRng::seed_from_u64(17);
    let model = TrellisModel::new(3, config.num_classes, 8, 8, 8, &mut rng);
    Trainer::new(config, model, Box::new(NullSink)).unwrap()
}

#[test]
fn test_decoupled_information_gain_step_makes_three_calls() {
    let mut trainer = build_trainer(test_config(true, true));
    let losses = trainer.train_step(&fixed_batch()).unwrap();

    assert!(losses.routing_active);
    assert_eq!(
        trainer.last_update_calls(),
        &[
            UpdateCall::Subset(SubsetId::SharedBackbone),
            UpdateCall::Subset(SubsetId::RoutingHead0),
            UpdateCall::Subset(SubsetId::RoutingHead1),
        ]
    );
}

#[test]
fn test_coupled_step_makes_one_combined_call() {
    let mut trainer = build_trainer(test_config(true, false));
    trainer.train_step(&fixed_batch()).unwrap();

    assert_eq!(trainer.last_update_calls(), &[UpdateCall::Combined]);
}

#[test]
fn test_step_counter_advances_by_one_per_step() {
    let mut trainer = build_trainer(test_config(true, false));
    let batch = fixed_batch();

    assert_eq!(trainer.global_step(), 0);
    for expected in 1..=3 {
        trainer.train_step(&batch).unwrap();
        assert_eq!(trainer.global_step(), expected);
    }
}

#[test]
fn test_routing_disabled_pins_routing_losses_to_zero() {
    let mut trainer = build_trainer(test_config(false, false));
    let losses = trainer.train_step(&fixed_batch()).unwrap();

    assert!(!losses.routing_active);
    assert_eq!(losses.routing, [0.0, 0.0]);
    assert_eq!(losses.total, losses.classification);
    assert_eq!(trainer.last_update_calls(), &[UpdateCall::Combined]);
}

#[test]
fn test_evaluation_accumulates_valid_per_class_distributions() {
    let mut trainer = build_trainer(test_config(true, false));
    let mut rng = StdRng::seed_from_u64(23);
    let examples = vec![
        (vec![0.0, 0.1, 0.9], 0),
        (vec![0.1, 0.0, 0.8], 0),
        (vec![0.9, 0.8, 0.1], 1),
        (vec![0.8, 0.9, 0.0], 1),
    ];
    let eval_set = BatchSet::from_examples(examples, 2, 4, &mut rng).unwrap();

    let report = trainer.evaluate(&eval_set, "Validation").unwrap();

    assert!(report.accuracy >= 0.0 && report.accuracy <= 1.0);
    for point in 0..2 {
        for class in 0..2 {
            let mean = report.route_means[point][class]
                .as_ref()
                .expect("both classes observed");
            let sum: f32 = mean.iter().sum();
            assert!(
                (sum - 1.0).abs() < 1e-5,
                "route {} class {} mean {:?} does not sum to 1",
                point,
                class,
                mean
            );
        }
    }
}

#[test]
fn test_evaluation_mutates_neither_step_nor_parameters() {
    let mut trainer = build_trainer(test_config(true, false));
    let batch = fixed_batch();
    trainer.train_step(&batch).unwrap();

    let step_before = trainer.global_step();
    let mut rng = StdRng::seed_from_u64(29);
    let eval_set = BatchSet::from_examples(
        vec![(vec![0.0, 0.1, 0.9], 0), (vec![0.9, 0.8, 0.1], 1)],
        2,
        2,
        &mut rng,
    )
    .unwrap();

    trainer.evaluate(&eval_set, "Validation").unwrap();
    assert_eq!(trainer.global_step(), step_before);
    assert!(!trainer.model().has_trace());
}

#[test]
fn test_shape_mismatch_aborts_step_and_releases_trace() {
    let mut trainer = build_trainer(test_config(true, false));
    let bad_batch = Batch {
        inputs: array![
            [0.0, 0.1, 0.9],
            [0.1, 0.0, 0.8],
            [0.9, 0.8, 0.1],
            [0.8, 0.9, 0.0]
        ],
        labels: array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
    };

    assert!(trainer.train_step(&bad_batch).is_err());
    assert_eq!(trainer.global_step(), 0);
    assert!(!trainer.model().has_trace());
}

#[test]
fn test_full_run_completes_on_synthetic_data() {
    let config = test_config(true, true);
    let mut rng = StdRng::seed_from_u64(31);
    let data = DatasetSplits::synthetic(2, 3, [40, 8, 8], 4, &mut rng).unwrap();
    let model = TrellisModel::new(3, 2, 8, 8, 8, &mut rng);
    let mut trainer = Trainer::new(config, model, Box::new(NullSink)).unwrap();

    let report = trainer.run(&data).unwrap();
    // 40 examples in batches of 4, over 2 epochs.
    assert_eq!(report.steps_completed, 20);
    assert!(report.test_accuracy >= 0.0 && report.test_accuracy <= 1.0);
}
