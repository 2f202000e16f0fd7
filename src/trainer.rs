use ndarray::{Array1, Array2};
use tracing::{info, warn};

use crate::config::TrainerConfig;
use crate::dataset::{Batch, BatchSet, DatasetSplits};
use crate::errors::{Result, TrellisError};
use crate::grad_router::{GradientMode, GradientRouter, StepGradients, UpdateCall};
use crate::information_gain::{information_gain_gradient, information_gain_loss};
use crate::metrics::{argmax, RunningMetrics};
use crate::model::{TrellisModel, NUM_BRANCHES};
use crate::routing::{softmax, softmax_with_temperature, RoutingStrategy};
use crate::schedule::{LinearRamp, StepDecay};
use crate::sink::MetricSink;

/// Progress summary cadence, in steps.
pub const LOG_EVERY_STEPS: usize = 100;

/// All loss terms of one step, always plain floats. `routing_active` marks
/// whether the routing terms were computed or pinned to zero, so aggregation
/// code never branches on representation.
#[derive(Debug, Clone, Copy)]
pub struct StepLosses {
    pub total: f32,
    pub classification: f32,
    pub routing: [f32; 2],
    pub routing_active: bool,
}

/// Result of one evaluation pass.
pub struct EvaluationReport {
    pub accuracy: f32,
    /// Mean branch distribution per class for each routing point; `None`
    /// for classes the pass never observed.
    pub route_means: [Vec<Option<Array1<f32>>>; 2],
}

/// Result of a full training run.
pub struct TrainingReport {
    pub test_accuracy: f32,
    pub steps_completed: usize,
}

/// Drives epochs and steps: resolves schedules and the routing strategy from
/// the step counter, runs the recorded forward pass, computes losses,
/// dispatches gradients, and keeps the running metrics and the metric sink
/// fed. The step counter lives here and is threaded explicitly into every
/// schedule and policy call.
pub struct Trainer {
    config: TrainerConfig,
    model: TrellisModel,
    router: GradientRouter,
    lr_schedule: StepDecay,
    temperature_schedule: StepDecay,
    balance_schedule: StepDecay,
    weight_schedule: LinearRamp,
    sink: Box<dyn MetricSink>,
    metrics: RunningMetrics,
    global_step: usize,
    last_update_calls: Vec<UpdateCall>,
}

impl Trainer {
    pub fn new(
        config: TrainerConfig,
        model: TrellisModel,
        sink: Box<dyn MetricSink>,
    ) -> Result<Self> {
        config.validate()?;
        model.validate_partition()?;

        let mode = if config.use_routing && config.decouple_routing_gradients {
            GradientMode::Decoupled
        } else {
            GradientMode::Coupled
        };

        let metrics = RunningMetrics::new(config.num_classes, NUM_BRANCHES);
        Ok(Self {
            lr_schedule: config.lr_schedule(),
            temperature_schedule: config.temperature_schedule(),
            balance_schedule: config.balance_schedule(),
            weight_schedule: config.information_gain_weight_schedule(),
            router: GradientRouter::new(mode),
            config,
            model,
            sink,
            metrics,
            global_step: 0,
            last_update_calls: Vec::new(),
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn model(&self) -> &TrellisModel {
        &self.model
    }

    /// Update calls made by the most recent training step, in order.
    pub fn last_update_calls(&self) -> &[UpdateCall] {
        &self.last_update_calls
    }

    /// Full run: all epochs, periodic validation, one final test pass.
    pub fn run(&mut self, data: &DatasetSplits) -> Result<TrainingReport> {
        for epoch in 0..self.config.num_epochs {
            info!(epoch = epoch, "starting epoch");
            self.metrics.reset();

            for batch in data.train.iter() {
                self.train_step(batch)?;
            }

            let last_epoch = epoch + 1 == self.config.num_epochs;
            if (epoch + 1) % self.config.validation_interval_epochs == 0 || last_epoch {
                let report = self.evaluate(&data.validation, "Validation")?;
                info!(
                    epoch = epoch,
                    accuracy = report.accuracy,
                    "validation pass complete"
                );
            }
        }

        let test = self.evaluate(&data.test, "Test")?;
        info!(accuracy = test.accuracy, "test pass complete");
        Ok(TrainingReport {
            test_accuracy: test.accuracy,
            steps_completed: self.global_step,
        })
    }

    /// One training step over one batch. Advances the step counter by
    /// exactly one on success; on any error the step aborts, the forward
    /// recording is released and the error propagates.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepLosses> {
        let step = self.global_step;
        let lr = self.lr_schedule.current_value(step);
        let strategy = RoutingStrategy::select(step, &self.config);
        let (ig_weight, temperature, balance) = if self.config.use_routing {
            (
                self.weight_schedule.current_value(step),
                self.temperature_schedule.current_value(step),
                self.balance_schedule.current_value(step),
            )
        } else {
            (0.0, 1.0, 1.0)
        };

        let result = self.step_inner(batch, strategy, lr, ig_weight, temperature, balance);
        if result.is_err() {
            self.model.clear_trace();
        }
        let losses = result?;

        if step % LOG_EVERY_STEPS == 0 {
            info!(
                step = step,
                accuracy = self.metrics.accuracy.result(),
                loss = self.metrics.total_loss.result(),
                lr = lr,
                strategy = ?strategy,
                "training progress"
            );
        }
        self.log_training_scalars(step, lr, ig_weight, temperature, strategy);

        self.global_step += 1;
        Ok(losses)
    }

    fn step_inner(
        &mut self,
        batch: &Batch,
        strategy: RoutingStrategy,
        lr: f32,
        ig_weight: f32,
        temperature: f32,
        balance: f32,
    ) -> Result<StepLosses> {
        // Fail fast before any element-wise op can truncate or panic on a
        // batch-dimension mismatch.
        if batch.inputs.nrows() != batch.labels.nrows() {
            return Err(TrellisError::ShapeMismatch {
                label_batch: batch.labels.nrows(),
                branch_batch: batch.inputs.nrows(),
            });
        }

        let output = self.model.forward(&batch.inputs, strategy, temperature, true);

        let probs = softmax(&output.logits);
        let classification = cross_entropy_loss(&probs, &batch.labels);
        let grad_logits = cross_entropy_gradient(&probs, &batch.labels);

        let routing_active =
            self.config.use_routing && strategy == RoutingStrategy::InformationGain;
        let mut routing = [0.0f32; 2];
        let mut route_grads: [Option<Array2<f32>>; 2] = [None, None];
        if routing_active {
            for (point, raw) in [&output.route_0, &output.route_1].into_iter().enumerate() {
                let branch_probs = softmax_with_temperature(raw, temperature);
                let loss = information_gain_loss(&batch.labels, &branch_probs, balance)?;
                let grad =
                    information_gain_gradient(&batch.labels, &branch_probs, balance, temperature)?;
                routing[point] = ig_weight * loss;
                route_grads[point] = Some(grad * ig_weight);
            }
        }

        let total = classification + routing[0] + routing[1];
        if !total.is_finite() {
            return Err(TrellisError::NumericalInstability {
                context: format!("training step {}", self.global_step),
            });
        }

        let step_grads = StepGradients {
            logits: grad_logits,
            routes: route_grads,
        };
        self.last_update_calls = self.router.apply_step(&mut self.model, &step_grads, lr);

        self.metrics.accuracy.update(&batch.labels, &output.logits);
        self.metrics.total_loss.update(total);
        self.metrics.classification_loss.update(classification);
        self.metrics.routing_loss[0].update(routing[0]);
        self.metrics.routing_loss[1].update(routing[1]);

        Ok(StepLosses {
            total,
            classification,
            routing,
            routing_active,
        })
    }

    fn log_training_scalars(
        &mut self,
        step: usize,
        lr: f32,
        ig_weight: f32,
        temperature: f32,
        strategy: RoutingStrategy,
    ) {
        let strategy_id = match strategy {
            RoutingStrategy::NoRouting => 0.0,
            RoutingStrategy::Random => 1.0,
            RoutingStrategy::InformationGain => 2.0,
        };

        let sent = if self.config.use_routing {
            self.sink.log_scalars(
                step,
                &[
                    ("Training/TotalLoss", self.metrics.total_loss.result()),
                    (
                        "Training/ClassificationLoss",
                        self.metrics.classification_loss.result(),
                    ),
                    ("Training/Routing_0_Loss", self.metrics.routing_loss[0].result()),
                    ("Training/Routing_1_Loss", self.metrics.routing_loss[1].result()),
                    ("Training/Routing_Loss_Weight", ig_weight),
                    ("Training/Accuracy", self.metrics.accuracy.result()),
                    ("Training/InformationGainSoftmaxTemperature", temperature),
                    ("Training/LearningRate", lr),
                    ("Training/Routing", strategy_id),
                ],
            )
        } else {
            self.sink.log_scalars(
                step,
                &[
                    ("Training/TotalLoss", self.metrics.total_loss.result()),
                    (
                        "Training/ClassificationLoss",
                        self.metrics.classification_loss.result(),
                    ),
                    ("Training/Accuracy", self.metrics.accuracy.result()),
                    ("Training/LearningRate", lr),
                ],
            )
        };
        if let Err(e) = sent {
            warn!(error = %e, "metric sink rejected training scalars");
        }
    }

    /// One evaluation pass: no parameter updates, no step-counter mutation.
    /// The routing strategy and temperature are re-derived from the last
    /// completed training step.
    pub fn evaluate(&mut self, data: &BatchSet, split: &str) -> Result<EvaluationReport> {
        let frozen_step = self.global_step.saturating_sub(1);
        let strategy = RoutingStrategy::select(frozen_step, &self.config);
        let temperature = if self.config.use_routing {
            self.temperature_schedule.current_value(frozen_step)
        } else {
            1.0
        };

        self.metrics.reset();

        for batch in data.iter() {
            if batch.inputs.nrows() != batch.labels.nrows() {
                return Err(TrellisError::ShapeMismatch {
                    label_batch: batch.labels.nrows(),
                    branch_batch: batch.inputs.nrows(),
                });
            }

            let output = self.model.forward(&batch.inputs, strategy, temperature, false);
            self.metrics.accuracy.update(&batch.labels, &output.logits);

            if strategy.is_adaptive() {
                let route_probs = [softmax(&output.route_0), softmax(&output.route_1)];
                for (row, label_row) in batch.labels.rows().into_iter().enumerate() {
                    let class = argmax(label_row);
                    for (point, probs) in route_probs.iter().enumerate() {
                        self.metrics.route_usage[point].update(class, probs.row(row));
                    }
                }
            }
        }

        let accuracy = self.metrics.accuracy.result();

        let mut route_means: [Vec<Option<Array1<f32>>>; 2] = [Vec::new(), Vec::new()];
        for point in 0..2 {
            let usage = &self.metrics.route_usage[point];
            for class in 0..usage.num_classes() {
                route_means[point].push(if usage.class_observed(class) {
                    Some(usage.class_mean(class))
                } else {
                    None
                });
            }
        }

        if self.config.use_routing {
            for (point, per_class) in route_means.iter().enumerate() {
                for (class, mean) in per_class.iter().enumerate() {
                    if let Some(mean) = mean {
                        let rows: Vec<(usize, f32)> = mean.iter().cloned().enumerate().collect();
                        let name = format!("{}/Route{}/Class_{}", split, point, class);
                        if let Err(e) = self.sink.log_table(frozen_step, &name, &rows) {
                            warn!(error = %e, table = %name, "metric sink rejected table");
                        }
                    }
                }
            }
        }
        let accuracy_key = format!("{}/Accuracy", split);
        if let Err(e) = self
            .sink
            .log_scalars(frozen_step, &[(accuracy_key.as_str(), accuracy)])
        {
            warn!(error = %e, "metric sink rejected evaluation scalars");
        }

        Ok(EvaluationReport {
            accuracy,
            route_means,
        })
    }
}

/// Mean categorical cross-entropy over the batch, probabilities clamped
/// before the log. Callers guarantee matching batch dimensions; no row is
/// ever dropped here.
fn cross_entropy_loss(probs: &Array2<f32>, labels: &Array2<f32>) -> f32 {
    let batch = probs.nrows().max(1) as f32;
    let mut loss = 0.0;
    for (prob_row, label_row) in probs.rows().into_iter().zip(labels.rows()) {
        for (&p, &y) in prob_row.iter().zip(label_row.iter()) {
            if y != 0.0 {
                loss -= y * p.max(1e-15).ln();
            }
        }
    }
    loss / batch
}

/// Softmax cross-entropy gradient at the logits: `(probs - labels) / batch`.
fn cross_entropy_gradient(probs: &Array2<f32>, labels: &Array2<f32>) -> Array2<f32> {
    let batch = probs.nrows().max(1) as f32;
    (probs - labels) / batch
}
