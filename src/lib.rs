pub mod adam;
pub mod config;
pub mod dataset;
pub mod dense;
pub mod errors;
pub mod grad_router;
pub mod information_gain;
pub mod metrics;
pub mod model;
pub mod routing;
pub mod schedule;
pub mod sink;
pub mod trainer;
// Re-export key structs for easier access
pub use adam::Adam;
pub use config::{ModelKind, TrainerConfig};
pub use dataset::{Batch, BatchSet, DatasetSplits};
pub use dense::Dense;
pub use errors::{Result, TrellisError};
pub use grad_router::{GradientMode, GradientRouter, StepGradients, UpdateCall};
pub use information_gain::{information_gain_gradient, information_gain_loss, PROB_FLOOR};
pub use metrics::{CategoricalAccuracy, Mean, MeanVector, PerClassRouting, RunningMetrics};
pub use model::{SubsetId, TrellisGradients, TrellisModel, TrellisOutput, NUM_BRANCHES};
pub use routing::{softmax, softmax_with_temperature, RoutingStrategy};
pub use schedule::{LinearRamp, StepDecay};
pub use sink::{MetricSink, NullSink, SinkResult, TracingSink};
pub use trainer::{EvaluationReport, StepLosses, Trainer, TrainingReport, LOG_EVERY_STEPS};

// Constants
pub const MAX_DATASET_FILE_SIZE: u64 = 64 * 1024 * 1024;
