use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use cigt::{DatasetSplits, TracingSink, Trainer, TrainerConfig, TrellisModel};

#[derive(Parser)]
#[command(name = "cigt")]
#[command(about = "Train an information-gain-routed trellis classifier")]
struct Args {
    /// Path to the run configuration (JSON, experiment-dashboard key names)
    #[arg(short, long)]
    config: Option<String>,

    /// Train/validation/test CSV files (feature columns + integer label).
    /// Omit all three to run on a seeded synthetic dataset.
    #[arg(long)]
    train_csv: Option<String>,

    #[arg(long)]
    validation_csv: Option<String>,

    #[arg(long)]
    test_csv: Option<String>,

    /// Input feature width of the synthetic dataset
    #[arg(long, default_value_t = 16)]
    synthetic_input_dim: usize,

    /// Training examples in the synthetic dataset
    #[arg(long, default_value_t = 4000)]
    synthetic_train_examples: usize,
}

fn main() -> cigt::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match &args.config {
        Some(path) => TrainerConfig::from_file(path)?,
        None => TrainerConfig::default(),
    };
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(config.random_seed);

    let data = match (&args.train_csv, &args.validation_csv, &args.test_csv) {
        (Some(train), Some(validation), Some(test)) => DatasetSplits::from_csv(
            train,
            validation,
            test,
            config.num_classes,
            config.batch_size,
            &mut rng,
        )?,
        (None, None, None) => {
            let eval_examples = (args.synthetic_train_examples / 5).max(config.num_classes);
            DatasetSplits::synthetic(
                config.num_classes,
                args.synthetic_input_dim,
                [args.synthetic_train_examples, eval_examples, eval_examples],
                config.batch_size,
                &mut rng,
            )?
        }
        _ => {
            return Err(cigt::TrellisError::Configuration {
                message: "provide all of --train-csv/--validation-csv/--test-csv or none"
                    .to_string(),
            })
        }
    };

    let input_dim = data
        .train
        .iter()
        .next()
        .map(|batch| batch.inputs.ncols())
        .ok_or_else(|| cigt::TrellisError::Configuration {
            message: "training split is empty".to_string(),
        })?;

    let model = TrellisModel::from_config(&config, input_dim, &mut rng)?;
    info!(
        parameters = model.total_parameters(),
        input_dim = input_dim,
        "model ready"
    );

    let mut trainer = Trainer::new(config, model, Box::new(TracingSink))?;
    let report = trainer.run(&data)?;
    info!(
        test_accuracy = report.test_accuracy,
        steps = report.steps_completed,
        "run finished"
    );

    Ok(())
}
