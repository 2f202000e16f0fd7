use std::fs;

use csv::ReaderBuilder;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal};

use crate::errors::{Result, TrellisError};

/// One pre-batched training unit: inputs are batch x input_dim, labels are
/// batch x num_classes one-hot.
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Array2<f32>,
}

/// A finite, restartable sequence of batches. The trainer only consumes the
/// iteration contract; construction (shuffling, batching, encoding) happens
/// once at load time.
pub struct BatchSet {
    batches: Vec<Batch>,
}

impl BatchSet {
    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn num_examples(&self) -> usize {
        self.batches.iter().map(|b| b.inputs.nrows()).sum()
    }

    /// Shuffle, batch and one-hot encode raw examples.
    pub fn from_examples(
        mut examples: Vec<(Vec<f32>, usize)>,
        num_classes: usize,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrellisError::Configuration {
                message: "batch size must be positive".to_string(),
            });
        }
        examples.shuffle(rng);

        let mut batches = Vec::new();
        for chunk in examples.chunks(batch_size) {
            let input_dim = chunk[0].0.len();
            let mut inputs = Array2::zeros((chunk.len(), input_dim));
            let mut labels = Array2::zeros((chunk.len(), num_classes));

            for (row, (features, label)) in chunk.iter().enumerate() {
                if features.len() != input_dim {
                    return Err(TrellisError::Configuration {
                        message: format!(
                            "inconsistent feature width: {} vs {}",
                            features.len(),
                            input_dim
                        ),
                    });
                }
                if *label >= num_classes {
                    return Err(TrellisError::Configuration {
                        message: format!("label {} out of range for {} classes", label, num_classes),
                    });
                }
                for (col, &v) in features.iter().enumerate() {
                    inputs[[row, col]] = v;
                }
                labels[[row, *label]] = 1.0;
            }

            batches.push(Batch { inputs, labels });
        }

        Ok(Self { batches })
    }
}

/// The three splits the trainer consumes.
pub struct DatasetSplits {
    pub train: BatchSet,
    pub validation: BatchSet,
    pub test: BatchSet,
}

impl DatasetSplits {
    /// Load train/validation/test CSV files. Each row is feature columns
    /// followed by an integer class label in the last column.
    pub fn from_csv(
        train_path: &str,
        validation_path: &str,
        test_path: &str,
        num_classes: usize,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        Ok(Self {
            train: BatchSet::from_examples(read_csv(train_path)?, num_classes, batch_size, rng)?,
            validation: BatchSet::from_examples(
                read_csv(validation_path)?,
                num_classes,
                batch_size,
                rng,
            )?,
            test: BatchSet::from_examples(read_csv(test_path)?, num_classes, batch_size, rng)?,
        })
    }

    /// Seeded Gaussian-cluster dataset: one mean vector per class, examples
    /// drawn around it. Lets the binary run end-to-end without data files.
    pub fn synthetic(
        num_classes: usize,
        input_dim: usize,
        examples_per_split: [usize; 3],
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mean_dist = Normal::new(0.0f32, 2.0).unwrap();
        let noise_dist = Normal::new(0.0f32, 0.5).unwrap();
        let class_means: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| (0..input_dim).map(|_| mean_dist.sample(rng)).collect())
            .collect();

        let make_split = |count: usize, rng: &mut StdRng| -> Result<BatchSet> {
            let examples = (0..count)
                .map(|i| {
                    let class = i % num_classes;
                    let features = class_means[class]
                        .iter()
                        .map(|&m| m + noise_dist.sample(rng))
                        .collect();
                    (features, class)
                })
                .collect();
            BatchSet::from_examples(examples, num_classes, batch_size, rng)
        };

        let train = make_split(examples_per_split[0], &mut *rng)?;
        let validation = make_split(examples_per_split[1], &mut *rng)?;
        let test = make_split(examples_per_split[2], &mut *rng)?;
        Ok(Self {
            train,
            validation,
            test,
        })
    }
}

fn read_csv(path: &str) -> Result<Vec<(Vec<f32>, usize)>> {
    let metadata = fs::metadata(path).map_err(TrellisError::from)?;
    if metadata.len() > crate::MAX_DATASET_FILE_SIZE {
        return Err(TrellisError::Configuration {
            message: format!(
                "dataset file {} is {} bytes, limit is {}",
                path,
                metadata.len(),
                crate::MAX_DATASET_FILE_SIZE
            ),
        });
    }

    let file = fs::File::open(path).map_err(TrellisError::from)?;
    let mut rdr = ReaderBuilder::new().has_headers(false).from_reader(file);

    let mut examples = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(|e| TrellisError::DatasetLoad {
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        if record.len() < 2 {
            return Err(TrellisError::Configuration {
                message: format!("csv row needs features and a label, got {} fields", record.len()),
            });
        }

        let mut features = Vec::with_capacity(record.len() - 1);
        for field in record.iter().take(record.len() - 1) {
            let value: f32 = field.trim().parse().map_err(|_| TrellisError::Configuration {
                message: format!("non-numeric feature value: {:?}", field),
            })?;
            features.push(value);
        }
        let label: usize = record
            .get(record.len() - 1)
            .unwrap()
            .trim()
            .parse()
            .map_err(|_| TrellisError::Configuration {
                message: "non-integer class label".to_string(),
            })?;

        examples.push((features, label));
    }
    Ok(examples)
}
