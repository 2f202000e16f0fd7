use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Shape mismatch: label batch {label_batch} vs branch batch {branch_batch}")]
    ShapeMismatch {
        label_batch: usize,
        branch_batch: usize,
    },

    #[error("Numerical instability in {context}: non-finite value encountered")]
    NumericalInstability { context: String },

    #[error("Dataset loading error: {source}")]
    DatasetLoad {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TrellisError>;
