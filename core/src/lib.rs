pub mod ops;
pub mod runtime;
pub mod shape;
pub mod tensor;

pub use runtime::{current_cpu_threads, init_global_thread_pool, THREADS_ENV};
pub use shape::{TensorShape, MAX_RANK};
pub use tensor::*;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Rank {rank} exceeds the supported maximum of {max}")]
    RankExceeded { rank: usize, max: usize },

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
