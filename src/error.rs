//! Typed error kinds for the engine. Every engine
//! entry point returns `Result<T, YaffsError>`; the CLI binary is the
//! only place that widens into `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum YaffsError {
    #[error("out of space")]
    OutOfSpace,

    #[error("uncorrectable ECC error on chunk {phys_chunk}")]
    EccUnfixable { phys_chunk: usize },

    #[error("write verify failed on chunk {phys_chunk}")]
    WriteVerifyFailure { phys_chunk: usize },

    #[error("erase failed on block {block}")]
    EraseFailure { block: usize },

    #[error("bad geometry: {reason}")]
    BadGeometry { reason: String },

    #[error("device busy: {reason}")]
    Busy { reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    #[error("device is read-only")]
    ReadOnly,

    #[error("driver error: {0}")]
    Driver(anyhow::Error),
}

impl From<anyhow::Error> for YaffsError {
    fn from(e: anyhow::Error) -> Self {
        YaffsError::Driver(e)
    }
}

pub type YaffsResult<T> = Result<T, YaffsError>;
