//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MtvError {
    /// Invalid or conflicting options, detected before any allocation
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch: expected {expected} voxels, got {actual}")]
    Shape { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Worker pool error: {0}")]
    Pool(String),
}

pub type Result<T> = std::result::Result<T, MtvError>;

impl MtvError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        MtvError::Config(msg.into())
    }
}

/// Fail with a [`MtvError::Shape`] unless `actual == expected`.
pub(crate) fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MtvError::Shape { expected, actual })
    }
}
