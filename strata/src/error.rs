use std::path::PathBuf;

use thiserror::Error;

/// Error type for reconstruction, octree and I/O operations.
///
/// Recoverable numerical degeneracies (back-facing rays, zero-weight
/// voxels, colinear point sets) are reported in-band by the respective
/// operations and never surface as errors.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file format error in {path}: {reason}")]
    FileFormat { path: PathBuf, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl StrataError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn file_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
