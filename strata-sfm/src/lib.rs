#![warn(clippy::all)]
#![allow(clippy::needless_range_loop)]

pub mod ba;
pub mod pose;

use thiserror::Error;

/// Error type for bundle adjustment and pose estimation.
///
/// Recoverable numerical degeneracies (colinear P3P input, CG reaching its
/// iteration limit) are reported in-band as empty solution sets or status
/// fields, never as errors.
#[derive(Debug, Error)]
pub enum SfmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl SfmError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SfmError>;
