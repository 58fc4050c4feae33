//! Crate-level error type.
//!
//! Each module owns a `thiserror` enum (`CoreError`, `LinAlgError`,
//! `OptimizerError`, `CalibrationError`). [`VisOptError`] wraps them
//! transparently so callers mixing several modules can use one `?` type
//! without losing the source chain:
//!
//! ```text
//! VisOptError::Calibration(
//!     CalibrationError::Optimizer(
//!         OptimizerError::Core(CoreError::NonFiniteEvaluation(..))
//!     )
//! )
//! ```

use crate::{
    calibration::CalibrationError, core::CoreError, linalg::LinAlgError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Result type for operations spanning several modules
pub type VisOptResult<T> = Result<T, VisOptError>;

/// Top-level error type.
///
/// ```rust,ignore
/// if let Err(e) = run() {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum VisOptError {
    /// Cost function setup and evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimizer setup errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Camera calibration errors
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

impl VisOptError {
    /// The error and each of its sources, one per line.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line variant of [`chain`](Self::chain)
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
