//! Core building blocks shared by every optimizer:
//! - the residual/Jacobian contract implemented by optimization consumers
//! - numerical differentiation for consumers without an analytic Jacobian

pub mod cost_function;
pub mod numerical;

pub use cost_function::{CostFunction, JacobianFunction, ResidualFunction};
pub use numerical::{NumericalDifferentiation, numerical_jacobian};

use thiserror::Error;
use tracing::error;

/// Core module error types for cost function setup and evaluation
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Dimension mismatch between parameters, residuals and Jacobian
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Residual or Jacobian evaluation produced NaN or Inf
    #[error("Non-finite evaluation: {0}")]
    NonFiniteEvaluation(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
