//! The contract between the optimizers and the problems they solve.
//!
//! A problem supplies two things:
//!
//! ```text
//! residual:  ℝⁿ → ℝᵐ        r(x)
//! Jacobian:  ℝⁿ → ℝᵐˣⁿ      J(x) = ∂r/∂x
//! ```
//!
//! and the optimizer minimizes `½‖r(x)‖²`. The two halves are separate traits
//! so a problem can ship the residual alone and let [`CostFunction`] fall back
//! to numerical differentiation, or ship both from a single type (see
//! [`CostFunction::coupled`]).
//!
//! # Example
//!
//! ```
//! use visopt::core::{CostFunction, ResidualFunction};
//! use nalgebra::{DVector, dvector};
//!
//! /// r(x) = x - target
//! struct Offset {
//!     target: DVector<f64>,
//! }
//!
//! impl ResidualFunction for Offset {
//!     fn num_parameters(&self) -> usize { self.target.len() }
//!     fn num_residuals(&self) -> usize { self.target.len() }
//!     fn evaluate_residuals(&self, parameters: &DVector<f64>) -> DVector<f64> {
//!         parameters - &self.target
//!     }
//! }
//!
//! let cost = CostFunction::numerical(Offset { target: dvector![3.0, 5.0] });
//! let jacobian = cost.evaluate_jacobian(&dvector![0.0, 0.0]).unwrap();
//! assert!((jacobian[(0, 0)] - 1.0).abs() < 1e-6);
//! ```

use crate::core::{CoreError, CoreResult, NumericalDifferentiation, numerical_jacobian};
use nalgebra::{DMatrix, DVector};
use std::fmt;
use std::sync::Arc;

/// A residual function `ℝⁿ → ℝᵐ`.
///
/// Implementations must be pure for fixed parameters and return a vector of
/// exactly [`num_residuals`](Self::num_residuals) entries. They may cache
/// intermediate results internally but must not share mutable state with
/// other optimization runs.
pub trait ResidualFunction: Send + Sync {
    /// Number of parameters N
    fn num_parameters(&self) -> usize;

    /// Number of residuals M
    fn num_residuals(&self) -> usize;

    fn evaluate_residuals(&self, parameters: &DVector<f64>) -> DVector<f64>;
}

/// The Jacobian `∂r/∂x` of a [`ResidualFunction`], an M×N matrix.
pub trait JacobianFunction: Send + Sync {
    /// Number of parameters N (columns)
    fn num_parameters(&self) -> usize;

    /// Number of residuals M (rows)
    fn num_residuals(&self) -> usize;

    fn evaluate_jacobian(&self, parameters: &DVector<f64>) -> DMatrix<f64>;
}

impl<T: ResidualFunction + ?Sized> ResidualFunction for Arc<T> {
    fn num_parameters(&self) -> usize {
        (**self).num_parameters()
    }

    fn num_residuals(&self) -> usize {
        (**self).num_residuals()
    }

    fn evaluate_residuals(&self, parameters: &DVector<f64>) -> DVector<f64> {
        (**self).evaluate_residuals(parameters)
    }
}

impl<T: JacobianFunction + ?Sized> JacobianFunction for Arc<T> {
    fn num_parameters(&self) -> usize {
        (**self).num_parameters()
    }

    fn num_residuals(&self) -> usize {
        (**self).num_residuals()
    }

    fn evaluate_jacobian(&self, parameters: &DVector<f64>) -> DMatrix<f64> {
        (**self).evaluate_jacobian(parameters)
    }
}

enum JacobianSource {
    Analytic(Box<dyn JacobianFunction>),
    Numerical(NumericalDifferentiation),
}

/// A residual function coupled with its Jacobian.
///
/// Construction validates that both halves agree on N and M; evaluation
/// through the `evaluate_*` methods validates the shape and finiteness of
/// every result so the optimizers never see a malformed linearization.
pub struct CostFunction {
    function: Box<dyn ResidualFunction>,
    jacobian: JacobianSource,
}

impl CostFunction {
    /// Couple a residual function with an optional analytic Jacobian.
    ///
    /// Without a Jacobian, central finite differences are used.
    ///
    /// # Errors
    /// [`CoreError::DimensionMismatch`] if the Jacobian's N or M differs from
    /// the residual function's.
    pub fn new(
        function: Box<dyn ResidualFunction>,
        jacobian: Option<Box<dyn JacobianFunction>>,
    ) -> CoreResult<Self> {
        let jacobian = match jacobian {
            Some(jacobian) => {
                if jacobian.num_parameters() != function.num_parameters()
                    || jacobian.num_residuals() != function.num_residuals()
                {
                    return Err(CoreError::DimensionMismatch(format!(
                        "residual function is {}→{}, Jacobian is {}→{}",
                        function.num_parameters(),
                        function.num_residuals(),
                        jacobian.num_parameters(),
                        jacobian.num_residuals()
                    ))
                    .log());
                }
                JacobianSource::Analytic(jacobian)
            }
            None => JacobianSource::Numerical(NumericalDifferentiation::default()),
        };

        Ok(Self { function, jacobian })
    }

    /// Residual function with a finite-difference Jacobian.
    pub fn numerical(function: impl ResidualFunction + 'static) -> Self {
        Self::with_differentiation(function, NumericalDifferentiation::default())
    }

    /// Residual function with a finite-difference Jacobian of the given kind.
    pub fn with_differentiation(
        function: impl ResidualFunction + 'static,
        method: NumericalDifferentiation,
    ) -> Self {
        Self {
            function: Box::new(function),
            jacobian: JacobianSource::Numerical(method),
        }
    }

    /// A single type providing both the residual and its analytic Jacobian.
    pub fn coupled<T>(function: T) -> CoreResult<Self>
    where
        T: ResidualFunction + JacobianFunction + 'static,
    {
        let shared = Arc::new(function);
        Self::new(Box::new(Arc::clone(&shared)), Some(Box::new(shared)))
    }

    pub fn num_parameters(&self) -> usize {
        self.function.num_parameters()
    }

    pub fn num_residuals(&self) -> usize {
        self.function.num_residuals()
    }

    /// Whether the Jacobian is computed analytically
    pub fn has_analytic_jacobian(&self) -> bool {
        matches!(self.jacobian, JacobianSource::Analytic(_))
    }

    /// Check that `parameters` has length N and only finite entries.
    pub fn check_parameters(&self, parameters: &DVector<f64>) -> CoreResult<()> {
        if parameters.len() != self.num_parameters() {
            return Err(CoreError::DimensionMismatch(format!(
                "expected {} parameters, got {}",
                self.num_parameters(),
                parameters.len()
            )));
        }
        if let Some(i) = parameters.iter().position(|p| !p.is_finite()) {
            return Err(CoreError::InvalidInput(format!("parameter {i} is {}", parameters[i])));
        }
        Ok(())
    }

    /// Evaluate the residual vector and validate its length and finiteness.
    pub fn evaluate_residuals(&self, parameters: &DVector<f64>) -> CoreResult<DVector<f64>> {
        self.check_parameters(parameters)?;
        let residuals = self.function.evaluate_residuals(parameters);
        if residuals.len() != self.num_residuals() {
            return Err(CoreError::DimensionMismatch(format!(
                "expected {} residuals, got {}",
                self.num_residuals(),
                residuals.len()
            )));
        }
        if residuals.iter().any(|r| !r.is_finite()) {
            return Err(CoreError::NonFiniteEvaluation(
                "residual vector contains NaN or Inf".to_string(),
            ));
        }
        Ok(residuals)
    }

    /// Evaluate the M×N Jacobian and validate its shape and finiteness.
    pub fn evaluate_jacobian(&self, parameters: &DVector<f64>) -> CoreResult<DMatrix<f64>> {
        self.check_parameters(parameters)?;
        let jacobian = match &self.jacobian {
            JacobianSource::Analytic(jacobian) => jacobian.evaluate_jacobian(parameters),
            JacobianSource::Numerical(method) => {
                numerical_jacobian(self.function.as_ref(), parameters, *method)
            }
        };

        let expected = (self.num_residuals(), self.num_parameters());
        if jacobian.shape() != expected {
            return Err(CoreError::DimensionMismatch(format!(
                "expected a {}×{} Jacobian, got {}×{}",
                expected.0,
                expected.1,
                jacobian.nrows(),
                jacobian.ncols()
            )));
        }
        if jacobian.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::NonFiniteEvaluation(
                "Jacobian contains NaN or Inf".to_string(),
            ));
        }
        Ok(jacobian)
    }
}

impl fmt::Debug for CostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostFunction")
            .field("num_parameters", &self.num_parameters())
            .field("num_residuals", &self.num_residuals())
            .field("analytic_jacobian", &self.has_analytic_jacobian())
            .finish()
    }
}

/// `½‖r‖²`
pub fn compute_cost(residuals: &DVector<f64>) -> f64 {
    0.5 * residuals.norm_squared()
}
