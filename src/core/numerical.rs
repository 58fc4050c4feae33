//! Finite difference Jacobians for residual functions without an analytic one.

use crate::core::ResidualFunction;
use finitediff::FiniteDiff;
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Finite difference scheme used to approximate `∂r/∂x`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NumericalDifferentiation {
    /// One sided difference, N extra residual evaluations
    Forward,
    /// Symmetric difference, 2N extra residual evaluations
    #[default]
    Central,
}

impl fmt::Display for NumericalDifferentiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericalDifferentiation::Forward => write!(f, "Forward"),
            NumericalDifferentiation::Central => write!(f, "Central"),
        }
    }
}

/// Approximate the M×N Jacobian of `function` at `parameters`.
///
/// A residual function that returns the wrong number of entries at a
/// perturbed point yields a NaN matrix so the caller rejects the
/// linearization instead of solving with a truncated Jacobian.
pub fn numerical_jacobian(
    function: &dyn ResidualFunction,
    parameters: &DVector<f64>,
    method: NumericalDifferentiation,
) -> DMatrix<f64> {
    let num_residuals = function.num_residuals();
    let num_parameters = parameters.len();

    let x: Vec<f64> = parameters.iter().copied().collect();
    let residuals = |p: &Vec<f64>| -> Vec<f64> {
        function
            .evaluate_residuals(&DVector::from_column_slice(p))
            .iter()
            .copied()
            .collect()
    };

    // finitediff returns one entry per perturbed parameter
    let columns = match method {
        NumericalDifferentiation::Forward => x.forward_jacobian(&residuals),
        NumericalDifferentiation::Central => x.central_jacobian(&residuals),
    };

    if columns.len() != num_parameters || columns.iter().any(|c| c.len() != num_residuals) {
        return DMatrix::from_element(num_residuals, num_parameters, f64::NAN);
    }

    DMatrix::from_fn(num_residuals, num_parameters, |row, col| columns[col][row])
}
