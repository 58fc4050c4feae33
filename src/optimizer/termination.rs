//! Termination policy shared by every optimizer variant.
//!
//! Criteria are evaluated after every iteration in a fixed order:
//!
//! 1. **Singular system**: more than `max_consecutive_failures` singular solves in a row
//! 2. **Numerical instability**: more than `max_consecutive_failures` invalid evaluations in a row
//! 3. **Gradient**: `‖Jᵗr‖∞ < gradient_tolerance` at the accepted point
//! 4. **Cost**: `(f_prev - f) / f_prev < cost_tolerance` for an accepted step
//! 5. **Parameters**: `‖Δ‖ < parameter_tolerance` for an accepted step
//! 6. **Max iterations**: `iteration >= max_iterations`
//!
//! Rejected steps never signal convergence; they only move the failure
//! counters and the iteration budget.

use crate::optimizer::{
    ConvergenceReason, FailureReason, OptimizerError, OptimizerResult, OptimizerState,
};
use tracing::debug;

/// Thresholds deciding when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationPolicy {
    pub max_iterations: usize,
    pub cost_tolerance: f64,
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,
    /// Consecutive singular or invalid steps tolerated before failing
    pub max_consecutive_failures: usize,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-12,
            max_consecutive_failures: 10,
        }
    }
}

/// A step that strictly decreased the cost
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedStep {
    pub previous_cost: f64,
    pub cost: f64,
    pub step_norm: f64,
}

/// What happened during one iteration
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IterationReport {
    /// Iterations performed so far, including this one
    pub iteration: usize,
    /// Set when the step was accepted
    pub accepted: Option<AcceptedStep>,
    /// `‖Jᵗr‖∞` at the current accepted point, when it was linearized
    pub gradient_norm: Option<f64>,
    pub consecutive_singular: usize,
    pub consecutive_invalid: usize,
}

impl TerminationPolicy {
    /// Check that every tolerance is finite and non-negative.
    pub fn validate(&self) -> OptimizerResult<()> {
        let tolerances = [
            ("cost tolerance", self.cost_tolerance),
            ("gradient tolerance", self.gradient_tolerance),
            ("parameter tolerance", self.parameter_tolerance),
        ];
        for (name, value) in tolerances {
            if !(value.is_finite() && value >= 0.0) {
                return Err(OptimizerError::InvalidConfiguration(format!(
                    "{name} must be finite and >= 0, got {value}"
                )));
            }
        }
        if self.max_iterations == 0 {
            return Err(OptimizerError::InvalidConfiguration(
                "max iterations must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Terminal state reached after `report`, or `None` to keep iterating.
    pub fn evaluate(&self, report: &IterationReport) -> Option<OptimizerState> {
        if report.consecutive_singular > self.max_consecutive_failures {
            return Some(OptimizerState::Failed(FailureReason::SingularSystem));
        }
        if report.consecutive_invalid > self.max_consecutive_failures {
            return Some(OptimizerState::Failed(FailureReason::NumericalInstability));
        }

        if let Some(gradient_norm) = report.gradient_norm
            && gradient_norm < self.gradient_tolerance
        {
            return Some(OptimizerState::Converged(ConvergenceReason::GradientTolerance));
        }

        if let Some(step) = report.accepted {
            let relative_cost_change =
                (step.previous_cost - step.cost).abs() / step.previous_cost.max(f64::MIN_POSITIVE);
            if relative_cost_change < self.cost_tolerance {
                debug!("relative cost change {:.2e}", relative_cost_change);
                return Some(OptimizerState::Converged(ConvergenceReason::CostTolerance));
            }
            if step.step_norm < self.parameter_tolerance {
                return Some(OptimizerState::Converged(ConvergenceReason::ParameterTolerance));
            }
        }

        if report.iteration >= self.max_iterations {
            return Some(OptimizerState::Failed(FailureReason::MaxIterations));
        }

        None
    }
}
