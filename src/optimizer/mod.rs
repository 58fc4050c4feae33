//! Optimization solvers for nonlinear least squares problems.
//!
//! Every solver implements [`UnconstrainedLeastSquares`], a step-wise contract:
//!
//! ```text
//! set_function → initialize(x₀) → iterate()* → parameters()
//! ```
//!
//! so calibration and pose refinement code can be written once against the
//! trait and stay agnostic to the variant backing it:
//! - Levenberg-Marquardt with diagonal (Marquardt) or identity damping
//! - Gauss-Newton

use crate::core::{CoreError, CostFunction};
use crate::linalg::{DampingMode, clamp_diagonal, dense_to_sparse, to_faer_column};
use faer::{Mat, sparse::SparseColMat};
use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod damping;
pub mod gauss_newton;
pub mod levenberg_marquardt;
pub mod termination;

pub use damping::DampingController;
pub use gauss_newton::{GaussNewton, GaussNewtonConfig};
pub use levenberg_marquardt::{
    IterationStats, LevenbergMarquardtConfig, LevenbergMarquardtDampened,
    LevenbergMarquardtSummary,
};
pub use termination::{AcceptedStep, IterationReport, TerminationPolicy};

/// Type of optimization solver algorithm to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
}

impl OptimizerType {
    /// Build a boxed optimizer of this type with its default configuration.
    pub fn create(self) -> Box<dyn UnconstrainedLeastSquares> {
        match self {
            OptimizerType::LevenbergMarquardt => Box::new(LevenbergMarquardtDampened::new()),
            OptimizerType::GaussNewton => Box::new(GaussNewton::new()),
        }
    }
}

impl Display for OptimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
        }
    }
}

/// Optimizer-specific error types.
///
/// These are only returned from setup (`initialize`, configuration
/// validation). Numerical failures during iteration become a terminal
/// [`OptimizerState::Failed`] instead.
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// `initialize` called before `set_function`
    #[error("No cost function set")]
    MissingFunction,

    /// Initial guess length differs from the cost function's parameter count
    #[error("Dimension mismatch: expected {expected} parameters, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Invalid optimization parameters provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Numerical instability detected at the initial point
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Cost function evaluation failed
    #[error("Cost function error: {0}")]
    Core(#[from] CoreError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
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

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Why an optimizer stopped successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    /// Relative change between consecutive accepted costs fell below tolerance
    CostTolerance,
    /// Infinity norm of `Jᵗr` fell below tolerance
    GradientTolerance,
    /// Norm of the accepted step fell below tolerance
    ParameterTolerance,
}

impl Display for ConvergenceReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceReason::CostTolerance => write!(f, "Cost tolerance reached"),
            ConvergenceReason::GradientTolerance => write!(f, "Gradient tolerance reached"),
            ConvergenceReason::ParameterTolerance => write!(f, "Parameter tolerance reached"),
        }
    }
}

/// Why an optimizer stopped without converging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Iteration budget exhausted
    MaxIterations,
    /// Normal equations stayed singular across the retry bound
    SingularSystem,
    /// Residual or Jacobian kept producing NaN/Inf or malformed results
    NumericalInstability,
    /// An undamped step failed to decrease the cost
    CostIncrease,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::MaxIterations => write!(f, "Maximum iterations reached"),
            FailureReason::SingularSystem => write!(f, "Singular system"),
            FailureReason::NumericalInstability => {
                write!(f, "Invalid numerical values (NaN/Inf) detected")
            }
            FailureReason::CostIncrease => write!(f, "Cost increased"),
        }
    }
}

/// Lifecycle of an optimizer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptimizerState {
    #[default]
    Uninitialized,
    Initialized,
    Iterating,
    Converged(ConvergenceReason),
    Failed(FailureReason),
}

impl OptimizerState {
    /// Converged or failed; `iterate` does no more work
    pub fn is_terminal(&self) -> bool {
        matches!(self, OptimizerState::Converged(_) | OptimizerState::Failed(_))
    }
}

impl Display for OptimizerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerState::Uninitialized => write!(f, "Uninitialized"),
            OptimizerState::Initialized => write!(f, "Initialized"),
            OptimizerState::Iterating => write!(f, "Iterating"),
            OptimizerState::Converged(reason) => write!(f, "Converged: {reason}"),
            OptimizerState::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Detailed convergence information.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceInfo {
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Cost function evaluation count
    pub cost_evaluations: usize,
    /// Jacobian evaluation count
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Final parameters (best known)
    pub parameters: DVector<f64>,
    /// Terminal state
    pub state: OptimizerState,
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: ConvergenceInfo,
}

impl SolverResult {
    pub fn is_converged(&self) -> bool {
        matches!(self.state, OptimizerState::Converged(_))
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.state {
            OptimizerState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Read access to the damping parameter of a damped optimizer.
pub trait DampingView {
    /// Current λ
    fn damping(&self) -> f64;

    fn damping_mode(&self) -> DampingMode;
}

/// Common step-wise interface of every optimizer variant.
///
/// ```
/// use visopt::core::{CostFunction, ResidualFunction};
/// use visopt::optimizer::{OptimizerType, UnconstrainedLeastSquares};
/// use nalgebra::{DVector, dvector};
///
/// struct Offset;
///
/// impl ResidualFunction for Offset {
///     fn num_parameters(&self) -> usize { 2 }
///     fn num_residuals(&self) -> usize { 2 }
///     fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
///         dvector![p[0] - 3.0, p[1] - 5.0]
///     }
/// }
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut solver = OptimizerType::LevenbergMarquardt.create();
/// solver.set_function(CostFunction::numerical(Offset));
/// solver.initialize(&dvector![0.0, 0.0])?;
/// while solver.iterate() {}
/// assert!(solver.is_converged());
/// # Ok(())
/// # }
/// ```
pub trait UnconstrainedLeastSquares: Send {
    /// Replace the cost function; the optimizer returns to `Uninitialized`.
    fn set_function(&mut self, function: CostFunction);

    /// Start a run from `initial`.
    ///
    /// # Errors
    /// Missing function, invalid configuration, wrong guess length or a
    /// non-finite initial cost. The optimizer stays `Uninitialized`.
    fn initialize(&mut self, initial: &DVector<f64>) -> OptimizerResult<()>;

    /// Perform one iteration. Returns `false` once the run is terminal (or was
    /// never initialized).
    fn iterate(&mut self) -> bool;

    /// Best known parameters: the last accepted point
    fn parameters(&self) -> &DVector<f64>;

    fn state(&self) -> OptimizerState;

    /// Cost `½‖r‖²` at [`parameters`](Self::parameters)
    fn cost(&self) -> f64;

    /// Cost at the initial guess
    fn initial_cost(&self) -> f64;

    /// Iterations performed since `initialize`
    fn iterations(&self) -> usize;

    fn convergence_info(&self) -> ConvergenceInfo;

    fn is_converged(&self) -> bool {
        matches!(self.state(), OptimizerState::Converged(_))
    }

    fn failure_reason(&self) -> Option<FailureReason> {
        match self.state() {
            OptimizerState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Damping capability, `None` for undamped variants
    fn damping_view(&self) -> Option<&dyn DampingView> {
        None
    }

    /// Initialize at `initial` and iterate until the run is terminal.
    fn optimize(&mut self, initial: &DVector<f64>) -> OptimizerResult<SolverResult> {
        let start_time = time::Instant::now();
        self.initialize(initial)?;
        while self.iterate() {}

        Ok(SolverResult {
            parameters: self.parameters().clone(),
            state: self.state(),
            initial_cost: self.initial_cost(),
            final_cost: self.cost(),
            iterations: self.iterations(),
            elapsed_time: start_time.elapsed(),
            convergence_info: self.convergence_info(),
        })
    }
}

/// Residual, Jacobian and gradient evaluated at one parameter vector.
pub(crate) struct Linearization {
    pub jacobian: SparseColMat<usize, f64>,
    pub residuals: Mat<f64>,
    /// `Jᵗr`
    pub gradient: DVector<f64>,
    /// `diag(JᵗJ)`
    pub hessian_diagonal: DVector<f64>,
}

impl Linearization {
    /// Evaluate the Jacobian at `parameters`, where `residuals` were computed.
    pub fn evaluate(
        function: &CostFunction,
        parameters: &DVector<f64>,
        residuals: &DVector<f64>,
    ) -> OptimizerResult<Self> {
        let jacobian = function.evaluate_jacobian(parameters)?;
        let gradient = jacobian.tr_mul(residuals);
        let hessian_diagonal = DVector::from_iterator(
            jacobian.ncols(),
            jacobian.column_iter().map(|c| c.norm_squared()),
        );

        let sparse = dense_to_sparse(&jacobian).map_err(|e| {
            OptimizerError::NumericalInstability(format!("Jacobian conversion failed: {e}"))
        })?;

        Ok(Self {
            jacobian: sparse,
            residuals: to_faer_column(residuals),
            gradient,
            hessian_diagonal,
        })
    }

    /// `‖Jᵗr‖∞`
    pub fn gradient_norm(&self) -> f64 {
        self.gradient.amax()
    }

    /// The Jacobian is identically zero, so no damping makes the model
    /// informative.
    pub fn is_degenerate(&self) -> bool {
        self.hessian_diagonal.iter().all(|d| *d <= 0.0)
    }

    /// Reduction of `½‖r + J·h‖²` predicted by the damped model for step `h`.
    ///
    /// `min_diagonal` and `max_diagonal` clamp `diag(JᵗJ)` the same way the
    /// linear solvers do.
    pub fn predicted_reduction(
        &self,
        step: &DVector<f64>,
        lambda: f64,
        mode: DampingMode,
        min_diagonal: f64,
        max_diagonal: f64,
    ) -> f64 {
        // 0.5 * hᵗ(λ·D·h - g)
        let damped_step = match mode {
            DampingMode::HessianDiagonal => {
                let diagonal = self
                    .hessian_diagonal
                    .map(|d| clamp_diagonal(d, min_diagonal, max_diagonal));
                step.component_mul(&diagonal) * lambda
            }
            DampingMode::Identity => step * lambda,
        };
        0.5 * step.dot(&(damped_step - &self.gradient))
    }
}

/// `actual / predicted` cost reduction
pub(crate) fn compute_step_quality(
    current_cost: f64,
    new_cost: f64,
    predicted_reduction: f64,
) -> f64 {
    let actual_reduction = current_cost - new_cost;
    if predicted_reduction.abs() < 1e-15 {
        if actual_reduction > 0.0 { 1.0 } else { 0.0 }
    } else {
        actual_reduction / predicted_reduction
    }
}
