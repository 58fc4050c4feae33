//! Levenberg-Marquardt algorithm implementation.
//!
//! The Levenberg-Marquardt (LM) method solves nonlinear least squares problems
//! of the form:
//!
//! ```text
//! min f(x) = ½||r(x)||² = ½Σᵢ rᵢ(x)²
//! ```
//!
//! where `r: ℝⁿ → ℝᵐ` is the residual vector function.
//!
//! # Algorithm Overview
//!
//! Each iteration solves the damped normal equations
//!
//! ```text
//! (J^T·J + λ·D)·h = -J^T·r
//! ```
//!
//! with `D = diag(J^T·J)` (Marquardt scaling, the default) or `D = I`. The
//! diagonal form makes the step invariant to a rescaling of individual
//! parameters, which matters for calibration where focal lengths in pixels sit
//! next to rotation vectors in radians.
//! The entries of `diag(J^T·J)` are clamped to `[min_diagonal, max_diagonal]`,
//! so a parameter the Jacobian does not see at the current point still gets a
//! positive damping term. A Jacobian that is zero everywhere at a nonzero
//! residual is a singular system.
//!
//! ## Step Acceptance and Damping Update
//!
//! A step is accepted only if it strictly decreases the cost:
//!
//! - **Accepted**: `xₖ₊₁ = xₖ + h`, `λ ← max(λ / decrease, λ_min)`
//! - **Rejected**: `xₖ₊₁ = xₖ`, `λ ← min(λ · increase, λ_max)`
//!
//! A singular system or a NaN/Inf evaluation is a rejected step too. Only when
//! those persist for more than `max_consecutive_failures` iterations does the
//! run fail; see [`TerminationPolicy`].
//!
//! A rejection with λ already at `λ_max` ends the run: the retry would solve
//! the same system again. A rejected or invalid step fails with
//! `NumericalInstability`, a singular one with `SingularSystem`.
//!
//! The gain ratio `ρ = actual / predicted reduction` is reported in the
//! iteration table for diagnostics; it does not drive acceptance.
//!
//! # Examples
//!
//! ```
//! use visopt::core::{CostFunction, ResidualFunction};
//! use visopt::optimizer::{LevenbergMarquardtConfig, LevenbergMarquardtDampened, UnconstrainedLeastSquares};
//! use nalgebra::{DVector, dvector};
//!
//! /// r = [10(x₁ - x₀²), 1 - x₀]
//! struct Rosenbrock;
//!
//! impl ResidualFunction for Rosenbrock {
//!     fn num_parameters(&self) -> usize { 2 }
//!     fn num_residuals(&self) -> usize { 2 }
//!     fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
//!         dvector![10.0 * (p[1] - p[0] * p[0]), 1.0 - p[0]]
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LevenbergMarquardtConfig::new()
//!     .with_max_iterations(200)
//!     .with_damping(1e-3);
//!
//! let mut solver = LevenbergMarquardtDampened::with_config(config);
//! solver.set_function(CostFunction::numerical(Rosenbrock));
//! let result = solver.optimize(&dvector![-1.2, 1.0])?;
//! assert!(result.is_converged());
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Levenberg, K. (1944). "A Method for the Solution of Certain Non-Linear Problems in Least Squares". *Quarterly of Applied Mathematics*.
//! - Marquardt, D. W. (1963). "An Algorithm for Least-Squares Estimation of Nonlinear Parameters". *Journal of the Society for Industrial and Applied Mathematics*.
//! - Madsen, K., Nielsen, H. B., & Tingleff, O. (2004). *Methods for Non-Linear Least Squares Problems* (2nd ed.). Chapter 3.

use crate::core::{CoreError, CostFunction, cost_function::compute_cost};
use crate::linalg::{
    DEFAULT_MAX_DIAGONAL, DEFAULT_MIN_DIAGONAL, DampingMode, LinearSolverType, SparseLinearSolver,
    to_dmatrix, to_dvector,
};
use crate::optimizer::{
    AcceptedStep, ConvergenceInfo, DampingController, DampingView, FailureReason, IterationReport,
    Linearization, OptimizerError, OptimizerResult, OptimizerState, TerminationPolicy,
    UnconstrainedLeastSquares, compute_step_quality,
};

use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Gain ratio of the last trial step
    pub rho: f64,
    /// Total number of iterations performed
    pub iterations: usize,
    /// Number of successful steps (cost decreased)
    pub successful_steps: usize,
    /// Number of unsuccessful steps (rejected, singular or invalid)
    pub unsuccessful_steps: usize,
    /// Final damping parameter value
    pub final_damping: f64,
    /// Average cost reduction per iteration
    pub average_cost_reduction: f64,
    /// Maximum gradient norm encountered
    pub max_gradient_norm: f64,
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Maximum parameter update norm
    pub max_parameter_update_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Total time elapsed
    pub total_time: Duration,
    /// Average time per iteration
    pub average_time_per_iteration: Duration,
    /// Per-iteration statistics, collected at DEBUG level only
    pub iteration_history: Vec<IterationStats>,
    /// Terminal state
    pub state: OptimizerState,
}

impl Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Levenberg-Marquardt Final Result")?;

        if matches!(self.state, OptimizerState::Converged(_)) {
            writeln!(f, "CONVERGED ({})", self.state)?;
        } else {
            writeln!(f, "DIVERGED ({})", self.state)?;
        }

        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(
            f,
            "  Successful steps:   {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "  Unsuccessful steps: {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "  Final damping:      {:.2e}", self.final_damping)?;
        writeln!(f)?;
        writeln!(f, "Gradient:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_gradient_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        writeln!(f)?;
        writeln!(f, "Parameter Update:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_parameter_update_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_parameter_update_norm)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;

        Ok(())
    }
}

/// Per-iteration statistics for detailed logging (Ceres-style output).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (1-indexed, matches `iterations()`)
    pub iteration: usize,
    /// Cost at the accepted point after this iteration
    pub cost: f64,
    /// Change in cost from the previous iteration
    pub cost_change: f64,
    /// ‖J^T·r‖∞ at the point this iteration linearized
    pub gradient_norm: f64,
    /// L2 norm of the trial step (0 when no step was solved)
    pub step_norm: f64,
    /// Gain ratio ρ = actual_reduction / predicted_reduction
    pub rho: f64,
    /// λ after the damping update
    pub damping: f64,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since initialization in milliseconds
    pub total_time_ms: f64,
    /// Whether the step was accepted
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "rho",
            "damping",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single iteration line in Ceres-style format with scientific notation
    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.rho,
            self.damping,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Configuration parameters for the Levenberg-Marquardt optimizer.
///
/// ```
/// use visopt::linalg::DampingMode;
/// use visopt::optimizer::LevenbergMarquardtConfig;
///
/// let config = LevenbergMarquardtConfig::new()
///     .with_max_iterations(100)
///     .with_damping(1e-3)
///     .with_damping_bounds(1e-12, 1e32)
///     .with_damping_mode(DampingMode::Identity);
/// ```
///
/// # Convergence Criteria
///
/// The optimizer terminates when ANY of the following conditions is met:
///
/// - **Gradient tolerance**: `||J^T·r||∞ < gradient_tolerance` at an accepted point
/// - **Cost tolerance**: `|cost_k - cost_{k-1}| / cost_{k-1} < cost_tolerance` for an accepted step
/// - **Parameter tolerance**: `||step|| < parameter_tolerance` for an accepted step
/// - **Maximum iterations**: `iteration >= max_iterations`
/// - **Consecutive failures**: more than `max_consecutive_failures` singular or invalid steps in a row
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// Damping matrix D in `J^T·J + λ·D`
    pub damping_mode: DampingMode,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence tolerance for the relative cost change
    pub cost_tolerance: f64,
    /// Convergence tolerance for parameter updates
    pub parameter_tolerance: f64,
    /// Convergence tolerance for the gradient infinity norm
    pub gradient_tolerance: f64,
    /// Singular solves or invalid evaluations tolerated in a row
    pub max_consecutive_failures: usize,
    /// Initial damping parameter
    pub damping: f64,
    /// Minimum damping parameter
    pub damping_min: f64,
    /// Maximum damping parameter
    pub damping_max: f64,
    /// Damping increase factor (when step rejected)
    pub damping_increase_factor: f64,
    /// Damping decrease factor (when step accepted)
    pub damping_decrease_factor: f64,
    /// Lower clamp for `diag(J^T·J)` in diagonal damping
    pub min_diagonal: f64,
    /// Upper clamp for `diag(J^T·J)` in diagonal damping
    pub max_diagonal: f64,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        let termination = TerminationPolicy::default();
        Self {
            linear_solver_type: LinearSolverType::default(),
            damping_mode: DampingMode::default(),
            max_iterations: termination.max_iterations,
            cost_tolerance: termination.cost_tolerance,
            parameter_tolerance: termination.parameter_tolerance,
            gradient_tolerance: termination.gradient_tolerance,
            max_consecutive_failures: termination.max_consecutive_failures,
            damping: 1e-3,
            damping_min: 1e-12,
            damping_max: 1e32,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 10.0,
            min_diagonal: DEFAULT_MIN_DIAGONAL,
            max_diagonal: DEFAULT_MAX_DIAGONAL,
        }
    }
}

impl LevenbergMarquardtConfig {
    /// Create a new Levenberg-Marquardt configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the damping matrix
    pub fn with_damping_mode(mut self, damping_mode: DampingMode) -> Self {
        self.damping_mode = damping_mode;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the cost tolerance
    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    /// Set the parameter tolerance
    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the gradient tolerance
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    /// Set how many singular or invalid steps in a row are retried
    pub fn with_max_consecutive_failures(mut self, max_consecutive_failures: usize) -> Self {
        self.max_consecutive_failures = max_consecutive_failures;
        self
    }

    /// Set the initial damping parameter.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the damping parameter bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    /// Set the damping adjustment factors.
    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    /// Set the clamp range for `diag(J^T·J)` in diagonal damping.
    ///
    /// The lower bound keeps a parameter the Jacobian does not observe at the
    /// current point from making the damped system singular.
    pub fn with_diagonal_bounds(mut self, min_diagonal: f64, max_diagonal: f64) -> Self {
        self.min_diagonal = min_diagonal;
        self.max_diagonal = max_diagonal;
        self
    }

    /// Check the diagonal clamp range.
    ///
    /// # Errors
    /// [`OptimizerError::InvalidConfiguration`] unless
    /// `0 < min_diagonal ≤ max_diagonal` and both are finite.
    pub fn validate_diagonal_bounds(&self) -> OptimizerResult<()> {
        let (min, max) = (self.min_diagonal, self.max_diagonal);
        if !(min > 0.0 && min <= max && max.is_finite()) {
            return Err(OptimizerError::InvalidConfiguration(format!(
                "diagonal bounds must satisfy 0 < min <= max, got [{min:.2e}, {max:.2e}]"
            )));
        }
        Ok(())
    }

    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            max_iterations: self.max_iterations,
            cost_tolerance: self.cost_tolerance,
            gradient_tolerance: self.gradient_tolerance,
            parameter_tolerance: self.parameter_tolerance,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    /// Damping controller for these settings, validating them.
    pub fn damping_controller(&self) -> OptimizerResult<DampingController> {
        DampingController::new(
            self.damping,
            self.damping_increase_factor,
            self.damping_decrease_factor,
            self.damping_min,
            self.damping_max,
        )
    }

    /// Print configuration parameters (DEBUG level)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        Levenberg-Marquardt\n  Linear solver: {}\n  Damping mode:  {}\n  Convergence Criteria:\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Max failures:        {}\n  Damping Parameters:\n  Initial damping:     {:.2e}\n  Damping range:       [{:.2e}, {:.2e}]\n  Increase factor:     {:.2}\n  Decrease factor:     {:.2}\n  Diagonal range:      [{:.2e}, {:.2e}]",
            self.linear_solver_type,
            self.damping_mode,
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.max_consecutive_failures,
            self.damping,
            self.damping_min,
            self.damping_max,
            self.damping_increase_factor,
            self.damping_decrease_factor,
            self.min_diagonal,
            self.max_diagonal,
        );
    }
}

/// Outcome of one trial step
enum StepOutcome {
    Accepted {
        previous_cost: f64,
        step_norm: f64,
        rho: f64,
    },
    Rejected {
        step_norm: f64,
        rho: f64,
    },
    /// Factorization failed or the Jacobian is identically zero
    Singular,
    /// Jacobian or candidate residual was malformed or non-finite
    Invalid,
    /// Gradient already below tolerance, no step taken
    Stationary,
}

/// Counters and norms accumulated over one run
#[derive(Debug, Clone, Default)]
struct RunProgress {
    cost_evaluations: usize,
    jacobian_evaluations: usize,
    successful_steps: usize,
    unsuccessful_steps: usize,
    max_gradient_norm: f64,
    final_gradient_norm: f64,
    max_step_norm: f64,
    final_step_norm: f64,
    total_cost_reduction: f64,
    last_rho: f64,
    history: Vec<IterationStats>,
}

/// Levenberg-Marquardt solver with Marquardt's diagonal damping.
///
/// Drive it step by step through [`UnconstrainedLeastSquares`]:
///
/// 1. Linearize at the current point (reused until the point changes)
/// 2. Assemble `J^T·J + λ·D` and check the gradient for convergence
/// 3. Solve for `h`; a singular system is a rejected step
/// 4. Evaluate `x + h`; accept on strict cost decrease
/// 5. Update λ and apply the [`TerminationPolicy`]
///
/// # See Also
///
/// - [`LevenbergMarquardtConfig`] - Configuration options
/// - [`GaussNewton`](crate::optimizer::GaussNewton) - Undamped variant
pub struct LevenbergMarquardtDampened {
    config: LevenbergMarquardtConfig,
    function: Option<CostFunction>,
    state: OptimizerState,
    damping: DampingController,
    termination: TerminationPolicy,
    linear_solver: Box<dyn SparseLinearSolver>,
    parameters: DVector<f64>,
    residuals: DVector<f64>,
    cost: f64,
    initial_cost: f64,
    /// Linearization at `parameters`, dropped whenever they change
    linearization: Option<Linearization>,
    iterations: usize,
    consecutive_singular: usize,
    consecutive_invalid: usize,
    progress: RunProgress,
    start_time: Instant,
    summary: Option<LevenbergMarquardtSummary>,
}

impl Default for LevenbergMarquardtDampened {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardtDampened {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        let mut linear_solver = config.linear_solver_type.create();
        linear_solver.set_diagonal_bounds(config.min_diagonal, config.max_diagonal);
        Self {
            linear_solver,
            termination: config.termination_policy(),
            config,
            function: None,
            state: OptimizerState::Uninitialized,
            damping: DampingController::default(),
            parameters: DVector::zeros(0),
            residuals: DVector::zeros(0),
            cost: f64::NAN,
            initial_cost: f64::NAN,
            linearization: None,
            iterations: 0,
            consecutive_singular: 0,
            consecutive_invalid: 0,
            progress: RunProgress::default(),
            start_time: Instant::now(),
            summary: None,
        }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Summary of the last finished run
    pub fn summary(&self) -> Option<&LevenbergMarquardtSummary> {
        self.summary.as_ref()
    }

    /// Parameter covariance `(J^T·J)⁻¹` at the current point.
    ///
    /// `None` before initialization or when `J^T·J` is singular.
    pub fn covariance(&mut self) -> Option<DMatrix<f64>> {
        if self.state == OptimizerState::Uninitialized || !self.ensure_linearized() {
            return None;
        }
        let linearization = self.linearization.as_ref()?;
        self.linear_solver
            .solve_normal_equation(&linearization.residuals, &linearization.jacobian)
            .ok()?;
        self.linear_solver
            .compute_covariance_matrix()
            .map(to_dmatrix)
    }

    /// Linearize at the current point if needed. Returns false when the
    /// Jacobian is invalid there.
    fn ensure_linearized(&mut self) -> bool {
        if self.linearization.is_some() {
            return true;
        }
        let Some(function) = self.function.as_ref() else {
            return false;
        };

        self.progress.jacobian_evaluations += 1;
        match Linearization::evaluate(function, &self.parameters, &self.residuals) {
            Ok(linearization) => {
                let gradient_norm = linearization.gradient_norm();
                self.progress.final_gradient_norm = gradient_norm;
                self.progress.max_gradient_norm = self.progress.max_gradient_norm.max(gradient_norm);
                self.linearization = Some(linearization);
                true
            }
            Err(e) => {
                debug!("Invalid linearization: {}", e);
                false
            }
        }
    }

    /// Solve for a step at the current point and try it.
    fn trial_step(&mut self) -> StepOutcome {
        if !self.ensure_linearized() {
            return StepOutcome::Invalid;
        }
        let (Some(function), Some(linearization)) =
            (self.function.as_ref(), self.linearization.as_ref())
        else {
            return StepOutcome::Invalid;
        };

        // A zero Jacobian at a zero residual is an exact solution
        if linearization.is_degenerate() && self.cost > 0.0 {
            debug!("Jacobian is identically zero at a nonzero residual");
            return StepOutcome::Singular;
        }

        if linearization.gradient_norm() < self.termination.gradient_tolerance {
            return StepOutcome::Stationary;
        }

        let mode = self.config.damping_mode;
        let lambda = self.damping.lambda();
        let step = match self.linear_solver.solve_augmented_equation(
            &linearization.residuals,
            &linearization.jacobian,
            lambda,
            mode,
        ) {
            Ok(step) => to_dvector(&step),
            Err(e) => {
                debug!("Linear solve failed with λ = {:.2e}: {}", lambda, e);
                return StepOutcome::Singular;
            }
        };
        let step_norm = step.norm();
        self.progress.final_step_norm = step_norm;
        self.progress.max_step_norm = self.progress.max_step_norm.max(step_norm);

        let candidate = &self.parameters + &step;
        self.progress.cost_evaluations += 1;
        let candidate_residuals = match function.evaluate_residuals(&candidate) {
            Ok(residuals) => residuals,
            Err(e) => {
                debug!("Rejecting candidate: {}", e);
                return StepOutcome::Invalid;
            }
        };
        let candidate_cost = compute_cost(&candidate_residuals);
        if !candidate_cost.is_finite() {
            debug!("Rejecting candidate with non-finite cost");
            return StepOutcome::Invalid;
        }

        let predicted_reduction = linearization.predicted_reduction(
            &step,
            lambda,
            mode,
            self.config.min_diagonal,
            self.config.max_diagonal,
        );
        let rho = compute_step_quality(self.cost, candidate_cost, predicted_reduction);

        if candidate_cost < self.cost {
            let previous_cost = self.cost;
            self.parameters = candidate;
            self.residuals = candidate_residuals;
            self.cost = candidate_cost;
            self.linearization = None;
            StepOutcome::Accepted {
                previous_cost,
                step_norm,
                rho,
            }
        } else {
            StepOutcome::Rejected { step_norm, rho }
        }
    }

    fn record_iteration(
        &mut self,
        iter_start: Instant,
        cost_before: f64,
        step_norm: f64,
        rho: f64,
        accepted: bool,
    ) {
        self.progress.last_rho = rho;
        if accepted {
            self.progress.successful_steps += 1;
            self.progress.total_cost_reduction += cost_before - self.cost;
        } else {
            self.progress.unsuccessful_steps += 1;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            let stats = IterationStats {
                iteration: self.iterations,
                cost: self.cost,
                cost_change: cost_before - self.cost,
                gradient_norm: self.progress.final_gradient_norm,
                step_norm,
                rho,
                damping: self.damping.lambda(),
                iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: self.start_time.elapsed().as_secs_f64() * 1000.0,
                accepted,
            };
            stats.print_line();
            self.progress.history.push(stats);
        }
    }

    fn create_summary(&self) -> LevenbergMarquardtSummary {
        let total_time = self.start_time.elapsed();
        LevenbergMarquardtSummary {
            initial_cost: self.initial_cost,
            final_cost: self.cost,
            rho: self.progress.last_rho,
            iterations: self.iterations,
            successful_steps: self.progress.successful_steps,
            unsuccessful_steps: self.progress.unsuccessful_steps,
            final_damping: self.damping.lambda(),
            average_cost_reduction: if self.iterations > 0 {
                self.progress.total_cost_reduction / self.iterations as f64
            } else {
                0.0
            },
            max_gradient_norm: self.progress.max_gradient_norm,
            final_gradient_norm: self.progress.final_gradient_norm,
            max_parameter_update_norm: self.progress.max_step_norm,
            final_parameter_update_norm: self.progress.final_step_norm,
            total_time,
            average_time_per_iteration: if self.iterations > 0 {
                total_time / self.iterations as u32
            } else {
                Duration::from_secs(0)
            },
            iteration_history: self.progress.history.clone(),
            state: self.state,
        }
    }

    fn finish(&mut self, state: OptimizerState) {
        self.state = state;
        match state {
            OptimizerState::Converged(reason) => info!(
                "Levenberg-Marquardt converged after {} iterations ({}), cost {:.6e}",
                self.iterations, reason, self.cost
            ),
            _ => warn!(
                "Levenberg-Marquardt stopped after {} iterations ({}), cost {:.6e}",
                self.iterations, state, self.cost
            ),
        }

        let summary = self.create_summary();
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("{}", summary);
        }
        self.summary = Some(summary);
    }
}

impl UnconstrainedLeastSquares for LevenbergMarquardtDampened {
    fn set_function(&mut self, function: CostFunction) {
        self.function = Some(function);
        self.state = OptimizerState::Uninitialized;
        self.linearization = None;
    }

    fn initialize(&mut self, initial: &DVector<f64>) -> OptimizerResult<()> {
        self.state = OptimizerState::Uninitialized;
        let function = self
            .function
            .as_ref()
            .ok_or_else(|| OptimizerError::MissingFunction.log())?;

        let termination = self.config.termination_policy();
        termination.validate().map_err(|e| e.log())?;
        let damping = self.config.damping_controller().map_err(|e| e.log())?;
        self.config.validate_diagonal_bounds().map_err(|e| e.log())?;

        if initial.len() != function.num_parameters() {
            return Err(OptimizerError::DimensionMismatch {
                expected: function.num_parameters(),
                actual: initial.len(),
            }
            .log());
        }

        let residuals = function.evaluate_residuals(initial).map_err(|e| match e {
            CoreError::NonFiniteEvaluation(msg) => OptimizerError::NumericalInstability(msg).log(),
            other => OptimizerError::from(other).log(),
        })?;
        let cost = compute_cost(&residuals);
        if !cost.is_finite() {
            return Err(OptimizerError::NumericalInstability(format!(
                "initial cost is {cost}"
            ))
            .log());
        }

        self.termination = termination;
        self.damping = damping;
        self.linear_solver = self.config.linear_solver_type.create();
        self.linear_solver.set_diagonal_bounds(self.config.min_diagonal, self.config.max_diagonal);
        self.parameters = initial.clone();
        self.residuals = residuals;
        self.cost = cost;
        self.initial_cost = cost;
        self.linearization = None;
        self.iterations = 0;
        self.consecutive_singular = 0;
        self.consecutive_invalid = 0;
        self.progress = RunProgress {
            cost_evaluations: 1,
            ..RunProgress::default()
        };
        self.start_time = Instant::now();
        self.summary = None;
        self.state = OptimizerState::Initialized;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }
        Ok(())
    }

    fn iterate(&mut self) -> bool {
        match self.state {
            OptimizerState::Uninitialized => {
                warn!("iterate() called on an uninitialized Levenberg-Marquardt solver");
                return false;
            }
            OptimizerState::Converged(_) | OptimizerState::Failed(_) => return false,
            OptimizerState::Initialized | OptimizerState::Iterating => {}
        }
        self.state = OptimizerState::Iterating;

        let iter_start = Instant::now();
        let cost_before = self.cost;
        // Once λ is pinned at its maximum a retry would repeat this exact step
        let saturated = self.damping.is_saturated();
        let outcome = self.trial_step();
        self.iterations += 1;

        let mut report = IterationReport {
            iteration: self.iterations,
            ..IterationReport::default()
        };
        let mut stalled = None;

        match outcome {
            StepOutcome::Accepted {
                previous_cost,
                step_norm,
                rho,
            } => {
                self.damping.update(true);
                self.consecutive_singular = 0;
                self.consecutive_invalid = 0;
                report.accepted = Some(AcceptedStep {
                    previous_cost,
                    cost: self.cost,
                    step_norm,
                });
                // The next iteration needs this linearization anyway
                if self.ensure_linearized() {
                    report.gradient_norm = self.linearization.as_ref().map(|l| l.gradient_norm());
                }
                self.record_iteration(iter_start, cost_before, step_norm, rho, true);
            }
            StepOutcome::Rejected { step_norm, rho } => {
                self.damping.update(false);
                stalled = saturated.then_some(FailureReason::NumericalInstability);
                self.consecutive_singular = 0;
                self.consecutive_invalid = 0;
                self.record_iteration(iter_start, cost_before, step_norm, rho, false);
            }
            StepOutcome::Singular => {
                self.damping.update(false);
                stalled = saturated.then_some(FailureReason::SingularSystem);
                self.consecutive_singular += 1;
                self.consecutive_invalid = 0;
                self.record_iteration(iter_start, cost_before, 0.0, 0.0, false);
            }
            StepOutcome::Invalid => {
                self.damping.update(false);
                stalled = saturated.then_some(FailureReason::NumericalInstability);
                self.consecutive_invalid += 1;
                self.consecutive_singular = 0;
                self.record_iteration(iter_start, cost_before, 0.0, 0.0, false);
            }
            StepOutcome::Stationary => {
                report.gradient_norm = Some(self.progress.final_gradient_norm);
                self.record_iteration(iter_start, cost_before, 0.0, 0.0, false);
            }
        }

        report.consecutive_singular = self.consecutive_singular;
        report.consecutive_invalid = self.consecutive_invalid;

        let terminal = self.termination.evaluate(&report).or_else(|| {
            stalled.map(|reason| {
                debug!("Step rejected with λ at its maximum {:.2e}", self.damping.lambda());
                OptimizerState::Failed(reason)
            })
        });
        match terminal {
            Some(state) => {
                self.finish(state);
                false
            }
            None => true,
        }
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.parameters
    }

    fn state(&self) -> OptimizerState {
        self.state
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn initial_cost(&self) -> f64 {
        self.initial_cost
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn convergence_info(&self) -> ConvergenceInfo {
        ConvergenceInfo {
            final_gradient_norm: self.progress.final_gradient_norm,
            final_parameter_update_norm: self.progress.final_step_norm,
            cost_evaluations: self.progress.cost_evaluations,
            jacobian_evaluations: self.progress.jacobian_evaluations,
        }
    }

    fn damping_view(&self) -> Option<&dyn DampingView> {
        Some(self)
    }
}

impl DampingView for LevenbergMarquardtDampened {
    fn damping(&self) -> f64 {
        self.damping.lambda()
    }

    fn damping_mode(&self) -> DampingMode {
        self.config.damping_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JacobianFunction, ResidualFunction};
    use crate::optimizer::{ConvergenceReason, FailureReason, GaussNewton};
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r(p) = p - [3, 5], J = I
    struct Offset;

    impl ResidualFunction for Offset {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            dvector![p[0] - 3.0, p[1] - 5.0]
        }
    }

    impl JacobianFunction for Offset {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_jacobian(&self, _: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::identity(2, 2)
        }
    }

    /// r = [10(x₁ - x₀²), 1 - x₀], minimum at [1, 1]
    struct Rosenbrock;

    impl ResidualFunction for Rosenbrock {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            dvector![10.0 * (p[1] - p[0] * p[0]), 1.0 - p[0]]
        }
    }

    impl JacobianFunction for Rosenbrock {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_row_slice(2, 2, &[-20.0 * p[0], 10.0, -1.0, 0.0])
        }
    }

    /// Overdetermined linear system r = A·x - b
    struct Linear {
        a: DMatrix<f64>,
        b: DVector<f64>,
    }

    impl Linear {
        fn new() -> Self {
            Self {
                a: DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 2.0, 1.0, 3.0]),
                b: dvector![1.0, 2.0, 2.0],
            }
        }
    }

    impl ResidualFunction for Linear {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            3
        }

        fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            &self.a * p - &self.b
        }
    }

    impl JacobianFunction for Linear {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            3
        }

        fn evaluate_jacobian(&self, _: &DVector<f64>) -> DMatrix<f64> {
            self.a.clone()
        }
    }

    /// Residual that does not depend on the parameters
    struct Flat;

    impl ResidualFunction for Flat {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_residuals(&self, _: &DVector<f64>) -> DVector<f64> {
            dvector![1.0, 2.0]
        }
    }

    impl JacobianFunction for Flat {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_jacobian(&self, _: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::zeros(2, 2)
        }
    }

    /// Zero residual and zero Jacobian everywhere
    struct Settled;

    impl ResidualFunction for Settled {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_residuals(&self, _: &DVector<f64>) -> DVector<f64> {
            DVector::zeros(2)
        }
    }

    /// r = [p0 - 3, p0·p1 - 6]; the second parameter is unobserved at p0 = 0
    struct Product;

    impl ResidualFunction for Product {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            dvector![p[0] - 3.0, p[0] * p[1] - 6.0]
        }
    }

    impl JacobianFunction for Product {
        fn num_parameters(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate_jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, p[1], p[0]])
        }
    }

    /// r = x - 1 with a Jacobian of the wrong sign, so every step goes uphill
    struct Misleading;

    impl ResidualFunction for Misleading {
        fn num_parameters(&self) -> usize {
            1
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            dvector![p[0] - 1.0]
        }
    }

    impl JacobianFunction for Misleading {
        fn num_parameters(&self) -> usize {
            1
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate_jacobian(&self, _: &DVector<f64>) -> DMatrix<f64> {
            -DMatrix::identity(1, 1)
        }
    }

    /// Finite only at the origin
    struct Fragile;

    impl ResidualFunction for Fragile {
        fn num_parameters(&self) -> usize {
            1
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            if p[0] == 0.0 {
                dvector![1.0]
            } else {
                dvector![f64::NAN]
            }
        }
    }

    impl JacobianFunction for Fragile {
        fn num_parameters(&self) -> usize {
            1
        }

        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate_jacobian(&self, _: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
    }

    #[test]
    fn test_offset_converges_quickly() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Offset)?);
        solver.initialize(&dvector![0.0, 0.0])?;
        assert_eq!(solver.state(), OptimizerState::Initialized);

        while solver.iterate() {}

        assert!(solver.is_converged());
        assert!(solver.iterations() < 5, "took {} iterations", solver.iterations());
        let p = solver.parameters();
        assert!((p[0] - 3.0).abs() < 1e-6);
        assert!((p[1] - 5.0).abs() < 1e-6);
        assert!(solver.cost() < 1e-12);
        assert!(solver.summary().is_some());
        Ok(())
    }

    #[test]
    fn test_rosenbrock_optimization() -> TestResult {
        let config = LevenbergMarquardtConfig::new().with_max_iterations(200);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::coupled(Rosenbrock)?);
        let result = solver.optimize(&dvector![-1.2, 1.0])?;

        assert!(result.is_converged(), "state: {}", result.state);
        assert!((result.parameters[0] - 1.0).abs() < 1e-4);
        assert!((result.parameters[1] - 1.0).abs() < 1e-4);
        assert!(result.final_cost < 1e-6);
        assert!(result.convergence_info.jacobian_evaluations > 0);
        Ok(())
    }

    #[test]
    fn test_numerical_jacobian_rosenbrock() -> TestResult {
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(200)
            .with_linear_solver_type(LinearSolverType::SparseQR);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::numerical(Rosenbrock));
        let result = solver.optimize(&dvector![-1.2, 1.0])?;

        assert!(result.is_converged(), "state: {}", result.state);
        assert!((result.parameters[0] - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_linear_problem_matches_gauss_newton() -> TestResult {
        let config = LevenbergMarquardtConfig::new()
            .with_damping(1e-12)
            .with_damping_bounds(1e-12, 1e32);
        let mut lm = LevenbergMarquardtDampened::with_config(config);
        lm.set_function(CostFunction::coupled(Linear::new())?);
        lm.initialize(&dvector![0.0, 0.0])?;
        lm.iterate();

        let mut gn = GaussNewton::new();
        gn.set_function(CostFunction::coupled(Linear::new())?);
        gn.initialize(&dvector![0.0, 0.0])?;
        gn.iterate();

        // Least squares solution of A·x = b
        let expected = dvector![2.0 / 3.0, 0.5];
        for i in 0..2 {
            assert!((lm.parameters()[i] - expected[i]).abs() < 1e-8);
            assert!((lm.parameters()[i] - gn.parameters()[i]).abs() < 1e-8);
        }
        Ok(())
    }

    #[test]
    fn test_accepted_costs_decrease_and_damping_adapts() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Rosenbrock)?);
        solver.initialize(&dvector![-1.2, 1.0])?;

        let mut rejections = 0;
        let mut accepts = 0;
        loop {
            let cost_before = solver.cost();
            let lambda_before = solver.damping_view().ok_or("no damping view")?.damping();
            let more = solver.iterate();
            let cost_after = solver.cost();
            let lambda_after = solver.damping_view().ok_or("no damping view")?.damping();

            assert!(cost_after <= cost_before);
            if cost_after < cost_before {
                accepts += 1;
                assert!(lambda_after <= lambda_before);
            } else if !solver.is_converged() {
                rejections += 1;
                assert!(lambda_after > lambda_before);
            }

            if !more {
                break;
            }
        }

        // The first near Gauss-Newton step from [-1.2, 1] overshoots
        assert!(rejections > 0);
        assert!(accepts > 0);
        assert!(solver.is_converged());
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch_leaves_uninitialized() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Offset)?);
        let result = solver.initialize(&dvector![0.0, 0.0, 0.0]);

        assert!(matches!(
            result,
            Err(OptimizerError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(solver.state(), OptimizerState::Uninitialized);
        assert!(!solver.iterate());
        Ok(())
    }

    #[test]
    fn test_missing_function_and_invalid_config() {
        let mut solver = LevenbergMarquardtDampened::new();
        assert!(matches!(
            solver.initialize(&dvector![0.0]),
            Err(OptimizerError::MissingFunction)
        ));

        let config = LevenbergMarquardtConfig::new().with_damping_factors(0.5, 10.0);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::numerical(Offset));
        assert!(matches!(
            solver.initialize(&dvector![0.0, 0.0]),
            Err(OptimizerError::InvalidConfiguration(_))
        ));
        assert_eq!(solver.state(), OptimizerState::Uninitialized);
    }

    #[test]
    fn test_zero_jacobian_fails_as_singular() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Flat)?);
        solver.initialize(&dvector![0.0, 0.0])?;
        while solver.iterate() {}

        assert_eq!(
            solver.failure_reason(),
            Some(FailureReason::SingularSystem)
        );
        assert_eq!(solver.iterations(), solver.config().max_consecutive_failures + 1);
        assert_eq!(solver.parameters(), &dvector![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_zero_jacobian_fails_as_singular_with_identity_damping() -> TestResult {
        let config = LevenbergMarquardtConfig::new().with_damping_mode(DampingMode::Identity);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::coupled(Flat)?);
        solver.initialize(&dvector![0.0, 0.0])?;
        while solver.iterate() {}

        assert!(!solver.is_converged());
        assert_eq!(
            solver.failure_reason(),
            Some(FailureReason::SingularSystem)
        );
        assert_eq!(solver.iterations(), solver.config().max_consecutive_failures + 1);
        Ok(())
    }

    #[test]
    fn test_zero_jacobian_at_zero_residual_converges() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::numerical(Settled));
        solver.initialize(&dvector![1.0, -1.0])?;

        assert!(!solver.iterate());
        assert_eq!(
            solver.state(),
            OptimizerState::Converged(ConvergenceReason::GradientTolerance)
        );
        Ok(())
    }

    #[test]
    fn test_unobserved_parameter_at_start_still_converges() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Product)?);
        let result = solver.optimize(&dvector![0.0, 0.0])?;

        assert!(result.is_converged(), "state: {}", result.state);
        assert!((result.parameters[0] - 3.0).abs() < 1e-6);
        assert!((result.parameters[1] - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_rejection_at_maximum_damping_fails() -> TestResult {
        let config = LevenbergMarquardtConfig::new().with_damping_bounds(1e-12, 1e-2);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::coupled(Misleading)?);
        solver.initialize(&dvector![0.0])?;

        // First rejection raises λ to its maximum
        assert!(solver.iterate());
        assert_eq!(solver.damping(), 1e-2);

        // A second rejection can no longer raise it
        assert!(!solver.iterate());
        assert_eq!(
            solver.failure_reason(),
            Some(FailureReason::NumericalInstability)
        );
        assert_eq!(solver.iterations(), 2);
        assert_eq!(solver.damping(), 1e-2);
        assert_eq!(solver.parameters(), &dvector![0.0]);
        Ok(())
    }

    #[test]
    fn test_invalid_diagonal_bounds() -> TestResult {
        for (min, max) in [(0.0, 1e32), (1e-3, 1e-6), (1e-6, f64::INFINITY)] {
            let config = LevenbergMarquardtConfig::new().with_diagonal_bounds(min, max);
            let mut solver = LevenbergMarquardtDampened::with_config(config);
            solver.set_function(CostFunction::coupled(Offset)?);
            assert!(matches!(
                solver.initialize(&dvector![0.0, 0.0]),
                Err(OptimizerError::InvalidConfiguration(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_non_finite_candidates_fail_as_numerical_instability() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Fragile)?);
        solver.initialize(&dvector![0.0])?;
        while solver.iterate() {}

        assert_eq!(
            solver.failure_reason(),
            Some(FailureReason::NumericalInstability)
        );
        assert_eq!(solver.parameters(), &dvector![0.0]);
        assert_eq!(solver.cost(), 0.5);
        Ok(())
    }

    #[test]
    fn test_non_finite_initial_cost_is_rejected() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Fragile)?);
        let result = solver.initialize(&dvector![1.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::NumericalInstability(_))
        ));
        assert_eq!(solver.state(), OptimizerState::Uninitialized);
        Ok(())
    }

    #[test]
    fn test_non_finite_initial_guess_is_rejected() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Offset)?);
        let result = solver.initialize(&dvector![f64::NAN, 0.0]);
        assert!(matches!(
            result,
            Err(OptimizerError::Core(CoreError::InvalidInput(_)))
        ));
        assert_eq!(solver.state(), OptimizerState::Uninitialized);
        Ok(())
    }

    #[test]
    fn test_max_iterations() -> TestResult {
        let config = LevenbergMarquardtConfig::new().with_max_iterations(2);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::coupled(Rosenbrock)?);
        let result = solver.optimize(&dvector![-1.2, 1.0])?;

        assert_eq!(result.failure_reason(), Some(FailureReason::MaxIterations));
        assert_eq!(result.iterations, 2);
        assert!(!solver.iterate());
        Ok(())
    }

    #[test]
    fn test_starting_at_minimum() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Offset)?);
        solver.initialize(&dvector![3.0, 5.0])?;

        assert!(!solver.iterate());
        assert_eq!(
            solver.state(),
            OptimizerState::Converged(ConvergenceReason::GradientTolerance)
        );
        Ok(())
    }

    #[test]
    fn test_identity_damping_mode() -> TestResult {
        let config = LevenbergMarquardtConfig::new().with_damping_mode(DampingMode::Identity);
        let mut solver = LevenbergMarquardtDampened::with_config(config);
        solver.set_function(CostFunction::coupled(Rosenbrock)?);
        let result = solver.optimize(&dvector![-1.2, 1.0])?;

        assert!(result.is_converged(), "state: {}", result.state);
        assert_eq!(
            solver.damping_view().map(|v| v.damping_mode()),
            Some(DampingMode::Identity)
        );
        Ok(())
    }

    #[test]
    fn test_covariance_at_solution() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Linear::new())?);
        solver.optimize(&dvector![0.0, 0.0])?;

        let covariance = solver.covariance().ok_or("covariance not available")?;
        // (AᵗA)⁻¹ with AᵗA = [[3, 6], [6, 14]]
        assert!((covariance[(0, 0)] - 14.0 / 6.0).abs() < 1e-8);
        assert!((covariance[(0, 1)] + 1.0).abs() < 1e-8);
        assert!((covariance[(1, 1)] - 0.5).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_reinitialize_resets_damping() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Rosenbrock)?);
        solver.optimize(&dvector![-1.2, 1.0])?;

        solver.initialize(&dvector![-1.2, 1.0])?;
        assert_eq!(solver.damping(), 1e-3);
        assert_eq!(solver.iterations(), 0);
        Ok(())
    }

    #[test]
    fn test_summary_display() -> TestResult {
        let mut solver = LevenbergMarquardtDampened::new();
        solver.set_function(CostFunction::coupled(Offset)?);
        solver.optimize(&dvector![0.0, 0.0])?;

        let summary = solver.summary().ok_or("no summary")?;
        let text = summary.to_string();
        assert!(text.contains("CONVERGED"));
        assert!(summary.successful_steps > 0);
        Ok(())
    }
}
