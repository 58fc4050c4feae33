//! Gauss-Newton optimization algorithm implementation.
//!
//! The Gauss-Newton method solves the undamped normal equations at each
//! iteration:
//!
//! ```text
//! J^T·J·h = -J^T·r
//! ```
//!
//! where:
//! - `J` is the Jacobian matrix (m × n) of partial derivatives ∂rᵢ/∂xⱼ
//! - `r` is the residual vector (m × 1)
//! - `h` is the step vector (n × 1)
//!
//! The approximated Hessian `H ≈ J^T·J` replaces the true Hessian
//! `∇²f = J^T·J + Σᵢ rᵢ·∇²rᵢ`, which works well when residuals are small or
//! nearly linear.
//!
//! ## Convergence Properties
//!
//! - **Quadratic convergence** near the solution when the approximation is valid
//! - **No step size control**: a step that does not decrease the cost ends the
//!   run with [`FailureReason::CostIncrease`](crate::optimizer::FailureReason::CostIncrease)
//! - **No retries**: a singular `J^T·J` ends the run with
//!   [`FailureReason::SingularSystem`](crate::optimizer::FailureReason::SingularSystem)
//!
//! For poor initial guesses use
//! [`LevenbergMarquardtDampened`](crate::optimizer::LevenbergMarquardtDampened).

use crate::core::{CoreError, CostFunction, cost_function::compute_cost};
use crate::linalg::{LinearSolverType, SparseLinearSolver, to_dvector};
use crate::optimizer::{
    AcceptedStep, ConvergenceInfo, FailureReason, IterationReport, Linearization, OptimizerError,
    OptimizerResult, OptimizerState, TerminationPolicy, UnconstrainedLeastSquares,
};

use nalgebra::DVector;
use std::fmt;
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

/// Summary statistics for the Gauss-Newton optimization process.
#[derive(Debug, Clone)]
pub struct GaussNewtonSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of iterations performed
    pub iterations: usize,
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Total time elapsed
    pub total_time: Duration,
    /// Terminal state
    pub state: OptimizerState,
}

impl fmt::Display for GaussNewtonSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gauss-Newton Final Result")?;
        if matches!(self.state, OptimizerState::Converged(_)) {
            writeln!(f, "CONVERGED ({})", self.state)?;
        } else {
            writeln!(f, "DIVERGED ({})", self.state)?;
        }
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(f)?;
        writeln!(f, "Iterations:  {}", self.iterations)?;
        writeln!(f, "Gradient:    {:.2e}", self.final_gradient_norm)?;
        writeln!(f, "Last step:   {:.2e}", self.final_parameter_update_norm)?;
        writeln!(
            f,
            "Total time:  {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}

/// Configuration parameters for the Gauss-Newton optimizer.
#[derive(Debug, Clone)]
pub struct GaussNewtonConfig {
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence tolerance for the relative cost change
    pub cost_tolerance: f64,
    /// Convergence tolerance for parameter updates
    pub parameter_tolerance: f64,
    /// Convergence tolerance for the gradient infinity norm
    pub gradient_tolerance: f64,
}

impl Default for GaussNewtonConfig {
    fn default() -> Self {
        let termination = TerminationPolicy::default();
        Self {
            linear_solver_type: LinearSolverType::default(),
            max_iterations: termination.max_iterations,
            cost_tolerance: termination.cost_tolerance,
            parameter_tolerance: termination.parameter_tolerance,
            gradient_tolerance: termination.gradient_tolerance,
        }
    }
}

impl GaussNewtonConfig {
    /// Create a new Gauss-Newton configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
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

    /// Gauss-Newton never retries, so failures are not tolerated.
    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            max_iterations: self.max_iterations,
            cost_tolerance: self.cost_tolerance,
            gradient_tolerance: self.gradient_tolerance,
            parameter_tolerance: self.parameter_tolerance,
            max_consecutive_failures: 0,
        }
    }

    /// Print configuration parameters (DEBUG level)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        Gauss-Newton\n  Linear solver: {}\n  Convergence Criteria:\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}",
            self.linear_solver_type,
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance
        );
    }
}

/// Gauss-Newton solver for nonlinear least squares optimization.
pub struct GaussNewton {
    config: GaussNewtonConfig,
    function: Option<CostFunction>,
    state: OptimizerState,
    termination: TerminationPolicy,
    linear_solver: Box<dyn SparseLinearSolver>,
    parameters: DVector<f64>,
    residuals: DVector<f64>,
    cost: f64,
    initial_cost: f64,
    linearization: Option<Linearization>,
    iterations: usize,
    info: ConvergenceInfo,
    start_time: Instant,
    summary: Option<GaussNewtonSummary>,
}

impl Default for GaussNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussNewton {
    /// Create a new Gauss-Newton solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(GaussNewtonConfig::default())
    }

    /// Create a new Gauss-Newton solver with the given configuration.
    pub fn with_config(config: GaussNewtonConfig) -> Self {
        Self {
            linear_solver: config.linear_solver_type.create(),
            termination: config.termination_policy(),
            config,
            function: None,
            state: OptimizerState::Uninitialized,
            parameters: DVector::zeros(0),
            residuals: DVector::zeros(0),
            cost: f64::NAN,
            initial_cost: f64::NAN,
            linearization: None,
            iterations: 0,
            info: ConvergenceInfo::default(),
            start_time: Instant::now(),
            summary: None,
        }
    }

    /// Summary of the last finished run
    pub fn summary(&self) -> Option<&GaussNewtonSummary> {
        self.summary.as_ref()
    }

    fn ensure_linearized(&mut self) -> bool {
        if self.linearization.is_some() {
            return true;
        }
        let Some(function) = self.function.as_ref() else {
            return false;
        };

        self.info.jacobian_evaluations += 1;
        match Linearization::evaluate(function, &self.parameters, &self.residuals) {
            Ok(linearization) => {
                self.info.final_gradient_norm = linearization.gradient_norm();
                self.linearization = Some(linearization);
                true
            }
            Err(e) => {
                debug!("Invalid linearization: {}", e);
                false
            }
        }
    }

    /// One undamped step. Returns the report for the termination policy, or
    /// the failure that ends the run right away.
    fn step(&mut self) -> Result<IterationReport, FailureReason> {
        if !self.ensure_linearized() {
            return Err(FailureReason::NumericalInstability);
        }
        let (Some(function), Some(linearization)) =
            (self.function.as_ref(), self.linearization.as_ref())
        else {
            return Err(FailureReason::NumericalInstability);
        };

        let mut report = IterationReport {
            iteration: self.iterations,
            ..IterationReport::default()
        };

        // A zero Jacobian at a zero residual is an exact solution
        if linearization.is_degenerate() && self.cost > 0.0 {
            debug!("Jacobian is identically zero at a nonzero residual");
            return Err(FailureReason::SingularSystem);
        }

        let gradient_norm = linearization.gradient_norm();
        if gradient_norm < self.termination.gradient_tolerance {
            report.gradient_norm = Some(gradient_norm);
            return Ok(report);
        }

        let step = self
            .linear_solver
            .solve_normal_equation(&linearization.residuals, &linearization.jacobian)
            .map(|step| to_dvector(&step))
            .map_err(|e| {
                debug!("Gauss-Newton solve failed: {}", e);
                FailureReason::SingularSystem
            })?;
        let step_norm = step.norm();
        self.info.final_parameter_update_norm = step_norm;

        let candidate = &self.parameters + &step;
        self.info.cost_evaluations += 1;
        let candidate_residuals = function.evaluate_residuals(&candidate).map_err(|e| {
            debug!("Rejecting candidate: {}", e);
            FailureReason::NumericalInstability
        })?;
        let candidate_cost = compute_cost(&candidate_residuals);
        if !candidate_cost.is_finite() {
            return Err(FailureReason::NumericalInstability);
        }
        if candidate_cost >= self.cost {
            debug!(
                "Gauss-Newton step did not decrease the cost: {:.6e} -> {:.6e}",
                self.cost, candidate_cost
            );
            return Err(FailureReason::CostIncrease);
        }

        let previous_cost = self.cost;
        self.parameters = candidate;
        self.residuals = candidate_residuals;
        self.cost = candidate_cost;
        self.linearization = None;
        report.accepted = Some(AcceptedStep {
            previous_cost,
            cost: candidate_cost,
            step_norm,
        });

        if self.ensure_linearized() {
            report.gradient_norm = Some(self.info.final_gradient_norm);
        }
        Ok(report)
    }

    fn finish(&mut self, state: OptimizerState) {
        self.state = state;
        match state {
            OptimizerState::Converged(reason) => info!(
                "Gauss-Newton converged after {} iterations ({}), cost {:.6e}",
                self.iterations, reason, self.cost
            ),
            _ => warn!(
                "Gauss-Newton stopped after {} iterations ({}), cost {:.6e}",
                self.iterations, state, self.cost
            ),
        }

        let summary = GaussNewtonSummary {
            initial_cost: self.initial_cost,
            final_cost: self.cost,
            iterations: self.iterations,
            final_gradient_norm: self.info.final_gradient_norm,
            final_parameter_update_norm: self.info.final_parameter_update_norm,
            total_time: self.start_time.elapsed(),
            state,
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("{}", summary);
        }
        self.summary = Some(summary);
    }
}

impl UnconstrainedLeastSquares for GaussNewton {
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
        self.linear_solver = self.config.linear_solver_type.create();
        self.parameters = initial.clone();
        self.residuals = residuals;
        self.cost = cost;
        self.initial_cost = cost;
        self.linearization = None;
        self.iterations = 0;
        self.info = ConvergenceInfo {
            cost_evaluations: 1,
            ..ConvergenceInfo::default()
        };
        self.start_time = Instant::now();
        self.summary = None;
        self.state = OptimizerState::Initialized;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
        }
        Ok(())
    }

    fn iterate(&mut self) -> bool {
        match self.state {
            OptimizerState::Uninitialized => {
                warn!("iterate() called on an uninitialized Gauss-Newton solver");
                return false;
            }
            OptimizerState::Converged(_) | OptimizerState::Failed(_) => return false,
            OptimizerState::Initialized | OptimizerState::Iterating => {}
        }
        self.state = OptimizerState::Iterating;
        self.iterations += 1;

        let next_state = match self.step() {
            Ok(report) => {
                debug!(
                    "{:>4}  cost {:>13.6e}  |gradient| {:>11.2e}  |step| {:>11.2e}",
                    self.iterations,
                    self.cost,
                    self.info.final_gradient_norm,
                    self.info.final_parameter_update_norm
                );
                self.termination.evaluate(&report)
            }
            Err(reason) => Some(OptimizerState::Failed(reason)),
        };

        match next_state {
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
        self.info.clone()
    }
}
