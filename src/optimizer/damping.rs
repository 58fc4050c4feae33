//! Damping parameter control for Levenberg-Marquardt.
//!
//! λ blends the Gauss-Newton step (λ → 0) with a short gradient descent step
//! (λ → ∞). The controller only knows λ and whether the last trial step was
//! accepted:
//!
//! ```text
//! accept:  λ ← max(λ / decrease_factor, λ_min)
//! reject:  λ ← min(λ · increase_factor, λ_max)
//! ```
//!
//! Singular solves and invalid evaluations count as rejections. Once λ sits at
//! `λ_max` a rejection cannot raise it any further; the engine ends the run
//! there instead of retrying the same step.

use crate::optimizer::{OptimizerError, OptimizerResult};

/// Owns λ and adapts it on accept/reject.
#[derive(Debug, Clone, PartialEq)]
pub struct DampingController {
    lambda: f64,
    increase_factor: f64,
    decrease_factor: f64,
    min: f64,
    max: f64,
}

impl DampingController {
    /// Create a controller starting at `initial`.
    ///
    /// # Errors
    /// [`OptimizerError::InvalidConfiguration`] unless both factors are
    /// finite and greater than one and `0 < min ≤ initial ≤ max`.
    pub fn new(
        initial: f64,
        increase_factor: f64,
        decrease_factor: f64,
        min: f64,
        max: f64,
    ) -> OptimizerResult<Self> {
        if !(increase_factor.is_finite() && increase_factor > 1.0) {
            return Err(OptimizerError::InvalidConfiguration(format!(
                "damping increase factor must be > 1, got {increase_factor}"
            )));
        }
        if !(decrease_factor.is_finite() && decrease_factor > 1.0) {
            return Err(OptimizerError::InvalidConfiguration(format!(
                "damping decrease factor must be > 1, got {decrease_factor}"
            )));
        }
        if !(min > 0.0 && min <= initial && initial <= max && max.is_finite()) {
            return Err(OptimizerError::InvalidConfiguration(format!(
                "damping bounds must satisfy 0 < min <= initial <= max, got {min:.2e} <= {initial:.2e} <= {max:.2e}"
            )));
        }

        Ok(Self {
            lambda: initial,
            increase_factor,
            decrease_factor,
            min,
            max,
        })
    }

    /// Current λ
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Step accepted: trust the quadratic model more.
    pub fn accept(&mut self) -> f64 {
        self.lambda = (self.lambda / self.decrease_factor).max(self.min);
        self.lambda
    }

    /// Step rejected: move towards gradient descent.
    pub fn reject(&mut self) -> f64 {
        self.lambda = (self.lambda * self.increase_factor).min(self.max);
        self.lambda
    }

    /// [`accept`](Self::accept) or [`reject`](Self::reject).
    pub fn update(&mut self, accepted: bool) -> f64 {
        if accepted { self.accept() } else { self.reject() }
    }

    /// True once rejections can no longer grow λ
    pub fn is_saturated(&self) -> bool {
        self.lambda >= self.max
    }
}

impl Default for DampingController {
    fn default() -> Self {
        Self {
            lambda: 1e-3,
            increase_factor: 10.0,
            decrease_factor: 10.0,
            min: 1e-12,
            max: 1e32,
        }
    }
}
