//! # visopt
//!
//! Nonlinear least squares for computer vision: a dense Levenberg-Marquardt
//! engine behind a small step-wise optimizer interface, plus the problems
//! that drive it.
//!
//! ## Features
//!
//! - **Cost function contract**: residuals with an optional analytic
//!   Jacobian, numerical differentiation otherwise
//! - **Levenberg-Marquardt**: adaptive damping with diagonal (Marquardt) or
//!   identity scaling, bounded retries on singular or invalid steps
//! - **Gauss-Newton**: undamped variant behind the same interface
//! - **Linear algebra backends**: Cholesky and QR on `faer`
//! - **Camera calibration**: Zhang99 pinhole with radial distortion
//! - **Pose refinement**: PnP reprojection error with analytic Jacobian
//!
//! ## Example
//!
//! ```
//! use visopt::core::{CostFunction, ResidualFunction};
//! use visopt::optimizer::{LevenbergMarquardtDampened, UnconstrainedLeastSquares};
//! use nalgebra::{DVector, dvector};
//!
//! struct Offset;
//!
//! impl ResidualFunction for Offset {
//!     fn num_parameters(&self) -> usize { 2 }
//!     fn num_residuals(&self) -> usize { 2 }
//!     fn evaluate_residuals(&self, p: &DVector<f64>) -> DVector<f64> {
//!         dvector![p[0] - 3.0, p[1] - 5.0]
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut solver = LevenbergMarquardtDampened::new();
//! solver.set_function(CostFunction::numerical(Offset));
//! let result = solver.optimize(&dvector![0.0, 0.0])?;
//! assert!(result.is_converged());
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod core;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;
pub mod pose;

pub use calibration::{
    CalibrationError, CalibrationResult, IntrinsicParam, Zhang99CalibrationFunction,
    Zhang99Pinhole, calibrate,
};
pub use crate::core::{CostFunction, JacobianFunction, NumericalDifferentiation, ResidualFunction};
pub use error::{VisOptError, VisOptResult};
pub use linalg::{
    DampingMode, LinearSolverType, SparseCholeskySolver, SparseLinearSolver, SparseQRSolver,
};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    DampingView, GaussNewton, LevenbergMarquardtConfig, LevenbergMarquardtDampened, OptimizerState,
    OptimizerType, SolverResult, TerminationPolicy, UnconstrainedLeastSquares,
};
pub use pose::{
    PnPDistanceReprojectionSq, PnPRefineFunction, PointPosePair, refine_pose, refine_poses,
};
