//! Intrinsic camera calibration from a planar target.
//!
//! Refines an initial Zhang99 pinhole estimate and the pose of every view
//! jointly, minimizing the pixel reprojection error with the dampened
//! Levenberg-Marquardt optimizer. The Jacobian is computed numerically.
//!
//! ```text
//! target points (z = 0) ──pose_v──▶ camera frame ──K, k1..kn──▶ pixels
//! ```

pub mod zhang99;

pub use zhang99::{IntrinsicParam, Zhang99CalibrationFunction, Zhang99Pinhole};

use crate::core::CostFunction;
use crate::optimizer::{
    LevenbergMarquardtConfig, LevenbergMarquardtDampened, OptimizerError, SolverResult,
    UnconstrainedLeastSquares,
};
use nalgebra::{Isometry3, Point2};
use thiserror::Error;
use tracing::{error, info, warn};

/// Calibration-specific error types
#[derive(Debug, Clone, Error)]
pub enum CalibrationError {
    /// No views were provided
    #[error("No calibration views provided")]
    NoViews,

    /// Observation, pose and target point counts disagree
    #[error("Mismatched observations: {0}")]
    MismatchedObservations(String),

    /// The optimizer could not start
    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
}

impl CalibrationError {
    /// Log the error with tracing::error and return self for chaining
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

/// Refined camera and view poses.
///
/// Failure to converge is not an error: check
/// [`SolverResult::is_converged`] on `solver_result`.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub intrinsic: Zhang99Pinhole,
    /// Target-to-camera pose of each view, in input order
    pub poses: Vec<Isometry3<f64>>,
    /// `sqrt(Σ‖projected - observed‖² / points)` in pixels
    pub rms_error: f64,
    pub solver_result: SolverResult,
}

/// Jointly refine intrinsics and view poses.
///
/// `observations[v][i]` is the pixel where target point `template[i]` was
/// seen in view `v`, and `poses[v]` the initial target-to-camera pose of that
/// view. The layout of `intrinsic` (radial order, skew) is kept.
///
/// # Errors
/// No views, counts that disagree between views, poses and target, or an
/// optimizer that cannot start (e.g. non-finite error at the initial guess).
pub fn calibrate(
    intrinsic: &Zhang99Pinhole,
    poses: &[Isometry3<f64>],
    template: &[Point2<f64>],
    observations: Vec<Vec<Point2<f64>>>,
    config: LevenbergMarquardtConfig,
) -> Result<CalibrationResult, CalibrationError> {
    let function = Zhang99CalibrationFunction::new(intrinsic.clone(), template, observations)?;
    let initial = function.encode(intrinsic, poses)?;
    info!(
        "calibrating {} parameters from {} views of {} points",
        initial.len(),
        function.num_views(),
        template.len()
    );

    let mut solver = LevenbergMarquardtDampened::with_config(config);
    solver.set_function(CostFunction::numerical(function.clone()));
    let solver_result = solver.optimize(&initial)?;
    let result = function.into_result(solver_result);

    if result.solver_result.is_converged() {
        info!(
            "calibration {} in {} iterations, rms {:.4} px",
            result.solver_result.state, result.solver_result.iterations, result.rms_error
        );
    } else {
        warn!(
            "calibration stopped without converging ({}), rms {:.4} px",
            result.solver_result.state, result.rms_error
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::pose_from_params;
    use nalgebra::Point3;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn target() -> Vec<Point2<f64>> {
        (0..8)
            .flat_map(|i| {
                (0..6).map(move |j| Point2::new(i as f64 * 0.1 - 0.35, j as f64 * 0.1 - 0.25))
            })
            .collect()
    }

    fn views() -> Vec<Isometry3<f64>> {
        [
            [0.2, -0.1, 0.0, -0.05, 0.0, 1.0],
            [-0.25, 0.15, 0.1, 0.0, 0.05, 1.1],
            [0.05, 0.3, -0.1, 0.05, -0.05, 0.9],
            [-0.1, -0.3, 0.2, 0.0, 0.0, 1.2],
        ]
        .iter()
        .map(|p| pose_from_params(p))
        .collect()
    }

    fn observe(camera: &Zhang99Pinhole, poses: &[Isometry3<f64>]) -> Vec<Vec<Point2<f64>>> {
        poses
            .iter()
            .map(|pose| {
                target()
                    .iter()
                    .map(|p| camera.project(&(pose * Point3::new(p.x, p.y, 0.0))))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_calibrate_recovers_intrinsics() -> TestResult {
        let truth = Zhang99Pinhole::new(500.0, 500.0, 0.0, 320.0, 240.0, vec![-0.1, 0.02])
            .with_zero_skew();
        let poses = views();
        let observations = observe(&truth, &poses);

        let guess = Zhang99Pinhole::new(520.0, 480.0, 0.0, 310.0, 250.0, vec![0.0, 0.0])
            .with_zero_skew();
        let perturbed: Vec<_> = poses
            .iter()
            .map(|pose| pose_from_params(&[0.01, -0.01, 0.0, 0.01, 0.0, 0.02]) * pose)
            .collect();

        let result = calibrate(
            &guess,
            &perturbed,
            &target(),
            observations,
            LevenbergMarquardtConfig::default(),
        )?;

        assert!(result.solver_result.final_cost < result.solver_result.initial_cost);
        assert!((result.intrinsic.fx - 500.0).abs() < 1e-3);
        assert!((result.intrinsic.fy - 500.0).abs() < 1e-3);
        assert!((result.intrinsic.cx - 320.0).abs() < 1e-3);
        assert!((result.intrinsic.cy - 240.0).abs() < 1e-3);
        assert!((result.intrinsic.radial[0] + 0.1).abs() < 1e-5);
        assert_eq!(result.intrinsic.skew, 0.0);
        assert!(result.rms_error < 1e-6);
        assert_eq!(result.poses.len(), 4);
        Ok(())
    }

    #[test]
    fn test_calibrate_rejects_bad_input() {
        let camera = Zhang99Pinhole::new(500.0, 500.0, 0.0, 320.0, 240.0, vec![]);
        let poses = views();

        let no_views = calibrate(
            &camera,
            &[],
            &target(),
            vec![],
            LevenbergMarquardtConfig::default(),
        );
        assert!(matches!(no_views, Err(CalibrationError::NoViews)));

        let missing_pose = calibrate(
            &camera,
            &poses[..2],
            &target(),
            observe(&camera, &poses),
            LevenbergMarquardtConfig::default(),
        );
        assert!(matches!(
            missing_pose,
            Err(CalibrationError::MismatchedObservations(_))
        ));
    }

    #[test]
    fn test_optimizer_error_converts() {
        let error: CalibrationError = OptimizerError::MissingFunction.into();
        assert!(error.to_string().contains("No cost function set"));
    }
}
