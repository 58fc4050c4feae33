//! Pose refinement from 3D-2D correspondences (PnP).
//!
//! A pose is the world-to-camera rigid transform, parameterized for the
//! optimizer as a 6-vector:
//!
//! ```text
//! [ωx, ωy, ωz, tx, ty, tz]    R = exp([ω]ₓ)  (Rodrigues rotation vector)
//! ```
//!
//! Observations are normalized image coordinates (`K⁻¹·pixel`); errors are
//! scaled back to pixels with `(fx, fy, skew)`.

pub mod reprojection;

pub use reprojection::{PnPDistanceReprojectionSq, PnPRefineFunction, PointPosePair};

use crate::core::CostFunction;
use crate::optimizer::{
    LevenbergMarquardtConfig, LevenbergMarquardtDampened, OptimizerError, OptimizerResult,
    SolverResult, UnconstrainedLeastSquares,
};
use nalgebra::{DVector, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info};

/// Number of optimizer parameters describing one pose
pub const POSE_PARAMETERS: usize = 6;

/// Decode `[ω, t]` into a pose.
///
/// Only the first six entries of `params` are read.
///
/// # Panics
/// If `params` has fewer than [`POSE_PARAMETERS`] entries.
pub fn pose_from_params(params: &[f64]) -> Isometry3<f64> {
    debug_assert!(
        params.len() >= POSE_PARAMETERS,
        "pose needs {POSE_PARAMETERS} parameters, got {}",
        params.len()
    );
    let omega = Vector3::new(params[0], params[1], params[2]);
    let rotation = Rotation3::from_scaled_axis(omega);
    Isometry3::from_parts(
        Translation3::new(params[3], params[4], params[5]),
        UnitQuaternion::from_rotation_matrix(&rotation),
    )
}

/// Encode a pose as `[ω, t]` into the first six entries of `params`.
///
/// # Panics
/// If `params` has fewer than [`POSE_PARAMETERS`] entries.
pub fn pose_to_params(pose: &Isometry3<f64>, params: &mut [f64]) {
    debug_assert!(
        params.len() >= POSE_PARAMETERS,
        "pose needs {POSE_PARAMETERS} slots, got {}",
        params.len()
    );
    let omega = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    params[..POSE_PARAMETERS].copy_from_slice(&[omega.x, omega.y, omega.z, t.x, t.y, t.z]);
}

/// `[v]ₓ`
pub(crate) fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Right Jacobian of the SO(3) exponential map.
///
/// `exp(ω + δ) ≈ exp(ω)·exp(J_r(ω)·δ)`, with
/// `J_r(ω) = I - (1 - cos θ)/θ² [ω]ₓ + (θ - sin θ)/θ³ [ω]ₓ²`.
pub(crate) fn so3_right_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta_sq = omega.norm_squared();
    let omega_skew = skew_symmetric(omega);

    if theta_sq <= f64::EPSILON {
        Matrix3::identity() - 0.5 * omega_skew + omega_skew * omega_skew / 6.0
    } else {
        let theta = theta_sq.sqrt();
        Matrix3::identity() - (1.0 - theta.cos()) / theta_sq * omega_skew
            + (theta - theta.sin()) / (theta_sq * theta) * omega_skew * omega_skew
    }
}

/// Outcome of refining a single pose.
#[derive(Debug, Clone)]
pub struct PoseRefinement {
    /// Refined world-to-camera pose
    pub pose: Isometry3<f64>,
    pub solver_result: SolverResult,
}

/// Refine a world-to-camera pose by minimizing the pixel reprojection error.
///
/// # Errors
/// Fails when the optimizer cannot start: fewer correspondences than needed
/// to constrain the pose, or a non-finite error at `initial`.
pub fn refine_pose(
    function: PnPRefineFunction,
    initial: &Isometry3<f64>,
    config: LevenbergMarquardtConfig,
) -> OptimizerResult<PoseRefinement> {
    // Three points give six residuals, the minimum for six unknowns
    if function.pairs().len() < 3 {
        return Err(OptimizerError::InvalidConfiguration(format!(
            "pose refinement needs at least 3 correspondences, got {}",
            function.pairs().len()
        ))
        .log());
    }

    let mut x0 = DVector::zeros(POSE_PARAMETERS);
    pose_to_params(initial, x0.as_mut_slice());

    let mut solver = LevenbergMarquardtDampened::with_config(config);
    solver.set_function(CostFunction::coupled(function)?);
    let solver_result = solver.optimize(&x0)?;

    debug!(
        "pose refinement: {} after {} iterations, cost {:.6e} -> {:.6e}",
        solver_result.state,
        solver_result.iterations,
        solver_result.initial_cost,
        solver_result.final_cost
    );

    Ok(PoseRefinement {
        pose: pose_from_params(solver_result.parameters.as_slice()),
        solver_result,
    })
}

/// Refine many independent poses, one optimizer per problem.
///
/// Runs on the rayon pool when the `parallel` feature is enabled. Results
/// are in input order.
pub fn refine_poses(
    problems: Vec<(PnPRefineFunction, Isometry3<f64>)>,
    config: &LevenbergMarquardtConfig,
) -> Vec<OptimizerResult<PoseRefinement>> {
    let count = problems.len();

    #[cfg(feature = "parallel")]
    let results: Vec<_> = problems
        .into_par_iter()
        .map(|(function, initial)| refine_pose(function, &initial, config.clone()))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let results: Vec<_> = problems
        .into_iter()
        .map(|(function, initial)| refine_pose(function, &initial, config.clone()))
        .collect();

    let converged = results
        .iter()
        .filter(|r| r.as_ref().is_ok_and(|p| p.solver_result.is_converged()))
        .count();
    info!("refined {} poses, {} converged", count, converged);

    results
}
