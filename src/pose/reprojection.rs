//! Reprojection error of a world-to-camera pose in pixel units.

use crate::core::{JacobianFunction, ResidualFunction};
use crate::pose::{POSE_PARAMETERS, pose_from_params, skew_symmetric, so3_right_jacobian};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix2x3, Matrix3, Point2, Point3, Vector3};

/// A world point and its normalized image observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPosePair {
    /// Point in world coordinates
    pub point: Point3<f64>,
    /// Observation in normalized image coordinates
    pub observation: Point2<f64>,
}

impl PointPosePair {
    pub fn new(point: Point3<f64>, observation: Point2<f64>) -> Self {
        Self { point, observation }
    }
}

/// Pixel-space error of a normalized-coordinate difference
fn pixel_error(fx: f64, fy: f64, skew: f64, dx: f64, dy: f64) -> (f64, f64) {
    (fx * dx + skew * dy, fy * dy)
}

/// Squared reprojection error of a pose for one correspondence.
///
/// ```text
/// Xc = pose · X
/// d  = (Xc.x / Xc.z, Xc.y / Xc.z) - observation
/// e² = (fx·dx + skew·dy)² + (fy·dy)²
/// ```
///
/// Points at or behind the camera plane give `f64::MAX`.
#[derive(Debug, Clone, PartialEq)]
pub struct PnPDistanceReprojectionSq {
    fx: f64,
    fy: f64,
    skew: f64,
    model: Isometry3<f64>,
}

impl Default for PnPDistanceReprojectionSq {
    fn default() -> Self {
        Self::new(1.0, 1.0, 0.0)
    }
}

impl PnPDistanceReprojectionSq {
    pub fn new(fx: f64, fy: f64, skew: f64) -> Self {
        Self {
            fx,
            fy,
            skew,
            model: Isometry3::identity(),
        }
    }

    pub fn set_intrinsic(&mut self, fx: f64, fy: f64, skew: f64) {
        self.fx = fx;
        self.fy = fy;
        self.skew = skew;
    }

    /// Pose being scored
    pub fn set_model(&mut self, model: Isometry3<f64>) {
        self.model = model;
    }

    pub fn model(&self) -> &Isometry3<f64> {
        &self.model
    }

    pub fn compute_distance(&self, pair: &PointPosePair) -> f64 {
        let camera = self.model * pair.point;
        if camera.z <= 0.0 {
            return f64::MAX;
        }

        let dx = camera.x / camera.z - pair.observation.x;
        let dy = camera.y / camera.z - pair.observation.y;
        let (eu, ev) = pixel_error(self.fx, self.fy, self.skew, dx, dy);
        eu * eu + ev * ev
    }

    /// Fill `distances[i]` with the error of `pairs[i]`.
    ///
    /// Only the first `min(pairs.len(), distances.len())` entries are written.
    pub fn compute_distances(&self, pairs: &[PointPosePair], distances: &mut [f64]) {
        for (pair, distance) in pairs.iter().zip(distances.iter_mut()) {
            *distance = self.compute_distance(pair);
        }
    }
}

/// Pose refinement problem: two pixel residuals per correspondence over
/// `[ω, t]`, with an analytic Jacobian.
#[derive(Debug, Clone)]
pub struct PnPRefineFunction {
    fx: f64,
    fy: f64,
    skew: f64,
    pairs: Vec<PointPosePair>,
}

impl PnPRefineFunction {
    pub fn new(fx: f64, fy: f64, skew: f64, pairs: Vec<PointPosePair>) -> Self {
        Self {
            fx,
            fy,
            skew,
            pairs,
        }
    }

    pub fn pairs(&self) -> &[PointPosePair] {
        &self.pairs
    }

    /// Pixel-scaled derivative of the projection `(x/z, y/z)` w.r.t. `Xc`
    fn projection_jacobian(&self, camera: &Point3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / camera.z;
        let x = camera.x * inv_z;
        let y = camera.y * inv_z;
        let dnorm = Matrix2x3::new(inv_z, 0.0, -x * inv_z, 0.0, inv_z, -y * inv_z);

        let mut scaled = Matrix2x3::zeros();
        for c in 0..3 {
            let (eu, ev) = pixel_error(self.fx, self.fy, self.skew, dnorm[(0, c)], dnorm[(1, c)]);
            scaled[(0, c)] = eu;
            scaled[(1, c)] = ev;
        }
        scaled
    }
}

impl ResidualFunction for PnPRefineFunction {
    fn num_parameters(&self) -> usize {
        POSE_PARAMETERS
    }

    fn num_residuals(&self) -> usize {
        2 * self.pairs.len()
    }

    fn evaluate_residuals(&self, parameters: &DVector<f64>) -> DVector<f64> {
        let pose = pose_from_params(parameters.as_slice());
        let mut residuals = DVector::zeros(2 * self.pairs.len());

        for (i, pair) in self.pairs.iter().enumerate() {
            let camera = pose * pair.point;
            let dx = camera.x / camera.z - pair.observation.x;
            let dy = camera.y / camera.z - pair.observation.y;
            let (eu, ev) = pixel_error(self.fx, self.fy, self.skew, dx, dy);
            residuals[2 * i] = eu;
            residuals[2 * i + 1] = ev;
        }
        residuals
    }
}

impl JacobianFunction for PnPRefineFunction {
    fn num_parameters(&self) -> usize {
        POSE_PARAMETERS
    }

    fn num_residuals(&self) -> usize {
        2 * self.pairs.len()
    }

    fn evaluate_jacobian(&self, parameters: &DVector<f64>) -> DMatrix<f64> {
        let omega = Vector3::new(parameters[0], parameters[1], parameters[2]);
        let pose = pose_from_params(parameters.as_slice());
        let rotation = pose.rotation.to_rotation_matrix();
        let right_jacobian = so3_right_jacobian(&omega);

        let mut jacobian = DMatrix::zeros(2 * self.pairs.len(), POSE_PARAMETERS);
        for (i, pair) in self.pairs.iter().enumerate() {
            let camera = pose * pair.point;
            let projection = self.projection_jacobian(&camera);

            // ∂Xc/∂ω = -R [X]ₓ J_r(ω),  ∂Xc/∂t = I
            let d_rotation: Matrix3<f64> =
                -(rotation.matrix() * skew_symmetric(&pair.point.coords) * right_jacobian);
            let d_omega = projection * d_rotation;

            jacobian
                .fixed_view_mut::<2, 3>(2 * i, 0)
                .copy_from(&d_omega);
            jacobian
                .fixed_view_mut::<2, 3>(2 * i, 3)
                .copy_from(&projection);
        }
        jacobian
    }
}
