//! Zhang99 pinhole model with radial distortion and its calibration residual.
//!
//! # Projection
//!
//! ```text
//! x = X/Z,  y = Y/Z,  r² = x² + y²
//! d = 1 + k1·r² + k2·r⁴ + ... + kn·r²ⁿ
//! u = fx·d·x + skew·d·y + cx
//! v = fy·d·y + cy
//! ```
//!
//! # Parameter layout
//!
//! ```text
//! [fx, fy, (skew), cx, cy, k1..kn]   skew omitted when assumed zero
//! ```

use crate::calibration::{CalibrationError, CalibrationResult};
use crate::core::ResidualFunction;
use crate::optimizer::SolverResult;
use crate::pose::{POSE_PARAMETERS, pose_from_params, pose_to_params};
use nalgebra::{DVector, Isometry3, Matrix3, Point2, Point3};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Intrinsic camera model that can be packed into an optimizer parameter vector.
pub trait IntrinsicParam {
    /// Parameters the model occupies in the optimizer vector
    fn num_parameters(&self) -> usize;

    /// Read the model from the front of `params`; returns the count consumed.
    fn set_from_param(&mut self, params: &[f64]) -> usize;

    /// Write the model to the front of `params`; returns the count written.
    fn convert_to_param(&self, params: &mut [f64]) -> usize;

    /// Camera-frame point to pixel.
    fn project(&self, point: &Point3<f64>) -> Point2<f64>;
}

/// Pinhole intrinsics with polynomial radial distortion.
#[derive(Debug, Clone, PartialEq)]
pub struct Zhang99Pinhole {
    pub fx: f64,
    pub fy: f64,
    pub skew: f64,
    pub cx: f64,
    pub cy: f64,
    /// `k1..kn`
    pub radial: Vec<f64>,
    /// Keep skew out of the parameter vector and fixed at zero
    pub assume_zero_skew: bool,
}

impl Zhang99Pinhole {
    pub fn new(fx: f64, fy: f64, skew: f64, cx: f64, cy: f64, radial: Vec<f64>) -> Self {
        Self {
            fx,
            fy,
            skew,
            cx,
            cy,
            radial,
            assume_zero_skew: false,
        }
    }

    /// Fix skew at zero; it no longer appears in the parameter vector.
    pub fn with_zero_skew(mut self) -> Self {
        self.skew = 0.0;
        self.assume_zero_skew = true;
        self
    }

    /// Seed from a camera matrix, e.g. a closed-form homography estimate.
    pub fn initialize(&mut self, camera_matrix: &Matrix3<f64>, radial: &[f64]) {
        self.fx = camera_matrix[(0, 0)];
        self.fy = camera_matrix[(1, 1)];
        self.skew = if self.assume_zero_skew {
            0.0
        } else {
            camera_matrix[(0, 1)]
        };
        self.cx = camera_matrix[(0, 2)];
        self.cy = camera_matrix[(1, 2)];
        self.radial = radial.to_vec();
    }

    /// `K`
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0,
        )
    }

    fn distortion_factor(&self, r2: f64) -> f64 {
        let mut factor = 1.0;
        let mut r_pow = r2;
        for k in &self.radial {
            factor += k * r_pow;
            r_pow *= r2;
        }
        factor
    }
}

impl IntrinsicParam for Zhang99Pinhole {
    fn num_parameters(&self) -> usize {
        let skew = if self.assume_zero_skew { 0 } else { 1 };
        4 + skew + self.radial.len()
    }

    fn set_from_param(&mut self, params: &[f64]) -> usize {
        let mut index = 0;
        let mut next = || {
            let value = params[index];
            index += 1;
            value
        };

        self.fx = next();
        self.fy = next();
        self.skew = if self.assume_zero_skew { 0.0 } else { next() };
        self.cx = next();
        self.cy = next();
        for k in self.radial.iter_mut() {
            *k = next();
        }
        index
    }

    fn convert_to_param(&self, params: &mut [f64]) -> usize {
        let mut values = vec![self.fx, self.fy];
        if !self.assume_zero_skew {
            values.push(self.skew);
        }
        values.extend([self.cx, self.cy]);
        values.extend(&self.radial);

        params[..values.len()].copy_from_slice(&values);
        values.len()
    }

    fn project(&self, point: &Point3<f64>) -> Point2<f64> {
        let x = point.x / point.z;
        let y = point.y / point.z;
        let factor = self.distortion_factor(x * x + y * y);
        let (xd, yd) = (x * factor, y * factor);

        Point2::new(
            self.fx * xd + self.skew * yd + self.cx,
            self.fy * yd + self.cy,
        )
    }
}

/// Reprojection residual of a planar target seen in several views.
///
/// Parameters are the intrinsics followed by `[ω, t]` for each view, where
/// the pose maps target coordinates (`z = 0`) into the camera frame.
/// Residuals are `projected - observed` in pixels, two per target point per
/// view, view-major.
#[derive(Debug, Clone)]
pub struct Zhang99CalibrationFunction {
    intrinsic: Zhang99Pinhole,
    template: Vec<Point3<f64>>,
    observations: Vec<Vec<Point2<f64>>>,
}

impl Zhang99CalibrationFunction {
    /// `intrinsic` fixes the parameter layout (radial order, skew); its
    /// values are only a starting point.
    ///
    /// # Errors
    /// No views, an empty target or a view whose observation count differs
    /// from the target's point count.
    pub fn new(
        intrinsic: Zhang99Pinhole,
        template: &[Point2<f64>],
        observations: Vec<Vec<Point2<f64>>>,
    ) -> Result<Self, CalibrationError> {
        if observations.is_empty() {
            return Err(CalibrationError::NoViews.log());
        }
        if template.is_empty() {
            return Err(CalibrationError::MismatchedObservations(
                "calibration target has no points".to_string(),
            )
            .log());
        }
        if let Some((view, points)) = observations
            .iter()
            .enumerate()
            .find(|(_, points)| points.len() != template.len())
        {
            return Err(CalibrationError::MismatchedObservations(format!(
                "view {view} has {} observations, target has {} points",
                points.len(),
                template.len()
            ))
            .log());
        }

        Ok(Self {
            intrinsic,
            template: template.iter().map(|p| Point3::new(p.x, p.y, 0.0)).collect(),
            observations,
        })
    }

    pub fn num_views(&self) -> usize {
        self.observations.len()
    }

    /// Observations summed over every view
    pub fn num_points(&self) -> usize {
        self.observations.len() * self.template.len()
    }

    /// Pack intrinsics and view poses into an optimizer vector.
    ///
    /// # Errors
    /// [`CalibrationError::MismatchedObservations`] unless there is one pose
    /// per view and `intrinsic` has the same parameter layout as this
    /// function's model.
    pub fn encode(
        &self,
        intrinsic: &Zhang99Pinhole,
        poses: &[Isometry3<f64>],
    ) -> Result<DVector<f64>, CalibrationError> {
        if poses.len() != self.num_views() {
            return Err(CalibrationError::MismatchedObservations(format!(
                "{} initial poses for {} views",
                poses.len(),
                self.num_views()
            ))
            .log());
        }
        if intrinsic.num_parameters() != self.intrinsic.num_parameters() {
            return Err(CalibrationError::MismatchedObservations(format!(
                "intrinsic model has {} parameters, expected {}",
                intrinsic.num_parameters(),
                self.intrinsic.num_parameters()
            ))
            .log());
        }

        let mut params = DVector::zeros(ResidualFunction::num_parameters(self));
        let offset = intrinsic.convert_to_param(params.as_mut_slice());
        for (view, pose) in poses.iter().enumerate() {
            let start = offset + view * POSE_PARAMETERS;
            pose_to_params(pose, &mut params.as_mut_slice()[start..]);
        }
        Ok(params)
    }

    /// Unpack an optimizer vector into intrinsics and view poses.
    ///
    /// # Panics
    /// If `params` is shorter than the intrinsic parameters.
    pub fn decode(&self, params: &DVector<f64>) -> (Zhang99Pinhole, Vec<Isometry3<f64>>) {
        debug_assert_eq!(params.len(), ResidualFunction::num_parameters(self));
        let mut intrinsic = self.intrinsic.clone();
        let offset = intrinsic.set_from_param(params.as_slice());
        let poses = params.as_slice()[offset..]
            .chunks_exact(POSE_PARAMETERS)
            .map(pose_from_params)
            .collect();
        (intrinsic, poses)
    }

    fn view_residuals(
        &self,
        intrinsic: &Zhang99Pinhole,
        pose: &Isometry3<f64>,
        observed: &[Point2<f64>],
    ) -> Vec<f64> {
        self.template
            .iter()
            .zip(observed)
            .flat_map(|(point, observation)| {
                let pixel = intrinsic.project(&(pose * point));
                [pixel.x - observation.x, pixel.y - observation.y]
            })
            .collect()
    }

    /// Wrap the refined parameters into a result.
    pub(crate) fn into_result(self, solver_result: SolverResult) -> CalibrationResult {
        let (intrinsic, poses) = self.decode(&solver_result.parameters);
        let rms_error = (2.0 * solver_result.final_cost / self.num_points() as f64).sqrt();
        CalibrationResult {
            intrinsic,
            poses,
            rms_error,
            solver_result,
        }
    }
}

impl ResidualFunction for Zhang99CalibrationFunction {
    fn num_parameters(&self) -> usize {
        self.intrinsic.num_parameters() + POSE_PARAMETERS * self.observations.len()
    }

    fn num_residuals(&self) -> usize {
        2 * self.num_points()
    }

    fn evaluate_residuals(&self, parameters: &DVector<f64>) -> DVector<f64> {
        let (intrinsic, poses) = self.decode(parameters);

        #[cfg(feature = "parallel")]
        let per_view: Vec<Vec<f64>> = self
            .observations
            .par_iter()
            .zip(poses.par_iter())
            .map(|(observed, pose)| self.view_residuals(&intrinsic, pose, observed))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let per_view: Vec<Vec<f64>> = self
            .observations
            .iter()
            .zip(poses.iter())
            .map(|(observed, pose)| self.view_residuals(&intrinsic, pose, observed))
            .collect();

        DVector::from_iterator(self.num_residuals(), per_view.into_iter().flatten())
    }
}
