//! Linear solvers for the (damped) normal equations.
//!
//! The public contract of the crate speaks `nalgebra` dense types; the solvers
//! work on `faer` sparse matrices so that calibration problems, whose Jacobians
//! are block sparse (each view only touches its own pose), factorize cheaply.
//! The conversion helpers at the bottom of this module are the only place the
//! two representations meet.

pub mod cholesky;
pub mod qr;

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::Mul,
};
use thiserror::Error;
use tracing::error;

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    SparseQR,
}

impl LinearSolverType {
    /// Build a fresh solver of this type.
    pub fn create(self) -> Box<dyn SparseLinearSolver> {
        match self {
            LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
            LinearSolverType::SparseQR => Box::new(SparseQRSolver::new()),
        }
    }
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

/// How the damping term is added to `JᵗJ`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DampingMode {
    /// `JᵗJ + λ·diag(JᵗJ)` (Marquardt scaling, invariant to parameter scale)
    #[default]
    HessianDiagonal,
    /// `JᵗJ + λ·I` (Levenberg's original form)
    Identity,
}

impl Display for DampingMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DampingMode::HessianDiagonal => write!(f, "λ·diag(JᵗJ)"),
            DampingMode::Identity => write!(f, "λ·I"),
        }
    }
}

/// Default lower clamp for `diag(JᵗJ)` in [`DampingMode::HessianDiagonal`]
pub const DEFAULT_MIN_DIAGONAL: f64 = 1e-6;

/// Default upper clamp for `diag(JᵗJ)` in [`DampingMode::HessianDiagonal`]
pub const DEFAULT_MAX_DIAGONAL: f64 = 1e32;

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Residual and Jacobian disagree on their row count
    #[error("Dimension mismatch: residual has {residual_rows} rows, Jacobian has {jacobian_rows}")]
    DimensionMismatch {
        residual_rows: usize,
        jacobian_rows: usize,
    },
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from `faer`
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed("Symbolic Cholesky failed".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Trait for sparse linear solvers of the least squares normal equations.
///
/// Both methods return the step `h = -A⁻¹·g` with `g = Jᵗr`, so the caller
/// applies it additively: `x_new = x + h`.
pub trait SparseLinearSolver: Send {
    /// Solve the normal equation: (JᵗJ)·h = -Jᵗr
    ///
    /// # Errors
    /// Returns `LinAlgError` if the factorization fails or the matrix is singular.
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve the augmented equation: (JᵗJ + λ·D)·h = -Jᵗr
    ///
    /// `D` is selected by `mode`. With [`DampingMode::HessianDiagonal`] the
    /// entries of `diag(JᵗJ)` are clamped to the solver's diagonal bounds, so a
    /// parameter the Jacobian does not observe at this point still gets a
    /// positive damping term.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
        mode: DampingMode,
    ) -> LinAlgResult<Mat<f64>>;

    /// Set the clamp range applied to `diag(JᵗJ)` in diagonal damping.
    fn set_diagonal_bounds(&mut self, min_diagonal: f64, max_diagonal: f64);

    /// Get the cached Hessian matrix (JᵗJ) from the last solve
    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>>;

    /// Get the cached gradient vector (Jᵗr) from the last solve
    fn get_gradient(&self) -> Option<&Mat<f64>>;

    /// Compute the covariance matrix `(JᵗJ)⁻¹` from the last factorization.
    ///
    /// Only meaningful after [`solve_normal_equation`](Self::solve_normal_equation);
    /// after an augmented solve the factorization includes the damping term.
    fn compute_covariance_matrix(&mut self) -> Option<&Mat<f64>>;

    /// Get the cached covariance matrix, if computed
    fn get_covariance_matrix(&self) -> Option<&Mat<f64>>;
}

/// Form `H = JᵗJ` and `g = Jᵗr`.
pub(crate) fn build_normal_equations(
    residuals: &Mat<f64>,
    jacobians: &SparseColMat<usize, f64>,
) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
    if residuals.nrows() != jacobians.nrows() {
        return Err(LinAlgError::DimensionMismatch {
            residual_rows: residuals.nrows(),
            jacobian_rows: jacobians.nrows(),
        }
        .log());
    }

    let jt = jacobians.as_ref().transpose();
    let hessian = jt
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobians.as_ref());

    let gradient = jacobians.as_ref().transpose().mul(residuals);

    Ok((hessian, gradient))
}

/// Diagonal of `JᵗJ`, i.e. the squared column norms of the Jacobian.
pub(crate) fn hessian_diagonal(jacobians: &SparseColMat<usize, f64>) -> Vec<f64> {
    let mut diagonal = vec![0.0; jacobians.ncols()];
    for t in jacobians.triplet_iter() {
        diagonal[t.col] += t.val * t.val;
    }
    diagonal
}

/// `d` clamped to `[min_diagonal, max_diagonal]`.
///
/// NaN stays NaN so the caller can report it.
pub(crate) fn clamp_diagonal(d: f64, min_diagonal: f64, max_diagonal: f64) -> f64 {
    if d.is_nan() {
        d
    } else {
        d.max(min_diagonal).min(max_diagonal)
    }
}

/// Build the damping term `λ·D` added to `JᵗJ`.
pub(crate) fn damping_matrix(
    jacobians: &SparseColMat<usize, f64>,
    lambda: f64,
    mode: DampingMode,
    min_diagonal: f64,
    max_diagonal: f64,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let n = jacobians.ncols();
    let triplets = match mode {
        DampingMode::Identity => (0..n).map(|i| Triplet::new(i, i, lambda)).collect::<Vec<_>>(),
        DampingMode::HessianDiagonal => {
            let diagonal: Vec<f64> = hessian_diagonal(jacobians)
                .into_iter()
                .map(|d| clamp_diagonal(d, min_diagonal, max_diagonal))
                .collect();
            if diagonal.iter().any(|d| !d.is_finite() || *d <= 0.0) {
                return Err(LinAlgError::SingularMatrix);
            }
            diagonal
                .iter()
                .enumerate()
                .map(|(i, d)| Triplet::new(i, i, lambda * d))
                .collect::<Vec<_>>()
        }
    };

    SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create damping matrix".to_string())
            .log_with_source(e)
    })
}

/// Reject solutions containing NaN or Inf; some factorizations of a
/// numerically singular matrix succeed and only poison the result.
pub(crate) fn ensure_finite(step: Mat<f64>) -> LinAlgResult<Mat<f64>> {
    for i in 0..step.nrows() {
        for j in 0..step.ncols() {
            if !step[(i, j)].is_finite() {
                return Err(LinAlgError::SingularMatrix);
            }
        }
    }
    Ok(step)
}

/// Convert a dense Jacobian into a sparse matrix.
///
/// Every entry is stored, including exact zeros, so the sparsity pattern is
/// identical from one iteration to the next and cached symbolic factorizations
/// stay valid.
pub fn dense_to_sparse(matrix: &DMatrix<f64>) -> LinAlgResult<SparseColMat<usize, f64>> {
    let (rows, cols) = matrix.shape();
    let mut triplets = Vec::with_capacity(rows * cols);
    for c in 0..cols {
        for r in 0..rows {
            triplets.push(Triplet::new(r, c, matrix[(r, c)]));
        }
    }
    SparseColMat::try_new_from_triplets(rows, cols, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to convert dense Jacobian".to_string())
            .log_with_source(e)
    })
}

/// Convert a `nalgebra` vector into an n×1 `faer` matrix.
pub fn to_faer_column(vector: &DVector<f64>) -> Mat<f64> {
    Mat::from_fn(vector.len(), 1, |i, _| vector[i])
}

/// Convert the first column of a `faer` matrix into a `nalgebra` vector.
pub fn to_dvector(column: &Mat<f64>) -> DVector<f64> {
    DVector::from_fn(column.nrows(), |i, _| column[(i, 0)])
}

/// Convert a `faer` dense matrix into a `nalgebra` matrix.
pub fn to_dmatrix(matrix: &Mat<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |r, c| matrix[(r, c)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_dense_to_sparse_keeps_zero_entries() -> TestResult {
        let dense = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 2.0]);
        let sparse = dense_to_sparse(&dense)?;
        assert_eq!(sparse.nrows(), 2);
        assert_eq!(sparse.ncols(), 2);
        assert_eq!(sparse.triplet_iter().count(), 4);
        Ok(())
    }

    #[test]
    fn test_vector_conversions() {
        let v = dvector![1.0, -2.0, 3.5];
        let column = to_faer_column(&v);
        assert_eq!(column.nrows(), 3);
        assert_eq!(column.ncols(), 1);
        assert_eq!(to_dvector(&column), v);
    }

    #[test]
    fn test_normal_equations() -> TestResult {
        // J = [[1, 2], [0, 1], [1, 0]], r = [1, 1, 1]
        let jacobian =
            dense_to_sparse(&DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 0.0, 1.0, 1.0, 0.0]))?;
        let residuals = to_faer_column(&dvector![1.0, 1.0, 1.0]);

        let (hessian, gradient) = build_normal_equations(&residuals, &jacobian)?;
        assert_eq!(hessian.nrows(), 2);
        assert_eq!(hessian.ncols(), 2);
        assert!((gradient[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((gradient[(1, 0)] - 3.0).abs() < 1e-12);
        assert_eq!(hessian_diagonal(&jacobian), vec![2.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_row_count_mismatch() -> TestResult {
        let jacobian = dense_to_sparse(&DMatrix::identity(2, 2))?;
        let residuals = to_faer_column(&dvector![1.0, 2.0, 3.0]);
        let result = build_normal_equations(&residuals, &jacobian);
        assert!(matches!(
            result,
            Err(LinAlgError::DimensionMismatch {
                residual_rows: 3,
                jacobian_rows: 2
            })
        ));
        Ok(())
    }

    #[test]
    fn test_diagonal_damping_clamps_unobserved_parameter() -> TestResult {
        // Second column is identically zero
        let jacobian = dense_to_sparse(&DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 0.0]))?;

        let damping = damping_matrix(
            &jacobian,
            1e-3,
            DampingMode::HessianDiagonal,
            DEFAULT_MIN_DIAGONAL,
            DEFAULT_MAX_DIAGONAL,
        )?;
        let entries: Vec<_> = damping.triplet_iter().map(|t| (t.row, t.col, *t.val)).collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&(0, 0, 1e-3 * 2.0)));
        assert!(entries.contains(&(1, 1, 1e-3 * DEFAULT_MIN_DIAGONAL)));
        Ok(())
    }

    #[test]
    fn test_diagonal_damping_clamps_from_above() -> TestResult {
        let jacobian = dense_to_sparse(&DMatrix::from_diagonal(&dvector![1e3, 1.0]))?;
        let damping = damping_matrix(&jacobian, 1.0, DampingMode::HessianDiagonal, 1e-6, 1e4)?;
        let entries: Vec<_> = damping.triplet_iter().map(|t| (t.row, t.col, *t.val)).collect();
        assert!(entries.contains(&(0, 0, 1e4)));
        assert!(entries.contains(&(1, 1, 1.0)));
        Ok(())
    }

    #[test]
    fn test_clamp_diagonal_keeps_nan() {
        assert_eq!(clamp_diagonal(0.0, 1e-6, 1e32), 1e-6);
        assert_eq!(clamp_diagonal(f64::INFINITY, 1e-6, 1e32), 1e32);
        assert!(clamp_diagonal(f64::NAN, 1e-6, 1e32).is_nan());
    }

    #[test]
    fn test_ensure_finite() {
        let good = Mat::from_fn(2, 1, |i, _| i as f64);
        assert!(ensure_finite(good).is_ok());
        let bad = Mat::from_fn(2, 1, |i, _| if i == 1 { f64::NAN } else { 0.0 });
        assert!(matches!(ensure_finite(bad), Err(LinAlgError::SingularMatrix)));
    }

    #[test]
    fn test_solver_type_display() {
        assert_eq!(LinearSolverType::SparseCholesky.to_string(), "Sparse Cholesky");
        assert_eq!(LinearSolverType::SparseQR.to_string(), "Sparse QR");
    }
}
