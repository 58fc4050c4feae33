use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};

use crate::linalg::{
    DEFAULT_MAX_DIAGONAL, DEFAULT_MIN_DIAGONAL, DampingMode, LinAlgError, LinAlgResult,
    SparseLinearSolver, build_normal_equations, damping_matrix, ensure_finite,
};

/// Sparse LLᵗ solver for the (damped) normal equations.
///
/// The symbolic factorization is computed on the first solve and reused for
/// every later solve; adding a diagonal damping term never changes the pattern.
#[derive(Debug, Clone)]
pub struct SparseCholeskySolver {
    factorizer: Option<Llt<usize, f64>>,

    symbolic_factorization: Option<SymbolicLlt<usize>>,

    /// `JᵗJ` from the last solve
    hessian: Option<SparseColMat<usize, f64>>,

    /// `Jᵗr` from the last solve
    gradient: Option<Mat<f64>>,

    /// `(JᵗJ)⁻¹`, `None` until requested
    covariance_matrix: Option<Mat<f64>>,

    /// Clamp range for `diag(JᵗJ)` in diagonal damping
    min_diagonal: f64,
    max_diagonal: f64,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver {
            factorizer: None,
            symbolic_factorization: None,
            hessian: None,
            gradient: None,
            covariance_matrix: None,
            min_diagonal: DEFAULT_MIN_DIAGONAL,
            max_diagonal: DEFAULT_MAX_DIAGONAL,
        }
    }

    fn symbolic(&mut self, matrix: &SparseColMat<usize, f64>) -> LinAlgResult<SymbolicLlt<usize>> {
        if let Some(ref cached_sym) = self.symbolic_factorization {
            // SymbolicLlt is reference counted, clone is O(1)
            return Ok(cached_sym.clone());
        }
        let new_sym = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some(new_sym.clone());
        Ok(new_sym)
    }

    fn factorize_and_solve(
        &mut self,
        system: &SparseColMat<usize, f64>,
        hessian: SparseColMat<usize, f64>,
        gradient: Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let sym = self.symbolic(system)?;

        // A non positive-definite system is the expected failure when the
        // Jacobian is rank deficient; the optimizer retries with more damping.
        let cholesky = Llt::try_new_with_symbolic(sym, system.as_ref(), Side::Lower)
            .map_err(|_| LinAlgError::SingularMatrix)?;

        let dx = cholesky.solve(-&gradient);
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        self.factorizer = Some(cholesky);
        self.covariance_matrix = None;

        ensure_finite(dx)
    }
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = build_normal_equations(residuals, jacobians)?;
        let system = hessian.clone();
        self.factorize_and_solve(&system, hessian, gradient)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
        mode: DampingMode,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = build_normal_equations(residuals, jacobians)?;
        let damping = damping_matrix(
            jacobians,
            lambda,
            mode,
            self.min_diagonal,
            self.max_diagonal,
        )?;
        let augmented_hessian = &hessian + damping;
        self.factorize_and_solve(&augmented_hessian, hessian, gradient)
    }

    fn set_diagonal_bounds(&mut self, min_diagonal: f64, max_diagonal: f64) {
        self.min_diagonal = min_diagonal;
        self.max_diagonal = max_diagonal;
    }

    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }

    fn compute_covariance_matrix(&mut self) -> Option<&Mat<f64>> {
        if self.covariance_matrix.is_none()
            && let (Some(factorizer), Some(hessian)) = (&self.factorizer, &self.hessian)
        {
            let n = hessian.ncols();
            let identity = Mat::identity(n, n);
            // Solve H * X = I
            let cov_matrix = factorizer.solve(&identity);
            self.covariance_matrix = Some(cov_matrix);
        }
        self.covariance_matrix.as_ref()
    }

    fn get_covariance_matrix(&self) -> Option<&Mat<f64>> {
        self.covariance_matrix.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{dense_to_sparse, to_faer_column};
    use nalgebra::{DMatrix, dvector};

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Overdetermined 4×3 calibration-like system
    fn create_test_data() -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
        let jacobian = dense_to_sparse(&DMatrix::from_row_slice(
            4,
            3,
            &[
                2.0, 1.0, 0.0, //
                1.0, 3.0, 1.0, //
                0.0, 1.0, 2.0, //
                1.5, 0.0, 0.5,
            ],
        ))?;
        let residuals = to_faer_column(&dvector![1.0, -2.0, 0.5, 1.2]);
        Ok((jacobian, residuals))
    }

    #[test]
    fn test_solver_creation() {
        let solver = SparseCholeskySolver::new();
        assert!(solver.factorizer.is_none());
        assert!(SparseCholeskySolver::default().hessian.is_none());
    }

    #[test]
    fn test_identity_system_solution() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let jacobian = dense_to_sparse(&DMatrix::identity(3, 3))?;
        let residuals = to_faer_column(&dvector![-1.0, -2.0, -3.0]);

        let solution = solver.solve_normal_equation(&residuals, &jacobian)?;
        // H = I, g = r, h = -g
        for i in 0..3 {
            assert!((solution[(i, 0)] - (i + 1) as f64).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_symbolic_pattern_caching() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let sol1 = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert!(solver.symbolic_factorization.is_some());
        let sol2 = solver.solve_normal_equation(&residuals, &jacobian)?;

        for i in 0..sol1.nrows() {
            assert!((sol1[(i, 0)] - sol2[(i, 0)]).abs() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_diagonal_damping_shrinks_step() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        let undamped = solver.solve_normal_equation(&residuals, &jacobian)?;
        let damped = solver.solve_augmented_equation(
            &residuals,
            &jacobian,
            10.0,
            DampingMode::HessianDiagonal,
        )?;

        assert!(damped.norm_l2() < undamped.norm_l2());
        Ok(())
    }

    #[test]
    fn test_diagonal_damping_scales_uniformly_for_orthogonal_columns() -> TestResult {
        // With JᵗJ diagonal, (JᵗJ + λ·diag(JᵗJ)) = (1 + λ)·JᵗJ
        let mut solver = SparseCholeskySolver::new();
        let jacobian = dense_to_sparse(&DMatrix::from_diagonal(&dvector![2.0, 100.0]))?;
        let residuals = to_faer_column(&dvector![4.0, 100.0]);
        let lambda = 1.0;

        let step = solver.solve_augmented_equation(
            &residuals,
            &jacobian,
            lambda,
            DampingMode::HessianDiagonal,
        )?;
        assert!((step[(0, 0)] - (-2.0 / (1.0 + lambda))).abs() < TOLERANCE);
        assert!((step[(1, 0)] - (-1.0 / (1.0 + lambda))).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_singular_matrix() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        // Second row is twice the first
        let singular_jacobian =
            dense_to_sparse(&DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]))?;
        let residuals = to_faer_column(&dvector![0.0, 1.0]);

        let result = solver.solve_normal_equation(&residuals, &singular_jacobian);
        assert!(result.is_err(), "Singular matrix should return Err");
        Ok(())
    }

    #[test]
    fn test_zero_jacobian_gives_zero_step_in_both_damping_modes() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let jacobian = dense_to_sparse(&DMatrix::zeros(2, 2))?;
        let residuals = to_faer_column(&dvector![1.0, 1.0]);

        // The clamped diagonal keeps λ·D positive definite
        let diagonal = solver.solve_augmented_equation(
            &residuals,
            &jacobian,
            1e-3,
            DampingMode::HessianDiagonal,
        )?;
        assert!(diagonal.norm_l2() < TOLERANCE);

        let identity =
            solver.solve_augmented_equation(&residuals, &jacobian, 1e-3, DampingMode::Identity)?;
        assert!(identity.norm_l2() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_unclamped_zero_diagonal_is_singular() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        solver.set_diagonal_bounds(0.0, f64::MAX);
        let jacobian = dense_to_sparse(&DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 2.0, 0.0]))?;
        let residuals = to_faer_column(&dvector![1.0, 1.0]);

        let result = solver.solve_augmented_equation(
            &residuals,
            &jacobian,
            1e-3,
            DampingMode::HessianDiagonal,
        );
        assert!(matches!(result, Err(LinAlgError::SingularMatrix)));
        Ok(())
    }

    #[test]
    fn test_covariance_positive_definite() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let jacobian = dense_to_sparse(&DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 1.0, 2.0]))?;
        let residuals = to_faer_column(&dvector![1.0, 2.0]);

        solver.solve_normal_equation(&residuals, &jacobian)?;
        let cov = solver
            .compute_covariance_matrix()
            .ok_or("covariance not computed")?;

        // H = [[10, 5], [5, 5]], H⁻¹ = [[0.2, -0.2], [-0.2, 0.4]]
        assert!((cov[(0, 0)] - 0.2).abs() < TOLERANCE);
        assert!((cov[(1, 1)] - 0.4).abs() < TOLERANCE);
        assert!((cov[(0, 1)] + 0.2).abs() < TOLERANCE);
        assert!((cov[(1, 0)] + 0.2).abs() < TOLERANCE);
        assert!(solver.get_covariance_matrix().is_some());
        Ok(())
    }

    #[test]
    fn test_new_solve_clears_covariance() -> TestResult {
        let mut solver = SparseCholeskySolver::new();
        let (jacobian, residuals) = create_test_data()?;

        solver.solve_normal_equation(&residuals, &jacobian)?;
        solver.compute_covariance_matrix();
        assert!(solver.get_covariance_matrix().is_some());

        solver.solve_augmented_equation(&residuals, &jacobian, 0.1, DampingMode::Identity)?;
        assert!(solver.get_covariance_matrix().is_none());
        Ok(())
    }
}
