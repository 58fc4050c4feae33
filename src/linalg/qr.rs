use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Qr, SymbolicQr},
};

use crate::linalg::{
    DEFAULT_MAX_DIAGONAL, DEFAULT_MIN_DIAGONAL, DampingMode, LinAlgError, LinAlgResult,
    SparseLinearSolver, build_normal_equations, damping_matrix, ensure_finite,
};

/// Sparse QR solver for the (damped) normal equations.
///
/// Slower than [`SparseCholeskySolver`](crate::linalg::SparseCholeskySolver)
/// but does not require a positive definite system, which makes it the safer
/// choice for nearly rank deficient calibration problems. Singularity shows up
/// as non-finite entries in the solution and is reported as
/// [`LinAlgError::SingularMatrix`].
#[derive(Debug, Clone)]
pub struct SparseQRSolver {
    factorizer: Option<Qr<usize, f64>>,

    /// Reused across iterations; λ·D does not change the sparsity pattern.
    symbolic_factorization: Option<SymbolicQr<usize>>,

    hessian: Option<SparseColMat<usize, f64>>,

    gradient: Option<Mat<f64>>,

    covariance_matrix: Option<Mat<f64>>,

    /// Clamp range for `diag(JᵗJ)` in diagonal damping
    min_diagonal: f64,
    max_diagonal: f64,
}

impl SparseQRSolver {
    pub fn new() -> Self {
        SparseQRSolver {
            factorizer: None,
            symbolic_factorization: None,
            hessian: None,
            gradient: None,
            covariance_matrix: None,
            min_diagonal: DEFAULT_MIN_DIAGONAL,
            max_diagonal: DEFAULT_MAX_DIAGONAL,
        }
    }

    fn factorize_and_solve(
        &mut self,
        system: &SparseColMat<usize, f64>,
        hessian: SparseColMat<usize, f64>,
        gradient: Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let sym = if let Some(ref cached_sym) = self.symbolic_factorization {
            cached_sym.clone()
        } else {
            let new_sym = SymbolicQr::try_new(system.symbolic()).map_err(|e| {
                LinAlgError::FactorizationFailed("Symbolic QR decomposition failed".to_string())
                    .log_with_source(e)
            })?;
            self.symbolic_factorization = Some(new_sym.clone());
            new_sym
        };

        let qr = Qr::try_new_with_symbolic(sym, system.as_ref())
            .map_err(|_| LinAlgError::SingularMatrix)?;

        // Solve A * h = -g
        let dx = qr.solve(-&gradient);
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        self.factorizer = Some(qr);
        self.covariance_matrix = None;

        ensure_finite(dx)
    }
}

impl Default for SparseQRSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseQRSolver {
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
        let augmented_hessian = hessian.as_ref() + damping;
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
            let cov_matrix = factorizer.solve(&identity);
            if ensure_finite(cov_matrix.clone()).is_ok() {
                self.covariance_matrix = Some(cov_matrix);
            }
        }
        self.covariance_matrix.as_ref()
    }

    fn get_covariance_matrix(&self) -> Option<&Mat<f64>> {
        self.covariance_matrix.as_ref()
    }
}
