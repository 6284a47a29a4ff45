//! Linear algebra helpers for robust covariance square roots.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!     pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!
//! Internal pipeline (each step isolated for testing):
//!     - symmetrize()
//!     - chol_sqrt()
//!     - chol_sqrt_with_jitter()
//!     - evd_symmetric_sqrt_with_floor()
//!
//! Strategy:
//! 1) Reject non-finite input
//! 2) Symmetrize P ← 0.5 (P + Pᵀ)
//! 3) Cholesky
//! 4) Jittered Cholesky (geometric ramp)
//! 5) Symmetric EVD with negative eigenvalues clipped to zero → S = U * sqrt(Λ⁺) * Uᵀ
//!
//! Learned process noise and sigma-point covariances are not positive definite by
//! construction, so step 5 is expected to run occasionally.

use crate::error::{FilterError, Result};

use log::warn;
use nalgebra::DMatrix;
use nalgebra::linalg::{Cholesky, SymmetricEigen};

/// Lower bound applied to eigenvalues in the EVD fallback
pub const EIGEN_FLOOR: f64 = 0.0;

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding L such that matrix = L * L^T). If Cholesky
/// fails, even with a small diagonal jitter, the square root is built from the symmetric
/// eigendecomposition with negative eigenvalues clipped to zero.
///
/// # Arguments
/// * `matrix` - The square matrix to factor. Small asymmetries are removed before factoring.
///
/// # Returns
/// * `Ok(S)` where `S` is lower triangular (Cholesky paths) or symmetric (EVD path).
/// * `Err(FilterError::ShapeMismatch)` if the matrix is not square.
/// * `Err(FilterError::NonPositiveSemiDefinite)` if the matrix holds non-finite entries, or the
///   clipped factor is itself non-finite.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if !matrix.is_square() {
        return Err(FilterError::shape(
            "matrix_square_root (columns)",
            matrix.nrows(),
            matrix.ncols(),
        ));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::NonPositiveSemiDefinite(
            "matrix contains non-finite entries".to_string(),
        ));
    }
    // Tunable guards (conservative defaults for double precision)
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-9;
    const MAX_TRIES: usize = 4;

    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return Ok(s);
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return Ok(s);
    }
    warn!(
        "Cholesky failed on {}x{} matrix, clipping negative eigenvalues",
        p.nrows(),
        p.ncols()
    );
    let s = evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR);
    if s.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::NonPositiveSemiDefinite(
            "eigenvalue clipping produced a non-finite factor".to_string(),
        ));
    }
    Ok(s)
}
/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}
/// Plain Cholesky square root, or None if the matrix is not positive definite.
fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}
/// Cholesky with diagonal jitter on a geometric ramp. Returns None if all tries fail.
fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    let n = p.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l().into_owned());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let lambdas = se.eigenvalues.map(|l| l.max(floor));
    let u = se.eigenvectors;
    let sigma_half = DMatrix::<f64>::from_diagonal(&lambdas.map(|l| l.sqrt()));
    &u * sigma_half * u.transpose()
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 6
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}
/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch.solve(b));
    }
    let n = a_sym.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut a_j = a_sym.clone();
        for i in 0..n {
            a_j[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(a_j) {
            return Some(ch.solve(b));
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

/// Robust SPD solve with sane defaults:
/// - Cholesky + jitter (preferred)
/// - Last resort: explicit inverse
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if !a.is_square() {
        return Err(FilterError::shape("robust_spd_solve (columns)", a.nrows(), a.ncols()));
    }
    if a.nrows() != b.nrows() {
        return Err(FilterError::shape("robust_spd_solve (rhs rows)", a.nrows(), b.nrows()));
    }
    if let Some(x) = chol_solve_spd(a, b, SolveOptions::default()) {
        Ok(x)
    } else if let Some(inv) = symmetrize(a).try_inverse() {
        Ok(&inv * b)
    } else {
        Err(FilterError::NonPositiveSemiDefinite(
            "innovation covariance is singular even after jitter".to_string(),
        ))
    }
}

/* =============================== Tests ==================================== */
