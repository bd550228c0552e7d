//! Solvers for the linearized systems `J du = rhs` arising in each Newton iteration.
use eyre::eyre;
use nalgebra::{DMatrix, DVectorView, DVectorViewMut};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};

pub trait LinearSolver: Send {
    /// Solves `matrix * solution = rhs`.
    fn solve(
        &mut self,
        matrix: &CsrMatrix<f64>,
        solution: &mut DVectorViewMut<f64>,
        rhs: &DVectorView<f64>,
    ) -> eyre::Result<()>;
}

/// LU factorization with partial pivoting of the densified matrix.
///
/// Handles the non-symmetric Jacobians of coupled problems; only suited for small systems.
#[derive(Debug, Clone, Default)]
pub struct DenseLuSolver;

impl LinearSolver for DenseLuSolver {
    fn solve(
        &mut self,
        matrix: &CsrMatrix<f64>,
        solution: &mut DVectorViewMut<f64>,
        rhs: &DVectorView<f64>,
    ) -> eyre::Result<()> {
        let dense = DMatrix::from(matrix);
        let x = dense
            .lu()
            .solve(rhs)
            .ok_or_else(|| eyre!("Failed to solve linear system: matrix is singular"))?;
        if x.iter().any(|x_i| !x_i.is_finite()) {
            return Err(eyre!("Failed to solve linear system: solution is not finite"));
        }
        solution.copy_from(&x);
        Ok(())
    }
}

/// Sparse Cholesky factorization, for symmetric positive definite Jacobians.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver;

impl LinearSolver for SparseCholeskySolver {
    fn solve(
        &mut self,
        matrix: &CsrMatrix<f64>,
        solution: &mut DVectorViewMut<f64>,
        rhs: &DVectorView<f64>,
    ) -> eyre::Result<()> {
        let cholesky = CscCholesky::factor(&CscMatrix::from(matrix))
            .map_err(|err| eyre!("Failed to solve linear system. Error: {}", err))?;
        // CscCholesky::solve only accepts dynamic matrices
        let b = DMatrix::from_iterator(rhs.len(), 1, rhs.iter().copied());
        let x = cholesky.solve(&b);
        if x.iter().any(|x_i| !x_i.is_finite()) {
            return Err(eyre!("Failed to solve linear system: solution is not finite"));
        }
        solution.copy_from(&x);
        Ok(())
    }
}

/// Selects a [`LinearSolver`] from settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinearSolverKind {
    #[default]
    DenseLu,
    SparseCholesky,
}

impl LinearSolverKind {
    pub fn build(self) -> Box<dyn LinearSolver> {
        match self {
            LinearSolverKind::DenseLu => Box::new(DenseLuSolver),
            LinearSolverKind::SparseCholesky => Box::new(SparseCholeskySolver),
        }
    }
}
