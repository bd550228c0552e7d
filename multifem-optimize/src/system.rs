use nalgebra::{DVectorView, DVectorViewMut, Scalar};
use std::error::Error;

/// Error type produced by implementors of [`NonlinearSystem`].
pub type SystemError = Box<dyn Error + Send + Sync>;

/// A square nonlinear system `F(x) = 0` with a Jacobian that can be factored on demand.
pub trait NonlinearSystem<T>
where
    T: Scalar,
{
    fn dimension(&self) -> usize;

    /// Evaluates `F(x)` into `f`.
    fn eval_residual(&mut self, f: &mut DVectorViewMut<T>, x: &DVectorView<T>) -> Result<(), SystemError>;

    /// Evaluates `F(x)` into `f` and prepares the Jacobian at `x` for a subsequent call to
    /// [`solve_jacobian_system`](Self::solve_jacobian_system).
    ///
    /// The default implementation only evaluates the residual, which is sufficient for systems
    /// that compute their Jacobian lazily when solving.
    fn eval_residual_and_jacobian(&mut self, f: &mut DVectorViewMut<T>, x: &DVectorView<T>) -> Result<(), SystemError> {
        self.eval_residual(f, x)
    }

    /// Solves `J sol = rhs` with the Jacobian prepared by the last call to
    /// [`eval_residual_and_jacobian`](Self::eval_residual_and_jacobian).
    fn solve_jacobian_system(&mut self, sol: &mut DVectorViewMut<T>, rhs: &DVectorView<T>) -> Result<(), SystemError>;
}

impl<T, X> NonlinearSystem<T> for &mut X
where
    T: Scalar,
    X: NonlinearSystem<T>,
{
    fn dimension(&self) -> usize {
        X::dimension(self)
    }

    fn eval_residual(&mut self, f: &mut DVectorViewMut<T>, x: &DVectorView<T>) -> Result<(), SystemError> {
        X::eval_residual(self, f, x)
    }

    fn eval_residual_and_jacobian(&mut self, f: &mut DVectorViewMut<T>, x: &DVectorView<T>) -> Result<(), SystemError> {
        X::eval_residual_and_jacobian(self, f, x)
    }

    fn solve_jacobian_system(&mut self, sol: &mut DVectorViewMut<T>, rhs: &DVectorView<T>) -> Result<(), SystemError> {
        X::solve_jacobian_system(self, sol, rhs)
    }
}

/// Builds a [`NonlinearSystem`] from closures.
///
/// ```
/// use multifem_optimize::system::{NonlinearSystem, NonlinearSystemBuilder};
/// use nalgebra::{DVectorView, DVectorViewMut};
///
/// // F(x) = x - 5, J = 1
/// let system = NonlinearSystemBuilder::with_dimension(1)
///     .with_residual(|f: &mut DVectorViewMut<f64>, x: &DVectorView<f64>| {
///         f[0] = x[0] - 5.0;
///         Ok(())
///     })
///     .with_jacobian_solver(|sol: &mut DVectorViewMut<f64>, rhs: &DVectorView<f64>| {
///         sol.copy_from(rhs);
///         Ok(())
///     });
/// assert_eq!(system.dimension(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct NonlinearSystemBuilder {
    dimension: usize,
}

#[derive(Debug, Clone)]
pub struct ConcreteNonlinearSystem<F, J> {
    dimension: usize,
    residual: F,
    jacobian_solver: J,
}

impl NonlinearSystemBuilder {
    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn with_residual<F, T>(self, residual: F) -> ConcreteNonlinearSystem<F, ()>
    where
        T: Scalar,
        F: FnMut(&mut DVectorViewMut<T>, &DVectorView<T>) -> Result<(), SystemError>,
    {
        ConcreteNonlinearSystem {
            dimension: self.dimension,
            residual,
            jacobian_solver: (),
        }
    }
}

impl<F> ConcreteNonlinearSystem<F, ()> {
    pub fn with_jacobian_solver<J, T>(self, jacobian_solver: J) -> ConcreteNonlinearSystem<F, J>
    where
        T: Scalar,
        J: FnMut(&mut DVectorViewMut<T>, &DVectorView<T>) -> Result<(), SystemError>,
    {
        ConcreteNonlinearSystem {
            dimension: self.dimension,
            residual: self.residual,
            jacobian_solver,
        }
    }
}

impl<F, J, T> NonlinearSystem<T> for ConcreteNonlinearSystem<F, J>
where
    T: Scalar,
    F: FnMut(&mut DVectorViewMut<T>, &DVectorView<T>) -> Result<(), SystemError>,
    J: FnMut(&mut DVectorViewMut<T>, &DVectorView<T>) -> Result<(), SystemError>,
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn eval_residual(&mut self, f: &mut DVectorViewMut<T>, x: &DVectorView<T>) -> Result<(), SystemError> {
        (self.residual)(f, x)
    }

    fn solve_jacobian_system(&mut self, sol: &mut DVectorViewMut<T>, rhs: &DVectorView<T>) -> Result<(), SystemError> {
        (self.jacobian_solver)(sol, rhs)
    }
}
