use crate::system::{NonlinearSystem, SystemError};
use crate::Real;
use itertools::iterate;
use log::debug;
use nalgebra::{DVectorView, DVectorViewMut, Scalar};
use numeric_literals::replace_float_literals;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Tolerances and limits for the Newton iteration.
///
/// The iteration has converged when one of
/// ```text
///   |F(x_k)| <= absolute_tolerance
///   |F(x_k)| <= relative_tolerance * |F(x_0)|
///   |x_k - x_{k-1}| <= step_tolerance
/// ```
/// holds.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NewtonSettings<T> {
    pub max_iterations: usize,
    pub absolute_tolerance: T,
    pub relative_tolerance: T,
    pub step_tolerance: T,
}

impl<T: Real> Default for NewtonSettings<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn default() -> Self {
        Self {
            max_iterations: 25,
            absolute_tolerance: 1e-8,
            relative_tolerance: 1e-10,
            step_tolerance: 1e-16,
        }
    }
}

/// The test that terminated a successful Newton iteration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConvergenceCriterion {
    AbsoluteResidual,
    RelativeResidual,
    StepSize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewtonResult<T>
where
    T: Scalar,
{
    /// Number of corrections applied to the initial guess.
    pub iterations: usize,
    pub initial_residual_norm: T,
    /// Norm of the last evaluated residual.
    pub residual_norm: T,
    pub criterion: ConvergenceCriterion,
}

#[derive(Debug)]
pub enum NewtonError {
    /// The procedure failed because the maximum number of iterations was reached.
    MaximumIterationsReached(usize),
    /// The residual norm is NaN or infinite.
    NonFiniteResidual { iteration: usize },
    /// The procedure failed because the residual could not be evaluated.
    ResidualError(SystemError),
    /// The procedure failed because solving the Jacobian system failed.
    JacobianError(SystemError),
    // The line search failed to produce a valid step direction.
    LineSearchError(SystemError),
}

impl Display for NewtonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            &NewtonError::MaximumIterationsReached(maxit) => {
                write!(f, "Failed to converge within maximum number of iterations ({}).", maxit)
            }
            &NewtonError::NonFiniteResidual { iteration } => {
                write!(f, "Residual norm is not finite at iteration {}.", iteration)
            }
            &NewtonError::ResidualError(ref err) => {
                write!(f, "Failed to evaluate residual. Error: {}", err)
            }
            &NewtonError::JacobianError(ref err) => {
                write!(f, "Failed to solve Jacobian system. Error: {}", err)
            }
            &NewtonError::LineSearchError(ref err) => {
                write!(f, "Line search failed to produce valid step direction. Error: {}", err)
            }
        }
    }
}

impl Error for NewtonError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NewtonError::ResidualError(err) | NewtonError::JacobianError(err) | NewtonError::LineSearchError(err) => {
                Some(err.as_ref())
            }
            _ => None,
        }
    }
}

/// Attempts to solve the non-linear equation F(u) = 0.
///
/// No heap allocation is performed. `x` holds the initial guess on entry and the last iterate
/// on exit, `f` and `dx` are workspace vectors of the same dimension.
///
/// If successful, the reported iteration count is the number of updates applied to `x`.
pub fn newton<'a, T, F>(
    system: F,
    x: impl Into<DVectorViewMut<'a, T>>,
    f: impl Into<DVectorViewMut<'a, T>>,
    dx: impl Into<DVectorViewMut<'a, T>>,
    settings: &NewtonSettings<T>,
) -> Result<NewtonResult<T>, NewtonError>
where
    T: Real,
    F: NonlinearSystem<T>,
{
    newton_line_search(system, x, f, dx, settings, &mut NoLineSearch {})
}

/// Same as `newton`, but allows specifying a line search.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn newton_line_search<'a, T, F>(
    mut system: F,
    x: impl Into<DVectorViewMut<'a, T>>,
    f: impl Into<DVectorViewMut<'a, T>>,
    dx: impl Into<DVectorViewMut<'a, T>>,
    settings: &NewtonSettings<T>,
    line_search: &mut impl LineSearch<T, F>,
) -> Result<NewtonResult<T>, NewtonError>
where
    T: Real,
    F: NonlinearSystem<T>,
{
    let mut x = x.into();
    let mut f = f.into();
    let mut minus_dx = dx.into();

    assert_eq!(x.nrows(), f.nrows());
    assert_eq!(minus_dx.nrows(), f.nrows());

    let mut iter = 0;
    let mut initial_residual_norm = 0.0;

    loop {
        system
            .eval_residual_and_jacobian(&mut f, &DVectorView::from(&x))
            .map_err(NewtonError::ResidualError)?;

        let residual_norm = f.norm();
        if !residual_norm.is_finite() {
            return Err(NewtonError::NonFiniteResidual { iteration: iter });
        }
        if iter == 0 {
            initial_residual_norm = residual_norm;
        }
        debug!("Newton iter {}: |R| = {}", iter, residual_norm);

        let criterion = if residual_norm <= settings.absolute_tolerance {
            Some(ConvergenceCriterion::AbsoluteResidual)
        } else if residual_norm <= settings.relative_tolerance * initial_residual_norm {
            Some(ConvergenceCriterion::RelativeResidual)
        } else {
            None
        };
        if let Some(criterion) = criterion {
            return Ok(NewtonResult {
                iterations: iter,
                initial_residual_norm,
                residual_norm,
                criterion,
            });
        }

        if iter == settings.max_iterations {
            return Err(NewtonError::MaximumIterationsReached(iter));
        }

        // Solve the system J dx = -f   <=>   J (-dx) = f
        system
            .solve_jacobian_system(&mut minus_dx, &DVectorView::from(&f))
            .map_err(NewtonError::JacobianError)?;

        // Flip sign to make it consistent with line search
        minus_dx *= -1.0;
        let dx = &minus_dx;

        let step_length = line_search
            .step(
                &mut system,
                DVectorViewMut::from(&mut f),
                DVectorViewMut::from(&mut x),
                DVectorView::from(dx),
            )
            .map_err(NewtonError::LineSearchError)?;
        iter += 1;

        let step_norm = step_length * dx.norm();
        debug!("Newton iter {}: step length {}, |dU| = {}", iter, step_length, step_norm);
        if step_norm <= settings.step_tolerance {
            return Ok(NewtonResult {
                iterations: iter,
                initial_residual_norm,
                residual_norm,
                criterion: ConvergenceCriterion::StepSize,
            });
        }
    }
}

pub trait LineSearch<T: Scalar, F: NonlinearSystem<T>> {
    /// Moves `x` along `direction` and returns the step length that was taken.
    ///
    /// `f` holds `F(x)` on entry and may be used as workspace.
    fn step(
        &mut self,
        system: &mut F,
        f: DVectorViewMut<T>,
        x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, SystemError>;
}

/// Trivial implementation of line search. Equivalent to a single, full Newton step.
#[derive(Clone, Debug)]
pub struct NoLineSearch;

impl<T, F> LineSearch<T, F> for NoLineSearch
where
    T: Real,
    F: NonlinearSystem<T>,
{
    fn step(
        &mut self,
        _system: &mut F,
        _f: DVectorViewMut<T>,
        mut x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, SystemError> {
        x.axpy(T::one(), &direction, T::one());
        Ok(T::one())
    }
}

/// Standard backtracking line search using the Armijo condition.
///
/// See Jorge & Nocedal (2006), Numerical Optimization, Chapter 3.1.
#[derive(Clone, Debug)]
pub struct BacktrackingLineSearch {
    /// Sufficient decrease parameter in `(0, 1)`.
    pub c: f64,
    pub alpha_min: f64,
}

impl Default for BacktrackingLineSearch {
    fn default() -> Self {
        Self {
            c: 1e-4,
            alpha_min: 1e-6,
        }
    }
}

impl<T, F> LineSearch<T, F> for BacktrackingLineSearch
where
    T: Real,
    F: NonlinearSystem<T>,
{
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn step(
        &mut self,
        system: &mut F,
        mut f: DVectorViewMut<T>,
        mut x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, SystemError> {
        // We seek to solve
        //  F(x) = 0
        // by minimizing
        //  g(x) = (1/2) || F(x) ||^2
        // and the sufficient decrease condition becomes
        //  g(x_k + alpha * p_k) <= (1 - c * alpha) * g(x_k)
        // where p_k is the Newton direction, for which grad F^T p_k ~= - F(x_k).
        let c = T::from_f64(self.c).unwrap();
        let alpha_min = T::from_f64(self.alpha_min).unwrap();

        let p = direction;
        let g_initial = 0.5 * f.magnitude_squared();

        // Start out with some alphas that don't decrease too quickly, then
        // start decreasing them much faster if the first few iterations don't let us
        // take a step.
        let initial_alphas = [0.0, 1.0, 0.75, 0.5];
        let mut alpha_iter = initial_alphas
            .iter()
            .copied()
            .chain(iterate(0.25, |alpha_i| 0.25 * *alpha_i));

        let mut alpha_prev = alpha_iter.next().unwrap_or(0.0);
        let mut alpha = alpha_iter.next().unwrap_or(1.0);

        loop {
            // x^{k + 1} = x^k + (alpha^k - alpha^{k - 1}) * p
            let delta_alpha = alpha - alpha_prev;
            x.axpy(delta_alpha, &p, T::one());
            system.eval_residual(&mut f, &DVectorView::from(&x))?;

            let g = 0.5 * f.magnitude_squared();
            if g <= (1.0 - c * alpha) * g_initial {
                break;
            } else if alpha < alpha_min {
                return Err(Box::from(format!(
                    "Failed to produce valid step direction. \
                    Alpha {} is smaller than minimum allowed alpha {}.",
                    alpha, alpha_min
                )));
            } else {
                alpha_prev = alpha;
                alpha = alpha_iter.next().unwrap_or(0.25 * alpha);
            }
        }

        Ok(alpha)
    }
}
