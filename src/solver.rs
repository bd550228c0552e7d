//! Newton iteration over the assembled finite element system.
use crate::error::AssemblyError;
use log::{debug, warn};
use multifem_optimize::newton::{newton_line_search, BacktrackingLineSearch, NewtonError, NewtonSettings, NoLineSearch};
use multifem_optimize::system::{NonlinearSystem, SystemError};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globalization applied to each Newton correction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LineSearchKind {
    /// Full Newton steps.
    #[default]
    None,
    /// Armijo backtracking on `|R|^2 / 2`.
    Backtracking,
}

/// Why a Newton iteration was abandoned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DivergenceReason {
    MaxIterationsExceeded,
    /// A residual, Jacobian or material output was NaN or infinite.
    NumericalDivergence,
    LinearSolverFailure,
    LineSearchFailure,
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            DivergenceReason::MaxIterationsExceeded => "maximum number of iterations exceeded",
            DivergenceReason::NumericalDivergence => "numerical divergence",
            DivergenceReason::LinearSolverFailure => "linear solver failure",
            DivergenceReason::LineSearchFailure => "line search failure",
        };
        f.write_str(description)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NonlinearOutcome {
    Converged { iterations: usize, residual_norm: f64 },
    Diverged(DivergenceReason),
}

impl NonlinearOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, NonlinearOutcome::Converged { .. })
    }

    pub fn iterations(&self) -> Option<usize> {
        match self {
            NonlinearOutcome::Converged { iterations, .. } => Some(*iterations),
            NonlinearOutcome::Diverged(_) => None,
        }
    }
}

/// Drives a [`NonlinearSystem`] to convergence and classifies failures.
///
/// Numerical failures, including recoverable assembly errors, are reported as
/// [`NonlinearOutcome::Diverged`] so that the caller may retry with a smaller step. Assembly
/// errors that indicate a wrongly configured model are returned as `Err`.
#[derive(Debug, Clone, Default)]
pub struct NonlinearSolver {
    settings: NewtonSettings<f64>,
    line_search: LineSearchKind,
}

impl NonlinearSolver {
    pub fn new(settings: NewtonSettings<f64>) -> Self {
        Self {
            settings,
            line_search: LineSearchKind::None,
        }
    }

    pub fn with_line_search(mut self, line_search: LineSearchKind) -> Self {
        self.line_search = line_search;
        self
    }

    pub fn settings(&self) -> &NewtonSettings<f64> {
        &self.settings
    }

    /// Solves `system` starting from the trial state `u`, which holds the last iterate on return.
    pub fn solve<S>(&self, system: S, u: &mut DVector<f64>) -> Result<NonlinearOutcome, AssemblyError>
    where
        S: NonlinearSystem<f64>,
    {
        let n = u.len();
        let mut f = DVector::zeros(n);
        let mut dx = DVector::zeros(n);

        let result = match self.line_search {
            LineSearchKind::None => {
                newton_line_search(system, &mut *u, &mut f, &mut dx, &self.settings, &mut NoLineSearch)
            }
            LineSearchKind::Backtracking => newton_line_search(
                system,
                &mut *u,
                &mut f,
                &mut dx,
                &self.settings,
                &mut BacktrackingLineSearch::default(),
            ),
        };

        match result {
            Ok(result) => {
                debug!(
                    "Newton converged after {} iterations ({:?}): |R| = {:e}, |R0| = {:e}",
                    result.iterations, result.criterion, result.residual_norm, result.initial_residual_norm
                );
                Ok(NonlinearOutcome::Converged {
                    iterations: result.iterations,
                    residual_norm: result.residual_norm,
                })
            }
            Err(err) => {
                let reason = match err {
                    NewtonError::MaximumIterationsReached(_) => DivergenceReason::MaxIterationsExceeded,
                    NewtonError::NonFiniteResidual { .. } => DivergenceReason::NumericalDivergence,
                    NewtonError::ResidualError(err) => {
                        classify_system_error(err, DivergenceReason::NumericalDivergence)?
                    }
                    NewtonError::JacobianError(err) => {
                        warn!("Linear solve failed: {}", err);
                        DivergenceReason::LinearSolverFailure
                    }
                    NewtonError::LineSearchError(err) => {
                        classify_system_error(err, DivergenceReason::LineSearchFailure)?
                    }
                };
                debug!("Newton diverged: {}", reason);
                Ok(NonlinearOutcome::Diverged(reason))
            }
        }
    }
}

/// Separates recoverable failures of a system evaluation from configuration errors.
fn classify_system_error(err: SystemError, fallback: DivergenceReason) -> Result<DivergenceReason, AssemblyError> {
    match err.downcast::<AssemblyError>() {
        Ok(assembly_error) if assembly_error.is_recoverable() => {
            debug!("Recoverable assembly failure: {}", assembly_error);
            Ok(DivergenceReason::NumericalDivergence)
        }
        Ok(assembly_error) => Err(*assembly_error),
        Err(other) => {
            warn!("System evaluation failed: {}", other);
            Ok(fallback)
        }
    }
}
