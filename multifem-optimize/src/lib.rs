//! Newton-type solvers for nonlinear systems of equations `F(x) = 0`.
//!
//! The crate is agnostic to where the residual comes from: anything that implements
//! [`NonlinearSystem`](system::NonlinearSystem) can be driven to convergence.
use nalgebra::RealField;

/// Nonlinear system abstraction and a closure-based builder.
pub mod system;
/// Implementations of the Newton method with different line search strategies
pub mod newton;

/// Scalar types supported by the solvers.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}
