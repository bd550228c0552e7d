//! Error types.
//!
//! Configuration errors ([`DofError`], [`KernelError`] and the configuration variants of
//! [`AssemblyError`]) abort a run. Numerical failures are reported through
//! [`AssemblyError::is_recoverable`] and handled by cutting back the time step.
use crate::kernel::{CalculationMode, PhysicsTag};
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DofError {
    /// An essential boundary condition references a region that the mesh does not have.
    InvalidBoundaryRegion { region: String },
    /// A field name is unknown, or not declared by any element touching the given region.
    InvalidFieldName { field: String, region: Option<String> },
    /// An element's physics tag has no field declaration.
    UnknownPhysics { element: usize, physics: PhysicsTag },
    /// A node carries no degree of freedom because no element touches it.
    UnassignedNode { node: usize },
    /// A natural boundary condition lists a number of fields that does not match its load.
    ComponentMismatch { fields: usize, components: usize },
}

impl Display for DofError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DofError::InvalidBoundaryRegion { region } => {
                write!(f, "boundary region \"{}\" does not exist in the mesh", region)
            }
            DofError::InvalidFieldName { field, region: Some(region) } => {
                write!(f, "field \"{}\" is not defined on any element touching region \"{}\"", field, region)
            }
            DofError::InvalidFieldName { field, region: None } => {
                write!(f, "unknown field \"{}\"", field)
            }
            DofError::UnknownPhysics { element, physics } => {
                write!(f, "element {} has physics \"{}\" without declared fields", element, physics)
            }
            DofError::UnassignedNode { node } => {
                write!(f, "node {} is not connected to any element", node)
            }
            DofError::ComponentMismatch { fields, components } => {
                write!(f, "boundary load with {} components applied to {} fields", components, fields)
            }
        }
    }
}

impl Error for DofError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    UnsupportedCalculationMode { physics: String, mode: CalculationMode },
    UnsupportedDimension { physics: String, dim: usize },
    /// The material evaluator did not provide an output the kernel requires.
    MissingMaterialProperty { name: String },
}

impl Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::UnsupportedCalculationMode { physics, mode } => {
                write!(f, "kernel \"{}\" does not support calculation mode {:?}", physics, mode)
            }
            KernelError::UnsupportedDimension { physics, dim } => {
                write!(f, "kernel \"{}\" does not support spatial dimension {}", physics, dim)
            }
            KernelError::MissingMaterialProperty { name } => {
                write!(f, "material property \"{}\" was not provided", name)
            }
        }
    }
}

impl Error for KernelError {}

#[derive(Debug)]
pub enum AssemblyError {
    Kernel { element: usize, error: KernelError },
    MissingKernel { element: usize, physics: PhysicsTag },
    Material { element: usize, report: eyre::Report },
    /// A material output or kernel contribution is NaN or infinite.
    Diverged { element: usize, quadrature_point: usize },
    DegenerateElement { element: usize, determinant: f64 },
    /// An element contribution has no slot in the global sparsity pattern.
    SparsityMismatch { row: usize, col: usize },
}

impl AssemblyError {
    /// Whether the failure is numerical and may disappear with a smaller time step.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AssemblyError::Diverged { .. } | AssemblyError::Material { .. })
    }
}

impl Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyError::Kernel { element, error } => write!(f, "kernel failure in element {}: {}", element, error),
            AssemblyError::MissingKernel { element, physics } => {
                write!(f, "no kernel registered for physics \"{}\" of element {}", physics, element)
            }
            AssemblyError::Material { element, report } => {
                write!(f, "material evaluation failed in element {}: {}", element, report)
            }
            AssemblyError::Diverged { element, quadrature_point } => write!(
                f,
                "assembly diverged: non-finite value in element {} at quadrature point {}",
                element, quadrature_point
            ),
            AssemblyError::DegenerateElement { element, determinant } => {
                write!(f, "element {} is degenerate (Jacobian determinant {})", element, determinant)
            }
            AssemblyError::SparsityMismatch { row, col } => {
                write!(f, "entry ({}, {}) is not part of the sparsity pattern", row, col)
            }
        }
    }
}

impl Error for AssemblyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AssemblyError::Kernel { error, .. } => Some(error),
            AssemblyError::Material { report, .. } => Some(&**report),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum StepError {
    /// The step size fell below the minimum while retrying a failed step.
    TimeStepTooSmall {
        dt: f64,
        dt_min: f64,
        last_committed_time: f64,
        last_committed_step: usize,
    },
    InvalidSettings(String),
    Dof(DofError),
    Assembly(AssemblyError),
    /// The output sink rejected a committed step.
    Output(eyre::Report),
}

impl StepError {
    /// Whether a failed commit may be retried with a smaller step.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StepError::Assembly(err) if err.is_recoverable())
    }
}

impl Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::TimeStepTooSmall {
                dt,
                dt_min,
                last_committed_time,
                last_committed_step,
            } => write!(
                f,
                "time step {} fell below the minimum {}; last committed step {} at t = {}",
                dt, dt_min, last_committed_step, last_committed_time
            ),
            StepError::InvalidSettings(message) => write!(f, "invalid settings: {}", message),
            StepError::Dof(err) => write!(f, "{}", err),
            StepError::Assembly(err) => write!(f, "{}", err),
            StepError::Output(report) => write!(f, "output failed: {}", report),
        }
    }
}

impl Error for StepError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StepError::Dof(err) => Some(err),
            StepError::Assembly(err) => Some(err),
            StepError::Output(report) => Some(&**report),
            _ => None,
        }
    }
}

impl From<DofError> for StepError {
    fn from(err: DofError) -> Self {
        StepError::Dof(err)
    }
}

impl From<AssemblyError> for StepError {
    fn from(err: AssemblyError) -> Self {
        StepError::Assembly(err)
    }
}
