//! Element kernels: the physics evaluated at a single quadrature point.
//!
//! A kernel receives interpolated field values, material outputs and the point's history slice
//! and *adds* its unscaled contribution to the element-local buffers. The assembler zeroes these
//! buffers for every quadrature point and scales the contribution by the quadrature weight
//! times the Jacobian determinant.
//!
//! Local degrees of freedom are ordered node-major: entry `n * nf + k` belongs to field `k` at
//! the `n`-th node of the element, with `nf = kernel.fields().len()`.
use crate::dof::{DofLayout, DofLayoutBuilder};
use crate::element::ShapeFunctionValues;
use crate::error::{DofError, KernelError};
use crate::material::MaterialOutputs;
use nalgebra::{DMatrix, DVector, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod cahn_hilliard;
mod diffusion;
mod mechanics;
mod phase_field_fracture;
mod plasticity;
mod poisson;

pub use cahn_hilliard::CahnHilliard;
pub use diffusion::Diffusion;
pub use mechanics::SmallStrainMechanics;
pub use phase_field_fracture::PhaseFieldFracture;
pub use plasticity::SmallStrainPlasticity;
pub use poisson::Poisson;

/// Names the physics evaluated on an element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicsTag(String);

impl PhysicsTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PhysicsTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PhysicsTag {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for PhysicsTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the assembler asks of a kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CalculationMode {
    Residual,
    Jacobian,
    ResidualAndJacobian,
    InitHistory,
    UpdateHistory,
    Project,
}

impl CalculationMode {
    pub fn computes_residual(self) -> bool {
        matches!(self, Self::Residual | Self::ResidualAndJacobian)
    }

    pub fn computes_jacobian(self) -> bool {
        matches!(self, Self::Jacobian | Self::ResidualAndJacobian)
    }

    pub fn is_history_mode(self) -> bool {
        matches!(self, Self::InitHistory | Self::UpdateHistory)
    }
}

/// Derivatives of the interpolated unknowns with respect to the nodal trial values.
///
/// `du` scales contributions that depend on the field itself, `dv` those that depend on its
/// time derivative (`1/dt` for backward Euler).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TimeIntegrationFactors {
    pub du: f64,
    pub dv: f64,
}

impl TimeIntegrationFactors {
    /// Factors of a steady problem: time derivatives do not depend on the unknowns.
    pub fn steady() -> Self {
        Self { du: 1.0, dv: 0.0 }
    }

    pub fn backward_euler(dt: f64) -> Self {
        Self { du: 1.0, dv: 1.0 / dt }
    }
}

/// Field values interpolated at a quadrature point, indexed like [`ElementKernel::fields`].
#[derive(Debug, Clone, Default)]
pub struct PointFields {
    pub coords: Point3<f64>,
    pub values: Vec<f64>,
    pub gradients: Vec<Vector3<f64>>,
    /// Time derivatives of the field values.
    pub rates: Vec<f64>,
}

impl PointFields {
    pub fn resize(&mut self, num_fields: usize) {
        self.coords = Point3::origin();
        self.values.clear();
        self.values.resize(num_fields, 0.0);
        self.gradients.clear();
        self.gradients.resize(num_fields, Vector3::zeros());
        self.rates.clear();
        self.rates.resize(num_fields, 0.0);
    }
}

/// Everything a kernel may read at a quadrature point.
#[derive(Debug, Clone, Copy)]
pub struct QuadraturePoint<'a> {
    pub dim: usize,
    pub time: f64,
    pub dt: f64,
    pub factors: TimeIntegrationFactors,
    /// Quadrature weight times the Jacobian determinant.
    pub weight: f64,
    pub shape: &'a ShapeFunctionValues,
    pub fields: &'a PointFields,
    pub material: &'a MaterialOutputs,
}

impl QuadraturePoint<'_> {
    pub fn node_count(&self) -> usize {
        self.shape.node_count()
    }
}

/// History of one quadrature point: the trial slice being written and the committed slice.
#[derive(Debug)]
pub struct PointHistory<'a> {
    pub current: &'a mut [f64],
    pub old: &'a [f64],
}

/// Per-point output buffers of a kernel.
#[derive(Debug, Clone)]
pub struct LocalBuffers {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    pub projection: Vec<f64>,
}

impl Default for LocalBuffers {
    fn default() -> Self {
        Self {
            residual: DVector::zeros(0),
            jacobian: DMatrix::zeros(0, 0),
            projection: Vec::new(),
        }
    }
}

impl LocalBuffers {
    /// Resizes to `num_dofs` local unknowns and `num_projections` projected quantities and
    /// zeroes all entries.
    pub fn reset(&mut self, num_dofs: usize, num_projections: usize) {
        self.residual.resize_vertically_mut(num_dofs, 0.0);
        self.residual.fill(0.0);
        self.jacobian.resize_mut(num_dofs, num_dofs, 0.0);
        self.jacobian.fill(0.0);
        self.projection.clear();
        self.projection.resize(num_projections, 0.0);
    }

    pub fn is_finite(&self) -> bool {
        self.residual.iter().all(|x| x.is_finite())
            && self.jacobian.iter().all(|x| x.is_finite())
            && self.projection.iter().all(|x| x.is_finite())
    }
}

/// The physics of one element type.
pub trait ElementKernel: Send + Sync {
    /// Human-readable name used in diagnostics.
    fn name(&self) -> &str;

    /// Names of the fields this kernel couples, in local order.
    fn fields(&self) -> &[&'static str];

    fn supports_dimension(&self, dim: usize) -> bool;

    /// Number of history scalars stored per quadrature point.
    fn history_len(&self) -> usize {
        0
    }

    /// Names of the quantities written by [`CalculationMode::Project`].
    fn projection_names(&self) -> &[&'static str] {
        &[]
    }

    fn compute(
        &self,
        mode: CalculationMode,
        point: &QuadraturePoint,
        history: PointHistory,
        local: &mut LocalBuffers,
    ) -> Result<(), KernelError>;

    fn check_dimension(&self, dim: usize) -> Result<(), KernelError> {
        if self.supports_dimension(dim) {
            Ok(())
        } else {
            Err(KernelError::UnsupportedDimension {
                physics: self.name().to_string(),
                dim,
            })
        }
    }

    fn unsupported_mode(&self, mode: CalculationMode) -> KernelError {
        KernelError::UnsupportedCalculationMode {
            physics: self.name().to_string(),
            mode,
        }
    }
}

/// Lookup table from physics tag to kernel.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: BTreeMap<PhysicsTag, Box<dyn ElementKernel>>,
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.kernels.iter().map(|(tag, kernel)| (tag, kernel.name())))
            .finish()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel(mut self, physics: impl Into<PhysicsTag>, kernel: impl ElementKernel + 'static) -> Self {
        self.register(physics, kernel);
        self
    }

    /// Registers a kernel, returning the kernel previously registered under the same tag.
    pub fn register(
        &mut self,
        physics: impl Into<PhysicsTag>,
        kernel: impl ElementKernel + 'static,
    ) -> Option<Box<dyn ElementKernel>> {
        self.kernels.insert(physics.into(), Box::new(kernel))
    }

    pub fn get(&self, physics: &PhysicsTag) -> Option<&dyn ElementKernel> {
        self.kernels.get(physics).map(|kernel| kernel.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PhysicsTag, &dyn ElementKernel)> {
        self.kernels.iter().map(|(tag, kernel)| (tag, kernel.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Declares fields in order of first appearance, visiting kernels in tag order.
    pub fn dof_layout(&self) -> Result<DofLayout, DofError> {
        let mut fields: Vec<&str> = Vec::new();
        for kernel in self.kernels.values() {
            for &field in kernel.fields() {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
        }
        self.dof_layout_with_field_order(&fields)
    }

    /// Declares the given fields per node and the fields of every registered kernel.
    pub fn dof_layout_with_field_order(&self, fields: &[&str]) -> Result<DofLayout, DofError> {
        self.kernels
            .iter()
            .try_fold(DofLayoutBuilder::new(fields), |builder, (tag, kernel)| {
                builder.with_physics(tag.clone(), kernel.fields())
            })
            .map(DofLayoutBuilder::build)
    }
}
