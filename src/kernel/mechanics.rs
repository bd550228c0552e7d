use crate::error::KernelError;
use crate::kernel::{CalculationMode, ElementKernel, LocalBuffers, PointHistory, QuadraturePoint};
use crate::material::Rank4;
use nalgebra::{Matrix3, Vector3};

pub(super) static DISPLACEMENT_FIELDS: [&str; 3] = ["ux", "uy", "uz"];

/// `sum_b A_ab g_b`
pub(super) fn contract(a: &Matrix3<f64>, g: &Vector3<f64>, dim: usize, row: usize) -> f64 {
    (0..dim).map(|b| a[(row, b)] * g[b]).sum()
}

/// `sum_{b, d} C_abcd g_b h_d`
pub(super) fn tangent_entry(c: &Rank4, g: &Vector3<f64>, h: &Vector3<f64>, dim: usize, a: usize, cc: usize) -> f64 {
    let mut sum = 0.0;
    for b in 0..dim {
        for d in 0..dim {
            sum += c[(3 * a + b, 3 * cc + d)] * g[b] * h[d];
        }
    }
    sum
}

/// Adds the weak form of `div(sigma) + f = 0` for the displacement block of a point.
pub(super) fn assemble_momentum(
    dim: usize,
    mode: CalculationMode,
    point: &QuadraturePoint,
    local: &mut LocalBuffers,
) -> Result<(), KernelError> {
    let n = point.shape.values();
    let grad_n = point.shape.gradients();
    let stress = point.material.rank2("stress")?;
    let body_force = point.material.vector("body_force").unwrap_or_else(|_| Vector3::zeros());
    for i in 0..point.node_count() {
        for a in 0..dim {
            let row = dim * i + a;
            if mode.computes_residual() {
                local.residual[row] += contract(stress, &grad_n[i], dim, a) - body_force[a] * n[i];
            }
            if mode.computes_jacobian() {
                let tangent = point.material.rank4("tangent")?;
                for j in 0..point.node_count() {
                    for c in 0..dim {
                        local.jacobian[(row, dim * j + c)] +=
                            tangent_entry(tangent, &grad_n[i], &grad_n[j], dim, a, c) * point.factors.du;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Quasi-static small-strain solid mechanics `div(sigma) + f = 0`.
///
/// Reads the material tensors `stress` and `tangent` and the optional vector `body_force`.
#[derive(Debug, Copy, Clone)]
pub struct SmallStrainMechanics {
    dim: usize,
}

impl SmallStrainMechanics {
    /// Fails with [`KernelError::UnsupportedDimension`] unless `dim` is 1, 2 or 3.
    pub fn new(dim: usize) -> Result<Self, KernelError> {
        if (1..=3).contains(&dim) {
            Ok(Self { dim })
        } else {
            Err(KernelError::UnsupportedDimension {
                physics: "mechanics".to_string(),
                dim,
            })
        }
    }
}

impl ElementKernel for SmallStrainMechanics {
    fn name(&self) -> &str {
        "mechanics"
    }

    fn fields(&self) -> &[&'static str] {
        &DISPLACEMENT_FIELDS[..self.dim]
    }

    fn supports_dimension(&self, dim: usize) -> bool {
        dim == self.dim
    }

    fn projection_names(&self) -> &[&'static str] {
        &["von_mises", "hydrostatic_stress"]
    }

    fn compute(
        &self,
        mode: CalculationMode,
        point: &QuadraturePoint,
        _history: PointHistory,
        local: &mut LocalBuffers,
    ) -> Result<(), KernelError> {
        self.check_dimension(point.dim)?;
        match mode {
            CalculationMode::Residual | CalculationMode::Jacobian | CalculationMode::ResidualAndJacobian => {
                assemble_momentum(self.dim, mode, point, local)
            }
            CalculationMode::Project => {
                local.projection[0] = point.material.scalar("von_mises")?;
                local.projection[1] = point.material.rank2("stress")?.trace() / 3.0;
                Ok(())
            }
            _ => Err(self.unsupported_mode(mode)),
        }
    }
}
