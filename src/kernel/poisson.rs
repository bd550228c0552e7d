use crate::error::KernelError;
use crate::kernel::{CalculationMode, ElementKernel, LocalBuffers, PointHistory, QuadraturePoint};

/// Steady Poisson equation `-div(grad u) = f` with the source `f` read from the material
/// scalar `source` (zero if absent).
#[derive(Debug, Copy, Clone, Default)]
pub struct Poisson;

impl ElementKernel for Poisson {
    fn name(&self) -> &str {
        "poisson"
    }

    fn fields(&self) -> &[&'static str] {
        &["u"]
    }

    fn supports_dimension(&self, dim: usize) -> bool {
        (1..=3).contains(&dim)
    }

    fn projection_names(&self) -> &[&'static str] {
        &["flux_x", "flux_y", "flux_z"]
    }

    fn compute(
        &self,
        mode: CalculationMode,
        point: &QuadraturePoint,
        _history: PointHistory,
        local: &mut LocalBuffers,
    ) -> Result<(), KernelError> {
        self.check_dimension(point.dim)?;
        let n = point.shape.values();
        let grad_n = point.shape.gradients();
        let grad_u = point.fields.gradients[0];

        match mode {
            CalculationMode::Residual | CalculationMode::Jacobian | CalculationMode::ResidualAndJacobian => {
                let source = point.material.scalar_or("source", 0.0);
                for i in 0..point.node_count() {
                    if mode.computes_residual() {
                        local.residual[i] += grad_u.dot(&grad_n[i]) - source * n[i];
                    }
                    if mode.computes_jacobian() {
                        for j in 0..point.node_count() {
                            local.jacobian[(i, j)] += grad_n[j].dot(&grad_n[i]) * point.factors.du;
                        }
                    }
                }
                Ok(())
            }
            CalculationMode::Project => {
                for (k, flux) in (-grad_u).iter().enumerate() {
                    local.projection[k] = *flux;
                }
                Ok(())
            }
            _ => Err(self.unsupported_mode(mode)),
        }
    }
}
