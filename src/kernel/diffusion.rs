use crate::error::KernelError;
use crate::kernel::{CalculationMode, ElementKernel, LocalBuffers, PointHistory, QuadraturePoint};

/// Transient nonlinear diffusion `dc/dt = div(D(c) grad c)`.
///
/// Reads the material scalars `D` and `dDdc`; the latter defaults to zero.
#[derive(Debug, Copy, Clone, Default)]
pub struct Diffusion;

impl ElementKernel for Diffusion {
    fn name(&self) -> &str {
        "diffusion"
    }

    fn fields(&self) -> &[&'static str] {
        &["c"]
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
        let c_dot = point.fields.rates[0];
        let grad_c = point.fields.gradients[0];
        let d = point.material.scalar("D")?;

        match mode {
            CalculationMode::Residual | CalculationMode::Jacobian | CalculationMode::ResidualAndJacobian => {
                let dd_dc = point.material.scalar_or("dDdc", 0.0);
                let factors = point.factors;
                for i in 0..point.node_count() {
                    if mode.computes_residual() {
                        local.residual[i] += c_dot * n[i] + d * grad_c.dot(&grad_n[i]);
                    }
                    if mode.computes_jacobian() {
                        for j in 0..point.node_count() {
                            local.jacobian[(i, j)] += n[j] * n[i] * factors.dv
                                + dd_dc * n[j] * grad_c.dot(&grad_n[i]) * factors.du
                                + d * grad_n[j].dot(&grad_n[i]) * factors.du;
                        }
                    }
                }
                Ok(())
            }
            CalculationMode::Project => {
                for (k, flux) in (-d * grad_c).iter().enumerate() {
                    local.projection[k] = *flux;
                }
                Ok(())
            }
            _ => Err(self.unsupported_mode(mode)),
        }
    }
}
