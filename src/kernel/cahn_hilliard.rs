use crate::error::KernelError;
use crate::kernel::{CalculationMode, ElementKernel, LocalBuffers, PointHistory, QuadraturePoint};

/// Mixed Cahn-Hilliard formulation with concentration `c` and chemical potential `mu`:
///
/// ```text
/// dc/dt = div(M grad mu)
/// mu    = dF/dc - kappa lap(c)
/// ```
///
/// Reads the material scalars `M`, `dMdc`, `kappa`, `dFdc`, `d2Fdc2` and, for projection, `F`.
#[derive(Debug, Copy, Clone, Default)]
pub struct CahnHilliard;

const C: usize = 0;
const MU: usize = 1;

impl ElementKernel for CahnHilliard {
    fn name(&self) -> &str {
        "cahn-hilliard"
    }

    fn fields(&self) -> &[&'static str] {
        &["c", "mu"]
    }

    fn supports_dimension(&self, dim: usize) -> bool {
        (1..=3).contains(&dim)
    }

    fn projection_names(&self) -> &[&'static str] {
        &["free_energy"]
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
        let fields = point.fields;
        let material = point.material;

        match mode {
            CalculationMode::Residual | CalculationMode::Jacobian | CalculationMode::ResidualAndJacobian => {
                let mobility = material.scalar("M")?;
                let dm_dc = material.scalar_or("dMdc", 0.0);
                let kappa = material.scalar("kappa")?;
                let df_dc = material.scalar("dFdc")?;
                let d2f_dc2 = material.scalar("d2Fdc2")?;
                let (du, dv) = (point.factors.du, point.factors.dv);

                let c_dot = fields.rates[C];
                let mu = fields.values[MU];
                let grad_c = fields.gradients[C];
                let grad_mu = fields.gradients[MU];

                for i in 0..point.node_count() {
                    let (row_c, row_mu) = (2 * i + C, 2 * i + MU);
                    if mode.computes_residual() {
                        local.residual[row_c] += c_dot * n[i] + mobility * grad_mu.dot(&grad_n[i]);
                        local.residual[row_mu] += mu * n[i] - df_dc * n[i] - kappa * grad_c.dot(&grad_n[i]);
                    }
                    if mode.computes_jacobian() {
                        for j in 0..point.node_count() {
                            let (col_c, col_mu) = (2 * j + C, 2 * j + MU);
                            local.jacobian[(row_c, col_c)] +=
                                n[j] * n[i] * dv + dm_dc * n[j] * grad_mu.dot(&grad_n[i]) * du;
                            local.jacobian[(row_c, col_mu)] += mobility * grad_n[j].dot(&grad_n[i]) * du;
                            local.jacobian[(row_mu, col_c)] +=
                                -d2f_dc2 * n[j] * n[i] * du - kappa * grad_n[j].dot(&grad_n[i]) * du;
                            local.jacobian[(row_mu, col_mu)] += n[j] * n[i] * du;
                        }
                    }
                }
                Ok(())
            }
            CalculationMode::Project => {
                let kappa = material.scalar("kappa")?;
                let grad_c = fields.gradients[C];
                local.projection[0] = material.scalar("F")? + 0.5 * kappa * grad_c.norm_squared();
                Ok(())
            }
            _ => Err(self.unsupported_mode(mode)),
        }
    }
}
