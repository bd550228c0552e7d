use super::mechanics::{contract, tangent_entry};
use crate::error::KernelError;
use crate::kernel::{CalculationMode, ElementKernel, LocalBuffers, PointHistory, QuadraturePoint};
use nalgebra::Matrix3;

static FIELDS_2D: [&str; 3] = ["d", "ux", "uy"];
static FIELDS_3D: [&str; 4] = ["d", "ux", "uy", "uz"];

/// Phase-field fracture with a damage field `d` coupled to small-strain displacements.
///
/// The crack driving force is the history variable `H = max(H_old, psi+)`, which makes the
/// damage irreversible. The damage equation reads
///
/// ```text
/// eta dd/dt + 2 (d - 1) H + Gc / L d - Gc L lap(d) = 0
/// ```
///
/// Reads the material scalars `Gc`, `L`, `viscosity`, `psi_plus`, `von_mises` and the tensors
/// `stress`, `stress_plus` (derivative of `psi+` with respect to the strain), `dstress_dd`
/// and `tangent`.
#[derive(Debug, Copy, Clone)]
pub struct PhaseFieldFracture {
    dim: usize,
}

impl PhaseFieldFracture {
    /// Fails with [`KernelError::UnsupportedDimension`] unless `dim` is 2 or 3.
    pub fn new(dim: usize) -> Result<Self, KernelError> {
        match dim {
            2 | 3 => Ok(Self { dim }),
            _ => Err(KernelError::UnsupportedDimension {
                physics: "phase-field-fracture".to_string(),
                dim,
            }),
        }
    }
}

impl ElementKernel for PhaseFieldFracture {
    fn name(&self) -> &str {
        "phase-field-fracture"
    }

    fn fields(&self) -> &[&'static str] {
        if self.dim == 2 {
            &FIELDS_2D
        } else {
            &FIELDS_3D
        }
    }

    fn supports_dimension(&self, dim: usize) -> bool {
        dim == self.dim
    }

    fn history_len(&self) -> usize {
        1
    }

    fn projection_names(&self) -> &[&'static str] {
        &["von_mises", "crack_driving_force"]
    }

    fn compute(
        &self,
        mode: CalculationMode,
        point: &QuadraturePoint,
        history: PointHistory,
        local: &mut LocalBuffers,
    ) -> Result<(), KernelError> {
        self.check_dimension(point.dim)?;
        if mode == CalculationMode::InitHistory {
            history.current[0] = 0.0;
            return Ok(());
        }

        let material = point.material;
        let psi_plus = material.scalar("psi_plus")?;
        let h_old = history.old[0];
        let h = h_old.max(psi_plus);

        match mode {
            CalculationMode::UpdateHistory => {
                history.current[0] = h;
                Ok(())
            }
            CalculationMode::Project => {
                local.projection[0] = material.scalar("von_mises")?;
                local.projection[1] = h;
                Ok(())
            }
            _ => {
                history.current[0] = h;
                self.assemble(mode, point, h, psi_plus > h_old, local)
            }
        }
    }
}

impl PhaseFieldFracture {
    fn assemble(
        &self,
        mode: CalculationMode,
        point: &QuadraturePoint,
        h: f64,
        loading: bool,
        local: &mut LocalBuffers,
    ) -> Result<(), KernelError> {
        let dim = self.dim;
        let nf = dim + 1;
        let material = point.material;
        let n = point.shape.values();
        let grad_n = point.shape.gradients();
        let (du, dv) = (point.factors.du, point.factors.dv);

        let gc = material.scalar("Gc")?;
        let l = material.scalar("L")?;
        let eta = material.scalar("viscosity")?;
        let stress = material.rank2("stress")?;

        let d = point.fields.values[0];
        let d_dot = point.fields.rates[0];
        let grad_d = point.fields.gradients[0];

        for i in 0..point.node_count() {
            let row_d = nf * i;
            if mode.computes_residual() {
                local.residual[row_d] += eta * d_dot * n[i]
                    + 2.0 * (d - 1.0) * h * n[i]
                    + gc / l * d * n[i]
                    + gc * l * grad_d.dot(&grad_n[i]);
                for a in 0..dim {
                    local.residual[row_d + 1 + a] += contract(stress, &grad_n[i], dim, a);
                }
            }
        }

        if mode.computes_jacobian() {
            let tangent = material.rank4("tangent")?;
            let dstress_dd = material.rank2("dstress_dd")?;
            // H only depends on the strain while the crack is being driven
            let dh_deps = if loading {
                *material.rank2("stress_plus")?
            } else {
                Matrix3::zeros()
            };

            for i in 0..point.node_count() {
                let row_d = nf * i;
                for j in 0..point.node_count() {
                    let col_d = nf * j;
                    local.jacobian[(row_d, col_d)] += eta * n[j] * n[i] * dv
                        + (2.0 * h + gc / l) * n[j] * n[i] * du
                        + gc * l * grad_n[j].dot(&grad_n[i]) * du;
                    for c in 0..dim {
                        local.jacobian[(row_d, col_d + 1 + c)] +=
                            2.0 * (d - 1.0) * n[i] * contract(&dh_deps, &grad_n[j], dim, c) * du;
                    }
                    for a in 0..dim {
                        let row_u = row_d + 1 + a;
                        local.jacobian[(row_u, col_d)] += contract(dstress_dd, &grad_n[i], dim, a) * n[j] * du;
                        for c in 0..dim {
                            local.jacobian[(row_u, col_d + 1 + c)] +=
                                tangent_entry(tangent, &grad_n[i], &grad_n[j], dim, a, c) * du;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
