use super::mechanics::{assemble_momentum, DISPLACEMENT_FIELDS};
use crate::error::KernelError;
use crate::kernel::{CalculationMode, ElementKernel, LocalBuffers, PointHistory, QuadraturePoint};
use crate::material::{pack_plastic_state, PLASTIC_HISTORY_LEN};

/// Quasi-static small-strain mechanics with path-dependent plastic flow.
///
/// Every quadrature point stores the material outputs `plastic_strain` and
/// `equivalent_plastic_strain` as history (see
/// [`J2PlasticMaterial`](crate::material::J2PlasticMaterial)). The material only ever sees the
/// committed state, so Newton iterations and rejected attempts do not accumulate plastic flow.
#[derive(Debug, Copy, Clone)]
pub struct SmallStrainPlasticity {
    dim: usize,
}

impl SmallStrainPlasticity {
    /// Fails with [`KernelError::UnsupportedDimension`] unless `dim` is 1, 2 or 3.
    pub fn new(dim: usize) -> Result<Self, KernelError> {
        if (1..=3).contains(&dim) {
            Ok(Self { dim })
        } else {
            Err(KernelError::UnsupportedDimension {
                physics: "plasticity".to_string(),
                dim,
            })
        }
    }
}

impl ElementKernel for SmallStrainPlasticity {
    fn name(&self) -> &str {
        "plasticity"
    }

    fn fields(&self) -> &[&'static str] {
        &DISPLACEMENT_FIELDS[..self.dim]
    }

    fn supports_dimension(&self, dim: usize) -> bool {
        dim == self.dim
    }

    fn history_len(&self) -> usize {
        PLASTIC_HISTORY_LEN
    }

    fn projection_names(&self) -> &[&'static str] {
        &["von_mises", "equivalent_plastic_strain"]
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
            history.current.fill(0.0);
            return Ok(());
        }

        let material = point.material;
        let alpha = material.scalar("equivalent_plastic_strain")?;
        if mode == CalculationMode::Project {
            local.projection[0] = material.scalar("von_mises")?;
            local.projection[1] = alpha;
            return Ok(());
        }

        pack_plastic_state(material.rank2("plastic_strain")?, alpha, history.current);
        if mode == CalculationMode::UpdateHistory {
            Ok(())
        } else {
            assemble_momentum(self.dim, mode, point, local)
        }
    }
}
