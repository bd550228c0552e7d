//! Material evaluation at quadrature points.
//!
//! The assembler treats materials as a black box: for every quadrature point it passes the
//! interpolated fields to a [`MaterialEvaluator`] and hands the named outputs to the kernel.
use crate::error::KernelError;
use crate::kernel::{PhysicsTag, PointFields};
use eyre::eyre;
use nalgebra::{Matrix3, SMatrix, Vector3};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Fourth-order tensor with entry `C_ijkl` stored at `(3 i + j, 3 k + l)`.
pub type Rank4 = SMatrix<f64, 9, 9>;

/// Inputs of a material evaluation at one quadrature point.
#[derive(Debug, Clone, Copy)]
pub struct MaterialInput<'a> {
    pub physics: &'a PhysicsTag,
    pub element: usize,
    /// Material block of the element.
    pub block: usize,
    pub dim: usize,
    pub time: f64,
    pub dt: f64,
    /// Names of the interpolated fields, indexed like `fields`.
    pub field_names: &'a [&'static str],
    pub fields: &'a PointFields,
    pub history_old: &'a [f64],
}

impl MaterialInput<'_> {
    fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|field| *field == name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.field_index(name).map(|i| self.fields.values[i])
    }

    pub fn gradient(&self, name: &str) -> Option<Vector3<f64>> {
        self.field_index(name).map(|i| self.fields.gradients[i])
    }

    /// Displacement gradient `H_ij = du_i/dx_j` assembled from the fields `ux`, `uy` and `uz`.
    ///
    /// Missing components are zero.
    pub fn displacement_gradient(&self) -> Matrix3<f64> {
        let mut h = Matrix3::zeros();
        for (i, name) in ["ux", "uy", "uz"].iter().enumerate() {
            if let Some(gradient) = self.gradient(name) {
                h.set_row(i, &gradient.transpose());
            }
        }
        h
    }

    /// Small-strain tensor `(H + H^T) / 2`.
    pub fn strain(&self) -> Matrix3<f64> {
        let h = self.displacement_gradient();
        0.5 * (h + h.transpose())
    }
}

/// Named scalar, vector and tensor outputs of a material evaluation.
#[derive(Debug, Clone, Default)]
pub struct MaterialOutputs {
    scalars: FxHashMap<&'static str, f64>,
    vectors: FxHashMap<&'static str, Vector3<f64>>,
    rank2: FxHashMap<&'static str, Matrix3<f64>>,
    rank4: FxHashMap<&'static str, Rank4>,
}

fn missing(name: &str) -> KernelError {
    KernelError::MissingMaterialProperty { name: name.to_string() }
}

impl MaterialOutputs {
    /// Removes all outputs while keeping the allocations.
    pub fn clear(&mut self) {
        self.scalars.clear();
        self.vectors.clear();
        self.rank2.clear();
        self.rank4.clear();
    }

    pub fn set_scalar(&mut self, name: &'static str, value: f64) {
        self.scalars.insert(name, value);
    }

    pub fn set_vector(&mut self, name: &'static str, value: Vector3<f64>) {
        self.vectors.insert(name, value);
    }

    pub fn set_rank2(&mut self, name: &'static str, value: Matrix3<f64>) {
        self.rank2.insert(name, value);
    }

    pub fn set_rank4(&mut self, name: &'static str, value: Rank4) {
        self.rank4.insert(name, value);
    }

    pub fn scalar(&self, name: &str) -> Result<f64, KernelError> {
        self.scalars.get(name).copied().ok_or_else(|| missing(name))
    }

    pub fn scalar_or(&self, name: &str, default: f64) -> f64 {
        self.scalars.get(name).copied().unwrap_or(default)
    }

    pub fn vector(&self, name: &str) -> Result<Vector3<f64>, KernelError> {
        self.vectors.get(name).copied().ok_or_else(|| missing(name))
    }

    pub fn rank2(&self, name: &str) -> Result<&Matrix3<f64>, KernelError> {
        self.rank2.get(name).ok_or_else(|| missing(name))
    }

    pub fn rank4(&self, name: &str) -> Result<&Rank4, KernelError> {
        self.rank4.get(name).ok_or_else(|| missing(name))
    }

    pub fn is_finite(&self) -> bool {
        self.scalars.values().all(|x| x.is_finite())
            && self.vectors.values().all(|v| v.iter().all(|x| x.is_finite()))
            && self.rank2.values().all(|m| m.iter().all(|x| x.is_finite()))
            && self.rank4.values().all(|m| m.iter().all(|x| x.is_finite()))
    }
}

/// Computes material outputs at a quadrature point.
pub trait MaterialEvaluator: Send + Sync {
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()>;
}

impl<F> MaterialEvaluator for F
where
    F: Fn(&MaterialInput, &mut MaterialOutputs) -> eyre::Result<()> + Send + Sync,
{
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        self(input, outputs)
    }
}

/// Dispatches to one evaluator per material block.
#[derive(Default)]
pub struct MaterialLibrary {
    blocks: Vec<Box<dyn MaterialEvaluator>>,
}

impl std::fmt::Debug for MaterialLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialLibrary")
            .field("num_blocks", &self.blocks.len())
            .finish()
    }
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block; blocks are numbered in insertion order.
    pub fn with_block(mut self, material: impl MaterialEvaluator + 'static) -> Self {
        self.blocks.push(Box::new(material));
        self
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl MaterialEvaluator for MaterialLibrary {
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        let material = self
            .blocks
            .get(input.block)
            .ok_or_else(|| eyre!("no material for block {} of element {}", input.block, input.element))?;
        material.evaluate(input, outputs)
    }
}

/// Provides fixed named scalars, e.g. a constant diffusivity `D`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantMaterial {
    scalars: Vec<(&'static str, f64)>,
}

impl ConstantMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scalar(mut self, name: &'static str, value: f64) -> Self {
        self.scalars.push((name, value));
        self
    }
}

impl MaterialEvaluator for ConstantMaterial {
    fn evaluate(&self, _input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        for &(name, value) in &self.scalars {
            outputs.set_scalar(name, value);
        }
        Ok(())
    }
}

/// Chemical free energy `F(c) = A c^2 (1 - c)^2` with constant mobility and gradient energy
/// coefficient.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleWellChemistry {
    pub mobility: f64,
    pub kappa: f64,
    pub barrier: f64,
}

impl MaterialEvaluator for DoubleWellChemistry {
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        let c = input
            .value("c")
            .ok_or_else(|| eyre!("double-well chemistry requires the field \"c\""))?;
        let a = self.barrier;
        outputs.set_scalar("M", self.mobility);
        outputs.set_scalar("dMdc", 0.0);
        outputs.set_scalar("kappa", self.kappa);
        outputs.set_scalar("F", a * c * c * (1.0 - c) * (1.0 - c));
        outputs.set_scalar("dFdc", 2.0 * a * c * (1.0 - c) * (1.0 - 2.0 * c));
        outputs.set_scalar("d2Fdc2", 2.0 * a * (1.0 - 6.0 * c + 6.0 * c * c));
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct YoungPoisson {
    pub young: f64,
    pub poisson: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LameParameters {
    pub mu: f64,
    pub lambda: f64,
}

impl From<YoungPoisson> for LameParameters {
    fn from(params: YoungPoisson) -> Self {
        let YoungPoisson { young, poisson } = params;
        let mu = 0.5 * young / (1.0 + poisson);
        let lambda = 2.0 * mu * poisson / (1.0 - 2.0 * poisson);
        Self { mu, lambda }
    }
}

impl LameParameters {
    pub fn bulk_modulus(&self) -> f64 {
        self.lambda + 2.0 * self.mu / 3.0
    }
}

fn identity_outer_identity() -> Rank4 {
    let mut c = Rank4::zeros();
    for i in 0..3 {
        for k in 0..3 {
            c[(3 * i + i, 3 * k + k)] = 1.0;
        }
    }
    c
}

fn symmetric_identity() -> Rank4 {
    let mut c = Rank4::zeros();
    for i in 0..3 {
        for j in 0..3 {
            c[(3 * i + j, 3 * i + j)] += 0.5;
            c[(3 * i + j, 3 * j + i)] += 0.5;
        }
    }
    c
}

/// `C_ijkl = a_ij b_kl`
fn outer(a: &Matrix3<f64>, b: &Matrix3<f64>) -> Rank4 {
    let mut c = Rank4::zeros();
    for ij in 0..9 {
        for kl in 0..9 {
            c[(ij, kl)] = a[(ij / 3, ij % 3)] * b[(kl / 3, kl % 3)];
        }
    }
    c
}

/// Deviatoric part of a second-order tensor.
fn deviator(a: &Matrix3<f64>) -> Matrix3<f64> {
    a - Matrix3::identity() * (a.trace() / 3.0)
}

/// Von Mises equivalent stress.
pub fn von_mises(stress: &Matrix3<f64>) -> f64 {
    let s = deviator(stress);
    (1.5 * s.component_mul(&s).sum()).sqrt()
}

/// Isotropic linear elasticity `sigma = 2 mu eps + lambda tr(eps) I`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearElasticMaterial {
    pub lame: LameParameters,
}

impl MaterialEvaluator for LinearElasticMaterial {
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        let LameParameters { mu, lambda } = self.lame;
        let eps = input.strain();
        let stress = 2.0 * mu * eps + lambda * eps.trace() * Matrix3::identity();
        let tangent = 2.0 * mu * symmetric_identity() + lambda * identity_outer_identity();
        outputs.set_scalar("strain_energy", 0.5 * stress.component_mul(&eps).sum());
        outputs.set_scalar("von_mises", von_mises(&stress));
        outputs.set_rank2("stress", stress);
        outputs.set_rank4("tangent", tangent);
        Ok(())
    }
}

/// Phase-field fracture material with a volumetric-deviatoric split of the strain energy.
///
/// With `<x>+ = max(x, 0)`, `K` the bulk modulus and `g(d) = (1 - d)^2 + k` the degradation
/// function, the tensile energy `psi+ = K/2 <tr eps>+^2 + mu eps_dev : eps_dev` is degraded while
/// the compressive energy `psi- = K/2 <tr eps>-^2` is not.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmorFractureMaterial {
    pub lame: LameParameters,
    /// Critical energy release rate `Gc`.
    pub fracture_toughness: f64,
    pub length_scale: f64,
    pub viscosity: f64,
    /// Residual stiffness `k` keeping the fully damaged material well-posed.
    pub residual_stiffness: f64,
}

impl MaterialEvaluator for AmorFractureMaterial {
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        let d = input
            .value("d")
            .ok_or_else(|| eyre!("fracture material requires the damage field \"d\""))?;
        let mu = self.lame.mu;
        let bulk = self.lame.bulk_modulus();

        let eps = input.strain();
        let tr = eps.trace();
        let eps_dev = deviator(&eps);
        let (tr_pos, tr_neg) = (tr.max(0.0), tr.min(0.0));
        let identity = Matrix3::identity();

        let psi_pos = 0.5 * bulk * tr_pos * tr_pos + mu * eps_dev.component_mul(&eps_dev).sum();
        let stress_pos = bulk * tr_pos * identity + 2.0 * mu * eps_dev;
        let stress_neg = bulk * tr_neg * identity;

        let vol = identity_outer_identity();
        let dev = symmetric_identity() - vol / 3.0;
        let heaviside_pos = if tr > 0.0 { 1.0 } else { 0.0 };
        let tangent_pos = bulk * heaviside_pos * vol + 2.0 * mu * dev;
        let tangent_neg = bulk * (1.0 - heaviside_pos) * vol;

        let g = (1.0 - d) * (1.0 - d) + self.residual_stiffness;
        let dg = -2.0 * (1.0 - d);
        let stress = g * stress_pos + stress_neg;

        outputs.set_scalar("Gc", self.fracture_toughness);
        outputs.set_scalar("L", self.length_scale);
        outputs.set_scalar("viscosity", self.viscosity);
        outputs.set_scalar("psi_plus", psi_pos);
        outputs.set_scalar("von_mises", von_mises(&stress));
        outputs.set_rank2("stress", stress);
        outputs.set_rank2("stress_plus", stress_pos);
        outputs.set_rank2("dstress_dd", dg * stress_pos);
        outputs.set_rank4("tangent", g * tangent_pos + tangent_neg);
        Ok(())
    }
}

/// History values per point of [`J2PlasticMaterial`]: the plastic strain components xx, yy, zz,
/// xy, yz, xz followed by the equivalent plastic strain.
pub const PLASTIC_HISTORY_LEN: usize = 7;

const VOIGT_PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (0, 1), (1, 2), (0, 2)];

/// Reads the plastic strain and equivalent plastic strain from a point's history.
pub fn unpack_plastic_state(history: &[f64]) -> (Matrix3<f64>, f64) {
    let mut strain = Matrix3::zeros();
    for (&value, &(i, j)) in history.iter().zip(&VOIGT_PAIRS) {
        strain[(i, j)] = value;
        strain[(j, i)] = value;
    }
    (strain, history[6])
}

pub fn pack_plastic_state(strain: &Matrix3<f64>, equivalent: f64, history: &mut [f64]) {
    for (value, &(i, j)) in history.iter_mut().zip(&VOIGT_PAIRS) {
        *value = strain[(i, j)];
    }
    history[6] = equivalent;
}

/// Small-strain J2 plasticity with linear isotropic hardening, integrated by radial return.
///
/// The committed plastic state is read from the point's history, so every evaluation starts
/// from the last accepted step. The von Mises stress is bounded by `sigma_y + H alpha` with
/// `alpha` the equivalent plastic strain. Besides `stress` and the algorithmic `tangent` the
/// material writes the updated `plastic_strain` and `equivalent_plastic_strain`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct J2PlasticMaterial {
    pub lame: LameParameters,
    pub yield_stress: f64,
    /// Linear isotropic hardening modulus `H`.
    pub hardening: f64,
}

impl MaterialEvaluator for J2PlasticMaterial {
    fn evaluate(&self, input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        if input.history_old.len() < PLASTIC_HISTORY_LEN {
            return Err(eyre!(
                "J2 plasticity needs {} history values per point, the kernel provides {}",
                PLASTIC_HISTORY_LEN,
                input.history_old.len()
            ));
        }
        let (plastic_old, alpha_old) = unpack_plastic_state(input.history_old);
        let mu = self.lame.mu;
        let bulk = self.lame.bulk_modulus();
        let identity = Matrix3::identity();

        let elastic_trial = input.strain() - plastic_old;
        let pressure = bulk * elastic_trial.trace();
        let s_trial = 2.0 * mu * deviator(&elastic_trial);
        let s_norm = s_trial.norm();
        let q_trial = 1.5_f64.sqrt() * s_norm;
        let f_trial = q_trial - (self.yield_stress + self.hardening * alpha_old);

        let vol = identity_outer_identity();
        let dev = symmetric_identity() - vol / 3.0;
        let (stress, tangent, plastic, alpha) = if f_trial <= 0.0 {
            (s_trial + pressure * identity, bulk * vol + 2.0 * mu * dev, plastic_old, alpha_old)
        } else {
            let delta = f_trial / (3.0 * mu + self.hardening);
            let n = s_trial / s_norm;
            let theta = 1.0 - 3.0 * mu * delta / q_trial;
            let theta_bar = 3.0 * mu / (3.0 * mu + self.hardening) - (1.0 - theta);
            (
                theta * s_trial + pressure * identity,
                bulk * vol + 2.0 * mu * theta * dev - 2.0 * mu * theta_bar * outer(&n, &n),
                plastic_old + 1.5_f64.sqrt() * delta * n,
                alpha_old + delta,
            )
        };

        outputs.set_scalar("von_mises", von_mises(&stress));
        outputs.set_scalar("equivalent_plastic_strain", alpha);
        outputs.set_rank2("stress", stress);
        outputs.set_rank2("plastic_strain", plastic);
        outputs.set_rank4("tangent", tangent);
        Ok(())
    }
}
