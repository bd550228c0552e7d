//! A complete finite element problem: discretization, solution state and solvers.
use crate::assembly::{Assembler, AssemblyState, FeModel, GlobalSystem, HistoryStorage, ProjectionBuffer};
use crate::boundary::NaturalBc;
use crate::config::SimulationSettings;
use crate::dof::{DofMap, EssentialBc};
use crate::error::{AssemblyError, DofError, StepError};
use crate::kernel::{CalculationMode, KernelRegistry, TimeIntegrationFactors};
use crate::linear_solver::LinearSolver;
use crate::material::{ConstantMaterial, MaterialEvaluator};
use crate::mesh::Mesh;
use crate::solver::{NonlinearOutcome, NonlinearSolver};
use crate::stepping::{run_transient, CommittedStep, StepObserver, TransientProblem, TransientSummary};
use log::{debug, info};
use multifem_optimize::system::{NonlinearSystem, SystemError};
use nalgebra::{DVector, DVectorView, DVectorViewMut, Point3};
use std::fmt;
use std::sync::Arc;

/// Initial value of a field.
#[derive(Clone)]
pub enum InitialValue {
    Constant(f64),
    Function(Arc<dyn Fn(&Point3<f64>) -> f64 + Send + Sync>),
}

impl fmt::Debug for InitialValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialValue::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            InitialValue::Function(_) => f.write_str("Function(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitialCondition {
    pub field: String,
    pub value: InitialValue,
}

impl InitialCondition {
    pub fn constant(field: impl Into<String>, value: f64) -> Self {
        Self {
            field: field.into(),
            value: InitialValue::Constant(value),
        }
    }

    pub fn function(field: impl Into<String>, f: impl Fn(&Point3<f64>) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            field: field.into(),
            value: InitialValue::Function(Arc::new(f)),
        }
    }
}

/// The parts of a problem that stay fixed during a run.
struct Discretization {
    mesh: Mesh,
    dof_map: DofMap,
    kernels: KernelRegistry,
    materials: Box<dyn MaterialEvaluator>,
    assembler: Assembler,
}

impl Discretization {
    fn model(&self) -> FeModel {
        FeModel {
            mesh: &self.mesh,
            dof_map: &self.dof_map,
            kernels: &self.kernels,
            materials: self.materials.as_ref(),
        }
    }
}

/// Solution vectors over the active unknowns and the assembly buffers.
#[derive(Debug, Clone)]
struct SolutionState {
    u: DVector<f64>,
    u_old: DVector<f64>,
    u_older: DVector<f64>,
    /// Part of the rate independent of `u`.
    rate_offset: DVector<f64>,
    rate: DVector<f64>,
    dt_old: Option<f64>,
    time: f64,
    system: GlobalSystem,
    history: HistoryStorage,
    projection: ProjectionBuffer,
}

/// The system `R(u) = 0` of one trial step, as seen by the Newton iteration.
struct TrialSystem<'a> {
    discretization: &'a Discretization,
    linear_solver: &'a mut dyn LinearSolver,
    time: f64,
    dt: f64,
    factors: TimeIntegrationFactors,
    rate_offset: &'a DVector<f64>,
    rate: &'a mut DVector<f64>,
    system: &'a mut GlobalSystem,
    history: &'a mut HistoryStorage,
    projection: &'a mut ProjectionBuffer,
}

impl TrialSystem<'_> {
    fn assemble(&mut self, mode: CalculationMode, u: &DVectorView<f64>) -> Result<(), AssemblyError> {
        self.rate.copy_from(self.rate_offset);
        self.rate.axpy(self.factors.dv, u, 1.0);
        let state = AssemblyState {
            time: self.time,
            dt: self.dt,
            factors: self.factors,
            u: *u,
            v: DVectorView::from(&*self.rate),
        };
        self.discretization.assembler.form_fe(
            mode,
            &self.discretization.model(),
            &state,
            self.system,
            self.history,
            self.projection,
        )
    }
}

impl NonlinearSystem<f64> for TrialSystem<'_> {
    fn dimension(&self) -> usize {
        self.discretization.dof_map.num_active_dofs()
    }

    fn eval_residual(&mut self, f: &mut DVectorViewMut<f64>, x: &DVectorView<f64>) -> Result<(), SystemError> {
        self.assemble(CalculationMode::Residual, x)?;
        f.copy_from(&self.system.residual);
        Ok(())
    }

    fn eval_residual_and_jacobian(
        &mut self,
        f: &mut DVectorViewMut<f64>,
        x: &DVectorView<f64>,
    ) -> Result<(), SystemError> {
        self.assemble(CalculationMode::ResidualAndJacobian, x)?;
        f.copy_from(&self.system.residual);
        Ok(())
    }

    fn solve_jacobian_system(
        &mut self,
        sol: &mut DVectorViewMut<f64>,
        rhs: &DVectorView<f64>,
    ) -> Result<(), SystemError> {
        self.linear_solver
            .solve(&self.system.jacobian, sol, rhs)
            .map_err(SystemError::from)
    }
}

/// A mesh with physics, boundary conditions and materials, ready to be solved.
///
/// The problem keeps a committed state (solution and history at the last accepted time) and a
/// trial state. Trial steps only ever modify the trial state, which is either promoted by
/// [`commit_step`](TransientProblem::commit_step) or dropped by
/// [`discard_step`](TransientProblem::discard_step).
pub struct FeProblem {
    discretization: Discretization,
    state: SolutionState,
    solver: NonlinearSolver,
    linear_solver: Box<dyn LinearSolver>,
    settings: SimulationSettings,
}

impl fmt::Debug for FeProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeProblem")
            .field("num_nodes", &self.discretization.mesh.num_nodes())
            .field("num_elements", &self.discretization.mesh.num_elements())
            .field("num_active_dofs", &self.discretization.dof_map.num_active_dofs())
            .field("kernels", &self.discretization.kernels)
            .field("time", &self.state.time)
            .field("settings", &self.settings)
            .finish()
    }
}

pub struct FeProblemBuilder {
    mesh: Mesh,
    kernels: KernelRegistry,
    bcs: Vec<EssentialBc>,
    natural_bcs: Vec<NaturalBc>,
    materials: Option<Box<dyn MaterialEvaluator>>,
    field_order: Option<Vec<String>>,
    initial_conditions: Vec<InitialCondition>,
    settings: SimulationSettings,
}

impl FeProblemBuilder {
    pub fn with_boundary_condition(mut self, bc: EssentialBc) -> Self {
        self.bcs.push(bc);
        self
    }

    pub fn with_boundary_conditions(mut self, bcs: impl IntoIterator<Item = EssentialBc>) -> Self {
        self.bcs.extend(bcs);
        self
    }

    /// Adds a flux, traction or pressure integrated over the boundary faces of its regions.
    pub fn with_natural_bc(mut self, bc: NaturalBc) -> Self {
        self.natural_bcs.push(bc);
        self
    }

    pub fn with_natural_bcs(mut self, bcs: impl IntoIterator<Item = NaturalBc>) -> Self {
        self.natural_bcs.extend(bcs);
        self
    }

    /// Sets the material evaluator. Without one, kernels only see an empty set of outputs.
    pub fn with_materials(mut self, materials: impl MaterialEvaluator + 'static) -> Self {
        self.materials = Some(Box::new(materials));
        self
    }

    /// Fixes the order of the fields within each node. By default fields are ordered by first
    /// appearance in the kernel registry.
    pub fn with_field_order<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.field_order = Some(fields.iter().map(|f| f.as_ref().to_string()).collect());
        self
    }

    pub fn with_initial_condition(mut self, condition: InitialCondition) -> Self {
        self.initial_conditions.push(condition);
        self
    }

    pub fn with_settings(mut self, settings: SimulationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Numbers the unknowns, applies the initial conditions and initializes the history.
    pub fn build(self) -> Result<FeProblem, StepError> {
        self.settings.time_stepping.validate()?;

        let layout = match &self.field_order {
            Some(order) => {
                let order: Vec<&str> = order.iter().map(String::as_str).collect();
                self.kernels.dof_layout_with_field_order(&order)?
            }
            None => self.kernels.dof_layout()?,
        };
        let dof_map = DofMap::build(&self.mesh, &layout, &self.bcs)?;
        info!(
            "Numbered {} active unknowns on {} nodes with {} fields per node",
            dof_map.num_active_dofs(),
            self.mesh.num_nodes(),
            layout.dofs_per_node()
        );

        let materials = self
            .materials
            .unwrap_or_else(|| Box::new(ConstantMaterial::new()));
        let model = FeModel {
            mesh: &self.mesh,
            dof_map: &dof_map,
            kernels: &self.kernels,
            materials: materials.as_ref(),
        };
        let assembler =
            Assembler::new(&model, self.settings.assembly.strategy)?.with_natural_bcs(&model, &self.natural_bcs)?;
        let history = assembler.history_storage(&model);
        let projection = assembler.projection_buffer(&model);
        let system = GlobalSystem::new(&dof_map);

        let mut u = DVector::zeros(dof_map.num_active_dofs());
        apply_initial_conditions(&self.mesh, &dof_map, &self.initial_conditions, &mut u)?;

        let n = u.len();
        let mut problem = FeProblem {
            discretization: Discretization {
                mesh: self.mesh,
                dof_map,
                kernels: self.kernels,
                materials,
                assembler,
            },
            state: SolutionState {
                u_old: u.clone(),
                u_older: u.clone(),
                u,
                rate_offset: DVector::zeros(n),
                rate: DVector::zeros(n),
                dt_old: None,
                time: 0.0,
                system,
                history,
                projection,
            },
            solver: NonlinearSolver::new(self.settings.newton.into())
                .with_line_search(self.settings.newton.line_search),
            linear_solver: self.settings.linear_solver.build(),
            settings: self.settings,
        };
        problem.init_history()?;
        Ok(problem)
    }
}

fn apply_initial_conditions(
    mesh: &Mesh,
    dof_map: &DofMap,
    conditions: &[InitialCondition],
    u: &mut DVector<f64>,
) -> Result<(), DofError> {
    for condition in conditions {
        let field = dof_map
            .layout()
            .field_index(&condition.field)
            .ok_or_else(|| DofError::InvalidFieldName {
                field: condition.field.clone(),
                region: None,
            })?;
        for (node, vertex) in mesh.vertices().iter().enumerate() {
            if let Some(index) = dof_map.slot(node, field).active_index {
                u[index] = match &condition.value {
                    InitialValue::Constant(value) => *value,
                    InitialValue::Function(f) => f(vertex),
                };
            }
        }
    }
    Ok(())
}

impl FeProblem {
    pub fn builder(mesh: Mesh, kernels: KernelRegistry) -> FeProblemBuilder {
        FeProblemBuilder {
            mesh,
            kernels,
            bcs: Vec::new(),
            natural_bcs: Vec::new(),
            materials: None,
            field_order: None,
            initial_conditions: Vec::new(),
            settings: SimulationSettings::default(),
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.discretization.mesh
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.discretization.dof_map
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.discretization.kernels
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// Time of the last committed state.
    pub fn time(&self) -> f64 {
        self.state.time
    }

    /// Trial solution over the active unknowns.
    pub fn solution(&self) -> &DVector<f64> {
        &self.state.u
    }

    /// Committed solution over the active unknowns.
    pub fn committed_solution(&self) -> &DVector<f64> {
        &self.state.u_old
    }

    pub fn history(&self) -> &HistoryStorage {
        &self.state.history
    }

    pub fn global_system(&self) -> &GlobalSystem {
        &self.state.system
    }

    /// Value of a field at a node, including prescribed values on eliminated slots.
    ///
    /// Returns `None` if the field is unknown or absent at the node.
    pub fn nodal_value(&self, node: usize, field: &str) -> Option<f64> {
        let dof_map = &self.discretization.dof_map;
        let field = dof_map.layout().field_index(field)?;
        let slot = dof_map.slot(node, field);
        match slot.active_index {
            Some(index) => Some(self.state.u[index]),
            None if slot.present => dof_map.prescribed_value(node, field, self.state.time),
            None => None,
        }
    }

    /// Resets the history to zero and commits it.
    pub fn init_history(&mut self) -> Result<(), AssemblyError> {
        self.assemble_at(CalculationMode::InitHistory, self.state.time, 1.0, TimeIntegrationFactors::steady())
    }

    /// Recomputes the projection of derived quantities at the trial state.
    pub fn project(&mut self) -> Result<&ProjectionBuffer, AssemblyError> {
        let dt = self.state.dt_old.unwrap_or(1.0);
        self.assemble_at(CalculationMode::Project, self.state.time, dt, TimeIntegrationFactors::steady())?;
        Ok(&self.state.projection)
    }

    /// Assembles residual and Jacobian at the trial state without solving.
    pub fn assemble(&mut self, time: f64, dt: f64) -> Result<&GlobalSystem, AssemblyError> {
        let factors = self.prepare_rates(dt);
        self.assemble_at(CalculationMode::ResidualAndJacobian, time, dt, factors)?;
        Ok(&self.state.system)
    }

    fn assemble_at(
        &mut self,
        mode: CalculationMode,
        time: f64,
        dt: f64,
        factors: TimeIntegrationFactors,
    ) -> Result<(), AssemblyError> {
        let state = &mut self.state;
        let mut trial = TrialSystem {
            discretization: &self.discretization,
            linear_solver: self.linear_solver.as_mut(),
            time,
            dt,
            factors,
            rate_offset: &state.rate_offset,
            rate: &mut state.rate,
            system: &mut state.system,
            history: &mut state.history,
            projection: &mut state.projection,
        };
        trial.assemble(mode, &DVectorView::from(&state.u))
    }

    /// Fills the `u`-independent part of the rate for a step of size `dt` and returns the
    /// matching integration factors.
    fn prepare_rates(&mut self, dt: f64) -> TimeIntegrationFactors {
        let state = &mut self.state;
        let coefficients = self
            .settings
            .time_stepping
            .scheme
            .rate_coefficients(dt, state.dt_old);
        state.rate_offset.copy_from(&state.u_old);
        state.rate_offset *= coefficients.old;
        state
            .rate_offset
            .axpy(coefficients.older, &state.u_older, 1.0);
        TimeIntegrationFactors {
            du: 1.0,
            dv: coefficients.current,
        }
    }

    fn solve_trial(
        &mut self,
        time: f64,
        dt: f64,
        factors: TimeIntegrationFactors,
    ) -> Result<NonlinearOutcome, AssemblyError> {
        let state = &mut self.state;
        state.u.copy_from(&state.u_old);
        state.history.rollback();

        let trial = TrialSystem {
            discretization: &self.discretization,
            linear_solver: self.linear_solver.as_mut(),
            time,
            dt,
            factors,
            rate_offset: &state.rate_offset,
            rate: &mut state.rate,
            system: &mut state.system,
            history: &mut state.history,
            projection: &mut state.projection,
        };
        self.solver.solve(trial, &mut state.u)
    }

    /// Solves the steady problem `R(u) = 0`, with all rates zero, and commits the result.
    ///
    /// The problem is evaluated at t = 1 with dt = 1, so boundary ramps reach `initial + rate`.
    pub fn solve_static(&mut self) -> Result<NonlinearOutcome, StepError> {
        let (time, dt) = (1.0, 1.0);
        self.state.rate_offset.fill(0.0);
        let factors = TimeIntegrationFactors::steady();
        let outcome = self.solve_trial(time, dt, factors)?;
        match outcome {
            NonlinearOutcome::Converged { iterations, .. } => {
                self.assemble_at(CalculationMode::UpdateHistory, time, dt, factors)?;
                self.state.u_older.copy_from(&self.state.u);
                self.state.u_old.copy_from(&self.state.u);
                self.state.time = time;
                info!("Static solve converged after {} iterations", iterations);
            }
            NonlinearOutcome::Diverged(reason) => {
                self.discard_step();
                info!("Static solve failed: {}", reason);
            }
        }
        Ok(outcome)
    }

    /// Runs the transient simulation with the configured time stepping settings.
    pub fn run_transient<O>(&mut self, observer: &mut O) -> Result<TransientSummary, StepError>
    where
        O: StepObserver<Self>,
    {
        let settings = self.settings.time_stepping.clone();
        run_transient(self, &settings, observer)
    }
}

impl TransientProblem for FeProblem {
    fn attempt_step(&mut self, time: f64, dt: f64) -> Result<NonlinearOutcome, StepError> {
        debug!("Attempting step to t = {:e} with dt = {:e}", time, dt);
        let factors = self.prepare_rates(dt);
        let outcome = self.solve_trial(time, dt, factors)?;
        Ok(outcome)
    }

    fn commit_step(&mut self, step: &CommittedStep) -> Result<(), StepError> {
        let factors = self.prepare_rates(step.dt);
        self.assemble_at(CalculationMode::UpdateHistory, step.time, step.dt, factors)?;
        let state = &mut self.state;
        state.u_older.copy_from(&state.u_old);
        state.u_old.copy_from(&state.u);
        state.dt_old = Some(step.dt);
        state.time = step.time;
        Ok(())
    }

    fn discard_step(&mut self) {
        let state = &mut self.state;
        state.u.copy_from(&state.u_old);
        state.history.rollback();
    }
}
