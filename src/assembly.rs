//! The element loop: interpolation, material and kernel evaluation and the global scatter.
use crate::boundary::{BoundaryLoads, NaturalBc};
use crate::coloring::sequential_greedy_coloring;
use crate::dof::DofMap;
use crate::element::{ElementShape, ShapeFunctionValues};
use crate::error::{AssemblyError, DofError};
use crate::kernel::{
    CalculationMode, ElementKernel, KernelRegistry, LocalBuffers, PointFields, PointHistory, QuadraturePoint,
    TimeIntegrationFactors,
};
use crate::material::{MaterialEvaluator, MaterialInput, MaterialOutputs};
use crate::mesh::Mesh;
use crate::quadrature::QuadratureRule;
use itertools::izip;
use log::debug;
use nalgebra::{DMatrix, DVector, DVectorView, Point3};
use nalgebra_sparse::CsrMatrix;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::ops::Range;
use thread_local::ThreadLocal;

/// How the element loop is executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssemblyStrategy {
    /// Elements in index order on the calling thread.
    #[default]
    Serial,
    /// Elements grouped into colors without shared nodes, each color processed in parallel.
    Colored,
}

/// The discrete model the element loop reads.
#[derive(Clone, Copy)]
pub struct FeModel<'a> {
    pub mesh: &'a Mesh,
    pub dof_map: &'a DofMap,
    pub kernels: &'a KernelRegistry,
    pub materials: &'a dyn MaterialEvaluator,
}

/// The trial state at which the system is assembled.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyState<'a> {
    pub time: f64,
    pub dt: f64,
    pub factors: TimeIntegrationFactors,
    /// Active unknowns.
    pub u: DVectorView<'a, f64>,
    /// Time derivatives of the active unknowns.
    pub v: DVectorView<'a, f64>,
}

/// Global residual and Jacobian over the active unknowns.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSystem {
    pub residual: DVector<f64>,
    pub jacobian: CsrMatrix<f64>,
}

impl GlobalSystem {
    /// Allocates a zero system with the sparsity pattern of `dof_map`.
    pub fn new(dof_map: &DofMap) -> Self {
        let pattern = dof_map.sparsity_pattern();
        let nnz = pattern.nnz();
        let jacobian = CsrMatrix::try_from_pattern_and_values(pattern, vec![0.0; nnz])
            .expect("value count matches the pattern by construction");
        Self {
            residual: DVector::zeros(dof_map.num_active_dofs()),
            jacobian,
        }
    }
}

/// History variables of all quadrature points, as a trial arena and a committed arena.
///
/// The committed values only change through [`commit`](Self::commit).
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryStorage {
    offsets: Vec<usize>,
    values_per_point: Vec<usize>,
    current: Vec<f64>,
    old: Vec<f64>,
}

impl HistoryStorage {
    fn range(&self, element: usize) -> Range<usize> {
        self.offsets[element]..self.offsets[element + 1]
    }

    pub fn values_per_point(&self, element: usize) -> usize {
        self.values_per_point[element]
    }

    pub fn current(&self) -> &[f64] {
        &self.current
    }

    pub fn old(&self) -> &[f64] {
        &self.old
    }

    pub fn element_current(&self, element: usize) -> &[f64] {
        &self.current[self.range(element)]
    }

    pub fn element_old(&self, element: usize) -> &[f64] {
        &self.old[self.range(element)]
    }

    /// Copies the trial values into the committed arena.
    pub fn commit(&mut self) {
        self.old.copy_from_slice(&self.current);
    }

    /// Restores the trial values from the committed arena.
    pub fn rollback(&mut self) {
        self.current.copy_from_slice(&self.old);
    }
}

/// Nodal projection of derived quantities.
///
/// Node-major with `1 + num_components` scalars per node: the accumulated weight followed by the
/// weighted component sums.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionBuffer {
    names: Vec<String>,
    data: Vec<f64>,
}

impl ProjectionBuffer {
    pub fn new(num_nodes: usize, names: Vec<String>) -> Self {
        let data = vec![0.0; num_nodes * (1 + names.len())];
        Self { names, data }
    }

    pub fn stride(&self) -> usize {
        1 + self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_nodes(&self) -> usize {
        self.data.len() / self.stride()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    pub fn weight(&self, node: usize) -> f64 {
        self.data[self.stride() * node]
    }

    /// Weighted average of the component at the node, or zero for nodes without weight.
    pub fn nodal_value(&self, node: usize, component: usize) -> f64 {
        let weight = self.weight(node);
        if weight > 0.0 {
            self.data[self.stride() * node + 1 + component] / weight
        } else {
            0.0
        }
    }

    pub fn nodal_values(&self, name: &str) -> Option<Vec<f64>> {
        let component = self.names.iter().position(|n| n == name)?;
        Some(
            (0..self.num_nodes())
                .map(|node| self.nodal_value(node, component))
                .collect(),
        )
    }
}

/// Scratch buffers of one element, sized by the largest element seen so far.
#[derive(Debug)]
struct ElementWorkspace {
    vertices: Vec<Point3<f64>>,
    local_u: Vec<f64>,
    local_v: Vec<f64>,
    shape: ShapeFunctionValues,
    fields: PointFields,
    material: MaterialOutputs,
    point: LocalBuffers,
    element_residual: DVector<f64>,
    element_jacobian: DMatrix<f64>,
    element_projection: Vec<f64>,
    history: Vec<f64>,
}

impl Default for ElementWorkspace {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            local_u: Vec::new(),
            local_v: Vec::new(),
            shape: ShapeFunctionValues::default(),
            fields: PointFields::default(),
            material: MaterialOutputs::default(),
            point: LocalBuffers::default(),
            element_residual: DVector::zeros(0),
            element_jacobian: DMatrix::zeros(0, 0),
            element_projection: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl ElementWorkspace {
    fn prepare(&mut self, num_local_dofs: usize, projection_len: usize) {
        self.vertices.clear();
        self.local_u.clear();
        self.local_v.clear();
        self.element_residual.resize_vertically_mut(num_local_dofs, 0.0);
        self.element_residual.fill(0.0);
        self.element_jacobian.resize_mut(num_local_dofs, num_local_dofs, 0.0);
        self.element_jacobian.fill(0.0);
        self.element_projection.clear();
        self.element_projection.resize(projection_len, 0.0);
    }
}

/// Global buffers written by the scatter.
struct ScatterTarget<'a> {
    residual: &'a mut DVector<f64>,
    jacobian: &'a mut CsrMatrix<f64>,
    history: &'a mut [f64],
    projection: &'a mut ProjectionBuffer,
}

impl ScatterTarget<'_> {
    fn load_history(&self, range: Range<usize>, ws: &mut ElementWorkspace) {
        ws.history.copy_from_slice(&self.history[range]);
    }

    fn scatter(
        &mut self,
        mode: CalculationMode,
        model: &FeModel,
        element: usize,
        history_range: Range<usize>,
        ws: &ElementWorkspace,
    ) -> Result<(), AssemblyError> {
        let dofs = model.dof_map.element_dofs(element);

        if mode.computes_residual() {
            for (&row, &activity, &position) in izip!(dofs.indices, dofs.activity, dofs.local_positions) {
                if activity != 0.0 {
                    self.residual[row] += activity * ws.element_residual[position];
                }
            }
        }

        if mode.computes_jacobian() {
            for (&row, &row_activity, &row_position) in izip!(dofs.indices, dofs.activity, dofs.local_positions) {
                if row_activity == 0.0 {
                    continue;
                }
                let mut csr_row = self.jacobian.row_mut(row);
                let (cols, values) = csr_row.cols_and_values_mut();
                for (&col, &col_activity, &col_position) in izip!(dofs.indices, dofs.activity, dofs.local_positions) {
                    if col_activity == 0.0 {
                        continue;
                    }
                    let k = cols
                        .binary_search(&col)
                        .map_err(|_| AssemblyError::SparsityMismatch { row, col })?;
                    values[k] += row_activity * col_activity * ws.element_jacobian[(row_position, col_position)];
                }
            }
        }

        if mode == CalculationMode::Project {
            let stride = self.projection.stride();
            let connectivity = &model.mesh.elements()[element].connectivity;
            for (local_node, &node) in connectivity.iter().enumerate() {
                let source = &ws.element_projection[stride * local_node..stride * (local_node + 1)];
                let target = &mut self.projection.data[stride * node..stride * (node + 1)];
                for (t, s) in target.iter_mut().zip(source) {
                    *t += s;
                }
            }
        }

        self.history[history_range].copy_from_slice(&ws.history);
        Ok(())
    }
}

/// Whether the element has any work to do in the given mode.
fn participates(mode: CalculationMode, kernel: &dyn ElementKernel) -> bool {
    match mode {
        CalculationMode::InitHistory | CalculationMode::UpdateHistory => kernel.history_len() > 0,
        CalculationMode::Project => !kernel.projection_names().is_empty(),
        _ => true,
    }
}

fn is_finite(values: &[f64]) -> bool {
    values.iter().all(|x| x.is_finite())
}

/// Computes the element-local contributions of `element` into `ws`.
///
/// `ws.history` must hold the element's trial history on entry.
#[allow(clippy::too_many_arguments)]
fn compute_element(
    mode: CalculationMode,
    model: &FeModel,
    state: &AssemblyState,
    rule: &QuadratureRule,
    element_index: usize,
    history_old: &[f64],
    projection_stride: usize,
    ws: &mut ElementWorkspace,
) -> Result<(), AssemblyError> {
    let mesh_element = &model.mesh.elements()[element_index];
    let kernel = model
        .kernels
        .get(&mesh_element.physics)
        .ok_or_else(|| AssemblyError::MissingKernel {
            element: element_index,
            physics: mesh_element.physics.clone(),
        })?;
    let slots = model
        .dof_map
        .layout()
        .physics_fields(&mesh_element.physics)
        .ok_or_else(|| AssemblyError::MissingKernel {
            element: element_index,
            physics: mesh_element.physics.clone(),
        })?;

    let field_names = kernel.fields();
    let num_fields = field_names.len();
    let num_nodes = mesh_element.connectivity.len();
    let num_local_dofs = num_nodes * num_fields;
    let history_len = kernel.history_len();
    let num_projections = kernel.projection_names().len();

    ws.prepare(num_local_dofs, num_nodes * projection_stride);
    if mode == CalculationMode::InitHistory {
        ws.history.fill(0.0);
    }

    // Gather nodal values in the kernel's node-major layout, eliminated slots take their
    // prescribed values
    for &node in &mesh_element.connectivity {
        ws.vertices.push(model.mesh.vertices()[node]);
        for &field in slots {
            let (u, v) = match model.dof_map.slot(node, field).active_index {
                Some(index) => (state.u[index], state.v[index]),
                None => (
                    model
                        .dof_map
                        .prescribed_value(node, field, state.time)
                        .unwrap_or(0.0),
                    model.dof_map.prescribed_rate(node, field).unwrap_or(0.0),
                ),
            };
            ws.local_u.push(u);
            ws.local_v.push(v);
        }
    }

    for (q, (w, xi)) in rule.iter().enumerate() {
        ws.shape
            .evaluate(mesh_element.shape, xi, &ws.vertices)
            .map_err(|err| AssemblyError::DegenerateElement {
                element: element_index,
                determinant: err.determinant,
            })?;
        let weight = w * ws.shape.determinant();

        ws.fields.resize(num_fields);
        for (i, (&n, grad_n)) in ws.shape.values().iter().zip(ws.shape.gradients()).enumerate() {
            ws.fields.coords += ws.vertices[i].coords * n;
            for k in 0..num_fields {
                let u = ws.local_u[num_fields * i + k];
                ws.fields.values[k] += n * u;
                ws.fields.gradients[k] += grad_n * u;
                ws.fields.rates[k] += n * ws.local_v[num_fields * i + k];
            }
        }

        let point_history = q * history_len..(q + 1) * history_len;
        let point_history_old = &history_old[point_history.clone()];

        ws.material.clear();
        if mode != CalculationMode::InitHistory {
            let input = MaterialInput {
                physics: &mesh_element.physics,
                element: element_index,
                block: mesh_element.material,
                dim: model.mesh.dim(),
                time: state.time,
                dt: state.dt,
                field_names,
                fields: &ws.fields,
                history_old: point_history_old,
            };
            model
                .materials
                .evaluate(&input, &mut ws.material)
                .map_err(|report| AssemblyError::Material {
                    element: element_index,
                    report,
                })?;
            if !ws.material.is_finite() {
                return Err(AssemblyError::Diverged {
                    element: element_index,
                    quadrature_point: q,
                });
            }
        }

        ws.point.reset(num_local_dofs, num_projections);
        let point = QuadraturePoint {
            dim: model.mesh.dim(),
            time: state.time,
            dt: state.dt,
            factors: state.factors,
            weight,
            shape: &ws.shape,
            fields: &ws.fields,
            material: &ws.material,
        };
        let history = PointHistory {
            current: &mut ws.history[point_history],
            old: point_history_old,
        };
        kernel
            .compute(mode, &point, history, &mut ws.point)
            .map_err(|error| AssemblyError::Kernel {
                element: element_index,
                error,
            })?;
        if !ws.point.is_finite() {
            return Err(AssemblyError::Diverged {
                element: element_index,
                quadrature_point: q,
            });
        }

        if mode.computes_residual() {
            ws.element_residual.axpy(weight, &ws.point.residual, 1.0);
        }
        if mode.computes_jacobian() {
            for (target, value) in ws.element_jacobian.iter_mut().zip(ws.point.jacobian.iter()) {
                *target += weight * value;
            }
        }
        if mode == CalculationMode::Project {
            for (i, &n) in ws.shape.values().iter().enumerate() {
                let node_projection = &mut ws.element_projection[projection_stride * i..projection_stride * (i + 1)];
                node_projection[0] += n * weight;
                for (target, value) in node_projection[1..].iter_mut().zip(&ws.point.projection) {
                    *target += n * weight * value;
                }
            }
        }
    }

    if mode.is_history_mode() && !is_finite(&ws.history) {
        return Err(AssemblyError::Diverged {
            element: element_index,
            quadrature_point: 0,
        });
    }
    Ok(())
}

/// Runs the element loop ("FormFE") over a mesh.
///
/// Owns the quadrature rules, the element coloring and the per-thread scratch buffers, so a
/// single assembler is reused for every Newton iteration of a run.
#[derive(Debug)]
pub struct Assembler {
    strategy: AssemblyStrategy,
    rules: Vec<(ElementShape, QuadratureRule)>,
    colors: Vec<Vec<usize>>,
    boundary_loads: BoundaryLoads,
    workspace: RefCell<ElementWorkspace>,
    par_workspace: ThreadLocal<RefCell<ElementWorkspace>>,
}

impl Assembler {
    /// Checks that every element has a kernel supporting the mesh dimension and prepares the
    /// quadrature rules.
    pub fn new(model: &FeModel, strategy: AssemblyStrategy) -> Result<Self, AssemblyError> {
        let mut rules: Vec<(ElementShape, QuadratureRule)> = Vec::new();
        for (index, element) in model.mesh.elements().iter().enumerate() {
            let kernel = model
                .kernels
                .get(&element.physics)
                .ok_or_else(|| AssemblyError::MissingKernel {
                    element: index,
                    physics: element.physics.clone(),
                })?;
            kernel
                .check_dimension(model.mesh.dim())
                .map_err(|error| AssemblyError::Kernel { element: index, error })?;
            if !rules.iter().any(|(shape, _)| *shape == element.shape) {
                rules.push((element.shape, QuadratureRule::default_for(element.shape)));
            }
        }

        let colors = match strategy {
            AssemblyStrategy::Serial => Vec::new(),
            AssemblyStrategy::Colored => {
                let element_nodes: Vec<&[usize]> = model
                    .mesh
                    .elements()
                    .iter()
                    .map(|element| element.connectivity.as_slice())
                    .collect();
                let colors = sequential_greedy_coloring(&element_nodes);
                debug!("Partitioned {} elements into {} colors", element_nodes.len(), colors.len());
                colors
            }
        };

        Ok(Self {
            strategy,
            rules,
            colors,
            boundary_loads: BoundaryLoads::default(),
            workspace: RefCell::new(ElementWorkspace::default()),
            par_workspace: ThreadLocal::new(),
        })
    }

    pub fn strategy(&self) -> AssemblyStrategy {
        self.strategy
    }

    /// Replaces the default quadrature rule of a shape.
    pub fn with_quadrature(mut self, shape: ElementShape, rule: QuadratureRule) -> Self {
        self.rules.retain(|(s, _)| *s != shape);
        self.rules.push((shape, rule));
        self
    }

    /// Resolves natural boundary conditions, whose loads are added to every residual.
    pub fn with_natural_bcs(mut self, model: &FeModel, bcs: &[NaturalBc]) -> Result<Self, DofError> {
        self.boundary_loads = BoundaryLoads::build(model.mesh, model.dof_map, bcs)?;
        Ok(self)
    }

    pub fn boundary_loads(&self) -> &BoundaryLoads {
        &self.boundary_loads
    }

    fn rule(rules: &[(ElementShape, QuadratureRule)], shape: ElementShape) -> &QuadratureRule {
        rules
            .iter()
            .find(|(s, _)| *s == shape)
            .map(|(_, rule)| rule)
            .expect("rules cover every shape of the mesh")
    }

    /// Allocates zeroed history storage for every quadrature point of the mesh.
    pub fn history_storage(&self, model: &FeModel) -> HistoryStorage {
        let mut offsets = Vec::with_capacity(model.mesh.num_elements() + 1);
        let mut values_per_point = Vec::with_capacity(model.mesh.num_elements());
        offsets.push(0);
        for element in model.mesh.elements() {
            let n = model
                .kernels
                .get(&element.physics)
                .map(|kernel| kernel.history_len())
                .unwrap_or(0);
            let num_points = Self::rule(&self.rules, element.shape).len();
            values_per_point.push(n);
            offsets.push(offsets.last().copied().unwrap_or(0) + n * num_points);
        }
        let total = offsets.last().copied().unwrap_or(0);
        HistoryStorage {
            offsets,
            values_per_point,
            current: vec![0.0; total],
            old: vec![0.0; total],
        }
    }

    /// Allocates a projection buffer wide enough for every kernel of the mesh.
    ///
    /// Components are named after the kernel with the most projected quantities.
    pub fn projection_buffer(&self, model: &FeModel) -> ProjectionBuffer {
        let names = model
            .mesh
            .elements()
            .iter()
            .filter_map(|element| model.kernels.get(&element.physics))
            .map(|kernel| kernel.projection_names())
            .max_by_key(|names| names.len())
            .unwrap_or(&[])
            .iter()
            .map(|name| name.to_string())
            .collect();
        ProjectionBuffer::new(model.mesh.num_nodes(), names)
    }

    /// Runs the element loop in the given mode.
    ///
    /// Residual and Jacobian modes zero and fill `system`; residuals include the boundary loads.
    /// `InitHistory` zeroes the history and commits it; `UpdateHistory` lets each kernel
    /// recompute its history at the converged state and commits it. `Project` zeroes and fills
    /// `projection`. The committed history is never modified by other modes.
    pub fn form_fe(
        &self,
        mode: CalculationMode,
        model: &FeModel,
        state: &AssemblyState,
        system: &mut GlobalSystem,
        history: &mut HistoryStorage,
        projection: &mut ProjectionBuffer,
    ) -> Result<(), AssemblyError> {
        if mode.computes_residual() {
            system.residual.fill(0.0);
        }
        if mode.computes_jacobian() {
            system.jacobian.values_mut().fill(0.0);
        }
        match mode {
            CalculationMode::Project => projection.clear(),
            CalculationMode::InitHistory => history.current.fill(0.0),
            _ => {}
        }

        let HistoryStorage {
            offsets, current, old, ..
        } = history;
        let mut target = ScatterTarget {
            residual: &mut system.residual,
            jacobian: &mut system.jacobian,
            history: current,
            projection,
        };

        match self.strategy {
            AssemblyStrategy::Serial => self.run_serial(mode, model, state, offsets, old, &mut target)?,
            AssemblyStrategy::Colored => self.run_colored(mode, model, state, offsets, old, target)?,
        }

        if mode.computes_residual() {
            self.boundary_loads
                .add_to_residual(model.dof_map, state.time, &mut system.residual);
        }

        if mode.is_history_mode() {
            history.commit();
        }
        Ok(())
    }

    fn run_serial(
        &self,
        mode: CalculationMode,
        model: &FeModel,
        state: &AssemblyState,
        offsets: &[usize],
        history_old: &[f64],
        target: &mut ScatterTarget,
    ) -> Result<(), AssemblyError> {
        let ws = &mut *self.workspace.borrow_mut();
        let stride = target.projection.stride();
        for (index, element) in model.mesh.elements().iter().enumerate() {
            match model.kernels.get(&element.physics) {
                Some(kernel) if participates(mode, kernel) => {}
                _ => continue,
            }
            let range = offsets[index]..offsets[index + 1];
            ws.history.resize(range.len(), 0.0);
            target.load_history(range.clone(), ws);
            let rule = Self::rule(&self.rules, element.shape);
            compute_element(mode, model, state, rule, index, &history_old[range.clone()], stride, ws)?;
            target.scatter(mode, model, index, range, ws)?;
        }
        Ok(())
    }

    fn run_colored(
        &self,
        mode: CalculationMode,
        model: &FeModel,
        state: &AssemblyState,
        offsets: &[usize],
        history_old: &[f64],
        target: ScatterTarget,
    ) -> Result<(), AssemblyError> {
        let rules = &self.rules;
        let par_workspace = &self.par_workspace;
        let stride = target.projection.stride();
        let target = Mutex::new(target);

        for color in &self.colors {
            color
                .par_iter()
                .map(|&index| {
                    let element = &model.mesh.elements()[index];
                    match model.kernels.get(&element.physics) {
                        Some(kernel) if participates(mode, kernel) => {}
                        _ => return Ok(()),
                    }
                    let ws = &mut *par_workspace.get_or_default().borrow_mut();
                    let range = offsets[index]..offsets[index + 1];
                    ws.history.resize(range.len(), 0.0);
                    target.lock().load_history(range.clone(), ws);
                    let rule = Self::rule(rules, element.shape);
                    compute_element(mode, model, state, rule, index, &history_old[range.clone()], stride, ws)?;
                    // Elements of one color share no nodes, so the order of scatters within a
                    // color does not affect the result
                    target.lock().scatter(mode, model, index, range, ws)
                })
                .collect::<Result<(), AssemblyError>>()?;
        }
        Ok(())
    }
}
