use matrixcompare::assert_matrix_eq;
use multifem::assembly::{
    Assembler, AssemblyState, AssemblyStrategy, FeModel, GlobalSystem, HistoryStorage, ProjectionBuffer,
};
use multifem::boundary::NaturalBc;
use multifem::dof::{BoundaryValue, DofMap, EssentialBc};
use multifem::element::ElementShape;
use multifem::error::{AssemblyError, KernelError};
use multifem::kernel::{
    CahnHilliard, CalculationMode, Diffusion, ElementKernel, KernelRegistry, LocalBuffers, PointHistory, Poisson,
    QuadraturePoint, SmallStrainMechanics, TimeIntegrationFactors,
};
use multifem::material::{
    ConstantMaterial, DoubleWellChemistry, LameParameters, LinearElasticMaterial, MaterialEvaluator, MaterialInput,
    MaterialOutputs,
};
use multifem::mesh::procedural::{create_line_mesh_1d, create_rectangular_quad_mesh_2d};
use multifem::mesh::{Mesh, MeshElement};
use nalgebra::{DMatrix, DVector, DVectorView, Point3};

/// Everything needed to call the element loop on a fixed model.
struct Fixture<M> {
    mesh: Mesh,
    kernels: KernelRegistry,
    dof_map: DofMap,
    materials: M,
}

struct Buffers {
    system: GlobalSystem,
    history: HistoryStorage,
    projection: ProjectionBuffer,
}

impl<M: MaterialEvaluator> Fixture<M> {
    fn new(mesh: Mesh, kernels: KernelRegistry, bcs: &[EssentialBc], materials: M) -> Self {
        let layout = kernels.dof_layout().unwrap();
        let dof_map = DofMap::build(&mesh, &layout, bcs).unwrap();
        Self {
            mesh,
            kernels,
            dof_map,
            materials,
        }
    }

    fn model(&self) -> FeModel {
        FeModel {
            mesh: &self.mesh,
            dof_map: &self.dof_map,
            kernels: &self.kernels,
            materials: &self.materials,
        }
    }

    fn assembler(&self, strategy: AssemblyStrategy) -> Assembler {
        Assembler::new(&self.model(), strategy).unwrap()
    }

    fn buffers(&self, assembler: &Assembler) -> Buffers {
        Buffers {
            system: GlobalSystem::new(&self.dof_map),
            history: assembler.history_storage(&self.model()),
            projection: assembler.projection_buffer(&self.model()),
        }
    }

    fn form_fe(
        &self,
        assembler: &Assembler,
        mode: CalculationMode,
        factors: TimeIntegrationFactors,
        u: &DVector<f64>,
        v: &DVector<f64>,
        buffers: &mut Buffers,
    ) -> Result<(), AssemblyError> {
        let state = AssemblyState {
            time: 0.0,
            dt: 0.1,
            factors,
            u: DVectorView::from(u),
            v: DVectorView::from(v),
        };
        assembler.form_fe(
            mode,
            &self.model(),
            &state,
            &mut buffers.system,
            &mut buffers.history,
            &mut buffers.projection,
        )
    }

    /// Steady residual and dense Jacobian at `u`.
    fn steady_system(&self, strategy: AssemblyStrategy, u: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let assembler = self.assembler(strategy);
        let mut buffers = self.buffers(&assembler);
        let v = DVector::zeros(u.len());
        self.form_fe(
            &assembler,
            CalculationMode::ResidualAndJacobian,
            TimeIntegrationFactors::steady(),
            u,
            &v,
            &mut buffers,
        )
        .unwrap();
        (buffers.system.residual, DMatrix::from(&buffers.system.jacobian))
    }
}

fn poisson_segment_mesh(vertices: Vec<Point3<f64>>, elements: Vec<[usize; 2]>) -> Mesh {
    let elements = elements
        .into_iter()
        .map(|nodes| MeshElement::new(ElementShape::Segment2, nodes.to_vec(), "poisson"))
        .collect();
    Mesh::from_vertices_and_elements(1, vertices, elements)
}

fn poisson_kernels() -> KernelRegistry {
    KernelRegistry::new().with_kernel("poisson", Poisson)
}

fn source(value: f64) -> ConstantMaterial {
    ConstantMaterial::new().with_scalar("source", value)
}

#[test]
fn global_system_is_sum_of_element_contributions() {
    let x = [0.0, 0.7, 2.0];
    let p = |x: f64| Point3::new(x, 0.0, 0.0);
    let u = [0.3, -1.2, 2.5];

    let global = Fixture::new(
        poisson_segment_mesh(x.iter().copied().map(p).collect(), vec![[0, 1], [1, 2]]),
        poisson_kernels(),
        &[],
        source(2.0),
    );
    let (r, j) = global.steady_system(AssemblyStrategy::Serial, &DVector::from_column_slice(&u));

    let mut r_expected = DVector::<f64>::zeros(3);
    let mut j_expected = DMatrix::<f64>::zeros(3, 3);
    for e in 0..2 {
        let single = Fixture::new(
            poisson_segment_mesh(vec![p(x[e]), p(x[e + 1])], vec![[0, 1]]),
            poisson_kernels(),
            &[],
            source(2.0),
        );
        let (r_e, j_e) = single.steady_system(AssemblyStrategy::Serial, &DVector::from_column_slice(&u[e..e + 2]));
        for a in 0..2 {
            r_expected[e + a] += r_e[a];
            for b in 0..2 {
                j_expected[(e + a, e + b)] += j_e[(a, b)];
            }
        }
    }

    assert_matrix_eq!(r, r_expected, comp = abs, tol = 1e-13);
    assert_matrix_eq!(j, j_expected, comp = abs, tol = 1e-13);
}

#[test]
fn colored_assembly_matches_serial_assembly() {
    let mesh = create_rectangular_quad_mesh_2d(1.0, 1.0, 5, 4, "ch");
    let chemistry = DoubleWellChemistry {
        mobility: 1.3,
        kappa: 0.02,
        barrier: 2.0,
    };
    let fixture = Fixture::new(mesh, KernelRegistry::new().with_kernel("ch", CahnHilliard), &[], chemistry);
    let n = fixture.dof_map.num_active_dofs();
    let u = DVector::from_fn(n, |i, _| 0.5 + 0.4 * ((i as f64) * 1.7).sin());

    let (r_serial, j_serial) = fixture.steady_system(AssemblyStrategy::Serial, &u);
    let (r_colored, j_colored) = fixture.steady_system(AssemblyStrategy::Colored, &u);
    assert_matrix_eq!(r_serial, r_colored, comp = abs, tol = 1e-12);
    assert_matrix_eq!(j_serial, j_colored, comp = abs, tol = 1e-12);
}

#[test]
fn cahn_hilliard_jacobian_matches_finite_differences() {
    let mesh = create_rectangular_quad_mesh_2d(1.0, 1.0, 2, 2, "ch");
    let chemistry = DoubleWellChemistry {
        mobility: 0.8,
        kappa: 0.05,
        barrier: 1.5,
    };
    let fixture = Fixture::new(mesh, KernelRegistry::new().with_kernel("ch", CahnHilliard), &[], chemistry);
    let assembler = fixture.assembler(AssemblyStrategy::Serial);
    let mut buffers = fixture.buffers(&assembler);
    let n = fixture.dof_map.num_active_dofs();

    // Backward Euler with dt = 0.1: v = (u - u_old) / dt
    let dt = 0.1;
    let factors = TimeIntegrationFactors::backward_euler(dt);
    let u_old = DVector::from_fn(n, |i, _| 0.5 + 0.3 * ((i as f64) * 0.9).cos());
    let u = DVector::from_fn(n, |i, _| u_old[i] + 0.05 * ((i as f64) * 2.3).sin());
    let residual = |u: &DVector<f64>, buffers: &mut Buffers| {
        let v = (u - &u_old) / dt;
        fixture
            .form_fe(&assembler, CalculationMode::Residual, factors, u, &v, buffers)
            .unwrap();
        buffers.system.residual.clone()
    };

    let v = (&u - &u_old) / dt;
    fixture
        .form_fe(&assembler, CalculationMode::Jacobian, factors, &u, &v, &mut buffers)
        .unwrap();
    let jacobian = DMatrix::from(&buffers.system.jacobian);

    let h = 1e-6;
    let mut fd_jacobian = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let mut u_plus = u.clone();
        u_plus[j] += h;
        let mut u_minus = u.clone();
        u_minus[j] -= h;
        let column = (residual(&u_plus, &mut buffers) - residual(&u_minus, &mut buffers)) / (2.0 * h);
        fd_jacobian.set_column(j, &column);
    }

    assert_matrix_eq!(jacobian, fd_jacobian, comp = abs, tol = 1e-6);
}

#[test]
fn eliminated_slots_are_masked_and_gathered_from_prescribed_values() {
    let mesh = create_line_mesh_1d(1.0, 1, "poisson");
    let bc = EssentialBc::new("u", ["left"]).with_value(BoundaryValue::Constant(1.0));
    let fixture = Fixture::new(mesh, poisson_kernels(), &[bc], ConstantMaterial::new());
    assert_eq!(fixture.dof_map.num_active_dofs(), 1);

    // Only the right node is unknown, so R = u_1 - u_0 = -1 and J = 1
    let (r, j) = fixture.steady_system(AssemblyStrategy::Serial, &DVector::zeros(1));
    assert_matrix_eq!(r, DVector::from_element(1, -1.0), comp = abs, tol = 1e-14);
    assert_matrix_eq!(j, DMatrix::from_element(1, 1, 1.0), comp = abs, tol = 1e-14);
}

#[test]
fn non_finite_material_output_is_recoverable_divergence() {
    fn nan_diffusivity(_: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        outputs.set_scalar("D", f64::NAN);
        Ok(())
    }
    let mesh = create_line_mesh_1d(1.0, 3, "diffusion");
    let fixture = Fixture::new(
        mesh,
        KernelRegistry::new().with_kernel("diffusion", Diffusion),
        &[],
        nan_diffusivity,
    );
    let assembler = fixture.assembler(AssemblyStrategy::Serial);
    let mut buffers = fixture.buffers(&assembler);
    let u = DVector::zeros(4);

    let err = fixture
        .form_fe(
            &assembler,
            CalculationMode::Residual,
            TimeIntegrationFactors::steady(),
            &u,
            &u,
            &mut buffers,
        )
        .unwrap_err();
    assert!(matches!(err, AssemblyError::Diverged { element: 0, .. }));
    assert!(err.is_recoverable());
}

#[test]
fn failing_material_is_reported_with_its_element() {
    fn failing(input: &MaterialInput, outputs: &mut MaterialOutputs) -> eyre::Result<()> {
        if input.element == 2 {
            eyre::bail!("return mapping did not converge");
        }
        outputs.set_scalar("D", 1.0);
        Ok(())
    }
    let mesh = create_line_mesh_1d(1.0, 3, "diffusion");
    let fixture = Fixture::new(mesh, KernelRegistry::new().with_kernel("diffusion", Diffusion), &[], failing);
    let assembler = fixture.assembler(AssemblyStrategy::Serial);
    let mut buffers = fixture.buffers(&assembler);
    let u = DVector::zeros(4);

    let err = fixture
        .form_fe(
            &assembler,
            CalculationMode::ResidualAndJacobian,
            TimeIntegrationFactors::steady(),
            &u,
            &u,
            &mut buffers,
        )
        .unwrap_err();
    assert!(matches!(err, AssemblyError::Material { element: 2, .. }));
    assert!(err.is_recoverable());
}

#[test]
fn assembler_rejects_unconfigured_physics() {
    let mesh = create_line_mesh_1d(1.0, 2, "poisson");
    let layout = poisson_kernels().dof_layout().unwrap();
    let dof_map = DofMap::build(&mesh, &layout, &[]).unwrap();
    let kernels = KernelRegistry::new().with_kernel("diffusion", Diffusion);
    let materials = ConstantMaterial::new();
    let model = FeModel {
        mesh: &mesh,
        dof_map: &dof_map,
        kernels: &kernels,
        materials: &materials,
    };

    let err = Assembler::new(&model, AssemblyStrategy::Serial).unwrap_err();
    assert!(matches!(err, AssemblyError::MissingKernel { element: 0, .. }));
    assert!(!err.is_recoverable());
}

#[test]
fn assembler_rejects_unsupported_dimension() {
    let mesh = create_line_mesh_1d(1.0, 2, "solid");
    let kernels = KernelRegistry::new().with_kernel("solid", SmallStrainMechanics::new(2).unwrap());
    let layout = kernels.dof_layout().unwrap();
    let dof_map = DofMap::build(&mesh, &layout, &[]).unwrap();
    let materials = ConstantMaterial::new();
    let model = FeModel {
        mesh: &mesh,
        dof_map: &dof_map,
        kernels: &kernels,
        materials: &materials,
    };

    let err = Assembler::new(&model, AssemblyStrategy::Colored).unwrap_err();
    assert!(matches!(
        err,
        AssemblyError::Kernel {
            error: KernelError::UnsupportedDimension { dim: 1, .. },
            ..
        }
    ));
    assert!(!err.is_recoverable());
}

/// Counts how often its history has been advanced: every evaluation writes `old + 1`.
struct StepCounter;

impl ElementKernel for StepCounter {
    fn name(&self) -> &str {
        "step-counter"
    }

    fn fields(&self) -> &[&'static str] {
        &["u"]
    }

    fn supports_dimension(&self, _dim: usize) -> bool {
        true
    }

    fn history_len(&self) -> usize {
        1
    }

    fn compute(
        &self,
        mode: CalculationMode,
        point: &QuadraturePoint,
        history: PointHistory,
        local: &mut LocalBuffers,
    ) -> Result<(), KernelError> {
        if mode == CalculationMode::InitHistory {
            history.current[0] = 0.0;
            return Ok(());
        }
        history.current[0] = history.old[0] + 1.0;
        if mode.computes_residual() {
            for (i, n) in point.shape.values().iter().enumerate() {
                local.residual[i] += n * point.fields.values[0];
            }
        }
        Ok(())
    }
}

#[test]
fn committed_history_only_changes_on_update() {
    let mesh = create_line_mesh_1d(1.0, 3, "counter");
    let fixture = Fixture::new(
        mesh,
        KernelRegistry::new().with_kernel("counter", StepCounter),
        &[],
        ConstantMaterial::new(),
    );
    for strategy in [AssemblyStrategy::Serial, AssemblyStrategy::Colored] {
        let assembler = fixture.assembler(strategy);
        let mut buffers = fixture.buffers(&assembler);
        let u = DVector::zeros(4);
        let run = |mode, buffers: &mut Buffers| {
            fixture
                .form_fe(&assembler, mode, TimeIntegrationFactors::steady(), &u, &u, buffers)
                .unwrap()
        };
        let all_equal = |values: &[f64], expected: f64| !values.is_empty() && values.iter().all(|&x| x == expected);

        run(CalculationMode::InitHistory, &mut buffers);
        assert!(all_equal(buffers.history.old(), 0.0));
        assert!(all_equal(buffers.history.current(), 0.0));

        // Repeated trial evaluations start from the committed history every time
        run(CalculationMode::Residual, &mut buffers);
        run(CalculationMode::ResidualAndJacobian, &mut buffers);
        assert!(all_equal(buffers.history.current(), 1.0));
        assert!(all_equal(buffers.history.old(), 0.0));

        run(CalculationMode::UpdateHistory, &mut buffers);
        assert!(all_equal(buffers.history.old(), 1.0));

        run(CalculationMode::Residual, &mut buffers);
        assert!(all_equal(buffers.history.current(), 2.0));
        buffers.history.rollback();
        assert!(all_equal(buffers.history.current(), 1.0));
        assert_eq!(buffers.history.values_per_point(0), 1);
        assert_eq!(buffers.history.element_old(1), buffers.history.element_current(1));
    }
}

#[test]
fn projection_of_linear_field_has_constant_flux() {
    let mesh = create_line_mesh_1d(2.0, 4, "poisson");
    let fixture = Fixture::new(mesh, poisson_kernels(), &[], ConstantMaterial::new());
    let assembler = fixture.assembler(AssemblyStrategy::Serial);
    let mut buffers = fixture.buffers(&assembler);
    // u = 3x on nodes at x = 0, 0.5, ..., 2
    let u = DVector::from_fn(5, |i, _| 1.5 * i as f64);

    fixture
        .form_fe(
            &assembler,
            CalculationMode::Project,
            TimeIntegrationFactors::steady(),
            &u,
            &DVector::zeros(5),
            &mut buffers,
        )
        .unwrap();

    let projection = &buffers.projection;
    assert_eq!(projection.names(), &["flux_x", "flux_y", "flux_z"]);
    let flux = projection.nodal_values("flux_x").unwrap();
    for value in flux {
        assert!((value + 3.0).abs() < 1e-12, "flux {}", value);
    }
    // Lumped weights sum to the length of the domain
    let total_weight: f64 = (0..5).map(|node| projection.weight(node)).sum();
    assert!((total_weight - 2.0).abs() < 1e-12);
    assert!(projection.nodal_values("stress").is_none());
}

#[test]
fn boundary_loads_enter_the_residual_but_not_the_jacobian() {
    let fixture = Fixture::new(
        create_rectangular_quad_mesh_2d(1.0, 1.0, 2, 2, "solid"),
        KernelRegistry::new().with_kernel("solid", SmallStrainMechanics::new(2).unwrap()),
        &[EssentialBc::new("uy", ["bottom"])],
        LinearElasticMaterial {
            lame: LameParameters { mu: 1.0, lambda: 1.0 },
        },
    );
    let model = fixture.model();
    let traction = NaturalBc::traction(
        ["ux", "uy"],
        ["right"],
        [BoundaryValue::Constant(4.0), BoundaryValue::Ramp { initial: 2.0, rate: 20.0 }],
    );
    let loaded = Assembler::new(&model, AssemblyStrategy::Serial)
        .unwrap()
        .with_natural_bcs(&model, &[traction])
        .unwrap();
    assert_eq!(loaded.boundary_loads().len(), 1);

    let n = fixture.dof_map.num_active_dofs();
    let (u, v) = (DVector::zeros(n), DVector::zeros(n));
    let mut buffers = fixture.buffers(&loaded);
    fixture
        .form_fe(&loaded, CalculationMode::ResidualAndJacobian, TimeIntegrationFactors::steady(), &u, &v, &mut buffers)
        .unwrap();

    // Zero displacement leaves only the load: -t_a times the nodal edge weights 1/4, 1/2, 1/4.
    // The ramp is evaluated at t = 0.
    let index = |node: usize, field: usize| fixture.dof_map.slot(node, field).active_index;
    let mut expected = DVector::zeros(n);
    for (node, weight) in [(2, 0.25), (5, 0.5), (8, 0.25)] {
        expected[index(node, 0).unwrap()] = -4.0 * weight;
        if let Some(i) = index(node, 1) {
            expected[i] = -2.0 * weight;
        }
    }
    assert!(index(2, 1).is_none());
    assert_matrix_eq!(buffers.system.residual, expected, comp = abs, tol = 1e-13);

    let (_, unloaded_jacobian) = fixture.steady_system(AssemblyStrategy::Serial, &u);
    assert_matrix_eq!(DMatrix::from(&buffers.system.jacobian), unloaded_jacobian, comp = abs, tol = 1e-13);
}
