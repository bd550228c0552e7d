use multifem::boundary::NaturalBc;
use multifem::dof::{BoundaryValue, EssentialBc};
use multifem::error::{DofError, StepError};
use multifem::kernel::{KernelRegistry, Poisson, SmallStrainMechanics};
use multifem::material::{LameParameters, LinearElasticMaterial, YoungPoisson};
use multifem::mesh::procedural::{create_box_hex_mesh_3d, create_line_mesh_1d, create_rectangular_quad_mesh_2d};
use multifem::problem::FeProblem;

/// lambda = mu = 400, so the uniaxial strain modulus lambda + 2 mu is 1200.
fn material() -> LinearElasticMaterial {
    LinearElasticMaterial {
        lame: LameParameters::from(YoungPoisson {
            young: 1e3,
            poisson: 0.25,
        }),
    }
}

fn poisson_bar(essential: EssentialBc, flux: NaturalBc) -> FeProblem {
    FeProblem::builder(
        create_line_mesh_1d(2.0, 8, "poisson"),
        KernelRegistry::new().with_kernel("poisson", Poisson),
    )
    .with_boundary_condition(essential)
    .with_natural_bc(flux)
    .build()
    .unwrap()
}

fn solid_2d(bcs: Vec<EssentialBc>, load: NaturalBc) -> FeProblem {
    FeProblem::builder(
        create_rectangular_quad_mesh_2d(1.0, 1.0, 3, 3, "solid"),
        KernelRegistry::new().with_kernel("solid", SmallStrainMechanics::new(2).unwrap()),
    )
    .with_boundary_conditions(bcs)
    .with_natural_bc(load)
    .with_materials(material())
    .build()
    .unwrap()
}

fn assert_nodal(problem: &FeProblem, field: &str, expected: impl Fn(&nalgebra::Point3<f64>) -> f64) {
    for (node, vertex) in problem.mesh().vertices().iter().enumerate() {
        let value = problem.nodal_value(node, field).unwrap();
        let exact = expected(vertex);
        assert!((value - exact).abs() < 1e-10, "{}({:?}) = {}, expected {}", field, vertex, value, exact);
    }
}

#[test]
fn neumann_flux_gives_linear_poisson_solution() {
    // du/dx = 2 at x = 2, u(0) = 0
    let mut problem = poisson_bar(
        EssentialBc::new("u", ["left"]),
        NaturalBc::flux("u", ["right"], BoundaryValue::Constant(2.0)),
    );
    let outcome = problem.solve_static().unwrap();
    assert_eq!(outcome.iterations(), Some(1));
    assert_nodal(&problem, "u", |x| 2.0 * x.x);

    // The outward normal at x = 0 points to -x, so an inflow of 3 means du/dx = -3.
    // Static solves evaluate ramps at t = 1.
    let mut problem = poisson_bar(
        EssentialBc::new("u", ["right"]),
        NaturalBc::flux("u", ["left"], BoundaryValue::Ramp { initial: 0.0, rate: 3.0 }),
    );
    problem.solve_static().unwrap();
    assert_nodal(&problem, "u", |x| 3.0 * (2.0 - x.x));
}

#[test]
fn uniform_traction_patch_test() {
    // sigma_xx = 10 with uy = 0 everywhere is uniaxial strain: ux = 10 x / 1200
    let mut problem = solid_2d(
        vec![
            EssentialBc::new("ux", ["left"]),
            EssentialBc::new("uy", ["left", "right", "bottom", "top"]),
        ],
        NaturalBc::traction(
            ["ux", "uy"],
            ["right"],
            [BoundaryValue::Constant(10.0), BoundaryValue::Constant(0.0)],
        ),
    );
    let outcome = problem.solve_static().unwrap();
    assert!(outcome.is_converged());
    assert_nodal(&problem, "ux", |x| x.x / 120.0);
    assert_nodal(&problem, "uy", |_| 0.0);
}

#[test]
fn pressure_pushes_against_the_outward_normal() {
    let mut problem = solid_2d(
        vec![
            EssentialBc::new("ux", ["left"]),
            EssentialBc::new("uy", ["left", "right", "bottom", "top"]),
        ],
        NaturalBc::pressure(["ux", "uy"], ["right"], BoundaryValue::Constant(10.0)),
    );
    problem.solve_static().unwrap();
    assert_nodal(&problem, "ux", |x| -x.x / 120.0);

    // Pressure on the z = 1 face of a box compresses it along z
    let mesh = create_box_hex_mesh_3d([1.0, 1.0, 1.0], [2, 2, 2], "solid");
    let lateral = ["left", "right", "bottom", "top", "back", "front"];
    let mut problem = FeProblem::builder(
        mesh,
        KernelRegistry::new().with_kernel("solid", SmallStrainMechanics::new(3).unwrap()),
    )
    .with_boundary_conditions(vec![
        EssentialBc::new("ux", lateral),
        EssentialBc::new("uy", lateral),
        EssentialBc::new("uz", ["back"]),
    ])
    .with_natural_bc(NaturalBc::pressure(["ux", "uy", "uz"], ["front"], BoundaryValue::Constant(12.0)))
    .with_materials(material())
    .build()
    .unwrap();
    problem.solve_static().unwrap();
    assert_nodal(&problem, "uz", |x| -x.z / 100.0);
    assert_nodal(&problem, "ux", |_| 0.0);
}

#[test]
fn invalid_natural_conditions_are_rejected() {
    let builder = || {
        FeProblem::builder(
            create_line_mesh_1d(1.0, 2, "poisson"),
            KernelRegistry::new().with_kernel("poisson", Poisson),
        )
        .with_boundary_condition(EssentialBc::new("u", ["left"]))
    };

    let err = builder()
        .with_natural_bc(NaturalBc::flux("u", ["middle"], BoundaryValue::Constant(1.0)))
        .build()
        .unwrap_err();
    assert!(matches!(err, StepError::Dof(DofError::InvalidBoundaryRegion { region }) if region == "middle"));

    let err = builder()
        .with_natural_bc(NaturalBc::flux("ux", ["right"], BoundaryValue::Constant(1.0)))
        .build()
        .unwrap_err();
    assert!(matches!(err, StepError::Dof(DofError::InvalidFieldName { region: None, .. })));

    let err = builder()
        .with_natural_bc(NaturalBc::traction(["u"], ["right"], Vec::new()))
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        StepError::Dof(DofError::ComponentMismatch {
            fields: 1,
            components: 0
        })
    ));
}
