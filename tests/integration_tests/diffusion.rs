use multifem::config::SimulationSettings;
use multifem::dof::{BoundaryValue, EssentialBc};
use multifem::error::{DofError, StepError};
use multifem::kernel::{Diffusion, KernelRegistry};
use multifem::material::ConstantMaterial;
use multifem::mesh::procedural::create_line_mesh_1d;
use multifem::problem::{FeProblem, InitialCondition};
use multifem::stepping::{StepLog, TimeScheme, TimeSteppingSettings};

fn diffusion_bar(num_cells: usize, scheme: TimeScheme) -> FeProblem {
    let settings = SimulationSettings {
        time_stepping: TimeSteppingSettings {
            final_time: 1.0,
            dt0: 0.05,
            dt_min: 1e-4,
            dt_max: 0.05,
            scheme,
            ..TimeSteppingSettings::default()
        },
        ..SimulationSettings::default()
    };
    FeProblem::builder(
        create_line_mesh_1d(1.0, num_cells, "diffusion"),
        KernelRegistry::new().with_kernel("diffusion", Diffusion),
    )
    .with_boundary_condition(EssentialBc::new("c", ["left"]).with_value(BoundaryValue::Constant(1.0)))
    .with_boundary_condition(EssentialBc::new("c", ["right"]))
    .with_materials(ConstantMaterial::new().with_scalar("D", 1.0))
    .with_initial_condition(InitialCondition::constant("c", 0.0))
    .with_settings(settings)
    .build()
    .unwrap()
}

#[test]
fn transient_diffusion_approaches_linear_profile() {
    for scheme in [TimeScheme::BackwardEuler, TimeScheme::Bdf2] {
        let mut problem = diffusion_bar(10, scheme);
        assert_eq!(problem.dof_map().num_active_dofs(), 9);

        let mut log = StepLog::default();
        let summary = problem.run_transient(&mut log).unwrap();
        assert_eq!(summary.steps, 20);
        assert_eq!(summary.rejected_attempts, 0);
        assert!((problem.time() - 1.0).abs() < 1e-12);
        assert_eq!(log.steps.len(), 21);
        // A linear problem converges in a single Newton iteration
        assert!(log.steps[1..].iter().all(|step| step.iterations == 1));

        let values: Vec<f64> = (0..=10)
            .map(|node| problem.nodal_value(node, "c").unwrap())
            .collect();
        assert_eq!(values[0], 1.0);
        assert_eq!(values[10], 0.0);
        for (node, value) in values.iter().enumerate() {
            let x = node as f64 / 10.0;
            assert!((value - (1.0 - x)).abs() < 1e-2, "{:?}: c({}) = {}", scheme, x, value);
        }
        assert!(values.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(problem.solution(), problem.committed_solution());
    }
}

#[test]
fn profile_stays_within_boundary_values() {
    let mut problem = diffusion_bar(20, TimeScheme::BackwardEuler);
    let mut log = StepLog::default();
    problem.run_transient(&mut log).unwrap();
    for node in 0..=20 {
        let value = problem.nodal_value(node, "c").unwrap();
        assert!((0.0..=1.0).contains(&value));
    }
    assert_eq!(problem.nodal_value(0, "mu"), None);
}

#[test]
fn flux_projection_matches_steady_state() {
    let mut problem = diffusion_bar(10, TimeScheme::BackwardEuler);
    let outcome = problem.solve_static().unwrap();
    assert!(outcome.is_converged());
    let projection = problem.project().unwrap();
    // c = 1 - x has the flux -D dc/dx = 1
    for flux in projection.nodal_values("flux_x").unwrap() {
        assert!((flux - 1.0).abs() < 1e-10);
    }
}

#[test]
fn boundary_condition_on_missing_region_is_rejected() {
    let err = FeProblem::builder(
        create_line_mesh_1d(1.0, 4, "diffusion"),
        KernelRegistry::new().with_kernel("diffusion", Diffusion),
    )
    .with_boundary_condition(EssentialBc::new("c", ["inlet"]))
    .build()
    .unwrap_err();
    assert!(matches!(
        err,
        StepError::Dof(DofError::InvalidBoundaryRegion { region }) if region == "inlet"
    ));
}

#[test]
fn invalid_time_stepping_is_rejected_before_numbering() {
    let mut settings = SimulationSettings::default();
    settings.time_stepping.dt_min = -1.0;
    let err = FeProblem::builder(
        create_line_mesh_1d(1.0, 4, "diffusion"),
        KernelRegistry::new().with_kernel("diffusion", Diffusion),
    )
    .with_settings(settings)
    .build()
    .unwrap_err();
    assert!(matches!(err, StepError::InvalidSettings(_)));
}
