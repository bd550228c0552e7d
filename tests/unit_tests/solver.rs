use multifem::error::AssemblyError;
use multifem::linear_solver::{DenseLuSolver, LinearSolver, LinearSolverKind, SparseCholeskySolver};
use multifem::nalgebra_sparse::{CooMatrix, CsrMatrix};
use multifem::optimize::newton::NewtonSettings;
use multifem::optimize::system::{NonlinearSystemBuilder, SystemError};
use multifem::solver::{DivergenceReason, LineSearchKind, NonlinearOutcome, NonlinearSolver};
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};

/// Scalar system with residual `r(x)` and the exact derivative `dr(x)`.
fn solve_scalar(
    solver: &NonlinearSolver,
    x0: f64,
    r: impl Fn(f64) -> Result<f64, SystemError>,
    dr: impl Fn(f64) -> f64,
) -> (Result<NonlinearOutcome, AssemblyError>, f64) {
    let mut x = DVector::from_element(1, x0);
    let last = std::cell::Cell::new(x0);
    let system = NonlinearSystemBuilder::with_dimension(1)
        .with_residual(|f: &mut DVectorViewMut<f64>, x: &DVectorView<f64>| {
            last.set(x[0]);
            f[0] = r(x[0])?;
            Ok(())
        })
        .with_jacobian_solver(|sol: &mut DVectorViewMut<f64>, rhs: &DVectorView<f64>| {
            sol[0] = rhs[0] / dr(last.get());
            Ok(())
        });
    let outcome = solver.solve(system, &mut x);
    (outcome, x[0])
}

#[test]
fn linear_residual_converges_in_one_iteration() {
    let solver = NonlinearSolver::default();
    let (outcome, x) = solve_scalar(&solver, 0.0, |x| Ok(x - 5.0), |_| 1.0);
    match outcome.unwrap() {
        NonlinearOutcome::Converged {
            iterations,
            residual_norm,
        } => {
            assert_eq!(iterations, 1);
            assert!(residual_norm <= solver.settings().absolute_tolerance);
        }
        outcome => panic!("unexpected outcome {:?}", outcome),
    }
    assert_eq!(x, 5.0);
}

#[test]
fn nonlinear_residual_converges_with_and_without_line_search() {
    for line_search in [LineSearchKind::None, LineSearchKind::Backtracking] {
        let solver = NonlinearSolver::default().with_line_search(line_search);
        let (outcome, x) = solve_scalar(&solver, 1.0, |x| Ok(x * x * x - 8.0), |x| 3.0 * x * x);
        let outcome = outcome.unwrap();
        assert!(outcome.is_converged(), "{:?}", line_search);
        assert!(outcome.iterations().unwrap() > 1);
        assert!((x - 2.0).abs() < 1e-8);
    }
}

#[test]
fn iteration_limit_is_reported_as_divergence() {
    let settings = NewtonSettings {
        max_iterations: 3,
        ..NewtonSettings::default()
    };
    let solver = NonlinearSolver::new(settings);
    // Newton on atan with a distant starting point oscillates with growing amplitude
    let (outcome, _) = solve_scalar(&solver, 3.0, |x| Ok(x.atan()), |x| 1.0 / (1.0 + x * x));
    assert_eq!(
        outcome.unwrap(),
        NonlinearOutcome::Diverged(DivergenceReason::MaxIterationsExceeded)
    );
}

#[test]
fn non_finite_residual_is_numerical_divergence() {
    let solver = NonlinearSolver::default();
    let (outcome, _) = solve_scalar(&solver, 0.0, |_| Ok(f64::NAN), |_| 1.0);
    assert_eq!(outcome.unwrap(), NonlinearOutcome::Diverged(DivergenceReason::NumericalDivergence));
}

#[test]
fn recoverable_assembly_errors_become_divergence() {
    let solver = NonlinearSolver::default();
    let (outcome, _) = solve_scalar(
        &solver,
        0.0,
        |x| {
            if x > 1.0 {
                Err(AssemblyError::Diverged {
                    element: 3,
                    quadrature_point: 1,
                }
                .into())
            } else {
                Ok(x - 5.0)
            }
        },
        |_| 1.0,
    );
    assert_eq!(outcome.unwrap(), NonlinearOutcome::Diverged(DivergenceReason::NumericalDivergence));
}

#[test]
fn configuration_errors_are_propagated() {
    let solver = NonlinearSolver::default();
    let (outcome, _) = solve_scalar(
        &solver,
        0.0,
        |_| {
            Err(AssemblyError::DegenerateElement {
                element: 7,
                determinant: -1.0,
            }
            .into())
        },
        |_| 1.0,
    );
    assert!(matches!(
        outcome,
        Err(AssemblyError::DegenerateElement { element: 7, .. })
    ));
}

#[test]
fn failed_linear_solve_is_reported() {
    let solver = NonlinearSolver::default();
    let mut x = DVector::<f64>::zeros(1);
    let system = NonlinearSystemBuilder::with_dimension(1)
        .with_residual(|f: &mut DVectorViewMut<f64>, x: &DVectorView<f64>| {
            f[0] = x[0] - 1.0;
            Ok(())
        })
        .with_jacobian_solver(|_: &mut DVectorViewMut<f64>, _: &DVectorView<f64>| Err("singular Jacobian".into()));
    let outcome = solver.solve(system, &mut x).unwrap();
    assert_eq!(outcome, NonlinearOutcome::Diverged(DivergenceReason::LinearSolverFailure));
    assert!(!outcome.is_converged());
    assert_eq!(outcome.iterations(), None);
}

/// The 1D Laplacian `tridiag(-1, 2, -1)` of size `n`.
fn laplacian(n: usize) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(n, n);
    for i in 0..n {
        coo.push(i, i, 2.0);
        if i > 0 {
            coo.push(i, i - 1, -1.0);
            coo.push(i - 1, i, -1.0);
        }
    }
    CsrMatrix::from(&coo)
}

#[test]
fn linear_solvers_solve_spd_system() {
    let n = 6;
    let matrix = laplacian(n);
    let expected = DVector::from_fn(n, |i, _| (i as f64).sin() + 1.0);
    let rhs = DMatrix::from(&matrix) * &expected;

    let solvers: Vec<Box<dyn LinearSolver>> = vec![
        Box::new(DenseLuSolver),
        Box::new(SparseCholeskySolver),
        LinearSolverKind::default().build(),
        LinearSolverKind::SparseCholesky.build(),
    ];
    for mut solver in solvers {
        let mut solution = DVector::<f64>::zeros(n);
        solver
            .solve(&matrix, &mut DVectorViewMut::from(&mut solution), &DVectorView::from(&rhs))
            .unwrap();
        assert!((&solution - &expected).amax() < 1e-12);
    }
}

#[test]
fn singular_matrix_is_an_error() {
    let mut coo = CooMatrix::new(2, 2);
    coo.push(0, 0, 1.0);
    coo.push(0, 1, 1.0);
    coo.push(1, 0, 1.0);
    coo.push(1, 1, 1.0);
    let matrix = CsrMatrix::from(&coo);
    let rhs = DVector::from_element(2, 1.0);
    let mut solution = DVector::<f64>::zeros(2);

    assert!(DenseLuSolver
        .solve(&matrix, &mut DVectorViewMut::from(&mut solution), &DVectorView::from(&rhs))
        .is_err());
    assert!(SparseCholeskySolver
        .solve(&matrix, &mut DVectorViewMut::from(&mut solution), &DVectorView::from(&rhs))
        .is_err());
}
