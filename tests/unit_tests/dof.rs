use multifem::dof::{BoundaryValue, DofLayoutBuilder, DofMap, EssentialBc};
use multifem::element::ElementShape;
use multifem::error::DofError;
use multifem::kernel::{CahnHilliard, Diffusion, KernelRegistry, PhysicsTag};
use multifem::mesh::procedural::{create_line_mesh_1d, create_rectangular_quad_mesh_2d};
use multifem::mesh::{Mesh, MeshElement};
use nalgebra::Point3;
use proptest::prelude::*;

fn diffusion_kernels() -> KernelRegistry {
    KernelRegistry::new().with_kernel("diffusion", Diffusion)
}

fn cahn_hilliard_kernels() -> KernelRegistry {
    KernelRegistry::new().with_kernel("ch", CahnHilliard)
}

/// Two segments on three nodes, the left one with diffusion and the right one with
/// Cahn-Hilliard physics.
fn mixed_physics_mesh() -> (Mesh, KernelRegistry) {
    let vertices = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(2.0, 0.0, 0.0),
    ];
    let elements = vec![
        MeshElement::new(ElementShape::Segment2, vec![0, 1], "diffusion"),
        MeshElement::new(ElementShape::Segment2, vec![1, 2], "ch"),
    ];
    let mesh = Mesh::from_vertices_and_elements(1, vertices, elements)
        .with_region("left", vec![0])
        .with_region("right", vec![2]);
    let kernels = KernelRegistry::new()
        .with_kernel("diffusion", Diffusion)
        .with_kernel("ch", CahnHilliard);
    (mesh, kernels)
}

#[test]
fn single_bar_with_eliminated_left_node() {
    let mesh = create_line_mesh_1d(1.0, 1, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let bcs = vec![EssentialBc::new("c", ["left"])];
    let dof_map = DofMap::build(&mesh, &layout, &bcs).unwrap();

    assert_eq!(dof_map.num_active_dofs(), 1);
    let left = dof_map.slot(0, 0);
    assert!(left.present);
    assert_eq!(left.active_index, None);
    assert_eq!(left.activity, 0.0);
    let right = dof_map.slot(1, 0);
    assert_eq!(right.active_index, Some(0));
    assert_eq!(right.activity, 1.0);
}

#[test]
fn two_bars_sharing_a_node_with_eliminated_left_node() {
    let mesh = create_line_mesh_1d(2.0, 2, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let bcs = vec![EssentialBc::new("c", ["left"])];
    let dof_map = DofMap::build(&mesh, &layout, &bcs).unwrap();

    assert_eq!(dof_map.num_active_dofs(), 2);
    assert_eq!(dof_map.slot(1, 0).active_index, Some(0));
    assert_eq!(dof_map.slot(2, 0).active_index, Some(1));

    let first = dof_map.element_dofs(0);
    assert_eq!(first.indices, &[0]);
    assert_eq!(first.activity, &[1.0]);
    assert_eq!(first.local_positions, &[1]);

    let second = dof_map.element_dofs(1);
    assert_eq!(second.indices, &[0, 1]);
    assert_eq!(second.activity, &[1.0, 1.0]);
    assert_eq!(second.local_positions, &[0, 1]);
}

#[test]
fn eliminated_slots_shrink_element_arrays() {
    // One quad with two fields per node; the two nodes on the left lose their concentration
    let mesh = create_rectangular_quad_mesh_2d(1.0, 1.0, 1, 1, "ch");
    let layout = cahn_hilliard_kernels().dof_layout().unwrap();
    let bcs = vec![EssentialBc::new("c", ["left"])];
    let dof_map = DofMap::build(&mesh, &layout, &bcs).unwrap();

    let element = dof_map.element_dofs(0);
    assert_eq!(element.len(), 8 - 2);
    assert_eq!(element.activity.len(), 8 - 2);
    assert_eq!(element.local_positions.len(), 8 - 2);
    assert_eq!(dof_map.max_element_dofs(), 6);
    assert_eq!(dof_map.num_active_dofs(), 6);
}

#[test]
fn numbering_is_node_major_over_present_fields() {
    let (mesh, kernels) = mixed_physics_mesh();
    let layout = kernels.dof_layout().unwrap();
    assert_eq!(layout.field_names(), &["c".to_string(), "mu".to_string()]);

    let dof_map = DofMap::build(&mesh, &layout, &[]).unwrap();
    assert_eq!(dof_map.num_active_dofs(), 5);

    // The diffusion-only node carries no chemical potential
    assert!(!dof_map.slot(0, 1).present);
    assert_eq!(dof_map.slot(0, 0).active_index, Some(0));
    assert_eq!(dof_map.slot(1, 0).active_index, Some(1));
    assert_eq!(dof_map.slot(1, 1).active_index, Some(2));
    assert_eq!(dof_map.slot(2, 0).active_index, Some(3));
    assert_eq!(dof_map.slot(2, 1).active_index, Some(4));

    assert_eq!(dof_map.element_dofs(0).indices, &[0, 1]);
    assert_eq!(dof_map.element_dofs(1).indices, &[1, 2, 3, 4]);
    assert_eq!(dof_map.element_dofs(1).local_positions, &[0, 1, 2, 3]);
}

#[test]
fn row_nnz_counts_element_couplings() {
    let mesh = create_line_mesh_1d(3.0, 3, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let dof_map = DofMap::build(&mesh, &layout, &[]).unwrap();
    assert_eq!(dof_map.row_nnz(), &[2, 4, 4, 2]);
}

#[test]
fn sparsity_pattern_of_line_mesh_is_tridiagonal() {
    let mesh = create_line_mesh_1d(3.0, 3, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let bcs = vec![EssentialBc::new("c", ["left", "right"])];
    let dof_map = DofMap::build(&mesh, &layout, &bcs).unwrap();

    let pattern = dof_map.sparsity_pattern();
    assert_eq!(pattern.major_dim(), 2);
    assert_eq!(pattern.major_offsets(), &[0, 2, 4]);
    assert_eq!(pattern.minor_indices(), &[0, 1, 0, 1]);
}

#[test]
fn prescribed_values_follow_the_last_condition() {
    let mesh = create_line_mesh_1d(1.0, 2, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let bcs = vec![
        EssentialBc::new("c", ["left"]).with_value(BoundaryValue::Constant(1.0)),
        EssentialBc::new("c", ["left"]).with_value(BoundaryValue::Ramp {
            initial: 0.5,
            rate: 2.0,
        }),
    ];
    let dof_map = DofMap::build(&mesh, &layout, &bcs).unwrap();

    assert_eq!(dof_map.prescribed_value(0, 0, 0.0), Some(0.5));
    assert_eq!(dof_map.prescribed_value(0, 0, 0.25), Some(1.0));
    assert_eq!(dof_map.prescribed_rate(0, 0), Some(2.0));
    assert_eq!(dof_map.prescribed_value(1, 0, 0.0), None);
}

#[test]
fn unknown_region_is_rejected() {
    let mesh = create_line_mesh_1d(1.0, 2, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let bcs = vec![EssentialBc::new("c", ["top"])];
    let err = DofMap::build(&mesh, &layout, &bcs).unwrap_err();
    assert!(matches!(err, DofError::InvalidBoundaryRegion { region } if region == "top"));
}

#[test]
fn unknown_field_is_rejected() {
    let mesh = create_line_mesh_1d(1.0, 2, "diffusion");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let bcs = vec![EssentialBc::new("T", ["left"])];
    let err = DofMap::build(&mesh, &layout, &bcs).unwrap_err();
    assert!(matches!(err, DofError::InvalidFieldName { field, region: None } if field == "T"));
}

#[test]
fn field_absent_on_region_is_rejected() {
    let (mesh, kernels) = mixed_physics_mesh();
    let layout = kernels.dof_layout().unwrap();

    let bcs = vec![EssentialBc::new("mu", ["right"])];
    assert!(DofMap::build(&mesh, &layout, &bcs).is_ok());

    let bcs = vec![EssentialBc::new("mu", ["left"])];
    let err = DofMap::build(&mesh, &layout, &bcs).unwrap_err();
    assert!(matches!(
        err,
        DofError::InvalidFieldName { field, region: Some(region) } if field == "mu" && region == "left"
    ));
}

#[test]
fn unknown_physics_is_rejected() {
    let mesh = create_line_mesh_1d(1.0, 2, "mechanics");
    let layout = diffusion_kernels().dof_layout().unwrap();
    let err = DofMap::build(&mesh, &layout, &[]).unwrap_err();
    assert!(matches!(
        err,
        DofError::UnknownPhysics { element: 0, physics } if physics == PhysicsTag::from("mechanics")
    ));
}

#[test]
fn node_without_elements_is_rejected() {
    let vertices = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(2.0, 0.0, 0.0),
    ];
    let elements = vec![MeshElement::new(ElementShape::Segment2, vec![0, 1], "diffusion")];
    let mesh = Mesh::from_vertices_and_elements(1, vertices, elements);
    let layout = diffusion_kernels().dof_layout().unwrap();
    let err = DofMap::build(&mesh, &layout, &[]).unwrap_err();
    assert!(matches!(err, DofError::UnassignedNode { node: 2 }));
}

#[test]
fn layout_builder_rejects_undeclared_fields() {
    let result = DofLayoutBuilder::new(&["c"]).with_physics("ch", &["c", "mu"]);
    assert!(matches!(result, Err(DofError::InvalidFieldName { field, .. }) if field == "mu"));

    let layout = DofLayoutBuilder::new(&["mu", "c"])
        .with_physics("ch", &["c", "mu"])
        .unwrap()
        .build();
    assert_eq!(layout.dofs_per_node(), 2);
    assert_eq!(layout.physics_fields(&PhysicsTag::from("ch")), Some(&[1, 0][..]));
}

proptest! {
    #[test]
    fn active_indices_are_a_bijection_without_boundary_conditions(cells_x in 1 .. 5usize, cells_y in 1 .. 5usize) {
        let mesh = create_rectangular_quad_mesh_2d(1.0, 1.0, cells_x, cells_y, "ch");
        let layout = cahn_hilliard_kernels().dof_layout().unwrap();
        let dof_map = DofMap::build(&mesh, &layout, &[]).unwrap();

        let expected_count = mesh.num_nodes() * 2;
        prop_assert_eq!(dof_map.num_active_dofs(), expected_count);

        let mut indices: Vec<usize> = (0 .. mesh.num_nodes())
            .flat_map(|node| dof_map.node_slots(node).to_vec())
            .map(|slot| slot.active_index.expect("every slot is active"))
            .collect();
        indices.sort_unstable();
        prop_assert_eq!(indices, (0 .. expected_count).collect::<Vec<_>>());
    }

    #[test]
    fn building_twice_gives_identical_numbering(
        cells_x in 1 .. 5usize,
        cells_y in 1 .. 5usize,
        eliminate_left in any::<bool>(),
        eliminate_top in any::<bool>(),
    ) {
        let mesh = create_rectangular_quad_mesh_2d(2.0, 1.0, cells_x, cells_y, "ch");
        let layout = cahn_hilliard_kernels().dof_layout().unwrap();
        let mut bcs = Vec::new();
        if eliminate_left {
            bcs.push(EssentialBc::new("c", ["left"]));
        }
        if eliminate_top {
            bcs.push(EssentialBc::new("mu", ["top"]));
        }

        let first = DofMap::build(&mesh, &layout, &bcs).unwrap();
        let second = DofMap::build(&mesh, &layout, &bcs).unwrap();
        prop_assert_eq!(&first, &second);
        for element in 0 .. mesh.num_elements() {
            prop_assert_eq!(first.element_dofs(element), second.element_dofs(element));
        }
    }
}
