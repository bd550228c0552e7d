//! Basic procedural mesh generation routines.
//!
//! All generators produce axis-aligned meshes anchored at the origin, with a single physics tag,
//! material block 0 and node regions named after the faces of the bounding box:
//! `left`/`right` (x), `bottom`/`top` (y) and `back`/`front` (z).
use crate::element::ElementShape;
use crate::kernel::PhysicsTag;
use crate::mesh::{Mesh, MeshElement};
use nalgebra::Point3;

/// Uniform line mesh of `num_cells` two-node segments on `[0, length]`.
pub fn create_line_mesh_1d(length: f64, num_cells: usize, physics: impl Into<PhysicsTag>) -> Mesh {
    assert!(num_cells > 0, "number of cells must be positive");
    let physics = physics.into();
    let h = length / num_cells as f64;
    let vertices = (0..=num_cells)
        .map(|i| Point3::new(i as f64 * h, 0.0, 0.0))
        .collect();
    let elements = (0..num_cells)
        .map(|i| MeshElement::new(ElementShape::Segment2, vec![i, i + 1], physics.clone()))
        .collect();

    Mesh::from_vertices_and_elements(1, vertices, elements)
        .with_region("left", vec![0])
        .with_region("right", vec![num_cells])
}

/// Uniform mesh of `cells_x * cells_y` bilinear quadrilaterals on `[0, width] x [0, height]`.
pub fn create_rectangular_quad_mesh_2d(
    width: f64,
    height: f64,
    cells_x: usize,
    cells_y: usize,
    physics: impl Into<PhysicsTag>,
) -> Mesh {
    assert!(cells_x > 0 && cells_y > 0, "number of cells must be positive");
    let physics = physics.into();
    let (hx, hy) = (width / cells_x as f64, height / cells_y as f64);
    let to_global_vertex_index = |i: usize, j: usize| (cells_x + 1) * j + i;

    let mut vertices = Vec::with_capacity((cells_x + 1) * (cells_y + 1));
    for j in 0..=cells_y {
        for i in 0..=cells_x {
            vertices.push(Point3::new(i as f64 * hx, j as f64 * hy, 0.0));
        }
    }

    let mut elements = Vec::with_capacity(cells_x * cells_y);
    for j in 0..cells_y {
        for i in 0..cells_x {
            let connectivity = vec![
                to_global_vertex_index(i, j),
                to_global_vertex_index(i + 1, j),
                to_global_vertex_index(i + 1, j + 1),
                to_global_vertex_index(i, j + 1),
            ];
            elements.push(MeshElement::new(ElementShape::Quad4, connectivity, physics.clone()));
        }
    }

    let left = (0..=cells_y).map(|j| to_global_vertex_index(0, j)).collect();
    let right = (0..=cells_y).map(|j| to_global_vertex_index(cells_x, j)).collect();
    let bottom = (0..=cells_x).map(|i| to_global_vertex_index(i, 0)).collect();
    let top = (0..=cells_x).map(|i| to_global_vertex_index(i, cells_y)).collect();

    Mesh::from_vertices_and_elements(2, vertices, elements)
        .with_region("left", left)
        .with_region("right", right)
        .with_region("bottom", bottom)
        .with_region("top", top)
}

/// Uniform mesh of trilinear hexahedra on `[0, lx] x [0, ly] x [0, lz]`.
pub fn create_box_hex_mesh_3d(extents: [f64; 3], cells: [usize; 3], physics: impl Into<PhysicsTag>) -> Mesh {
    let [nx, ny, nz] = cells;
    assert!(nx > 0 && ny > 0 && nz > 0, "number of cells must be positive");
    let physics = physics.into();
    let [hx, hy, hz] = [
        extents[0] / nx as f64,
        extents[1] / ny as f64,
        extents[2] / nz as f64,
    ];
    let to_global_vertex_index = |i: usize, j: usize, k: usize| (nx + 1) * (ny + 1) * k + (nx + 1) * j + i;

    let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
    for k in 0..=nz {
        for j in 0..=ny {
            for i in 0..=nx {
                vertices.push(Point3::new(i as f64 * hx, j as f64 * hy, k as f64 * hz));
            }
        }
    }

    let mut elements = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let connectivity = vec![
                    to_global_vertex_index(i, j, k),
                    to_global_vertex_index(i + 1, j, k),
                    to_global_vertex_index(i + 1, j + 1, k),
                    to_global_vertex_index(i, j + 1, k),
                    to_global_vertex_index(i, j, k + 1),
                    to_global_vertex_index(i + 1, j, k + 1),
                    to_global_vertex_index(i + 1, j + 1, k + 1),
                    to_global_vertex_index(i, j + 1, k + 1),
                ];
                elements.push(MeshElement::new(ElementShape::Hex8, connectivity, physics.clone()));
            }
        }
    }

    let face = |fixed_axis: usize, index: usize| -> Vec<usize> {
        let mut nodes = Vec::new();
        for k in 0..=nz {
            for j in 0..=ny {
                for i in 0..=nx {
                    if [i, j, k][fixed_axis] == index {
                        nodes.push(to_global_vertex_index(i, j, k));
                    }
                }
            }
        }
        nodes
    };

    Mesh::from_vertices_and_elements(3, vertices, elements)
        .with_region("left", face(0, 0))
        .with_region("right", face(0, nx))
        .with_region("bottom", face(1, 0))
        .with_region("top", face(1, ny))
        .with_region("back", face(2, 0))
        .with_region("front", face(2, nz))
}
