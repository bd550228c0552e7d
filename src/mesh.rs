use crate::element::ElementShape;
use crate::kernel::PhysicsTag;
use nalgebra::{Point3, Vector3};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

pub mod procedural;

/// An element of a [`Mesh`]: connectivity plus the tags that select its physics and material.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshElement {
    pub shape: ElementShape,
    pub connectivity: Vec<usize>,
    pub physics: PhysicsTag,
    /// Index of the material block evaluated at this element's quadrature points.
    pub material: usize,
}

impl MeshElement {
    pub fn new(shape: ElementShape, connectivity: Vec<usize>, physics: impl Into<PhysicsTag>) -> Self {
        assert_eq!(
            connectivity.len(),
            shape.node_count(),
            "connectivity length must match the node count of the shape"
        );
        Self {
            shape,
            connectivity,
            physics: physics.into(),
            material: 0,
        }
    }

    pub fn with_material(mut self, material: usize) -> Self {
        self.material = material;
        self
    }
}

/// A face of an element that no other element shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryFace {
    pub element: usize,
    /// Index into [`ElementShape::faces`] of the element's shape.
    pub local_face: usize,
    /// Global node indices in the order of the local face.
    pub nodes: Vec<usize>,
}

/// A finite element mesh with named node regions.
///
/// Vertices are stored as 3-D points regardless of the spatial dimension; unused coordinates
/// are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    dim: usize,
    vertices: Vec<Point3<f64>>,
    elements: Vec<MeshElement>,
    regions: BTreeMap<String, Vec<usize>>,
}

impl Mesh {
    /// # Panics
    ///
    /// Panics if `dim` is not 1, 2 or 3, if an element's reference dimension differs from `dim`,
    /// or if an element references a vertex out of bounds.
    pub fn from_vertices_and_elements(dim: usize, vertices: Vec<Point3<f64>>, elements: Vec<MeshElement>) -> Self {
        assert!((1..=3).contains(&dim), "spatial dimension must be 1, 2 or 3");
        for element in &elements {
            assert_eq!(element.shape.reference_dim(), dim, "element dimension must match mesh dimension");
            assert!(
                element.connectivity.iter().all(|&v| v < vertices.len()),
                "element connectivity out of bounds"
            );
        }
        Self {
            dim,
            vertices,
            elements,
            regions: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a named node region.
    pub fn with_region(mut self, name: impl Into<String>, nodes: Vec<usize>) -> Self {
        self.insert_region(name, nodes);
        self
    }

    pub fn insert_region(&mut self, name: impl Into<String>, mut nodes: Vec<usize>) {
        assert!(nodes.iter().all(|&v| v < self.vertices.len()), "region node out of bounds");
        nodes.sort_unstable();
        nodes.dedup();
        self.regions.insert(name.into(), nodes);
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_nodes(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    pub fn elements(&self) -> &[MeshElement] {
        &self.elements
    }

    pub fn element(&self, index: usize) -> Option<&MeshElement> {
        self.elements.get(index)
    }

    /// Sorted, deduplicated node indices of the named region.
    pub fn region(&self, name: &str) -> Option<&[usize]> {
        self.regions.get(name).map(Vec::as_slice)
    }

    pub fn region_names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    /// Assigns the physics tag of every element for which `predicate` holds.
    pub fn assign_physics_where(&mut self, physics: impl Into<PhysicsTag>, predicate: impl Fn(&MeshElement) -> bool) {
        let physics = physics.into();
        for element in self.elements.iter_mut().filter(|e| predicate(e)) {
            element.physics = physics.clone();
        }
    }

    /// Assigns the material block of every element for which `predicate` holds.
    pub fn assign_material_where(&mut self, material: usize, predicate: impl Fn(&MeshElement) -> bool) {
        for element in self.elements.iter_mut().filter(|e| predicate(e)) {
            element.material = material;
        }
    }

    /// Centroid of the element's vertices.
    pub fn element_centroid(&self, index: usize) -> Option<Point3<f64>> {
        let element = self.elements.get(index)?;
        let n = element.connectivity.len() as f64;
        let sum = element
            .connectivity
            .iter()
            .fold(Vector3::zeros(), |acc, &v| acc + self.vertices[v].coords);
        Some(Point3::from(sum / n))
    }

    /// Faces that belong to exactly one element, in element order.
    pub fn boundary_faces(&self) -> Vec<BoundaryFace> {
        let mut counts: FxHashMap<Vec<usize>, usize> = FxHashMap::default();
        let mut faces = Vec::new();
        for (element_index, element) in self.elements.iter().enumerate() {
            for (local_face, local_nodes) in element.shape.faces().iter().enumerate() {
                let nodes: Vec<usize> = local_nodes.iter().map(|&i| element.connectivity[i]).collect();
                let mut key = nodes.clone();
                key.sort_unstable();
                *counts.entry(key).or_insert(0) += 1;
                faces.push(BoundaryFace {
                    element: element_index,
                    local_face,
                    nodes,
                });
            }
        }
        faces.retain(|face| {
            let mut key = face.nodes.clone();
            key.sort_unstable();
            counts.get(&key) == Some(&1)
        });
        faces
    }

    /// Boundary faces whose nodes all lie in the named region.
    pub fn region_faces(&self, name: &str) -> Option<Vec<BoundaryFace>> {
        let region = self.region(name)?;
        let mut faces = self.boundary_faces();
        faces.retain(|face| face.nodes.iter().all(|node| region.binary_search(node).is_ok()));
        Some(faces)
    }
}
