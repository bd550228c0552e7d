//! Loads integrated over the boundary: fluxes, tractions and pressures.
//!
//! A natural condition acts on the faces of a node region, that is the boundary faces whose
//! nodes all lie in the region. The loads do not depend on the solution, so each face is
//! integrated once when the condition is resolved and the Jacobian receives nothing.
use crate::dof::{BoundaryValue, DofMap};
use crate::error::DofError;
use crate::mesh::{BoundaryFace, Mesh};
use crate::quadrature::QuadratureRule;
use itertools::izip;
use log::{debug, warn};
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Magnitude of a natural boundary condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundaryLoad {
    /// Normal flux `g = D grad(c) . n` entering a scalar field, residual `-∫ g N dS`.
    Flux(BoundaryValue),
    /// Surface traction with one component per field, residual `-∫ t_a N dS`.
    Traction(Vec<BoundaryValue>),
    /// Pressure acting against the outward normal `n`, residual `∫ p n_a N dS`.
    Pressure(BoundaryValue),
}

/// A load integrated over the boundary faces of a set of node regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaturalBc {
    /// A single field for fluxes, the displacement components for tractions and pressures.
    pub fields: Vec<String>,
    pub regions: Vec<String>,
    pub load: BoundaryLoad,
}

fn strings<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Vec<String> {
    items.into_iter().map(Into::into).collect()
}

impl NaturalBc {
    pub fn flux<S: Into<String>>(
        field: impl Into<String>,
        regions: impl IntoIterator<Item = S>,
        value: BoundaryValue,
    ) -> Self {
        Self {
            fields: vec![field.into()],
            regions: strings(regions),
            load: BoundaryLoad::Flux(value),
        }
    }

    pub fn traction<F: Into<String>, S: Into<String>>(
        fields: impl IntoIterator<Item = F>,
        regions: impl IntoIterator<Item = S>,
        values: impl IntoIterator<Item = BoundaryValue>,
    ) -> Self {
        Self {
            fields: strings(fields),
            regions: strings(regions),
            load: BoundaryLoad::Traction(values.into_iter().collect()),
        }
    }

    pub fn pressure<F: Into<String>, S: Into<String>>(
        fields: impl IntoIterator<Item = F>,
        regions: impl IntoIterator<Item = S>,
        value: BoundaryValue,
    ) -> Self {
        Self {
            fields: strings(fields),
            regions: strings(regions),
            load: BoundaryLoad::Pressure(value),
        }
    }

    fn check_components(&self, dim: usize) -> Result<(), DofError> {
        let components = match &self.load {
            BoundaryLoad::Flux(_) => 1,
            BoundaryLoad::Traction(values) => values.len(),
            BoundaryLoad::Pressure(_) => dim,
        };
        if self.fields.len() == components {
            Ok(())
        } else {
            Err(DofError::ComponentMismatch {
                fields: self.fields.len(),
                components,
            })
        }
    }
}

/// Integrals of one face node's basis function over the faces of a condition.
#[derive(Debug, Copy, Clone, PartialEq)]
struct NodalWeight {
    node: usize,
    /// `∫ N dS`
    area: f64,
    /// `∫ N n dS`
    normal: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedLoad {
    fields: Vec<usize>,
    load: BoundaryLoad,
    weights: Vec<NodalWeight>,
}

/// Natural boundary conditions resolved against a mesh and its DOF map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundaryLoads {
    loads: Vec<ResolvedLoad>,
}

impl BoundaryLoads {
    /// Validates the conditions and integrates the basis functions over their faces.
    pub fn build(mesh: &Mesh, dof_map: &DofMap, bcs: &[NaturalBc]) -> Result<Self, DofError> {
        let layout = dof_map.layout();
        let faces = if bcs.is_empty() {
            Vec::new()
        } else {
            mesh.boundary_faces()
        };

        let mut loads = Vec::with_capacity(bcs.len());
        for bc in bcs {
            bc.check_components(mesh.dim())?;
            let fields = bc
                .fields
                .iter()
                .map(|name| {
                    layout
                        .field_index(name)
                        .ok_or_else(|| DofError::InvalidFieldName {
                            field: name.clone(),
                            region: None,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut weights = BTreeMap::new();
            for region_name in &bc.regions {
                let region = mesh
                    .region(region_name)
                    .ok_or_else(|| DofError::InvalidBoundaryRegion {
                        region: region_name.clone(),
                    })?;
                for (&field, name) in fields.iter().zip(&bc.fields) {
                    if !region.iter().any(|&node| dof_map.slot(node, field).present) {
                        return Err(DofError::InvalidFieldName {
                            field: name.clone(),
                            region: Some(region_name.clone()),
                        });
                    }
                }

                let region_faces = faces
                    .iter()
                    .filter(|face| face.nodes.iter().all(|node| region.binary_search(node).is_ok()));
                let mut num_faces = 0;
                for face in region_faces {
                    integrate_face(mesh, face, &mut weights);
                    num_faces += 1;
                }
                if num_faces == 0 {
                    warn!("Region \"{}\" has no boundary faces, its natural condition has no effect", region_name);
                } else {
                    debug!("Integrated {} boundary faces of region \"{}\"", num_faces, region_name);
                }
            }

            loads.push(ResolvedLoad {
                fields,
                load: bc.load.clone(),
                weights: weights
                    .into_iter()
                    .map(|(node, (area, normal))| NodalWeight { node, area, normal })
                    .collect(),
            });
        }
        Ok(Self { loads })
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    /// Adds the boundary loads at time `t` to a residual over the active unknowns.
    ///
    /// Contributions to eliminated slots are dropped.
    pub fn add_to_residual(&self, dof_map: &DofMap, t: f64, residual: &mut DVector<f64>) {
        for load in &self.loads {
            for weight in &load.weights {
                for (component, &field) in load.fields.iter().enumerate() {
                    let slot = dof_map.slot(weight.node, field);
                    let index = match slot.active_index {
                        Some(index) => index,
                        None => continue,
                    };
                    let contribution = match &load.load {
                        BoundaryLoad::Flux(value) => -value.value(t) * weight.area,
                        BoundaryLoad::Traction(values) => -values[component].value(t) * weight.area,
                        BoundaryLoad::Pressure(value) => value.value(t) * weight.normal[component],
                    };
                    residual[index] += slot.activity * contribution;
                }
            }
        }
    }
}

/// Accumulates `∫ N dS` and `∫ N n dS` of every face node, with `n` the outward unit normal.
fn integrate_face(mesh: &Mesh, face: &BoundaryFace, weights: &mut BTreeMap<usize, (f64, Vector3<f64>)>) {
    let vertices = mesh.vertices();
    let element = &mesh.elements()[face.element];
    let centroid = mesh
        .element_centroid(face.element)
        .map(|c| c.coords)
        .unwrap_or_else(Vector3::zeros);
    let mut add = |node: usize, area: f64, normal: Vector3<f64>| {
        let entry = weights.entry(node).or_insert((0.0, Vector3::zeros()));
        entry.0 += area;
        entry.1 += normal;
    };

    let shape = match element.shape.face_shape() {
        Some(shape) => shape,
        None => {
            // Point face: unit measure, normal along the element axis
            let node = face.nodes[0];
            let normal = (vertices[node].coords - centroid)
                .try_normalize(0.0)
                .unwrap_or_else(Vector3::zeros);
            add(node, 1.0, normal);
            return;
        }
    };

    let n = shape.node_count();
    let mut values = vec![0.0; n];
    let mut gradients = vec![Vector3::zeros(); n];
    for (w, xi) in QuadratureRule::default_for(shape).iter() {
        shape.populate_basis(&mut values, xi);
        shape.populate_reference_gradients(&mut gradients, xi);

        let mut x = Vector3::zeros();
        let mut tangents = [Vector3::zeros(); 2];
        for (&node, &value, gradient) in izip!(&face.nodes, &values, &gradients) {
            let coords = vertices[node].coords;
            x += coords * value;
            tangents[0] += coords * gradient[0];
            tangents[1] += coords * gradient[1];
        }
        // The norm of the unnormalized normal is the surface measure
        let normal = if shape.reference_dim() == 1 {
            Vector3::new(tangents[0].y, -tangents[0].x, 0.0)
        } else {
            tangents[0].cross(&tangents[1])
        };
        let measure = normal.norm();
        if measure <= 0.0 {
            continue;
        }
        let mut normal = normal / measure;
        if normal.dot(&(x - centroid)) < 0.0 {
            normal = -normal;
        }
        for (&node, &value) in face.nodes.iter().zip(&values) {
            let area = w * measure * value;
            add(node, area, normal * area);
        }
    }
}
