//! Numbering of the degrees of freedom.
//!
//! Every node carries one slot per declared field. A slot is *present* if some element touching
//! the node uses the field, and *eliminated* if an essential boundary condition prescribes it.
//! Present, non-eliminated slots are numbered consecutively from zero, node-major and then in
//! field order, which fixes the bandwidth of the global matrix.
use crate::error::DofError;
use crate::kernel::PhysicsTag;
use crate::mesh::Mesh;
use nalgebra_sparse::pattern::SparsityPattern;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Fields per node and the subset of fields each physics uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DofLayout {
    field_names: Vec<String>,
    physics_fields: BTreeMap<PhysicsTag, Vec<usize>>,
}

impl DofLayout {
    pub fn dofs_per_node(&self) -> usize {
        self.field_names.len()
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|field| field == name)
    }

    /// Node-slot indices of the fields used by `physics`, in the physics' local order.
    pub fn physics_fields(&self, physics: &PhysicsTag) -> Option<&[usize]> {
        self.physics_fields.get(physics).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone)]
pub struct DofLayoutBuilder {
    layout: DofLayout,
}

impl DofLayoutBuilder {
    pub fn new<S: AsRef<str>>(fields: &[S]) -> Self {
        Self {
            layout: DofLayout {
                field_names: fields.iter().map(|f| f.as_ref().to_string()).collect(),
                physics_fields: BTreeMap::new(),
            },
        }
    }

    pub fn with_physics<S: AsRef<str>>(
        mut self,
        physics: impl Into<PhysicsTag>,
        fields: &[S],
    ) -> Result<Self, DofError> {
        let indices = fields
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.layout
                    .field_index(name)
                    .ok_or_else(|| DofError::InvalidFieldName {
                        field: name.to_string(),
                        region: None,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.layout.physics_fields.insert(physics.into(), indices);
        Ok(self)
    }

    pub fn build(self) -> DofLayout {
        self.layout
    }
}

/// Value prescribed by an essential boundary condition.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundaryValue {
    Constant(f64),
    /// `initial + rate * t`
    Ramp { initial: f64, rate: f64 },
}

impl Default for BoundaryValue {
    fn default() -> Self {
        BoundaryValue::Constant(0.0)
    }
}

impl BoundaryValue {
    pub fn value(&self, t: f64) -> f64 {
        match *self {
            BoundaryValue::Constant(value) => value,
            BoundaryValue::Ramp { initial, rate } => initial + rate * t,
        }
    }

    pub fn rate(&self) -> f64 {
        match *self {
            BoundaryValue::Constant(_) => 0.0,
            BoundaryValue::Ramp { rate, .. } => rate,
        }
    }
}

/// Eliminates one field on a set of node regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssentialBc {
    pub field: String,
    pub regions: Vec<String>,
    #[serde(default)]
    pub value: BoundaryValue,
}

impl EssentialBc {
    pub fn new<S: Into<String>>(field: impl Into<String>, regions: impl IntoIterator<Item = S>) -> Self {
        Self {
            field: field.into(),
            regions: regions.into_iter().map(Into::into).collect(),
            value: BoundaryValue::default(),
        }
    }

    pub fn with_value(mut self, value: BoundaryValue) -> Self {
        self.value = value;
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DofSlot {
    pub present: bool,
    /// Index into the active unknowns; `None` if absent or eliminated.
    pub active_index: Option<usize>,
    /// 1.0 if the slot participates in the system, 0.0 otherwise.
    pub activity: f64,
}

impl DofSlot {
    const ABSENT: Self = Self {
        present: false,
        active_index: None,
        activity: 0.0,
    };
}

/// The active unknowns of one element.
///
/// All three arrays have the same length: the number of active slots of the element.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ElementDofs<'a> {
    pub indices: &'a [usize],
    pub activity: &'a [f64],
    /// Position of each entry in the kernel's node-major local ordering.
    pub local_positions: &'a [usize],
}

impl ElementDofs<'_> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Global numbering of the active unknowns and the per-element local-to-global maps.
#[derive(Debug, Clone, PartialEq)]
pub struct DofMap {
    layout: DofLayout,
    num_active: usize,
    slots: Vec<DofSlot>,
    /// Index into `bcs` of the condition eliminating each slot.
    constraints: Vec<Option<usize>>,
    bcs: Vec<EssentialBc>,
    element_offsets: Vec<usize>,
    element_indices: Vec<usize>,
    element_activity: Vec<f64>,
    element_positions: Vec<usize>,
    row_nnz: Vec<usize>,
}

impl DofMap {
    /// Numbers the unknowns of `mesh`.
    ///
    /// The result is a pure function of the inputs. When several conditions eliminate the same
    /// slot, the last one provides its value.
    pub fn build(mesh: &Mesh, layout: &DofLayout, bcs: &[EssentialBc]) -> Result<Self, DofError> {
        let dofs_per_node = layout.dofs_per_node();
        let mut slots = vec![DofSlot::ABSENT; mesh.num_nodes() * dofs_per_node];

        for (element_index, element) in mesh.elements().iter().enumerate() {
            let fields = layout
                .physics_fields(&element.physics)
                .ok_or_else(|| DofError::UnknownPhysics {
                    element: element_index,
                    physics: element.physics.clone(),
                })?;
            for &node in &element.connectivity {
                for &field in fields {
                    let slot = &mut slots[dofs_per_node * node + field];
                    slot.present = true;
                    slot.activity = 1.0;
                }
            }
        }

        if let Some(node) = (0..mesh.num_nodes()).find(|&node| {
            slots[dofs_per_node * node..dofs_per_node * (node + 1)]
                .iter()
                .all(|slot| !slot.present)
        }) {
            return Err(DofError::UnassignedNode { node });
        }

        let mut constraints = vec![None; slots.len()];
        for (bc_index, bc) in bcs.iter().enumerate() {
            let field = layout
                .field_index(&bc.field)
                .ok_or_else(|| DofError::InvalidFieldName {
                    field: bc.field.clone(),
                    region: None,
                })?;
            for region_name in &bc.regions {
                let region = mesh
                    .region(region_name)
                    .ok_or_else(|| DofError::InvalidBoundaryRegion {
                        region: region_name.clone(),
                    })?;
                let mut field_present = false;
                for &node in region {
                    let slot_index = dofs_per_node * node + field;
                    if slots[slot_index].present {
                        field_present = true;
                        slots[slot_index].activity = 0.0;
                        constraints[slot_index] = Some(bc_index);
                    }
                }
                if !field_present {
                    return Err(DofError::InvalidFieldName {
                        field: bc.field.clone(),
                        region: Some(region_name.clone()),
                    });
                }
            }
        }

        let mut num_active = 0;
        for slot in &mut slots {
            if slot.present && slot.activity != 0.0 {
                slot.active_index = Some(num_active);
                num_active += 1;
            }
        }

        let mut element_offsets = Vec::with_capacity(mesh.num_elements() + 1);
        let mut element_indices = Vec::new();
        let mut element_activity = Vec::new();
        let mut element_positions = Vec::new();
        element_offsets.push(0);
        for element in mesh.elements() {
            // Presence of the physics was checked above
            let fields = layout.physics_fields(&element.physics).unwrap_or(&[]);
            for (local_node, &node) in element.connectivity.iter().enumerate() {
                for (local_field, &field) in fields.iter().enumerate() {
                    let slot = &slots[dofs_per_node * node + field];
                    if let Some(index) = slot.active_index {
                        element_indices.push(index);
                        element_activity.push(slot.activity);
                        element_positions.push(fields.len() * local_node + local_field);
                    }
                }
            }
            element_offsets.push(element_indices.len());
        }

        let mut row_nnz = vec![0; num_active];
        for window in element_offsets.windows(2) {
            let element_dofs = &element_indices[window[0]..window[1]];
            for &index in element_dofs {
                row_nnz[index] += element_dofs.len();
            }
        }

        Ok(Self {
            layout: layout.clone(),
            num_active,
            slots,
            constraints,
            bcs: bcs.to_vec(),
            element_offsets,
            element_indices,
            element_activity,
            element_positions,
            row_nnz,
        })
    }

    pub fn layout(&self) -> &DofLayout {
        &self.layout
    }

    pub fn num_active_dofs(&self) -> usize {
        self.num_active
    }

    pub fn dofs_per_node(&self) -> usize {
        self.layout.dofs_per_node()
    }

    pub fn num_nodes(&self) -> usize {
        self.slots.len() / self.dofs_per_node().max(1)
    }

    pub fn num_elements(&self) -> usize {
        self.element_offsets.len() - 1
    }

    pub fn slot(&self, node: usize, field: usize) -> &DofSlot {
        &self.slots[self.dofs_per_node() * node + field]
    }

    pub fn node_slots(&self, node: usize) -> &[DofSlot] {
        let n = self.dofs_per_node();
        &self.slots[n * node..n * (node + 1)]
    }

    /// Value prescribed on an eliminated slot at time `t`.
    pub fn prescribed_value(&self, node: usize, field: usize, t: f64) -> Option<f64> {
        self.constraint(node, field).map(|bc| bc.value.value(t))
    }

    /// Time derivative of the value prescribed on an eliminated slot.
    pub fn prescribed_rate(&self, node: usize, field: usize) -> Option<f64> {
        self.constraint(node, field).map(|bc| bc.value.rate())
    }

    fn constraint(&self, node: usize, field: usize) -> Option<&EssentialBc> {
        self.constraints[self.dofs_per_node() * node + field].map(|bc_index| &self.bcs[bc_index])
    }

    pub fn element_dofs(&self, element: usize) -> ElementDofs {
        let range = self.element_offsets[element]..self.element_offsets[element + 1];
        ElementDofs {
            indices: &self.element_indices[range.clone()],
            activity: &self.element_activity[range.clone()],
            local_positions: &self.element_positions[range],
        }
    }

    /// Upper bound on the number of nonzeros in each row of the global matrix.
    pub fn row_nnz(&self) -> &[usize] {
        &self.row_nnz
    }

    pub fn max_element_dofs(&self) -> usize {
        self.element_offsets
            .windows(2)
            .map(|window| window[1] - window[0])
            .max()
            .unwrap_or(0)
    }

    /// Sparsity pattern of the global matrix coupling all active unknowns of each element.
    pub fn sparsity_pattern(&self) -> SparsityPattern {
        // Collecting into a BTreeSet stores each matrix entry exactly once
        let mut matrix_entries = BTreeSet::new();
        for element in 0..self.num_elements() {
            let indices = self.element_dofs(element).indices;
            for &i in indices {
                for &j in indices {
                    matrix_entries.insert((i, j));
                }
            }
        }

        let num_rows = self.num_active;
        let mut offsets = Vec::with_capacity(num_rows + 1);
        let mut column_indices = Vec::with_capacity(matrix_entries.len());
        offsets.push(0);
        for (i, j) in matrix_entries {
            while i + 1 > offsets.len() {
                offsets.push(column_indices.len());
            }
            column_indices.push(j);
        }
        while offsets.len() < num_rows + 1 {
            offsets.push(column_indices.len());
        }

        SparsityPattern::try_from_offsets_and_indices(num_rows, num_rows, offsets, column_indices)
            .expect("offsets and indices are sorted and in bounds by construction")
    }
}
