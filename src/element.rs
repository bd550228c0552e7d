//! Lagrange elements and the evaluation of their shape functions at quadrature points.
use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Reference geometry and interpolation order of an element.
///
/// Reference domains are `[-1, 1]^d` for segments, quadrilaterals and hexahedra, and the unit
/// simplex for triangles and tetrahedra. Node orderings follow the usual counter-clockwise
/// convention; `Segment3` places its mid-node last.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementShape {
    Segment2,
    Segment3,
    Tri3,
    Quad4,
    Tet4,
    Hex8,
}

const QUAD4_CORNERS: [[f64; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];

const HEX8_CORNERS: [[f64; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
];

impl ElementShape {
    pub fn reference_dim(self) -> usize {
        match self {
            Self::Segment2 | Self::Segment3 => 1,
            Self::Tri3 | Self::Quad4 => 2,
            Self::Tet4 | Self::Hex8 => 3,
        }
    }

    pub fn node_count(self) -> usize {
        match self {
            Self::Segment2 => 2,
            Self::Segment3 | Self::Tri3 => 3,
            Self::Quad4 | Self::Tet4 => 4,
            Self::Hex8 => 8,
        }
    }

    /// Local node indices of each face. Faces of segments are single nodes.
    pub fn faces(self) -> &'static [&'static [usize]] {
        match self {
            Self::Segment2 | Self::Segment3 => &[&[0], &[1]],
            Self::Tri3 => &[&[0, 1], &[1, 2], &[2, 0]],
            Self::Quad4 => &[&[0, 1], &[1, 2], &[2, 3], &[3, 0]],
            Self::Tet4 => &[&[0, 2, 1], &[0, 1, 3], &[0, 3, 2], &[1, 2, 3]],
            Self::Hex8 => &[
                &[0, 3, 2, 1],
                &[4, 5, 6, 7],
                &[0, 1, 5, 4],
                &[1, 2, 6, 5],
                &[2, 3, 7, 6],
                &[3, 0, 4, 7],
            ],
        }
    }

    /// Shape of the faces, `None` for point faces.
    pub fn face_shape(self) -> Option<ElementShape> {
        match self {
            Self::Segment2 | Self::Segment3 => None,
            Self::Tri3 | Self::Quad4 => Some(Self::Segment2),
            Self::Tet4 => Some(Self::Tri3),
            Self::Hex8 => Some(Self::Quad4),
        }
    }

    /// Evaluates all basis functions at the reference point `xi`.
    pub fn populate_basis(self, values: &mut [f64], xi: &[f64; 3]) {
        assert_eq!(values.len(), self.node_count());
        let [x, y, z] = *xi;
        match self {
            Self::Segment2 => {
                values[0] = 0.5 * (1.0 - x);
                values[1] = 0.5 * (1.0 + x);
            }
            Self::Segment3 => {
                values[0] = 0.5 * x * (x - 1.0);
                values[1] = 0.5 * x * (x + 1.0);
                values[2] = 1.0 - x * x;
            }
            Self::Tri3 => {
                values[0] = 1.0 - x - y;
                values[1] = x;
                values[2] = y;
            }
            Self::Quad4 => {
                for (value, [a, b]) in values.iter_mut().zip(QUAD4_CORNERS) {
                    *value = 0.25 * (1.0 + a * x) * (1.0 + b * y);
                }
            }
            Self::Tet4 => {
                values[0] = 1.0 - x - y - z;
                values[1] = x;
                values[2] = y;
                values[3] = z;
            }
            Self::Hex8 => {
                for (value, [a, b, c]) in values.iter_mut().zip(HEX8_CORNERS) {
                    *value = 0.125 * (1.0 + a * x) * (1.0 + b * y) * (1.0 + c * z);
                }
            }
        }
    }

    /// Evaluates the gradients of all basis functions with respect to the reference coordinates.
    ///
    /// Components beyond the reference dimension are zero.
    pub fn populate_reference_gradients(self, gradients: &mut [Vector3<f64>], xi: &[f64; 3]) {
        assert_eq!(gradients.len(), self.node_count());
        let [x, y, z] = *xi;
        match self {
            Self::Segment2 => {
                gradients[0] = Vector3::new(-0.5, 0.0, 0.0);
                gradients[1] = Vector3::new(0.5, 0.0, 0.0);
            }
            Self::Segment3 => {
                gradients[0] = Vector3::new(x - 0.5, 0.0, 0.0);
                gradients[1] = Vector3::new(x + 0.5, 0.0, 0.0);
                gradients[2] = Vector3::new(-2.0 * x, 0.0, 0.0);
            }
            Self::Tri3 => {
                gradients[0] = Vector3::new(-1.0, -1.0, 0.0);
                gradients[1] = Vector3::new(1.0, 0.0, 0.0);
                gradients[2] = Vector3::new(0.0, 1.0, 0.0);
            }
            Self::Quad4 => {
                for (gradient, [a, b]) in gradients.iter_mut().zip(QUAD4_CORNERS) {
                    *gradient = Vector3::new(
                        0.25 * a * (1.0 + b * y),
                        0.25 * b * (1.0 + a * x),
                        0.0,
                    );
                }
            }
            Self::Tet4 => {
                gradients[0] = Vector3::new(-1.0, -1.0, -1.0);
                gradients[1] = Vector3::new(1.0, 0.0, 0.0);
                gradients[2] = Vector3::new(0.0, 1.0, 0.0);
                gradients[3] = Vector3::new(0.0, 0.0, 1.0);
            }
            Self::Hex8 => {
                for (gradient, [a, b, c]) in gradients.iter_mut().zip(HEX8_CORNERS) {
                    *gradient = 0.125
                        * Vector3::new(
                            a * (1.0 + b * y) * (1.0 + c * z),
                            b * (1.0 + a * x) * (1.0 + c * z),
                            c * (1.0 + a * x) * (1.0 + b * y),
                        );
                }
            }
        }
    }
}

/// The reference-to-physical map is singular or inverted at a point.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SingularJacobian {
    pub determinant: f64,
}

impl fmt::Display for SingularJacobian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element Jacobian determinant {} is not positive", self.determinant)
    }
}

impl Error for SingularJacobian {}

/// Shape function values and physical gradients of one element at one reference point.
///
/// Buffers are reused between evaluations and only grow.
#[derive(Debug, Clone, Default)]
pub struct ShapeFunctionValues {
    values: Vec<f64>,
    gradients: Vec<Vector3<f64>>,
    reference_gradients: Vec<Vector3<f64>>,
    determinant: f64,
}

impl ShapeFunctionValues {
    /// Evaluates values and physical gradients at `xi` for the element with the given vertices.
    ///
    /// The physical coordinates beyond the reference dimension are ignored, so a 2-D element
    /// must live in the xy-plane.
    pub fn evaluate(
        &mut self,
        shape: ElementShape,
        xi: &[f64; 3],
        vertices: &[Point3<f64>],
    ) -> Result<(), SingularJacobian> {
        let n = shape.node_count();
        assert_eq!(vertices.len(), n, "vertex count must match element node count");
        self.values.resize(n, 0.0);
        self.gradients.resize(n, Vector3::zeros());
        self.reference_gradients.resize(n, Vector3::zeros());

        shape.populate_basis(&mut self.values, xi);
        shape.populate_reference_gradients(&mut self.reference_gradients, xi);

        let rdim = shape.reference_dim();
        let mut jacobian = Matrix3::identity();
        for a in 0..rdim {
            for b in 0..rdim {
                jacobian[(a, b)] = vertices
                    .iter()
                    .zip(&self.reference_gradients)
                    .map(|(x, dn)| x[a] * dn[b])
                    .sum();
            }
        }

        let determinant = jacobian.determinant();
        self.determinant = determinant;
        let inverse = jacobian
            .try_inverse()
            .filter(|_| determinant.is_finite() && determinant > 0.0)
            .ok_or(SingularJacobian { determinant })?;
        let inverse_transpose = inverse.transpose();

        for (gradient, reference_gradient) in self.gradients.iter_mut().zip(&self.reference_gradients) {
            *gradient = inverse_transpose * reference_gradient;
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Gradients with respect to physical coordinates.
    pub fn gradients(&self) -> &[Vector3<f64>] {
        &self.gradients
    }

    /// Determinant of the reference-to-physical Jacobian.
    pub fn determinant(&self) -> f64 {
        self.determinant
    }
}
