//! Quadrature rules on the reference elements.
//!
//! Points are always stored as three reference coordinates; unused trailing coordinates are zero.
use crate::element::ElementShape;
use std::f64::consts::PI;

/// Recurrence relation for Legendre polynomials.
///
/// Derivatives are *not* defined at |x| == 1, so this is only suitable for evaluation in the
/// open interval (-1, 1).
#[derive(Debug, Default)]
struct LegendreRecurrence {
    n: usize,
    x: f64,
    // p_n(x)
    p1: f64,
    // p_{n - 1}(x)
    p2: f64,
}

impl LegendreRecurrence {
    fn evaluate(n: usize, x: f64) -> Self {
        //  m P_m(x) = (2m - 1) * x P_{m - 1}(x) - (m - 1) P_{m - 2}(x)
        let mut p1 = 1.0;
        let mut p2 = 0.0;
        let mut p3;
        for m in 1..=n {
            let m = m as f64;
            p3 = p2;
            p2 = p1;
            p1 = ((2.0 * m - 1.0) * x * p2 - (m - 1.0) * p3) / m;
        }

        Self { n, x, p1, p2 }
    }

    fn value_and_derivative(&self) -> (f64, f64) {
        let Self { n, x, p1, p2 } = *self;
        let n = n as f64;
        (p1, n * (x * p1 - p2) / (x * x - 1.0))
    }
}

/// Gauss-Legendre points and weights on `[-1, 1]`.
///
/// Given `n` points, the rule integrates polynomials of order up to `2 n - 1` exactly.
///
/// # Panics
///
/// Panics if zero points are requested.
pub fn gauss_legendre(num_points: usize) -> (Vec<f64>, Vec<f64>) {
    let n = num_points;
    assert!(n > 0, "number of points must be positive");

    let m = (n + 1) / 2;
    let mut points = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);

    // Only find the first m roots, the rest follow by symmetry
    for i in 0..m {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let (mut p, mut dp) = LegendreRecurrence::evaluate(n, x).value_and_derivative();

        // The initial guess is close enough that Newton converges in a handful of iterations
        for _ in 0..100 {
            let dx = -p / dp;
            x += dx;
            (p, dp) = LegendreRecurrence::evaluate(n, x).value_and_derivative();
            if dx.abs() <= 1e-15 {
                break;
            }
        }

        points.push(x);
        weights.push(2.0 / ((1.0 - x * x) * dp * dp));
    }

    for i in m..n {
        let mirror_idx = n - i - 1;
        points.push(-points[mirror_idx]);
        weights.push(weights[mirror_idx]);
    }

    (points, weights)
}

/// A quadrature rule with weights and reference points.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadratureRule {
    weights: Vec<f64>,
    points: Vec<[f64; 3]>,
}

impl QuadratureRule {
    pub fn from_weights_and_points(weights: Vec<f64>, points: Vec<[f64; 3]>) -> Self {
        assert_eq!(weights.len(), points.len(), "weights and points must have the same length");
        Self { weights, points }
    }

    pub fn gauss_segment(n: usize) -> Self {
        let (x, w) = gauss_legendre(n);
        let points = x.iter().map(|&xi| [xi, 0.0, 0.0]).collect();
        Self::from_weights_and_points(w, points)
    }

    /// Tensor product Gauss rule on `[-1, 1]^2`.
    pub fn gauss_quad(n: usize) -> Self {
        let (x, w) = gauss_legendre(n);
        let mut weights = Vec::with_capacity(n * n);
        let mut points = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                weights.push(w[i] * w[j]);
                points.push([x[i], x[j], 0.0]);
            }
        }
        Self::from_weights_and_points(weights, points)
    }

    /// Tensor product Gauss rule on `[-1, 1]^3`.
    pub fn gauss_hex(n: usize) -> Self {
        let (x, w) = gauss_legendre(n);
        let mut weights = Vec::with_capacity(n * n * n);
        let mut points = Vec::with_capacity(n * n * n);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    weights.push(w[i] * w[j] * w[k]);
                    points.push([x[i], x[j], x[k]]);
                }
            }
        }
        Self::from_weights_and_points(weights, points)
    }

    /// Three-point rule on the reference triangle `(0, 0), (1, 0), (0, 1)`, exact for quadratics.
    pub fn triangle_strength2() -> Self {
        let a = 1.0 / 6.0;
        let b = 2.0 / 3.0;
        Self::from_weights_and_points(vec![a; 3], vec![[a, a, 0.0], [b, a, 0.0], [a, b, 0.0]])
    }

    /// Four-point rule on the reference tetrahedron, exact for quadratics.
    pub fn tetrahedron_strength2() -> Self {
        let a = 0.585_410_196_624_968_5;
        let b = 0.138_196_601_125_010_5;
        let w = 1.0 / 24.0;
        Self::from_weights_and_points(
            vec![w; 4],
            vec![[a, b, b], [b, a, b], [b, b, a], [b, b, b]],
        )
    }

    /// The rule used by the assembler for the given shape.
    pub fn default_for(shape: ElementShape) -> Self {
        match shape {
            ElementShape::Segment2 => Self::gauss_segment(2),
            ElementShape::Segment3 => Self::gauss_segment(3),
            ElementShape::Quad4 => Self::gauss_quad(2),
            ElementShape::Hex8 => Self::gauss_hex(2),
            ElementShape::Tri3 => Self::triangle_strength2(),
            ElementShape::Tet4 => Self::tetrahedron_strength2(),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f64; 3])> {
        self.weights.iter().copied().zip(self.points.iter())
    }
}
