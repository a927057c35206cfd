//! Per-depth 1D quadratic B-spline family and the pairwise integrals the
//! finite-element operators are assembled from.
//!
//! Every octree node at depth `d` and offset `o` carries the separable basis
//! function `φ_{d,o}(x, y, z) = φ_{d,ox}(x) φ_{d,oy}(y) φ_{d,oz}(z)`, where
//! the 1D factor is a quadratic B-spline centered at `(o + ½)/2^d` with
//! support width `3/2^d`, normalized to unit integral. Boundary behavior is
//! obtained by summing reflected images of the spline about the domain ends.

use crate::polynomial::Polynomial;
use crate::Real;

/// Domain boundary handling for the B-spline basis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum BoundaryType {
    /// No boundary: the domain is embedded in a doubled cube and splines are
    /// not reflected.
    None,
    /// Reflection without sign flip; the basis has zero derivative at the
    /// domain boundary.
    #[default]
    Neumann,
    /// Reflection with sign flip; the basis vanishes at the domain boundary.
    Dirichlet,
}

#[derive(Copy, Clone, Debug)]
struct Piece {
    start: Real,
    end: Real,
    poly: Polynomial<6>,
}

/// A sum of polynomial pieces over (possibly overlapping) intervals.
#[derive(Clone, Debug, Default)]
pub struct PiecewisePolynomial {
    pieces: Vec<Piece>,
}

impl PiecewisePolynomial {
    pub fn eval(&self, x: Real) -> Real {
        self.pieces
            .iter()
            .filter(|p| x >= p.start && x < p.end)
            .map(|p| p.poly.eval(x))
            .sum()
    }

    #[must_use]
    pub fn derivative(&self) -> Self {
        Self {
            pieces: self
                .pieces
                .iter()
                .map(|p| Piece {
                    start: p.start,
                    end: p.end,
                    poly: p.poly.derivative(),
                })
                .collect(),
        }
    }

    /// `∫ self · other dx` over the intersection of their supports.
    pub fn dot(&self, other: &Self) -> Real {
        let mut result = 0.0;
        for p in &self.pieces {
            for q in &other.pieces {
                let start = p.start.max(q.start);
                let end = p.end.min(q.end);
                if end > start {
                    result += (p.poly * q.poly).integral(start, end);
                }
            }
        }
        result
    }
}

// The quadratic B-spline on [0, 3), one polynomial per unit interval.
fn bspline03() -> [Polynomial<6>; 3] {
    [
        Polynomial::quadratic(0.0, 0.0, 0.5),    // x in [0, 1)
        Polynomial::quadratic(-1.5, 3.0, -1.0),  // x in [1, 2)
        Polynomial::quadratic(4.5, -3.0, 0.5),   // x in [2, 3)
    ]
}

// Unreflected pieces of the unit-integral spline centered at `center` with
// cell width `width` (support `3 * width`).
fn base_pieces(center: Real, width: Real) -> Vec<Piece> {
    let start = center - 1.5 * width;
    bspline03()
        .into_iter()
        .enumerate()
        .map(|(k, b)| Piece {
            start: start + k as Real * width,
            end: start + (k + 1) as Real * width,
            // Map the reference interval [0, 3) onto the cell and normalize
            // to unit integral.
            poly: b.compose_affine(-start / width, 1.0 / width) * (1.0 / width),
        })
        .collect()
}

/// The basis family for all depths `0..=max_depth`, plus its integrator.
pub struct BSplineBasis {
    max_depth: usize,
    boundary: BoundaryType,
    fns: Vec<Vec<PiecewisePolynomial>>,
    derivs: Vec<Vec<PiecewisePolynomial>>,
}

impl BSplineBasis {
    pub fn new(max_depth: usize, boundary: BoundaryType) -> Self {
        let mut fns = Vec::with_capacity(max_depth + 1);
        for d in 0..=max_depth {
            let res = 1usize << d;
            let width = 1.0 / res as Real;
            let fns_d: Vec<_> = (0..res)
                .map(|o| Self::build_function(o, width, boundary))
                .collect();
            fns.push(fns_d);
        }
        let derivs = fns
            .iter()
            .map(|fns_d| fns_d.iter().map(|f| f.derivative()).collect())
            .collect();
        Self {
            max_depth,
            boundary,
            fns,
            derivs,
        }
    }

    fn build_function(o: usize, width: Real, boundary: BoundaryType) -> PiecewisePolynomial {
        let center = (o as Real + 0.5) * width;
        let primary = base_pieces(center, width);

        if boundary == BoundaryType::None {
            return PiecewisePolynomial { pieces: primary };
        }

        // Sum the images of the spline under the reflection group of [0, 1]:
        // translations x → x + 2k and reflections x → 2k − x. For support
        // widths at most 3 only k ∈ {−1, 0, 1} can overlap the domain.
        let sigma = if boundary == BoundaryType::Dirichlet {
            -1.0
        } else {
            1.0
        };
        let mut pieces = vec![];
        for k in -1i32..=1 {
            let shift = 2.0 * k as Real;
            for p in &primary {
                let (start, end) = (p.start + shift, p.end + shift);
                if end > 0.0 && start < 1.0 {
                    pieces.push(Piece {
                        start: start.max(0.0),
                        end: end.min(1.0),
                        poly: p.poly.compose_affine(-shift, 1.0),
                    });
                }
                let (start, end) = (shift - p.end, shift - p.start);
                if end > 0.0 && start < 1.0 {
                    pieces.push(Piece {
                        start: start.max(0.0),
                        end: end.min(1.0),
                        poly: p.poly.compose_affine(shift, -1.0) * sigma,
                    });
                }
            }
        }
        PiecewisePolynomial { pieces }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn boundary(&self) -> BoundaryType {
        self.boundary
    }

    pub fn function(&self, depth: usize, offset: usize) -> &PiecewisePolynomial {
        &self.fns[depth][offset]
    }

    /// `φ_{d,o}(x)`.
    pub fn value(&self, depth: usize, offset: usize, x: Real) -> Real {
        self.fns[depth][offset].eval(x)
    }

    /// `φ'_{d,o}(x)`.
    pub fn deriv(&self, depth: usize, offset: usize, x: Real) -> Real {
        self.derivs[depth][offset].eval(x)
    }

    /// `∫ ∂^{d1} φ_{d,o1} · ∂^{d2} φ_{d',o2} dx` with `d' = d − 1` when
    /// `child_parent` is set, `d' = d` otherwise.
    pub fn dot(
        &self,
        depth: usize,
        o1: usize,
        o2: usize,
        deriv1: bool,
        deriv2: bool,
        child_parent: bool,
    ) -> Real {
        let d2 = if child_parent { depth - 1 } else { depth };
        let f1 = if deriv1 {
            &self.derivs[depth][o1]
        } else {
            &self.fns[depth][o1]
        };
        let f2 = if deriv2 {
            &self.derivs[d2][o2]
        } else {
            &self.fns[d2][o2]
        };
        f1.dot(f2)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn quadrature(f: impl Fn(Real) -> Real, start: Real, end: Real, n: usize) -> Real {
        let h = (end - start) / n as Real;
        (0..n)
            .map(|i| f(start + (i as Real + 0.5) * h) * h)
            .sum()
    }

    #[test]
    fn unit_integral() {
        for boundary in [
            BoundaryType::None,
            BoundaryType::Neumann,
            BoundaryType::Dirichlet,
        ] {
            let basis = BSplineBasis::new(3, boundary);
            // Interior function, away from any reflection.
            let integral = quadrature(|x| basis.value(3, 4, x), 0.0, 1.0, 4000);
            assert!((integral - 1.0).abs() < 1.0e-6, "{boundary:?}: {integral}");
        }
    }

    #[test]
    fn partition_of_unity_scales_with_depth() {
        let basis = BSplineBasis::new(4, BoundaryType::Neumann);
        let d = 4;
        let sum: Real = (0..16).map(|o| basis.value(d, o, 0.53)).sum();
        assert!((sum - 16.0).abs() < 1.0e-9);
    }

    #[test]
    fn dot_symmetry() {
        let basis = BSplineBasis::new(4, BoundaryType::Neumann);
        for o1 in 0..16 {
            for o2 in 0..16 {
                let a = basis.dot(4, o1, o2, false, false, false);
                let b = basis.dot(4, o2, o1, false, false, false);
                assert!((a - b).abs() <= 1.0e-10 * a.abs().max(1.0));
                let a = basis.dot(4, o1, o2, true, true, false);
                let b = basis.dot(4, o2, o1, true, true, false);
                assert!((a - b).abs() <= 1.0e-8 * a.abs().max(1.0));
            }
        }
    }

    #[test]
    fn dot_matches_quadrature() {
        let basis = BSplineBasis::new(3, BoundaryType::Neumann);
        let numeric = quadrature(|x| basis.value(3, 3, x) * basis.value(3, 4, x), 0.0, 1.0, 8000);
        let exact = basis.dot(3, 3, 4, false, false, false);
        assert!((numeric - exact).abs() < 1.0e-5);

        let numeric = quadrature(
            |x| basis.value(3, 3, x) * basis.value(2, 2, x),
            0.0,
            1.0,
            8000,
        );
        let exact = basis.dot(3, 3, 2, false, false, true);
        assert!((numeric - exact).abs() < 1.0e-5);
    }

    #[test]
    fn derivative_antisymmetry() {
        // With no boundary terms, ∫ φ'ψ = −∫ φψ'.
        let basis = BSplineBasis::new(4, BoundaryType::None);
        let a = basis.dot(4, 6, 7, true, false, false);
        let b = basis.dot(4, 6, 7, false, true, false);
        assert!((a + b).abs() < 1.0e-10);
    }

    #[test]
    fn dirichlet_vanishes_at_boundary() {
        let basis = BSplineBasis::new(3, BoundaryType::Dirichlet);
        assert!(basis.value(3, 0, 1.0e-9).abs() < 1.0e-5);
        assert!(basis.value(3, 7, 1.0 - 1.0e-9).abs() < 1.0e-5);
    }

    #[test]
    fn neumann_flat_at_boundary() {
        let basis = BSplineBasis::new(3, BoundaryType::Neumann);
        assert!(basis.deriv(3, 0, 1.0e-9).abs() < 1.0e-4);
        assert!(basis.deriv(3, 7, 1.0 - 1.0e-9).abs() < 1.0e-4);
    }
}
