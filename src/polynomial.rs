//! Small dense polynomials: the scalar machinery behind the piecewise
//! B-spline tables.
//!
//! Everything the basis needs reduces to a handful of operations on
//! low-degree polynomials over one cell interval: evaluation,
//! differentiation, definite integrals, products (for the pairwise
//! integrator) and affine reparameterization (to place a reference spline
//! piece on a cell, or reflect it across a domain boundary). Degrees stay
//! tiny, so coefficients live in a fixed-width array indexed by power.

use crate::Real;
use std::array;
use std::ops::Mul;

/// A polynomial of degree below `N`, stored by increasing power.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Polynomial<const N: usize> {
    coeffs: [Real; N],
}

impl<const N: usize> Polynomial<N> {
    pub fn zero() -> Self {
        Self { coeffs: [0.0; N] }
    }

    /// `c0 + c1·x + c2·x²`, padded up to the storage width.
    pub fn quadratic(c0: Real, c1: Real, c2: Real) -> Self {
        let mut result = Self::zero();
        result.coeffs[0] = c0;
        result.coeffs[1] = c1;
        result.coeffs[2] = c2;
        result
    }

    pub fn eval(&self, x: Real) -> Real {
        self.coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
    }

    #[must_use]
    pub fn derivative(&self) -> Self {
        Self {
            coeffs: array::from_fn(|i| {
                if i + 1 < N {
                    self.coeffs[i + 1] * (i + 1) as Real
                } else {
                    0.0
                }
            }),
        }
    }

    // The antiderivative with zero constant term. Every coefficient shifts
    // one slot up, so the top slot must be free.
    fn antiderivative(&self) -> Self {
        assert_eq!(
            self.coeffs[N - 1],
            0.0,
            "antiderivative needs a spare coefficient slot"
        );
        Self {
            coeffs: array::from_fn(|i| {
                if i == 0 {
                    0.0
                } else {
                    self.coeffs[i - 1] / i as Real
                }
            }),
        }
    }

    /// Definite integral over `[start, end]`.
    pub fn integral(&self, start: Real, end: Real) -> Real {
        let primitive = self.antiderivative();
        primitive.eval(end) - primitive.eval(start)
    }

    /// The reparameterized polynomial `x ↦ P(c0 + c1·x)`. A negative `c1`
    /// reflects the axis, which is how boundary images are built.
    #[must_use]
    pub fn compose_affine(&self, c0: Real, c1: Real) -> Self {
        // Horner's scheme over the argument polynomial: fold the
        // coefficients from the top down, multiplying the accumulator by
        // (c0 + c1·x) at each step. The accumulator stays one degree short
        // of the storage width until the final fold, so the shifted term
        // never spills.
        let mut acc = Self::zero();
        for &c in self.coeffs.iter().rev() {
            let mut next = [0.0; N];
            for (i, &a) in acc.coeffs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                next[i] += a * c0;
                if i + 1 < N {
                    next[i + 1] += a * c1;
                }
            }
            next[0] += c;
            acc = Self { coeffs: next };
        }
        acc
    }
}

impl<const N: usize> Mul<Real> for Polynomial<N> {
    type Output = Self;
    fn mul(mut self, rhs: Real) -> Self {
        for c in &mut self.coeffs {
            *c *= rhs;
        }
        self
    }
}

impl<const N: usize> Mul for Polynomial<N> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let mut coeffs = [0.0; N];
        for (i, &a) in self.coeffs.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            for (j, &b) in rhs.coeffs.iter().enumerate() {
                if b == 0.0 {
                    continue;
                }
                assert!(i + j < N, "product degree exceeds the coefficient storage");
                coeffs[i + j] += a * b;
            }
        }
        Self { coeffs }
    }
}

/// Real roots of `c0 + c1 x + c2 x² = value`, smallest first.
pub fn solve_quadratic(coeffs: [Real; 3], value: Real, epsilon: Real) -> Vec<Real> {
    let c = coeffs[0] - value;
    let b = coeffs[1];
    let a = coeffs[2];

    if a.abs() <= epsilon {
        if b.abs() <= epsilon {
            return vec![];
        }
        return vec![-c / b];
    }

    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        vec![]
    } else if disc <= epsilon * epsilon {
        vec![-b / (2.0 * a)]
    } else {
        let sq = disc.sqrt();
        let mut roots = vec![(-b - sq) / (2.0 * a), (-b + sq) / (2.0 * a)];
        roots.sort_by(|x, y| x.partial_cmp(y).unwrap());
        roots
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eval_matches_the_expanded_form() {
        // (2 − x + 0.5x²)(1 + 0.5x²) = 2 − x + 1.5x² − 0.5x³ + 0.25x⁴.
        let p = Polynomial::<6>::quadratic(2.0, -1.0, 0.5)
            * Polynomial::<6>::quadratic(1.0, 0.0, 0.5);
        for i in 0..7 {
            let x = -1.2 + 0.4 * i as Real;
            let direct =
                2.0 - x + 1.5 * x * x - 0.5 * x.powi(3) + 0.25 * x.powi(4);
            assert!((p.eval(x) - direct).abs() < 1.0e-12);
        }
    }

    #[test]
    fn derivative_inverts_the_antiderivative() {
        // (3 − 2x²)(1 + x) = 3 + 3x − 2x² − 2x³.
        let p = Polynomial::<6>::quadratic(3.0, 0.0, -2.0)
            * Polynomial::<6>::quadratic(1.0, 1.0, 0.0);
        let restored = p.antiderivative().derivative();
        for i in 0..9 {
            let x = -2.0 + 0.5 * i as Real;
            assert!(
                (restored.eval(x) - p.eval(x)).abs() < 1.0e-12 * p.eval(x).abs().max(1.0)
            );
        }
        // The fundamental theorem, on an asymmetric interval.
        let delta = p.eval(2.0) - p.eval(-0.5);
        assert!((p.derivative().integral(-0.5, 2.0) - delta).abs() < 1.0e-12);
    }

    #[test]
    fn definite_integral() {
        // ∫₀¹ (1 + 2x + 3x²) dx = 3.
        let p = Polynomial::<6>::quadratic(1.0, 2.0, 3.0);
        assert!((p.integral(0.0, 1.0) - 3.0).abs() < 1.0e-12);
        // Swapping the bounds flips the sign.
        assert!((p.integral(1.0, 0.0) + 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn product_convolves_coefficients() {
        // (1 − x)(1 + x) = 1 − x².
        let a = Polynomial::<6>::quadratic(1.0, -1.0, 0.0);
        let b = Polynomial::<6>::quadratic(1.0, 1.0, 0.0);
        assert_eq!(a * b, Polynomial::<6>::quadratic(1.0, 0.0, -1.0));
    }

    #[test]
    fn affine_composition_works_beyond_degree_two() {
        // A degree-4 polynomial built as a product of two quadratics.
        let p = Polynomial::<6>::quadratic(0.5, -2.0, 1.5)
            * Polynomial::<6>::quadratic(1.0, 0.5, -1.0);
        let q = p.compose_affine(0.8, -2.5);
        for i in 0..9 {
            let x = -1.0 + 0.25 * i as Real;
            assert!((q.eval(x) - p.eval(0.8 - 2.5 * x)).abs() < 1.0e-9);
        }
        // Pure reflection about the origin.
        let r = p.compose_affine(0.0, -1.0);
        assert!((r.eval(0.7) - p.eval(-0.7)).abs() < 1.0e-12);
    }

    #[test]
    fn quadratic_roots() {
        // (x − 2)(x + 1) = x² − x − 2.
        let roots = solve_quadratic([-2.0, -1.0, 1.0], 0.0, 1.0e-12);
        assert_eq!(roots.len(), 2);
        assert!((roots[0] + 1.0).abs() < 1.0e-12);
        assert!((roots[1] - 2.0).abs() < 1.0e-12);

        // Degenerate leading coefficient falls back to the linear root.
        let roots = solve_quadratic([1.0, -2.0, 0.0], 0.0, 1.0e-12);
        assert_eq!(roots.len(), 1);
        assert!((roots[0] - 0.5).abs() < 1.0e-12);
    }
}
