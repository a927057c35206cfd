use crate::Real;
use log::warn;
use na::DVector;
use nalgebra_sparse::CscMatrix;

/// Conjugate-gradient solve of `a x = b`, warm-started from the incoming
/// `x`. Stops after `max_iters` iterations or once the squared residual has
/// dropped below `eps² · ‖r₀‖²`. Returns the number of iterations run.
pub fn solve_conjugate_gradient(
    a: &CscMatrix<Real>,
    b: &DVector<Real>,
    x: &mut DVector<Real>,
    max_iters: usize,
    eps: Real,
) -> usize {
    let eps2 = eps * eps;
    let mut r = b - a * &*x;
    let mut d = r.clone();
    let mut delta_new = r.dot(&r);
    let delta_0 = delta_new;

    if delta_new < eps2 {
        warn!("initial residual already below tolerance: {delta_new:.3e} < {eps2:.3e}");
        return 0;
    }

    let mut iters = 0;
    while iters < max_iters && delta_new > eps2 * delta_0 {
        let q = a * &d;
        let d_dot_q = d.dot(&q);
        if d_dot_q == 0.0 {
            warn!("conjugate gradient stalled after {iters} iterations");
            break;
        }
        let alpha = delta_new / d_dot_q;
        x.axpy(alpha, &d, 1.0);
        // Recompute the residual from scratch now and then to cancel the
        // drift of the incremental update.
        if iters % 50 == 49 {
            r = b - a * &*x;
        } else {
            r.axpy(-alpha, &q, 1.0);
        }
        let delta_old = delta_new;
        delta_new = r.dot(&r);
        let beta = delta_new / delta_old;
        d.axpy(1.0, &r, beta);
        iters += 1;
    }
    iters
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    #[test]
    fn solves_small_spd_system() {
        // Tridiagonal SPD matrix.
        let n = 20;
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.0);
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
                coo.push(i + 1, i, -1.0);
            }
        }
        let a = CscMatrix::from(&coo);
        let expected = DVector::from_fn(n, |i, _| (i as Real * 0.37).sin());
        let b = &a * &expected;
        let mut x = DVector::zeros(n);
        let iters = solve_conjugate_gradient(&a, &b, &mut x, 200, 1.0e-10);
        assert!(iters > 0);
        assert!((x - expected).norm() < 1.0e-6);
    }
}
