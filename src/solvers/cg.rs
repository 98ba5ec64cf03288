//! Preconditioned Conjugate Gradient solver
//!
//! Solves Ax = b for symmetric positive definite A with a diagonal
//! preconditioner. Operators write into caller-provided buffers so the
//! image update can run without allocating per iteration.

use crate::utils::vec_ops::{axpy, dot_product, norm_squared, xpby};

/// Preconditioned conjugate gradient solver (in-place)
///
/// # Arguments
/// * `a_op` - Closure computing `out = A * v`
/// * `inv_precond` - Inverse of the diagonal preconditioner (all positive)
/// * `b` - Right-hand side vector
/// * `x` - Initial guess on entry, solution on return
/// * `tol` - Relative residual tolerance
/// * `max_iter` - Maximum iterations
///
/// # Returns
/// Number of iterations performed
pub fn pcg_solve<F>(
    mut a_op: F,
    inv_precond: &[f64],
    b: &[f64],
    x: &mut [f64],
    tol: f64,
    max_iter: usize,
) -> usize
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = b.len();
    debug_assert_eq!(x.len(), n);
    debug_assert_eq!(inv_precond.len(), n);

    let b_norm = norm_squared(b).sqrt();
    if b_norm == 0.0 && norm_squared(x) == 0.0 {
        return 0;
    }

    // r = b - A*x
    let mut r = vec![0.0; n];
    a_op(x, &mut r);
    for (ri, &bi) in r.iter_mut().zip(b.iter()) {
        *ri = bi - *ri;
    }

    let mut z: Vec<f64> = r.iter().zip(inv_precond).map(|(&ri, &mi)| ri * mi).collect();
    let mut p = z.clone();
    let mut ap = vec![0.0; n];
    let mut rz_old = dot_product(&r, &z);

    for iter in 0..max_iter {
        if norm_squared(&r).sqrt() <= tol * b_norm {
            return iter;
        }

        a_op(&p, &mut ap);
        let pap = dot_product(&p, &ap);
        if pap.abs() < 1e-300 || !pap.is_finite() {
            return iter;
        }

        let alpha = rz_old / pap;
        axpy(x, alpha, &p);
        axpy(&mut r, -alpha, &ap);

        for ((zi, &ri), &mi) in z.iter_mut().zip(r.iter()).zip(inv_precond) {
            *zi = ri * mi;
        }
        let rz_new = dot_product(&r, &z);
        let beta = rz_new / rz_old;

        // p = z + beta * p
        xpby(&mut p, &z, beta);
        rz_old = rz_new;
    }

    max_iter
}
