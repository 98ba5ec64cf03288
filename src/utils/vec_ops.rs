//! Element-wise vector operations for the iterative solvers
//!
//! Scalar f64 versions of the BLAS-1 style kernels used by conjugate
//! gradient and the Gauss-Newton updaters.

/// Compute dot product: sum(a[i] * b[i])
#[inline]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&ai, &bi)| ai * bi).sum()
}

/// Compute squared norm: sum(a[i]^2)
#[inline]
pub fn norm_squared(a: &[f64]) -> f64 {
    a.iter().map(|&ai| ai * ai).sum()
}

/// Compute a[i] = a[i] + alpha * b[i] (axpy operation)
#[inline]
pub fn axpy(a: &mut [f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    for (ai, &bi) in a.iter_mut().zip(b.iter()) {
        *ai += alpha * bi;
    }
}

/// Compute a[i] = b[i] + beta * a[i] (used in CG for p update)
#[inline]
pub fn xpby(a: &mut [f64], b: &[f64], beta: f64) {
    debug_assert_eq!(a.len(), b.len());
    for (ai, &bi) in a.iter_mut().zip(b.iter()) {
        *ai = bi + beta * *ai;
    }
}

/// Compute a[i] = a[i] * b[i]
#[inline]
pub fn mul_inplace(a: &mut [f64], b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    for (ai, &bi) in a.iter_mut().zip(b.iter()) {
        *ai *= bi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_and_norm() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, -5.0, 6.0];
        assert_eq!(dot_product(&a, &b), 12.0);
        assert_eq!(norm_squared(&a), 14.0);
    }

    #[test]
    fn test_axpy_xpby() {
        let mut a = vec![1.0, 1.0];
        axpy(&mut a, 2.0, &[1.0, -1.0]);
        assert_eq!(a, vec![3.0, -1.0]);
        xpby(&mut a, &[1.0, 1.0], 0.5);
        assert_eq!(a, vec![2.5, 0.5]);
        mul_inplace(&mut a, &[2.0, 4.0]);
        assert_eq!(a, vec![5.0, 2.0]);
    }
}
