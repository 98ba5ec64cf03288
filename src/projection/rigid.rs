//! Rigid-body transforms
//!
//! Parameters `q = [tx, ty, tz, rx, ry, rz]`: translations in mm and
//! rotations in radians about the x, y and z axes. The rotation is applied
//! about a fixed world-space centre:
//!
//! `R(q) = C · T(t) · Rx · Ry · Rz · C⁻¹`

use nalgebra::Matrix4;

/// Number of rigid parameters
pub const N_RIGID: usize = 6;

/// Parameters that can move for 3D lattices
const ACTIVE_3D: [usize; 6] = [0, 1, 2, 3, 4, 5];
/// In-plane parameters (tx, ty, rz) for single-slice lattices
const ACTIVE_2D: [usize; 3] = [0, 1, 5];

/// Indices of the parameters estimated for 2D or 3D data
pub fn active_parameters(is_2d: bool) -> &'static [usize] {
    if is_2d {
        &ACTIVE_2D
    } else {
        &ACTIVE_3D
    }
}

fn translation(t: [f64; 3]) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m[(0, 3)] = t[0];
    m[(1, 3)] = t[1];
    m[(2, 3)] = t[2];
    m
}

/// Rotation about `axis` by `angle`, or its derivative with respect to the
/// angle when `derivative` is set
fn rotation(axis: usize, angle: f64, derivative: bool) -> Matrix4<f64> {
    let (s, c) = angle.sin_cos();
    let (a, b) = match axis {
        0 => (1, 2),
        1 => (2, 0),
        _ => (0, 1),
    };
    let mut m = if derivative { Matrix4::zeros() } else { Matrix4::identity() };
    if derivative {
        m[(a, a)] = -s;
        m[(a, b)] = -c;
        m[(b, a)] = c;
        m[(b, b)] = -s;
    } else {
        m[(a, a)] = c;
        m[(a, b)] = -s;
        m[(b, a)] = s;
        m[(b, b)] = c;
    }
    m
}

/// World-space rigid transform for parameters `q` about `center`
pub fn rigid_matrix(q: &[f64; N_RIGID], center: [f64; 3]) -> Matrix4<f64> {
    let c = translation(center);
    let c_inv = translation([-center[0], -center[1], -center[2]]);
    c * translation([q[0], q[1], q[2]])
        * rotation(0, q[3], false)
        * rotation(1, q[4], false)
        * rotation(2, q[5], false)
        * c_inv
}

/// Partial derivatives of [`rigid_matrix`] with respect to each parameter
pub fn rigid_matrix_derivatives(q: &[f64; N_RIGID], center: [f64; 3]) -> [Matrix4<f64>; N_RIGID] {
    let c = translation(center);
    let c_inv = translation([-center[0], -center[1], -center[2]]);
    let t = translation([q[0], q[1], q[2]]);
    let rx = rotation(0, q[3], false);
    let ry = rotation(1, q[4], false);
    let rz = rotation(2, q[5], false);
    let rot = rx * ry * rz;

    let mut out = [Matrix4::zeros(); N_RIGID];
    for (d, m) in out.iter_mut().take(3).enumerate() {
        let mut dt = Matrix4::zeros();
        dt[(d, 3)] = 1.0;
        *m = c * dt * rot * c_inv;
    }
    out[3] = c * t * rotation(0, q[3], true) * ry * rz * c_inv;
    out[4] = c * t * rx * rotation(1, q[4], true) * rz * c_inv;
    out[5] = c * t * rx * ry * rotation(2, q[5], true) * c_inv;
    out
}

/// Subtract the mean parameter vector from every entry
pub fn remove_mean(params: &mut [[f64; N_RIGID]]) {
    if params.is_empty() {
        return;
    }
    let n = params.len() as f64;
    let mut mean = [0.0; N_RIGID];
    for q in params.iter() {
        for (m, v) in mean.iter_mut().zip(q) {
            *m += v / n;
        }
    }
    for q in params.iter_mut() {
        for (v, m) in q.iter_mut().zip(&mean) {
            *v -= m;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector4;

    #[test]
    fn test_identity_at_zero() {
        let m = rigid_matrix(&[0.0; 6], [3.0, -2.0, 1.0]);
        assert!((m - Matrix4::identity()).norm() < 1e-14);
    }

    #[test]
    fn test_center_is_fixed_by_rotation() {
        let center = [4.0, 5.0, 6.0];
        let m = rigid_matrix(&[0.0, 0.0, 0.0, 0.3, -0.2, 0.5], center);
        let p = m * Vector4::new(center[0], center[1], center[2], 1.0);
        for d in 0..3 {
            assert!((p[d] - center[d]).abs() < 1e-12);
        }
        let r = m.fixed_view::<3, 3>(0, 0);
        assert!((r.transpose() * r - nalgebra::Matrix3::identity()).norm() < 1e-12, "rotation must be orthonormal");
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let q = [1.0, -0.5, 2.0, 0.1, 0.2, -0.3];
        let center = [1.0, 2.0, 3.0];
        let derivs = rigid_matrix_derivatives(&q, center);
        let h = 1e-6;
        for k in 0..N_RIGID {
            let mut qp = q;
            let mut qm = q;
            qp[k] += h;
            qm[k] -= h;
            let fd = (rigid_matrix(&qp, center) - rigid_matrix(&qm, center)) / (2.0 * h);
            assert!((fd - derivs[k]).norm() < 1e-6, "parameter {} derivative differs", k);
        }
    }

    #[test]
    fn test_remove_mean() {
        let mut p = vec![[1.0, 2.0, 0.0, 0.0, 0.0, 0.1], [3.0, -2.0, 0.0, 0.0, 0.0, -0.3]];
        remove_mean(&mut p);
        assert_eq!(p[0][0], -1.0);
        assert_eq!(p[1][0], 1.0);
        assert_eq!(p[0][1], 2.0);
        assert!((p[0][5] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_active_parameters() {
        assert_eq!(active_parameters(true), &[0, 1, 5]);
        assert_eq!(active_parameters(false).len(), 6);
    }
}
