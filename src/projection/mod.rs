//! Forward and adjoint projection between the reconstruction lattice and
//! one observation
//!
//! For observation voxel `v` the prediction is
//!
//! `A(y)[v] = Σ_s w_s · y(M_y⁻¹ · R(q) · M_n · (v + t_s e_axis))`
//!
//! where `M_y`, `M_n` are the voxel-to-world matrices of the reconstruction
//! and observation lattices, `R(q)` the rigid transform about the
//! reconstruction centre and `(t_s, w_s)` the slice profile. `y` is read by
//! trilinear interpolation with zero outside the lattice, and the adjoint
//! spreads with the same weights.
//!
//! - `interp`: trilinear pull/push
//! - `rigid`: rigid matrices and their derivatives
//! - `slice_profile`: through-plane sampling

pub mod interp;
pub mod rigid;
pub mod slice_profile;

pub use rigid::*;
pub use slice_profile::*;

use nalgebra::Matrix4;

use crate::error::{MtvError, Result};
use crate::volume::Lattice;

/// Affine map from observation voxel coordinates to reconstruction voxel
/// coordinates, stored by columns
type AffineColumns = [[f64; 3]; 4];

fn columns(m: &Matrix4<f64>) -> AffineColumns {
    let mut cols = [[0.0; 3]; 4];
    for (c, col) in cols.iter_mut().enumerate() {
        for (r, v) in col.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    cols
}

/// A / At for one observation
#[derive(Debug, Clone)]
pub struct Projector {
    recon_dims: [usize; 3],
    obs_dims: [usize; 3],
    recon_inv: Matrix4<f64>,
    obs_mat: Matrix4<f64>,
    center: [f64; 3],
    profile: SliceProfile,
    q: [f64; N_RIGID],
    cols: AffineColumns,
}

impl Projector {
    pub fn new(recon: &Lattice, obs: &Lattice, profile: SliceProfile) -> Result<Self> {
        let recon_inv = recon
            .mat
            .try_inverse()
            .ok_or_else(|| MtvError::Numerical("reconstruction orientation matrix is singular".to_string()))?;
        let mut p = Self {
            recon_dims: recon.dims,
            obs_dims: obs.dims,
            recon_inv,
            obs_mat: obs.mat,
            center: recon.world_center(),
            profile,
            q: [0.0; N_RIGID],
            cols: [[0.0; 3]; 4],
        };
        p.update_transform();
        Ok(p)
    }

    fn update_transform(&mut self) {
        let t = self.recon_inv * rigid_matrix(&self.q, self.center) * self.obs_mat;
        self.cols = columns(&t);
    }

    #[inline]
    pub fn rigid(&self) -> [f64; N_RIGID] {
        self.q
    }

    pub fn set_rigid(&mut self, q: [f64; N_RIGID]) {
        self.q = q;
        self.update_transform();
    }

    #[inline]
    pub fn profile(&self) -> &SliceProfile {
        &self.profile
    }

    #[inline]
    pub fn recon_len(&self) -> usize {
        self.recon_dims.iter().product()
    }

    #[inline]
    pub fn obs_len(&self) -> usize {
        self.obs_dims.iter().product()
    }

    /// Visit every (observation voxel, profile sample) pair with the
    /// sample's observation coordinate, its reconstruction coordinate and
    /// its weight
    #[inline]
    fn for_each_sample<F: FnMut(usize, [f64; 3], [f64; 3], f64)>(&self, mut f: F) {
        let [nx, ny, nz] = self.obs_dims;
        let cols = &self.cols;
        let axis = self.profile.axis;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = i + j * nx + k * nx * ny;
                    let v = [i as f64, j as f64, k as f64];
                    let mut base = [0.0; 3];
                    for (r, b) in base.iter_mut().enumerate() {
                        *b = cols[3][r] + v[0] * cols[0][r] + v[1] * cols[1][r] + v[2] * cols[2][r];
                    }
                    for (&t, &w) in self.profile.offsets.iter().zip(&self.profile.weights) {
                        let c = [
                            base[0] + t * cols[axis][0],
                            base[1] + t * cols[axis][1],
                            base[2] + t * cols[axis][2],
                        ];
                        let mut vs = v;
                        vs[axis] += t;
                        f(idx, vs, c, w);
                    }
                }
            }
        }
    }

    /// `out = A y`
    pub fn forward(&self, y: &[f64], out: &mut [f64]) {
        debug_assert_eq!(y.len(), self.recon_len());
        debug_assert_eq!(out.len(), self.obs_len());
        out.iter_mut().for_each(|v| *v = 0.0);
        self.for_each_sample(|idx, _, c, w| {
            out[idx] += w * interp::pull(y, self.recon_dims, c);
        });
    }

    /// `out += At x`
    pub fn adjoint_accumulate(&self, x: &[f64], out: &mut [f64]) {
        debug_assert_eq!(x.len(), self.obs_len());
        debug_assert_eq!(out.len(), self.recon_len());
        self.for_each_sample(|idx, _, c, w| {
            let v = x[idx];
            if v != 0.0 {
                interp::push(out, self.recon_dims, c, w * v);
            }
        });
    }

    /// Fraction of each observation voxel's profile that falls inside the
    /// reconstruction lattice: `A(1)`
    pub fn coverage(&self) -> Vec<f64> {
        let ones = vec![1.0; self.recon_len()];
        let mut out = vec![0.0; self.obs_len()];
        self.forward(&ones, &mut out);
        out
    }

    /// Evaluate `A y` together with its derivative with respect to the rigid
    /// parameters, calling `f(voxel, prediction, jacobian_row)` once per
    /// observation voxel in storage order
    pub fn linearize<F: FnMut(usize, f64, &[f64; N_RIGID])>(&self, y: &[f64], mut f: F) {
        let derivs = rigid_matrix_derivatives(&self.q, self.center);
        let mut dcols = [[[0.0; 3]; 4]; N_RIGID];
        for (dc, d) in dcols.iter_mut().zip(derivs.iter()) {
            *dc = columns(&(self.recon_inv * d * self.obs_mat));
        }

        let mut current = usize::MAX;
        let mut pred = 0.0;
        let mut jac = [0.0; N_RIGID];

        self.for_each_sample(|idx, v, c, w| {
            if idx != current {
                if current != usize::MAX {
                    f(current, pred, &jac);
                }
                current = idx;
                pred = 0.0;
                jac = [0.0; N_RIGID];
            }
            let (val, g) = interp::pull_with_gradient(y, self.recon_dims, c);
            pred += w * val;
            if g == [0.0; 3] {
                return;
            }
            for (jk, dc) in jac.iter_mut().zip(dcols.iter()) {
                let mut dot = 0.0;
                for (r, gr) in g.iter().enumerate() {
                    let dr = dc[0][r] * v[0] + dc[1][r] * v[1] + dc[2][r] * v[2] + dc[3][r];
                    dot += gr * dr;
                }
                *jk += w * dot;
            }
        });
        if current != usize::MAX {
            f(current, pred, &jac);
        }
    }
}
