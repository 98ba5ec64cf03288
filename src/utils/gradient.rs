//! Gradient operators
//!
//! Forward difference gradient and backward divergence operators used by
//! the TV prior. The boundary condition is an explicit argument; for both
//! choices `bdiv` is exactly the negative adjoint of `fgrad`.

use crate::volume::BoundaryCondition;

/// Forward difference gradient operator (in-place)
///
/// Writes results directly into pre-allocated output buffers.
///
/// # Arguments
/// * `gx`, `gy`, `gz` - Output gradient components (must be pre-allocated to nx*ny*nz)
/// * `x` - Input array (nx * ny * nz)
/// * `nx`, `ny`, `nz` - Array dimensions
/// * `vsx`, `vsy`, `vsz` - Voxel sizes
/// * `bc` - Boundary condition
#[inline]
pub fn fgrad_inplace(
    gx: &mut [f64], gy: &mut [f64], gz: &mut [f64],
    x: &[f64],
    nx: usize, ny: usize, nz: usize,
    vsx: f64, vsy: f64, vsz: f64,
    bc: BoundaryCondition,
) {
    let hx = 1.0 / vsx;
    let hy = 1.0 / vsy;
    let hz = 1.0 / vsz;
    let periodic = bc == BoundaryCondition::Periodic;

    // Fortran order: index = i + j*nx + k*nx*ny
    for k in 0..nz {
        let k_last = k + 1 == nz;
        let kp1 = if k_last { 0 } else { k + 1 };
        let k_offset = k * nx * ny;
        let kp1_offset = kp1 * nx * ny;

        for j in 0..ny {
            let j_last = j + 1 == ny;
            let jp1 = if j_last { 0 } else { j + 1 };
            let j_offset = j * nx;
            let jp1_offset = jp1 * nx;

            for i in 0..nx {
                let i_last = i + 1 == nx;
                let ip1 = if i_last { 0 } else { i + 1 };

                let idx = i + j_offset + k_offset;
                let x_val = x[idx];

                gx[idx] = if periodic || !i_last {
                    (x[ip1 + j_offset + k_offset] - x_val) * hx
                } else {
                    0.0
                };
                gy[idx] = if periodic || !j_last {
                    (x[i + jp1_offset + k_offset] - x_val) * hy
                } else {
                    0.0
                };
                gz[idx] = if periodic || !k_last {
                    (x[i + j_offset + kp1_offset] - x_val) * hz
                } else {
                    0.0
                };
            }
        }
    }
}

/// Backward divergence operator (in-place)
///
/// `div = -∇ᵀ g`. Writes result directly into pre-allocated output buffer.
///
/// # Arguments
/// * `div` - Output divergence (must be pre-allocated to nx*ny*nz)
/// * `gx`, `gy`, `gz` - Gradient components
/// * `nx`, `ny`, `nz` - Array dimensions
/// * `vsx`, `vsy`, `vsz` - Voxel sizes
/// * `bc` - Boundary condition
#[inline]
pub fn bdiv_inplace(
    div: &mut [f64],
    gx: &[f64], gy: &[f64], gz: &[f64],
    nx: usize, ny: usize, nz: usize,
    vsx: f64, vsy: f64, vsz: f64,
    bc: BoundaryCondition,
) {
    let hx = 1.0 / vsx;
    let hy = 1.0 / vsy;
    let hz = 1.0 / vsz;
    let periodic = bc == BoundaryCondition::Periodic;

    for k in 0..nz {
        let km1 = if k == 0 { nz - 1 } else { k - 1 };
        let k_offset = k * nx * ny;
        let km1_offset = km1 * nx * ny;
        // Neumann: the last forward difference is identically zero
        let k_in = periodic || k + 1 < nz;
        let k_prev = periodic || k > 0;

        for j in 0..ny {
            let jm1 = if j == 0 { ny - 1 } else { j - 1 };
            let j_offset = j * nx;
            let jm1_offset = jm1 * nx;
            let j_in = periodic || j + 1 < ny;
            let j_prev = periodic || j > 0;

            for i in 0..nx {
                let im1 = if i == 0 { nx - 1 } else { i - 1 };
                let i_in = periodic || i + 1 < nx;
                let i_prev = periodic || i > 0;

                let idx = i + j_offset + k_offset;

                let dx = if i_in { gx[idx] } else { 0.0 }
                    - if i_prev { gx[im1 + j_offset + k_offset] } else { 0.0 };
                let dy = if j_in { gy[idx] } else { 0.0 }
                    - if j_prev { gy[i + jm1_offset + k_offset] } else { 0.0 };
                let dz = if k_in { gz[idx] } else { 0.0 }
                    - if k_prev { gz[i + j_offset + km1_offset] } else { 0.0 };

                div[idx] = dx * hx + dy * hy + dz * hz;
            }
        }
    }
}

/// Forward difference gradient operator
///
/// # Returns
/// Tuple of (gx, gy, gz) gradient components
pub fn fgrad(
    x: &[f64],
    nx: usize, ny: usize, nz: usize,
    vsx: f64, vsy: f64, vsz: f64,
    bc: BoundaryCondition,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n_total = nx * ny * nz;
    let mut gx = vec![0.0; n_total];
    let mut gy = vec![0.0; n_total];
    let mut gz = vec![0.0; n_total];
    fgrad_inplace(&mut gx, &mut gy, &mut gz, x, nx, ny, nz, vsx, vsy, vsz, bc);
    (gx, gy, gz)
}

/// Backward divergence operator (negative adjoint of forward gradient)
pub fn bdiv(
    gx: &[f64], gy: &[f64], gz: &[f64],
    nx: usize, ny: usize, nz: usize,
    vsx: f64, vsy: f64, vsz: f64,
    bc: BoundaryCondition,
) -> Vec<f64> {
    let mut div = vec![0.0; nx * ny * nz];
    bdiv_inplace(&mut div, gx, gy, gz, nx, ny, nz, vsx, vsy, vsz, bc);
    div
}

/// Reusable buffers for applying `∇ᵀ∇` on one lattice
pub struct LaplacianWorkspace {
    pub dims: [usize; 3],
    pub voxel_size: [f64; 3],
    pub bc: BoundaryCondition,
    gx: Vec<f64>,
    gy: Vec<f64>,
    gz: Vec<f64>,
}

impl LaplacianWorkspace {
    pub fn new(dims: [usize; 3], voxel_size: [f64; 3], bc: BoundaryCondition) -> Self {
        let n = dims[0] * dims[1] * dims[2];
        Self {
            dims, voxel_size, bc,
            gx: vec![0.0; n],
            gy: vec![0.0; n],
            gz: vec![0.0; n],
        }
    }

    /// `out = ∇ᵀ∇ x`
    pub fn apply(&mut self, x: &[f64], out: &mut [f64]) {
        let [nx, ny, nz] = self.dims;
        let [vsx, vsy, vsz] = self.voxel_size;
        fgrad_inplace(&mut self.gx, &mut self.gy, &mut self.gz, x, nx, ny, nz, vsx, vsy, vsz, self.bc);
        bdiv_inplace(out, &self.gx, &self.gy, &self.gz, nx, ny, nz, vsx, vsy, vsz, self.bc);
        for o in out.iter_mut() {
            *o = -*o;
        }
    }
}

/// Interior diagonal of `∇ᵀ∇`: `Σ_d 2 / vs_d²` over axes with more than one voxel
pub fn laplacian_diagonal(dims: [usize; 3], voxel_size: [f64; 3]) -> f64 {
    (0..3)
        .filter(|&d| dims[d] > 1)
        .map(|d| 2.0 / (voxel_size[d] * voxel_size[d]))
        .sum()
}
