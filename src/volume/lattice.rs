//! Lattice geometry: voxel dimensions, voxel-to-world matrix and the
//! boundary condition used by every finite-difference operator on the grid.

use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

/// Boundary handling for gradients, divergences and Laplacian solves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryCondition {
    /// Wrap-around (FFT-diagonalisable)
    #[default]
    Periodic,
    /// Zero flux across the outer faces
    Neumann,
}

/// A regular voxel grid placed in world space.
///
/// Voxel `(i, j, k)` (0-based) has world position `mat * [i, j, k, 1]`.
/// Data on the lattice is stored in Fortran order: `i + j*nx + k*nx*ny`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    pub dims: [usize; 3],
    pub mat: Matrix4<f64>,
    pub boundary: BoundaryCondition,
}

impl Lattice {
    pub fn new(dims: [usize; 3], mat: Matrix4<f64>) -> Self {
        Self { dims, mat, boundary: BoundaryCondition::default() }
    }

    /// Axis-aligned lattice with voxel `(0,0,0)` centred at `origin`
    pub fn from_voxel_size(dims: [usize; 3], voxel_size: [f64; 3], origin: [f64; 3]) -> Self {
        let mut mat = Matrix4::identity();
        for d in 0..3 {
            mat[(d, d)] = voxel_size[d];
            mat[(d, 3)] = origin[d];
        }
        Self::new(dims, mat)
    }

    /// Build from a row-major 4x4 affine as found in NIfTI sform rows
    pub fn from_affine(dims: [usize; 3], affine: &[f64; 16]) -> Self {
        Self::new(dims, Matrix4::from_row_slice(affine))
    }

    /// Row-major 4x4 affine
    pub fn to_affine(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for r in 0..4 {
            for c in 0..4 {
                out[r * 4 + c] = self.mat[(r, c)];
            }
        }
        out
    }

    pub fn with_boundary(mut self, boundary: BoundaryCondition) -> Self {
        self.boundary = boundary;
        self
    }

    #[inline]
    pub fn n_voxels(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Voxel edge lengths (column norms of the linear part of `mat`)
    pub fn voxel_size(&self) -> [f64; 3] {
        let mut vs = [0.0; 3];
        for (c, v) in vs.iter_mut().enumerate() {
            *v = (0..3).map(|r| self.mat[(r, c)].powi(2)).sum::<f64>().sqrt();
        }
        vs
    }

    #[inline]
    pub fn is_2d(&self) -> bool {
        self.dims[2] == 1
    }

    /// World coordinates of a (possibly fractional) voxel position
    pub fn voxel_to_world(&self, p: [f64; 3]) -> [f64; 3] {
        let w = self.mat * Vector4::new(p[0], p[1], p[2], 1.0);
        [w[0], w[1], w[2]]
    }

    /// World coordinates of the lattice centre
    pub fn world_center(&self) -> [f64; 3] {
        let c = [
            (self.dims[0] as f64 - 1.0) / 2.0,
            (self.dims[1] as f64 - 1.0) / 2.0,
            (self.dims[2] as f64 - 1.0) / 2.0,
        ];
        self.voxel_to_world(c)
    }

    /// World coordinates of the eight outer corners of the field of view
    /// (voxel edges, not voxel centres)
    pub fn world_corners(&self) -> Vec<[f64; 3]> {
        let mut corners = Vec::with_capacity(8);
        for &ck in &[-0.5, self.dims[2] as f64 - 0.5] {
            for &cj in &[-0.5, self.dims[1] as f64 - 0.5] {
                for &ci in &[-0.5, self.dims[0] as f64 - 0.5] {
                    corners.push(self.voxel_to_world([ci, cj, ck]));
                }
            }
        }
        corners
    }

    /// Axis-aligned lattice with the given voxel size whose field of view
    /// covers every given lattice.
    ///
    /// When all inputs are single-slice the result is single-slice too and
    /// sits at the first input's through-plane position.
    pub fn covering(lattices: &[&Lattice], voxel_size: [f64; 3]) -> Option<Lattice> {
        let first = lattices.first()?;
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for lat in lattices {
            for c in lat.world_corners() {
                for d in 0..3 {
                    lo[d] = lo[d].min(c[d]);
                    hi[d] = hi[d].max(c[d]);
                }
            }
        }

        let planar = lattices.iter().all(|l| l.is_2d());
        let mut dims = [1usize; 3];
        let mut origin = [0.0; 3];
        let mut vs = voxel_size;
        for d in 0..3 {
            if planar && d == 2 {
                vs[2] = first.voxel_size()[2];
                origin[2] = first.world_center()[2];
                continue;
            }
            let extent = hi[d] - lo[d];
            dims[d] = ((extent / vs[d]) - 1e-9).ceil().max(1.0) as usize;
            // centre the grid inside the bounding box
            let used = dims[d] as f64 * vs[d];
            origin[d] = lo[d] + 0.5 * (extent - used) + 0.5 * vs[d];
        }
        Some(Lattice::from_voxel_size(dims, vs, origin).with_boundary(first.boundary))
    }

    /// Same grid placement test used when deciding whether observations can
    /// bypass the projection operator
    pub fn same_grid(&self, other: &Lattice) -> bool {
        self.dims == other.dims
            && self
                .mat
                .iter()
                .zip(other.mat.iter())
                .all(|(a, b)| (a - b).abs() <= 1e-6 * (1.0 + a.abs()))
    }
}
