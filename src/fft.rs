//! 3D FFT workspace using rustfft
//!
//! Used by the exact Fourier-space image update on periodic lattices.
//! Uses Fortran (column-major) order indexing to match NIfTI convention.

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Index into a 3D array stored in Fortran order (column-major)
/// index = x + y*nx + z*nx*ny
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// FFT workspace that caches plans and scratch buffers for reuse
pub struct Fft3dWorkspace {
    nx: usize,
    ny: usize,
    nz: usize,
    n_total: usize,
    // Forward FFT plans
    fft_x: Arc<dyn Fft<f64>>,
    fft_y: Arc<dyn Fft<f64>>,
    fft_z: Arc<dyn Fft<f64>>,
    // Inverse FFT plans
    ifft_x: Arc<dyn Fft<f64>>,
    ifft_y: Arc<dyn Fft<f64>>,
    ifft_z: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex64>,
    line: Vec<Complex64>,
    spectrum: Vec<Complex64>,
}

impl Fft3dWorkspace {
    /// Create a new FFT workspace for the given dimensions
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        let mut planner = FftPlanner::new();

        let fft_x = planner.plan_fft(nx, FftDirection::Forward);
        let fft_y = planner.plan_fft(ny, FftDirection::Forward);
        let fft_z = planner.plan_fft(nz, FftDirection::Forward);

        let ifft_x = planner.plan_fft(nx, FftDirection::Inverse);
        let ifft_y = planner.plan_fft(ny, FftDirection::Inverse);
        let ifft_z = planner.plan_fft(nz, FftDirection::Inverse);

        let scratch_len = [&fft_x, &fft_y, &fft_z, &ifft_x, &ifft_y, &ifft_z]
            .iter()
            .map(|p| p.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);

        Self {
            nx, ny, nz,
            n_total: nx * ny * nz,
            fft_x, fft_y, fft_z,
            ifft_x, ifft_y, ifft_z,
            scratch: vec![Complex64::new(0.0, 0.0); scratch_len],
            line: vec![Complex64::new(0.0, 0.0); nx.max(ny).max(nz)],
            spectrum: vec![Complex64::new(0.0, 0.0); nx * ny * nz],
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.nx, self.ny, self.nz)
    }

    fn transform(&mut self, data: &mut [Complex64], inverse: bool) {
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);
        let (px, py, pz) = if inverse {
            (self.ifft_x.clone(), self.ifft_y.clone(), self.ifft_z.clone())
        } else {
            (self.fft_x.clone(), self.fft_y.clone(), self.fft_z.clone())
        };

        // x-axis is contiguous
        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                px.process_with_scratch(&mut data[start..start + nx], &mut self.scratch);
            }
        }

        // y-axis (stride nx)
        if ny > 1 {
            for k in 0..nz {
                for i in 0..nx {
                    let line = &mut self.line[..ny];
                    for j in 0..ny {
                        line[j] = data[idx3d(i, j, k, nx, ny)];
                    }
                    py.process_with_scratch(line, &mut self.scratch);
                    for j in 0..ny {
                        data[idx3d(i, j, k, nx, ny)] = line[j];
                    }
                }
            }
        }

        // z-axis (stride nx*ny)
        if nz > 1 {
            for j in 0..ny {
                for i in 0..nx {
                    let line = &mut self.line[..nz];
                    for k in 0..nz {
                        line[k] = data[idx3d(i, j, k, nx, ny)];
                    }
                    pz.process_with_scratch(line, &mut self.scratch);
                    for k in 0..nz {
                        data[idx3d(i, j, k, nx, ny)] = line[k];
                    }
                }
            }
        }
    }

    /// In-place forward 3D FFT
    pub fn fft3d(&mut self, data: &mut [Complex64]) {
        self.transform(data, false);
    }

    /// In-place inverse 3D FFT (with normalization)
    pub fn ifft3d(&mut self, data: &mut [Complex64]) {
        self.transform(data, true);
        let n_total = self.n_total as f64;
        for val in data.iter_mut() {
            *val /= n_total;
        }
    }

    /// Solve `K x = rhs` for a circulant operator `K` given its eigenvalues
    /// (`denom`, one per frequency, all nonzero): `x = real(ifft(fft(rhs) / denom))`
    pub fn solve_diagonal(&mut self, rhs: &[f64], denom: &[f64], out: &mut [f64]) {
        let mut spectrum = std::mem::take(&mut self.spectrum);
        for (c, &r) in spectrum.iter_mut().zip(rhs.iter()) {
            *c = Complex64::new(r, 0.0);
        }
        self.fft3d(&mut spectrum);
        for (c, &d) in spectrum.iter_mut().zip(denom.iter()) {
            *c /= d;
        }
        self.ifft3d(&mut spectrum);
        for (o, c) in out.iter_mut().zip(spectrum.iter()) {
            *o = c.re;
        }
        self.spectrum = spectrum;
    }
}

/// Eigenvalues of `∇ᵀ∇` for forward differences with periodic boundaries,
/// one per FFT frequency: `Σ_d (2 - 2 cos(2π k_d / n_d)) / vs_d²`
pub fn periodic_laplacian_eigenvalues(
    nx: usize, ny: usize, nz: usize,
    vsx: f64, vsy: f64, vsz: f64,
) -> Vec<f64> {
    let axis = |n: usize, vs: f64| -> Vec<f64> {
        let h2 = 1.0 / (vs * vs);
        (0..n)
            .map(|k| (2.0 - 2.0 * (2.0 * PI * k as f64 / n as f64).cos()) * h2)
            .collect()
    };
    let lx = axis(nx, vsx);
    let ly = axis(ny, vsy);
    let lz = axis(nz, vsz);

    let mut out = vec![0.0; nx * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                out[idx3d(i, j, k, nx, ny)] = lx[i] + ly[j] + lz[k];
            }
        }
    }
    out
}
