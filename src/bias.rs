//! Bias field model and updater
//!
//! Each channel carries a smooth multiplicative field on the reconstruction
//! lattice, `b = exp(Σ_ijk β_ijk φ_i(x) φ_j(y) φ_k(z))`, with the DCT-II
//! basis `φ_i(x) = cos(π i (x + 0.5) / n)`. The forward model sees
//! `A_n(b ⊙ y)`. Channels listed together in a bias link share one
//! coefficient vector and are updated by one joint Gauss-Newton solve.
//!
//! The prior is `½ βᵀΛβ` with `Λ_ijk = reg · N · (ε + π²(i² + j² + k²))²`,
//! and `ll3 = -½ βᵀΛβ`.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};

use crate::channel::Channel;
use crate::error::Result;
use crate::volume::StorageKind;

/// Keeps the constant term weakly regularised
const PRIOR_EPS: f64 = 1e-3;
/// Backtracking halvings per Gauss-Newton step
const MAX_BACKTRACK: usize = 8;

// =============================================================================
// Basis
// =============================================================================

/// Separable low-frequency cosine basis on one lattice
#[derive(Debug, Clone)]
pub struct DctBasis {
    dims: [usize; 3],
    /// `phi[d][i]` holds basis function `i` sampled along axis `d`
    phi: [Vec<Vec<f64>>; 3],
}

impl DctBasis {
    /// `n_basis` functions per axis (one along single-voxel axes)
    pub fn new(dims: [usize; 3], n_basis: usize) -> Self {
        let axis = |n: usize| -> Vec<Vec<f64>> {
            let k = if n > 1 { n_basis.max(1).min(n) } else { 1 };
            (0..k)
                .map(|i| {
                    (0..n)
                        .map(|x| (PI * i as f64 * (x as f64 + 0.5) / n as f64).cos())
                        .collect()
                })
                .collect()
        };
        Self { dims, phi: [axis(dims[0]), axis(dims[1]), axis(dims[2])] }
    }

    /// Basis functions per axis
    pub fn shape(&self) -> [usize; 3] {
        [self.phi[0].len(), self.phi[1].len(), self.phi[2].len()]
    }

    pub fn n_coefficients(&self) -> usize {
        self.shape().iter().product()
    }

    /// Diagonal of the prior precision
    pub fn prior_precision(&self, reg: f64) -> Vec<f64> {
        let [kx, ky, kz] = self.shape();
        let n_vox = self.dims.iter().product::<usize>() as f64;
        let mut out = Vec::with_capacity(kx * ky * kz);
        for k in 0..kz {
            for j in 0..ky {
                for i in 0..kx {
                    let f = PRIOR_EPS + PI * PI * (i * i + j * j + k * k) as f64;
                    out.push(reg * n_vox * f * f);
                }
            }
        }
        out
    }

    /// `Σ β φφφ` on the lattice
    pub fn log_field(&self, beta: &[f64]) -> Vec<f64> {
        expand(beta, self.dims, &self.phi)
    }

    /// `exp(Σ β φφφ)` on the lattice
    pub fn field(&self, beta: &[f64]) -> Vec<f64> {
        let mut f = self.log_field(beta);
        f.iter_mut().for_each(|v| *v = v.exp());
        f
    }

    /// `g_k = Σ_v s_v φ_k(v)`
    pub fn project(&self, s: &[f64]) -> Vec<f64> {
        contract(s, self.dims, &self.phi)
    }

    /// `H_kl = Σ_v h_v φ_k(v) φ_l(v)`
    pub fn gram(&self, h: &[f64]) -> DMatrix<f64> {
        let [kx, ky, kz] = self.shape();
        let pairs = |d: usize| -> Vec<Vec<f64>> {
            let p = &self.phi[d];
            let mut out = Vec::with_capacity(p.len() * p.len());
            for b in p {
                for a in p {
                    out.push(a.iter().zip(b).map(|(x, y)| x * y).collect());
                }
            }
            out
        };
        let pp = [pairs(0), pairs(1), pairs(2)];
        let t = contract(h, self.dims, &pp);

        let n = kx * ky * kz;
        let (px, py) = (kx * kx, ky * ky);
        let mut g = DMatrix::zeros(n, n);
        for k in 0..kz {
            for kk in 0..kz {
                for j in 0..ky {
                    for jj in 0..ky {
                        for i in 0..kx {
                            for ii in 0..kx {
                                let row = i + j * kx + k * kx * ky;
                                let col = ii + jj * kx + kk * kx * ky;
                                let a = i + ii * kx;
                                let b = j + jj * ky;
                                let c = k + kk * kz;
                                g[(row, col)] = t[a + b * px + c * px * py];
                            }
                        }
                    }
                }
            }
        }
        g
    }
}

/// Separable contraction `out[a,b,c] = Σ_ijk s[i,j,k] fx[a][i] fy[b][j] fz[c][k]`
fn contract(s: &[f64], dims: [usize; 3], f: &[Vec<Vec<f64>>; 3]) -> Vec<f64> {
    let [nx, ny, nz] = dims;
    let (ka, kb, kc) = (f[0].len(), f[1].len(), f[2].len());

    // over x: t1[a + j*ka + k*ka*ny]
    let mut t1 = vec![0.0; ka * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            let row = &s[j * nx + k * nx * ny..j * nx + k * nx * ny + nx];
            for (a, fa) in f[0].iter().enumerate() {
                t1[a + j * ka + k * ka * ny] = row.iter().zip(fa).map(|(x, y)| x * y).sum();
            }
        }
    }
    // over y: t2[a + b*ka + k*ka*kb]
    let mut t2 = vec![0.0; ka * kb * nz];
    for k in 0..nz {
        for (b, fb) in f[1].iter().enumerate() {
            for (j, &w) in fb.iter().enumerate() {
                for a in 0..ka {
                    t2[a + b * ka + k * ka * kb] += w * t1[a + j * ka + k * ka * ny];
                }
            }
        }
    }
    // over z
    let mut out = vec![0.0; ka * kb * kc];
    for (c, fc) in f[2].iter().enumerate() {
        for (k, &w) in fc.iter().enumerate() {
            for ab in 0..ka * kb {
                out[ab + c * ka * kb] += w * t2[ab + k * ka * kb];
            }
        }
    }
    out
}

/// Separable expansion `out[i,j,k] = Σ_abc β[a,b,c] fx[a][i] fy[b][j] fz[c][k]`
fn expand(beta: &[f64], dims: [usize; 3], f: &[Vec<Vec<f64>>; 3]) -> Vec<f64> {
    let [nx, ny, nz] = dims;
    let (ka, kb) = (f[0].len(), f[1].len());

    // over c: t1[a + b*ka + k*ka*kb]
    let mut t1 = vec![0.0; ka * kb * nz];
    for (c, fc) in f[2].iter().enumerate() {
        for (k, &w) in fc.iter().enumerate() {
            for ab in 0..ka * kb {
                t1[ab + k * ka * kb] += w * beta[ab + c * ka * kb];
            }
        }
    }
    // over b: t2[a + j*ka + k*ka*ny]
    let mut t2 = vec![0.0; ka * ny * nz];
    for k in 0..nz {
        for (b, fb) in f[1].iter().enumerate() {
            for (j, &w) in fb.iter().enumerate() {
                for a in 0..ka {
                    t2[a + j * ka + k * ka * ny] += w * t1[a + b * ka + k * ka * kb];
                }
            }
        }
    }
    // over a
    let mut out = vec![0.0; nx * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            let base = j * nx + k * nx * ny;
            for (a, fa) in f[0].iter().enumerate() {
                let w = t2[a + j * ka + k * ka * ny];
                if w == 0.0 {
                    continue;
                }
                for (i, &v) in fa.iter().enumerate() {
                    out[base + i] += w * v;
                }
            }
        }
    }
    out
}

// =============================================================================
// Updater
// =============================================================================

/// Outcome of one group update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasStep {
    /// `-½ βᵀΛβ` after the update
    pub ll3: f64,
    pub cost_before: f64,
    pub cost_after: f64,
    pub accepted: usize,
}

/// Data cost `Σ_n τ_n/2 Σ m (A(b ⊙ y) - x)²` of one channel for a given field
fn channel_cost(channel: &Channel, y: &[f64], field: &[f64]) -> Result<f64> {
    let e: Vec<f64> = y.iter().zip(field).map(|(a, b)| a * b).collect();
    let mut cost = 0.0;
    for obs in channel.observations() {
        let mut r = vec![0.0; obs.mask().len()];
        cost += 0.5 * obs.tau() * obs.residual(&e, &mut r)?;
    }
    Ok(cost)
}

fn prior_energy(beta: &[f64], lambda: &[f64]) -> f64 {
    0.5 * beta.iter().zip(lambda).map(|(b, l)| l * b * b).sum::<f64>()
}

/// Gauss-Newton update of the bias coefficients shared by `group`
///
/// # Arguments
/// * `channels` - All channels; only those in `group` are read or modified
/// * `group` - Indices of channels sharing one field
/// * `basis` - Basis on the reconstruction lattice
/// * `reg` - Bias regularisation weight
/// * `iterations` - Gauss-Newton iterations
/// * `storage` - Backing store for newly allocated field volumes
pub fn update_bias_group(
    channels: &mut [Channel],
    group: &[usize],
    basis: &DctBasis,
    reg: f64,
    iterations: usize,
    storage: &StorageKind,
) -> Result<BiasStep> {
    let n_coef = basis.n_coefficients();
    let lambda = basis.prior_precision(reg);
    let Some(&first) = group.first() else {
        return Ok(BiasStep { ll3: 0.0, cost_before: 0.0, cost_after: 0.0, accepted: 0 });
    };
    let mut beta = channels
        .get(first)
        .map(|c| c.bias_coefficients().to_vec())
        .filter(|b| b.len() == n_coef)
        .unwrap_or_else(|| vec![0.0; n_coef]);

    let ys: Vec<Vec<f64>> = group
        .iter()
        .map(|&c| channels[c].y().to_vec())
        .collect::<Result<_>>()?;
    let hessians: Vec<Vec<f64>> = group
        .iter()
        .map(|&c| channels[c].hessian().to_vec())
        .collect::<Result<_>>()?;

    let total_cost = |beta: &[f64]| -> Result<f64> {
        let field = basis.field(beta);
        let mut cost = prior_energy(beta, &lambda);
        for (gi, &c) in group.iter().enumerate() {
            cost += channel_cost(&channels[c], &ys[gi], &field)?;
        }
        Ok(cost)
    };

    let cost_before = total_cost(&beta)?;
    let mut cost = cost_before;
    let mut accepted = 0;
    let n_vox = ys.first().map_or(0, |y| y.len());

    for _ in 0..iterations {
        let field = basis.field(&beta);
        let mut s = vec![0.0; n_vox];
        let mut h = vec![0.0; n_vox];
        for (gi, &c) in group.iter().enumerate() {
            let ch = &channels[c];
            let e: Vec<f64> = ys[gi].iter().zip(&field).map(|(a, b)| a * b).collect();
            let mut back = vec![0.0; n_vox];
            for obs in ch.observations() {
                let mut r = vec![0.0; obs.mask().len()];
                obs.residual(&e, &mut r)?;
                let tau = obs.tau();
                r.iter_mut().for_each(|v| *v *= tau);
                obs.adjoint_accumulate(&r, &mut back);
            }
            for v in 0..n_vox {
                s[v] += e[v] * back[v];
                h[v] += e[v] * e[v] * hessians[gi][v];
            }
        }

        let mut grad = DVector::from_vec(basis.project(&s));
        let mut hess = basis.gram(&h);
        for k in 0..n_coef {
            grad[k] += lambda[k] * beta[k];
            hess[(k, k)] += lambda[k];
        }
        let delta = match hess.clone().cholesky() {
            Some(ch) => ch.solve(&grad),
            None => match hess.lu().solve(&grad) {
                Some(d) => d,
                None => {
                    log::debug!("bias normal equations are singular, keeping coefficients");
                    break;
                }
            },
        };

        let mut alpha = 1.0;
        let mut improved = false;
        for _ in 0..MAX_BACKTRACK {
            let trial: Vec<f64> = beta.iter().zip(delta.iter()).map(|(b, d)| b - alpha * d).collect();
            let c = total_cost(&trial)?;
            if c < cost {
                beta = trial;
                cost = c;
                improved = true;
                accepted += 1;
                break;
            }
            alpha *= 0.5;
        }
        if !improved {
            break;
        }
    }

    let field = basis.field(&beta);
    for &c in group {
        channels[c].set_bias(beta.clone(), field.clone(), storage)?;
    }

    Ok(BiasStep {
        ll3: -prior_energy(&beta, &lambda),
        cost_before,
        cost_after: cost,
        accepted,
    })
}
