//! Per-channel aggregates
//!
//! An [`Observation`] is one observed volume with its noise precision,
//! masks and (optionally) projection operator. A [`Channel`] owns the
//! observations of one contrast together with its latent image `y`, the
//! gradient-domain auxiliaries `u` and `w`, the Hessian diagonal and the
//! bias field.

use crate::error::{check_len, Result};
use crate::projection::Projector;
use crate::utils::metrics::valid_mask;
use crate::utils::vec_ops::mul_inplace;
use crate::volume::{Lattice, StorageKind, Volume};

/// Observed voxels whose forward-model coverage is below this are masked
pub const MIN_COVERAGE: f64 = 0.5;

// =============================================================================
// Observation
// =============================================================================

#[derive(Debug)]
pub struct Observation {
    data: Volume,
    /// finite and nonzero
    valid: Vec<u8>,
    /// valid and covered by the forward model
    mask: Vec<u8>,
    tau: f64,
    /// `None` when the observation lies on the reconstruction lattice and
    /// the forward model is the identity
    projector: Option<Projector>,
}

impl Observation {
    pub fn new(data: Volume, projector: Option<Projector>) -> Result<Self> {
        if let Some(p) = &projector {
            check_len(p.obs_len(), data.len())?;
        }
        let valid = valid_mask(&data.read()?);
        let mut obs = Self { data, mask: valid.clone(), valid, tau: 1.0, projector };
        obs.refresh_mask();
        Ok(obs)
    }

    #[inline]
    pub fn data(&self) -> &Volume {
        &self.data
    }

    #[inline]
    pub fn lattice(&self) -> &Lattice {
        self.data.lattice()
    }

    #[inline]
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    pub fn n_masked(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }

    #[inline]
    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn set_tau(&mut self, tau: f64) {
        self.tau = tau;
    }

    #[inline]
    pub fn projector(&self) -> Option<&Projector> {
        self.projector.as_ref()
    }

    #[inline]
    pub fn projector_mut(&mut self) -> Option<&mut Projector> {
        self.projector.as_mut()
    }

    #[inline]
    pub fn is_identity(&self) -> bool {
        self.projector.is_none()
    }

    /// Recompute the likelihood mask after the forward-model geometry changed
    pub fn refresh_mask(&mut self) {
        match &self.projector {
            None => self.mask.copy_from_slice(&self.valid),
            Some(p) => {
                let cov = p.coverage();
                for ((m, &v), &c) in self.mask.iter_mut().zip(&self.valid).zip(&cov) {
                    *m = (v != 0 && c >= MIN_COVERAGE) as u8;
                }
            }
        }
    }

    /// `out = A e` on the observation lattice
    pub fn predict(&self, e: &[f64], out: &mut [f64]) {
        match &self.projector {
            None => out.copy_from_slice(e),
            Some(p) => p.forward(e, out),
        }
    }

    /// `out += At x` on the reconstruction lattice
    pub fn adjoint_accumulate(&self, x: &[f64], out: &mut [f64]) {
        match &self.projector {
            None => {
                for (o, &v) in out.iter_mut().zip(x) {
                    *o += v;
                }
            }
            Some(p) => p.adjoint_accumulate(x, out),
        }
    }

    /// Masked residual `m ⊙ (A e - x)` and `Σ m (A e - x)²`
    pub fn residual(&self, e: &[f64], out: &mut [f64]) -> Result<f64> {
        self.predict(e, out);
        let x = self.data.read()?;
        let mut sse = 0.0;
        for ((r, &xv), &m) in out.iter_mut().zip(x.iter()).zip(&self.mask) {
            if m != 0 {
                *r -= xv;
                sse += *r * *r;
            } else {
                *r = 0.0;
            }
        }
        Ok(sse)
    }
}

// =============================================================================
// Channel
// =============================================================================

#[derive(Debug)]
pub struct Channel {
    name: String,
    observations: Vec<Observation>,
    y: Volume,
    u: [Volume; 3],
    w: [Volume; 3],
    hessian: Volume,
    lambda0: f64,
    lambda: f64,
    bias_coefficients: Vec<f64>,
    /// Multiplicative field on the reconstruction lattice, `None` when flat
    bias: Option<Volume>,
}

impl Channel {
    /// Allocate the latent volumes on `lattice`, with `y` initialised to
    /// `y0`
    pub fn new(
        name: impl Into<String>,
        observations: Vec<Observation>,
        lattice: &Lattice,
        y0: Vec<f64>,
        storage: &StorageKind,
    ) -> Result<Self> {
        let zeros = || Volume::filled(lattice.clone(), 0.0, storage);
        Ok(Self {
            name: name.into(),
            observations,
            y: Volume::new(lattice.clone(), y0, storage)?,
            u: [zeros()?, zeros()?, zeros()?],
            w: [zeros()?, zeros()?, zeros()?],
            hessian: Volume::filled(lattice.clone(), 1.0, storage)?,
            lambda0: 1.0,
            lambda: 1.0,
            bias_coefficients: Vec::new(),
            bias: None,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn lattice(&self) -> &Lattice {
        self.y.lattice()
    }

    #[inline]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    #[inline]
    pub fn observations_mut(&mut self) -> &mut [Observation] {
        &mut self.observations
    }

    #[inline]
    pub fn y(&self) -> &Volume {
        &self.y
    }

    #[inline]
    pub fn y_mut(&mut self) -> &mut Volume {
        &mut self.y
    }

    #[inline]
    pub fn u(&self) -> &[Volume; 3] {
        &self.u
    }

    #[inline]
    pub fn u_mut(&mut self) -> &mut [Volume; 3] {
        &mut self.u
    }

    #[inline]
    pub fn w(&self) -> &[Volume; 3] {
        &self.w
    }

    #[inline]
    pub fn w_mut(&mut self) -> &mut [Volume; 3] {
        &mut self.w
    }

    #[inline]
    pub fn hessian(&self) -> &Volume {
        &self.hessian
    }

    #[inline]
    pub fn hessian_mut(&mut self) -> &mut Volume {
        &mut self.hessian
    }

    #[inline]
    pub fn lambda0(&self) -> f64 {
        self.lambda0
    }

    #[inline]
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Set the base regularisation; the current value is reset to it
    pub fn set_lambda0(&mut self, lambda0: f64) {
        self.lambda0 = lambda0;
        self.lambda = lambda0;
    }

    pub fn set_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    /// Noise precisions of the observations
    pub fn taus(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.tau()).collect()
    }

    /// Whether any observation needs the projection operator
    pub fn uses_projection(&self) -> bool {
        self.observations.iter().any(|o| !o.is_identity())
    }

    #[inline]
    pub fn bias(&self) -> Option<&Volume> {
        self.bias.as_ref()
    }

    #[inline]
    pub fn bias_coefficients(&self) -> &[f64] {
        &self.bias_coefficients
    }

    /// Replace the bias field and the coefficients it was built from
    pub fn set_bias(&mut self, coefficients: Vec<f64>, field: Vec<f64>, storage: &StorageKind) -> Result<()> {
        match &mut self.bias {
            Some(b) => b.write(&field)?,
            None => self.bias = Some(Volume::new(self.y.lattice().clone(), field, storage)?),
        }
        self.bias_coefficients = coefficients;
        Ok(())
    }

    /// Bias field values, or `None` when the field is flat
    pub fn bias_values(&self) -> Result<Option<Vec<f64>>> {
        self.bias.as_ref().map(|b| b.to_vec()).transpose()
    }

    /// Effective image seen by the forward model: `b ⊙ y`
    pub fn effective_image(&self) -> Result<Vec<f64>> {
        let mut e = self.y.to_vec()?;
        if let Some(b) = &self.bias {
            mul_inplace(&mut e, &b.read()?);
        }
        Ok(e)
    }
}
