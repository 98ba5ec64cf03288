//! Slice-selection profiles
//!
//! A thick observed slice integrates signal along its through-plane axis.
//! The profile is represented by sample offsets (in observation voxel
//! units along `axis`) with weights summing to one.

use crate::config::SliceProfileKind;
use crate::volume::Lattice;

/// Gaussian full width at half maximum over standard deviation
const FWHM_PER_SIGMA: f64 = 2.354_820_045;
/// Gaussian profile is truncated at this many standard deviations
const GAUSS_SUPPORT_SIGMAS: f64 = 3.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SliceProfile {
    /// Observation lattice axis the profile acts along
    pub axis: usize,
    pub offsets: Vec<f64>,
    pub weights: Vec<f64>,
}

impl SliceProfile {
    /// Point sampling, no through-plane blur
    pub fn none() -> Self {
        Self { axis: 2, offsets: vec![0.0], weights: vec![1.0] }
    }

    #[inline]
    pub fn n_samples(&self) -> usize {
        self.offsets.len()
    }

    /// Profile of an observation lattice relative to the reconstruction
    /// voxel size.
    ///
    /// The through-plane axis is the observation axis with the largest
    /// voxel size (in-plane only for single-slice lattices). The slice
    /// thickness is that spacing times `1 - gap`. Observations that are not
    /// thicker than the reconstruction voxels get point sampling.
    pub fn from_geometry(kind: SliceProfileKind, obs: &Lattice, recon_voxel_size: [f64; 3], gap: f64) -> Self {
        let vs = obs.voxel_size();
        let n_axes = if obs.is_2d() { 2 } else { 3 };
        let axis = (0..n_axes).fold(0, |best, d| if vs[d] > vs[best] { d } else { best });
        let spacing = vs[axis];
        let thickness = spacing * (1.0 - gap);
        let recon_vs = recon_voxel_size
            .iter()
            .take(n_axes)
            .fold(f64::INFINITY, |m, &v| m.min(v));

        if !(thickness > recon_vs * (1.0 + 1e-6)) {
            return Self { axis, ..Self::none() };
        }

        // width in observation voxel units
        let width = 1.0 - gap;
        match kind {
            SliceProfileKind::Rect => {
                let k = ((2.0 * thickness / recon_vs).ceil() as usize).max(1);
                let offsets = (0..k).map(|s| width * ((s as f64 + 0.5) / k as f64 - 0.5)).collect();
                Self { axis, offsets, weights: vec![1.0 / k as f64; k] }
            }
            SliceProfileKind::Gaussian => {
                let sigma = width / FWHM_PER_SIGMA;
                let support_mm = 2.0 * GAUSS_SUPPORT_SIGMAS * thickness / FWHM_PER_SIGMA;
                let k = ((2.0 * support_mm / recon_vs).ceil() as usize).max(1);
                let half = GAUSS_SUPPORT_SIGMAS * sigma;
                let offsets: Vec<f64> = (0..k)
                    .map(|s| -half + 2.0 * half * (s as f64 + 0.5) / k as f64)
                    .collect();
                let mut weights: Vec<f64> = offsets
                    .iter()
                    .map(|&t| (-0.5 * (t / sigma).powi(2)).exp())
                    .collect();
                let total: f64 = weights.iter().sum();
                weights.iter_mut().for_each(|w| *w /= total);
                Self { axis, offsets, weights }
            }
        }
    }
}
