//! Diagonal curvature of the data term
//!
//! `H0 = Σ_n τ_n · At_n(m_n ⊙ A_n(1))` on the reconstruction lattice, which
//! reduces to `Σ_n τ_n · m_n` for identity observations. The bias field
//! enters the image update as `b² ⊙ H0`, so `H0` only changes with the
//! rigid geometry.

use crate::channel::{Channel, Observation};
use crate::error::Result;

/// Floor relative to the largest entry, keeps the diagonal strictly positive
const HESSIAN_FLOOR: f64 = 1e-6;

/// Compute the curvature diagonal for a set of observations
pub fn hessian_diagonal(observations: &[Observation], n_recon: usize) -> Vec<f64> {
    let mut h = vec![0.0; n_recon];
    for obs in observations {
        let tau = obs.tau();
        match obs.projector() {
            None => {
                for (hv, &m) in h.iter_mut().zip(obs.mask()) {
                    if m != 0 {
                        *hv += tau;
                    }
                }
            }
            Some(p) => {
                let mut cov = p.coverage();
                for (c, &m) in cov.iter_mut().zip(obs.mask()) {
                    *c = if m != 0 { tau * *c } else { 0.0 };
                }
                p.adjoint_accumulate(&cov, &mut h);
            }
        }
    }

    let max = h.iter().fold(0.0f64, |a, &b| a.max(b));
    let floor = if max > 0.0 { HESSIAN_FLOOR * max } else { HESSIAN_FLOOR };
    for hv in h.iter_mut() {
        if !(*hv > floor) {
            *hv = floor;
        }
    }
    h
}

/// Recompute and store a channel's curvature diagonal
pub fn update_hessian(channel: &mut Channel) -> Result<()> {
    let n = channel.y().len();
    let h = hessian_diagonal(channel.observations(), n);
    channel.hessian_mut().write(&h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SliceProfileKind;
    use crate::projection::{Projector, SliceProfile};
    use crate::volume::{Lattice, Volume};

    #[test]
    fn test_identity_hessian_counts_precision() {
        let lat = Lattice::from_voxel_size([4, 1, 1], [1.0; 3], [0.0; 3]);
        let mut a = Observation::new(Volume::in_memory(lat.clone(), vec![1.0, 1.0, 0.0, 1.0]).unwrap(), None).unwrap();
        let mut b = Observation::new(Volume::in_memory(lat, vec![1.0; 4]).unwrap(), None).unwrap();
        a.set_tau(2.0);
        b.set_tau(3.0);
        let h = hessian_diagonal(&[a, b], 4);
        assert_eq!(&h[..2], &[5.0, 5.0]);
        assert_eq!(h[2], 3.0, "masked voxel only gets the other observation");
    }

    #[test]
    fn test_projected_hessian_is_positive() {
        let recon = Lattice::from_voxel_size([8, 8, 6], [1.0; 3], [0.0; 3]);
        let obs_lat = Lattice::from_voxel_size([8, 8, 2], [1.0, 1.0, 3.0], [0.0, 0.0, 1.0]);
        let profile = SliceProfile::from_geometry(SliceProfileKind::Gaussian, &obs_lat, recon.voxel_size(), 0.0);
        let mut p = Projector::new(&recon, &obs_lat, profile).unwrap();
        p.set_rigid([0.3, 0.0, 0.0, 0.0, 0.0, 0.1]);
        let mut obs = Observation::new(Volume::in_memory(obs_lat, vec![1.0; 128]).unwrap(), Some(p)).unwrap();
        obs.set_tau(4.0);

        let h = hessian_diagonal(std::slice::from_ref(&obs), recon.n_voxels());
        assert!(h.iter().all(|&v| v > 0.0), "diagonal must be strictly positive");
        let max = h.iter().cloned().fold(0.0, f64::max);
        assert!(max > 0.1, "covered voxels should carry curvature, max = {}", max);
    }
}
