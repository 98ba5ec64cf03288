//! Rigid registration updater
//!
//! Refines the rigid parameters of every projected observation against the
//! current (fixed) effective image `b ⊙ y` by Levenberg-Marquardt damped
//! Gauss-Newton on `τ/2 Σ m (A_q e - x)²`. The Jacobian comes from the
//! analytic chain rule through trilinear interpolation. Rejected steps
//! increase the damping and are retried.

use nalgebra::{DMatrix, DVector};

use crate::channel::{Channel, Observation};
use crate::config::MeanCorrection;
use crate::error::Result;
use crate::hessian::update_hessian;
use crate::parallel::{collect_results, WorkerPool};
use crate::projection::{active_parameters, remove_mean, N_RIGID};

const LM_INITIAL_DAMPING: f64 = 1e-3;
const LM_DAMPING_FACTOR: f64 = 10.0;
const LM_MAX_DAMPING: f64 = 1e6;
/// Retries with increased damping before an iteration gives up
const LM_MAX_RETRIES: usize = 6;

/// Outcome of refining one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidStep {
    pub cost_before: f64,
    pub cost_after: f64,
    pub accepted: usize,
}

/// Data cost of one observation under its current geometry and mask
fn observation_cost(obs: &Observation, e: &[f64], buf: &mut [f64]) -> Result<f64> {
    Ok(0.5 * obs.tau() * obs.residual(e, buf)?)
}

/// Gradient and Gauss-Newton Hessian of the data cost over all six parameters
fn normal_equations(obs: &Observation, e: &[f64]) -> Result<([f64; N_RIGID], [[f64; N_RIGID]; N_RIGID], f64)> {
    let mut g = [0.0; N_RIGID];
    let mut h = [[0.0; N_RIGID]; N_RIGID];
    let mut cost = 0.0;
    let Some(p) = obs.projector() else {
        return Ok((g, h, cost));
    };
    let x = obs.data().read()?;
    let mask = obs.mask();
    let tau = obs.tau();
    p.linearize(e, |v, pred, jac| {
        if mask[v] == 0 {
            return;
        }
        let r = pred - x[v];
        cost += 0.5 * tau * r * r;
        for a in 0..N_RIGID {
            g[a] += tau * r * jac[a];
            for b in a..N_RIGID {
                h[a][b] += tau * jac[a] * jac[b];
            }
        }
    });
    for a in 0..N_RIGID {
        for b in 0..a {
            h[a][b] = h[b][a];
        }
    }
    Ok((g, h, cost))
}

/// Refine one observation's rigid parameters
///
/// # Arguments
/// * `obs` - Observation with a projector (identity observations are left alone)
/// * `e` - Effective image `b ⊙ y` on the reconstruction lattice
/// * `active` - Indices of parameters allowed to move
/// * `iterations` - Gauss-Newton iterations
pub fn update_observation_rigid(
    obs: &mut Observation,
    e: &[f64],
    active: &[usize],
    iterations: usize,
) -> Result<RigidStep> {
    let mut buf = vec![0.0; obs.mask().len()];
    let cost_before = observation_cost(obs, e, &mut buf)?;
    let mut step = RigidStep { cost_before, cost_after: cost_before, accepted: 0 };
    if obs.is_identity() || active.is_empty() {
        return Ok(step);
    }

    let na = active.len();
    let mut damping = LM_INITIAL_DAMPING;
    for _ in 0..iterations {
        let (g, h, cost0) = normal_equations(obs, e)?;
        let q0 = match obs.projector() {
            Some(p) => p.rigid(),
            None => break,
        };

        let gs = DVector::from_iterator(na, active.iter().map(|&a| -g[a]));
        let max_diag = active.iter().map(|&a| h[a][a]).fold(0.0f64, f64::max);
        if !(max_diag > 0.0) {
            break;
        }

        let mut improved = false;
        for _ in 0..LM_MAX_RETRIES {
            let mut hs = DMatrix::from_fn(na, na, |r, c| h[active[r]][active[c]]);
            for d in 0..na {
                hs[(d, d)] += damping * hs[(d, d)] + 1e-12 * max_diag;
            }
            let delta = match hs.clone().cholesky() {
                Some(ch) => ch.solve(&gs),
                None => match hs.lu().solve(&gs) {
                    Some(d) => d,
                    None => {
                        log::debug!("rigid normal equations are singular, keeping parameters");
                        break;
                    }
                },
            };

            let mut q = q0;
            for (i, &a) in active.iter().enumerate() {
                q[a] += delta[i];
            }
            if let Some(p) = obs.projector_mut() {
                p.set_rigid(q);
            }
            let cost = observation_cost(obs, e, &mut buf)?;
            if cost < cost0 {
                damping = (damping / LM_DAMPING_FACTOR).max(1e-9);
                step.cost_after = cost;
                step.accepted += 1;
                improved = true;
                break;
            }
            if let Some(p) = obs.projector_mut() {
                p.set_rigid(q0);
            }
            damping *= LM_DAMPING_FACTOR;
            if damping > LM_MAX_DAMPING {
                break;
            }
        }
        if !improved {
            break;
        }
    }

    obs.refresh_mask();
    Ok(step)
}

/// Summary of one rigid update over all channels
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RigidReport {
    pub observations: usize,
    pub accepted: usize,
    pub cost_before: f64,
    pub cost_after: f64,
}

/// Rigid update of every projected observation, followed by mean correction
/// and Hessian recomputation
pub fn update_rigid(
    channels: &mut [Channel],
    pool: &WorkerPool,
    iterations: usize,
    correction: MeanCorrection,
) -> Result<RigidReport> {
    let steps = collect_results(pool.map_mut(channels, |_, ch| -> Result<Vec<RigidStep>> {
        let e = ch.effective_image()?;
        let active = active_parameters(ch.lattice().is_2d());
        ch.observations_mut()
            .iter_mut()
            .filter(|o| !o.is_identity())
            .map(|o| update_observation_rigid(o, &e, active, iterations))
            .collect()
    }))?;

    let mut report = RigidReport::default();
    for s in steps.iter().flatten() {
        report.observations += 1;
        report.accepted += s.accepted;
        report.cost_before += s.cost_before;
        report.cost_after += s.cost_after;
    }

    apply_mean_correction(channels, correction);

    collect_results(pool.map_mut(channels, |_, ch| {
        for obs in ch.observations_mut() {
            obs.refresh_mask();
        }
        update_hessian(ch)
    }))?;

    Ok(report)
}

/// Remove the mean rigid drift over the configured group of observations.
/// Groups with fewer than two projected observations are left alone.
pub fn apply_mean_correction(channels: &mut [Channel], correction: MeanCorrection) {
    let groups: Vec<Vec<usize>> = match correction {
        MeanCorrection::None => return,
        MeanCorrection::Global => vec![(0..channels.len()).collect()],
        MeanCorrection::PerChannel => (0..channels.len()).map(|c| vec![c]).collect(),
    };

    for group in groups {
        let mut params: Vec<[f64; N_RIGID]> = Vec::new();
        for &c in &group {
            params.extend(channels[c].observations().iter().filter_map(|o| o.projector().map(|p| p.rigid())));
        }
        if params.len() < 2 {
            continue;
        }
        remove_mean(&mut params);
        let mut it = params.into_iter();
        for &c in &group {
            for obs in channels[c].observations_mut() {
                if let Some(p) = obs.projector_mut() {
                    if let Some(q) = it.next() {
                        p.set_rigid(q);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{Projector, SliceProfile};
    use crate::volume::{Lattice, StorageKind, Volume};

    fn blob(lat: &Lattice) -> Vec<f64> {
        let [nx, ny, nz] = lat.dims;
        let mut y = vec![0.0; lat.n_voxels()];
        let c1 = [nx as f64 * 0.45, ny as f64 * 0.5, nz as f64 * 0.5];
        let c2 = [nx as f64 * 0.65, ny as f64 * 0.35, nz as f64 * 0.55];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let p = [i as f64, j as f64, k as f64];
                    let d1: f64 = (0..3).map(|d| (p[d] - c1[d]).powi(2)).sum();
                    let d2: f64 = (0..3).map(|d| (p[d] - c2[d]).powi(2)).sum();
                    y[i + j * nx + k * nx * ny] = 0.1 + (-d1 / 18.0).exp() + 0.6 * (-d2 / 6.0).exp();
                }
            }
        }
        y
    }

    fn observation(lat: &Lattice, y: &[f64], q_true: [f64; N_RIGID]) -> Observation {
        let mut p = Projector::new(lat, lat, SliceProfile::none()).unwrap();
        p.set_rigid(q_true);
        let mut data = vec![0.0; lat.n_voxels()];
        p.forward(y, &mut data);
        p.set_rigid([0.0; N_RIGID]);
        let mut obs = Observation::new(Volume::in_memory(lat.clone(), data).unwrap(), Some(p)).unwrap();
        obs.set_tau(100.0);
        obs
    }

    fn param_error(a: &[f64; N_RIGID], b: &[f64; N_RIGID]) -> f64 {
        // rotations weighted by a typical lever arm of 10 mm
        (0..N_RIGID)
            .map(|k| {
                let s = if k < 3 { 1.0 } else { 10.0 };
                (s * (a[k] - b[k])).powi(2)
            })
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn test_recovers_known_shift_3d() {
        let lat = Lattice::from_voxel_size([18, 18, 16], [1.0; 3], [0.0; 3]);
        let y = blob(&lat);
        let q_true = [0.6, -0.4, 0.3, 0.02, -0.03, 0.04];
        let mut obs = observation(&lat, &y, q_true);

        let initial = param_error(&[0.0; N_RIGID], &q_true);
        let step = update_observation_rigid(&mut obs, &y, active_parameters(false), 10).unwrap();
        assert!(step.accepted > 0);
        assert!(step.cost_after < step.cost_before);

        let q = obs.projector().unwrap().rigid();
        let err = param_error(&q, &q_true);
        assert!(err < 0.5 * initial, "error {} should drop below half of {} (q = {:?})", err, initial, q);
    }

    #[test]
    fn test_planar_only_moves_in_plane_parameters() {
        let lat = Lattice::from_voxel_size([24, 24, 1], [1.0; 3], [0.0; 3]);
        let y = blob(&lat);
        let q_true = [0.7, -0.5, 0.0, 0.0, 0.0, 0.05];
        let mut obs = observation(&lat, &y, q_true);

        let initial = param_error(&[0.0; N_RIGID], &q_true);
        update_observation_rigid(&mut obs, &y, active_parameters(true), 10).unwrap();
        let q = obs.projector().unwrap().rigid();
        assert_eq!(q[2], 0.0);
        assert_eq!(q[3], 0.0);
        assert_eq!(q[4], 0.0);
        assert!(param_error(&q, &q_true) < 0.5 * initial, "q = {:?}", q);
    }

    #[test]
    fn test_mean_correction_modes() {
        let lat = Lattice::from_voxel_size([6, 6, 6], [1.0; 3], [0.0; 3]);
        let y = vec![1.0; lat.n_voxels()];
        let make = |shift: f64| {
            let mut o = observation(&lat, &y, [0.0; N_RIGID]);
            o.projector_mut().unwrap().set_rigid([shift, 0.0, 0.0, 0.0, 0.0, 0.0]);
            o
        };
        let build = |shifts: Vec<Vec<f64>>| -> Vec<Channel> {
            shifts
                .into_iter()
                .enumerate()
                .map(|(c, s)| {
                    let obs = s.iter().map(|&v| make(v)).collect();
                    Channel::new(format!("c{}", c), obs, &lat, y.clone(), &StorageKind::InMemory).unwrap()
                })
                .collect()
        };
        let tx = |chs: &[Channel]| -> Vec<f64> {
            chs.iter()
                .flat_map(|c| c.observations().iter().map(|o| o.projector().unwrap().rigid()[0]))
                .collect()
        };

        let mut global = build(vec![vec![1.0], vec![3.0]]);
        apply_mean_correction(&mut global, MeanCorrection::Global);
        assert_eq!(tx(&global), vec![-1.0, 1.0]);

        // single observation per channel: nothing to correct
        let mut per = build(vec![vec![1.0], vec![3.0]]);
        apply_mean_correction(&mut per, MeanCorrection::PerChannel);
        assert_eq!(tx(&per), vec![1.0, 3.0]);

        let mut per = build(vec![vec![1.0, 2.0], vec![3.0]]);
        apply_mean_correction(&mut per, MeanCorrection::PerChannel);
        assert_eq!(tx(&per), vec![-0.5, 0.5, 3.0]);
    }
}
