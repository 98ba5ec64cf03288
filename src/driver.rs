//! Outer ADMM driver
//!
//! Runs the reconstruction as a finite state machine:
//!
//! `Init → ImageUpdate → [BiasUpdate] → [RigidUpdate] → ConvergenceCheck →
//! {ImageUpdate | ScheduleAdvance → ImageUpdate | Terminate}`
//!
//! The driver owns every channel aggregate, one image solver per channel, the
//! regularisation schedule and the worker pool. The objective
//! `ll = ll1 + ll2 + ll3` is recorded after every update together with the
//! update kind; the relative gain over outer iterations of the current stage
//! decides termination once the schedule has reached its terminal stage.

use std::time::{Duration, Instant};

use crate::bias::{update_bias_group, DctBasis};
use crate::channel::{Channel, Observation};
use crate::config::{Method, MtvConfig};
use crate::error::{check_len, MtvError, Result};
use crate::hessian::{hessian_diagonal, update_hessian};
use crate::hyperparams::estimate_channel;
use crate::image_update::{data_log_likelihood, image_gradient, ImageSolver, SolvePath};
use crate::nifti_io::output_name;
use crate::parallel::{collect_results, WorkerPool};
use crate::projection::{Projector, SliceProfile, N_RIGID};
use crate::prox_tv::{joint_prox, tv_energy, GradientField};
use crate::registration::update_rigid;
use crate::schedule::{admm_penalty, RegularizationSchedule};
use crate::utils::metrics::{psnr, ssim};
use crate::volume::{Lattice, StorageKind, Volume};

// ============================================================================
// Problem description
// ============================================================================

/// One observed volume
#[derive(Debug, Clone)]
pub struct ObservationInput {
    pub lattice: Lattice,
    /// Voxel intensities in Fortran order
    pub data: Vec<f64>,
}

impl ObservationInput {
    pub fn new(lattice: Lattice, data: Vec<f64>) -> Self {
        Self { lattice, data }
    }
}

/// Observations of one contrast
#[derive(Debug, Clone)]
pub struct ChannelInput {
    pub name: String,
    pub observations: Vec<ObservationInput>,
}

impl ChannelInput {
    pub fn new(name: impl Into<String>, observations: Vec<ObservationInput>) -> Self {
        Self { name: name.into(), observations }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MtvProblem {
    pub channels: Vec<ChannelInput>,
    /// Optional ground truth per channel, used for PSNR/SSIM reporting only
    pub references: Option<Vec<Vec<f64>>>,
    /// Explicit reconstruction lattice; derived from the inputs when absent
    pub lattice: Option<Lattice>,
}

impl MtvProblem {
    pub fn new(channels: Vec<ChannelInput>) -> Self {
        Self { channels, references: None, lattice: None }
    }

    pub fn with_references(mut self, references: Vec<Vec<f64>>) -> Self {
        self.references = Some(references);
        self
    }

    pub fn with_lattice(mut self, lattice: Lattice) -> Self {
        self.lattice = Some(lattice);
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// Which update produced an objective value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Image,
    Bias,
    Rigid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceEntry {
    pub ll: f64,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    pub psnr: f64,
    pub ssim: f64,
}

/// Passed to the progress callback after every outer iteration
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// 1-based outer iteration
    pub iteration: usize,
    pub stage: usize,
    pub ll: f64,
    pub ll1: f64,
    pub ll2: f64,
    pub ll3: f64,
    pub gain: f64,
    pub rho: f64,
    pub elapsed: Duration,
    /// Per channel, only when references were supplied
    pub metrics: Option<Vec<QualityMetrics>>,
}

#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub trace: Vec<TraceEntry>,
    pub iterations: usize,
    pub elapsed: Duration,
    pub converged: bool,
    pub final_gain: f64,
    /// Per outer iteration, per channel
    pub metrics: Vec<Vec<QualityMetrics>>,
}

#[derive(Debug, Clone)]
pub struct ReconstructedChannel {
    pub name: String,
    /// `{sr|den}_{name}`
    pub output_name: String,
    pub data: Vec<f64>,
    /// Multiplicative bias field, when estimated
    pub bias: Option<Vec<f64>>,
    /// Final rigid parameters of each observation (zero for identity ones)
    pub rigid: Vec<[f64; N_RIGID]>,
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub lattice: Lattice,
    pub channels: Vec<ReconstructedChannel>,
    pub progress: Progress,
}

// ============================================================================
// Validation
// ============================================================================

fn uses_projection(cfg: &MtvConfig) -> bool {
    cfg.method == Method::SuperResolution || cfg.estimate_rigid
}

/// Check the problem against the configuration and pick the reconstruction
/// lattice. Nothing is allocated on the volume storage before this passes.
///
/// # Returns
/// The reconstruction lattice, with the configured boundary condition
pub fn validate_problem(problem: &MtvProblem, cfg: &MtvConfig) -> Result<Lattice> {
    cfg.validate()?;
    cfg.validate_channels(problem.channels.len())?;

    for ch in &problem.channels {
        if ch.observations.is_empty() {
            return Err(MtvError::config(format!("channel '{}' has no observations", ch.name)));
        }
        for obs in &ch.observations {
            check_len(obs.lattice.n_voxels(), obs.data.len())?;
        }
    }

    if problem.references.is_some() && uses_projection(cfg) {
        return Err(MtvError::config(
            "reference volumes cannot be combined with the projection operator \
             (super_resolution or estimate_rigid)",
        ));
    }

    let inputs: Vec<&Lattice> = problem
        .channels
        .iter()
        .flat_map(|c| c.observations.iter().map(|o| &o.lattice))
        .collect();

    let lattice = match (&problem.lattice, cfg.method) {
        (Some(l), _) => l.clone(),
        (None, Method::Denoise) => inputs[0].clone(),
        (None, Method::SuperResolution) => Lattice::covering(&inputs, cfg.voxel_size)
            .ok_or_else(|| MtvError::config("could not build a lattice covering the observations"))?,
    }
    .with_boundary(cfg.boundary);

    if cfg.method == Method::Denoise && !cfg.estimate_rigid {
        if let Some(other) = inputs.iter().find(|l| !l.same_grid(&lattice)) {
            return Err(MtvError::config(format!(
                "denoising without estimate_rigid needs every observation on the reconstruction \
                 lattice (dims {:?}), found dims {:?}",
                lattice.dims, other.dims
            )));
        }
    }

    if cfg.estimate_bias && lattice.is_2d() {
        return Err(MtvError::config("estimate_bias requires 3D data, the reconstruction lattice is 2D"));
    }

    if let Some(refs) = &problem.references {
        if refs.len() != problem.channels.len() {
            return Err(MtvError::config(format!(
                "{} reference volumes for {} channels",
                refs.len(),
                problem.channels.len()
            )));
        }
        for r in refs {
            check_len(lattice.n_voxels(), r.len())?;
        }
    }

    Ok(lattice)
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Init,
    ImageUpdate,
    BiasUpdate,
    RigidUpdate,
    ConvergenceCheck,
    ScheduleAdvance,
    Terminate,
}

/// Relative gain of the last value over the range of `values`
fn relative_gain(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::INFINITY;
    }
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
    let range = max - min;
    if range > 0.0 {
        (values[n - 1] - values[n - 2]).abs() / range
    } else {
        0.0
    }
}

fn read_field(vols: &[Volume; 3]) -> Result<GradientField> {
    Ok([vols[0].to_vec()?, vols[1].to_vec()?, vols[2].to_vec()?])
}

fn write_field(vols: &mut [Volume; 3], field: &GradientField) -> Result<()> {
    for (v, f) in vols.iter_mut().zip(field.iter()) {
        v.write(f)?;
    }
    Ok(())
}

/// Initial image: `Σ τ At(m ⊙ x) / H0`, a coverage-weighted average of the
/// observations on the reconstruction lattice
fn initial_image(observations: &[Observation], n_recon: usize) -> Result<Vec<f64>> {
    let h = hessian_diagonal(observations, n_recon);
    let mut acc = vec![0.0; n_recon];
    for obs in observations {
        let x = obs.data().read()?;
        let tau = obs.tau();
        let weighted: Vec<f64> = x
            .iter()
            .zip(obs.mask())
            .map(|(&v, &m)| if m != 0 { tau * v } else { 0.0 })
            .collect();
        obs.adjoint_accumulate(&weighted, &mut acc);
    }
    Ok(acc.iter().zip(&h).map(|(a, h)| a / h).collect())
}

struct Driver<'a> {
    cfg: &'a MtvConfig,
    storage: StorageKind,
    lattice: Lattice,
    channels: Vec<Channel>,
    solvers: Vec<ImageSolver>,
    references: Option<Vec<Vec<f64>>>,
    schedule: RegularizationSchedule,
    pool: WorkerPool,
    bias: Option<(DctBasis, Vec<Vec<usize>>)>,
    lambda0: Vec<f64>,
    rho: f64,
    ll1: Vec<f64>,
    ll2: f64,
    ll3: f64,
    /// Outer objective values of the current stage, starting with its baseline
    stage_ll: Vec<f64>,
    gain: f64,
    progress: Progress,
    start: Instant,
}

impl<'a> Driver<'a> {
    fn new(problem: MtvProblem, cfg: &'a MtvConfig, lattice: Lattice, start: Instant) -> Result<Self> {
        let storage = cfg.storage();
        let n_channels = problem.channels.len();
        let n_recon = lattice.n_voxels();

        let mut channels = Vec::with_capacity(n_channels);
        let mut lambda0 = Vec::with_capacity(n_channels);
        for (c, input) in problem.channels.into_iter().enumerate() {
            let hp = {
                let slices: Vec<&[f64]> = input.observations.iter().map(|o| o.data.as_slice()).collect();
                estimate_channel(&slices, c, cfg)?
            };
            if cfg.verbose >= 2 {
                log::debug!("channel '{}': tau={:?} lambda0={:.4e}", input.name, hp.taus, hp.lambda0);
            }

            let mut observations = Vec::with_capacity(input.observations.len());
            for (obs, &tau) in input.observations.into_iter().zip(&hp.taus) {
                let projector = if uses_projection(cfg) {
                    let profile = match cfg.method {
                        Method::SuperResolution => SliceProfile::from_geometry(
                            cfg.slice_profile,
                            &obs.lattice,
                            lattice.voxel_size(),
                            cfg.slice_gap,
                        ),
                        Method::Denoise => SliceProfile::none(),
                    };
                    Some(Projector::new(&lattice, &obs.lattice, profile)?)
                } else {
                    None
                };
                let mut o = Observation::new(Volume::new(obs.lattice, obs.data, &storage)?, projector)?;
                o.set_tau(tau);
                observations.push(o);
            }

            let y0 = initial_image(&observations, n_recon)?;
            let mut channel = Channel::new(input.name, observations, &lattice, y0, &storage)?;
            channel.set_lambda0(hp.lambda0);
            update_hessian(&mut channel)?;
            lambda0.push(hp.lambda0);
            channels.push(channel);
        }

        let schedule = RegularizationSchedule::from_config(cfg, n_channels)?;
        let pool = WorkerPool::new(cfg.workers, n_channels)?;
        let solvers = channels.iter().map(|c| ImageSolver::new(c.lattice())).collect();
        let bias = cfg
            .estimate_bias
            .then(|| (DctBasis::new(lattice.dims, cfg.bias_basis), cfg.bias_groups(n_channels)));

        if cfg.verbose >= 1 {
            log::info!(
                "{:?} of {} channel(s) on {:?} lattice, {} worker(s), {} stage(s)",
                cfg.method,
                n_channels,
                lattice.dims,
                pool.workers(),
                schedule.n_stages()
            );
        }

        Ok(Self {
            cfg,
            storage,
            lattice,
            channels,
            solvers,
            references: problem.references,
            schedule,
            pool,
            bias,
            lambda0,
            rho: 0.0,
            ll1: vec![0.0; n_channels],
            ll2: 0.0,
            ll3: 0.0,
            stage_ll: Vec::new(),
            gain: f64::INFINITY,
            progress: Progress::default(),
            start,
        })
    }

    fn all_taus(&self) -> Vec<f64> {
        self.channels.iter().flat_map(|c| c.taus()).collect()
    }

    fn ll(&self) -> f64 {
        self.ll1.iter().sum::<f64>() + self.ll2 + self.ll3
    }

    fn lambdas(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.lambda()).collect()
    }

    /// Apply the schedule's current lambdas and the matching penalty
    fn apply_stage(&mut self) {
        let lambdas = self.schedule.lambdas(&self.lambda0);
        for (ch, &l) in self.channels.iter_mut().zip(&lambdas) {
            ch.set_lambda(l);
        }
        self.rho = admm_penalty(&self.all_taus(), &lambdas, self.cfg.rho_scale);
    }

    fn refresh_data_terms(&mut self) -> Result<()> {
        self.ll1 = collect_results(self.pool.map(&self.channels, |_, ch| data_log_likelihood(ch)))?;
        Ok(())
    }

    fn gradients(&self) -> Result<Vec<GradientField>> {
        collect_results(self.pool.map(&self.channels, |_, ch| image_gradient(ch)))
    }

    /// Joint prox on the given gradients; updates `u`, `w` and `ll2`
    fn prox(&mut self, grads: &[GradientField]) -> Result<()> {
        let mut u: Vec<GradientField> = self.channels.iter().map(|c| read_field(c.u())).collect::<Result<_>>()?;
        let mut w: Vec<GradientField> = self.channels.iter().map(|c| read_field(c.w())).collect::<Result<_>>()?;
        let lambdas = self.lambdas();
        self.ll2 = joint_prox(grads, &mut u, &mut w, &lambdas, self.rho);
        for ((ch, uc), wc) in self.channels.iter_mut().zip(&u).zip(&w) {
            write_field(ch.u_mut(), uc)?;
            write_field(ch.w_mut(), wc)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // States
    // ------------------------------------------------------------------------

    fn init(&mut self) -> Result<DriverState> {
        self.apply_stage();
        let grads = self.gradients()?;
        self.prox(&grads)?;
        self.refresh_data_terms()?;
        let ll = self.ll();
        self.stage_ll.push(ll);
        if self.cfg.verbose >= 1 {
            log::info!("init: ll={:.6e} rho={:.4e} lambda={:?}", ll, self.rho, self.lambdas());
        }
        Ok(DriverState::ImageUpdate)
    }

    /// One sweep: y-update per channel, then the joint prox
    fn image_sweep(&mut self) -> Result<Vec<SolvePath>> {
        let rho = self.rho;
        let cg_iterations = self.cfg.cg_iterations;
        let mut pairs: Vec<(&mut Channel, &mut ImageSolver)> =
            self.channels.iter_mut().zip(self.solvers.iter_mut()).collect();
        let results = collect_results(self.pool.map_mut(&mut pairs, |_, pair| {
            let channel: &mut Channel = &mut *pair.0;
            let solver: &mut ImageSolver = &mut *pair.1;
            let path = solver.solve(channel, rho, cg_iterations)?;
            let grad = image_gradient(channel)?;
            let ll1 = data_log_likelihood(channel)?;
            Ok((path, grad, ll1))
        }))?;

        let mut paths = Vec::with_capacity(results.len());
        let mut grads = Vec::with_capacity(results.len());
        for (c, (path, grad, ll1)) in results.into_iter().enumerate() {
            paths.push(path);
            grads.push(grad);
            self.ll1[c] = ll1;
        }
        self.prox(&grads)?;
        Ok(paths)
    }

    fn image_update(&mut self) -> Result<DriverState> {
        let mut inner = vec![self.ll()];
        for sweep in 0..self.cfg.iter_image {
            let paths = self.image_sweep()?;
            inner.push(self.ll());
            let gain = relative_gain(&inner);
            if self.cfg.verbose >= 2 {
                log::debug!(
                    "  image sweep {}: ll={:.6e} ll1={:.6e} ll2={:.6e} gain={:.3e} {:?}",
                    sweep + 1,
                    self.ll(),
                    self.ll1.iter().sum::<f64>(),
                    self.ll2,
                    gain,
                    paths
                );
            }
            if inner.len() > 2 && gain < self.cfg.tolerance {
                break;
            }
        }
        self.progress.trace.push(TraceEntry { ll: self.ll(), kind: UpdateKind::Image });

        Ok(if self.bias.is_some() {
            DriverState::BiasUpdate
        } else if self.cfg.estimate_rigid {
            DriverState::RigidUpdate
        } else {
            DriverState::ConvergenceCheck
        })
    }

    fn bias_update(&mut self) -> Result<DriverState> {
        if let Some((basis, groups)) = &self.bias {
            let mut ll3 = 0.0;
            for group in groups {
                let step = update_bias_group(
                    &mut self.channels,
                    group,
                    basis,
                    self.cfg.bias_reg,
                    self.cfg.bias_iterations,
                    &self.storage,
                )?;
                if self.cfg.verbose >= 2 {
                    log::debug!(
                        "  bias {:?}: cost {:.6e} -> {:.6e} ({} accepted)",
                        group, step.cost_before, step.cost_after, step.accepted
                    );
                }
                if self.cfg.verbose >= 3 {
                    for &c in group {
                        log::trace!("    channel {} coefficients {:?}", c, self.channels[c].bias_coefficients());
                    }
                }
                ll3 += step.ll3;
            }
            self.ll3 = ll3;
            self.refresh_data_terms()?;
            self.progress.trace.push(TraceEntry { ll: self.ll(), kind: UpdateKind::Bias });
        }
        Ok(if self.cfg.estimate_rigid {
            DriverState::RigidUpdate
        } else {
            DriverState::ConvergenceCheck
        })
    }

    fn rigid_update(&mut self) -> Result<DriverState> {
        let report = update_rigid(
            &mut self.channels,
            &self.pool,
            self.cfg.rigid_iterations,
            self.cfg.rigid_mean_correction,
        )?;
        if self.cfg.verbose >= 2 {
            log::debug!(
                "  rigid: {} observation(s), {} accepted, cost {:.6e} -> {:.6e}",
                report.observations, report.accepted, report.cost_before, report.cost_after
            );
        }
        if self.cfg.verbose >= 3 {
            for ch in &self.channels {
                for (n, obs) in ch.observations().iter().enumerate() {
                    if let Some(p) = obs.projector() {
                        log::trace!("    {}[{}] q={:?}", ch.name(), n, p.rigid());
                    }
                }
            }
        }
        self.refresh_data_terms()?;
        self.progress.trace.push(TraceEntry { ll: self.ll(), kind: UpdateKind::Rigid });
        Ok(DriverState::ConvergenceCheck)
    }

    fn quality(&self) -> Result<Option<Vec<QualityMetrics>>> {
        let Some(refs) = &self.references else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(refs.len());
        for (ch, r) in self.channels.iter().zip(refs) {
            let y = ch.y().read()?;
            out.push(QualityMetrics { psnr: psnr(r, &y), ssim: ssim(r, &y) });
        }
        Ok(Some(out))
    }

    fn convergence_check<F: FnMut(&IterationReport)>(&mut self, callback: &mut F) -> Result<DriverState> {
        self.progress.iterations += 1;
        let ll = self.ll();
        self.stage_ll.push(ll);
        self.gain = relative_gain(&self.stage_ll);

        let metrics = self.quality()?;
        if let Some(m) = &metrics {
            self.progress.metrics.push(m.clone());
        }
        let report = IterationReport {
            iteration: self.progress.iterations,
            stage: self.schedule.stage(),
            ll,
            ll1: self.ll1.iter().sum(),
            ll2: self.ll2,
            ll3: self.ll3,
            gain: self.gain,
            rho: self.rho,
            elapsed: self.start.elapsed(),
            metrics,
        };
        if self.cfg.verbose >= 1 {
            match &report.metrics {
                Some(m) => log::info!(
                    "iter {:3} stage {} ll={:.6e} gain={:.3e} ({:.2?}) psnr={:?} ssim={:?}",
                    report.iteration,
                    report.stage,
                    ll,
                    self.gain,
                    report.elapsed,
                    m.iter().map(|q| q.psnr).collect::<Vec<_>>(),
                    m.iter().map(|q| q.ssim).collect::<Vec<_>>()
                ),
                None => log::info!(
                    "iter {:3} stage {} ll={:.6e} gain={:.3e} ({:.2?})",
                    report.iteration, report.stage, ll, self.gain, report.elapsed
                ),
            }
        }
        callback(&report);

        if self.schedule.convergence_active() && self.gain < self.cfg.tolerance {
            self.progress.converged = true;
            return Ok(DriverState::Terminate);
        }
        if self.progress.iterations >= self.cfg.iter_max {
            if self.cfg.verbose >= 1 {
                log::warn!("stopped after {} iterations, gain {:.3e}", self.progress.iterations, self.gain);
            }
            return Ok(DriverState::Terminate);
        }
        Ok(if self.schedule.step() {
            DriverState::ScheduleAdvance
        } else {
            DriverState::ImageUpdate
        })
    }

    fn schedule_advance(&mut self) -> Result<DriverState> {
        let rho_old = self.rho;
        self.apply_stage();
        let ratio = rho_old / self.rho;
        // scaled duals follow the penalty
        for ch in self.channels.iter_mut() {
            for w in ch.w_mut().iter_mut() {
                w.modify(|d| d.iter_mut().for_each(|v| *v *= ratio))?;
            }
        }
        let grads = self.gradients()?;
        self.ll2 = tv_energy(&grads, &self.lambdas());
        self.stage_ll.clear();
        self.stage_ll.push(self.ll());
        if self.cfg.verbose >= 1 {
            log::info!(
                "stage {} of {}: lambda={:?} rho={:.4e}",
                self.schedule.stage() + 1,
                self.schedule.n_stages(),
                self.lambdas(),
                self.rho
            );
        }
        Ok(DriverState::ImageUpdate)
    }

    fn run<F: FnMut(&IterationReport)>(&mut self, mut callback: F) -> Result<()> {
        let mut state = DriverState::Init;
        loop {
            state = match state {
                DriverState::Init => self.init()?,
                DriverState::ImageUpdate => self.image_update()?,
                DriverState::BiasUpdate => self.bias_update()?,
                DriverState::RigidUpdate => self.rigid_update()?,
                DriverState::ConvergenceCheck => self.convergence_check(&mut callback)?,
                DriverState::ScheduleAdvance => self.schedule_advance()?,
                DriverState::Terminate => break,
            };
        }
        Ok(())
    }

    fn finish(self, first_input: &Lattice) -> Result<Reconstruction> {
        let mut lattice = self.lattice.clone();
        if lattice.is_2d() {
            lattice.mat[(2, 3)] = first_input.mat[(2, 3)];
        }
        let mut channels = Vec::with_capacity(self.channels.len());
        for ch in &self.channels {
            channels.push(ReconstructedChannel {
                name: ch.name().to_string(),
                output_name: output_name(self.cfg.method, ch.name()),
                data: ch.y().to_vec()?,
                bias: ch.bias_values()?,
                rigid: ch
                    .observations()
                    .iter()
                    .map(|o| o.projector().map_or([0.0; N_RIGID], |p| p.rigid()))
                    .collect(),
            });
        }
        let mut progress = self.progress;
        progress.elapsed = self.start.elapsed();
        progress.final_gain = self.gain;
        Ok(Reconstruction { lattice, channels, progress })
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Reconstruct every channel of `problem`
pub fn reconstruct(problem: MtvProblem, cfg: &MtvConfig) -> Result<Reconstruction> {
    reconstruct_with_progress(problem, cfg, |_| {})
}

/// Reconstruct with a callback invoked after every outer iteration
pub fn reconstruct_with_progress<F>(problem: MtvProblem, cfg: &MtvConfig, callback: F) -> Result<Reconstruction>
where
    F: FnMut(&IterationReport),
{
    let start = Instant::now();
    let lattice = validate_problem(&problem, cfg)?;
    let first_input = problem.channels[0].observations[0].lattice.clone();

    let mut driver = Driver::new(problem, cfg, lattice, start)?;
    driver.run(callback)?;
    let recon = driver.finish(&first_input)?;

    if cfg.verbose >= 1 {
        log::info!(
            "finished after {} iteration(s) in {:.2?}, converged={} gain={:.3e}",
            recon.progress.iterations,
            recon.progress.elapsed,
            recon.progress.converged,
            recon.progress.final_gain
        );
    }
    Ok(recon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SliceProfileKind;
    use crate::projection::interp::pull;
    use crate::utils::metrics::{correlation, mse};
    use rand::prelude::*;
    use rand_distr::{Distribution, Normal};

    fn add_noise(x: &[f64], sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, sigma).unwrap();
        x.iter().map(|&v| v + noise.sample(&mut rng)).collect()
    }

    /// Box of value `hi` on a background of `lo`
    fn box_phantom(dims: [usize; 3], lo: f64, hi: f64) -> Vec<f64> {
        let [nx, ny, nz] = dims;
        let mut x = vec![lo; nx * ny * nz];
        for k in 0..nz {
            for j in ny / 4..3 * ny / 4 {
                for i in nx / 3..5 * nx / 6 {
                    x[i + j * nx + k * nx * ny] = hi;
                }
            }
        }
        x
    }

    fn single(lattice: &Lattice, data: Vec<f64>) -> MtvProblem {
        MtvProblem::new(vec![ChannelInput::new("t1", vec![ObservationInput::new(lattice.clone(), data)])])
    }

    fn gradient_magnitude(y: &[f64], lattice: &Lattice) -> Vec<f64> {
        let [nx, ny, nz] = lattice.dims;
        let (gx, gy, gz) = crate::utils::gradient::fgrad(y, nx, ny, nz, 1.0, 1.0, 1.0, lattice.boundary);
        (0..y.len())
            .map(|i| (gx[i] * gx[i] + gy[i] * gy[i] + gz[i] * gz[i]).sqrt())
            .collect()
    }

    #[test]
    fn test_relative_gain() {
        assert!(relative_gain(&[1.0]).is_infinite());
        assert_eq!(relative_gain(&[0.0, 4.0]), 1.0);
        assert_eq!(relative_gain(&[0.0, 4.0, 5.0]), 0.2);
        assert_eq!(relative_gain(&[2.0, 2.0]), 0.0);
    }

    #[test]
    fn test_infinite_precision_returns_input() {
        let lat = Lattice::from_voxel_size([12, 10, 4], [1.0; 3], [0.0; 3]);
        let x = box_phantom(lat.dims, 1.0, 2.0);
        let cfg = MtvConfig { tau: Some(vec![1e10]), lambda: Some(vec![1.0]), iter_max: 10, ..Default::default() };
        let recon = reconstruct(single(&lat, x.clone()), &cfg).unwrap();
        let y = &recon.channels[0].data;
        let err = y.iter().zip(&x).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max);
        assert!(err < 1e-4, "max deviation from noise-free input {}", err);
        assert_eq!(recon.channels[0].output_name, "den_t1");
    }

    #[test]
    fn test_denoising_reduces_error() {
        let lat = Lattice::from_voxel_size([24, 24, 4], [1.0; 3], [0.0; 3]);
        let truth = box_phantom(lat.dims, 0.2, 1.0);
        let noisy = add_noise(&truth, 0.1, 7);
        let recon = reconstruct(single(&lat, noisy.clone()), &MtvConfig::default()).unwrap();
        let before = mse(&truth, &noisy);
        let after = mse(&truth, &recon.channels[0].data);
        assert!(after < before, "MSE {} not below noisy MSE {}", after, before);
        assert!(!recon.progress.trace.is_empty());
        assert!(recon.progress.trace.iter().all(|t| t.kind == UpdateKind::Image));
    }

    #[test]
    fn test_neumann_denoising_uses_pcg_and_reduces_error() {
        let lat = Lattice::from_voxel_size([16, 16, 3], [1.0; 3], [0.0; 3]);
        let truth = box_phantom(lat.dims, 0.2, 1.0);
        let noisy = add_noise(&truth, 0.1, 11);
        let cfg = MtvConfig { boundary: crate::volume::BoundaryCondition::Neumann, iter_max: 12, ..Default::default() };
        let recon = reconstruct(single(&lat, noisy.clone()), &cfg).unwrap();
        assert!(mse(&truth, &recon.channels[0].data) < mse(&truth, &noisy));
    }

    #[test]
    fn test_joint_tv_aligns_edges() {
        let lat = Lattice::from_voxel_size([48, 48, 1], [1.0; 3], [0.0; 3]);
        let n = lat.n_voxels();
        let step = |lo: f64, hi: f64| -> Vec<f64> {
            (0..n).map(|i| if (i % 48) >= 16 && (i % 48) < 32 { hi } else { lo }).collect()
        };
        let a = add_noise(&step(0.2, 1.0), 0.05, 1);
        let b = add_noise(&step(0.5, 0.8), 0.1, 2);
        let cfg = MtvConfig::default();

        let joint = reconstruct(
            MtvProblem::new(vec![
                ChannelInput::new("a", vec![ObservationInput::new(lat.clone(), a.clone())]),
                ChannelInput::new("b", vec![ObservationInput::new(lat.clone(), b.clone())]),
            ]),
            &cfg,
        )
        .unwrap();
        let ya = reconstruct(single(&lat, a), &cfg).unwrap();
        let yb = reconstruct(single(&lat, b), &cfg).unwrap();

        let joint_corr = correlation(
            &gradient_magnitude(&joint.channels[0].data, &lat),
            &gradient_magnitude(&joint.channels[1].data, &lat),
        );
        let indep_corr = correlation(
            &gradient_magnitude(&ya.channels[0].data, &lat),
            &gradient_magnitude(&yb.channels[0].data, &lat),
        );
        assert!(
            joint_corr > indep_corr,
            "joint edge correlation {} should exceed independent {}",
            joint_corr, indep_corr
        );
    }

    #[test]
    fn test_gain_converges_on_smooth_image() {
        let lat = Lattice::from_voxel_size([20, 20, 4], [1.0; 3], [0.0; 3]);
        let [nx, ny, _] = lat.dims;
        let truth: Vec<f64> = (0..lat.n_voxels())
            .map(|idx| {
                let (i, j) = ((idx % nx) as f64, ((idx / nx) % ny) as f64);
                1.0 + 0.5 * (2.0 * std::f64::consts::PI * i / nx as f64).sin()
                    * (2.0 * std::f64::consts::PI * j / ny as f64).cos()
            })
            .collect();
        let noisy = add_noise(&truth, 0.05, 3);
        let cfg = MtvConfig { iter_max: 200, ..Default::default() };

        let mut reports = Vec::new();
        let recon = reconstruct_with_progress(single(&lat, noisy), &cfg, |r| reports.push(r.gain)).unwrap();
        assert!(recon.progress.converged, "gain {} after {} iterations", recon.progress.final_gain, recon.progress.iterations);
        assert!(recon.progress.final_gain < cfg.tolerance);
        assert_eq!(reports.len(), recon.progress.iterations);
    }

    #[test]
    fn test_reference_metrics_do_not_change_result() {
        let lat = Lattice::from_voxel_size([12, 12, 2], [1.0; 3], [0.0; 3]);
        let truth = box_phantom(lat.dims, 0.3, 1.0);
        let noisy = add_noise(&truth, 0.1, 5);
        let cfg = MtvConfig { iter_max: 8, ..Default::default() };

        let plain = reconstruct(single(&lat, noisy.clone()), &cfg).unwrap();
        let with_ref = reconstruct(single(&lat, noisy).with_references(vec![truth]), &cfg).unwrap();
        assert_eq!(plain.channels[0].data, with_ref.channels[0].data);
        assert_eq!(with_ref.progress.metrics.len(), with_ref.progress.iterations);
        assert!(plain.progress.metrics.is_empty());
        let last = with_ref.progress.metrics.last().unwrap()[0];
        assert!(last.psnr > 0.0 && last.ssim > 0.0 && last.ssim <= 1.0);
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let lat = Lattice::from_voxel_size([10, 10, 2], [1.0; 3], [0.0; 3]);
        let a = add_noise(&box_phantom(lat.dims, 0.2, 1.0), 0.1, 8);
        let b = add_noise(&box_phantom(lat.dims, 1.0, 0.4), 0.1, 9);
        let problem = MtvProblem::new(vec![
            ChannelInput::new("a", vec![ObservationInput::new(lat.clone(), a)]),
            ChannelInput::new("b", vec![ObservationInput::new(lat.clone(), b)]),
        ]);
        let seq = reconstruct(problem.clone(), &MtvConfig { iter_max: 5, ..Default::default() }).unwrap();
        let par = reconstruct(problem, &MtvConfig { iter_max: 5, workers: 4, ..Default::default() }).unwrap();
        for (s, p) in seq.channels.iter().zip(&par.channels) {
            assert_eq!(s.data, p.data, "worker count must not change the result");
        }
    }

    #[test]
    fn test_super_resolution_beats_upsampling() {
        let dims = [16, 16, 16];
        let recon_lat = Lattice::from_voxel_size(dims, [1.0; 3], [0.0; 3]);
        let [nx, ny, nz] = dims;
        let mut truth = vec![0.1; recon_lat.n_voxels()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let r2 = (i as f64 - 7.5).powi(2) + (j as f64 - 7.0).powi(2) + (k as f64 - 8.0).powi(2);
                    let v = if r2 < 36.0 { 1.0 } else { 0.1 };
                    let cube = (3..7).contains(&i) && (4..9).contains(&j) && (5..11).contains(&k);
                    truth[i + j * nx + k * nx * ny] = if cube { 0.5 } else { v };
                }
            }
        }

        // thick stacks along each axis, each slightly offset from the fine grid
        let thick = 4.0;
        let offsets = [[0.3, -0.2, 0.25], [-0.25, 0.2, 0.3], [0.2, 0.3, -0.3]];
        let mut stacks = Vec::new();
        for axis in 0..3 {
            let mut vs = [1.0; 3];
            let mut sdims = dims;
            vs[axis] = thick;
            sdims[axis] = dims[axis] / thick as usize;
            let mut origin = offsets[axis];
            origin[axis] += (thick - 1.0) / 2.0;
            let lat = Lattice::from_voxel_size(sdims, vs, origin);
            let profile = SliceProfile::from_geometry(SliceProfileKind::Rect, &lat, [1.0; 3], 0.0);
            let proj = Projector::new(&recon_lat, &lat, profile).unwrap();
            let mut data = vec![0.0; lat.n_voxels()];
            proj.forward(&truth, &mut data);
            let data = add_noise(&data, 0.01, 20 + axis as u64);
            stacks.push((lat, data));
        }

        // naive trilinear upsampling of one stack onto the fine grid
        let upsample = |lat: &Lattice, data: &[f64]| -> Vec<f64> {
            let inv = lat.mat.try_inverse().unwrap();
            let mut out = vec![0.0; recon_lat.n_voxels()];
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        let w = recon_lat.voxel_to_world([i as f64, j as f64, k as f64]);
                        let c = inv * nalgebra::Vector4::new(w[0], w[1], w[2], 1.0);
                        out[i + j * nx + k * nx * ny] = pull(data, lat.dims, [c[0], c[1], c[2]]);
                    }
                }
            }
            out
        };
        let best_naive = stacks
            .iter()
            .map(|(lat, data)| psnr(&truth, &upsample(lat, data)))
            .fold(f64::NEG_INFINITY, f64::max);

        let problem = MtvProblem::new(vec![ChannelInput::new(
            "phantom",
            stacks.into_iter().map(|(lat, data)| ObservationInput::new(lat, data)).collect(),
        )])
        .with_lattice(recon_lat.clone());
        let cfg = MtvConfig {
            method: Method::SuperResolution,
            slice_profile: SliceProfileKind::Rect,
            tau: Some(vec![1e4]),
            lambda: Some(vec![10.0]),
            iter_max: 15,
            ..Default::default()
        };
        let recon = reconstruct(problem, &cfg).unwrap();
        assert_eq!(recon.channels[0].output_name, "sr_phantom");
        let sr = psnr(&truth, &recon.channels[0].data);
        assert!(sr > best_naive, "super-resolution PSNR {:.2} dB vs best upsampling {:.2} dB", sr, best_naive);
    }

    #[test]
    fn test_planar_output_keeps_through_plane_offset() {
        let lat = Lattice::from_voxel_size([8, 8, 1], [1.0, 1.0, 3.0], [0.0, 0.0, 12.5]);
        let noisy = add_noise(&box_phantom(lat.dims, 0.2, 1.0), 0.05, 4);
        let recon = reconstruct(single(&lat, noisy), &MtvConfig { iter_max: 3, ..Default::default() }).unwrap();
        assert_eq!(recon.lattice.mat[(2, 3)], 12.5);
        assert_eq!(recon.lattice.dims, [8, 8, 1]);
    }

    /// Two smooth blobs on a constant background
    fn blobs(lattice: &Lattice, background: f64) -> Vec<f64> {
        let [nx, ny, nz] = lattice.dims;
        let c1 = [nx as f64 * 0.4, ny as f64 * 0.55, (nz as f64 - 1.0) * 0.5];
        let c2 = [nx as f64 * 0.65, ny as f64 * 0.35, (nz as f64 - 1.0) * 0.5];
        let mut y = vec![0.0; lattice.n_voxels()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let p = [i as f64, j as f64, k as f64];
                    let d1: f64 = (0..3).map(|d| (p[d] - c1[d]).powi(2)).sum();
                    let d2: f64 = (0..3).map(|d| (p[d] - c2[d]).powi(2)).sum();
                    y[i + j * nx + k * nx * ny] = background + (-d1 / 30.0).exp() + 0.6 * (-d2 / 12.0).exp();
                }
            }
        }
        y
    }

    /// `A_q truth` on the lattice of `obs`
    fn moved(recon: &Lattice, obs: &Lattice, profile: SliceProfile, q: [f64; N_RIGID], truth: &[f64]) -> Vec<f64> {
        let mut p = Projector::new(recon, obs, profile).unwrap();
        p.set_rigid(q);
        let mut out = vec![0.0; obs.n_voxels()];
        p.forward(truth, &mut out);
        out
    }

    #[test]
    fn test_rigid_denoising_recovers_relative_shift() {
        let lat = Lattice::from_voxel_size([32, 32, 1], [1.0; 3], [0.0; 3]);
        let truth = blobs(&lat, 0.0);
        let shift = [0.8, -0.6, 0.0, 0.0, 0.0, 0.0];
        let a = add_noise(&truth, 0.01, 31);
        let b = add_noise(&moved(&lat, &lat, SliceProfile::none(), shift, &truth), 0.01, 32);
        let problem = MtvProblem::new(vec![ChannelInput::new(
            "t1",
            vec![ObservationInput::new(lat.clone(), a), ObservationInput::new(lat.clone(), b)],
        )]);
        let cfg = MtvConfig { estimate_rigid: true, tau: Some(vec![1e4]), ..Default::default() };
        let recon = reconstruct(problem, &cfg).unwrap();

        let q = &recon.channels[0].rigid;
        assert_eq!(q.len(), 2);
        for d in 0..2 {
            let rel = q[1][d] - q[0][d];
            assert!((rel - shift[d]).abs() < 0.3, "axis {}: relative shift {} vs {} (q = {:?})", d, rel, shift[d], q);
        }
        // planar data keeps out-of-plane parameters fixed
        assert!(q.iter().all(|p| p[2] == 0.0 && p[3] == 0.0 && p[4] == 0.0));

        let trace = &recon.progress.trace;
        assert_eq!(trace.len(), 2 * recon.progress.iterations);
        for (n, t) in trace.iter().enumerate() {
            let expected = if n % 2 == 0 { UpdateKind::Image } else { UpdateKind::Rigid };
            assert_eq!(t.kind, expected, "trace entry {}", n);
        }
    }

    #[test]
    fn test_bias_estimation_recovers_gain_ratio() {
        let lat = Lattice::from_voxel_size([16, 16, 8], [1.0; 3], [0.0; 3]);
        let [nx, ny, nz] = lat.dims;
        let truth: Vec<f64> = (0..lat.n_voxels())
            .map(|idx| {
                let (i, j) = (idx % nx, (idx / nx) % ny);
                if (4..12).contains(&i) && (4..12).contains(&j) { 1.5 } else { 1.0 }
            })
            .collect();
        // gain rises from exp(-0.14) on the left to exp(0.14) on the right
        let field: Vec<f64> = (0..lat.n_voxels())
            .map(|idx| (0.14 * (2.0 * (idx % nx) as f64 / (nx - 1) as f64 - 1.0)).exp())
            .collect();
        let biased: Vec<f64> = truth.iter().zip(&field).map(|(t, f)| t * f).collect();
        let noisy = add_noise(&biased, 0.02, 41);
        let cfg = MtvConfig { estimate_bias: true, ..Default::default() };
        let recon = reconstruct(single(&lat, noisy), &cfg).unwrap();

        let b = recon.channels[0].bias.as_ref().expect("bias field should be reported");
        assert_eq!(b.len(), lat.n_voxels());
        assert!(b.iter().all(|&v| v.is_finite() && v > 0.0));

        let column_mean = |i: usize| -> f64 {
            let mut sum = 0.0;
            for k in 0..nz {
                for j in 0..ny {
                    sum += b[i + j * nx + k * nx * ny];
                }
            }
            sum / (ny * nz) as f64
        };
        let ratio = column_mean(nx - 1) / column_mean(0);
        let true_ratio = (0.28f64).exp();
        assert!(ratio > 1.1 && ratio < 1.6, "right/left bias ratio {:.3}, true {:.3}", ratio, true_ratio);

        let kinds: Vec<UpdateKind> = recon.progress.trace.iter().map(|t| t.kind).collect();
        assert_eq!(kinds[0], UpdateKind::Image);
        assert_eq!(kinds[1], UpdateKind::Bias);
    }

    #[test]
    fn test_paged_storage_matches_in_memory() {
        let lat = Lattice::from_voxel_size([10, 10, 3], [1.0; 3], [0.0; 3]);
        let a = add_noise(&box_phantom(lat.dims, 0.2, 1.0), 0.1, 51);
        let b = add_noise(&box_phantom(lat.dims, 1.0, 0.4), 0.1, 52);
        let problem = MtvProblem::new(vec![
            ChannelInput::new("a", vec![ObservationInput::new(lat.clone(), a)]),
            ChannelInput::new("b", vec![ObservationInput::new(lat.clone(), b)]),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let memory = reconstruct(problem.clone(), &MtvConfig { iter_max: 6, ..Default::default() }).unwrap();
        let paged_cfg = MtvConfig {
            iter_max: 6,
            paged_storage: true,
            temp_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let paged = reconstruct(problem, &paged_cfg).unwrap();
        for (m, p) in memory.channels.iter().zip(&paged.channels) {
            assert_eq!(m.data, p.data, "storage backend must not change the result");
        }
        assert_eq!(memory.progress.trace, paged.progress.trace);
    }

    #[test]
    fn test_super_resolution_estimates_unknown_motion() {
        let dims = [16, 16, 16];
        let recon_lat = Lattice::from_voxel_size(dims, [1.0; 3], [0.0; 3]);
        let truth = blobs(&recon_lat, 0.2);

        // the second stack moved by an unknown in-plane shift and rotation
        let thick = 4.0;
        let motion = [
            [0.0; N_RIGID],
            [0.8, 0.0, -0.6, 0.0, 0.03, 0.0],
            [0.0; N_RIGID],
        ];
        let mut stacks = Vec::new();
        for axis in 0..3 {
            let mut vs = [1.0; 3];
            let mut sdims = dims;
            vs[axis] = thick;
            sdims[axis] = dims[axis] / thick as usize;
            let mut origin = [0.0; 3];
            origin[axis] = (thick - 1.0) / 2.0;
            let lat = Lattice::from_voxel_size(sdims, vs, origin);
            let profile = SliceProfile::from_geometry(SliceProfileKind::Rect, &lat, [1.0; 3], 0.0);
            let data = moved(&recon_lat, &lat, profile, motion[axis], &truth);
            stacks.push(ObservationInput::new(lat, add_noise(&data, 0.01, 60 + axis as u64)));
        }
        let problem = MtvProblem::new(vec![ChannelInput::new("phantom", stacks)]).with_lattice(recon_lat);

        let fixed_cfg = MtvConfig {
            method: Method::SuperResolution,
            slice_profile: SliceProfileKind::Rect,
            tau: Some(vec![1e4]),
            lambda: Some(vec![10.0]),
            iter_max: 20,
            rigid_mean_correction: crate::config::MeanCorrection::None,
            ..Default::default()
        };
        let rigid_cfg = MtvConfig { estimate_rigid: true, ..fixed_cfg.clone() };

        let fixed = reconstruct(problem.clone(), &fixed_cfg).unwrap();
        let rigid = reconstruct(problem, &rigid_cfg).unwrap();
        let y = &rigid.channels[0].data;
        assert!(y.iter().all(|v| v.is_finite()));
        assert!(rigid.progress.trace.iter().all(|t| t.ll.is_finite()));
        assert!(rigid.progress.trace.iter().any(|t| t.kind == UpdateKind::Rigid));

        let err_fixed = mse(&truth, &fixed.channels[0].data);
        let err_rigid = mse(&truth, y);
        assert!(
            err_rigid < err_fixed,
            "MSE with motion estimation {:.3e} should beat fixed geometry {:.3e} (q = {:?})",
            err_rigid, err_fixed, rigid.channels[0].rigid
        );
    }

    // ------------------------------------------------------------------------
    // Configuration errors
    // ------------------------------------------------------------------------

    fn is_config_error<T: std::fmt::Debug>(r: Result<T>) -> bool {
        matches!(r, Err(MtvError::Config(_)))
    }

    #[test]
    fn test_rejects_references_with_projection() {
        let lat = Lattice::from_voxel_size([4, 4, 4], [1.0; 3], [0.0; 3]);
        let p = single(&lat, vec![1.0; 64]).with_references(vec![vec![1.0; 64]]);
        let cfg = MtvConfig { method: Method::SuperResolution, ..Default::default() };
        assert!(is_config_error(validate_problem(&p, &cfg)));
        let cfg = MtvConfig { estimate_rigid: true, ..Default::default() };
        assert!(is_config_error(validate_problem(&p, &cfg)));
        assert!(validate_problem(&p, &MtvConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_bias_on_planar_data() {
        let lat = Lattice::from_voxel_size([4, 4, 1], [1.0; 3], [0.0; 3]);
        let cfg = MtvConfig { estimate_bias: true, ..Default::default() };
        assert!(is_config_error(validate_problem(&single(&lat, vec![1.0; 16]), &cfg)));
    }

    #[test]
    fn test_rejects_empty_inputs() {
        assert!(is_config_error(validate_problem(&MtvProblem::default(), &MtvConfig::default())));
        let empty = MtvProblem::new(vec![ChannelInput::new("t1", Vec::new())]);
        assert!(is_config_error(validate_problem(&empty, &MtvConfig::default())));
    }

    #[test]
    fn test_rejects_mismatched_data() {
        let lat = Lattice::from_voxel_size([4, 4, 4], [1.0; 3], [0.0; 3]);
        let r = validate_problem(&single(&lat, vec![1.0; 63]), &MtvConfig::default());
        assert!(matches!(r, Err(MtvError::Shape { expected: 64, actual: 63 })));
    }

    #[test]
    fn test_rejects_misaligned_denoising() {
        let a = Lattice::from_voxel_size([4, 4, 4], [1.0; 3], [0.0; 3]);
        let b = Lattice::from_voxel_size([4, 4, 4], [1.0; 3], [0.5, 0.0, 0.0]);
        let p = MtvProblem::new(vec![ChannelInput::new(
            "t1",
            vec![ObservationInput::new(a, vec![1.0; 64]), ObservationInput::new(b, vec![1.0; 64])],
        )]);
        assert!(is_config_error(validate_problem(&p, &MtvConfig::default())));
        let cfg = MtvConfig { estimate_rigid: true, ..Default::default() };
        assert!(validate_problem(&p, &cfg).is_ok());
    }

    #[test]
    fn test_invalid_config_fails_before_allocation() {
        let lat = Lattice::from_voxel_size([4, 4, 4], [1.0; 3], [0.0; 3]);
        let cfg = MtvConfig { tau: Some(vec![1.0, 2.0]), ..Default::default() };
        assert!(is_config_error(reconstruct(single(&lat, vec![1.0; 64]), &cfg)));
    }
}
