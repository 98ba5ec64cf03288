//! Reconstruction options
//!
//! Every option has a named default. Options are validated before any
//! volume is allocated, see [`MtvConfig::validate`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MtvError, Result};
use crate::volume::{BoundaryCondition, StorageKind};

// =============================================================================
// Defaults
// =============================================================================

const DEFAULT_ITER_MAX: usize = 30;
const DEFAULT_ITER_IMAGE: usize = 3;
const DEFAULT_CG_ITERATIONS: usize = 6;
const DEFAULT_TOLERANCE: f64 = 1e-4;
const DEFAULT_LAMBDA_SCALE: f64 = 1.0;
const DEFAULT_REG_SCALES: [f64; 4] = [8.0, 4.0, 2.0, 1.0];
const DEFAULT_REG_STEPS: usize = 2;
const DEFAULT_RHO_SCALE: f64 = 1.0;
const DEFAULT_VOXEL_SIZE: f64 = 1.0;
const DEFAULT_SLICE_GAP: f64 = 0.0;
const DEFAULT_RIGID_ITERATIONS: usize = 1;
const DEFAULT_BIAS_BASIS: usize = 3;
const DEFAULT_BIAS_REG: f64 = 1e-2;
const DEFAULT_BIAS_ITERATIONS: usize = 1;
const DEFAULT_GMM_CLASSES: usize = 2;

/// Hard ceiling on the number of bias basis functions per axis
pub const MAX_BIAS_BASIS: usize = 8;

// =============================================================================
// Option enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    #[default]
    Denoise,
    SuperResolution,
}

impl Method {
    /// Prefix of reconstructed volume names
    pub fn prefix(self) -> &'static str {
        match self {
            Method::Denoise => "den",
            Method::SuperResolution => "sr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    #[default]
    Mri,
    Ct,
}

/// Through-plane slice-selection profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceProfileKind {
    #[default]
    Gaussian,
    Rect,
}

/// Which observations share a zero-mean constraint on rigid parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanCorrection {
    None,
    PerChannel,
    #[default]
    Global,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtvConfig {
    pub method: Method,
    pub modality: Modality,
    /// Maximum outer ADMM iterations
    pub iter_max: usize,
    /// Image-update sweeps per outer iteration
    pub iter_image: usize,
    /// Conjugate gradient iterations per image-update sweep
    pub cg_iterations: usize,
    /// Relative objective gain below which iteration stops
    pub tolerance: f64,
    /// User multiplier on the estimated regularisation
    pub lambda_scale: f64,
    /// Coarse-to-fine lambda multipliers; the last one must be 1
    pub reg_scales: Vec<f64>,
    /// Outer iterations spent in each non-terminal stage
    pub reg_steps: usize,
    /// Multiplier on the ADMM penalty heuristic
    pub rho_scale: f64,
    /// Super-resolution voxel size in mm
    pub voxel_size: [f64; 3],
    pub slice_profile: SliceProfileKind,
    /// Slice gap as a fraction of the through-plane spacing
    pub slice_gap: f64,
    pub boundary: BoundaryCondition,
    pub estimate_rigid: bool,
    pub rigid_iterations: usize,
    pub rigid_mean_correction: MeanCorrection,
    pub estimate_bias: bool,
    /// DCT basis functions per axis
    pub bias_basis: usize,
    pub bias_reg: f64,
    pub bias_iterations: usize,
    /// Groups of channel indices that share one bias field
    pub bias_link: Vec<Vec<usize>>,
    /// Gaussian mixture classes for noise estimation
    pub gmm_classes: usize,
    /// Requested worker threads (0 = sequential)
    pub workers: usize,
    pub paged_storage: bool,
    pub temp_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Reporting detail, 0 (silent) to 3
    pub verbose: u8,
    /// Per-channel noise precision override
    pub tau: Option<Vec<f64>>,
    /// Per-channel lambda0 override (lambda_scale still applies)
    pub lambda: Option<Vec<f64>>,
}

impl Default for MtvConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            modality: Modality::default(),
            iter_max: DEFAULT_ITER_MAX,
            iter_image: DEFAULT_ITER_IMAGE,
            cg_iterations: DEFAULT_CG_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            lambda_scale: DEFAULT_LAMBDA_SCALE,
            reg_scales: DEFAULT_REG_SCALES.to_vec(),
            reg_steps: DEFAULT_REG_STEPS,
            rho_scale: DEFAULT_RHO_SCALE,
            voxel_size: [DEFAULT_VOXEL_SIZE; 3],
            slice_profile: SliceProfileKind::default(),
            slice_gap: DEFAULT_SLICE_GAP,
            boundary: BoundaryCondition::default(),
            estimate_rigid: false,
            rigid_iterations: DEFAULT_RIGID_ITERATIONS,
            rigid_mean_correction: MeanCorrection::default(),
            estimate_bias: false,
            bias_basis: DEFAULT_BIAS_BASIS,
            bias_reg: DEFAULT_BIAS_REG,
            bias_iterations: DEFAULT_BIAS_ITERATIONS,
            bias_link: Vec::new(),
            gmm_classes: DEFAULT_GMM_CLASSES,
            workers: 0,
            paged_storage: false,
            temp_dir: None,
            output_dir: PathBuf::from("."),
            verbose: 0,
            tau: None,
            lambda: None,
        }
    }
}

impl MtvConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MtvError::config(format!("invalid config JSON: {}", e)))
    }

    pub fn storage(&self) -> StorageKind {
        if self.paged_storage {
            StorageKind::Paged { dir: self.temp_dir.clone() }
        } else {
            StorageKind::InMemory
        }
    }

    /// Check option values that do not depend on the input data
    pub fn validate(&self) -> Result<()> {
        if self.iter_max == 0 {
            return Err(MtvError::config("iter_max must be at least 1"));
        }
        if self.iter_image == 0 {
            return Err(MtvError::config("iter_image must be at least 1"));
        }
        if self.cg_iterations == 0 {
            return Err(MtvError::config("cg_iterations must be at least 1"));
        }
        if !(self.tolerance > 0.0) {
            return Err(MtvError::config(format!("tolerance must be positive, got {}", self.tolerance)));
        }
        if !(self.lambda_scale > 0.0) {
            return Err(MtvError::config(format!(
                "lambda_scale must be positive, got {}",
                self.lambda_scale
            )));
        }
        if !(self.rho_scale > 0.0) {
            return Err(MtvError::config(format!("rho_scale must be positive, got {}", self.rho_scale)));
        }
        if self.voxel_size.iter().any(|&v| !(v > 0.0)) {
            return Err(MtvError::config(format!(
                "voxel_size entries must be positive, got {:?}",
                self.voxel_size
            )));
        }
        if !(0.0..1.0).contains(&self.slice_gap) {
            return Err(MtvError::config(format!(
                "slice_gap must lie in [0, 1), got {}",
                self.slice_gap
            )));
        }
        match self.reg_scales.last() {
            None => return Err(MtvError::config("reg_scales must not be empty")),
            Some(&last) if last != 1.0 => {
                return Err(MtvError::config(format!(
                    "the last entry of reg_scales must be 1, got {}",
                    last
                )))
            }
            _ => {}
        }
        if self.reg_scales.iter().any(|&s| !(s > 0.0)) {
            return Err(MtvError::config("reg_scales entries must be positive"));
        }
        if self.reg_scales.len() > 1 && self.reg_steps == 0 {
            return Err(MtvError::config("reg_steps must be at least 1 when reg_scales has several stages"));
        }
        if self.estimate_bias {
            if self.bias_basis == 0 || self.bias_basis > MAX_BIAS_BASIS {
                return Err(MtvError::config(format!(
                    "bias_basis must lie in 1..={}, got {}",
                    MAX_BIAS_BASIS, self.bias_basis
                )));
            }
            if !(self.bias_reg > 0.0) {
                return Err(MtvError::config("bias_reg must be positive"));
            }
        }
        if self.gmm_classes == 0 {
            return Err(MtvError::config("gmm_classes must be at least 1"));
        }
        if let Some(tau) = &self.tau {
            if tau.iter().any(|&t| !(t > 0.0) || !t.is_finite()) {
                return Err(MtvError::config("tau overrides must be finite and positive"));
            }
        }
        if let Some(lambda) = &self.lambda {
            if lambda.iter().any(|&l| !(l > 0.0) || !l.is_finite()) {
                return Err(MtvError::config("lambda overrides must be finite and positive"));
            }
        }
        Ok(())
    }

    /// Check the options that depend on the number of channels
    pub fn validate_channels(&self, n_channels: usize) -> Result<()> {
        if n_channels == 0 {
            return Err(MtvError::config("at least one channel is required"));
        }
        if let Some(tau) = &self.tau {
            if tau.len() != n_channels {
                return Err(MtvError::config(format!(
                    "tau override has {} entries for {} channels",
                    tau.len(),
                    n_channels
                )));
            }
        }
        if let Some(lambda) = &self.lambda {
            if lambda.len() != n_channels {
                return Err(MtvError::config(format!(
                    "lambda override has {} entries for {} channels",
                    lambda.len(),
                    n_channels
                )));
            }
        }
        let mut seen = vec![false; n_channels];
        for group in &self.bias_link {
            for &c in group {
                if c >= n_channels {
                    return Err(MtvError::config(format!(
                        "bias_link refers to channel {} but only {} channels exist",
                        c, n_channels
                    )));
                }
                if seen[c] {
                    return Err(MtvError::config(format!("bias_link lists channel {} twice", c)));
                }
                seen[c] = true;
            }
        }
        Ok(())
    }

    /// Bias groups covering every channel: linked groups first, then the
    /// remaining channels on their own
    pub fn bias_groups(&self, n_channels: usize) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = self
            .bias_link
            .iter()
            .filter(|g| !g.is_empty())
            .cloned()
            .collect();
        let mut linked = vec![false; n_channels];
        for g in &groups {
            for &c in g {
                if c < n_channels {
                    linked[c] = true;
                }
            }
        }
        for (c, &l) in linked.iter().enumerate() {
            if !l {
                groups.push(vec![c]);
            }
        }
        groups
    }
}
