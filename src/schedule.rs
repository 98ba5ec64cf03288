//! Coarse-to-fine regularisation schedule
//!
//! A finite state machine over stages. Stage `s` applies
//! `λ_c = scales[s][c] · λ0_c`; the terminal stage has every scale equal
//! to 1, so there `λ_c` is exactly `λ0_c`. The driver calls
//! [`RegularizationSchedule::step`] once per outer iteration; a
//! non-terminal stage advances once its step counter reaches the stage
//! threshold. Convergence checks only apply at the terminal stage.

use crate::config::MtvConfig;
use crate::error::{MtvError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationSchedule {
    /// `scales[stage][channel]`
    scales: Vec<Vec<f64>>,
    /// Outer iterations spent in each non-terminal stage
    thresholds: Vec<usize>,
    stage: usize,
    steps: usize,
}

impl RegularizationSchedule {
    pub fn new(scales: Vec<Vec<f64>>, thresholds: Vec<usize>) -> Result<Self> {
        let Some(last) = scales.last() else {
            return Err(MtvError::config("regularisation schedule needs at least one stage"));
        };
        if last.iter().any(|&s| s != 1.0) {
            return Err(MtvError::config("the terminal regularisation stage must have all scales equal to 1"));
        }
        let n_channels = last.len();
        if scales.iter().any(|row| row.len() != n_channels) {
            return Err(MtvError::config("every regularisation stage needs one scale per channel"));
        }
        if thresholds.len() + 1 != scales.len() {
            return Err(MtvError::config(format!(
                "{} stages need {} thresholds, got {}",
                scales.len(),
                scales.len() - 1,
                thresholds.len()
            )));
        }
        if thresholds.iter().any(|&t| t == 0) {
            return Err(MtvError::config("stage thresholds must be at least 1"));
        }
        Ok(Self { scales, thresholds, stage: 0, steps: 0 })
    }

    /// Same scale for every channel, `reg_steps` iterations per stage
    pub fn from_config(cfg: &MtvConfig, n_channels: usize) -> Result<Self> {
        let scales = cfg.reg_scales.iter().map(|&s| vec![s; n_channels]).collect::<Vec<_>>();
        let thresholds = vec![cfg.reg_steps; scales.len().saturating_sub(1)];
        Self::new(scales, thresholds)
    }

    #[inline]
    pub fn stage(&self) -> usize {
        self.stage
    }

    #[inline]
    pub fn n_stages(&self) -> usize {
        self.scales.len()
    }

    /// Steps taken in the current stage
    #[inline]
    pub fn steps(&self) -> usize {
        self.steps
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.stage + 1 == self.scales.len()
    }

    /// Whether the objective gain may terminate the run
    #[inline]
    pub fn convergence_active(&self) -> bool {
        self.is_final()
    }

    pub fn scale(&self, channel: usize) -> f64 {
        self.scales[self.stage][channel]
    }

    /// Current regularisation for each channel
    pub fn lambdas(&self, lambda0: &[f64]) -> Vec<f64> {
        self.scales[self.stage]
            .iter()
            .zip(lambda0)
            .map(|(&s, &l)| s * l)
            .collect()
    }

    /// Count one outer iteration; returns true when the stage advanced
    pub fn step(&mut self) -> bool {
        if self.is_final() {
            return false;
        }
        self.steps += 1;
        if self.steps >= self.thresholds[self.stage] {
            self.stage += 1;
            self.steps = 0;
            true
        } else {
            false
        }
    }
}

/// ADMM penalty heuristic: `ρ = scale · √(mean τ) · mean λ`
///
/// Grows with both the noise precision and the regularisation.
pub fn admm_penalty(taus: &[f64], lambda: &[f64], rho_scale: f64) -> f64 {
    let mean = |v: &[f64]| if v.is_empty() { 1.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
    rho_scale * mean(taus).sqrt() * mean(lambda)
}
