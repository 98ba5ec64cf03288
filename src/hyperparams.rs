//! Noise precision and regularisation estimates
//!
//! Noise is estimated from a one-dimensional Gaussian mixture fitted by EM
//! to the finite nonzero intensities of each observation, initialised at
//! evenly spaced quantiles so the fit is deterministic. The standard
//! deviation of the lowest-mean class is taken as the noise level.

use crate::config::{Method, Modality, MtvConfig};
use crate::error::{MtvError, Result};

/// At most this many intensities go into one mixture fit
const MAX_SAMPLES: usize = 1 << 20;
const EM_MAX_ITER: usize = 200;
const EM_TOL: f64 = 1e-10;

/// Regularisation factor for denoising
const LAMBDA_FACTOR_DENOISE: f64 = 10.0;
/// Regularisation factor for super-resolution
const LAMBDA_FACTOR_SR: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussianMixture {
    /// Index of the class with the smallest mean
    pub fn lowest(&self) -> usize {
        argby(&self.means, |a, b| a < b)
    }

    /// Index of the class with the largest mean
    pub fn highest(&self) -> usize {
        argby(&self.means, |a, b| a > b)
    }
}

fn argby(v: &[f64], better: impl Fn(f64, f64) -> bool) -> usize {
    let mut best = 0;
    for (i, &x) in v.iter().enumerate() {
        if better(x, v[best]) {
            best = i;
        }
    }
    best
}

/// Fit a `k`-class 1D Gaussian mixture by expectation-maximisation
pub fn fit_gmm(values: &[f64], k: usize) -> Result<GaussianMixture> {
    if values.is_empty() {
        return Err(MtvError::Numerical("no intensities to fit a mixture to".to_string()));
    }
    if k == 0 {
        return Err(MtvError::config("a mixture needs at least one class"));
    }

    // deterministic subsample
    let stride = values.len().div_ceil(MAX_SAMPLES).max(1);
    let x: Vec<f64> = values.iter().step_by(stride).copied().collect();
    let n = x.len() as f64;

    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let var_floor = (var * 1e-8).max(1e-12);

    let mut sorted = x.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut means: Vec<f64> = (0..k)
        .map(|c| {
            let q = (c as f64 + 0.5) / k as f64;
            sorted[((q * n) as usize).min(sorted.len() - 1)]
        })
        .collect();
    let mut variances = vec![(var / (k * k) as f64).max(var_floor); k];
    let mut weights = vec![1.0 / k as f64; k];

    let mut resp = vec![0.0; x.len() * k];
    let mut prev_ll = f64::NEG_INFINITY;
    for _ in 0..EM_MAX_ITER {
        // E-step with log-sum-exp
        let mut ll = 0.0;
        let log_norm: Vec<f64> = (0..k)
            .map(|c| weights[c].max(1e-300).ln() - 0.5 * (2.0 * std::f64::consts::PI * variances[c]).ln())
            .collect();
        for (i, &xi) in x.iter().enumerate() {
            let r = &mut resp[i * k..(i + 1) * k];
            let mut max = f64::NEG_INFINITY;
            for c in 0..k {
                r[c] = log_norm[c] - 0.5 * (xi - means[c]).powi(2) / variances[c];
                max = max.max(r[c]);
            }
            let mut sum = 0.0;
            for v in r.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in r.iter_mut() {
                *v /= sum;
            }
            ll += max + sum.ln();
        }

        // M-step
        for c in 0..k {
            let mut nk = 0.0;
            let mut s1 = 0.0;
            for (i, &xi) in x.iter().enumerate() {
                let r = resp[i * k + c];
                nk += r;
                s1 += r * xi;
            }
            if nk <= 0.0 {
                continue;
            }
            let mu = s1 / nk;
            let s2: f64 = x.iter().enumerate().map(|(i, &xi)| resp[i * k + c] * (xi - mu).powi(2)).sum();
            means[c] = mu;
            variances[c] = (s2 / nk).max(var_floor);
            weights[c] = nk / n;
        }

        if (ll - prev_ll).abs() <= EM_TOL * ll.abs().max(1.0) {
            break;
        }
        prev_ll = ll;
    }

    Ok(GaussianMixture { means, variances, weights })
}

/// Noise level and intensity scale of one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseEstimate {
    pub sigma: f64,
    pub tau: f64,
    pub contrast: f64,
}

/// Estimate noise from the finite nonzero voxels of `data`
pub fn estimate_noise(data: &[f64], classes: usize, modality: Modality) -> Result<NoiseEstimate> {
    let values: Vec<f64> = data.iter().copied().filter(|v| v.is_finite() && *v != 0.0).collect();
    let gmm = fit_gmm(&values, classes)?;
    let lo = gmm.lowest();
    let hi = gmm.highest();
    let sigma = gmm.variances[lo].sqrt();
    if !(sigma > 0.0) || !sigma.is_finite() {
        return Err(MtvError::Numerical(format!("degenerate noise estimate sigma = {}", sigma)));
    }

    let contrast = match modality {
        Modality::Mri => gmm.means[hi].abs(),
        Modality::Ct => gmm.means[hi] - gmm.means[lo],
    };
    let contrast = if contrast > 0.0 && contrast.is_finite() {
        contrast
    } else {
        // single class or flat data: fall back to the intensity range
        let (min, max) = values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
        if max > min { max - min } else { 1.0 }
    };

    Ok(NoiseEstimate { sigma, tau: 1.0 / (sigma * sigma), contrast })
}

/// Base regularisation factor by reconstruction method
pub fn lambda_factor(method: Method) -> f64 {
    match method {
        Method::Denoise => LAMBDA_FACTOR_DENOISE,
        Method::SuperResolution => LAMBDA_FACTOR_SR,
    }
}

/// `λ0 = factor(method) · lambda_scale / contrast`
pub fn lambda0_from_contrast(contrast: f64, method: Method, lambda_scale: f64) -> f64 {
    lambda_factor(method) * lambda_scale / contrast
}

/// Noise precision of each observation and the base regularisation of one
/// channel, honouring the overrides in `cfg`
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHyperparameters {
    pub taus: Vec<f64>,
    pub lambda0: f64,
}

pub fn estimate_channel(observations: &[&[f64]], channel: usize, cfg: &MtvConfig) -> Result<ChannelHyperparameters> {
    let tau_override = cfg.tau.as_ref().and_then(|t| t.get(channel).copied());
    let lambda_override = cfg.lambda.as_ref().and_then(|l| l.get(channel).copied());

    let need_estimate = tau_override.is_none() || lambda_override.is_none();
    let estimates = if need_estimate {
        observations
            .iter()
            .map(|d| estimate_noise(d, cfg.gmm_classes, cfg.modality))
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let taus = match tau_override {
        Some(t) => vec![t; observations.len()],
        None => estimates.iter().map(|e| e.tau).collect(),
    };
    let lambda0 = match lambda_override {
        Some(l) => l * cfg.lambda_scale,
        None => {
            let contrast = estimates.iter().map(|e| e.contrast).sum::<f64>() / estimates.len().max(1) as f64;
            lambda0_from_contrast(contrast, cfg.method, cfg.lambda_scale)
        }
    };
    Ok(ChannelHyperparameters { taus, lambda0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_distr::{Distribution, Normal};

    fn two_class(n: usize, lo: f64, hi: f64, sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, sigma).unwrap();
        (0..n)
            .map(|i| (if i % 3 == 0 { hi } else { lo }) + noise.sample(&mut rng))
            .collect()
    }

    #[test]
    fn test_gmm_recovers_known_sigma() {
        let sigma_true = 0.05;
        let data = two_class(6000, 0.25, 1.0, sigma_true, 42);
        let est = estimate_noise(&data, 2, Modality::Mri).unwrap();
        let error = (est.sigma - sigma_true).abs() / sigma_true;
        assert!(error < 0.2, "sigma estimate {} off by {:.1}%", est.sigma, 100.0 * error);
        assert!((est.contrast - 1.0).abs() < 0.05, "contrast {}", est.contrast);
        assert!((est.tau - 1.0 / (est.sigma * est.sigma)).abs() < 1e-9);
    }

    #[test]
    fn test_ct_contrast_is_class_separation() {
        let data = two_class(3000, -1000.0, 40.0, 10.0, 7);
        let est = estimate_noise(&data, 2, Modality::Ct).unwrap();
        assert!((est.contrast - 1040.0).abs() < 10.0, "contrast {}", est.contrast);
        assert!((est.sigma - 10.0).abs() < 2.0);
    }

    #[test]
    fn test_estimate_is_deterministic_and_masks_invalid() {
        let mut data = two_class(2000, 0.3, 0.9, 0.04, 3);
        let a = estimate_noise(&data, 2, Modality::Mri).unwrap();
        data.extend([0.0, f64::NAN, f64::INFINITY, 0.0]);
        let b = estimate_noise(&data, 2, Modality::Mri).unwrap();
        assert_eq!(a, b);
        assert!(estimate_noise(&[0.0, f64::NAN], 2, Modality::Mri).is_err());
    }

    #[test]
    fn test_lambda_rule_and_overrides() {
        assert_eq!(lambda0_from_contrast(2.0, Method::Denoise, 1.0), 5.0);
        assert!(lambda_factor(Method::SuperResolution) < lambda_factor(Method::Denoise));

        let data = two_class(2000, 0.25, 1.0, 0.05, 11);
        let cfg = MtvConfig { tau: Some(vec![7.0]), lambda: Some(vec![0.5]), lambda_scale: 2.0, ..Default::default() };
        let hp = estimate_channel(&[&data, &data], 0, &cfg).unwrap();
        assert_eq!(hp.taus, vec![7.0, 7.0]);
        assert_eq!(hp.lambda0, 1.0);

        let hp = estimate_channel(&[&data], 0, &MtvConfig::default()).unwrap();
        assert!(hp.taus[0] > 200.0 && hp.taus[0] < 700.0, "tau {}", hp.taus[0]);
        assert!((hp.lambda0 - 10.0).abs() < 1.0, "lambda0 {}", hp.lambda0);
    }
}
