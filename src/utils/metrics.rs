//! Voxel masks and image quality measures

/// Voxels that may contribute to likelihoods and statistics
/// (finite and nonzero), as a 0/1 mask
pub fn valid_mask(data: &[f64]) -> Vec<u8> {
    data.iter().map(|&v| (v.is_finite() && v != 0.0) as u8).collect()
}

/// Mean squared error between two equally sized images
pub fn mse(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>() / a.len() as f64
}

/// Peak signal-to-noise ratio in dB, with the reference's maximum
/// absolute value as peak
pub fn psnr(reference: &[f64], image: &[f64]) -> f64 {
    let peak = reference.iter().fold(0.0f64, |m, &v| m.max(v.abs()));
    let err = mse(reference, image);
    if err <= 0.0 {
        return f64::INFINITY;
    }
    10.0 * (peak * peak / err).log10()
}

/// Structural similarity computed over the whole image as one window
pub fn ssim(reference: &[f64], image: &[f64]) -> f64 {
    debug_assert_eq!(reference.len(), image.len());
    let n = reference.len() as f64;
    if n < 2.0 {
        return 1.0;
    }
    let (lo, hi) = reference
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = (hi - lo).max(f64::EPSILON);
    let c1 = (0.01 * range).powi(2);
    let c2 = (0.03 * range).powi(2);

    let mu_x = reference.iter().sum::<f64>() / n;
    let mu_y = image.iter().sum::<f64>() / n;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    let mut cov = 0.0;
    for (&x, &y) in reference.iter().zip(image) {
        var_x += (x - mu_x) * (x - mu_x);
        var_y += (y - mu_y) * (y - mu_y);
        cov += (x - mu_x) * (y - mu_y);
    }
    var_x /= n - 1.0;
    var_y /= n - 1.0;
    cov /= n - 1.0;

    ((2.0 * mu_x * mu_y + c1) * (2.0 * cov + c2))
        / ((mu_x * mu_x + mu_y * mu_y + c1) * (var_x + var_y + c2))
}

/// Pearson correlation coefficient (0 when either input is constant)
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma) * (x - ma);
        sbb += (y - mb) * (y - mb);
    }
    if saa <= 0.0 || sbb <= 0.0 {
        return 0.0;
    }
    sab / (saa.sqrt() * sbb.sqrt())
}
