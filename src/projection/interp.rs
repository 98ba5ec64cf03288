//! Trilinear interpolation on a lattice, with zero outside the grid
//!
//! `pull` and `push` use identical weights so that spreading is the exact
//! transpose of sampling. Axes with a single voxel use nearest sampling
//! within half a voxel of the centre.

/// Interpolation taps along one axis: (index, weight, d weight / d coordinate)
#[derive(Clone, Copy)]
struct AxisTaps {
    taps: [(usize, f64, f64); 2],
    len: usize,
}

#[inline]
fn axis_taps(c: f64, n: usize) -> AxisTaps {
    let mut out = AxisTaps { taps: [(0, 0.0, 0.0); 2], len: 0 };
    if !c.is_finite() {
        return out;
    }
    if n == 1 {
        if c.abs() <= 0.5 {
            out.taps[0] = (0, 1.0, 0.0);
            out.len = 1;
        }
        return out;
    }
    let f = c.floor();
    let t = c - f;
    let i0 = f as i64;
    for (i, w, dw) in [(i0, 1.0 - t, -1.0), (i0 + 1, t, 1.0)] {
        if i >= 0 && (i as usize) < n {
            out.taps[out.len] = (i as usize, w, dw);
            out.len += 1;
        }
    }
    out
}

#[inline]
fn taps3(c: [f64; 3], dims: [usize; 3]) -> [AxisTaps; 3] {
    [axis_taps(c[0], dims[0]), axis_taps(c[1], dims[1]), axis_taps(c[2], dims[2])]
}

/// Sample `data` at fractional voxel coordinate `c`
#[inline]
pub fn pull(data: &[f64], dims: [usize; 3], c: [f64; 3]) -> f64 {
    let [tx, ty, tz] = taps3(c, dims);
    let (nx, ny) = (dims[0], dims[1]);
    let mut acc = 0.0;
    for &(k, wz, _) in &tz.taps[..tz.len] {
        for &(j, wy, _) in &ty.taps[..ty.len] {
            let wzy = wz * wy;
            let base = j * nx + k * nx * ny;
            for &(i, wx, _) in &tx.taps[..tx.len] {
                acc += wzy * wx * data[base + i];
            }
        }
    }
    acc
}

/// Spread `value` into `data` at fractional voxel coordinate `c`
/// (transpose of [`pull`])
#[inline]
pub fn push(data: &mut [f64], dims: [usize; 3], c: [f64; 3], value: f64) {
    let [tx, ty, tz] = taps3(c, dims);
    let (nx, ny) = (dims[0], dims[1]);
    for &(k, wz, _) in &tz.taps[..tz.len] {
        for &(j, wy, _) in &ty.taps[..ty.len] {
            let wzy = wz * wy * value;
            let base = j * nx + k * nx * ny;
            for &(i, wx, _) in &tx.taps[..tx.len] {
                data[base + i] += wzy * wx;
            }
        }
    }
}

/// Sample `data` at `c` together with the derivative of the interpolant
/// with respect to each coordinate
#[inline]
pub fn pull_with_gradient(data: &[f64], dims: [usize; 3], c: [f64; 3]) -> (f64, [f64; 3]) {
    let [tx, ty, tz] = taps3(c, dims);
    let (nx, ny) = (dims[0], dims[1]);
    let mut val = 0.0;
    let mut grad = [0.0; 3];
    for &(k, wz, dz) in &tz.taps[..tz.len] {
        for &(j, wy, dy) in &ty.taps[..ty.len] {
            let base = j * nx + k * nx * ny;
            for &(i, wx, dx) in &tx.taps[..tx.len] {
                let v = data[base + i];
                val += wx * wy * wz * v;
                grad[0] += dx * wy * wz * v;
                grad[1] += wx * dy * wz * v;
                grad[2] += wx * wy * dz * v;
            }
        }
    }
    (val, grad)
}
