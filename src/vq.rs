//! PVQ shape quantization: spreading rotation, pulse search, and the
//! gain-scaled reconstruction.

use crate::bands::SPREAD_NONE;
use crate::cwrs::{decode_pulses, encode_pulses};
use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;
use crate::mathops::{celt_cos_norm, celt_inner_prod, celt_rsqrt, fast_atan2f, EPSILON};

fn exp_rotation1(x: &mut [f32], stride: usize, c: f32, s: f32) {
    let len = x.len();
    let ms = -s;
    for i in 0..len - stride {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = c * x2 + s * x1;
        x[i] = c * x1 + ms * x2;
    }
    if len >= 2 * stride + 1 {
        for i in (0..len - 2 * stride).rev() {
            let x1 = x[i];
            let x2 = x[i + stride];
            x[i + stride] = c * x2 + s * x1;
            x[i] = c * x1 + ms * x2;
        }
    }
}

const SPREAD_FACTOR: [i32; 3] = [15, 10, 5];

/// Spreading rotation. Applied forward before the pulse search and
/// backward after reconstruction, it trades a bit of coding gain for less
/// tonal sparseness at low pulse counts.
pub fn exp_rotation(x: &mut [f32], dir: i32, stride: usize, k: i32, spread: i32) {
    let len = x.len();
    if 2 * k as usize >= len || spread == SPREAD_NONE {
        return;
    }
    let factor = SPREAD_FACTOR[(spread - 1) as usize];
    let gain = len as f32 / (len + (factor * k) as usize) as f32;
    let theta = 0.5 * gain * gain;
    let c = celt_cos_norm(theta);
    let s = celt_cos_norm(1.0 - theta);

    let mut stride2 = 0usize;
    if len >= 8 * stride {
        // Round-to-nearest sqrt(len/stride) by incrementing while
        // (stride2 + 0.5)^2 < len/stride.
        stride2 = 1;
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }
    let sub = len / stride;
    for i in 0..stride {
        let block = &mut x[i * sub..(i + 1) * sub];
        if dir < 0 {
            if stride2 != 0 {
                exp_rotation1(block, stride2, s, c);
            }
            exp_rotation1(block, 1, c, s);
        } else {
            exp_rotation1(block, 1, c, -s);
            if stride2 != 0 {
                exp_rotation1(block, stride2, s, -c);
            }
        }
    }
}

/// Scale the integer pulse vector to the band's gain.
fn normalise_residual(iy: &[i32], x: &mut [f32], ryy: f32, gain: f32) {
    let g = celt_rsqrt(ryy) * gain;
    for (xi, &p) in x.iter_mut().zip(iy) {
        *xi = g * p as f32;
    }
}

/// One bit per interleaved short block that received at least one pulse.
fn extract_collapse_mask(iy: &[i32], b: usize) -> u32 {
    if b <= 1 {
        return 1;
    }
    let n0 = iy.len() / b;
    let mut mask = 0u32;
    for i in 0..b {
        let mut tmp = 0;
        for &v in &iy[i * n0..(i + 1) * n0] {
            tmp |= v;
        }
        mask |= ((tmp != 0) as u32) << i;
    }
    mask
}

/// Greedy pulse search: projection for large K, then one pulse at a time
/// maximizing the normalized correlation. Returns sum(iy^2).
fn op_pvq_search(x: &mut [f32], iy: &mut [i32], k: i32, n: usize) -> f32 {
    let mut y = vec![0.0f32; n];
    let mut signx = vec![1i32; n];
    for j in 0..n {
        if x[j] <= 0.0 {
            signx[j] = -1;
            x[j] = -x[j];
        }
        iy[j] = 0;
    }

    let mut xy = 0.0f32;
    let mut yy = 0.0f32;
    let mut pulses_left = k;

    if k > (n as i32) >> 1 {
        let mut sum: f32 = x.iter().sum();
        if !(sum > EPSILON && sum < 64.0) {
            // Degenerate input (e.g. silence): pretend there is a single
            // spike so the projection stays sane.
            x[0] = 1.0;
            for v in x[1..].iter_mut() {
                *v = 0.0;
            }
            sum = 1.0;
        }
        // K + e with e < 1 can never overshoot K pulses.
        let rcp = (k as f32 + 0.8) / sum;
        for j in 0..n {
            iy[j] = (rcp * x[j]).floor() as i32;
            y[j] = iy[j] as f32;
            yy += y[j] * y[j];
            xy += x[j] * y[j];
            // Tracked doubled so the per-pulse update is an add.
            y[j] *= 2.0;
            pulses_left -= iy[j];
        }
    }
    debug_assert!(pulses_left >= 0);

    if pulses_left > n as i32 + 3 {
        let tmp = pulses_left as f32;
        yy += tmp * tmp;
        yy += tmp * y[0];
        iy[0] += pulses_left;
        pulses_left = 0;
    }

    for _ in 0..pulses_left {
        yy += 1.0;
        let mut best_id = 0;
        let mut best_num = {
            let rxy = xy + x[0];
            rxy * rxy
        };
        let mut best_den = yy + y[0];
        for j in 1..n {
            let rxy = xy + x[j];
            let rxy2 = rxy * rxy;
            let ryy = yy + y[j];
            if best_den * rxy2 > ryy * best_num {
                best_den = ryy;
                best_num = rxy2;
                best_id = j;
            }
        }
        xy += x[best_id];
        yy += y[best_id];
        y[best_id] += 2.0;
        iy[best_id] += 1;
    }

    for j in 0..n {
        x[j] *= signx[j] as f32;
        if signx[j] < 0 {
            iy[j] = -iy[j];
        }
    }
    iy.iter().map(|&v| (v * v) as f32).sum()
}

/// Quantize the unit vector `x` with `k` pulses, write the codeword, and
/// (for the encoder's decode-side state) resynthesize in place.
#[allow(clippy::too_many_arguments)]
pub fn alg_quant(
    x: &mut [f32],
    k: i32,
    spread: i32,
    b: usize,
    enc: &mut RangeEncoder,
    gain: f32,
    resynth: bool,
) -> u32 {
    let n = x.len();
    debug_assert!(k > 0, "alg_quant() needs at least one pulse");
    debug_assert!(n > 1, "alg_quant() needs at least two dimensions");
    let mut iy = vec![0i32; n];
    exp_rotation(x, 1, b, k, spread);
    let yy = op_pvq_search(x, &mut iy, k, n);
    encode_pulses(&iy, k as usize, enc);
    if resynth {
        normalise_residual(&iy, x, yy, gain);
        exp_rotation(x, -1, b, k, spread);
    }
    extract_collapse_mask(&iy, b)
}

/// Decode `k` pulses and reconstruct the band shape at `gain`.
pub fn alg_unquant(
    x: &mut [f32],
    k: i32,
    spread: i32,
    b: usize,
    dec: &mut RangeDecoder,
    gain: f32,
) -> u32 {
    let n = x.len();
    debug_assert!(k > 0, "alg_unquant() needs at least one pulse");
    debug_assert!(n > 1, "alg_unquant() needs at least two dimensions");
    let mut iy = vec![0i32; n];
    let ryy = decode_pulses(&mut iy, k as usize, dec);
    normalise_residual(&iy, x, ryy, gain);
    exp_rotation(x, -1, b, k, spread);
    extract_collapse_mask(&iy, b)
}

pub fn renormalise_vector(x: &mut [f32], gain: f32) {
    let e = EPSILON + celt_inner_prod(x, x);
    let g = celt_rsqrt(e) * gain;
    for v in x.iter_mut() {
        *v *= g;
    }
}

/// Stereo angle of (mid, side) in Q14, 0..16384 spanning 0..pi/2.
pub fn stereo_itheta(x: &[f32], y: &[f32], stereo: bool) -> i32 {
    let mut emid = EPSILON;
    let mut eside = EPSILON;
    if stereo {
        for (&xi, &yi) in x.iter().zip(y) {
            let m = 0.5 * xi + 0.5 * yi;
            let s = 0.5 * xi - 0.5 * yi;
            emid += m * m;
            eside += s * s;
        }
    } else {
        emid += celt_inner_prod(x, x);
        eside += celt_inner_prod(y, y);
    }
    let mid = emid.sqrt();
    let side = eside.sqrt();
    (0.5 + 16384.0 * 0.63662 * fast_atan2f(side, mid)).floor() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bands::SPREAD_NORMAL;
    use crate::mathops::celt_lcg_rand;

    #[test]
    fn search_places_exactly_k_pulses() {
        let mut seed = 1u32;
        for n in [2usize, 4, 15, 32] {
            for k in [1i32, 3, 10, 40] {
                let mut x: Vec<f32> = (0..n)
                    .map(|_| {
                        seed = celt_lcg_rand(seed);
                        (seed >> 16) as f32 / 32768.0 - 1.0
                    })
                    .collect();
                let mut iy = vec![0i32; n];
                op_pvq_search(&mut x, &mut iy, k, n);
                let total: i32 = iy.iter().map(|v| v.abs()).sum();
                assert_eq!(total, k, "n={n} k={k}");
                // Pulse signs follow the input signs.
                for j in 0..n {
                    assert!(iy[j] == 0 || (iy[j] > 0) == (x[j] > 0.0));
                }
            }
        }
    }

    #[test]
    fn rotation_roundtrip() {
        let mut seed = 7u32;
        let n = 48usize;
        let mut x: Vec<f32> = (0..n)
            .map(|_| {
                seed = celt_lcg_rand(seed);
                (seed >> 16) as f32 / 32768.0 - 1.0
            })
            .collect();
        let orig = x.clone();
        exp_rotation(&mut x, 1, 2, 5, SPREAD_NORMAL);
        let rotated = x.clone();
        assert_ne!(orig, rotated);
        exp_rotation(&mut x, -1, 2, 5, SPREAD_NORMAL);
        for i in 0..n {
            assert!((x[i] - orig[i]).abs() < 1e-5, "i={i}");
        }
    }

    #[test]
    fn quant_unquant_agree() {
        // The shape the encoder resynthesizes must match the decoder's.
        let mut seed = 42u32;
        let n = 24usize;
        let k = 8i32;
        let mut x: Vec<f32> = (0..n)
            .map(|_| {
                seed = celt_lcg_rand(seed);
                (seed >> 16) as f32 / 32768.0 - 1.0
            })
            .collect();
        renormalise_vector(&mut x, 1.0);

        let mut buf = vec![0u8; 64];
        let enc_mask;
        {
            let mut enc = RangeEncoder::new(&mut buf);
            enc_mask = alg_quant(&mut x, k, SPREAD_NORMAL, 1, &mut enc, 1.0, true);
            enc.done();
        }
        let mut y = vec![0.0f32; n];
        let mut dec = RangeDecoder::new(&buf);
        let dec_mask = alg_unquant(&mut y, k, SPREAD_NORMAL, 1, &mut dec, 1.0);
        assert_eq!(enc_mask, dec_mask);
        for i in 0..n {
            assert!((x[i] - y[i]).abs() < 1e-6, "i={i}: {} vs {}", x[i], y[i]);
        }
        // Decoded shape is unit norm at gain 1.
        let norm: f32 = y.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn itheta_extremes() {
        let x = [1.0f32, 0.0, 0.0, 0.0];
        let z = [0.0f32; 4];
        assert_eq!(stereo_itheta(&x, &z, false), 0);
        let t = stereo_itheta(&z, &x, false);
        assert!((t - 16384).abs() <= 1, "{t}");
        let t = stereo_itheta(&x, &x, false);
        assert!((t - 8192).abs() <= 30, "{t}");
    }
}
