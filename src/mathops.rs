//! Float helpers with pinned precision.
//!
//! Several of these take a detour through `f64` on purpose: the reference
//! float build evaluates them in double precision, and the quantization
//! decisions downstream are sensitive to the last bit. Keep the detours.

use std::f32::consts::PI;

pub const EPSILON: f32 = 1e-15f32;

const ATAN_A: f32 = 0.43157974f32;
const ATAN_B: f32 = 0.67848403f32;
const ATAN_C: f32 = 0.08595542f32;
const ATAN_E: f32 = PI / 2.0;

/// Integer square root, largest g with g*g <= val.
pub fn isqrt32(mut val: u32) -> u32 {
    if val == 0 {
        return 0;
    }
    let mut g: u32 = 0;
    let mut bshift: i32 = (31 - val.leading_zeros() as i32) >> 1;
    let mut b: u32 = 1u32 << bshift;
    loop {
        let t: u32 = (g << 1).wrapping_add(b) << bshift;
        if t <= val {
            g = g.wrapping_add(b);
            val = val.wrapping_sub(t);
        }
        b >>= 1;
        bshift -= 1;
        if bshift < 0 {
            break;
        }
    }
    g
}

/// Polynomial atan2 approximation, accurate enough for the stereo angle.
#[inline]
pub fn fast_atan2f(y: f32, x: f32) -> f32 {
    let x2 = x * x;
    let y2 = y * y;
    if x2 + y2 < 1e-18f32 {
        return 0.0;
    }
    if x2 < y2 {
        let den = (y2 + ATAN_B * x2) * (y2 + ATAN_C * x2);
        -x * y * (y2 + ATAN_A * x2) / den + if y < 0.0 { -ATAN_E } else { ATAN_E }
    } else {
        let den = (x2 + ATAN_B * y2) * (x2 + ATAN_C * y2);
        x * y * (x2 + ATAN_A * y2) / den + (if y < 0.0 { -ATAN_E } else { ATAN_E })
            - (if x * y < 0.0 { -ATAN_E } else { ATAN_E })
    }
}

/// Largest absolute sample value.
#[inline]
pub fn celt_maxabs16(x: &[f32]) -> f32 {
    let mut maxval: f32 = 0.0;
    let mut minval: f32 = 0.0;
    for &v in x {
        if v > maxval {
            maxval = v;
        }
        if v < minval {
            minval = v;
        }
    }
    if maxval > -minval {
        maxval
    } else {
        -minval
    }
}

#[inline]
pub fn celt_inner_prod(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    let mut xy = 0.0f32;
    for i in 0..x.len() {
        xy += x[i] * y[i];
    }
    xy
}

#[inline]
pub fn celt_sqrt(x: f32) -> f32 {
    (x as f64).sqrt() as f32
}

#[inline]
pub fn celt_rsqrt(x: f32) -> f32 {
    1.0f32 / celt_sqrt(x)
}

/// cos(pi/2 * x) for x in [0, 2].
#[inline]
pub fn celt_cos_norm(x: f32) -> f32 {
    ((0.5f32 * PI * x) as f64).cos() as f32
}

#[inline]
pub fn celt_log2(x: f32) -> f32 {
    (std::f64::consts::LOG2_E * (x as f64).ln()) as f32
}

#[inline]
pub fn celt_exp2(x: f32) -> f32 {
    (std::f64::consts::LN_2 * x as f64).exp() as f32
}

/// The anti-collapse noise generator.
#[inline]
pub fn celt_lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1664525).wrapping_add(1013904223)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isqrt32_exact_on_squares() {
        for g in [0u32, 1, 2, 100, 46340, 65535] {
            assert_eq!(isqrt32(g * g), g);
            if g > 0 {
                assert_eq!(isqrt32(g * g - 1), g - 1);
            }
        }
        assert_eq!(isqrt32(u32::MAX), 65535);
    }

    #[test]
    fn atan2_close_to_std() {
        let mut worst = 0.0f32;
        for i in -20..=20 {
            for j in -20..=20 {
                let (y, x) = (i as f32 * 0.37, j as f32 * 0.59);
                if x == 0.0 && y == 0.0 {
                    continue;
                }
                let err = (fast_atan2f(y, x) - y.atan2(x)).abs();
                worst = worst.max(err);
            }
        }
        assert!(worst < 5e-3, "worst atan2 error {worst}");
    }

    #[test]
    fn log2_exp2_round_trip() {
        for x in [-20.0f32, -3.5, 0.0, 0.25, 7.0, 14.0] {
            assert!((celt_log2(celt_exp2(x)) - x).abs() < 1e-5);
        }
    }
}
