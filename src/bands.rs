//! Band energy computation, normalization, and the PVQ band quantizer.
//!
//! The quantizer walks each band, possibly splitting it in half recursively
//! with an explicitly coded angle between the halves, until the remainder is
//! small enough for a single PVQ codeword. Encoder and decoder run the same
//! control flow; only the direction of symbol transfer differs.

use crate::entcode::{celt_udiv, Coder, BITRES};
use crate::entenc::RangeEncoder;
use crate::mathops::{
    celt_exp2, celt_inner_prod, celt_lcg_rand, celt_rsqrt, celt_sqrt, isqrt32, EPSILON,
};
use crate::modes::CeltMode;
use crate::quant_bands::E_MEANS;
use crate::rate::{bits2pulses, get_pulses, pulses2bits, QTHETA_OFFSET, QTHETA_OFFSET_TWOPHASE};
use crate::vq::{alg_quant, alg_unquant, renormalise_vector, stereo_itheta};

pub const SPREAD_NONE: i32 = 0;
pub const SPREAD_LIGHT: i32 = 1;
pub const SPREAD_NORMAL: i32 = 2;
pub const SPREAD_AGGRESSIVE: i32 = 3;

/// Largest number of MDCT bins a single band can span (8 short blocks of
/// the widest band).
const MAX_BAND_BINS: usize = 176;

/// Shared state threaded through the recursive band quantizer. The range
/// coder is passed separately so this stays `Copy` for the theta-RDO
/// save/restore.
#[derive(Copy, Clone)]
struct BandCtx<'a> {
    encode: bool,
    resynth: bool,
    m: &'a CeltMode,
    band: usize,
    intensity: usize,
    spread: i32,
    tf_change: i32,
    remaining_bits: i32,
    band_e: &'a [f32],
    seed: u32,
    theta_round: i32,
    disable_inv: bool,
    avoid_split_noise: bool,
}

#[derive(Copy, Clone, Default)]
struct SplitCtx {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

/// Pick the first threshold bucket `val` falls into, sticking with `prev`
/// when the move would stay inside the hysteresis margin.
pub fn hysteresis_decision(
    val: f32,
    thresholds: &[f32],
    hysteresis: &[f32],
    prev: usize,
) -> usize {
    let n = thresholds.len();
    let mut i = 0;
    while i < n {
        if val < thresholds[i] {
            break;
        }
        i += 1;
    }
    if i > prev && val < thresholds[prev] + hysteresis[prev] {
        i = prev;
    }
    if i < prev && val > thresholds[prev - 1] - hysteresis[prev - 1] {
        i = prev;
    }
    i
}

/// cos(pi/2 * x/16384) in Q15, evaluated with the exact integer truncations
/// both sides of the stream must agree on.
fn bitexact_cos(x: i16) -> i16 {
    let x2 = ((4096 + x as i32 * x as i32) >> 13) as i16;
    let t1 = (16384 - 626 * x2 as i32) >> 15;
    let t2 = (16384 + x2 as i32 * ((8277 + t1) as i16 as i32)) >> 15;
    let t3 = (16384 + x2 as i32 * ((-7651 + t2) as i16 as i32)) >> 15;
    let r = (32767 - x2 as i32 + t3) as i16;
    (1 + r as i32) as i16
}

/// log2(sin/cos) in Q11 from the two Q15 values, again bit-exact.
fn bitexact_log2tan(mut isin: i32, mut icos: i32) -> i32 {
    let lc = crate::entcode::ec_ilog(icos as u32);
    let ls = crate::entcode::ec_ilog(isin as u32);
    icos <<= 15 - lc;
    isin <<= 15 - ls;
    let frac = |x: i32| (16384 + x * (((16384 - 2597 * x) >> 15) + 7932)) >> 15;
    (ls - lc) * (1 << 11) + frac(isin) - frac(icos)
}

/// Per-band L2 norms of the MDCT coefficients.
pub fn compute_band_energies(
    m: &CeltMode,
    x: &[f32],
    band_e: &mut [f32],
    end: usize,
    channels: usize,
    lm: usize,
) {
    let n = m.short_mdct_size << lm;
    for c in 0..channels {
        for i in 0..end {
            let lo = c * n + ((m.e_bands[i] as usize) << lm);
            let hi = c * n + ((m.e_bands[i + 1] as usize) << lm);
            let sum = 1e-27f32 + celt_inner_prod(&x[lo..hi], &x[lo..hi]);
            band_e[i + c * m.nb_ebands] = celt_sqrt(sum);
        }
    }
}

/// Scale each band to unit norm, producing the shape the PVQ codes.
pub fn normalise_bands(
    m: &CeltMode,
    freq: &[f32],
    x: &mut [f32],
    band_e: &[f32],
    end: usize,
    channels: usize,
    lm: usize,
) {
    let n = m.short_mdct_size << lm;
    for c in 0..channels {
        for i in 0..end {
            let g = 1.0f32 / (1e-27f32 + band_e[i + c * m.nb_ebands]);
            let lo = c * n + ((m.e_bands[i] as usize) << lm);
            let hi = c * n + ((m.e_bands[i + 1] as usize) << lm);
            for (xv, &f) in x[lo..hi].iter_mut().zip(&freq[lo..hi]) {
                *xv = f * g;
            }
        }
    }
}

/// Rebuild MDCT coefficients for one channel from unit-norm shapes and
/// log-domain band energies. Bins above `bound` are cleared, which also
/// implements the spectral fold-down for `downsample` > 1.
pub fn denormalise_bands(
    m: &CeltMode,
    x: &[f32],
    freq: &mut [f32],
    band_log_e: &[f32],
    mut start: usize,
    mut end: usize,
    lm: usize,
    downsample: usize,
    silence: bool,
) {
    let n = m.short_mdct_size << lm;
    let mut bound = (m.e_bands[end] as usize) << lm;
    if downsample != 1 {
        bound = bound.min(n / downsample);
    }
    if silence {
        bound = 0;
        start = 0;
        end = 0;
    }
    let start_bin = (m.e_bands[start] as usize) << lm;
    freq[..start_bin].fill(0.0);
    let mut off = start_bin;
    for i in start..end {
        let band_end = (m.e_bands[i + 1] as usize) << lm;
        let lg = (band_log_e[i] + E_MEANS[i]).min(32.0);
        let g = celt_exp2(lg);
        for (f, &xv) in freq[off..band_end].iter_mut().zip(&x[off..band_end]) {
            *f = xv * g;
        }
        off = band_end;
    }
    freq[bound..n].fill(0.0);
}

/// Replace short blocks that lost all their pulses in a transient frame
/// with low-level noise, so the envelope does not collapse to silence.
#[allow(clippy::too_many_arguments)]
pub fn anti_collapse(
    m: &CeltMode,
    x_: &mut [f32],
    collapse_masks: &[u8],
    lm: usize,
    channels: usize,
    size: usize,
    start: usize,
    end: usize,
    log_e: &[f32],
    prev1_log_e: &[f32],
    prev2_log_e: &[f32],
    pulses: &[i32],
    mut seed: u32,
    encode: bool,
) {
    for i in start..end {
        let n0 = (m.e_bands[i + 1] - m.e_bands[i]) as usize;
        let depth = (celt_udiv((1 + pulses[i]) as u32, n0 as u32) >> lm) as i32;
        let thresh = 0.5f32 * celt_exp2(-0.125f32 * depth as f32);
        let sqrt_1 = celt_rsqrt((n0 << lm) as f32);
        for c in 0..channels {
            let mut prev1 = prev1_log_e[c * m.nb_ebands + i];
            let mut prev2 = prev2_log_e[c * m.nb_ebands + i];
            if !encode && channels == 1 {
                // A mono decode of a stereo stream tracks both channels.
                prev1 = prev1.max(prev1_log_e[m.nb_ebands + i]);
                prev2 = prev2.max(prev2_log_e[m.nb_ebands + i]);
            }
            let e_diff = (log_e[c * m.nb_ebands + i] - prev1.min(prev2)).max(0.0);
            let mut r = 2.0f32 * celt_exp2(-e_diff);
            if lm == 3 {
                r *= std::f32::consts::SQRT_2;
            }
            r = r.min(thresh) * sqrt_1;
            let off = c * size + ((m.e_bands[i] as usize) << lm);
            let len = n0 << lm;
            let band = &mut x_[off..off + len];
            let mut renormalize = false;
            for k in 0..(1usize << lm) {
                if collapse_masks[i * channels + c] as u32 & (1 << k) == 0 {
                    for j in 0..n0 {
                        seed = celt_lcg_rand(seed);
                        band[(j << lm) + k] = if seed & 0x8000 != 0 { r } else { -r };
                    }
                    renormalize = true;
                }
            }
            if renormalize {
                renormalise_vector(band, 1.0);
            }
        }
    }
}

fn compute_channel_weights(ex: f32, ey: f32, w: &mut [f32; 2]) {
    let min_e = ex.min(ey);
    w[0] = ex + min_e / 3.0;
    w[1] = ey + min_e / 3.0;
}

fn intensity_stereo(m: &CeltMode, x: &mut [f32], y: &[f32], band_e: &[f32], band: usize, n: usize) {
    let left = band_e[band];
    let right = band_e[band + m.nb_ebands];
    let norm = EPSILON + celt_sqrt(1e-15f32 + left * left + right * right);
    let a1 = left / norm;
    let a2 = right / norm;
    for (xv, &r) in x[..n].iter_mut().zip(&y[..n]) {
        let l = *xv;
        *xv = a1 * l + a2 * r;
    }
}

fn stereo_split(x: &mut [f32], y: &mut [f32], n: usize) {
    for (xv, yv) in x[..n].iter_mut().zip(y[..n].iter_mut()) {
        let l = std::f32::consts::FRAC_1_SQRT_2 * *xv;
        let r = std::f32::consts::FRAC_1_SQRT_2 * *yv;
        *xv = l + r;
        *yv = r - l;
    }
}

fn dual_inner_prod(x: &[f32], y1: &[f32], y2: &[f32]) -> (f32, f32) {
    let mut xy1 = 0.0f32;
    let mut xy2 = 0.0f32;
    for i in 0..x.len() {
        xy1 += x[i] * y1[i];
        xy2 += x[i] * y2[i];
    }
    (xy1, xy2)
}

fn stereo_merge(x: &mut [f32], y: &mut [f32], mid: f32, n: usize) {
    let (xp, side) = dual_inner_prod(&y[..n], &x[..n], &y[..n]);
    // mid and side are in the [-1, 1] range
    let xp = mid * xp;
    let el = mid * mid + side - 2.0 * xp;
    let er = mid * mid + side + 2.0 * xp;
    if er < 6e-4f32 || el < 6e-4f32 {
        y[..n].copy_from_slice(&x[..n]);
        return;
    }
    let lgain = celt_rsqrt(el);
    let rgain = celt_rsqrt(er);
    for (xv, yv) in x[..n].iter_mut().zip(y[..n].iter_mut()) {
        let l = mid * *xv;
        let r = *yv;
        *xv = lgain * (l - r);
        *yv = rgain * (l + r);
    }
}

/// Decide how much spreading rotation the pulse coding should apply, from
/// how concentrated the normalized spectrum is. Also drives the postfilter
/// tapset on the encoder when `update_hf` is set.
#[allow(clippy::too_many_arguments)]
pub fn spreading_decision(
    m: &CeltMode,
    x: &[f32],
    average: &mut i32,
    last_decision: i32,
    hf_average: &mut i32,
    tapset_decision: &mut i32,
    update_hf: bool,
    end: usize,
    channels: usize,
    lm: usize,
    spread_weight: &[i32],
) -> i32 {
    let mut sum = 0i32;
    let mut nb_bands = 0i32;
    let mut hf_sum = 0i32;
    debug_assert!(end > 0);
    let n0 = m.short_mdct_size << lm;
    if ((m.e_bands[end] - m.e_bands[end - 1]) as usize) << lm <= 8 {
        return SPREAD_NONE;
    }
    for c in 0..channels {
        for i in 0..end {
            let n = ((m.e_bands[i + 1] - m.e_bands[i]) as usize) << lm;
            if n <= 8 {
                continue;
            }
            let off = ((m.e_bands[i] as usize) << lm) + c * n0;
            let mut tcount = [0i32; 3];
            for &xv in &x[off..off + n] {
                let x2n = xv * xv * n as f32;
                if x2n < 0.25 {
                    tcount[0] += 1;
                }
                if x2n < 0.0625 {
                    tcount[1] += 1;
                }
                if x2n < 0.015625 {
                    tcount[2] += 1;
                }
            }
            if i > m.nb_ebands - 4 {
                hf_sum += celt_udiv((32 * (tcount[1] + tcount[0])) as u32, n as u32) as i32;
            }
            let tmp = (2 * tcount[2] >= n as i32) as i32
                + (2 * tcount[1] >= n as i32) as i32
                + (2 * tcount[0] >= n as i32) as i32;
            sum += tmp * spread_weight[i];
            nb_bands += spread_weight[i];
        }
    }
    if update_hf {
        if hf_sum != 0 {
            hf_sum = celt_udiv(
                hf_sum as u32,
                (channels * (4 - m.nb_ebands + end)) as u32,
            ) as i32;
        }
        *hf_average = (*hf_average + hf_sum) >> 1;
        hf_sum = *hf_average;
        if *tapset_decision == 2 {
            hf_sum += 4;
        } else if *tapset_decision == 0 {
            hf_sum -= 4;
        }
        if hf_sum > 22 {
            *tapset_decision = 2;
        } else if hf_sum > 18 {
            *tapset_decision = 1;
        } else {
            *tapset_decision = 0;
        }
    }
    debug_assert!(nb_bands > 0);
    sum = celt_udiv((sum << 8) as u32, nb_bands as u32) as i32;
    sum = (sum + *average) >> 1;
    *average = sum;
    sum = (3 * sum + (((3 - last_decision) << 7) + 64) + 2) >> 2;
    if sum < 80 {
        SPREAD_AGGRESSIVE
    } else if sum < 256 {
        SPREAD_NORMAL
    } else if sum < 384 {
        SPREAD_LIGHT
    } else {
        SPREAD_NONE
    }
}

/// Scatter order for the Hadamard interleave at each stride.
static ORDERY_TABLE: [usize; 30] = [
    1, 0, 3, 0, 2, 1, 7, 0, 4, 3, 6, 1, 5, 2, 15, 0, 8, 7, 12, 3, 11, 4, 14, 1, 9, 6, 13, 2, 10, 5,
];

fn deinterleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = [0.0f32; MAX_BAND_BINS];
    debug_assert!(stride > 0 && n <= MAX_BAND_BINS);
    let tmp = &mut tmp[..n];
    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..];
        for i in 0..stride {
            for j in 0..n0 {
                tmp[ordery[i] * n0 + j] = x[j * stride + i];
            }
        }
    } else {
        for i in 0..stride {
            for j in 0..n0 {
                tmp[i * n0 + j] = x[j * stride + i];
            }
        }
    }
    x[..n].copy_from_slice(tmp);
}

fn interleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = [0.0f32; MAX_BAND_BINS];
    let tmp = &mut tmp[..n];
    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..];
        for i in 0..stride {
            for j in 0..n0 {
                tmp[j * stride + i] = x[ordery[i] * n0 + j];
            }
        }
    } else {
        for i in 0..stride {
            for j in 0..n0 {
                tmp[j * stride + i] = x[i * n0 + j];
            }
        }
    }
    x[..n].copy_from_slice(tmp);
}

/// One level of the Haar transform across `stride`-interleaved pairs.
pub fn haar1(x: &mut [f32], n0: usize, stride: usize) {
    let half = n0 >> 1;
    for i in 0..stride {
        for j in 0..half {
            let idx0 = stride * 2 * j + i;
            let idx1 = stride * (2 * j + 1) + i;
            let tmp1 = std::f32::consts::FRAC_1_SQRT_2 * x[idx0];
            let tmp2 = std::f32::consts::FRAC_1_SQRT_2 * x[idx1];
            x[idx0] = tmp1 + tmp2;
            x[idx1] = tmp1 - tmp2;
        }
    }
}

/// Resolution of the angle quantizer for a split of size 2*N with `b`
/// eighth-bits available. Always even, at most 256.
fn compute_qn(n: i32, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    const EXP2_TABLE8: [i16; 8] = [16384, 17866, 19483, 21247, 23170, 25267, 27554, 30048];
    let mut n2 = 2 * n - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }
    let mut qb = (b + n2 * offset) / n2;
    qb = qb.min(b - pulse_cap - (4 << BITRES));
    qb = qb.min(8 << BITRES);
    if qb < (1 << BITRES) >> 1 {
        1
    } else {
        let raw = EXP2_TABLE8[(qb & 0x7) as usize] as i32 >> (14 - (qb >> BITRES));
        let qn = ((raw + 1) >> 1) << 1;
        debug_assert!(qn <= 256);
        qn
    }
}

/// Quantize (or decode) the mid/side angle of a band split and derive the
/// bit imbalance `delta` between the two halves.
#[allow(clippy::too_many_arguments)]
fn compute_theta(
    ctx: &mut BandCtx,
    sctx: &mut SplitCtx,
    x: &mut [f32],
    y: &mut [f32],
    n: i32,
    b: &mut i32,
    blocks: i32,
    blocks0: i32,
    lm: i32,
    stereo: bool,
    fill: &mut i32,
    coder: &mut Coder,
) {
    let encode = ctx.encode;
    let m = ctx.m;
    let band = ctx.band;
    let nn = n as usize;
    let pulse_cap = m.log_n[band] as i32 + lm * (1 << BITRES);
    let offset = (pulse_cap >> 1)
        - if stereo && n == 2 {
            QTHETA_OFFSET_TWOPHASE
        } else {
            QTHETA_OFFSET
        };
    let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);
    if stereo && band >= ctx.intensity {
        qn = 1;
    }
    let mut itheta = if encode {
        stereo_itheta(&x[..nn], &y[..nn], stereo)
    } else {
        0
    };
    let tell = coder.tell_frac() as i32;
    let mut inv = false;
    let imid;
    let iside;
    if qn != 1 {
        if encode {
            if !stereo || ctx.theta_round == 0 {
                itheta = (itheta * qn + 8192) >> 14;
                if !stereo && ctx.avoid_split_noise && itheta > 0 && itheta < qn {
                    // A transient mono split should not land strictly inside
                    // (0, qn): folding noise across the split is worse than
                    // rounding the angle to an endpoint.
                    let unquantized = celt_udiv((itheta * 16384) as u32, qn as u32) as i32;
                    let imid_t = bitexact_cos(unquantized as i16) as i32;
                    let iside_t = bitexact_cos((16384 - unquantized) as i16) as i32;
                    let delta = (16384 + ((n - 1) << 7) * bitexact_log2tan(iside_t, imid_t)) >> 15;
                    if delta > *b {
                        itheta = qn;
                    } else if delta < -*b {
                        itheta = 0;
                    }
                }
            } else {
                // RDO trial: force the rounding direction.
                let bias = if itheta > 8192 { 32767 / qn } else { -32767 / qn };
                let down = (((itheta * qn + bias) >> 14).max(0)).min(qn - 1);
                itheta = if ctx.theta_round < 0 { down } else { down + 1 };
            }
        }
        if stereo && n > 2 {
            // Small-footprint stepped pdf favoring angles near zero.
            const P0: i32 = 3;
            let x0 = qn / 2;
            let ft = P0 * (x0 + 1) + x0;
            let interval = |v: i32| {
                if v <= x0 {
                    (P0 * v, P0 * (v + 1))
                } else {
                    (v - 1 - x0 + (x0 + 1) * P0, v - x0 + (x0 + 1) * P0)
                }
            };
            match coder {
                Coder::Encode(enc) => {
                    let (fl, fh) = interval(itheta);
                    enc.encode(fl as u32, fh as u32, ft as u32);
                }
                Coder::Decode(dec) => {
                    let fs = dec.decode(ft as u32) as i32;
                    let v = if fs < (x0 + 1) * P0 {
                        fs / P0
                    } else {
                        x0 + 1 + (fs - (x0 + 1) * P0)
                    };
                    let (fl, fh) = interval(v);
                    dec.dec_update(fl as u32, fh as u32, ft as u32);
                    itheta = v;
                }
            }
        } else if blocks0 > 1 || stereo {
            match coder {
                Coder::Encode(enc) => enc.enc_uint(itheta as u32, (qn + 1) as u32),
                Coder::Decode(dec) => itheta = dec.dec_uint((qn + 1) as u32) as i32,
            }
        } else {
            // Long mono blocks: triangular pdf peaked at qn/2.
            let ft = ((qn >> 1) + 1) * ((qn >> 1) + 1);
            match coder {
                Coder::Encode(enc) => {
                    let (fl, fs) = if itheta <= qn >> 1 {
                        ((itheta * (itheta + 1)) >> 1, itheta + 1)
                    } else {
                        (
                            ft - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1),
                            qn + 1 - itheta,
                        )
                    };
                    enc.encode(fl as u32, (fl + fs) as u32, ft as u32);
                }
                Coder::Decode(dec) => {
                    let fm = dec.decode(ft as u32) as i32;
                    let (fl, fs);
                    if fm < ((qn >> 1) * ((qn >> 1) + 1)) >> 1 {
                        itheta = ((isqrt32(8 * fm as u32 + 1) - 1) >> 1) as i32;
                        fs = itheta + 1;
                        fl = (itheta * (itheta + 1)) >> 1;
                    } else {
                        itheta = ((((2 * (qn + 1)) as u32)
                            .wrapping_sub(isqrt32(8 * (ft - fm - 1) as u32 + 1)))
                            >> 1) as i32;
                        fs = qn + 1 - itheta;
                        fl = ft - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1);
                    }
                    dec.dec_update(fl as u32, (fl + fs) as u32, ft as u32);
                }
            }
        }
        debug_assert!(itheta >= 0);
        itheta = celt_udiv((itheta * 16384) as u32, qn as u32) as i32;
        if encode && stereo {
            if itheta == 0 {
                intensity_stereo(m, x, y, ctx.band_e, band, nn);
            } else {
                stereo_split(x, y, nn);
            }
        }
    } else if stereo {
        // Intensity band: only a possible side inversion is coded.
        if encode {
            inv = itheta > 8192 && !ctx.disable_inv;
            if inv {
                for yv in &mut y[..nn] {
                    *yv = -*yv;
                }
            }
            intensity_stereo(m, x, y, ctx.band_e, band, nn);
        }
        if *b > 2 << BITRES && ctx.remaining_bits > 2 << BITRES {
            match coder {
                Coder::Encode(enc) => enc.enc_bit_logp(inv as i32, 2),
                Coder::Decode(dec) => inv = dec.dec_bit_logp(2) != 0,
            }
        } else {
            inv = false;
        }
        if ctx.disable_inv {
            inv = false;
        }
        itheta = 0;
    }
    let qalloc = coder.tell_frac() as i32 - tell;
    *b -= qalloc;
    if itheta == 0 {
        imid = 32767;
        iside = 0;
        *fill &= (1 << blocks) - 1;
        sctx.delta = -16384;
    } else if itheta == 16384 {
        imid = 0;
        iside = 32767;
        *fill &= ((1 << blocks) - 1) << blocks;
        sctx.delta = 16384;
    } else {
        imid = bitexact_cos(itheta as i16) as i32;
        iside = bitexact_cos((16384 - itheta) as i16) as i32;
        sctx.delta = (16384 + ((n - 1) << 7) * bitexact_log2tan(iside, imid)) >> 15;
    }
    sctx.inv = inv;
    sctx.imid = imid;
    sctx.iside = iside;
    sctx.itheta = itheta;
    sctx.qalloc = qalloc;
}

/// A one-bin band carries only a sign per channel.
fn quant_band_n1(
    ctx: &mut BandCtx,
    x: &mut [f32],
    y: Option<&mut [f32]>,
    lowband_out: Option<&mut [f32]>,
    coder: &mut Coder,
) -> u32 {
    let encode = ctx.encode;
    {
        let mut sign = 0i32;
        if ctx.remaining_bits >= 1 << BITRES {
            match coder {
                Coder::Encode(enc) => {
                    if encode {
                        sign = (x[0] < 0.0) as i32;
                        enc.enc_bits(sign as u32, 1);
                    }
                }
                Coder::Decode(dec) => sign = dec.dec_bits(1) as i32,
            }
            ctx.remaining_bits -= 1 << BITRES;
        }
        if ctx.resynth {
            x[0] = if sign != 0 { -1.0 } else { 1.0 };
        }
    }
    if let Some(y) = y {
        let mut sign = 0i32;
        if ctx.remaining_bits >= 1 << BITRES {
            match coder {
                Coder::Encode(enc) => {
                    sign = (y[0] < 0.0) as i32;
                    enc.enc_bits(sign as u32, 1);
                }
                Coder::Decode(dec) => sign = dec.dec_bits(1) as i32,
            }
            ctx.remaining_bits -= 1 << BITRES;
        }
        if ctx.resynth {
            y[0] = if sign != 0 { -1.0 } else { 1.0 };
        }
    }
    if let Some(lbo) = lowband_out {
        lbo[0] = x[0];
    }
    1
}

/// Code one partition of a band, recursing into mid/side halves while the
/// bit budget justifies a split.
#[allow(clippy::too_many_arguments)]
fn quant_partition(
    ctx: &mut BandCtx,
    x: &mut [f32],
    mut n: i32,
    mut b: i32,
    mut blocks: i32,
    lowband: Option<&[f32]>,
    mut lm: i32,
    gain: f32,
    mut fill: i32,
    coder: &mut Coder,
) -> u32 {
    let blocks0 = blocks;
    let mut cm: u32;
    let m = ctx.m;
    let band = ctx.band;
    let cache_off = m.cache.index[(lm + 1) as usize * m.nb_ebands + band] as usize;
    let cache = &m.cache.bits[cache_off..];
    if lm != -1 && b > cache[cache[0] as usize] as i32 + 12 && n > 2 {
        let mut sctx = SplitCtx::default();
        n >>= 1;
        let half = n as usize;
        lm -= 1;
        if blocks == 1 {
            fill = (fill & 1) | (fill << 1);
        }
        blocks = (blocks + 1) >> 1;
        {
            let (x_lo, x_hi) = x.split_at_mut(half);
            compute_theta(
                ctx,
                &mut sctx,
                x_lo,
                &mut x_hi[..half],
                n,
                &mut b,
                blocks,
                blocks0,
                lm,
                false,
                &mut fill,
                coder,
            );
        }
        let itheta = sctx.itheta;
        let mut delta = sctx.delta;
        let mid = sctx.imid as f32 / 32768.0;
        let side = sctx.iside as f32 / 32768.0;
        if blocks0 > 1 && itheta & 0x3fff != 0 {
            // Short blocks fold across the split, which biases the optimal
            // bit division toward the mid.
            if itheta > 8192 {
                delta -= delta >> (4 - lm);
            } else {
                delta = (delta + (n << BITRES >> (5 - lm))).min(0);
            }
        }
        let mut mbits = ((b - delta) / 2).min(b).max(0);
        let mut sbits = b - mbits;
        ctx.remaining_bits -= sctx.qalloc;
        let next_lowband2 = lowband.map(|lb| &lb[half..]);
        let mut rebalance = ctx.remaining_bits;
        if mbits >= sbits {
            let (x_lo, x_hi) = x.split_at_mut(half);
            cm = quant_partition(
                ctx, x_lo, n, mbits, blocks, lowband, lm, gain * mid, fill, coder,
            );
            rebalance = mbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }
            cm |= quant_partition(
                ctx,
                &mut x_hi[..half],
                n,
                sbits,
                blocks,
                next_lowband2,
                lm,
                gain * side,
                fill >> blocks,
                coder,
            ) << (blocks0 >> 1);
        } else {
            let (x_lo, x_hi) = x.split_at_mut(half);
            cm = quant_partition(
                ctx,
                &mut x_hi[..half],
                n,
                sbits,
                blocks,
                next_lowband2,
                lm,
                gain * side,
                fill >> blocks,
                coder,
            ) << (blocks0 >> 1);
            rebalance = sbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }
            cm |= quant_partition(
                ctx, x_lo, n, mbits, blocks, lowband, lm, gain * mid, fill, coder,
            );
        }
    } else {
        // Leaf: downgrade the pseudo-pulse count until it fits the budget.
        let nn = n as usize;
        let q = {
            let mut q = bits2pulses(m, band, lm, b);
            let mut curr_bits = pulses2bits(m, band, lm, q);
            ctx.remaining_bits -= curr_bits;
            while ctx.remaining_bits < 0 && q > 0 {
                ctx.remaining_bits += curr_bits;
                q -= 1;
                curr_bits = pulses2bits(m, band, lm, q);
                ctx.remaining_bits -= curr_bits;
            }
            q
        };
        if q != 0 {
            let k = get_pulses(q);
            cm = match coder {
                Coder::Encode(enc) => alg_quant(
                    &mut x[..nn],
                    k,
                    ctx.spread,
                    blocks as usize,
                    enc,
                    gain,
                    ctx.resynth,
                ),
                Coder::Decode(dec) => {
                    alg_unquant(&mut x[..nn], k, ctx.spread, blocks as usize, dec, gain)
                }
            };
        } else {
            // No pulses: fold the lower band plus dither, or fill with
            // noise when there is nothing to fold.
            cm = 0;
            if ctx.resynth {
                let cm_mask = (1u32 << blocks) - 1;
                fill &= cm_mask as i32;
                if fill == 0 {
                    x[..nn].fill(0.0);
                } else {
                    match lowband {
                        Some(lb) => {
                            for (xv, &l) in x[..nn].iter_mut().zip(&lb[..nn]) {
                                ctx.seed = celt_lcg_rand(ctx.seed);
                                let dither = if ctx.seed & 0x8000 != 0 {
                                    1.0 / 256.0
                                } else {
                                    -1.0 / 256.0
                                };
                                *xv = l + dither;
                            }
                            cm = fill as u32;
                        }
                        None => {
                            for xv in &mut x[..nn] {
                                ctx.seed = celt_lcg_rand(ctx.seed);
                                *xv = ((ctx.seed as i32) >> 20) as f32;
                            }
                            cm = cm_mask;
                        }
                    }
                    renormalise_vector(&mut x[..nn], gain);
                }
            }
        }
    }
    cm
}

const BIT_INTERLEAVE_TABLE: [u8; 16] = [0, 1, 1, 1, 2, 3, 3, 3, 2, 3, 3, 3, 2, 3, 3, 3];

const BIT_DEINTERLEAVE_TABLE: [u8; 16] = [
    0x00, 0x03, 0x0c, 0x0f, 0x30, 0x33, 0x3c, 0x3f, 0xc0, 0xc3, 0xcc, 0xcf, 0xf0, 0xf3, 0xfc, 0xff,
];

/// Code one band of one channel: undo the per-band time/frequency changes,
/// run the partition quantizer, and redo them on the reconstruction.
#[allow(clippy::too_many_arguments)]
fn quant_band(
    ctx: &mut BandCtx,
    x: &mut [f32],
    n: i32,
    b: i32,
    mut blocks: i32,
    lowband: Option<&mut [f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    gain: f32,
    lowband_scratch: Option<&mut [f32]>,
    mut fill: i32,
    coder: &mut Coder,
) -> u32 {
    let n0 = n;
    let mut n_b = celt_udiv(n as u32, blocks as u32) as i32;
    let mut blocks0 = blocks;
    let mut time_divide = 0i32;
    let mut recombine = 0i32;
    let long_blocks = blocks0 == 1;
    let encode = ctx.encode;
    let mut tf_change = ctx.tf_change;
    if n == 1 {
        return quant_band_n1(ctx, &mut x[..1], None, lowband_out, coder);
    }
    let nn = n as usize;
    if tf_change > 0 {
        recombine = tf_change;
    }
    // The lowband needs the same transforms as the band itself; copy it to
    // scratch first so the folding source in `norm` stays untouched.
    let needs_transform = recombine != 0 || (n_b & 1 == 0 && tf_change < 0) || blocks0 > 1;
    let mut lb_work: Option<&mut [f32]> = match (lowband, lowband_scratch) {
        (Some(lb), Some(scratch)) if needs_transform => {
            scratch[..nn].copy_from_slice(&lb[..nn]);
            Some(scratch)
        }
        (lb, _) => lb,
    };

    for k in 0..recombine {
        if encode {
            haar1(&mut x[..nn], (n0 >> k) as usize, 1usize << k);
        }
        if let Some(lb) = lb_work.as_deref_mut() {
            haar1(&mut lb[..nn], (n0 >> k) as usize, 1usize << k);
        }
        fill = BIT_INTERLEAVE_TABLE[(fill & 0xf) as usize] as i32
            | (BIT_INTERLEAVE_TABLE[(fill >> 4) as usize] as i32) << 2;
    }
    blocks >>= recombine;
    n_b <<= recombine;
    while n_b & 1 == 0 && tf_change < 0 {
        if encode {
            haar1(&mut x[..nn], n_b as usize, blocks as usize);
        }
        if let Some(lb) = lb_work.as_deref_mut() {
            haar1(&mut lb[..nn], n_b as usize, blocks as usize);
        }
        fill |= fill << blocks;
        blocks <<= 1;
        n_b >>= 1;
        time_divide += 1;
        tf_change += 1;
    }
    blocks0 = blocks;
    let n_b0 = n_b;
    if blocks0 > 1 {
        if encode {
            deinterleave_hadamard(
                &mut x[..nn],
                (n_b >> recombine) as usize,
                (blocks0 << recombine) as usize,
                long_blocks,
            );
        }
        if let Some(lb) = lb_work.as_deref_mut() {
            deinterleave_hadamard(
                &mut lb[..nn],
                (n_b >> recombine) as usize,
                (blocks0 << recombine) as usize,
                long_blocks,
            );
        }
    }
    let mut cm = {
        let lb_ref: Option<&[f32]> = lb_work.as_deref();
        quant_partition(ctx, x, n, b, blocks, lb_ref, lm, gain, fill, coder)
    };
    if ctx.resynth {
        if blocks0 > 1 {
            interleave_hadamard(
                &mut x[..nn],
                (n_b >> recombine) as usize,
                (blocks0 << recombine) as usize,
                long_blocks,
            );
        }
        let mut n_b = n_b0;
        let mut blocks = blocks0;
        for _ in 0..time_divide {
            blocks >>= 1;
            n_b <<= 1;
            cm |= cm >> blocks;
            haar1(&mut x[..nn], n_b as usize, blocks as usize);
        }
        for k in 0..recombine {
            cm = BIT_DEINTERLEAVE_TABLE[cm as usize] as u32;
            haar1(&mut x[..nn], (n0 >> k) as usize, 1usize << k);
        }
        blocks <<= recombine;
        if let Some(lbo) = lowband_out {
            let s = celt_sqrt(n0 as f32);
            for j in 0..nn {
                lbo[j] = s * x[j];
            }
        }
        cm &= (1u32 << blocks) - 1;
    }
    cm
}

/// Code one band of a jointly-coded stereo pair.
#[allow(clippy::too_many_arguments)]
fn quant_band_stereo(
    ctx: &mut BandCtx,
    x: &mut [f32],
    y: &mut [f32],
    n: i32,
    mut b: i32,
    blocks: i32,
    lowband: Option<&mut [f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    lowband_scratch: Option<&mut [f32]>,
    mut fill: i32,
    coder: &mut Coder,
) -> u32 {
    let orig_fill = fill;
    let encode = ctx.encode;
    if n == 1 {
        let (x0, y0) = (&mut x[..1], &mut y[..1]);
        return quant_band_n1(ctx, x0, Some(y0), lowband_out, coder);
    }
    let nn = n as usize;
    const MIN_STEREO_ENERGY: f32 = 1e-10;
    if encode {
        // A nearly-silent channel would make the angle numerically useless.
        let e_left = ctx.band_e[ctx.band];
        let e_right = ctx.band_e[ctx.m.nb_ebands + ctx.band];
        if e_left < MIN_STEREO_ENERGY || e_right < MIN_STEREO_ENERGY {
            if e_left > e_right {
                y[..nn].copy_from_slice(&x[..nn]);
            } else {
                x[..nn].copy_from_slice(&y[..nn]);
            }
        }
    }
    let mut sctx = SplitCtx::default();
    compute_theta(
        ctx,
        &mut sctx,
        &mut x[..nn],
        &mut y[..nn],
        n,
        &mut b,
        blocks,
        blocks,
        lm,
        true,
        &mut fill,
        coder,
    );
    let SplitCtx {
        inv,
        imid,
        iside,
        delta,
        itheta,
        qalloc,
    } = sctx;
    let mid = imid as f32 / 32768.0;
    let side = iside as f32 / 32768.0;
    let mut cm: u32;
    if n == 2 {
        // Two bins: the side is fully determined by the mid and one sign.
        let mut sign = 0i32;
        let mut mbits = b;
        let mut sbits = 0i32;
        if itheta != 0 && itheta != 16384 {
            sbits = 1 << BITRES;
        }
        mbits -= sbits;
        let c = itheta > 8192;
        ctx.remaining_bits -= qalloc + sbits;
        if sbits != 0 {
            match coder {
                Coder::Encode(enc) => {
                    sign = if c {
                        (y[0] * x[1] - y[1] * x[0] < 0.0) as i32
                    } else {
                        (x[0] * y[1] - x[1] * y[0] < 0.0) as i32
                    };
                    enc.enc_bits(sign as u32, 1);
                }
                Coder::Decode(dec) => sign = dec.dec_bits(1) as i32,
            }
        }
        let sign = (1 - 2 * sign) as f32;
        // orig_fill: fold the side even when itheta cleared fill's low bits.
        if c {
            cm = quant_band(
                ctx,
                y,
                n,
                mbits,
                blocks,
                lowband,
                lm,
                lowband_out,
                1.0,
                lowband_scratch,
                orig_fill,
                coder,
            );
            x[0] = -sign * y[1];
            x[1] = sign * y[0];
        } else {
            cm = quant_band(
                ctx,
                x,
                n,
                mbits,
                blocks,
                lowband,
                lm,
                lowband_out,
                1.0,
                lowband_scratch,
                orig_fill,
                coder,
            );
            y[0] = -sign * x[1];
            y[1] = sign * x[0];
        }
        if ctx.resynth {
            x[0] *= mid;
            x[1] *= mid;
            y[0] *= side;
            y[1] *= side;
            let tmp = x[0];
            x[0] = tmp - y[0];
            y[0] += tmp;
            let tmp = x[1];
            x[1] = tmp - y[1];
            y[1] += tmp;
        }
    } else {
        let mut mbits = ((b - delta) / 2).min(b).max(0);
        let mut sbits = b - mbits;
        ctx.remaining_bits -= qalloc;
        let mut rebalance = ctx.remaining_bits;
        if mbits >= sbits {
            cm = quant_band(
                ctx,
                x,
                n,
                mbits,
                blocks,
                lowband,
                lm,
                lowband_out,
                1.0,
                lowband_scratch,
                fill,
                coder,
            );
            rebalance = mbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }
            cm |= quant_band(
                ctx,
                y,
                n,
                sbits,
                blocks,
                None,
                lm,
                None,
                side,
                None,
                fill >> blocks,
                coder,
            );
        } else {
            cm = quant_band(
                ctx,
                y,
                n,
                sbits,
                blocks,
                None,
                lm,
                None,
                side,
                None,
                fill >> blocks,
                coder,
            );
            rebalance = sbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }
            cm |= quant_band(
                ctx,
                x,
                n,
                mbits,
                blocks,
                lowband,
                lm,
                lowband_out,
                1.0,
                lowband_scratch,
                fill,
                coder,
            );
        }
    }
    if ctx.resynth {
        if n != 2 {
            stereo_merge(&mut x[..nn], &mut y[..nn], mid, nn);
        }
        if inv {
            for yv in &mut y[..nn] {
                *yv = -*yv;
            }
        }
    }
    cm
}

/// The second band can be wider than the first; extend the folding source
/// with the samples right before the first band's end.
fn special_hybrid_folding(
    m: &CeltMode,
    norm: &mut [f32],
    norm2: &mut [f32],
    start: usize,
    lm: usize,
    dual_stereo: i32,
) {
    let e_bands = m.e_bands;
    let n1 = ((e_bands[start + 1] - e_bands[start]) as usize) << lm;
    let n2 = ((e_bands[start + 2] - e_bands[start + 1]) as usize) << lm;
    norm.copy_within(2 * n1 - n2..n1, n1);
    if dual_stereo != 0 {
        norm2.copy_within(2 * n1 - n2..n1, n1);
    }
}

/// Quantize or decode all bands of a frame.
///
/// `x_` and `y_` hold one channel each of unit-norm band shapes. On the
/// decoder (and on the encoder when the theta RDO needs resynthesis) the
/// reconstructed shapes are written back in place, and the running `norm`
/// buffer of decoded content serves as the folding source for bands that
/// run out of pulses.
#[allow(clippy::too_many_arguments)]
pub fn quant_all_bands(
    m: &CeltMode,
    start: usize,
    end: usize,
    x_: &mut [f32],
    mut y_: Option<&mut [f32]>,
    collapse_masks: &mut [u8],
    band_e: &[f32],
    pulses: &[i32],
    short_blocks: bool,
    spread: i32,
    mut dual_stereo: i32,
    intensity: usize,
    tf_res: &[i32],
    total_bits: i32,
    mut balance: i32,
    coder: &mut Coder,
    lm: usize,
    coded_bands: usize,
    seed: &mut u32,
    complexity: i32,
    disable_inv: bool,
) {
    let e_bands = m.e_bands;
    debug_assert!(end <= m.nb_ebands);
    let mut lowband_offset = 0usize;
    let mut update_lowband = true;
    let channels = if y_.is_some() { 2 } else { 1 };
    let norm_offset = (e_bands[start] as usize) << lm;
    let encode = coder.is_encoder();
    let theta_rdo = encode && y_.is_some() && dual_stereo == 0 && complexity >= 8;
    let resynth = !encode || theta_rdo;
    let b_blocks: i32 = if short_blocks { 1 << lm } else { 1 };
    let norm_size = ((e_bands[m.nb_ebands - 1] as usize) << lm) - norm_offset;
    let mut norm = vec![0.0f32; (channels * norm_size).max(2 * MAX_BAND_BINS)];

    // Resynthesis on the encoder needs its own scratch; the decoder borrows
    // the not-yet-decoded tail of the coefficient buffer instead.
    let use_alloc_scratch = encode && resynth;
    let mut alloc_scratch = [0.0f32; MAX_BAND_BINS];
    let decode_scratch_off = (e_bands[m.eff_ebands - 1] as usize) << lm;

    // Theta-RDO trial state.
    let mut x_save = [0.0f32; MAX_BAND_BINS];
    let mut y_save = [0.0f32; MAX_BAND_BINS];
    let mut x_save2 = [0.0f32; MAX_BAND_BINS];
    let mut y_save2 = [0.0f32; MAX_BAND_BINS];
    let mut norm_save2 = [0.0f32; MAX_BAND_BINS];

    let mut ctx = BandCtx {
        encode,
        resynth,
        m,
        band: 0,
        intensity,
        spread,
        tf_change: 0,
        remaining_bits: 0,
        band_e,
        seed: *seed,
        theta_round: 0,
        disable_inv,
        avoid_split_noise: b_blocks > 1,
    };

    for i in start..end {
        ctx.band = i;
        let last = i == end - 1;
        let band_start = (e_bands[i] as usize) << lm;
        let n = (((e_bands[i + 1] - e_bands[i]) as usize) << lm) as i32;
        let nn = n as usize;
        let tell = coder.tell_frac() as i32;
        if i != start {
            balance -= tell;
        }
        let remaining_bits = total_bits - tell - 1;
        ctx.remaining_bits = remaining_bits;
        let b: i32 = if i < coded_bands {
            let curr_balance = balance / 3.min(coded_bands - i) as i32;
            ((remaining_bits + 1).min(pulses[i] + curr_balance)).clamp(0, 16383)
        } else {
            0
        };
        if resynth
            && ((((e_bands[i] as usize) << lm) as i32 - n >= ((e_bands[start] as usize) << lm) as i32)
                || i == start + 1)
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = i;
        }
        if i == start + 1 {
            let (norm1, norm2) = norm.split_at_mut(norm_size);
            special_hybrid_folding(m, norm1, norm2, start, lm, dual_stereo);
        }
        let tf_change = tf_res[i];
        ctx.tf_change = tf_change;

        let use_norm_xy = i >= m.eff_ebands;
        let have_scratch = !use_norm_xy && (!last || theta_rdo);

        let mut effective_lowband: Option<usize> = None;
        let mut x_cm: u32;
        let mut y_cm: u32;
        if lowband_offset != 0 && (spread != SPREAD_AGGRESSIVE || b_blocks > 1 || tf_change < 0) {
            let base = (e_bands[lowband_offset] as usize) << lm;
            let eff = (base - norm_offset).saturating_sub(nn);
            effective_lowband = Some(eff);
            let mut fold_start = lowband_offset;
            loop {
                fold_start -= 1;
                if (e_bands[fold_start] as usize) << lm <= eff + norm_offset {
                    break;
                }
            }
            let mut fold_end = lowband_offset - 1;
            loop {
                fold_end += 1;
                if !(fold_end < i && ((e_bands[fold_end] as usize) << lm) < eff + norm_offset + nn)
                {
                    break;
                }
            }
            x_cm = 0;
            y_cm = 0;
            for fold_i in fold_start..fold_end {
                x_cm |= collapse_masks[fold_i * channels] as u32;
                y_cm |= collapse_masks[fold_i * channels + channels - 1] as u32;
            }
        } else {
            x_cm = (1u32 << b_blocks) - 1;
            y_cm = x_cm;
        }
        if dual_stereo != 0 && i == intensity {
            // From here on the channels are coded jointly; average the two
            // folding histories.
            dual_stereo = 0;
            if resynth {
                for j in 0..band_start - norm_offset {
                    norm[j] = 0.5 * (norm[j] + norm[norm_size + j]);
                }
            }
        }

        let norm_band_out_off = band_start - norm_offset;
        let need_x_scratch = have_scratch && !use_alloc_scratch;
        let (x_band_src, mut x_scratch_src): (&mut [f32], Option<&mut [f32]>) = if need_x_scratch {
            let (coded, scratch) = x_.split_at_mut(decode_scratch_off);
            (coded, Some(scratch))
        } else {
            (&mut x_[..], None)
        };
        if dual_stereo != 0 {
            let (norm1, norm2) = norm.split_at_mut(norm_size);
            // The folding read range may overlap the lowband_out write
            // range, so the source is copied out first.
            let mut lowband_x_buf = [0.0f32; MAX_BAND_BINS];
            if let Some(eff) = effective_lowband {
                lowband_x_buf[..nn].copy_from_slice(&norm1[eff..eff + nn]);
            }
            let lowband_out_x: Option<&mut [f32]> = if last {
                None
            } else {
                Some(&mut norm1[norm_band_out_off..])
            };
            let lowband_x: Option<&mut [f32]> = if effective_lowband.is_some() {
                Some(&mut lowband_x_buf[..nn])
            } else {
                None
            };
            let scratch_x: Option<&mut [f32]> = if !have_scratch {
                None
            } else if use_alloc_scratch {
                Some(&mut alloc_scratch[..nn])
            } else {
                x_scratch_src.as_mut().map(|s| &mut s[..nn])
            };
            let x_band = &mut x_band_src[band_start..band_start + nn];
            x_cm = quant_band(
                &mut ctx,
                x_band,
                n,
                b / 2,
                b_blocks,
                lowband_x,
                lm as i32,
                lowband_out_x,
                1.0,
                scratch_x,
                x_cm as i32,
                coder,
            );
            let mut lowband_y_buf = [0.0f32; MAX_BAND_BINS];
            if let Some(eff) = effective_lowband {
                lowband_y_buf[..nn].copy_from_slice(&norm2[eff..eff + nn]);
            }
            let lowband_out_y: Option<&mut [f32]> = if last {
                None
            } else {
                Some(&mut norm2[norm_band_out_off..])
            };
            let scratch2: Option<&mut [f32]> = if !have_scratch {
                None
            } else if use_alloc_scratch {
                Some(&mut alloc_scratch[..nn])
            } else {
                x_scratch_src.as_mut().map(|s| &mut s[..nn])
            };
            let lowband_y: Option<&mut [f32]> = if effective_lowband.is_some() {
                Some(&mut lowband_y_buf[..nn])
            } else {
                None
            };
            if let Some(y_all) = y_.as_deref_mut() {
                let y_band = &mut y_all[band_start..band_start + nn];
                y_cm = quant_band(
                    &mut ctx,
                    y_band,
                    n,
                    b / 2,
                    b_blocks,
                    lowband_y,
                    lm as i32,
                    lowband_out_y,
                    1.0,
                    scratch2,
                    y_cm as i32,
                    coder,
                );
            }
        } else if use_norm_xy {
            // Beyond the coded spectrum the content is discarded; run the
            // quantizer on scratch just to keep the streams in sync.
            if y_.is_some() {
                let (dummy_x, dummy_rest) = norm.split_at_mut(nn);
                let dummy_y = &mut dummy_rest[..nn];
                x_cm = quant_band_stereo(
                    &mut ctx,
                    dummy_x,
                    dummy_y,
                    n,
                    b,
                    b_blocks,
                    None,
                    lm as i32,
                    None,
                    None,
                    (x_cm | y_cm) as i32,
                    coder,
                );
            } else {
                let dummy = &mut norm[..nn];
                x_cm = quant_band(
                    &mut ctx,
                    dummy,
                    n,
                    b,
                    b_blocks,
                    None,
                    lm as i32,
                    None,
                    1.0,
                    None,
                    (x_cm | y_cm) as i32,
                    coder,
                );
            }
            y_cm = x_cm;
        } else {
            let mut lowband_buf = [0.0f32; MAX_BAND_BINS];
            if let Some(eff) = effective_lowband {
                lowband_buf[..nn].copy_from_slice(&norm[eff..eff + nn]);
            }
            match y_.as_deref_mut() {
                Some(y_all) => {
                    let x_band = &mut x_band_src[band_start..band_start + nn];
                    let y_band = &mut y_all[band_start..band_start + nn];
                    let mut handled = false;
                    if theta_rdo && i < intensity {
                        if let Coder::Encode(enc) = &mut *coder {
                            let enc = &mut **enc;
                            let mut w = [0.0f32; 2];
                            compute_channel_weights(
                                band_e[i],
                                band_e[i + m.nb_ebands],
                                &mut w,
                            );
                            let cm = x_cm | y_cm;
                            let ec_save = enc.save();
                            let ctx_save = ctx;
                            x_save[..nn].copy_from_slice(&x_band[..nn]);
                            y_save[..nn].copy_from_slice(&y_band[..nn]);
                            // Trial 1: round theta down. The fold source is
                            // copied out of `norm` so the band's own output
                            // region can be borrowed for writing.
                            ctx.theta_round = -1;
                            let mut rdo_lowband = [0.0f32; MAX_BAND_BINS];
                            let lowband_ref: Option<&mut [f32]> = match effective_lowband {
                                Some(eff) => {
                                    rdo_lowband[..nn].copy_from_slice(&norm[eff..eff + nn]);
                                    Some(&mut rdo_lowband[..nn])
                                }
                                None => None,
                            };
                            let lowband_out_ref: Option<&mut [f32]> = if last {
                                None
                            } else {
                                Some(&mut norm[norm_band_out_off..])
                            };
                            let scratch1: Option<&mut [f32]> = if !have_scratch {
                                None
                            } else if use_alloc_scratch {
                                Some(&mut alloc_scratch[..nn])
                            } else {
                                x_scratch_src.as_mut().map(|s| &mut s[..nn])
                            };
                            x_cm = quant_band_stereo(
                                &mut ctx,
                                x_band,
                                y_band,
                                n,
                                b,
                                b_blocks,
                                lowband_ref,
                                lm as i32,
                                lowband_out_ref,
                                scratch1,
                                cm as i32,
                                &mut Coder::Encode(&mut *enc),
                            );
                            let dist0 = w[0] * celt_inner_prod(&x_save[..nn], &x_band[..nn])
                                + w[1] * celt_inner_prod(&y_save[..nn], &y_band[..nn]);
                            let cm2 = x_cm;
                            let ec_save2 = enc.save();
                            let ctx_save2 = ctx;
                            x_save2[..nn].copy_from_slice(&x_band[..nn]);
                            y_save2[..nn].copy_from_slice(&y_band[..nn]);
                            if !last {
                                norm_save2[..nn].copy_from_slice(
                                    &norm[norm_band_out_off..norm_band_out_off + nn],
                                );
                            }
                            let nstart = RangeEncoder::byte_offset(&ec_save);
                            let nend = enc.storage() as usize;
                            let bytes_save = enc.range_bytes(nstart, nend);
                            // Rewind for trial 2: round theta up.
                            enc.restore(ec_save);
                            ctx = ctx_save;
                            x_band[..nn].copy_from_slice(&x_save[..nn]);
                            y_band[..nn].copy_from_slice(&y_save[..nn]);
                            if i == start + 1 {
                                let (norm1, norm2) = norm.split_at_mut(norm_size);
                                special_hybrid_folding(m, norm1, norm2, start, lm, dual_stereo);
                            }
                            let lowband_ref2: Option<&mut [f32]> = match effective_lowband {
                                Some(eff) => {
                                    rdo_lowband[..nn].copy_from_slice(&norm[eff..eff + nn]);
                                    Some(&mut rdo_lowband[..nn])
                                }
                                None => None,
                            };
                            let lowband_out_ref2: Option<&mut [f32]> = if last {
                                None
                            } else {
                                Some(&mut norm[norm_band_out_off..])
                            };
                            let scratch2: Option<&mut [f32]> = if !have_scratch {
                                None
                            } else if use_alloc_scratch {
                                Some(&mut alloc_scratch[..nn])
                            } else {
                                x_scratch_src.as_mut().map(|s| &mut s[..nn])
                            };
                            ctx.theta_round = 1;
                            x_cm = quant_band_stereo(
                                &mut ctx,
                                x_band,
                                y_band,
                                n,
                                b,
                                b_blocks,
                                lowband_ref2,
                                lm as i32,
                                lowband_out_ref2,
                                scratch2,
                                cm as i32,
                                &mut Coder::Encode(&mut *enc),
                            );
                            let dist1 = w[0] * celt_inner_prod(&x_save[..nn], &x_band[..nn])
                                + w[1] * celt_inner_prod(&y_save[..nn], &y_band[..nn]);
                            if dist0 >= dist1 {
                                x_cm = cm2;
                                enc.restore(ec_save2);
                                ctx = ctx_save2;
                                x_band[..nn].copy_from_slice(&x_save2[..nn]);
                                y_band[..nn].copy_from_slice(&y_save2[..nn]);
                                if !last {
                                    norm[norm_band_out_off..norm_band_out_off + nn]
                                        .copy_from_slice(&norm_save2[..nn]);
                                }
                                enc.overwrite_range_bytes(nstart, &bytes_save);
                            }
                            handled = true;
                        }
                    }
                    if !handled {
                        ctx.theta_round = 0;
                        let lowband_out_ref: Option<&mut [f32]> = if last {
                            None
                        } else {
                            Some(&mut norm[norm_band_out_off..])
                        };
                        let lowband_ref: Option<&mut [f32]> = if effective_lowband.is_some() {
                            Some(&mut lowband_buf[..nn])
                        } else {
                            None
                        };
                        let scratch: Option<&mut [f32]> = if !have_scratch {
                            None
                        } else if use_alloc_scratch {
                            Some(&mut alloc_scratch[..nn])
                        } else {
                            x_scratch_src.as_mut().map(|s| &mut s[..nn])
                        };
                        x_cm = quant_band_stereo(
                            &mut ctx,
                            x_band,
                            y_band,
                            n,
                            b,
                            b_blocks,
                            lowband_ref,
                            lm as i32,
                            lowband_out_ref,
                            scratch,
                            (x_cm | y_cm) as i32,
                            coder,
                        );
                    }
                    y_cm = x_cm;
                }
                None => {
                    let x_band = &mut x_band_src[band_start..band_start + nn];
                    let lowband_out_ref: Option<&mut [f32]> = if last {
                        None
                    } else {
                        Some(&mut norm[norm_band_out_off..])
                    };
                    let lowband_ref: Option<&mut [f32]> = if effective_lowband.is_some() {
                        Some(&mut lowband_buf[..nn])
                    } else {
                        None
                    };
                    let scratch: Option<&mut [f32]> = if !have_scratch {
                        None
                    } else if use_alloc_scratch {
                        Some(&mut alloc_scratch[..nn])
                    } else {
                        x_scratch_src.as_mut().map(|s| &mut s[..nn])
                    };
                    x_cm = quant_band(
                        &mut ctx,
                        x_band,
                        n,
                        b,
                        b_blocks,
                        lowband_ref,
                        lm as i32,
                        lowband_out_ref,
                        1.0,
                        scratch,
                        (x_cm | y_cm) as i32,
                        coder,
                    );
                    y_cm = x_cm;
                }
            }
        }
        collapse_masks[i * channels] = x_cm as u8;
        collapse_masks[i * channels + channels - 1] = y_cm as u8;
        balance += pulses[i] + tell;
        update_lowband = b > n << BITRES;
        ctx.avoid_split_noise = false;
    }
    *seed = ctx.seed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celt::init_caps;
    use crate::entdec::RangeDecoder;
    use crate::entenc::RangeEncoder;
    use crate::modes::mode48000_960_120;
    use crate::rate::clt_compute_allocation;

    fn noise(len: usize, seed: &mut u32) -> Vec<f32> {
        (0..len)
            .map(|_| {
                *seed = celt_lcg_rand(*seed);
                (*seed >> 16) as f32 / 32768.0 - 1.0
            })
            .collect()
    }

    fn normalise_per_band(m: &crate::modes::CeltMode, x: &mut [f32], lm: usize) {
        for i in 0..m.nb_ebands {
            let lo = (m.e_bands[i] as usize) << lm;
            let hi = (m.e_bands[i + 1] as usize) << lm;
            renormalise_vector(&mut x[lo..hi], 1.0);
        }
    }

    #[test]
    fn haar1_is_an_involution() {
        let mut seed = 3u32;
        let mut x = noise(32, &mut seed);
        let orig = x.clone();
        haar1(&mut x, 16, 2);
        assert_ne!(x, orig);
        haar1(&mut x, 16, 2);
        for i in 0..x.len() {
            assert!((x[i] - orig[i]).abs() < 1e-6, "i={i}");
        }
    }

    #[test]
    fn hadamard_interleave_round_trip() {
        let mut seed = 11u32;
        for &(n0, stride, hadamard) in &[(8usize, 2usize, true), (4, 4, false), (16, 8, true)] {
            let mut x = noise(n0 * stride, &mut seed);
            let orig = x.clone();
            deinterleave_hadamard(&mut x, n0, stride, hadamard);
            interleave_hadamard(&mut x, n0, stride, hadamard);
            assert_eq!(x, orig, "n0={n0} stride={stride}");
        }
    }

    #[test]
    fn hysteresis_sticks_near_boundaries() {
        let thresholds = [1.0f32, 2.0, 3.0];
        let hysteresis = [0.2f32, 0.2, 0.2];
        assert_eq!(hysteresis_decision(0.5, &thresholds, &hysteresis, 0), 0);
        assert_eq!(hysteresis_decision(2.5, &thresholds, &hysteresis, 0), 2);
        // Just above a boundary, but prev pulls it back down.
        assert_eq!(hysteresis_decision(1.1, &thresholds, &hysteresis, 1), 1);
        assert_eq!(hysteresis_decision(1.1, &thresholds, &hysteresis, 0), 0);
        // Just below a boundary, but prev pulls it back up.
        assert_eq!(hysteresis_decision(0.9, &thresholds, &hysteresis, 1), 1);
    }

    #[test]
    fn spreading_decision_tracks_sparseness() {
        let mode = mode48000_960_120().unwrap();
        let lm = 3usize;
        let n = mode.short_mdct_size << lm;
        let weights = vec![1i32; mode.nb_ebands];

        // Flat spectrum: every band looks dense.
        let mut x = vec![0.0f32; n];
        for i in 0..mode.nb_ebands {
            let lo = (mode.e_bands[i] as usize) << lm;
            let hi = (mode.e_bands[i + 1] as usize) << lm;
            let g = 1.0 / ((hi - lo) as f32).sqrt();
            x[lo..hi].iter_mut().for_each(|v| *v = g);
        }
        let mut average = 0;
        let mut hf_average = 0;
        let mut tapset = 0;
        let dense = spreading_decision(
            mode,
            &x,
            &mut average,
            SPREAD_NORMAL,
            &mut hf_average,
            &mut tapset,
            false,
            mode.nb_ebands,
            1,
            lm,
            &weights,
        );
        assert_eq!(dense, SPREAD_AGGRESSIVE);

        // One spike per band: very sparse.
        let mut x = vec![0.0f32; n];
        for i in 0..mode.nb_ebands {
            let lo = (mode.e_bands[i] as usize) << lm;
            x[lo] = 1.0;
        }
        let mut average = 0;
        let mut hf_average = 0;
        let mut tapset = 0;
        let mut sparse = SPREAD_NORMAL;
        for _ in 0..4 {
            sparse = spreading_decision(
                mode,
                &x,
                &mut average,
                sparse,
                &mut hf_average,
                &mut tapset,
                false,
                mode.nb_ebands,
                1,
                lm,
                &weights,
            );
        }
        assert_ne!(sparse, SPREAD_AGGRESSIVE);
    }

    #[test]
    fn anti_collapse_renormalises_collapsed_band() {
        let mode = mode48000_960_120().unwrap();
        let lm = 3usize;
        let n = mode.short_mdct_size << lm;
        let nb = mode.nb_ebands;
        let mut x = vec![0.0f32; n];
        // Band 5 fully collapsed, everything else intact.
        let mut masks = vec![0xffu8; nb];
        masks[5] = 0;
        let log_e = vec![0.0f32; 2 * nb];
        let prev1 = vec![0.0f32; 2 * nb];
        let prev2 = vec![0.0f32; 2 * nb];
        let pulses = vec![0i32; nb];
        anti_collapse(
            mode, &mut x, &masks, lm, 1, n, 0, nb, &log_e, &prev1, &prev2, &pulses, 42, false,
        );
        let lo = (mode.e_bands[5] as usize) << lm;
        let hi = (mode.e_bands[6] as usize) << lm;
        let e: f32 = x[lo..hi].iter().map(|v| v * v).sum();
        assert!((e - 1.0).abs() < 1e-4, "collapsed band energy {e}");
        // Untouched bands stay silent.
        let other: f32 = x[..lo].iter().map(|v| v * v).sum();
        assert_eq!(other, 0.0);
    }

    #[test]
    fn normalise_denormalise_round_trip() {
        let mode = mode48000_960_120().unwrap();
        let lm = 2usize;
        let n = mode.short_mdct_size << lm;
        let nb = mode.nb_ebands;
        let mut seed = 99u32;
        let freq = noise(n, &mut seed);
        let mut band_e = vec![0.0f32; nb];
        compute_band_energies(mode, &freq, &mut band_e, nb, 1, lm);
        let mut shapes = vec![0.0f32; n];
        normalise_bands(mode, &freq, &mut shapes, &band_e, nb, 1, lm);
        let band_log_e: Vec<f32> = (0..nb)
            .map(|i| crate::mathops::celt_log2(band_e[i]) - E_MEANS[i])
            .collect();
        let mut out = vec![0.0f32; n];
        denormalise_bands(mode, &shapes, &mut out, &band_log_e, 0, nb, lm, 1, false);
        let coded = (mode.e_bands[nb] as usize) << lm;
        for i in 0..coded {
            assert!((out[i] - freq[i]).abs() < 1e-4 * freq[i].abs().max(1.0), "i={i}");
        }
        for &v in &out[coded..] {
            assert_eq!(v, 0.0);
        }
    }

    struct Allocation {
        pulses: Vec<i32>,
        ebits: Vec<i32>,
        fine_priority: Vec<i32>,
        coded_bands: usize,
        balance: i32,
        intensity: usize,
        dual_stereo: i32,
    }

    fn run_allocation(
        mode: &'static crate::modes::CeltMode,
        channels: usize,
        lm: usize,
        total: i32,
        coder: &mut Coder,
    ) -> Allocation {
        let nb = mode.nb_ebands;
        let mut cap = vec![0i32; nb];
        init_caps(mode, &mut cap, lm, channels);
        let offsets = vec![0i32; nb];
        let mut intensity = nb;
        let mut dual_stereo = 0;
        let mut balance = 0;
        let mut pulses = vec![0i32; nb];
        let mut ebits = vec![0i32; nb];
        let mut fine_priority = vec![0i32; nb];
        let coded_bands = clt_compute_allocation(
            mode,
            0,
            nb,
            &offsets,
            &cap,
            5,
            &mut intensity,
            &mut dual_stereo,
            total,
            &mut balance,
            &mut pulses,
            &mut ebits,
            &mut fine_priority,
            channels,
            lm,
            coder,
            0,
            nb - 1,
        );
        Allocation {
            pulses,
            ebits,
            fine_priority,
            coded_bands,
            balance,
            intensity,
            dual_stereo,
        }
    }

    #[test]
    fn mono_encode_decode_stay_in_sync() {
        let mode = mode48000_960_120().unwrap();
        let lm = 2usize;
        let n = mode.short_mdct_size << lm;
        let nb = mode.nb_ebands;
        let total_bytes = 120usize;
        let total_bits = (total_bytes as i32 * 8) << BITRES;
        let mut seed = 0x1234u32;
        let mut x = noise(n, &mut seed);
        normalise_per_band(mode, &mut x, lm);
        let x_orig = x.clone();
        let band_e = vec![1.0f32; nb];
        let tf_res = vec![0i32; nb];

        let mut buf = vec![0u8; total_bytes];
        let (enc_tell, alloc_enc, mut enc_masks) = {
            let mut enc = RangeEncoder::new(&mut buf);
            let alloc_total = total_bits - enc.tell_frac() as i32 - 1;
            let mut coder = Coder::Encode(&mut enc);
            let alloc = run_allocation(mode, 1, lm, alloc_total, &mut coder);
            let mut masks = vec![0u8; nb];
            let mut rng = 0u32;
            quant_all_bands(
                mode,
                0,
                nb,
                &mut x,
                None,
                &mut masks,
                &band_e,
                &alloc.pulses,
                false,
                SPREAD_NORMAL,
                0,
                alloc.intensity,
                &tf_res,
                total_bits,
                alloc.balance,
                &mut coder,
                lm,
                alloc.coded_bands,
                &mut rng,
                0,
                false,
            );
            let tell = enc.tell_frac();
            enc.done();
            (tell, alloc, masks)
        };
        // Encoding without resynthesis leaves the input untouched.
        assert_eq!(x, x_orig);

        let mut dec = RangeDecoder::new(&buf);
        let alloc_total = total_bits - dec.tell_frac() as i32 - 1;
        let mut coder = Coder::Decode(&mut dec);
        let alloc = run_allocation(mode, 1, lm, alloc_total, &mut coder);
        assert_eq!(alloc.pulses, alloc_enc.pulses);
        assert_eq!(alloc.ebits, alloc_enc.ebits);
        assert_eq!(alloc.fine_priority, alloc_enc.fine_priority);
        assert_eq!(alloc.coded_bands, alloc_enc.coded_bands);
        let mut y = vec![0.0f32; n];
        let mut masks = vec![0u8; nb];
        let mut rng = 0u32;
        quant_all_bands(
            mode,
            0,
            nb,
            &mut y,
            None,
            &mut masks,
            &band_e,
            &alloc.pulses,
            false,
            SPREAD_NORMAL,
            0,
            alloc.intensity,
            &tf_res,
            total_bits,
            alloc.balance,
            &mut coder,
            lm,
            alloc.coded_bands,
            &mut rng,
            0,
            false,
        );
        // Both sides consumed exactly the same number of eighth-bits.
        assert_eq!(dec.tell_frac(), enc_tell);
        // Pulse-coded masks travel unchanged.
        for i in 0..nb {
            if alloc_enc.pulses[i] > 0 {
                assert_eq!(masks[i], enc_masks[i], "band {i}");
            }
        }
        let _ = &mut enc_masks;
        // Every decoded band comes back at unit norm.
        for i in 0..nb {
            let lo = (mode.e_bands[i] as usize) << lm;
            let hi = (mode.e_bands[i + 1] as usize) << lm;
            let e: f32 = y[lo..hi].iter().map(|v| v * v).sum();
            assert!((e - 1.0).abs() < 1e-3, "band {i} energy {e}");
        }
    }

    #[test]
    fn stereo_rdo_encode_matches_decode() {
        let mode = mode48000_960_120().unwrap();
        let lm = 3usize;
        let n = mode.short_mdct_size << lm;
        let nb = mode.nb_ebands;
        let total_bytes = 200usize;
        let total_bits = (total_bytes as i32 * 8) << BITRES;
        let mut seed = 0xdeadu32;
        let mut xl = noise(n, &mut seed);
        let mut xr = noise(n, &mut seed);
        normalise_per_band(mode, &mut xl, lm);
        normalise_per_band(mode, &mut xr, lm);
        let band_e = vec![1.0f32; 2 * nb];
        let tf_res = vec![0i32; nb];

        let mut buf = vec![0u8; total_bytes];
        let (enc_tell, alloc_enc, el, er) = {
            let mut enc = RangeEncoder::new(&mut buf);
            let alloc_total = total_bits - enc.tell_frac() as i32 - 1;
            let mut coder = Coder::Encode(&mut enc);
            let alloc = run_allocation(mode, 2, lm, alloc_total, &mut coder);
            let mut masks = vec![0u8; 2 * nb];
            let mut rng = 0u32;
            quant_all_bands(
                mode,
                0,
                nb,
                &mut xl,
                Some(&mut xr),
                &mut masks,
                &band_e,
                &alloc.pulses,
                false,
                SPREAD_NORMAL,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits,
                alloc.balance,
                &mut coder,
                lm,
                alloc.coded_bands,
                &mut rng,
                10,
                false,
            );
            let tell = enc.tell_frac();
            enc.done();
            (tell, alloc, xl.clone(), xr.clone())
        };

        let mut dec = RangeDecoder::new(&buf);
        let alloc_total = total_bits - dec.tell_frac() as i32 - 1;
        let mut coder = Coder::Decode(&mut dec);
        let alloc = run_allocation(mode, 2, lm, alloc_total, &mut coder);
        assert_eq!(alloc.pulses, alloc_enc.pulses);
        assert_eq!(alloc.intensity, alloc_enc.intensity);
        assert_eq!(alloc.dual_stereo, alloc_enc.dual_stereo);
        let mut yl = vec![0.0f32; n];
        let mut yr = vec![0.0f32; n];
        let mut masks = vec![0u8; 2 * nb];
        let mut rng = 0u32;
        quant_all_bands(
            mode,
            0,
            nb,
            &mut yl,
            Some(&mut yr),
            &mut masks,
            &band_e,
            &alloc.pulses,
            false,
            SPREAD_NORMAL,
            alloc.dual_stereo,
            alloc.intensity,
            &tf_res,
            total_bits,
            alloc.balance,
            &mut coder,
            lm,
            alloc.coded_bands,
            &mut rng,
            10,
            false,
        );
        assert_eq!(dec.tell_frac(), enc_tell);
        // The encoder's theta-RDO resynthesis must agree exactly with what
        // the decoder reconstructs.
        for i in 0..n {
            assert!((yl[i] - el[i]).abs() < 1e-6, "left i={i}: {} vs {}", yl[i], el[i]);
            assert!((yr[i] - er[i]).abs() < 1e-6, "right i={i}: {} vs {}", yr[i], er[i]);
        }
    }
}
