//! Shared frame-level tables and the pitch postfilter.

use crate::modes::CeltMode;

pub static TRIM_ICDF: [u8; 11] = [126, 124, 119, 109, 87, 41, 19, 9, 4, 2, 0];
pub static SPREAD_ICDF: [u8; 4] = [25, 23, 2, 0];
pub static TAPSET_ICDF: [u8; 3] = [2, 1, 0];

/// Per-band time/frequency resolution change, indexed by
/// [LM][2*transient + tf_select][tf_res].
pub static TF_SELECT_TABLE: [[i8; 8]; 4] = [
    [0, -1, 0, -1, 0, -1, 0, -1],
    [0, -1, 0, -2, 1, 0, 1, -1],
    [0, -2, 0, -3, 2, 0, 1, -1],
    [0, -2, 0, -3, 3, 0, 1, -1],
];

pub const COMBFILTER_MAXPERIOD: usize = 1024;
pub const COMBFILTER_MINPERIOD: usize = 15;

/// Postfilter tap shapes, one row per tapset.
const GAINS: [[f32; 3]; 3] = [
    [0.306_640_62, 0.217_041_02, 0.129_638_67],
    [0.463_867_19, 0.268_066_4, 0.0],
    [0.799_804_7, 0.100_097_656, 0.0],
];

/// Pitch postfilter applied in place. `buf[start..start + n]` is filtered
/// using lookback reaching `start - max(T0, T1) - 2`; the first `overlap`
/// samples crossfade from the old (T0, g0, tapset0) setting to the new one.
#[allow(clippy::too_many_arguments)]
pub fn comb_filter_inplace(
    buf: &mut [f32],
    start: usize,
    t0: usize,
    t1: usize,
    n: usize,
    g0: f32,
    g1: f32,
    tapset0: usize,
    tapset1: usize,
    window: &[f32],
    mut overlap: usize,
) {
    if g0 == 0.0 && g1 == 0.0 {
        return;
    }
    let t0 = t0.max(COMBFILTER_MINPERIOD);
    let t1 = t1.max(COMBFILTER_MINPERIOD);
    let g00 = g0 * GAINS[tapset0][0];
    let g01 = g0 * GAINS[tapset0][1];
    let g02 = g0 * GAINS[tapset0][2];
    let g10 = g1 * GAINS[tapset1][0];
    let g11 = g1 * GAINS[tapset1][1];
    let g12 = g1 * GAINS[tapset1][2];
    let mut x1 = buf[start - t1 + 1];
    let mut x2 = buf[start - t1];
    let mut x3 = buf[start - t1 - 1];
    let mut x4 = buf[start - t1 - 2];
    if g0 == g1 && t0 == t1 && tapset0 == tapset1 {
        overlap = 0;
    }
    for i in 0..overlap {
        let x0 = buf[start + i - t1 + 2];
        let f = window[i] * window[i];
        // T >= 15 keeps every read behind the write cursor.
        buf[start + i] += (1.0 - f) * g00 * buf[start + i - t0]
            + (1.0 - f) * g01 * (buf[start + i - t0 + 1] + buf[start + i - t0 - 1])
            + (1.0 - f) * g02 * (buf[start + i - t0 + 2] + buf[start + i - t0 - 2])
            + f * g10 * x2
            + f * g11 * (x1 + x3)
            + f * g12 * (x0 + x4);
        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    }
    if g1 == 0.0 {
        return;
    }
    let pos = start + overlap;
    let mut x4 = buf[pos - t1 - 2];
    let mut x3 = buf[pos - t1 - 1];
    let mut x2 = buf[pos - t1];
    let mut x1 = buf[pos - t1 + 1];
    for j in 0..n - overlap {
        let x0 = buf[pos + j - t1 + 2];
        buf[pos + j] += g10 * x2 + g11 * (x1 + x3) + g12 * (x0 + x4);
        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    }
}

/// Hard cap per band, in 1/8 bits, from the mode's measured caps table.
pub fn init_caps(m: &CeltMode, cap: &mut [i32], lm: usize, channels: usize) {
    for i in 0..m.nb_ebands {
        let n = ((m.e_bands[i + 1] - m.e_bands[i]) as i32) << lm;
        cap[i] = (m.cache.caps[m.nb_ebands * (2 * lm + channels - 1) + i] as i32 + 64)
            * channels as i32
            * n
            >> 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::mode48000_960_120;

    #[test]
    fn caps_scale_with_lm_and_channels() {
        let mode = mode48000_960_120().unwrap();
        let mut c10 = vec![0i32; mode.nb_ebands];
        let mut c13 = vec![0i32; mode.nb_ebands];
        let mut c23 = vec![0i32; mode.nb_ebands];
        init_caps(mode, &mut c10, 0, 1);
        init_caps(mode, &mut c13, 3, 1);
        init_caps(mode, &mut c23, 3, 2);
        for i in 0..mode.nb_ebands {
            assert!(c10[i] > 0);
            assert!(c13[i] > c10[i]);
            assert!(c23[i] > c13[i]);
        }
    }

    #[test]
    fn comb_filter_zero_gain_is_identity() {
        let mode = mode48000_960_120().unwrap();
        let mut buf: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.37).sin()).collect();
        let orig = buf.clone();
        comb_filter_inplace(
            &mut buf,
            1100,
            200,
            200,
            480,
            0.0,
            0.0,
            0,
            0,
            &mode.window,
            mode.overlap,
        );
        assert_eq!(buf, orig);
    }

    #[test]
    fn comb_filter_boosts_periodic_signal() {
        let mode = mode48000_960_120().unwrap();
        let period = 100usize;
        let mut buf: Vec<f32> = (0..2048)
            .map(|i| (2.0 * std::f32::consts::PI * (i % period) as f32 / period as f32).sin())
            .collect();
        let orig = buf.clone();
        comb_filter_inplace(
            &mut buf,
            1100,
            period,
            period,
            480,
            0.5,
            0.5,
            0,
            0,
            &mode.window,
            mode.overlap,
        );
        let e_in: f32 = orig[1100..1580].iter().map(|x| x * x).sum();
        let e_out: f32 = buf[1100..1580].iter().map(|x| x * x).sum();
        // All taps line up with the signal period, so energy must grow.
        assert!(e_out > 1.5 * e_in, "{e_out} vs {e_in}");
    }
}
