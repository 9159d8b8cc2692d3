//! Forward and inverse MDCT, expressed through an N/4 complex FFT.
//!
//! The forward transform windows and folds the four quarters of the input
//! into N/4 complex lanes, pre-rotates, runs the FFT, then post-rotates out
//! to the spectrum. The inverse runs the same FFT (with a real/imag swap in
//! place of an IFFT) and finishes with the TDAC mirror under the window.

use num_complex::Complex32;
use num_traits::Zero;

use crate::kiss_fft::{opus_fft_impl, FftState};

pub struct MdctLookup {
    /// Size of the full (unshifted) transform; the time-domain block length.
    pub n: usize,
    pub max_shift: usize,
    kfft: Vec<FftState>,
    /// Rotation twiddles per shift: n4 cosines then n4 sines.
    trig: Vec<Vec<f32>>,
}

impl MdctLookup {
    pub fn new(n: usize, max_shift: usize) -> Option<MdctLookup> {
        let mut kfft = Vec::with_capacity(max_shift + 1);
        let mut trig = Vec::with_capacity(max_shift + 1);
        for shift in 0..=max_shift {
            let ns = n >> shift;
            kfft.push(FftState::new(ns >> 2, shift)?);
            let n4 = ns >> 2;
            let mut t = vec![0.0f32; ns >> 1];
            for i in 0..n4 {
                let phase = 2.0 * std::f64::consts::PI * (i as f64 + 0.125) / ns as f64;
                t[i] = phase.cos() as f32;
                t[n4 + i] = phase.sin() as f32;
            }
            trig.push(t);
        }
        Some(MdctLookup {
            n,
            max_shift,
            kfft,
            trig,
        })
    }
}

/// Forward MDCT of `n >> shift` samples with `overlap`-sample windowed folds
/// at each end. `input` holds `n2 + overlap` samples; the `n2` outputs land
/// at stride `stride` in `out`.
pub fn mdct_forward(
    l: &MdctLookup,
    input: &[f32],
    out: &mut [f32],
    window: &[f32],
    overlap: usize,
    shift: usize,
    stride: usize,
) {
    let st = &l.kfft[shift];
    let trig = &l.trig[shift];
    let n = l.n >> shift;
    let n2 = n >> 1;
    let n4 = n >> 2;
    let o2 = overlap / 2;
    let o4 = overlap / 4;

    debug_assert_eq!(window.len(), overlap);
    debug_assert!(input.len() >= n2 + overlap);
    debug_assert!(out.len() >= n2 * stride);
    debug_assert_eq!(overlap % 4, 0);

    let input = &input[..n2 + overlap];
    let (cos_t, sin_t) = trig.split_at(n4);

    let mut f = vec![Complex32::zero(); n4];

    // Window and fold [a, b, c, d] down to n4 complex values.
    for i in 0..o4 {
        let wa = window[o2 + 2 * i];
        let wb = window[o2 - 1 - 2 * i];
        f[i].re = wb * input[n2 + o2 + 2 * i] + wa * input[n2 + o2 - 1 - 2 * i];
        f[i].im = wa * input[o2 + 2 * i] - wb * input[o2 - 1 - 2 * i];
    }
    for i in 0..n4 - o2 {
        f[o4 + i].re = input[n2 - 1 - 2 * i];
        f[o4 + i].im = input[overlap + 2 * i];
    }
    for i in 0..o4 {
        let wa = window[2 * i];
        let wb = window[overlap - 1 - 2 * i];
        f[n4 - o4 + i].re = wb * input[overlap - 1 - 2 * i] - wa * input[2 * i];
        f[n4 - o4 + i].im = wb * input[n2 + 2 * i] + wa * input[n2 + overlap - 1 - 2 * i];
    }

    // Pre-rotate straight into bit-reversed order, folding in the FFT scale.
    let mut g = vec![Complex32::zero(); n4];
    for i in 0..n4 {
        let t = Complex32::new(cos_t[i], sin_t[i]);
        g[st.bitrev()[i] as usize] = st.scale * (f[i] * t);
    }

    opus_fft_impl(st, &mut g);

    // Post-rotate, writing the spectrum from both ends.
    for i in 0..n4 {
        let t = Complex32::new(cos_t[i], sin_t[i]);
        let y = g[i] * t;
        out[2 * i * stride] = -y.re;
        out[(n2 - 1 - 2 * i) * stride] = y.im;
    }
}

/// Inverse MDCT. Reads `n2` spectral values at stride `stride`; writes
/// `n2 + overlap` time samples with the TDAC mirror already applied.
pub fn mdct_backward(
    l: &MdctLookup,
    input: &[f32],
    out: &mut [f32],
    window: &[f32],
    overlap: usize,
    shift: usize,
    stride: usize,
) {
    let st = &l.kfft[shift];
    let trig = &l.trig[shift];
    let n = l.n >> shift;
    let n2 = n >> 1;
    let n4 = n >> 2;
    let o2 = overlap / 2;

    debug_assert_eq!(st.nfft, n4);
    debug_assert_eq!(window.len(), overlap);
    debug_assert_eq!(input.len(), n2 * stride);
    debug_assert_eq!(out.len(), n2 + overlap);

    let (cos_t, sin_t) = trig.split_at(n4);

    // Run the FFT in the middle of the output buffer.
    let mid: &mut [Complex32] = bytemuck::cast_slice_mut(&mut out[o2..o2 + n2]);

    for i in 0..n4 {
        let x = Complex32::new(
            input[2 * i * stride],
            input[(n2 - 1 - 2 * i) * stride],
        );
        let t = Complex32::new(cos_t[i], sin_t[i]);
        mid[st.bitrev()[i] as usize] = x * t;
    }
    opus_fft_impl(st, mid);

    // Post-rotate and de-shuffle from both ends at once so it stays
    // in place. Real and imaginary swap because this is a forward FFT
    // standing in for an IFFT. For odd n4 the middle pair runs twice.
    for i in 0..n4.div_ceil(2) {
        let j = n4 - i - 1;

        let x0 = mid[i];
        let x1 = mid[j];
        mid[i].re = x0.re * sin_t[i] + x0.im * cos_t[i];
        mid[j].im = x0.im * sin_t[i] - x0.re * cos_t[i];
        mid[j].re = x1.re * sin_t[j] + x1.im * cos_t[j];
        mid[i].im = x1.im * sin_t[j] - x1.re * cos_t[j];
    }

    // TDAC mirror at both edges under the window.
    for i in 0..o2 {
        let j = overlap - 1 - i;
        let x1 = out[j];
        let x2 = out[i];
        out[i] = window[j] * x2 - window[i] * x1;
        out[j] = window[i] * x2 + window[j] * x1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_mdct(x: &[f32], n: usize) -> Vec<f32> {
        // Whole-block reference: out[k] = sum x[j] cos(pi/n2 (j + 1/2 + n4)(k + 1/2))
        let n2 = n / 2;
        let n4 = n / 4;
        (0..n2)
            .map(|k| {
                let mut acc = 0.0f64;
                for (j, &v) in x.iter().enumerate() {
                    acc += v as f64
                        * (std::f64::consts::PI / n2 as f64
                            * (j as f64 + 0.5 + n4 as f64)
                            * (k as f64 + 0.5))
                            .cos();
                }
                (acc / n2 as f64) as f32
            })
            .collect()
    }

    fn sine_window(overlap: usize) -> Vec<f32> {
        (0..overlap)
            .map(|i| {
                let a = 0.5 * std::f64::consts::PI * (i as f64 + 0.5) / overlap as f64;
                (0.5 * std::f64::consts::PI * a.sin() * a.sin()).sin() as f32
            })
            .collect()
    }

    fn lcg_signal(len: usize, seed: &mut u32) -> Vec<f32> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                (*seed >> 16) as f32 / 32768.0 - 1.0
            })
            .collect()
    }

    /// Least-squares gain of `got` against `want` and the relative residual
    /// after removing it. Tests against a reference up to the transform's
    /// overall scale convention.
    fn fit_gain(got: &[f32], want: &[f32]) -> (f64, f64) {
        let mut num = 0.0f64;
        let mut den = 0.0f64;
        for (&g, &w) in got.iter().zip(want) {
            num += g as f64 * w as f64;
            den += w as f64 * w as f64;
        }
        let gain = num / den;
        let mut resid = 0.0f64;
        for (&g, &w) in got.iter().zip(want) {
            let d = g as f64 - gain * w as f64;
            resid += d * d;
        }
        (gain, (resid / (gain * gain * den)).sqrt())
    }

    #[test]
    fn forward_matches_naive_full_overlap() {
        // With overlap == n2 the fold covers the whole block and the output
        // must be proportional to the windowed textbook MDCT, bin for bin.
        let n = 240usize;
        let n2 = n / 2;
        let l = MdctLookup::new(n, 0).unwrap();
        let window = sine_window(n2);
        let mut seed = 123u32;
        let x = lcg_signal(n, &mut seed);
        let mut wx = x.clone();
        for i in 0..n2 {
            wx[i] *= window[i];
            wx[n - 1 - i] *= window[i];
        }
        let want = naive_mdct(&wx, n);
        let mut got = vec![0.0f32; n2];
        mdct_forward(&l, &x, &mut got, &window, n2, 0, 1);
        let (gain, resid) = fit_gain(&got, &want);
        assert!(gain.abs() > 1e-3, "degenerate gain {gain}");
        assert!(resid < 1e-4, "relative residual {resid}");
    }

    #[test]
    fn tdac_reconstruction() {
        // Forward over hopped blocks, then backward into one persistent
        // buffer the way synthesis does it: each call folds its head into
        // the previous call's tail. The interior must reconstruct the
        // input up to a constant gain.
        let n = 480usize;
        let n2 = n / 2;
        let overlap = 120usize;
        let nblocks = 4usize;
        let l = MdctLookup::new(n, 0).unwrap();
        let window = sine_window(overlap);

        let total = n2 * nblocks + overlap;
        let mut seed = 9u32;
        let x = lcg_signal(total, &mut seed);

        let mut recon = vec![0.0f32; total];
        for b in 0..nblocks {
            let start = b * n2;
            let mut spec = vec![0.0f32; n2];
            mdct_forward(
                &l,
                &x[start..start + n2 + overlap],
                &mut spec,
                &window,
                overlap,
                0,
                1,
            );
            mdct_backward(
                &l,
                &spec,
                &mut recon[start..start + n2 + overlap],
                &window,
                overlap,
                0,
                1,
            );
        }
        let lo = overlap;
        let hi = n2 * nblocks;
        let (gain, resid) = fit_gain(&recon[lo..hi], &x[lo..hi]);
        assert!(gain.abs() > 1e-3, "degenerate gain {gain}");
        assert!(resid < 1e-3, "relative residual {resid}");
    }
}
