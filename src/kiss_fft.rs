//! Mixed-radix complex FFT (radix 2/3/4/5), the kernel under the MDCT.
//!
//! The factor list is ordered so the degenerate radix-4 (all twiddles 1)
//! lands last and any radix-2 stage runs at m == 4, which the butterflies
//! rely on. Twiddles are built once for the largest transform; the smaller
//! (shifted) transforms walk the same table with a coarser stride.

use num_complex::Complex32;
use num_traits::Zero;

pub struct FftState {
    pub nfft: usize,
    pub scale: f32,
    shift: usize,
    /// (radix, remaining length / radix) per stage, outermost first.
    factors: Vec<(usize, usize)>,
    bitrev: Vec<i16>,
    /// Twiddles of the base (unshifted) transform, length nfft << shift.
    twiddles: Vec<Complex32>,
}

/// Factor n into radices 2/3/4/5, reversed so radix 4 ends the chain.
/// Returns pairs (p, m) with m the transform length remaining under p.
fn kf_factor(n: usize) -> Option<Vec<(usize, usize)>> {
    let mut facbuf: Vec<usize> = Vec::new();
    let mut rem = n;
    let mut p = 4usize;
    loop {
        while rem % p != 0 {
            p = match p {
                4 => 2,
                2 => 3,
                _ => p + 2,
            };
            if p > 32000 || p * p > rem {
                p = rem;
            }
        }
        rem /= p;
        if p > 5 {
            return None;
        }
        facbuf.push(p);
        let stages = facbuf.len();
        if p == 2 && stages > 2 {
            facbuf[stages - 1] = 4;
            facbuf[1] = 2;
        }
        if rem <= 1 {
            break;
        }
    }
    facbuf.reverse();
    let mut out = Vec::with_capacity(facbuf.len());
    let mut m = n;
    for &p in &facbuf {
        m /= p;
        out.push((p, m));
    }
    Some(out)
}

/// Scatter table: input index i lands at output slot bitrev[i].
fn compute_bitrev(f: &mut [i16], fout: usize, fstride: usize, factors: &[(usize, usize)]) {
    let (p, m) = factors[0];
    if m == 1 {
        for j in 0..p {
            f[j * fstride] = (fout + j) as i16;
        }
    } else {
        for j in 0..p {
            compute_bitrev(&mut f[j * fstride..], fout + j * m, fstride * p, &factors[1..]);
        }
    }
}

impl FftState {
    /// Build the plan for an `nfft`-point transform that is the base size
    /// divided by `1 << shift`.
    pub fn new(nfft: usize, shift: usize) -> Option<FftState> {
        let factors = kf_factor(nfft)?;
        let base = nfft << shift;
        let mut twiddles = Vec::with_capacity(base);
        for i in 0..base {
            let phase = -2.0 * std::f64::consts::PI * i as f64 / base as f64;
            twiddles.push(Complex32::new(phase.cos() as f32, phase.sin() as f32));
        }
        let mut bitrev = vec![0i16; nfft];
        compute_bitrev(&mut bitrev, 0, 1, &factors);
        Some(FftState {
            nfft,
            scale: 1.0 / nfft as f32,
            shift,
            factors,
            bitrev,
            twiddles,
        })
    }

    pub fn bitrev(&self) -> &[i16] {
        &self.bitrev
    }
}

/// Radix-2 stage. Only ever runs with m == 4, right after a radix-4 stage.
fn kf_bfly2(fout: &mut [Complex32], n: usize) {
    let tw = std::f32::consts::FRAC_1_SQRT_2;
    debug_assert_eq!(fout.len(), n * 8);
    for chunk in fout.chunks_exact_mut(8) {
        let (a, b) = chunk.split_at_mut(4);

        let t = b[0];
        b[0] = a[0] - t;
        a[0] += t;

        let t = Complex32::new((b[1].re + b[1].im) * tw, (b[1].im - b[1].re) * tw);
        b[1] = a[1] - t;
        a[1] += t;

        let t = Complex32::new(b[2].im, -b[2].re);
        b[2] = a[2] - t;
        a[2] += t;

        let t = Complex32::new((b[3].im - b[3].re) * tw, -(b[3].im + b[3].re) * tw);
        b[3] = a[3] - t;
        a[3] += t;
    }
}

fn kf_bfly4(
    fout: &mut [Complex32],
    fstride: usize,
    st: &FftState,
    m: usize,
    n: usize,
    mm: usize,
) {
    if m == 1 {
        // All twiddles are 1.
        debug_assert_eq!(fout.len(), n * 4);
        for c in fout.chunks_exact_mut(4) {
            let scratch0 = c[0] - c[2];
            c[0] += c[2];
            let mut scratch1 = c[1] + c[3];
            c[2] = c[0] - scratch1;
            c[0] += scratch1;
            scratch1 = c[1] - c[3];
            c[1] = Complex32::new(scratch0.re + scratch1.im, scratch0.im - scratch1.re);
            c[3] = Complex32::new(scratch0.re - scratch1.im, scratch0.im + scratch1.re);
        }
        return;
    }
    let tw = &st.twiddles;
    let m2 = 2 * m;
    let m3 = 3 * m;
    for i in 0..n {
        let base = i * mm;
        for j in 0..m {
            let s0 = fout[base + j + m] * tw[j * fstride];
            let s1 = fout[base + j + m2] * tw[j * fstride * 2];
            let s2 = fout[base + j + m3] * tw[j * fstride * 3];

            let s5 = fout[base + j] - s1;
            fout[base + j] += s1;
            let s3 = s0 + s2;
            let s4 = s0 - s2;
            fout[base + j + m2] = fout[base + j] - s3;
            fout[base + j] += s3;

            fout[base + j + m] = Complex32::new(s5.re + s4.im, s5.im - s4.re);
            fout[base + j + m3] = Complex32::new(s5.re - s4.im, s5.im + s4.re);
        }
    }
}

fn kf_bfly3(
    fout: &mut [Complex32],
    fstride: usize,
    st: &FftState,
    m: usize,
    n: usize,
    mm: usize,
) {
    let tw = &st.twiddles;
    let epi3 = tw[fstride * m];
    let m2 = 2 * m;
    for i in 0..n {
        let base = i * mm;
        for j in 0..m {
            let s1 = fout[base + j + m] * tw[j * fstride];
            let s2 = fout[base + j + m2] * tw[j * fstride * 2];

            let s3 = s1 + s2;
            let mut s0 = s1 - s2;

            fout[base + j + m] = fout[base + j] - s3 * 0.5f32;
            s0 *= epi3.im;
            fout[base + j] += s3;

            fout[base + j + m2] = Complex32::new(
                fout[base + j + m].re + s0.im,
                fout[base + j + m].im - s0.re,
            );
            fout[base + j + m].re -= s0.im;
            fout[base + j + m].im += s0.re;
        }
    }
}

fn kf_bfly5(
    fout: &mut [Complex32],
    fstride: usize,
    st: &FftState,
    m: usize,
    n: usize,
    mm: usize,
) {
    let tw = &st.twiddles;
    let ya = tw[fstride * m];
    let yb = tw[fstride * m * 2];
    let (m2, m3, m4) = (2 * m, 3 * m, 4 * m);
    for i in 0..n {
        let base = i * mm;
        for u in 0..m {
            let s0 = fout[base + u];
            let s1 = fout[base + m + u] * tw[u * fstride];
            let s2 = fout[base + m2 + u] * tw[2 * u * fstride];
            let s3 = fout[base + m3 + u] * tw[3 * u * fstride];
            let s4 = fout[base + m4 + u] * tw[4 * u * fstride];

            let s7 = s1 + s4;
            let s10 = s1 - s4;
            let s8 = s2 + s3;
            let s9 = s2 - s3;

            fout[base + u] += s7 + s8;

            let s5 = Complex32::new(
                s0.re + (s7.re * ya.re + s8.re * yb.re),
                s0.im + (s7.im * ya.re + s8.im * yb.re),
            );
            let s6 = Complex32::new(
                s10.im * ya.im + s9.im * yb.im,
                -(s10.re * ya.im + s9.re * yb.im),
            );

            fout[base + m + u] = s5 - s6;
            fout[base + m4 + u] = s5 + s6;

            let s11 = Complex32::new(
                s0.re + (s7.re * yb.re + s8.re * ya.re),
                s0.im + (s7.im * yb.re + s8.im * ya.re),
            );
            let s12 = Complex32::new(
                s9.im * ya.im - s10.im * yb.im,
                s10.re * yb.im - s9.re * ya.im,
            );

            fout[base + m2 + u] = s11 + s12;
            fout[base + m3 + u] = s11 - s12;
        }
    }
}

/// In-place transform of already bit-reversed data.
pub fn opus_fft_impl(st: &FftState, fout: &mut [Complex32]) {
    debug_assert_eq!(st.nfft, fout.len());
    let nstages = st.factors.len();
    let mut fstride = vec![1usize; nstages + 1];
    for l in 0..nstages {
        fstride[l + 1] = fstride[l] * st.factors[l].0;
    }
    let mut m = st.factors[nstages - 1].1;
    for i in (0..nstages).rev() {
        let m2 = if i > 0 { st.factors[i - 1].1 } else { 1 };
        let (p, _) = st.factors[i];
        match p {
            2 => kf_bfly2(fout, fstride[i]),
            4 => kf_bfly4(fout, fstride[i] << st.shift, st, m, fstride[i], m2),
            3 => kf_bfly3(fout, fstride[i] << st.shift, st, m, fstride[i], m2),
            5 => kf_bfly5(fout, fstride[i] << st.shift, st, m, fstride[i], m2),
            _ => unreachable!("radix {p}"),
        }
        m = m2;
    }
}

/// Out-of-place forward transform with input scaling.
pub fn opus_fft(st: &FftState, fin: &[Complex32], fout: &mut [Complex32]) {
    debug_assert_eq!(fin.len(), st.nfft);
    debug_assert_eq!(fout.len(), st.nfft);
    for (x, &r) in fin.iter().zip(st.bitrev.iter()) {
        fout[r as usize] = st.scale * x;
    }
    opus_fft_impl(st, fout);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_dft(x: &[Complex32]) -> Vec<Complex32> {
        let n = x.len();
        (0..n)
            .map(|k| {
                let mut acc = Complex32::zero();
                for (j, &v) in x.iter().enumerate() {
                    let ph = -2.0 * std::f64::consts::PI * (k * j) as f64 / n as f64;
                    acc += v * Complex32::new(ph.cos() as f32, ph.sin() as f32);
                }
                acc
            })
            .collect()
    }

    fn lcg_signal(n: usize, seed: &mut u32) -> Vec<Complex32> {
        (0..n)
            .map(|_| {
                *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                let re = (*seed >> 16) as f32 / 32768.0 - 1.0;
                *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                let im = (*seed >> 16) as f32 / 32768.0 - 1.0;
                Complex32::new(re, im)
            })
            .collect()
    }

    #[test]
    fn matches_naive_dft() {
        let mut seed = 42u32;
        for n in [60usize, 120, 240, 480] {
            let st = FftState::new(n, 0).unwrap();
            let fin = lcg_signal(n, &mut seed);
            let mut fout = vec![Complex32::zero(); n];
            opus_fft(&st, &fin, &mut fout);
            let want = naive_dft(&fin);
            for k in 0..n {
                // opus_fft folds the 1/n scale into the forward direction
                let got = fout[k] * n as f32;
                let err = (got - want[k]).norm();
                assert!(err < 2e-2 * n as f32, "n={n} bin {k}: {got} vs {}", want[k]);
            }
        }
    }

    #[test]
    fn shifted_plan_matches_unshifted() {
        let mut seed = 7u32;
        let base = FftState::new(120, 0).unwrap();
        let shifted = FftState::new(120, 2).unwrap();
        let fin = lcg_signal(120, &mut seed);
        let mut a = vec![Complex32::zero(); 120];
        let mut b = vec![Complex32::zero(); 120];
        opus_fft(&base, &fin, &mut a);
        opus_fft(&shifted, &fin, &mut b);
        for k in 0..120 {
            assert!((a[k] - b[k]).norm() < 1e-4);
        }
    }
}
