//! Combinatorial enumeration of PVQ pulse vectors.
//!
//! Indexes the set of integer vectors of dimension `n` whose absolute values
//! sum to `k`. Uses the memory-light row recurrence over
//! `U(n, k) = U(n-1, k) + U(n, k-1) + U(n-1, k-1)` instead of the full static
//! table; a row of `k + 2` u32 values is enough to walk dimensions in either
//! direction. All arithmetic stays in `u32`: band splitting upstream keeps
//! every reachable `(n, k)` within range.

use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;

/// Advance the recurrence row one dimension. `u0` seeds the new row.
fn unext(u: &mut [u32], u0: u32) {
    let mut u0 = u0;
    let len = u.len();
    for j in 1..len {
        let u1 = u[j] + u[j - 1] + u0;
        u[j - 1] = u0;
        u0 = u1;
    }
    u[len - 1] = u0;
}

/// Step the recurrence row back one dimension.
fn uprev(u: &mut [u32], u0: u32) {
    let mut u0 = u0;
    let len = u.len();
    for j in 1..len {
        let u1 = u[j] - u[j - 1] - u0;
        u[j - 1] = u0;
        u0 = u1;
    }
    u[len - 1] = u0;
}

/// Fill `u[0..=k+1]` with `U(n, 0..=k+1)` and return `V(n, k)`.
/// Requires `n >= 2`, `k >= 1`, `u.len() == k + 2`.
pub fn ncwrs_urow(n: usize, k: usize, u: &mut [u32]) -> u32 {
    debug_assert!(n >= 2);
    debug_assert!(k >= 1);
    debug_assert_eq!(u.len(), k + 2);
    u[0] = 0;
    u[1] = 1;
    for j in 2..k + 2 {
        u[j] = ((j as u32) << 1) - 1;
    }
    for _ in 2..n {
        unext(&mut u[1..], 1);
    }
    u[k] + u[k + 1]
}

/// Decode index `i` into the pulse vector `y[0..n]`; returns sum of squares.
/// `u` must hold the row produced by `ncwrs_urow(n, k, u)`.
fn cwrsi(n: usize, mut k: usize, mut i: u32, y: &mut [i32], u: &mut [u32]) -> u32 {
    debug_assert!(n > 0);
    let mut yy: u32 = 0;
    for j in 0..n {
        let p = u[k + 1];
        let s: i32 = -((i >= p) as i32);
        i -= p & s as u32;
        let mut yj = k as i32;
        let mut p = u[k];
        while p > i {
            k -= 1;
            p = u[k];
        }
        i -= p;
        yj -= k as i32;
        let val = (yj + s) ^ s;
        y[j] = val;
        yy += (val * val) as u32;
        uprev(&mut u[..k + 2], 0);
    }
    yy
}

/// Index the pulse vector `y[0..n]`; returns `(index, V(n, k))`.
fn icwrs(n: usize, k: usize, y: &[i32], u: &mut [u32]) -> (u32, u32) {
    debug_assert!(n >= 2);
    u[0] = 0;
    for j in 1..k + 2 {
        u[j] = ((j as u32) << 1) - 1;
    }
    let mut i: u32 = (y[n - 1] < 0) as u32;
    let mut kk = y[n - 1].unsigned_abs() as usize;
    let mut j = n - 2;
    i += u[kk];
    kk += y[j].unsigned_abs() as usize;
    if y[j] < 0 {
        i += u[kk + 1];
    }
    while j > 0 {
        j -= 1;
        unext(u, 0);
        i += u[kk];
        kk += y[j].unsigned_abs() as usize;
        if y[j] < 0 {
            i += u[kk + 1];
        }
    }
    (i, u[kk] + u[kk + 1])
}

/// Number of codewords for dimension `n` and pulse count `k`.
pub fn pvq_v(n: usize, k: usize) -> u32 {
    if k == 0 {
        return 1;
    }
    if n == 1 {
        return 2;
    }
    let mut u = vec![0u32; k + 2];
    ncwrs_urow(n, k, &mut u)
}

/// Range-encode the pulse vector `y` of dimension `n >= 2` with `k >= 1`.
pub fn encode_pulses(y: &[i32], k: usize, enc: &mut RangeEncoder) {
    let n = y.len();
    debug_assert!(n >= 2);
    debug_assert!(k >= 1);
    let mut u = vec![0u32; k + 2];
    let (i, nc) = icwrs(n, k, y, &mut u);
    enc.enc_uint(i, nc);
}

/// Range-decode a pulse vector into `y`; returns its energy (sum of squares).
pub fn decode_pulses(y: &mut [i32], k: usize, dec: &mut RangeDecoder) -> f32 {
    let n = y.len();
    debug_assert!(n >= 2);
    debug_assert!(k >= 1);
    let mut u = vec![0u32; k + 2];
    let nc = ncwrs_urow(n, k, &mut u);
    let i = dec.dec_uint(nc);
    cwrsi(n, k, i, y, &mut u) as f32
}
