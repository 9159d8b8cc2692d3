//! Pulse vector enumeration through the range coder.

use super::TestRng;
use crate::cwrs::{decode_pulses, encode_pulses, pvq_v};
use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;

/// Random vector of dimension `n` with pulses summing to `k` in magnitude.
fn random_pulse_vector(rng: &mut TestRng, n: usize, k: usize) -> Vec<i32> {
    let mut y = vec![0i32; n];
    for _ in 0..k {
        let j = (rng.next() as usize) % n;
        // Sign must agree with any pulses already placed in this slot.
        if y[j] == 0 && rng.next() & 1 != 0 {
            y[j] -= 1;
        } else if y[j] < 0 {
            y[j] -= 1;
        } else {
            y[j] += 1;
        }
    }
    y
}

#[test]
fn pulse_vectors_round_trip() {
    let mut rng = TestRng::new(99);
    for n in [2, 3, 4, 6, 8, 12, 16, 24] {
        for k in [1, 2, 3, 5, 8, 12] {
            for _ in 0..4 {
                let y = random_pulse_vector(&mut rng, n, k);
                let energy: i32 = y.iter().map(|&v| v * v).sum();

                let mut buf = vec![0u8; 64];
                let mut enc = RangeEncoder::new(&mut buf);
                encode_pulses(&y, k, &mut enc);
                enc.done();
                assert!(!enc.error());

                let mut dec = RangeDecoder::new(&buf);
                let mut out = vec![0i32; n];
                let yy = decode_pulses(&mut out, k, &mut dec);
                assert_eq!(out, y, "n={n} k={k}");
                assert_eq!(yy, energy as f32);
            }
        }
    }
}

#[test]
fn codeword_counts_match_the_recurrence() {
    // V(n, k) = V(n-1, k) + V(n, k-1) + V(n-1, k-1)
    for n in 2..10usize {
        for k in 1..10usize {
            let expect = pvq_v(n - 1, k) + pvq_v(n, k - 1) + pvq_v(n - 1, k - 1);
            assert_eq!(pvq_v(n, k), expect, "n={n} k={k}");
        }
    }
    assert_eq!(pvq_v(2, 1), 4);
    assert_eq!(pvq_v(3, 1), 6);
    assert_eq!(pvq_v(1, 5), 2);
    assert_eq!(pvq_v(7, 0), 1);
}

#[test]
fn every_small_codeword_is_reachable() {
    // Exhaustively decode every index of a small (n, k) and check each
    // pulse vector is valid and distinct.
    let (n, k) = (4usize, 3usize);
    let nc = pvq_v(n, k);
    let mut seen = Vec::new();
    for i in 0..nc {
        let mut buf = vec![0u8; 16];
        let mut enc = RangeEncoder::new(&mut buf);
        enc.enc_uint(i, nc);
        enc.done();
        let mut dec = RangeDecoder::new(&buf);
        let mut y = vec![0i32; n];
        decode_pulses(&mut y, k, &mut dec);
        let sum: i32 = y.iter().map(|v| v.abs()).sum();
        assert_eq!(sum as usize, k, "index {i}");
        assert!(!seen.contains(&y), "index {i} duplicates another codeword");
        seen.push(y);
    }
    assert_eq!(seen.len() as u32, nc);
}
