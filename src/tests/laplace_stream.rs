//! The Laplace coder carries the coarse energy residuals; encode clamps
//! out-of-range values in place, so the decoder must return exactly the
//! clamped value.

use super::TestRng;
use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;
use crate::laplace::{ec_laplace_decode, ec_laplace_encode};

fn fs_for_decay(decay: i32) -> u32 {
    // Zero probability consistent with the tail decay, as the energy
    // quantiser derives it.
    (32768 * (16384 - decay) / (16384 + decay)) as u32 + 1
}

#[test]
fn small_values_round_trip() {
    let values = [-4, -1, 0, 1, 3, 5, -7, 2, 0, 0, -2, 6];
    for &decay in &[6000, 5800, 5600] {
        let fs = fs_for_decay(decay);
        let mut buf = vec![0u8; 256];
        let mut coded = Vec::with_capacity(values.len());
        let mut enc = RangeEncoder::new(&mut buf);
        for &v in &values {
            let mut v = v;
            ec_laplace_encode(&mut enc, &mut v, fs, decay);
            coded.push(v);
        }
        enc.done();
        assert!(!enc.error());

        let mut dec = RangeDecoder::new(&buf);
        for (i, &v) in coded.iter().enumerate() {
            assert_eq!(ec_laplace_decode(&mut dec, fs, decay), v, "value {i}");
        }
    }
}

#[test]
fn randomized_values_round_trip() {
    let mut rng = TestRng::new(1234);
    for _ in 0..10 {
        let decay = 4000 + (rng.next() % 8000) as i32;
        let fs = fs_for_decay(decay);
        let mut values: Vec<i32> = (0..40)
            .map(|_| (rng.next() % 31) as i32 - 15)
            .collect();
        let mut buf = vec![0u8; 512];
        let mut enc = RangeEncoder::new(&mut buf);
        for v in values.iter_mut() {
            ec_laplace_encode(&mut enc, v, fs, decay);
        }
        enc.done();
        assert!(!enc.error());

        let mut dec = RangeDecoder::new(&buf);
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(ec_laplace_decode(&mut dec, fs, decay), v, "value {i}");
        }
    }
}

#[test]
fn zero_costs_less_than_the_tails() {
    let decay = 6000;
    let fs = fs_for_decay(decay);
    let cost = |value: i32| {
        let mut buf = vec![0u8; 64];
        let mut enc = RangeEncoder::new(&mut buf);
        let mut v = value;
        ec_laplace_encode(&mut enc, &mut v, fs, decay);
        enc.tell_frac()
    };
    let zero = cost(0);
    for v in [-8, -2, -1, 1, 2, 8] {
        assert!(cost(v) > zero, "coding {v} should cost more than zero");
    }
    assert!(cost(8) > cost(2));
}
