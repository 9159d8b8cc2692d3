//! Coder for the two-sided geometric distribution used by coarse energy
//! residuals. `fs` is the probability of zero in Q15, `decay` the Q15
//! per-step decay of the tails.

use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;

/// When the probability of an event is this small, round up to this.
const LAPLACE_LOG_MINP: i32 = 0;
const LAPLACE_MINP: u32 = 1 << LAPLACE_LOG_MINP;
/// Minimum number of guaranteed representable values on each side.
const LAPLACE_NMIN: u32 = 16;

/// Probability of the value +1 given the probability of zero.
fn ec_laplace_get_freq1(fs0: u32, decay: i32) -> u32 {
    let ft = 32768 - LAPLACE_MINP * (2 * LAPLACE_NMIN) - fs0;
    ft * (16384 - decay) as u32 >> 15
}

/// Encodes `*value`, clamping it in place if it falls off the representable
/// tail so the decoder reconstructs exactly what was coded.
pub fn ec_laplace_encode(enc: &mut RangeEncoder, value: &mut i32, mut fs: u32, decay: i32) {
    let mut fl: u32 = 0;
    let mut val = *value;
    if val != 0 {
        let s: i32 = -((val < 0) as i32);
        val = (val + s) ^ s;
        fl = fs;
        fs = ec_laplace_get_freq1(fs, decay);
        let mut i = 1;
        while fs > 0 && i < val {
            fs *= 2;
            fl += fs + 2 * LAPLACE_MINP;
            fs = (fs * decay as u32) >> 15;
            i += 1;
        }
        if fs == 0 {
            // Off the geometric tail: everything left is minimum probability.
            let mut ndi_max = ((32768 - fl + LAPLACE_MINP - 1) >> LAPLACE_LOG_MINP) as i32;
            ndi_max = (ndi_max - s) >> 1;
            let di = (val - i).min(ndi_max - 1);
            fl += ((2 * di + 1 + s) as u32) * LAPLACE_MINP;
            fs = LAPLACE_MINP.min(32768 - fl);
            *value = (i + di + s) ^ s;
        } else {
            fs += LAPLACE_MINP;
            fl += fs & !(s as u32);
        }
        debug_assert!(fl + fs <= 32768);
        debug_assert!(fs > 0);
    }
    enc.encode_bin(fl, (fl + fs).min(32768), 15);
}

pub fn ec_laplace_decode(dec: &mut RangeDecoder, mut fs: u32, decay: i32) -> i32 {
    let mut val: i32 = 0;
    let mut fl: u32 = 0;
    let fm = dec.decode_bin(15);
    if fm >= fs {
        val += 1;
        fl = fs;
        fs = ec_laplace_get_freq1(fs, decay) + LAPLACE_MINP;
        while fs > LAPLACE_MINP && fm >= fl + 2 * fs {
            fs *= 2;
            fl += fs;
            fs = ((fs - 2 * LAPLACE_MINP) * decay as u32) >> 15;
            fs += LAPLACE_MINP;
            val += 1;
        }
        if fs <= LAPLACE_MINP {
            let di = ((fm - fl) >> (LAPLACE_LOG_MINP + 1)) as i32;
            val += di;
            fl += 2 * di as u32 * LAPLACE_MINP;
        }
        if fm < fl + fs {
            val = -val;
        } else {
            fl += fs;
        }
    }
    dec.dec_update(fl, (fl + fs).min(32768), 32768);
    val
}
