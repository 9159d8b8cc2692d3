//! Bit allocation across bands.
//!
//! The allocation is fully determined by data both sides already share
//! (band layout, frame size, boosts, trim), so encoder and decoder walk the
//! same code. Only three decisions travel in the stream: per-band skips,
//! the intensity threshold and the dual-stereo flag.

use crate::entcode::{celt_udiv, Coder, BITRES};
use crate::modes::CeltMode;

pub const FINE_OFFSET: i32 = 21;
pub const MAX_FINE_BITS: i32 = 8;
pub const LOG_MAX_PSEUDO: i32 = 6;
pub const QTHETA_OFFSET_TWOPHASE: i32 = 16;
pub const QTHETA_OFFSET: i32 = 4;
pub const ALLOC_STEPS: i32 = 6;

/// log2 of small integers in 1/8 bit units, rounded up.
pub static LOG2_FRAC_TABLE: [u8; 24] = [
    0, 8, 13, 16, 19, 21, 23, 24, 26, 27, 28, 29, 30, 31, 32, 32, 33, 34, 34, 35, 36, 36, 37, 37,
];


/// Pseudo-pulse index to actual pulse count: exact up to 8, then 8..16
/// stepped by powers of two.
#[inline]
pub fn get_pulses(i: i32) -> i32 {
    if i < 8 {
        i
    } else {
        (8 + (i & 7)) << ((i >> 3) - 1)
    }
}

/// Largest pulse count codeable in `bits` (1/8 bit units) for this band,
/// by binary search in the mode's bit-cost cache.
#[inline]
pub fn bits2pulses(m: &CeltMode, band: usize, lm: i32, mut bits: i32) -> i32 {
    let cache_off = m.cache.index[(lm + 1) as usize * m.nb_ebands + band] as usize;
    let cache = &m.cache.bits[cache_off..];
    let mut lo = 0i32;
    let mut hi = cache[0] as i32;
    bits -= 1;
    for _ in 0..LOG_MAX_PSEUDO {
        let mid = (lo + hi + 1) >> 1;
        if cache[mid as usize] as i32 >= bits {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    let lo_bits = if lo == 0 { -1 } else { cache[lo as usize] as i32 };
    if bits - lo_bits <= cache[hi as usize] as i32 - bits {
        lo
    } else {
        hi
    }
}

#[inline]
pub fn pulses2bits(m: &CeltMode, band: usize, lm: i32, pulses: i32) -> i32 {
    if pulses == 0 {
        return 0;
    }
    let cache_off = m.cache.index[(lm + 1) as usize * m.nb_ebands + band] as usize;
    m.cache.bits[cache_off + pulses as usize] as i32 + 1
}

#[allow(clippy::too_many_arguments)]
fn interp_bits2pulses(
    m: &CeltMode,
    start: usize,
    end: usize,
    skip_start: usize,
    bits1: &[i32],
    bits2: &[i32],
    thresh: &[i32],
    cap: &[i32],
    mut total: i32,
    balance_out: &mut i32,
    skip_rsv: i32,
    intensity: &mut usize,
    mut intensity_rsv: i32,
    dual_stereo: &mut i32,
    mut dual_stereo_rsv: i32,
    bits: &mut [i32],
    ebits: &mut [i32],
    fine_priority: &mut [i32],
    channels: usize,
    lm: usize,
    coder: &mut Coder,
    prev: usize,
    signal_bandwidth: usize,
) -> usize {
    let c = channels as i32;
    let stereo = (channels > 1) as i32;
    let log_m = (lm as i32) << BITRES;
    let alloc_floor = c << BITRES;
    let e_bands = m.e_bands;

    // Bisect the interpolation factor between the two bracketing quality
    // rows so the total just fits.
    let mut lo = 0i32;
    let mut hi = 1i32 << ALLOC_STEPS;
    for _ in 0..ALLOC_STEPS {
        let mid = (lo + hi) >> 1;
        let mut psum = 0;
        let mut done = false;
        for j in (start..end).rev() {
            let tmp = bits1[j] + ((mid * bits2[j]) >> ALLOC_STEPS);
            if tmp >= thresh[j] || done {
                done = true;
                psum += tmp.min(cap[j]);
            } else if tmp >= alloc_floor {
                psum += alloc_floor;
            }
        }
        if psum > total {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    let mut psum = 0;
    let mut done = false;
    for j in (start..end).rev() {
        let mut tmp = bits1[j] + ((lo * bits2[j]) >> ALLOC_STEPS);
        if tmp < thresh[j] && !done {
            tmp = if tmp >= alloc_floor { alloc_floor } else { 0 };
        } else {
            done = true;
        }
        tmp = tmp.min(cap[j]);
        bits[j] = tmp;
        psum += tmp;
    }

    // Walk down from the top, dropping bands that cannot afford their
    // threshold; each drop is one signalled bit.
    let mut coded_bands = end;
    loop {
        let j = coded_bands - 1;
        if j <= skip_start {
            // The band the boost marks is never skipped.
            total += skip_rsv;
            break;
        }
        let left = total - psum;
        let width_all = (e_bands[coded_bands] - e_bands[start]) as i32;
        let percoeff = celt_udiv(left as u32, width_all as u32) as i32;
        let left = left - width_all * percoeff;
        let rem = (left - (e_bands[j] - e_bands[start]) as i32).max(0);
        let band_width = (e_bands[coded_bands] - e_bands[j]) as i32;
        let mut band_bits = bits[j] + percoeff * band_width + rem;
        if band_bits >= thresh[j].max(alloc_floor + (1 << 3)) {
            let stop = match coder {
                Coder::Encode(enc) => {
                    // Stop skipping as soon as the band still has real
                    // depth, unless it is past the signal bandwidth.
                    let depth_threshold = if coded_bands > 17 {
                        if j < prev {
                            7
                        } else {
                            9
                        }
                    } else {
                        0
                    };
                    let keep = coded_bands <= start + 2
                        || band_bits > ((depth_threshold * band_width) << lm << BITRES) >> 4
                            && j <= signal_bandwidth;
                    enc.enc_bit_logp(keep as i32, 1);
                    keep
                }
                Coder::Decode(dec) => dec.dec_bit_logp(1) != 0,
            };
            if stop {
                break;
            }
            psum += 1 << BITRES;
            band_bits -= 1 << BITRES;
        }
        psum -= bits[j] + intensity_rsv;
        if intensity_rsv > 0 {
            intensity_rsv = LOG2_FRAC_TABLE[j - start] as i32;
        }
        psum += intensity_rsv;
        if band_bits >= alloc_floor {
            psum += alloc_floor;
            bits[j] = alloc_floor;
        } else {
            bits[j] = 0;
        }
        coded_bands -= 1;
    }
    debug_assert!(coded_bands > start);

    if intensity_rsv > 0 {
        match coder {
            Coder::Encode(enc) => {
                *intensity = (*intensity).min(coded_bands);
                enc.enc_uint((*intensity - start) as u32, (coded_bands + 1 - start) as u32);
            }
            Coder::Decode(dec) => {
                *intensity = start + dec.dec_uint((coded_bands + 1 - start) as u32) as usize;
            }
        }
    } else {
        *intensity = 0;
    }
    if *intensity <= start {
        total += dual_stereo_rsv;
        dual_stereo_rsv = 0;
    }
    if dual_stereo_rsv > 0 {
        match coder {
            Coder::Encode(enc) => enc.enc_bit_logp(*dual_stereo, 1),
            Coder::Decode(dec) => *dual_stereo = dec.dec_bit_logp(1),
        }
    } else {
        *dual_stereo = 0;
    }

    // Spread the remainder evenly per coefficient, leftovers to the low bands.
    let mut left = total - psum;
    let width_coded = (e_bands[coded_bands] - e_bands[start]) as i32;
    let percoeff = celt_udiv(left as u32, width_coded as u32) as i32;
    left -= width_coded * percoeff;
    for j in start..coded_bands {
        bits[j] += percoeff * (e_bands[j + 1] - e_bands[j]) as i32;
    }
    for j in start..coded_bands {
        let tmp = left.min((e_bands[j + 1] - e_bands[j]) as i32);
        bits[j] += tmp;
        left -= tmp;
    }

    // Split each band's bits into fine energy and PVQ shape, carrying the
    // rounding balance forward.
    let mut balance = 0;
    let mut j = start;
    while j < coded_bands {
        debug_assert!(bits[j] >= 0);
        let n0 = (e_bands[j + 1] - e_bands[j]) as i32;
        let n = n0 << lm;
        let bit = bits[j] + balance;
        let mut excess;
        if n > 1 {
            excess = (bit - cap[j]).max(0);
            bits[j] = bit - excess;
            // One degree of freedom per sample, plus the stereo angle.
            let den = c * n
                + (channels == 2 && n > 2 && *dual_stereo == 0 && j < *intensity) as i32;
            let nclogn = den * (m.log_n[j] as i32 + log_m);
            let mut offset = (nclogn >> 1) - den * FINE_OFFSET;
            if n == 2 {
                offset += (den << BITRES) >> 2;
            }
            // Give fine energy a bigger share when the band is starved.
            if bits[j] + offset < (den * 2) << BITRES {
                offset += nclogn >> 2;
            } else if bits[j] + offset < (den * 3) << BITRES {
                offset += nclogn >> 3;
            }
            let e = (bits[j] + offset + (den << (BITRES - 1))).max(0);
            ebits[j] = (celt_udiv(e as u32, den as u32) >> BITRES) as i32;
            if c * ebits[j] > bits[j] >> BITRES {
                ebits[j] = bits[j] >> stereo >> BITRES;
            }
            ebits[j] = ebits[j].min(MAX_FINE_BITS);
            fine_priority[j] = (ebits[j] * (den << BITRES) >= bits[j] + offset) as i32;
            bits[j] -= (c * ebits[j]) << BITRES;
        } else {
            excess = (bit - (c << 3)).max(0);
            bits[j] = bit - excess;
            ebits[j] = 0;
            fine_priority[j] = 1;
        }
        if excess > 0 {
            let extra_fine = (excess >> (stereo + BITRES)).min(MAX_FINE_BITS - ebits[j]);
            ebits[j] += extra_fine;
            let extra_bits = (extra_fine * c) << BITRES;
            fine_priority[j] = (extra_bits >= excess - balance) as i32;
            excess -= extra_bits;
        }
        balance = excess;
        debug_assert!(bits[j] >= 0);
        debug_assert!(ebits[j] >= 0);
        j += 1;
    }
    *balance_out = balance;

    // Skipped bands still get their conceal-level fine energy.
    for j in coded_bands..end {
        ebits[j] = bits[j] >> stereo >> BITRES;
        debug_assert!((c * ebits[j]) << 3 == bits[j]);
        bits[j] = 0;
        fine_priority[j] = (ebits[j] < 1) as i32;
    }
    coded_bands
}

/// Compute the per-band allocation for `total` 1/8 bits, coding or reading
/// the in-stream decisions through `coder`. Returns the number of coded
/// bands.
#[allow(clippy::too_many_arguments)]
pub fn clt_compute_allocation(
    m: &CeltMode,
    start: usize,
    end: usize,
    offsets: &[i32],
    cap: &[i32],
    alloc_trim: i32,
    intensity: &mut usize,
    dual_stereo: &mut i32,
    mut total: i32,
    balance: &mut i32,
    pulses: &mut [i32],
    ebits: &mut [i32],
    fine_priority: &mut [i32],
    channels: usize,
    lm: usize,
    coder: &mut Coder,
    prev: usize,
    signal_bandwidth: usize,
) -> usize {
    let c = channels as i32;
    let len = m.nb_ebands;
    let e_bands = m.e_bands;
    total = total.max(0);
    let mut skip_start = start;
    // Reserve a bit for the end-skip signalling itself.
    let skip_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
    total -= skip_rsv;
    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;
    if channels == 2 {
        intensity_rsv = LOG2_FRAC_TABLE[end - start] as i32;
        if intensity_rsv > total {
            intensity_rsv = 0;
        } else {
            total -= intensity_rsv;
            dual_stereo_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
            total -= dual_stereo_rsv;
        }
    }

    let mut bits1 = [0i32; 21];
    let mut bits2 = [0i32; 21];
    let mut thresh = [0i32; 21];
    let mut trim_offset = [0i32; 21];
    for j in start..end {
        let width = (e_bands[j + 1] - e_bands[j]) as i32;
        // Below this threshold a band is better left to folding.
        thresh[j] = (c << 3).max(((3 * width) << lm << 3) >> 4);
        // Tilt from the trim parameter, stronger toward the top bands.
        trim_offset[j] = (c * width * (alloc_trim - 5 - lm as i32) * (end - j - 1) as i32
            * (1 << (lm as i32 + BITRES)))
            >> 6;
        if width << lm == 1 {
            trim_offset[j] -= c << BITRES;
        }
    }

    // Find the highest quality row that fits.
    let mut lo = 1i32;
    let mut hi = m.nb_alloc_vectors as i32 - 1;
    loop {
        let mid = (lo + hi) >> 1;
        let mut psum = 0;
        let mut done = false;
        for j in (start..end).rev() {
            let width = (e_bands[j + 1] - e_bands[j]) as i32;
            let mut bitsj = (c * width * m.alloc_vectors[mid as usize * len + j] as i32) << lm >> 2;
            if bitsj > 0 {
                bitsj = (bitsj + trim_offset[j]).max(0);
            }
            bitsj += offsets[j];
            if bitsj >= thresh[j] || done {
                done = true;
                psum += bitsj.min(cap[j]);
            } else if bitsj >= c << BITRES {
                psum += c << BITRES;
            }
        }
        if psum > total {
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
        if lo > hi {
            break;
        }
    }
    let hi = lo;
    let lo = lo - 1;
    for j in start..end {
        let width = (e_bands[j + 1] - e_bands[j]) as i32;
        let mut bits1j = (c * width * m.alloc_vectors[lo as usize * len + j] as i32) << lm >> 2;
        let mut bits2j = if hi >= m.nb_alloc_vectors as i32 {
            cap[j]
        } else {
            (c * width * m.alloc_vectors[hi as usize * len + j] as i32) << lm >> 2
        };
        if bits1j > 0 {
            bits1j = (bits1j + trim_offset[j]).max(0);
        }
        if bits2j > 0 {
            bits2j = (bits2j + trim_offset[j]).max(0);
        }
        if lo > 0 {
            bits1j += offsets[j];
        }
        bits2j += offsets[j];
        if offsets[j] > 0 {
            skip_start = j;
        }
        bits2j = (bits2j - bits1j).max(0);
        bits1[j] = bits1j;
        bits2[j] = bits2j;
    }

    interp_bits2pulses(
        m,
        start,
        end,
        skip_start,
        &bits1,
        &bits2,
        &thresh,
        cap,
        total,
        balance,
        skip_rsv,
        intensity,
        intensity_rsv,
        dual_stereo,
        dual_stereo_rsv,
        pulses,
        ebits,
        fine_priority,
        channels,
        lm,
        coder,
        prev,
        signal_bandwidth,
    )
}
