//! Shared definitions for the range coder (RFC 6716 section 4.1).
//!
//! The coder processes whole bytes: range-coded data grows from the front
//! of the buffer while raw bits are packed backwards from the end, so the
//! two can share one allocation without knowing each other's final size.

use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;

/// Bit resolution of the allocator's fixed point (bits are counted in
/// eighths throughout the allocation machinery).
pub const BITRES: i32 = 3;

/// Which side of the range coder is driving a shared encode/decode path.
/// The allocator and the band quantizer run the same control flow on both
/// sides; only the symbol transfer direction differs.
pub enum Coder<'a, 'b> {
    Encode(&'a mut RangeEncoder<'b>),
    Decode(&'a mut RangeDecoder<'b>),
}

impl Coder<'_, '_> {
    pub fn is_encoder(&self) -> bool {
        matches!(self, Coder::Encode(_))
    }

    pub fn tell(&self) -> i32 {
        match self {
            Coder::Encode(enc) => enc.tell(),
            Coder::Decode(dec) => dec.tell(),
        }
    }

    pub fn tell_frac(&self) -> u32 {
        match self {
            Coder::Encode(enc) => enc.tell_frac(),
            Coder::Decode(dec) => dec.tell_frac(),
        }
    }
}

pub const EC_WINDOW_SIZE: i32 = 32;
/// Bits to output at a time.
pub const EC_SYM_BITS: i32 = 8;
/// Total bits in the coder state.
pub const EC_CODE_BITS: i32 = 32;
pub const EC_SYM_MAX: u32 = (1u32 << EC_SYM_BITS) - 1;
/// Carry bit of the coder state.
pub const EC_CODE_TOP: u32 = 1u32 << (EC_CODE_BITS - 1);
/// Low end of the normalized interval.
pub const EC_CODE_BOT: u32 = EC_CODE_TOP >> EC_SYM_BITS;
/// Number of valid bits in the last input byte of the decoder.
pub const EC_CODE_EXTRA: i32 = (EC_CODE_BITS - 2) % EC_SYM_BITS + 1;
pub const EC_CODE_SHIFT: i32 = EC_CODE_BITS - EC_SYM_BITS - 1;
/// Cut-off above which `encode_uint` splits off raw LSBs.
pub const EC_UINT_BITS: i32 = 8;

/// Smallest x such that v fits in x bits; ilog(0) == 0.
#[inline]
pub fn ec_ilog(v: u32) -> i32 {
    (32 - v.leading_zeros()) as i32
}

/// The reference routes unsigned division through this helper so fixed-point
/// builds can substitute a reciprocal table. Plain division here.
#[inline]
pub fn celt_udiv(n: u32, d: u32) -> u32 {
    debug_assert!(d > 0);
    n / d
}

/// Correction table for the fractional tell, indexed by the top bits of the
/// normalized range.
const CORRECTION: [u32; 8] = [35733, 38967, 42495, 46340, 50535, 55109, 60097, 65535];

/// Bits consumed so far in 1/8 bit units, shared by encoder and decoder.
#[inline]
pub fn ec_tell_frac(nbits_total: i32, rng: u32) -> u32 {
    let nbits = (nbits_total as u32) << BITRES;
    let mut l = ec_ilog(rng);
    let r = rng >> (l - 16);
    let mut b = ((r >> 12) as i32) - 8;
    if r > CORRECTION[b as usize] {
        b += 1;
    }
    l = (l << 3) + b;
    nbits - l as u32
}
