//! Range decoder.

use crate::entcode::*;

pub struct RangeDecoder<'a> {
    buf: &'a [u8],
    storage: u32,
    /// Bytes of range-coded input consumed (from the front).
    offs: u32,
    /// Bytes of raw-bit input consumed (from the back).
    end_offs: u32,
    end_window: u32,
    nend_bits: i32,
    nbits_total: i32,
    rng: u32,
    /// Difference between the input value and the low end of the interval.
    val: u32,
    /// Saved normalization factor from `decode()`.
    ext: u32,
    /// Last byte read in from the front.
    rem: i32,
    error: i32,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        let storage = buf.len() as u32;
        let mut dec = RangeDecoder {
            buf,
            storage,
            offs: 0,
            end_offs: 0,
            end_window: 0,
            nend_bits: 0,
            // The final normalization in init reads extra bits; the bias
            // makes tell() come out right.
            nbits_total: EC_CODE_BITS + 1
                - ((EC_CODE_BITS - EC_CODE_EXTRA) / EC_SYM_BITS) * EC_SYM_BITS,
            rng: 1u32 << EC_CODE_EXTRA,
            val: 0,
            ext: 0,
            rem: 0,
            error: 0,
        };
        dec.rem = dec.read_byte() as i32;
        dec.val = dec.rng - 1 - ((dec.rem as u32) >> (EC_SYM_BITS - EC_CODE_EXTRA));
        dec.normalize();
        dec
    }

    pub fn range(&self) -> u32 {
        self.rng
    }

    pub fn storage(&self) -> u32 {
        self.storage
    }

    /// Set once any read runs past the available bytes; surfaced as a
    /// malformed-stream error at end of frame.
    pub fn error(&self) -> bool {
        self.error != 0
    }

    pub fn mark_error(&mut self) {
        self.error = 1;
    }

    pub fn tell(&self) -> i32 {
        self.nbits_total - ec_ilog(self.rng)
    }

    /// Account for the rest of the frame as consumed without reading it.
    /// Used after a silence flag, where the remaining bytes are padding.
    pub fn consume_remaining(&mut self, total_bits: i32) {
        self.nbits_total += total_bits - self.tell();
    }

    pub fn tell_frac(&self) -> u32 {
        ec_tell_frac(self.nbits_total, self.rng)
    }

    /// Padding past the end reads as zero.
    fn read_byte(&mut self) -> u32 {
        if self.offs < self.storage {
            let b = self.buf[self.offs as usize];
            self.offs += 1;
            b as u32
        } else {
            0
        }
    }

    fn read_byte_from_end(&mut self) -> u32 {
        if self.end_offs < self.storage {
            self.end_offs += 1;
            self.buf[(self.storage - self.end_offs) as usize] as u32
        } else {
            0
        }
    }

    fn normalize(&mut self) {
        while self.rng <= EC_CODE_BOT {
            self.nbits_total += EC_SYM_BITS;
            self.rng <<= EC_SYM_BITS;
            let mut sym = self.rem as u32;
            self.rem = self.read_byte() as i32;
            sym = ((sym << EC_SYM_BITS) | self.rem as u32) >> (EC_SYM_BITS - EC_CODE_EXTRA);
            self.val =
                ((self.val << EC_SYM_BITS).wrapping_add(EC_SYM_MAX & !sym)) & (EC_CODE_TOP - 1);
        }
    }

    /// Begin decoding a symbol with total frequency ft; returns a frequency
    /// value to look up in the model. Must be followed by `dec_update`.
    pub fn decode(&mut self, ft: u32) -> u32 {
        self.ext = celt_udiv(self.rng, ft);
        let s = self.val / self.ext;
        ft - (s + 1).min(ft)
    }

    pub fn decode_bin(&mut self, bits: u32) -> u32 {
        self.ext = self.rng >> bits;
        let s = self.val / self.ext;
        (1u32 << bits) - (s + 1).min(1u32 << bits)
    }

    pub fn dec_update(&mut self, fl: u32, fh: u32, ft: u32) {
        let s = self.ext * (ft - fh);
        self.val -= s;
        self.rng = if fl > 0 {
            self.ext * (fh - fl)
        } else {
            self.rng - s
        };
        self.normalize();
    }

    pub fn dec_bit_logp(&mut self, logp: u32) -> i32 {
        let r = self.rng;
        let d = self.val;
        let s = r >> logp;
        let ret = (d < s) as i32;
        if ret == 0 {
            self.val = d - s;
        }
        self.rng = if ret != 0 { s } else { r - s };
        self.normalize();
        ret
    }

    pub fn dec_icdf(&mut self, icdf: &[u8], ftb: u32) -> i32 {
        let mut t;
        let mut s = self.rng;
        let d = self.val;
        let r = s >> ftb;
        let mut ret: i32 = -1;
        loop {
            ret += 1;
            t = s;
            s = r * icdf[ret as usize] as u32;
            if d >= s {
                break;
            }
        }
        self.val = d - s;
        self.rng = t - s;
        self.normalize();
        ret
    }

    pub fn dec_uint(&mut self, ft: u32) -> u32 {
        debug_assert!(ft > 1);
        let ft0 = ft - 1;
        let mut ftb = ec_ilog(ft0);
        if ftb > EC_UINT_BITS {
            ftb -= EC_UINT_BITS;
            let ft1 = (ft0 >> ftb) + 1;
            let s = self.decode(ft1);
            self.dec_update(s, s + 1, ft1);
            let t = (s << ftb) | self.dec_bits(ftb as u32);
            if t <= ft0 {
                return t;
            }
            self.error = 1;
            ft0
        } else {
            let s = self.decode(ft0 + 1);
            self.dec_update(s, s + 1, ft0 + 1);
            s
        }
    }

    /// Raw bits, read backwards from the end of the buffer.
    pub fn dec_bits(&mut self, bits: u32) -> u32 {
        let mut window = self.end_window;
        let mut available = self.nend_bits;
        if (available as u32) < bits {
            loop {
                window |= self.read_byte_from_end() << available;
                available += EC_SYM_BITS;
                if available > EC_WINDOW_SIZE - EC_SYM_BITS {
                    break;
                }
            }
        }
        let ret = window & ((1u32 << bits) - 1);
        window >>= bits;
        available -= bits as i32;
        self.end_window = window;
        self.nend_bits = available;
        self.nbits_total += bits as i32;
        ret
    }
}
