//! Range encoder.

use crate::entcode::*;

/// Snapshot of the encoder cursor, used for the intra/inter coarse energy
/// trial. Does not capture buffer contents; the caller saves the byte range
/// it cares about.
#[derive(Debug, Clone, Copy)]
pub struct EncoderSnapshot {
    offs: u32,
    end_offs: u32,
    end_window: u32,
    nend_bits: i32,
    nbits_total: i32,
    rng: u32,
    val: u32,
    ext: u32,
    rem: i32,
    error: i32,
}

pub struct RangeEncoder<'a> {
    buf: &'a mut [u8],
    /// Usable size of the buffer; may shrink below `buf.len()`.
    storage: u32,
    /// Bytes of range-coded output so far (from the front).
    offs: u32,
    /// Bytes of raw-bit output so far (from the back).
    end_offs: u32,
    /// Pending raw bits not yet flushed to the back of the buffer.
    end_window: u32,
    nend_bits: i32,
    /// Total bits consumed, biased so `tell()` is exact after init.
    nbits_total: i32,
    rng: u32,
    /// Low end of the current interval.
    val: u32,
    /// Count of buffered 0xFF carry bytes.
    ext: u32,
    /// Buffered output byte awaiting a possible carry, -1 before the first.
    rem: i32,
    error: i32,
}

impl<'a> RangeEncoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let storage = buf.len() as u32;
        RangeEncoder {
            buf,
            storage,
            offs: 0,
            end_offs: 0,
            end_window: 0,
            nend_bits: 0,
            nbits_total: EC_CODE_BITS + 1,
            rng: EC_CODE_TOP,
            val: 0,
            ext: 0,
            rem: -1,
            error: 0,
        }
    }

    pub fn range(&self) -> u32 {
        self.rng
    }

    pub fn storage(&self) -> u32 {
        self.storage
    }

    pub fn error(&self) -> bool {
        self.error != 0
    }

    pub fn tell(&self) -> i32 {
        self.nbits_total - ec_ilog(self.rng)
    }

    pub fn tell_frac(&self) -> u32 {
        ec_tell_frac(self.nbits_total, self.rng)
    }

    /// Account for the rest of the frame as used without coding anything.
    /// Used after a silence flag, where the remaining bytes are padding.
    pub fn consume_remaining(&mut self, total_bits: i32) {
        self.nbits_total += total_bits - self.tell();
    }

    pub fn save(&self) -> EncoderSnapshot {
        EncoderSnapshot {
            offs: self.offs,
            end_offs: self.end_offs,
            end_window: self.end_window,
            nend_bits: self.nend_bits,
            nbits_total: self.nbits_total,
            rng: self.rng,
            val: self.val,
            ext: self.ext,
            rem: self.rem,
            error: self.error,
        }
    }

    pub fn restore(&mut self, s: EncoderSnapshot) {
        self.offs = s.offs;
        self.end_offs = s.end_offs;
        self.end_window = s.end_window;
        self.nend_bits = s.nend_bits;
        self.nbits_total = s.nbits_total;
        self.rng = s.rng;
        self.val = s.val;
        self.ext = s.ext;
        self.rem = s.rem;
        self.error = s.error;
    }

    pub fn byte_offset(s: &EncoderSnapshot) -> usize {
        s.offs as usize
    }

    pub fn range_bytes(&self, from: usize, to: usize) -> Vec<u8> {
        self.buf[from..to].to_vec()
    }

    pub fn overwrite_range_bytes(&mut self, from: usize, bytes: &[u8]) {
        self.buf[from..from + bytes.len()].copy_from_slice(bytes);
    }

    fn write_byte(&mut self, value: u32) -> i32 {
        if self.offs + self.end_offs >= self.storage {
            return -1;
        }
        self.buf[self.offs as usize] = value as u8;
        self.offs += 1;
        0
    }

    fn write_byte_at_end(&mut self, value: u32) -> i32 {
        if self.offs + self.end_offs >= self.storage {
            return -1;
        }
        self.end_offs += 1;
        self.buf[(self.storage - self.end_offs) as usize] = value as u8;
        0
    }

    /// Output a symbol, with a carry bit. The carry propagates into `rem`
    /// and any run of buffered 0xFF bytes.
    fn carry_out(&mut self, c: i32) {
        if c as u32 != EC_SYM_MAX {
            let carry = c >> EC_SYM_BITS;
            if self.rem >= 0 {
                let b = (self.rem + carry) as u32;
                self.error |= self.write_byte(b);
            }
            if self.ext > 0 {
                let sym = (EC_SYM_MAX.wrapping_add(carry as u32)) & EC_SYM_MAX;
                while self.ext > 0 {
                    self.error |= self.write_byte(sym);
                    self.ext -= 1;
                }
            }
            self.rem = c & EC_SYM_MAX as i32;
        } else {
            self.ext += 1;
        }
    }

    fn normalize(&mut self) {
        while self.rng <= EC_CODE_BOT {
            self.carry_out((self.val >> EC_CODE_SHIFT) as i32);
            self.val = (self.val << EC_SYM_BITS) & (EC_CODE_TOP - 1);
            self.rng <<= EC_SYM_BITS;
            self.nbits_total += EC_SYM_BITS;
        }
    }

    /// Encode the symbol occupying cumulative frequency [fl, fh) out of ft.
    pub fn encode(&mut self, fl: u32, fh: u32, ft: u32) {
        let r = celt_udiv(self.rng, ft);
        if fl > 0 {
            self.val = self.val.wrapping_add(self.rng.wrapping_sub(r * (ft - fl)));
            self.rng = r * (fh - fl);
        } else {
            self.rng = self.rng.wrapping_sub(r * (ft - fh));
        }
        self.normalize();
    }

    /// Same with ft an exact power of two (1 << bits).
    pub fn encode_bin(&mut self, fl: u32, fh: u32, bits: u32) {
        let r = self.rng >> bits;
        if fl > 0 {
            self.val = self
                .val
                .wrapping_add(self.rng.wrapping_sub(r * ((1u32 << bits) - fl)));
            self.rng = r * (fh - fl);
        } else {
            self.rng = self.rng.wrapping_sub(r * ((1u32 << bits) - fh));
        }
        self.normalize();
    }

    /// One bit with probability of a one equal to 1/2^logp.
    pub fn enc_bit_logp(&mut self, val: i32, logp: u32) {
        let r = self.rng;
        let l = r >> logp;
        if val != 0 {
            self.val = self.val.wrapping_add(r - l);
        }
        self.rng = if val != 0 { l } else { r - l };
        self.normalize();
    }

    /// Symbol from an inverse CDF table with total 1 << ftb.
    pub fn enc_icdf(&mut self, s: usize, icdf: &[u8], ftb: u32) {
        let r = self.rng >> ftb;
        if s > 0 {
            self.val = self
                .val
                .wrapping_add(self.rng.wrapping_sub(r * icdf[s - 1] as u32));
            self.rng = r * (icdf[s - 1] as u32 - icdf[s] as u32);
        } else {
            self.rng = self.rng.wrapping_sub(r * icdf[s] as u32);
        }
        self.normalize();
    }

    /// Integer uniform on [0, ft). Above EC_UINT_BITS of range the low bits
    /// go out as raw bits; the split point affects the bit cost and must
    /// match the decoder exactly.
    pub fn enc_uint(&mut self, fl: u32, ft: u32) {
        debug_assert!(ft > 1);
        let ft = ft - 1;
        let mut ftb = ec_ilog(ft);
        if ftb > EC_UINT_BITS {
            ftb -= EC_UINT_BITS;
            let ft1 = (ft >> ftb) + 1;
            let fl1 = fl >> ftb;
            self.encode(fl1, fl1 + 1, ft1);
            self.enc_bits(fl & ((1u32 << ftb) - 1), ftb as u32);
        } else {
            self.encode(fl, fl + 1, ft + 1);
        }
    }

    /// Raw bits, packed backwards from the end of the buffer.
    pub fn enc_bits(&mut self, fl: u32, bits: u32) {
        debug_assert!(bits > 0);
        let mut window = self.end_window;
        let mut used = self.nend_bits;
        if used + bits as i32 > EC_WINDOW_SIZE {
            loop {
                self.error |= self.write_byte_at_end(window & EC_SYM_MAX);
                window >>= EC_SYM_BITS;
                used -= EC_SYM_BITS;
                if used < EC_SYM_BITS {
                    break;
                }
            }
        }
        window |= fl << used;
        used += bits as i32;
        self.end_window = window;
        self.nend_bits = used;
        self.nbits_total += bits as i32;
    }

    /// Reduce the usable buffer size, moving the raw-bit tail down.
    pub fn shrink(&mut self, size: u32) {
        debug_assert!(self.offs + self.end_offs <= size);
        let src = (self.storage - self.end_offs) as usize;
        let dst = (size - self.end_offs) as usize;
        self.buf.copy_within(src..src + self.end_offs as usize, dst);
        self.storage = size;
    }

    /// Terminate the stream: output just enough bits to make the encoded
    /// symbols unambiguous, flush raw bits, zero the slack in between.
    pub fn done(&mut self) {
        let mut l = EC_CODE_BITS - ec_ilog(self.rng);
        let mut msk = (EC_CODE_TOP - 1) >> l;
        let mut end = self.val.wrapping_add(msk) & !msk;
        if (end | msk) >= self.val.wrapping_add(self.rng) {
            l += 1;
            msk >>= 1;
            end = self.val.wrapping_add(msk) & !msk;
        }
        while l > 0 {
            self.carry_out((end >> EC_CODE_SHIFT) as i32);
            end = (end << EC_SYM_BITS) & (EC_CODE_TOP - 1);
            l -= EC_SYM_BITS;
        }
        if self.rem >= 0 || self.ext > 0 {
            self.carry_out(0);
        }
        let mut window = self.end_window;
        let mut used = self.nend_bits;
        while used >= EC_SYM_BITS {
            self.error |= self.write_byte_at_end(window & EC_SYM_MAX);
            window >>= EC_SYM_BITS;
            used -= EC_SYM_BITS;
        }
        if self.error == 0 {
            let a = self.offs as usize;
            let b = (self.storage - self.end_offs) as usize;
            self.buf[a..b].fill(0);
            if used > 0 {
                if self.end_offs >= self.storage {
                    self.error = -1;
                } else {
                    let l = -l;
                    // Don't corrupt range data if we've busted.
                    if self.offs + self.end_offs >= self.storage && l < used {
                        window &= (1u32 << l) - 1;
                        self.error = -1;
                    }
                    let idx = (self.storage - self.end_offs - 1) as usize;
                    self.buf[idx] |= window as u8;
                }
            }
        }
    }
}
