//! Frame encoder: signal analysis, bit-budget decisions, band quantization.

use log::{debug, trace};

use crate::bands::{
    compute_band_energies, haar1, hysteresis_decision, normalise_bands, quant_all_bands,
    spreading_decision, SPREAD_NONE, SPREAD_NORMAL,
};
use crate::celt::{init_caps, SPREAD_ICDF, TF_SELECT_TABLE, TRIM_ICDF};
use crate::celt_decoder::MAX_PACKET_BYTES;
use crate::entcode::{Coder, BITRES};
use crate::entenc::RangeEncoder;
use crate::error::{Error, Result};
use crate::mathops::{celt_exp2, celt_inner_prod, celt_log2, celt_maxabs16, celt_sqrt, EPSILON};
use crate::mdct::mdct_forward;
use crate::modes::{lm_for_frame_size, mode48000_960_120, CeltMode};
use crate::quant_bands::{amp2_log2, quant_coarse_energy, quant_energy_finalise, quant_fine_energy};
use crate::rate::clt_compute_allocation;

const SIG_SCALE: f32 = 32768.0;
/// Input resolution assumed when deciding whether a frame is digital silence.
const LSB_DEPTH: i32 = 24;

pub struct CeltEncoder {
    mode: &'static CeltMode,
    channels: usize,
    start: usize,
    end: usize,
    complexity: i32,
    force_intra: bool,
    clip: bool,
    disable_inv: bool,
    rng: u32,
    spread_decision: i32,
    delayed_intra: f32,
    tonal_average: i32,
    last_coded_bands: usize,
    hf_average: i32,
    tapset_decision: i32,
    consec_transient: i32,
    intensity: usize,
    stereo_saving: f32,
    overlap_max: f32,
    preemph_mem: [f32; 2],
    /// channels * overlap samples carried between frames.
    in_mem: Vec<f32>,
    old_band_e: Vec<f32>,
    old_log_e: Vec<f32>,
    old_log_e2: Vec<f32>,
    /// Coarse+fine quantization residual, fed back into the next frame.
    energy_error: Vec<f32>,
}

impl CeltEncoder {
    pub fn new(channels: usize) -> Result<CeltEncoder> {
        if channels == 0 || channels > 2 {
            return Err(Error::InvalidConfiguration("channels must be 1 or 2"));
        }
        let mode = mode48000_960_120()?;
        let nb = mode.nb_ebands;
        let mut st = CeltEncoder {
            mode,
            channels,
            start: 0,
            end: mode.eff_ebands,
            complexity: 5,
            force_intra: false,
            clip: true,
            disable_inv: channels == 1,
            rng: 0,
            spread_decision: SPREAD_NORMAL,
            delayed_intra: 1.0,
            tonal_average: 256,
            last_coded_bands: 0,
            hf_average: 0,
            tapset_decision: 0,
            consec_transient: 0,
            intensity: 0,
            stereo_saving: 0.0,
            overlap_max: 0.0,
            preemph_mem: [0.0; 2],
            in_mem: vec![0.0; channels * mode.overlap],
            old_band_e: vec![0.0; channels * nb],
            old_log_e: vec![0.0; channels * nb],
            old_log_e2: vec![0.0; channels * nb],
            energy_error: vec![0.0; channels * nb],
        };
        st.reset();
        Ok(st)
    }

    pub fn reset(&mut self) {
        self.rng = 0;
        self.spread_decision = SPREAD_NORMAL;
        self.delayed_intra = 1.0;
        self.tonal_average = 256;
        self.last_coded_bands = 0;
        self.hf_average = 0;
        self.tapset_decision = 0;
        self.consec_transient = 0;
        self.intensity = 0;
        self.stereo_saving = 0.0;
        self.overlap_max = 0.0;
        self.preemph_mem = [0.0; 2];
        self.in_mem.fill(0.0);
        self.old_band_e.fill(0.0);
        self.old_log_e.fill(-28.0);
        self.old_log_e2.fill(-28.0);
        self.energy_error.fill(0.0);
    }

    /// Trade encoding quality for speed; 0 is cheapest, 10 is best.
    pub fn set_complexity(&mut self, value: i32) -> Result<()> {
        if !(0..=10).contains(&value) {
            return Err(Error::InvalidConfiguration("complexity must be 0..=10"));
        }
        self.complexity = value;
        Ok(())
    }

    pub fn set_force_intra(&mut self, enabled: bool) {
        self.force_intra = enabled;
    }

    pub fn set_phase_inversion_disabled(&mut self, disabled: bool) {
        self.disable_inv = disabled;
    }

    pub fn final_range(&self) -> u32 {
        self.rng
    }

    /// Encode one frame of interleaved samples (±1.0 nominal range) into
    /// `out`, filling it completely. Returns the number of bytes written.
    pub fn encode(&mut self, pcm: &[f32], frame_size: usize, out: &mut [u8]) -> Result<usize> {
        let mode = self.mode;
        let nb = mode.nb_ebands;
        let channels = self.channels;
        let overlap = mode.overlap;
        let lm = lm_for_frame_size(mode, frame_size)?;
        if pcm.len() < channels * frame_size {
            return Err(Error::InvalidConfiguration("input buffer too small"));
        }
        if out.len() < 2 {
            return Err(Error::BufferOverflow);
        }
        let nb_bytes = out.len().min(MAX_PACKET_BYTES);
        let n = mode.short_mdct_size << lm;
        let start = self.start;
        let end = self.end;
        let eff_end = end.min(mode.eff_ebands);
        let effective_bytes = nb_bytes as i32;
        let total_bits = nb_bytes as i32 * 8;
        // What a VBR stream of this size would spend after per-frame
        // overheads; drives the stereo and trim decisions.
        let equiv_rate = ((nb_bytes as i32 * 400) >> (3 - lm))
            - (40 * channels as i32 + 20) * ((400 >> lm) - 50);
        let mut enc = RangeEncoder::new(&mut out[..nb_bytes]);

        let main_len = channels * (n - overlap);
        let mut sample_max = self.overlap_max.max(celt_maxabs16(&pcm[..main_len]));
        self.overlap_max = celt_maxabs16(&pcm[main_len..channels * n]);
        sample_max = sample_max.max(self.overlap_max);
        let silence = sample_max <= 1.0 / (1i32 << LSB_DEPTH) as f32;
        enc.enc_bit_logp(silence as i32, 15);
        if silence {
            // The rest of the frame is padding.
            enc.consume_remaining(total_bits);
        }
        trace!("frame header: lm={lm} silence={silence}");

        let mut in_buf = vec![0.0f32; channels * (n + overlap)];
        let need_clip = self.clip && sample_max > 2.0;
        for c in 0..channels {
            let base = c * (n + overlap);
            in_buf[base..base + overlap]
                .copy_from_slice(&self.in_mem[c * overlap..(c + 1) * overlap]);
            preemphasis(
                pcm,
                &mut in_buf[base + overlap..base + overlap + n],
                channels,
                c,
                mode.preemph[0],
                &mut self.preemph_mem[c],
                need_clip,
            );
            self.in_mem[c * overlap..(c + 1) * overlap]
                .copy_from_slice(&in_buf[base + n..base + n + overlap]);
        }

        // Post-filter search is not implemented; signal it off whenever the
        // bitstream has room for the flag.
        if start == 0 && enc.tell() + 16 <= total_bits {
            enc.enc_bit_logp(0, 1);
        }

        let mut tf_estimate = 0.0f32;
        let mut tf_chan = 0usize;
        let mut is_transient = false;
        if self.complexity >= 1 {
            is_transient = transient_analysis(
                &in_buf,
                n + overlap,
                channels,
                &mut tf_estimate,
                &mut tf_chan,
            );
        }
        let mut transient_got_disabled = false;
        let mut short_blocks = 0usize;
        if lm > 0 && enc.tell() + 3 <= total_bits {
            if is_transient {
                short_blocks = 1 << lm;
            }
        } else {
            is_transient = false;
            transient_got_disabled = true;
        }

        // Strided forward MDCT slices reach (1 << lm) - 1 past the end.
        let mut freq = vec![0.0f32; channels * n + (1 << lm) - 1];
        let mut band_e = vec![0.0f32; channels * nb];
        let mut band_log_e = vec![0.0f32; channels * nb];
        let mut band_log_e2 = vec![0.0f32; channels * nb];
        let second_mdct = short_blocks != 0 && self.complexity >= 8;
        if second_mdct {
            compute_mdcts(mode, 0, &in_buf, &mut freq, channels, lm);
            compute_band_energies(mode, &freq, &mut band_e, eff_end, channels, lm);
            amp2_log2(mode, eff_end, end, &band_e, &mut band_log_e2, channels);
            for v in band_log_e2.iter_mut() {
                *v += 0.5 * lm as f32;
            }
        }
        compute_mdcts(mode, short_blocks, &in_buf, &mut freq, channels, lm);
        compute_band_energies(mode, &freq, &mut band_e, eff_end, channels, lm);
        amp2_log2(mode, eff_end, end, &band_e, &mut band_log_e, channels);
        if !second_mdct {
            band_log_e2.copy_from_slice(&band_log_e);
        }

        if lm > 0
            && enc.tell() + 3 <= total_bits
            && !is_transient
            && self.complexity >= 5
            && patch_transient_decision(&band_log_e, &self.old_band_e, nb, start, end, channels)
        {
            is_transient = true;
            short_blocks = 1 << lm;
            compute_mdcts(mode, short_blocks, &in_buf, &mut freq, channels, lm);
            compute_band_energies(mode, &freq, &mut band_e, eff_end, channels, lm);
            amp2_log2(mode, eff_end, end, &band_e, &mut band_log_e, channels);
            for v in band_log_e2.iter_mut() {
                *v += 0.5 * lm as f32;
            }
            tf_estimate = 0.2;
        }
        if lm > 0 && enc.tell() + 3 <= total_bits {
            enc.enc_bit_logp(is_transient as i32, 3);
        }
        trace!("transient={is_transient} tf_estimate={tf_estimate:.3} short_blocks={short_blocks}");

        let mut x = vec![0.0f32; channels * n];
        normalise_bands(mode, &freq, &mut x, &band_e, eff_end, channels, lm);

        let enable_tf_analysis =
            effective_bytes >= 15 * channels as i32 && self.complexity >= 2;
        let mut offsets = vec![0i32; nb];
        let mut importance = vec![0i32; nb];
        let mut spread_weight = vec![0i32; nb];
        dynalloc_analysis(
            &band_log_e,
            &band_log_e2,
            nb,
            start,
            end,
            channels,
            &mut offsets,
            mode.log_n,
            is_transient,
            mode.e_bands,
            lm,
            effective_bytes,
            &mut importance,
            &mut spread_weight,
        );

        let mut tf_res = vec![0i32; nb];
        let tf_select;
        if enable_tf_analysis {
            let lambda = 80.max(20480 / effective_bytes + 2);
            tf_select = tf_analysis(
                mode,
                eff_end,
                is_transient,
                &mut tf_res,
                lambda,
                &x,
                n,
                lm,
                tf_estimate,
                tf_chan,
                &importance,
            );
            for i in eff_end..end {
                tf_res[i] = tf_res[eff_end - 1];
            }
        } else {
            for r in tf_res[..end].iter_mut() {
                *r = is_transient as i32;
            }
            tf_select = 0;
        }

        let mut error = vec![0.0f32; channels * nb];
        for c in 0..channels {
            for i in start..end {
                let idx = i + c * nb;
                // Small drifts get corrected with the leftover quantization
                // error from the previous frame.
                if (band_log_e[idx] - self.old_band_e[idx]).abs() < 2.0 {
                    band_log_e[idx] -= self.energy_error[idx] * 0.25;
                }
            }
        }
        quant_coarse_energy(
            mode,
            start,
            end,
            eff_end,
            &band_log_e,
            &mut self.old_band_e,
            total_bits as u32,
            &mut error,
            &mut enc,
            channels,
            lm,
            nb_bytes as i32,
            self.force_intra,
            &mut self.delayed_intra,
            self.complexity >= 4,
            0,
        );

        tf_encode(start, end, is_transient, &mut tf_res, lm, tf_select, &mut enc);

        if enc.tell() + 4 <= total_bits {
            if short_blocks != 0
                || self.complexity < 3
                || (nb_bytes as i32) < 10 * channels as i32
            {
                self.spread_decision = if self.complexity == 0 {
                    SPREAD_NONE
                } else {
                    SPREAD_NORMAL
                };
            } else {
                self.spread_decision = spreading_decision(
                    mode,
                    &x,
                    &mut self.tonal_average,
                    self.spread_decision,
                    &mut self.hf_average,
                    &mut self.tapset_decision,
                    false,
                    eff_end,
                    channels,
                    lm,
                    &spread_weight,
                );
            }
            enc.enc_icdf(self.spread_decision as usize, &SPREAD_ICDF, 5);
        }

        let mut cap = vec![0i32; nb];
        init_caps(mode, &mut cap, lm, channels);
        let mut dynalloc_logp = 6i32;
        let total_bits_q3 = total_bits << BITRES;
        let mut total_boost = 0i32;
        let mut tell_frac = enc.tell_frac() as i32;
        for i in start..end {
            let width =
                ((channels as i32) * (mode.e_bands[i + 1] - mode.e_bands[i]) as i32) << lm;
            let quanta = (width << 3).min((6 << 3).max(width));
            let mut dynalloc_loop_logp = dynalloc_logp;
            let mut boost = 0;
            let mut j = 0;
            while tell_frac + (dynalloc_loop_logp << BITRES) < total_bits_q3 - total_boost
                && boost < cap[i]
            {
                let flag = j < offsets[i];
                enc.enc_bit_logp(flag as i32, dynalloc_loop_logp as u32);
                tell_frac = enc.tell_frac() as i32;
                if !flag {
                    break;
                }
                boost += quanta;
                total_boost += quanta;
                dynalloc_loop_logp = 1;
                j += 1;
            }
            if j > 0 {
                dynalloc_logp = 2.max(dynalloc_logp - 1);
            }
            offsets[i] = boost;
        }

        let mut dual_stereo = 0i32;
        if channels == 2 {
            if lm != 0 {
                dual_stereo = stereo_analysis(mode, &x, lm, n);
            }
            self.intensity = hysteresis_decision(
                (equiv_rate / 1000) as f32,
                &INTENSITY_THRESHOLDS,
                &INTENSITY_HISTERESIS,
                self.intensity,
            );
            self.intensity = end.min(start.max(self.intensity));
        }

        let mut alloc_trim = 5i32;
        if tell_frac + (6 << BITRES) <= total_bits_q3 - total_boost {
            if start > 0 {
                self.stereo_saving = 0.0;
            } else {
                alloc_trim = alloc_trim_analysis(
                    mode,
                    &x,
                    &band_log_e,
                    end,
                    lm,
                    channels,
                    n,
                    &mut self.stereo_saving,
                    tf_estimate,
                    self.intensity,
                    equiv_rate,
                );
            }
            enc.enc_icdf(alloc_trim as usize, &TRIM_ICDF, 7);
        }

        let mut bits = ((nb_bytes as i32 * 8) << BITRES) - enc.tell_frac() as i32 - 1;
        let anti_collapse_rsv = if is_transient && lm >= 2 && bits >= ((lm as i32) + 2) << BITRES
        {
            1 << BITRES
        } else {
            0
        };
        bits -= anti_collapse_rsv;
        let signal_bandwidth = end - 1;

        let mut pulses = vec![0i32; nb];
        let mut fine_quant = vec![0i32; nb];
        let mut fine_priority = vec![0i32; nb];
        let mut balance = 0i32;
        let coded_bands = {
            let mut coder = Coder::Encode(&mut enc);
            clt_compute_allocation(
                mode,
                start,
                end,
                &offsets,
                &cap,
                alloc_trim,
                &mut self.intensity,
                &mut dual_stereo,
                bits,
                &mut balance,
                &mut pulses,
                &mut fine_quant,
                &mut fine_priority,
                channels,
                lm,
                &mut coder,
                self.last_coded_bands,
                signal_bandwidth,
            )
        };
        self.last_coded_bands = if self.last_coded_bands != 0 {
            (self.last_coded_bands + 1).min((self.last_coded_bands - 1).max(coded_bands))
        } else {
            coded_bands
        };

        quant_fine_energy(
            mode,
            start,
            end,
            &mut self.old_band_e,
            &mut error,
            &fine_quant,
            &mut enc,
            channels,
        );

        let mut collapse_masks = vec![0u8; channels * nb];
        {
            let mut coder = Coder::Encode(&mut enc);
            let quant_total = nb_bytes as i32 * (8 << BITRES) - anti_collapse_rsv;
            if channels == 2 {
                let (xl, xr) = x.split_at_mut(n);
                quant_all_bands(
                    mode,
                    start,
                    end,
                    xl,
                    Some(xr),
                    &mut collapse_masks,
                    &band_e,
                    &pulses,
                    short_blocks != 0,
                    self.spread_decision,
                    dual_stereo,
                    self.intensity,
                    &tf_res,
                    quant_total,
                    balance,
                    &mut coder,
                    lm,
                    coded_bands,
                    &mut self.rng,
                    self.complexity,
                    self.disable_inv,
                );
            } else {
                quant_all_bands(
                    mode,
                    start,
                    end,
                    &mut x,
                    None,
                    &mut collapse_masks,
                    &band_e,
                    &pulses,
                    short_blocks != 0,
                    self.spread_decision,
                    dual_stereo,
                    self.intensity,
                    &tf_res,
                    quant_total,
                    balance,
                    &mut coder,
                    lm,
                    coded_bands,
                    &mut self.rng,
                    self.complexity,
                    self.disable_inv,
                );
            }
        }

        if anti_collapse_rsv > 0 {
            let anti_collapse_on = self.consec_transient < 2;
            enc.enc_bits(anti_collapse_on as u32, 1);
        }

        quant_energy_finalise(
            mode,
            start,
            end,
            &mut self.old_band_e,
            &mut error,
            &fine_quant,
            &fine_priority,
            nb_bytes as i32 * 8 - enc.tell(),
            &mut enc,
            channels,
        );

        self.energy_error.fill(0.0);
        for c in 0..channels {
            for i in start..end {
                let idx = i + c * nb;
                self.energy_error[idx] = error[idx].clamp(-0.5, 0.5);
            }
        }

        if silence {
            self.old_band_e.fill(-28.0);
        }
        if !is_transient {
            self.old_log_e2.copy_from_slice(&self.old_log_e);
            self.old_log_e.copy_from_slice(&self.old_band_e);
        } else {
            for i in 0..channels * nb {
                self.old_log_e[i] = self.old_log_e[i].min(self.old_band_e[i]);
            }
        }
        for c in 0..channels {
            for i in (0..start).chain(end..nb) {
                self.old_band_e[c * nb + i] = 0.0;
                self.old_log_e[c * nb + i] = -28.0;
                self.old_log_e2[c * nb + i] = -28.0;
            }
        }
        if is_transient || transient_got_disabled {
            self.consec_transient += 1;
        } else {
            self.consec_transient = 0;
        }

        self.rng = enc.range();
        enc.done();
        if enc.error() {
            return Err(Error::BufferOverflow);
        }
        debug!(
            "encoded {frame_size} samples -> {nb_bytes} bytes, coded_bands={coded_bands}, range={:#010x}",
            self.rng
        );
        Ok(nb_bytes)
    }
}

/// Scale one channel up to the signal range and apply the first-order
/// preemphasis filter.
fn preemphasis(
    pcm: &[f32],
    inp: &mut [f32],
    channels: usize,
    c: usize,
    coef0: f32,
    mem: &mut f32,
    clip: bool,
) {
    let mut m = *mem;
    for (i, v) in inp.iter_mut().enumerate() {
        let mut x = pcm[channels * i + c] * SIG_SCALE;
        if clip {
            x = x.clamp(-65536.0, 65536.0);
        }
        *v = x - m;
        m = coef0 * x;
    }
    *mem = m;
}

/// Forward MDCT of a whole frame, interleaving the sub-blocks of a short
/// (transient) frame.
fn compute_mdcts(
    mode: &CeltMode,
    short_blocks: usize,
    input: &[f32],
    out: &mut [f32],
    channels: usize,
    lm: usize,
) {
    let overlap = mode.overlap;
    let (blocks, n, shift) = if short_blocks != 0 {
        (short_blocks, mode.short_mdct_size, mode.max_lm)
    } else {
        (1, mode.short_mdct_size << lm, mode.max_lm - lm)
    };
    for c in 0..channels {
        for b in 0..blocks {
            let in_base = c * (blocks * n + overlap) + b * n;
            let out_base = b + c * n * blocks;
            mdct_forward(
                &mode.mdct,
                &input[in_base..in_base + n + overlap],
                &mut out[out_base..out_base + n * blocks],
                &mode.window,
                overlap,
                shift,
                blocks,
            );
        }
    }
}

/// Detect sharp onsets from the unmasking profile of a high-passed version
/// of the input. Also produces a [0,1) estimate of how much time resolution
/// the frame wants.
fn transient_analysis(
    input: &[f32],
    len: usize,
    channels: usize,
    tf_estimate: &mut f32,
    tf_chan: &mut usize,
) -> bool {
    // 1/x in Q8 for the unmasking metric.
    const INV_TABLE: [u8; 128] = [
        255, 255, 156, 110, 86, 70, 59, 51, 45, 40, 37, 33, 31, 28, 26, 25, 23, 22, 21, 20, 19,
        18, 17, 16, 16, 15, 15, 14, 13, 13, 12, 12, 12, 12, 11, 11, 11, 10, 10, 10, 9, 9, 9, 9, 9,
        9, 8, 8, 8, 8, 8, 7, 7, 7, 7, 7, 7, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 5, 5,
        5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
        4, 4, 4, 4, 4, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 2,
    ];
    let len2 = len / 2;
    let mut tmp = vec![0.0f32; len];
    let mut mask_metric = 0i32;
    for c in 0..channels {
        let mut mem0 = 0.0f32;
        let mut mem1 = 0.0f32;
        for i in 0..len {
            let x = input[c * len + i];
            let y = mem0 + x;
            mem0 = mem1 + y - 2.0 * x;
            mem1 = x - 0.5 * y;
            tmp[i] = y;
        }
        // Filter warmup.
        tmp[..12].fill(0.0);
        let mut mean = 0.0f32;
        let mut mem = 0.0f32;
        for i in 0..len2 {
            let x2 = tmp[2 * i] * tmp[2 * i] + tmp[2 * i + 1] * tmp[2 * i + 1];
            mean += x2;
            tmp[i] = mem + 0.0625 * (x2 - mem);
            mem = tmp[i];
        }
        mem = 0.0;
        let mut max_e = 0.0f32;
        for i in (0..len2).rev() {
            tmp[i] = mem + 0.125 * (tmp[i] - mem);
            mem = tmp[i];
            max_e = max_e.max(mem);
        }
        // Geometric mean of the mean energy and the peak of the smoothed
        // envelope.
        let mean = celt_sqrt(mean * max_e * 0.5 * len2 as f32);
        let norm = len2 as f32 / (1e-15 + mean);
        let mut unmask = 0i32;
        let mut i = 12;
        while i < len2 - 5 {
            let id = (64.0 * norm * (tmp[i] + 1e-15)).floor().clamp(0.0, 127.0) as usize;
            unmask += INV_TABLE[id] as i32;
            i += 4;
        }
        let unmask = 64 * unmask * 4 / (6 * (len2 as i32 - 17));
        if unmask > mask_metric {
            *tf_chan = c;
            mask_metric = unmask;
        }
    }
    let tf_max = (celt_sqrt((27 * mask_metric) as f32) - 42.0).max(0.0);
    *tf_estimate = ((0.0069f64 * tf_max.min(163.0) as f64 - 0.139).max(0.0)).sqrt() as f32;
    mask_metric > 200
}

/// Late transient check on the band energies: a big rise over the spread of
/// the previous frame's energy forces short blocks even when the time-domain
/// analysis missed it.
fn patch_transient_decision(
    new_e: &[f32],
    old_e: &[f32],
    nb: usize,
    start: usize,
    end: usize,
    channels: usize,
) -> bool {
    let mut spread_old = [0.0f32; 26];
    if channels == 1 {
        spread_old[start] = old_e[start];
        for i in start + 1..end {
            spread_old[i] = (spread_old[i - 1] - 1.0).max(old_e[i]);
        }
    } else {
        spread_old[start] = old_e[start].max(old_e[start + nb]);
        for i in start + 1..end {
            spread_old[i] = (spread_old[i - 1] - 1.0).max(old_e[i].max(old_e[i + nb]));
        }
    }
    for i in (start..end - 1).rev() {
        spread_old[i] = spread_old[i].max(spread_old[i + 1] - 1.0);
    }
    let lo = start.max(2);
    let mut mean_diff = 0.0f32;
    for c in 0..channels {
        for i in lo..end - 1 {
            let x1 = new_e[i + c * nb].max(0.0);
            let x2 = spread_old[i].max(0.0);
            mean_diff += (x1 - x2).max(0.0);
        }
    }
    mean_diff /= (channels * (end - 1 - lo)) as f32;
    mean_diff > 1.0
}

fn l1_metric(tmp: &[f32], n: usize, lm_weight: i32, bias: f32) -> f32 {
    let mut l1 = 0.0f32;
    for &v in &tmp[..n] {
        l1 += v.abs();
    }
    l1 + lm_weight as f32 * bias * l1
}

/// Per-band time/frequency resolution search: a Viterbi pass over the L1
/// cost of each Haar-transform level, with `lambda` as the switching cost.
#[allow(clippy::too_many_arguments)]
fn tf_analysis(
    m: &CeltMode,
    len: usize,
    is_transient: bool,
    tf_res: &mut [i32],
    lambda: i32,
    x: &[f32],
    n0: usize,
    lm: usize,
    tf_estimate: f32,
    tf_chan: usize,
    importance: &[i32],
) -> i32 {
    let bias = 0.04 * (-0.25f32).max(0.5 - tf_estimate);
    let t = is_transient as usize;
    let max_width = ((m.e_bands[len] - m.e_bands[len - 1]) as usize) << lm;
    let mut metric = vec![0i32; len];
    let mut tmp = vec![0.0f32; max_width];
    let mut tmp_1 = vec![0.0f32; max_width];
    let mut path0 = vec![0i32; len];
    let mut path1 = vec![0i32; len];
    for i in 0..len {
        let n = ((m.e_bands[i + 1] - m.e_bands[i]) as usize) << lm;
        let narrow = m.e_bands[i + 1] - m.e_bands[i] == 1;
        let off = tf_chan * n0 + ((m.e_bands[i] as usize) << lm);
        tmp[..n].copy_from_slice(&x[off..off + n]);
        let mut best_l1 = l1_metric(&tmp, n, if is_transient { lm as i32 } else { 0 }, bias);
        let mut best_level = 0i32;
        if is_transient && !narrow {
            tmp_1[..n].copy_from_slice(&tmp[..n]);
            haar1(&mut tmp_1, n >> lm, 1 << lm);
            let l1 = l1_metric(&tmp_1, n, lm as i32 + 1, bias);
            if l1 < best_l1 {
                best_l1 = l1;
                best_level = -1;
            }
        }
        let k_max = lm + usize::from(!(is_transient || narrow));
        for k in 0..k_max {
            let b = if is_transient {
                lm as i32 - k as i32 - 1
            } else {
                k as i32 + 1
            };
            haar1(&mut tmp, n >> k, 1 << k);
            let l1 = l1_metric(&tmp, n, b, bias);
            if l1 < best_l1 {
                best_l1 = l1;
                best_level = k as i32 + 1;
            }
        }
        metric[i] = if is_transient {
            2 * best_level
        } else {
            -2 * best_level
        };
        // Bias narrow bands away from ties so the coding cost breaks them.
        if narrow && (metric[i] == 0 || metric[i] == -2 * lm as i32) {
            metric[i] -= 1;
        }
    }

    let table_cost = |sel: usize, branch: usize, i: usize| -> i32 {
        importance[i]
            * (metric[i] - 2 * TF_SELECT_TABLE[lm][4 * t + 2 * sel + branch] as i32).abs()
    };
    let mut tf_select = 0usize;
    let mut selcost = [0i32; 2];
    for (sel, sc) in selcost.iter_mut().enumerate() {
        let mut cost0 = table_cost(sel, 0, 0);
        let mut cost1 = table_cost(sel, 1, 0) + if is_transient { 0 } else { lambda };
        for i in 1..len {
            let curr0 = cost0.min(cost1 + lambda);
            let curr1 = (cost0 + lambda).min(cost1);
            cost0 = curr0 + table_cost(sel, 0, i);
            cost1 = curr1 + table_cost(sel, 1, i);
        }
        *sc = cost0.min(cost1);
    }
    if selcost[1] < selcost[0] && is_transient {
        tf_select = 1;
    }
    let mut cost0 = table_cost(tf_select, 0, 0);
    let mut cost1 = table_cost(tf_select, 1, 0) + if is_transient { 0 } else { lambda };
    for i in 1..len {
        let from0 = cost0;
        let from1 = cost1 + lambda;
        let curr0 = if from0 < from1 {
            path0[i] = 0;
            from0
        } else {
            path0[i] = 1;
            from1
        };
        let from0 = cost0 + lambda;
        let from1 = cost1;
        let curr1 = if from0 < from1 {
            path1[i] = 0;
            from0
        } else {
            path1[i] = 1;
            from1
        };
        cost0 = curr0 + table_cost(tf_select, 0, i);
        cost1 = curr1 + table_cost(tf_select, 1, i);
    }
    tf_res[len - 1] = if cost0 < cost1 { 0 } else { 1 };
    for i in (0..len - 1).rev() {
        tf_res[i] = if tf_res[i + 1] == 1 {
            path1[i + 1]
        } else {
            path0[i + 1]
        };
    }
    tf_select as i32
}

fn tf_encode(
    start: usize,
    end: usize,
    is_transient: bool,
    tf_res: &mut [i32],
    lm: usize,
    mut tf_select: i32,
    enc: &mut RangeEncoder,
) {
    let mut budget = enc.storage() as i32 * 8;
    let mut tell = enc.tell();
    let mut logp = if is_transient { 2 } else { 4 };
    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    budget -= tf_select_rsv as i32;
    let mut curr = 0;
    let mut tf_changed = 0;
    for r in tf_res[start..end].iter_mut() {
        if tell + logp <= budget {
            enc.enc_bit_logp(*r ^ curr, logp as u32);
            tell = enc.tell();
            curr = *r;
            tf_changed |= curr;
        } else {
            *r = curr;
        }
        logp = if is_transient { 4 } else { 5 };
    }
    let t = is_transient as usize;
    if tf_select_rsv
        && TF_SELECT_TABLE[lm][4 * t + tf_changed as usize]
            != TF_SELECT_TABLE[lm][4 * t + 2 + tf_changed as usize]
    {
        enc.enc_bit_logp(tf_select, 1);
    } else {
        tf_select = 0;
    }
    for r in tf_res[start..end].iter_mut() {
        *r = TF_SELECT_TABLE[lm][4 * t + 2 * tf_select as usize + *r as usize] as i32;
    }
}

/// Allocation tilt: spends relatively more on low bands for tonal or
/// strongly correlated stereo content, more on high bands otherwise.
#[allow(clippy::too_many_arguments)]
fn alloc_trim_analysis(
    m: &CeltMode,
    x: &[f32],
    band_log_e: &[f32],
    end: usize,
    lm: usize,
    channels: usize,
    n0: usize,
    stereo_saving: &mut f32,
    tf_estimate: f32,
    intensity: usize,
    equiv_rate: i32,
) -> i32 {
    let mut trim = 5.0f32;
    if equiv_rate < 64000 {
        trim = 4.0;
    } else if equiv_rate < 80000 {
        let frac = (equiv_rate - 64000) >> 10;
        trim = 4.0 + frac as f32 / 16.0;
    }
    if channels == 2 {
        let band_corr = |i: usize| -> f32 {
            let off = (m.e_bands[i] as usize) << lm;
            let len = ((m.e_bands[i + 1] - m.e_bands[i]) as usize) << lm;
            celt_inner_prod(&x[off..off + len], &x[n0 + off..n0 + off + len])
        };
        let mut sum = 0.0f32;
        for i in 0..8 {
            sum += band_corr(i);
        }
        sum = (sum / 8.0).abs().min(1.0);
        let mut min_xc = sum;
        for i in 8..intensity {
            min_xc = min_xc.min(band_corr(i).abs());
        }
        min_xc = min_xc.abs().min(1.0);
        let log_xc = celt_log2(1.001 - sum * sum);
        let log_xc2 = (0.5 * log_xc).max(celt_log2(1.001 - min_xc * min_xc));
        trim += (0.75 * log_xc).max(-4.0);
        *stereo_saving = (*stereo_saving + 0.25).min(-(0.5 * log_xc2));
    }
    let mut diff = 0.0f32;
    for c in 0..channels {
        for i in 0..end - 1 {
            diff += band_log_e[i + c * m.nb_ebands] * (2 + 2 * i as i32 - end as i32) as f32;
        }
    }
    diff /= (channels * (end - 1)) as f32;
    trim -= ((diff + 1.0) / 6.0).clamp(-2.0, 2.0);
    trim -= 2.0 * tf_estimate;
    ((0.5 + trim).floor() as i32).clamp(0, 10)
}

/// Mid/side costs less than left/right when the channels are similar; the
/// comparison runs over the first 13 bands only.
fn stereo_analysis(m: &CeltMode, x: &[f32], lm: usize, n0: usize) -> i32 {
    let mut sum_lr = EPSILON;
    let mut sum_ms = EPSILON;
    for i in 0..13 {
        let lo = (m.e_bands[i] as usize) << lm;
        let hi = (m.e_bands[i + 1] as usize) << lm;
        for j in lo..hi {
            let l = x[j];
            let r = x[n0 + j];
            sum_lr += l.abs() + r.abs();
            sum_ms += (l + r).abs() + (l - r).abs();
        }
    }
    sum_ms *= 0.707107;
    let mut thetas = 13;
    // Smaller frames use fewer theta bits.
    if lm <= 1 {
        thetas -= 8;
    }
    let split = (m.e_bands[13] as i32) << (lm + 1);
    ((split + thetas) as f32 * sum_ms > split as f32 * sum_lr) as i32
}

fn median_of_5(x: &[f32]) -> f32 {
    let t2 = x[2];
    let (mut t0, mut t1) = if x[0] > x[1] {
        (x[1], x[0])
    } else {
        (x[0], x[1])
    };
    let (mut t3, mut t4) = if x[3] > x[4] {
        (x[4], x[3])
    } else {
        (x[3], x[4])
    };
    if t0 > t3 {
        std::mem::swap(&mut t0, &mut t3);
        std::mem::swap(&mut t1, &mut t4);
    }
    if t2 > t1 {
        if t1 < t3 {
            t2.min(t3)
        } else {
            t4.min(t1)
        }
    } else if t2 < t3 {
        t1.min(t3)
    } else {
        t2.min(t4)
    }
}

fn median_of_3(x: &[f32]) -> f32 {
    let (t0, t1) = if x[0] > x[1] {
        (x[1], x[0])
    } else {
        (x[0], x[1])
    };
    let t2 = x[2];
    if t1 < t2 {
        t1
    } else if t0 < t2 {
        t2
    } else {
        t0
    }
}

/// Decide per-band bit boosts for bands that stand out from their masking
/// follower, along with the importance and spreading weights the other
/// analyses consume.
#[allow(clippy::too_many_arguments)]
fn dynalloc_analysis(
    band_log_e: &[f32],
    band_log_e2: &[f32],
    nb: usize,
    start: usize,
    end: usize,
    channels: usize,
    offsets: &mut [i32],
    log_n: &[i16],
    is_transient: bool,
    e_bands: &[i16],
    lm: usize,
    effective_bytes: i32,
    importance: &mut [i32],
    spread_weight: &mut [i32],
) {
    let mut follower = vec![0.0f32; channels * nb];
    let mut noise_floor = vec![0.0f32; channels * nb];
    offsets[..nb].fill(0);
    let mut max_depth = -31.9f32;
    for i in 0..end {
        // Approximate the quantization noise floor for a band of this width
        // at the assumed input depth.
        noise_floor[i] = 0.0625 * log_n[i] as f32 + 0.5 + (9 - LSB_DEPTH) as f32
            - crate::quant_bands::E_MEANS[i]
            + 0.0062 * ((i + 5) * (i + 5)) as f32;
    }
    for c in 0..channels {
        for i in 0..end {
            max_depth = max_depth.max(band_log_e[c * nb + i] - noise_floor[i]);
        }
    }
    let mut mask = vec![0.0f32; nb];
    let mut sig = vec![0.0f32; nb];
    for i in 0..end {
        mask[i] = band_log_e[i] - noise_floor[i];
    }
    if channels == 2 {
        for i in 0..end {
            mask[i] = mask[i].max(band_log_e[nb + i] - noise_floor[i]);
        }
    }
    sig[..end].copy_from_slice(&mask[..end]);
    for i in 1..end {
        mask[i] = mask[i].max(mask[i - 1] - 2.0);
    }
    for i in (0..end - 1).rev() {
        mask[i] = mask[i].max(mask[i + 1] - 3.0);
    }
    for i in 0..end {
        let smr = sig[i] - mask[i].max((max_depth - 12.0).max(0.0));
        let shift = (-(0.5 + smr).floor() as i32).clamp(0, 5);
        spread_weight[i] = 32 >> shift;
    }
    if effective_bytes > 50 && lm >= 1 {
        let mut last = 0usize;
        for c in 0..channels {
            let fb = c * nb;
            follower[fb] = band_log_e2[fb];
            for i in 1..end {
                // The last band to have a non-negligible boost over the
                // previous one.
                if band_log_e2[fb + i] > band_log_e2[fb + i - 1] + 0.5 {
                    last = i;
                }
                follower[fb + i] = (follower[fb + i - 1] + 1.5).min(band_log_e2[fb + i]);
            }
            for i in (0..last).rev() {
                follower[fb + i] =
                    follower[fb + i].min((follower[fb + i + 1] + 2.0).max(band_log_e2[fb + i]));
            }
            let offset = 1.0f32;
            for i in 2..end - 2 {
                let med = median_of_5(&band_log_e2[fb + i - 2..fb + i + 3]) - offset;
                follower[fb + i] = follower[fb + i].max(med);
            }
            let mut tmp = median_of_3(&band_log_e2[fb..fb + 3]) - offset;
            follower[fb] = follower[fb].max(tmp);
            follower[fb + 1] = follower[fb + 1].max(tmp);
            tmp = median_of_3(&band_log_e2[fb + end - 3..fb + end]) - offset;
            follower[fb + end - 2] = follower[fb + end - 2].max(tmp);
            follower[fb + end - 1] = follower[fb + end - 1].max(tmp);
            for i in 0..end {
                follower[fb + i] = follower[fb + i].max(noise_floor[i]);
            }
        }
        if channels == 2 {
            for i in start..end {
                follower[nb + i] = follower[nb + i].max(follower[i] - 4.0);
                follower[i] = follower[i].max(follower[nb + i] - 4.0);
                follower[i] = 0.5
                    * ((band_log_e[i] - follower[i]).max(0.0)
                        + (band_log_e[nb + i] - follower[nb + i]).max(0.0));
            }
        } else {
            for i in start..end {
                follower[i] = (band_log_e[i] - follower[i]).max(0.0);
            }
        }
        for i in start..end {
            importance[i] = (0.5 + 13.0 * celt_exp2(follower[i].min(4.0))).floor() as i32;
        }
        // At a fixed rate, boosts on steady frames come straight out of the
        // other bands; halve them.
        if !is_transient {
            for f in follower[start..end].iter_mut() {
                *f *= 0.5;
            }
        }
        for (i, f) in follower.iter_mut().enumerate().take(end).skip(start) {
            if i < 8 {
                *f *= 2.0;
            }
            if i >= 12 {
                *f *= 0.5;
            }
        }
        let mut tot_boost = 0i32;
        for i in start..end {
            let f = follower[i].min(4.0);
            let width = (channels as i32 * (e_bands[i + 1] - e_bands[i]) as i32) << lm;
            let (boost, boost_bits);
            if width < 6 {
                boost = f as i32;
                boost_bits = (boost * width) << BITRES;
            } else if width > 48 {
                boost = (f * 8.0) as i32;
                boost_bits = ((boost * width) << BITRES) / 8;
            } else {
                boost = (f * width as f32 / 6.0) as i32;
                boost_bits = (boost * 6) << BITRES;
            }
            if (tot_boost + boost_bits) >> BITRES >> 3 > 2 * effective_bytes / 3 {
                let cap = ((2 * effective_bytes / 3) << BITRES) << 3;
                offsets[i] = cap - tot_boost;
                break;
            }
            offsets[i] = boost;
            tot_boost += boost_bits;
        }
    } else {
        for i in start..end {
            importance[i] = 13;
        }
    }
}

const INTENSITY_THRESHOLDS: [f32; 21] = [
    1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 16.0, 24.0, 36.0, 44.0, 50.0, 56.0, 62.0, 67.0, 72.0,
    79.0, 88.0, 106.0, 134.0,
];
const INTENSITY_HISTERESIS: [f32; 21] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 4.0, 5.0,
    6.0, 8.0, 8.0,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_configurations() {
        assert!(CeltEncoder::new(0).is_err());
        assert!(CeltEncoder::new(3).is_err());
        let mut enc = CeltEncoder::new(1).unwrap();
        assert!(enc.set_complexity(11).is_err());
        assert!(enc.set_complexity(10).is_ok());
        let pcm = vec![0.0f32; 960];
        let mut out = vec![0u8; 100];
        assert!(enc.encode(&pcm, 961, &mut out).is_err());
        assert!(enc.encode(&pcm, 960, &mut out[..1]).is_err());
        let short_pcm = vec![0.0f32; 100];
        assert!(enc.encode(&short_pcm, 960, &mut out).is_err());
    }

    #[test]
    fn silence_frame_sets_range_state() {
        let mut enc = CeltEncoder::new(1).unwrap();
        let pcm = vec![0.0f32; 960];
        let mut out = vec![0u8; 60];
        let n = enc.encode(&pcm, 960, &mut out).unwrap();
        assert_eq!(n, 60);
        assert_ne!(enc.final_range(), 0);
    }

    #[test]
    fn transient_analysis_fires_on_an_onset() {
        let len = 960 + 120;
        let mut input = vec![0.0f32; len];
        // Silence, then a loud alternating burst in the second half.
        for (i, v) in input.iter_mut().enumerate().skip(len / 2) {
            *v = if i % 2 == 0 { 8000.0 } else { -8000.0 };
        }
        let mut tf_estimate = 0.0;
        let mut tf_chan = 0;
        assert!(transient_analysis(
            &input,
            len,
            1,
            &mut tf_estimate,
            &mut tf_chan
        ));
        assert!(tf_estimate > 0.0);
    }

    #[test]
    fn steady_tone_is_not_a_transient() {
        let len = 960 + 120;
        let input: Vec<f32> = (0..len)
            .map(|i| 4000.0 * (0.03 * i as f32).sin())
            .collect();
        let mut tf_estimate = 0.0;
        let mut tf_chan = 0;
        assert!(!transient_analysis(
            &input,
            len,
            1,
            &mut tf_estimate,
            &mut tf_chan
        ));
    }

    #[test]
    fn medians_are_order_statistics() {
        assert_eq!(median_of_3(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_of_5(&[5.0, 1.0, 4.0, 2.0, 3.0]), 3.0);
        assert_eq!(median_of_5(&[1.0, 1.0, 1.0, 9.0, 9.0]), 1.0);
    }
}
