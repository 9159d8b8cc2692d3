//! Band energy quantization: coarse (predictive Laplace), fine (raw bits),
//! and the final leftover-bit refinement pass.

use crate::entdec::RangeDecoder;
use crate::entenc::RangeEncoder;
use crate::laplace::{ec_laplace_decode, ec_laplace_encode};
use crate::mathops::celt_log2;
use crate::modes::CeltMode;
use crate::rate::MAX_FINE_BITS;

/// Mean log-energy per band, subtracted before coding.
pub static E_MEANS: [f32; 25] = [
    6.4375, 6.25, 5.75, 5.3125, 5.0625, 4.8125, 4.5, 4.375, 4.875, 4.6875, 4.5625, 4.4375, 4.875,
    4.625, 4.3125, 4.5, 4.375, 4.625, 4.75, 4.4375, 3.75, 3.75, 3.75, 3.75, 3.75,
];

/// Inter-frame energy prediction coefficient per LM.
const PRED_COEF: [f32; 4] = [
    29440.0 / 32768.0,
    26112.0 / 32768.0,
    21248.0 / 32768.0,
    16384.0 / 32768.0,
];

/// In-frame (band to band) prediction feedback per LM.
const BETA_COEF: [f32; 4] = [
    30147.0 / 32768.0,
    22282.0 / 32768.0,
    12124.0 / 32768.0,
    6554.0 / 32768.0,
];

const BETA_INTRA: f32 = 4915.0 / 32768.0;

/// Laplace parameters (fs, decay) per band, trained per frame size for
/// inter and intra frames.
const E_PROB_MODEL: [[[u8; 42]; 2]; 4] = [
    [
        [
            72, 127, 65, 129, 66, 128, 65, 128, 64, 128, 62, 128, 64, 128, 64, 128, 92, 78, 92, 79,
            92, 78, 90, 79, 116, 41, 115, 40, 114, 40, 132, 26, 132, 26, 145, 17, 161, 12, 176, 10,
            177, 11,
        ],
        [
            24, 179, 48, 138, 54, 135, 54, 132, 53, 134, 56, 133, 55, 132, 55, 132, 61, 114, 70,
            96, 74, 88, 75, 88, 87, 74, 89, 66, 91, 67, 100, 59, 108, 50, 120, 40, 122, 37, 97, 43,
            78, 50,
        ],
    ],
    [
        [
            83, 78, 84, 81, 88, 75, 86, 74, 87, 71, 90, 73, 93, 74, 93, 74, 109, 40, 114, 36, 117,
            34, 117, 34, 143, 17, 145, 18, 146, 19, 162, 12, 165, 10, 178, 7, 189, 6, 190, 8, 177,
            9,
        ],
        [
            23, 178, 54, 115, 63, 102, 66, 98, 69, 99, 74, 89, 71, 91, 73, 91, 78, 89, 86, 80, 92,
            66, 93, 64, 102, 59, 103, 60, 104, 60, 117, 52, 123, 44, 138, 35, 133, 31, 97, 38, 77,
            45,
        ],
    ],
    [
        [
            61, 90, 93, 60, 105, 42, 107, 41, 110, 45, 116, 38, 113, 38, 112, 38, 124, 26, 132, 27,
            136, 19, 140, 20, 155, 14, 159, 16, 158, 18, 170, 13, 177, 10, 187, 8, 192, 6, 175, 9,
            159, 10,
        ],
        [
            21, 178, 59, 110, 71, 86, 75, 85, 84, 83, 91, 66, 88, 73, 87, 72, 92, 75, 98, 72, 105,
            58, 107, 54, 115, 52, 114, 55, 112, 56, 129, 51, 132, 40, 150, 33, 140, 29, 98, 35, 77,
            42,
        ],
    ],
    [
        [
            42, 121, 96, 66, 108, 43, 111, 40, 117, 44, 123, 32, 120, 36, 119, 33, 127, 33, 134,
            34, 139, 21, 147, 23, 152, 20, 158, 25, 154, 26, 166, 21, 173, 16, 184, 13, 184, 10,
            150, 13, 139, 15,
        ],
        [
            22, 178, 63, 114, 74, 82, 84, 83, 92, 82, 103, 62, 96, 72, 96, 67, 101, 73, 107, 72,
            113, 55, 118, 52, 125, 52, 118, 52, 117, 55, 135, 49, 137, 39, 157, 32, 145, 29, 97,
            33, 77, 40,
        ],
    ],
];

static SMALL_ENERGY_ICDF: [u8; 3] = [2, 1, 0];

/// Expected concealment distortion if this frame were lost, used to steer
/// the delayed-intra decision.
fn loss_distortion(
    band_log_e: &[f32],
    old_ebands: &[f32],
    start: usize,
    end: usize,
    len: usize,
    channels: usize,
) -> f32 {
    let mut dist = 0.0f32;
    for c in 0..channels {
        for i in start..end {
            let d = band_log_e[i + c * len] - old_ebands[i + c * len];
            dist += d * d;
        }
    }
    dist.min(200.0)
}

#[allow(clippy::too_many_arguments)]
fn quant_coarse_energy_impl(
    m: &CeltMode,
    start: usize,
    end: usize,
    band_log_e: &[f32],
    old_ebands: &mut [f32],
    budget: i32,
    mut tell: i32,
    prob_model: &[u8; 42],
    error: &mut [f32],
    enc: &mut RangeEncoder,
    channels: usize,
    lm: usize,
    intra: bool,
    max_decay: f32,
) -> i32 {
    let mut badness = 0i32;
    let mut prev = [0.0f32; 2];
    let (coef, beta) = if intra {
        (0.0, BETA_INTRA)
    } else {
        (PRED_COEF[lm], BETA_COEF[lm])
    };
    if tell + 3 <= budget {
        enc.enc_bit_logp(intra as i32, 3);
    }
    let nb = m.nb_ebands;
    for i in start..end {
        for c in 0..channels {
            let x = band_log_e[i + c * nb];
            let old_e = old_ebands[i + c * nb].max(-9.0);
            let f = x - coef * old_e - prev[c];
            let mut qi = (0.5 + f).floor() as i32;
            let decay_bound = old_ebands[i + c * nb].max(-28.0) - max_decay;
            // Prevent the prediction from racing downward faster than the
            // decoder could follow after a loss.
            if qi < 0 && x < decay_bound {
                qi += (decay_bound - x) as i32;
                qi = qi.min(0);
            }
            let qi0 = qi;
            // Only throw serious bits at the first band once the budget
            // gets tight; the rest degrade to coarser fallbacks.
            tell = enc.tell();
            let bits_left = budget - tell - 3 * channels as i32 * (end - i) as i32;
            if i != start && bits_left < 30 {
                if bits_left < 24 {
                    qi = qi.min(1);
                }
                if bits_left < 16 {
                    qi = qi.max(-1);
                }
            }
            if budget - tell >= 15 {
                let pi = 2 * i.min(20);
                ec_laplace_encode(
                    enc,
                    &mut qi,
                    (prob_model[pi] as u32) << 7,
                    (prob_model[pi + 1] as i32) << 6,
                );
            } else if budget - tell >= 2 {
                qi = qi.clamp(-1, 1);
                enc.enc_icdf(((2 * qi) ^ -((qi < 0) as i32)) as usize, &SMALL_ENERGY_ICDF, 2);
            } else if budget - tell >= 1 {
                qi = qi.min(0);
                enc.enc_bit_logp(-qi, 1);
            } else {
                qi = -1;
            }
            error[i + c * nb] = f - qi as f32;
            badness += (qi0 - qi).abs();
            let q = qi as f32;
            old_ebands[i + c * nb] = coef * old_e + prev[c] + q;
            prev[c] = prev[c] + q - beta * q;
        }
    }
    badness
}

/// Coarse energy: tries intra and inter coding when the budget allows and
/// keeps whichever tracked the input better, byte-for-byte rewinding the
/// stream to do so.
#[allow(clippy::too_many_arguments)]
pub fn quant_coarse_energy(
    m: &CeltMode,
    start: usize,
    end: usize,
    eff_end: usize,
    band_log_e: &[f32],
    old_ebands: &mut [f32],
    budget: u32,
    error: &mut [f32],
    enc: &mut RangeEncoder,
    channels: usize,
    lm: usize,
    nb_available_bytes: i32,
    force_intra: bool,
    delayed_intra: &mut f32,
    mut two_pass: bool,
    loss_rate: i32,
) {
    let nb = m.nb_ebands;
    let band_size = channels * nb;

    let mut intra = force_intra
        || !two_pass
            && *delayed_intra > (2 * channels * (end - start)) as f32
            && nb_available_bytes > ((end - start) * channels) as i32;
    let intra_bias =
        (budget as f32 * *delayed_intra * loss_rate as f32 / (channels * 512) as f32) as i32;
    let new_distortion = loss_distortion(band_log_e, old_ebands, start, eff_end, nb, channels);

    let tell = enc.tell();
    if tell + 3 > budget as i32 {
        intra = false;
        two_pass = false;
    }
    let mut max_decay = 16.0f32;
    if end - start > 10 {
        max_decay = max_decay.min(0.125 * nb_available_bytes as f32);
    }

    let start_state = enc.save();
    let mut old_ebands_intra = old_ebands[..band_size].to_vec();
    let mut error_intra = vec![0.0f32; band_size];

    let mut badness_intra = 0;
    if two_pass || intra {
        badness_intra = quant_coarse_energy_impl(
            m,
            start,
            end,
            band_log_e,
            &mut old_ebands_intra,
            budget as i32,
            tell,
            &E_PROB_MODEL[lm][1],
            &mut error_intra,
            enc,
            channels,
            lm,
            true,
            max_decay,
        );
    }

    if !intra {
        let tell_intra = enc.tell_frac() as i32;
        let intra_state = enc.save();
        let from = RangeEncoder::byte_offset(&start_state);
        let to = RangeEncoder::byte_offset(&intra_state);
        let intra_bytes = enc.range_bytes(from, to);

        enc.restore(start_state);
        let badness_inter = quant_coarse_energy_impl(
            m,
            start,
            end,
            band_log_e,
            old_ebands,
            budget as i32,
            tell,
            &E_PROB_MODEL[lm][0],
            error,
            enc,
            channels,
            lm,
            false,
            max_decay,
        );
        if two_pass
            && (badness_intra < badness_inter
                || badness_intra == badness_inter
                    && enc.tell_frac() as i32 + intra_bias > tell_intra)
        {
            enc.restore(intra_state);
            enc.overwrite_range_bytes(from, &intra_bytes);
            old_ebands[..band_size].copy_from_slice(&old_ebands_intra);
            error[..band_size].copy_from_slice(&error_intra);
            intra = true;
        }
    } else {
        old_ebands[..band_size].copy_from_slice(&old_ebands_intra);
        error[..band_size].copy_from_slice(&error_intra);
    }

    *delayed_intra = if intra {
        new_distortion
    } else {
        PRED_COEF[lm] * PRED_COEF[lm] * *delayed_intra + new_distortion
    };
}

pub fn quant_fine_energy(
    m: &CeltMode,
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    error: &mut [f32],
    fine_quant: &[i32],
    enc: &mut RangeEncoder,
    channels: usize,
) {
    let nb = m.nb_ebands;
    for i in start..end {
        let bits = fine_quant[i];
        if bits <= 0 {
            continue;
        }
        let frac = 1i32 << bits;
        for c in 0..channels {
            let q2 = (((error[i + c * nb] + 0.5) * frac as f32).floor() as i32)
                .clamp(0, frac - 1);
            enc.enc_bits(q2 as u32, bits as u32);
            let offset = (q2 as f32 + 0.5) * (1 << (14 - bits)) as f32 * (1.0 / 16384.0) - 0.5;
            old_ebands[i + c * nb] += offset;
            error[i + c * nb] -= offset;
        }
    }
}

/// Spend whatever bits remain, one per band per channel, highest priority
/// bands first.
#[allow(clippy::too_many_arguments)]
pub fn quant_energy_finalise(
    m: &CeltMode,
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    error: &mut [f32],
    fine_quant: &[i32],
    fine_priority: &[i32],
    mut bits_left: i32,
    enc: &mut RangeEncoder,
    channels: usize,
) {
    let nb = m.nb_ebands;
    for prio in 0..2 {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != prio {
                continue;
            }
            for c in 0..channels {
                let q2 = (error[i + c * nb] >= 0.0) as i32;
                enc.enc_bits(q2 as u32, 1);
                let offset =
                    (q2 as f32 - 0.5) * (1 << (14 - fine_quant[i] - 1)) as f32 * (1.0 / 16384.0);
                old_ebands[i + c * nb] += offset;
                error[i + c * nb] -= offset;
                bits_left -= 1;
            }
        }
    }
}

pub fn unquant_coarse_energy(
    m: &CeltMode,
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    intra: bool,
    dec: &mut RangeDecoder,
    channels: usize,
    lm: usize,
) {
    let prob_model = &E_PROB_MODEL[lm][intra as usize];
    let mut prev = [0.0f32; 2];
    let (coef, beta) = if intra {
        (0.0, BETA_INTRA)
    } else {
        (PRED_COEF[lm], BETA_COEF[lm])
    };
    let nb = m.nb_ebands;
    let budget = dec.storage() as i32 * 8;
    for i in start..end {
        for c in 0..channels {
            let tell = dec.tell();
            let qi = if budget - tell >= 15 {
                let pi = 2 * i.min(20);
                ec_laplace_decode(
                    dec,
                    (prob_model[pi] as u32) << 7,
                    (prob_model[pi + 1] as i32) << 6,
                )
            } else if budget - tell >= 2 {
                let raw = dec.dec_icdf(&SMALL_ENERGY_ICDF, 2);
                (raw >> 1) ^ -(raw & 1)
            } else if budget - tell >= 1 {
                -dec.dec_bit_logp(1)
            } else {
                -1
            };
            let old_e = old_ebands[i + c * nb].max(-9.0);
            old_ebands[i + c * nb] = coef * old_e + prev[c] + qi as f32;
            prev[c] = prev[c] + qi as f32 - beta * qi as f32;
        }
    }
}

pub fn unquant_fine_energy(
    m: &CeltMode,
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    fine_quant: &[i32],
    dec: &mut RangeDecoder,
    channels: usize,
) {
    let nb = m.nb_ebands;
    for i in start..end {
        let bits = fine_quant[i];
        if bits <= 0 {
            continue;
        }
        for c in 0..channels {
            let q2 = dec.dec_bits(bits as u32) as i32;
            let offset = (q2 as f32 + 0.5) * (1 << (14 - bits)) as f32 * (1.0 / 16384.0) - 0.5;
            old_ebands[i + c * nb] += offset;
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn unquant_energy_finalise(
    m: &CeltMode,
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    fine_quant: &[i32],
    fine_priority: &[i32],
    mut bits_left: i32,
    dec: &mut RangeDecoder,
    channels: usize,
) {
    let nb = m.nb_ebands;
    for prio in 0..2 {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != prio {
                continue;
            }
            for c in 0..channels {
                let q2 = dec.dec_bits(1) as i32;
                let offset =
                    (q2 as f32 - 0.5) * (1 << (14 - fine_quant[i] - 1)) as f32 * (1.0 / 16384.0);
                old_ebands[i + c * nb] += offset;
                bits_left -= 1;
            }
        }
    }
}

/// Linear band energies to the log domain the energy coder works in.
pub fn amp2_log2(
    m: &CeltMode,
    eff_end: usize,
    end: usize,
    band_e: &[f32],
    band_log_e: &mut [f32],
    channels: usize,
) {
    let nb = m.nb_ebands;
    for c in 0..channels {
        for i in 0..eff_end {
            band_log_e[i + c * nb] = celt_log2(band_e[i + c * nb]) - E_MEANS[i];
        }
        for i in eff_end..end {
            band_log_e[i + c * nb] = -14.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entdec::RangeDecoder;
    use crate::entenc::RangeEncoder;
    use crate::modes::mode48000_960_120;

    /// Coarse + fine + finalise, then decode and check the decoder lands on
    /// the same quantized energies within the finest step.
    #[test]
    fn energy_roundtrip() {
        let mode = mode48000_960_120().unwrap();
        let nb = mode.nb_ebands;
        let channels = 1usize;
        let lm = 3usize;
        let mut buf = vec![0u8; 256];

        let band_log_e: Vec<f32> = (0..nb)
            .map(|i| 3.0 * (i as f32 * 0.7).sin() - 2.0)
            .collect();
        let mut old_enc = vec![0.0f32; nb];
        let mut error = vec![0.0f32; nb];
        let mut delayed_intra = 0.0f32;
        let fine_quant: Vec<i32> = (0..nb).map(|i| (i as i32 % 5).min(3)).collect();
        let fine_priority = vec![0i32; nb];

        let intra_flag;
        {
            let mut enc = RangeEncoder::new(&mut buf);
            quant_coarse_energy(
                mode,
                0,
                nb,
                nb,
                &band_log_e,
                &mut old_enc,
                256 * 8,
                &mut error,
                &mut enc,
                channels,
                lm,
                256,
                false,
                &mut delayed_intra,
                true,
                0,
            );
            quant_fine_energy(
                mode,
                0,
                nb,
                &mut old_enc,
                &mut error,
                &fine_quant,
                &mut enc,
                channels,
            );
            quant_energy_finalise(
                mode,
                0,
                nb,
                &mut old_enc,
                &mut error,
                &fine_quant,
                &fine_priority,
                21,
                &mut enc,
                channels,
            );
            enc.done();
            assert!(!enc.error());
        }

        let mut old_dec = vec![0.0f32; nb];
        {
            let mut dec = RangeDecoder::new(&buf);
            intra_flag = dec.dec_bit_logp(3) != 0;
            unquant_coarse_energy(mode, 0, nb, &mut old_dec, intra_flag, &mut dec, channels, lm);
            unquant_fine_energy(mode, 0, nb, &mut old_dec, &fine_quant, &mut dec, channels);
            unquant_energy_finalise(
                mode,
                0,
                nb,
                &mut old_dec,
                &fine_quant,
                &fine_priority,
                21,
                &mut dec,
                channels,
            );
        }

        for i in 0..nb {
            assert!(
                (old_enc[i] - old_dec[i]).abs() < 1e-4,
                "band {i}: enc {} dec {}",
                old_enc[i],
                old_dec[i]
            );
        }
        // Quantized energy tracks the input within the coarse+fine step.
        for i in 0..nb {
            assert!(
                (old_enc[i] - band_log_e[i]).abs() < 1.0,
                "band {i}: q {} input {}",
                old_enc[i],
                band_log_e[i]
            );
        }
    }

    #[test]
    fn starved_budget_still_decodes() {
        // With only a few bytes the coarse coder degrades through its
        // fallbacks; encoder and decoder must stay in lockstep.
        let mode = mode48000_960_120().unwrap();
        let nb = mode.nb_ebands;
        let mut buf = vec![0u8; 8];
        let band_log_e: Vec<f32> = (0..nb).map(|i| -(i as f32) * 0.3).collect();
        let mut old_enc = vec![0.0f32; nb];
        let mut error = vec![0.0f32; nb];
        let mut delayed_intra = 0.0f32;
        {
            let mut enc = RangeEncoder::new(&mut buf);
            quant_coarse_energy(
                mode,
                0,
                nb,
                nb,
                &band_log_e,
                &mut old_enc,
                8 * 8,
                &mut error,
                &mut enc,
                1,
                0,
                8,
                false,
                &mut delayed_intra,
                false,
                0,
            );
            enc.done();
            assert!(!enc.error());
        }
        let mut old_dec = vec![0.0f32; nb];
        let mut dec = RangeDecoder::new(&buf);
        let intra = dec.dec_bit_logp(3) != 0;
        unquant_coarse_energy(mode, 0, nb, &mut old_dec, intra, &mut dec, 1, 0);
        for i in 0..nb {
            assert!((old_enc[i] - old_dec[i]).abs() < 1e-4, "band {i}");
        }
    }
}
