//! End-to-end encode/decode runs over synthetic signals.

use crate::{CeltDecoder, CeltEncoder};

fn sine(freq: f32, frames: usize, frame_size: usize, channels: usize) -> Vec<f32> {
    let n = frames * frame_size;
    let mut pcm = vec![0.0f32; n * channels];
    for i in 0..n {
        let s = 0.3 * (2.0 * std::f32::consts::PI * freq * i as f32 / 48000.0).sin();
        for c in 0..channels {
            pcm[i * channels + c] = s;
        }
    }
    pcm
}

fn rms(x: &[f32]) -> f32 {
    (x.iter().map(|&v| v * v).sum::<f32>() / x.len() as f32).sqrt()
}

fn run(
    enc: &mut CeltEncoder,
    dec: &mut CeltDecoder,
    pcm: &[f32],
    frame_size: usize,
    channels: usize,
    bytes_per_frame: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; pcm.len()];
    let mut packet = vec![0u8; bytes_per_frame];
    for (inp, outp) in pcm
        .chunks_exact(frame_size * channels)
        .zip(out.chunks_exact_mut(frame_size * channels))
    {
        let len = enc.encode(inp, frame_size, &mut packet).unwrap();
        assert_eq!(len, bytes_per_frame);
        let mut frame = vec![0.0f32; frame_size * channels];
        let got = dec.decode(&packet[..len], frame_size, &mut frame).unwrap();
        assert_eq!(got, frame_size);
        assert_eq!(
            enc.final_range(),
            dec.final_range(),
            "encoder and decoder range state diverged"
        );
        outp.copy_from_slice(&frame);
    }
    out
}

#[test]
fn silence_decodes_to_silence() {
    for channels in [1usize, 2] {
        let mut enc = CeltEncoder::new(channels).unwrap();
        let mut dec = CeltDecoder::new(channels).unwrap();
        let pcm = vec![0.0f32; 4 * 960 * channels];
        let out = run(&mut enc, &mut dec, &pcm, 960, channels, 100);
        for (i, &s) in out.iter().enumerate() {
            assert!(s.abs() < 1e-6, "sample {i} = {s}");
        }
    }
}

#[test]
fn dc_level_survives_a_round_trip() {
    let mut enc = CeltEncoder::new(1).unwrap();
    let mut dec = CeltDecoder::new(1).unwrap();
    let frames = 12;
    let pcm = vec![0.3f32; frames * 960];
    let out = run(&mut enc, &mut dec, &pcm, 960, 1, 220);
    // The deemphasis filter needs a few frames to settle on a DC input;
    // measure the steady state only.
    let tail = &out[8 * 960..];
    let got = rms(tail);
    assert!(
        (got - 0.3).abs() < 0.3 * 0.05,
        "steady-state rms {got} vs 0.3"
    );
}

#[test]
fn sine_survives_a_mono_round_trip() {
    let mut enc = CeltEncoder::new(1).unwrap();
    let mut dec = CeltDecoder::new(1).unwrap();
    let frames = 12;
    let pcm = sine(440.0, frames, 960, 1);
    let out = run(&mut enc, &mut dec, &pcm, 960, 1, 240);
    for &s in &out {
        assert!(s.is_finite());
        assert!(s.abs() < 2.0);
    }
    // Skip the startup frames; steady state should carry the signal level
    // within a couple of dB.
    let tail = &out[4 * 960..];
    let target = rms(&pcm[4 * 960..]);
    let got = rms(tail);
    assert!(
        got > target * 0.5 && got < target * 2.0,
        "rms {got} vs {target}"
    );
}

#[test]
fn stereo_round_trip_is_stable() {
    let mut enc = CeltEncoder::new(2).unwrap();
    let mut dec = CeltDecoder::new(2).unwrap();
    let pcm = sine(880.0, 8, 960, 2);
    let out = run(&mut enc, &mut dec, &pcm, 960, 2, 300);
    for &s in &out {
        assert!(s.is_finite());
        assert!(s.abs() < 2.0);
    }
    let tail = &out[2 * 2 * 960..];
    assert!(rms(tail) > 0.05, "stereo output collapsed to silence");
}

#[test]
fn all_frame_sizes_round_trip() {
    for &frame_size in &[120usize, 240, 480, 960] {
        let mut enc = CeltEncoder::new(1).unwrap();
        let mut dec = CeltDecoder::new(1).unwrap();
        let frames = 9600 / frame_size;
        let pcm = sine(1000.0, frames, frame_size, 1);
        // Same bits per second across sizes.
        let bytes = 160 * frame_size / 960;
        let out = run(&mut enc, &mut dec, &pcm, frame_size, 1, bytes.max(12));
        for &s in &out {
            assert!(s.is_finite(), "frame size {frame_size}");
        }
    }
}

#[test]
fn identical_encoders_produce_identical_packets() {
    let mut enc_a = CeltEncoder::new(1).unwrap();
    let mut enc_b = CeltEncoder::new(1).unwrap();
    let pcm = sine(523.25, 6, 960, 1);
    let mut pkt_a = vec![0u8; 180];
    let mut pkt_b = vec![0u8; 180];
    for frame in pcm.chunks_exact(960) {
        enc_a.encode(frame, 960, &mut pkt_a).unwrap();
        enc_b.encode(frame, 960, &mut pkt_b).unwrap();
        assert_eq!(pkt_a, pkt_b);
        assert_eq!(enc_a.final_range(), enc_b.final_range());
    }
}

#[test]
fn reset_restores_the_initial_state() {
    let pcm = sine(330.0, 4, 960, 1);
    let mut enc = CeltEncoder::new(1).unwrap();
    let mut first = vec![0u8; 160];
    enc.encode(&pcm[..960], 960, &mut first).unwrap();

    // Run more audio through, then reset; the next packet must match the
    // very first one.
    let mut scratch = vec![0u8; 160];
    for frame in pcm.chunks_exact(960).skip(1) {
        enc.encode(frame, 960, &mut scratch).unwrap();
    }
    enc.reset();
    let mut again = vec![0u8; 160];
    enc.encode(&pcm[..960], 960, &mut again).unwrap();
    assert_eq!(first, again);
}

#[test]
fn complexity_settings_all_run() {
    let pcm = sine(660.0, 3, 960, 1);
    for complexity in [0, 2, 5, 8, 10] {
        let mut enc = CeltEncoder::new(1).unwrap();
        let mut dec = CeltDecoder::new(1).unwrap();
        enc.set_complexity(complexity).unwrap();
        let out = run(&mut enc, &mut dec, &pcm, 960, 1, 120);
        for &s in &out {
            assert!(s.is_finite(), "complexity {complexity}");
        }
    }
    let mut enc = CeltEncoder::new(1).unwrap();
    assert!(enc.set_complexity(11).is_err());
}

#[test]
fn decoder_tolerates_random_packets() {
    let mut dec = CeltDecoder::new(2).unwrap();
    let mut seed: u32 = 0xdead_beef;
    let mut pcm = vec![0.0f32; 2 * 960];
    for trial in 0..30 {
        let len = 2 + (seed as usize) % 200;
        let mut data = vec![0u8; len];
        for b in data.iter_mut() {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (seed >> 24) as u8;
        }
        // Malformed packets may be rejected but must never panic or emit
        // non-finite samples.
        if dec.decode(&data, 960, &mut pcm).is_ok() {
            for &s in &pcm {
                assert!(s.is_finite(), "trial {trial}");
            }
        }
    }
}
