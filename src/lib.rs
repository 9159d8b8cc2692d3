//! The CELT layer of the Opus audio codec: a low-latency MDCT transform
//! codec built around explicit band-energy coding and pyramid vector
//! quantization of the band shapes.
//!
//! The crate operates on 48 kHz float PCM, mono or stereo, at frame sizes of
//! 120, 240, 480 and 960 samples, and produces constant-size packets whose
//! length sets the bitrate.
//!
//! ```no_run
//! use celt::{CeltDecoder, CeltEncoder};
//!
//! # fn main() -> celt::Result<()> {
//! let mut enc = CeltEncoder::new(1)?;
//! let mut dec = CeltDecoder::new(1)?;
//! let pcm = vec![0.0f32; 960];
//! let mut packet = [0u8; 120];
//! let len = enc.encode(&pcm, 960, &mut packet)?;
//! let mut out = vec![0.0f32; 960];
//! dec.decode(&packet[..len], 960, &mut out)?;
//! assert_eq!(enc.final_range(), dec.final_range());
//! # Ok(())
//! # }
//! ```

mod bands;
mod celt;
mod celt_decoder;
mod celt_encoder;
mod cwrs;
mod entcode;
mod entdec;
mod entenc;
mod error;
mod kiss_fft;
mod laplace;
mod mathops;
mod mdct;
mod modes;
mod quant_bands;
mod rate;
mod vq;

#[cfg(test)]
mod tests;

pub use crate::celt_decoder::CeltDecoder;
pub use crate::celt_encoder::CeltEncoder;
pub use crate::error::{Error, Result};
