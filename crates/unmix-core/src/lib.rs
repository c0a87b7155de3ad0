//! Unmix Core - Audio foundation for the stem separation pipeline
//!
//! Everything the separation crate needs to get from uploaded bytes to a
//! time-frequency representation and back:
//!
//! 1. **Codec**: probe/decode compressed uploads (MP3, M4A, FLAC, WAV) with
//!    Symphonia, encode output stems to WAV or FLAC.
//! 2. **Resample**: conform decoded audio to the model's sample rate and
//!    channel layout with a band-limited sinc interpolator.
//! 3. **STFT**: forward/inverse short-time Fourier transform with
//!    weighted overlap-add reconstruction.

pub mod codec;
pub mod error;
pub mod resample;
pub mod stft;
pub mod types;

pub use error::{AudioError, Result};
pub use types::*;
