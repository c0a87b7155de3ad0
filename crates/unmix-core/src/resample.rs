//! Sample rate and channel layout conversion
//!
//! Decoded uploads arrive at whatever rate and channel count the file used.
//! The separation model runs at a fixed rate and layout, so every buffer is
//! conformed before the transform stage.
//!
//! Resampling uses rubato's `SincFixedIn` with fixed parameters: 256-tap
//! Blackman-Harris windowed sinc, cutoff at 95% of Nyquist. The quality does
//! not depend on the conversion ratio.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{AudioError, Result};
use crate::types::{AudioBuffer, ChannelLayout, Sample};

/// Frames fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Fixed interpolation quality
fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Convert a buffer to the target sample rate and channel layout
pub fn conform(buffer: AudioBuffer, sample_rate: u32, layout: ChannelLayout) -> Result<AudioBuffer> {
    let source_rate = buffer.sample_rate();
    let source_channels = buffer.channels();

    let remixed = remix(buffer, layout)?;
    let converted = resample(&remixed, sample_rate)?;

    if source_rate != sample_rate || source_channels != layout.count() {
        log::info!(
            "Conformed audio {}Hz/{}ch -> {}Hz/{}ch ({} frames)",
            source_rate,
            source_channels,
            sample_rate,
            layout.count(),
            converted.frames()
        );
    }
    Ok(converted)
}

/// Convert channel layout
///
/// Mono is duplicated to stereo. Stereo folds to mono by averaging. Wider
/// layouts keep their first two channels for stereo or average all
/// channels for mono.
pub fn remix(buffer: AudioBuffer, layout: ChannelLayout) -> Result<AudioBuffer> {
    let channels = buffer.channels() as usize;
    let target = layout.count() as usize;
    if channels == target {
        return Ok(buffer);
    }

    let sample_rate = buffer.sample_rate();
    let samples = buffer.into_samples();

    let remixed: Vec<Sample> = match layout {
        ChannelLayout::Mono => samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<Sample>() / channels as Sample)
            .collect(),
        ChannelLayout::Stereo => samples
            .chunks(channels)
            .flat_map(|frame| [frame[0], frame.get(1).copied().unwrap_or(frame[0])])
            .collect(),
    };

    AudioBuffer::from_interleaved(remixed, sample_rate, target as u16)
}

/// Resample to a new rate, preserving channel count
///
/// The output is trimmed so the resampler's delay is removed and the length
/// matches `round(frames * ratio)`.
pub fn resample(buffer: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if target_rate == 0 {
        return Err(AudioError::Resample("target sample rate must be non-zero".to_string()));
    }
    if buffer.sample_rate() == target_rate {
        return Ok(buffer.clone());
    }

    let channels = buffer.channels() as usize;
    let frames = buffer.frames();
    if frames == 0 {
        return AudioBuffer::silence(0, target_rate, buffer.channels());
    }

    let ratio = target_rate as f64 / buffer.sample_rate() as f64;
    let expected_len = (frames as f64 * ratio).round() as usize;

    let mut resampler = SincFixedIn::<Sample>::new(ratio, 1.0, sinc_parameters(), RESAMPLE_CHUNK, channels)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    let delay = resampler.output_delay();

    let planar = buffer.to_planar();
    let mut output: Vec<Vec<Sample>> = vec![Vec::with_capacity(expected_len + delay); channels];

    let append = |output: &mut Vec<Vec<Sample>>, block: Vec<Vec<Sample>>| {
        for (out, chunk) in output.iter_mut().zip(block) {
            out.extend_from_slice(&chunk);
        }
    };

    let mut pos = 0;
    loop {
        let needed = resampler.input_frames_next();
        if pos + needed > frames {
            break;
        }
        let slices: Vec<&[Sample]> = planar.iter().map(|c| &c[pos..pos + needed]).collect();
        let block = resampler
            .process(&slices, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        append(&mut output, block);
        pos += needed;
    }

    if pos < frames {
        let slices: Vec<&[Sample]> = planar.iter().map(|c| &c[pos..]).collect();
        let block = resampler
            .process_partial(Some(&slices[..]), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        append(&mut output, block);
    }

    // Flush the filter tail until the delayed output covers the full signal
    while output[0].len() < expected_len + delay {
        let block = resampler
            .process_partial(None::<&[Vec<Sample>]>, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        if block.first().map_or(true, |b| b.is_empty()) {
            break;
        }
        append(&mut output, block);
    }

    for channel in output.iter_mut() {
        channel.drain(..delay.min(channel.len()));
        channel.resize(expected_len, 0.0);
    }

    AudioBuffer::from_planar(output, target_rate)
}
