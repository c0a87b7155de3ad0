//! Output stem encoding (WAV via hound, FLAC via flacenc)

use std::io::Cursor;

use flacenc::component::BitRepr;
use flacenc::error::Verify;
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};

use crate::error::{AudioError, Result};
use crate::types::AudioBuffer;

/// Output sample depth; never below 16-bit PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BitDepth {
    #[default]
    Pcm16,
    Pcm24,
    Float32,
}

impl BitDepth {
    pub fn bits(&self) -> u16 {
        match self {
            BitDepth::Pcm16 => 16,
            BitDepth::Pcm24 => 24,
            BitDepth::Float32 => 32,
        }
    }

    /// Full-scale integer value for PCM depths
    fn full_scale(&self) -> f32 {
        match self {
            BitDepth::Pcm16 => i16::MAX as f32,
            BitDepth::Pcm24 => 8_388_607.0,
            BitDepth::Float32 => 1.0,
        }
    }
}

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputContainer {
    #[default]
    Wav,
    Flac,
}

impl OutputContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputContainer::Wav => "wav",
            OutputContainer::Flac => "flac",
        }
    }
}

/// Target format for encoded stems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputFormat {
    pub container: OutputContainer,
    pub bit_depth: BitDepth,
}

impl OutputFormat {
    pub fn wav(bit_depth: BitDepth) -> Self {
        Self {
            container: OutputContainer::Wav,
            bit_depth,
        }
    }

    pub fn flac(bit_depth: BitDepth) -> Self {
        Self {
            container: OutputContainer::Flac,
            bit_depth,
        }
    }

    /// Check the container can carry the requested depth
    pub fn validate(&self) -> Result<()> {
        if self.container == OutputContainer::Flac && self.bit_depth == BitDepth::Float32 {
            return Err(AudioError::Encode(
                "FLAC cannot store 32-bit float samples".to_string(),
            ));
        }
        Ok(())
    }
}

/// Encode a buffer to the requested container
pub fn encode(buffer: &AudioBuffer, format: OutputFormat) -> Result<Vec<u8>> {
    format.validate()?;
    let bytes = match format.container {
        OutputContainer::Wav => encode_wav(buffer, format.bit_depth)?,
        OutputContainer::Flac => encode_flac(buffer, format.bit_depth)?,
    };
    log::debug!(
        "Encoded {} frames to {} ({}-bit): {} bytes",
        buffer.frames(),
        format.container.extension(),
        format.bit_depth.bits(),
        bytes.len()
    );
    Ok(bytes)
}

/// Quantize a float sample to a signed integer at the given depth
fn quantize(sample: f32, bit_depth: BitDepth) -> i32 {
    (sample.clamp(-1.0, 1.0) * bit_depth.full_scale()).round() as i32
}

fn encode_wav(buffer: &AudioBuffer, bit_depth: BitDepth) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: buffer.channels(),
        sample_rate: buffer.sample_rate(),
        bits_per_sample: bit_depth.bits(),
        sample_format: match bit_depth {
            BitDepth::Float32 => SampleFormat::Float,
            _ => SampleFormat::Int,
        },
    };

    let wav_err = |e: hound::Error| AudioError::Encode(e.to_string());

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(wav_err)?;
        match bit_depth {
            BitDepth::Pcm16 => {
                for &sample in buffer.samples() {
                    writer
                        .write_sample(quantize(sample, bit_depth) as i16)
                        .map_err(wav_err)?;
                }
            }
            BitDepth::Pcm24 => {
                for &sample in buffer.samples() {
                    writer.write_sample(quantize(sample, bit_depth)).map_err(wav_err)?;
                }
            }
            BitDepth::Float32 => {
                for &sample in buffer.samples() {
                    writer.write_sample(sample).map_err(wav_err)?;
                }
            }
        }
        writer.finalize().map_err(wav_err)?;
    }
    Ok(cursor.into_inner())
}

fn encode_flac(buffer: &AudioBuffer, bit_depth: BitDepth) -> Result<Vec<u8>> {
    let ints: Vec<i32> = buffer
        .samples()
        .iter()
        .map(|&s| quantize(s, bit_depth))
        .collect();

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|(_, e)| AudioError::Encode(format!("FLAC encoder config: {:?}", e)))?;

    let source = flacenc::source::MemSource::from_samples(
        &ints,
        buffer.channels() as usize,
        bit_depth.bits() as usize,
        buffer.sample_rate() as usize,
    );

    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| AudioError::Encode(format!("FLAC encoding: {:?}", e)))?;

    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| AudioError::Encode(format!("FLAC bitstream: {:?}", e)))?;

    Ok(sink.as_slice().to_vec())
}
