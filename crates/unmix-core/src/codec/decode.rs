//! Audio decoding (Symphonia)

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::AudioFormat;
use crate::error::{AudioError, Result};
use crate::types::AudioBuffer;

/// Decode errors tolerated (and skipped) before the stream is declared corrupt
const MAX_SKIPPED_PACKETS: usize = 16;

/// Stream properties read from container headers without decoding
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame count declared by the container (absent for some MP3 streams)
    pub frames: Option<u64>,
}

impl AudioInfo {
    /// Declared duration in seconds, if the container declares a length
    pub fn duration_secs(&self) -> Option<f64> {
        self.frames.map(|f| f as f64 / self.sample_rate as f64)
    }
}

/// Limits enforced while decoding
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeLimits {
    /// Stop decoding and fail once the stream exceeds this duration
    pub max_duration_secs: Option<f64>,
}

/// Open a format reader over in-memory bytes
fn open_format<B>(bytes: B, format: AudioFormat) -> Result<Box<dyn FormatReader>>
where
    B: AsRef<[u8]> + Send + Sync + 'static,
{
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format.extension());

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| match e {
            SymphoniaError::Unsupported(msg) => AudioError::UnsupportedFormat(msg.to_string()),
            other => AudioError::Corrupt(other.to_string()),
        })?;

    Ok(probed.format)
}

/// Read stream properties from container headers
///
/// Used to reject over-long uploads before any decoding work happens.
pub fn probe<B>(bytes: B, format: AudioFormat) -> Result<AudioInfo>
where
    B: AsRef<[u8]> + Send + Sync + 'static,
{
    let reader = open_format(bytes, format)?;
    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoAudioTrack)?;

    let params = &track.codec_params;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| AudioError::UnsupportedFormat("Unknown sample rate".to_string()))?;
    let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);

    Ok(AudioInfo {
        sample_rate,
        channels,
        frames: params.n_frames,
    })
}

/// Decode a complete audio stream to interleaved f32 samples
///
/// The returned buffer keeps the stream's native sample rate and channel
/// count; use [`crate::resample::conform`] to convert it for the model.
pub fn decode<B>(bytes: B, format: AudioFormat, limits: DecodeLimits) -> Result<AudioBuffer>
where
    B: AsRef<[u8]> + Send + Sync + 'static,
{
    let mut reader = open_format(bytes, format)?;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoAudioTrack)?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut buf_capacity: u64 = 0;
    let mut stream_format: Option<(u32, u16)> = None;
    let mut skipped = 0usize;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(AudioError::Corrupt(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                skipped += 1;
                log::warn!("Skipping undecodable packet: {}", msg);
                if skipped > MAX_SKIPPED_PACKETS {
                    return Err(AudioError::Corrupt(format!(
                        "{} packets failed to decode (last: {})",
                        skipped, msg
                    )));
                }
                continue;
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(AudioError::Corrupt(e.to_string())),
        };

        let spec = *decoded.spec();
        let packet_format = (spec.rate, spec.channels.count() as u16);
        match stream_format {
            None => stream_format = Some(packet_format),
            Some(existing) if existing != packet_format => {
                return Err(AudioError::Corrupt(format!(
                    "stream format changed mid-stream from {:?} to {:?}",
                    existing, packet_format
                )));
            }
            Some(_) => {}
        }

        // (Re)allocate the conversion buffer when a packet is larger than any seen so far
        let capacity = decoded.capacity() as u64;
        if sample_buf.is_none() || capacity > buf_capacity {
            sample_buf = Some(SampleBuffer::new(capacity, spec));
            buf_capacity = capacity;
        }

        if let Some(ref mut buf) = sample_buf {
            buf.copy_interleaved_ref(decoded);
            if let Some(offset) = buf.samples().iter().position(|s| !s.is_finite()) {
                return Err(AudioError::Corrupt(format!(
                    "non-finite sample at index {}",
                    samples.len() + offset
                )));
            }
            samples.extend_from_slice(buf.samples());
        }

        if let (Some(max_secs), Some((rate, channels))) = (limits.max_duration_secs, stream_format) {
            let actual_secs = samples.len() as f64 / channels as f64 / rate as f64;
            if actual_secs > max_secs {
                return Err(AudioError::DurationExceeded {
                    actual_secs,
                    max_secs,
                });
            }
        }
    }

    let (sample_rate, channels) = stream_format
        .ok_or_else(|| AudioError::Corrupt("stream contains no decodable audio".to_string()))?;

    log::debug!(
        "Decoded {} stream: {} samples, {}Hz, {} channels ({} packets skipped)",
        format,
        samples.len(),
        sample_rate,
        channels,
        skipped
    );

    AudioBuffer::from_interleaved(samples, sample_rate, channels)
}
