//! Sample codec: f32 capture samples ⇄ 16-bit PCM, PCM bytes ⇄ base64 blobs.
//!
//! Everything here is pure. Malformed input is reported as
//! `ParleyError::Decode`, never zero-filled.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{
    buffering::chunk::{AudioBlock, DecodedAudioChunk},
    error::{ParleyError, Result},
    remote::protocol::{Blob, RealtimeInput},
};

/// Full-scale multiplier between the float and i16 domains.
const PCM_SCALE: f32 = 32768.0;

/// Rates an inbound `rate=` tag may claim.
pub const ACCEPTED_MIME_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// Scale float samples into an i16 `AudioBlock`.
///
/// Each sample is multiplied by 32768 and truncated toward zero. The
/// float→int cast saturates, so anything at or beyond full scale lands on
/// `i16::MAX` / `i16::MIN` and NaN becomes 0.
pub fn encode(samples: &[f32], sample_rate: u32) -> AudioBlock {
    let pcm = samples.iter().map(|&s| (s * PCM_SCALE) as i16).collect();
    AudioBlock::new(pcm, sample_rate)
}

/// Interpret little-endian interleaved i16 bytes as a playable chunk.
///
/// # Errors
/// `ParleyError::Decode` if the rate or channel count is zero, or the byte
/// count is not a whole number of frames.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedAudioChunk> {
    if sample_rate == 0 {
        return Err(ParleyError::Decode("sample rate must be non-zero".into()));
    }
    if channels == 0 {
        return Err(ParleyError::Decode("channel count must be non-zero".into()));
    }
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(ParleyError::Decode(format!(
            "{} bytes is not a whole number of {channels}-channel i16 frames",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM_SCALE)
        .collect();
    Ok(DecodedAudioChunk::new(samples, sample_rate, channels))
}

/// Transport-encode a block. Consumes it: the block belongs to the wire now.
pub fn to_blob(block: AudioBlock) -> Blob {
    Blob {
        data: STANDARD.encode(block.to_le_bytes()),
        mime_type: block.mime_type().to_string(),
    }
}

/// Decode an inbound inline-audio blob.
///
/// The rate is taken from the blob's `rate=` mime parameter when present,
/// otherwise `fallback_rate`. A tagged rate outside [`ACCEPTED_MIME_RATES`]
/// is a decode error; it would otherwise stretch the chunk's duration and
/// push every later chunk back on the playback timeline.
pub fn decode_blob(blob: &Blob, fallback_rate: u32, channels: u16) -> Result<DecodedAudioChunk> {
    let rate = match pcm_rate_from_mime(&blob.mime_type) {
        Some(rate) if !ACCEPTED_MIME_RATES.contains(&rate) => {
            return Err(ParleyError::Decode(format!(
                "implausible sample rate {rate} in {:?}",
                blob.mime_type
            )))
        }
        Some(rate) => rate,
        None => fallback_rate,
    };
    let bytes = decode_base64(&blob.data)?;
    decode(&bytes, rate, channels)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.as_bytes())
        .map_err(|e| ParleyError::Decode(format!("base64: {e}")))
}

/// Extract `rate` from a mime tag such as `audio/pcm;rate=24000`.
pub fn pcm_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

impl From<AudioBlock> for RealtimeInput {
    fn from(block: AudioBlock) -> Self {
        Self {
            media: to_blob(block),
        }
    }
}
