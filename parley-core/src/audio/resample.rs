//! Sample-rate conversion with rubato's `FastFixedIn`.
//!
//! Two shapes are needed:
//!
//! - **Streaming** ([`RateConverter`]): the capture thread feeds whatever the
//!   ring buffer yields and gets 16 kHz out, with the remainder carried to
//!   the next call. Passthrough (no rubato session) when rates already match.
//! - **One-shot** ([`convert_block`]): a single decoded speech chunk is
//!   converted to the output device rate in one go, interpolator delay
//!   trimmed, so its length matches its scheduled duration.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{ParleyError, Result};

fn new_resampler(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
    .map_err(|e| ParleyError::AudioDevice(format!("resampler init: {e}")))
}

/// Converts a continuous mono stream between two fixed rates.
pub struct RateConverter {
    /// `None` when both rates are equal.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over between calls until a full chunk is available.
    pending: Vec<f32>,
    chunk_size: usize,
    /// Reused output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `ParleyError::AudioDevice` if rubato rejects the configuration.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = new_resampler(from_rate, to_rate, chunk_size)?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        info!(from_rate, to_rate, chunk_size, "stream resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
        })
    }

    /// Feed samples, get whatever full chunks produced (possibly nothing).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut result = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_size {
            let input = &self.pending[consumed..consumed + self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.output_buf, None) {
                Ok((_, produced)) => result.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += self.chunk_size;
        }
        self.pending.drain(..consumed);

        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert one self-contained mono block from `from_rate` to `to_rate`.
///
/// The output holds `round(len * to_rate / from_rate)` samples.
///
/// # Errors
/// `ParleyError::AudioDevice` if rubato fails.
pub fn convert_block(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = new_resampler(from_rate, to_rate, samples.len())?;
    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;

    let map_err = |e: rubato::ResampleError| ParleyError::AudioDevice(format!("resample: {e}"));
    let mut out = resampler
        .process(&[samples], None)
        .map_err(map_err)?
        .swap_remove(0);
    // Flush the interpolator so the tail of the block is not lost.
    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(map_err)?;
    out.extend_from_slice(&tail[0]);

    let mut out: Vec<f32> = out.into_iter().skip(delay).collect();
    out.resize(expected, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).expect("converter");
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn downsample_48k_to_16k_has_expected_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_input_is_carried_over() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn block_conversion_matches_duration() {
        // 0.5 s at 24 kHz → 0.5 s at 48 kHz.
        let block: Vec<f32> = (0..12_000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let out = convert_block(&block, 24_000, 48_000).expect("convert");
        assert_eq!(out.len(), 24_000);
    }

    #[test]
    fn block_conversion_passthrough_when_rates_match() {
        let block = vec![0.25f32; 100];
        assert_eq!(convert_block(&block, 24_000, 24_000).expect("convert"), block);
    }
}
