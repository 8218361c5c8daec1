//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Recorded files come at whatever rate they were captured with (44.1 or
//! 48 kHz are common), while the front end expects `samprate`. When the two
//! rates agree `RateConverter` is a passthrough and no rubato session is
//! created at all.
//!
//! The resampler's group delay is trimmed from the head of the output and
//! [`RateConverter::finish`] flushes the tail, so a converted file has
//! `round(n_in * target / source)` samples.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 1024)?;
//! let mut out = rc.process(&samples)?;
//! out.extend(rc.finish()?);
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use crate::error::{DecoderError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    /// Output samples still to discard for the resampler delay.
    skip: usize,
    total_in: usize,
    total_out: usize,
}

impl RateConverter {
    /// # Errors
    /// `DecoderError::Other` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                ratio,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                skip: 0,
                total_in: 0,
                total_out: 0,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| DecoderError::Other(anyhow::anyhow!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let skip = resampler.output_delay();
        info!(source_rate, target_rate, chunk_size, delay = skip, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            ratio,
            input_buf: Vec::new(),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            skip,
            total_in: 0,
            total_out: 0,
        })
    }

    /// Processes incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated until a full `chunk_size` block is available.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if self.resampler.is_none() {
            return Ok(samples.to_vec());
        }
        self.total_in += samples.len();
        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            self.run_chunk(&mut result)?;
            self.input_buf.drain(..self.chunk_size);
        }
        Ok(result)
    }

    /// Flushes buffered input and the resampler tail.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        if self.resampler.is_none() {
            return Ok(Vec::new());
        }
        let expected = (self.total_in as f64 * self.ratio).round() as usize;
        let mut result = Vec::new();
        // Bounded: every padded chunk yields output, so the delay is covered
        // after a few rounds.
        let max_rounds = 2 + (self.skip + expected.saturating_sub(self.total_out)) / self.chunk_size.max(1) * 2;
        let mut rounds = 0;
        while self.total_out < expected && rounds < max_rounds {
            self.input_buf.resize(self.chunk_size, 0.0);
            self.run_chunk(&mut result)?;
            self.input_buf.clear();
            rounds += 1;
        }
        let overshoot = self.total_out.saturating_sub(expected);
        result.truncate(result.len().saturating_sub(overshoot));
        self.total_out -= overshoot;
        Ok(result)
    }

    fn run_chunk(&mut self, result: &mut Vec<f32>) -> Result<()> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(());
        };
        let input_slice = &self.input_buf[..self.chunk_size];
        let (_consumed, produced) = resampler
            .process_into_buffer(&[input_slice], &mut self.output_buf, None)
            .map_err(|e| DecoderError::Other(anyhow::anyhow!("resampler process: {e}")))?;
        let produced = &self.output_buf[0][..produced];
        let dropped = self.skip.min(produced.len());
        self.skip -= dropped;
        result.extend_from_slice(&produced[dropped..]);
        self.total_out += produced.len() - dropped;
        Ok(())
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
