//! Streaming MFCC front end.
//!
//! Samples are pre-emphasized as they arrive and kept in a pending buffer
//! until a full analysis window is available, so a stream split at arbitrary
//! points yields exactly the same cepstra as the unsplit stream.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::config::Config;
use crate::error::{DecoderError, Result};

pub struct FrontEnd {
    frame_size: usize,
    frame_shift: usize,
    ncep: usize,
    alpha: f32,
    window: Vec<f32>,
    mel_filters: Vec<Vec<f32>>,
    dct: Vec<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
    fft_buf: Vec<Complex<f32>>,
    /// Pre-emphasized samples not yet consumed by a frame.
    pending: Vec<f32>,
    /// Samples between the end of one window and the start of the next,
    /// when the shift is longer than the window.
    skip: usize,
    prior: f32,
}

impl std::fmt::Debug for FrontEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontEnd")
            .field("frame_size", &self.frame_size)
            .field("frame_shift", &self.frame_shift)
            .field("ncep", &self.ncep)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl FrontEnd {
    pub fn new(config: &Config) -> Result<Self> {
        let samprate = config.get_float("samprate")?;
        let frate = config.get_int("frate")?;
        let wlen = config.get_float("wlen")?;
        let nfft = config.get_int("nfft")?;
        let nfilt = config.get_int("nfilt")?;
        let ncep = config.get_int("ncep")?;
        let lowerf = config.get_float("lowerf")?;
        let upperf = config.get_float("upperf")?;
        let alpha = config.get_float("alpha")?;

        if samprate <= 0.0 || frate <= 0 {
            return Err(DecoderError::Config(format!(
                "samprate ({samprate}) and frate ({frate}) must be positive"
            )));
        }
        let frame_size = (wlen * samprate).round() as usize;
        let frame_shift = (samprate / frate as f64).round() as usize;
        if frame_size == 0 || frame_shift == 0 {
            return Err(DecoderError::Config("analysis window is empty".into()));
        }
        if nfft < frame_size as i64 {
            return Err(DecoderError::Config(format!(
                "nfft ({nfft}) is smaller than the analysis window ({frame_size} samples)"
            )));
        }
        if nfilt <= 0 || ncep <= 0 || ncep > nfilt {
            return Err(DecoderError::Config(format!(
                "need 0 < ncep ({ncep}) <= nfilt ({nfilt})"
            )));
        }
        if !(0.0 <= lowerf && lowerf < upperf && upperf <= samprate / 2.0) {
            return Err(DecoderError::Config(format!(
                "filterbank range {lowerf}..{upperf} Hz does not fit samprate {samprate}"
            )));
        }
        let (nfft, nfilt, ncep) = (nfft as usize, nfilt as usize, ncep as usize);

        Ok(Self {
            frame_size,
            frame_shift,
            ncep,
            alpha: alpha as f32,
            window: build_hamming_window(frame_size),
            mel_filters: build_mel_filters(nfft, samprate as f32, nfilt, lowerf as f32, upperf as f32),
            dct: build_dct(nfilt, ncep),
            fft: FftPlanner::<f32>::new().plan_fft_forward(nfft),
            fft_buf: vec![Complex::new(0.0, 0.0); nfft],
            pending: Vec::with_capacity(frame_size),
            skip: 0,
            prior: 0.0,
        })
    }

    pub fn ncep(&self) -> usize {
        self.ncep
    }

    pub fn frame_shift(&self) -> usize {
        self.frame_shift
    }

    /// Forgets buffered samples and the pre-emphasis history.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.skip = 0;
        self.prior = 0.0;
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Samples still missing before the next frame can be computed.
    pub fn samples_needed(&self) -> usize {
        self.skip + self.frame_size.saturating_sub(self.pending.len())
    }

    pub fn push_samples(&mut self, samples: &[i16]) {
        for &s in samples {
            let x = s as f32;
            if self.skip > 0 {
                self.skip -= 1;
            } else {
                self.pending.push(x - self.alpha * self.prior);
            }
            self.prior = x;
        }
    }

    /// Computes one cepstral frame if a full window is buffered.
    pub fn compute_frame(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.frame_size {
            return None;
        }
        for v in self.fft_buf.iter_mut() {
            *v = Complex::new(0.0, 0.0);
        }
        for (slot, (&s, &w)) in self.fft_buf.iter_mut().zip(self.pending.iter().zip(&self.window)) {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let log_mel: Vec<f32> = self
            .mel_filters
            .iter()
            .map(|filter| {
                let energy: f32 = filter
                    .iter()
                    .zip(&self.fft_buf)
                    .map(|(w, c)| w * c.norm_sqr())
                    .sum();
                energy.max(1e-10).ln()
            })
            .collect();
        let cep = self
            .dct
            .iter()
            .map(|basis| basis.iter().zip(&log_mel).map(|(b, m)| b * m).sum())
            .collect();

        let advance = self.frame_shift.min(self.pending.len());
        self.pending.drain(..advance);
        self.skip = self.frame_shift - advance;
        Some(cep)
    }
}

fn build_hamming_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / (n - 1) as f32).cos())
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

fn build_mel_filters(fft_size: usize, sr: f32, n_mels: usize, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();
    let fft_freqs: Vec<f32> = (0..n_freqs).map(|k| k as f32 * sr / fft_size as f32).collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for (m, filter) in filters.iter_mut().enumerate() {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filter[k] = (w * enorm).max(0.0);
        }
    }
    filters
}

/// Orthonormal DCT-II basis, first `ncep` rows.
fn build_dct(nfilt: usize, ncep: usize) -> Vec<Vec<f32>> {
    use std::f32::consts::PI;
    let scale = (2.0 / nfilt as f32).sqrt();
    (0..ncep)
        .map(|i| {
            let row_scale = if i == 0 { scale / 2f32.sqrt() } else { scale };
            (0..nfilt)
                .map(|m| row_scale * (PI * i as f32 * (m as f32 + 0.5) / nfilt as f32).cos())
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, period: usize) -> Vec<i16> {
        (0..n)
            .map(|i| ((2.0 * std::f32::consts::PI * i as f32 / period as f32).sin() * 8000.0) as i16)
            .collect()
    }

    fn frames(fe: &mut FrontEnd, chunks: impl Iterator<Item = Vec<i16>>) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for chunk in chunks {
            let mut rest = chunk.as_slice();
            while !rest.is_empty() {
                let take = fe.samples_needed().min(rest.len()).max(1);
                fe.push_samples(&rest[..take]);
                rest = &rest[take..];
                while let Some(f) = fe.compute_frame() {
                    out.push(f);
                }
            }
        }
        out
    }

    #[test]
    fn frame_geometry_follows_configuration() {
        let fe = FrontEnd::new(&Config::default()).expect("frontend");
        assert_eq!(fe.frame_shift(), 160);
        assert_eq!(fe.samples_needed(), 410);
        assert_eq!(fe.ncep(), 13);
    }

    #[test]
    fn split_stream_matches_whole_stream() {
        let audio = tone(4000, 37);
        let mut whole = FrontEnd::new(&Config::default()).expect("frontend");
        let expected = frames(&mut whole, std::iter::once(audio.clone()));

        let mut split = FrontEnd::new(&Config::default()).expect("frontend");
        let got = frames(&mut split, audio.chunks(97).map(<[i16]>::to_vec));

        assert_eq!(expected.len(), (4000 - 410) / 160 + 1);
        assert_eq!(expected, got);
    }

    #[test]
    fn shift_longer_than_window_skips_the_gap() {
        let config = Config::default()
            .with("frate", 50)
            .and_then(|c| c.with("wlen", 0.01))
            .expect("config");
        let audio = tone(16_000, 37);
        let mut whole = FrontEnd::new(&config).expect("frontend");
        assert_eq!(whole.frame_shift(), 320);
        let expected = frames(&mut whole, std::iter::once(audio.clone()));
        assert_eq!(expected.len(), (16_000 - 160) / 320 + 1);

        let mut split = FrontEnd::new(&config).expect("frontend");
        let got = frames(&mut split, audio.chunks(97).map(<[i16]>::to_vec));
        assert_eq!(expected, got);
    }

    #[test]
    fn rejects_fft_smaller_than_window() {
        let config = Config::default().with("nfft", 256).expect("config");
        assert!(matches!(FrontEnd::new(&config), Err(DecoderError::Config(_))));
    }

    #[test]
    fn rejects_filterbank_above_nyquist() {
        let config = Config::default().with("samprate", 8000).expect("config");
        assert!(FrontEnd::new(&config).is_err());
    }
}
