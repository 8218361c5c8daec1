//! Cepstral mean normalization, dynamic features and the feature-frame
//! queue between the front end and the scorer.

use std::collections::VecDeque;

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::debug;

use crate::error::{DecoderError, Result};

/// Frames of weight given to the initial mean in live CMN.
const CMN_PRIOR_FRAMES: f32 = 100.0;

/// Half-width of the delta window.
const DELTA_SPAN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmnMode {
    None,
    Live,
}

impl CmnMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CmnMode::None),
            "live" => Ok(CmnMode::Live),
            other => Err(DecoderError::Config(format!("unsupported cmn mode `{other}`"))),
        }
    }
}

/// Running cepstral mean subtraction.
///
/// The live estimate starts at `cmninit` and is reset on every utterance so
/// that decoding one utterance never depends on the previous one.
#[derive(Debug, Clone)]
pub struct Cmn {
    mode: CmnMode,
    init: Vec<f32>,
    sum: Vec<f32>,
    count: f32,
}

impl Cmn {
    /// `cmninit` is a comma-separated list; missing coefficients are zero.
    pub fn new(mode: CmnMode, cmninit: &str, ncep: usize) -> Result<Self> {
        let mut init = vec![0.0; ncep];
        for (slot, part) in init.iter_mut().zip(cmninit.split(',')) {
            *slot = part
                .trim()
                .parse()
                .map_err(|_| DecoderError::Config(format!("invalid cmninit `{cmninit}`")))?;
        }
        Ok(Self {
            mode,
            sum: vec![0.0; ncep],
            init,
            count: 0.0,
        })
    }

    pub fn reset(&mut self) {
        self.sum.iter_mut().for_each(|v| *v = 0.0);
        self.count = 0.0;
    }

    pub fn apply(&mut self, cep: &mut [f32]) {
        if self.mode == CmnMode::None {
            return;
        }
        let weight = CMN_PRIOR_FRAMES + self.count;
        for ((c, &init), sum) in cep.iter_mut().zip(&self.init).zip(self.sum.iter_mut()) {
            let mean = (init * CMN_PRIOR_FRAMES + *sum) / weight;
            *sum += *c;
            *c -= mean;
        }
        self.count += 1.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureType {
    /// Static cepstra only.
    Cepstra,
    /// Cepstra followed by `c[t+2] - c[t-2]`.
    CepstraDelta,
}

impl FeatureType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "1s_c" => Ok(FeatureType::Cepstra),
            "1s_c_d" => Ok(FeatureType::CepstraDelta),
            other => Err(DecoderError::Config(format!("unsupported feature type `{other}`"))),
        }
    }

    pub fn dim(self, ncep: usize) -> usize {
        match self {
            FeatureType::Cepstra => ncep,
            FeatureType::CepstraDelta => 2 * ncep,
        }
    }
}

/// Turns a cepstral stream into feature vectors.
///
/// Deltas need `DELTA_SPAN` frames of lookahead; the window is padded by
/// replicating the first frame and, on [`DynamicFeatures::flush`], the last.
#[derive(Debug, Clone)]
pub struct DynamicFeatures {
    kind: FeatureType,
    window: VecDeque<Vec<f32>>,
}

impl DynamicFeatures {
    pub fn new(kind: FeatureType) -> Self {
        Self {
            kind,
            window: VecDeque::with_capacity(2 * DELTA_SPAN + 1),
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn push(&mut self, cep: Vec<f32>) -> Option<Vec<f32>> {
        if self.kind == FeatureType::Cepstra {
            return Some(cep);
        }
        if self.window.is_empty() {
            for _ in 0..DELTA_SPAN {
                self.window.push_back(cep.clone());
            }
        }
        self.window.push_back(cep);
        self.take_centered()
    }

    /// Emits the frames still waiting for lookahead.
    pub fn flush(&mut self) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        let Some(last) = self.window.back().cloned() else {
            return out;
        };
        let waiting = self.window.len().saturating_sub(DELTA_SPAN);
        for _ in 0..waiting {
            while self.window.len() < 2 * DELTA_SPAN + 1 {
                self.window.push_back(last.clone());
            }
            out.extend(self.take_centered());
        }
        self.window.clear();
        out
    }

    fn take_centered(&mut self) -> Option<Vec<f32>> {
        if self.window.len() < 2 * DELTA_SPAN + 1 {
            return None;
        }
        let center = &self.window[DELTA_SPAN];
        let ahead = &self.window[2 * DELTA_SPAN];
        let behind = &self.window[0];
        let mut feat = Vec::with_capacity(center.len() * 2);
        feat.extend_from_slice(center);
        feat.extend(ahead.iter().zip(behind).map(|(a, b)| a - b));
        self.window.pop_front();
        Some(feat)
    }
}

/// Bounded FIFO of feature frames awaiting scoring.
///
/// Fixed capacity unless growth is enabled, in which case a full buffer
/// doubles instead of refusing frames.
pub struct FeatureBuffer {
    rb: HeapRb<Vec<f32>>,
    growable: bool,
}

impl std::fmt::Debug for FeatureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureBuffer")
            .field("len", &self.rb.occupied_len())
            .field("capacity", &self.capacity())
            .field("growable", &self.growable)
            .finish()
    }
}

impl FeatureBuffer {
    pub fn new(capacity: usize, growable: bool) -> Self {
        Self {
            rb: HeapRb::new(capacity.max(1)),
            growable,
        }
    }

    pub fn set_growable(&mut self, growable: bool) {
        self.growable = growable;
    }

    pub fn is_growable(&self) -> bool {
        self.growable
    }

    pub fn capacity(&self) -> usize {
        self.rb.capacity().get()
    }

    pub fn len(&self) -> usize {
        self.rb.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.rb.is_empty()
    }

    /// Whether another frame can be accepted right now.
    pub fn has_room(&self) -> bool {
        self.growable || !self.rb.is_full()
    }

    /// Queues a frame, growing when allowed. A full fixed buffer hands the
    /// frame back.
    pub fn push(&mut self, frame: Vec<f32>) -> std::result::Result<(), Vec<f32>> {
        if self.rb.is_full() && self.growable {
            self.grow();
        }
        self.rb.try_push(frame)
    }

    /// Queues a frame regardless of the growth setting.
    pub fn push_forced(&mut self, frame: Vec<f32>) {
        if self.rb.is_full() {
            self.grow();
        }
        // Cannot fail: the buffer was just grown if it was full.
        let _ = self.rb.try_push(frame);
    }

    pub fn pop(&mut self) -> Option<Vec<f32>> {
        self.rb.try_pop()
    }

    pub fn clear(&mut self) {
        self.rb.clear();
    }

    fn grow(&mut self) {
        let capacity = self.capacity() * 2;
        let mut bigger = HeapRb::new(capacity);
        while let Some(frame) = self.rb.try_pop() {
            let _ = bigger.try_push(frame);
        }
        debug!(capacity, "feature buffer grown");
        self.rb = bigger;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_cmn_starts_from_prior() {
        let mut cmn = Cmn::new(CmnMode::Live, "8.0", 2).expect("cmn");
        let mut cep = vec![10.0, 1.0];
        cmn.apply(&mut cep);
        assert_eq!(cep, vec![2.0, 1.0]);

        cmn.reset();
        let mut again = vec![10.0, 1.0];
        cmn.apply(&mut again);
        assert_eq!(again, vec![2.0, 1.0]);
    }

    #[test]
    fn cmn_none_leaves_frames_untouched() {
        let mut cmn = Cmn::new(CmnMode::None, "8.0", 2).expect("cmn");
        let mut cep = vec![10.0, 1.0];
        cmn.apply(&mut cep);
        assert_eq!(cep, vec![10.0, 1.0]);
        assert!(Cmn::new(CmnMode::Live, "eight", 2).is_err());
    }

    #[test]
    fn deltas_lag_two_frames_and_flush_replicates_edges() {
        let mut dyn_feat = DynamicFeatures::new(FeatureType::CepstraDelta);
        let mut out = Vec::new();
        for t in 0..4 {
            out.extend(dyn_feat.push(vec![t as f32]));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![0.0, 2.0]);
        assert_eq!(out[1], vec![1.0, 3.0]);

        let tail = dyn_feat.flush();
        assert_eq!(tail, vec![vec![2.0, 3.0], vec![3.0, 2.0]]);
        assert!(dyn_feat.flush().is_empty());
    }

    #[test]
    fn single_frame_flushes_with_zero_delta() {
        let mut dyn_feat = DynamicFeatures::new(FeatureType::CepstraDelta);
        assert!(dyn_feat.push(vec![5.0]).is_none());
        assert_eq!(dyn_feat.flush(), vec![vec![5.0, 0.0]]);
    }

    #[test]
    fn fixed_buffer_refuses_when_full_and_growable_buffer_doubles() {
        let mut fixed = FeatureBuffer::new(2, false);
        assert!(fixed.push(vec![0.0]).is_ok());
        assert!(fixed.push(vec![1.0]).is_ok());
        assert!(!fixed.has_room());
        assert_eq!(fixed.push(vec![2.0]), Err(vec![2.0]));

        fixed.set_growable(true);
        assert!(fixed.push(vec![2.0]).is_ok());
        assert_eq!(fixed.capacity(), 4);
        assert_eq!(fixed.pop(), Some(vec![0.0]));
        assert_eq!(fixed.len(), 2);
    }
}
