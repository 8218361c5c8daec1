//! Recognition results: hypotheses, word segments and per-utterance bundles.
//!
//! All types serialize with camelCase field names so they can be handed to
//! a UI or written as JSON lines without a translation layer.

use serde::{Deserialize, Serialize};

use crate::decoder::timer::DecodeTiming;
use crate::logmath::LogMath;

// ---------------------------------------------------------------------------
// Hypothesis
// ---------------------------------------------------------------------------

/// Best word string of an utterance, partial or final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hypothesis {
    /// Space-separated words, fillers omitted.
    pub text: String,
    /// Path score in the decoder's log base.
    pub score: i32,
    pub uttid: String,
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// One word of the best path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Dictionary spelling, including alternate markers and fillers.
    pub word: String,
    pub start_frame: usize,
    /// Inclusive.
    pub end_frame: usize,
    /// Log posterior approximation (≤ 0).
    pub prob: i32,
}

impl Segment {
    pub fn n_frames(&self) -> usize {
        self.end_frame + 1 - self.start_frame
    }

    /// Posterior as a linear probability in [0, 1].
    pub fn posterior(&self, lmath: &LogMath) -> f64 {
        lmath.exp(self.prob.min(0))
    }
}

/// Iterator over a finished segmentation.
///
/// Owns a snapshot of the segments, so the decoder may move on to the next
/// utterance while it is alive.
#[derive(Debug, Clone)]
pub struct SegmentIter {
    inner: std::vec::IntoIter<Segment>,
}

impl SegmentIter {
    pub(crate) fn new(segments: Vec<Segment>) -> Self {
        Self {
            inner: segments.into_iter(),
        }
    }
}

impl Iterator for SegmentIter {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SegmentIter {}

impl std::iter::FusedIterator for SegmentIter {}

// ---------------------------------------------------------------------------
// Utterance result
// ---------------------------------------------------------------------------

/// Everything known about a finished utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtteranceResult {
    pub uttid: String,
    pub text: Option<String>,
    pub score: Option<i32>,
    pub segments: Vec<Segment>,
    pub timing: DecodeTiming,
}
