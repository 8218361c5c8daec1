//! # voxdec-core
//!
//! Streaming speech decoder: acoustic scoring, pronunciation dictionary and
//! grammar / language-model constrained search behind one session object.
//!
//! ## Architecture
//!
//! ```text
//! i16 samples ─► AcousticModel ─► FeatureBuffer ─► score() ─► active Search.step()
//!                (front end, CMN, deltas)              │           │
//!                                                      │     SearchRegistry
//!                                                      │     ├─ "grammar"        (GrammarSet)
//!                                                      │     └─ "language-model" (LmSet)
//!                                                      ▼
//!                                   Decoder: start_utt / process_* / end_utt
//!                                                      │
//!                                   Hypothesis, SegmentIter, DecodeTiming
//! ```
//!
//! Decoding is synchronous: the caller feeds audio in whatever chunks it
//! has, and each call searches every frame the acoustic model produced.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod acoustic;
pub mod audio;
pub mod config;
pub mod decoder;
pub mod dict;
pub mod error;
pub mod logmath;
pub mod search;
pub mod transcript;

// Convenience re-exports for downstream crates
pub use config::{Config, ConfigValue};
pub use decoder::timer::DecodeTiming;
pub use decoder::{Decoder, UttState};
pub use dict::WordId;
pub use error::{DecoderError, Result};
pub use logmath::LogMath;
pub use search::{GrammarSet, LmSet, Search, SearchKind};
pub use transcript::{Hypothesis, Segment, SegmentIter, UtteranceResult};
