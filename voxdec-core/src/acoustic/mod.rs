//! Acoustic model: front end, feature buffering and senone scoring.
//!
//! ## Streaming contract
//!
//! ```text
//!  i16 samples ──► FrontEnd ──► Cmn ──► DynamicFeatures ──► FeatureBuffer ──► score()
//!                 (carry-over)          (2-frame lookahead)  (bounded FIFO)
//! ```
//!
//! `process_raw` / `process_features` consume as much input as the feature
//! buffer admits and advance the caller's slice past what was consumed. The
//! caller drains the buffer through [`AcousticModel::score`] and feeds the
//! rest. Splitting the input at arbitrary points yields exactly the same
//! frame sequence as one whole-buffer call.

pub mod feature;
pub mod frontend;
pub mod mdef;
pub mod senone;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DecoderError, Result};
use crate::logmath::LogMath;

use self::feature::{Cmn, CmnMode, DynamicFeatures, FeatureBuffer, FeatureType};
use self::frontend::FrontEnd;
use self::mdef::ModelDef;
use self::senone::{SenoneSet, TransitionMatrices};

pub use self::mdef::SILENCE_PHONE;

/// Reads one JSON model table.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DecoderError::ModelNotFound {
            path: path.to_path_buf(),
        },
        _ => DecoderError::Io(e),
    })?;
    serde_json::from_str(&text).map_err(|e| DecoderError::malformed(path, e))
}

fn required_path(config: &Config, option: &str) -> Result<PathBuf> {
    config.get_path(option).ok_or_else(|| {
        DecoderError::Construction(format!("acoustic model option `{option}` is not set"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcmodState {
    Idle,
    Started,
    Processing,
    /// Whole-utterance input was flushed; only scoring and `end_utt` remain.
    Flushed,
    Ended,
}

/// Scores of one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameScores<'a> {
    pub frame: usize,
    /// Raw score of the best senone.
    pub best_score: i32,
    pub best_senone: usize,
    /// All senone scores, normalized so that the best is 0.
    pub scores: &'a [i32],
}

#[derive(Debug)]
pub struct AcousticModel {
    lmath: Arc<LogMath>,
    mdef: ModelDef,
    senones: SenoneSet,
    tmat: TransitionMatrices,
    frontend: FrontEnd,
    cmn: Cmn,
    dynamic: DynamicFeatures,
    buffer: FeatureBuffer,
    /// Growth configured at construction (two-pass search).
    config_grow: bool,
    grow_requested: bool,
    state: AcmodState,
    output_frame: usize,
    senone_scores: Vec<i32>,
}

impl AcousticModel {
    /// Loads the model named by `mdef`, `mean`, `var`, `tmat` and
    /// optionally `sendump` / `mixw`.
    ///
    /// # Errors
    /// `Construction` / `ModelNotFound` for missing or malformed tables,
    /// `ConfigMismatch` when the feature layout differs from the senone
    /// dimension.
    pub fn new(config: &Config, lmath: Arc<LogMath>) -> Result<Self> {
        let mdef = ModelDef::load(&required_path(config, "mdef")?)?;

        let weights = config.get_path("sendump").or_else(|| config.get_path("mixw"));
        let senones = SenoneSet::load(
            &required_path(config, "mean")?,
            &required_path(config, "var")?,
            weights.as_deref(),
            config.get_float("varfloor")?,
            config.get_float("mixwfloor")?,
            &lmath,
        )?;
        if senones.len() < mdef.n_senone() {
            return Err(DecoderError::ConfigMismatch(format!(
                "model definition uses {} senones but only {} are defined",
                mdef.n_senone(),
                senones.len()
            )));
        }
        let tmat = TransitionMatrices::load(
            &required_path(config, "tmat")?,
            mdef.n_phone(),
            mdef.n_emit_state(),
            config.get_float("tmatfloor")?,
            &lmath,
        )?;
        if let Some(kdtree) = config.get_str("kdtree") {
            warn!(kdtree, "Gaussian preselection trees are not supported, ignoring");
        }

        let frontend = FrontEnd::new(config)?;
        let ncep = frontend.ncep();
        let feat_type = FeatureType::parse(config.get_str("feat").unwrap_or("1s_c_d"))?;
        if feat_type.dim(ncep) != senones.dim() {
            return Err(DecoderError::ConfigMismatch(format!(
                "feature `{}` with ncep={ncep} has {} dimensions, senones have {}",
                config.get_str("feat").unwrap_or_default(),
                feat_type.dim(ncep),
                senones.dim()
            )));
        }
        let cmn = Cmn::new(
            CmnMode::parse(config.get_str("cmn").unwrap_or("live"))?,
            config.get_str("cmninit").unwrap_or("8.0"),
            ncep,
        )?;

        let featbuf = config.get_int("featbuf")?;
        if featbuf <= 0 {
            return Err(DecoderError::Config(format!("featbuf must be positive, got {featbuf}")));
        }
        let config_grow = config.get_bool("fwdtree")? && config.get_bool("fwdflat")?;

        info!(
            n_phone = mdef.n_phone(),
            n_senone = senones.len(),
            dim = senones.dim(),
            growable = config_grow,
            "acoustic model loaded"
        );

        Ok(Self {
            senone_scores: vec![0; senones.len()],
            lmath,
            mdef,
            senones,
            tmat,
            frontend,
            cmn,
            dynamic: DynamicFeatures::new(feat_type),
            buffer: FeatureBuffer::new(featbuf as usize, config_grow),
            config_grow,
            grow_requested: false,
            state: AcmodState::Idle,
            output_frame: 0,
        })
    }

    pub fn mdef(&self) -> &ModelDef {
        &self.mdef
    }

    pub fn tmat(&self) -> &TransitionMatrices {
        &self.tmat
    }

    pub fn lmath(&self) -> &Arc<LogMath> {
        &self.lmath
    }

    pub fn ncep(&self) -> usize {
        self.frontend.ncep()
    }

    pub fn n_senone(&self) -> usize {
        self.senones.len()
    }

    /// Frames scored so far in this utterance.
    pub fn output_frame(&self) -> usize {
        self.output_frame
    }

    /// Frames waiting in the feature buffer.
    pub fn pending_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_growable(&self) -> bool {
        self.buffer.is_growable()
    }

    /// Requests an unbounded feature buffer. Two-pass configurations are
    /// always growable.
    pub fn set_grow(&mut self, grow: bool) -> bool {
        let previous = self.grow_requested;
        self.grow_requested = grow;
        self.buffer.set_growable(self.config_grow || grow);
        previous
    }

    pub fn start_utt(&mut self) -> Result<()> {
        self.frontend.reset();
        self.cmn.reset();
        self.dynamic.reset();
        self.buffer.clear();
        self.output_frame = 0;
        self.state = AcmodState::Started;
        Ok(())
    }

    fn check_input(&self, op: &str) -> Result<()> {
        match self.state {
            AcmodState::Started | AcmodState::Processing => Ok(()),
            AcmodState::Flushed => Err(DecoderError::Scoring(format!(
                "{op}: input after the whole utterance was already processed"
            ))),
            AcmodState::Idle | AcmodState::Ended => {
                Err(DecoderError::Scoring(format!("{op}: no utterance in progress")))
            }
        }
    }

    /// Consumes samples while the feature buffer has room.
    ///
    /// Advances `samples` past the consumed prefix and returns the number of
    /// feature frames queued. With `whole_utt` the buffer grows for the call,
    /// every sample is consumed and the delta lookahead is flushed.
    pub fn process_raw(&mut self, samples: &mut &[i16], whole_utt: bool) -> Result<usize> {
        self.check_input("process_raw")?;
        self.state = AcmodState::Processing;
        let saved = self.buffer.is_growable();
        if whole_utt {
            self.buffer.set_growable(true);
        }

        let mut queued = 0;
        while self.buffer.has_room() && !samples.is_empty() {
            let take = self.frontend.samples_needed().min(samples.len()).max(1);
            self.frontend.push_samples(&samples[..take]);
            *samples = &samples[take..];
            if let Some(cep) = self.frontend.compute_frame() {
                queued += self.queue_cepstra(cep);
            }
        }

        if whole_utt {
            queued += self.flush_lookahead();
            self.buffer.set_growable(saved);
            self.state = AcmodState::Flushed;
        }
        Ok(queued)
    }

    /// Consumes cepstral frames (`ncep` values each), bypassing the signal
    /// front end. Same consumption rules as [`AcousticModel::process_raw`].
    pub fn process_features<C: AsRef<[f32]>>(&mut self, frames: &mut &[C], whole_utt: bool) -> Result<usize> {
        self.check_input("process_features")?;
        let ncep = self.frontend.ncep();
        if let Some(bad) = frames.iter().find(|f| f.as_ref().len() != ncep) {
            return Err(DecoderError::Scoring(format!(
                "feature frame has {} values, expected {ncep}",
                bad.as_ref().len()
            )));
        }
        self.state = AcmodState::Processing;
        let saved = self.buffer.is_growable();
        if whole_utt {
            self.buffer.set_growable(true);
        }

        let mut queued = 0;
        while self.buffer.has_room() {
            let Some((first, rest)) = frames.split_first() else {
                break;
            };
            queued += self.queue_cepstra(first.as_ref().to_vec());
            *frames = rest;
        }

        if whole_utt {
            queued += self.flush_lookahead();
            self.buffer.set_growable(saved);
            self.state = AcmodState::Flushed;
        }
        Ok(queued)
    }

    fn queue_cepstra(&mut self, mut cep: Vec<f32>) -> usize {
        self.cmn.apply(&mut cep);
        match self.dynamic.push(cep) {
            // has_room() was checked by the caller and at most one frame is
            // produced per input frame.
            Some(feat) => {
                self.buffer.push_forced(feat);
                1
            }
            None => 0,
        }
    }

    fn flush_lookahead(&mut self) -> usize {
        let tail = self.dynamic.flush();
        let n = tail.len();
        for feat in tail {
            self.buffer.push_forced(feat);
        }
        n
    }

    /// Marks the end of input. Samples short of a full window are dropped;
    /// frames held for delta lookahead are queued for scoring.
    pub fn end_utt(&mut self) -> Result<()> {
        match self.state {
            AcmodState::Started | AcmodState::Processing => {
                let n = self.flush_lookahead();
                debug!(
                    flushed = n,
                    dropped_samples = self.frontend.pending_samples(),
                    "acoustic end of utterance"
                );
            }
            AcmodState::Flushed => {}
            AcmodState::Idle | AcmodState::Ended => {
                return Err(DecoderError::Scoring("end_utt: no utterance in progress".into()));
            }
        }
        self.frontend.reset();
        self.state = AcmodState::Ended;
        Ok(())
    }

    /// Scores the next queued frame, or `None` when the buffer is empty.
    pub fn score(&mut self) -> Option<FrameScores<'_>> {
        let feat = self.buffer.pop()?;
        let (best_score, best_senone) = self.senones.score(&feat, &self.lmath, &mut self.senone_scores);
        for s in self.senone_scores.iter_mut() {
            *s = s.saturating_sub(best_score);
        }
        let frame = self.output_frame;
        self.output_frame += 1;
        Some(FrameScores {
            frame,
            best_score,
            best_senone,
            scores: &self.senone_scores,
        })
    }
}

/// Shared handle to an acoustic model.
#[derive(Clone)]
pub struct AcousticModelHandle(pub Arc<Mutex<AcousticModel>>);

impl AcousticModelHandle {
    pub fn new(model: AcousticModel) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, AcousticModel> {
        self.0.lock()
    }
}

impl std::fmt::Debug for AcousticModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcousticModelHandle").finish_non_exhaustive()
    }
}
