//! `Decoder`: session context and utterance lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Decoder::new(config)
//!     └─► start_utt()                 → Started
//!         └─► process_audio()*        → Accumulating   (hypothesis() gives partials)
//!             └─► end_utt()           → Ended          (hypothesis(), seg_iter())
//!                 └─► start_utt() ...
//! ```
//!
//! A scoring or search error in the middle of an utterance moves it to
//! `Aborted`; the next `start_utt` succeeds normally. Reconfiguration, search
//! switching and immediate vocabulary updates are refused while an
//! utterance is in progress.
//!
//! ## Ownership
//!
//! The decoder owns one [`LogMath`], one acoustic model and one dictionary
//! and shares them with every search in its [`SearchRegistry`] through
//! handles. `reconfigure` builds a complete replacement set before swapping
//! it in, so a failed reconfiguration leaves the decoder untouched.

pub mod timer;

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Span};

use crate::acoustic::{AcousticModel, AcousticModelHandle};
use crate::audio::{self, RawSampleReader};
use crate::config::Config;
use crate::dict::{base_word_name, Dictionary, DictionaryHandle, WordId};
use crate::error::{DecoderError, Result};
use crate::logmath::LogMath;
use crate::search::{build_search, GrammarSet, LmSet, Search, SearchContext, SearchKind, SearchRegistry};
use crate::transcript::{Hypothesis, SegmentIter, UtteranceResult};

use self::timer::{DecodeTiming, PerfTimer};

/// Samples per read when streaming a raw file.
const RAW_CHUNK_SAMPLES: usize = 256;

/// Unigram weight given to words added through [`Decoder::add_word`].
const NEW_WORD_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UttState {
    Idle,
    Started,
    Accumulating,
    Ended,
    Aborted,
}

impl fmt::Display for UttState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UttState::Idle => "idle",
            UttState::Started => "started",
            UttState::Accumulating => "accumulating",
            UttState::Ended => "ended",
            UttState::Aborted => "aborted",
        })
    }
}

impl UttState {
    fn in_progress(self) -> bool {
        matches!(self, UttState::Started | UttState::Accumulating)
    }
}

/// Everything rebuilt by construction and reconfiguration.
struct Parts {
    config: Config,
    lmath: Arc<LogMath>,
    acmod: AcousticModelHandle,
    dict: DictionaryHandle,
    searches: SearchRegistry,
    frate: f64,
}

impl Parts {
    fn assemble(mut config: Config, previous: Option<&Arc<LogMath>>) -> Result<Self> {
        config.release_derived();
        let resolved = config.resolve_model_dir()?;
        let from_params = config.apply_feat_params()?;
        debug!(resolved, from_params, "configuration prepared");

        let logbase = config.get_float("logbase")?;
        let lmath = match previous {
            Some(lmath) if lmath.base() == logbase => lmath.clone(),
            _ => Arc::new(LogMath::new(logbase)?),
        };

        let frate = config.get_int("frate")?;
        if frate <= 0 {
            return Err(DecoderError::Config(format!("frate must be positive, got {frate}")));
        }

        let acmod = AcousticModel::new(&config, lmath.clone())?;
        let dict = Dictionary::load(&config, acmod.mdef())?;
        let acmod = AcousticModelHandle::new(acmod);
        let dict = DictionaryHandle::new(dict);

        let mut searches = SearchRegistry::default();
        let initial = if config.is_set("fsg") {
            Some(SearchKind::Grammar)
        } else if config.is_set("lm") || config.is_set("lmctl") {
            Some(SearchKind::LanguageModel)
        } else {
            None
        };
        if let Some(kind) = initial {
            let ctx = SearchContext {
                lmath: lmath.clone(),
                acmod: acmod.clone(),
                dict: dict.clone(),
            };
            let slot = searches.insert(build_search(kind, &config, ctx)?);
            searches.activate(slot);
        }

        info!(
            n_words = dict.read().len(),
            search = initial.map(SearchKind::name),
            "decoder assembled"
        );
        Ok(Self {
            config,
            lmath,
            acmod,
            dict,
            searches,
            frate: frate as f64,
        })
    }
}

/// A speech decoding session.
pub struct Decoder {
    config: Config,
    lmath: Arc<LogMath>,
    acmod: AcousticModelHandle,
    dict: DictionaryHandle,
    searches: SearchRegistry,
    frate: f64,
    uttid: String,
    uttno: u64,
    state: UttState,
    perf: PerfTimer,
    /// Frames of every utterance, including aborted and restarted ones.
    n_frame: usize,
    /// Whether the current utterance's frames are already in `n_frame`.
    frames_counted: bool,
    span: Span,
}

impl Decoder {
    /// Builds a decoder from `config`.
    ///
    /// Activates a grammar search when `fsg` is set, otherwise a
    /// language-model search when `lm` or `lmctl` is set.
    pub fn new(config: Config) -> Result<Self> {
        let parts = Parts::assemble(config, None)?;
        Ok(Self {
            config: parts.config,
            lmath: parts.lmath,
            acmod: parts.acmod,
            dict: parts.dict,
            searches: parts.searches,
            frate: parts.frate,
            uttid: String::new(),
            uttno: 0,
            state: UttState::Idle,
            perf: PerfTimer::default(),
            n_frame: 0,
            frames_counted: true,
            span: Span::none(),
        })
    }

    /// Rebuilds the models and searches, from `config` when it differs from
    /// the current configuration, else from the current one.
    ///
    /// All searches are discarded. On error the decoder keeps its previous
    /// state.
    pub fn reconfigure(&mut self, config: Option<Config>) -> Result<()> {
        self.ensure_between_utterances("reconfigure")?;
        let config = match config {
            Some(new) if new.differs_from(&self.config) => new,
            _ => self.config.clone(),
        };
        let parts = Parts::assemble(config, Some(&self.lmath))?;
        self.config = parts.config;
        self.lmath = parts.lmath;
        self.acmod = parts.acmod;
        self.dict = parts.dict;
        self.searches = parts.searches;
        self.frate = parts.frate;
        self.state = UttState::Idle;
        info!("decoder reconfigured");
        Ok(())
    }

    fn ensure_between_utterances(&self, op: &'static str) -> Result<()> {
        if self.state.in_progress() {
            return Err(DecoderError::Lifecycle { op, state: self.state });
        }
        Ok(())
    }

    fn search_context(&self) -> SearchContext {
        SearchContext {
            lmath: self.lmath.clone(),
            acmod: self.acmod.clone(),
            dict: self.dict.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Search selection
    // -----------------------------------------------------------------------

    /// Activates the search of `kind`, reinitializing it if it already
    /// exists and building it otherwise.
    ///
    /// On error the previously active search stays active.
    pub fn select_or_build_search(&mut self, kind: SearchKind) -> Result<&mut dyn Search> {
        self.ensure_between_utterances("select_or_build_search")?;
        let slot = match self.searches.slot_of(kind.name()) {
            Some(slot) => {
                debug!(search = kind.name(), "reinitializing existing search");
                self.searches.slot_mut(slot).reinit()?;
                slot
            }
            None => {
                info!(search = kind.name(), "building search");
                let search = build_search(kind, &self.config, self.search_context())?;
                self.searches.insert(search)
            }
        };
        self.searches.activate(slot);
        let search: &mut dyn Search = self.searches.slot_mut(slot);
        Ok(search)
    }

    /// Activates the grammar search and returns its grammar set.
    pub fn update_grammar_set(&mut self) -> Result<&mut GrammarSet> {
        self.select_or_build_search(SearchKind::Grammar)?
            .grammar_set_mut()
            .ok_or_else(|| DecoderError::Search("grammar search has no grammar set".into()))
    }

    /// Activates the language-model search and returns its model set.
    pub fn update_lm_set(&mut self) -> Result<&mut LmSet> {
        self.select_or_build_search(SearchKind::LanguageModel)?
            .lm_set_mut()
            .ok_or_else(|| DecoderError::Search("language-model search has no model set".into()))
    }

    /// The grammar set of the active search, if it is a grammar search.
    pub fn grammar_set(&self) -> Option<&GrammarSet> {
        self.searches.active().and_then(|s| s.grammar_set())
    }

    pub fn grammar_set_mut(&mut self) -> Option<&mut GrammarSet> {
        self.searches.active_mut().and_then(|s| s.grammar_set_mut())
    }

    /// The model set of the active search, if it is a language-model search.
    pub fn lm_set(&self) -> Option<&LmSet> {
        self.searches.active().and_then(|s| s.lm_set())
    }

    pub fn lm_set_mut(&mut self) -> Option<&mut LmSet> {
        self.searches.active_mut().and_then(|s| s.lm_set_mut())
    }

    // -----------------------------------------------------------------------
    // Vocabulary
    // -----------------------------------------------------------------------

    /// Adds a word to the dictionary and, when the active search is a
    /// language-model search, to its current model.
    ///
    /// With `update` the active search is reinitialized so the word is
    /// usable in the next utterance; otherwise it becomes visible at the
    /// next reinit. A language-model failure does not undo the dictionary
    /// insertion.
    pub fn add_word(&mut self, word: &str, pron: &str, update: bool) -> Result<WordId> {
        if update {
            self.ensure_between_utterances("add_word")?;
        }
        let wid = self.dict.write().add_word(word, pron)?;
        if let Some(lms) = self.searches.active_mut().and_then(|s| s.lm_set_mut()) {
            lms.add_word(base_word_name(word), NEW_WORD_WEIGHT).map_err(|e| {
                DecoderError::Vocabulary(format!("`{word}` was added to the dictionary but not the language model: {e}"))
            })?;
        }
        if update {
            if let Some(search) = self.searches.active_mut() {
                search.reinit()?;
            }
        }
        info!(word, pron, wid, update, "word added");
        Ok(wid)
    }

    // -----------------------------------------------------------------------
    // Utterance lifecycle
    // -----------------------------------------------------------------------

    /// Begins an utterance, named `uttid` or a zero-padded counter.
    pub fn start_utt(&mut self, uttid: Option<&str>) -> Result<()> {
        if self.searches.active().is_none() {
            return Err(DecoderError::NoActiveSearch);
        }
        if self.state.in_progress() {
            warn!(uttid = %self.uttid, "utterance restarted before end_utt");
            self.count_frames();
        }
        self.perf.stop();
        self.perf.reset_utt();
        self.perf.start();

        self.uttid = match uttid {
            Some(id) => id.to_owned(),
            None => format!("{:09}", self.uttno),
        };
        self.uttno += 1;
        self.span = info_span!("utterance", uttid = %self.uttid);
        let _guard = self.span.clone().entered();

        // The acoustic lock must be released before the search runs; searches
        // take it themselves.
        let reset = self.acmod.lock().start_utt();
        self.frames_counted = false;
        let started = reset.and_then(|()| match self.searches.active_mut() {
            Some(search) => search.start(),
            None => Err(DecoderError::NoActiveSearch),
        });
        self.perf.stop();
        match started {
            Ok(()) => {
                self.state = UttState::Started;
                debug!("utterance started");
                Ok(())
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    fn abort(&mut self, err: DecoderError) -> DecoderError {
        let frames = self.count_frames();
        warn!(uttid = %self.uttid, frames, error = %err, "utterance aborted");
        self.state = UttState::Aborted;
        err
    }

    /// Adds the current utterance's frames to the running total, once.
    fn count_frames(&mut self) -> usize {
        let frames = self.acmod.lock().output_frame();
        if !self.frames_counted {
            self.n_frame += frames;
            self.frames_counted = true;
        }
        frames
    }

    /// Feeds 16-bit samples. Returns the number of frames searched, or the
    /// number of frames extracted when `no_search` is set.
    ///
    /// `whole_utt` declares that `samples` is the complete utterance.
    pub fn process_audio(&mut self, samples: &[i16], no_search: bool, whole_utt: bool) -> Result<usize> {
        let mut input = samples;
        self.drive("process_audio", no_search, |acmod| {
            let queued = acmod.process_raw(&mut input, whole_utt)?;
            Ok((queued, input.len()))
        })
    }

    /// Feeds cepstral frames computed upstream. Same contract as
    /// [`Decoder::process_audio`].
    pub fn process_features<C: AsRef<[f32]>>(&mut self, frames: &[C], no_search: bool, whole_utt: bool) -> Result<usize> {
        let mut input = frames;
        self.drive("process_features", no_search, |acmod| {
            let queued = acmod.process_features(&mut input, whole_utt)?;
            Ok((queued, input.len()))
        })
    }

    /// Alternates acoustic feeding and search until `feed` reports no input
    /// left. `feed` returns (frames queued, input remaining).
    fn drive<F>(&mut self, op: &'static str, no_search: bool, mut feed: F) -> Result<usize>
    where
        F: FnMut(&mut AcousticModel) -> Result<(usize, usize)>,
    {
        if !self.state.in_progress() {
            return Err(DecoderError::Lifecycle { op, state: self.state });
        }
        let _guard = self.span.clone().entered();
        self.state = UttState::Accumulating;
        self.perf.start();

        let result = (|| -> Result<usize> {
            if no_search {
                self.acmod.lock().set_grow(true);
            }
            let mut total = 0;
            let mut remaining = usize::MAX;
            loop {
                let (queued, left) = feed(&mut self.acmod.lock())?;
                let searched = if no_search { 0 } else { self.drain_steps()? };
                total += if no_search { queued } else { searched };
                if left == 0 {
                    break;
                }
                if left == remaining && queued == 0 && searched == 0 {
                    return Err(DecoderError::Scoring(format!(
                        "{op}: feature buffer is full and nothing consumes it"
                    )));
                }
                remaining = left;
            }
            Ok(total)
        })();

        self.perf.stop();
        result.map_err(|err| self.abort(err))
    }

    /// Steps the active search until no scored frame is left.
    fn drain_steps(&mut self) -> Result<usize> {
        let search = self.searches.active_mut().ok_or(DecoderError::NoActiveSearch)?;
        let mut searched = 0;
        loop {
            match search.step()? {
                0 => return Ok(searched),
                n => searched += n,
            }
        }
    }

    /// Ends the utterance: flushes the acoustic model, searches the
    /// remaining frames and settles the final hypothesis.
    pub fn end_utt(&mut self) -> Result<()> {
        if !self.state.in_progress() {
            return Err(DecoderError::Lifecycle {
                op: "end_utt",
                state: self.state,
            });
        }
        let _guard = self.span.clone().entered();
        self.perf.start();

        let flushed = self.acmod.lock().end_utt();
        let drained = flushed.and_then(|()| self.drain_steps());
        let finished = match self.searches.active_mut() {
            Some(search) => search.finish(),
            None => Err(DecoderError::NoActiveSearch),
        };

        self.perf.stop();
        let frames = self.count_frames();

        match drained.and(finished) {
            Ok(()) => {
                self.state = UttState::Ended;
                let timing = self.utt_time();
                info!(
                    frames,
                    speech_secs = timing.speech_secs,
                    rtf_cpu = timing.rtf_cpu(),
                    "utterance ended"
                );
                Ok(())
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Best hypothesis so far; partial while accumulating, final after
    /// `end_utt`. `None` when no word has been recognized.
    pub fn hypothesis(&mut self) -> Result<Option<Hypothesis>> {
        if !matches!(self.state, UttState::Started | UttState::Accumulating | UttState::Ended) {
            return Err(DecoderError::Lifecycle {
                op: "hypothesis",
                state: self.state,
            });
        }
        self.perf.start();
        let hyp = self.searches.active().ok_or(DecoderError::NoActiveSearch).map(|s| s.hyp());
        self.perf.stop();
        Ok(hyp?.map(|(text, score)| Hypothesis {
            text,
            score,
            uttid: self.uttid.clone(),
        }))
    }

    /// Word segmentation of the finished utterance.
    pub fn seg_iter(&self) -> Result<SegmentIter> {
        if self.state != UttState::Ended {
            return Err(DecoderError::Lifecycle {
                op: "seg_iter",
                state: self.state,
            });
        }
        self.searches
            .active()
            .map(|s| s.seg_iter())
            .ok_or(DecoderError::NoActiveSearch)
    }

    /// Timing of the current (or last) utterance.
    pub fn utt_time(&self) -> DecodeTiming {
        let frames = self.acmod.lock().output_frame();
        DecodeTiming {
            frames,
            speech_secs: frames as f64 / self.frate,
            cpu_secs: self.perf.utt_cpu().as_secs_f64(),
            wall_secs: self.perf.utt_wall().as_secs_f64(),
        }
    }

    /// Cumulative timing of every utterance started so far.
    pub fn all_time(&self) -> DecodeTiming {
        DecodeTiming {
            frames: self.n_frame,
            speech_secs: self.n_frame as f64 / self.frate,
            cpu_secs: self.perf.total_cpu().as_secs_f64(),
            wall_secs: self.perf.total_wall().as_secs_f64(),
        }
    }

    /// Hypothesis, segmentation and timing of the finished utterance.
    pub fn utterance_result(&mut self) -> Result<UtteranceResult> {
        let segments = self.seg_iter()?.collect();
        let hyp = self.hypothesis()?;
        Ok(UtteranceResult {
            uttid: self.uttid.clone(),
            text: hyp.as_ref().map(|h| h.text.clone()),
            score: hyp.map(|h| h.score),
            segments,
            timing: self.utt_time(),
        })
    }

    // -----------------------------------------------------------------------
    // Whole-stream decoding
    // -----------------------------------------------------------------------

    /// Decodes a headerless 16-bit little-endian stream as one utterance.
    ///
    /// With `max_samples` at most that many samples are read and processed
    /// in one call; otherwise the stream is read to the end in small chunks.
    /// Returns the number of samples decoded.
    pub fn decode_raw<R: Read>(&mut self, reader: R, uttid: Option<&str>, max_samples: Option<usize>) -> Result<usize> {
        let mut reader = RawSampleReader::new(reader);
        self.start_utt(uttid)?;
        let mut total = 0;
        match max_samples {
            Some(max) => {
                let samples = reader.read_chunk(max)?;
                total = samples.len();
                self.process_audio(&samples, false, true)?;
            }
            None => loop {
                let chunk = reader.read_chunk(RAW_CHUNK_SAMPLES)?;
                if chunk.is_empty() {
                    break;
                }
                total += chunk.len();
                self.process_audio(&chunk, false, false)?;
            },
        }
        self.end_utt()?;
        Ok(total)
    }

    /// Decodes a WAV file as one utterance, converting it to the
    /// configured sample rate. Returns the number of samples decoded.
    pub fn decode_wav(&mut self, path: &Path, uttid: Option<&str>) -> Result<usize> {
        let samprate = self.config.get_float("samprate")?.round() as u32;
        let samples = audio::read_wav(path, samprate)?;
        self.start_utt(uttid)?;
        self.process_audio(&samples, false, true)?;
        self.end_utt()?;
        Ok(samples.len())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn uttid(&self) -> &str {
        &self.uttid
    }

    pub fn state(&self) -> UttState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lmath(&self) -> &Arc<LogMath> {
        &self.lmath
    }

    pub fn acoustic_model(&self) -> &AcousticModelHandle {
        &self.acmod
    }

    pub fn dictionary(&self) -> &DictionaryHandle {
        &self.dict
    }

    pub fn active_search(&self) -> Option<&dyn Search> {
        self.searches.active()
    }

    pub fn searches(&self) -> &SearchRegistry {
        &self.searches
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("uttid", &self.uttid)
            .field("state", &self.state)
            .field("searches", &self.searches)
            .field("n_frame", &self.n_frame)
            .finish_non_exhaustive()
    }
}
