//! Search strategies and the registry the decoder keeps them in.
//!
//! Every strategy implements [`Search`]. Two are provided, both driving the
//! shared Viterbi engine in [`viterbi`]:
//!
//! | Kind | Name | Model set |
//! |------|------|-----------|
//! | [`SearchKind::Grammar`] | `"grammar"` | [`GrammarSet`] |
//! | [`SearchKind::LanguageModel`] | `"language-model"` | [`LmSet`] |

pub mod grammar;
pub mod ngram;
pub(crate) mod viterbi;

use std::collections::HashMap;
use std::sync::Arc;

use crate::acoustic::mdef::ModelDef;
use crate::acoustic::senone::TransitionMatrices;
use crate::acoustic::AcousticModelHandle;
use crate::config::Config;
use crate::dict::{Dictionary, DictionaryHandle, FINISH_WORD, SILENCE_WORD, START_WORD};
use crate::error::{DecoderError, Result};
use crate::logmath::LogMath;
use crate::transcript::SegmentIter;

pub use self::grammar::{Fsg, GrammarSearch, GrammarSet};
pub use self::ngram::{LmSet, NgramModel, NgramSearch};

use self::viterbi::{Beams, WordNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchKind {
    Grammar,
    LanguageModel,
}

impl SearchKind {
    pub fn name(self) -> &'static str {
        match self {
            SearchKind::Grammar => "grammar",
            SearchKind::LanguageModel => "language-model",
        }
    }
}

impl std::fmt::Display for SearchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoding strategy driven frame by frame by the decoder.
pub trait Search: Send + std::fmt::Debug {
    fn kind(&self) -> SearchKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Prepares for a new utterance.
    fn start(&mut self) -> Result<()>;

    /// Consumes at most one scored frame. Returns the number of frames
    /// advanced; 0 means no frame was available.
    fn step(&mut self) -> Result<usize>;

    /// Settles the final path after the last frame.
    fn finish(&mut self) -> Result<()>;

    /// Best word string and its score, partial before `finish`.
    fn hyp(&self) -> Option<(String, i32)>;

    fn seg_iter(&self) -> SegmentIter;

    /// Rebuilds everything derived from the dictionary and model set.
    /// Beams and weights are kept.
    fn reinit(&mut self) -> Result<()>;

    fn grammar_set(&self) -> Option<&GrammarSet> {
        None
    }

    fn grammar_set_mut(&mut self) -> Option<&mut GrammarSet> {
        None
    }

    fn lm_set(&self) -> Option<&LmSet> {
        None
    }

    fn lm_set_mut(&mut self) -> Option<&mut LmSet> {
        None
    }
}

/// Shared resources every search reads from.
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub lmath: Arc<LogMath>,
    pub acmod: AcousticModelHandle,
    pub dict: DictionaryHandle,
}

/// Beams and weights, converted to log values once.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchParams {
    pub beams: Beams,
    pub lw: f64,
    pub wip: i32,
    pub silence_cost: i32,
    pub filler_cost: i32,
}

impl SearchParams {
    pub fn from_config(config: &Config, lmath: &LogMath) -> Result<Self> {
        let prob = |name: &str| -> Result<f64> {
            let v = config.get_float(name)?;
            if v > 0.0 && v <= 1.0 {
                Ok(v)
            } else {
                Err(DecoderError::Config(format!("{name} must be in (0, 1], got {v}")))
            }
        };
        let beam = prob("beam")?;
        let wbeam = prob("wbeam")?;
        let silprob = prob("silprob")?;
        let fillprob = prob("fillprob")?;
        let wip = config.get_float("wip")?;
        if wip <= 0.0 {
            return Err(DecoderError::Config(format!("wip must be positive, got {wip}")));
        }
        let lw = config.get_float("lw")?;
        if lw <= 0.0 {
            return Err(DecoderError::Config(format!("lw must be positive, got {lw}")));
        }

        let wip = lmath.log(wip);
        Ok(Self {
            beams: Beams {
                beam: lmath.log(beam),
                wbeam: lmath.log(wbeam),
            },
            lw,
            wip,
            silence_cost: lmath.scale(lmath.log(silprob), lw).saturating_add(wip),
            filler_cost: lmath.scale(lmath.log(fillprob), lw).saturating_add(wip),
        })
    }
}

/// Filler nodes for every dictionary filler except the sentence markers.
pub(crate) fn filler_nodes(
    dict: &Dictionary,
    mdef: &ModelDef,
    tmat: &TransitionMatrices,
    params: &SearchParams,
) -> Vec<WordNode> {
    dict.iter()
        .filter(|&(wid, word)| dict.is_filler(wid) && word != START_WORD && word != FINISH_WORD)
        .filter_map(|(wid, word)| {
            let phones = dict.pronunciation(wid)?;
            let cost = if word == SILENCE_WORD {
                params.silence_cost
            } else {
                params.filler_cost
            };
            Some(WordNode::filler(word, phones, mdef, tmat, cost))
        })
        .collect()
}

/// Constructs a search of the given kind from the configuration.
pub fn build_search(kind: SearchKind, config: &Config, ctx: SearchContext) -> Result<Box<dyn Search>> {
    Ok(match kind {
        SearchKind::Grammar => Box::new(GrammarSearch::new(config, ctx)?),
        SearchKind::LanguageModel => Box::new(NgramSearch::new(config, ctx)?),
    })
}

/// Searches owned by a decoder, at most one per name, with one active.
#[derive(Debug, Default)]
pub struct SearchRegistry {
    slots: Vec<Box<dyn Search>>,
    by_name: HashMap<&'static str, usize>,
    active: Option<usize>,
}

impl SearchRegistry {
    /// Inserts a search, replacing any existing one with the same name.
    /// Returns its slot.
    pub fn insert(&mut self, search: Box<dyn Search>) -> usize {
        let name = search.name();
        match self.by_name.get(name) {
            Some(&slot) => {
                self.slots[slot] = search;
                slot
            }
            None => {
                self.slots.push(search);
                let slot = self.slots.len() - 1;
                self.by_name.insert(name, slot);
                slot
            }
        }
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Search> {
        self.slot_of(name).map(|slot| self.slots[slot].as_ref())
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut (dyn Search + 'static) {
        self.slots[slot].as_mut()
    }

    pub fn activate(&mut self, slot: usize) {
        if slot < self.slots.len() {
            self.active = Some(slot);
        }
    }

    pub fn active(&self) -> Option<&dyn Search> {
        self.active.map(|slot| self.slots[slot].as_ref())
    }

    pub fn active_mut(&mut self) -> Option<&mut (dyn Search + 'static)> {
        self.active.map(|slot| self.slots[slot].as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
