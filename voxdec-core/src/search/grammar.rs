//! Finite-state grammars and the grammar-driven search.
//!
//! Grammars use the Sphinx FSG text format:
//!
//! ```text
//! FSG_BEGIN commands
//! NUM_STATES 3
//! START_STATE 0
//! FINAL_STATE 2
//! TRANSITION 0 1 0.5 go
//! TRANSITION 0 1 0.5 stop
//! TRANSITION 1 2 1.0
//! FSG_END
//! ```
//!
//! A transition without a word is a null transition. Keywords may be
//! abbreviated to their first letter and `#` starts a comment.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DecoderError, Result};
use crate::logmath::LogMath;
use crate::transcript::SegmentIter;

use super::viterbi::{Ctx, Viterbi, WordLinks, WordNode};
use super::{filler_nodes, Search, SearchContext, SearchKind, SearchParams};

#[derive(Debug, Clone, PartialEq)]
pub struct FsgTransition {
    pub from: usize,
    pub to: usize,
    pub prob: f64,
    /// `None` for null transitions.
    pub word: Option<String>,
}

/// A word-level finite-state grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct Fsg {
    name: String,
    n_states: usize,
    start: usize,
    final_state: usize,
    transitions: Vec<FsgTransition>,
}

impl Fsg {
    pub fn new(name: &str, n_states: usize, start: usize, final_state: usize) -> Result<Self> {
        if n_states == 0 || start >= n_states || final_state >= n_states {
            return Err(DecoderError::Construction(format!(
                "grammar `{name}`: start {start} and final {final_state} must be below {n_states} states"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            n_states,
            start,
            final_state,
            transitions: Vec::new(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DecoderError::ModelNotFound {
                path: path.to_path_buf(),
            },
            _ => DecoderError::Io(e),
        })?;
        let default_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "grammar".to_string());
        Self::parse(&text, &default_name).map_err(|e| DecoderError::malformed(path, e))
    }

    pub fn parse(text: &str, default_name: &str) -> Result<Self> {
        let bad = |lineno: usize, msg: &str| DecoderError::Construction(format!("line {}: {msg}", lineno + 1));
        let mut name = default_name.to_string();
        let mut n_states = None;
        let mut start = None;
        let mut final_state = None;
        let mut fsg: Option<Fsg> = None;
        let mut begun = false;
        let mut ended = false;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let number = |i: usize| -> Result<usize> {
                fields
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| bad(lineno, "expected a state number"))
            };
            match fields[0] {
                "FSG_BEGIN" => {
                    if let Some(n) = fields.get(1) {
                        name = n.to_string();
                    }
                    begun = true;
                }
                "FSG_END" => {
                    ended = true;
                    break;
                }
                _ if !begun => return Err(bad(lineno, "content before FSG_BEGIN")),
                "NUM_STATES" | "N" => n_states = Some(number(1)?),
                "START_STATE" | "S" => start = Some(number(1)?),
                "FINAL_STATE" | "F" => final_state = Some(number(1)?),
                "TRANSITION" | "T" => {
                    if fsg.is_none() {
                        let (Some(n), Some(s), Some(f)) = (n_states, start, final_state) else {
                            return Err(bad(lineno, "transition before NUM_STATES/START_STATE/FINAL_STATE"));
                        };
                        fsg = Some(Fsg::new(&name, n, s, f)?);
                    }
                    let from = number(1)?;
                    let to = number(2)?;
                    let prob: f64 = fields
                        .get(3)
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| bad(lineno, "expected a transition probability"))?;
                    if fields.len() > 5 {
                        return Err(bad(lineno, "too many fields in transition"));
                    }
                    if let Some(g) = fsg.as_mut() {
                        g.add_transition(from, to, prob, fields.get(4).copied())
                            .map_err(|e| bad(lineno, &e.to_string()))?;
                    }
                }
                other => return Err(bad(lineno, &format!("unknown keyword `{other}`"))),
            }
        }
        if !ended {
            return Err(DecoderError::Construction("missing FSG_END".into()));
        }
        match fsg {
            Some(g) => Ok(g),
            None => {
                let (Some(n), Some(s), Some(f)) = (n_states, start, final_state) else {
                    return Err(DecoderError::Construction("grammar header is incomplete".into()));
                };
                Fsg::new(&name, n, s, f)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn start_state(&self) -> usize {
        self.start
    }

    pub fn final_state(&self) -> usize {
        self.final_state
    }

    pub fn transitions(&self) -> &[FsgTransition] {
        &self.transitions
    }

    pub fn add_transition(&mut self, from: usize, to: usize, prob: f64, word: Option<&str>) -> Result<()> {
        if from >= self.n_states || to >= self.n_states {
            return Err(DecoderError::Construction(format!(
                "transition {from} -> {to} outside {} states",
                self.n_states
            )));
        }
        if !(prob > 0.0 && prob <= 1.0) {
            return Err(DecoderError::Construction(format!(
                "transition probability {prob} not in (0, 1]"
            )));
        }
        self.transitions.push(FsgTransition {
            from,
            to,
            prob,
            word: word.map(str::to_string),
        });
        Ok(())
    }

    /// Adds `word` on a new transition from `from` to `to`.
    pub fn add_word(&mut self, from: usize, to: usize, word: &str, prob: f64) -> Result<()> {
        if word.trim().is_empty() {
            return Err(DecoderError::Vocabulary("empty grammar word".into()));
        }
        self.add_transition(from, to, prob, Some(word.trim()))
    }

    /// Distinct words on word transitions.
    pub fn words(&self) -> Vec<&str> {
        let mut words: Vec<&str> = self.transitions.iter().filter_map(|t| t.word.as_deref()).collect();
        words.sort_unstable();
        words.dedup();
        words
    }

    /// For every state, the states reachable through null transitions with
    /// the best path probability. Each state reaches itself at 1.0.
    pub fn null_closure(&self) -> Vec<Vec<(usize, f64)>> {
        let nulls: Vec<&FsgTransition> = self.transitions.iter().filter(|t| t.word.is_none()).collect();
        (0..self.n_states)
            .map(|s| {
                let mut best = vec![0.0f64; self.n_states];
                best[s] = 1.0;
                let mut changed = true;
                while changed {
                    changed = false;
                    for t in &nulls {
                        let p = best[t.from] * t.prob;
                        if p > best[t.to] {
                            best[t.to] = p;
                            changed = true;
                        }
                    }
                }
                best.iter()
                    .enumerate()
                    .filter(|(_, &p)| p > 0.0)
                    .map(|(i, &p)| (i, p))
                    .collect()
            })
            .collect()
    }
}

/// Named grammars with one current selection.
///
/// Structural changes (adding, removing, selecting) take effect when the
/// owning search starts its next utterance.
#[derive(Debug, Clone, Default)]
pub struct GrammarSet {
    grammars: BTreeMap<String, Fsg>,
    current: Option<String>,
    generation: u64,
}

impl GrammarSet {
    /// Adds a grammar, selecting it when it is the first one.
    pub fn add(&mut self, fsg: Fsg) -> Result<()> {
        if self.grammars.contains_key(fsg.name()) {
            return Err(DecoderError::Search(format!("grammar `{}` already exists", fsg.name())));
        }
        if self.current.is_none() {
            self.current = Some(fsg.name().to_string());
        }
        self.grammars.insert(fsg.name().to_string(), fsg);
        self.generation += 1;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Fsg> {
        let removed = self.grammars.remove(name)?;
        if self.current.as_deref() == Some(name) {
            self.current = self.grammars.keys().next().cloned();
        }
        self.generation += 1;
        Some(removed)
    }

    pub fn select(&mut self, name: &str) -> Result<()> {
        if !self.grammars.contains_key(name) {
            return Err(DecoderError::Search(format!("no grammar named `{name}`")));
        }
        self.current = Some(name.to_string());
        self.generation += 1;
        Ok(())
    }

    pub fn current(&self) -> Option<&Fsg> {
        self.current.as_ref().and_then(|n| self.grammars.get(n))
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&Fsg> {
        self.grammars.get(name)
    }

    /// Mutable access counts as a structural change.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Fsg> {
        let fsg = self.grammars.get_mut(name)?;
        self.generation += 1;
        Some(fsg)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.grammars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.grammars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grammars.is_empty()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Grammar connectivity: contexts are grammar states.
#[derive(Debug, Default)]
struct FsgLinks {
    start: Ctx,
    /// `[state] -> (node, weighted cost)` including null closure.
    successors: Vec<Vec<(usize, i32)>>,
    final_costs: Vec<Option<i32>>,
}

impl WordLinks for FsgLinks {
    fn initial_context(&self) -> Ctx {
        self.start
    }

    fn for_each_successor(&self, ctx: Ctx, visit: &mut dyn FnMut(usize, i32)) {
        if let Some(succ) = self.successors.get(ctx as usize) {
            for &(node, cost) in succ {
                visit(node, cost);
            }
        }
    }

    fn final_cost(&self, ctx: Ctx) -> Option<i32> {
        self.final_costs.get(ctx as usize).copied().flatten()
    }
}

/// Viterbi search constrained by the current grammar of a [`GrammarSet`].
pub struct GrammarSearch {
    ctx: SearchContext,
    params: SearchParams,
    set: GrammarSet,
    built_generation: Option<u64>,
    links: FsgLinks,
    viterbi: Viterbi,
}

impl GrammarSearch {
    /// Creates the search, loading the `fsg` file when configured.
    pub fn new(config: &Config, ctx: SearchContext) -> Result<Self> {
        let params = SearchParams::from_config(config, &ctx.lmath)?;
        let mut set = GrammarSet::default();
        if let Some(path) = config.get_path("fsg") {
            set.add(Fsg::load(&path)?)?;
        }
        let mut search = Self {
            viterbi: Viterbi::new(ctx.lmath.clone(), params.beams),
            ctx,
            params,
            set,
            built_generation: None,
            links: FsgLinks::default(),
        };
        if search.set.current().is_some() {
            search.reinit()?;
        }
        Ok(search)
    }

    fn build_network(&mut self) -> Result<()> {
        let Some(fsg) = self.set.current() else {
            return Err(DecoderError::Search("no grammar is selected".into()));
        };
        let lmath: &LogMath = &self.ctx.lmath;
        let dict = self.ctx.dict.read();
        let acmod = self.ctx.acmod.lock();
        let (mdef, tmat) = (acmod.mdef(), acmod.tmat());

        let mut nodes = Vec::new();
        let mut arcs_from: Vec<Vec<(usize, i32)>> = vec![Vec::new(); fsg.n_states()];
        for t in fsg.transitions() {
            let Some(word) = t.word.as_deref() else { continue };
            let Some(wid) = dict.lookup(word) else {
                warn!(grammar = fsg.name(), word, "grammar word not in dictionary, skipping transition");
                continue;
            };
            let arc_lp = lmath.log(t.prob);
            for &variant in dict.variants(wid) {
                let (Some(name), Some(phones)) = (dict.word(variant), dict.pronunciation(variant)) else {
                    continue;
                };
                arcs_from[t.from].push((nodes.len(), arc_lp));
                nodes.push(WordNode::word(name, phones, mdef, tmat, t.to as Ctx));
            }
        }
        let n_words = nodes.len();
        nodes.extend(filler_nodes(&dict, mdef, tmat, &self.params));

        let closure = fsg.null_closure();
        let mut successors = Vec::with_capacity(fsg.n_states());
        let mut final_costs = Vec::with_capacity(fsg.n_states());
        for reach in &closure {
            let mut succ = Vec::new();
            let mut final_cost = None;
            for &(state, p) in reach {
                let closure_lp = lmath.log(p);
                for &(node, arc_lp) in &arcs_from[state] {
                    let cost = lmath
                        .scale(closure_lp.saturating_add(arc_lp), self.params.lw)
                        .saturating_add(self.params.wip);
                    succ.push((node, cost));
                }
                if state == fsg.final_state() {
                    final_cost = Some(lmath.scale(closure_lp, self.params.lw));
                }
            }
            successors.push(succ);
            final_costs.push(final_cost);
        }

        info!(
            grammar = fsg.name(),
            n_states = fsg.n_states(),
            n_words,
            n_fillers = nodes.len() - n_words,
            "grammar network built"
        );
        self.links = FsgLinks {
            start: fsg.start_state() as Ctx,
            successors,
            final_costs,
        };
        let generation = self.set.generation();
        drop(acmod);
        drop(dict);
        self.viterbi.set_network(nodes);
        self.built_generation = Some(generation);
        Ok(())
    }
}

impl Search for GrammarSearch {
    fn kind(&self) -> SearchKind {
        SearchKind::Grammar
    }

    fn start(&mut self) -> Result<()> {
        if self.built_generation != Some(self.set.generation()) {
            debug!("grammar set changed, rebuilding network");
            self.build_network()?;
        }
        self.viterbi.start(&self.links)
    }

    fn step(&mut self) -> Result<usize> {
        let mut acmod = self.ctx.acmod.lock();
        let Some(frame) = acmod.score() else {
            return Ok(0);
        };
        self.viterbi.advance(&self.links, frame.scores)?;
        Ok(1)
    }

    fn finish(&mut self) -> Result<()> {
        self.viterbi.finish(&self.links);
        Ok(())
    }

    fn hyp(&self) -> Option<(String, i32)> {
        self.viterbi.hyp()
    }

    fn seg_iter(&self) -> SegmentIter {
        SegmentIter::new(self.viterbi.segments())
    }

    fn reinit(&mut self) -> Result<()> {
        if self.set.current().is_none() {
            debug!("no grammar selected, network left empty");
            self.viterbi.set_network(Vec::new());
            self.built_generation = Some(self.set.generation());
            return Ok(());
        }
        self.build_network()
    }

    fn grammar_set(&self) -> Option<&GrammarSet> {
        Some(&self.set)
    }

    fn grammar_set_mut(&mut self) -> Option<&mut GrammarSet> {
        Some(&mut self.set)
    }
}

impl std::fmt::Debug for GrammarSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarSearch")
            .field("grammars", &self.set.len())
            .field("current", &self.set.current_name())
            .field("nodes", &self.viterbi.n_nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAMMAR: &str = "\
# two-word commands
FSG_BEGIN commands
NUM_STATES 3
START_STATE 0
FINAL_STATE 2
TRANSITION 0 1 0.5 go
T 0 1 0.5 stop
TRANSITION 1 2 0.4 now
TRANSITION 1 2 0.6
FSG_END
";

    #[test]
    fn parses_header_and_transitions() {
        let fsg = Fsg::parse(GRAMMAR, "fallback").expect("parse grammar");
        assert_eq!(fsg.name(), "commands");
        assert_eq!((fsg.n_states(), fsg.start_state(), fsg.final_state()), (3, 0, 2));
        assert_eq!(fsg.transitions().len(), 4);
        assert_eq!(fsg.words(), vec!["go", "now", "stop"]);
        assert_eq!(fsg.transitions()[3].word, None);
    }

    #[test]
    fn rejects_malformed_grammars() {
        assert!(Fsg::parse("FSG_BEGIN\nNUM_STATES 2\nSTART_STATE 0\nFINAL_STATE 1\n", "g").is_err());
        assert!(Fsg::parse(
            "FSG_BEGIN\nN 2\nS 0\nF 1\nT 0 5 1.0 x\nFSG_END\n",
            "g"
        )
        .is_err());
        assert!(Fsg::parse("FSG_BEGIN\nN 2\nS 0\nF 1\nT 0 1 1.5 x\nFSG_END\n", "g").is_err());
        assert!(Fsg::parse("FSG_BEGIN\nN 2\nS 0\nF 1\nBOGUS\nFSG_END\n", "g").is_err());
    }

    #[test]
    fn null_closure_takes_best_product() {
        let mut fsg = Fsg::new("g", 4, 0, 3).expect("fsg");
        fsg.add_transition(0, 1, 0.5, None).expect("null");
        fsg.add_transition(1, 3, 0.5, None).expect("null");
        fsg.add_transition(0, 3, 0.1, None).expect("null");
        fsg.add_word(2, 3, "x", 1.0).expect("word");

        let closure = fsg.null_closure();
        let to_final = closure[0].iter().find(|(s, _)| *s == 3).map(|(_, p)| *p);
        assert_eq!(to_final, Some(0.25));
        assert_eq!(closure[2], vec![(2, 1.0)]);
    }

    #[test]
    fn grammar_set_tracks_selection() {
        let mut set = GrammarSet::default();
        set.add(Fsg::new("a", 1, 0, 0).expect("a")).expect("add a");
        set.add(Fsg::new("b", 1, 0, 0).expect("b")).expect("add b");
        assert_eq!(set.current_name(), Some("a"));
        assert!(set.add(Fsg::new("a", 1, 0, 0).expect("a")).is_err());

        let before = set.generation();
        set.select("b").expect("select b");
        assert!(set.generation() > before);
        assert!(set.select("missing").is_err());

        set.remove("b");
        assert_eq!(set.current_name(), Some("a"));
    }
}
