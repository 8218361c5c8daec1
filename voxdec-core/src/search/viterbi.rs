//! Token-passing Viterbi over a flat network of word HMMs.
//!
//! Each word node is a left-to-right chain of emitting states built from the
//! word's phones. Word exits are recorded in a backpointer table; the exits
//! of one frame are grouped by their successor *context* (a grammar state or
//! the last language-model word) and only the best exit per context is
//! propagated into the next frame's word entries. Fillers are transparent:
//! they are reachable from every context and exit into the context they
//! were entered from.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::acoustic::mdef::ModelDef;
use crate::acoustic::senone::TransitionMatrices;
use crate::dict::base_word_name;
use crate::error::{DecoderError, Result};
use crate::logmath::{LogMath, LOG_ZERO};
use crate::transcript::Segment;

/// Successor context of a word exit.
pub(crate) type Ctx = u32;

#[derive(Debug, Clone)]
struct HmmState {
    senone: usize,
    /// `(target state, log prob)`; a target equal to the state count exits.
    arcs: Vec<(usize, i32)>,
}

#[derive(Debug, Clone)]
pub(crate) struct WordNode {
    /// Dictionary spelling.
    pub name: String,
    pub filler: bool,
    states: Vec<HmmState>,
    /// `None` for fillers, which keep the context they were entered from.
    pub exit_ctx: Option<Ctx>,
    filler_cost: i32,
}

impl WordNode {
    pub fn word(
        name: &str,
        phones: &[usize],
        mdef: &ModelDef,
        tmat: &TransitionMatrices,
        exit_ctx: Ctx,
    ) -> Self {
        Self {
            name: name.to_string(),
            filler: false,
            states: build_states(phones, mdef, tmat),
            exit_ctx: Some(exit_ctx),
            filler_cost: LOG_ZERO,
        }
    }

    pub fn filler(
        name: &str,
        phones: &[usize],
        mdef: &ModelDef,
        tmat: &TransitionMatrices,
        cost: i32,
    ) -> Self {
        Self {
            name: name.to_string(),
            filler: true,
            states: build_states(phones, mdef, tmat),
            exit_ctx: None,
            filler_cost: cost,
        }
    }
}

fn build_states(phones: &[usize], mdef: &ModelDef, tmat: &TransitionMatrices) -> Vec<HmmState> {
    let n = mdef.n_emit_state();
    let mut states = Vec::with_capacity(phones.len() * n);
    for (i, &phone) in phones.iter().enumerate() {
        let base = i * n;
        let senones = mdef.senones(phone);
        for from in 0..n {
            let arcs = (from..=n)
                .map(|to| (base + to, tmat.tprob(phone, from, to)))
                .filter(|&(_, lp)| lp > LOG_ZERO)
                .collect();
            states.push(HmmState {
                senone: senones[from],
                arcs,
            });
        }
    }
    states
}

/// Word-to-word connectivity of a search network.
pub(crate) trait WordLinks {
    fn initial_context(&self) -> Ctx;

    /// Calls `visit(node, cost)` for every non-filler node that may follow
    /// an exit into `ctx`. Costs are already weighted.
    fn for_each_successor(&self, ctx: Ctx, visit: &mut dyn FnMut(usize, i32));

    /// Cost of ending the utterance in `ctx`, `None` if it may not end there.
    fn final_cost(&self, ctx: Ctx) -> Option<i32>;
}

#[derive(Debug, Clone, Copy)]
struct Token {
    score: i32,
    bp: Option<usize>,
    ctx_in: Ctx,
}

const INACTIVE: Token = Token {
    score: LOG_ZERO,
    bp: None,
    ctx_in: 0,
};

#[derive(Debug, Clone, Copy)]
struct BpEntry {
    node: usize,
    frame: usize,
    score: i32,
    prev: Option<usize>,
    ctx: Ctx,
}

/// Pruning widths as (negative) log values.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Beams {
    pub beam: i32,
    pub wbeam: i32,
}

pub(crate) struct Viterbi {
    lmath: Arc<LogMath>,
    beams: Beams,
    nodes: Vec<WordNode>,
    fillers: Vec<usize>,
    tokens: Vec<Vec<Token>>,
    scratch: Vec<Token>,
    entries: Vec<Token>,
    bps: Vec<BpEntry>,
    /// Log-sum of all exit scores per frame.
    exit_norm: Vec<i32>,
    frame: usize,
    finished: bool,
    final_bp: Option<(usize, i32)>,
}

impl Viterbi {
    pub fn new(lmath: Arc<LogMath>, beams: Beams) -> Self {
        Self {
            lmath,
            beams,
            nodes: Vec::new(),
            fillers: Vec::new(),
            tokens: Vec::new(),
            scratch: Vec::new(),
            entries: Vec::new(),
            bps: Vec::new(),
            exit_norm: Vec::new(),
            frame: 0,
            finished: false,
            final_bp: None,
        }
    }

    pub fn set_network(&mut self, nodes: Vec<WordNode>) {
        self.fillers = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.filler)
            .map(|(i, _)| i)
            .collect();
        self.tokens = nodes.iter().map(|n| vec![INACTIVE; n.states.len()]).collect();
        self.entries = vec![INACTIVE; nodes.len()];
        self.nodes = nodes;
        self.clear();
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn clear(&mut self) {
        for toks in self.tokens.iter_mut() {
            toks.fill(INACTIVE);
        }
        self.entries.fill(INACTIVE);
        self.bps.clear();
        self.exit_norm.clear();
        self.frame = 0;
        self.finished = false;
        self.final_bp = None;
    }

    pub fn start(&mut self, links: &dyn WordLinks) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DecoderError::Search("search network has no words".into()));
        }
        self.clear();
        self.enter_successors(links, links.initial_context(), 0, None);
        Ok(())
    }

    fn enter_successors(&mut self, links: &dyn WordLinks, ctx: Ctx, score: i32, bp: Option<usize>) {
        let entries = &mut self.entries;
        let mut visit = |n: usize, cost: i32| {
            let s = score.saturating_add(cost);
            if s > entries[n].score {
                entries[n] = Token { score: s, bp, ctx_in: ctx };
            }
        };
        links.for_each_successor(ctx, &mut visit);
        for &f in &self.fillers {
            visit(f, self.nodes[f].filler_cost);
        }
    }

    /// Advances every active path by one frame of normalized senone scores.
    pub fn advance(&mut self, links: &dyn WordLinks, scores: &[i32]) -> Result<()> {
        if self.finished {
            return Err(DecoderError::Search("search already finished".into()));
        }
        let t = self.frame;

        let mut best = LOG_ZERO;
        for n in 0..self.nodes.len() {
            let node = &self.nodes[n];
            let next = &mut self.scratch;
            next.clear();
            next.resize(node.states.len(), INACTIVE);

            let entry = std::mem::replace(&mut self.entries[n], INACTIVE);
            if entry.score > LOG_ZERO {
                next[0] = entry;
            }
            for (i, tok) in self.tokens[n].iter().enumerate() {
                if tok.score <= LOG_ZERO {
                    continue;
                }
                for &(to, lp) in &node.states[i].arcs {
                    if to < next.len() {
                        let s = tok.score.saturating_add(lp);
                        if s > next[to].score {
                            next[to] = Token { score: s, ..*tok };
                        }
                    }
                }
            }
            for (j, tok) in next.iter_mut().enumerate() {
                if tok.score <= LOG_ZERO {
                    continue;
                }
                let senone = node.states[j].senone;
                let ac = *scores.get(senone).ok_or_else(|| {
                    DecoderError::Search(format!("senone {senone} missing from frame {t} scores"))
                })?;
                tok.score = tok.score.saturating_add(ac);
                best = best.max(tok.score);
            }
            std::mem::swap(&mut self.tokens[n], &mut self.scratch);
        }
        if best <= LOG_ZERO {
            return Err(DecoderError::Search(format!("no active paths at frame {t}")));
        }

        let threshold = best.saturating_add(self.beams.beam);
        let word_threshold = best.saturating_add(self.beams.wbeam);
        let first_bp = self.bps.len();
        let mut norm = LOG_ZERO;
        for (n, node) in self.nodes.iter().enumerate() {
            let toks = &mut self.tokens[n];
            let n_states = toks.len();
            let mut exit: Option<(i32, Token)> = None;
            for (i, tok) in toks.iter_mut().enumerate() {
                if tok.score <= LOG_ZERO || tok.score < threshold {
                    *tok = INACTIVE;
                    continue;
                }
                for &(to, lp) in &node.states[i].arcs {
                    if to == n_states {
                        let s = tok.score.saturating_add(lp);
                        if exit.map_or(true, |(b, _)| s > b) {
                            exit = Some((s, *tok));
                        }
                    }
                }
            }
            if let Some((score, tok)) = exit {
                if score > LOG_ZERO && score >= word_threshold {
                    self.bps.push(BpEntry {
                        node: n,
                        frame: t,
                        score,
                        prev: tok.bp,
                        ctx: node.exit_ctx.unwrap_or(tok.ctx_in),
                    });
                    norm = self.lmath.add(norm, score);
                }
            }
        }
        self.exit_norm.push(norm);

        let mut best_per_ctx: BTreeMap<Ctx, usize> = BTreeMap::new();
        for bi in first_bp..self.bps.len() {
            match best_per_ctx.entry(self.bps[bi].ctx) {
                Entry::Vacant(v) => {
                    v.insert(bi);
                }
                Entry::Occupied(mut o) => {
                    if self.bps[bi].score > self.bps[*o.get()].score {
                        o.insert(bi);
                    }
                }
            }
        }
        for (ctx, bi) in best_per_ctx {
            let score = self.bps[bi].score;
            self.enter_successors(links, ctx, score, Some(bi));
        }

        self.frame += 1;
        Ok(())
    }

    /// Picks the final path: exits at the last frame into a context that
    /// may end the utterance, else any exit at the last frame, else the
    /// latest exits.
    pub fn finish(&mut self, links: &dyn WordLinks) {
        self.finished = true;
        self.final_bp = None;
        let Some(last) = self.frame.checked_sub(1) else {
            return;
        };
        for (bi, bp) in self.bps.iter().enumerate().filter(|(_, b)| b.frame == last) {
            if let Some(cost) = links.final_cost(bp.ctx) {
                let s = bp.score.saturating_add(cost);
                if self.final_bp.map_or(true, |(_, b)| s > b) {
                    self.final_bp = Some((bi, s));
                }
            }
        }
        if self.final_bp.is_none() {
            self.final_bp = self.bps.last().and_then(|b| self.best_exit_at(b.frame));
        }
    }

    fn best_exit_at(&self, frame: usize) -> Option<(usize, i32)> {
        let mut best: Option<(usize, i32)> = None;
        for (bi, bp) in self.bps.iter().enumerate().filter(|(_, b)| b.frame == frame) {
            if best.map_or(true, |(_, s)| bp.score > s) {
                best = Some((bi, bp.score));
            }
        }
        best
    }

    fn backtrace(&self, mut bi: Option<usize>) -> Vec<usize> {
        let mut path = Vec::new();
        while let Some(i) = bi {
            path.push(i);
            bi = self.bps[i].prev;
        }
        path.reverse();
        path
    }

    /// Final hypothesis after [`Viterbi::finish`], otherwise the best
    /// partial path.
    pub fn hyp(&self) -> Option<(String, i32)> {
        let (bi, score) = if self.finished {
            self.final_bp?
        } else {
            self.best_exit_at(self.bps.last()?.frame)?
        };
        let text = self
            .backtrace(Some(bi))
            .into_iter()
            .map(|i| &self.nodes[self.bps[i].node])
            .filter(|n| !n.filler)
            .map(|n| base_word_name(&n.name))
            .collect::<Vec<_>>()
            .join(" ");
        Some((text, score))
    }

    /// Word segmentation of the final path.
    pub fn segments(&self) -> Vec<Segment> {
        let Some((bi, _)) = self.final_bp.filter(|_| self.finished) else {
            return Vec::new();
        };
        self.backtrace(Some(bi))
            .into_iter()
            .map(|i| {
                let bp = &self.bps[i];
                Segment {
                    word: self.nodes[bp.node].name.clone(),
                    start_frame: bp.prev.map_or(0, |p| self.bps[p].frame + 1),
                    end_frame: bp.frame,
                    prob: bp.score.saturating_sub(self.exit_norm[bp.frame]).min(0),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatLinks;

    impl WordLinks for FlatLinks {
        fn initial_context(&self) -> Ctx {
            0
        }

        fn for_each_successor(&self, _ctx: Ctx, visit: &mut dyn FnMut(usize, i32)) {
            visit(0, -1000);
            visit(1, -1000);
        }

        fn final_cost(&self, ctx: Ctx) -> Option<i32> {
            (ctx == 2).then_some(0)
        }
    }

    fn network() -> (Arc<LogMath>, Vec<WordNode>) {
        let lmath = Arc::new(LogMath::new(1.0001).expect("logmath"));
        let phones = vec!["A".to_string(), "B".to_string()];
        let mdef = ModelDef::from_parts(phones, 1, None).expect("mdef");
        let tmat = TransitionMatrices::from_table(vec![vec![vec![0.9, 0.1]]; 2], 2, 1, 1e-4, &lmath)
            .expect("tmat");
        let nodes = vec![
            WordNode::word("a", &[0], &mdef, &tmat, 1),
            WordNode::word("b", &[1], &mdef, &tmat, 2),
        ];
        (lmath, nodes)
    }

    fn viterbi() -> Viterbi {
        let (lmath, nodes) = network();
        let beams = Beams {
            beam: lmath.log(1e-48),
            wbeam: lmath.log(7e-29),
        };
        let mut v = Viterbi::new(lmath, beams);
        v.set_network(nodes);
        v
    }

    const FAVOR_A: [i32; 2] = [0, -100_000];
    const FAVOR_B: [i32; 2] = [-100_000, 0];

    #[test]
    fn best_path_follows_the_scores() {
        let mut v = viterbi();
        v.start(&FlatLinks).expect("start");
        for scores in [FAVOR_A, FAVOR_A, FAVOR_A, FAVOR_B, FAVOR_B, FAVOR_B] {
            v.advance(&FlatLinks, &scores).expect("advance");
        }
        v.finish(&FlatLinks);

        let (text, _) = v.hyp().expect("hypothesis");
        assert_eq!(text, "a b");
        let segs = v.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].start_frame, segs[0].end_frame), (0, 2));
        assert_eq!((segs[1].start_frame, segs[1].end_frame), (3, 5));
        assert!(segs.iter().all(|s| s.prob <= 0));
    }

    #[test]
    fn partial_hypothesis_is_available_before_finish() {
        let mut v = viterbi();
        v.start(&FlatLinks).expect("start");
        assert!(v.hyp().is_none());
        for _ in 0..3 {
            v.advance(&FlatLinks, &FAVOR_A).expect("advance");
        }
        assert_eq!(v.hyp().map(|(t, _)| t).as_deref(), Some("a"));
        assert!(v.segments().is_empty());
    }

    #[test]
    fn finish_prefers_exits_into_final_contexts() {
        let mut v = viterbi();
        v.start(&FlatLinks).expect("start");
        for _ in 0..3 {
            v.advance(&FlatLinks, &FAVOR_A).expect("advance");
        }
        v.finish(&FlatLinks);
        assert_eq!(v.hyp().map(|(t, _)| t).as_deref(), Some("a b"));
        assert!(v.advance(&FlatLinks, &FAVOR_A).is_err());
    }

    #[test]
    fn empty_network_cannot_start() {
        let lmath = Arc::new(LogMath::new(1.0001).expect("logmath"));
        let mut v = Viterbi::new(lmath, Beams { beam: -1, wbeam: -1 });
        assert!(v.start(&FlatLinks).is_err());
    }
}
