//! Bigram language models and the language-model-driven search.
//!
//! Models are read from ARPA files. Unigrams and bigrams are used; higher
//! orders are skipped with a warning. Several models can be loaded from an
//! `lmctl` control file, one `name path` pair per line:
//!
//! ```text
//! # name     path (relative to this file)
//! commands   commands.arpa
//! dictation  dictation.arpa
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dict::{base_word_name, FINISH_WORD, START_WORD};
use crate::error::{DecoderError, Result};
use crate::logmath::LogMath;
use crate::transcript::SegmentIter;

use super::viterbi::{Ctx, Viterbi, WordLinks, WordNode};
use super::{filler_nodes, Search, SearchContext, SearchKind, SearchParams};

/// Name given to the model loaded from the `lm` option.
pub const DEFAULT_LM_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq)]
struct Unigram {
    log10_prob: f64,
    log10_backoff: f64,
}

/// Backoff bigram model with log10 probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct NgramModel {
    words: Vec<String>,
    index: HashMap<String, u32>,
    unigrams: Vec<Unigram>,
    bigrams: HashMap<(u32, u32), f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArpaSection {
    Preamble,
    Data,
    Ngrams(usize),
    End,
}

impl NgramModel {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DecoderError::ModelNotFound {
                path: path.to_path_buf(),
            },
            _ => DecoderError::Io(e),
        })?;
        Self::parse_arpa(&text).map_err(|e| DecoderError::malformed(path, e))
    }

    pub fn parse_arpa(text: &str) -> Result<Self> {
        let bad = |lineno: usize, msg: String| DecoderError::Construction(format!("line {}: {msg}", lineno + 1));
        let mut model = Self {
            words: Vec::new(),
            index: HashMap::new(),
            unigrams: Vec::new(),
            bigrams: HashMap::new(),
        };
        let mut declared: BTreeMap<usize, usize> = BTreeMap::new();
        let mut section = ArpaSection::Preamble;
        let mut warned_order = false;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "\\data\\" {
                section = ArpaSection::Data;
                continue;
            }
            if line == "\\end\\" {
                section = ArpaSection::End;
                break;
            }
            if let Some(order) = line
                .strip_prefix('\\')
                .and_then(|l| l.strip_suffix("-grams:"))
            {
                let order: usize = order
                    .parse()
                    .map_err(|_| bad(lineno, format!("bad section header `{line}`")))?;
                if section == ArpaSection::Preamble {
                    return Err(bad(lineno, "n-gram section before \\data\\".into()));
                }
                if order > 2 && !warned_order {
                    warn!(order, "only unigrams and bigrams are used, skipping higher orders");
                    warned_order = true;
                }
                section = ArpaSection::Ngrams(order);
                continue;
            }

            match section {
                ArpaSection::Preamble | ArpaSection::End => {}
                ArpaSection::Data => {
                    let Some((n, count)) = line
                        .strip_prefix("ngram ")
                        .and_then(|rest| rest.split_once('='))
                    else {
                        return Err(bad(lineno, format!("unexpected line in \\data\\: `{line}`")));
                    };
                    let n = n.trim().parse().map_err(|_| bad(lineno, "bad n-gram order".into()))?;
                    let count = count.trim().parse().map_err(|_| bad(lineno, "bad n-gram count".into()))?;
                    declared.insert(n, count);
                }
                ArpaSection::Ngrams(1) => {
                    let fields: Vec<&str> = line.split_whitespace().collect();
                    if fields.len() < 2 || fields.len() > 3 {
                        return Err(bad(lineno, format!("malformed unigram `{line}`")));
                    }
                    let log10_prob = parse_log10(fields[0]).ok_or_else(|| bad(lineno, "bad probability".into()))?;
                    let log10_backoff = match fields.get(2) {
                        Some(v) => parse_log10(v).ok_or_else(|| bad(lineno, "bad backoff".into()))?,
                        None => 0.0,
                    };
                    model.push_unigram(fields[1], log10_prob, log10_backoff);
                }
                ArpaSection::Ngrams(2) => {
                    let fields: Vec<&str> = line.split_whitespace().collect();
                    if fields.len() < 3 || fields.len() > 4 {
                        return Err(bad(lineno, format!("malformed bigram `{line}`")));
                    }
                    let p = parse_log10(fields[0]).ok_or_else(|| bad(lineno, "bad probability".into()))?;
                    let (Some(w1), Some(w2)) = (model.id(fields[1]), model.id(fields[2])) else {
                        return Err(bad(lineno, format!("bigram uses unknown words `{} {}`", fields[1], fields[2])));
                    };
                    model.bigrams.insert((w1, w2), p);
                }
                ArpaSection::Ngrams(_) => {}
            }
        }

        if section != ArpaSection::End {
            return Err(DecoderError::Construction("missing \\end\\ marker".into()));
        }
        if model.words.is_empty() {
            return Err(DecoderError::Construction("language model has no unigrams".into()));
        }
        if let Some(&n1) = declared.get(&1) {
            if n1 != model.words.len() {
                warn!(declared = n1, found = model.words.len(), "unigram count differs from header");
            }
        }
        debug!(
            n_unigram = model.words.len(),
            n_bigram = model.bigrams.len(),
            "language model parsed"
        );
        Ok(model)
    }

    fn push_unigram(&mut self, word: &str, log10_prob: f64, log10_backoff: f64) -> u32 {
        if let Some(id) = self.id(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), id);
        self.unigrams.push(Unigram {
            log10_prob,
            log10_backoff,
        });
        id
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.index.get(word).copied()
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    pub fn n_unigrams(&self) -> usize {
        self.words.len()
    }

    pub fn n_bigrams(&self) -> usize {
        self.bigrams.len()
    }

    pub fn unigram_log10(&self, w: u32) -> f64 {
        self.unigrams[w as usize].log10_prob
    }

    /// `log10 P(w | prev)` with backoff to the unigram.
    pub fn bigram_log10(&self, prev: u32, w: u32) -> f64 {
        match self.bigrams.get(&(prev, w)) {
            Some(&p) => p,
            None => self.unigrams[prev as usize].log10_backoff + self.unigrams[w as usize].log10_prob,
        }
    }

    /// Adds a unigram with probability `weight / n_unigrams`. Existing words
    /// keep their entry and id.
    pub fn add_word(&mut self, word: &str, weight: f64) -> Result<u32> {
        let word = word.trim();
        if word.is_empty() || word.contains(char::is_whitespace) {
            return Err(DecoderError::Vocabulary(format!("invalid language-model word `{word}`")));
        }
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(DecoderError::Vocabulary(format!("unigram weight must be positive, got {weight}")));
        }
        if let Some(id) = self.id(word) {
            return Ok(id);
        }
        let prob = weight / self.words.len().max(1) as f64;
        Ok(self.push_unigram(word, prob.log10().min(0.0), 0.0))
    }
}

fn parse_log10(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Named language models with one current selection.
///
/// Adding, removing or selecting a model takes effect when the owning
/// search starts its next utterance. Words added to a model become visible
/// to decoding only after the search is reinitialized.
#[derive(Debug, Clone, Default)]
pub struct LmSet {
    models: BTreeMap<String, NgramModel>,
    current: Option<String>,
    generation: u64,
}

impl LmSet {
    /// Loads `lm` as [`DEFAULT_LM_NAME`] and every model listed in `lmctl`,
    /// then selects `lmname` (or the first model loaded).
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut set = Self::default();
        if let Some(path) = config.get_path("lm") {
            set.add(DEFAULT_LM_NAME, NgramModel::load(&path)?)?;
        }
        if let Some(ctl) = config.get_path("lmctl") {
            let text = fs::read_to_string(&ctl).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DecoderError::ModelNotFound { path: ctl.clone() },
                _ => DecoderError::Io(e),
            })?;
            let base = ctl.parent().map(Path::to_path_buf).unwrap_or_default();
            for (lineno, line) in text.lines().enumerate() {
                let line = line.split('#').next().unwrap_or("").trim();
                if line.is_empty() {
                    continue;
                }
                let fields: Vec<&str> = line.split_whitespace().collect();
                let (name, rel) = match fields.as_slice() {
                    [path] => (
                        Path::new(path)
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.to_string()),
                        *path,
                    ),
                    [name, path] => (name.to_string(), *path),
                    _ => {
                        return Err(DecoderError::Construction(format!(
                            "{}: line {}: expected `name path`",
                            ctl.display(),
                            lineno + 1
                        )))
                    }
                };
                let path = base.join(rel);
                set.add(&name, NgramModel::load(&path)?)?;
            }
        }
        if let Some(name) = config.get_str("lmname") {
            set.select(name)?;
        }
        if let Some(current) = set.current_name() {
            info!(models = set.len(), current, "language models loaded");
        }
        Ok(set)
    }

    /// Adds a model, selecting it when it is the first one.
    pub fn add(&mut self, name: &str, model: NgramModel) -> Result<()> {
        if self.models.contains_key(name) {
            return Err(DecoderError::Search(format!("language model `{name}` already exists")));
        }
        if self.current.is_none() {
            self.current = Some(name.to_string());
        }
        self.models.insert(name.to_string(), model);
        self.generation += 1;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<NgramModel> {
        let removed = self.models.remove(name)?;
        if self.current.as_deref() == Some(name) {
            self.current = self.models.keys().next().cloned();
        }
        self.generation += 1;
        Some(removed)
    }

    pub fn select(&mut self, name: &str) -> Result<()> {
        if !self.models.contains_key(name) {
            return Err(DecoderError::Search(format!("no language model named `{name}`")));
        }
        self.current = Some(name.to_string());
        self.generation += 1;
        Ok(())
    }

    pub fn current(&self) -> Option<&NgramModel> {
        self.current.as_ref().and_then(|n| self.models.get(n))
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&NgramModel> {
        self.models.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Adds a unigram to the current model.
    pub fn add_word(&mut self, word: &str, weight: f64) -> Result<u32> {
        let name = self.current.clone().ok_or_else(no_model)?;
        match self.models.get_mut(&name) {
            Some(model) => model.add_word(word, weight),
            None => Err(DecoderError::Search(format!("no language model named `{name}`"))),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Bigram connectivity: the context is the LM id of the last word.
#[derive(Debug)]
struct NgramLinks {
    lmath: Arc<LogMath>,
    /// Snapshot taken when the network was built.
    lm: NgramModel,
    lw: f64,
    wip: i32,
    start: Ctx,
    finish: Option<u32>,
    /// `(node, lm id)` of every word node.
    word_nodes: Vec<(usize, u32)>,
}

impl NgramLinks {
    fn cost(&self, prev: u32, w: u32) -> i32 {
        let lp = self.lmath.log10_to_log(self.lm.bigram_log10(prev, w));
        self.lmath.scale(lp, self.lw).saturating_add(self.wip)
    }
}

impl WordLinks for NgramLinks {
    fn initial_context(&self) -> Ctx {
        self.start
    }

    fn for_each_successor(&self, ctx: Ctx, visit: &mut dyn FnMut(usize, i32)) {
        for &(node, w) in &self.word_nodes {
            visit(node, self.cost(ctx, w));
        }
    }

    fn final_cost(&self, ctx: Ctx) -> Option<i32> {
        Some(match self.finish {
            Some(fin) => {
                let lp = self.lmath.log10_to_log(self.lm.bigram_log10(ctx, fin));
                self.lmath.scale(lp, self.lw)
            }
            None => 0,
        })
    }
}

/// Viterbi search weighted by the current model of an [`LmSet`].
pub struct NgramSearch {
    ctx: SearchContext,
    params: SearchParams,
    set: LmSet,
    built_generation: Option<u64>,
    links: Option<NgramLinks>,
    viterbi: Viterbi,
}

impl NgramSearch {
    /// Creates the search, loading `lm` / `lmctl` when configured.
    pub fn new(config: &Config, ctx: SearchContext) -> Result<Self> {
        let params = SearchParams::from_config(config, &ctx.lmath)?;
        let set = LmSet::from_config(config)?;
        let mut search = Self {
            viterbi: Viterbi::new(ctx.lmath.clone(), params.beams),
            ctx,
            params,
            set,
            built_generation: None,
            links: None,
        };
        if search.set.current().is_some() {
            search.build_network()?;
        }
        Ok(search)
    }

    fn build_network(&mut self) -> Result<()> {
        let (Some(name), Some(lm)) = (self.set.current_name(), self.set.current()) else {
            return Err(no_model());
        };
        let start = lm.id(START_WORD).ok_or_else(|| {
            DecoderError::Search(format!("language model `{name}` has no `{START_WORD}` unigram"))
        })?;

        let dict = self.ctx.dict.read();
        let acmod = self.ctx.acmod.lock();
        let (mdef, tmat) = (acmod.mdef(), acmod.tmat());

        let mut nodes = Vec::new();
        let mut word_nodes = Vec::new();
        let mut skipped = 0usize;
        for (wid, word) in dict.iter() {
            if dict.is_filler(wid) {
                continue;
            }
            let Some(lm_id) = lm.id(base_word_name(word)) else {
                skipped += 1;
                continue;
            };
            let Some(phones) = dict.pronunciation(wid) else { continue };
            word_nodes.push((nodes.len(), lm_id));
            nodes.push(WordNode::word(word, phones, mdef, tmat, lm_id));
        }
        let n_words = nodes.len();
        nodes.extend(filler_nodes(&dict, mdef, tmat, &self.params));
        drop(acmod);
        drop(dict);

        info!(
            lm = name,
            n_words,
            n_fillers = nodes.len() - n_words,
            not_in_lm = skipped,
            "language-model network built"
        );
        self.links = Some(NgramLinks {
            lmath: self.ctx.lmath.clone(),
            lm: lm.clone(),
            lw: self.params.lw,
            wip: self.params.wip,
            start,
            finish: lm.id(FINISH_WORD),
            word_nodes,
        });
        self.viterbi.set_network(nodes);
        self.built_generation = Some(self.set.generation());
        Ok(())
    }
}

fn no_model() -> DecoderError {
    DecoderError::Search("no language model is selected".into())
}

impl Search for NgramSearch {
    fn kind(&self) -> SearchKind {
        SearchKind::LanguageModel
    }

    fn start(&mut self) -> Result<()> {
        if self.built_generation != Some(self.set.generation()) {
            debug!("language-model set changed, rebuilding network");
            self.build_network()?;
        }
        let links = self.links.as_ref().ok_or_else(no_model)?;
        self.viterbi.start(links)
    }

    fn step(&mut self) -> Result<usize> {
        let links = self.links.as_ref().ok_or_else(no_model)?;
        let mut acmod = self.ctx.acmod.lock();
        let Some(frame) = acmod.score() else {
            return Ok(0);
        };
        self.viterbi.advance(links, frame.scores)?;
        Ok(1)
    }

    fn finish(&mut self) -> Result<()> {
        let links = self.links.as_ref().ok_or_else(no_model)?;
        self.viterbi.finish(links);
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
            debug!("no language model selected, network left empty");
            self.links = None;
            self.viterbi.set_network(Vec::new());
            self.built_generation = Some(self.set.generation());
            return Ok(());
        }
        self.build_network()
    }

    fn lm_set(&self) -> Option<&LmSet> {
        Some(&self.set)
    }

    fn lm_set_mut(&mut self) -> Option<&mut LmSet> {
        Some(&mut self.set)
    }
}

impl std::fmt::Debug for NgramSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NgramSearch")
            .field("models", &self.set.len())
            .field("current", &self.set.current_name())
            .field("nodes", &self.viterbi.n_nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARPA: &str = "\
\\data\\
ngram 1=4
ngram 2=2

\\1-grams:
-1.0 <s> -0.3
-0.5 go -0.2
-0.7 stop -0.2
-0.6 </s>

\\2-grams:
-0.1 <s> go
-0.2 go </s>

\\end\\
";

    #[test]
    fn reads_unigrams_and_bigrams() {
        let lm = NgramModel::parse_arpa(ARPA).expect("parse arpa");
        assert_eq!(lm.n_unigrams(), 4);
        assert_eq!(lm.n_bigrams(), 2);
        let (s, go, stop) = (lm.id("<s>").expect("<s>"), lm.id("go").expect("go"), lm.id("stop").expect("stop"));
        assert!((lm.bigram_log10(s, go) - -0.1).abs() < 1e-9);
        assert!((lm.bigram_log10(s, stop) - (-0.3 + -0.7)).abs() < 1e-9);
    }

    #[test]
    fn higher_orders_are_skipped() {
        let text = ARPA.replace("\\end\\", "\\3-grams:\n-0.1 <s> go </s>\n\n\\end\\");
        let lm = NgramModel::parse_arpa(&text).expect("parse arpa");
        assert_eq!(lm.n_bigrams(), 2);
    }

    #[test]
    fn rejects_truncated_or_inconsistent_files() {
        assert!(NgramModel::parse_arpa("\\data\\\nngram 1=1\n\\1-grams:\n-1.0 a\n").is_err());
        assert!(NgramModel::parse_arpa("\\data\\\n\\1-grams:\n-1.0 a\n\\2-grams:\n-0.1 a b\n\\end\\\n").is_err());
    }

    #[test]
    fn add_word_uses_weight_over_vocabulary_size() {
        let mut lm = NgramModel::parse_arpa(ARPA).expect("parse arpa");
        let id = lm.add_word("left", 1.0).expect("add left");
        assert!((lm.unigram_log10(id) - (0.25f64).log10()).abs() < 1e-9);
        assert_eq!(lm.add_word("left", 1.0).expect("existing"), id);
        assert!(lm.add_word("two words", 1.0).is_err());
        assert!(lm.add_word("x", 0.0).is_err());
    }

    #[test]
    fn lmctl_loads_named_models_relative_to_control_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.arpa"), ARPA).expect("write a");
        fs::write(dir.path().join("b.arpa"), ARPA).expect("write b");
        fs::write(dir.path().join("models.ctl"), "# models\nfirst a.arpa\nsecond b.arpa\n").expect("write ctl");
        let config = Config::default()
            .with("lmctl", dir.path().join("models.ctl"))
            .and_then(|c| c.with("lmname", "second"))
            .expect("config");

        let set = LmSet::from_config(&config).expect("lm set");
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["first", "second"]);
        assert_eq!(set.current_name(), Some("second"));
    }

    #[test]
    fn lmname_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.arpa");
        fs::write(&path, ARPA).expect("write lm");
        let config = Config::default()
            .with("lm", path)
            .and_then(|c| c.with("lmname", "missing"))
            .expect("config");
        assert!(LmSet::from_config(&config).is_err());
    }
}
