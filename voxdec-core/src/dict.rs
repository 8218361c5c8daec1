//! Pronunciation dictionary.
//!
//! Main and filler dictionaries use the CMU text format, one word per line:
//!
//! ```text
//! HELLO   HH AH L OW
//! HELLO(2) HH EH L OW
//! ```
//!
//! `WORD(n)` lines are alternate pronunciations of `WORD`. Word ids are
//! assigned in insertion order and never reused.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::acoustic::mdef::ModelDef;
use crate::config::Config;
use crate::error::{DecoderError, Result};

pub type WordId = u32;

pub const START_WORD: &str = "<s>";
pub const FINISH_WORD: &str = "</s>";
pub const SILENCE_WORD: &str = "<sil>";

/// Strips an alternate-pronunciation suffix: `WORD(2)` → `WORD`.
pub fn base_word_name(word: &str) -> &str {
    match word.rfind('(') {
        Some(open) if open > 0 && word.ends_with(')') => {
            let inner = &word[open + 1..word.len() - 1];
            if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
                &word[..open]
            } else {
                word
            }
        }
        _ => word,
    }
}

#[derive(Debug, Clone)]
struct DictWord {
    word: String,
    phones: Vec<usize>,
    filler: bool,
    base: WordId,
    /// Alternates of this word, itself first. Only filled on base words.
    variants: Vec<WordId>,
}

#[derive(Debug, Clone)]
pub struct Dictionary {
    words: Vec<DictWord>,
    index: HashMap<String, WordId>,
    phone_names: Vec<String>,
    phone_ids: HashMap<String, usize>,
}

impl Dictionary {
    pub fn new(mdef: &ModelDef) -> Self {
        let phone_names: Vec<String> = (0..mdef.n_phone())
            .filter_map(|p| mdef.phone_name(p).map(str::to_string))
            .collect();
        let phone_ids = phone_names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        Self {
            words: Vec::new(),
            index: HashMap::new(),
            phone_names,
            phone_ids,
        }
    }

    /// Loads `dict` and `fdict` from the configuration. The sentence markers
    /// and `<sil>` are added as fillers when the model has a silence phone.
    pub fn load(config: &Config, mdef: &ModelDef) -> Result<Self> {
        let mut dict = Self::new(mdef);
        if let Some(path) = config.get_path("dict") {
            dict.load_file(&path, false)?;
        }
        if let Some(path) = config.get_path("fdict") {
            dict.load_file(&path, true)?;
        }
        if let Some(sil) = mdef.silence_phone() {
            for word in [START_WORD, FINISH_WORD, SILENCE_WORD] {
                if dict.lookup(word).is_none() {
                    dict.insert(word, vec![sil], true)?;
                }
            }
        }
        info!(
            n_word = dict.len(),
            n_filler = dict.words.iter().filter(|w| w.filler).count(),
            "dictionary loaded"
        );
        Ok(dict)
    }

    fn load_file(&mut self, path: &Path, filler: bool) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DecoderError::ModelNotFound {
                path: path.to_path_buf(),
            },
            _ => DecoderError::Io(e),
        })?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("##") || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else { continue };
            let pron: Vec<&str> = fields.collect();
            let phones = match self.resolve_phones(&pron) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %path.display(), line = lineno + 1, word, "skipping entry: {e}");
                    continue;
                }
            };
            if let Err(e) = self.insert(word, phones, filler) {
                warn!(path = %path.display(), line = lineno + 1, word, "skipping entry: {e}");
            }
        }
        Ok(())
    }

    fn resolve_phones(&self, pron: &[&str]) -> Result<Vec<usize>> {
        if pron.is_empty() {
            return Err(DecoderError::Vocabulary("empty pronunciation".into()));
        }
        pron.iter()
            .map(|p| {
                self.phone_ids
                    .get(*p)
                    .copied()
                    .ok_or_else(|| DecoderError::Vocabulary(format!("unknown phone `{p}`")))
            })
            .collect()
    }

    fn insert(&mut self, word: &str, phones: Vec<usize>, filler: bool) -> Result<WordId> {
        if word.is_empty() {
            return Err(DecoderError::Vocabulary("empty word".into()));
        }
        if self.index.contains_key(word) {
            return Err(DecoderError::Vocabulary(format!("`{word}` is already in the dictionary")));
        }
        let id = self.words.len() as WordId;
        let base_name = base_word_name(word);
        let base = if base_name == word {
            id
        } else {
            *self.index.get(base_name).ok_or_else(|| {
                DecoderError::Vocabulary(format!("alternate `{word}` has no base word `{base_name}`"))
            })?
        };
        self.words.push(DictWord {
            word: word.to_string(),
            phones,
            filler,
            base,
            variants: Vec::new(),
        });
        self.words[base as usize].variants.push(id);
        self.index.insert(word.to_string(), id);
        Ok(id)
    }

    /// Adds a word with a whitespace-separated phone string.
    ///
    /// # Errors
    /// `DecoderError::Vocabulary` for an empty or duplicate word, an empty
    /// pronunciation or a phone the model does not define.
    pub fn add_word(&mut self, word: &str, pron: &str) -> Result<WordId> {
        let phones: Vec<&str> = pron.split_whitespace().collect();
        let phones = self.resolve_phones(&phones)?;
        let id = self.insert(word.trim(), phones, false)?;
        debug!(word, id, "word added to dictionary");
        Ok(id)
    }

    pub fn lookup(&self, word: &str) -> Option<WordId> {
        self.index.get(word).copied()
    }

    pub fn word(&self, id: WordId) -> Option<&str> {
        self.words.get(id as usize).map(|w| w.word.as_str())
    }

    pub fn pronunciation(&self, id: WordId) -> Option<&[usize]> {
        self.words.get(id as usize).map(|w| w.phones.as_slice())
    }

    /// Pronunciation as phone names.
    pub fn pronunciation_str(&self, id: WordId) -> Option<String> {
        self.pronunciation(id).map(|phones| {
            phones
                .iter()
                .map(|&p| self.phone_names[p].as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    pub fn is_filler(&self, id: WordId) -> bool {
        self.words.get(id as usize).is_some_and(|w| w.filler)
    }

    pub fn base_word(&self, id: WordId) -> Option<WordId> {
        self.words.get(id as usize).map(|w| w.base)
    }

    /// The base word and its alternates, in insertion order.
    pub fn variants(&self, id: WordId) -> &[WordId] {
        self.base_word(id)
            .and_then(|b| self.words.get(b as usize))
            .map_or(&[], |w| w.variants.as_slice())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordId, &str)> + '_ {
        self.words
            .iter()
            .enumerate()
            .map(|(i, w)| (i as WordId, w.word.as_str()))
    }
}

/// Shared handle to a dictionary.
#[derive(Clone)]
pub struct DictionaryHandle(pub Arc<RwLock<Dictionary>>);

impl DictionaryHandle {
    pub fn new(dict: Dictionary) -> Self {
        Self(Arc::new(RwLock::new(dict)))
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Dictionary> {
        self.0.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Dictionary> {
        self.0.write()
    }
}

impl std::fmt::Debug for DictionaryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryHandle").finish_non_exhaustive()
    }
}
