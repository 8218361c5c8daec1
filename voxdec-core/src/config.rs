//! Typed decoder configuration.
//!
//! A `Config` is a fixed table of named options, each with a type and an
//! optional default. Values set by the caller are *explicit*; values the
//! decoder synthesizes itself (model-directory paths, `feat.params` entries)
//! are *derived* and tracked in an ownership list so that they can be
//! released together when the configuration is rebuilt.
//!
//! Configurations can be assembled in code or loaded from a JSON object:
//!
//! ```json
//! { "hmm": "/models/en-us", "dict": "/models/en-us.dict", "lm": "/models/en-us.arpa" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DecoderError, Result};

/// A single option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Str(v)
    }
}

impl From<&Path> for ConfigValue {
    fn from(v: &Path) -> Self {
        ConfigValue::Str(v.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ConfigValue {
    fn from(v: PathBuf) -> Self {
        ConfigValue::from(v.as_path())
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<i32> for ConfigValue {
    fn from(v: i32) -> Self {
        ConfigValue::Int(v as i64)
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        ConfigValue::Int(v as i64)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Str,
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, Copy)]
enum Preset {
    Unset,
    Str(&'static str),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Preset {
    fn value(self) -> Option<ConfigValue> {
        match self {
            Preset::Unset => None,
            Preset::Str(v) => Some(ConfigValue::Str(v.to_string())),
            Preset::Int(v) => Some(ConfigValue::Int(v)),
            Preset::Float(v) => Some(ConfigValue::Float(v)),
            Preset::Bool(v) => Some(ConfigValue::Bool(v)),
        }
    }
}

#[derive(Debug)]
struct OptionDef {
    name: &'static str,
    kind: OptionKind,
    preset: Preset,
}

impl OptionDef {
    const fn path(name: &'static str) -> Self {
        Self {
            name,
            kind: OptionKind::Str,
            preset: Preset::Unset,
        }
    }

    const fn string(name: &'static str, v: &'static str) -> Self {
        Self {
            name,
            kind: OptionKind::Str,
            preset: Preset::Str(v),
        }
    }

    const fn int(name: &'static str, v: i64) -> Self {
        Self {
            name,
            kind: OptionKind::Int,
            preset: Preset::Int(v),
        }
    }

    const fn float(name: &'static str, v: f64) -> Self {
        Self {
            name,
            kind: OptionKind::Float,
            preset: Preset::Float(v),
        }
    }

    const fn flag(name: &'static str, v: bool) -> Self {
        Self {
            name,
            kind: OptionKind::Bool,
            preset: Preset::Bool(v),
        }
    }
}

const OPTIONS: &[OptionDef] = &[
    // Acoustic model
    OptionDef::path("hmm"),
    OptionDef::path("mdef"),
    OptionDef::path("mean"),
    OptionDef::path("var"),
    OptionDef::path("tmat"),
    OptionDef::path("mixw"),
    OptionDef::path("sendump"),
    OptionDef::path("kdtree"),
    OptionDef::path("featparams"),
    OptionDef::float("varfloor", 0.0001),
    OptionDef::float("mixwfloor", 0.0000001),
    OptionDef::float("tmatfloor", 0.0001),
    OptionDef::int("featbuf", 128),
    // Dictionary
    OptionDef::path("dict"),
    OptionDef::path("fdict"),
    // Search selection
    OptionDef::path("fsg"),
    OptionDef::path("lm"),
    OptionDef::path("lmctl"),
    OptionDef::path("lmname"),
    OptionDef::flag("fwdtree", true),
    OptionDef::flag("fwdflat", true),
    // Search tuning
    OptionDef::float("logbase", 1.0001),
    OptionDef::float("beam", 1e-48),
    OptionDef::float("wbeam", 7e-29),
    OptionDef::float("lw", 6.5),
    OptionDef::float("wip", 0.65),
    OptionDef::float("silprob", 0.005),
    OptionDef::float("fillprob", 1e-8),
    OptionDef::float("uw", 1.0),
    // Front end
    OptionDef::float("samprate", 16000.0),
    OptionDef::int("frate", 100),
    OptionDef::float("wlen", 0.025625),
    OptionDef::int("nfft", 512),
    OptionDef::int("nfilt", 40),
    OptionDef::int("ncep", 13),
    OptionDef::float("lowerf", 133.33334),
    OptionDef::float("upperf", 6855.4976),
    OptionDef::float("alpha", 0.97),
    OptionDef::string("feat", "1s_c_d"),
    OptionDef::string("cmn", "live"),
    OptionDef::string("cmninit", "8.0"),
];

/// Option ← file name pairs filled in from the `hmm` directory.
pub const MODEL_DIR_FILES: &[(&str, &str)] = &[
    ("mdef", "mdef"),
    ("mean", "means"),
    ("var", "variances"),
    ("tmat", "transition_matrices"),
    ("mixw", "mixture_weights"),
    ("sendump", "sendump"),
    ("kdtree", "kdtrees"),
    ("fdict", "noisedict"),
    ("featparams", "feat.params"),
];

/// Options a model's `feat.params` may set.
const FEAT_PARAMS_OPTIONS: &[&str] = &[
    "samprate", "frate", "wlen", "nfft", "nfilt", "ncep", "lowerf", "upperf", "alpha", "feat", "cmn",
    "cmninit",
];

fn option_def(name: &str) -> Result<&'static OptionDef> {
    let name = name.trim_start_matches('-');
    OPTIONS
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| DecoderError::Config(format!("unknown option `{name}`")))
}

fn coerce(def: &OptionDef, value: ConfigValue) -> Result<ConfigValue> {
    let mismatch = |v: &ConfigValue| {
        DecoderError::Config(format!(
            "option `{}` expects {:?}, got {v:?}",
            def.name, def.kind
        ))
    };
    let coerced = match (def.kind, value) {
        (OptionKind::Str, ConfigValue::Str(s)) => ConfigValue::Str(s),
        (OptionKind::Int, ConfigValue::Int(i)) => ConfigValue::Int(i),
        (OptionKind::Int, ConfigValue::Float(f)) if f.fract() == 0.0 => ConfigValue::Int(f as i64),
        (OptionKind::Int, ConfigValue::Str(s)) => match s.trim().parse::<i64>() {
            Ok(i) => ConfigValue::Int(i),
            Err(_) => return Err(mismatch(&ConfigValue::Str(s))),
        },
        (OptionKind::Float, ConfigValue::Float(f)) => ConfigValue::Float(f),
        (OptionKind::Float, ConfigValue::Int(i)) => ConfigValue::Float(i as f64),
        (OptionKind::Float, ConfigValue::Str(s)) => match s.trim().parse::<f64>() {
            Ok(f) => ConfigValue::Float(f),
            Err(_) => return Err(mismatch(&ConfigValue::Str(s))),
        },
        (OptionKind::Bool, ConfigValue::Bool(b)) => ConfigValue::Bool(b),
        (OptionKind::Bool, ConfigValue::Int(i)) if i == 0 || i == 1 => ConfigValue::Bool(i == 1),
        (OptionKind::Bool, ConfigValue::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "1" => ConfigValue::Bool(true),
            "no" | "false" | "0" => ConfigValue::Bool(false),
            _ => return Err(mismatch(&ConfigValue::Str(s))),
        },
        (_, other) => return Err(mismatch(&other)),
    };
    Ok(coerced)
}

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    values: BTreeMap<&'static str, ConfigValue>,
    explicit: BTreeSet<&'static str>,
    /// Entries synthesized by the decoder. Released as a unit.
    derived: Vec<&'static str>,
}

impl Default for Config {
    fn default() -> Self {
        let values = OPTIONS
            .iter()
            .filter_map(|d| d.preset.value().map(|v| (d.name, v)))
            .collect();
        Self {
            values,
            explicit: BTreeSet::new(),
            derived: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Config::set`].
    pub fn with(mut self, name: &str, value: impl Into<ConfigValue>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Sets an option explicitly. A leading `-` on the name is accepted.
    ///
    /// # Errors
    /// `DecoderError::Config` for unknown options or values of the wrong type.
    pub fn set(&mut self, name: &str, value: impl Into<ConfigValue>) -> Result<()> {
        let def = option_def(name)?;
        let value = coerce(def, value.into())?;
        self.values.insert(def.name, value);
        self.explicit.insert(def.name);
        self.derived.retain(|k| *k != def.name);
        Ok(())
    }

    /// Restores an option to its default.
    pub fn unset(&mut self, name: &str) -> Result<()> {
        let def = option_def(name)?;
        self.restore_preset(def);
        self.explicit.remove(def.name);
        self.derived.retain(|k| *k != def.name);
        Ok(())
    }

    pub(crate) fn set_derived(&mut self, name: &str, value: impl Into<ConfigValue>) -> Result<()> {
        let def = option_def(name)?;
        let value = coerce(def, value.into())?;
        self.values.insert(def.name, value);
        if !self.derived.contains(&def.name) {
            self.derived.push(def.name);
        }
        Ok(())
    }

    /// String value, `None` when unset.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name.trim_start_matches('-')) {
            Some(ConfigValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_path(&self, name: &str) -> Option<PathBuf> {
        self.get_str(name).map(PathBuf::from)
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.typed(name)? {
            ConfigValue::Int(i) => Ok(*i),
            other => Err(DecoderError::Config(format!("option `{name}` is not an integer: {other:?}"))),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<f64> {
        match self.typed(name)? {
            ConfigValue::Float(f) => Ok(*f),
            other => Err(DecoderError::Config(format!("option `{name}` is not a float: {other:?}"))),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.typed(name)? {
            ConfigValue::Bool(b) => Ok(*b),
            other => Err(DecoderError::Config(format!("option `{name}` is not a boolean: {other:?}"))),
        }
    }

    fn typed(&self, name: &str) -> Result<&ConfigValue> {
        let def = option_def(name)?;
        self.values
            .get(def.name)
            .ok_or_else(|| DecoderError::Config(format!("option `{}` is not set", def.name)))
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name.trim_start_matches('-'))
    }

    pub fn is_explicit(&self, name: &str) -> bool {
        self.explicit.contains(name.trim_start_matches('-'))
    }

    /// Options currently holding decoder-synthesized values.
    pub fn derived_entries(&self) -> &[&'static str] {
        &self.derived
    }

    /// Explicitly set options, in name order.
    pub fn explicit_entries(&self) -> impl Iterator<Item = (&'static str, &ConfigValue)> + '_ {
        self.explicit
            .iter()
            .filter_map(|k| self.values.get(k).map(|v| (*k, v)))
    }

    /// Drops every derived entry, restoring defaults.
    pub fn release_derived(&mut self) {
        for name in std::mem::take(&mut self.derived) {
            if let Ok(def) = option_def(name) {
                self.restore_preset(def);
            }
        }
    }

    fn restore_preset(&mut self, def: &'static OptionDef) {
        match def.preset.value() {
            Some(v) => {
                self.values.insert(def.name, v);
            }
            None => {
                self.values.remove(def.name);
            }
        }
    }

    /// Whether the caller-visible settings of two configurations differ.
    /// Derived entries are ignored.
    pub fn differs_from(&self, other: &Config) -> bool {
        !self.explicit_entries().eq(other.explicit_entries())
    }

    /// Fills unset model options from files found in the `hmm` directory.
    ///
    /// Never overrides an option that already has a value. Returns the
    /// number of options filled in.
    pub fn resolve_model_dir(&mut self) -> Result<usize> {
        let Some(hmm) = self.get_path("hmm") else {
            return Ok(0);
        };
        let mut filled = 0;
        for (option, file) in MODEL_DIR_FILES {
            if self.is_set(option) {
                continue;
            }
            let candidate = hmm.join(file);
            if candidate.is_file() {
                debug!(option, path = %candidate.display(), "resolved model file");
                self.set_derived(option, candidate)?;
                filled += 1;
            }
        }
        Ok(filled)
    }

    /// Merges a `feat.params` file (`-name value` pairs) into options the
    /// caller did not set explicitly. Only front-end and feature options are
    /// taken; anything else is skipped.
    pub fn apply_feat_params(&mut self) -> Result<usize> {
        let Some(path) = self.get_path("featparams") else {
            return Ok(0);
        };
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DecoderError::ModelNotFound { path: path.clone() },
            _ => DecoderError::Io(e),
        })?;
        let tokens: Vec<&str> = text
            .lines()
            .map(|l| l.split('#').next().unwrap_or(""))
            .flat_map(str::split_whitespace)
            .collect();
        let mut applied = 0;
        for pair in tokens.chunks(2) {
            let [name, value] = pair else {
                return Err(DecoderError::Construction(format!(
                    "{}: option `{}` has no value",
                    path.display(),
                    pair[0]
                )));
            };
            let def = match option_def(name) {
                Ok(def) if FEAT_PARAMS_OPTIONS.contains(&def.name) => def,
                _ => {
                    debug!(name, "skipping unsupported feature parameter");
                    continue;
                }
            };
            if self.is_explicit(def.name) {
                continue;
            }
            self.set_derived(def.name, *value)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Parses a JSON object of option name → value.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: BTreeMap<String, ConfigValue> = serde_json::from_str(json)
            .map_err(|e| DecoderError::Config(format!("invalid configuration JSON: {e}")))?;
        let mut config = Self::default();
        for (name, value) in entries {
            config.set(&name, value)?;
        }
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
