//! Tiny model directories written to a temp dir.
//!
//! Phones `SIL AA IY UW M`, three emitting states each, one Gaussian per
//! senone. The phone model uses 3-dimensional cepstra with no CMN or
//! deltas, so a feature frame equal to a phone's mean is recognized as that
//! phone. The audio model uses a full front end and arbitrary means; it is
//! only used where determinism matters, not accuracy.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use voxdec_core::Config;

pub const PHONES: [&str; 5] = ["SIL", "AA", "IY", "UW", "M"];
const STATES: usize = 3;

pub const DICT: &str = "\
ma M AA
me M IY
moo M UW
am AA M
";

pub const NOISEDICT: &str = "\
<s> SIL
</s> SIL
<sil> SIL
";

pub const GRAMMAR: &str = "\
# one word, optionally followed by `moo`
FSG_BEGIN mama
NUM_STATES 3
START_STATE 0
FINAL_STATE 2
TRANSITION 0 1 0.5 ma
TRANSITION 0 1 0.5 me
TRANSITION 1 2 0.5 moo
TRANSITION 1 2 0.5
FSG_END
";

pub const ARPA: &str = "\
\\data\\
ngram 1=6
ngram 2=5

\\1-grams:
-1.0 </s>
-99 <s> -0.5
-0.7 ma -0.3
-0.7 me -0.3
-0.9 moo -0.3
-1.2 am -0.3

\\2-grams:
-0.3 <s> ma
-0.3 <s> me
-0.4 ma moo
-0.4 ma </s>
-0.4 moo </s>

\\end\\
";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Mean of each phone in the 3-dimensional phone model.
pub fn phone_mean(phone: &str) -> [f32; 3] {
    match phone {
        "AA" => [10.0, 0.0, 0.0],
        "IY" => [0.0, 10.0, 0.0],
        "UW" => [0.0, 0.0, 10.0],
        "M" => [10.0, 10.0, 0.0],
        _ => [0.0, 0.0, 0.0],
    }
}

/// Feature frames spelling out `(phone, n_frames)` runs.
pub fn frames(runs: &[(&str, usize)]) -> Vec<Vec<f32>> {
    runs.iter()
        .flat_map(|&(phone, n)| std::iter::repeat(phone_mean(phone).to_vec()).take(n))
        .collect()
}

/// Deterministic pseudo-speech: gliding tones plus LCG noise.
pub fn synthetic_speech(n_samples: usize) -> Vec<i16> {
    let mut seed: u32 = 0x2545_f491;
    (0..n_samples)
        .map(|i| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = ((seed >> 16) as f32 / 65_536.0 - 0.5) * 600.0;
            let t = i as f32 / 16_000.0;
            let f = 200.0 + 800.0 * (t * 1.7).sin().abs();
            let tone = (2.0 * std::f32::consts::PI * f * t).sin() * 6_000.0 * (t * 3.0).sin().abs();
            (tone + noise) as i16
        })
        .collect()
}

pub struct ModelDir {
    pub dir: TempDir,
    pub ncep: usize,
    pub feat: &'static str,
    pub cmn: &'static str,
}

impl ModelDir {
    /// 3-dimensional model whose senones match [`phone_mean`].
    pub fn phone_model() -> Self {
        let means: Vec<[f32; 3]> = PHONES.iter().map(|p| phone_mean(p)).collect();
        Self::write(3, "1s_c", "none", |phone, _state| means[phone].to_vec(), 1.0)
    }

    /// 13-cepstra model with deltas and live CMN, for raw audio input.
    pub fn audio_model() -> Self {
        let mut seed: u32 = 7;
        let mut means: Vec<Vec<f32>> = Vec::new();
        for _ in 0..PHONES.len() * STATES {
            means.push(
                (0..26)
                    .map(|_| {
                        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                        ((seed >> 8) % 1000) as f32 / 100.0 - 5.0
                    })
                    .collect(),
            );
        }
        Self::write(13, "1s_c_d", "live", |phone, state| means[phone * STATES + state].clone(), 4.0)
    }

    fn write(
        ncep: usize,
        feat: &'static str,
        cmn: &'static str,
        mean_of: impl Fn(usize, usize) -> Vec<f32>,
        var: f32,
    ) -> Self {
        let dir = tempfile::tempdir().expect("create model tempdir");
        let hmm = dir.path().join("hmm");
        fs::create_dir(&hmm).expect("create hmm dir");

        let dim = mean_of(0, 0).len();
        let mut means = Vec::new();
        let mut vars = Vec::new();
        let mut weights = Vec::new();
        let mut tmat = Vec::new();
        for phone in 0..PHONES.len() {
            for state in 0..STATES {
                means.push(vec![mean_of(phone, state)]);
                vars.push(vec![vec![var; dim]]);
                weights.push(vec![1.0f32]);
            }
            let rows: Vec<Vec<f64>> = (0..STATES)
                .map(|s| {
                    let mut row = vec![0.0; STATES + 1];
                    row[s] = 0.5;
                    row[s + 1] = 0.5;
                    row
                })
                .collect();
            tmat.push(rows);
        }

        let write_json = |name: &str, value: serde_json::Value| {
            fs::write(hmm.join(name), value.to_string()).expect("write model table");
        };
        write_json("mdef", json!({ "phones": PHONES, "n_emit_state": STATES }));
        write_json("means", json!(means));
        write_json("variances", json!(vars));
        write_json("mixture_weights", json!(weights));
        write_json("transition_matrices", json!(tmat));
        fs::write(hmm.join("noisedict"), NOISEDICT).expect("write noisedict");

        fs::write(dir.path().join("words.dict"), DICT).expect("write dict");
        fs::write(dir.path().join("mama.fsg"), GRAMMAR).expect("write grammar");
        fs::write(dir.path().join("mama.arpa"), ARPA).expect("write lm");

        Self { dir, ncep, feat, cmn }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn hmm(&self) -> PathBuf {
        self.path("hmm")
    }

    /// Acoustic model and dictionary, no search.
    pub fn base_config(&self) -> Config {
        Config::default()
            .with("hmm", self.hmm())
            .and_then(|c| c.with("dict", self.path("words.dict")))
            .and_then(|c| c.with("feat", self.feat))
            .and_then(|c| c.with("cmn", self.cmn))
            .and_then(|c| c.with("ncep", self.ncep as i64))
            .expect("base config")
    }

    pub fn grammar_config(&self) -> Config {
        self.base_config()
            .with("fsg", self.path("mama.fsg"))
            .expect("grammar config")
    }

    pub fn lm_config(&self) -> Config {
        self.base_config()
            .with("lm", self.path("mama.arpa"))
            .expect("lm config")
    }
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture file");
    path
}
