use thiserror::Error;

use crate::decoder::UttState;

/// All errors produced by voxdec-core.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Malformed model, dictionary, grammar or language-model data.
    #[error("construction error: {0}")]
    Construction(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    /// The configuration is inconsistent with the loaded model data.
    #[error("configuration does not match the model: {0}")]
    ConfigMismatch(String),

    /// Unknown option, wrong value type or out-of-range value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("`{op}` is not valid while the utterance is {state}")]
    Lifecycle { op: &'static str, state: UttState },

    #[error("no search is active; load a grammar or a language model first")]
    NoActiveSearch,

    #[error("acoustic scoring error: {0}")]
    Scoring(String),

    #[error("search error: {0}")]
    Search(String),

    /// A word or pronunciation was rejected by the dictionary or a model set.
    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DecoderError>;

impl DecoderError {
    /// Wraps a JSON parse failure of the model table at `path`.
    pub(crate) fn malformed(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        DecoderError::Construction(format!("{}: {err}", path.display()))
    }
}
