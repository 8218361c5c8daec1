//! Model definition: phone inventory and phone/state → senone mapping.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{DecoderError, Result};

use super::read_json;

/// Phone used for silence and automatically added filler words.
pub const SILENCE_PHONE: &str = "SIL";

fn default_emit_states() -> usize {
    3
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct MdefFile {
    phones: Vec<String>,
    #[serde(default = "default_emit_states")]
    n_emit_state: usize,
    /// Optional tied-state map `[phone][state] -> senone`.
    #[serde(default)]
    senones: Option<Vec<Vec<usize>>>,
}

#[derive(Debug, Clone)]
pub struct ModelDef {
    phones: Vec<String>,
    phone_ids: HashMap<String, usize>,
    n_emit_state: usize,
    senone_map: Vec<Vec<usize>>,
    n_senone: usize,
}

impl ModelDef {
    pub fn load(path: &Path) -> Result<Self> {
        let file: MdefFile = read_json(path)?;
        Self::from_parts(file.phones, file.n_emit_state, file.senones)
            .map_err(|e| DecoderError::malformed(path, e))
    }

    /// Builds a definition in memory. Without a tied map every phone state
    /// gets its own senone, numbered phone-major.
    pub fn from_parts(
        phones: Vec<String>,
        n_emit_state: usize,
        senones: Option<Vec<Vec<usize>>>,
    ) -> Result<Self> {
        if phones.is_empty() {
            return Err(DecoderError::Construction("model definition has no phones".into()));
        }
        if n_emit_state == 0 {
            return Err(DecoderError::Construction("phones need at least one emitting state".into()));
        }
        let mut phone_ids = HashMap::with_capacity(phones.len());
        for (id, name) in phones.iter().enumerate() {
            if phone_ids.insert(name.clone(), id).is_some() {
                return Err(DecoderError::Construction(format!("duplicate phone `{name}`")));
            }
        }

        let senone_map = match senones {
            Some(map) => {
                if map.len() != phones.len() || map.iter().any(|row| row.len() != n_emit_state) {
                    return Err(DecoderError::Construction(format!(
                        "senone map must be {} phones x {} states",
                        phones.len(),
                        n_emit_state
                    )));
                }
                map
            }
            None => (0..phones.len())
                .map(|p| (0..n_emit_state).map(|s| p * n_emit_state + s).collect())
                .collect(),
        };
        let n_senone = senone_map.iter().flatten().copied().max().map_or(0, |m| m + 1);

        Ok(Self {
            phones,
            phone_ids,
            n_emit_state,
            senone_map,
            n_senone,
        })
    }

    pub fn phone_id(&self, name: &str) -> Option<usize> {
        self.phone_ids.get(name).copied()
    }

    pub fn phone_name(&self, id: usize) -> Option<&str> {
        self.phones.get(id).map(String::as_str)
    }

    pub fn n_phone(&self) -> usize {
        self.phones.len()
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn n_senone(&self) -> usize {
        self.n_senone
    }

    /// Senones of the emitting states of `phone`, in state order.
    pub fn senones(&self, phone: usize) -> &[usize] {
        &self.senone_map[phone]
    }

    pub fn silence_phone(&self) -> Option<usize> {
        self.phone_id(SILENCE_PHONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phones(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn untied_senones_are_numbered_phone_major() {
        let mdef = ModelDef::from_parts(phones(&["SIL", "AA"]), 3, None).expect("mdef");
        assert_eq!(mdef.n_senone(), 6);
        assert_eq!(mdef.senones(1), &[3, 4, 5]);
        assert_eq!(mdef.silence_phone(), Some(0));
        assert_eq!(mdef.phone_name(1), Some("AA"));
    }

    #[test]
    fn tied_map_must_cover_every_state() {
        let err = ModelDef::from_parts(phones(&["SIL", "AA"]), 2, Some(vec![vec![0, 1]]));
        assert!(err.is_err());

        let tied = ModelDef::from_parts(phones(&["SIL", "AA"]), 2, Some(vec![vec![0, 1], vec![1, 2]]))
            .expect("tied mdef");
        assert_eq!(tied.n_senone(), 3);
    }

    #[test]
    fn duplicate_phones_are_rejected() {
        assert!(ModelDef::from_parts(phones(&["AA", "AA"]), 3, None).is_err());
    }
}
