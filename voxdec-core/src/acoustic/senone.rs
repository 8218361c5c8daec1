//! Senone parameter tables (diagonal Gaussian mixtures) and HMM transition
//! matrices.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{DecoderError, Result};
use crate::logmath::{LogMath, LOG_ZERO};

use super::read_json;

/// `[senone][component][dim]`
type MixtureTable = Vec<Vec<Vec<f32>>>;

#[derive(Debug, Clone)]
struct Gaussian {
    mean: Vec<f32>,
    inv_var: Vec<f32>,
    /// `-0.5 * (d ln 2π + Σ ln σ²)`
    log_norm: f64,
    log_weight: i32,
}

/// Gaussian mixture densities, one per senone.
#[derive(Debug, Clone)]
pub struct SenoneSet {
    senones: Vec<Vec<Gaussian>>,
    dim: usize,
}

impl SenoneSet {
    /// Loads means and variances plus optional mixture weights.
    ///
    /// Without a weights table every component gets the same weight.
    pub fn load(
        mean_path: &Path,
        var_path: &Path,
        weights_path: Option<&Path>,
        varfloor: f64,
        mixwfloor: f64,
        lmath: &LogMath,
    ) -> Result<Self> {
        let means: MixtureTable = read_json(mean_path)?;
        let vars: MixtureTable = read_json(var_path)?;
        let weights: Option<Vec<Vec<f32>>> = match weights_path {
            Some(p) => Some(read_json(p)?),
            None => {
                warn!("no mixture weights configured, using uniform weights");
                None
            }
        };
        Self::from_tables(means, vars, weights, varfloor, mixwfloor, lmath)
    }

    pub fn from_tables(
        means: MixtureTable,
        vars: MixtureTable,
        weights: Option<Vec<Vec<f32>>>,
        varfloor: f64,
        mixwfloor: f64,
        lmath: &LogMath,
    ) -> Result<Self> {
        if means.is_empty() {
            return Err(DecoderError::Construction("mean table is empty".into()));
        }
        if means.len() != vars.len() {
            return Err(DecoderError::Construction(format!(
                "{} mean senones but {} variance senones",
                means.len(),
                vars.len()
            )));
        }
        if let Some(w) = &weights {
            if w.len() != means.len() {
                return Err(DecoderError::Construction(format!(
                    "{} weight rows for {} senones",
                    w.len(),
                    means.len()
                )));
            }
        }
        let dim = means[0].first().map_or(0, Vec::len);
        if dim == 0 {
            return Err(DecoderError::Construction("senone 0 has no mean vector".into()));
        }

        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let mut senones = Vec::with_capacity(means.len());
        for (s, (m_comps, v_comps)) in means.into_iter().zip(vars).enumerate() {
            if m_comps.is_empty() || m_comps.len() != v_comps.len() {
                return Err(DecoderError::Construction(format!(
                    "senone {s}: mean and variance component counts differ"
                )));
            }
            let n_comp = m_comps.len();
            let raw_weights = match &weights {
                Some(w) if w[s].len() == n_comp => w[s].clone(),
                Some(_) => {
                    return Err(DecoderError::Construction(format!(
                        "senone {s}: weight count does not match {n_comp} components"
                    )))
                }
                None => vec![1.0; n_comp],
            };
            let floored: Vec<f64> = raw_weights
                .iter()
                .map(|&w| (w as f64).max(mixwfloor))
                .collect();
            let total: f64 = floored.iter().sum();

            let mut comps = Vec::with_capacity(n_comp);
            for ((mean, var), w) in m_comps.into_iter().zip(v_comps).zip(floored) {
                if mean.len() != dim || var.len() != dim {
                    return Err(DecoderError::Construction(format!(
                        "senone {s}: expected {dim}-dimensional parameters"
                    )));
                }
                let var: Vec<f64> = var.iter().map(|&v| (v as f64).max(varfloor)).collect();
                let log_det: f64 = var.iter().map(|v| v.ln()).sum();
                comps.push(Gaussian {
                    mean,
                    inv_var: var.iter().map(|v| (1.0 / v) as f32).collect(),
                    log_norm: -0.5 * (dim as f64 * ln_2pi + log_det),
                    log_weight: lmath.log(w / total),
                });
            }
            senones.push(comps);
        }

        debug!(n_senone = senones.len(), dim, "senone tables loaded");
        Ok(Self { senones, dim })
    }

    pub fn len(&self) -> usize {
        self.senones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senones.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Scores one feature vector against every senone into `out`.
    ///
    /// Returns the best score and the lowest-numbered senone achieving it.
    pub fn score(&self, feat: &[f32], lmath: &LogMath, out: &mut [i32]) -> (i32, usize) {
        let mut best = (LOG_ZERO, 0);
        for (s, (comps, slot)) in self.senones.iter().zip(out.iter_mut()).enumerate() {
            let mut acc = LOG_ZERO;
            for g in comps {
                let mut dist = 0.0f64;
                for ((&x, &m), &iv) in feat.iter().zip(&g.mean).zip(&g.inv_var) {
                    let d = (x - m) as f64;
                    dist += d * d * iv as f64;
                }
                let v = lmath
                    .ln_to_log(g.log_norm - 0.5 * dist)
                    .saturating_add(g.log_weight)
                    .max(LOG_ZERO);
                acc = lmath.add(acc, v);
            }
            *slot = acc;
            if acc > best.0 {
                best = (acc, s);
            }
        }
        best
    }
}

/// Per-phone transition probabilities `[phone][from][to]`, stored as log
/// values. `to == n_emit_state` is the exit transition.
#[derive(Debug, Clone)]
pub struct TransitionMatrices {
    matrices: Vec<Vec<Vec<i32>>>,
    n_state: usize,
}

impl TransitionMatrices {
    pub fn load(path: &Path, n_phone: usize, n_state: usize, floor: f64, lmath: &LogMath) -> Result<Self> {
        let raw: Vec<Vec<Vec<f64>>> = read_json(path)?;
        Self::from_table(raw, n_phone, n_state, floor, lmath)
            .map_err(|e| DecoderError::malformed(path, e))
    }

    /// Nonzero entries are floored, each row is renormalized. Backward
    /// transitions are not allowed.
    pub fn from_table(
        raw: Vec<Vec<Vec<f64>>>,
        n_phone: usize,
        n_state: usize,
        floor: f64,
        lmath: &LogMath,
    ) -> Result<Self> {
        if raw.len() != n_phone {
            return Err(DecoderError::Construction(format!(
                "{} transition matrices for {n_phone} phones",
                raw.len()
            )));
        }
        let mut matrices = Vec::with_capacity(n_phone);
        for (p, rows) in raw.into_iter().enumerate() {
            if rows.len() != n_state || rows.iter().any(|r| r.len() != n_state + 1) {
                return Err(DecoderError::Construction(format!(
                    "phone {p}: transition matrix must be {n_state} x {}",
                    n_state + 1
                )));
            }
            let mut matrix = Vec::with_capacity(n_state);
            for (from, row) in rows.into_iter().enumerate() {
                if row[..from].iter().any(|&v| v > 0.0) {
                    return Err(DecoderError::Construction(format!(
                        "phone {p}: backward transition out of state {from}"
                    )));
                }
                let floored: Vec<f64> = row
                    .iter()
                    .map(|&v| if v > 0.0 { v.max(floor) } else { 0.0 })
                    .collect();
                let total: f64 = floored.iter().sum();
                if total <= 0.0 {
                    return Err(DecoderError::Construction(format!(
                        "phone {p}: state {from} has no outgoing transitions"
                    )));
                }
                matrix.push(floored.iter().map(|&v| lmath.log(v / total)).collect());
            }
            matrices.push(matrix);
        }
        Ok(Self { matrices, n_state })
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    pub fn tprob(&self, phone: usize, from: usize, to: usize) -> i32 {
        self.matrices[phone][from][to]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lmath() -> LogMath {
        LogMath::new(1.0001).expect("logmath")
    }

    #[test]
    fn nearest_mean_scores_best() {
        let lm = lmath();
        let means = vec![vec![vec![0.0, 0.0]], vec![vec![5.0, 5.0]]];
        let vars = vec![vec![vec![1.0, 1.0]], vec![vec![1.0, 1.0]]];
        let set = SenoneSet::from_tables(means, vars, None, 1e-4, 1e-7, &lm).expect("senones");

        let mut out = vec![0; 2];
        let (best, best_senone) = set.score(&[4.5, 5.2], &lm, &mut out);
        assert_eq!(best_senone, 1);
        assert_eq!(best, out[1]);
        assert!(out[0] < out[1]);
    }

    #[test]
    fn ties_go_to_the_lowest_senone() {
        let lm = lmath();
        let means = vec![vec![vec![1.0]], vec![vec![-1.0]]];
        let vars = vec![vec![vec![1.0]], vec![vec![1.0]]];
        let set = SenoneSet::from_tables(means, vars, None, 1e-4, 1e-7, &lm).expect("senones");
        let mut out = vec![0; 2];
        assert_eq!(set.score(&[0.0], &lm, &mut out).1, 0);
    }

    #[test]
    fn mismatched_tables_are_rejected() {
        let lm = lmath();
        let means = vec![vec![vec![0.0, 0.0]]];
        let vars = vec![vec![vec![1.0]]];
        assert!(SenoneSet::from_tables(means, vars, None, 1e-4, 1e-7, &lm).is_err());
    }

    #[test]
    fn transition_rows_are_normalized() {
        let lm = lmath();
        let raw = vec![vec![vec![2.0, 2.0]]];
        let tmat = TransitionMatrices::from_table(raw, 1, 1, 1e-4, &lm).expect("tmat");
        assert!((tmat.tprob(0, 0, 0) - lm.log(0.5)).abs() <= 1);
        assert!((tmat.tprob(0, 0, 1) - lm.log(0.5)).abs() <= 1);
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let lm = lmath();
        let raw = vec![vec![vec![0.5, 0.5, 0.0], vec![0.1, 0.5, 0.4]]];
        assert!(TransitionMatrices::from_table(raw, 1, 2, 1e-4, &lm).is_err());
    }
}
