//! Fixed-base logarithmic arithmetic.
//!
//! Probabilities travel through scoring and search as `i32` values
//! `round(log_b(p))`. A small base (default 1.0001) keeps enough resolution
//! that products become integer additions without visible precision loss.
//! One `LogMath` is shared by the acoustic model and every search of a
//! decoder; it is rebuilt only when the configured base changes.

use crate::error::{DecoderError, Result};

/// Log value standing in for `log(0)`.
///
/// Kept well away from `i32::MIN` so that a few saturating additions of
/// `LOG_ZERO` still compare below every real score.
pub const LOG_ZERO: i32 = i32::MIN / 4;

#[derive(Debug, Clone, PartialEq)]
pub struct LogMath {
    base: f64,
    ln_base: f64,
    inv_ln_base: f64,
}

impl LogMath {
    /// # Errors
    /// `DecoderError::Config` unless `base` is finite and greater than 1.
    pub fn new(base: f64) -> Result<Self> {
        if !base.is_finite() || base <= 1.0 {
            return Err(DecoderError::Config(format!(
                "logbase must be a finite value > 1.0, got {base}"
            )));
        }
        let ln_base = base.ln();
        Ok(Self {
            base,
            ln_base,
            inv_ln_base: 1.0 / ln_base,
        })
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn zero(&self) -> i32 {
        LOG_ZERO
    }

    /// Converts a linear probability.
    pub fn log(&self, p: f64) -> i32 {
        if p <= 0.0 || p.is_nan() {
            return LOG_ZERO;
        }
        self.ln_to_log(p.ln())
    }

    /// Converts a natural logarithm.
    pub fn ln_to_log(&self, ln: f64) -> i32 {
        let v = (ln * self.inv_ln_base).round();
        if v <= LOG_ZERO as f64 || v.is_nan() {
            LOG_ZERO
        } else if v >= i32::MAX as f64 {
            i32::MAX
        } else {
            v as i32
        }
    }

    /// Converts a base-10 logarithm (ARPA files store these).
    pub fn log10_to_log(&self, log10: f64) -> i32 {
        self.ln_to_log(log10 * std::f64::consts::LN_10)
    }

    pub fn log_to_ln(&self, v: i32) -> f64 {
        v as f64 * self.ln_base
    }

    /// Back to a linear probability.
    pub fn exp(&self, v: i32) -> f64 {
        if v <= LOG_ZERO {
            0.0
        } else {
            self.log_to_ln(v).exp()
        }
    }

    /// `log(exp(a) + exp(b))` in this base.
    pub fn add(&self, a: i32, b: i32) -> i32 {
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        if lo <= LOG_ZERO {
            return hi;
        }
        let d = (hi as i64 - lo as i64) as f64;
        let corr = (-d * self.ln_base).exp().ln_1p() * self.inv_ln_base;
        hi.saturating_add(corr.round() as i32)
    }

    /// Scales a log value by a weight (language weight, insertion penalty).
    pub fn scale(&self, v: i32, weight: f64) -> i32 {
        if v <= LOG_ZERO {
            return LOG_ZERO;
        }
        let scaled = (v as f64 * weight).round();
        scaled.clamp(LOG_ZERO as f64, i32::MAX as f64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_bases_not_above_one() {
        assert!(LogMath::new(1.0).is_err());
        assert!(LogMath::new(0.5).is_err());
        assert!(LogMath::new(f64::NAN).is_err());
        assert!(LogMath::new(1.0001).is_ok());
    }

    #[test]
    fn log_of_one_is_zero_and_zero_is_floor() {
        let lm = LogMath::new(1.0001).expect("logmath");
        assert_eq!(lm.log(1.0), 0);
        assert_eq!(lm.log(0.0), LOG_ZERO);
        assert_eq!(lm.exp(LOG_ZERO), 0.0);
    }

    #[test]
    fn exp_inverts_log() {
        let lm = LogMath::new(1.0001).expect("logmath");
        for p in [0.9, 0.5, 0.01, 1e-6] {
            assert_relative_eq!(lm.exp(lm.log(p)), p, max_relative = 1e-3);
        }
    }

    #[test]
    fn add_sums_probabilities() {
        let lm = LogMath::new(1.0001).expect("logmath");
        let half = lm.log(0.5);
        let sum = lm.add(half, half);
        assert!((sum - lm.log(1.0)).abs() <= 1, "sum={sum}");
        assert_eq!(lm.add(half, LOG_ZERO), half);
        assert_eq!(lm.add(LOG_ZERO, half), half);
    }

    #[test]
    fn log10_matches_linear_conversion() {
        let lm = LogMath::new(1.0001).expect("logmath");
        assert!((lm.log10_to_log(-1.0) - lm.log(0.1)).abs() <= 1);
    }

    #[test]
    fn scale_keeps_zero_floor() {
        let lm = LogMath::new(1.0001).expect("logmath");
        assert_eq!(lm.scale(LOG_ZERO, 6.5), LOG_ZERO);
        assert_eq!(lm.scale(-100, 2.0), -200);
    }
}
