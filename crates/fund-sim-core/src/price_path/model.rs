use serde::{Deserialize, Serialize};

use crate::error::FundSimError;
use crate::FundSimResult;

/// Floor applied to mean-reverting multipliers so values stay positive.
pub const MIN_MULTIPLIER: f64 = 1e-4;

/// Stochastic process driving zone value multipliers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PricePathModel {
    /// Geometric Brownian motion with the zone's drift and volatility.
    #[default]
    Gbm,
    /// Arithmetic Ornstein-Uhlenbeck on the multiplier, floored at
    /// [`MIN_MULTIPLIER`].
    MeanReverting {
        /// Reversion speed (kappa), per year.
        speed: f64,
        /// Long-run multiplier level (theta).
        long_term_mean: f64,
    },
    /// Market-wide two-state Markov chain choosing the GBM parameters.
    RegimeSwitching {
        p_bull_to_bear: f64,
        p_bear_to_bull: f64,
        #[serde(default)]
        bear_drift_shift: f64,
        #[serde(default = "default_bear_volatility_multiplier")]
        bear_volatility_multiplier: f64,
        #[serde(default)]
        start_in_bear: bool,
    },
}

fn default_bear_volatility_multiplier() -> f64 {
    1.5
}

impl PricePathModel {
    pub fn name(&self) -> &'static str {
        match self {
            PricePathModel::Gbm => "gbm",
            PricePathModel::MeanReverting { .. } => "mean_reverting",
            PricePathModel::RegimeSwitching { .. } => "regime_switching",
        }
    }

    pub fn validate(&self) -> FundSimResult<()> {
        match self {
            PricePathModel::Gbm => Ok(()),
            PricePathModel::MeanReverting {
                speed,
                long_term_mean,
            } => {
                if !speed.is_finite() || *speed < 0.0 {
                    return Err(invalid("price_path.model.speed", "Must be finite and >= 0"));
                }
                if !long_term_mean.is_finite() || *long_term_mean <= 0.0 {
                    return Err(invalid(
                        "price_path.model.long_term_mean",
                        "Must be finite and positive",
                    ));
                }
                Ok(())
            }
            PricePathModel::RegimeSwitching {
                p_bull_to_bear,
                p_bear_to_bull,
                bear_drift_shift,
                bear_volatility_multiplier,
                ..
            } => {
                for (field, p) in [
                    ("price_path.model.p_bull_to_bear", p_bull_to_bear),
                    ("price_path.model.p_bear_to_bull", p_bear_to_bull),
                ] {
                    if !(0.0..=1.0).contains(p) {
                        return Err(invalid(field, "Transition probability must be in [0, 1]"));
                    }
                }
                if !bear_drift_shift.is_finite() {
                    return Err(invalid("price_path.model.bear_drift_shift", "Must be finite"));
                }
                if !bear_volatility_multiplier.is_finite() || *bear_volatility_multiplier < 0.0 {
                    return Err(invalid(
                        "price_path.model.bear_volatility_multiplier",
                        "Must be finite and >= 0",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn invalid(field: &str, reason: &str) -> FundSimError {
    FundSimError::InvalidInput {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
}

impl Regime {
    /// Markov transition given a uniform draw in `[0, 1)`.
    pub fn transition(self, p_bull_to_bear: f64, p_bear_to_bull: f64, u: f64) -> Regime {
        match self {
            Regime::Bull if u < p_bull_to_bear => Regime::Bear,
            Regime::Bear if u < p_bear_to_bull => Regime::Bull,
            current => current,
        }
    }
}

/// `S * exp((mu - sigma^2 / 2) dt + sigma sqrt(dt) z)`
pub fn gbm_step(prev: f64, drift: f64, volatility: f64, dt: f64, z: f64) -> f64 {
    prev * ((drift - 0.5 * volatility * volatility) * dt + volatility * dt.sqrt() * z).exp()
}

/// `S + kappa (theta - S) dt + sigma sqrt(dt) z`, floored.
pub fn mean_reverting_step(
    prev: f64,
    speed: f64,
    long_term_mean: f64,
    volatility: f64,
    dt: f64,
    z: f64,
) -> f64 {
    (prev + speed * (long_term_mean - prev) * dt + volatility * dt.sqrt() * z).max(MIN_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gbm_zero_shock_grows_at_drift_less_convexity() {
        let next = gbm_step(1.0, 0.05, 0.2, 1.0, 0.0);
        assert!((next - (0.05f64 - 0.02).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_mean_reversion_pulls_toward_mean_and_floors() {
        let up = mean_reverting_step(0.8, 2.0, 1.0, 0.1, 0.25, 0.0);
        assert!((up - 0.9).abs() < 1e-12);
        let floored = mean_reverting_step(0.01, 0.0, 1.0, 0.5, 1.0, -10.0);
        assert_eq!(floored, MIN_MULTIPLIER);
    }

    #[test]
    fn test_regime_transition() {
        assert_eq!(Regime::Bull.transition(0.1, 0.3, 0.05), Regime::Bear);
        assert_eq!(Regime::Bull.transition(0.1, 0.3, 0.5), Regime::Bull);
        assert_eq!(Regime::Bear.transition(0.1, 0.3, 0.2), Regime::Bull);
        assert_eq!(Regime::Bear.transition(0.1, 0.3, 0.9), Regime::Bear);
    }

    #[test]
    fn test_model_deserialises_from_tag() {
        let m: PricePathModel = serde_json::from_str(
            r#"{"type":"regime_switching","p_bull_to_bear":0.05,"p_bear_to_bull":0.2}"#,
        )
        .unwrap();
        assert!(matches!(
            m,
            PricePathModel::RegimeSwitching {
                bear_volatility_multiplier,
                start_in_bear: false,
                ..
            } if (bear_volatility_multiplier - 1.5).abs() < 1e-12
        ));
        assert!(m.validate().is_ok());

        let bad = PricePathModel::MeanReverting {
            speed: 1.0,
            long_term_mean: 0.0,
        };
        assert!(bad.validate().is_err());
    }
}
