use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::config::FundConfig;
use crate::error::FundSimError;
use crate::price_path::correlation::{
    cholesky_lower_psd, correlate_normals, identity, validate_correlation_matrix,
};
use crate::price_path::model::{gbm_step, mean_reverting_step, PricePathModel, Regime};
use crate::rng::standard_normal;
use crate::types::Period;
use crate::FundSimResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricePathConfig {
    #[serde(default)]
    pub model: PricePathModel,
    /// Annualised volatility of suburb noise around the zone path.
    #[serde(default)]
    pub suburb_variation: f64,
    /// Annualised volatility of property noise around its suburb path.
    #[serde(default)]
    pub property_variation: f64,
}

/// Drift and volatility for one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDynamics {
    pub name: String,
    pub drift: f64,
    pub volatility: f64,
    #[serde(default)]
    pub suburbs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuburbPath {
    pub suburb: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonePath {
    pub zone: String,
    /// `horizon + 1` multipliers, `values[0] == 1.0`.
    pub values: Vec<f64>,
    pub suburbs: Vec<SuburbPath>,
}

/// One realisation of every zone (and suburb) path over the fund horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePaths {
    pub model: String,
    pub dt: f64,
    pub zones: Vec<ZonePath>,
    /// Regime in force during each step `1..=horizon` (regime switching only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regimes: Option<Vec<Regime>>,
    pub property_variation: f64,
}

impl PricePaths {
    pub fn horizon(&self) -> Period {
        self.zones
            .first()
            .map(|z| z.values.len().saturating_sub(1) as Period)
            .unwrap_or(0)
    }

    pub fn zone_index(&self, zone: &str) -> Option<usize> {
        self.zones.iter().position(|z| z.zone == zone)
    }

    /// Zone multiplier at `period`, clamped to the horizon.
    pub fn zone_value(&self, zone: usize, period: Period) -> f64 {
        let values = &self.zones[zone].values;
        values[(period as usize).min(values.len() - 1)]
    }

    /// Path a property in `zone` (and optionally `suburb`) is refined from.
    pub fn base_path(&self, zone: usize, suburb: Option<usize>) -> &[f64] {
        let zone_path = &self.zones[zone];
        suburb
            .and_then(|s| zone_path.suburbs.get(s))
            .map(|s| s.values.as_slice())
            .unwrap_or(zone_path.values.as_slice())
    }

    /// `value[period] / value[period - lookback] - 1`, with the window
    /// truncated at inception.
    pub fn trailing_appreciation(&self, zone: usize, period: Period, lookback: u32) -> f64 {
        let end = period.min(self.horizon());
        let start = end.saturating_sub(lookback);
        let from = self.zone_value(zone, start);
        if from <= 0.0 {
            return 0.0;
        }
        self.zone_value(zone, end) / from - 1.0
    }

    pub fn log_returns(&self, zone: usize) -> Vec<f64> {
        self.zones[zone]
            .values
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect()
    }

    /// Property-level path: the suburb (or zone) path with independent
    /// log-normal noise at `property_variation`.
    pub fn property_path(
        &self,
        zone: usize,
        suburb: Option<usize>,
        rng: &mut StdRng,
    ) -> FundSimResult<Vec<f64>> {
        let normal = standard_normal()?;
        refine_path(
            self.base_path(zone, suburb),
            self.property_variation,
            self.dt,
            &normal,
            rng,
        )
    }
}

/// Multiply `parent` by a mean-one log-normal random walk with annualised
/// volatility `variation`.
pub fn refine_path(
    parent: &[f64],
    variation: f64,
    dt: f64,
    normal: &Normal,
    rng: &mut StdRng,
) -> FundSimResult<Vec<f64>> {
    if variation <= 0.0 {
        return Ok(parent.to_vec());
    }
    let step_sd = variation * dt.sqrt();
    let mut log_noise = 0.0;
    let mut out = Vec::with_capacity(parent.len());
    for (t, &value) in parent.iter().enumerate() {
        if t > 0 {
            log_noise += step_sd * rng.sample(normal) - 0.5 * step_sd * step_sd;
        }
        let refined = value * log_noise.exp();
        if !refined.is_finite() {
            return Err(FundSimError::NumericalInstability {
                context: format!("refined price path at period {t}"),
            });
        }
        out.push(refined);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Correlated multi-zone path generator. Construction validates the
/// correlation matrix; generation never fails on configuration grounds.
#[derive(Debug, Clone)]
pub struct PricePathSimulator {
    model: PricePathModel,
    zones: Vec<ZoneDynamics>,
    cholesky: Vec<Vec<f64>>,
    dt: f64,
    horizon: Period,
    suburb_variation: f64,
    property_variation: f64,
    normal: Normal,
}

impl PricePathSimulator {
    pub fn new(
        zones: Vec<ZoneDynamics>,
        correlation: Option<&[Vec<f64>]>,
        model: PricePathModel,
        dt: f64,
        horizon: Period,
    ) -> FundSimResult<Self> {
        if zones.is_empty() {
            return Err(FundSimError::InvalidInput {
                field: "zones".into(),
                reason: "At least one zone is required".into(),
            });
        }
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FundSimError::InvalidInput {
                field: "dt".into(),
                reason: "Time step must be positive".into(),
            });
        }
        for zone in &zones {
            if !zone.drift.is_finite() || !zone.volatility.is_finite() || zone.volatility < 0.0 {
                return Err(FundSimError::InvalidInput {
                    field: format!("zones.{}", zone.name),
                    reason: "Drift must be finite and volatility finite and >= 0".into(),
                });
            }
        }
        model.validate()?;

        let cholesky = match correlation {
            Some(matrix) => {
                validate_correlation_matrix(matrix, zones.len())?;
                cholesky_lower_psd(matrix)?
            }
            None => identity(zones.len()),
        };

        Ok(Self {
            model,
            zones,
            cholesky,
            dt,
            horizon,
            suburb_variation: 0.0,
            property_variation: 0.0,
            normal: standard_normal()?,
        })
    }

    pub fn from_config(config: &FundConfig) -> FundSimResult<Self> {
        let zones = config
            .zones
            .iter()
            .map(|z| ZoneDynamics {
                name: z.name.clone(),
                drift: z.drift,
                volatility: z.volatility,
                suburbs: z.suburbs.clone(),
            })
            .collect();
        Ok(Self::new(
            zones,
            config.correlation.as_deref(),
            config.price_path.model.clone(),
            config.fund.dt(),
            config.fund.term_periods,
        )?
        .with_refinement(
            config.price_path.suburb_variation,
            config.price_path.property_variation,
        ))
    }

    pub fn with_refinement(mut self, suburb_variation: f64, property_variation: f64) -> Self {
        self.suburb_variation = suburb_variation.max(0.0);
        self.property_variation = property_variation.max(0.0);
        self
    }

    pub fn horizon(&self) -> Period {
        self.horizon
    }

    /// Generate one realisation. Zone noise is drawn from `rng` (one regime
    /// draw, then one normal per zone, per step); suburb noise from
    /// `suburb_rng` so adding suburbs never shifts the zone paths.
    pub fn generate(&self, rng: &mut StdRng, suburb_rng: &mut StdRng) -> FundSimResult<PricePaths> {
        let n = self.zones.len();
        let steps = self.horizon as usize;
        let mut values: Vec<Vec<f64>> = (0..n)
            .map(|_| {
                let mut v = Vec::with_capacity(steps + 1);
                v.push(1.0);
                v
            })
            .collect();

        let mut regime = match &self.model {
            PricePathModel::RegimeSwitching { start_in_bear, .. } if *start_in_bear => Regime::Bear,
            _ => Regime::Bull,
        };
        let mut regimes = match self.model {
            PricePathModel::RegimeSwitching { .. } => Some(Vec::with_capacity(steps)),
            _ => None,
        };

        let mut independent = vec![0.0; n];
        let mut correlated = vec![0.0; n];

        for t in 1..=steps {
            for z in independent.iter_mut() {
                *z = rng.sample(self.normal);
            }
            correlate_normals(&self.cholesky, &independent, &mut correlated);

            for (i, zone) in self.zones.iter().enumerate() {
                let prev = values[i][t - 1];
                let next = match &self.model {
                    PricePathModel::Gbm => {
                        gbm_step(prev, zone.drift, zone.volatility, self.dt, correlated[i])
                    }
                    PricePathModel::MeanReverting {
                        speed,
                        long_term_mean,
                    } => mean_reverting_step(
                        prev,
                        *speed,
                        *long_term_mean,
                        zone.volatility,
                        self.dt,
                        correlated[i],
                    ),
                    PricePathModel::RegimeSwitching {
                        bear_drift_shift,
                        bear_volatility_multiplier,
                        ..
                    } => match regime {
                        Regime::Bull => {
                            gbm_step(prev, zone.drift, zone.volatility, self.dt, correlated[i])
                        }
                        Regime::Bear => gbm_step(
                            prev,
                            zone.drift + bear_drift_shift,
                            zone.volatility * bear_volatility_multiplier,
                            self.dt,
                            correlated[i],
                        ),
                    },
                };
                if !next.is_finite() || next <= 0.0 {
                    return Err(FundSimError::NumericalInstability {
                        context: format!("zone '{}' multiplier {next} at period {t}", zone.name),
                    });
                }
                values[i].push(next);
            }

            if let (
                PricePathModel::RegimeSwitching {
                    p_bull_to_bear,
                    p_bear_to_bull,
                    ..
                },
                Some(log),
            ) = (&self.model, regimes.as_mut())
            {
                log.push(regime);
                let u: f64 = rng.gen();
                regime = regime.transition(*p_bull_to_bear, *p_bear_to_bull, u);
            }
        }

        let mut zones = Vec::with_capacity(n);
        for (zone, zone_values) in self.zones.iter().zip(values) {
            let mut suburbs = Vec::with_capacity(zone.suburbs.len());
            for suburb in &zone.suburbs {
                suburbs.push(SuburbPath {
                    suburb: suburb.clone(),
                    values: refine_path(
                        &zone_values,
                        self.suburb_variation,
                        self.dt,
                        &self.normal,
                        suburb_rng,
                    )?,
                });
            }
            zones.push(ZonePath {
                zone: zone.name.clone(),
                values: zone_values,
                suburbs,
            });
        }

        log::trace!(
            "generated {} zone paths over {} periods ({})",
            n,
            steps,
            self.model.name()
        );

        Ok(PricePaths {
            model: self.model.name().to_string(),
            dt: self.dt,
            zones,
            regimes,
            property_variation: self.property_variation,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
