//! What-if economies built from a calibrated estimate.
//!
//! A [`Scenario`] is the base configuration plus a small [`ScenarioDelta`];
//! every economy it yields is constructed fresh, never copied from another.

use crate::aggregate::StatFlags;
use crate::analysis::{ManyStatsSummary, summarize_many_stats};
use crate::calibrate::Estimate;
use crate::config::{Config, SweepConfig};
use crate::engine::{Economy, mean_ky_ratio};
use crate::error::{EstimationError, EstimationResult};
use serde::{Deserialize, Serialize};

/// Changes to the base household types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDelta {
    /// Permanent income growth factor. Perpetual-youth types take it at
    /// every age; lifecycle types scale their age profile by it.
    pub perm_gro_fac: Option<f64>,
    /// Age at which every household dies.
    pub t_age: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    base: Config,
    estimate: Estimate,
    delta: ScenarioDelta,
}

impl Scenario {
    pub fn new(base: &Config, estimate: Estimate, delta: ScenarioDelta) -> Self {
        Self {
            base: base.clone(),
            estimate,
            delta,
        }
    }

    pub fn delta(&self) -> ScenarioDelta {
        self.delta
    }

    /// Base configuration with the delta applied to every household type.
    pub fn config(&self) -> Config {
        let mut cfg = self.base.clone();
        for ty in &mut cfg.types {
            if let Some(gro_fac) = self.delta.perm_gro_fac {
                let lifecycle = ty.household.lifecycle;
                for g in ty.household.perm_gro_fac.iter_mut() {
                    *g = if lifecycle { *g * gro_fac } else { gro_fac };
                }
            }
            if let Some(t_age) = self.delta.t_age {
                ty.household.t_age = Some(t_age);
            }
        }
        cfg
    }

    /// Fresh economy with the heterogeneous parameter set to the estimate
    /// and every statistic enabled.
    pub fn build(&self) -> EstimationResult<Economy> {
        let mut economy = Economy::new(self.config())?;
        economy.distribute_params(self.estimate.center, self.estimate.spread)?;
        economy.set_flags(StatFlags {
            lorenz: true,
            many_stats: true,
        });
        Ok(economy)
    }
}

/// Statistics of one simulated scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStats {
    pub ky_ratio: f64,
    pub stats: ManyStatsSummary,
}

impl ScenarioStats {
    fn of(economy: &Economy) -> EstimationResult<Self> {
        let records = &economy.history().records;
        let ignore_periods = economy.config().economy.ignore_periods;
        Ok(Self {
            ky_ratio: mean_ky_ratio(records, ignore_periods)?,
            stats: summarize_many_stats(records, ignore_periods)?,
        })
    }
}

/// One growth factor and maximum age, with and without re-solved rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub annual_growth: f64,
    pub perm_gro_fac: f64,
    pub t_age: Option<usize>,
    /// Households re-optimize for the new growth factor.
    pub updated: ScenarioStats,
    /// Households keep the rules solved under the estimation growth factor.
    pub no_update: ScenarioStats,
}

/// Run every growth factor and maximum age of `sweep` from `estimate`.
///
/// `baseline` is an economy already solved at the estimate, such as a
/// calibration checkpoint; without one it is solved here. Its rules are the
/// ones the no-update variants keep.
pub fn run_sweep(
    base: &Config,
    estimate: Estimate,
    sweep: &SweepConfig,
    baseline: Option<Economy>,
) -> EstimationResult<Vec<SweepPoint>> {
    if sweep.periods_per_year == 0 {
        return Err(EstimationError::Config(
            "periods_per_year must be positive".to_string(),
        ));
    }
    let baseline = match baseline {
        Some(economy) => economy,
        None => {
            let mut economy = Scenario::new(base, estimate, ScenarioDelta::default()).build()?;
            economy.solve()?.into_converged("aggregate saving rule")?;
            economy
        }
    };

    let t_ages: Vec<Option<usize>> = if sweep.t_ages.is_empty() {
        vec![None]
    } else {
        sweep.t_ages.iter().copied().map(Some).collect()
    };

    let mut points = Vec::with_capacity(t_ages.len() * sweep.annual_growth.len());
    for &t_age in &t_ages {
        for &annual_growth in &sweep.annual_growth {
            let perm_gro_fac = annual_growth.powf(1.0 / sweep.periods_per_year as f64);
            let scenario = Scenario::new(
                base,
                estimate,
                ScenarioDelta {
                    perm_gro_fac: Some(perm_gro_fac),
                    t_age,
                },
            );

            let mut updated = scenario.build()?;
            updated.solve()?.into_converged("aggregate saving rule")?;

            let mut no_update = scenario.build()?;
            no_update.adopt_rules_from(&baseline)?;
            no_update.make_history()?;

            let point = SweepPoint {
                annual_growth,
                perm_gro_fac,
                t_age: t_age.or(base.types[0].household.t_age),
                updated: ScenarioStats::of(&updated)?,
                no_update: ScenarioStats::of(&no_update)?,
            };
            log::info!(
                "growth {annual_growth:.4}, t_age {:?}: Gini {:.4} (no update {:.4})",
                point.t_age,
                point.updated.stats.mean_gini_lvl,
                point.no_update.stats.mean_gini_lvl
            );
            points.push(point);
        }
    }
    Ok(points)
}
