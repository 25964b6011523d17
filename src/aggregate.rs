use crate::error::{EstimationError, EstimationResult};
use crate::model::Panel;
use crate::stats::{
    percentile_grid, weighted_bin_means, weighted_gini, weighted_lorenz_shares, weighted_mean,
    weighted_median, weighted_percentiles,
};
use serde::{Deserialize, Serialize};

/// A statistic that is only computed on request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Computed<T> {
    NotRequested,
    /// Requested, but the sample had no mass to compute it on.
    Degenerate(String),
    Value(T),
}

impl<T> Computed<T> {
    /// Requested value, or the reason it is missing.
    pub fn value(&self, name: &'static str) -> EstimationResult<&T> {
        match self {
            Computed::NotRequested => Err(EstimationError::NotComputed(name)),
            Computed::Degenerate(reason) => Err(EstimationError::DegenerateAggregation(format!(
                "{name}: {reason}"
            ))),
            Computed::Value(value) => Ok(value),
        }
    }

    #[cfg(test)]
    pub fn is_value(&self) -> bool {
        matches!(self, Computed::Value(_))
    }

    fn from_result(result: EstimationResult<T>) -> EstimationResult<Self> {
        match result {
            Ok(value) => Ok(Computed::Value(value)),
            Err(EstimationError::DegenerateAggregation(reason)) => Ok(Computed::Degenerate(reason)),
            Err(err) => Err(err),
        }
    }
}

/// Which optional statistics to compute each period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFlags {
    pub lorenz: bool,
    pub many_stats: bool,
}

/// Number of equal-mass bins for wealth- and income-conditional averages.
pub const RANK_BINS: usize = 5;

/// Distributional statistics of one period's cross-section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManyStats {
    /// Lorenz curve of wealth levels on the 1..99 percentile grid.
    pub lorenz_long_lvl: Vec<f64>,
    /// Lorenz curve of wealth-to-permanent-income ratios.
    pub lorenz_long_nrm: Vec<f64>,
    /// Lorenz curve of labour income.
    pub lorenz_long_inc: Vec<f64>,
    pub gini_lvl: f64,
    pub gini_nrm: f64,
    pub gini_inc: f64,
    pub mean_lvl: f64,
    pub median_lvl: f64,
    pub mean_nrm: f64,
    pub median_nrm: f64,
    pub percentiles_lvl: Vec<f64>,
    pub percentiles_nrm: Vec<f64>,
    /// Mean heterogeneous parameter and age by wealth-level quintile.
    pub param_by_wealth: Vec<f64>,
    pub age_by_wealth: Vec<f64>,
    /// The same by labour-income quintile.
    pub param_by_inc: Vec<f64>,
    pub age_by_inc: Vec<f64>,
}

/// Aggregates of one simulated period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub ky_ratio: f64,
    /// Cohort-weighted mean of wealth levels.
    pub a_lvl_mean: f64,
    pub mpc_mean: f64,
    pub unemp_share: f64,
    /// Wealth Lorenz shares at the target percentiles.
    pub lorenz: Computed<Vec<f64>>,
    pub many: Computed<ManyStats>,
}

/// Population-wide columns of the cross-section.
struct CrossSection {
    a_lvl: Vec<f64>,
    a_nrm: Vec<f64>,
    inc_lvl: Vec<f64>,
    mpc: Vec<f64>,
    unemp: Vec<f64>,
    param: Vec<f64>,
    age: Vec<f64>,
    weight: Vec<f64>,
}

impl CrossSection {
    fn concat(panels: &[&Panel], params: &[f64], pop_gro_fac: f64) -> Self {
        let n_agt = panels.iter().map(|panel| panel.len()).sum();
        let mut cs = Self {
            a_lvl: Vec::with_capacity(n_agt),
            a_nrm: Vec::with_capacity(n_agt),
            inc_lvl: Vec::with_capacity(n_agt),
            mpc: Vec::with_capacity(n_agt),
            unemp: Vec::with_capacity(n_agt),
            param: Vec::with_capacity(n_agt),
            age: Vec::with_capacity(n_agt),
            weight: Vec::with_capacity(n_agt),
        };
        for (panel, &param) in panels.iter().zip(params) {
            cs.a_lvl.extend_from_slice(&panel.a_lvl);
            cs.a_nrm.extend(panel.a_lvl.iter().zip(&panel.p_lvl).map(|(a, p)| a / p));
            cs.inc_lvl
                .extend(panel.p_lvl.iter().zip(&panel.tran_shk).map(|(p, t)| p * t));
            cs.mpc.extend_from_slice(&panel.mpc);
            cs.unemp
                .extend(panel.emp.iter().map(|&emp| if emp { 0.0 } else { 1.0 }));
            cs.param.extend(std::iter::repeat_n(param, panel.len()));
            cs.age.extend(panel.t_age.iter().map(|&age| age as f64));
            cs.weight
                .extend(panel.t_age.iter().map(|&age| pop_gro_fac.powi(-(age as i32))));
        }
        cs
    }
}

/// Reduce every household type's panel to one [`AggregateRecord`].
///
/// Each household is weighted by `pop_gro_fac^(-age)`. Types with no
/// households contribute nothing. `params` holds each type's value of the
/// heterogeneous parameter.
pub fn aggregate_period(
    panels: &[&Panel],
    params: &[f64],
    pop_gro_fac: f64,
    percentiles: &[f64],
    flags: StatFlags,
) -> EstimationResult<AggregateRecord> {
    if panels.len() != params.len() {
        return Err(EstimationError::Config(format!(
            "{} household panels but {} parameter values",
            panels.len(),
            params.len()
        )));
    }
    let cs = CrossSection::concat(panels, params, pop_gro_fac);

    let cap_agg: f64 = cs.a_lvl.iter().zip(&cs.weight).map(|(a, w)| a * w).sum();
    let inc_agg: f64 = cs.inc_lvl.iter().zip(&cs.weight).map(|(y, w)| y * w).sum();
    if !(inc_agg > 0.0) {
        return Err(EstimationError::DegenerateAggregation(format!(
            "aggregate income is {inc_agg} across {} households",
            cs.weight.len()
        )));
    }

    let lorenz = if flags.lorenz {
        Computed::from_result(weighted_lorenz_shares(&cs.a_lvl, &cs.weight, percentiles))?
    } else {
        Computed::NotRequested
    };
    let many = if flags.many_stats {
        Computed::from_result(many_stats(&cs))?
    } else {
        Computed::NotRequested
    };

    Ok(AggregateRecord {
        ky_ratio: cap_agg / inc_agg,
        a_lvl_mean: weighted_mean(&cs.a_lvl, &cs.weight)?,
        mpc_mean: weighted_mean(&cs.mpc, &cs.weight)?,
        unemp_share: weighted_mean(&cs.unemp, &cs.weight)?,
        lorenz,
        many,
    })
}

fn many_stats(cs: &CrossSection) -> EstimationResult<ManyStats> {
    let grid = percentile_grid();
    Ok(ManyStats {
        lorenz_long_lvl: weighted_lorenz_shares(&cs.a_lvl, &cs.weight, &grid)?,
        lorenz_long_nrm: weighted_lorenz_shares(&cs.a_nrm, &cs.weight, &grid)?,
        lorenz_long_inc: weighted_lorenz_shares(&cs.inc_lvl, &cs.weight, &grid)?,
        gini_lvl: weighted_gini(&cs.a_lvl, &cs.weight, false)?,
        gini_nrm: weighted_gini(&cs.a_nrm, &cs.weight, false)?,
        gini_inc: weighted_gini(&cs.inc_lvl, &cs.weight, false)?,
        mean_lvl: weighted_mean(&cs.a_lvl, &cs.weight)?,
        median_lvl: weighted_median(&cs.a_lvl, &cs.weight)?,
        mean_nrm: weighted_mean(&cs.a_nrm, &cs.weight)?,
        median_nrm: weighted_median(&cs.a_nrm, &cs.weight)?,
        percentiles_lvl: weighted_percentiles(&cs.a_lvl, &cs.weight, &grid)?,
        percentiles_nrm: weighted_percentiles(&cs.a_nrm, &cs.weight, &grid)?,
        param_by_wealth: weighted_bin_means(&cs.a_lvl, &cs.param, &cs.weight, RANK_BINS)?,
        age_by_wealth: weighted_bin_means(&cs.a_lvl, &cs.age, &cs.weight, RANK_BINS)?,
        param_by_inc: weighted_bin_means(&cs.inc_lvl, &cs.param, &cs.weight, RANK_BINS)?,
        age_by_inc: weighted_bin_means(&cs.inc_lvl, &cs.age, &cs.weight, RANK_BINS)?,
    })
}
