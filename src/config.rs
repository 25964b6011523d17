use crate::distribute::DistFamily;
use crate::params::{HouseholdParams, ParamName};
use crate::solver::BufferStockSolver;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Model and estimation configuration.
///
/// Loaded from a TOML file, validated once and never mutated afterwards.
/// Scenarios derive modified copies through [`crate::scenario`].
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Household base types and their population weights.
    pub types: Vec<TypeConfig>,
    pub economy: EconomyConfig,
    pub heterogeneity: HeterogeneityConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub solver: BufferStockSolver,
    /// Present only for economies with aggregate shocks.
    #[serde(default)]
    pub agg_shocks: Option<AggShockConfig>,
    #[serde(default)]
    pub sweep: Option<SweepConfig>,
}

/// One household base type.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TypeConfig {
    /// Share of the population belonging to this type.
    pub weight: f64,
    #[serde(flatten)]
    pub household: HouseholdParams,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct EconomyConfig {
    /// Total number of simulated households.
    pub population: usize,
    /// Population growth factor used for cohort weights.
    pub pop_gro_fac: f64,
    /// Number of simulated periods.
    pub act_t: usize,
    /// Burn-in periods excluded from every time average.
    pub ignore_periods: usize,
    /// Target capital-to-income ratio.
    pub ky_target: f64,
    /// Percentiles at which the Lorenz target is matched.
    pub lorenz_percentiles: Vec<f64>,
    /// Target cumulative wealth shares at `lorenz_percentiles`.
    pub lorenz_target: Vec<f64>,
    /// Solve and simulate household types on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
    /// Seed of the first household type; type `j` uses `seed + j`.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    /// A single preference value; only the center is estimated.
    Point,
    /// A discretized distribution; center and spread are estimated.
    Dist,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct HeterogeneityConfig {
    pub param: ParamName,
    /// Number of distinct parameter values.
    pub count: usize,
    pub family: DistFamily,
    pub mode: CalibrationMode,
    pub center_bracket: [f64; 2],
    #[serde(default = "default_spread_bracket")]
    pub spread_bracket: [f64; 2],
    /// Extra upper-tail points of the log-normal family.
    #[serde(default = "default_tail_count")]
    pub tail_count: usize,
}

fn default_spread_bracket() -> [f64; 2] {
    [0.006, 0.008]
}

fn default_tail_count() -> usize {
    3
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub center_tol: f64,
    pub spread_tol: f64,
    pub max_iters: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            center_tol: 1e-6,
            spread_tol: 1e-4,
            max_iters: 100,
        }
    }
}

/// Cobb-Douglas production economy with aggregate shocks.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggShockConfig {
    pub cap_share: f64,
    pub depr_fac: f64,
    pub perm_gro_fac_agg: f64,
    pub perm_shk_agg_std: f64,
    pub tran_shk_agg_std: f64,
    /// Discount factor and risk aversion used for the steady state.
    pub disc_fac: f64,
    pub crra: f64,
    /// Weight on the previous saving rule when updating it.
    pub damping_fac: f64,
    pub tolerance: f64,
    pub max_loops: usize,
    /// Initial saving-rule intercept; by default the rule passes through
    /// the steady state.
    pub intercept_prev: Option<f64>,
    pub slope_prev: f64,
    /// Aggregate resource grid relative to its steady state.
    pub m_grid_base: Vec<f64>,
    pub seed: u64,
}

impl Default for AggShockConfig {
    fn default() -> Self {
        Self {
            cap_share: 0.36,
            depr_fac: 0.025,
            perm_gro_fac_agg: 1.0,
            perm_shk_agg_std: 0.0063,
            tran_shk_agg_std: 0.0031,
            disc_fac: 0.99,
            crra: 1.0,
            damping_fac: 0.5,
            tolerance: 1e-4,
            max_loops: 20,
            intercept_prev: None,
            slope_prev: 1.0,
            m_grid_base: vec![
                0.1, 0.3, 0.6, 0.8, 0.9, 0.98, 1.0, 1.02, 1.1, 1.2, 1.6, 2.0, 3.0,
            ],
            seed: 0,
        }
    }
}

/// Growth and maximum-age scenarios run from a calibrated estimate.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub annual_growth: Vec<f64>,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: u32,
    /// Maximum ages to combine with every growth factor; empty keeps the base.
    #[serde(default)]
    pub t_ages: Vec<usize>,
}

fn default_periods_per_year() -> u32 {
    4
}

impl Config {
    /// Load a [`Config`] from a TOML file and validate it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;
        config.validate().context("failed to validate config")?;
        Ok(config)
    }

    /// Number of household-type slots in the economy.
    pub fn n_slots(&self) -> usize {
        self.heterogeneity.count * self.types.len()
    }

    pub fn type_weights(&self) -> Vec<f64> {
        self.types.iter().map(|t| t.weight).collect()
    }

    pub fn validate(&self) -> Result<()> {
        check_num(self.types.len(), 1..100).context("invalid number of household types")?;
        check_vec(&self.type_weights(), self.types.len(), true).context("invalid type weights")?;
        for (i_type, ty) in self.types.iter().enumerate() {
            ty.household
                .validate()
                .with_context(|| format!("invalid household type {i_type}"))?;
        }

        let eco = &self.economy;
        check_num(eco.population, 1..10_000_000).context("invalid population")?;
        check_num(eco.pop_gro_fac, 0.5..2.0).context("invalid population growth factor")?;
        check_num(eco.act_t, 1..1_000_000).context("invalid number of simulated periods")?;
        check_num(eco.ignore_periods, 0..eco.act_t).context("invalid number of burn-in periods")?;
        check_vec(&eco.lorenz_target, eco.lorenz_percentiles.len(), false)
            .context("invalid Lorenz target")?;
        if eco
            .lorenz_percentiles
            .iter()
            .any(|p| !(0.0..=1.0).contains(p))
        {
            bail!("Lorenz percentiles must be fractions in [0, 1]");
        }

        let het = &self.heterogeneity;
        check_num(het.count, 1..1000).context("invalid number of parameter values")?;
        check_bracket(het.center_bracket).context("invalid center bracket")?;
        if het.mode == CalibrationMode::Dist {
            check_bracket(het.spread_bracket).context("invalid spread bracket")?;
        }
        if het.mode == CalibrationMode::Point && het.count != 1 {
            bail!("point calibration takes exactly one parameter value");
        }
        if het.family == DistFamily::Lognormal && het.count > 1 && het.count <= het.tail_count {
            bail!(
                "log-normal family needs more than {} values, got {}",
                het.tail_count,
                het.count
            );
        }

        let cal = &self.calibration;
        check_num(cal.center_tol, 1e-14..1.0).context("invalid center tolerance")?;
        check_num(cal.spread_tol, 1e-14..1.0).context("invalid spread tolerance")?;
        check_num(cal.max_iters, 1..100_000).context("invalid maximum iterations")?;

        check_num(self.solver.tolerance, 1e-16..1.0).context("invalid solver tolerance")?;
        check_num(self.solver.max_cycles, 1..10_000_000).context("invalid solver cycle cap")?;
        check_num(self.solver.a_count, 2..10_000).context("invalid asset grid size")?;
        check_num(self.solver.a_min, 1e-12..f64::INFINITY).context("invalid asset grid minimum")?;
        if !(self.solver.a_max > self.solver.a_min) {
            bail!("asset grid maximum must exceed its minimum");
        }
        check_num(self.solver.perm_shk_count, 1..1000).context("invalid permanent shock count")?;
        check_num(self.solver.tran_shk_count, 1..1000).context("invalid transitory shock count")?;

        if let Some(agg) = &self.agg_shocks {
            check_num(agg.cap_share, 0.0..1.0).context("invalid capital share")?;
            check_num(agg.depr_fac, 0.0..=1.0).context("invalid depreciation")?;
            check_num(agg.damping_fac, 0.0..1.0).context("invalid damping factor")?;
            check_num(agg.max_loops, 1..10_000).context("invalid fixed-point loop cap")?;
            check_num(agg.m_grid_base.len(), 2..1000).context("invalid aggregate grid")?;
            if agg.m_grid_base.windows(2).any(|pair| pair[1] <= pair[0]) {
                bail!("aggregate grid must be strictly increasing");
            }
            if eco.ignore_periods < 1 || eco.act_t - eco.ignore_periods < 2 {
                bail!("aggregate shocks need one burn-in period and two periods to regress on");
            }
            if self.types.iter().any(|t| t.household.lifecycle) {
                bail!("aggregate shocks are only supported with perpetual-youth types");
            }
        }

        if let Some(sweep) = &self.sweep {
            if sweep.annual_growth.iter().any(|g| !(*g > 0.0)) {
                bail!("annual growth factors must be positive");
            }
            check_num(sweep.periods_per_year, 1..=365).context("invalid periods per year")?;
        }

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_vec(vec: &[f64], exp_len: usize, prob_vec: bool) -> Result<()> {
    let len = vec.len();
    if len != exp_len {
        bail!("vector length must be {exp_len}, but is {len}");
    }
    if !prob_vec {
        return Ok(());
    }
    if vec.iter().any(|&ele| ele < 0.0) {
        bail!("vector must have only non-negative elements");
    }
    let sum: f64 = vec.iter().sum();
    let tol = 1e-8;
    if (sum - 1.0).abs() > tol {
        bail!("vector must sum to 1.0 (tolerance: {tol}), but sums to {sum}");
    }
    Ok(())
}

fn check_bracket(bracket: [f64; 2]) -> Result<()> {
    let [lo, hi] = bracket;
    if !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
        bail!("bracket must satisfy lo < hi, but is [{lo}, {hi}]");
    }
    Ok(())
}
