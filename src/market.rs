//! Cobb-Douglas production economy with aggregate shocks.

use crate::config::AggShockConfig;
use crate::error::{EstimationError, EstimationResult};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::LogNormal;
use serde::{Deserialize, Serialize};

/// Gross return on capital at capital-to-labour ratio `k`.
pub fn rfree(cap_share: f64, depr_fac: f64, k: f64) -> f64 {
    1.0 + cap_share * k.powf(cap_share - 1.0) - depr_fac
}

/// Wage rate at capital-to-labour ratio `k`.
pub fn wage(cap_share: f64, k: f64) -> f64 {
    (1.0 - cap_share) * k.powf(cap_share)
}

/// Deterministic steady state of the production economy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteadyState {
    pub k_to_l: f64,
    pub rfree: f64,
    pub w_rte: f64,
    pub m_agg: f64,
}

impl SteadyState {
    pub fn new(cfg: &AggShockConfig) -> Self {
        let alpha = cfg.cap_share;
        let k_to_l = ((cfg.perm_gro_fac_agg.powf(cfg.crra) / cfg.disc_fac - (1.0 - cfg.depr_fac))
            / alpha)
            .powf(1.0 / (alpha - 1.0));
        let rfree = rfree(alpha, cfg.depr_fac, k_to_l);
        let w_rte = wage(alpha, k_to_l);
        Self {
            k_to_l,
            rfree,
            w_rte,
            m_agg: k_to_l * rfree + w_rte,
        }
    }
}

/// Log-linear aggregate saving rule `A' = exp(intercept + slope ln M)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavingRule {
    pub intercept: f64,
    pub slope: f64,
}

impl SavingRule {
    pub fn eval(&self, m_agg: f64) -> f64 {
        (self.intercept + self.slope * m_agg.ln()).exp()
    }

    /// Largest absolute change in either coefficient.
    pub fn distance(&self, other: &SavingRule) -> f64 {
        (self.intercept - other.intercept)
            .abs()
            .max((self.slope - other.slope).abs())
    }
}

/// What households need to know about the aggregate economy to solve
/// their problem: a grid of aggregate resources and the perceived law of
/// motion over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEnvironment {
    pub m_grid: Vec<f64>,
    pub saving_rule: SavingRule,
    pub cap_share: f64,
    pub depr_fac: f64,
    pub perm_gro_fac_agg: f64,
}

impl AggregateEnvironment {
    /// Interest and wage factors expected next period given resources `m_agg` today.
    pub fn prices_after(&self, m_agg: f64) -> (f64, f64) {
        let k_next = self.saving_rule.eval(m_agg) / self.perm_gro_fac_agg;
        (
            rfree(self.cap_share, self.depr_fac, k_next),
            wage(self.cap_share, k_next),
        )
    }
}

/// Pre-drawn path of aggregate permanent and transitory shocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShockHistory {
    pub perm: Vec<f64>,
    pub tran: Vec<f64>,
}

impl ShockHistory {
    /// Draw mean-one log-normal shocks for `act_t` periods.
    pub fn draw(cfg: &AggShockConfig, act_t: usize) -> EstimationResult<Self> {
        let mut rng = ChaCha12Rng::seed_from_u64(cfg.seed);
        let perm = mean_one_lognormal(cfg.perm_shk_agg_std)?;
        let tran = mean_one_lognormal(cfg.tran_shk_agg_std)?;
        let mut history = Self {
            perm: Vec::with_capacity(act_t),
            tran: Vec::with_capacity(act_t),
        };
        for _ in 0..act_t {
            history.perm.push(perm.sample(&mut rng));
            history.tran.push(tran.sample(&mut rng));
        }
        Ok(history)
    }
}

pub(crate) fn mean_one_lognormal(std_dev: f64) -> EstimationResult<LogNormal<f64>> {
    LogNormal::new(-0.5 * std_dev * std_dev, std_dev).map_err(|err| {
        EstimationError::Config(format!("invalid log-normal std {std_dev}: {err}"))
    })
}

/// Aggregate outcome of one period of the market.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    /// Normalized aggregate resources.
    pub m_agg: f64,
    /// Normalized aggregate assets carried into the period.
    pub a_agg: f64,
    pub k_to_l: f64,
    pub k_to_y: f64,
    pub rfree: f64,
    pub w_rte: f64,
    pub perm_shk: f64,
    pub tran_shk: f64,
    /// Growth of aggregate labour productivity into this period, `Γ_agg·Ψ`.
    pub gro_fac_agg: f64,
}

/// Market that clears capital and labour each period and re-estimates the
/// aggregate saving rule from simulated histories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CobbDouglasMarket {
    cfg: AggShockConfig,
    steady: SteadyState,
    shocks: ShockHistory,
}

impl CobbDouglasMarket {
    pub fn new(cfg: &AggShockConfig, act_t: usize) -> EstimationResult<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            steady: SteadyState::new(cfg),
            shocks: ShockHistory::draw(cfg, act_t)?,
        })
    }

    pub fn steady_state(&self) -> &SteadyState {
        &self.steady
    }

    /// Saving rule households perceive before the first fixed-point loop.
    pub fn initial_rule(&self) -> SavingRule {
        let slope = self.cfg.slope_prev;
        let intercept = self.cfg.intercept_prev.unwrap_or_else(|| {
            (self.steady.k_to_l * self.cfg.perm_gro_fac_agg).ln() - slope * self.steady.m_agg.ln()
        });
        SavingRule { intercept, slope }
    }

    pub fn environment(&self, saving_rule: SavingRule) -> AggregateEnvironment {
        AggregateEnvironment {
            m_grid: self
                .cfg
                .m_grid_base
                .iter()
                .map(|x| x * self.steady.m_agg)
                .collect(),
            saving_rule,
            cap_share: self.cfg.cap_share,
            depr_fac: self.cfg.depr_fac,
            perm_gro_fac_agg: self.cfg.perm_gro_fac_agg,
        }
    }

    /// Clear the market in period `t` given total asset and permanent income levels.
    pub fn mill(&self, t: usize, a_lvl_sum: f64, p_lvl_sum: f64) -> EstimationResult<MarketState> {
        if !(p_lvl_sum > 0.0) || !(a_lvl_sum > 0.0) {
            return Err(EstimationError::DegenerateAggregation(format!(
                "market needs positive capital and labour, got {a_lvl_sum} and {p_lvl_sum}"
            )));
        }
        let (Some(&perm_shk), Some(&tran_shk)) = (self.shocks.perm.get(t), self.shocks.tran.get(t))
        else {
            return Err(EstimationError::Config(format!(
                "no aggregate shock drawn for period {t}"
            )));
        };

        let alpha = self.cfg.cap_share;
        let a_agg = a_lvl_sum / p_lvl_sum;
        let gro_fac_agg = self.cfg.perm_gro_fac_agg * perm_shk;
        let k_to_l = a_agg / gro_fac_agg;
        let k_eff = k_to_l / tran_shk;
        let rfree = rfree(alpha, self.cfg.depr_fac, k_eff);
        let w_rte = wage(alpha, k_eff);
        Ok(MarketState {
            m_agg: k_to_l * rfree + w_rte * tran_shk,
            a_agg,
            k_to_l,
            k_to_y: k_to_l.powf(1.0 - alpha),
            rfree,
            w_rte,
            perm_shk,
            tran_shk,
            gro_fac_agg,
        })
    }

    /// Fit `ln A_t = intercept + slope ln M_{t-1}` on the post-burn-in window
    /// and damp the fit towards `prev`.
    pub fn update_dynamics(
        &self,
        history: &[MarketState],
        ignore_periods: usize,
        prev: SavingRule,
    ) -> EstimationResult<SavingRule> {
        let start = ignore_periods.max(1);
        if history.len() < start + 2 {
            return Err(EstimationError::InsufficientHistory {
                len: history.len(),
                ignore_periods: start + 1,
            });
        }
        let xs: Vec<f64> = history[start - 1..history.len() - 1]
            .iter()
            .map(|s| s.m_agg.ln())
            .collect();
        let ys: Vec<f64> = history[start..].iter().map(|s| s.a_agg.ln()).collect();

        let n = xs.len() as f64;
        let x_mean = xs.iter().sum::<f64>() / n;
        let y_mean = ys.iter().sum::<f64>() / n;
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (x, y) in xs.iter().zip(&ys) {
            sxx += (x - x_mean) * (x - x_mean);
            sxy += (x - x_mean) * (y - y_mean);
        }
        if !(sxx > 0.0) {
            return Err(EstimationError::DegenerateAggregation(
                "aggregate resources do not vary over the regression window".to_string(),
            ));
        }
        let slope = sxy / sxx;
        let intercept = y_mean - slope * x_mean;

        let damp = self.cfg.damping_fac;
        Ok(SavingRule {
            intercept: damp * prev.intercept + (1.0 - damp) * intercept,
            slope: damp * prev.slope + (1.0 - damp) * slope,
        })
    }
}
