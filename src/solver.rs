//! Household decision rules.
//!
//! The estimation core only needs something that turns a parameter set (and,
//! with aggregate shocks, a perceived law of motion) into consumption rules.
//! [`BufferStockSolver`] is the solver shipped with the crate: the
//! endogenous grid method on the normalized income-fluctuation problem.

use crate::distribute::{DistFamily, distribute};
use crate::error::{EstimationError, EstimationResult};
use crate::market::AggregateEnvironment;
use crate::params::HouseholdParams;
use serde::{Deserialize, Serialize};

/// Piecewise-linear consumption function of normalized resources.
///
/// Below `kink` the borrowing constraint binds and everything is consumed.
/// The last segment is extrapolated linearly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Curve {
    kink: f64,
    m: Vec<f64>,
    c: Vec<f64>,
}

impl Curve {
    fn terminal() -> Self {
        Self {
            kink: f64::INFINITY,
            m: vec![0.0, 1.0],
            c: vec![0.0, 1.0],
        }
    }

    fn eval(&self, m: f64) -> (f64, f64) {
        if m <= self.kink {
            return (m, 1.0);
        }
        let n = self.m.len();
        let idx = self.m.partition_point(|&x| x < m).clamp(1, n - 1);
        let (m0, m1) = (self.m[idx - 1], self.m[idx]);
        let (c0, c1) = (self.c[idx - 1], self.c[idx]);
        let slope = (c1 - c0) / (m1 - m0);
        let c = c0 + slope * (m - m0);
        if c >= m { (m, 1.0) } else { (c, slope) }
    }

    fn distance(&self, other: &Curve) -> f64 {
        if self.m.len() != other.m.len() || self.kink.is_infinite() || other.kink.is_infinite() {
            return f64::INFINITY;
        }
        let m_dist = max_abs_diff(&self.m, &other.m);
        let c_dist = max_abs_diff(&self.c, &other.c);
        m_dist.max(c_dist).max((self.kink - other.kink).abs())
    }
}

/// Consumption rule for one age, tabulated over aggregate resources.
///
/// Between nodes of the aggregate grid consumption and the MPC are
/// interpolated linearly; beyond the grid the nearest node is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRule {
    m_agg: Vec<f64>,
    curves: Vec<Curve>,
}

impl ConsumptionRule {
    fn terminal(m_agg: Vec<f64>) -> Self {
        let curves = vec![Curve::terminal(); m_agg.len()];
        Self { m_agg, curves }
    }

    /// Consumption and marginal propensity to consume at normalized
    /// resources `m` when aggregate resources are `m_agg`.
    pub fn consume(&self, m: f64, m_agg: f64) -> (f64, f64) {
        let n = self.m_agg.len();
        let idx = self.m_agg.partition_point(|&x| x < m_agg);
        if idx == 0 {
            return self.curves[0].eval(m);
        }
        if idx == n {
            return self.curves[n - 1].eval(m);
        }
        let (x0, x1) = (self.m_agg[idx - 1], self.m_agg[idx]);
        let w = (m_agg - x0) / (x1 - x0);
        let (c0, mpc0) = self.curves[idx - 1].eval(m);
        let (c1, mpc1) = self.curves[idx].eval(m);
        ((1.0 - w) * c0 + w * c1, (1.0 - w) * mpc0 + w * mpc1)
    }

    #[cfg(test)]
    /// Resources below which the borrowing constraint binds, per aggregate node.
    pub fn kinks(&self) -> Vec<f64> {
        self.curves.iter().map(|curve| curve.kink).collect()
    }

    fn distance(&self, other: &ConsumptionRule) -> f64 {
        self.curves
            .iter()
            .zip(&other.curves)
            .map(|(a, b)| a.distance(b))
            .fold(0.0, f64::max)
    }
}

/// Decision rules of one household type, one per age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    rules: Vec<ConsumptionRule>,
    cycles: usize,
}

impl Solution {
    /// Rule used by a household of age `t_age`; ages past the last rule use it.
    pub fn rule(&self, t_age: usize) -> &ConsumptionRule {
        &self.rules[t_age.min(self.rules.len() - 1)]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Number of backward-induction steps taken.
    pub fn cycles(&self) -> usize {
        self.cycles
    }
}

/// Capability the economy needs from a consumption-saving solver.
pub trait ConsumptionSolver {
    fn solve(
        &self,
        params: &HouseholdParams,
        env: Option<&AggregateEnvironment>,
    ) -> EstimationResult<Solution>;
}

/// Endogenous-grid solver for the buffer-stock saving problem.
///
/// Permanent and transitory shocks are discretized into equiprobable
/// mean-one log-normal points; unemployment adds one transitory point.
/// Infinite-horizon types iterate from the terminal rule until successive
/// rules differ by less than `tolerance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferStockSolver {
    pub tolerance: f64,
    pub max_cycles: usize,
    /// Smallest and largest positive end-of-period asset gridpoints.
    pub a_min: f64,
    pub a_max: f64,
    pub a_count: usize,
    /// Times the asset grid is exponentially nested.
    pub a_nest: usize,
    pub perm_shk_count: usize,
    pub tran_shk_count: usize,
}

impl Default for BufferStockSolver {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_cycles: 5000,
            a_min: 0.001,
            a_max: 40.0,
            a_count: 32,
            a_nest: 3,
            perm_shk_count: 7,
            tran_shk_count: 7,
        }
    }
}

/// One point of the joint income shock distribution.
#[derive(Debug, Clone, Copy)]
struct IncomeShock {
    prob: f64,
    perm: f64,
    tran: f64,
}

/// Prices faced after one period at a node of the aggregate grid.
#[derive(Debug, Clone, Copy)]
struct Node {
    rfree: f64,
    w_rte: f64,
    m_next: f64,
}

/// Everything one backward-induction step needs.
struct Problem<'a> {
    params: &'a HouseholdParams,
    grid: Vec<f64>,
    nodes: Vec<Node>,
    gro_fac_agg: f64,
    shocks: Vec<IncomeShock>,
    a_grid: Vec<f64>,
}

impl BufferStockSolver {
    /// End-of-period asset grid: zero followed by a multi-exponential grid.
    pub fn asset_grid(&self) -> Vec<f64> {
        let nest = |x: f64| (0..self.a_nest).fold(x, |x, _| (x + 1.0).ln());
        let (lo, hi) = (nest(self.a_min), nest(self.a_max));
        let n = self.a_count;
        let mut grid = Vec::with_capacity(n + 1);
        grid.push(0.0);
        for i in 0..n {
            let x = lo + (hi - lo) * i as f64 / (n - 1).max(1) as f64;
            grid.push((0..self.a_nest).fold(x, |x, _| x.exp() - 1.0));
        }
        grid
    }

    fn income_shocks(&self, params: &HouseholdParams) -> EstimationResult<Vec<IncomeShock>> {
        let count = |std_dev: f64, n: usize| if std_dev > 0.0 { n } else { 1 };
        let perm = distribute(
            DistFamily::Lognormal,
            count(params.perm_shk_std, self.perm_shk_count),
            1.0,
            params.perm_shk_std,
            0,
        )?;
        let tran = distribute(
            DistFamily::Lognormal,
            count(params.tran_shk_std, self.tran_shk_count),
            1.0,
            params.tran_shk_std,
            0,
        )?;

        let employed_scale = (1.0 - params.tax_rate()) * params.ind_l;
        let mut tran_pts: Vec<(f64, f64)> = tran
            .values
            .iter()
            .zip(&tran.masses)
            .map(|(v, m)| ((1.0 - params.unemp_prb) * m, v * employed_scale))
            .collect();
        if params.unemp_prb > 0.0 {
            tran_pts.push((params.unemp_prb, params.inc_unemp));
        }

        let mut shocks = Vec::with_capacity(perm.values.len() * tran_pts.len());
        for (&perm_val, &perm_mass) in perm.values.iter().zip(&perm.masses) {
            for &(tran_mass, tran_val) in &tran_pts {
                shocks.push(IncomeShock {
                    prob: perm_mass * tran_mass,
                    perm: perm_val,
                    tran: tran_val,
                });
            }
        }
        Ok(shocks)
    }

    fn problem<'a>(
        &self,
        params: &'a HouseholdParams,
        env: Option<&AggregateEnvironment>,
    ) -> EstimationResult<Problem<'a>> {
        let (grid, nodes, gro_fac_agg) = match env {
            None => (
                vec![1.0],
                vec![Node {
                    rfree: params.rfree,
                    w_rte: 1.0,
                    m_next: 1.0,
                }],
                1.0,
            ),
            Some(env) => {
                let nodes = env
                    .m_grid
                    .iter()
                    .map(|&m_agg| {
                        let (rfree, w_rte) = env.prices_after(m_agg);
                        let k_next = env.saving_rule.eval(m_agg) / env.perm_gro_fac_agg;
                        Node {
                            rfree,
                            w_rte,
                            m_next: k_next * rfree + w_rte,
                        }
                    })
                    .collect();
                (env.m_grid.clone(), nodes, env.perm_gro_fac_agg)
            }
        };
        Ok(Problem {
            params,
            grid,
            nodes,
            gro_fac_agg,
            shocks: self.income_shocks(params)?,
            a_grid: self.asset_grid(),
        })
    }

    /// One step of backward induction from `next` for a household at `age`.
    fn step(problem: &Problem, age: usize, next: &ConsumptionRule) -> ConsumptionRule {
        let params = problem.params;
        let liv_prb = params.liv_prb[age];
        if liv_prb <= 0.0 {
            return ConsumptionRule::terminal(problem.grid.clone());
        }
        let gro_fac = params.perm_gro_fac[age] * problem.gro_fac_agg;
        let crra = params.crra;

        let curves = problem
            .nodes
            .iter()
            .map(|node| {
                let mut m_pts = Vec::with_capacity(problem.a_grid.len() + 1);
                let mut c_pts = Vec::with_capacity(problem.a_grid.len() + 1);
                for &a in &problem.a_grid {
                    let mut marg_val = 0.0;
                    for shock in &problem.shocks {
                        let gro = gro_fac * shock.perm;
                        let m_next = a * node.rfree / gro + shock.tran * node.w_rte;
                        let (c_next, _) = next.consume(m_next, node.m_next);
                        marg_val += shock.prob * (gro * c_next).powf(-crra);
                    }
                    let c = (params.disc_fac * liv_prb * node.rfree * marg_val).powf(-1.0 / crra);
                    m_pts.push(a + c);
                    c_pts.push(c);
                }
                let kink = m_pts[0];
                if kink > 0.0 {
                    m_pts.insert(0, 0.0);
                    c_pts.insert(0, 0.0);
                } else {
                    m_pts.remove(0);
                    c_pts.remove(0);
                    m_pts.insert(0, 0.0);
                    c_pts.insert(0, 0.0);
                }
                Curve {
                    kink,
                    m: m_pts,
                    c: c_pts,
                }
            })
            .collect();

        ConsumptionRule {
            m_agg: problem.grid.clone(),
            curves,
        }
    }

    fn check_infinite_horizon(problem: &Problem) -> EstimationResult<()> {
        let params = problem.params;
        let (liv_prb, crra) = (params.liv_prb[0], params.crra);
        for node in &problem.nodes {
            let phi = (node.rfree * params.disc_fac * liv_prb).powf(1.0 / crra) / node.rfree;
            if !(phi < 1.0) {
                return Err(EstimationError::InvalidParameterization {
                    condition: "return impatience",
                    detail: format!(
                        "(R β L)^(1/ρ) / R = {phi} with R = {}, β = {}, ρ = {crra}",
                        node.rfree, params.disc_fac
                    ),
                });
            }
        }

        let gro_fac = params.perm_gro_fac[0] * problem.gro_fac_agg;
        let perm_moment: f64 = problem
            .shocks
            .iter()
            .map(|shock| shock.prob * shock.perm.powf(1.0 - crra))
            .sum();
        let fvaf = params.disc_fac * liv_prb * gro_fac.powf(1.0 - crra) * perm_moment;
        if !(fvaf < 1.0) {
            return Err(EstimationError::InvalidParameterization {
                condition: "finite value of autarky",
                detail: format!("β L Γ^(1-ρ) E[ψ^(1-ρ)] = {fvaf}"),
            });
        }
        Ok(())
    }
}

impl ConsumptionSolver for BufferStockSolver {
    fn solve(
        &self,
        params: &HouseholdParams,
        env: Option<&AggregateEnvironment>,
    ) -> EstimationResult<Solution> {
        params.validate()?;
        if params.lifecycle && env.is_some() {
            return Err(EstimationError::Config(
                "lifecycle households cannot be solved against aggregate shocks".to_string(),
            ));
        }
        let problem = self.problem(params, env)?;

        if params.lifecycle {
            let horizon = params.horizon();
            let mut rules = vec![ConsumptionRule::terminal(problem.grid.clone())];
            for age in (0..horizon).rev() {
                let rule = Self::step(&problem, age, &rules[rules.len() - 1]);
                rules.push(rule);
            }
            rules.reverse();
            return Ok(Solution {
                rules,
                cycles: horizon,
            });
        }

        Self::check_infinite_horizon(&problem)?;
        let mut rule = ConsumptionRule::terminal(problem.grid.clone());
        let mut distance = f64::INFINITY;
        for cycle in 1..=self.max_cycles {
            let new_rule = Self::step(&problem, 0, &rule);
            distance = new_rule.distance(&rule);
            rule = new_rule;
            if distance < self.tolerance {
                return Ok(Solution {
                    rules: vec![rule],
                    cycles: cycle,
                });
            }
        }
        Err(EstimationError::NonConvergence {
            process: "infinite-horizon consumption rule",
            iterations: self.max_cycles,
            distance,
        })
    }
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggShockConfig;
    use crate::market::CobbDouglasMarket;
    use crate::params::InitialAge;
    use crate::params::tests::perpetual_youth;
    use approx::assert_relative_eq;

    fn two_period_type() -> HouseholdParams {
        HouseholdParams {
            crra: 2.0,
            disc_fac: 0.96,
            rfree: 1.02,
            liv_prb: vec![1.0],
            perm_gro_fac: vec![0.9],
            perm_shk_std: 0.0,
            tran_shk_std: 0.0,
            unemp_prb: 0.0,
            inc_unemp: 0.0,
            ind_l: 1.0,
            t_age: None,
            lifecycle: true,
            initial_age: InitialAge::Newborn,
            update_prb: 1.0,
        }
    }

    #[test]
    fn asset_grid_spans_bounds() {
        let solver = BufferStockSolver::default();
        let grid = solver.asset_grid();
        assert_eq!(grid.len(), solver.a_count + 1);
        assert_eq!(grid[0], 0.0);
        assert_relative_eq!(grid[1], solver.a_min, max_relative = 1e-10);
        assert_relative_eq!(grid[solver.a_count], solver.a_max, max_relative = 1e-10);
        assert!(grid.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn lifecycle_rule_matches_closed_form() {
        let params = two_period_type();
        let solution = BufferStockSolver::default().solve(&params, None).unwrap();
        assert_eq!(solution.len(), 2);
        assert_eq!(solution.rule(1).consume(2.5, 1.0), (2.5, 1.0));

        // c = (m + Γ/R) / (1 + Φ) with Φ = (R β)^(1/ρ) / R.
        let phi = (params.rfree * params.disc_fac).sqrt() / params.rfree;
        let (c, mpc) = solution.rule(0).consume(1.0, 1.0);
        assert_relative_eq!(c, (1.0 + 0.9 / 1.02) / (1.0 + phi), max_relative = 1e-10);
        assert_relative_eq!(mpc, 1.0 / (1.0 + phi), max_relative = 1e-8);
    }

    #[test]
    fn buffer_stock_rule_is_concave_and_constrained_at_zero() {
        let solution = BufferStockSolver::default()
            .solve(&perpetual_youth(), None)
            .unwrap();
        assert_eq!(solution.len(), 1);
        let rule = solution.rule(0);
        assert!(rule.kinks()[0] > 0.0);
        assert_eq!(rule.consume(0.01, 1.0), (0.01, 1.0));

        let (c_lo, mpc_lo) = rule.consume(2.0, 1.0);
        let (c_hi, mpc_hi) = rule.consume(10.0, 1.0);
        assert!(c_lo < 2.0 && c_hi < 10.0);
        assert!(c_hi > c_lo);
        assert!(mpc_hi <= mpc_lo && mpc_hi > 0.0);

        // Late ages reuse the only rule.
        assert_eq!(solution.rule(250), rule);
    }

    #[test]
    fn impatience_violation_is_rejected() {
        let mut params = perpetual_youth();
        params.disc_fac = 1.05;
        let err = BufferStockSolver::default().solve(&params, None).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::InvalidParameterization {
                condition: "return impatience",
                ..
            }
        ));
    }

    #[test]
    fn cycle_cap_reports_non_convergence() {
        let solver = BufferStockSolver {
            max_cycles: 3,
            ..BufferStockSolver::default()
        };
        let err = solver.solve(&perpetual_youth(), None).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::NonConvergence { iterations: 3, .. }
        ));
    }

    #[test]
    fn aggregate_rules_cover_the_grid() {
        let cfg = AggShockConfig::default();
        let market = CobbDouglasMarket::new(&cfg, 1).unwrap();
        let env = market.environment(market.initial_rule());
        let solution = BufferStockSolver::default()
            .solve(&perpetual_youth(), Some(&env))
            .unwrap();
        let rule = solution.rule(0);
        assert_eq!(rule.kinks().len(), cfg.m_grid_base.len());
        let ss = *market.steady_state();
        let (c, mpc) = rule.consume(5.0, ss.m_agg);
        assert!(c > 0.0 && c <= 5.0);
        assert!(mpc > 0.0 && mpc <= 1.0);
    }
}
