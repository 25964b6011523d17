use crate::aggregate::{AggregateRecord, StatFlags, aggregate_period};
use crate::config::Config;
use crate::distribute::{assign, distribute};
use crate::error::{EstimationError, EstimationResult};
use crate::market::{CobbDouglasMarket, MarketState, SavingRule};
use crate::model::{AgentType, Panel};
use anyhow::{Context, Result};
use rayon::prelude::*;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Outcome of the aggregate fixed-point loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Convergence<T> {
    Converged { value: T, iterations: usize },
    NonConverged { value: T, iterations: usize, distance: f64 },
}

impl<T> Convergence<T> {
    /// Converged value, or a `NonConvergence` error for `process`.
    pub fn into_converged(self, process: &'static str) -> EstimationResult<T> {
        match self {
            Convergence::Converged { value, .. } => Ok(value),
            Convergence::NonConverged {
                iterations,
                distance,
                ..
            } => Err(EstimationError::NonConvergence {
                process,
                iterations,
                distance,
            }),
        }
    }
}

/// Simulated aggregates, one entry per period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub records: Vec<AggregateRecord>,
    /// Market-clearing outcomes; empty without aggregate shocks.
    pub market: Vec<MarketState>,
}

/// The economy: household types, an optional production market, and the
/// history produced by simulating them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Economy {
    cfg: Config,
    agents: Vec<AgentType>,
    market: Option<CobbDouglasMarket>,
    saving_rule: Option<SavingRule>,
    flags: StatFlags,
    history: History,
}

impl Economy {
    /// Build an economy with one household type per slot and the
    /// heterogeneous parameter still at its base value.
    pub fn new(cfg: Config) -> EstimationResult<Self> {
        let n_types = cfg.types.len();
        let n_slots = cfg.n_slots();
        let mut agents = Vec::with_capacity(n_slots);
        for j in 0..n_slots {
            let params = cfg.types[j % n_types].household.clone();
            let seed = cfg.economy.seed.wrapping_add(j as u64);
            agents.push(AgentType::new(seed, 0, params)?);
        }

        let market = match &cfg.agg_shocks {
            Some(agg) => Some(CobbDouglasMarket::new(agg, cfg.economy.act_t)?),
            None => None,
        };
        let saving_rule = market.as_ref().map(CobbDouglasMarket::initial_rule);

        Ok(Self {
            cfg,
            agents,
            market,
            saving_rule,
            flags: StatFlags::default(),
            history: History::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn agents(&self) -> &[AgentType] {
        &self.agents
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn flags(&self) -> StatFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: StatFlags) {
        self.flags = flags;
    }

    /// Give the heterogeneous parameter a distribution with the given
    /// center and spread and set each slot's household count.
    pub fn distribute_params(&mut self, center: f64, spread: f64) -> EstimationResult<()> {
        let het = &self.cfg.heterogeneity;
        let dist = distribute(het.family, het.count, center, spread, het.tail_count)?;
        let slots = assign(
            &dist,
            self.agents.len(),
            &self.cfg.type_weights(),
            self.cfg.economy.population,
        )?;
        for (agent, slot) in self.agents.iter_mut().zip(slots) {
            agent.set_param(het.param, slot.value);
            agent.set_agent_count(slot.agent_count);
        }
        log::debug!("distributed {} over {:?}", het.param, dist.values);
        Ok(())
    }

    /// Solve households and simulate the economy.
    ///
    /// Without aggregate shocks this is a single pass. With them, the
    /// perceived saving rule is re-estimated from each simulated history
    /// until successive estimates agree or the loop cap is reached.
    pub fn solve(&mut self) -> EstimationResult<Convergence<Option<SavingRule>>> {
        let Some(agg) = self.cfg.agg_shocks.clone() else {
            self.solve_agents()?;
            self.make_history()?;
            return Ok(Convergence::Converged {
                value: None,
                iterations: 1,
            });
        };

        let mut distance = f64::INFINITY;
        for iteration in 1..=agg.max_loops {
            self.solve_agents()?;
            self.make_history()?;
            let prev = self.current_rule()?;
            let new_rule = self.fit_saving_rule(prev)?;
            // The first loop has no earlier estimate to compare with.
            distance = if iteration == 1 {
                f64::INFINITY
            } else {
                new_rule.distance(&prev)
            };
            self.saving_rule = Some(new_rule);
            log::info!(
                "loop {iteration:03}: intercept = {:.6}, slope = {:.6}, distance = {distance:.3e}",
                new_rule.intercept,
                new_rule.slope
            );
            if distance < agg.tolerance {
                return Ok(Convergence::Converged {
                    value: Some(new_rule),
                    iterations: iteration,
                });
            }
        }
        Ok(Convergence::NonConverged {
            value: self.saving_rule,
            iterations: agg.max_loops,
            distance,
        })
    }

    /// Solve every household type against the current saving rule.
    pub fn solve_agents(&mut self) -> EstimationResult<()> {
        let env = match (&self.market, self.saving_rule) {
            (Some(market), Some(rule)) => Some(market.environment(rule)),
            _ => None,
        };
        let solver = &self.cfg.solver;
        if self.cfg.economy.parallel {
            self.agents
                .par_iter_mut()
                .try_for_each(|agent| agent.solve(solver, env.as_ref()))
        } else {
            self.agents
                .iter_mut()
                .try_for_each(|agent| agent.solve(solver, env.as_ref()))
        }
    }

    /// Reset every household type and simulate `act_t` periods.
    pub fn make_history(&mut self) -> EstimationResult<()> {
        let a_init = self
            .market
            .as_ref()
            .map_or(0.0, |market| market.steady_state().k_to_l);
        for agent in &mut self.agents {
            agent.reset_simulation(a_init)?;
        }

        let het_param = self.cfg.heterogeneity.param;
        let het_values: Vec<f64> = self
            .agents
            .iter()
            .map(|agent| het_param.value(agent.params()))
            .collect();

        let act_t = self.cfg.economy.act_t;
        let mut history = History {
            records: Vec::with_capacity(act_t),
            market: Vec::with_capacity(if self.market.is_some() { act_t } else { 0 }),
        };
        for t in 0..act_t {
            let state = match &self.market {
                Some(market) => {
                    let (a_sum, p_sum) = self.level_sums();
                    let state = market.mill(t, a_sum, p_sum)?;
                    history.market.push(state);
                    Some(state)
                }
                None => None,
            };

            if self.cfg.economy.parallel {
                self.agents
                    .par_iter_mut()
                    .try_for_each(|agent| agent.advance_one_period(state.as_ref()))?;
            } else {
                self.agents
                    .iter_mut()
                    .try_for_each(|agent| agent.advance_one_period(state.as_ref()))?;
            }

            let panels: Vec<&Panel> = self.agents.iter().map(AgentType::panel).collect();
            let record = aggregate_period(
                &panels,
                &het_values,
                self.cfg.economy.pop_gro_fac,
                &self.cfg.economy.lorenz_percentiles,
                self.flags,
            )?;
            history.records.push(record);
        }
        log::debug!("simulated {act_t} periods");

        self.history = history;
        Ok(())
    }

    fn level_sums(&self) -> (f64, f64) {
        self.agents
            .iter()
            .map(AgentType::panel)
            .fold((0.0, 0.0), |(a_sum, p_sum), panel| {
                (
                    a_sum + panel.a_lvl.iter().sum::<f64>(),
                    p_sum + panel.p_lvl.iter().sum::<f64>(),
                )
            })
    }

    fn current_rule(&self) -> EstimationResult<SavingRule> {
        self.saving_rule.ok_or_else(|| {
            EstimationError::Config("economy has no aggregate saving rule".to_string())
        })
    }

    fn fit_saving_rule(&self, prev: SavingRule) -> EstimationResult<SavingRule> {
        let market = self.market.as_ref().ok_or_else(|| {
            EstimationError::Config("economy has no aggregate market".to_string())
        })?;
        market.update_dynamics(
            &self.history.market,
            self.cfg.economy.ignore_periods,
            prev,
        )
    }

    /// Mean capital-to-income ratio after burn-in, minus the target.
    pub fn calc_ky_ratio_difference(&self) -> EstimationResult<f64> {
        ky_ratio_difference(
            &self.history.records,
            self.cfg.economy.ignore_periods,
            self.cfg.economy.ky_target,
        )
    }

    /// Distance between the mean simulated Lorenz shares after burn-in and
    /// the target shares.
    pub fn calc_lorenz_distance(&self) -> EstimationResult<f64> {
        lorenz_distance(
            &self.history.records,
            self.cfg.economy.ignore_periods,
            &self.cfg.economy.lorenz_target,
        )
    }

    /// Replace every household type's rules with those of `other`.
    ///
    /// Used to simulate a changed environment with rules that were not
    /// re-optimized for it.
    pub fn adopt_rules_from(&mut self, other: &Economy) -> EstimationResult<()> {
        if other.agents.len() != self.agents.len() {
            return Err(EstimationError::Config(format!(
                "cannot adopt rules from {} household types into {}",
                other.agents.len(),
                self.agents.len()
            )));
        }
        for (agent, source) in self.agents.iter_mut().zip(&other.agents) {
            let solution = source.solution().ok_or_else(|| {
                EstimationError::Config("source economy has not been solved".to_string())
            })?;
            agent.set_solution(solution.clone());
        }
        self.saving_rule = other.saving_rule;
        Ok(())
    }

    /// Save a checkpoint of the entire economy.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize economy")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load a previously saved economy checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let economy = decode::from_read(&mut reader).context("failed to deserialize economy")?;
        Ok(economy)
    }

    /// Save the per-period history to a binary file.
    pub fn save_history<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self.history).context("failed to serialize history")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}

/// Records of the averaging window `[ignore_periods, len)`.
pub fn post_burn_in(
    records: &[AggregateRecord],
    ignore_periods: usize,
) -> EstimationResult<&[AggregateRecord]> {
    if records.len() <= ignore_periods {
        return Err(EstimationError::InsufficientHistory {
            len: records.len(),
            ignore_periods,
        });
    }
    Ok(&records[ignore_periods..])
}

pub fn mean_ky_ratio(records: &[AggregateRecord], ignore_periods: usize) -> EstimationResult<f64> {
    let window = post_burn_in(records, ignore_periods)?;
    Ok(window.iter().map(|rec| rec.ky_ratio).sum::<f64>() / window.len() as f64)
}

pub fn ky_ratio_difference(
    records: &[AggregateRecord],
    ignore_periods: usize,
    ky_target: f64,
) -> EstimationResult<f64> {
    Ok(mean_ky_ratio(records, ignore_periods)? - ky_target)
}

/// Mean wealth Lorenz shares at the target percentiles after burn-in.
pub fn mean_lorenz(
    records: &[AggregateRecord],
    ignore_periods: usize,
) -> EstimationResult<Vec<f64>> {
    let window = post_burn_in(records, ignore_periods)?;
    let mut sum: Vec<f64> = Vec::new();
    for rec in window {
        let shares = rec.lorenz.value("Lorenz shares")?;
        if sum.is_empty() {
            sum = vec![0.0; shares.len()];
        }
        sum.iter_mut().zip(shares).for_each(|(s, x)| *s += x);
    }
    let n = window.len() as f64;
    Ok(sum.into_iter().map(|s| s / n).collect())
}

/// `sqrt(Σ (100 (simulated − target))²)` over the target percentiles.
pub fn lorenz_distance(
    records: &[AggregateRecord],
    ignore_periods: usize,
    target: &[f64],
) -> EstimationResult<f64> {
    let sim = mean_lorenz(records, ignore_periods)?;
    if sim.len() != target.len() {
        return Err(EstimationError::Config(format!(
            "{} simulated Lorenz shares but {} targets",
            sim.len(),
            target.len()
        )));
    }
    Ok(sim
        .iter()
        .zip(target)
        .map(|(s, t)| (100.0 * (s - t)).powi(2))
        .sum::<f64>()
        .sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Computed;
    use crate::config::tests::BASIC_TOML;
    use approx::assert_abs_diff_eq;

    fn record(ky_ratio: f64, lorenz: Computed<Vec<f64>>) -> AggregateRecord {
        AggregateRecord {
            ky_ratio,
            a_lvl_mean: 1.0,
            mpc_mean: 0.1,
            unemp_share: 0.07,
            lorenz,
            many: Computed::NotRequested,
        }
    }

    fn synthetic_history() -> Vec<AggregateRecord> {
        (0..10)
            .map(|t| {
                let x = t as f64;
                record(100.0 * x, Computed::Value(vec![0.01 * x, 0.2 + 0.01 * x]))
            })
            .collect()
    }

    #[test]
    fn burn_in_never_leaks_into_statistics() {
        let records = synthetic_history();
        let ignore = 4;
        let target = [0.05, 0.3];
        assert_eq!(
            ky_ratio_difference(&records, ignore, 300.0).unwrap(),
            ky_ratio_difference(&records[ignore..], 0, 300.0).unwrap()
        );
        assert_eq!(
            lorenz_distance(&records, ignore, &target).unwrap(),
            lorenz_distance(&records[ignore..], 0, &target).unwrap()
        );
        assert_abs_diff_eq!(mean_ky_ratio(&records, ignore).unwrap(), 650.0);
    }

    #[test]
    fn averaging_requires_requested_statistics() {
        let mut records = synthetic_history();
        records[1].lorenz = Computed::NotRequested;
        assert!(mean_lorenz(&records, 2).is_ok());
        records[7].lorenz = Computed::NotRequested;
        assert!(matches!(
            mean_lorenz(&records, 2),
            Err(EstimationError::NotComputed(_))
        ));
        assert!(matches!(
            mean_ky_ratio(&records, 10),
            Err(EstimationError::InsufficientHistory { .. })
        ));
    }

    #[test]
    fn lorenz_distance_scales_by_one_hundred() {
        let records = vec![record(1.0, Computed::Value(vec![0.1, 0.4]))];
        let distance = lorenz_distance(&records, 0, &[0.13, 0.44]).unwrap();
        assert_abs_diff_eq!(distance, 5.0, epsilon = 1e-10);
    }

    #[test]
    fn solve_without_aggregate_shocks_is_single_pass() {
        let cfg = Config::from_toml(BASIC_TOML).unwrap();
        let mut economy = Economy::new(cfg).unwrap();
        economy.distribute_params(0.96, 0.01).unwrap();
        economy.set_flags(StatFlags {
            lorenz: true,
            many_stats: false,
        });
        let outcome = economy.solve().unwrap();
        assert_eq!(
            outcome,
            Convergence::Converged {
                value: None,
                iterations: 1
            }
        );
        assert_eq!(economy.history().records.len(), 60);
        assert!(economy.history().market.is_empty());

        let counts: Vec<usize> = economy.agents().iter().map(AgentType::agent_count).collect();
        assert_eq!(counts, vec![133; 3]);
        let disc_facs: Vec<f64> = economy.agents().iter().map(|a| a.params().disc_fac).collect();
        assert_abs_diff_eq!(disc_facs[0], 0.95, epsilon = 1e-12);
        assert_abs_diff_eq!(disc_facs[2], 0.97, epsilon = 1e-12);

        let ky = economy.calc_ky_ratio_difference().unwrap();
        assert!(ky.is_finite());
        let distance = economy.calc_lorenz_distance().unwrap();
        assert!(distance.is_finite() && distance >= 0.0);

        // Fixed parameters give an identical history.
        let first = economy.history().clone();
        economy.solve().unwrap();
        assert_eq!(&first, economy.history());
    }

    #[test]
    fn parallel_simulation_matches_serial() {
        let mut cfg = Config::from_toml(BASIC_TOML).unwrap();
        let mut serial = Economy::new(cfg.clone()).unwrap();
        cfg.economy.parallel = true;
        let mut parallel = Economy::new(cfg).unwrap();
        for economy in [&mut serial, &mut parallel] {
            economy.distribute_params(0.96, 0.01).unwrap();
            economy.solve().unwrap();
        }
        assert_eq!(serial.history(), parallel.history());
    }

    #[test]
    fn one_aggregate_loop_reports_non_convergence() {
        let toml = format!("{BASIC_TOML}\n[agg_shocks]\nmax_loops = 1\n");
        let cfg = Config::from_toml(&toml).unwrap();
        let mut economy = Economy::new(cfg).unwrap();
        economy.distribute_params(0.96, 0.0).unwrap();
        let outcome = economy.solve().unwrap();
        assert!(matches!(
            outcome,
            Convergence::NonConverged { iterations: 1, .. }
        ));
        assert_eq!(economy.history().market.len(), 60);
        assert!(matches!(
            outcome.into_converged("aggregate saving rule"),
            Err(EstimationError::NonConvergence { iterations: 1, .. })
        ));
    }

    #[test]
    fn aggregate_loop_reaches_a_fixed_point() {
        let toml = format!("{BASIC_TOML}\n[agg_shocks]\n");
        let cfg = Config::from_toml(&toml).unwrap();
        let max_loops = cfg.agg_shocks.as_ref().unwrap().max_loops;
        let mut economy = Economy::new(cfg).unwrap();
        economy.distribute_params(0.96, 0.0).unwrap();
        let outcome = economy.solve().unwrap();
        let Convergence::Converged {
            value: Some(rule),
            iterations,
        } = outcome
        else {
            panic!("aggregate loop did not converge: {outcome:?}");
        };
        assert!(iterations > 1 && iterations <= max_loops);
        assert!(rule.intercept.is_finite() && rule.slope.is_finite());
        assert!(rule.slope > 0.0);
        assert_eq!(economy.history().market.len(), 60);
    }

    #[test]
    fn adopted_rules_survive_parameter_changes() {
        let cfg = Config::from_toml(BASIC_TOML).unwrap();
        let mut base = Economy::new(cfg.clone()).unwrap();
        base.distribute_params(0.96, 0.01).unwrap();
        base.solve_agents().unwrap();

        let mut other = Economy::new(cfg).unwrap();
        other.distribute_params(0.95, 0.01).unwrap();
        other.adopt_rules_from(&base).unwrap();
        for (agent, source) in other.agents().iter().zip(base.agents()) {
            assert_eq!(agent.solution(), source.solution());
        }
        other.make_history().unwrap();
        assert_eq!(other.history().records.len(), 60);
    }
}
