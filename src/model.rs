use crate::error::{EstimationError, EstimationResult};
use crate::market::{AggregateEnvironment, MarketState, mean_one_lognormal};
use crate::params::{HouseholdParams, InitialAge, ParamName, stationary_age_dstn};
use crate::solver::{ConsumptionSolver, Solution};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Bernoulli, weighted::WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cross-section of simulated households of one type, stored column-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub a_nrm: Vec<f64>,
    pub a_lvl: Vec<f64>,
    pub p_lvl: Vec<f64>,
    pub m_nrm: Vec<f64>,
    pub c_nrm: Vec<f64>,
    pub t_age: Vec<usize>,
    pub tran_shk: Vec<f64>,
    pub perm_shk: Vec<f64>,
    pub emp: Vec<bool>,
    pub mpc: Vec<f64>,
    /// Aggregate resources as last observed.
    pub m_agg_seen: Vec<f64>,
    /// Perceived over actual aggregate productivity.
    pub p_agg_gap: Vec<f64>,
}

impl Panel {
    fn new(n_agt: usize, a_init: f64) -> Self {
        Self {
            a_nrm: vec![a_init; n_agt],
            a_lvl: vec![a_init; n_agt],
            p_lvl: vec![1.0; n_agt],
            m_nrm: vec![0.0; n_agt],
            c_nrm: vec![0.0; n_agt],
            t_age: vec![0; n_agt],
            tran_shk: vec![1.0; n_agt],
            perm_shk: vec![1.0; n_agt],
            emp: vec![true; n_agt],
            mpc: vec![0.0; n_agt],
            m_agg_seen: vec![0.0; n_agt],
            p_agg_gap: vec![1.0; n_agt],
        }
    }

    pub fn len(&self) -> usize {
        self.a_nrm.len()
    }
}

/// Panel variables that can be recorded every period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackVar {
    ANrm,
    ALvl,
    PLvl,
    MNrm,
    CNrm,
    TranShk,
    Mpc,
}

impl TrackVar {
    fn column(self, panel: &Panel) -> Vec<f64> {
        match self {
            TrackVar::ANrm => panel.a_nrm.clone(),
            TrackVar::ALvl => panel.a_lvl.clone(),
            TrackVar::PLvl => panel.p_lvl.clone(),
            TrackVar::MNrm => panel.m_nrm.clone(),
            TrackVar::CNrm => panel.c_nrm.clone(),
            TrackVar::TranShk => panel.tran_shk.clone(),
            TrackVar::Mpc => panel.mpc.clone(),
        }
    }
}

/// Homogeneous sub-population sharing one parameter set.
///
/// Owns its decision rules and its simulated panel. Any parameter change
/// discards the rules, so they must be solved again before simulating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentType {
    seed: u64,
    agent_count: usize,
    params: HouseholdParams,
    age_dstn: Vec<f64>,
    solution: Option<Solution>,
    panel: Panel,
    rng: ChaCha12Rng,
    track_vars: Vec<TrackVar>,
    history: BTreeMap<TrackVar, Vec<Vec<f64>>>,
}

impl AgentType {
    pub fn new(seed: u64, agent_count: usize, params: HouseholdParams) -> EstimationResult<Self> {
        params.validate()?;
        let age_dstn = initial_age_dstn(&params);
        Ok(Self {
            seed,
            agent_count,
            params,
            age_dstn,
            solution: None,
            panel: Panel::default(),
            rng: ChaCha12Rng::seed_from_u64(seed),
            track_vars: Vec::new(),
            history: BTreeMap::new(),
        })
    }

    pub fn params(&self) -> &HouseholdParams {
        &self.params
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    pub fn set_agent_count(&mut self, agent_count: usize) {
        self.agent_count = agent_count;
    }

    pub fn set_param(&mut self, name: ParamName, value: f64) {
        name.assign(&mut self.params, value);
        self.age_dstn = initial_age_dstn(&self.params);
        self.solution = None;
    }

    pub fn set_track_vars(&mut self, track_vars: Vec<TrackVar>) {
        self.track_vars = track_vars;
    }

    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    /// Install rules solved elsewhere, keeping the current parameters.
    pub fn set_solution(&mut self, solution: Solution) {
        self.solution = Some(solution);
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn history(&self, var: TrackVar) -> Option<&[Vec<f64>]> {
        self.history.get(&var).map(Vec::as_slice)
    }

    pub fn solve(
        &mut self,
        solver: &dyn ConsumptionSolver,
        env: Option<&AggregateEnvironment>,
    ) -> EstimationResult<()> {
        let solution = solver.solve(&self.params, env)?;
        log::trace!(
            "solved {} rules in {} cycles",
            solution.len(),
            solution.cycles()
        );
        self.solution = Some(solution);
        Ok(())
    }

    /// Reinitialize the panel with assets `a_init` and ages drawn per the
    /// type's initial-age policy.
    ///
    /// The random number generator is reseeded so that repeated runs with
    /// the same parameters produce identical histories.
    pub fn reset_simulation(&mut self, a_init: f64) -> EstimationResult<()> {
        self.rng = ChaCha12Rng::seed_from_u64(self.seed);
        self.panel = Panel::new(self.agent_count, a_init);
        self.history.clear();

        if self.params.initial_age == InitialAge::Stationary && self.age_dstn.len() > 1 {
            let age_dist = WeightedIndex::new(&self.age_dstn).map_err(|err| {
                EstimationError::Config(format!("invalid stationary age distribution: {err}"))
            })?;
            for t_age in self.panel.t_age.iter_mut() {
                *t_age = age_dist.sample(&mut self.rng);
            }
        }
        Ok(())
    }

    /// Advance every household by one period.
    ///
    /// Without a market state, households face their own `rfree` and a
    /// unit wage. With one, a household observes the aggregate state with
    /// probability `update_prb`; otherwise it consumes out of resources
    /// normalized by the aggregate productivity it last saw.
    pub fn advance_one_period(&mut self, market: Option<&MarketState>) -> EstimationResult<()> {
        let solution = self.solution.as_ref().ok_or_else(|| {
            EstimationError::Config("agent type simulated before it was solved".to_string())
        })?;
        let params = &self.params;

        let (rfree, w_rte, gro_fac_agg, perm_agg, tran_agg, m_agg) = match market {
            Some(state) => (
                state.rfree,
                state.w_rte,
                state.gro_fac_agg,
                state.perm_shk,
                state.tran_shk,
                state.m_agg,
            ),
            None => (params.rfree, 1.0, 1.0, 1.0, 1.0, 1.0),
        };
        let sticky = market.is_some() && params.update_prb < 1.0;

        let emp_dist = Bernoulli::new(1.0 - params.unemp_prb).map_err(|err| {
            EstimationError::Config(format!("invalid unemployment probability: {err}"))
        })?;
        let tran_dist = mean_one_lognormal(params.tran_shk_std)?;
        let perm_dist = mean_one_lognormal(params.perm_shk_std)?;
        let employed_scale = (1.0 - params.tax_rate()) * params.ind_l;
        let max_age = params.max_age();

        let panel = &mut self.panel;
        for i_agt in 0..panel.len() {
            // Mortality and replacement by newborns.
            let t_age = panel.t_age[i_agt];
            let dies = match max_age {
                Some(max_age) if t_age >= max_age => true,
                _ if t_age == 0 => false,
                _ => {
                    let liv_prb = params.liv_prb[params.age_index(t_age - 1)];
                    self.rng.random::<f64>() >= liv_prb
                }
            };
            if dies {
                panel.t_age[i_agt] = 0;
                panel.a_nrm[i_agt] = 0.0;
                panel.p_lvl[i_agt] = 1.0;
            }
            let t_age = panel.t_age[i_agt];

            // Idiosyncratic shocks; newborns draw none.
            let (emp, tran_shk, perm_shk) = if t_age == 0 {
                (true, 1.0, 1.0)
            } else if emp_dist.sample(&mut self.rng) {
                let tran_shk = tran_dist.sample(&mut self.rng) * employed_scale;
                (true, tran_shk, perm_dist.sample(&mut self.rng))
            } else {
                (false, params.inc_unemp, perm_dist.sample(&mut self.rng))
            };

            let gro_fac = if t_age == 0 {
                1.0
            } else {
                params.perm_gro_fac[params.age_index(t_age - 1)] * perm_shk
            };
            panel.p_lvl[i_agt] *= gro_fac;

            let m_nrm = panel.a_nrm[i_agt] * rfree / (gro_fac * gro_fac_agg)
                + tran_shk * w_rte * tran_agg;

            let observes = !sticky
                || t_age == 0
                || !(panel.m_agg_seen[i_agt] > 0.0)
                || self.rng.random::<f64>() < params.update_prb;
            if observes {
                panel.m_agg_seen[i_agt] = m_agg;
                panel.p_agg_gap[i_agt] = 1.0;
            } else {
                // Aggregate growth is believed to equal its mean.
                panel.p_agg_gap[i_agt] /= perm_agg;
            }
            let gap = panel.p_agg_gap[i_agt];

            let (c_seen, mpc) = solution
                .rule(t_age)
                .consume(m_nrm / gap, panel.m_agg_seen[i_agt]);
            let c_nrm = c_seen * gap;
            let a_nrm = m_nrm - c_nrm;

            panel.m_nrm[i_agt] = m_nrm;
            panel.c_nrm[i_agt] = c_nrm;
            panel.a_nrm[i_agt] = a_nrm;
            panel.a_lvl[i_agt] = a_nrm * panel.p_lvl[i_agt];
            panel.tran_shk[i_agt] = tran_shk;
            panel.perm_shk[i_agt] = perm_shk;
            panel.emp[i_agt] = emp;
            panel.mpc[i_agt] = mpc;
            panel.t_age[i_agt] = t_age + 1;
        }

        for &var in &self.track_vars {
            self.history
                .entry(var)
                .or_default()
                .push(var.column(&self.panel));
        }
        Ok(())
    }
}

/// Age distribution households are drawn from on reset.
///
/// Perpetual-youth types without a maximum age start as newborns.
fn initial_age_dstn(params: &HouseholdParams) -> Vec<f64> {
    if params.lifecycle {
        let mut dstn = stationary_age_dstn(&params.liv_prb, true);
        if let Some(max_age) = params.max_age() {
            dstn.truncate(max_age.max(1));
            let total: f64 = dstn.iter().sum();
            dstn.iter_mut().for_each(|m| *m /= total);
        }
        return dstn;
    }
    match params.t_age {
        Some(t_age) => stationary_age_dstn(&vec![params.liv_prb[0]; t_age - 1], true),
        None => vec![1.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::perpetual_youth;
    use crate::solver::BufferStockSolver;
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
    fn one_period_reproduces_closed_form_assets() {
        let params = two_period_type();
        let mut agent = AgentType::new(7, 5, params.clone()).unwrap();
        agent.solve(&BufferStockSolver::default(), None).unwrap();
        agent.reset_simulation(0.0).unwrap();
        agent.advance_one_period(None).unwrap();

        let phi = (params.rfree * params.disc_fac).sqrt() / params.rfree;
        let c = (1.0 + 0.9 / 1.02) / (1.0 + phi);
        for (&a_nrm, &t_age) in agent.panel().a_nrm.iter().zip(&agent.panel().t_age) {
            assert_relative_eq!(a_nrm, 1.0 - c, max_relative = 1e-10);
            assert_eq!(t_age, 1);
        }
    }

    #[test]
    fn terminal_age_consumes_everything_then_dies() {
        let mut agent = AgentType::new(7, 3, two_period_type()).unwrap();
        agent.solve(&BufferStockSolver::default(), None).unwrap();
        agent.reset_simulation(0.0).unwrap();
        agent.advance_one_period(None).unwrap();
        agent.advance_one_period(None).unwrap();
        assert!(agent.panel().a_nrm.iter().all(|&a| a == 0.0));
        assert!(agent.panel().mpc.iter().all(|&mpc| mpc == 1.0));

        // Past the last age everyone is replaced by a newborn.
        agent.advance_one_period(None).unwrap();
        assert!(agent.panel().t_age.iter().all(|&t| t == 1));
    }

    #[test]
    fn unsolved_type_cannot_be_simulated() {
        let mut agent = AgentType::new(1, 4, perpetual_youth()).unwrap();
        agent.reset_simulation(0.0).unwrap();
        assert!(agent.advance_one_period(None).is_err());

        agent.solve(&BufferStockSolver::default(), None).unwrap();
        agent.set_param(ParamName::DiscFac, 0.95);
        assert!(agent.solution().is_none());
    }

    #[test]
    fn reset_makes_simulation_reproducible() {
        let mut agent = AgentType::new(11, 50, perpetual_youth()).unwrap();
        agent.set_track_vars(vec![TrackVar::ALvl]);
        agent.solve(&BufferStockSolver::default(), None).unwrap();

        let run = |agent: &mut AgentType| {
            agent.reset_simulation(0.0).unwrap();
            for _ in 0..10 {
                agent.advance_one_period(None).unwrap();
            }
            agent.panel().clone()
        };
        let first = run(&mut agent);
        let second = run(&mut agent);
        assert_eq!(first, second);
        assert_eq!(agent.history(TrackVar::ALvl).map(<[_]>::len), Some(10));
        assert!(first.a_nrm.iter().all(|&a| a >= 0.0));
    }

    #[test]
    fn market_growth_deflates_carried_assets() {
        let mut params = perpetual_youth();
        params.initial_age = InitialAge::Newborn;
        let mut agent = AgentType::new(5, 4, params).unwrap();
        agent.solve(&BufferStockSolver::default(), None).unwrap();
        agent.reset_simulation(2.0).unwrap();

        let state = MarketState {
            m_agg: 30.0,
            a_agg: 2.0,
            k_to_l: 2.0,
            k_to_y: 1.0,
            rfree: 1.03,
            w_rte: 1.2,
            perm_shk: 1.0,
            tran_shk: 1.0,
            gro_fac_agg: 1.01,
        };
        agent.advance_one_period(Some(&state)).unwrap();
        for &m_nrm in &agent.panel().m_nrm {
            assert_relative_eq!(m_nrm, 2.0 * 1.03 / 1.01 + 1.2, max_relative = 1e-12);
        }
    }

    #[test]
    fn inattentive_households_keep_their_last_observation() {
        let state = |m_agg: f64, perm_shk: f64| MarketState {
            m_agg,
            a_agg: 2.0,
            k_to_l: 2.0,
            k_to_y: 1.0,
            rfree: 1.01,
            w_rte: 1.0,
            perm_shk,
            tran_shk: 1.0,
            gro_fac_agg: perm_shk,
        };
        let run = |update_prb: f64| {
            let mut params = perpetual_youth();
            params.initial_age = InitialAge::Newborn;
            params.update_prb = update_prb;
            let mut agent = AgentType::new(9, 50, params).unwrap();
            agent.solve(&BufferStockSolver::default(), None).unwrap();
            agent.reset_simulation(0.0).unwrap();
            agent.advance_one_period(Some(&state(10.0, 1.0))).unwrap();
            agent.advance_one_period(Some(&state(12.0, 1.05))).unwrap();
            agent.panel().clone()
        };

        let sticky = run(0.0);
        let survivors: Vec<usize> = (0..sticky.len()).filter(|&i| sticky.t_age[i] == 2).collect();
        assert!(!survivors.is_empty());
        for &i in &survivors {
            assert_eq!(sticky.m_agg_seen[i], 10.0);
            assert_relative_eq!(sticky.p_agg_gap[i], 1.0 / 1.05, max_relative = 1e-12);
            assert!(sticky.c_nrm[i] <= sticky.m_nrm[i]);
        }

        let attentive = run(1.0);
        assert!(attentive.m_agg_seen.iter().all(|&m| m == 12.0));
        assert!(attentive.p_agg_gap.iter().all(|&gap| gap == 1.0));
    }

    #[test]
    fn stationary_ages_respect_maximum_age() {
        let mut params = perpetual_youth();
        params.t_age = Some(40);
        let mut agent = AgentType::new(3, 200, params).unwrap();
        agent.reset_simulation(0.0).unwrap();
        assert!(agent.panel().t_age.iter().all(|&t| t < 40));
        assert!(agent.panel().t_age.iter().any(|&t| t > 0));
    }
}
