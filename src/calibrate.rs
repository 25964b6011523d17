//! Nested calibration of the heterogeneous preference parameter.
//!
//! The inner search finds, for a given spread, the center that makes the
//! simulated capital-to-income ratio hit its target. The outer search picks
//! the spread whose implied economy best matches the wealth Lorenz target.

use crate::config::{CalibrationMode, Config};
use crate::engine::Economy;
use crate::error::{EstimationError, EstimationResult};
use crate::params::ParamName;
use argmin::core::{CostFunction, Executor, State, TerminationReason};
use argmin::solver::brent::BrentRoot;
use argmin::solver::goldensectionsearch::GoldenSectionSearch;
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, collections::HashMap};

/// What the calibration loop needs from a simulated economy.
pub trait CalibrationTarget {
    /// Distribute the heterogeneous parameter with the given center and spread.
    fn set_heterogeneity(&mut self, center: f64, spread: f64) -> EstimationResult<()>;

    fn set_lorenz_flag(&mut self, on: bool);

    /// Solve and simulate; non-convergence of any inner loop is an error.
    fn run(&mut self) -> EstimationResult<()>;

    fn ky_ratio_difference(&self) -> EstimationResult<f64>;

    fn lorenz_distance(&self) -> EstimationResult<f64>;
}

impl CalibrationTarget for Economy {
    fn set_heterogeneity(&mut self, center: f64, spread: f64) -> EstimationResult<()> {
        self.distribute_params(center, spread)
    }

    fn set_lorenz_flag(&mut self, on: bool) {
        let mut flags = self.flags();
        flags.lorenz = on;
        self.set_flags(flags);
    }

    fn run(&mut self) -> EstimationResult<()> {
        self.solve()?.into_converged("aggregate saving rule")?;
        Ok(())
    }

    fn ky_ratio_difference(&self) -> EstimationResult<f64> {
        self.calc_ky_ratio_difference()
    }

    fn lorenz_distance(&self) -> EstimationResult<f64> {
        self.calc_lorenz_distance()
    }
}

/// Brackets and tolerances of both searches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub mode: CalibrationMode,
    pub center_bracket: [f64; 2],
    pub spread_bracket: [f64; 2],
    pub center_tol: f64,
    pub spread_tol: f64,
    pub max_iters: u64,
}

impl CalibrationSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            mode: cfg.heterogeneity.mode,
            center_bracket: cfg.heterogeneity.center_bracket,
            spread_bracket: cfg.heterogeneity.spread_bracket,
            center_tol: cfg.calibration.center_tol,
            spread_tol: cfg.calibration.spread_tol,
            max_iters: cfg.calibration.max_iters,
        }
    }
}

/// One evaluation of the outer objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub spread: f64,
    pub center: f64,
    pub lorenz_distance: f64,
}

/// Calibrated center and spread with the Lorenz distance they achieve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub center: f64,
    pub spread: f64,
    pub lorenz_distance: f64,
}

/// Runs the nested search against a [`CalibrationTarget`] it owns.
pub struct Calibrator<T> {
    target: T,
    settings: CalibrationSettings,
    ky_cache: HashMap<(u64, u64), f64>,
    trials: Vec<Trial>,
}

impl<T: CalibrationTarget> Calibrator<T> {
    pub fn new(target: T, settings: CalibrationSettings) -> Self {
        Self {
            target,
            settings,
            ky_cache: HashMap::new(),
            trials: Vec::new(),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    /// Outer-objective evaluations so far, in call order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Run the configured calibration mode.
    ///
    /// On success the target is left solved and simulated at the estimate
    /// with Lorenz statistics enabled.
    pub fn calibrate(&mut self) -> EstimationResult<Estimate> {
        let estimate = match self.settings.mode {
            CalibrationMode::Point => {
                let trial = self.lorenz_distance_at(0.0)?;
                Estimate {
                    center: trial.center,
                    spread: 0.0,
                    lorenz_distance: trial.lorenz_distance,
                }
            }
            CalibrationMode::Dist => self.solve_for_spread()?,
        };
        log::info!(
            "estimate: center = {:.6}, spread = {:.6}, Lorenz distance = {:.6}",
            estimate.center,
            estimate.spread,
            estimate.lorenz_distance
        );
        Ok(estimate)
    }

    /// Center at which the capital-to-income ratio hits its target for `spread`.
    pub fn solve_for_center(&mut self, spread: f64) -> EstimationResult<f64> {
        let [lo, hi] = self.settings.center_bracket;
        let f_lo = self.ky_gap(lo, spread)?;
        if f_lo == 0.0 {
            return Ok(lo);
        }
        let f_hi = self.ky_gap(hi, spread)?;
        if f_hi == 0.0 {
            return Ok(hi);
        }
        if f_lo.signum() == f_hi.signum() {
            return Err(EstimationError::BracketSign { lo, hi, f_lo, f_hi });
        }

        let max_iters = self.settings.max_iters;
        let solver = BrentRoot::new(lo, hi, self.settings.center_tol);
        let problem = KyGap {
            calibrator: RefCell::new(&mut *self),
            spread,
        };
        let result = Executor::new(problem, solver)
            .configure(|state| state.max_iters(max_iters))
            .run()
            .map_err(search_error)?;
        let state = result.state();
        if let Some(TerminationReason::MaxItersReached) = state.get_termination_reason() {
            return Err(EstimationError::NonConvergence {
                process: "capital-to-income root search",
                iterations: state.get_iter() as usize,
                distance: state.get_cost(),
            });
        }
        let center = state
            .get_param()
            .copied()
            .ok_or_else(|| EstimationError::Search("root search returned no point".to_string()))?;
        log::debug!("spread {spread:.6}: center = {center:.8}");
        Ok(center)
    }

    /// Lorenz distance of the economy calibrated to the capital target at `spread`.
    pub fn lorenz_distance_at(&mut self, spread: f64) -> EstimationResult<Trial> {
        let center = self.solve_for_center(spread)?;
        let lorenz_distance =
            self.evaluate(center, spread, true, |target| target.lorenz_distance())?;
        let trial = Trial {
            spread,
            center,
            lorenz_distance,
        };
        log::info!(
            "spread = {spread:.6}, center = {center:.6}, Lorenz distance = {lorenz_distance:.6}"
        );
        self.trials.push(trial);
        Ok(trial)
    }

    /// Spread minimizing the Lorenz distance, with the center it implies.
    pub fn solve_for_spread(&mut self) -> EstimationResult<Estimate> {
        let [lo, hi] = self.settings.spread_bracket;
        let max_iters = self.settings.max_iters;
        let solver = GoldenSectionSearch::new(lo, hi)
            .and_then(|gss| gss.with_tolerance(self.settings.spread_tol))
            .map_err(search_error)?;
        let spread = {
            let problem = LorenzGap {
                calibrator: RefCell::new(&mut *self),
            };
            let result = Executor::new(problem, solver)
                .configure(|state| state.param(0.5 * (lo + hi)).max_iters(max_iters))
                .run()
                .map_err(search_error)?;
            let state = result.state();
            if let Some(TerminationReason::MaxItersReached) = state.get_termination_reason() {
                return Err(EstimationError::NonConvergence {
                    process: "Lorenz distance minimization",
                    iterations: state.get_iter() as usize,
                    distance: state.get_best_cost(),
                });
            }
            state.get_best_param().copied().ok_or_else(|| {
                EstimationError::Search("minimization returned no point".to_string())
            })?
        };

        // Leave the target at the estimate; the capital gaps are cached.
        let trial = self.lorenz_distance_at(spread)?;
        Ok(Estimate {
            center: trial.center,
            spread,
            lorenz_distance: trial.lorenz_distance,
        })
    }

    fn ky_gap(&mut self, center: f64, spread: f64) -> EstimationResult<f64> {
        let key = (center.to_bits(), spread.to_bits());
        if let Some(&gap) = self.ky_cache.get(&key) {
            return Ok(gap);
        }
        let gap = self.evaluate(center, spread, false, |target| target.ky_ratio_difference())?;
        log::debug!("center = {center:.8}, spread = {spread:.6}: K/Y gap = {gap:.6}");
        self.ky_cache.insert(key, gap);
        Ok(gap)
    }

    fn evaluate<F>(
        &mut self,
        center: f64,
        spread: f64,
        lorenz: bool,
        stat: F,
    ) -> EstimationResult<f64>
    where
        F: FnOnce(&T) -> EstimationResult<f64>,
    {
        self.simulate_at(center, spread, lorenz)
            .and_then(|()| stat(&self.target))
            .map_err(|source| EstimationError::TrialFailed {
                center,
                spread,
                source: Box::new(source),
            })
    }

    fn simulate_at(&mut self, center: f64, spread: f64, lorenz: bool) -> EstimationResult<()> {
        self.target.set_heterogeneity(center, spread)?;
        self.target.set_lorenz_flag(lorenz);
        self.target.run()
    }
}

struct KyGap<'c, T> {
    calibrator: RefCell<&'c mut Calibrator<T>>,
    spread: f64,
}

impl<T: CalibrationTarget> CostFunction for KyGap<'_, T> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, center: &f64) -> Result<f64, argmin::core::Error> {
        Ok(self.calibrator.borrow_mut().ky_gap(*center, self.spread)?)
    }
}

struct LorenzGap<'c, T> {
    calibrator: RefCell<&'c mut Calibrator<T>>,
}

impl<T: CalibrationTarget> CostFunction for LorenzGap<'_, T> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, spread: &f64) -> Result<f64, argmin::core::Error> {
        let trial = self.calibrator.borrow_mut().lorenz_distance_at(*spread)?;
        Ok(trial.lorenz_distance)
    }
}

/// Recover an objective's own error from the solver, if that is what failed.
fn search_error(err: argmin::core::Error) -> EstimationError {
    match err.downcast::<EstimationError>() {
        Ok(err) => err,
        Err(err) => EstimationError::Search(err.to_string()),
    }
}

/// Estimate together with the parameters it was obtained under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub param: ParamName,
    pub center: f64,
    pub spread: f64,
    pub lorenz_distance: f64,
    pub perm_gro_fac: f64,
    pub t_age: Option<usize>,
    pub rfree: f64,
    pub crra: f64,
    pub trials: Vec<Trial>,
}

impl CalibrationResult {
    pub fn new(estimate: Estimate, trials: Vec<Trial>, cfg: &Config) -> EstimationResult<Self> {
        let base = cfg
            .types
            .first()
            .map(|ty| &ty.household)
            .ok_or_else(|| EstimationError::Config("no household types".to_string()))?;
        Ok(Self {
            param: cfg.heterogeneity.param,
            center: estimate.center,
            spread: estimate.spread,
            lorenz_distance: estimate.lorenz_distance,
            perm_gro_fac: base.perm_gro_fac[0],
            t_age: base.t_age,
            rfree: base.rfree,
            crra: base.crra,
            trials,
        })
    }

    pub fn estimate(&self) -> Estimate {
        Estimate {
            center: self.center,
            spread: self.spread,
            lorenz_distance: self.lorenz_distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Capital gap `center - (0.5 + spread)`; Lorenz distance minimized at
    /// `spread = 0.3` along the capital-matching curve.
    #[derive(Default)]
    struct Synthetic {
        center: f64,
        spread: f64,
        lorenz: bool,
        runs: usize,
        ky_offset: f64,
        fail_above: Option<f64>,
    }

    impl CalibrationTarget for Synthetic {
        fn set_heterogeneity(&mut self, center: f64, spread: f64) -> EstimationResult<()> {
            self.center = center;
            self.spread = spread;
            Ok(())
        }

        fn set_lorenz_flag(&mut self, on: bool) {
            self.lorenz = on;
        }

        fn run(&mut self) -> EstimationResult<()> {
            self.runs += 1;
            match self.fail_above {
                Some(limit) if self.center > limit => Err(EstimationError::NonConvergence {
                    process: "aggregate saving rule",
                    iterations: 20,
                    distance: 0.1,
                }),
                _ => Ok(()),
            }
        }

        fn ky_ratio_difference(&self) -> EstimationResult<f64> {
            Ok(self.center - (0.5 + self.spread) + self.ky_offset)
        }

        fn lorenz_distance(&self) -> EstimationResult<f64> {
            if !self.lorenz {
                return Err(EstimationError::NotComputed("Lorenz shares"));
            }
            Ok((self.spread - 0.3).powi(2) + (self.center - 0.8).powi(2))
        }
    }

    fn settings(mode: CalibrationMode) -> CalibrationSettings {
        CalibrationSettings {
            mode,
            center_bracket: [0.0, 2.0],
            spread_bracket: [0.1, 0.6],
            center_tol: 1e-10,
            spread_tol: 1e-5,
            max_iters: 200,
        }
    }

    #[test]
    fn dist_mode_recovers_known_optimum() {
        let mut calibrator = Calibrator::new(Synthetic::default(), settings(CalibrationMode::Dist));
        let estimate = calibrator.calibrate().unwrap();
        assert_abs_diff_eq!(estimate.spread, 0.3, epsilon = 1e-3);
        assert_abs_diff_eq!(estimate.center, 0.5 + estimate.spread, epsilon = 1e-8);
        assert!(estimate.lorenz_distance < 1e-5);
        assert!(calibrator.trials().len() > 3);

        // The target is left at the estimate.
        let target = calibrator.target();
        assert_eq!((target.center, target.spread), (estimate.center, estimate.spread));
        assert!(target.lorenz);
    }

    #[test]
    fn calibration_is_deterministic() {
        let run = || {
            let mut calibrator =
                Calibrator::new(Synthetic::default(), settings(CalibrationMode::Dist));
            calibrator.calibrate().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn point_mode_matches_capital_only() {
        let mut calibrator =
            Calibrator::new(Synthetic::default(), settings(CalibrationMode::Point));
        let estimate = calibrator.calibrate().unwrap();
        assert_eq!(estimate.spread, 0.0);
        assert_abs_diff_eq!(estimate.center, 0.5, epsilon = 1e-8);
        assert_abs_diff_eq!(estimate.lorenz_distance, 0.09 + 0.09, epsilon = 1e-6);
    }

    #[test]
    fn repeated_centers_are_not_resimulated() {
        let mut calibrator =
            Calibrator::new(Synthetic::default(), settings(CalibrationMode::Point));
        calibrator.solve_for_center(0.0).unwrap();
        let runs = calibrator.target().runs;
        calibrator.solve_for_center(0.0).unwrap();
        assert_eq!(calibrator.target().runs, runs);
    }

    #[test]
    fn unbracketed_root_is_reported() {
        let target = Synthetic {
            ky_offset: 10.0,
            ..Synthetic::default()
        };
        let mut calibrator = Calibrator::new(target, settings(CalibrationMode::Point));
        let err = calibrator.calibrate().unwrap_err();
        assert!(matches!(
            err,
            EstimationError::BracketSign { lo: 0.0, hi: 2.0, .. }
        ));
    }

    #[test]
    fn failed_trial_carries_its_point_and_cause() {
        let target = Synthetic {
            fail_above: Some(1.5),
            ..Synthetic::default()
        };
        let mut calibrator = Calibrator::new(target, settings(CalibrationMode::Point));
        let err = calibrator.calibrate().unwrap_err();
        match &err {
            EstimationError::TrialFailed { center, spread, .. } => {
                assert_eq!((*center, *spread), (2.0, 0.0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            err.root_cause(),
            EstimationError::NonConvergence { iterations: 20, .. }
        ));
    }
}
