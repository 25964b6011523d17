//! Time averages of a simulated history after burn-in.

use crate::aggregate::{AggregateRecord, ManyStats, RANK_BINS, StatFlags};
use crate::engine::post_burn_in;
use crate::error::{EstimationError, EstimationResult};
use crate::stats::{Accumulator, VecAccumulator, gini_from_lorenz, percentile_grid};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufWriter, path::Path};

pub trait Obs {
    fn update(&mut self, record: &AggregateRecord) -> EstimationResult<()>;
    fn report(&self) -> EstimationResult<serde_json::Value>;
}

/// Mean and standard deviation over periods of one scalar aggregate.
pub struct ScalarObs {
    name: &'static str,
    get: fn(&AggregateRecord) -> f64,
    acc: Accumulator,
}

impl ScalarObs {
    pub fn new(name: &'static str, get: fn(&AggregateRecord) -> f64) -> Self {
        Self {
            name,
            get,
            acc: Accumulator::new(),
        }
    }
}

impl Obs for ScalarObs {
    fn update(&mut self, record: &AggregateRecord) -> EstimationResult<()> {
        self.acc.add((self.get)(record));
        Ok(())
    }

    fn report(&self) -> EstimationResult<serde_json::Value> {
        Ok(serde_json::json!({ self.name: self.acc.report() }))
    }
}

/// Mean Lorenz shares at the target percentiles.
pub struct LorenzObs {
    acc: Option<VecAccumulator>,
}

impl LorenzObs {
    pub fn new() -> Self {
        Self { acc: None }
    }
}

impl Obs for LorenzObs {
    fn update(&mut self, record: &AggregateRecord) -> EstimationResult<()> {
        let shares = record.lorenz.value("Lorenz shares")?;
        self.acc
            .get_or_insert_with(|| VecAccumulator::new(shares.len()))
            .add(shares)
    }

    fn report(&self) -> EstimationResult<serde_json::Value> {
        let acc = self
            .acc
            .as_ref()
            .ok_or(EstimationError::NotComputed("Lorenz shares"))?;
        Ok(serde_json::json!({ "lorenz_shares": acc.means() }))
    }
}

/// Share of wealth held by the top and bottom of the distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopShares {
    pub top_1: f64,
    pub top_5: f64,
    pub top_10: f64,
    pub bottom_40: f64,
}

impl TopShares {
    /// Read off a Lorenz curve on the grid `0, 0.01, ..., 1`.
    fn from_lorenz(lorenz: &[f64]) -> Self {
        Self {
            top_1: 1.0 - lorenz[99],
            top_5: 1.0 - lorenz[95],
            top_10: 1.0 - lorenz[90],
            bottom_40: lorenz[40],
        }
    }
}

/// Distance of group-average wealth from the median, relative to the median.
///
/// For the top groups this is `(average - median) / median`; for the bottom
/// 40 % it is `(median - average) / median`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MedianDeviations {
    pub top_1: f64,
    pub top_5: f64,
    pub top_10: f64,
    pub bottom_40: f64,
}

impl MedianDeviations {
    fn new(shares: &TopShares, mean: f64, median: f64) -> EstimationResult<Self> {
        if !(median > 0.0) {
            return Err(EstimationError::DegenerateAggregation(format!(
                "median wealth is {median}"
            )));
        }
        let above = |share: f64, frac: f64| (share * mean / frac - median) / median;
        Ok(Self {
            top_1: above(shares.top_1, 0.01),
            top_5: above(shares.top_5, 0.05),
            top_10: above(shares.top_10, 0.1),
            bottom_40: (median - shares.bottom_40 * mean / 0.4) / median,
        })
    }
}

/// Inequality statistics averaged over the post-burn-in window.
///
/// Two Gini definitions are kept apart: the Gini of the time-averaged Lorenz
/// curve and the time average of each period's Gini.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManyStatsSummary {
    pub n_periods: usize,
    /// Mean Lorenz curves on `0, 0.01, ..., 1`.
    pub lorenz_lvl: Vec<f64>,
    pub lorenz_nrm: Vec<f64>,
    pub lorenz_inc: Vec<f64>,
    pub gini_of_mean_lorenz_lvl: f64,
    pub gini_of_mean_lorenz_nrm: f64,
    pub gini_of_mean_lorenz_inc: f64,
    pub mean_gini_lvl: f64,
    pub mean_gini_nrm: f64,
    pub mean_gini_inc: f64,
    pub mean_lvl: f64,
    /// Cohort-weighted median, averaged over periods.
    pub median_lvl: f64,
    pub mean_nrm: f64,
    pub median_nrm: f64,
    /// Time average of each period's ratio of cohort-weighted mean to
    /// cohort-weighted median.
    pub mean_to_median_lvl: f64,
    pub mean_to_median_nrm: f64,
    pub percentiles_lvl: Vec<f64>,
    pub percentiles_nrm: Vec<f64>,
    pub top_shares_lvl: TopShares,
    pub top_shares_nrm: TopShares,
    pub median_deviations_lvl: MedianDeviations,
    /// Mean heterogeneous parameter and age by wealth and income quintile.
    pub param_by_wealth: Vec<f64>,
    pub age_by_wealth: Vec<f64>,
    pub param_by_inc: Vec<f64>,
    pub age_by_inc: Vec<f64>,
}

pub struct ManyStatsObs {
    n_periods: usize,
    lorenz_lvl: VecAccumulator,
    lorenz_nrm: VecAccumulator,
    lorenz_inc: VecAccumulator,
    gini_lvl: Accumulator,
    gini_nrm: Accumulator,
    gini_inc: Accumulator,
    mean_lvl: Accumulator,
    median_lvl: Accumulator,
    mean_nrm: Accumulator,
    median_nrm: Accumulator,
    mean_to_median_lvl: Accumulator,
    mean_to_median_nrm: Accumulator,
    percentiles_lvl: VecAccumulator,
    percentiles_nrm: VecAccumulator,
    param_by_wealth: VecAccumulator,
    age_by_wealth: VecAccumulator,
    param_by_inc: VecAccumulator,
    age_by_inc: VecAccumulator,
}

impl ManyStatsObs {
    pub fn new() -> Self {
        let n_grid = percentile_grid().len();
        Self {
            n_periods: 0,
            lorenz_lvl: VecAccumulator::new(n_grid),
            lorenz_nrm: VecAccumulator::new(n_grid),
            lorenz_inc: VecAccumulator::new(n_grid),
            gini_lvl: Accumulator::new(),
            gini_nrm: Accumulator::new(),
            gini_inc: Accumulator::new(),
            mean_lvl: Accumulator::new(),
            median_lvl: Accumulator::new(),
            mean_nrm: Accumulator::new(),
            median_nrm: Accumulator::new(),
            mean_to_median_lvl: Accumulator::new(),
            mean_to_median_nrm: Accumulator::new(),
            percentiles_lvl: VecAccumulator::new(n_grid),
            percentiles_nrm: VecAccumulator::new(n_grid),
            param_by_wealth: VecAccumulator::new(RANK_BINS),
            age_by_wealth: VecAccumulator::new(RANK_BINS),
            param_by_inc: VecAccumulator::new(RANK_BINS),
            age_by_inc: VecAccumulator::new(RANK_BINS),
        }
    }

    fn add(&mut self, stats: &ManyStats) -> EstimationResult<()> {
        self.lorenz_lvl.add(&stats.lorenz_long_lvl)?;
        self.lorenz_nrm.add(&stats.lorenz_long_nrm)?;
        self.lorenz_inc.add(&stats.lorenz_long_inc)?;
        self.gini_lvl.add(stats.gini_lvl);
        self.gini_nrm.add(stats.gini_nrm);
        self.gini_inc.add(stats.gini_inc);
        self.mean_lvl.add(stats.mean_lvl);
        self.median_lvl.add(stats.median_lvl);
        self.mean_nrm.add(stats.mean_nrm);
        self.median_nrm.add(stats.median_nrm);
        self.mean_to_median_lvl.add(stats.mean_lvl / stats.median_lvl);
        self.mean_to_median_nrm.add(stats.mean_nrm / stats.median_nrm);
        self.percentiles_lvl.add(&stats.percentiles_lvl)?;
        self.percentiles_nrm.add(&stats.percentiles_nrm)?;
        self.param_by_wealth.add(&stats.param_by_wealth)?;
        self.age_by_wealth.add(&stats.age_by_wealth)?;
        self.param_by_inc.add(&stats.param_by_inc)?;
        self.age_by_inc.add(&stats.age_by_inc)?;
        self.n_periods += 1;
        Ok(())
    }

    pub fn summary(&self) -> EstimationResult<ManyStatsSummary> {
        if self.n_periods == 0 {
            return Err(EstimationError::NotComputed("many statistics"));
        }
        let padded = |acc: &VecAccumulator| {
            let mut curve = Vec::with_capacity(101);
            curve.push(0.0);
            curve.extend(acc.means());
            curve.push(1.0);
            curve
        };
        let mean = |acc: &Accumulator| acc.report().mean;

        let lorenz_lvl = padded(&self.lorenz_lvl);
        let lorenz_nrm = padded(&self.lorenz_nrm);
        let lorenz_inc = padded(&self.lorenz_inc);
        let top_shares_lvl = TopShares::from_lorenz(&lorenz_lvl);
        let top_shares_nrm = TopShares::from_lorenz(&lorenz_nrm);
        let (mean_lvl, median_lvl) = (mean(&self.mean_lvl), mean(&self.median_lvl));

        Ok(ManyStatsSummary {
            n_periods: self.n_periods,
            gini_of_mean_lorenz_lvl: gini_from_lorenz(&lorenz_lvl)?,
            gini_of_mean_lorenz_nrm: gini_from_lorenz(&lorenz_nrm)?,
            gini_of_mean_lorenz_inc: gini_from_lorenz(&lorenz_inc)?,
            mean_gini_lvl: mean(&self.gini_lvl),
            mean_gini_nrm: mean(&self.gini_nrm),
            mean_gini_inc: mean(&self.gini_inc),
            mean_lvl,
            median_lvl,
            mean_nrm: mean(&self.mean_nrm),
            median_nrm: mean(&self.median_nrm),
            mean_to_median_lvl: mean(&self.mean_to_median_lvl),
            mean_to_median_nrm: mean(&self.mean_to_median_nrm),
            percentiles_lvl: self.percentiles_lvl.means(),
            percentiles_nrm: self.percentiles_nrm.means(),
            median_deviations_lvl: MedianDeviations::new(&top_shares_lvl, mean_lvl, median_lvl)?,
            top_shares_lvl,
            top_shares_nrm,
            param_by_wealth: self.param_by_wealth.means(),
            age_by_wealth: self.age_by_wealth.means(),
            param_by_inc: self.param_by_inc.means(),
            age_by_inc: self.age_by_inc.means(),
            lorenz_lvl,
            lorenz_nrm,
            lorenz_inc,
        })
    }
}

impl Obs for ManyStatsObs {
    fn update(&mut self, record: &AggregateRecord) -> EstimationResult<()> {
        self.add(record.many.value("many statistics")?)
    }

    fn report(&self) -> EstimationResult<serde_json::Value> {
        let summary = self.summary()?;
        Ok(serde_json::json!({ "many_stats": summary }))
    }
}

/// Summarize the post-burn-in window of `records`.
pub fn summarize_many_stats(
    records: &[AggregateRecord],
    ignore_periods: usize,
) -> EstimationResult<ManyStatsSummary> {
    let mut obs = ManyStatsObs::new();
    for record in post_burn_in(records, ignore_periods)? {
        obs.update(record)?;
    }
    obs.summary()
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    /// Observables for the statistics enabled in `flags`.
    pub fn new(flags: StatFlags) -> Self {
        let mut obs_ptr_vec: Vec<Box<dyn Obs>> = Vec::new();
        obs_ptr_vec.push(Box::new(ScalarObs::new("ky_ratio", |rec| rec.ky_ratio)));
        obs_ptr_vec.push(Box::new(ScalarObs::new("a_lvl_mean", |rec| rec.a_lvl_mean)));
        obs_ptr_vec.push(Box::new(ScalarObs::new("mpc_mean", |rec| rec.mpc_mean)));
        obs_ptr_vec.push(Box::new(ScalarObs::new("unemp_share", |rec| rec.unemp_share)));
        if flags.lorenz {
            obs_ptr_vec.push(Box::new(LorenzObs::new()));
        }
        if flags.many_stats {
            obs_ptr_vec.push(Box::new(ManyStatsObs::new()));
        }
        Self { obs_ptr_vec }
    }

    pub fn add_records(
        &mut self,
        records: &[AggregateRecord],
        ignore_periods: usize,
    ) -> EstimationResult<()> {
        for record in post_burn_in(records, ignore_periods)? {
            for obs in &mut self.obs_ptr_vec {
                obs.update(record)?;
            }
        }
        Ok(())
    }

    pub fn reports(&self) -> EstimationResult<Vec<serde_json::Value>> {
        self.obs_ptr_vec.iter().map(|obs| obs.report()).collect()
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        let reports = self.reports().context("failed to summarize history")?;
        serde_json::to_writer_pretty(writer, &reports)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Computed;
    use approx::assert_abs_diff_eq;

    fn many(lorenz: Vec<f64>, gini: f64, mean: f64, median: f64) -> ManyStats {
        ManyStats {
            lorenz_long_lvl: lorenz.clone(),
            lorenz_long_nrm: lorenz.clone(),
            lorenz_long_inc: lorenz,
            gini_lvl: gini,
            gini_nrm: gini,
            gini_inc: gini,
            mean_lvl: mean,
            median_lvl: median,
            mean_nrm: mean,
            median_nrm: median,
            percentiles_lvl: vec![1.0; 99],
            percentiles_nrm: vec![1.0; 99],
            param_by_wealth: vec![0.96; RANK_BINS],
            age_by_wealth: vec![mean; RANK_BINS],
            param_by_inc: vec![0.96; RANK_BINS],
            age_by_inc: vec![mean; RANK_BINS],
        }
    }

    fn record(many: Computed<ManyStats>) -> AggregateRecord {
        AggregateRecord {
            ky_ratio: 10.0,
            a_lvl_mean: 5.0,
            mpc_mean: 0.2,
            unemp_share: 0.07,
            lorenz: Computed::Value(vec![0.1, 0.3]),
            many,
        }
    }

    fn equal_lorenz() -> Vec<f64> {
        percentile_grid()
    }

    fn concave_lorenz() -> Vec<f64> {
        percentile_grid().iter().map(|p| p * p).collect()
    }

    #[test]
    fn gini_definitions_are_kept_apart() {
        let records = vec![
            record(Computed::NotRequested),
            record(Computed::Value(many(equal_lorenz(), 0.0, 2.0, 1.0))),
            record(Computed::Value(many(concave_lorenz(), 0.6, 4.0, 1.0))),
        ];
        let summary = summarize_many_stats(&records, 1).unwrap();
        assert_eq!(summary.n_periods, 2);
        assert_eq!(summary.lorenz_lvl.len(), 101);
        assert_eq!((summary.lorenz_lvl[0], summary.lorenz_lvl[100]), (0.0, 1.0));
        assert_abs_diff_eq!(summary.mean_gini_lvl, 0.3, epsilon = 1e-12);
        // Mean curve (p + p^2) / 2 has Gini 1/6 on the fine grid.
        assert_abs_diff_eq!(summary.gini_of_mean_lorenz_lvl, 1.0 / 6.0, epsilon = 1e-3);
        assert_abs_diff_eq!(summary.mean_to_median_lvl, 3.0, epsilon = 1e-12);
        assert_eq!(summary.param_by_wealth, vec![0.96; RANK_BINS]);
        assert_eq!(summary.age_by_wealth, vec![3.0; RANK_BINS]);
    }

    #[test]
    fn equal_wealth_has_no_top_concentration() {
        let records = vec![record(Computed::Value(many(equal_lorenz(), 0.0, 1.0, 1.0)))];
        let summary = summarize_many_stats(&records, 0).unwrap();
        let shares = summary.top_shares_lvl;
        assert_abs_diff_eq!(shares.top_1, 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(shares.top_10, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(shares.bottom_40, 0.4, epsilon = 1e-12);
        let dev = summary.median_deviations_lvl;
        assert_abs_diff_eq!(dev.top_1, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dev.bottom_40, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(summary.gini_of_mean_lorenz_lvl, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_statistics_in_window_are_errors() {
        let records = vec![
            record(Computed::Value(many(equal_lorenz(), 0.0, 1.0, 1.0))),
            record(Computed::NotRequested),
        ];
        assert!(matches!(
            summarize_many_stats(&records, 0),
            Err(EstimationError::NotComputed(_))
        ));
        assert!(matches!(
            summarize_many_stats(&records, 2),
            Err(EstimationError::InsufficientHistory { .. })
        ));
    }

    #[test]
    fn analyzer_reports_requested_observables() {
        let records = vec![record(Computed::NotRequested); 4];
        let flags = StatFlags {
            lorenz: true,
            many_stats: false,
        };
        let mut analyzer = Analyzer::new(flags);
        analyzer.add_records(&records, 1).unwrap();
        let reports = analyzer.reports().unwrap();
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[0]["ky_ratio"]["mean"], 10.0);
        assert_eq!(reports[4]["lorenz_shares"][1], 0.3);
    }
}
