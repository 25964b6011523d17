//! Weighted cross-sectional statistics.
//!
//! All functions take values and importance weights of equal length, tolerate
//! unsorted input and repeated values, and treat percentile arguments as
//! fractions in `[0, 1]`.

use crate::error::{EstimationError, EstimationResult};
use serde::{Deserialize, Serialize};

/// Running mean and sample standard deviation (Welford).
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub mean: f64,
    pub std_dev: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            n_vals: 0,
            mean: 0.0,
            diff_2_sum: 0.0,
        }
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn report(&self) -> AccumulatorReport {
        AccumulatorReport {
            mean: if self.n_vals > 0 { self.mean } else { f64::NAN },
            std_dev: if self.n_vals > 1 {
                (self.diff_2_sum / (self.n_vals as f64 - 1.0)).sqrt()
            } else {
                f64::NAN
            },
        }
    }
}

/// Elementwise running mean of equal-length vectors.
pub struct VecAccumulator {
    acc_vec: Vec<Accumulator>,
}

impl VecAccumulator {
    pub fn new(len: usize) -> Self {
        let mut acc_vec = Vec::new();
        acc_vec.resize_with(len, Accumulator::new);
        Self { acc_vec }
    }

    pub fn add(&mut self, vals: &[f64]) -> EstimationResult<()> {
        if vals.len() != self.acc_vec.len() {
            return Err(EstimationError::Config(format!(
                "vector length must be {}, but is {}",
                self.acc_vec.len(),
                vals.len()
            )));
        }
        for (acc, &val) in self.acc_vec.iter_mut().zip(vals) {
            acc.add(val);
        }
        Ok(())
    }

    pub fn means(&self) -> Vec<f64> {
        self.acc_vec.iter().map(|acc| acc.report().mean).collect()
    }
}

fn sorted_pairs(
    values: &[f64],
    weights: &[f64],
    presorted: bool,
) -> EstimationResult<Vec<(f64, f64)>> {
    if values.len() != weights.len() {
        return Err(EstimationError::Config(format!(
            "{} values but {} weights",
            values.len(),
            weights.len()
        )));
    }
    let mut pairs: Vec<(f64, f64)> = values.iter().copied().zip(weights.iter().copied()).collect();
    if !presorted {
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    Ok(pairs)
}

/// Linear interpolation on a non-decreasing grid, clamped at both ends.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let idx = xp.partition_point(|&v| v < x);
    if idx == 0 {
        return fp[0];
    }
    if idx == xp.len() {
        return fp[xp.len() - 1];
    }
    let (x0, x1) = (xp[idx - 1], xp[idx]);
    if x1 <= x0 || x >= x1 {
        return fp[idx];
    }
    let t = (x - x0) / (x1 - x0);
    fp[idx - 1] + t * (fp[idx] - fp[idx - 1])
}

/// Discrete weighted Gini coefficient.
///
/// With observations sorted ascending and `z_i = w_i·x_i`,
/// `G = Σ (2i − n − 1)·z_i / (n·Σ z_i)` for `i = 1..n`.
pub fn weighted_gini(values: &[f64], weights: &[f64], presorted: bool) -> EstimationResult<f64> {
    let pairs = sorted_pairs(values, weights, presorted)?;
    let n = pairs.len();
    if n < 2 {
        return Err(EstimationError::DegenerateAggregation(format!(
            "Gini needs at least two observations, got {n}"
        )));
    }

    let mut rank_sum = 0.0;
    let mut total = 0.0;
    for (i, &(val, wgt)) in pairs.iter().enumerate() {
        let z = val * wgt;
        rank_sum += (2.0 * (i + 1) as f64 - n as f64 - 1.0) * z;
        total += z;
    }
    if total == 0.0 {
        return Err(EstimationError::DegenerateAggregation(
            "Gini of a sample with zero total mass".to_string(),
        ));
    }
    Ok(rank_sum / (n as f64 * total))
}

/// Cumulative share of total `value·weight` mass held below each weighted
/// population percentile.
///
/// The curve passes through `(0, 0)` and `(1, 1)`.
pub fn weighted_lorenz_shares(
    values: &[f64],
    weights: &[f64],
    percentiles: &[f64],
) -> EstimationResult<Vec<f64>> {
    let pairs = sorted_pairs(values, weights, false)?;
    if pairs.len() < 2 {
        return Err(EstimationError::DegenerateAggregation(format!(
            "Lorenz curve needs at least two observations, got {}",
            pairs.len()
        )));
    }

    let total_wgt: f64 = pairs.iter().map(|&(_, w)| w).sum();
    let total_mass: f64 = pairs.iter().map(|&(v, w)| v * w).sum();
    if total_wgt <= 0.0 || total_mass == 0.0 {
        return Err(EstimationError::DegenerateAggregation(
            "Lorenz curve of a sample with zero total mass".to_string(),
        ));
    }

    let mut cum_dist = Vec::with_capacity(pairs.len() + 1);
    let mut cum_data = Vec::with_capacity(pairs.len() + 1);
    cum_dist.push(0.0);
    cum_data.push(0.0);
    let (mut wgt_sum, mut mass_sum) = (0.0, 0.0);
    for &(val, wgt) in &pairs {
        wgt_sum += wgt;
        mass_sum += val * wgt;
        cum_dist.push(wgt_sum / total_wgt);
        cum_data.push(mass_sum / total_mass);
    }
    // Pin the endpoint against accumulated rounding.
    let last = cum_dist.len() - 1;
    cum_dist[last] = 1.0;
    cum_data[last] = 1.0;

    Ok(percentiles
        .iter()
        .map(|&p| interp(p.clamp(0.0, 1.0), &cum_dist, &cum_data))
        .collect())
}

/// Value at each weighted population percentile.
pub fn weighted_percentiles(
    values: &[f64],
    weights: &[f64],
    percentiles: &[f64],
) -> EstimationResult<Vec<f64>> {
    let pairs = sorted_pairs(values, weights, false)?;
    let total_wgt: f64 = pairs.iter().map(|&(_, w)| w).sum();
    if pairs.is_empty() || total_wgt <= 0.0 {
        return Err(EstimationError::DegenerateAggregation(
            "percentiles of a sample with zero total weight".to_string(),
        ));
    }

    let mut cum_dist = Vec::with_capacity(pairs.len());
    let mut sorted_vals = Vec::with_capacity(pairs.len());
    let mut wgt_sum = 0.0;
    for &(val, wgt) in &pairs {
        wgt_sum += wgt;
        cum_dist.push(wgt_sum / total_wgt);
        sorted_vals.push(val);
    }

    Ok(percentiles
        .iter()
        .map(|&p| interp(p, &cum_dist, &sorted_vals))
        .collect())
}

pub fn weighted_mean(values: &[f64], weights: &[f64]) -> EstimationResult<f64> {
    let total_wgt: f64 = weights.iter().sum();
    if values.len() != weights.len() || total_wgt <= 0.0 {
        return Err(EstimationError::DegenerateAggregation(
            "mean of a sample with zero total weight".to_string(),
        ));
    }
    Ok(values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total_wgt)
}

pub fn weighted_median(values: &[f64], weights: &[f64]) -> EstimationResult<f64> {
    Ok(weighted_percentiles(values, weights, &[0.5])?[0])
}

/// Gini coefficient of a Lorenz curve sampled on an evenly spaced grid that
/// includes both endpoints: `G = 1 − Σ (L_{i−1} + L_i) / m` over `m` intervals.
pub fn gini_from_lorenz(shares: &[f64]) -> EstimationResult<f64> {
    if shares.len() < 2 {
        return Err(EstimationError::DegenerateAggregation(
            "Lorenz curve needs at least its two endpoints".to_string(),
        ));
    }
    let m = (shares.len() - 1) as f64;
    let area_sum: f64 = shares.windows(2).map(|pair| pair[0] + pair[1]).sum();
    Ok(1.0 - area_sum / m)
}

/// The percentile grid `0.01, 0.02, ..., 0.99`.
/// Weighted mean of `values` within each of `n_bins` equal-mass bins of the
/// distribution of `rank_by`.
///
/// A household whose weight straddles a bin edge is split between the bins.
pub fn weighted_bin_means(
    rank_by: &[f64],
    values: &[f64],
    weights: &[f64],
    n_bins: usize,
) -> EstimationResult<Vec<f64>> {
    if rank_by.len() != values.len() || values.len() != weights.len() {
        return Err(EstimationError::Config(format!(
            "{} ranks, {} values and {} weights",
            rank_by.len(),
            values.len(),
            weights.len()
        )));
    }
    let total_wgt: f64 = weights.iter().sum();
    if n_bins == 0 || !(total_wgt > 0.0) {
        return Err(EstimationError::DegenerateAggregation(
            "bin means of a sample with zero total weight".to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..rank_by.len()).collect();
    order.sort_by(|&i, &j| rank_by[i].total_cmp(&rank_by[j]));

    let bin_wgt = total_wgt / n_bins as f64;
    let mut sums = vec![0.0; n_bins];
    let mut lo = 0.0;
    for i in order {
        let hi = lo + weights[i];
        let first = ((lo / bin_wgt) as usize).min(n_bins - 1);
        let last = ((hi / bin_wgt) as usize).min(n_bins - 1);
        for bin in first..=last {
            let edge_lo = bin as f64 * bin_wgt;
            let overlap = hi.min(edge_lo + bin_wgt) - lo.max(edge_lo);
            if overlap > 0.0 {
                sums[bin] += values[i] * overlap;
            }
        }
        lo = hi;
    }
    Ok(sums.into_iter().map(|sum| sum / bin_wgt).collect())
}

pub fn percentile_grid() -> Vec<f64> {
    (1..100).map(|i| i as f64 / 100.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gini_of_equal_sample_is_zero() {
        let gini = weighted_gini(&[1.0; 4], &[1.0; 4], false).unwrap();
        assert_eq!(gini, 0.0);
    }

    #[test]
    fn gini_of_single_holder_sample() {
        let gini = weighted_gini(&[0.0, 100.0, 0.0, 0.0], &[1.0; 4], false).unwrap();
        assert_abs_diff_eq!(gini, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn gini_stays_in_unit_interval() {
        let samples: [&[f64]; 3] = [
            &[0.5, 2.0, 7.0, 0.0, 3.0],
            &[10.0, 10.0, 11.0],
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        ];
        for vals in samples {
            let wgts: Vec<f64> = (0..vals.len()).map(|i| 1.0 + 0.1 * i as f64).collect();
            let gini = weighted_gini(vals, &wgts, false).unwrap();
            assert!((0.0..1.0).contains(&gini), "gini {gini} for {vals:?}");
        }
    }

    #[test]
    fn degenerate_samples_are_reported() {
        assert!(matches!(
            weighted_gini(&[3.0], &[1.0], false),
            Err(EstimationError::DegenerateAggregation(_))
        ));
        assert!(matches!(
            weighted_gini(&[0.0, 0.0], &[1.0, 1.0], false),
            Err(EstimationError::DegenerateAggregation(_))
        ));
        assert!(matches!(
            weighted_lorenz_shares(&[0.0, 0.0, 0.0], &[1.0; 3], &[0.5]),
            Err(EstimationError::DegenerateAggregation(_))
        ));
    }

    #[test]
    fn lorenz_shares_are_monotone_with_fixed_endpoints() {
        let vals = [4.0, 0.0, 1.5, 9.0, 2.0, 2.0, 30.0];
        let wgts = [1.0, 0.5, 2.0, 1.0, 1.0, 3.0, 0.2];
        let pctls: Vec<f64> = (0..=20).map(|i| i as f64 / 20.0).collect();
        let shares = weighted_lorenz_shares(&vals, &wgts, &pctls).unwrap();

        assert_eq!(shares[0], 0.0);
        assert_eq!(shares[20], 1.0);
        for pair in shares.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(shares.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn gini_matches_area_under_full_resolution_lorenz_curve() {
        let vals = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let wgts = [1.0; 8];
        let pctls: Vec<f64> = (0..=8).map(|i| i as f64 / 8.0).collect();

        let shares = weighted_lorenz_shares(&vals, &wgts, &pctls).unwrap();
        let from_curve = gini_from_lorenz(&shares).unwrap();
        let direct = weighted_gini(&vals, &wgts, false).unwrap();

        assert_abs_diff_eq!(from_curve, direct, epsilon = 1e-12);
    }

    #[test]
    fn replication_leaves_statistics_unchanged() {
        let vals = [1.0, 2.0, 7.0, 3.5];
        let wgts = [1.0, 3.0, 0.5, 2.0];
        let k = 3;
        let rep_vals: Vec<f64> = vals.iter().flat_map(|&v| std::iter::repeat_n(v, k)).collect();
        let rep_wgts: Vec<f64> = wgts
            .iter()
            .flat_map(|&w| std::iter::repeat_n(w / k as f64, k))
            .collect();

        let gini = weighted_gini(&vals, &wgts, false).unwrap();
        let rep_gini = weighted_gini(&rep_vals, &rep_wgts, false).unwrap();
        assert_abs_diff_eq!(gini, rep_gini, epsilon = 1e-12);

        let pctls = [0.1, 0.25, 0.5, 0.8, 0.95];
        let shares = weighted_lorenz_shares(&vals, &wgts, &pctls).unwrap();
        let rep_shares = weighted_lorenz_shares(&rep_vals, &rep_wgts, &pctls).unwrap();
        for (a, b) in shares.iter().zip(&rep_shares) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn percentiles_follow_weighted_cdf() {
        let vals = [5.0, 1.0, 3.0, 2.0];
        let wgts = [1.0; 4];
        let out = weighted_percentiles(&vals, &wgts, &[0.25, 0.5, 0.625, 1.0]).unwrap();
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[2], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(out[3], 5.0, epsilon = 1e-12);

        let median = weighted_median(&[1.0, 10.0], &[3.0, 1.0]).unwrap();
        assert_abs_diff_eq!(median, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn accumulator_reports_mean_and_spread() {
        let mut acc = Accumulator::new();
        for val in [1.0, 2.0, 3.0, 4.0] {
            acc.add(val);
        }
        let report = acc.report();
        assert_abs_diff_eq!(report.mean, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(report.std_dev, (5.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn bin_means_split_straddling_households() {
        let ranks = [4.0, 1.0, 3.0, 2.0];
        let means = weighted_bin_means(&ranks, &[40.0, 10.0, 30.0, 20.0], &[1.0; 4], 2).unwrap();
        assert_abs_diff_eq!(means[0], 15.0, epsilon = 1e-12);
        assert_abs_diff_eq!(means[1], 35.0, epsilon = 1e-12);

        let means = weighted_bin_means(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], &[1.0; 3], 2).unwrap();
        assert_abs_diff_eq!(means[0], 2.0 / 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(means[1], 4.0 / 1.5, epsilon = 1e-12);

        assert!(matches!(
            weighted_bin_means(&[1.0], &[1.0], &[0.0], 5),
            Err(EstimationError::DegenerateAggregation(_))
        ));
    }
}
