//! Discretized distributions of a heterogeneous preference parameter and
//! their assignment to household-type slots.

use crate::error::{EstimationError, EstimationResult};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistFamily {
    Uniform,
    Lognormal,
}

/// Lower and upper CDF bounds of the inner log-normal points.
const TAIL_BOUND: [f64; 2] = [0.0, 0.9];

/// Finite set of parameter values with probability masses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteDistribution {
    pub values: Vec<f64>,
    pub masses: Vec<f64>,
}

impl DiscreteDistribution {
    fn point(count: usize, value: f64) -> Self {
        Self {
            values: vec![value; count],
            masses: vec![1.0 / count as f64; count],
        }
    }

    pub fn mean(&self) -> f64 {
        self.values.iter().zip(&self.masses).map(|(v, m)| v * m).sum()
    }
}

/// `count` values of a distribution with the given center and spread.
pub fn distribute(
    family: DistFamily,
    count: usize,
    center: f64,
    spread: f64,
    tail_count: usize,
) -> EstimationResult<DiscreteDistribution> {
    if count == 0 {
        return Err(EstimationError::Config(
            "cannot distribute a parameter over zero values".to_string(),
        ));
    }
    if spread < 0.0 || !spread.is_finite() {
        return Err(EstimationError::Config(format!("invalid spread {spread}")));
    }
    if spread == 0.0 || count == 1 {
        return Ok(DiscreteDistribution::point(count, center));
    }
    match family {
        DistFamily::Uniform => Ok(uniform(count, center, spread)),
        DistFamily::Lognormal => lognormal(count, center, spread, tail_count),
    }
}

/// Equally likely values evenly spaced on `[center - spread, center + spread]`.
fn uniform(count: usize, center: f64, spread: f64) -> DiscreteDistribution {
    let lo = center - spread;
    let step = 2.0 * spread / (count - 1) as f64;
    DiscreteDistribution {
        values: (0..count).map(|i| lo + step * i as f64).collect(),
        masses: vec![1.0 / count as f64; count],
    }
}

/// Equiprobable discretization of a log-normal whose level has mean
/// `center`, with `tail_count` extra points covering the upper tail.
///
/// Each point is the conditional mean of the log-normal within its CDF bin,
/// so the discrete mean equals `center`.
fn lognormal(
    count: usize,
    center: f64,
    spread: f64,
    tail_count: usize,
) -> EstimationResult<DiscreteDistribution> {
    if !(center > 0.0) {
        return Err(EstimationError::Config(format!(
            "log-normal center must be positive, got {center}"
        )));
    }
    if count <= tail_count {
        return Err(EstimationError::Config(format!(
            "log-normal needs more than {tail_count} values, got {count}"
        )));
    }
    let n_inner = count - tail_count;
    let mu = center.ln() - 0.5 * spread * spread;
    let sigma = spread;

    let [lo_cut, hi_cut] = if tail_count > 0 { TAIL_BOUND } else { [0.0, 1.0] };
    let inner_size = hi_cut - lo_cut;
    let scale = (-1.0f64).exp();
    let mag = (1.0 - scale.powi(tail_count as i32)) / (1.0 - scale);

    let mut cdf_vals = vec![0.0];
    cdf_vals.extend((1..n_inner).map(|x| lo_cut + x as f64 / n_inner as f64 * inner_size));
    cdf_vals.push(hi_cut);
    let mut upper = hi_cut;
    for x in 0..tail_count {
        upper += (1.0 - hi_cut) * scale.powi(x as i32) / mag;
        cdf_vals.push(upper);
    }
    let last = cdf_vals.len() - 1;
    cdf_vals[last] = 1.0;

    let std_normal = Normal::new(0.0, 1.0)
        .map_err(|err| EstimationError::Config(format!("standard normal: {err}")))?;
    // Standardized log cut points; the outermost are infinite.
    let z_cuts: Vec<f64> = cdf_vals
        .iter()
        .enumerate()
        .map(|(i, &p)| match i {
            0 => f64::NEG_INFINITY,
            i if i == last => f64::INFINITY,
            _ => std_normal.inverse_cdf(p),
        })
        .collect();
    let shifted_cdf = |z: f64| -> f64 {
        if z == f64::NEG_INFINITY {
            0.0
        } else if z == f64::INFINITY {
            1.0
        } else {
            std_normal.cdf(z - sigma)
        }
    };

    let level_mean = (mu + 0.5 * sigma * sigma).exp();
    let mut values = Vec::with_capacity(count);
    let mut masses = Vec::with_capacity(count);
    for pair in cdf_vals.windows(2).zip(z_cuts.windows(2)) {
        let (cdf_pair, z_pair) = pair;
        let mass = cdf_pair[1] - cdf_pair[0];
        let partial = shifted_cdf(z_pair[1]) - shifted_cdf(z_pair[0]);
        values.push(level_mean * partial / mass);
        masses.push(mass);
    }
    Ok(DiscreteDistribution { values, masses })
}

/// Parameter value and household count of one household-type slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub value: f64,
    pub agent_count: usize,
}

/// Spread `dist` over `n_slots` slots.
///
/// Slots are grouped by value: slot `j` takes value `j / n_rep` and base
/// type `j % n_rep`, where `n_rep = n_slots / count`. Each slot gets
/// `floor(population · mass · type_weight)` households.
pub fn assign(
    dist: &DiscreteDistribution,
    n_slots: usize,
    type_weights: &[f64],
    population: usize,
) -> EstimationResult<Vec<SlotAssignment>> {
    let count = dist.values.len();
    if count == 0 || n_slots % count != 0 {
        return Err(EstimationError::Config(format!(
            "{n_slots} household-type slots cannot be split evenly over {count} parameter values"
        )));
    }
    let n_rep = n_slots / count;
    if type_weights.len() != n_rep {
        return Err(EstimationError::Config(format!(
            "{n_rep} slots per parameter value but {} type weights",
            type_weights.len()
        )));
    }

    Ok((0..n_slots)
        .map(|j| {
            let (b, n) = (j / n_rep, j % n_rep);
            let agent_count = (population as f64 * dist.masses[b] * type_weights[n]).floor();
            SlotAssignment {
                value: dist.values[b],
                agent_count: agent_count as usize,
            }
        })
        .collect())
}
