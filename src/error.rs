//! Error surface of the estimation core.
//!
//! Every failure here is local to one calibration trial or one aggregation
//! call. Nothing in the core catches and continues past these errors; the
//! application layer wraps them with `anyhow` context and aborts.

use thiserror::Error;

/// Result alias used throughout the numerical core.
pub type EstimationResult<T> = Result<T, EstimationError>;

#[derive(Debug, Error)]
pub enum EstimationError {
    /// The household decision problem has no bounded solution.
    #[error("invalid parameterization: {condition} violated ({detail})")]
    InvalidParameterization {
        condition: &'static str,
        detail: String,
    },

    /// The root-find objective does not change sign across the bracket.
    #[error(
        "objective has the same sign at both bracket endpoints: f({lo}) = {f_lo}, f({hi}) = {f_hi}"
    )]
    BracketSign { lo: f64, hi: f64, f_lo: f64, f_hi: f64 },

    /// An iterative process hit its iteration cap before meeting tolerance.
    #[error("{process} did not converge after {iterations} iterations (last distance {distance})")]
    NonConvergence {
        process: &'static str,
        iterations: usize,
        distance: f64,
    },

    /// A statistic was requested on a zero-mass or single-point sample.
    #[error("degenerate aggregation: {0}")]
    DegenerateAggregation(String),

    /// The history is not longer than the burn-in window.
    #[error("history has {len} periods but the first {ignore_periods} are burn-in")]
    InsufficientHistory { len: usize, ignore_periods: usize },

    /// A statistic was averaged over periods in which it was not computed.
    #[error("{0} was not computed for every period of the averaging window")]
    NotComputed(&'static str),

    /// Caller configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The numerical search itself failed outside any objective evaluation.
    #[error("numerical search failed: {0}")]
    Search(String),

    /// A calibration trial failed; carries the trial point.
    #[error("calibration trial at center = {center}, spread = {spread} failed")]
    TrialFailed {
        center: f64,
        spread: f64,
        #[source]
        source: Box<EstimationError>,
    },
}

impl EstimationError {
    /// Strip any `TrialFailed` wrappers.
    pub fn root_cause(&self) -> &EstimationError {
        match self {
            EstimationError::TrialFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
