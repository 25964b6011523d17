use crate::error::{EstimationError, EstimationResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How simulated households are aged when a simulation is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialAge {
    /// Draw from the stationary age distribution.
    Stationary,
    /// Start every household at age zero.
    Newborn,
}

/// Parameters of one homogeneous household type.
///
/// `liv_prb` and `perm_gro_fac` are indexed by age. A single entry with
/// `lifecycle = false` describes a perpetual-youth type; with
/// `lifecycle = true` the sequences define a finite life of
/// `liv_prb.len()` periods followed by a terminal period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdParams {
    /// Coefficient of relative risk aversion.
    pub crra: f64,
    /// Intertemporal discount factor.
    pub disc_fac: f64,
    /// Risk-free interest factor.
    pub rfree: f64,
    /// Survival probability from each age to the next.
    pub liv_prb: Vec<f64>,
    /// Expected permanent income growth at each age.
    pub perm_gro_fac: Vec<f64>,
    /// Standard deviation of log permanent shocks.
    pub perm_shk_std: f64,
    /// Standard deviation of log transitory shocks.
    pub tran_shk_std: f64,
    /// Probability of unemployment.
    pub unemp_prb: f64,
    /// Income while unemployed.
    pub inc_unemp: f64,
    /// Individual labour supply while employed.
    #[serde(default = "default_ind_l")]
    pub ind_l: f64,
    /// Age at which every household dies, if any.
    #[serde(default)]
    pub t_age: Option<usize>,
    #[serde(default)]
    pub lifecycle: bool,
    #[serde(default = "default_initial_age")]
    pub initial_age: InitialAge,
    /// Probability of observing the aggregate state in a given period.
    /// Below one, households keep acting on their last observation.
    #[serde(default = "default_update_prb")]
    pub update_prb: f64,
}

fn default_ind_l() -> f64 {
    1.0
}

fn default_initial_age() -> InitialAge {
    InitialAge::Stationary
}

fn default_update_prb() -> f64 {
    1.0
}

impl HouseholdParams {
    /// Number of non-terminal periods in one life cycle.
    pub fn horizon(&self) -> usize {
        self.liv_prb.len()
    }

    /// Index into the age-varying sequences for a household of age `t_age`.
    pub fn age_index(&self, t_age: usize) -> usize {
        if self.lifecycle {
            t_age.min(self.horizon().saturating_sub(1))
        } else {
            0
        }
    }

    /// Age at which a household is removed and replaced by a newborn.
    pub fn max_age(&self) -> Option<usize> {
        if self.lifecycle {
            let life = self.horizon() + 1;
            Some(self.t_age.map_or(life, |t_age| t_age.min(life)))
        } else {
            self.t_age
        }
    }

    /// Tax rate that finances unemployment benefits.
    pub fn tax_rate(&self) -> f64 {
        if self.unemp_prb >= 1.0 {
            return 0.0;
        }
        self.inc_unemp * self.unemp_prb / ((1.0 - self.unemp_prb) * self.ind_l)
    }

    #[cfg(test)]
    /// Expected transitory income per unit of permanent income.
    pub fn mean_income(&self) -> f64 {
        (1.0 - self.unemp_prb) * (1.0 - self.tax_rate()) * self.ind_l
            + self.unemp_prb * self.inc_unemp
    }

    pub fn validate(&self) -> EstimationResult<()> {
        let bad = |msg: String| Err(EstimationError::Config(msg));
        if self.liv_prb.is_empty() {
            return bad("liv_prb must not be empty".to_string());
        }
        if self.perm_gro_fac.len() != self.liv_prb.len() {
            return bad(format!(
                "perm_gro_fac has {} entries but liv_prb has {}",
                self.perm_gro_fac.len(),
                self.liv_prb.len()
            ));
        }
        if !self.lifecycle && self.liv_prb.len() != 1 {
            return bad("perpetual-youth types take exactly one liv_prb entry".to_string());
        }
        if self.liv_prb.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return bad(format!("liv_prb entries must be in [0, 1]: {:?}", self.liv_prb));
        }
        if self.perm_gro_fac.iter().any(|g| !(*g > 0.0)) {
            return bad(format!("perm_gro_fac entries must be positive: {:?}", self.perm_gro_fac));
        }
        if !(self.crra > 0.0) || !(self.disc_fac > 0.0) || !(self.rfree > 0.0) {
            return bad(format!(
                "crra, disc_fac and rfree must be positive ({}, {}, {})",
                self.crra, self.disc_fac, self.rfree
            ));
        }
        if !(self.perm_shk_std >= 0.0) || !(self.tran_shk_std >= 0.0) {
            return bad("shock standard deviations must be non-negative".to_string());
        }
        if !(0.0..1.0).contains(&self.unemp_prb)
            || !(self.inc_unemp >= 0.0)
            || !(self.ind_l > 0.0)
        {
            return bad("unemployment parameters out of range".to_string());
        }
        if self.t_age == Some(0) {
            return bad("t_age must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.update_prb) {
            return bad(format!("update_prb must be in [0, 1], got {}", self.update_prb));
        }
        Ok(())
    }
}

/// Parameters that can be distributed across household types by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamName {
    DiscFac,
    #[serde(rename = "CRRA")]
    Crra,
    Rfree,
    PermGroFac,
    LivPrb,
    PermShkStd,
    TranShkStd,
}

type Setter = fn(&mut HouseholdParams, f64);

impl ParamName {
    /// Setter that writes this parameter into a [`HouseholdParams`].
    ///
    /// Age-varying parameters are set to the same value at every age.
    pub fn setter(self) -> Setter {
        match self {
            ParamName::DiscFac => |p, v| p.disc_fac = v,
            ParamName::Crra => |p, v| p.crra = v,
            ParamName::Rfree => |p, v| p.rfree = v,
            ParamName::PermGroFac => |p, v| p.perm_gro_fac.iter_mut().for_each(|g| *g = v),
            ParamName::LivPrb => |p, v| p.liv_prb.iter_mut().for_each(|l| *l = v),
            ParamName::PermShkStd => |p, v| p.perm_shk_std = v,
            ParamName::TranShkStd => |p, v| p.tran_shk_std = v,
        }
    }

    /// Current value; age-varying parameters report their first age.
    pub fn value(self, params: &HouseholdParams) -> f64 {
        match self {
            ParamName::DiscFac => params.disc_fac,
            ParamName::Crra => params.crra,
            ParamName::Rfree => params.rfree,
            ParamName::PermGroFac => params.perm_gro_fac.first().copied().unwrap_or(f64::NAN),
            ParamName::LivPrb => params.liv_prb.first().copied().unwrap_or(f64::NAN),
            ParamName::PermShkStd => params.perm_shk_std,
            ParamName::TranShkStd => params.tran_shk_std,
        }
    }

    pub fn assign(self, params: &mut HouseholdParams, value: f64) {
        (self.setter())(params, value);
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamName::DiscFac => "DiscFac",
            ParamName::Crra => "CRRA",
            ParamName::Rfree => "Rfree",
            ParamName::PermGroFac => "PermGroFac",
            ParamName::LivPrb => "LivPrb",
            ParamName::PermShkStd => "PermShkStd",
            ParamName::TranShkStd => "TranShkStd",
        };
        write!(f, "{name}")
    }
}

/// Stationary age distribution of the "die and be reborn at age 0" chain.
///
/// With a terminal period the chain has `liv_prb.len() + 1` ages and the last
/// one is left with certainty. The mass at age `t` is proportional to the
/// probability of surviving to `t`.
pub fn stationary_age_dstn(liv_prb: &[f64], terminal_period: bool) -> Vec<f64> {
    let n_ages = if terminal_period {
        liv_prb.len() + 1
    } else {
        liv_prb.len()
    };
    let mut mass = Vec::with_capacity(n_ages);
    let mut surv = 1.0;
    for t in 0..n_ages {
        mass.push(surv);
        if t < liv_prb.len() {
            surv *= liv_prb[t];
        }
    }
    let total: f64 = mass.iter().sum();
    mass.iter_mut().for_each(|m| *m /= total);
    mass
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    pub(crate) fn perpetual_youth() -> HouseholdParams {
        HouseholdParams {
            crra: 1.0,
            disc_fac: 0.97,
            rfree: 1.01 / 0.99375,
            liv_prb: vec![0.99375],
            perm_gro_fac: vec![1.0],
            perm_shk_std: 0.06,
            tran_shk_std: 0.2,
            unemp_prb: 0.07,
            inc_unemp: 0.15,
            ind_l: 10.0 / 9.0,
            t_age: Some(400),
            lifecycle: false,
            initial_age: InitialAge::Stationary,
            update_prb: 1.0,
        }
    }

    #[test]
    fn setters_cover_every_name() {
        let mut params = perpetual_youth();
        ParamName::DiscFac.assign(&mut params, 0.95);
        ParamName::Crra.assign(&mut params, 2.0);
        ParamName::PermGroFac.assign(&mut params, 1.01);
        assert_eq!(params.disc_fac, 0.95);
        assert_eq!(params.crra, 2.0);
        assert_eq!(params.perm_gro_fac, vec![1.01]);

        ParamName::LivPrb.assign(&mut params, 0.98);
        for (name, value) in [
            (ParamName::DiscFac, 0.95),
            (ParamName::Crra, 2.0),
            (ParamName::PermGroFac, 1.01),
            (ParamName::LivPrb, 0.98),
        ] {
            assert_eq!(name.value(&params), value);
        }
    }

    #[test]
    fn param_names_parse_from_config_spelling() {
        #[derive(Deserialize)]
        struct Holder {
            param: ParamName,
        }
        let holder: Holder = toml::from_str("param = \"CRRA\"").unwrap();
        assert_eq!(holder.param, ParamName::Crra);
        assert_eq!(ParamName::Crra.to_string(), "CRRA");
    }

    #[test]
    fn unemployment_is_self_financing() {
        let params = perpetual_youth();
        let employed = (1.0 - params.unemp_prb) * params.ind_l;
        assert_abs_diff_eq!(params.mean_income(), employed, epsilon = 1e-12);
    }

    #[test]
    fn stationary_age_distribution_follows_survival() {
        let dstn = stationary_age_dstn(&[0.5, 0.5], true);
        assert_eq!(dstn.len(), 3);
        assert_abs_diff_eq!(dstn[0], 4.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dstn[1], 2.0 / 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dstn[2], 1.0 / 7.0, epsilon = 1e-12);

        let py = stationary_age_dstn(&[0.9], false);
        assert_eq!(py, vec![1.0]);
    }
}
