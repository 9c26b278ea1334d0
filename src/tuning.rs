//! Tuning round configuration.

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error("invalid tuning configuration: {0}")]
    InvalidConfiguration(String),
}

/// Knobs of one evolutionary tuning round.
#[derive(Clone, Debug)]
pub struct TuningOptions {
    /// Target size of the initial population (warm starts plus sketches).
    pub init_population_num: usize,
    /// Warm-start candidates pulled from the database.
    pub pick_database_topk: usize,
    /// Crossover children generated per round.
    pub cross_over_num: usize,
    /// Candidates returned per round; the measurement budget.
    pub num_samples_per_iteration: usize,
    /// Fraction of returned candidates drawn from random sketches.
    pub eps_greedy: f64,
    /// When set, crossover picks each parent with equal probability instead
    /// of the legacy 1:2 father:mother ratio.
    pub crossover_uniform: bool,
}

impl Default for TuningOptions {
    fn default() -> Self {
        TuningOptions {
            init_population_num: 24,
            pick_database_topk: 8,
            cross_over_num: 16,
            num_samples_per_iteration: 10,
            eps_greedy: 0.25,
            crossover_uniform: false,
        }
    }
}

impl TuningOptions {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.init_population_num == 0 {
            return Err(SearchError::InvalidConfiguration(
                "init_population_num must be positive".into(),
            ));
        }
        if !self.eps_greedy.is_finite() || !(0.0..=1.0).contains(&self.eps_greedy) {
            return Err(SearchError::InvalidConfiguration(format!(
                "eps_greedy must lie in [0, 1], got {}",
                self.eps_greedy
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        TuningOptions::default().validate().unwrap();
    }

    #[test]
    fn zero_population_is_rejected() {
        let options = TuningOptions {
            init_population_num: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn eps_greedy_bounds_are_enforced() {
        for eps in [-0.1, 1.1, f64::NAN] {
            let options = TuningOptions {
                eps_greedy: eps,
                ..Default::default()
            };
            assert!(options.validate().is_err(), "eps_greedy={} accepted", eps);
        }
        let edge = TuningOptions {
            eps_greedy: 1.0,
            ..Default::default()
        };
        edge.validate().unwrap();
    }
}
