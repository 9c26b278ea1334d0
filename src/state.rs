//! A candidate in the search: a schedule plus its predicted cost.

use crate::ir::schedule::Schedule;
use std::hash::{Hash, Hasher};

/// One point in the search space.
///
/// Identity is the structural fingerprint of the scheduled IR: two states
/// reached through different traces that produce the same IR are equal and
/// deduplicate against each other. The cost plays no part in identity; it is
/// `NaN` until a cost model has scored the state.
#[derive(Clone, Debug)]
pub struct SearchState {
    pub schedule: Schedule,
    pub predicted_cost: f64,
}

impl SearchState {
    pub fn new(schedule: Schedule) -> Self {
        SearchState {
            schedule,
            predicted_cost: f64::NAN,
        }
    }

    pub fn scored(schedule: Schedule, predicted_cost: f64) -> Self {
        SearchState {
            schedule,
            predicted_cost,
        }
    }

    pub fn is_scored(&self) -> bool {
        !self.predicted_cost.is_nan()
    }

    pub fn fingerprint(&self) -> u128 {
        self.schedule.fingerprint()
    }
}

impl PartialEq for SearchState {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for SearchState {}

impl Hash for SearchState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint().hash(state);
    }
}
