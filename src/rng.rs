//! Forkable linear-congruential engine.
//!
//! Every stochastic draw in the crate goes through an explicit [RandState]
//! value; there is no hidden global generator. Forking draws one value from
//! the parent to seed the child, so a subcomputation's draws never perturb
//! its parent's sequence.

/// State of the linear congruential engine. Always in `[1, MODULUS)` after
/// [normalize_state].
pub type RandState = i64;

// minstd parameters.
const MULTIPLIER: i64 = 48271;
const MODULUS: i64 = 2147483647;

const DEFAULT_SEED: i64 = 1;

/// Maps an arbitrary seed into the engine's valid state range.
///
/// Zero and negative seeds are folded onto the default seed so that a state
/// is always reproducible from the value alone.
pub fn normalize_state(seed: i64) -> RandState {
    if seed <= 0 {
        return DEFAULT_SEED;
    }
    let s = seed % MODULUS;
    if s == 0 {
        DEFAULT_SEED
    } else {
        s
    }
}

fn next(state: &mut RandState) -> i64 {
    debug_assert!(*state > 0 && *state < MODULUS);
    *state = state.wrapping_mul(MULTIPLIER) % MODULUS;
    *state
}

/// Draws one value from `state` to seed an independent child state.
pub fn fork_state(state: &mut RandState) -> RandState {
    normalize_state(next(state))
}

/// Samples an integer uniformly from `[lo, hi_excl)`.
///
/// `lo < hi_excl` is a caller invariant.
pub fn sample_uniform_int(lo: i64, hi_excl: i64, state: &mut RandState) -> i64 {
    debug_assert!(lo < hi_excl, "empty sample range [{}, {})", lo, hi_excl);
    let span = hi_excl - lo;
    lo + next(state) % span
}

/// Samples a real uniformly from `[0, 1)`.
pub fn sample_uniform_real(state: &mut RandState) -> f64 {
    (next(state) - 1) as f64 / (MODULUS - 1) as f64
}

/// Samples an index proportional to `weights`. Entries that are not finite
/// and positive contribute nothing. Returns `None` when the total weight is
/// zero.
pub fn sample_weighted(weights: &[f64], state: &mut RandState) -> Option<usize> {
    let total: f64 = weights
        .iter()
        .filter(|w| w.is_finite() && **w > 0.0)
        .sum();
    if total <= 0.0 {
        return None;
    }
    let mut point = sample_uniform_real(state) * total;
    for (i, &w) in weights.iter().enumerate() {
        if !(w.is_finite() && w > 0.0) {
            continue;
        }
        point -= w;
        if point <= 0.0 {
            return Some(i);
        }
    }
    // Floating-point underflow on the last subtraction; pick the last
    // positive-weight entry.
    weights
        .iter()
        .rposition(|w| w.is_finite() && *w > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_non_positive_seeds() {
        assert_eq!(normalize_state(0), 1);
        assert_eq!(normalize_state(-17), 1);
        assert_eq!(normalize_state(5), 5);
        assert_eq!(normalize_state(MODULUS), 1);
    }

    #[test]
    fn identical_seeds_yield_identical_sequences() {
        let mut a = normalize_state(99);
        let mut b = normalize_state(99);
        for _ in 0..64 {
            assert_eq!(
                sample_uniform_int(0, 1000, &mut a),
                sample_uniform_int(0, 1000, &mut b)
            );
        }
    }

    #[test]
    fn fork_isolates_child_from_parent() {
        let mut parent = normalize_state(7);
        let mut twin = normalize_state(7);

        let mut child = fork_state(&mut parent);
        fork_state(&mut twin);
        // Draining the child must not affect the parent's future draws.
        for _ in 0..32 {
            sample_uniform_int(0, 10, &mut child);
        }
        assert_eq!(
            sample_uniform_int(0, 1_000_000, &mut parent),
            sample_uniform_int(0, 1_000_000, &mut twin)
        );
    }

    #[test]
    fn uniform_int_stays_in_range() {
        let mut state = normalize_state(3);
        for _ in 0..256 {
            let v = sample_uniform_int(5, 12, &mut state);
            assert!((5..12).contains(&v));
        }
    }

    #[test]
    fn uniform_real_stays_in_unit_interval() {
        let mut state = normalize_state(11);
        for _ in 0..256 {
            let v = sample_uniform_real(&mut state);
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn weighted_sample_ignores_non_positive_weights() {
        let mut state = normalize_state(23);
        for _ in 0..64 {
            let idx = sample_weighted(&[0.0, 2.0, f64::NAN, -1.0], &mut state).unwrap();
            assert_eq!(idx, 1);
        }
        assert_eq!(sample_weighted(&[0.0, 0.0], &mut state), None);
        assert_eq!(sample_weighted(&[], &mut state), None);
    }
}
