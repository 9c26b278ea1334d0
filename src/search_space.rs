//! Sketch generation and single-step mutation over one task's schedule
//! space.

use crate::cost::CostModel;
use crate::ir::schedule::{ApplyError, Schedule};
use crate::rng::{fork_state, sample_uniform_int, sample_weighted, RandState};
use crate::rules::{
    mutate_rule_registry, sketch_rule_registry, MutateRule, MutateRuleApi, SketchOutcome,
    SketchRule, SketchRuleApi,
};
use crate::state::SearchState;
use crate::task::TuneTask;
use log::{debug, warn};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SketchStrategy {
    /// Priority-proportional rule choice; diversity-seeking.
    RulePrune,
    /// Uniform rule choice; supplies the epsilon-greedy random pool.
    RandomPrune,
}

// Draw budget per requested sketch before the space counts as exhausted.
const SKETCH_ATTEMPT_FACTOR: usize = 10;
// Bound on rule applications within one sketch.
const MAX_SKETCH_STEPS: usize = 32;

pub struct SearchSpace {
    task: TuneTask,
    rand_state: RandState,
    sketch_rules: Vec<SketchRule>,
    mutate_rules: Vec<MutateRule>,
}

impl SearchSpace {
    pub fn new(task: TuneTask, rand_state: RandState) -> Self {
        let sketch_rules = sketch_rule_registry(task.target);
        SearchSpace {
            task,
            rand_state,
            sketch_rules,
            mutate_rules: mutate_rule_registry(),
        }
    }

    #[cfg(test)]
    pub fn with_mutate_rules(
        task: TuneTask,
        rand_state: RandState,
        mutate_rules: Vec<MutateRule>,
    ) -> Self {
        let sketch_rules = sketch_rule_registry(task.target);
        SearchSpace {
            task,
            rand_state,
            sketch_rules,
            mutate_rules,
        }
    }

    /// Yields up to `num` sketches, distinct by IR fingerprint. Fewer are
    /// returned only when the space is exhausted; duplicates never are.
    pub fn generate_sketches(&mut self, num: usize, strategy: SketchStrategy) -> Vec<SearchState> {
        if num == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(num);
        let mut seen: HashSet<u128> = HashSet::new();
        let budget = num * SKETCH_ATTEMPT_FACTOR;
        for _ in 0..budget {
            if out.len() >= num {
                break;
            }
            match self.grow_sketch(strategy) {
                Ok(sched) => {
                    if seen.insert(sched.fingerprint()) {
                        out.push(SearchState::new(sched));
                    }
                }
                Err(err) => {
                    warn!("sketch generation failed, dropping candidate: {}", err);
                }
            }
        }
        if out.len() < num {
            debug!(
                "sketch space exhausted for {}: {} of {} under {:?}",
                self.task.key,
                out.len(),
                num,
                strategy
            );
        }
        out
    }

    /// Applies one weighted mutation to the state's trace, replays, and
    /// scores the outcome. A mutation that finds no target or fails to
    /// replay leaves the schedule unchanged; the result is always scored.
    pub fn get_schedule_mutate<M: CostModel>(
        &mut self,
        state: &SearchState,
        cost_model: &M,
    ) -> SearchState {
        let schedule = match self.mutate_once(state) {
            Some(mutated) => mutated,
            None => state.schedule.clone(),
        };
        let cost = match cost_model.predict(schedule.module()) {
            Ok(c) if c >= 0.0 => c,
            Ok(c) => {
                warn!("cost model returned {}, treating as +inf", c);
                f64::INFINITY
            }
            Err(err) => {
                warn!("cost model failed, treating as +inf: {}", err);
                f64::INFINITY
            }
        };
        SearchState::scored(schedule, cost)
    }

    fn mutate_once(&mut self, state: &SearchState) -> Option<Schedule> {
        let weights: Vec<f64> = self.mutate_rules.iter().map(|r| r.weight()).collect();
        let idx = sample_weighted(&weights, &mut self.rand_state)?;
        let rule = &self.mutate_rules[idx];
        let mut rule_rand = fork_state(&mut self.rand_state);
        let mutated = rule.apply(state.schedule.trace(), &self.task.seed, &mut rule_rand)?;
        match Schedule::replay(
            self.task.seed.deep_copy(),
            &mutated,
            fork_state(&mut self.rand_state),
        ) {
            Ok(sched) => Some(sched),
            Err(err) => {
                warn!(
                    "mutated trace no longer replays ({}), keeping original",
                    err
                );
                None
            }
        }
    }

    // One full sketch walk: repeatedly pick an applicable (block, rule) pair
    // until nothing applies, every block is terminal, or the step bound hits.
    fn grow_sketch(&mut self, strategy: SketchStrategy) -> Result<Schedule, ApplyError> {
        let mut sched = Schedule::new(
            self.task.seed.deep_copy(),
            fork_state(&mut self.rand_state),
        );
        let mut applied: HashSet<(String, &'static str)> = HashSet::new();
        let mut terminal: HashSet<String> = HashSet::new();

        for _ in 0..MAX_SKETCH_STEPS {
            let mut candidates: Vec<(crate::ir::HandlePath, String, usize)> = Vec::new();
            for block in sched.blocks() {
                let Ok(node) = sched.block_at(&block) else {
                    continue;
                };
                let name = node.name.clone();
                if terminal.contains(&name) {
                    continue;
                }
                for (ri, rule) in self.sketch_rules.iter().enumerate() {
                    if applied.contains(&(name.clone(), rule.name())) {
                        continue;
                    }
                    if rule.applicable(&sched, &block) {
                        candidates.push((block.clone(), name.clone(), ri));
                    }
                }
            }
            if candidates.is_empty() {
                break;
            }

            let choice = match strategy {
                SketchStrategy::RulePrune => {
                    let weights: Vec<f64> = candidates
                        .iter()
                        .map(|(_, _, ri)| self.sketch_rules[*ri].priority())
                        .collect();
                    match sample_weighted(&weights, &mut self.rand_state) {
                        Some(i) => i,
                        None => break,
                    }
                }
                SketchStrategy::RandomPrune => {
                    sample_uniform_int(0, candidates.len() as i64, &mut self.rand_state) as usize
                }
            };
            let (block, name, ri) = candidates.swap_remove(choice);
            let rule = &self.sketch_rules[ri];

            // Rule-internal draws come from the schedule's own fork so that
            // sibling sketches stay independent.
            let mut rule_rand = sched.rand_state;
            let outcome = rule.apply(&mut sched, &block, &mut rule_rand);
            sched.rand_state = rule_rand;

            applied.insert((name.clone(), rule.name()));
            match outcome {
                Ok(SketchOutcome::Continue) => {}
                Ok(SketchOutcome::Terminal) => {
                    terminal.insert(name);
                }
                // An applicability race with an earlier rule; the block just
                // stops taking this rule.
                Err(ApplyError::NotApplicable(reason)) => {
                    debug!("rule {} stopped applying to {}: {}", rule.name(), name, reason);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::AnalyticalCostModel;
    use crate::rng::normalize_state;
    use crate::task::{demo_matmul_task, TargetKind};
    use anyhow::anyhow;

    fn space(seed: i64) -> SearchSpace {
        SearchSpace::new(
            demo_matmul_task(64, 64, 32, TargetKind::Cpu),
            normalize_state(seed),
        )
    }

    #[test]
    fn sketches_are_distinct_by_fingerprint() {
        let mut space = space(11);
        let sketches = space.generate_sketches(6, SketchStrategy::RulePrune);
        assert!(!sketches.is_empty());
        let mut fps: Vec<u128> = sketches.iter().map(|s| s.fingerprint()).collect();
        fps.sort_unstable();
        fps.dedup();
        assert_eq!(fps.len(), sketches.len());
        for sketch in &sketches {
            sketch.schedule.module().validate().unwrap();
            assert!(!sketch.is_scored());
        }
    }

    #[test]
    fn generation_is_deterministic_under_a_fixed_seed() {
        let run = |seed| {
            space(seed)
                .generate_sketches(5, SketchStrategy::RulePrune)
                .iter()
                .map(|s| s.fingerprint())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(17), run(17));
        assert_ne!(run(17), run(18));
    }

    #[test]
    fn random_prune_also_replays() {
        let mut space = space(23);
        for sketch in space.generate_sketches(4, SketchStrategy::RandomPrune) {
            let replayed = Schedule::replay(
                demo_matmul_task(64, 64, 32, TargetKind::Cpu).seed,
                sketch.schedule.trace(),
                normalize_state(1),
            )
            .unwrap();
            assert_eq!(replayed.fingerprint(), sketch.fingerprint());
        }
    }

    #[test]
    fn mutate_scores_every_outcome() {
        let mut space = space(31);
        let sketch = space
            .generate_sketches(1, SketchStrategy::RulePrune)
            .remove(0);
        let scored = space.get_schedule_mutate(&sketch, &AnalyticalCostModel);
        assert!(scored.is_scored());
        assert!(scored.predicted_cost.is_finite());
        scored.schedule.module().validate().unwrap();
    }

    #[test]
    fn mutate_leaves_input_state_untouched() {
        let mut space = space(37);
        let sketch = space
            .generate_sketches(1, SketchStrategy::RulePrune)
            .remove(0);
        let fp_before = sketch.fingerprint();
        let rand_before = sketch.schedule.rand_state;
        let _ = space.get_schedule_mutate(&sketch, &AnalyticalCostModel);
        assert_eq!(sketch.fingerprint(), fp_before);
        assert_eq!(sketch.schedule.rand_state, rand_before);
    }

    #[test]
    fn mutation_without_targets_returns_the_input_schedule() {
        let task = demo_matmul_task(64, 64, 32, TargetKind::Cpu);
        let mut space = SearchSpace::with_mutate_rules(
            task.clone(),
            normalize_state(7),
            vec![crate::rules::mutate::MutateComputeLocation.into()],
        );
        // An empty trace holds no compute_at record to reroute.
        let state = SearchState::new(Schedule::new(task.seed.deep_copy(), normalize_state(1)));
        let scored = space.get_schedule_mutate(&state, &AnalyticalCostModel);
        assert_eq!(scored.fingerprint(), state.fingerprint());
        assert!(scored.is_scored());
    }

    #[test]
    fn failing_cost_model_yields_infinite_cost() {
        struct FailingModel;
        impl CostModel for FailingModel {
            fn predict(&self, _: &crate::ir::ModuleIr) -> anyhow::Result<f64> {
                Err(anyhow!("scorer offline"))
            }
        }
        let mut space = space(41);
        let sketch = space
            .generate_sketches(1, SketchStrategy::RulePrune)
            .remove(0);
        let scored = space.get_schedule_mutate(&sketch, &FailingModel);
        assert!(scored.predicted_cost.is_infinite());
    }
}
