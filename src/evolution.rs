//! The evolutionary search orchestrator.
//!
//! One round: pull warm starts from the database, fill the population with
//! rule-prune sketches, expand it by crossover, apply one scored mutation to
//! every individual, keep the best under the measurement budget, and
//! interleave them with random sketches under the epsilon-greedy policy,
//! deduplicating against everything returned before.

use crate::bestset::BoundedBestSet;
use crate::cost::CostModel;
use crate::database::TuningDatabase;
use crate::ir::schedule::Schedule;
use crate::ir::ModuleIr;
use crate::rng::{fork_state, normalize_state, sample_uniform_int, RandState};
use crate::search_space::{SearchSpace, SketchStrategy};
use crate::state::SearchState;
use crate::task::{register_initial_module, TuneTask};
use crate::trace::ScheduleTrace;
use crate::tuning::{SearchError, TuningOptions};
use log::{debug, warn};
use std::collections::HashSet;

pub struct EvolutionarySearch<'a, M: CostModel> {
    task: TuneTask,
    cost_model: &'a M,
    database: &'a TuningDatabase,
    rand_state: RandState,
    search_space: SearchSpace,
    visited_candidates: HashSet<u128>,
}

impl<'a, M: CostModel> EvolutionarySearch<'a, M> {
    pub fn new(
        task: TuneTask,
        cost_model: &'a M,
        database: &'a TuningDatabase,
        rand_seed: i64,
    ) -> Self {
        let mut rand_state = normalize_state(rand_seed);
        register_initial_module(&task.key, &task.seed);
        let search_space = SearchSpace::new(task.clone(), fork_state(&mut rand_state));
        EvolutionarySearch {
            task,
            cost_model,
            database,
            rand_state,
            search_space,
            visited_candidates: HashSet::new(),
        }
    }

    /// The single best candidate of one round, if any.
    pub fn search_best(&mut self, options: &TuningOptions) -> Result<Option<SearchState>, SearchError> {
        Ok(self.search_module_expr_bests(options)?.into_iter().next())
    }

    /// One evolution round without the epsilon-greedy interleave: the
    /// lowest-cost candidates of the mutated population, ascending.
    pub fn search_module_expr_bests(
        &mut self,
        options: &TuningOptions,
    ) -> Result<Vec<SearchState>, SearchError> {
        options.validate()?;
        debug!(
            "starting round for {}: visited_candidates={}",
            self.task.key,
            self.visited_candidates.len()
        );

        let warm_starts = self.database_warm_starts(options.pick_database_topk);
        let sketch_num = options
            .init_population_num
            .saturating_sub(warm_starts.len());
        let sketches = self
            .search_space
            .generate_sketches(sketch_num, SketchStrategy::RulePrune);
        debug!(
            "population: {} warm starts, {} sketches",
            warm_starts.len(),
            sketches.len()
        );

        let mut population = warm_starts;
        population.extend(sketches);
        self.evolve(population, options)
    }

    /// The primary entry point: one round of evolution followed by the
    /// epsilon-greedy interleave against random sketches.
    pub fn search_eps_greedy(
        &mut self,
        options: &TuningOptions,
    ) -> Result<Vec<SearchState>, SearchError> {
        let bests = self.search_module_expr_bests(options)?;
        let random_num = options
            .init_population_num
            .saturating_sub(options.pick_database_topk);
        let randoms = self
            .search_space
            .generate_sketches(random_num, SketchStrategy::RandomPrune);
        Ok(self.pick_next_generation_eps_greedy(
            bests,
            randoms,
            options.num_samples_per_iteration,
            options.eps_greedy,
        ))
    }

    fn database_warm_starts(&mut self, topk: usize) -> Vec<SearchState> {
        if topk == 0 {
            return Vec::new();
        }
        let records = self.database.get_top_k(&self.task.key, topk);
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let rand = fork_state(&mut self.rand_state);
            match Schedule::replay(self.task.seed.deep_copy(), &record.trace, rand) {
                Ok(sched) => out.push(SearchState::scored(sched, record.predicted_cost)),
                Err(err) => warn!(
                    "stored trace for {} no longer replays, dropping warm start: {}",
                    self.task.key, err
                ),
            }
        }
        out
    }

    /// Recombines two parents expr-by-expr. The child inherits, per
    /// position, the chosen parent's sub-expr together with the slice of its
    /// trace that produced it, so the child replays like any other state.
    fn cross_over(
        &mut self,
        father: &SearchState,
        mother: &SearchState,
        uniform: bool,
    ) -> Result<SearchState, SearchError> {
        let father_exprs = &father.schedule.module().exprs;
        let mother_exprs = &mother.schedule.module().exprs;
        if father_exprs.len() != mother_exprs.len() {
            return Err(SearchError::InvalidConfiguration(format!(
                "crossover parents must hold the same number of module exprs ({} vs {})",
                father_exprs.len(),
                mother_exprs.len()
            )));
        }

        let mut exprs = Vec::with_capacity(father_exprs.len());
        let mut trace = ScheduleTrace::new();
        for i in 0..father_exprs.len() {
            // The legacy die favors the mother 2:1; only a roll of zero
            // takes the father.
            let die_sides = if uniform { 2 } else { 3 };
            let parent = if sample_uniform_int(0, die_sides, &mut self.rand_state) == 0 {
                father
            } else {
                mother
            };
            exprs.push(parent.schedule.module().exprs[i].clone());
            for record in parent.schedule.trace().records_for_expr(i) {
                trace.append(record.clone());
            }
        }
        let module = ModuleIr::new(exprs);
        debug_assert!(module.validate().is_ok());
        let child = Schedule::from_parts(module, trace, fork_state(&mut self.rand_state));
        Ok(SearchState::new(child))
    }

    fn evolve(
        &mut self,
        population: Vec<SearchState>,
        options: &TuningOptions,
    ) -> Result<Vec<SearchState>, SearchError> {
        let generation_num = population.len();
        if generation_num == 0 {
            return Ok(Vec::new());
        }
        let mut evolution = population;
        if generation_num >= 2 {
            for _ in 0..options.cross_over_num {
                let first =
                    sample_uniform_int(0, generation_num as i64, &mut self.rand_state) as usize;
                let mut second =
                    sample_uniform_int(0, generation_num as i64, &mut self.rand_state) as usize;
                while second == first {
                    second = sample_uniform_int(0, generation_num as i64, &mut self.rand_state)
                        as usize;
                }
                let child = self.cross_over(
                    &evolution[first],
                    &evolution[second],
                    options.crossover_uniform,
                )?;
                evolution.push(child);
            }
        } else if options.cross_over_num > 0 {
            debug!("population of one, skipping crossover");
        }

        let cost_model = self.cost_model;
        let mut best = BoundedBestSet::new(options.num_samples_per_iteration);
        for state in &evolution {
            let scored = self.search_space.get_schedule_mutate(state, cost_model);
            best.insert(scored.predicted_cost, scored);
        }
        Ok(best
            .into_sorted_vec()
            .into_iter()
            .map(|(_, state)| state)
            .collect())
    }

    fn pick_next_generation_eps_greedy(
        &mut self,
        bests: Vec<SearchState>,
        randoms: Vec<SearchState>,
        num: usize,
        eps_greedy: f64,
    ) -> Vec<SearchState> {
        let num_rands = (num as f64 * eps_greedy).floor() as usize;
        let num_bests = num - num_rands;

        let mut result: Vec<SearchState> = Vec::with_capacity(num);
        let mut deduplicated = 0usize;
        let mut best_idx = 0usize;
        let mut rand_idx = 0usize;
        while result.len() < num {
            let selected = if result.len() < num_bests && best_idx < bests.len() {
                best_idx += 1;
                &bests[best_idx - 1]
            } else if rand_idx < randoms.len() {
                rand_idx += 1;
                &randoms[rand_idx - 1]
            } else if best_idx < bests.len() {
                best_idx += 1;
                &bests[best_idx - 1]
            } else {
                break;
            };

            if self.visited_candidates.insert(selected.fingerprint()) {
                result.push(selected.clone());
            } else {
                deduplicated += 1;
            }
        }

        debug!(
            "eps-greedy pick: bests={} randoms={} num={} eps={} deduplicated={} returned={}",
            bests.len(),
            randoms.len(),
            num,
            eps_greedy,
            deduplicated,
            result.len()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::AnalyticalCostModel;
    use crate::database::TuningRecord;
    use crate::ir::{ExprArena, HandlePath};
    use crate::task::{demo_matmul_task, TargetKind};
    use anyhow::anyhow;
    use proptest::prelude::*;
    use smallvec::smallvec;
    use std::cell::Cell;

    fn task() -> TuneTask {
        demo_matmul_task(64, 64, 32, TargetKind::Cpu)
    }

    fn options(
        init: usize,
        topk: usize,
        cross: usize,
        samples: usize,
        eps: f64,
    ) -> TuningOptions {
        TuningOptions {
            init_population_num: init,
            pick_database_topk: topk,
            cross_over_num: cross,
            num_samples_per_iteration: samples,
            eps_greedy: eps,
            crossover_uniform: false,
        }
    }

    /// Scores each prediction with its call index.
    struct CountingModel(Cell<u64>);

    impl CountingModel {
        fn new() -> Self {
            CountingModel(Cell::new(0))
        }
    }

    impl CostModel for CountingModel {
        fn predict(&self, _: &ModuleIr) -> anyhow::Result<f64> {
            let n = self.0.get();
            self.0.set(n + 1);
            Ok(n as f64)
        }
    }

    struct ConstModel(f64);

    impl CostModel for ConstModel {
        fn predict(&self, _: &ModuleIr) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    /// Fails every third scoring call.
    struct FlakyModel(Cell<u64>);

    impl CostModel for FlakyModel {
        fn predict(&self, _: &ModuleIr) -> anyhow::Result<f64> {
            let n = self.0.get();
            self.0.set(n + 1);
            if n % 3 == 2 {
                Err(anyhow!("intermittent scorer failure"))
            } else {
                Ok(n as f64)
            }
        }
    }

    fn seeded_database(task: &TuneTask, factors: &[i64]) -> TuningDatabase {
        let db = TuningDatabase::new(None);
        for (i, &factor) in factors.iter().enumerate() {
            let mut sched = Schedule::new(task.seed.deep_copy(), normalize_state(1));
            let block = HandlePath::new(0, smallvec![1]);
            let loops = sched.block_loops(&block).unwrap();
            sched.split(&loops[0], &[factor, 64 / factor]).unwrap();
            db.insert(TuningRecord::new(
                task.key.clone(),
                sched.trace().clone(),
                i as f64 + 1.0,
            ));
        }
        db
    }

    // Costs are assigned in population order, so the returned candidates
    // must be the first `num_samples` scored, in scoring order.
    #[test]
    fn bests_are_the_lowest_scored_in_population_order() {
        let db = TuningDatabase::new(None);
        let model = CountingModel::new();
        let mut search = EvolutionarySearch::new(task(), &model, &db, 7);
        let bests = search
            .search_module_expr_bests(&options(8, 0, 0, 4, 0.0))
            .unwrap();
        assert!(!bests.is_empty());
        let costs: Vec<f64> = bests.iter().map(|s| s.predicted_cost).collect();
        let expected: Vec<f64> = (0..costs.len() as u64).map(|i| i as f64).collect();
        assert_eq!(costs, expected);
    }

    #[test]
    fn eps_greedy_splits_slots_between_bests_and_randoms() {
        let db = TuningDatabase::new(None);
        let model = ConstModel(1.0);
        let mut search = EvolutionarySearch::new(task(), &model, &db, 13);
        let picked = search
            .search_eps_greedy(&options(8, 0, 2, 4, 0.5))
            .unwrap();
        assert_eq!(picked.len(), 4);

        // Evolution outputs are scored; random sketches are not.
        let from_bests = picked.iter().filter(|s| s.is_scored()).count();
        let from_randoms = picked.iter().filter(|s| !s.is_scored()).count();
        assert_eq!(from_bests, 2);
        assert_eq!(from_randoms, 2);

        let mut fps: Vec<u128> = picked.iter().map(|s| s.fingerprint()).collect();
        fps.sort_unstable();
        fps.dedup();
        assert_eq!(fps.len(), 4);
    }

    #[test]
    fn database_records_warm_start_the_population() {
        let task = task();
        let db = seeded_database(&task, &[2, 4, 8]);
        let model = ConstModel(1.0);
        let mut search = EvolutionarySearch::new(task, &model, &db, 19);
        let bests = search
            .search_module_expr_bests(&options(5, 3, 0, 5, 0.0))
            .unwrap();
        assert_eq!(bests.len(), 5);
        assert!(bests.iter().all(|s| s.predicted_cost == 1.0));
    }

    #[test]
    fn stale_database_traces_are_dropped_not_fatal() {
        let task = task();
        let db = TuningDatabase::new(None);
        // A trace recorded against some other module shape.
        let mut other = ExprArena::new();
        other.build_stage("s", "y", &["x"], &[("i", 8), ("j", 8)], &[], None);
        let other = ModuleIr::new(vec![other]);
        let mut sched = Schedule::new(other.deep_copy(), normalize_state(1));
        let loops = sched
            .block_loops(&HandlePath::new(0, smallvec![0]))
            .unwrap();
        sched.split(&loops[1], &[2, 4]).unwrap();
        db.insert(TuningRecord::new(task.key.clone(), sched.trace().clone(), 0.5));

        let model = ConstModel(1.0);
        let mut search = EvolutionarySearch::new(task, &model, &db, 23);
        let bests = search
            .search_module_expr_bests(&options(4, 1, 0, 4, 0.0))
            .unwrap();
        // The stale warm start vanished; sketches filled the round anyway.
        assert!(!bests.is_empty());
    }

    #[test]
    fn flaky_cost_model_never_aborts_the_round() {
        let db = TuningDatabase::new(None);
        let model = FlakyModel(Cell::new(0));
        let mut search = EvolutionarySearch::new(task(), &model, &db, 29);
        let bests = search
            .search_eps_greedy(&options(6, 0, 3, 6, 0.0))
            .unwrap();
        assert!(!bests.is_empty());
        // Failed scorings became +inf and sank to the bottom.
        for window in bests.windows(2) {
            assert!(window[0].predicted_cost <= window[1].predicted_cost);
        }
    }

    #[test]
    fn consecutive_rounds_return_disjoint_candidates() {
        let db = TuningDatabase::new(None);
        let model = AnalyticalCostModel;
        let mut search = EvolutionarySearch::new(task(), &model, &db, 31);
        let opts = options(8, 0, 4, 3, 0.3);
        let first = search.search_eps_greedy(&opts).unwrap();
        let second = search.search_eps_greedy(&opts).unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());

        let first_fps: std::collections::HashSet<u128> =
            first.iter().map(|s| s.fingerprint()).collect();
        for state in &second {
            assert!(!first_fps.contains(&state.fingerprint()));
        }
    }

    #[test]
    fn crossover_on_mismatched_expr_counts_is_invalid_configuration() {
        let db = TuningDatabase::new(None);
        let model = ConstModel(1.0);
        let task = task();
        let mut search = EvolutionarySearch::new(task.clone(), &model, &db, 37);

        let one = SearchState::new(Schedule::new(task.seed.deep_copy(), normalize_state(1)));
        let mut two_exprs = task.seed.deep_copy();
        two_exprs.exprs.push(ExprArena::new());
        let two = SearchState::new(Schedule::new(two_exprs, normalize_state(1)));

        let err = search.cross_over(&one, &two, false).unwrap_err();
        assert!(matches!(err, SearchError::InvalidConfiguration(_)));
    }

    #[test]
    fn crossover_children_replay_from_their_traces() {
        let db = TuningDatabase::new(None);
        let model = AnalyticalCostModel;
        let task = task();
        let mut search = EvolutionarySearch::new(task.clone(), &model, &db, 41);
        let sketches = search
            .search_space
            .generate_sketches(2, SketchStrategy::RulePrune);
        assert_eq!(sketches.len(), 2);

        let child = search
            .cross_over(&sketches[0], &sketches[1], false)
            .unwrap();
        child.schedule.module().validate().unwrap();
        let replayed = Schedule::replay(
            task.seed.deep_copy(),
            child.schedule.trace(),
            normalize_state(1),
        )
        .unwrap();
        assert_eq!(replayed.fingerprint(), child.fingerprint());
    }

    #[test]
    fn returned_states_replay_to_their_own_fingerprints() {
        let db = TuningDatabase::new(None);
        let model = AnalyticalCostModel;
        let task = task();
        let mut search = EvolutionarySearch::new(task.clone(), &model, &db, 43);
        let picked = search
            .search_eps_greedy(&options(6, 0, 4, 6, 0.2))
            .unwrap();
        assert!(!picked.is_empty());
        for state in &picked {
            let replayed = Schedule::replay(
                task.seed.deep_copy(),
                state.schedule.trace(),
                normalize_state(1),
            )
            .unwrap();
            assert_eq!(replayed.fingerprint(), state.fingerprint());
        }
    }

    #[test]
    fn invalid_options_abort_before_any_work() {
        let db = TuningDatabase::new(None);
        let model = ConstModel(1.0);
        let mut search = EvolutionarySearch::new(task(), &model, &db, 47);
        let bad = options(0, 0, 0, 4, 0.0);
        assert!(search.search_module_expr_bests(&bad).is_err());
        let bad_eps = options(4, 0, 0, 4, 1.5);
        assert!(search.search_eps_greedy(&bad_eps).is_err());
    }

    #[test]
    fn search_best_returns_the_cheapest() {
        let db = TuningDatabase::new(None);
        let model = CountingModel::new();
        let mut search = EvolutionarySearch::new(task(), &model, &db, 53);
        let best = search
            .search_best(&options(6, 0, 0, 3, 0.0))
            .unwrap()
            .expect("population is non-empty");
        assert_eq!(best.predicted_cost, 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        // Identical seeds and inputs must reproduce the identical round.
        #[test]
        fn rounds_are_deterministic(seed in 1i64..10_000) {
            let run = |seed: i64| {
                let db = TuningDatabase::new(None);
                let model = AnalyticalCostModel;
                let mut search = EvolutionarySearch::new(task(), &model, &db, seed);
                search
                    .search_eps_greedy(&options(6, 0, 3, 4, 0.25))
                    .unwrap()
                    .iter()
                    .map(|s| (s.fingerprint(), s.predicted_cost.to_bits()))
                    .collect::<Vec<_>>()
            };
            prop_assert_eq!(run(seed), run(seed));
        }

        // Forked child draws never perturb the parent sequence.
        #[test]
        fn crossover_leaves_parent_schedules_intact(seed in 1i64..10_000) {
            let db = TuningDatabase::new(None);
            let model = AnalyticalCostModel;
            let t = task();
            let mut search = EvolutionarySearch::new(t, &model, &db, seed);
            let sketches = search
                .search_space
                .generate_sketches(2, SketchStrategy::RulePrune);
            prop_assume!(sketches.len() == 2);

            let fp_a = sketches[0].fingerprint();
            let rand_a = sketches[0].schedule.rand_state;
            let fp_b = sketches[1].fingerprint();
            let rand_b = sketches[1].schedule.rand_state;
            let _child = search.cross_over(&sketches[0], &sketches[1], false).unwrap();
            prop_assert_eq!(sketches[0].fingerprint(), fp_a);
            prop_assert_eq!(sketches[0].schedule.rand_state, rand_a);
            prop_assert_eq!(sketches[1].fingerprint(), fp_b);
            prop_assert_eq!(sketches[1].schedule.rand_state, rand_b);
        }
    }
}
