//! Mutation rules: perturb one record of an existing trace.
//!
//! A mutation rewrites the numeric operands of a single record and leaves
//! the rest of the trace alone. Rewritten records drop their recorded result
//! handles; replay recomputes them. Whether the rewritten tail still applies
//! is the caller's problem: [crate::search_space::SearchSpace] replays the
//! mutated trace and falls back to the original on failure.

use crate::ir::schedule::Schedule;
use crate::ir::{HandlePath, ModuleIr};
use crate::rng::{normalize_state, sample_uniform_int, RandState};
use crate::rules::sketch::AUTO_UNROLL_STEPS;
use crate::trace::{Operand, ScheduleTrace, TraceOp, TraceRecord};
use crate::utils::factors;
use enum_dispatch::enum_dispatch;

#[enum_dispatch]
pub trait MutateRuleApi {
    fn name(&self) -> &'static str;

    /// Relative draw weight in the top-level mutate step.
    fn weight(&self) -> f64;

    /// Returns a new trace with one record rewritten, or `None` when the
    /// trace holds nothing this rule can rewrite.
    fn apply(
        &self,
        trace: &ScheduleTrace,
        seed: &ModuleIr,
        rand: &mut RandState,
    ) -> Option<ScheduleTrace>;
}

#[enum_dispatch(MutateRuleApi)]
#[derive(Clone, Debug)]
pub enum MutateRule {
    MutateTileSize,
    MutateUnrollStep,
    MutateComputeLocation,
}

pub fn mutate_rule_registry() -> Vec<MutateRule> {
    vec![
        MutateTileSize.into(),
        MutateUnrollStep.into(),
        MutateComputeLocation.into(),
    ]
}

// Applies `trace[..upto]` to a fresh seed copy. The replay PRNG is
// irrelevant: primitives draw nothing.
fn replay_prefix(trace: &ScheduleTrace, upto: usize, seed: &ModuleIr) -> Option<Schedule> {
    let mut prefix = trace.clone();
    prefix.truncate(upto);
    Schedule::replay(seed.deep_copy(), &prefix, normalize_state(1)).ok()
}

fn rewritten(trace: &ScheduleTrace, idx: usize, record: TraceRecord) -> ScheduleTrace {
    let mut out = ScheduleTrace::new();
    for (i, r) in trace.records().iter().enumerate() {
        out.append(if i == idx { record.clone() } else { r.clone() });
    }
    out
}

fn pick<'a, T>(items: &'a [T], rand: &mut RandState) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    Some(&items[sample_uniform_int(0, items.len() as i64, rand) as usize])
}

/// Re-draws a split or tile factor from the legal divisors of the loop
/// extent the record was applied to.
#[derive(Clone, Copy, Debug)]
pub struct MutateTileSize;

impl MutateRuleApi for MutateTileSize {
    fn name(&self) -> &'static str {
        "mutate_tile_size"
    }

    fn weight(&self) -> f64 {
        1.0
    }

    fn apply(
        &self,
        trace: &ScheduleTrace,
        seed: &ModuleIr,
        rand: &mut RandState,
    ) -> Option<ScheduleTrace> {
        let candidates: Vec<usize> = trace
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r.op, TraceOp::Split | TraceOp::Tile))
            .map(|(i, _)| i)
            .collect();
        let idx = *pick(&candidates, rand)?;
        let record = trace.record_at(idx)?;

        match record.op {
            TraceOp::Split => {
                // Move one factor boundary: redistribute the product of an
                // adjacent factor pair.
                let old: Vec<i64> = record.operands[1..]
                    .iter()
                    .filter_map(Operand::as_int)
                    .collect();
                if old.len() < 2 {
                    return None;
                }
                let boundary =
                    sample_uniform_int(0, (old.len() - 1) as i64, rand) as usize;
                let product = old[boundary] * old[boundary + 1];
                let choices: Vec<i64> = factors(product)
                    .into_iter()
                    .filter(|&d| d != old[boundary + 1])
                    .collect();
                let new_inner = *pick(&choices, rand)?;
                let mut factors_out = old;
                factors_out[boundary] = product / new_inner;
                factors_out[boundary + 1] = new_inner;

                let mut operands: smallvec::SmallVec<[Operand; 4]> = smallvec::SmallVec::new();
                operands.push(record.operands[0].clone());
                operands.extend(factors_out.into_iter().map(Operand::Int));
                Some(rewritten(trace, idx, TraceRecord::new(TraceOp::Split, operands)))
            }
            TraceOp::Tile => {
                let prefix = replay_prefix(trace, idx, seed)?;
                let (pi, pj) = (
                    record.operands[0].as_loop()?,
                    record.operands[1].as_loop()?,
                );
                let which = sample_uniform_int(0, 2, rand) as usize;
                let (path, old) = if which == 0 {
                    (pi, record.operands[2].as_int()?)
                } else {
                    (pj, record.operands[3].as_int()?)
                };
                let extent = prefix.loop_at(path).ok()?.extent;
                let choices: Vec<i64> = factors(extent)
                    .into_iter()
                    .filter(|&d| d != old)
                    .collect();
                let new_factor = *pick(&choices, rand)?;

                let mut operands = record.operands.clone();
                operands[2 + which] = Operand::Int(new_factor);
                Some(rewritten(trace, idx, TraceRecord::new(TraceOp::Tile, operands)))
            }
            _ => unreachable!(),
        }
    }
}

/// Re-draws an auto-unroll depth hint.
#[derive(Clone, Copy, Debug)]
pub struct MutateUnrollStep;

impl MutateRuleApi for MutateUnrollStep {
    fn name(&self) -> &'static str {
        "mutate_unroll_step"
    }

    fn weight(&self) -> f64 {
        1.0
    }

    fn apply(
        &self,
        trace: &ScheduleTrace,
        _seed: &ModuleIr,
        rand: &mut RandState,
    ) -> Option<ScheduleTrace> {
        let candidates: Vec<usize> = trace
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.op == TraceOp::Pragma
                    && r.operands.get(1).and_then(Operand::as_str)
                        == Some("auto_unroll_max_step")
            })
            .map(|(i, _)| i)
            .collect();
        let idx = *pick(&candidates, rand)?;
        let record = trace.record_at(idx)?;
        let old = record.operands.get(2).and_then(Operand::as_int)?;

        let choices: Vec<i64> = AUTO_UNROLL_STEPS
            .iter()
            .copied()
            .filter(|&s| s != old)
            .collect();
        let new_step = *pick(&choices, rand)?;
        let mut operands = record.operands.clone();
        operands[2] = Operand::Int(new_step);
        Some(rewritten(trace, idx, TraceRecord::new(TraceOp::Pragma, operands)))
    }
}

/// Reroutes a compute-at record to a different consuming loop.
#[derive(Clone, Copy, Debug)]
pub struct MutateComputeLocation;

impl MutateRuleApi for MutateComputeLocation {
    fn name(&self) -> &'static str {
        "mutate_compute_location"
    }

    fn weight(&self) -> f64 {
        0.5
    }

    fn apply(
        &self,
        trace: &ScheduleTrace,
        seed: &ModuleIr,
        rand: &mut RandState,
    ) -> Option<ScheduleTrace> {
        let candidates: Vec<usize> = trace
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.op == TraceOp::ComputeAt)
            .map(|(i, _)| i)
            .collect();
        let idx = *pick(&candidates, rand)?;
        let record = trace.record_at(idx)?;
        let producer = record.operands[0].as_block()?;
        let current = record.operands[1].as_loop()?;

        let prefix = replay_prefix(trace, idx, seed)?;
        let dest = prefix.compute_of(producer).ok()?.dest.clone();
        let mut locations: Vec<HandlePath> = Vec::new();
        for block in prefix.blocks() {
            if block.expr != producer.expr || &block == producer {
                continue;
            }
            for loop_path in prefix.block_loops(&block).ok()? {
                if loop_path != *current && prefix.loop_consumes(&loop_path, &dest) {
                    locations.push(loop_path);
                }
            }
        }
        let new_loop = pick(&locations, rand)?.clone();

        let mut operands = record.operands.clone();
        operands[1] = Operand::Loop(new_loop);
        Some(rewritten(
            trace,
            idx,
            TraceRecord::new(TraceOp::ComputeAt, operands),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::normalize_state;
    use crate::task::{demo_matmul_task, TargetKind};
    use smallvec::smallvec;

    fn seed() -> ModuleIr {
        demo_matmul_task(64, 64, 32, TargetKind::Cpu).seed
    }

    fn tiled_schedule() -> Schedule {
        let mut sched = Schedule::new(seed(), normalize_state(1));
        let block = HandlePath::new(0, smallvec![1]);
        let loops = sched.block_loops(&block).unwrap();
        sched.tile(&loops[0], &loops[1], 16, 8).unwrap();
        let loops = sched.block_loops(&block).unwrap();
        let reduce = loops.last().unwrap().clone();
        sched.split(&reduce, &[4, 8]).unwrap();
        sched
    }

    #[test]
    fn tile_size_mutation_changes_one_factor_and_replays() {
        let sched = tiled_schedule();
        let mut rand = normalize_state(42);
        let mutated = MutateTileSize
            .apply(sched.trace(), &seed(), &mut rand)
            .expect("trace has split and tile records");
        assert_ne!(&mutated, sched.trace());
        assert_eq!(mutated.len(), sched.trace().len());

        let replayed = Schedule::replay(seed(), &mutated, normalize_state(1)).unwrap();
        replayed.module().validate().unwrap();
        assert_ne!(replayed.fingerprint(), sched.fingerprint());
    }

    #[test]
    fn tile_size_mutation_needs_a_candidate_record() {
        let sched = Schedule::new(seed(), normalize_state(1));
        let mut rand = normalize_state(2);
        assert!(MutateTileSize
            .apply(sched.trace(), &seed(), &mut rand)
            .is_none());
    }

    #[test]
    fn unroll_step_mutation_redraws_the_hint() {
        let mut sched = Schedule::new(seed(), normalize_state(1));
        let block = HandlePath::new(0, smallvec![1]);
        let outer = sched.block_loops(&block).unwrap()[0].clone();
        sched.pragma(&outer, "auto_unroll_max_step", 64).unwrap();

        let mut rand = normalize_state(3);
        let mutated = MutateUnrollStep
            .apply(sched.trace(), &seed(), &mut rand)
            .unwrap();
        let new_step = mutated.record_at(0).unwrap().operands[2]
            .as_int()
            .unwrap();
        assert_ne!(new_step, 64);
        assert!(AUTO_UNROLL_STEPS.contains(&new_step));
    }

    #[test]
    fn compute_location_mutation_moves_to_another_consuming_loop() {
        let mut sched = Schedule::new(seed(), normalize_state(1));
        let producer = HandlePath::new(0, smallvec![0]);
        let consumer = HandlePath::new(0, smallvec![1]);
        let loops = sched.block_loops(&consumer).unwrap();
        sched.compute_at(&producer, &loops[1]).unwrap();

        let mut rand = normalize_state(4);
        let mutated = MutateComputeLocation
            .apply(sched.trace(), &seed(), &mut rand)
            .unwrap();
        assert_ne!(&mutated, sched.trace());

        let replayed = Schedule::replay(seed(), &mutated, normalize_state(1)).unwrap();
        replayed.module().validate().unwrap();
    }

    #[test]
    fn registry_draws_cover_all_rules() {
        let rules = mutate_rule_registry();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.weight() > 0.0));
    }
}
