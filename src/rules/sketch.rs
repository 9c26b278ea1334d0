//! Generation rules: synthesize a schedule from the raw lowered IR.
//!
//! Each rule declares an applicability predicate over a block and a
//! stochastic apply that appends one or more trace records. Sketch growth
//! for a block stops when no rule applies or a rule reports
//! [SketchOutcome::Terminal].

use crate::ir::schedule::{ApplyError, Schedule};
use crate::ir::{HandlePath, LoopKind, ThreadAxis};
use crate::rng::{sample_uniform_int, RandState};
use crate::task::TargetKind;
use crate::utils::factors;
use enum_dispatch::enum_dispatch;

/// Whether the block can keep growing after a rule fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SketchOutcome {
    Continue,
    Terminal,
}

#[enum_dispatch]
pub trait SketchRuleApi {
    fn name(&self) -> &'static str;

    /// Static priority used by the rule-prune strategy.
    fn priority(&self) -> f64;

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool;

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError>;
}

#[enum_dispatch(SketchRuleApi)]
#[derive(Clone, Debug)]
pub enum SketchRule {
    AutoInline,
    MultiLevelTiling,
    ReductionFactor,
    CacheReadWrite,
    ThreadBinding,
    AutoUnroll,
}

/// The full generation rule set for a target. Order is the tie-free identity
/// of each rule; selection among applicable rules is the strategy's job.
pub fn sketch_rule_registry(target: TargetKind) -> Vec<SketchRule> {
    vec![
        AutoInline.into(),
        MultiLevelTiling { target }.into(),
        ReductionFactor.into(),
        CacheReadWrite.into(),
        ThreadBinding { target }.into(),
        AutoUnroll.into(),
    ]
}

// Samples a tile factor from the loop extent's divisors, preferring
// non-trivial ones when any exist.
fn sample_tile_factor(extent: i64, rand: &mut RandState) -> i64 {
    let divisors = factors(extent);
    let nontrivial: Vec<i64> = divisors
        .iter()
        .copied()
        .filter(|&d| d != 1 && d != extent)
        .collect();
    let pool = if nontrivial.is_empty() {
        &divisors
    } else {
        &nontrivial
    };
    pool[sample_uniform_int(0, pool.len() as i64, rand) as usize]
}

fn all_own_loops_serial(sched: &Schedule, block: &HandlePath) -> bool {
    match sched.block_loops(block) {
        Ok(loops) => loops.iter().all(|p| {
            sched
                .loop_at(p)
                .map(|l| l.kind == LoopKind::Serial && l.annotations.is_empty())
                .unwrap_or(false)
        }),
        Err(_) => false,
    }
}

/// Inlines cheap elementwise producers into their consumers.
#[derive(Clone, Copy, Debug)]
pub struct AutoInline;

impl SketchRuleApi for AutoInline {
    fn name(&self) -> &'static str {
        "auto_inline"
    }

    fn priority(&self) -> f64 {
        3.0
    }

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool {
        if block.steps.len() != 1 || !all_own_loops_serial(sched, block) {
            return false;
        }
        match sched.compute_of(block) {
            Ok(c) => c.reduce.is_none() && sched.consumer_count(block.expr, &c.dest) >= 1,
            Err(_) => false,
        }
    }

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        _rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError> {
        sched.compute_inline(block)?;
        Ok(SketchOutcome::Terminal)
    }
}

/// Tiles the two outermost spatial loops, splits the dominant reduction
/// loop, and (on CPU) parallelizes and vectorizes the resulting nest.
#[derive(Clone, Copy, Debug)]
pub struct MultiLevelTiling {
    pub target: TargetKind,
}

impl SketchRuleApi for MultiLevelTiling {
    fn name(&self) -> &'static str {
        "multi_level_tiling"
    }

    fn priority(&self) -> f64 {
        2.0
    }

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool {
        if !all_own_loops_serial(sched, block) {
            return false;
        }
        let Ok(loops) = sched.block_loops(block) else {
            return false;
        };
        let spatial = loops
            .iter()
            .filter_map(|p| sched.loop_at(p).ok())
            .filter(|l| !l.is_reduce && l.extent > 1)
            .count();
        spatial >= 2
    }

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError> {
        let loops = sched.block_loops(block)?;
        let spatial: Vec<HandlePath> = loops
            .iter()
            .filter(|p| {
                sched
                    .loop_at(p)
                    .map(|l| !l.is_reduce && l.extent > 1)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let (i, j) = (&spatial[0], &spatial[1]);
        let fi = sample_tile_factor(sched.loop_at(i)?.extent, rand);
        let fj = sample_tile_factor(sched.loop_at(j)?.extent, rand);
        sched.tile(i, j, fi, fj)?;

        // Handles shifted under the new nest; re-derive them.
        let loops = sched.block_loops(block)?;
        if let Some(reduce) = loops
            .iter()
            .filter(|p| {
                sched
                    .loop_at(p)
                    .map(|l| l.is_reduce && l.extent > 1 && l.kind == LoopKind::Serial)
                    .unwrap_or(false)
            })
            .max_by_key(|p| sched.loop_at(p).map(|l| l.extent).unwrap_or(0))
        {
            let extent = sched.loop_at(reduce)?.extent;
            let fk = sample_tile_factor(extent, rand);
            if fk != extent {
                sched.split(reduce, &[extent / fk, fk])?;
            }
        }

        if self.target == TargetKind::Cpu {
            let loops = sched.block_loops(block)?;
            if let Some(outer) = loops.first() {
                sched.parallel(outer)?;
            }
            if let Some(innermost) = loops.iter().rev().find(|p| {
                sched
                    .loop_at(p)
                    .map(|l| {
                        !l.is_reduce && l.kind == LoopKind::Serial && l.extent <= 16
                    })
                    .unwrap_or(false)
            }) {
                // Vectorization only sticks on loops with no nested loop; let
                // the primitive reject the rest.
                let _ = sched.vectorize(innermost);
            }
        }
        Ok(SketchOutcome::Continue)
    }
}

/// Factors a large reduction into a partial stage plus a combiner.
#[derive(Clone, Copy, Debug)]
pub struct ReductionFactor;

const RFACTOR_MIN_EXTENT: i64 = 16;

impl SketchRuleApi for ReductionFactor {
    fn name(&self) -> &'static str {
        "reduction_factor"
    }

    fn priority(&self) -> f64 {
        1.0
    }

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool {
        if block.steps.len() != 1 || !all_own_loops_serial(sched, block) {
            return false;
        }
        let Ok(compute) = sched.compute_of(block) else {
            return false;
        };
        if compute.reduce.is_none() {
            return false;
        }
        let Ok(b) = sched.block_at(block) else {
            return false;
        };
        if b.name.ends_with(".rf") {
            return false;
        }
        let already = sched
            .blocks()
            .iter()
            .any(|p| {
                sched
                    .block_at(p)
                    .map(|other| other.name == format!("{}.rf", b.name))
                    .unwrap_or(false)
            });
        if already {
            return false;
        }
        sched
            .block_loops(block)
            .map(|loops| {
                loops.iter().any(|p| {
                    sched
                        .loop_at(p)
                        .map(|l| l.is_reduce && l.extent >= RFACTOR_MIN_EXTENT)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        _rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError> {
        let loops = sched.block_loops(block)?;
        let target = loops
            .iter()
            .filter(|p| {
                sched
                    .loop_at(p)
                    .map(|l| l.is_reduce && l.extent >= RFACTOR_MIN_EXTENT)
                    .unwrap_or(false)
            })
            .max_by_key(|p| sched.loop_at(p).map(|l| l.extent).unwrap_or(0))
            .cloned()
            .ok_or(ApplyError::NotApplicable("no reduce loop to factor"))?;
        sched.rfactor(block, &target)?;
        Ok(SketchOutcome::Continue)
    }
}

/// Stages one operand read and the destination write of a reduction block.
#[derive(Clone, Copy, Debug)]
pub struct CacheReadWrite;

impl SketchRuleApi for CacheReadWrite {
    fn name(&self) -> &'static str {
        "cache_read_write"
    }

    fn priority(&self) -> f64 {
        1.0
    }

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool {
        let Ok(compute) = sched.compute_of(block) else {
            return false;
        };
        if compute.reduce.is_none() || compute.reads.is_empty() {
            return false;
        }
        let Ok(b) = sched.block_at(block) else {
            return false;
        };
        // Fires once per block: the copy-out stage it creates is the marker.
        !sched.blocks().iter().any(|p| {
            sched
                .block_at(p)
                .map(|other| other.name == format!("{}.wb", b.name))
                .unwrap_or(false)
        })
    }

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError> {
        sched.cache_write(block)?;
        let reads = sched.compute_of(block)?.reads.len();
        let read_idx = sample_uniform_int(0, reads as i64, rand) as usize;
        sched.cache_read(block, read_idx)?;
        Ok(SketchOutcome::Continue)
    }
}

/// Binds the outer spatial loops to GPU grid and thread axes.
#[derive(Clone, Copy, Debug)]
pub struct ThreadBinding {
    pub target: TargetKind,
}

impl SketchRuleApi for ThreadBinding {
    fn name(&self) -> &'static str {
        "thread_binding"
    }

    fn priority(&self) -> f64 {
        2.0
    }

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool {
        if self.target != TargetKind::Gpu {
            return false;
        }
        let Ok(loops) = sched.block_loops(block) else {
            return false;
        };
        let mut spatial_serial = 0;
        for p in &loops {
            let Ok(l) = sched.loop_at(p) else {
                return false;
            };
            if matches!(l.kind, LoopKind::Bound(_)) {
                return false;
            }
            if !l.is_reduce && l.kind == LoopKind::Serial {
                spatial_serial += 1;
            }
        }
        if spatial_serial == 0 {
            return false;
        }
        // The grid axis must still be free somewhere in this expr.
        let blockx_taken = sched
            .blocks()
            .iter()
            .filter(|b| b.expr == block.expr)
            .flat_map(|b| sched.block_loops(b).unwrap_or_default())
            .any(|p| {
                sched
                    .loop_at(&p)
                    .map(|l| l.kind == LoopKind::Bound(ThreadAxis::BlockX))
                    .unwrap_or(false)
            });
        !blockx_taken
    }

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        _rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError> {
        let loops = sched.block_loops(block)?;
        let spatial: Vec<HandlePath> = loops
            .iter()
            .filter(|p| {
                sched
                    .loop_at(p)
                    .map(|l| !l.is_reduce && l.kind == LoopKind::Serial)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let mut bound = 0;
        for (path, axis) in spatial
            .iter()
            .zip([ThreadAxis::BlockX, ThreadAxis::ThreadX])
        {
            // Another block may hold the axis already; skip quietly.
            if sched.bind(path, axis).is_ok() {
                bound += 1;
            }
        }
        if bound == 0 {
            return Err(ApplyError::NotApplicable("no thread axis available"));
        }
        Ok(SketchOutcome::Continue)
    }
}

/// Attaches an unroll depth hint to the block's outermost loop and closes
/// the block for further sketching.
#[derive(Clone, Copy, Debug)]
pub struct AutoUnroll;

pub const AUTO_UNROLL_STEPS: [i64; 4] = [0, 16, 64, 512];

impl SketchRuleApi for AutoUnroll {
    fn name(&self) -> &'static str {
        "auto_unroll"
    }

    fn priority(&self) -> f64 {
        1.5
    }

    fn applicable(&self, sched: &Schedule, block: &HandlePath) -> bool {
        let Ok(loops) = sched.block_loops(block) else {
            return false;
        };
        let Some(outer) = loops.first() else {
            return false;
        };
        sched
            .loop_at(outer)
            .map(|l| !l.annotations.iter().any(|(k, _)| k == "auto_unroll_max_step"))
            .unwrap_or(false)
    }

    fn apply(
        &self,
        sched: &mut Schedule,
        block: &HandlePath,
        rand: &mut RandState,
    ) -> Result<SketchOutcome, ApplyError> {
        let loops = sched.block_loops(block)?;
        let outer = loops
            .first()
            .ok_or(ApplyError::NotApplicable("block has no loops"))?
            .clone();
        let step = AUTO_UNROLL_STEPS
            [sample_uniform_int(0, AUTO_UNROLL_STEPS.len() as i64, rand) as usize];
        sched.pragma(&outer, "auto_unroll_max_step", step)?;
        Ok(SketchOutcome::Terminal)
    }
}
