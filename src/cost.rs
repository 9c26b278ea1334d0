//! Predicted-cost interface and the built-in analytical model.

use crate::ir::{ExprArena, IrNode, LoopKind, ModuleIr, NodeId};
use anyhow::Result;

/// Maps a scheduled IR to a scalar predicted cost.
///
/// Implementations must be deterministic. A returned error is absorbed by
/// the search as `+inf` cost; it never aborts a round.
pub trait CostModel {
    fn predict(&self, module: &ModuleIr) -> Result<f64>;
}

/// A structure-only heuristic: estimated memory traffic discounted by the
/// parallelism and locality annotations a schedule introduces. Good enough
/// to rank schedule variants of the same compute without running anything.
pub struct AnalyticalCostModel;

impl CostModel for AnalyticalCostModel {
    fn predict(&self, module: &ModuleIr) -> Result<f64> {
        let mut total = 0.0;
        for arena in &module.exprs {
            for &root in arena.roots() {
                total += subtree_cost(arena, root, 1.0);
            }
        }
        Ok(total)
    }
}

fn subtree_cost(arena: &ExprArena, id: NodeId, trip: f64) -> f64 {
    match arena.node(id) {
        IrNode::Block(b) => {
            let mut cost = 0.0;
            for &child in &b.children {
                cost += subtree_cost(arena, child, trip);
            }
            // Aligned staging buffers trim a sliver of traffic.
            if b.annotations.iter().any(|(k, _)| k == "storage_align.factor") {
                cost *= 0.98;
            }
            cost
        }
        IrNode::Loop(l) => {
            let discount = match l.kind {
                LoopKind::Serial => 1.0,
                LoopKind::Parallel => 1.0 / (l.extent.min(8) as f64),
                LoopKind::Vectorized => 1.0 / (l.extent.min(4) as f64),
                LoopKind::Unrolled => {
                    if l.extent <= 16 {
                        0.9
                    } else {
                        1.1
                    }
                }
                LoopKind::Bound(_) => 1.0 / (l.extent.min(32) as f64),
            };
            let inner_trip = trip * l.extent as f64 * discount;
            let unroll_hint = l
                .annotations
                .iter()
                .find(|(k, _)| k == "auto_unroll_max_step")
                .map(|(_, v)| *v)
                .unwrap_or(0);
            let hint_discount = match unroll_hint {
                0 => 1.0,
                1..=64 => 0.95,
                _ => 0.99,
            };
            l.children
                .iter()
                .map(|&c| subtree_cost(arena, c, inner_trip))
                .sum::<f64>()
                * hint_discount
        }
        IrNode::Compute(c) => trip * (1.0 + 0.5 * c.reads.len() as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::schedule::Schedule;
    use crate::ir::{HandlePath, ReduceOp};
    use crate::rng::normalize_state;
    use smallvec::smallvec;

    fn matmul_module() -> ModuleIr {
        let mut arena = ExprArena::new();
        arena.build_stage(
            "matmul",
            "c",
            &["a", "b"],
            &[("i", 64), ("j", 64)],
            &[("k", 32)],
            Some(ReduceOp::Sum),
        );
        ModuleIr::new(vec![arena])
    }

    #[test]
    fn cost_scales_with_trip_count() {
        let small = {
            let mut arena = ExprArena::new();
            arena.build_stage("s", "y", &["x"], &[("i", 8)], &[], None);
            ModuleIr::new(vec![arena])
        };
        let model = AnalyticalCostModel;
        let small_cost = model.predict(&small).unwrap();
        let big_cost = model.predict(&matmul_module()).unwrap();
        assert!(small_cost > 0.0);
        assert!(big_cost > small_cost);
    }

    #[test]
    fn parallelism_reduces_predicted_cost() {
        let model = AnalyticalCostModel;
        let base = model.predict(&matmul_module()).unwrap();

        let mut sched = Schedule::new(matmul_module(), normalize_state(1));
        let block = HandlePath::new(0, smallvec![0]);
        let loops = sched.block_loops(&block).unwrap();
        sched.parallel(&loops[0]).unwrap();
        let parallel_cost = model.predict(sched.module()).unwrap();
        assert!(parallel_cost < base);
    }

    #[test]
    fn prediction_is_deterministic() {
        let model = AnalyticalCostModel;
        let module = matmul_module();
        assert_eq!(
            model.predict(&module).unwrap().to_bits(),
            model.predict(&module).unwrap().to_bits()
        );
    }
}
