//! The scheduled-IR bundle and its transformation primitives.
//!
//! A [Schedule] pairs a [ModuleIr] with the [ScheduleTrace] that produced it
//! and a forked PRNG state for further stochastic transformation. Every
//! primitive validates applicability, edits the arena, and appends exactly
//! one trace record; [Schedule::replay] re-applies a trace to a fresh seed
//! and reproduces the arena bit for bit.

use crate::ir::{
    BlockNode, ComputeNode, ExprArena, HandlePath, IrError, IrNode, LoopKind, LoopNode, ModuleIr,
    NodeId, ThreadAxis,
};
use crate::rng::RandState;
use crate::trace::{Operand, ScheduleTrace, TraceOp, TraceRecord};
use smallvec::{smallvec, SmallVec};

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("handle {0} does not resolve to a {1}")]
    BadHandle(String, &'static str),
    #[error("transformation not applicable: {0}")]
    NotApplicable(&'static str),
    #[error("record for {0:?} has malformed operands")]
    MalformedRecord(TraceOp),
    #[error(transparent)]
    Ir(#[from] IrError),
}

type Results = SmallVec<[HandlePath; 2]>;

#[derive(Clone, Debug)]
pub struct Schedule {
    module: ModuleIr,
    trace: ScheduleTrace,
    pub rand_state: RandState,
}

impl Schedule {
    /// Wraps a seed module with an empty trace.
    pub fn new(seed: ModuleIr, rand_state: RandState) -> Self {
        Schedule {
            module: seed,
            trace: ScheduleTrace::new(),
            rand_state,
        }
    }

    /// Assembles a schedule from a module and the trace asserted to produce
    /// it. Used where the module was built directly (crossover) and a replay
    /// would only reconstruct what the caller already holds.
    pub fn from_parts(module: ModuleIr, trace: ScheduleTrace, rand_state: RandState) -> Self {
        Schedule {
            module,
            trace,
            rand_state,
        }
    }

    /// Re-applies `trace` to a fresh copy of the seed. Fails if any record no
    /// longer resolves or applies; on success the resulting module is
    /// bit-identical to the one the trace originally produced.
    pub fn replay(
        seed: ModuleIr,
        trace: &ScheduleTrace,
        rand_state: RandState,
    ) -> Result<Schedule, ApplyError> {
        let mut sched = Schedule::new(seed, rand_state);
        for record in trace.records() {
            // Result handles are recomputed, not trusted: a mutated record
            // may carry stale ones.
            let results = sched.perform(record.op, &record.operands)?;
            let mut replayed = TraceRecord::new(record.op, record.operands.clone());
            replayed.results = results;
            sched.trace.append(replayed);
        }
        Ok(sched)
    }

    pub fn module(&self) -> &ModuleIr {
        &self.module
    }

    pub fn trace(&self) -> &ScheduleTrace {
        &self.trace
    }

    pub fn fingerprint(&self) -> u128 {
        self.module.fingerprint()
    }

    // ---- queries -------------------------------------------------------

    /// All block handles in the module, outer blocks before nested ones.
    pub fn blocks(&self) -> Vec<HandlePath> {
        let mut out = Vec::new();
        for (expr, arena) in self.module.exprs.iter().enumerate() {
            for (i, &root) in arena.roots().iter().enumerate() {
                collect_blocks(arena, root, HandlePath::new(expr, smallvec![i]), &mut out);
            }
        }
        out
    }

    /// Loop handles in the block's own scope, outermost first; does not
    /// descend into nested blocks.
    pub fn block_loops(&self, block: &HandlePath) -> Result<Vec<HandlePath>, ApplyError> {
        let id = self.expect_block(block)?;
        let arena = &self.module.exprs[block.expr];
        let mut out = Vec::new();
        collect_own_loops(arena, id, block.clone(), &mut out);
        Ok(out)
    }

    pub fn loop_at(&self, path: &HandlePath) -> Result<&LoopNode, ApplyError> {
        let id = self.expect_loop(path)?;
        match self.module.exprs[path.expr].node(id) {
            IrNode::Loop(l) => Ok(l),
            _ => unreachable!(),
        }
    }

    pub fn block_at(&self, path: &HandlePath) -> Result<&BlockNode, ApplyError> {
        let id = self.expect_block(path)?;
        match self.module.exprs[path.expr].node(id) {
            IrNode::Block(b) => Ok(b),
            _ => unreachable!(),
        }
    }

    /// The single compute statement in the block's own scope.
    pub fn compute_of(&self, block: &HandlePath) -> Result<&ComputeNode, ApplyError> {
        let id = self.expect_block(block)?;
        let arena = &self.module.exprs[block.expr];
        find_own_compute(arena, id)
            .map(|cid| match arena.node(cid) {
                IrNode::Compute(c) => c,
                _ => unreachable!(),
            })
            .ok_or(ApplyError::NotApplicable("block has no compute statement"))
    }

    /// Whether any compute under the loop reads `tensor`.
    pub fn loop_consumes(&self, loop_path: &HandlePath, tensor: &str) -> bool {
        let Ok(id) = self.expect_loop(loop_path) else {
            return false;
        };
        subtree_reads(&self.module.exprs[loop_path.expr], id, tensor)
    }

    /// Number of compute statements in the expr reading `tensor`.
    pub fn consumer_count(&self, expr: usize, tensor: &str) -> usize {
        let Some(arena) = self.module.exprs.get(expr) else {
            return 0;
        };
        let mut count = 0;
        for node in arena_nodes_reachable(arena) {
            if let IrNode::Compute(c) = node {
                if c.reads.iter().any(|r| r == tensor) {
                    count += 1;
                }
            }
        }
        count
    }

    fn expect_loop(&self, path: &HandlePath) -> Result<NodeId, ApplyError> {
        let id = self.module.resolve(path)?;
        match self.module.exprs[path.expr].node(id) {
            IrNode::Loop(_) => Ok(id),
            _ => Err(ApplyError::BadHandle(path.to_string(), "loop")),
        }
    }

    fn expect_block(&self, path: &HandlePath) -> Result<NodeId, ApplyError> {
        let id = self.module.resolve(path)?;
        match self.module.exprs[path.expr].node(id) {
            IrNode::Block(_) => Ok(id),
            _ => Err(ApplyError::BadHandle(path.to_string(), "block")),
        }
    }

    // ---- primitives ----------------------------------------------------

    /// Splits a loop into a nest of loops with the given extents. The factor
    /// product must equal the loop's extent. Returns outer-to-inner handles.
    pub fn split(
        &mut self,
        loop_path: &HandlePath,
        factors: &[i64],
    ) -> Result<Vec<HandlePath>, ApplyError> {
        let mut operands: SmallVec<[Operand; 4]> = smallvec![Operand::Loop(loop_path.clone())];
        operands.extend(factors.iter().map(|&f| Operand::Int(f)));
        Ok(self.apply(TraceOp::Split, operands)?.to_vec())
    }

    /// Fuses a loop with its sole child loop into one loop over the product
    /// extent.
    pub fn fuse(&mut self, outer: &HandlePath) -> Result<HandlePath, ApplyError> {
        let results = self.apply(TraceOp::Fuse, smallvec![Operand::Loop(outer.clone())])?;
        Ok(results[0].clone())
    }

    /// Exchanges two loops on one perfectly nested chain.
    pub fn reorder(&mut self, a: &HandlePath, b: &HandlePath) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::Reorder,
            smallvec![Operand::Loop(a.clone()), Operand::Loop(b.clone())],
        )?;
        Ok(())
    }

    /// Tiles two spatial loops: splits each and exchanges the inner of the
    /// first with the outer of the second. Returns the four loop handles in
    /// the resulting outer-to-inner order.
    pub fn tile(
        &mut self,
        i: &HandlePath,
        j: &HandlePath,
        fi: i64,
        fj: i64,
    ) -> Result<Vec<HandlePath>, ApplyError> {
        let operands = smallvec![
            Operand::Loop(i.clone()),
            Operand::Loop(j.clone()),
            Operand::Int(fi),
            Operand::Int(fj),
        ];
        Ok(self.apply(TraceOp::Tile, operands)?.to_vec())
    }

    /// Binds a loop to a GPU thread axis.
    pub fn bind(&mut self, loop_path: &HandlePath, axis: ThreadAxis) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::Bind,
            smallvec![
                Operand::Loop(loop_path.clone()),
                Operand::Str(axis.as_str().to_owned()),
            ],
        )?;
        Ok(())
    }

    pub fn unroll(&mut self, loop_path: &HandlePath) -> Result<(), ApplyError> {
        self.apply(TraceOp::Unroll, smallvec![Operand::Loop(loop_path.clone())])?;
        Ok(())
    }

    pub fn vectorize(&mut self, loop_path: &HandlePath) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::Vectorize,
            smallvec![Operand::Loop(loop_path.clone())],
        )?;
        Ok(())
    }

    pub fn parallel(&mut self, loop_path: &HandlePath) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::Parallel,
            smallvec![Operand::Loop(loop_path.clone())],
        )?;
        Ok(())
    }

    /// Inserts a staging copy of one of the block's operands and redirects
    /// the block to read the staged tensor.
    pub fn cache_read(
        &mut self,
        block: &HandlePath,
        read_idx: usize,
    ) -> Result<HandlePath, ApplyError> {
        let results = self.apply(
            TraceOp::CacheRead,
            smallvec![
                Operand::Block(block.clone()),
                Operand::Int(read_idx as i64),
            ],
        )?;
        Ok(results[0].clone())
    }

    /// Redirects the block to write a staging tensor, with a copy-out stage
    /// writing the original destination.
    pub fn cache_write(&mut self, block: &HandlePath) -> Result<HandlePath, ApplyError> {
        let results = self.apply(TraceOp::CacheWrite, smallvec![Operand::Block(block.clone())])?;
        Ok(results[0].clone())
    }

    /// Moves a root-level producer block under a loop of one of its
    /// consumers.
    pub fn compute_at(
        &mut self,
        block: &HandlePath,
        loop_path: &HandlePath,
    ) -> Result<HandlePath, ApplyError> {
        let results = self.apply(
            TraceOp::ComputeAt,
            smallvec![
                Operand::Block(block.clone()),
                Operand::Loop(loop_path.clone()),
            ],
        )?;
        Ok(results[0].clone())
    }

    /// Inlines a pure elementwise block into its consumers and removes it.
    pub fn compute_inline(&mut self, block: &HandlePath) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::ComputeInline,
            smallvec![Operand::Block(block.clone())],
        )?;
        Ok(())
    }

    /// Factors a reduction loop out into a partial-result stage.
    pub fn rfactor(
        &mut self,
        block: &HandlePath,
        loop_path: &HandlePath,
    ) -> Result<HandlePath, ApplyError> {
        let results = self.apply(
            TraceOp::Rfactor,
            smallvec![
                Operand::Block(block.clone()),
                Operand::Loop(loop_path.clone()),
            ],
        )?;
        Ok(results[0].clone())
    }

    pub fn storage_align(
        &mut self,
        block: &HandlePath,
        factor: i64,
        offset: i64,
    ) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::StorageAlign,
            smallvec![
                Operand::Block(block.clone()),
                Operand::Int(factor),
                Operand::Int(offset),
            ],
        )?;
        Ok(())
    }

    pub fn pragma(
        &mut self,
        loop_path: &HandlePath,
        key: &str,
        value: i64,
    ) -> Result<(), ApplyError> {
        self.apply(
            TraceOp::Pragma,
            smallvec![
                Operand::Loop(loop_path.clone()),
                Operand::Str(key.to_owned()),
                Operand::Int(value),
            ],
        )?;
        Ok(())
    }

    // ---- application machinery -----------------------------------------

    fn apply(
        &mut self,
        op: TraceOp,
        operands: SmallVec<[Operand; 4]>,
    ) -> Result<Results, ApplyError> {
        let results = self.perform(op, &operands)?;
        let mut record = TraceRecord::new(op, operands);
        record.results = results.clone();
        self.trace.append(record);
        Ok(results)
    }

    fn perform(&mut self, op: TraceOp, operands: &[Operand]) -> Result<Results, ApplyError> {
        match op {
            TraceOp::Split => self.perform_split(operands),
            TraceOp::Fuse => self.perform_fuse(operands),
            TraceOp::Reorder => self.perform_reorder(operands),
            TraceOp::Tile => self.perform_tile(operands),
            TraceOp::Bind => self.perform_bind(operands),
            TraceOp::Unroll => self.perform_mark(operands, op, LoopKind::Unrolled),
            TraceOp::Vectorize => self.perform_mark(operands, op, LoopKind::Vectorized),
            TraceOp::Parallel => self.perform_mark(operands, op, LoopKind::Parallel),
            TraceOp::CacheRead => self.perform_cache_read(operands),
            TraceOp::CacheWrite => self.perform_cache_write(operands),
            TraceOp::ComputeAt => self.perform_compute_at(operands),
            TraceOp::ComputeInline => self.perform_compute_inline(operands),
            TraceOp::Rfactor => self.perform_rfactor(operands),
            TraceOp::StorageAlign => self.perform_storage_align(operands),
            TraceOp::Pragma => self.perform_pragma(operands),
        }
    }

    fn perform_split(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (path, factors) = match operands {
            [Operand::Loop(p), rest @ ..] if !rest.is_empty() => {
                let factors: Option<Vec<i64>> = rest.iter().map(Operand::as_int).collect();
                (p, factors.ok_or(ApplyError::MalformedRecord(TraceOp::Split))?)
            }
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Split)),
        };
        let id = self.expect_loop(path)?;
        if factors.len() < 2 {
            return Err(ApplyError::NotApplicable("split needs at least two factors"));
        }
        if factors.iter().any(|&f| f < 1) {
            return Err(ApplyError::NotApplicable("split factors must be positive"));
        }
        let arena = &mut self.module.exprs[path.expr];
        let (extent, kind, is_reduce) = match arena.node(id) {
            IrNode::Loop(l) => (l.extent, l.kind, l.is_reduce),
            _ => unreachable!(),
        };
        if kind != LoopKind::Serial {
            return Err(ApplyError::NotApplicable("only serial loops can be split"));
        }
        if factors.iter().product::<i64>() != extent {
            return Err(ApplyError::NotApplicable(
                "split factors must multiply to the loop extent",
            ));
        }

        split_in_place(arena, id, &factors, is_reduce);

        let mut results: Results = smallvec![path.clone()];
        let mut cur = path.clone();
        for _ in 1..factors.len() {
            cur = cur.child(0);
            results.push(cur.clone());
        }
        Ok(results)
    }

    fn perform_fuse(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let path = match operands {
            [Operand::Loop(p)] => p,
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Fuse)),
        };
        let id = self.expect_loop(path)?;
        let arena = &mut self.module.exprs[path.expr];

        let inner_id = {
            let outer = arena.node(id).as_loop().unwrap();
            if outer.kind != LoopKind::Serial {
                return Err(ApplyError::NotApplicable("only serial loops can be fused"));
            }
            if outer.children.len() != 1 {
                return Err(ApplyError::NotApplicable(
                    "fuse requires a single nested loop",
                ));
            }
            outer.children[0]
        };
        let (inner_var, inner_extent, inner_children) = match arena.node(inner_id) {
            IrNode::Loop(inner) => {
                let outer = arena.node(id).as_loop().unwrap();
                if inner.kind != LoopKind::Serial {
                    return Err(ApplyError::NotApplicable("only serial loops can be fused"));
                }
                if inner.is_reduce != outer.is_reduce {
                    return Err(ApplyError::NotApplicable(
                        "cannot fuse across the spatial/reduce boundary",
                    ));
                }
                (inner.var.clone(), inner.extent, inner.children.clone())
            }
            _ => {
                return Err(ApplyError::NotApplicable(
                    "fuse requires a single nested loop",
                ))
            }
        };
        if let IrNode::Loop(outer) = arena.node_mut(id) {
            outer.var = format!("{}.{}.fused", outer.var, inner_var);
            outer.extent *= inner_extent;
            outer.children = inner_children;
        }
        Ok(smallvec![path.clone()])
    }

    fn perform_reorder(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (pa, pb) = match operands {
            [Operand::Loop(a), Operand::Loop(b)] => (a, b),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Reorder)),
        };
        let ida = self.expect_loop(pa)?;
        let idb = self.expect_loop(pb)?;
        if ida == idb {
            return Err(ApplyError::NotApplicable("reorder needs two distinct loops"));
        }
        let (outer_path, outer_id, inner_id) = if pa.is_prefix_of(pb) {
            (pa, ida, idb)
        } else if pb.is_prefix_of(pa) {
            (pb, idb, ida)
        } else {
            return Err(ApplyError::NotApplicable(
                "reorder requires one loop to enclose the other",
            ));
        };
        let arena = &mut self.module.exprs[outer_path.expr];
        if !perfect_chain(arena, outer_id, inner_id) {
            return Err(ApplyError::NotApplicable(
                "reorder requires a perfectly nested chain",
            ));
        }
        swap_loop_payloads(arena, outer_id, inner_id);
        Ok(smallvec![])
    }

    fn perform_tile(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (pi, pj, fi, fj) = match operands {
            [Operand::Loop(i), Operand::Loop(j), Operand::Int(fi), Operand::Int(fj)] => {
                (i, j, *fi, *fj)
            }
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Tile)),
        };
        let id_i = self.expect_loop(pi)?;
        let id_j = self.expect_loop(pj)?;
        if !pi.is_prefix_of(pj) || id_i == id_j {
            return Err(ApplyError::NotApplicable(
                "tile requires the first loop to enclose the second",
            ));
        }
        {
            let arena = &self.module.exprs[pi.expr];
            for (id, f) in [(id_i, fi), (id_j, fj)] {
                let l = arena.node(id).as_loop().unwrap();
                if l.kind != LoopKind::Serial || l.is_reduce {
                    return Err(ApplyError::NotApplicable(
                        "tile applies to serial spatial loops",
                    ));
                }
                if f < 1 || l.extent % f != 0 {
                    return Err(ApplyError::NotApplicable(
                        "tile factor must divide the loop extent",
                    ));
                }
            }
            if !perfect_chain(arena, id_i, id_j) {
                return Err(ApplyError::NotApplicable(
                    "tile requires a perfectly nested chain",
                ));
            }
        }

        let arena = &mut self.module.exprs[pi.expr];
        let extent_i = arena.node(id_i).as_loop().unwrap().extent;
        let extent_j = arena.node(id_j).as_loop().unwrap().extent;
        split_in_place(arena, id_i, &[extent_i / fi, fi], false);
        split_in_place(arena, id_j, &[extent_j / fj, fj], false);
        // After the splits: id_i holds i.o whose single child is i.i; the old
        // chain hangs off i.i; id_j holds j.o over j.i. Exchange i.i with j.o.
        let ii_id = arena.node(id_i).as_loop().unwrap().children[0];
        swap_loop_payloads(arena, ii_id, id_j);

        let io = pi.clone();
        let jo = pi.child(0);
        let mut ii_steps = pi.steps.clone();
        ii_steps.push(0);
        ii_steps.extend_from_slice(&pj.steps[pi.steps.len()..]);
        let ii = HandlePath::new(pi.expr, ii_steps);
        let ji = ii.child(0);
        Ok(smallvec![io, jo, ii, ji])
    }

    fn perform_bind(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (path, axis) = match operands {
            [Operand::Loop(p), Operand::Str(s)] => (
                p,
                ThreadAxis::from_str(s).ok_or(ApplyError::MalformedRecord(TraceOp::Bind))?,
            ),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Bind)),
        };
        let id = self.expect_loop(path)?;
        let arena = &self.module.exprs[path.expr];
        if arena.node(id).as_loop().unwrap().kind != LoopKind::Serial {
            return Err(ApplyError::NotApplicable("only serial loops can be bound"));
        }
        let already_bound = arena_nodes_reachable(arena).any(|n| {
            matches!(n, IrNode::Loop(l) if l.kind == LoopKind::Bound(axis))
        });
        if already_bound {
            return Err(ApplyError::NotApplicable("thread axis is already bound"));
        }
        if let IrNode::Loop(l) = self.module.exprs[path.expr].node_mut(id) {
            l.kind = LoopKind::Bound(axis);
        }
        Ok(smallvec![])
    }

    fn perform_mark(
        &mut self,
        operands: &[Operand],
        op: TraceOp,
        kind: LoopKind,
    ) -> Result<Results, ApplyError> {
        let path = match operands {
            [Operand::Loop(p)] => p,
            _ => return Err(ApplyError::MalformedRecord(op)),
        };
        let id = self.expect_loop(path)?;
        let arena = &self.module.exprs[path.expr];
        let l = arena.node(id).as_loop().unwrap();
        if l.kind != LoopKind::Serial {
            return Err(ApplyError::NotApplicable("loop is already annotated"));
        }
        if kind == LoopKind::Vectorized {
            if l.is_reduce {
                return Err(ApplyError::NotApplicable("cannot vectorize a reduce loop"));
            }
            let has_loop_child = l
                .children
                .iter()
                .any(|&c| matches!(arena.node(c), IrNode::Loop(_)));
            if has_loop_child {
                return Err(ApplyError::NotApplicable(
                    "vectorize applies to innermost loops",
                ));
            }
        }
        if kind == LoopKind::Parallel && l.is_reduce {
            return Err(ApplyError::NotApplicable("cannot parallelize a reduce loop"));
        }
        if let IrNode::Loop(l) = self.module.exprs[path.expr].node_mut(id) {
            l.kind = kind;
        }
        Ok(smallvec![])
    }

    fn perform_cache_read(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (path, read_idx) = match operands {
            [Operand::Block(p), Operand::Int(idx)] if *idx >= 0 => (p, *idx as usize),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::CacheRead)),
        };
        let block_id = self.expect_block(path)?;
        let spatial = self.own_spatial_extents(path)?;

        let arena = &self.module.exprs[path.expr];
        let compute_id = find_own_compute(arena, block_id)
            .ok_or(ApplyError::NotApplicable("block has no compute statement"))?;
        let tensor = match arena.node(compute_id) {
            IrNode::Compute(c) => c
                .reads
                .get(read_idx)
                .cloned()
                .ok_or(ApplyError::NotApplicable("read index out of range"))?,
            _ => unreachable!(),
        };
        let cache_name = format!("{}.cache_read", tensor);
        let staged = format!("{}.local", tensor);
        if block_name_exists(arena, &cache_name) {
            return Err(ApplyError::NotApplicable("operand is already staged"));
        }

        let arena = &mut self.module.exprs[path.expr];
        if let IrNode::Compute(c) = arena.node_mut(compute_id) {
            c.reads[read_idx] = staged.clone();
        }
        let stage_id = build_copy_stage(arena, &cache_name, &staged, &tensor, &spatial);
        let root_pos = path.steps[0];
        arena.roots_mut().insert(root_pos, stage_id);
        Ok(smallvec![HandlePath::new(path.expr, smallvec![root_pos])])
    }

    fn perform_cache_write(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let path = match operands {
            [Operand::Block(p)] => p,
            _ => return Err(ApplyError::MalformedRecord(TraceOp::CacheWrite)),
        };
        let block_id = self.expect_block(path)?;
        let spatial = self.own_spatial_extents(path)?;

        let arena = &self.module.exprs[path.expr];
        let block_name = arena.node(block_id).as_block().unwrap().name.clone();
        let compute_id = find_own_compute(arena, block_id)
            .ok_or(ApplyError::NotApplicable("block has no compute statement"))?;
        let dest = match arena.node(compute_id) {
            IrNode::Compute(c) => c.dest.clone(),
            _ => unreachable!(),
        };
        let copy_name = format!("{}.wb", block_name);
        let staged = format!("{}.local", dest);
        if block_name_exists(arena, &copy_name) {
            return Err(ApplyError::NotApplicable("destination is already staged"));
        }

        let arena = &mut self.module.exprs[path.expr];
        if let IrNode::Compute(c) = arena.node_mut(compute_id) {
            c.dest = staged.clone();
        }
        let stage_id = build_copy_stage(arena, &copy_name, &dest, &staged, &spatial);
        let root_pos = path.steps[0] + 1;
        arena.roots_mut().insert(root_pos, stage_id);
        Ok(smallvec![HandlePath::new(path.expr, smallvec![root_pos])])
    }

    fn perform_compute_at(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (block_path, loop_path) = match operands {
            [Operand::Block(b), Operand::Loop(l)] => (b, l),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::ComputeAt)),
        };
        if block_path.expr != loop_path.expr {
            return Err(ApplyError::NotApplicable(
                "compute_at stays within a single expr",
            ));
        }
        if block_path.steps.len() != 1 {
            return Err(ApplyError::NotApplicable(
                "only root-level blocks can be relocated",
            ));
        }
        if block_path.is_prefix_of(loop_path) {
            return Err(ApplyError::NotApplicable(
                "cannot relocate a block into itself",
            ));
        }
        let block_id = self.expect_block(block_path)?;
        let loop_id = self.expect_loop(loop_path)?;

        let arena = &self.module.exprs[block_path.expr];
        let dest = match find_own_compute(arena, block_id).map(|cid| arena.node(cid)) {
            Some(IrNode::Compute(c)) => c.dest.clone(),
            _ => return Err(ApplyError::NotApplicable("block has no compute statement")),
        };
        let consumes = subtree_reads(arena, loop_id, &dest);
        if !consumes {
            return Err(ApplyError::NotApplicable(
                "target loop does not consume the block's output",
            ));
        }

        let arena = &mut self.module.exprs[block_path.expr];
        let root_pos = block_path.steps[0];
        arena.roots_mut().remove(root_pos);
        match arena.node_mut(loop_id) {
            IrNode::Loop(l) => l.children.insert(0, block_id),
            _ => unreachable!(),
        }
        // The loop's recorded path may have shifted by the root removal.
        let mut new_steps = loop_path.steps.clone();
        if new_steps[0] > root_pos {
            new_steps[0] -= 1;
        }
        let mut result = HandlePath::new(block_path.expr, new_steps);
        result = result.child(0);
        Ok(smallvec![result])
    }

    fn perform_compute_inline(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let path = match operands {
            [Operand::Block(p)] => p,
            _ => return Err(ApplyError::MalformedRecord(TraceOp::ComputeInline)),
        };
        if path.steps.len() != 1 {
            return Err(ApplyError::NotApplicable(
                "only root-level blocks can be inlined",
            ));
        }
        let block_id = self.expect_block(path)?;
        let arena = &self.module.exprs[path.expr];
        let (dest, reads) = match find_own_compute(arena, block_id).map(|cid| arena.node(cid)) {
            Some(IrNode::Compute(c)) => {
                if c.reduce.is_some() {
                    return Err(ApplyError::NotApplicable("cannot inline a reduction"));
                }
                (c.dest.clone(), c.reads.clone())
            }
            _ => return Err(ApplyError::NotApplicable("block has no compute statement")),
        };
        let consumers = self.consumer_count(path.expr, &dest);
        if consumers == 0 {
            return Err(ApplyError::NotApplicable("inlined output has no consumer"));
        }

        let arena = &mut self.module.exprs[path.expr];
        arena.roots_mut().remove(path.steps[0]);
        for id in 0..arena.len() {
            if let IrNode::Compute(c) = arena.node_mut(id) {
                if let Some(pos) = c.reads.iter().position(|r| *r == dest) {
                    c.reads.remove(pos);
                    let mut at = pos;
                    for read in reads.iter() {
                        if !c.reads.contains(read) {
                            c.reads.insert(at, read.clone());
                            at += 1;
                        }
                    }
                }
            }
        }
        Ok(smallvec![])
    }

    fn perform_rfactor(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (block_path, loop_path) = match operands {
            [Operand::Block(b), Operand::Loop(l)] => (b, l),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Rfactor)),
        };
        if block_path.steps.len() != 1 || !block_path.is_prefix_of(loop_path) {
            return Err(ApplyError::NotApplicable(
                "rfactor applies to a reduce loop of a root-level block",
            ));
        }
        let block_id = self.expect_block(block_path)?;
        let loop_id = self.expect_loop(loop_path)?;

        let arena = &self.module.exprs[block_path.expr];
        let target = arena.node(loop_id).as_loop().unwrap();
        if !target.is_reduce || target.extent < 2 {
            return Err(ApplyError::NotApplicable(
                "rfactor needs a reduce loop of extent at least 2",
            ));
        }
        let (rf_var, rf_extent) = (target.var.clone(), target.extent);

        let block = arena.node(block_id).as_block().unwrap();
        let block_name = block.name.clone();
        let mut own = Vec::new();
        collect_own_loop_ids(arena, block_id, &mut own);
        if own
            .iter()
            .any(|&id| arena.node(id).as_loop().unwrap().kind != LoopKind::Serial)
        {
            return Err(ApplyError::NotApplicable(
                "rfactor requires an unannotated loop nest",
            ));
        }
        if has_nested_block(arena, block_id) {
            return Err(ApplyError::NotApplicable(
                "rfactor cannot rebuild a nest with relocated producers",
            ));
        }
        let spatial: Vec<(String, i64)> = own
            .iter()
            .map(|&id| arena.node(id).as_loop().unwrap())
            .filter(|l| !l.is_reduce)
            .map(|l| (l.var.clone(), l.extent))
            .collect();
        let other_reduce: Vec<(String, i64)> = own
            .iter()
            .filter(|&&id| id != loop_id)
            .map(|&id| arena.node(id).as_loop().unwrap())
            .filter(|l| l.is_reduce)
            .map(|l| (l.var.clone(), l.extent))
            .collect();
        let compute_id = find_own_compute(arena, block_id)
            .ok_or(ApplyError::NotApplicable("block has no compute statement"))?;
        let (dest, reads, reduce_op) = match arena.node(compute_id) {
            IrNode::Compute(c) => (c.dest.clone(), c.reads.clone(), c.reduce),
            _ => unreachable!(),
        };
        let reduce_op =
            reduce_op.ok_or(ApplyError::NotApplicable("rfactor needs a reduction block"))?;

        let rf_name = format!("{}.rf", block_name);
        let rf_dest = format!("{}.rf", dest);
        if block_name_exists(arena, &rf_name) {
            return Err(ApplyError::NotApplicable("block was already factored"));
        }

        let arena = &mut self.module.exprs[block_path.expr];

        // Partial-result stage: the factored axis becomes spatial.
        let mut rf_spatial: Vec<(&str, i64)> =
            spatial.iter().map(|(v, e)| (v.as_str(), *e)).collect();
        let rf_axis = format!("{}.rf", rf_var);
        rf_spatial.push((rf_axis.as_str(), rf_extent));
        let rf_reduce: Vec<(&str, i64)> = other_reduce
            .iter()
            .map(|(v, e)| (v.as_str(), *e))
            .collect();
        let read_refs: Vec<&str> = reads.iter().map(|s| s.as_str()).collect();
        let rf_op = if rf_reduce.is_empty() {
            None
        } else {
            Some(reduce_op)
        };
        let rf_id = build_stage_nest(
            arena,
            &rf_name,
            &rf_dest,
            &read_refs,
            &rf_spatial,
            &rf_reduce,
            rf_op,
        );

        // Rebuild the original block as the combining reduction over the
        // factored axis.
        let comb_spatial: Vec<(&str, i64)> =
            spatial.iter().map(|(v, e)| (v.as_str(), *e)).collect();
        let comb_id = build_stage_nest(
            arena,
            &block_name,
            &dest,
            &[rf_dest.as_str()],
            &comb_spatial,
            &[(rf_var.as_str(), rf_extent)],
            Some(reduce_op),
        );
        let root_pos = block_path.steps[0];
        arena.roots_mut()[root_pos] = comb_id;
        arena.roots_mut().insert(root_pos, rf_id);
        Ok(smallvec![
            HandlePath::new(block_path.expr, smallvec![root_pos]),
            HandlePath::new(block_path.expr, smallvec![root_pos + 1]),
        ])
    }

    fn perform_storage_align(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (path, factor, offset) = match operands {
            [Operand::Block(p), Operand::Int(f), Operand::Int(o)] => (p, *f, *o),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::StorageAlign)),
        };
        if factor < 1 {
            return Err(ApplyError::NotApplicable("alignment factor must be positive"));
        }
        let id = self.expect_block(path)?;
        if let IrNode::Block(b) = self.module.exprs[path.expr].node_mut(id) {
            set_annotation(&mut b.annotations, "storage_align.factor", factor);
            set_annotation(&mut b.annotations, "storage_align.offset", offset);
        }
        Ok(smallvec![])
    }

    fn perform_pragma(&mut self, operands: &[Operand]) -> Result<Results, ApplyError> {
        let (path, key, value) = match operands {
            [Operand::Loop(p), Operand::Str(k), Operand::Int(v)] => (p, k.clone(), *v),
            _ => return Err(ApplyError::MalformedRecord(TraceOp::Pragma)),
        };
        let id = self.expect_loop(path)?;
        if let IrNode::Loop(l) = self.module.exprs[path.expr].node_mut(id) {
            set_annotation(&mut l.annotations, &key, value);
        }
        Ok(smallvec![])
    }

    // Extents of the block's own spatial loops, outermost first.
    fn own_spatial_extents(&self, block: &HandlePath) -> Result<Vec<i64>, ApplyError> {
        let id = self.expect_block(block)?;
        let arena = &self.module.exprs[block.expr];
        let mut ids = Vec::new();
        collect_own_loop_ids(arena, id, &mut ids);
        Ok(ids
            .iter()
            .map(|&i| arena.node(i).as_loop().unwrap())
            .filter(|l| !l.is_reduce)
            .map(|l| l.extent)
            .collect())
    }
}

// ---- free helpers ------------------------------------------------------

fn arena_nodes_reachable(arena: &ExprArena) -> impl Iterator<Item = &IrNode> {
    let mut stack: Vec<NodeId> = arena.roots().to_vec();
    std::iter::from_fn(move || {
        let id = stack.pop()?;
        let node = arena.node(id);
        stack.extend_from_slice(node.children());
        Some(node)
    })
}

fn collect_blocks(arena: &ExprArena, id: NodeId, path: HandlePath, out: &mut Vec<HandlePath>) {
    if let IrNode::Block(_) = arena.node(id) {
        out.push(path.clone());
    }
    for (i, &child) in arena.node(id).children().iter().enumerate() {
        collect_blocks(arena, child, path.child(i), out);
    }
}

fn collect_own_loops(arena: &ExprArena, id: NodeId, path: HandlePath, out: &mut Vec<HandlePath>) {
    for (i, &child) in arena.node(id).children().iter().enumerate() {
        match arena.node(child) {
            IrNode::Loop(_) => {
                let child_path = path.child(i);
                out.push(child_path.clone());
                collect_own_loops(arena, child, child_path, out);
            }
            IrNode::Block(_) | IrNode::Compute(_) => {}
        }
    }
}

fn collect_own_loop_ids(arena: &ExprArena, id: NodeId, out: &mut Vec<NodeId>) {
    for &child in arena.node(id).children() {
        if let IrNode::Loop(_) = arena.node(child) {
            out.push(child);
            collect_own_loop_ids(arena, child, out);
        }
    }
}

fn find_own_compute(arena: &ExprArena, block_id: NodeId) -> Option<NodeId> {
    let mut stack: Vec<NodeId> = arena.node(block_id).children().to_vec();
    while let Some(id) = stack.pop() {
        match arena.node(id) {
            IrNode::Compute(_) => return Some(id),
            IrNode::Block(_) => {}
            IrNode::Loop(_) => stack.extend_from_slice(arena.node(id).children()),
        }
    }
    None
}

fn has_nested_block(arena: &ExprArena, block_id: NodeId) -> bool {
    let mut stack: Vec<NodeId> = arena.node(block_id).children().to_vec();
    while let Some(id) = stack.pop() {
        match arena.node(id) {
            IrNode::Block(_) => return true,
            _ => stack.extend_from_slice(arena.node(id).children()),
        }
    }
    false
}

fn block_name_exists(arena: &ExprArena, name: &str) -> bool {
    arena_nodes_reachable(arena)
        .any(|n| matches!(n, IrNode::Block(b) if b.name == name))
}

fn subtree_reads(arena: &ExprArena, id: NodeId, tensor: &str) -> bool {
    let mut stack = vec![id];
    while let Some(cur) = stack.pop() {
        if let IrNode::Compute(c) = arena.node(cur) {
            if c.reads.iter().any(|r| r == tensor) {
                return true;
            }
        }
        stack.extend_from_slice(arena.node(cur).children());
    }
    false
}

// Rewrites the loop at `id` into a nest of loops with the given extents,
// reusing `id` for the outermost so the parent link stays intact.
fn split_in_place(arena: &mut ExprArena, id: NodeId, factors: &[i64], is_reduce: bool) {
    let (var, body, annotations) = match arena.node_mut(id) {
        IrNode::Loop(l) => (
            l.var.clone(),
            std::mem::take(&mut l.children),
            std::mem::take(&mut l.annotations),
        ),
        _ => unreachable!("split_in_place takes a loop id"),
    };
    let mut child_ids: Vec<NodeId> = Vec::with_capacity(factors.len() - 1);
    for (i, &extent) in factors.iter().enumerate().skip(1) {
        child_ids.push(arena.push(IrNode::Loop(LoopNode {
            var: format!("{}.{}", var, i),
            extent,
            kind: LoopKind::Serial,
            is_reduce,
            annotations: SmallVec::new(),
            children: SmallVec::new(),
        })));
    }
    // Chain the fresh loops and hang the original body off the innermost.
    for w in 0..child_ids.len() {
        let next = child_ids.get(w + 1).copied();
        if let IrNode::Loop(l) = arena.node_mut(child_ids[w]) {
            match next {
                Some(n) => l.children = smallvec![n],
                None => l.children = body.clone(),
            }
        }
    }
    if let IrNode::Loop(l) = arena.node_mut(id) {
        l.var = format!("{}.0", var);
        l.extent = factors[0];
        l.annotations = annotations;
        l.children = smallvec![child_ids[0]];
    }
}

fn swap_loop_payloads(arena: &mut ExprArena, a: NodeId, b: NodeId) {
    debug_assert_ne!(a, b);
    let extract = |node: &mut IrNode| match node {
        IrNode::Loop(l) => (
            std::mem::take(&mut l.var),
            l.extent,
            l.kind,
            l.is_reduce,
            std::mem::take(&mut l.annotations),
        ),
        _ => unreachable!(),
    };
    let pa = extract(arena.node_mut(a));
    let pb = extract(arena.node_mut(b));
    for (id, payload) in [(a, pb), (b, pa)] {
        if let IrNode::Loop(l) = arena.node_mut(id) {
            l.var = payload.0;
            l.extent = payload.1;
            l.kind = payload.2;
            l.is_reduce = payload.3;
            l.annotations = payload.4;
        }
    }
}

// True when every node strictly between `outer` and `inner` is a
// single-child serial chain of loops.
fn perfect_chain(arena: &ExprArena, outer: NodeId, inner: NodeId) -> bool {
    let mut cur = outer;
    while cur != inner {
        let children = arena.node(cur).children();
        if children.len() != 1 {
            return false;
        }
        cur = children[0];
        if !matches!(arena.node(cur), IrNode::Loop(_)) {
            return false;
        }
    }
    true
}

fn build_copy_stage(
    arena: &mut ExprArena,
    name: &str,
    dest: &str,
    src: &str,
    spatial_extents: &[i64],
) -> NodeId {
    let vars: Vec<String> = (0..spatial_extents.len().max(1))
        .map(|i| format!("ax{}", i))
        .collect();
    let spatial: Vec<(&str, i64)> = if spatial_extents.is_empty() {
        vec![(vars[0].as_str(), 1)]
    } else {
        vars.iter()
            .zip(spatial_extents)
            .map(|(v, &e)| (v.as_str(), e))
            .collect()
    };
    build_stage_nest(arena, name, dest, &[src], &spatial, &[], None)
}

// Like ExprArena::build_stage but returns the block without appending it to
// the roots; callers choose the insertion point.
fn build_stage_nest(
    arena: &mut ExprArena,
    name: &str,
    dest: &str,
    reads: &[&str],
    spatial: &[(&str, i64)],
    reduce: &[(&str, i64)],
    reduce_op: Option<crate::ir::ReduceOp>,
) -> NodeId {
    let compute = arena.push(IrNode::Compute(ComputeNode {
        dest: dest.to_owned(),
        reads: reads.iter().map(|r| (*r).to_owned()).collect(),
        reduce: reduce_op,
    }));
    let mut inner = compute;
    for &(var, extent) in reduce.iter().rev() {
        inner = arena.push(IrNode::Loop(LoopNode {
            var: var.to_owned(),
            extent,
            kind: LoopKind::Serial,
            is_reduce: true,
            annotations: SmallVec::new(),
            children: smallvec![inner],
        }));
    }
    for &(var, extent) in spatial.iter().rev() {
        inner = arena.push(IrNode::Loop(LoopNode {
            var: var.to_owned(),
            extent,
            kind: LoopKind::Serial,
            is_reduce: false,
            annotations: SmallVec::new(),
            children: smallvec![inner],
        }));
    }
    arena.push(IrNode::Block(BlockNode {
        name: name.to_owned(),
        annotations: SmallVec::new(),
        children: smallvec![inner],
    }))
}

fn set_annotation(annotations: &mut SmallVec<[(String, i64); 1]>, key: &str, value: i64) {
    if let Some(slot) = annotations.iter_mut().find(|(k, _)| k == key) {
        slot.1 = value;
    } else {
        annotations.push((key.to_owned(), value));
    }
}
