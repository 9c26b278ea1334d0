//! Arena-based loop-nest IR.
//!
//! A lowered compute is a [ModuleIr]: an ordered list of root exprs, one per
//! fused function, each an [ExprArena] of nodes addressed by integer id. The
//! arena carries no parent pointers; traversals take the arena by reference
//! and ancestry is expressed through [HandlePath]s, so a deep copy is a plain
//! clone of the node vector.
//!
//! Transformations never free arena slots. Orphaned nodes are unreachable
//! from the roots and invisible to [ModuleIr::fingerprint] and validation.

pub mod schedule;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

pub type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadAxis {
    BlockX,
    BlockY,
    ThreadX,
    ThreadY,
}

impl ThreadAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadAxis::BlockX => "blockIdx.x",
            ThreadAxis::BlockY => "blockIdx.y",
            ThreadAxis::ThreadX => "threadIdx.x",
            ThreadAxis::ThreadY => "threadIdx.y",
        }
    }

    pub fn from_str(s: &str) -> Option<ThreadAxis> {
        match s {
            "blockIdx.x" => Some(ThreadAxis::BlockX),
            "blockIdx.y" => Some(ThreadAxis::BlockY),
            "threadIdx.x" => Some(ThreadAxis::ThreadX),
            "threadIdx.y" => Some(ThreadAxis::ThreadY),
            _ => None,
        }
    }
}

impl fmt::Display for ThreadAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    Serial,
    Parallel,
    Unrolled,
    Vectorized,
    Bound(ThreadAxis),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Clone, Debug)]
pub struct LoopNode {
    pub var: String,
    pub extent: i64,
    pub kind: LoopKind,
    pub is_reduce: bool,
    pub annotations: SmallVec<[(String, i64); 1]>,
    pub children: SmallVec<[NodeId; 2]>,
}

#[derive(Clone, Debug)]
pub struct BlockNode {
    pub name: String,
    pub annotations: SmallVec<[(String, i64); 1]>,
    pub children: SmallVec<[NodeId; 2]>,
}

#[derive(Clone, Debug)]
pub struct ComputeNode {
    pub dest: String,
    pub reads: SmallVec<[String; 3]>,
    pub reduce: Option<ReduceOp>,
}

#[derive(Clone, Debug)]
pub enum IrNode {
    Block(BlockNode),
    Loop(LoopNode),
    Compute(ComputeNode),
}

impl IrNode {
    pub fn children(&self) -> &[NodeId] {
        match self {
            IrNode::Block(b) => &b.children,
            IrNode::Loop(l) => &l.children,
            IrNode::Compute(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut SmallVec<[NodeId; 2]> {
        match self {
            IrNode::Block(b) => &mut b.children,
            IrNode::Loop(l) => &mut l.children,
            IrNode::Compute(_) => panic!("compute nodes have no children"),
        }
    }

    pub fn as_loop(&self) -> Option<&LoopNode> {
        match self {
            IrNode::Loop(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockNode> {
        match self {
            IrNode::Block(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IrError {
    #[error("handle {0} does not resolve")]
    Unresolved(String),
    #[error("expr {expr} is structurally invalid: {reason}")]
    Invalid { expr: usize, reason: String },
}

/// Symbolic path to a node: an expr index plus child steps from the expr's
/// roots. The wire representation of block and loop handles; survives across
/// processes, unlike arena ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlePath {
    pub expr: usize,
    pub steps: SmallVec<[usize; 4]>,
}

impl HandlePath {
    pub fn new(expr: usize, steps: SmallVec<[usize; 4]>) -> Self {
        HandlePath { expr, steps }
    }

    /// The path one step up, or `None` at a root.
    pub fn parent(&self) -> Option<HandlePath> {
        if self.steps.len() < 2 {
            return None;
        }
        let mut steps = self.steps.clone();
        steps.pop();
        Some(HandlePath {
            expr: self.expr,
            steps,
        })
    }

    pub fn child(&self, idx: usize) -> HandlePath {
        let mut steps = self.steps.clone();
        steps.push(idx);
        HandlePath {
            expr: self.expr,
            steps,
        }
    }

    pub fn is_prefix_of(&self, other: &HandlePath) -> bool {
        self.expr == other.expr
            && self.steps.len() <= other.steps.len()
            && other.steps[..self.steps.len()] == self.steps[..]
    }
}

impl fmt::Display for HandlePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root.expr[{}]", self.expr)?;
        for s in &self.steps {
            write!(f, ".child[{}]", s)?;
        }
        Ok(())
    }
}

/// One fused function's loop nest, stored as a flat node arena.
#[derive(Clone, Debug, Default)]
pub struct ExprArena {
    nodes: Vec<IrNode>,
    roots: SmallVec<[NodeId; 4]>,
}

impl ExprArena {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, node: IrNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Number of arena slots, orphaned nodes included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_root(&mut self, id: NodeId) {
        self.roots.push(id);
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut SmallVec<[NodeId; 4]> {
        &mut self.roots
    }

    pub fn node(&self, id: NodeId) -> &IrNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut IrNode {
        &mut self.nodes[id]
    }

    /// Resolves a step sequence to a node id. The first step indexes the
    /// roots; each following step indexes the current node's children.
    pub fn resolve(&self, steps: &[usize]) -> Option<NodeId> {
        let (&first, rest) = steps.split_first()?;
        let mut id = *self.roots.get(first)?;
        for &step in rest {
            id = *self.nodes.get(id)?.children().get(step)?;
        }
        Some(id)
    }

    /// Constructs a stage: a block wrapping spatial loops around reduce loops
    /// around a single compute statement, appended to the expr's roots.
    pub fn build_stage(
        &mut self,
        name: &str,
        dest: &str,
        reads: &[&str],
        spatial: &[(&str, i64)],
        reduce: &[(&str, i64)],
        reduce_op: Option<ReduceOp>,
    ) -> NodeId {
        let compute = self.push(IrNode::Compute(ComputeNode {
            dest: dest.to_owned(),
            reads: reads.iter().map(|r| (*r).to_owned()).collect(),
            reduce: reduce_op,
        }));
        let mut inner = compute;
        for &(var, extent) in reduce.iter().rev() {
            inner = self.push(IrNode::Loop(LoopNode {
                var: var.to_owned(),
                extent,
                kind: LoopKind::Serial,
                is_reduce: true,
                annotations: SmallVec::new(),
                children: SmallVec::from_slice(&[inner]),
            }));
        }
        for &(var, extent) in spatial.iter().rev() {
            inner = self.push(IrNode::Loop(LoopNode {
                var: var.to_owned(),
                extent,
                kind: LoopKind::Serial,
                is_reduce: false,
                annotations: SmallVec::new(),
                children: SmallVec::from_slice(&[inner]),
            }));
        }
        let block = self.push(IrNode::Block(BlockNode {
            name: name.to_owned(),
            annotations: SmallVec::new(),
            children: SmallVec::from_slice(&[inner]),
        }));
        self.add_root(block);
        block
    }
}

/// The full lowered compute for one task.
#[derive(Clone, Debug, Default)]
pub struct ModuleIr {
    pub exprs: Vec<ExprArena>,
}

impl ModuleIr {
    pub fn new(exprs: Vec<ExprArena>) -> Self {
        ModuleIr { exprs }
    }

    pub fn deep_copy(&self) -> ModuleIr {
        self.clone()
    }

    pub fn resolve(&self, path: &HandlePath) -> Result<NodeId, IrError> {
        self.exprs
            .get(path.expr)
            .and_then(|arena| arena.resolve(&path.steps))
            .ok_or_else(|| IrError::Unresolved(path.to_string()))
    }

    pub fn node(&self, path: &HandlePath) -> Result<&IrNode, IrError> {
        let id = self.resolve(path)?;
        Ok(self.exprs[path.expr].node(id))
    }

    /// Structural 128-bit hash, stable across processes and arena layouts.
    ///
    /// Loop variable names are excluded: a schedule's identity is its shape,
    /// extents, kinds, annotations, and tensor wiring, not the spelling of
    /// its induction variables.
    pub fn fingerprint(&self) -> u128 {
        let mut hasher = Xxh3::new();
        for arena in &self.exprs {
            hasher.update(b"expr");
            for &root in arena.roots() {
                hash_node(arena, root, &mut hasher);
            }
        }
        hasher.digest128()
    }

    /// Checks the structural invariants every transformation must preserve.
    pub fn validate(&self) -> Result<(), IrError> {
        for (expr_idx, arena) in self.exprs.iter().enumerate() {
            let invalid = |reason: String| IrError::Invalid {
                expr: expr_idx,
                reason,
            };
            let mut visited = vec![false; arena.nodes.len()];
            let mut block_names: Vec<&str> = Vec::new();
            let mut bound_axes: Vec<ThreadAxis> = Vec::new();
            for &root in arena.roots() {
                if arena.nodes.get(root).and_then(IrNode::as_block).is_none() {
                    return Err(invalid(format!("root {} is not a block", root)));
                }
                validate_subtree(
                    arena,
                    root,
                    &mut visited,
                    &mut block_names,
                    &mut bound_axes,
                )
                .map_err(invalid)?;
            }
        }
        Ok(())
    }
}

fn validate_subtree<'a>(
    arena: &'a ExprArena,
    id: NodeId,
    visited: &mut [bool],
    block_names: &mut Vec<&'a str>,
    bound_axes: &mut Vec<ThreadAxis>,
) -> Result<(), String> {
    if id >= visited.len() {
        return Err(format!("node id {} out of bounds", id));
    }
    if visited[id] {
        return Err(format!("node {} reachable twice", id));
    }
    visited[id] = true;

    match arena.node(id) {
        IrNode::Block(b) => {
            if block_names.contains(&b.name.as_str()) {
                return Err(format!("duplicate block name {:?}", b.name));
            }
            block_names.push(&b.name);
            let mut computes = 0usize;
            count_own_computes(arena, id, true, &mut computes);
            if computes != 1 {
                return Err(format!(
                    "block {:?} holds {} compute statements",
                    b.name, computes
                ));
            }
        }
        IrNode::Loop(l) => {
            if l.extent < 1 {
                return Err(format!("loop {:?} has extent {}", l.var, l.extent));
            }
            if let LoopKind::Bound(axis) = l.kind {
                if bound_axes.contains(&axis) {
                    return Err(format!("thread axis {} bound twice", axis));
                }
                bound_axes.push(axis);
            }
        }
        IrNode::Compute(_) => {}
    }
    for &child in arena.node(id).children() {
        validate_subtree(arena, child, visited, block_names, bound_axes)?;
    }
    Ok(())
}

// Counts compute statements in a block's own scope, not descending into
// nested blocks.
fn count_own_computes(arena: &ExprArena, id: NodeId, is_root: bool, count: &mut usize) {
    match arena.node(id) {
        IrNode::Block(_) if !is_root => {}
        IrNode::Compute(_) => *count += 1,
        _ => {
            for &child in arena.node(id).children() {
                count_own_computes(arena, child, false, count);
            }
        }
    }
}

fn hash_node(arena: &ExprArena, id: NodeId, hasher: &mut Xxh3) {
    match arena.node(id) {
        IrNode::Block(b) => {
            hasher.update(b"B");
            hasher.update(b.name.as_bytes());
            for (key, value) in &b.annotations {
                hasher.update(key.as_bytes());
                hasher.update(&value.to_le_bytes());
            }
        }
        IrNode::Loop(l) => {
            hasher.update(b"L");
            hasher.update(&l.extent.to_le_bytes());
            hasher.update(&[l.is_reduce as u8]);
            match l.kind {
                LoopKind::Serial => hasher.update(b"s"),
                LoopKind::Parallel => hasher.update(b"p"),
                LoopKind::Unrolled => hasher.update(b"u"),
                LoopKind::Vectorized => hasher.update(b"v"),
                LoopKind::Bound(axis) => hasher.update(axis.as_str().as_bytes()),
            }
            for (key, value) in &l.annotations {
                hasher.update(key.as_bytes());
                hasher.update(&value.to_le_bytes());
            }
        }
        IrNode::Compute(c) => {
            hasher.update(b"C");
            hasher.update(c.dest.as_bytes());
            for read in &c.reads {
                hasher.update(read.as_bytes());
            }
            match c.reduce {
                None => hasher.update(b"-"),
                Some(ReduceOp::Sum) => hasher.update(b"+"),
                Some(ReduceOp::Max) => hasher.update(b"^"),
            }
        }
    }
    hasher.update(&(arena.node(id).children().len() as u32).to_le_bytes());
    for &child in arena.node(id).children() {
        hash_node(arena, child, hasher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matmul_expr() -> ExprArena {
        let mut arena = ExprArena::new();
        arena.build_stage(
            "matmul",
            "c",
            &["a", "b"],
            &[("i", 64), ("j", 64)],
            &[("k", 32)],
            Some(ReduceOp::Sum),
        );
        arena
    }

    #[test]
    fn build_stage_produces_valid_module() {
        let module = ModuleIr::new(vec![matmul_expr()]);
        module.validate().unwrap();
        assert_eq!(module.exprs[0].roots().len(), 1);
    }

    #[test]
    fn resolve_walks_child_steps() {
        let module = ModuleIr::new(vec![matmul_expr()]);
        let block = HandlePath::new(0, smallvec::smallvec![0]);
        assert!(module.node(&block).unwrap().as_block().is_some());
        let inner = HandlePath::new(0, smallvec::smallvec![0, 0, 0, 0]);
        let loop_k = module.node(&inner).unwrap().as_loop().unwrap();
        assert_eq!(loop_k.var, "k");
        assert!(loop_k.is_reduce);

        let missing = HandlePath::new(0, smallvec::smallvec![0, 0, 0, 0, 0, 9]);
        assert!(module.node(&missing).is_err());
    }

    #[test]
    fn fingerprint_ignores_loop_var_names() {
        let mut a = ExprArena::new();
        a.build_stage("s", "y", &["x"], &[("i", 16)], &[], None);
        let mut b = ExprArena::new();
        b.build_stage("s", "y", &["x"], &[("outer", 16)], &[], None);
        assert_eq!(
            ModuleIr::new(vec![a]).fingerprint(),
            ModuleIr::new(vec![b]).fingerprint()
        );
    }

    #[test]
    fn fingerprint_sees_extents_and_kinds() {
        let mut a = ExprArena::new();
        a.build_stage("s", "y", &["x"], &[("i", 16)], &[], None);
        let mut b = ExprArena::new();
        b.build_stage("s", "y", &["x"], &[("i", 32)], &[], None);
        let fp_a = ModuleIr::new(vec![a.clone()]).fingerprint();
        assert_ne!(fp_a, ModuleIr::new(vec![b]).fingerprint());

        // Same shape, different loop kind.
        let loop_id = a.resolve(&[0, 0]).unwrap();
        if let IrNode::Loop(l) = a.node_mut(loop_id) {
            l.kind = LoopKind::Parallel;
        }
        assert_ne!(fp_a, ModuleIr::new(vec![a]).fingerprint());
    }

    #[test]
    fn deep_copy_is_independent() {
        let module = ModuleIr::new(vec![matmul_expr()]);
        let mut copy = module.deep_copy();
        let loop_id = copy.exprs[0].resolve(&[0, 0]).unwrap();
        if let IrNode::Loop(l) = copy.exprs[0].node_mut(loop_id) {
            l.extent = 128;
        }
        assert_ne!(module.fingerprint(), copy.fingerprint());
    }

    #[test]
    fn validate_rejects_zero_extent() {
        let mut arena = ExprArena::new();
        arena.build_stage("s", "y", &["x"], &[("i", 0)], &[], None);
        assert!(ModuleIr::new(vec![arena]).validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_block_names() {
        let mut arena = ExprArena::new();
        arena.build_stage("s", "y", &["x"], &[("i", 4)], &[], None);
        arena.build_stage("s", "z", &["y"], &[("i", 4)], &[], None);
        assert!(ModuleIr::new(vec![arena]).validate().is_err());
    }

    #[test]
    fn validate_rejects_doubly_bound_axis() {
        let mut arena = ExprArena::new();
        arena.build_stage("s", "y", &["x"], &[("i", 8), ("j", 8)], &[], None);
        for steps in [&[0usize, 0][..], &[0, 0, 0][..]] {
            let id = arena.resolve(steps).unwrap();
            if let IrNode::Loop(l) = arena.node_mut(id) {
                l.kind = LoopKind::Bound(ThreadAxis::ThreadX);
            }
        }
        assert!(ModuleIr::new(vec![arena]).validate().is_err());
    }

    #[test]
    fn handle_path_parent_and_prefix() {
        let path = HandlePath::new(1, smallvec::smallvec![0, 2, 1]);
        let parent = path.parent().unwrap();
        assert_eq!(parent.steps[..], [0, 2]);
        assert!(parent.is_prefix_of(&path));
        assert!(!path.is_prefix_of(&parent));
        assert_eq!(parent.child(1), path);
        assert!(HandlePath::new(1, smallvec::smallvec![0]).parent().is_none());
    }
}
