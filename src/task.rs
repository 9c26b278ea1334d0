//! Tuning tasks and the process-wide initial-module registry.

use crate::ir::{ExprArena, ModuleIr, ReduceOp};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Cpu,
    Gpu,
}

/// One optimization problem: a stable key identifying the fused op group,
/// target, and input signature, plus the seed lowered IR to schedule.
#[derive(Clone, Debug)]
pub struct TuneTask {
    pub key: String,
    pub seed: ModuleIr,
    pub target: TargetKind,
}

impl TuneTask {
    pub fn new(key: impl Into<String>, seed: ModuleIr, target: TargetKind) -> Self {
        TuneTask {
            key: key.into(),
            seed,
            target,
        }
    }
}

lazy_static! {
    static ref INITIAL_MODULES: RwLock<HashMap<String, ModuleIr>> = RwLock::new(HashMap::new());
}

/// Records the seed module for a task key, first writer wins. Init-on-first-
/// use with no teardown; drivers replaying database records out of band look
/// seeds up here.
pub fn register_initial_module(key: &str, module: &ModuleIr) {
    let mut map = INITIAL_MODULES.write().unwrap();
    map.entry(key.to_owned()).or_insert_with(|| module.deep_copy());
}

pub fn initial_module(key: &str) -> Option<ModuleIr> {
    INITIAL_MODULES.read().unwrap().get(key).map(ModuleIr::deep_copy)
}

/// A small fused group (elementwise producer feeding a matmul), the demo and
/// test workload.
pub fn demo_matmul_task(m: i64, n: i64, k: i64, target: TargetKind) -> TuneTask {
    let mut arena = ExprArena::new();
    arena.build_stage(
        "relu",
        "a_relu",
        &["a"],
        &[("i", m), ("k", k)],
        &[],
        None,
    );
    arena.build_stage(
        "matmul",
        "c",
        &["a_relu", "b"],
        &[("i", m), ("j", n)],
        &[("k", k)],
        Some(ReduceOp::Sum),
    );
    let seed = ModuleIr::new(vec![arena]);
    let key = format!(
        "relu_matmul[m={},n={},k={}]@{}",
        m,
        n,
        k,
        match target {
            TargetKind::Cpu => "cpu",
            TargetKind::Gpu => "gpu",
        }
    );
    TuneTask::new(key, seed, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_task_is_valid_and_keyed_by_shape() {
        let task = demo_matmul_task(64, 64, 32, TargetKind::Cpu);
        task.seed.validate().unwrap();
        assert!(task.key.contains("m=64"));
        assert_ne!(
            task.key,
            demo_matmul_task(64, 64, 32, TargetKind::Gpu).key
        );
    }

    #[test]
    fn registry_keeps_first_registration() {
        let task = demo_matmul_task(16, 16, 8, TargetKind::Cpu);
        register_initial_module(&task.key, &task.seed);
        let other = demo_matmul_task(32, 32, 8, TargetKind::Cpu);
        register_initial_module(&task.key, &other.seed);

        let stored = initial_module(&task.key).unwrap();
        assert_eq!(stored.fingerprint(), task.seed.fingerprint());
        assert!(initial_module("unknown-key").is_none());
    }
}
