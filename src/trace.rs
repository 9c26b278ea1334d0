//! The schedule trace: an append-only log of transformation records.
//!
//! The trace is the canonical identity of a schedule. Replaying it against
//! the task's seed IR (see [crate::ir::schedule::Schedule::replay])
//! deterministically reproduces the scheduled IR, which is what makes traces
//! cheap to store, mutate, and ship across processes. Handles inside records
//! are symbolic [HandlePath]s, never arena ids.

use crate::ir::HandlePath;
use crate::utils::join_into_string;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// Leading byte of every serialized trace. Bump on layout changes.
pub const TRACE_FORMAT_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TraceOp {
    Split,
    Fuse,
    Reorder,
    Tile,
    Bind,
    Unroll,
    Vectorize,
    Parallel,
    CacheRead,
    CacheWrite,
    ComputeAt,
    ComputeInline,
    Rfactor,
    StorageAlign,
    Pragma,
}

impl TraceOp {
    pub fn name(&self) -> &'static str {
        match self {
            TraceOp::Split => "split",
            TraceOp::Fuse => "fuse",
            TraceOp::Reorder => "reorder",
            TraceOp::Tile => "tile",
            TraceOp::Bind => "bind",
            TraceOp::Unroll => "unroll",
            TraceOp::Vectorize => "vectorize",
            TraceOp::Parallel => "parallel",
            TraceOp::CacheRead => "cache_read",
            TraceOp::CacheWrite => "cache_write",
            TraceOp::ComputeAt => "compute_at",
            TraceOp::ComputeInline => "compute_inline",
            TraceOp::Rfactor => "rfactor",
            TraceOp::StorageAlign => "storage_align",
            TraceOp::Pragma => "pragma",
        }
    }
}

/// A typed operand of a transformation record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Int(i64),
    Str(String),
    Block(HandlePath),
    Loop(HandlePath),
}

impl Operand {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Operand::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Operand::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&HandlePath> {
        match self {
            Operand::Block(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_loop(&self) -> Option<&HandlePath> {
        match self {
            Operand::Loop(p) => Some(p),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&HandlePath> {
        match self {
            Operand::Block(p) | Operand::Loop(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Int(v) => write!(f, "{}", v),
            Operand::Str(s) => write!(f, "{:?}", s),
            Operand::Block(p) | Operand::Loop(p) => write!(f, "{}", p),
        }
    }
}

/// One applied transformation: opcode, typed operands, and the handles the
/// operation produced (empty for operations that create no loops or blocks).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub op: TraceOp,
    pub operands: SmallVec<[Operand; 4]>,
    pub results: SmallVec<[HandlePath; 2]>,
}

impl TraceRecord {
    pub fn new(op: TraceOp, operands: SmallVec<[Operand; 4]>) -> Self {
        TraceRecord {
            op,
            operands,
            results: SmallVec::new(),
        }
    }

    /// The expr this record operates on. Every transformation is local to a
    /// single expr, identified by its first handle operand.
    pub fn expr_index(&self) -> Option<usize> {
        self.operands.iter().find_map(|o| o.handle()).map(|h| h.expr)
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.op.name(),
            join_into_string(&self.operands, ", ")
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TraceError {
    #[error("unsupported trace format version {0}")]
    UnsupportedVersion(u8),
    #[error("trace bytes are empty")]
    Empty,
    #[error("malformed trace body")]
    Malformed(#[from] bincode::Error),
}

/// An ordered, append-only sequence of [TraceRecord]s.
///
/// Traces are immutable once handed out of a schedule: mutation rules and
/// crossover always build new traces rather than editing in place.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrace {
    records: Vec<TraceRecord>,
}

impl ScheduleTrace {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn append(&mut self, record: TraceRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_at(&self, i: usize) -> Option<&TraceRecord> {
        self.records.get(i)
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    /// Drops all records at positions `>= i`.
    pub fn truncate(&mut self, i: usize) {
        self.records.truncate(i);
    }

    /// Records touching the given top-level expr, in trace order. Exprs are
    /// transformed independently, so this is a partition of the trace.
    pub fn records_for_expr(&self, expr: usize) -> impl Iterator<Item = &TraceRecord> {
        self.records
            .iter()
            .filter(move |r| r.expr_index() == Some(expr))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let body = bincode::serialize(&self.records)
            .expect("trace records always serialize");
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(TRACE_FORMAT_VERSION);
        bytes.extend_from_slice(&body);
        bytes
    }

    pub fn deserialize(bytes: &[u8]) -> Result<ScheduleTrace, TraceError> {
        let (&version, body) = bytes.split_first().ok_or(TraceError::Empty)?;
        if version != TRACE_FORMAT_VERSION {
            return Err(TraceError::UnsupportedVersion(version));
        }
        Ok(ScheduleTrace {
            records: bincode::deserialize(body)?,
        })
    }

    /// Hash of the serialized byte form. Distinguishes textually different
    /// traces even when their replayed IR would coincide.
    pub fn byte_fingerprint(&self) -> u128 {
        xxh3_128(&self.serialize())
    }
}

impl fmt::Display for ScheduleTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn split_record(expr: usize) -> TraceRecord {
        TraceRecord::new(
            TraceOp::Split,
            smallvec![
                Operand::Loop(HandlePath::new(expr, smallvec![0, 0])),
                Operand::Int(8),
                Operand::Int(4),
            ],
        )
    }

    #[test]
    fn append_and_indexing() {
        let mut trace = ScheduleTrace::new();
        assert!(trace.is_empty());
        trace.append(split_record(0));
        trace.append(TraceRecord::new(TraceOp::Fuse, smallvec![]));
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.record_at(0).unwrap().op, TraceOp::Split);
        assert!(trace.record_at(2).is_none());
        trace.truncate(1);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn serialize_round_trips() {
        let mut trace = ScheduleTrace::new();
        trace.append(split_record(0));
        trace.append(TraceRecord::new(
            TraceOp::Pragma,
            smallvec![
                Operand::Loop(HandlePath::new(0, smallvec![0, 0])),
                Operand::Str("auto_unroll_max_step".into()),
                Operand::Int(64),
            ],
        ));
        let bytes = trace.serialize();
        assert_eq!(bytes[0], TRACE_FORMAT_VERSION);
        let back = ScheduleTrace::deserialize(&bytes).unwrap();
        assert_eq!(back, trace);
        assert_eq!(back.byte_fingerprint(), trace.byte_fingerprint());
    }

    #[test]
    fn deserialize_rejects_unknown_version() {
        let mut bytes = ScheduleTrace::new().serialize();
        bytes[0] = 99;
        assert!(matches!(
            ScheduleTrace::deserialize(&bytes),
            Err(TraceError::UnsupportedVersion(99))
        ));
        assert!(matches!(
            ScheduleTrace::deserialize(&[]),
            Err(TraceError::Empty)
        ));
    }

    #[test]
    fn records_partition_by_expr() {
        let mut trace = ScheduleTrace::new();
        trace.append(split_record(0));
        trace.append(split_record(1));
        trace.append(split_record(0));
        assert_eq!(trace.records_for_expr(0).count(), 2);
        assert_eq!(trace.records_for_expr(1).count(), 1);
        assert_eq!(trace.records_for_expr(2).count(), 0);
    }

    #[test]
    fn record_display_is_readable() {
        let record = split_record(0);
        assert_eq!(
            record.to_string(),
            "split(root.expr[0].child[0].child[0], 8, 4)"
        );
    }

    proptest::proptest! {
        #[test]
        fn serialization_round_trips_any_opcodes(
            ops in proptest::collection::vec(proptest::prelude::any::<TraceOp>(), 0..12)
        ) {
            let mut trace = ScheduleTrace::new();
            for op in ops {
                trace.append(TraceRecord::new(
                    op,
                    smallvec![
                        Operand::Loop(HandlePath::new(0, smallvec![0])),
                        Operand::Int(7),
                    ],
                ));
            }
            let back = ScheduleTrace::deserialize(&trace.serialize()).unwrap();
            proptest::prop_assert_eq!(back, trace);
        }
    }
}
