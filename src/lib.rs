//! damson: an evolutionary auto-scheduling core for tensor programs.
//!
//! Given a lowered loop nest ([ir::ModuleIr]) and a [cost::CostModel], the
//! search explores semantics-preserving schedule variants and returns the
//! candidates worth measuring. Schedules are identified by their replayable
//! transformation [trace::ScheduleTrace]s; measured results feed back through
//! the [database::TuningDatabase] to warm-start later rounds.

pub mod bestset;
pub mod cost;
pub mod database;
pub mod evolution;
pub mod ir;
pub mod rng;
pub mod rules;
pub mod search_space;
pub mod state;
pub mod task;
pub mod trace;
pub mod tuning;
pub mod utils;
