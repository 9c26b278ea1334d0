//! Rule families for sketch generation and trace mutation.
//!
//! Both families are closed sets: variants dispatch through an
//! `enum_dispatch` trait and new rules are added by extending the enum and
//! its registry function.

pub mod mutate;
pub mod sketch;

pub use mutate::{mutate_rule_registry, MutateRule, MutateRuleApi};
pub use sketch::{sketch_rule_registry, SketchOutcome, SketchRule, SketchRuleApi};
