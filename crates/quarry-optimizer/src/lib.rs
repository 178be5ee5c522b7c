#![forbid(unsafe_code)]
//! quarry-optimizer: the rule scheduler and plan selection.
//!
//! The scheduler walks rule levels in ascending order, runs every pending
//! candidate plan through the rules of a level, keeps the alternatives that
//! branching rules produce (up to the candidate cap) and finally selects the
//! cheapest surviving plan.

pub mod metrics;
pub mod scheduler;

pub use scheduler::{OptimizeResult, Optimizer, OptimizerStats};
