#![forbid(unsafe_code)]
//! quarry-rules: the rewrite rules and their catalog.
//!
//! Design:
//! - A rule is a plain function from a plan to one or more plans; each
//!   output says whether it was modified and whether its level reruns.
//! - Rules are grouped by level; the catalog keeps them level-ordered and
//!   registration-ordered within a level.
//! - Rules that fan out draw from a branch budget handed to them through
//!   the `RuleContext`, so a rule never exceeds the candidate cap.
//! - Cluster rules run only when the topology reports a coordinator.

pub mod catalog;
pub mod rule;
pub mod rules;

pub use catalog::RuleCatalog;
pub use rule::{single, Rule, RuleContext, RuleFlags, RuleFn, RuleOutput};
