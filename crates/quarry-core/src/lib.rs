#![forbid(unsafe_code)]
//! quarry-core: the vocabulary shared by every optimizer crate.
//!
//! - strongly-typed node/variable ids
//! - the per-query `VariableRegistry`
//! - the expression tree that calculations, filters and index conditions carry
//! - the error taxonomy and the optimizer configuration
//! - stable hashing used for plan fingerprints and shard routing
//!
//! No plan-graph or rule logic lives here.

pub mod config;
pub mod error;
pub mod expr;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod variable;

pub use config::{CostConstants, OptimizerConfig};
pub use error::{Error, Result};
pub use expr::{AttributeComparison, BinaryOp, ComparisonOp, Expr, StringifyError, UnaryOp};
pub use hash::Hash256;
pub use id::{NodeId, VariableId};
pub use variable::{Variable, VariableRegistry};
