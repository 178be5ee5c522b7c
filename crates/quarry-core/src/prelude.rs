//! The types nearly every caller of the optimizer touches.

pub use crate::config::{CostConstants, OptimizerConfig};
pub use crate::error::{Error, Result};
pub use crate::expr::{BinaryOp, Expr};
pub use crate::id::{NodeId, VariableId};
pub use crate::variable::VariableRegistry;
