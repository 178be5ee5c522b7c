#![forbid(unsafe_code)]
//! quarry-planner: from a (YAML) query to the initial execution plan.
//!
//! Design:
//! - `ast` is the query surface: an ordered list of FOR/LET/FILTER/SORT/
//!   LIMIT/COLLECT/modification/RETURN statements whose expressions name
//!   variables by their query names.
//! - `dsl` parses YAML query documents and the text form of expressions.
//! - `build` resolves names through the per-query `VariableRegistry` and
//!   lowers the statements into `Singleton → … → Return`.

pub mod ast;
pub mod build;
pub mod dsl;
pub mod error;

pub use ast::{AstExpr, Query, Statement};
pub use build::{build_plan, PlanBuilder};
pub use dsl::expr::parse_expr;
pub use dsl::yaml::parse_yaml_query;
pub use error::{PlannerError, Result};

use quarry_core::variable::VariableRegistry;
use quarry_plan::catalog::IndexCatalog;
use quarry_plan::Plan;

/// Parse a YAML query and build its initial plan.
pub fn plan_yaml_query(
    yaml_src: &str,
    vars: &mut VariableRegistry,
    catalog: &dyn IndexCatalog,
) -> Result<Plan> {
    let query = parse_yaml_query(yaml_src)?;
    Ok(build_plan(&query, vars, catalog)?)
}
