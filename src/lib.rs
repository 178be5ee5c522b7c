#![forbid(unsafe_code)]
//! quarry: a rule-based query plan optimizer.
//!
//! The workspace crates, re-exported here:
//! - `core`: ids, variables, expressions, errors, configuration
//! - `plan`: the plan graph, node catalog, liveness and cost model
//! - `rules`: the rewrite rules and their catalog
//! - `optimizer`: the rule scheduler and plan selection
//! - `planner`: query AST, YAML DSL and initial plan construction

pub use quarry_core as core;
pub use quarry_optimizer as optimizer;
pub use quarry_plan as plan;
pub use quarry_planner as planner;
pub use quarry_rules as rules;

pub use quarry_core::{Error, OptimizerConfig, Result};
pub use quarry_optimizer::{OptimizeResult, Optimizer, OptimizerStats};
pub use quarry_plan::{IndexCatalog, MemoryCatalog, Plan, Topology};
pub use quarry_planner::{parse_yaml_query, PlannerError, Query};

use quarry_core::variable::VariableRegistry;
use quarry_plan::CostEstimate;
use quarry_rules::RuleCatalog;

/// A selected plan together with the variables it refers to.
#[derive(Debug)]
pub struct Optimized {
    pub plan: Plan,
    pub vars: VariableRegistry,
    pub cost: CostEstimate,
    pub stats: OptimizerStats,
}

/// Build the initial plan for `query` and run the default rule catalog on it.
pub fn optimize_query<C>(query: &Query, catalog: &C, config: OptimizerConfig) -> Result<Optimized>
where
    C: IndexCatalog + Topology,
{
    let mut vars = VariableRegistry::new();
    let plan = quarry_planner::build_plan(query, &mut vars, catalog)?;
    let optimizer = Optimizer::new(RuleCatalog::default(), config)?;
    let OptimizeResult { plan, cost, stats } =
        optimizer.optimize(plan, &mut vars, catalog, catalog)?;
    Ok(Optimized {
        plan,
        vars,
        cost,
        stats,
    })
}

/// [`optimize_query`] for a YAML query document.
pub fn optimize_yaml<C>(
    yaml_src: &str,
    catalog: &C,
    config: OptimizerConfig,
) -> std::result::Result<Optimized, PlannerError>
where
    C: IndexCatalog + Topology,
{
    let query = parse_yaml_query(yaml_src)?;
    Ok(optimize_query(&query, catalog, config)?)
}

/// The selected plan as the JSON document handed to the execution engine.
pub fn explain_json(optimized: &Optimized, config: &OptimizerConfig) -> Result<serde_json::Value> {
    let doc = quarry_plan::export::explain(&optimized.plan, &optimized.vars, &config.costs)?;
    Ok(serde_json::to_value(doc)?)
}
