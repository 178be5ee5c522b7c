//! Serialized form of a finished plan.
//!
//! The execution engine consumes the JSON form; humans read the text form
//! printed by `quarry explain`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use quarry_core::hash::Hash256;
use quarry_core::variable::VariableRegistry;
use quarry_core::{CostConstants, Result};
use serde::{Deserialize, Serialize};

use crate::cost::{estimate_node, CostEstimate};
use crate::node::NodeKind;
use crate::plan::Plan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainNode {
    pub id: u64,
    pub node_type: String,
    pub dependencies: Vec<u64>,
    /// Names of the variables read here.
    pub uses: Vec<String>,
    /// Names of the variables introduced here.
    pub sets: Vec<String>,
    /// Per-kind configuration, as handed to the execution engine.
    pub config: serde_json::Value,
    pub estimated_rows: u64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExplain {
    pub root: u64,
    pub nodes: Vec<ExplainNode>,
    /// Rules that modified the plan, in application order.
    pub rules: Vec<String>,
    pub estimated_cost: f64,
    pub estimated_rows: u64,
    /// Stable structural hash of the plan.
    pub fingerprint: Hash256,
}

pub fn explain(plan: &Plan, vars: &VariableRegistry, costs: &CostConstants) -> Result<PlanExplain> {
    let root = plan.root()?;
    let mut memo: BTreeMap<_, CostEstimate> = BTreeMap::new();
    let mut nodes = Vec::new();

    for id in plan.reachable_nodes() {
        let node = plan.node(id)?;
        let estimate = estimate_node(plan, id, costs, &mut memo)?;
        nodes.push(ExplainNode {
            id: id.get(),
            node_type: node.node_type().name().to_string(),
            dependencies: node.dependencies().iter().map(|d| d.get()).collect(),
            uses: plan
                .variables_used_here(id)?
                .into_iter()
                .map(|v| vars.name_of(v))
                .collect(),
            sets: node
                .kind()
                .variables_set_here()
                .into_iter()
                .map(|v| vars.name_of(v))
                .collect(),
            config: serde_json::to_value(node.kind())?,
            estimated_rows: estimate.rows,
            estimated_cost: estimate.cpu,
        });
    }

    let total = estimate_node(plan, root, costs, &mut memo)?;
    Ok(PlanExplain {
        root: root.get(),
        nodes,
        rules: plan.applied_rules().to_vec(),
        estimated_cost: total.cpu,
        estimated_rows: total.rows,
        fingerprint: plan.fingerprint()?,
    })
}

/// One line per node, leaves first.
pub fn render_text(plan: &Plan, vars: &VariableRegistry, costs: &CostConstants) -> Result<String> {
    let root = plan.root()?;
    let mut memo = BTreeMap::new();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:<24} {:>10} {:>14}  comment",
        "id", "type", "rows", "cost"
    );
    render_scope(plan, vars, costs, root, 0, &mut memo, &mut out)?;
    if !plan.applied_rules().is_empty() {
        let _ = writeln!(out, "\nrules applied: {}", plan.applied_rules().join(", "));
    }
    Ok(out)
}

fn render_scope(
    plan: &Plan,
    vars: &VariableRegistry,
    costs: &CostConstants,
    scope_root: quarry_core::NodeId,
    depth: usize,
    memo: &mut BTreeMap<quarry_core::NodeId, CostEstimate>,
    out: &mut String,
) -> Result<()> {
    for id in plan.topological_order(scope_root)? {
        let node = plan.node(id)?;
        let e = estimate_node(plan, id, costs, memo)?;
        let indent = "  ".repeat(depth);
        let _ = writeln!(
            out,
            "{:>4}  {:<24} {:>10} {:>14.2}  {}",
            id.get(),
            format!("{indent}{}", node.node_type().name()),
            e.rows,
            e.cpu,
            describe(node.kind(), vars)
        );
        if let NodeKind::Subquery { body, .. } = node.kind() {
            render_scope(plan, vars, costs, *body, depth + 1, memo, out)?;
        }
    }
    Ok(())
}

fn describe(kind: &NodeKind, vars: &VariableRegistry) -> String {
    let name = |v| vars.name_of(v);
    match kind {
        NodeKind::Singleton | NodeKind::Remote | NodeKind::NoResults => String::new(),
        NodeKind::EnumerateCollection(s) => {
            let order = if s.random { " (random order)" } else { "" };
            format!("FOR {} IN {}{order}", name(s.out_var), s.collection)
        }
        NodeKind::IndexScan(s) => {
            let cond: Vec<String> = s
                .condition
                .iter()
                .map(|c| {
                    format!(
                        "{}.{} {} {}",
                        name(c.var),
                        c.dotted_path(),
                        c.op.binary_op().symbol(),
                        c.value
                    )
                })
                .collect();
            format!(
                "FOR {} IN {} /* index {}{} */{}",
                name(s.out_var),
                s.collection,
                s.index.name,
                if s.reverse { ", reverse" } else { "" },
                if cond.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", cond.join(" && "))
                }
            )
        }
        NodeKind::EnumerateList { in_var, out_var } => {
            format!("FOR {} IN {}", name(*out_var), name(*in_var))
        }
        NodeKind::Filter { in_var } => format!("FILTER {}", name(*in_var)),
        NodeKind::Limit { offset, limit } => format!("LIMIT {offset}, {limit}"),
        NodeKind::Calculation { out_var, expr } => {
            format!("LET {} = {}", name(*out_var), expr.display_with(vars))
        }
        NodeKind::Subquery { out_var, .. } => format!("LET {} = ( subquery )", name(*out_var)),
        NodeKind::SubqueryStart { .. } => "subquery begin".to_string(),
        NodeKind::SubqueryEnd { out_var, .. } => {
            format!("LET {} = ( subquery end )", name(*out_var))
        }
        NodeKind::Sort { elements, limit, .. } => {
            let keys: Vec<String> = elements
                .iter()
                .map(|e| format!("{} {}", name(e.var), if e.ascending { "ASC" } else { "DESC" }))
                .collect();
            match limit {
                Some(m) => format!("SORT {} /* heap, limit {m} */", keys.join(", ")),
                None => format!("SORT {}", keys.join(", ")),
            }
        }
        NodeKind::Collect(c) => {
            let groups: Vec<String> = c
                .groups
                .iter()
                .map(|g| format!("{} = {}", name(g.out_var), name(g.in_var)))
                .collect();
            let mut s = format!("COLLECT {}", groups.join(", "));
            if !c.aggregates.is_empty() {
                let aggs: Vec<String> = c
                    .aggregates
                    .iter()
                    .map(|a| {
                        let arg = a.in_var.map(name).unwrap_or_default();
                        format!("{} = {:?}({arg})", name(a.out_var), a.function)
                    })
                    .collect();
                let _ = write!(s, " AGGREGATE {}", aggs.join(", "));
            }
            if let Some(into) = c.into {
                let _ = write!(s, " INTO {}", name(into));
            }
            s
        }
        NodeKind::Scatter { shards, .. } => format!("{shards} shards"),
        NodeKind::Gather(g) => {
            format!("{} shards, {:?}, {:?}", g.shards, g.sort_mode, g.parallelism)
        }
        NodeKind::Distribute { in_var, .. } => format!("by {}", name(*in_var)),
        NodeKind::Insert(m) => format!("INSERT {} IN {}", name(m.in_var), m.collection),
        NodeKind::Remove(m) => format!("REMOVE {} IN {}", name(m.routing_var()), m.collection),
        NodeKind::Update(m) => format!("UPDATE {} IN {}", name(m.in_var), m.collection),
        NodeKind::Replace(m) => format!("REPLACE {} IN {}", name(m.in_var), m.collection),
        NodeKind::Return { in_var } => format!("RETURN {}", name(*in_var)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::expr::Expr;

    #[test]
    fn explain_lists_every_node() {
        let mut vars = VariableRegistry::new();
        let x = vars.create_variable("x").id;
        let mut plan = Plan::new();
        let s = plan.create_node(NodeKind::Singleton);
        let c = plan.create_node(NodeKind::Calculation {
            out_var: x,
            expr: Expr::value(1),
        });
        let r = plan.create_node(NodeKind::Return { in_var: x });
        plan.add_dependency(c, s).unwrap();
        plan.add_dependency(r, c).unwrap();
        plan.set_root(r).unwrap();

        let costs = CostConstants::default();
        let e = explain(&plan, &vars, &costs).unwrap();
        assert_eq!(e.nodes.len(), 3);
        assert_eq!(e.nodes[0].node_type, "ReturnNode");
        assert_eq!(e.nodes[0].uses, vec!["x".to_string()]);
        assert_eq!(e.nodes[1].config["type"], "calculation");

        let text = render_text(&plan, &vars, &costs).unwrap();
        assert!(text.contains("LET x = 1"));
        assert!(text.contains("RETURN x"));
    }
}
