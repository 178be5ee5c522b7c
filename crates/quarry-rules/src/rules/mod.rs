//! Rule bodies, grouped by the node kinds they rewrite.

pub mod calculations;
pub mod cluster;
pub mod collect;
pub mod enumerations;
pub mod filters;
pub mod indexes;
pub mod sorts;
pub mod subquery;

use quarry_core::expr::{AttributeComparison, Expr};
use quarry_core::id::{NodeId, VariableId};
use quarry_core::Result;
use quarry_plan::{NodeKind, NodeType, Plan};

/// The calculation that sets `var`, with a copy of its expression.
pub(crate) fn calculation_of(plan: &Plan, var: VariableId) -> Result<Option<(NodeId, Expr)>> {
    let Some(setter) = plan.get_var_set_by(var) else {
        return Ok(None);
    };
    match plan.kind(setter)? {
        NodeKind::Calculation { expr, .. } => Ok(Some((setter, expr.clone()))),
        _ => Ok(None),
    }
}

/// Comparisons on `var` from the filters that consume the rows of the scan
/// at `scan`, up to the first limit or scope boundary.
pub(crate) fn conditions_above(
    plan: &Plan,
    scan: NodeId,
    var: VariableId,
) -> Result<Vec<AttributeComparison>> {
    let mut out: Vec<AttributeComparison> = Vec::new();
    let mut cur = single_parent(plan, scan)?;
    while let Some(c) = cur {
        let t = plan.node_type(c)?;
        if t == NodeType::Limit || is_barrier(t) {
            break;
        }
        if let NodeKind::Filter { in_var } = plan.kind(c)? {
            if let Some((_, expr)) = calculation_of(plan, *in_var)? {
                for part in expr.conjuncts() {
                    match part.as_attribute_comparison() {
                        Some(cmp) if cmp.var == var && !out.contains(&cmp) => out.push(cmp),
                        _ => {}
                    }
                }
            }
        }
        cur = single_parent(plan, c)?;
    }
    Ok(out)
}

/// The dependency of `id` if it has exactly one.
pub(crate) fn single_dependency(plan: &Plan, id: NodeId) -> Result<Option<NodeId>> {
    match plan.dependencies(id)? {
        [dep] => Ok(Some(*dep)),
        _ => Ok(None),
    }
}

/// The parent of `id` if it has exactly one.
pub(crate) fn single_parent(plan: &Plan, id: NodeId) -> Result<Option<NodeId>> {
    match plan.parents(id)? {
        [p] => Ok(Some(*p)),
        _ => Ok(None),
    }
}

/// Kinds nothing may be moved across: they change the row scope, write data,
/// or cross a server boundary.
pub(crate) fn is_barrier(t: NodeType) -> bool {
    t.is_modification()
        || t.is_cluster()
        || matches!(
            t,
            NodeType::Collect
                | NodeType::SubqueryStart
                | NodeType::SubqueryEnd
                | NodeType::NoResults
                | NodeType::Singleton
        )
}
