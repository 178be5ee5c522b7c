//! Calculation rewrites: hoisting out of loops, sinking towards consumers,
//! sharing identical expressions, fusing single-use chains and dropping dead
//! values.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::expr::Expr;
use quarry_core::id::{NodeId, VariableId};
use quarry_core::Result;
use quarry_plan::{NodeKind, NodeType, Plan};

use super::{is_barrier, single_dependency, single_parent};
use crate::rule::{single, RuleContext, RuleOutput};

/// Move deterministic, non-throwing calculations towards the leaves, out of
/// every loop that does not define one of their inputs. A calculation only
/// moves if that takes it past at least one enumeration.
pub fn move_calculations_up(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&[NodeType::Calculation], true) {
        let NodeKind::Calculation { expr, .. } = plan.kind(id)? else {
            continue;
        };
        if expr.can_throw() || !expr.is_deterministic() {
            continue;
        }
        let needed = expr.variables();

        let mut target = None;
        let mut passed_loop = false;
        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            let t = plan.node_type(c)?;
            if is_barrier(t) || t == NodeType::Limit {
                break;
            }
            if plan
                .kind(c)?
                .variables_set_here()
                .iter()
                .any(|v| needed.contains(v))
            {
                break;
            }
            let Some(next) = single_dependency(&plan, c)? else {
                break;
            };
            passed_loop |= t.is_enumeration();
            target = Some(c);
            cur = Some(next);
        }

        if let (Some(below), true) = (target, passed_loop) {
            plan.unlink_node(id, false)?;
            plan.insert_dependency(below, id)?;
            modified = true;
        }
    }
    single(plan, modified)
}

/// Move deterministic, non-throwing calculations towards their first
/// consumer, past filters, sorts, limits and subqueries, so rows that get
/// discarded are never computed. Never moves into a loop.
pub fn move_calculations_down(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&[NodeType::Calculation], true) {
        let NodeKind::Calculation { expr, out_var } = plan.kind(id)? else {
            continue;
        };
        if expr.can_throw() || !expr.is_deterministic() {
            continue;
        }
        let var = *out_var;

        let mut should_move = false;
        let mut stop_at = None;
        let mut cur = single_parent(&plan, id)?;
        while let Some(c) = cur {
            let t = plan.node_type(c)?;
            if plan.variables_used_here(c)?.contains(&var)
                || t.is_enumeration()
                || is_barrier(t)
            {
                stop_at = Some(c);
                break;
            }
            if matches!(
                t,
                NodeType::Filter | NodeType::Sort | NodeType::Limit | NodeType::Subquery
            ) {
                should_move = true;
            }
            cur = single_parent(&plan, c)?;
        }

        if let (Some(consumer), true) = (stop_at, should_move) {
            plan.unlink_node(id, false)?;
            plan.insert_dependency(consumer, id)?;
            modified = true;
        }
    }
    single(plan, modified)
}

/// Calculations repeating an expression computed further down reuse the
/// earlier result. Comparison is textual; expressions too long to render are
/// skipped.
pub fn remove_redundant_calculations(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let nodes = plan.find_nodes_of_type(&[NodeType::Calculation], true);
    if nodes.len() < 2 {
        return single(plan, false);
    }
    let max_len = ctx.costs().max_stringify_len;
    let mut replacements: BTreeMap<VariableId, VariableId> = BTreeMap::new();

    for id in nodes {
        let NodeKind::Calculation { expr, out_var } = plan.kind(id)? else {
            continue;
        };
        if !expr.is_deterministic() {
            continue;
        }
        let out_var = *out_var;
        let reference = match expr.stringify(max_len) {
            Ok(s) => s,
            Err(e) => {
                tracing::trace!(node = %id, error = %e, "skipping redundant-calculation check");
                continue;
            }
        };

        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            match plan.kind(c)? {
                NodeKind::Calculation { expr, out_var: other } => {
                    if let Ok(s) = expr.stringify(max_len) {
                        if s == reference {
                            let mut target = *other;
                            while let Some(next) = replacements.get(&target) {
                                target = *next;
                            }
                            replacements.insert(out_var, target);
                            for v in replacements.values_mut() {
                                if *v == out_var {
                                    *v = target;
                                }
                            }
                        }
                    }
                }
                NodeKind::Collect(_) => break,
                _ => {}
            }
            cur = single_dependency(&plan, c)?;
        }
    }

    if replacements.is_empty() {
        return single(plan, false);
    }
    let mut modified = false;
    for id in plan.reachable_nodes() {
        modified |= plan.kind_mut(id)?.replace_variables(&replacements);
    }
    single(plan, modified)
}

/// Inline calculations whose only reader is a later calculation in the same
/// loop. Both sides must be deterministic, must not throw and must agree on
/// where they can run.
pub fn fuse_calculations(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    plan.compute_usage()?;
    let mut fused: BTreeMap<NodeId, Expr> = BTreeMap::new();
    let mut to_unlink = BTreeSet::new();

    for id in plan.find_nodes_of_type(&[NodeType::Calculation], true) {
        if to_unlink.contains(&id) {
            continue;
        }
        let NodeKind::Calculation { expr, .. } = plan.kind(id)? else {
            continue;
        };
        let mut expr = fused.get(&id).unwrap_or(expr).clone();
        if expr.can_throw() || !expr.is_deterministic() {
            continue;
        }
        let db_server = expr.can_run_on_db_server();

        let mut pending = BTreeSet::new();
        for v in expr.variables() {
            if !plan.is_used_later(id, v)? {
                pending.insert(v);
            }
        }
        let mut changed = false;

        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            if pending.is_empty() {
                break;
            }
            let t = plan.node_type(c)?;
            if is_barrier(t) || t.is_enumeration() {
                break;
            }
            let inlined = match plan.kind(c)? {
                NodeKind::Calculation { expr: inner, out_var }
                    if pending.contains(out_var) && !to_unlink.contains(&c) =>
                {
                    let inner = fused.get(&c).unwrap_or(inner);
                    let fits = !inner.can_throw()
                        && inner.is_deterministic()
                        && inner.can_run_on_db_server() == db_server;
                    fits.then(|| (*out_var, inner.clone()))
                }
                _ => None,
            };

            match inlined {
                Some((var, inner)) => {
                    pending.remove(&var);
                    expr.substitute(var, &inner);
                    for v in inner.variables() {
                        if !plan.is_used_later(id, v)? {
                            pending.insert(v);
                        }
                    }
                    to_unlink.insert(c);
                    changed = true;
                }
                None => {
                    for v in plan.variables_used_here(c)? {
                        pending.remove(&v);
                    }
                }
            }
            cur = single_dependency(&plan, c)?;
        }

        if changed {
            tracing::trace!(node = %id, "fused calculations");
            fused.insert(id, expr);
        }
    }

    let modified = !to_unlink.is_empty();
    if modified {
        for (id, expr) in fused {
            if to_unlink.contains(&id) {
                continue;
            }
            if let NodeKind::Calculation { expr: target, .. } = plan.kind_mut(id)? {
                *target = expr;
            }
        }
        plan.unlink_nodes(to_unlink)?;
        plan.compute_usage()?;
    }
    single(plan, modified)
}

/// Unlink calculations and subqueries whose result is never read, unless
/// they may throw or write data.
pub fn remove_unnecessary_calculations(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    plan.compute_usage()?;
    let mut to_unlink = BTreeSet::new();

    for id in plan.find_nodes_of_type(&[NodeType::Calculation, NodeType::Subquery], true) {
        if plan.can_throw(id)? || plan.is_modifying(id)? {
            continue;
        }
        let later = plan.vars_used_later(id)?;
        let dead = plan
            .kind(id)?
            .variables_set_here()
            .iter()
            .all(|v| !later.contains(v));
        if dead {
            to_unlink.insert(id);
        }
    }

    let modified = !to_unlink.is_empty();
    if modified {
        plan.unlink_nodes(to_unlink)?;
        plan.compute_usage()?;
    }
    single(plan, modified)
}
