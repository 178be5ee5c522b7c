//! Sort rewrites: redundant sorts, random order, bounded heap sorts.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::expr::Expr;
use quarry_core::id::NodeId;
use quarry_core::Result;
use quarry_plan::cost::{estimate_node, use_heap_sort};
use quarry_plan::sort_info::{SortInformation, SortMatch};
use quarry_plan::{NodeKind, NodeType, Plan};

use super::{calculation_of, single_dependency, single_parent};
use crate::rule::{single, RuleContext, RuleOutput};

/// Remove sorts whose order is overwritten or already established by
/// another sort, then drop constant sort keys.
pub fn remove_redundant_sorts(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let max_len = ctx.costs().max_stringify_len;
    let sorts = plan.find_nodes_of_type(&[NodeType::Sort], true);
    let mut to_unlink: BTreeSet<NodeId> = BTreeSet::new();

    for &id in &sorts {
        if to_unlink.contains(&id) {
            continue;
        }
        let ours = SortInformation::of(&plan, id, max_len)?;
        if !ours.is_valid || ours.is_complex || !ours.is_deterministic || ours.can_throw {
            continue;
        }
        let NodeKind::Sort { stable, .. } = *plan.kind(id)? else {
            continue;
        };

        let mut relying = 0usize;
        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            match plan.node_type(c)? {
                NodeType::Sort if to_unlink.contains(&c) => {}
                NodeType::Sort => {
                    let other = SortInformation::of(&plan, c, max_len)?;
                    match ours.is_covered_by(&other) {
                        SortMatch::Unequal => {
                            if relying == 0
                                && other.is_deterministic
                                && !other.can_throw
                                && !stable
                            {
                                to_unlink.insert(c);
                            }
                        }
                        SortMatch::OtherLessAccurate | SortMatch::AllEqual => {
                            to_unlink.insert(c);
                        }
                        SortMatch::OurselvesLessAccurate => {
                            to_unlink.insert(id);
                            break;
                        }
                    }
                }
                NodeType::Filter => {}
                NodeType::Calculation => {
                    if plan.can_throw(c)? {
                        relying += 1;
                    }
                }
                t if t.is_enumeration() => relying += 1,
                _ => break,
            }
            cur = single_dependency(&plan, c)?;
        }
    }

    let mut modified = !to_unlink.is_empty();

    for &id in &sorts {
        if to_unlink.contains(&id) {
            continue;
        }
        let NodeKind::Sort { elements, .. } = plan.kind(id)? else {
            continue;
        };
        let mut keep = Vec::with_capacity(elements.len());
        for e in elements {
            let constant = calculation_of(&plan, e.var)?
                .map(|(_, expr)| expr.is_constant())
                .unwrap_or(false);
            keep.push(!constant);
        }
        if keep.iter().all(|k| *k) {
            continue;
        }
        modified = true;
        if keep.iter().all(|k| !*k) {
            to_unlink.insert(id);
        } else if let NodeKind::Sort { elements, .. } = plan.kind_mut(id)? {
            let mut flags = keep.into_iter();
            elements.retain(|_| flags.next().unwrap_or(true));
        }
    }

    plan.unlink_nodes(to_unlink)?;
    single(plan, modified)
}

fn is_rand_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call { name, args } => args.is_empty() && name.eq_ignore_ascii_case("RAND"),
        _ => false,
    }
}

/// `FOR x IN c SORT RAND()` becomes a random-order scan of `c`, as long as
/// exactly one collection scan feeds the sort.
pub fn remove_sort_rand(_ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&[NodeType::Sort], true) {
        let NodeKind::Sort { elements, .. } = plan.kind(id)? else {
            continue;
        };
        let [element] = &elements[..] else {
            continue;
        };
        match calculation_of(&plan, element.var)? {
            Some((_, expr)) if is_rand_call(&expr) => {}
            _ => continue,
        }

        let mut scan = None;
        let mut usable = true;
        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            if plan.can_throw(c)? {
                usable = false;
                break;
            }
            match plan.node_type(c)? {
                NodeType::EnumerateCollection => {
                    if scan.is_some() {
                        usable = false;
                        break;
                    }
                    scan = Some(c);
                }
                NodeType::Sort
                | NodeType::Collect
                | NodeType::Filter
                | NodeType::Subquery
                | NodeType::EnumerateList
                | NodeType::IndexScan => {
                    usable = false;
                    break;
                }
                _ => {}
            }
            cur = single_dependency(&plan, c)?;
        }

        let (true, Some(scan)) = (usable, scan) else {
            continue;
        };
        if let NodeKind::EnumerateCollection(s) = plan.kind_mut(scan)? {
            s.random = true;
        }
        plan.unlink_node(id, false)?;
        modified = true;
    }
    single(plan, modified)
}

/// A sort feeding a limit only needs the first `offset + limit` rows; use a
/// bounded heap when that is estimated to be cheaper than a full sort.
pub fn sort_limit(ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let costs = ctx.costs().clone();
    let mut memo = BTreeMap::new();
    let mut bounds = Vec::new();

    for id in plan.find_nodes_of_type(&[NodeType::Sort], true) {
        let NodeKind::Sort { limit: None, .. } = plan.kind(id)? else {
            continue;
        };

        let mut bound = None;
        let mut cur = single_parent(&plan, id)?;
        while let Some(c) = cur {
            match plan.kind(c)? {
                NodeKind::Limit { offset, limit } => {
                    bound = Some(offset.saturating_add(*limit));
                    break;
                }
                NodeKind::Calculation { .. } => cur = single_parent(&plan, c)?,
                _ => break,
            }
        }
        let Some(m) = bound else {
            continue;
        };
        let Some(dep) = single_dependency(&plan, id)? else {
            continue;
        };
        let n = estimate_node(&plan, dep, &costs, &mut memo)?.rows;
        if use_heap_sort(n, m, &costs) {
            tracing::trace!(node = %id, rows = n, limit = m, "switching sort to heap");
            bounds.push((id, m));
        }
    }

    let modified = !bounds.is_empty();
    for (id, m) in bounds {
        if let NodeKind::Sort { limit, .. } = plan.kind_mut(id)? {
            *limit = Some(m);
        }
    }
    single(plan, modified)
}
