//! Index substitution for filters and sorts.

use std::collections::BTreeSet;

use quarry_core::expr::{AttributeComparison, ComparisonOp, Expr};
use quarry_core::id::{NodeId, VariableId};
use quarry_core::{Error, Result};
use quarry_plan::catalog::{FilterSupport, IndexCatalog};
use quarry_plan::{CollectionScan, IndexDescriptor, IndexScan, NodeKind, NodeType, Plan};

use super::{calculation_of, conditions_above, is_barrier, single_dependency};
use crate::rule::{RuleContext, RuleOutput};

fn index_scan(
    scan: &CollectionScan,
    index: IndexDescriptor,
    conditions: &[AttributeComparison],
    support: &FilterSupport,
) -> IndexScan {
    IndexScan {
        collection: scan.collection.clone(),
        out_var: scan.out_var,
        index,
        condition: support
            .covered
            .iter()
            .filter_map(|i| conditions.get(*i).cloned())
            .collect(),
        reverse: false,
        estimated_items: support.estimated_items,
        estimated_cost: support.estimated_cost,
        needs_gather_sort: false,
        restricted_shard: scan.restricted_shard.clone(),
    }
}

/// Usable indexes for `conditions`, cheapest first. A forced hint narrows
/// the choice to the hinted index and fails if that cannot be used.
fn usable_indexes(
    catalog: &dyn IndexCatalog,
    scan: &CollectionScan,
    conditions: &[AttributeComparison],
) -> Result<Vec<(IndexDescriptor, FilterSupport)>> {
    let mut usable: Vec<(IndexDescriptor, FilterSupport)> = catalog
        .indexes(&scan.collection)
        .into_iter()
        .filter_map(|idx| {
            catalog
                .supports_filter_condition(&scan.collection, &idx, conditions)
                .map(|s| (idx, s))
        })
        .collect();
    usable.sort_by(|a, b| {
        a.1.estimated_cost
            .total_cmp(&b.1.estimated_cost)
            .then_with(|| a.0.name.cmp(&b.0.name))
    });

    let Some(hint) = &scan.hint else {
        return Ok(usable);
    };
    match usable.iter().position(|(idx, _)| idx.name == hint.index) {
        Some(pos) if hint.forced => Ok(vec![usable.swap_remove(pos)]),
        Some(pos) => {
            let hinted = usable.remove(pos);
            usable.insert(0, hinted);
            Ok(usable)
        }
        None if hint.forced => Err(Error::ForcedIndexUnusable {
            collection: scan.collection.clone(),
            index: hint.index.clone(),
        }),
        None => Ok(usable),
    }
}

/// Replace collection scans feeding filters by index scans. Every other
/// usable index becomes an alternative plan while the branch budget lasts;
/// alternatives differ from the main plan in that one scan only.
pub fn use_indexes(ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut modified = false;
    let mut others = Vec::new();

    for id in plan.find_nodes_of_type(&[NodeType::EnumerateCollection], true) {
        let NodeKind::EnumerateCollection(scan) = plan.kind(id)? else {
            continue;
        };
        if scan.random {
            continue;
        }
        let scan = scan.clone();
        let conditions = conditions_above(&plan, id, scan.out_var)?;
        if conditions.is_empty() {
            continue;
        }
        let mut usable = usable_indexes(ctx.indexes, &scan, &conditions)?.into_iter();
        let Some((best, support)) = usable.next() else {
            continue;
        };

        tracing::trace!(
            collection = %scan.collection,
            index = %best.name,
            cost = support.estimated_cost,
            "using index"
        );
        let node = plan.create_node(NodeKind::IndexScan(index_scan(
            &scan,
            best,
            &conditions,
            &support,
        )));
        plan.replace_node(id, node)?;
        modified = true;
        others.push((node, scan, conditions, usable));
    }

    let mut out = Vec::new();
    'scans: for (node, scan, conditions, usable) in others {
        for (idx, support) in usable {
            if !ctx.take_branch() {
                break 'scans;
            }
            let cloned = plan.clone_plan()?;
            let mut alt = cloned.plan;
            let replacement = alt.create_node(NodeKind::IndexScan(index_scan(
                &scan,
                idx,
                &conditions,
                &support,
            )));
            alt.replace_node(cloned.id_map[&node], replacement)?;
            out.push(RuleOutput::new(alt, true));
        }
    }

    out.insert(0, RuleOutput::new(plan, modified));
    Ok(out)
}

/// Drop filter conditions an index scan below already guarantees. A fully
/// covered filter is unlinked; a partially covered one keeps only the
/// remaining conditions when its calculation has no other reader.
pub fn remove_filters_covered_by_index(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;
    let mut to_unlink = BTreeSet::new();

    for id in plan.find_nodes_of_type(&[NodeType::Filter], true) {
        let NodeKind::Filter { in_var } = *plan.kind(id)? else {
            continue;
        };
        let Some((calc, expr)) = calculation_of(&plan, in_var)? else {
            continue;
        };

        let mut guaranteed: Vec<AttributeComparison> = Vec::new();
        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            let t = plan.node_type(c)?;
            if is_barrier(t) {
                break;
            }
            if let NodeKind::IndexScan(s) = plan.kind(c)? {
                guaranteed.extend(s.condition.iter().cloned());
            }
            cur = single_dependency(&plan, c)?;
        }
        if guaranteed.is_empty() {
            continue;
        }

        let parts = expr.conjuncts();
        let remaining: Vec<Expr> = parts
            .iter()
            .filter(|p| {
                p.as_attribute_comparison()
                    .map(|cmp| !guaranteed.contains(&cmp))
                    .unwrap_or(true)
            })
            .map(|p| (*p).clone())
            .collect();

        if remaining.is_empty() {
            to_unlink.insert(id);
        } else if remaining.len() < parts.len() && plan.users_of(in_var)? == [id] {
            if let NodeKind::Calculation { expr, .. } = plan.kind_mut(calc)? {
                *expr = Expr::conjunction(remaining);
            }
            modified = true;
        }
    }

    if !to_unlink.is_empty() {
        plan.unlink_nodes(to_unlink)?;
        modified = true;
    }
    Ok(vec![RuleOutput::new(plan, modified)])
}

/// The sort keys as `(dotted path, ascending)` if every key reads an
/// attribute of the same variable.
fn attribute_sort(plan: &Plan, sort: NodeId) -> Result<Option<(VariableId, Vec<(String, bool)>)>> {
    let NodeKind::Sort { elements, .. } = plan.kind(sort)? else {
        return Ok(None);
    };
    let mut var = None;
    let mut keys = Vec::with_capacity(elements.len());
    for e in elements {
        let Some((_, expr)) = calculation_of(plan, e.var)? else {
            return Ok(None);
        };
        let Some((v, path)) = expr.attribute_path() else {
            return Ok(None);
        };
        if var.is_some_and(|prev| prev != v) {
            return Ok(None);
        }
        var = Some(v);
        keys.push((path.join("."), e.ascending));
    }
    Ok(var.map(|v| (v, keys)))
}

/// Walk from the sort towards the leaves to the scan producing `var`. Only
/// row-preserving nodes may sit in between, and the scan must be the
/// outermost loop.
fn sorted_source(plan: &Plan, sort: NodeId, var: VariableId) -> Result<Option<NodeId>> {
    let mut cur = single_dependency(plan, sort)?;
    let mut source = None;
    while let Some(c) = cur {
        let kind = plan.kind(c)?;
        match kind.node_type() {
            NodeType::Calculation
            | NodeType::Filter
            | NodeType::EnumerateList
            | NodeType::Subquery => {
                if kind.variables_set_here().contains(&var) {
                    return Ok(None);
                }
            }
            NodeType::EnumerateCollection | NodeType::IndexScan
                if kind.variables_set_here().contains(&var) =>
            {
                source = Some(c);
                break;
            }
            NodeType::EnumerateCollection | NodeType::IndexScan => {}
            _ => return Ok(None),
        }
        cur = single_dependency(plan, c)?;
    }
    let Some(source) = source else {
        return Ok(None);
    };

    let mut below = single_dependency(plan, source)?;
    while let Some(b) = below {
        let t = plan.node_type(b)?;
        if t.is_enumeration() || t == NodeType::Subquery || t == NodeType::SubqueryStart {
            return Ok(None);
        }
        below = single_dependency(plan, b)?;
    }
    Ok(Some(source))
}

/// Let a sorted index deliver the order a sort asks for, and drop the sort.
pub fn use_index_for_sort(ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for sort in plan.find_nodes_of_type(&[NodeType::Sort], true) {
        let Some((var, keys)) = attribute_sort(&plan, sort)? else {
            continue;
        };
        let Some(source) = sorted_source(&plan, sort, var)? else {
            continue;
        };

        match plan.kind(source)?.clone() {
            NodeKind::EnumerateCollection(scan) => {
                if scan.random {
                    continue;
                }
                let mut best: Option<(IndexDescriptor, f64, bool)> = None;
                for idx in ctx.indexes.indexes(&scan.collection) {
                    if let Some(h) = &scan.hint {
                        if h.forced && h.index != idx.name {
                            continue;
                        }
                    }
                    let Some(s) = ctx
                        .indexes
                        .supports_sort_condition(&scan.collection, &idx, &keys, 0)
                    else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |b| s.estimated_cost < b.1) {
                        best = Some((idx, s.estimated_cost, s.reverse));
                    }
                }
                let Some((index, cost, reverse)) = best else {
                    continue;
                };
                let items = ctx.indexes.document_count(&scan.collection) as f64;
                let node = plan.create_node(NodeKind::IndexScan(IndexScan {
                    collection: scan.collection,
                    out_var: scan.out_var,
                    index,
                    condition: Vec::new(),
                    reverse,
                    estimated_items: items,
                    estimated_cost: cost,
                    needs_gather_sort: true,
                    restricted_shard: scan.restricted_shard,
                }));
                plan.replace_node(source, node)?;
            }
            NodeKind::IndexScan(scan) => {
                let prefix = scan
                    .index
                    .fields
                    .iter()
                    .take_while(|f| {
                        scan.condition
                            .iter()
                            .any(|c| c.op == ComparisonOp::Eq && c.dotted_path() == **f)
                    })
                    .count();
                let Some(s) =
                    ctx.indexes
                        .supports_sort_condition(&scan.collection, &scan.index, &keys, prefix)
                else {
                    continue;
                };
                if let NodeKind::IndexScan(target) = plan.kind_mut(source)? {
                    target.reverse = s.reverse;
                    target.needs_gather_sort = true;
                }
            }
            _ => continue,
        }

        plan.unlink_node(sort, false)?;
        modified = true;
    }
    Ok(vec![RuleOutput::new(plan, modified)])
}
