//! Cluster distribution: shard snippets around scans and modifications, and
//! the rewrites that push work into them.
//!
//! A snippet runs once per shard and looks like
//! `Scatter|Distribute -> Remote -> ... -> Remote -> Gather` from the leaves
//! towards the root. Everything between the two `Remote` nodes runs on the
//! database servers.

use std::collections::BTreeSet;

use quarry_core::expr::ComparisonOp;
use quarry_core::id::NodeId;
use quarry_core::Result;
use quarry_plan::cost::gather_sort_mode;
use quarry_plan::{Gather, GatherParallelism, NodeKind, NodeType, Plan, SortElement};
use serde_json::Value;

use super::{conditions_above, single_dependency, single_parent};
use crate::rule::{single, RuleContext, RuleOutput};

fn shard_count(ctx: &RuleContext<'_>, collection: &str) -> usize {
    ctx.topology.shard_count(collection).max(1)
}

fn gather(ctx: &RuleContext<'_>, shards: usize, elements: Vec<SortElement>) -> NodeKind {
    let sort_mode = gather_sort_mode(shards, !elements.is_empty(), ctx.costs());
    NodeKind::Gather(Gather {
        shards,
        elements,
        sort_mode,
        parallelism: GatherParallelism::Serial,
    })
}

/// `below` then `Remote` under `node`; `Remote` then `top` above it.
fn wrap(plan: &mut Plan, node: NodeId, below: NodeKind, top: NodeKind) -> Result<()> {
    let source = plan.create_node(below);
    plan.insert_dependency(node, source)?;
    let remote = plan.create_node(NodeKind::Remote);
    plan.insert_dependency(node, remote)?;

    let remote = plan.create_node(NodeKind::Remote);
    plan.insert_after(node, remote)?;
    let top = plan.create_node(top);
    plan.insert_after(remote, top)
}

/// Is `node` already the body of a snippet opened by a node of type `t`?
fn opened_by(plan: &Plan, node: NodeId, t: NodeType) -> Result<bool> {
    let Some(dep) = single_dependency(plan, node)? else {
        return Ok(false);
    };
    if plan.node_type(dep)? != NodeType::Remote {
        return Ok(false);
    }
    match single_dependency(plan, dep)? {
        Some(src) => Ok(plan.node_type(src)? == t),
        None => Ok(false),
    }
}

fn is_distributed(plan: &Plan, node: NodeId) -> Result<bool> {
    Ok(opened_by(plan, node, NodeType::Distribute)? || opened_by(plan, node, NodeType::Scatter)?)
}

/// Send each row of a modification to the shard that owns it. Removes and
/// updates on collections sharded by custom keys cannot be routed by key and
/// are left to `scatter_in_cluster`.
pub fn distribute_in_cluster(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&NodeType::MODIFICATIONS, true) {
        let kind = plan.kind(id)?;
        let Some(m) = kind.modification() else {
            continue;
        };
        let node_type = kind.node_type();
        let default_sharding = ctx.topology.uses_default_sharding(&m.collection);
        if matches!(node_type, NodeType::Remove | NodeType::Update) && !default_sharding {
            continue;
        }
        if is_distributed(&plan, id)? {
            continue;
        }
        let is_insert = node_type == NodeType::Insert;
        // a replace on custom shard keys is routed by the new document
        let routing = if node_type == NodeType::Replace && !default_sharding {
            m.in_var
        } else {
            m.routing_var()
        };

        let collection = m.collection.clone();
        let shards = shard_count(ctx, &collection);
        let distribute = NodeKind::Distribute {
            collection,
            shards,
            in_var: routing,
            create_keys: is_insert,
        };
        let top = gather(ctx, shards, Vec::new());
        wrap(&mut plan, id, distribute, top)?;
        modified = true;
    }
    single(plan, modified)
}

/// Run every collection access and every modification not yet distributed
/// once per shard. A gather above an index scan whose order replaced a sort
/// merges the shard streams by the index fields.
pub fn scatter_in_cluster(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut types = vec![NodeType::EnumerateCollection, NodeType::IndexScan];
    types.extend(NodeType::MODIFICATIONS);
    let mut modified = false;

    for id in plan.find_nodes_of_type(&types, true) {
        if is_distributed(&plan, id)? {
            continue;
        }
        let kind = plan.kind(id)?;
        let Some(collection) = kind.collection().map(str::to_string) else {
            continue;
        };
        let elements = match kind {
            NodeKind::IndexScan(s) if s.needs_gather_sort => s
                .index
                .fields
                .iter()
                .map(|f| SortElement {
                    var: s.out_var,
                    ascending: !s.reverse,
                    attribute_path: f.split('.').map(str::to_string).collect(),
                })
                .collect(),
            _ => Vec::new(),
        };

        if matches!(kind.node_type(), NodeType::Remove | NodeType::Update | NodeType::Replace) {
            if let Some(m) = plan.kind_mut(id)?.modification_mut() {
                m.options.ignore_document_not_found = true;
            }
        }

        let shards = shard_count(ctx, &collection);
        let top = gather(ctx, shards, elements);
        wrap(
            &mut plan,
            id,
            NodeKind::Scatter { collection, shards },
            top,
        )?;
        modified = true;
    }
    single(plan, modified)
}

/// The `Remote` directly below the gather `g`, if any.
fn remote_below(plan: &Plan, g: NodeId) -> Result<Option<NodeId>> {
    match single_dependency(plan, g)? {
        Some(r) if plan.node_type(r)? == NodeType::Remote => Ok(Some(r)),
        _ => Ok(None),
    }
}

/// Filters and calculations the database servers can evaluate move from
/// above a gather into the shard snippet below it.
pub fn distribute_filtercalc_to_cluster(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for g in plan.find_nodes_of_type(&[NodeType::Gather], true) {
        let Some(remote) = remote_below(&plan, g)? else {
            continue;
        };
        let mut cur = single_parent(&plan, g)?;
        while let Some(c) = cur {
            let movable = match plan.kind(c)? {
                NodeKind::Filter { .. } => true,
                NodeKind::Calculation { expr, .. } => {
                    expr.can_run_on_db_server() && expr.is_deterministic()
                }
                _ => false,
            };
            if !movable {
                break;
            }
            let next = single_parent(&plan, c)?;
            plan.unlink_node(c, false)?;
            plan.insert_dependency(remote, c)?;
            modified = true;
            cur = next;
        }
    }
    single(plan, modified)
}

/// A sort right above a plain gather runs on the shards instead; the gather
/// then merges the sorted shard streams.
pub fn distribute_sort_to_cluster(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for g in plan.find_nodes_of_type(&[NodeType::Gather], true) {
        let NodeKind::Gather(gather) = plan.kind(g)? else {
            continue;
        };
        if !gather.elements.is_empty() {
            continue;
        }
        let shards = gather.shards;
        let Some(remote) = remote_below(&plan, g)? else {
            continue;
        };

        let mut sort = None;
        let mut cur = single_parent(&plan, g)?;
        while let Some(c) = cur {
            match plan.node_type(c)? {
                NodeType::Calculation => cur = single_parent(&plan, c)?,
                NodeType::Sort => {
                    sort = Some(c);
                    break;
                }
                _ => break,
            }
        }
        let Some(sort) = sort else {
            continue;
        };
        let NodeKind::Sort { elements, .. } = plan.kind(sort)? else {
            continue;
        };
        let elements = elements.clone();
        let available = plan.variables_set_above(g)?;
        if !elements.iter().all(|e| available.contains(&e.var)) {
            continue;
        }

        plan.unlink_node(sort, false)?;
        plan.insert_dependency(remote, sort)?;
        let sort_mode = gather_sort_mode(shards, true, ctx.costs());
        if let NodeKind::Gather(gather) = plan.kind_mut(g)? {
            gather.elements = elements;
            gather.sort_mode = sort_mode;
        }
        modified = true;
    }
    single(plan, modified)
}

/// `Scatter -> Remote` pairs that only fan out constant input are dropped,
/// unless a calculation below them must stay on the coordinator.
pub fn remove_unnecessary_remote_scatter(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut pairs = Vec::new();

    for remote in plan.find_nodes_of_type(&[NodeType::Remote], true) {
        let Some(scatter) = single_dependency(&plan, remote)? else {
            continue;
        };
        if plan.node_type(scatter)? != NodeType::Scatter {
            continue;
        }
        let mut trivial = true;
        let mut cur = single_dependency(&plan, scatter)?;
        while let Some(c) = cur {
            let local = match plan.kind(c)? {
                NodeKind::Singleton => true,
                NodeKind::Calculation { expr, .. } => expr.can_run_on_db_server(),
                _ => false,
            };
            if !local {
                trivial = false;
                break;
            }
            cur = single_dependency(&plan, c)?;
        }
        if trivial {
            pairs.push((remote, scatter));
        }
    }

    let modified = !pairs.is_empty();
    for (remote, scatter) in pairs {
        plan.unlink_node(remote, false)?;
        plan.unlink_node(scatter, false)?;
    }
    single(plan, modified)
}

/// Cluster nodes between a remove and the scan of the same collection that
/// feeds it, or `None` when the remove has to stay distributed.
fn snippet_between_scan_and_remove(
    ctx: &RuleContext<'_>,
    plan: &Plan,
    remove: NodeId,
) -> Result<Option<Vec<NodeId>>> {
    let Some(m) = plan.kind(remove)?.modification() else {
        return Ok(None);
    };
    let Some(setter) = plan.get_var_set_by(m.routing_var()) else {
        return Ok(None);
    };

    // either `REMOVE d` or `REMOVE d._key` on a collection sharded by `_key`
    let (key_calc, scan_var, scan) = match plan.kind(setter)? {
        NodeKind::Calculation { expr, .. } => {
            let Some((var, path)) = expr.attribute_path() else {
                return Ok(None);
            };
            if path != ["_key"] || ctx.topology.shard_keys(&m.collection) != ["_key"] {
                return Ok(None);
            }
            match plan.get_var_set_by(var) {
                Some(scan) => (Some(setter), var, scan),
                None => return Ok(None),
            }
        }
        _ => (None, m.routing_var(), setter),
    };
    match plan.kind(scan)? {
        NodeKind::EnumerateCollection(s) if s.collection == m.collection => {}
        _ => return Ok(None),
    }

    let mut cluster_nodes = Vec::new();
    let (mut scatter, mut gather) = (false, false);
    let mut last = remove;
    let mut cur = single_dependency(plan, remove)?;
    while let Some(c) = cur {
        if c == scan {
            return Ok((scatter && gather).then_some(cluster_nodes));
        }
        match plan.kind(c)? {
            NodeKind::Remote => cluster_nodes.push(c),
            NodeKind::Scatter { .. } | NodeKind::Distribute { .. } => {
                if scatter {
                    return Ok(None);
                }
                scatter = true;
                cluster_nodes.push(c);
            }
            NodeKind::Gather(_) => {
                if gather {
                    return Ok(None);
                }
                gather = true;
                cluster_nodes.push(c);
            }
            NodeKind::Filter { .. } => {}
            NodeKind::Calculation { .. } if Some(c) == key_calc => {}
            NodeKind::Calculation { out_var, expr } => {
                // only the condition of the filter right above, on the scanned document
                let feeds_filter = matches!(
                    plan.kind(last)?,
                    NodeKind::Filter { in_var } if in_var == out_var
                );
                if !feeds_filter || expr.variables() != BTreeSet::from([scan_var]) {
                    return Ok(None);
                }
            }
            _ => return Ok(None),
        }
        last = c;
        cur = single_dependency(plan, c)?;
    }
    Ok(None)
}

/// A remove whose input comes straight from a scan of the collection it
/// removes from runs in the scan's shard snippet: every document is removed
/// on the shard it was read from.
pub fn undistribute_remove_after_enum_coll(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut to_unlink = BTreeSet::new();
    for id in plan.find_nodes_of_type(&[NodeType::Remove], true) {
        if let Some(nodes) = snippet_between_scan_and_remove(ctx, &plan, id)? {
            to_unlink.extend(nodes);
        }
    }

    let modified = !to_unlink.is_empty();
    plan.unlink_nodes(to_unlink)?;
    single(plan, modified)
}

/// Collection accesses with an equality condition on every shard key only
/// need the shard owning that key.
pub fn restrict_to_single_shard(
    ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut restrictions = Vec::new();

    for id in plan.find_nodes_of_type(&[NodeType::EnumerateCollection, NodeType::IndexScan], true) {
        let (collection, out_var, mut conditions) = match plan.kind(id)? {
            NodeKind::EnumerateCollection(s) if s.restricted_shard.is_none() => {
                (s.collection.clone(), s.out_var, Vec::new())
            }
            NodeKind::IndexScan(s) if s.restricted_shard.is_none() => {
                (s.collection.clone(), s.out_var, s.condition.clone())
            }
            _ => continue,
        };
        conditions.extend(conditions_above(&plan, id, out_var)?);

        let keys = ctx.topology.shard_keys(&collection);
        let mut values: Vec<Value> = Vec::with_capacity(keys.len());
        for key in &keys {
            let found = conditions.iter().find(|c| {
                c.op == ComparisonOp::Eq && c.dotted_path() == *key
            });
            match found {
                Some(c) => values.push(c.value.clone()),
                None => break,
            }
        }
        if keys.is_empty() || values.len() != keys.len() {
            continue;
        }
        let shard = ctx.topology.responsible_shard(&collection, &values)?;
        tracing::debug!(%collection, %shard, "restricting access to a single shard");
        restrictions.push((id, shard));
    }

    let modified = !restrictions.is_empty();
    for (id, shard) in restrictions {
        match plan.kind_mut(id)? {
            NodeKind::EnumerateCollection(s) => s.restricted_shard = Some(shard),
            NodeKind::IndexScan(s) => s.restricted_shard = Some(shard),
            _ => {}
        }
    }
    single(plan, modified)
}

/// Gathers over snippets that only read may query all shards at once.
pub fn parallelize_gather(_ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut targets = Vec::new();

    for g in plan.find_nodes_of_type(&[NodeType::Gather], true) {
        let NodeKind::Gather(gather) = plan.kind(g)? else {
            continue;
        };
        if gather.parallelism == GatherParallelism::Parallel {
            continue;
        }
        let Some(remote) = remote_below(&plan, g)? else {
            continue;
        };
        let mut read_only = true;
        let mut cur = single_dependency(&plan, remote)?;
        while let Some(c) = cur {
            let t = plan.node_type(c)?;
            if matches!(t, NodeType::Remote | NodeType::Scatter | NodeType::Distribute) {
                break;
            }
            if plan.is_modifying(c)? {
                read_only = false;
                break;
            }
            cur = single_dependency(&plan, c)?;
        }
        if read_only {
            targets.push(g);
        }
    }

    let modified = !targets.is_empty();
    for g in targets {
        if let NodeKind::Gather(gather) = plan.kind_mut(g)? {
            gather.parallelism = GatherParallelism::Parallel;
        }
    }
    single(plan, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{run, shape, Chain};
    use quarry_core::expr::Expr;
    use quarry_core::id::VariableId;
    use quarry_core::variable::VariableRegistry;
    use quarry_plan::catalog::{CollectionInfo, MemoryCatalog};
    use quarry_plan::{GatherSortMode, IndexDescriptor, IndexScan, Modification};

    fn cluster() -> MemoryCatalog {
        MemoryCatalog::new()
            .coordinator(true)
            .with_collection("c", CollectionInfo::new(1000).with_shards(4, &["_key"]))
            .with_collection("u", CollectionInfo::new(1000).with_shards(3, &["tenant"]))
    }

    fn modification(collection: &str, doc: VariableId, key: Option<VariableId>) -> Modification {
        Modification {
            collection: collection.into(),
            in_var: doc,
            key_var: key,
            out_old: None,
            out_new: None,
            options: Default::default(),
        }
    }

    fn insert(c: &mut Chain, collection: &str, doc: VariableId) -> NodeId {
        c.push(NodeKind::Insert(modification(collection, doc, None)))
    }

    fn count(plan: &Plan, t: NodeType) -> usize {
        plan.find_nodes_of_type(&[t], true).len()
    }

    /// Distribution and scattering, as the mandatory cluster rules leave it.
    fn distributed(plan: Plan, vars: &mut VariableRegistry, cat: &MemoryCatalog) -> Plan {
        let plan = run(distribute_in_cluster, plan, vars, cat).remove(0).plan;
        run(scatter_in_cluster, plan, vars, cat).remove(0).plan
    }

    #[test]
    fn insert_is_distributed() {
        let mut c = Chain::new();
        let (_, doc) = c.calc(Expr::value(serde_json::json!({"a": 1})));
        insert(&mut c, "c", doc);
        let (plan, mut vars) = c.ret(doc);
        let out = run(distribute_in_cluster, plan, &mut vars, &cluster());
        assert!(out[0].modified);
        assert_eq!(
            shape(&out[0].plan),
            vec![
                NodeType::Singleton,
                NodeType::Calculation,
                NodeType::Distribute,
                NodeType::Remote,
                NodeType::Insert,
                NodeType::Remote,
                NodeType::Gather,
                NodeType::Return,
            ]
        );
        quarry_plan::verify_plan(&out[0].plan).unwrap();
    }

    #[test]
    fn scan_is_scattered_once() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 1000);
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let once = run(scatter_in_cluster, plan, &mut vars, &cat).remove(0);
        assert!(once.modified);
        assert_eq!(
            shape(&once.plan),
            vec![
                NodeType::Singleton,
                NodeType::Scatter,
                NodeType::Remote,
                NodeType::EnumerateCollection,
                NodeType::Remote,
                NodeType::Gather,
                NodeType::Return,
            ]
        );
        let twice = run(scatter_in_cluster, once.plan, &mut vars, &cat);
        assert!(!twice[0].modified);
    }

    #[test]
    fn ordered_index_scan_gets_merging_gather() {
        let mut c = Chain::new();
        let out_var = c.var("x");
        c.push(NodeKind::IndexScan(IndexScan {
            collection: "c".into(),
            out_var,
            index: IndexDescriptor::sorted("idx_b", &["b"]),
            condition: Vec::new(),
            reverse: false,
            estimated_items: 1000.0,
            estimated_cost: 1000.0,
            needs_gather_sort: true,
            restricted_shard: None,
        }));
        let (plan, mut vars) = c.ret(out_var);
        let out = run(scatter_in_cluster, plan, &mut vars, &cluster());
        let plan = &out[0].plan;
        let g = plan.find_nodes_of_type(&[NodeType::Gather], true)[0];
        let NodeKind::Gather(gather) = plan.kind(g).unwrap() else {
            panic!("gather expected");
        };
        assert_eq!(gather.elements.len(), 1);
        assert_eq!(gather.elements[0].attribute_path, vec!["b".to_string()]);
        assert_eq!(gather.sort_mode, GatherSortMode::MinElement);
    }

    #[test]
    fn filter_moves_into_snippet_and_trivial_scatter_goes() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 1000);
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let scattered = run(scatter_in_cluster, plan, &mut vars, &cat).remove(0).plan;

        // put a filter above the gather, as a rule running before would
        let mut plan = scattered;
        let ret = plan.root().unwrap();
        let calc_var = vars.create_temporary().id;
        let calc = plan.create_node(NodeKind::Calculation {
            out_var: calc_var,
            expr: Expr::eq(Expr::attribute_path_of(x, &["a"]), Expr::value(1)),
        });
        plan.insert_dependency(ret, calc).unwrap();
        let filter = plan.create_node(NodeKind::Filter { in_var: calc_var });
        plan.insert_dependency(ret, filter).unwrap();

        let moved = run(distribute_filtercalc_to_cluster, plan, &mut vars, &cat).remove(0);
        assert!(moved.modified);
        let cleaned = run(remove_unnecessary_remote_scatter, moved.plan, &mut vars, &cat).remove(0);
        assert!(cleaned.modified);
        assert_eq!(
            shape(&cleaned.plan),
            vec![
                NodeType::Singleton,
                NodeType::EnumerateCollection,
                NodeType::Calculation,
                NodeType::Filter,
                NodeType::Remote,
                NodeType::Gather,
                NodeType::Return,
            ]
        );
        quarry_plan::verify_plan(&cleaned.plan).unwrap();
    }

    #[test]
    fn scatter_stays_below_coordinator_only_calculation() {
        let cat = cluster();
        for (function, removed) in [("DOCUMENT", false), ("MY::LOOKUP", false), ("LOWER", true)] {
            let mut c = Chain::new();
            let (_, d) = c.calc(Expr::call(function, vec![Expr::value("c/1")]));
            let (_, x) = c.scan("c", 1000);
            let (_, both) = c.calc(Expr::Array(vec![Expr::reference(x), Expr::reference(d)]));
            let (plan, mut vars) = c.ret(both);
            let plan = run(scatter_in_cluster, plan, &mut vars, &cat).remove(0).plan;

            let out = run(remove_unnecessary_remote_scatter, plan, &mut vars, &cat).remove(0);
            assert_eq!(out.modified, removed, "{function}");
            assert_eq!(count(&out.plan, NodeType::Scatter), usize::from(!removed));
        }
    }

    #[test]
    fn insert_reading_its_own_collection_is_distributed() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 1000);
        insert(&mut c, "c", x);
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let plan = distributed(plan, &mut vars, &cat);

        assert_eq!(count(&plan, NodeType::Distribute), 1);
        assert_eq!(count(&plan, NodeType::Scatter), 1);
        let d = plan.find_nodes_of_type(&[NodeType::Distribute], true)[0];
        let NodeKind::Distribute { create_keys, .. } = plan.kind(d).unwrap() else {
            panic!("distribute expected");
        };
        assert!(*create_keys);
        quarry_plan::verify_plan(&plan).unwrap();
    }

    #[test]
    fn replace_on_custom_shard_keys_routes_by_document() {
        let mut c = Chain::new();
        let (_, doc) = c.calc(Expr::value(serde_json::json!({"tenant": "acme"})));
        let (_, key) = c.calc(Expr::value("k1"));
        c.push(NodeKind::Replace(modification("u", doc, Some(key))));
        let (plan, mut vars) = c.ret(doc);
        let out = run(distribute_in_cluster, plan, &mut vars, &cluster());
        assert!(out[0].modified);
        let plan = &out[0].plan;
        let d = plan.find_nodes_of_type(&[NodeType::Distribute], true)[0];
        let NodeKind::Distribute { in_var, create_keys, .. } = plan.kind(d).unwrap() else {
            panic!("distribute expected");
        };
        assert_eq!(*in_var, doc);
        assert!(!*create_keys);
    }

    #[test]
    fn remove_after_scan_of_same_collection_joins_the_scan_snippet() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 1000);
        c.filter(Expr::eq(Expr::attribute_path_of(x, &["a"]), Expr::value(1)));
        c.push(NodeKind::Remove(modification("c", x, None)));
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let plan = distributed(plan, &mut vars, &cat);
        assert_eq!(count(&plan, NodeType::Distribute), 1);

        let out = run(undistribute_remove_after_enum_coll, plan, &mut vars, &cat).remove(0);
        assert!(out.modified);
        assert_eq!(
            shape(&out.plan),
            vec![
                NodeType::Singleton,
                NodeType::Scatter,
                NodeType::Remote,
                NodeType::EnumerateCollection,
                NodeType::Calculation,
                NodeType::Filter,
                NodeType::Remove,
                NodeType::Remote,
                NodeType::Gather,
                NodeType::Return,
            ]
        );
        quarry_plan::verify_plan(&out.plan).unwrap();

        let again = run(undistribute_remove_after_enum_coll, out.plan, &mut vars, &cat);
        assert!(!again[0].modified);
    }

    #[test]
    fn remove_by_key_on_custom_shard_keys_stays_distributed() {
        let mut c = Chain::new();
        let (_, x) = c.scan("u", 1000);
        let (_, key) = c.calc(Expr::attribute_path_of(x, &["_key"]));
        c.push(NodeKind::Remove(modification("u", key, None)));
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let plan = distributed(plan, &mut vars, &cat);
        assert_eq!(count(&plan, NodeType::Scatter), 2);

        let out = run(undistribute_remove_after_enum_coll, plan, &mut vars, &cat);
        assert!(!out[0].modified);
    }

    #[test]
    fn sort_moves_below_gather() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 1000);
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let mut plan = run(scatter_in_cluster, plan, &mut vars, &cat).remove(0).plan;

        let ret = plan.root().unwrap();
        let gather = plan.first_dependency(ret).unwrap().unwrap();
        let remote = plan.first_dependency(gather).unwrap().unwrap();
        let key = vars.create_temporary().id;
        let calc = plan.create_node(NodeKind::Calculation {
            out_var: key,
            expr: Expr::attribute_path_of(x, &["a"]),
        });
        plan.insert_dependency(remote, calc).unwrap();
        let sort = plan.create_node(NodeKind::Sort {
            elements: vec![SortElement::new(key, true)],
            stable: false,
            limit: None,
        });
        plan.insert_dependency(ret, sort).unwrap();

        let out = run(distribute_sort_to_cluster, plan, &mut vars, &cat).remove(0);
        assert!(out.modified);
        let NodeKind::Gather(g) = out.plan.kind(gather).unwrap() else {
            panic!("gather expected");
        };
        assert_eq!(g.elements.len(), 1);
        assert_ne!(g.sort_mode, GatherSortMode::Default);
        assert_eq!(out.plan.first_dependency(remote).unwrap(), Some(sort));
    }

    #[test]
    fn equality_on_shard_key_restricts_scan() {
        let mut c = Chain::new();
        let (scan, x) = c.scan("u", 1000);
        c.filter(Expr::eq(
            Expr::attribute_path_of(x, &["tenant"]),
            Expr::value("acme"),
        ));
        let (plan, mut vars) = c.ret(x);
        let out = run(restrict_to_single_shard, plan, &mut vars, &cluster());
        assert!(out[0].modified);
        let NodeKind::EnumerateCollection(s) = out[0].plan.kind(scan).unwrap() else {
            panic!("scan expected");
        };
        let shard = s.restricted_shard.as_deref().unwrap();
        assert!(shard.starts_with("u:s"));
    }

    #[test]
    fn read_only_gather_is_parallel_but_writing_one_is_not() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 1000);
        let (plan, mut vars) = c.ret(x);
        let cat = cluster();
        let plan = run(scatter_in_cluster, plan, &mut vars, &cat).remove(0).plan;
        let out = run(parallelize_gather, plan, &mut vars, &cat);
        assert!(out[0].modified);

        let mut c = Chain::new();
        let (_, doc) = c.calc(Expr::value(serde_json::json!({"a": 1})));
        insert(&mut c, "c", doc);
        let (plan, mut vars) = c.ret(doc);
        let plan = run(distribute_in_cluster, plan, &mut vars, &cat).remove(0).plan;
        let out = run(parallelize_gather, plan, &mut vars, &cat);
        assert!(!out[0].modified);
    }
}
