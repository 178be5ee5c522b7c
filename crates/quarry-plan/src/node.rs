//! The closed catalog of plan node kinds.
//!
//! Every per-kind behavior (variables used/set, determinism, variable
//! rewriting) is an exhaustive match here, so a new kind cannot be added
//! without deciding each of them.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::expr::{AttributeComparison, Expr};
use quarry_core::id::{NodeId, VariableId};
use serde::{Deserialize, Serialize};

use crate::catalog::IndexDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Singleton,
    EnumerateCollection,
    IndexScan,
    EnumerateList,
    Filter,
    Limit,
    Calculation,
    Subquery,
    SubqueryStart,
    SubqueryEnd,
    Sort,
    Collect,
    Scatter,
    Gather,
    Remote,
    Distribute,
    Insert,
    Remove,
    Update,
    Replace,
    Return,
    NoResults,
}

impl NodeType {
    pub const MODIFICATIONS: [NodeType; 4] = [
        NodeType::Insert,
        NodeType::Remove,
        NodeType::Update,
        NodeType::Replace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NodeType::Singleton => "SingletonNode",
            NodeType::EnumerateCollection => "EnumerateCollectionNode",
            NodeType::IndexScan => "IndexNode",
            NodeType::EnumerateList => "EnumerateListNode",
            NodeType::Filter => "FilterNode",
            NodeType::Limit => "LimitNode",
            NodeType::Calculation => "CalculationNode",
            NodeType::Subquery => "SubqueryNode",
            NodeType::SubqueryStart => "SubqueryStartNode",
            NodeType::SubqueryEnd => "SubqueryEndNode",
            NodeType::Sort => "SortNode",
            NodeType::Collect => "CollectNode",
            NodeType::Scatter => "ScatterNode",
            NodeType::Gather => "GatherNode",
            NodeType::Remote => "RemoteNode",
            NodeType::Distribute => "DistributeNode",
            NodeType::Insert => "InsertNode",
            NodeType::Remove => "RemoveNode",
            NodeType::Update => "UpdateNode",
            NodeType::Replace => "ReplaceNode",
            NodeType::Return => "ReturnNode",
            NodeType::NoResults => "NoResultsNode",
        }
    }

    pub fn is_modification(self) -> bool {
        Self::MODIFICATIONS.contains(&self)
    }

    /// Kinds that open a loop over their input rows.
    pub fn is_enumeration(self) -> bool {
        matches!(
            self,
            NodeType::EnumerateCollection | NodeType::IndexScan | NodeType::EnumerateList
        )
    }

    pub fn is_cluster(self) -> bool {
        matches!(
            self,
            NodeType::Scatter | NodeType::Gather | NodeType::Remote | NodeType::Distribute
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortElement {
    pub var: VariableId,
    pub ascending: bool,
    /// Attribute below `var` (gather merge elements only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attribute_path: Vec<String>,
}

impl SortElement {
    pub fn new(var: VariableId, ascending: bool) -> Self {
        Self {
            var,
            ascending,
            attribute_path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHint {
    pub index: String,
    #[serde(default)]
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionScan {
    pub collection: String,
    pub out_var: VariableId,
    pub document_count: u64,
    #[serde(default)]
    pub random: bool,
    #[serde(default)]
    pub hint: Option<IndexHint>,
    #[serde(default)]
    pub restricted_shard: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexScan {
    pub collection: String,
    pub out_var: VariableId,
    pub index: IndexDescriptor,
    /// Conjunction of comparisons on `out_var` served by the index. Empty for
    /// a full (ordered) index scan.
    pub condition: Vec<AttributeComparison>,
    pub reverse: bool,
    pub estimated_items: f64,
    pub estimated_cost: f64,
    /// The index order was used to drop a sort; a gather above must merge.
    #[serde(default)]
    pub needs_gather_sort: bool,
    #[serde(default)]
    pub restricted_shard: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVar {
    pub out_var: VariableId,
    pub in_var: VariableId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVar {
    pub out_var: VariableId,
    pub in_var: Option<VariableId>,
    pub function: AggregateFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collect {
    pub groups: Vec<GroupVar>,
    pub aggregates: Vec<AggregateVar>,
    /// `INTO var`: captures every row of the enclosing scope per group.
    pub into: Option<VariableId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherSortMode {
    Default,
    MinElement,
    Heap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherParallelism {
    Serial,
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gather {
    pub shards: usize,
    pub elements: Vec<SortElement>,
    pub sort_mode: GatherSortMode,
    pub parallelism: GatherParallelism,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModificationOptions {
    pub ignore_errors: bool,
    pub ignore_document_not_found: bool,
    pub wait_for_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub collection: String,
    /// Document (insert/update/replace) or key/document (remove).
    pub in_var: VariableId,
    #[serde(default)]
    pub key_var: Option<VariableId>,
    #[serde(default)]
    pub out_old: Option<VariableId>,
    #[serde(default)]
    pub out_new: Option<VariableId>,
    #[serde(default)]
    pub options: ModificationOptions,
}

impl Modification {
    /// The variable that determines the target shard of each row.
    pub fn routing_var(&self) -> VariableId {
        self.key_var.unwrap_or(self.in_var)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeKind {
    Singleton,
    EnumerateCollection(CollectionScan),
    IndexScan(IndexScan),
    EnumerateList {
        in_var: VariableId,
        out_var: VariableId,
    },
    Filter {
        in_var: VariableId,
    },
    Limit {
        offset: u64,
        limit: u64,
    },
    Calculation {
        out_var: VariableId,
        expr: Expr,
    },
    /// `body` is the root (a Return) of the nested plan.
    Subquery {
        body: NodeId,
        out_var: VariableId,
    },
    SubqueryStart {
        subquery_out: VariableId,
    },
    SubqueryEnd {
        in_var: VariableId,
        out_var: VariableId,
    },
    Sort {
        elements: Vec<SortElement>,
        /// Stable sorts feed order-sensitive consumers and are never dropped
        /// in favor of a preceding sort.
        stable: bool,
        /// Heap-sort bound (offset + limit) chosen by the sort-limit rule.
        limit: Option<u64>,
    },
    Collect(Collect),
    Scatter {
        collection: String,
        shards: usize,
    },
    Gather(Gather),
    Remote,
    Distribute {
        collection: String,
        shards: usize,
        in_var: VariableId,
        create_keys: bool,
    },
    Insert(Modification),
    Remove(Modification),
    Update(Modification),
    Replace(Modification),
    Return {
        in_var: VariableId,
    },
    NoResults,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Singleton => NodeType::Singleton,
            NodeKind::EnumerateCollection(_) => NodeType::EnumerateCollection,
            NodeKind::IndexScan(_) => NodeType::IndexScan,
            NodeKind::EnumerateList { .. } => NodeType::EnumerateList,
            NodeKind::Filter { .. } => NodeType::Filter,
            NodeKind::Limit { .. } => NodeType::Limit,
            NodeKind::Calculation { .. } => NodeType::Calculation,
            NodeKind::Subquery { .. } => NodeType::Subquery,
            NodeKind::SubqueryStart { .. } => NodeType::SubqueryStart,
            NodeKind::SubqueryEnd { .. } => NodeType::SubqueryEnd,
            NodeKind::Sort { .. } => NodeType::Sort,
            NodeKind::Collect(_) => NodeType::Collect,
            NodeKind::Scatter { .. } => NodeType::Scatter,
            NodeKind::Gather(_) => NodeType::Gather,
            NodeKind::Remote => NodeType::Remote,
            NodeKind::Distribute { .. } => NodeType::Distribute,
            NodeKind::Insert(_) => NodeType::Insert,
            NodeKind::Remove(_) => NodeType::Remove,
            NodeKind::Update(_) => NodeType::Update,
            NodeKind::Replace(_) => NodeType::Replace,
            NodeKind::Return { .. } => NodeType::Return,
            NodeKind::NoResults => NodeType::NoResults,
        }
    }

    pub fn modification(&self) -> Option<&Modification> {
        match self {
            NodeKind::Insert(m)
            | NodeKind::Remove(m)
            | NodeKind::Update(m)
            | NodeKind::Replace(m) => {
                Some(m)
            }
            _ => None,
        }
    }

    pub fn modification_mut(&mut self) -> Option<&mut Modification> {
        match self {
            NodeKind::Insert(m)
            | NodeKind::Remove(m)
            | NodeKind::Update(m)
            | NodeKind::Replace(m) => {
                Some(m)
            }
            _ => None,
        }
    }

    pub fn expression(&self) -> Option<&Expr> {
        match self {
            NodeKind::Calculation { expr, .. } => Some(expr),
            _ => None,
        }
    }

    /// Collection read or written by this node, if any.
    pub fn collection(&self) -> Option<&str> {
        match self {
            NodeKind::EnumerateCollection(s) => Some(&s.collection),
            NodeKind::IndexScan(s) => Some(&s.collection),
            NodeKind::Scatter { collection, .. } | NodeKind::Distribute { collection, .. } => {
                Some(collection)
            }
            other => other.modification().map(|m| m.collection.as_str()),
        }
    }

    /// Variables introduced by this node.
    pub fn variables_set_here(&self) -> Vec<VariableId> {
        match self {
            NodeKind::EnumerateCollection(s) => vec![s.out_var],
            NodeKind::IndexScan(s) => vec![s.out_var],
            NodeKind::EnumerateList { out_var, .. }
            | NodeKind::Calculation { out_var, .. }
            | NodeKind::Subquery { out_var, .. }
            | NodeKind::SubqueryEnd { out_var, .. } => vec![*out_var],
            NodeKind::Collect(c) => {
                let mut out: Vec<VariableId> = c.groups.iter().map(|g| g.out_var).collect();
                out.extend(c.aggregates.iter().map(|a| a.out_var));
                out.extend(c.into);
                out
            }
            NodeKind::Insert(m)
            | NodeKind::Remove(m)
            | NodeKind::Update(m)
            | NodeKind::Replace(m) => {
                m.out_old.into_iter().chain(m.out_new).collect()
            }
            NodeKind::Singleton
            | NodeKind::Filter { .. }
            | NodeKind::Limit { .. }
            | NodeKind::SubqueryStart { .. }
            | NodeKind::Sort { .. }
            | NodeKind::Scatter { .. }
            | NodeKind::Gather(_)
            | NodeKind::Remote
            | NodeKind::Distribute { .. }
            | NodeKind::Return { .. }
            | NodeKind::NoResults => Vec::new(),
        }
    }

    /// Variables this node reads itself. Subquery bodies and the implicit
    /// inputs of `COLLECT ... INTO` are resolved by the plan.
    pub fn collect_variables_used(&self, out: &mut BTreeSet<VariableId>) {
        match self {
            NodeKind::EnumerateList { in_var, .. }
            | NodeKind::Filter { in_var }
            | NodeKind::SubqueryEnd { in_var, .. }
            | NodeKind::Return { in_var }
            | NodeKind::Distribute { in_var, .. } => {
                out.insert(*in_var);
            }
            NodeKind::Calculation { expr, .. } => expr.collect_variables(out),
            NodeKind::Sort { elements, .. } => out.extend(elements.iter().map(|e| e.var)),
            NodeKind::Gather(g) => out.extend(g.elements.iter().map(|e| e.var)),
            NodeKind::Collect(c) => {
                out.extend(c.groups.iter().map(|g| g.in_var));
                out.extend(c.aggregates.iter().filter_map(|a| a.in_var));
            }
            NodeKind::Insert(m)
            | NodeKind::Remove(m)
            | NodeKind::Update(m)
            | NodeKind::Replace(m) => {
                out.insert(m.in_var);
                out.extend(m.key_var);
            }
            NodeKind::Singleton
            | NodeKind::EnumerateCollection(_)
            | NodeKind::IndexScan(_)
            | NodeKind::Limit { .. }
            | NodeKind::Subquery { .. }
            | NodeKind::SubqueryStart { .. }
            | NodeKind::Scatter { .. }
            | NodeKind::Remote
            | NodeKind::NoResults => {}
        }
    }

    /// Rewrite variable reads according to `map`. Variables set here are
    /// left alone.
    pub fn replace_variables(&mut self, map: &BTreeMap<VariableId, VariableId>) -> bool {
        fn swap(v: &mut VariableId, map: &BTreeMap<VariableId, VariableId>) -> bool {
            match map.get(v) {
                Some(r) if r != v => {
                    *v = *r;
                    true
                }
                _ => false,
            }
        }
        match self {
            NodeKind::EnumerateList { in_var, .. }
            | NodeKind::Filter { in_var }
            | NodeKind::SubqueryEnd { in_var, .. }
            | NodeKind::Return { in_var }
            | NodeKind::Distribute { in_var, .. } => swap(in_var, map),
            NodeKind::Calculation { expr, .. } => expr.replace_variables(map),
            NodeKind::Sort { elements, .. } => elements
                .iter_mut()
                .fold(false, |acc, e| swap(&mut e.var, map) || acc),
            NodeKind::Gather(g) => g
                .elements
                .iter_mut()
                .fold(false, |acc, e| swap(&mut e.var, map) || acc),
            NodeKind::Collect(c) => {
                let mut changed = false;
                for g in &mut c.groups {
                    changed |= swap(&mut g.in_var, map);
                }
                for a in &mut c.aggregates {
                    if let Some(v) = a.in_var.as_mut() {
                        changed |= swap(v, map);
                    }
                }
                changed
            }
            NodeKind::Insert(m)
            | NodeKind::Remove(m)
            | NodeKind::Update(m)
            | NodeKind::Replace(m) => {
                let mut changed = swap(&mut m.in_var, map);
                if let Some(k) = m.key_var.as_mut() {
                    changed |= swap(k, map);
                }
                changed
            }
            NodeKind::Singleton
            | NodeKind::EnumerateCollection(_)
            | NodeKind::IndexScan(_)
            | NodeKind::Limit { .. }
            | NodeKind::Subquery { .. }
            | NodeKind::SubqueryStart { .. }
            | NodeKind::Scatter { .. }
            | NodeKind::Remote
            | NodeKind::NoResults => false,
        }
    }

    /// Point node references at their counterparts in a cloned plan.
    pub(crate) fn remap_nodes(&mut self, map: &BTreeMap<NodeId, NodeId>) {
        if let NodeKind::Subquery { body, .. } = self {
            if let Some(new) = map.get(body) {
                *body = *new;
            }
        }
    }

    /// Local throw behavior; subqueries are answered by the plan.
    pub(crate) fn can_throw_here(&self) -> bool {
        match self {
            NodeKind::Calculation { expr, .. } => expr.can_throw(),
            other => other
                .modification()
                .map(|m| !m.options.ignore_errors)
                .unwrap_or(false),
        }
    }

    /// Local determinism; subqueries are answered by the plan.
    pub(crate) fn is_deterministic_here(&self) -> bool {
        match self {
            NodeKind::Calculation { expr, .. } => expr.is_deterministic(),
            NodeKind::EnumerateCollection(s) => !s.random,
            _ => true,
        }
    }
}

/// One node in the plan arena. Edges are only edited through `Plan`, which
/// keeps both directions in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) deps: Vec<NodeId>,
    pub(crate) parents: Vec<NodeId>,
}

impl PlanNode {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            deps: Vec::new(),
            parents: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.deps
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn first_dependency(&self) -> Option<NodeId> {
        self.deps.first().copied()
    }

    pub fn first_parent(&self) -> Option<NodeId> {
        self.parents.first().copied()
    }

    pub fn is_unlinked(&self) -> bool {
        self.deps.is_empty() && self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::expr::Expr;

    fn v(n: u64) -> VariableId {
        VariableId::new(n)
    }

    #[test]
    fn calculation_contract() {
        let kind = NodeKind::Calculation {
            out_var: v(2),
            expr: Expr::attribute_path_of(v(1), &["a"]),
        };
        assert_eq!(kind.node_type(), NodeType::Calculation);
        assert_eq!(kind.variables_set_here(), vec![v(2)]);
        let mut used = BTreeSet::new();
        kind.collect_variables_used(&mut used);
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![v(1)]);
    }

    #[test]
    fn collect_sets_groups_aggregates_and_into() {
        let kind = NodeKind::Collect(Collect {
            groups: vec![GroupVar {
                out_var: v(10),
                in_var: v(1),
            }],
            aggregates: vec![AggregateVar {
                out_var: v(11),
                in_var: Some(v(2)),
                function: AggregateFunction::Sum,
            }],
            into: Some(v(12)),
        });
        assert_eq!(kind.variables_set_here(), vec![v(10), v(11), v(12)]);
        let mut used = BTreeSet::new();
        kind.collect_variables_used(&mut used);
        assert!(used.contains(&v(1)) && used.contains(&v(2)));
    }

    #[test]
    fn replace_variables_leaves_outputs() {
        let mut kind = NodeKind::EnumerateList {
            in_var: v(1),
            out_var: v(2),
        };
        let map: BTreeMap<_, _> = [(v(1), v(5)), (v(2), v(6))].into_iter().collect();
        assert!(kind.replace_variables(&map));
        assert_eq!(
            kind,
            NodeKind::EnumerateList {
                in_var: v(5),
                out_var: v(2)
            }
        );
    }

    #[test]
    fn modification_outputs() {
        let kind = NodeKind::Update(Modification {
            collection: "users".into(),
            in_var: v(1),
            key_var: Some(v(2)),
            out_old: Some(v(3)),
            out_new: None,
            options: ModificationOptions::default(),
        });
        assert!(kind.node_type().is_modification());
        assert_eq!(kind.variables_set_here(), vec![v(3)]);
        assert!(kind.can_throw_here());
        assert_eq!(kind.collection(), Some("users"));
    }

    #[test]
    fn kinds_serialize_with_type_tag() {
        let json = serde_json::to_value(NodeKind::Limit { offset: 0, limit: 10 }).unwrap();
        assert_eq!(json["type"], "limit");
        assert_eq!(json["limit"], 10);
    }
}
