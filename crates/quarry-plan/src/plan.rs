//! The plan graph: an arena of nodes keyed by `NodeId`.
//!
//! Edges are stored in both directions (`deps` and `parents`) and are only
//! edited through the methods below, which keep the two sides in sync. Any
//! edit invalidates the cached variable usage; callers recompute it with
//! [`Plan::compute_usage`] before asking liveness questions.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::hash::{hash_serde, Hash256};
use quarry_core::id::{NodeId, NodeIdAllocator, VariableId};
use quarry_core::{CostConstants, Error, Result};
use serde::Serialize;

use crate::cost::{self, CostEstimate};
use crate::node::{NodeKind, NodeType, PlanNode};
use crate::usage::UsageIndex;

#[derive(Debug, Default)]
pub struct Plan {
    nodes: BTreeMap<NodeId, PlanNode>,
    root: Option<NodeId>,
    ids: NodeIdAllocator,
    usage: Option<UsageIndex>,
    applied_rules: Vec<String>,
}

/// Result of [`Plan::clone_plan`]: the copy plus old-id to new-id mapping.
#[derive(Debug)]
pub struct ClonedPlan {
    pub plan: Plan,
    pub id_map: BTreeMap<NodeId, NodeId>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unlinked node and return its id.
    pub fn create_node(&mut self, kind: NodeKind) -> NodeId {
        let id = self.ids.next();
        debug_assert!(!self.nodes.contains_key(&id));
        self.nodes.insert(id, PlanNode::new(id, kind));
        self.usage = None;
        id
    }

    /// Id the next `create_node` call will hand out.
    pub fn next_id(&self) -> NodeId {
        self.ids.peek()
    }

    pub fn root(&self) -> Result<NodeId> {
        self.root
            .ok_or_else(|| Error::invariant("plan has no root node"))
    }

    pub fn set_root(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?;
        self.root = Some(id);
        self.usage = None;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get_node_by_id(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&PlanNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::invariant(format!("unknown node {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut PlanNode> {
        self.usage = None;
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("unknown node {id}")))
    }

    pub fn kind(&self, id: NodeId) -> Result<&NodeKind> {
        Ok(&self.node(id)?.kind)
    }

    pub fn kind_mut(&mut self, id: NodeId) -> Result<&mut NodeKind> {
        Ok(&mut self.node_mut(id)?.kind)
    }

    pub fn node_type(&self, id: NodeId) -> Result<NodeType> {
        Ok(self.node(id)?.node_type())
    }

    pub fn dependencies(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.node(id)?.deps)
    }

    pub fn parents(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.node(id)?.parents)
    }

    pub fn first_dependency(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(id)?.first_dependency())
    }

    pub fn first_parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(id)?.first_parent())
    }

    /// Link `dep` as an additional dependency of `node`.
    pub fn add_dependency(&mut self, node: NodeId, dep: NodeId) -> Result<()> {
        self.node(dep)?;
        self.node_mut(node)?.deps.push(dep);
        self.node_mut(dep)?.parents.push(node);
        Ok(())
    }

    /// The `Subquery` node whose body is rooted at `id`, if any.
    pub fn body_owner(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.values().find_map(|n| match n.kind {
            NodeKind::Subquery { body, .. } if body == id => Some(n.id),
            _ => None,
        })
    }

    fn retarget_root(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        if self.root == Some(old) {
            self.root = Some(new);
        }
        if let Some(owner) = self.body_owner(old) {
            if let NodeKind::Subquery { body, .. } = &mut self.node_mut(owner)?.kind {
                *body = new;
            }
        }
        Ok(())
    }

    fn ensure_unlinked(&self, id: NodeId) -> Result<()> {
        if self.node(id)?.is_unlinked() {
            Ok(())
        } else {
            Err(Error::invariant(format!("{id} is still linked")))
        }
    }

    /// Insert the unlinked node `new` between `parent` and its single
    /// dependency.
    pub fn insert_dependency(&mut self, parent: NodeId, new: NodeId) -> Result<()> {
        self.ensure_unlinked(new)?;
        let deps = self.dependencies(parent)?.to_vec();
        let [old] = deps[..] else {
            return Err(Error::invariant(format!(
                "insert_dependency: {parent} has {} dependencies",
                deps.len()
            )));
        };
        self.node_mut(parent)?.deps[0] = new;
        {
            let n = self.node_mut(new)?;
            n.deps.push(old);
            n.parents.push(parent);
        }
        for p in self.node_mut(old)?.parents.iter_mut() {
            if *p == parent {
                *p = new;
            }
        }
        Ok(())
    }

    /// Same as [`Plan::insert_dependency`]: `new` ends up directly below
    /// `node`.
    pub fn insert_before(&mut self, node: NodeId, new: NodeId) -> Result<()> {
        self.insert_dependency(node, new)
    }

    /// Insert the unlinked node `new` directly above `node` (between `node`
    /// and its parent). A root or subquery body root is handed over to `new`.
    pub fn insert_after(&mut self, node: NodeId, new: NodeId) -> Result<()> {
        self.ensure_unlinked(new)?;
        let parents = self.parents(node)?.to_vec();
        if parents.len() > 1 {
            return Err(Error::invariant(format!(
                "insert_after: {node} has {} parents",
                parents.len()
            )));
        }
        if let Some(&p) = parents.first() {
            for d in self.node_mut(p)?.deps.iter_mut() {
                if *d == node {
                    *d = new;
                }
            }
            self.node_mut(new)?.parents.push(p);
        } else {
            self.retarget_root(node, new)?;
        }
        self.node_mut(new)?.deps.push(node);
        self.node_mut(node)?.parents = vec![new];
        Ok(())
    }

    /// Remove `id` from the graph, connecting its parents to its single
    /// dependency. The node stays in the arena, unlinked, and may be
    /// re-inserted elsewhere.
    pub fn unlink_node(&mut self, id: NodeId, allow_unlinking_root: bool) -> Result<()> {
        let is_root = self.root == Some(id) || self.body_owner(id).is_some();
        if is_root && !allow_unlinking_root {
            return Err(Error::invariant(format!("refusing to unlink root {id}")));
        }
        let node = self.node(id)?;
        let [dep] = node.deps[..] else {
            return Err(Error::invariant(format!(
                "unlink of {id} with {} dependencies would disconnect the plan",
                node.deps.len()
            )));
        };
        if node.parents.len() > 1 {
            return Err(Error::invariant(format!(
                "unlink of {id} with {} parents",
                node.parents.len()
            )));
        }
        let parents = node.parents.clone();

        for &p in &parents {
            for d in self.node_mut(p)?.deps.iter_mut() {
                if *d == id {
                    *d = dep;
                }
            }
        }
        {
            let dn = self.node_mut(dep)?;
            dn.parents.retain(|p| *p != id);
            dn.parents.extend(parents.iter().copied());
        }
        if is_root {
            self.retarget_root(id, dep)?;
        }
        let n = self.node_mut(id)?;
        n.deps.clear();
        n.parents.clear();
        Ok(())
    }

    pub fn unlink_nodes<I: IntoIterator<Item = NodeId>>(&mut self, ids: I) -> Result<()> {
        for id in ids {
            self.unlink_node(id, false)?;
        }
        Ok(())
    }

    /// Put the unlinked node `new` in the place of `old`, taking over all of
    /// its edges. `old` ends up unlinked.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        self.ensure_unlinked(new)?;
        if old == new {
            return Err(Error::invariant(format!("cannot replace {old} by itself")));
        }
        let (deps, parents) = {
            let n = self.node_mut(old)?;
            (std::mem::take(&mut n.deps), std::mem::take(&mut n.parents))
        };
        for &d in &deps {
            for p in self.node_mut(d)?.parents.iter_mut() {
                if *p == old {
                    *p = new;
                }
            }
        }
        for &p in &parents {
            for d in self.node_mut(p)?.deps.iter_mut() {
                if *d == old {
                    *d = new;
                }
            }
        }
        {
            let n = self.node_mut(new)?;
            n.deps = deps;
            n.parents = parents;
        }
        self.retarget_root(old, new)
    }

    /// Nodes reachable from the root in deterministic pre-order: a node,
    /// then its dependencies, then (optionally) its subquery body.
    pub fn find_nodes_of_type(&self, types: &[NodeType], enter_subqueries: bool) -> Vec<NodeId> {
        self.walk(enter_subqueries)
            .into_iter()
            .filter(|id| {
                self.nodes
                    .get(id)
                    .map(|n| types.contains(&n.node_type()))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// All nodes reachable from the root, subquery bodies included.
    pub fn reachable_nodes(&self) -> Vec<NodeId> {
        self.walk(true)
    }

    fn walk(&self, enter_subqueries: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return out;
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            out.push(id);
            let mut children: Vec<NodeId> = node.deps.clone();
            if enter_subqueries {
                if let NodeKind::Subquery { body, .. } = node.kind {
                    children.push(body);
                }
            }
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Nodes of one scope (reachable through dependency edges only),
    /// dependencies before dependents. Ties are broken by id.
    pub fn topological_order(&self, scope_root: NodeId) -> Result<Vec<NodeId>> {
        let mut scope = BTreeSet::new();
        let mut stack = vec![scope_root];
        while let Some(id) = stack.pop() {
            if scope.insert(id) {
                stack.extend(self.node(id)?.deps.iter().copied());
            }
        }

        let mut pending: BTreeMap<NodeId, usize> = BTreeMap::new();
        for &id in &scope {
            pending.insert(id, self.node(id)?.deps.len());
        }
        let mut ready: BTreeSet<NodeId> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(scope.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &p in &self.node(id)?.parents {
                if let Some(n) = pending.get_mut(&p) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        ready.insert(p);
                    }
                }
            }
        }
        if order.len() != scope.len() {
            return Err(Error::invariant(format!(
                "cycle detected below {scope_root}"
            )));
        }
        Ok(order)
    }

    /// The node that introduces `var`, searching subquery bodies too.
    pub fn get_var_set_by(&self, var: VariableId) -> Option<NodeId> {
        if let Some(usage) = &self.usage {
            return usage.setter(var);
        }
        self.walk(true).into_iter().find(|id| {
            self.nodes
                .get(id)
                .map(|n| n.kind.variables_set_here().contains(&var))
                .unwrap_or(false)
        })
    }

    /// Reachable nodes that read `var`.
    pub fn users_of(&self, var: VariableId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for id in self.walk(true) {
            if self.variables_used_here(id)?.contains(&var) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Variables read by `id`. A subquery reads its body's free variables;
    /// `COLLECT ... INTO` reads everything defined above it.
    pub fn variables_used_here(&self, id: NodeId) -> Result<BTreeSet<VariableId>> {
        let node = self.node(id)?;
        let mut out = BTreeSet::new();
        node.kind.collect_variables_used(&mut out);
        match &node.kind {
            NodeKind::Subquery { body, .. } => {
                let mut set_inside = BTreeSet::new();
                for inner in self.subtree(*body)? {
                    let n = self.node(inner)?;
                    set_inside.extend(n.kind.variables_set_here());
                    out.extend(self.variables_used_here(inner)?);
                }
                out.retain(|v| !set_inside.contains(v));
            }
            NodeKind::Collect(c) if c.into.is_some() => {
                out.extend(self.variables_set_above(id)?);
            }
            _ => {}
        }
        Ok(out)
    }

    /// Every variable introduced by the transitive dependencies of `id`
    /// within its own scope.
    pub fn variables_set_above(&self, id: NodeId) -> Result<BTreeSet<VariableId>> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<NodeId> = self.node(id)?.deps.clone();
        let mut seen = BTreeSet::new();
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            let n = self.node(cur)?;
            out.extend(n.kind.variables_set_here());
            stack.extend(n.deps.iter().copied());
        }
        Ok(out)
    }

    /// `id` and every node reachable from it, subquery bodies included.
    pub fn subtree(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            let n = self.node(cur)?;
            out.push(cur);
            stack.extend(n.deps.iter().copied());
            if let NodeKind::Subquery { body, .. } = n.kind {
                stack.push(body);
            }
        }
        Ok(out)
    }

    pub fn can_throw(&self, id: NodeId) -> Result<bool> {
        match &self.node(id)?.kind {
            NodeKind::Subquery { body, .. } => {
                for inner in self.subtree(*body)? {
                    if self.node(inner)?.kind.can_throw_here() {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            kind => Ok(kind.can_throw_here()),
        }
    }

    pub fn is_deterministic(&self, id: NodeId) -> Result<bool> {
        match &self.node(id)?.kind {
            NodeKind::Subquery { body, .. } => {
                for inner in self.subtree(*body)? {
                    if !self.node(inner)?.kind.is_deterministic_here() {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            kind => Ok(kind.is_deterministic_here()),
        }
    }

    /// Does the subquery at `id` (or the node itself) write data?
    pub fn is_modifying(&self, id: NodeId) -> Result<bool> {
        match &self.node(id)?.kind {
            NodeKind::Subquery { body, .. } => {
                for inner in self.subtree(*body)? {
                    if self.node_type(inner)?.is_modification() {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            kind => Ok(kind.node_type().is_modification()),
        }
    }

    /// Recompute setters and the variables used later for every node.
    pub fn compute_usage(&mut self) -> Result<()> {
        let usage = UsageIndex::compute(self)?;
        self.usage = Some(usage);
        Ok(())
    }

    pub fn usage_valid(&self) -> bool {
        self.usage.is_some()
    }

    fn usage(&self) -> Result<&UsageIndex> {
        self.usage
            .as_ref()
            .ok_or_else(|| Error::invariant("variable usage is stale; call compute_usage first"))
    }

    /// Is `var` read by any node that runs after `node`?
    pub fn is_used_later(&self, node: NodeId, var: VariableId) -> Result<bool> {
        Ok(self.usage()?.used_later(node).contains(&var))
    }

    pub fn vars_used_later(&self, node: NodeId) -> Result<BTreeSet<VariableId>> {
        Ok(self.usage()?.used_later(node).clone())
    }

    /// Deep copy with fresh ids `1..=n`, assigned in ascending order of the
    /// old ids of the reachable nodes.
    pub fn clone_plan(&self) -> Result<ClonedPlan> {
        let mut reachable = self.walk(true);
        reachable.sort_unstable();
        let id_map: BTreeMap<NodeId, NodeId> = reachable
            .iter()
            .enumerate()
            .map(|(i, old)| (*old, NodeId::new(i as u64 + 1)))
            .collect();

        let mut nodes = BTreeMap::new();
        for old in &reachable {
            let n = self.node(*old)?;
            let mut kind = n.kind.clone();
            kind.remap_nodes(&id_map);
            let map = |ids: &[NodeId]| -> Vec<NodeId> {
                ids.iter().filter_map(|i| id_map.get(i).copied()).collect()
            };
            let new_id = id_map[old];
            nodes.insert(
                new_id,
                PlanNode {
                    id: new_id,
                    kind,
                    deps: map(&n.deps),
                    parents: map(&n.parents),
                },
            );
        }
        let plan = Plan {
            nodes,
            root: self.root.and_then(|r| id_map.get(&r).copied()),
            ids: NodeIdAllocator::after(reachable.len() as u64),
            usage: None,
            applied_rules: self.applied_rules.clone(),
        };
        Ok(ClonedPlan { plan, id_map })
    }

    /// Names of the rules that modified this plan, in application order.
    pub fn applied_rules(&self) -> &[String] {
        &self.applied_rules
    }

    pub fn record_applied_rule(&mut self, name: &str) {
        if !self.applied_rules.iter().any(|r| r == name) {
            self.applied_rules.push(name.to_string());
        }
    }

    /// Stable structural hash. Node ids are replaced by traversal positions,
    /// so two plans with the same shape hash equal regardless of history.
    pub fn fingerprint(&self) -> Result<Hash256> {
        #[derive(Serialize)]
        struct Entry {
            kind: NodeKind,
            deps: Vec<u64>,
        }
        let order = self.walk(true);
        let pos: BTreeMap<NodeId, NodeId> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, NodeId::new(i as u64)))
            .collect();
        let mut entries = Vec::with_capacity(order.len());
        for id in &order {
            let n = self.node(*id)?;
            let mut kind = n.kind.clone();
            kind.remap_nodes(&pos);
            entries.push(Entry {
                kind,
                deps: n
                    .deps
                    .iter()
                    .filter_map(|d| pos.get(d).map(|p| p.get()))
                    .collect(),
            });
        }
        hash_serde(&entries)
    }

    /// Estimated cost of running the whole plan.
    pub fn estimate_cost(&self, costs: &CostConstants) -> Result<CostEstimate> {
        cost::estimate_plan(self, costs)
    }
}
