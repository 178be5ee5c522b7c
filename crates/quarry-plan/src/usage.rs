//! Variable liveness: which node sets each variable and which variables are
//! still read after each node.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::id::{NodeId, VariableId};
use quarry_core::{Error, Result};

use crate::node::NodeKind;
use crate::plan::Plan;

#[derive(Debug, Clone, Default)]
pub struct UsageIndex {
    setters: BTreeMap<VariableId, NodeId>,
    used_later: BTreeMap<NodeId, BTreeSet<VariableId>>,
}

static EMPTY: BTreeSet<VariableId> = BTreeSet::new();

impl UsageIndex {
    pub fn compute(plan: &Plan) -> Result<Self> {
        let mut index = UsageIndex::default();
        let root = plan.root()?;
        index.scope(plan, root, &BTreeSet::new())?;
        Ok(index)
    }

    pub fn setter(&self, var: VariableId) -> Option<NodeId> {
        self.setters.get(&var).copied()
    }

    pub fn used_later(&self, node: NodeId) -> &BTreeSet<VariableId> {
        self.used_later.get(&node).unwrap_or(&EMPTY)
    }

    /// Walk one scope from the root towards the leaves. A subquery body
    /// inherits what is used after its subquery node.
    fn scope(&mut self, plan: &Plan, root: NodeId, inherited: &BTreeSet<VariableId>) -> Result<()> {
        let order = plan.topological_order(root)?;
        let mut used_here: BTreeMap<NodeId, BTreeSet<VariableId>> = BTreeMap::new();

        for &id in order.iter().rev() {
            let mut later = inherited.clone();
            for p in plan.parents(id)? {
                if let Some(after_parent) = self.used_later.get(p) {
                    later.extend(after_parent.iter().copied());
                }
                if let Some(read) = used_here.get(p) {
                    later.extend(read.iter().copied());
                }
            }
            used_here.insert(id, plan.variables_used_here(id)?);

            for var in plan.kind(id)?.variables_set_here() {
                if let Some(prev) = self.setters.insert(var, id) {
                    return Err(Error::invariant(format!(
                        "variable {var} is set by both {prev} and {id}"
                    )));
                }
            }
            self.used_later.insert(id, later);
        }

        for &id in &order {
            if let NodeKind::Subquery { body, .. } = plan.kind(id)? {
                let body = *body;
                let after = self.used_later(id).clone();
                self.scope(plan, body, &after)?;
            }
        }
        Ok(())
    }
}
