//! Structural checks every finished plan must pass.

use std::collections::{BTreeMap, BTreeSet};

use quarry_core::id::{NodeId, VariableId};
use quarry_core::{Error, Result};

use crate::node::{NodeKind, NodeType};
use crate::plan::Plan;

/// Verify edge symmetry, acyclicity, single setters, that every scope starts
/// at a Singleton, and that every variable is defined before it is read.
pub fn verify_plan(plan: &Plan) -> Result<()> {
    let root = plan.root()?;
    let reachable = plan.reachable_nodes();

    for &id in &reachable {
        let node = plan.node(id)?;
        for &d in node.dependencies() {
            if !plan.node(d)?.parents().contains(&id) {
                return Err(Error::invariant(format!(
                    "{d} is a dependency of {id} but does not list it as parent"
                )));
            }
        }
        for &p in node.parents() {
            if !plan.node(p)?.dependencies().contains(&id) {
                return Err(Error::invariant(format!(
                    "{p} is a parent of {id} but does not depend on it"
                )));
            }
        }
        if node.dependencies().is_empty() && node.node_type() != NodeType::Singleton {
            return Err(Error::invariant(format!(
                "{id} ({}) has no dependency",
                node.node_type().name()
            )));
        }
    }

    let mut setters: BTreeMap<VariableId, NodeId> = BTreeMap::new();
    for &id in &reachable {
        for var in plan.kind(id)?.variables_set_here() {
            if let Some(prev) = setters.insert(var, id) {
                return Err(Error::invariant(format!(
                    "variable {var} is set by both {prev} and {id}"
                )));
            }
        }
    }

    check_scope(plan, root, &BTreeSet::new())
}

fn check_scope(plan: &Plan, scope_root: NodeId, inherited: &BTreeSet<VariableId>) -> Result<()> {
    let order = plan.topological_order(scope_root)?;
    let mut available: BTreeMap<NodeId, BTreeSet<VariableId>> = BTreeMap::new();

    for &id in &order {
        let mut here = inherited.clone();
        for d in plan.dependencies(id)? {
            if let Some(a) = available.get(d) {
                here.extend(a.iter().copied());
            }
            here.extend(plan.kind(*d)?.variables_set_here());
        }

        for var in plan.variables_used_here(id)? {
            if !here.contains(&var) {
                return Err(Error::invariant(format!(
                    "{id} ({}) reads {var} before it is defined",
                    plan.node_type(id)?.name()
                )));
            }
        }

        if let NodeKind::Subquery { body, .. } = plan.kind(id)? {
            check_scope(plan, *body, &here)?;
        }
        available.insert(id, here);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::expr::Expr;

    fn v(n: u64) -> VariableId {
        VariableId::new(n)
    }

    #[test]
    fn accepts_a_well_formed_plan() {
        let mut plan = Plan::new();
        let s = plan.create_node(NodeKind::Singleton);
        let c = plan.create_node(NodeKind::Calculation {
            out_var: v(1),
            expr: Expr::value(3),
        });
        let r = plan.create_node(NodeKind::Return { in_var: v(1) });
        plan.add_dependency(c, s).unwrap();
        plan.add_dependency(r, c).unwrap();
        plan.set_root(r).unwrap();
        verify_plan(&plan).unwrap();
    }

    #[test]
    fn rejects_use_before_definition() {
        let mut plan = Plan::new();
        let s = plan.create_node(NodeKind::Singleton);
        let f = plan.create_node(NodeKind::Filter { in_var: v(1) });
        let c = plan.create_node(NodeKind::Calculation {
            out_var: v(1),
            expr: Expr::value(true),
        });
        let r = plan.create_node(NodeKind::Return { in_var: v(1) });
        plan.add_dependency(f, s).unwrap();
        plan.add_dependency(c, f).unwrap();
        plan.add_dependency(r, c).unwrap();
        plan.set_root(r).unwrap();
        assert!(matches!(verify_plan(&plan), Err(Error::Invariant(_))));
    }

    #[test]
    fn rejects_dangling_leaf() {
        let mut plan = Plan::new();
        let r = plan.create_node(NodeKind::Return { in_var: v(1) });
        plan.set_root(r).unwrap();
        assert!(verify_plan(&plan).is_err());
    }
}
