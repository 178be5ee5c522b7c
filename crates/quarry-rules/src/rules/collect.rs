//! Drop outputs of collects and data modifications nobody reads.

use quarry_core::Result;
use quarry_plan::{NodeKind, NodeType, Plan};

use crate::rule::{single, RuleContext, RuleOutput};

/// Remove an unused `INTO` variable and unused aggregate results from every
/// collect. Group variables are kept since they define the grouping.
pub fn remove_collect_variables(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    plan.compute_usage()?;
    let mut edits = Vec::new();

    for id in plan.find_nodes_of_type(&[NodeType::Collect], true) {
        let NodeKind::Collect(c) = plan.kind(id)? else {
            continue;
        };
        let later = plan.vars_used_later(id)?;
        let drop_into = c.into.is_some_and(|v| !later.contains(&v));
        let keep: Vec<bool> = c
            .aggregates
            .iter()
            .map(|a| later.contains(&a.out_var))
            .collect();
        if drop_into || keep.contains(&false) {
            edits.push((id, drop_into, keep));
        }
    }

    let modified = !edits.is_empty();
    for (id, drop_into, keep) in edits {
        if let NodeKind::Collect(c) = plan.kind_mut(id)? {
            if drop_into {
                c.into = None;
            }
            let mut flags = keep.into_iter();
            c.aggregates.retain(|_| flags.next().unwrap_or(true));
        }
    }
    single(plan, modified)
}

/// Stop producing `OLD`/`NEW` documents of modifications that nobody reads.
pub fn remove_data_modification_out_variables(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    plan.compute_usage()?;
    let mut edits = Vec::new();

    for id in plan.find_nodes_of_type(&NodeType::MODIFICATIONS, true) {
        let Some(m) = plan.kind(id)?.modification() else {
            continue;
        };
        let later = plan.vars_used_later(id)?;
        let clear_old = m.out_old.is_some_and(|v| !later.contains(&v));
        let clear_new = m.out_new.is_some_and(|v| !later.contains(&v));
        if clear_old || clear_new {
            edits.push((id, clear_old, clear_new));
        }
    }

    let modified = !edits.is_empty();
    for (id, clear_old, clear_new) in edits {
        if let Some(m) = plan.kind_mut(id)?.modification_mut() {
            if clear_old {
                m.out_old = None;
            }
            if clear_new {
                m.out_new = None;
            }
        }
    }
    single(plan, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{run, Chain};
    use quarry_core::expr::Expr;
    use quarry_plan::catalog::MemoryCatalog;
    use quarry_plan::{AggregateFunction, AggregateVar, Collect, GroupVar, Modification};

    #[test]
    fn unused_into_and_aggregates_are_dropped() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let (_, key) = c.calc(Expr::attribute_path_of(x, &["k"]));
        let g = c.var("g");
        let n = c.var("n");
        let total = c.var("total");
        let rows = c.var("rows");
        let collect = c.push(NodeKind::Collect(Collect {
            groups: vec![GroupVar { out_var: g, in_var: key }],
            aggregates: vec![
                AggregateVar {
                    out_var: n,
                    in_var: None,
                    function: AggregateFunction::Count,
                },
                AggregateVar {
                    out_var: total,
                    in_var: Some(key),
                    function: AggregateFunction::Sum,
                },
            ],
            into: Some(rows),
        }));
        let (plan, mut vars) = c.ret(n);
        let out = run(remove_collect_variables, plan, &mut vars, &MemoryCatalog::new());
        assert!(out[0].modified);
        let NodeKind::Collect(c) = out[0].plan.kind(collect).unwrap() else {
            panic!("collect expected");
        };
        assert_eq!(c.into, None);
        assert_eq!(c.aggregates.len(), 1);
        assert_eq!(c.aggregates[0].out_var, n);
        assert_eq!(c.groups.len(), 1);
    }

    #[test]
    fn read_outputs_are_kept() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let (_, key) = c.calc(Expr::attribute_path_of(x, &["k"]));
        let g = c.var("g");
        c.push(NodeKind::Collect(Collect {
            groups: vec![GroupVar { out_var: g, in_var: key }],
            aggregates: Vec::new(),
            into: None,
        }));
        let (plan, mut vars) = c.ret(g);
        let out = run(remove_collect_variables, plan, &mut vars, &MemoryCatalog::new());
        assert!(!out[0].modified);
    }

    #[test]
    fn unused_new_document_is_cleared() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let old = c.var("OLD");
        let new = c.var("NEW");
        let update = c.push(NodeKind::Update(Modification {
            collection: "c".into(),
            in_var: x,
            key_var: None,
            out_old: Some(old),
            out_new: Some(new),
            options: Default::default(),
        }));
        let (plan, mut vars) = c.ret(old);
        let out = run(
            remove_data_modification_out_variables,
            plan,
            &mut vars,
            &MemoryCatalog::new(),
        );
        assert!(out[0].modified);
        let m = out[0].plan.kind(update).unwrap().modification().unwrap();
        assert_eq!(m.out_old, Some(old));
        assert_eq!(m.out_new, None);
    }
}
