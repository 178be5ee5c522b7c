//! Subquery splicing.

use quarry_core::id::NodeId;
use quarry_core::Result;
use quarry_plan::{NodeKind, NodeType, Plan};

use crate::rule::{single, RuleContext, RuleOutput};

/// Body nodes between the body's Singleton and its Return, leaves first, if
/// the body is a simple chain that may be spliced.
fn spliceable_body(plan: &Plan, body: NodeId) -> Result<Option<Vec<NodeId>>> {
    for id in plan.subtree(body)? {
        if let NodeKind::Collect(c) = plan.kind(id)? {
            if c.into.is_some() {
                return Ok(None);
            }
        }
    }
    let order = plan.topological_order(body)?;
    let [first, inner @ .., last] = &order[..] else {
        return Ok(None);
    };
    if plan.node_type(*first)? != NodeType::Singleton || *last != body {
        return Ok(None);
    }
    for &id in inner.iter().chain(std::iter::once(last)) {
        if plan.dependencies(id)?.len() != 1 || plan.parents(id)?.len() > 1 {
            return Ok(None);
        }
    }
    Ok(Some(inner.to_vec()))
}

/// Replace each subquery by its body, spliced inline between a
/// `SubqueryStart` and a `SubqueryEnd`. Bodies that collect `INTO` need a
/// scope of their own and are left nested.
pub fn splice_subqueries(_ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for sq in plan.find_nodes_of_type(&[NodeType::Subquery], true) {
        let NodeKind::Subquery { body, out_var } = *plan.kind(sq)? else {
            continue;
        };
        let NodeKind::Return { in_var } = *plan.kind(body)? else {
            continue;
        };
        let Some(inner) = spliceable_body(&plan, body)? else {
            tracing::debug!(node = %sq, "subquery stays nested");
            continue;
        };

        let end = plan.create_node(NodeKind::SubqueryEnd { in_var, out_var });
        plan.replace_node(sq, end)?;
        let start = plan.create_node(NodeKind::SubqueryStart {
            subquery_out: out_var,
        });
        plan.insert_dependency(end, start)?;

        for &id in &inner {
            plan.unlink_node(id, false)?;
        }
        for &id in &inner {
            plan.insert_dependency(end, id)?;
        }
        modified = true;
    }
    single(plan, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{run, shape, Chain};
    use quarry_core::expr::Expr;
    use quarry_plan::catalog::MemoryCatalog;
    use quarry_plan::{Collect, CollectionScan, GroupVar};

    /// `FOR x IN outer LET s = (FOR y IN inner RETURN y.v) RETURN s`
    fn nested(collect_into: bool) -> (Plan, quarry_core::variable::VariableRegistry, NodeId) {
        let mut c = Chain::new();
        let (_, _x) = c.scan("outer", 10);
        let y = c.var("y");
        let v = c.vars.create_temporary().id;
        let s = c.var("s");

        let plan = &mut c.plan;
        let bs = plan.create_node(NodeKind::Singleton);
        let scan = plan.create_node(NodeKind::EnumerateCollection(CollectionScan {
            collection: "inner".into(),
            out_var: y,
            document_count: 5,
            random: false,
            hint: None,
            restricted_shard: None,
        }));
        plan.add_dependency(scan, bs).unwrap();
        let calc = plan.create_node(NodeKind::Calculation {
            out_var: v,
            expr: Expr::attribute_path_of(y, &["v"]),
        });
        plan.add_dependency(calc, scan).unwrap();
        let mut last = calc;
        let mut returned = v;
        if collect_into {
            let g = c.vars.create_variable("g").id;
            let into = c.vars.create_variable("rows").id;
            let collect = plan.create_node(NodeKind::Collect(Collect {
                groups: vec![GroupVar { out_var: g, in_var: v }],
                aggregates: Vec::new(),
                into: Some(into),
            }));
            plan.add_dependency(collect, calc).unwrap();
            last = collect;
            returned = into;
        }
        let br = plan.create_node(NodeKind::Return { in_var: returned });
        plan.add_dependency(br, last).unwrap();

        let sq = c.push(NodeKind::Subquery { body: br, out_var: s });
        let (plan, vars) = c.ret(s);
        (plan, vars, sq)
    }

    #[test]
    fn simple_subquery_is_spliced() {
        let (plan, mut vars, sq) = nested(false);
        let out = run(splice_subqueries, plan, &mut vars, &MemoryCatalog::new());
        assert!(out[0].modified);
        let plan = &out[0].plan;
        assert!(plan.node(sq).unwrap().is_unlinked());
        assert_eq!(
            shape(plan),
            vec![
                NodeType::Singleton,
                NodeType::EnumerateCollection,
                NodeType::SubqueryStart,
                NodeType::EnumerateCollection,
                NodeType::Calculation,
                NodeType::SubqueryEnd,
                NodeType::Return,
            ]
        );
        quarry_plan::verify_plan(plan).unwrap();
    }

    #[test]
    fn collect_into_keeps_subquery_nested() {
        let (plan, mut vars, sq) = nested(true);
        let out = run(splice_subqueries, plan, &mut vars, &MemoryCatalog::new());
        assert!(!out[0].modified);
        assert!(!out[0].plan.node(sq).unwrap().is_unlinked());
    }
}
