//! Filter rewrites: constant filters, conjunction splitting, OR conditions
//! on a single attribute, pushing filters towards the leaves.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use quarry_core::expr::{compare_values, AttributeComparison, BinaryOp, ComparisonOp, Expr};
use quarry_core::id::{NodeId, VariableId};
use quarry_core::Result;
use quarry_plan::{NodeKind, NodeType, Plan};

use super::{calculation_of, is_barrier, single_dependency};
use crate::rule::{single, RuleContext, RuleOutput};

/// Drop filters that always pass (or that repeat a filter on the same
/// variable further down); replace filters that never pass by `NoResults`.
pub fn remove_unnecessary_filters(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let mut modified = false;
    let mut to_unlink = BTreeSet::new();

    for id in plan.find_nodes_of_type(&[NodeType::Filter], true) {
        let NodeKind::Filter { in_var } = *plan.kind(id)? else {
            continue;
        };
        if filtered_below(&plan, id, in_var)? {
            to_unlink.insert(id);
            continue;
        }
        let Some((_, expr)) = calculation_of(&plan, in_var)? else {
            continue;
        };
        if expr.can_throw() || !expr.is_deterministic() {
            continue;
        }
        if expr.is_true() {
            to_unlink.insert(id);
        } else if expr.is_false() {
            let empty = plan.create_node(NodeKind::NoResults);
            plan.replace_node(id, empty)?;
            modified = true;
        }
    }

    if !to_unlink.is_empty() {
        plan.unlink_nodes(to_unlink)?;
        modified = true;
    }
    single(plan, modified)
}

/// Is `var` already filtered on by a node this filter depends on?
fn filtered_below(plan: &Plan, filter: NodeId, var: VariableId) -> Result<bool> {
    let mut cur = single_dependency(plan, filter)?;
    while let Some(id) = cur {
        if let NodeKind::Filter { in_var } = plan.kind(id)? {
            if *in_var == var {
                return Ok(true);
            }
        }
        cur = single_dependency(plan, id)?;
    }
    Ok(false)
}

/// `FILTER a && b` becomes `LET t1 = a FILTER t1 LET t2 = b FILTER t2`, so
/// each part can travel on its own.
pub fn split_filters(ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&[NodeType::Filter], true) {
        let NodeKind::Filter { in_var } = *plan.kind(id)? else {
            continue;
        };
        let Some((_, expr)) = calculation_of(&plan, in_var)? else {
            continue;
        };
        if expr.can_throw() || !expr.is_deterministic() {
            continue;
        }
        let parts: Vec<_> = expr.conjuncts().into_iter().cloned().collect();
        if parts.len() < 2 {
            continue;
        }

        for part in parts {
            let out_var = ctx.variables.create_temporary().id;
            let calc = plan.create_node(NodeKind::Calculation {
                out_var,
                expr: part,
            });
            plan.insert_dependency(id, calc)?;
            let filter = plan.create_node(NodeKind::Filter { in_var: out_var });
            plan.insert_dependency(id, filter)?;
        }
        plan.unlink_node(id, false)?;
        modified = true;
    }
    single(plan, modified)
}

/// Move each filter as close to the leaves as possible: up to the setter of
/// its input, never past a Limit, a node that may throw or a
/// non-deterministic node.
pub fn move_filters_up(_ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&[NodeType::Filter], true) {
        let NodeKind::Filter { in_var } = *plan.kind(id)? else {
            continue;
        };

        let mut target = None;
        let mut cur = single_dependency(&plan, id)?;
        while let Some(c) = cur {
            let t = plan.node_type(c)?;
            if t == NodeType::Limit || is_barrier(t) {
                break;
            }
            if plan.can_throw(c)? || !plan.is_deterministic(c)? || plan.is_modifying(c)? {
                break;
            }
            if plan.kind(c)?.variables_set_here().contains(&in_var) {
                break;
            }
            let Some(next) = single_dependency(&plan, c)? else {
                break;
            };
            target = Some(c);
            cur = Some(next);
        }

        if let Some(below) = target {
            plan.unlink_node(id, false)?;
            plan.insert_dependency(below, id)?;
            modified = true;
        }
    }
    single(plan, modified)
}

/// Replace the OR condition computed for each filter by `rewrite(expr)`,
/// where it returns one.
fn rewrite_or_conditions(plan: &mut Plan, rewrite: fn(&Expr) -> Option<Expr>) -> Result<bool> {
    let mut modified = false;

    for id in plan.find_nodes_of_type(&[NodeType::Filter], true) {
        let NodeKind::Filter { in_var } = *plan.kind(id)? else {
            continue;
        };
        let Some((calc, expr)) = calculation_of(plan, in_var)? else {
            continue;
        };
        if !matches!(expr, Expr::Binary { op: BinaryOp::Or, .. })
            || expr.can_throw()
            || !expr.is_deterministic()
        {
            continue;
        }
        let Some(replacement) = rewrite(&expr) else {
            continue;
        };
        if let NodeKind::Calculation { expr, .. } = plan.kind_mut(calc)? {
            *expr = replacement;
        }
        modified = true;
    }
    Ok(modified)
}

/// Operands of `part` that may be the common side of an OR-to-IN rewrite.
fn in_candidates(part: &Expr) -> Vec<&Expr> {
    match part {
        Expr::Binary {
            op: BinaryOp::Eq,
            lhs,
            rhs,
        } => [lhs, rhs]
            .into_iter()
            .map(|side| &**side)
            .filter(|side| side.is_reference_or_attribute())
            .collect(),
        Expr::Binary {
            op: BinaryOp::In,
            lhs,
            ..
        } if lhs.is_reference_or_attribute() => vec![&**lhs],
        _ => Vec::new(),
    }
}

/// The values `part` compares `common` with, if it is `common == v`,
/// `v == common` or `common IN [...]`.
fn in_values(part: &Expr, common: &Expr) -> Option<Vec<Expr>> {
    let Expr::Binary { op, lhs, rhs } = part else {
        return None;
    };
    match op {
        BinaryOp::Eq if **lhs == *common && **rhs != *common => Some(vec![(**rhs).clone()]),
        BinaryOp::Eq if **rhs == *common && **lhs != *common => Some(vec![(**lhs).clone()]),
        BinaryOp::In if **lhs == *common => match &**rhs {
            Expr::Array(items) => Some(items.clone()),
            Expr::Value(serde_json::Value::Array(items)) => {
                Some(items.iter().cloned().map(Expr::Value).collect())
            }
            _ => None,
        },
        _ => None,
    }
}

fn or_as_in(expr: &Expr) -> Option<Expr> {
    let parts = expr.disjuncts();
    let first = parts.first()?;
    in_candidates(first).into_iter().find_map(|common| {
        let mut values = Vec::new();
        for part in &parts {
            values.extend(in_values(part, common)?);
        }
        Some(Expr::binary(BinaryOp::In, common.clone(), Expr::Array(values)))
    })
}

/// `x.a == 1 || x.a == 2 || x.a IN [3, 4]` becomes `x.a IN [1, 2, 3, 4]`,
/// which an index can serve.
pub fn replace_or_with_in(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let modified = rewrite_or_conditions(&mut plan, or_as_in)?;
    single(plan, modified)
}

fn is_lower_bound(op: ComparisonOp) -> bool {
    matches!(op, ComparisonOp::Gt | ComparisonOp::Ge)
}

/// The weakest of a set of bounds in the same direction on one attribute.
fn weakest_bound(expr: &Expr) -> Option<Expr> {
    let mut best: Option<AttributeComparison> = None;
    for part in expr.disjuncts() {
        let cmp = part.as_attribute_comparison()?;
        if !cmp.op.is_range() {
            return None;
        }
        let wider = match &best {
            None => true,
            Some(cur) => {
                let lower = is_lower_bound(cmp.op);
                if cur.var != cmp.var || cur.path != cmp.path || is_lower_bound(cur.op) != lower {
                    return None;
                }
                match compare_values(&cmp.value, &cur.value) {
                    Ordering::Less => lower,
                    Ordering::Greater => !lower,
                    Ordering::Equal => matches!(cmp.op, ComparisonOp::Ge | ComparisonOp::Le),
                }
            }
        };
        if wider {
            best = Some(cmp);
        }
    }
    best.map(|b| b.to_expr())
}

/// `x.a > 1 || x.a >= 5` becomes `x.a > 1`: of several bounds in the same
/// direction only the weakest matters.
pub fn remove_redundant_or(
    _ctx: &mut RuleContext<'_>,
    mut plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let modified = rewrite_or_conditions(&mut plan, weakest_bound)?;
    single(plan, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{run, shape, Chain};
    use quarry_core::expr::Expr;
    use quarry_plan::catalog::MemoryCatalog;

    #[test]
    fn constant_true_filter_is_removed() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        c.filter(Expr::value(true));
        let (plan, mut vars) = c.ret(x);
        let out = run(remove_unnecessary_filters, plan, &mut vars, &MemoryCatalog::new());
        assert!(out[0].modified);
        assert!(!shape(&out[0].plan).contains(&NodeType::Filter));
    }

    #[test]
    fn constant_false_filter_becomes_no_results() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        c.filter(Expr::eq(Expr::value(1), Expr::value(2)));
        let (plan, mut vars) = c.ret(x);
        let out = run(remove_unnecessary_filters, plan, &mut vars, &MemoryCatalog::new());
        assert!(shape(&out[0].plan).contains(&NodeType::NoResults));
    }

    #[test]
    fn data_dependent_filter_stays() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        c.filter(Expr::eq(Expr::attribute_path_of(x, &["a"]), Expr::value(1)));
        let (plan, mut vars) = c.ret(x);
        let out = run(remove_unnecessary_filters, plan, &mut vars, &MemoryCatalog::new());
        assert!(!out[0].modified);
    }

    #[test]
    fn repeated_filter_on_same_variable_is_removed() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let (_, var) = c.calc(Expr::attribute_path_of(x, &["ok"]));
        c.push(NodeKind::Filter { in_var: var });
        c.push(NodeKind::Filter { in_var: var });
        let (plan, mut vars) = c.ret(x);
        let out = run(remove_unnecessary_filters, plan, &mut vars, &MemoryCatalog::new());
        let filters = shape(&out[0].plan)
            .into_iter()
            .filter(|t| *t == NodeType::Filter)
            .count();
        assert_eq!(filters, 1);
    }

    #[test]
    fn conjunction_is_split() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let a = Expr::eq(Expr::attribute_path_of(x, &["a"]), Expr::value(1));
        let b = Expr::eq(Expr::attribute_path_of(x, &["b"]), Expr::value(2));
        c.filter(Expr::and(a, b));
        let (plan, mut vars) = c.ret(x);
        let out = run(split_filters, plan, &mut vars, &MemoryCatalog::new());
        let filters = shape(&out[0].plan)
            .into_iter()
            .filter(|t| *t == NodeType::Filter)
            .count();
        assert_eq!(filters, 2);
        quarry_plan::verify_plan(&out[0].plan).unwrap();
    }

    #[test]
    fn filter_moves_below_inner_loop() {
        // FOR x IN a FOR y IN b FILTER x.v == 1
        let mut c = Chain::new();
        let (_, x) = c.scan("a", 10);
        let (_, var) = c.calc(Expr::eq(Expr::attribute_path_of(x, &["v"]), Expr::value(1)));
        c.scan("b", 10);
        c.push(NodeKind::Filter { in_var: var });
        let (plan, mut vars) = c.ret(x);
        let out = run(move_filters_up, plan, &mut vars, &MemoryCatalog::new());
        assert!(out[0].modified);
        assert_eq!(
            shape(&out[0].plan),
            vec![
                NodeType::Singleton,
                NodeType::EnumerateCollection,
                NodeType::Calculation,
                NodeType::Filter,
                NodeType::EnumerateCollection,
                NodeType::Return,
            ]
        );
    }

    #[test]
    fn filter_never_passes_a_limit() {
        let mut c = Chain::new();
        let (_, x) = c.scan("a", 10);
        let (_, var) = c.calc(Expr::attribute_path_of(x, &["v"]));
        c.push(NodeKind::Limit { offset: 0, limit: 3 });
        c.push(NodeKind::Filter { in_var: var });
        let (plan, mut vars) = c.ret(x);
        let out = run(move_filters_up, plan, &mut vars, &MemoryCatalog::new());
        assert!(!out[0].modified);
    }

    fn or_of(parts: Vec<Expr>) -> Expr {
        parts
            .into_iter()
            .reduce(|a, b| Expr::binary(BinaryOp::Or, a, b))
            .unwrap()
    }

    fn condition_of_filter(plan: &Plan) -> Expr {
        let filter = plan.find_nodes_of_type(&[NodeType::Filter], true)[0];
        let NodeKind::Filter { in_var } = *plan.kind(filter).unwrap() else {
            panic!("filter expected");
        };
        calculation_of(plan, in_var).unwrap().unwrap().1
    }

    #[test]
    fn equalities_on_one_attribute_become_in() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let a = Expr::attribute_path_of(x, &["a"]);
        c.filter(or_of(vec![
            Expr::eq(a.clone(), Expr::value(1)),
            Expr::eq(Expr::value(2), a.clone()),
            Expr::binary(BinaryOp::In, a.clone(), Expr::value(serde_json::json!([3, 4]))),
        ]));
        let (plan, mut vars) = c.ret(x);
        let out = run(replace_or_with_in, plan, &mut vars, &MemoryCatalog::new());
        assert!(out[0].modified);

        let cmp = condition_of_filter(&out[0].plan)
            .as_attribute_comparison()
            .unwrap();
        assert_eq!(cmp.op, ComparisonOp::In);
        assert_eq!(cmp.value, serde_json::json!([1, 2, 3, 4]));
        quarry_plan::verify_plan(&out[0].plan).unwrap();
    }

    #[test]
    fn or_over_different_attributes_stays() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        c.filter(or_of(vec![
            Expr::eq(Expr::attribute_path_of(x, &["a"]), Expr::value(1)),
            Expr::eq(Expr::attribute_path_of(x, &["b"]), Expr::value(2)),
        ]));
        let (plan, mut vars) = c.ret(x);
        let cat = MemoryCatalog::new();
        let out = run(replace_or_with_in, plan, &mut vars, &cat).remove(0);
        assert!(!out.modified);
        let out = run(remove_redundant_or, out.plan, &mut vars, &cat);
        assert!(!out[0].modified);
    }

    #[test]
    fn weakest_lower_bound_is_kept() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let a = Expr::attribute_path_of(x, &["a"]);
        c.filter(or_of(vec![
            Expr::binary(BinaryOp::Gt, a.clone(), Expr::value(5)),
            Expr::binary(BinaryOp::Lt, Expr::value(1), a.clone()),
            Expr::binary(BinaryOp::Ge, a.clone(), Expr::value(1)),
        ]));
        let (plan, mut vars) = c.ret(x);
        let out = run(remove_redundant_or, plan, &mut vars, &MemoryCatalog::new());
        assert!(out[0].modified);

        let cmp = condition_of_filter(&out[0].plan)
            .as_attribute_comparison()
            .unwrap();
        assert_eq!(cmp.op, ComparisonOp::Ge);
        assert_eq!(cmp.value, serde_json::json!(1));
    }

    #[test]
    fn bounds_in_both_directions_stay() {
        let mut c = Chain::new();
        let (_, x) = c.scan("c", 10);
        let a = Expr::attribute_path_of(x, &["a"]);
        c.filter(or_of(vec![
            Expr::binary(BinaryOp::Lt, a.clone(), Expr::value(1)),
            Expr::binary(BinaryOp::Gt, a, Expr::value(5)),
        ]));
        let (plan, mut vars) = c.ret(x);
        let out = run(remove_redundant_or, plan, &mut vars, &MemoryCatalog::new());
        assert!(!out[0].modified);
    }
}
