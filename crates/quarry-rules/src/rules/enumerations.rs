//! Loop reordering.

use std::collections::BTreeSet;

use quarry_core::id::NodeId;
use quarry_core::Result;
use quarry_plan::{NodeType, Plan};

use super::single_parent;
use crate::rule::{RuleContext, RuleOutput};

const LOOPS: [NodeType; 2] = [NodeType::EnumerateCollection, NodeType::EnumerateList];

/// Offer every other nesting order of directly adjacent, mutually
/// independent loops as an alternative plan. The input plan is returned
/// unchanged next to the alternatives.
pub fn interchange_adjacent_enumerations(
    ctx: &mut RuleContext<'_>,
    plan: Plan,
) -> Result<Vec<RuleOutput>> {
    let runs = adjacent_runs(&plan)?;
    if runs.is_empty() || !ctx.may_branch() {
        return Ok(vec![RuleOutput::unchanged(plan)]);
    }

    let mut perms: Vec<Vec<usize>> = runs.iter().map(|r| (0..r.len()).collect()).collect();
    let mut alternatives = Vec::new();

    while advance(&mut perms) {
        if !ctx.take_branch() {
            break;
        }
        let cloned = plan.clone_plan()?;
        let mut alt = cloned.plan;
        for (run, perm) in runs.iter().zip(&perms) {
            let nodes: Vec<NodeId> = run.iter().map(|id| cloned.id_map[id]).collect();
            reorder(&mut alt, &nodes, perm)?;
        }
        alternatives.push(RuleOutput::new(alt, true));
    }

    tracing::trace!(runs = runs.len(), alternatives = alternatives.len(), "loop permutations");
    let mut out = Vec::with_capacity(alternatives.len() + 1);
    out.push(RuleOutput::unchanged(plan));
    out.extend(alternatives);
    Ok(out)
}

/// Maximal chains of directly stacked loops, leaves first, in which no loop
/// reads a variable another loop of the chain sets.
fn adjacent_runs(plan: &Plan) -> Result<Vec<Vec<NodeId>>> {
    let mut seen = BTreeSet::new();
    let mut runs = Vec::new();

    for top in plan.find_nodes_of_type(&LOOPS, true) {
        if seen.contains(&top) {
            continue;
        }
        let mut run = vec![top];
        seen.insert(top);
        let mut cur = top;
        while let [dep] = plan.dependencies(cur)? {
            let dep = *dep;
            if !LOOPS.contains(&plan.node_type(dep)?) || single_parent(plan, dep)?.is_none() {
                break;
            }
            seen.insert(dep);
            run.push(dep);
            cur = dep;
        }
        if run.len() < 2 || single_parent(plan, top)?.is_none() {
            continue;
        }
        run.reverse();

        let mut set = BTreeSet::new();
        for &id in &run {
            set.extend(plan.kind(id)?.variables_set_here());
        }
        let mut independent = true;
        for &id in &run {
            if plan.variables_used_here(id)?.iter().any(|v| set.contains(v)) {
                independent = false;
                break;
            }
        }
        if independent {
            runs.push(run);
        }
    }
    Ok(runs)
}

/// Step the tuple of permutations like an odometer. False once every
/// combination has been produced.
fn advance(perms: &mut [Vec<usize>]) -> bool {
    for p in perms.iter_mut() {
        if next_permutation(p) {
            return true;
        }
    }
    false
}

/// Lexicographic successor; wraps to the identity and returns false after
/// the last permutation.
fn next_permutation(p: &mut [usize]) -> bool {
    if p.len() < 2 {
        return false;
    }
    let Some(i) = (0..p.len() - 1).rev().find(|&i| p[i] < p[i + 1]) else {
        p.reverse();
        return false;
    };
    let j = (i + 1..p.len()).rev().find(|&j| p[j] > p[i]).unwrap_or(i + 1);
    p.swap(i, j);
    p[i + 1..].reverse();
    true
}

/// Re-stack `nodes` (leaves first) so that position `j` holds
/// `nodes[perm[j]]`.
fn reorder(plan: &mut Plan, nodes: &[NodeId], perm: &[usize]) -> Result<()> {
    let (Some(&top), false) = (nodes.last(), perm.iter().enumerate().all(|(j, p)| j == *p)) else {
        return Ok(());
    };
    let Some(parent) = single_parent(plan, top)? else {
        return Ok(());
    };
    for &id in nodes.iter().rev() {
        plan.unlink_node(id, false)?;
    }
    for &p in perm {
        plan.insert_dependency(parent, nodes[p])?;
    }
    Ok(())
}
