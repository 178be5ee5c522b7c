//! Per-node cost estimation.
//!
//! Each node derives its estimate from its first dependency's estimate. The
//! numbers only need to rank alternative plans of the same query; every
//! tunable lives in [`CostConstants`].

use std::collections::BTreeMap;

use quarry_core::id::NodeId;
use quarry_core::{CostConstants, Result};
use serde::{Deserialize, Serialize};

use crate::node::{GatherSortMode, NodeKind};
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Rows produced by the node.
    pub rows: u64,
    /// Accumulated cost of producing them.
    pub cpu: f64,
}

impl CostEstimate {
    pub const SINGLE_ROW: CostEstimate = CostEstimate { rows: 1, cpu: 1.0 };
}

pub fn estimate_plan(plan: &Plan, costs: &CostConstants) -> Result<CostEstimate> {
    let mut memo = BTreeMap::new();
    estimate_node(plan, plan.root()?, costs, &mut memo)
}

pub fn estimate_node(
    plan: &Plan,
    id: NodeId,
    costs: &CostConstants,
    memo: &mut BTreeMap<NodeId, CostEstimate>,
) -> Result<CostEstimate> {
    if let Some(e) = memo.get(&id) {
        return Ok(*e);
    }
    let node = plan.node(id)?;
    let input = match node.first_dependency() {
        Some(dep) => estimate_node(plan, dep, costs, memo)?,
        None => CostEstimate::SINGLE_ROW,
    };
    let rows = input.rows as f64;

    let estimate = match node.kind() {
        NodeKind::Singleton => CostEstimate::SINGLE_ROW,
        NodeKind::EnumerateCollection(scan) => {
            let count = scan.document_count as f64;
            let penalty = if scan.random {
                costs.random_scan_penalty
            } else {
                1.0
            };
            CostEstimate {
                rows: to_rows(rows * count),
                cpu: input.cpu + rows * count * penalty + 1.0,
            }
        }
        NodeKind::IndexScan(scan) => CostEstimate {
            rows: to_rows(rows * scan.estimated_items.ceil()),
            cpu: input.cpu + rows * scan.estimated_cost,
        },
        NodeKind::EnumerateList { in_var, .. } => {
            let length = plan
                .get_var_set_by(*in_var)
                .and_then(|setter| plan.kind(setter).ok())
                .and_then(|k| k.expression())
                .and_then(|e| e.constant_value())
                .and_then(|v| v.as_array().map(|a| a.len() as u64))
                .unwrap_or(costs.enumerate_list_length);
            let out = rows * length as f64;
            CostEstimate {
                rows: to_rows(out),
                cpu: input.cpu + out,
            }
        }
        NodeKind::Filter { .. } => CostEstimate {
            rows: to_rows(rows * costs.filter_selectivity),
            cpu: input.cpu + rows,
        },
        NodeKind::Limit { offset, limit } => {
            let skipped = (*offset).min(input.rows);
            let out = (*limit).min(input.rows - skipped);
            CostEstimate {
                rows: out,
                cpu: input.cpu + skipped as f64 * costs.limit_skip_cost + out as f64,
            }
        }
        NodeKind::Calculation { .. }
        | NodeKind::Return { .. }
        | NodeKind::SubqueryStart { .. }
        | NodeKind::Insert(_)
        | NodeKind::Remove(_)
        | NodeKind::Update(_)
        | NodeKind::Replace(_) => CostEstimate {
            rows: input.rows,
            cpu: input.cpu + rows,
        },
        NodeKind::Subquery { body, .. } => {
            let inner = estimate_node(plan, *body, costs, memo)?;
            CostEstimate {
                rows: input.rows,
                cpu: input.cpu + rows * inner.cpu,
            }
        }
        NodeKind::SubqueryEnd { .. } => {
            let outer_rows = match matching_start(plan, id)? {
                Some(start) => match plan.first_dependency(start)? {
                    Some(before) => estimate_node(plan, before, costs, memo)?.rows,
                    None => 1,
                },
                None => input.rows,
            };
            CostEstimate {
                rows: outer_rows,
                cpu: input.cpu + rows,
            }
        }
        NodeKind::Sort { limit, .. } => CostEstimate {
            rows: input.rows,
            cpu: input.cpu + sort_cost(input.rows, *limit),
        },
        NodeKind::Collect(c) => {
            let out = if c.groups.is_empty() {
                1
            } else {
                to_rows(rows * costs.group_factor(c.groups.len())).max(1)
            };
            CostEstimate {
                rows: out,
                cpu: input.cpu + rows,
            }
        }
        NodeKind::NoResults => CostEstimate {
            rows: 0,
            cpu: input.cpu + 0.5,
        },
        NodeKind::Scatter { shards, .. } => CostEstimate {
            rows: input.rows,
            cpu: input.cpu + rows * (*shards).max(1) as f64 * costs.remote_row_cost,
        },
        NodeKind::Remote | NodeKind::Distribute { .. } => CostEstimate {
            rows: input.rows,
            cpu: input.cpu + rows * costs.remote_row_cost,
        },
        NodeKind::Gather(g) => {
            let merge = match g.sort_mode {
                GatherSortMode::Default => 1.0,
                GatherSortMode::MinElement | GatherSortMode::Heap => {
                    1.0 + (g.shards.max(2) as f64).log2()
                }
            };
            CostEstimate {
                rows: input.rows,
                cpu: input.cpu + rows * costs.gather_row_cost * merge,
            }
        }
    };

    memo.insert(id, estimate);
    Ok(estimate)
}

fn to_rows(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v.round() as u64
    } else {
        0
    }
}

/// `n·log2(n)` for a full sort, `n·log2(m)` for a heap bounded by `m`.
pub fn sort_cost(n: u64, limit: Option<u64>) -> f64 {
    let nf = n as f64;
    match limit {
        Some(m) if m < n => nf * (m.max(2) as f64).log2(),
        _ if n <= 3 => nf,
        _ => nf * nf.log2(),
    }
}

/// Should a sort over `n` rows feeding a limit of `m` use a bounded heap?
pub fn use_heap_sort(n: u64, m: u64, costs: &CostConstants) -> bool {
    if n < costs.heap_sort_min_input || m >= n {
        return false;
    }
    let (n, m) = (n as f64, m.max(1) as f64);
    let lg_m = m.log2().max(1.0);
    costs.heap_sort_factor * n * lg_m + m * lg_m < n * n.log2()
}

/// Merge strategy for a gather over `shards` shards.
pub fn gather_sort_mode(shards: usize, sorted: bool, costs: &CostConstants) -> GatherSortMode {
    if !sorted {
        GatherSortMode::Default
    } else if shards >= costs.heap_merge_min_shards {
        GatherSortMode::Heap
    } else {
        GatherSortMode::MinElement
    }
}

/// The `SubqueryStart` opening the spliced subquery closed by `end`.
fn matching_start(plan: &Plan, end: NodeId) -> Result<Option<NodeId>> {
    let mut depth = 0usize;
    let mut cur = plan.first_dependency(end)?;
    while let Some(id) = cur {
        match plan.kind(id)? {
            NodeKind::SubqueryEnd { .. } => depth += 1,
            NodeKind::SubqueryStart { .. } if depth == 0 => return Ok(Some(id)),
            NodeKind::SubqueryStart { .. } => depth -= 1,
            _ => {}
        }
        cur = plan.first_dependency(id)?;
    }
    Ok(None)
}
