//! Optimizer configuration that callers can serialize/deserialize.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Disabling this pseudo-rule name disables every rule that can be disabled.
pub const ALL_RULES: &str = "all";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Once more candidate plans than this are alive, only required rules run.
    pub max_candidate_plans: usize,

    /// Start in required-only mode right away.
    pub required_rules_only: bool,

    /// Rule names that must not run (unless forced). `"all"` matches every
    /// rule that can be disabled.
    pub disabled_rules: BTreeSet<String>,

    /// Rule names that run even when disabled or in required-only mode.
    pub forced_rules: BTreeSet<String>,

    /// How often one candidate may restart the same level before reruns are
    /// ignored.
    pub max_level_reruns: usize,

    pub costs: CostConstants,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_candidate_plans: 128,
            required_rules_only: false,
            disabled_rules: BTreeSet::new(),
            forced_rules: BTreeSet::new(),
            max_level_reruns: 8,
            costs: CostConstants::default(),
        }
    }
}

/// Hand-tuned cost heuristics. These are policy: every value can be
/// overridden and none of them is guaranteed stable across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConstants {
    /// Fraction of rows a filter lets through. 1.0 keeps estimates pessimistic.
    pub filter_selectivity: f64,
    /// Assumed length of lists iterated by an enumerate-list node.
    pub enumerate_list_length: u64,
    /// Cost factor applied to random-order collection scans.
    pub random_scan_penalty: f64,
    /// Per-row cost of skipping rows in a limit's offset.
    pub limit_skip_cost: f64,
    /// Sorts with fewer input rows never switch to a heap.
    pub heap_sort_min_input: u64,
    /// Weight of the heap maintenance term in the heap-vs-full-sort decision.
    pub heap_sort_factor: f64,
    /// Sorted gathers over at least this many shards merge with a heap.
    pub heap_merge_min_shards: usize,
    /// Per-row cost of shipping a row across a remote boundary.
    pub remote_row_cost: f64,
    /// Per-row cost of a gather collecting shard results.
    pub gather_row_cost: f64,
    /// Fraction of input rows that survive a collect, indexed by group count
    /// (1, 2, 3, more).
    pub collect_group_factors: Vec<f64>,
    /// Expressions longer than this are not compared for duplicates.
    pub max_stringify_len: usize,
}

impl Default for CostConstants {
    fn default() -> Self {
        Self {
            filter_selectivity: 1.0,
            enumerate_list_length: 100,
            random_scan_penalty: 1.005,
            limit_skip_cost: 0.000_001,
            heap_sort_min_input: 100,
            heap_sort_factor: 0.25,
            heap_merge_min_shards: 5,
            remote_row_cost: 1.0,
            gather_row_cost: 1.0,
            collect_group_factors: vec![0.1, 0.25, 0.4, 0.5],
            max_stringify_len: 4096,
        }
    }
}

impl CostConstants {
    /// Fraction of rows surviving a collect with `groups` grouping keys.
    pub fn group_factor(&self, groups: usize) -> f64 {
        if groups == 0 || self.collect_group_factors.is_empty() {
            return 0.0;
        }
        let idx = (groups - 1).min(self.collect_group_factors.len() - 1);
        self.collect_group_factors[idx]
    }
}

impl OptimizerConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `QUARRY_MAX_CANDIDATE_PLANS`: candidate cap
    /// - `QUARRY_REQUIRED_RULES_ONLY`: `true`/`1` to start in required-only mode
    /// - `QUARRY_DISABLED_RULES`: comma separated rule names
    /// - `QUARRY_FORCED_RULES`: comma separated rule names
    /// - `QUARRY_MAX_LEVEL_RERUNS`: rerun bound per level
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("QUARRY_MAX_CANDIDATE_PLANS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_candidate_plans = v;
            }
        }

        if let Ok(s) = std::env::var("QUARRY_REQUIRED_RULES_ONLY") {
            cfg.required_rules_only = matches!(s.trim(), "1" | "true" | "yes");
        }

        if let Ok(s) = std::env::var("QUARRY_DISABLED_RULES") {
            cfg.disabled_rules = split_rule_list(&s);
        }

        if let Ok(s) = std::env::var("QUARRY_FORCED_RULES") {
            cfg.forced_rules = split_rule_list(&s);
        }

        if let Ok(s) = std::env::var("QUARRY_MAX_LEVEL_RERUNS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_level_reruns = v;
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_candidate_plans == 0 {
            return Err(Error::Config(
                "max_candidate_plans must be at least 1".to_string(),
            ));
        }
        if self.costs.filter_selectivity < 0.0 || self.costs.filter_selectivity > 1.0 {
            return Err(Error::Config(format!(
                "filter_selectivity must be within [0, 1], got {}",
                self.costs.filter_selectivity
            )));
        }
        Ok(())
    }

    pub fn with_max_candidate_plans(mut self, max: usize) -> Self {
        self.max_candidate_plans = max;
        self
    }

    pub fn disable(mut self, rule: impl Into<String>) -> Self {
        self.disabled_rules.insert(rule.into());
        self
    }

    pub fn force(mut self, rule: impl Into<String>) -> Self {
        self.forced_rules.insert(rule.into());
        self
    }

    pub fn is_disabled(&self, rule: &str) -> bool {
        self.disabled_rules.contains(rule) || self.disabled_rules.contains(ALL_RULES)
    }

    pub fn is_forced(&self, rule: &str) -> bool {
        self.forced_rules.contains(rule)
    }
}

fn split_rule_list(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(|r| r.to_string())
        .collect()
}
