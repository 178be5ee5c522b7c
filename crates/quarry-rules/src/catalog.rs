//! The registry of optimizer rules, ordered by level.

use std::collections::BTreeSet;

use quarry_core::{Error, OptimizerConfig, Result};

use crate::rule::{Rule, RuleFlags};
use crate::rules::{
    calculations, cluster, collect, enumerations, filters, indexes, sorts, subquery,
};

const D: RuleFlags = RuleFlags::DEFAULT;

/// Every built-in rule, in registration order.
const BUILTIN: &[Rule] = &[
    Rule::new("remove-unnecessary-filters", 100, D, filters::remove_unnecessary_filters),
    Rule::new("split-filters", 100, D, filters::split_filters),
    Rule::new(
        "move-calculations-up",
        100,
        D.fixed_point(),
        calculations::move_calculations_up,
    ),
    Rule::new("move-filters-up", 100, D, filters::move_filters_up),
    Rule::new("replace-or-with-in", 100, D, filters::replace_or_with_in),
    Rule::new("remove-redundant-or", 100, D, filters::remove_redundant_or),
    Rule::new(
        "remove-redundant-calculations",
        100,
        D,
        calculations::remove_redundant_calculations,
    ),
    Rule::new("remove-collect-variables", 100, D, collect::remove_collect_variables),
    Rule::new(
        "remove-data-modification-out-variables",
        100,
        D,
        collect::remove_data_modification_out_variables,
    ),
    Rule::new("remove-sort-rand", 100, D, sorts::remove_sort_rand),
    Rule::new("remove-redundant-sorts", 200, D, sorts::remove_redundant_sorts),
    Rule::new(
        "remove-unnecessary-calculations",
        200,
        D.fixed_point(),
        calculations::remove_unnecessary_calculations,
    ),
    Rule::new(
        "interchange-adjacent-enumerations",
        300,
        D.creates_plans(),
        enumerations::interchange_adjacent_enumerations,
    ),
    Rule::new("use-indexes", 400, D.creates_plans(), indexes::use_indexes),
    Rule::new(
        "remove-filters-covered-by-index",
        400,
        D,
        indexes::remove_filters_covered_by_index,
    ),
    Rule::new("use-index-for-sort", 400, D, indexes::use_index_for_sort),
    Rule::new("sort-limit", 400, D, sorts::sort_limit),
    Rule::new(
        "remove-unnecessary-calculations-2",
        500,
        D.fixed_point(),
        calculations::remove_unnecessary_calculations,
    ),
    Rule::new(
        "move-calculations-down",
        500,
        D,
        calculations::move_calculations_down,
    ),
    Rule::new("fuse-calculations", 500, D, calculations::fuse_calculations),
    Rule::new(
        "distribute-in-cluster",
        600,
        D.mandatory().cluster_only(),
        cluster::distribute_in_cluster,
    ),
    Rule::new(
        "scatter-in-cluster",
        600,
        D.mandatory().cluster_only(),
        cluster::scatter_in_cluster,
    ),
    Rule::new(
        "distribute-filtercalc-to-cluster",
        610,
        D.cluster_only(),
        cluster::distribute_filtercalc_to_cluster,
    ),
    Rule::new(
        "distribute-sort-to-cluster",
        620,
        D.cluster_only(),
        cluster::distribute_sort_to_cluster,
    ),
    Rule::new(
        "remove-unnecessary-remote-scatter",
        630,
        D.cluster_only(),
        cluster::remove_unnecessary_remote_scatter,
    ),
    Rule::new(
        "undistribute-remove-after-enum-coll",
        635,
        D.cluster_only(),
        cluster::undistribute_remove_after_enum_coll,
    ),
    Rule::new(
        "restrict-to-single-shard",
        640,
        D.cluster_only(),
        cluster::restrict_to_single_shard,
    ),
    Rule::new(
        "parallelize-gather",
        650,
        D.cluster_only(),
        cluster::parallelize_gather,
    ),
    Rule::new(
        "splice-subqueries",
        900,
        D.mandatory(),
        subquery::splice_subqueries,
    ),
];

/// Rules sorted by `(level, registration order)`.
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    rules: Vec<Rule>,
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::new(BUILTIN.to_vec())
    }
}

impl RuleCatalog {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| r.level);
        Self { rules }
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule at `index` of the level-ordered list.
    pub fn at(&self, index: usize) -> Option<&Rule> {
        self.rules.get(index)
    }

    /// Distinct levels, ascending.
    pub fn levels(&self) -> BTreeSet<u32> {
        self.rules.iter().map(|r| r.level).collect()
    }

    /// Index of the first rule with a level of at least `level`.
    pub fn first_index_of_level(&self, level: u32) -> usize {
        self.rules.partition_point(|r| r.level < level)
    }

    /// Index one past the last rule of `level`.
    pub fn end_of_level(&self, level: u32) -> usize {
        self.rules.partition_point(|r| r.level <= level)
    }

    /// Reject unknown rule names in the disabled and forced lists.
    pub fn validate_config(&self, config: &OptimizerConfig) -> Result<()> {
        config.validate()?;
        let named = config.disabled_rules.iter().chain(&config.forced_rules);
        for name in named {
            if name == quarry_core::config::ALL_RULES {
                continue;
            }
            let Some(rule) = self.get(name) else {
                return Err(Error::Config(format!("unknown optimizer rule '{name}'")));
            };
            if rule.is_mandatory() && config.disabled_rules.contains(name) {
                tracing::warn!(rule = %name, "mandatory rule cannot be disabled; ignoring");
            }
        }
        Ok(())
    }
}
