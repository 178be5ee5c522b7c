//! Storage and topology collaborators.
//!
//! The optimizer never talks to real storage. Index capabilities, document
//! counts and shard layout come from these traits; `MemoryCatalog` is the
//! in-memory implementation used by the planner, the CLI and the tests.

use std::collections::BTreeMap;

use quarry_core::expr::{AttributeComparison, ComparisonOp};
use quarry_core::hash::hash_serde;
use quarry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    /// Dotted attribute paths, in index order.
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    /// Sorted (skiplist-like) indexes answer ranges and deliver order; hash
    /// indexes need equality on every field.
    #[serde(default)]
    pub sorted: bool,
    /// Fraction of distinct values, in (0, 1].
    #[serde(default = "default_selectivity")]
    pub selectivity: f64,
}

fn default_selectivity() -> f64 {
    1.0
}

impl IndexDescriptor {
    pub fn hash(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
            sparse: false,
            sorted: false,
            selectivity: 1.0,
        }
    }

    pub fn sorted(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            sorted: true,
            ..Self::hash(name, fields)
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.selectivity = 1.0;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn with_selectivity(mut self, selectivity: f64) -> Self {
        self.selectivity = selectivity;
        self
    }
}

/// How an index serves a conjunction of comparisons.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSupport {
    pub estimated_items: f64,
    pub estimated_cost: f64,
    /// Positions (in the input slice) of the comparisons the index evaluates.
    pub covered: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortSupport {
    pub reverse: bool,
    pub estimated_cost: f64,
}

/// Index and cardinality information for collections.
pub trait IndexCatalog {
    fn indexes(&self, collection: &str) -> Vec<IndexDescriptor>;

    fn document_count(&self, collection: &str) -> u64;

    fn find_index(&self, collection: &str, name: &str) -> Option<IndexDescriptor> {
        self.indexes(collection).into_iter().find(|i| i.name == name)
    }

    /// Can `index` evaluate (part of) `conditions`, all on one variable?
    fn supports_filter_condition(
        &self,
        collection: &str,
        index: &IndexDescriptor,
        conditions: &[AttributeComparison],
    ) -> Option<FilterSupport> {
        default_filter_support(self.document_count(collection), index, conditions)
    }

    /// Can a full scan of `index` deliver rows in the order of `sort`
    /// (dotted path, ascending), given that the first `equality_prefix`
    /// index fields are fixed by equality conditions?
    fn supports_sort_condition(
        &self,
        collection: &str,
        index: &IndexDescriptor,
        sort: &[(String, bool)],
        equality_prefix: usize,
    ) -> Option<SortSupport> {
        default_sort_support(self.document_count(collection), index, sort, equality_prefix)
    }
}

/// Cluster layout.
pub trait Topology {
    fn is_coordinator(&self) -> bool;

    /// Number of shards of `collection`; 0 for unknown collections.
    fn shard_count(&self, collection: &str) -> usize;

    fn shard_keys(&self, collection: &str) -> Vec<String>;

    fn uses_default_sharding(&self, collection: &str) -> bool {
        self.shard_keys(collection) == ["_key"]
    }

    /// Shard owning the documents whose shard-key attributes equal `values`.
    fn responsible_shard(&self, collection: &str, values: &[Value]) -> Result<String> {
        let shards = self.shard_count(collection).max(1);
        let bucket = hash_serde(&values)?.bucket(shards);
        Ok(format!("{collection}:s{bucket}"))
    }
}

/// Classic single-server deployment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleServer;

impl Topology for SingleServer {
    fn is_coordinator(&self) -> bool {
        false
    }

    fn shard_count(&self, _collection: &str) -> usize {
        1
    }

    fn shard_keys(&self, _collection: &str) -> Vec<String> {
        vec!["_key".to_string()]
    }
}

pub(crate) fn default_filter_support(
    document_count: u64,
    index: &IndexDescriptor,
    conditions: &[AttributeComparison],
) -> Option<FilterSupport> {
    let mut covered = Vec::new();
    let mut equality_fields = 0usize;
    let mut range_sides = 0usize;
    let mut lookups = 1.0f64;

    for field in &index.fields {
        let candidates: Vec<(usize, &AttributeComparison)> = conditions
            .iter()
            .enumerate()
            .filter(|(_, c)| c.dotted_path() == *field)
            .collect();

        if let Some((pos, cmp)) = candidates.iter().find(|(_, c)| c.op.is_equality()) {
            if index.sparse && cmp.value.is_null() {
                return None;
            }
            if cmp.op == ComparisonOp::In {
                let n = cmp.value.as_array().map(|a| a.len()).unwrap_or(1);
                lookups *= n.max(1) as f64;
            }
            covered.push(*pos);
            equality_fields += 1;
            continue;
        }

        if index.sorted {
            for (pos, cmp) in candidates.iter().filter(|(_, c)| c.op.is_range()) {
                if index.sparse && cmp.value.is_null() {
                    return None;
                }
                covered.push(*pos);
                range_sides += 1;
            }
        }
        break;
    }

    let all_equal = equality_fields == index.fields.len();
    if !index.sorted && !all_equal {
        return None;
    }
    if covered.is_empty() {
        return None;
    }

    let count = document_count.max(1) as f64;
    let mut items = if all_equal {
        if index.unique {
            lookups
        } else {
            lookups / index.selectivity.clamp(f64::EPSILON, 1.0)
        }
    } else {
        count * 0.1f64.powi(equality_fields as i32)
    };
    for _ in 0..range_sides {
        items *= 0.5;
    }
    let items = items.clamp(0.0, count);
    let seek = if index.sorted { count.log2().max(1.0) } else { 1.0 };
    covered.sort_unstable();
    Some(FilterSupport {
        estimated_items: items,
        estimated_cost: items + seek * lookups,
        covered,
    })
}

pub(crate) fn default_sort_support(
    document_count: u64,
    index: &IndexDescriptor,
    sort: &[(String, bool)],
    equality_prefix: usize,
) -> Option<SortSupport> {
    if !index.sorted || index.sparse || sort.is_empty() {
        return None;
    }
    let ascending = sort[0].1;
    if sort.iter().any(|(_, asc)| *asc != ascending) {
        return None;
    }
    let matches_at = |start: usize| {
        sort.len() + start <= index.fields.len()
            && sort
                .iter()
                .zip(&index.fields[start..])
                .all(|((path, _), field)| path == field)
    };
    let prefix = equality_prefix.min(index.fields.len());
    if !(0..=prefix).any(matches_at) {
        return None;
    }
    let count = document_count.max(1) as f64;
    Some(SortSupport {
        reverse: !ascending,
        estimated_cost: count + count.log2().max(1.0),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    #[serde(default)]
    pub document_count: u64,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_shard_keys")]
    pub shard_keys: Vec<String>,
}

fn default_shards() -> usize {
    1
}

fn default_shard_keys() -> Vec<String> {
    vec!["_key".to_string()]
}

impl CollectionInfo {
    pub fn new(document_count: u64) -> Self {
        Self {
            document_count,
            indexes: Vec::new(),
            shards: 1,
            shard_keys: default_shard_keys(),
        }
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_shards(mut self, shards: usize, keys: &[&str]) -> Self {
        self.shards = shards;
        self.shard_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

/// Catalog snapshot held in memory; doubles as both collaborators.
///
/// ```yaml
/// coordinator: true
/// collections:
///   users:
///     document_count: 10000
///     shards: 3
///     indexes:
///       - { name: idx_age, fields: [age], sorted: true }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryCatalog {
    #[serde(default)]
    pub coordinator: bool,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionInfo>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coordinator(mut self, coordinator: bool) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_collection(mut self, name: impl Into<String>, info: CollectionInfo) -> Self {
        self.collections.insert(name.into(), info);
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionInfo> {
        self.collections.get(name)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| Error::Config(format!("catalog: {e}")))
    }
}

impl IndexCatalog for MemoryCatalog {
    fn indexes(&self, collection: &str) -> Vec<IndexDescriptor> {
        self.collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    fn document_count(&self, collection: &str) -> u64 {
        self.collections
            .get(collection)
            .map(|c| c.document_count)
            .unwrap_or(0)
    }
}

impl Topology for MemoryCatalog {
    fn is_coordinator(&self) -> bool {
        self.coordinator
    }

    fn shard_count(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.shards).unwrap_or(0)
    }

    fn shard_keys(&self, collection: &str) -> Vec<String> {
        self.collections
            .get(collection)
            .map(|c| c.shard_keys.clone())
            .unwrap_or_else(default_shard_keys)
    }
}
