//! End-to-end optimizer scenarios: query in, selected plan out.

use quarry::plan::{
    CollectionInfo, GatherParallelism, GatherSortMode, IndexDescriptor, MemoryCatalog, NodeKind,
    NodeType, Plan,
};
use quarry::{optimize_yaml, OptimizerConfig};

/// Node types from the leaf to the root, following first dependencies.
fn shape(plan: &Plan) -> Vec<NodeType> {
    let mut out = Vec::new();
    let mut cur = Some(plan.root().unwrap());
    while let Some(id) = cur {
        out.push(plan.node_type(id).unwrap());
        cur = plan.first_dependency(id).unwrap();
    }
    out.reverse();
    out
}

fn without_calculations(shape: Vec<NodeType>) -> Vec<NodeType> {
    shape
        .into_iter()
        .filter(|t| *t != NodeType::Calculation)
        .collect()
}

fn count(plan: &Plan, t: NodeType) -> usize {
    plan.find_nodes_of_type(&[t], true).len()
}

fn plain_catalog() -> MemoryCatalog {
    MemoryCatalog::new().with_collection("coll", CollectionInfo::new(10_000))
}

fn indexed_catalog() -> MemoryCatalog {
    MemoryCatalog::new().with_collection(
        "coll",
        CollectionInfo::new(10_000).with_index(IndexDescriptor::hash("idx_a", &["a"])),
    )
}

#[test]
fn repeated_sort_is_removed() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: sort, keys: [ { expr: "x.a" } ] }
  - { op: sort, keys: [ { expr: "x.a" } ] }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &plain_catalog(), OptimizerConfig::default()).unwrap();

    assert_eq!(count(&out.plan, NodeType::Sort), 1);
    assert_eq!(
        without_calculations(shape(&out.plan)),
        vec![
            NodeType::Singleton,
            NodeType::EnumerateCollection,
            NodeType::Sort,
            NodeType::Return
        ]
    );
    assert!(out
        .plan
        .applied_rules()
        .iter()
        .any(|r| r == "remove-redundant-sorts"));
}

#[test]
fn filter_covered_by_index_disappears() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: filter, expr: "x.a == 1" }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &indexed_catalog(), OptimizerConfig::default()).unwrap();

    assert_eq!(
        shape(&out.plan),
        vec![NodeType::Singleton, NodeType::IndexScan, NodeType::Return]
    );
    let scan = out.plan.find_nodes_of_type(&[NodeType::IndexScan], true)[0];
    let NodeKind::IndexScan(s) = out.plan.kind(scan).unwrap() else {
        panic!("expected an index scan");
    };
    assert_eq!(s.index.name, "idx_a");
    assert_eq!(s.condition.len(), 1);
    // The full-scan baseline competed and lost.
    assert!(out.stats.surviving_candidates >= 2);
}

#[test]
fn unused_calculation_is_removed() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: let, var: y, expr: "x.a" }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &plain_catalog(), OptimizerConfig::default()).unwrap();
    assert_eq!(
        shape(&out.plan),
        vec![
            NodeType::Singleton,
            NodeType::EnumerateCollection,
            NodeType::Return
        ]
    );
}

#[test]
fn coordinator_scan_runs_on_the_shards() {
    let catalog = MemoryCatalog::new().coordinator(true).with_collection(
        "coll",
        CollectionInfo::new(30_000).with_shards(3, &["_key"]),
    );
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &catalog, OptimizerConfig::default()).unwrap();

    assert_eq!(
        shape(&out.plan),
        vec![
            NodeType::Singleton,
            NodeType::EnumerateCollection,
            NodeType::Remote,
            NodeType::Gather,
            NodeType::Return
        ]
    );
    let g = out.plan.find_nodes_of_type(&[NodeType::Gather], true)[0];
    let NodeKind::Gather(gather) = out.plan.kind(g).unwrap() else {
        panic!("expected a gather");
    };
    assert_eq!(gather.shards, 3);
    assert_eq!(gather.sort_mode, GatherSortMode::Default);
    assert_eq!(gather.parallelism, GatherParallelism::Parallel);
}

#[test]
fn coordinator_sort_is_pushed_to_the_shards() {
    let catalog = MemoryCatalog::new().coordinator(true).with_collection(
        "coll",
        CollectionInfo::new(30_000).with_shards(3, &["_key"]),
    );
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: sort, keys: [ { expr: "x.a" } ] }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &catalog, OptimizerConfig::default()).unwrap();

    assert_eq!(
        without_calculations(shape(&out.plan)),
        vec![
            NodeType::Singleton,
            NodeType::EnumerateCollection,
            NodeType::Sort,
            NodeType::Remote,
            NodeType::Gather,
            NodeType::Return
        ]
    );
    let g = out.plan.find_nodes_of_type(&[NodeType::Gather], true)[0];
    let NodeKind::Gather(gather) = out.plan.kind(g).unwrap() else {
        panic!("expected a gather");
    };
    assert_eq!(gather.elements.len(), 1);
    assert_eq!(gather.sort_mode, GatherSortMode::MinElement);
}

#[test]
fn single_server_never_gets_cluster_nodes() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &plain_catalog(), OptimizerConfig::default()).unwrap();
    for t in [
        NodeType::Scatter,
        NodeType::Gather,
        NodeType::Remote,
        NodeType::Distribute,
    ] {
        assert_eq!(count(&out.plan, t), 0, "{t:?}");
    }
}

#[test]
fn plan_cap_of_one_keeps_a_single_candidate() {
    let catalog = MemoryCatalog::new().with_collection(
        "coll",
        CollectionInfo::new(10_000)
            .with_index(IndexDescriptor::hash("idx_a", &["a"]))
            .with_index(IndexDescriptor::sorted("idx_a_sorted", &["a"])),
    );
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: filter, expr: "x.a == 1" }
  - { op: return, expr: "x" }
"#;

    let capped = optimize_yaml(q, &catalog, OptimizerConfig::default().with_max_candidate_plans(1))
        .unwrap();
    assert_eq!(capped.stats.surviving_candidates, 1);
    assert_eq!(capped.stats.plans_created, 1);
    assert_eq!(count(&capped.plan, NodeType::IndexScan), 1);

    let open = optimize_yaml(q, &catalog, OptimizerConfig::default()).unwrap();
    assert!(open.stats.surviving_candidates > 1);
}

#[test]
fn sorted_index_replaces_sort() {
    let catalog = MemoryCatalog::new().with_collection(
        "coll",
        CollectionInfo::new(10_000).with_index(IndexDescriptor::sorted("idx_a", &["a"])),
    );
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: sort, keys: [ { expr: "x.a" } ] }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &catalog, OptimizerConfig::default()).unwrap();
    assert_eq!(count(&out.plan, NodeType::Sort), 0);
    assert_eq!(count(&out.plan, NodeType::IndexScan), 1);
}

#[test]
fn sort_followed_by_limit_becomes_heap_sort() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: sort, keys: [ { expr: "x.a", desc: true } ] }
  - { op: limit, offset: 5, count: 10 }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &plain_catalog(), OptimizerConfig::default()).unwrap();
    let sort = out.plan.find_nodes_of_type(&[NodeType::Sort], true)[0];
    assert!(matches!(
        out.plan.kind(sort).unwrap(),
        NodeKind::Sort { limit: Some(15), .. }
    ));

    let mut config = OptimizerConfig::default();
    config.costs.heap_sort_min_input = 1_000_000;
    let out = optimize_yaml(q, &plain_catalog(), config).unwrap();
    let sort = out.plan.find_nodes_of_type(&[NodeType::Sort], true)[0];
    assert!(matches!(
        out.plan.kind(sort).unwrap(),
        NodeKind::Sort { limit: None, .. }
    ));
}

#[test]
fn subquery_is_spliced_inline() {
    let q = r#"
steps:
  - { op: for, var: u, collection: coll }
  - op: let
    var: names
    steps:
      - { op: for, var: f, list: "u.friends" }
      - { op: return, expr: "f.name" }
  - { op: return, expr: "{ user: u, names: names }" }
"#;
    let out = optimize_yaml(q, &plain_catalog(), OptimizerConfig::default()).unwrap();
    assert_eq!(count(&out.plan, NodeType::Subquery), 0);
    assert_eq!(count(&out.plan, NodeType::SubqueryStart), 1);
    assert_eq!(count(&out.plan, NodeType::SubqueryEnd), 1);
    assert_eq!(count(&out.plan, NodeType::EnumerateList), 1);
}

fn sharded_catalog() -> MemoryCatalog {
    MemoryCatalog::new().coordinator(true).with_collection(
        "coll",
        CollectionInfo::new(30_000).with_shards(3, &["_key"]),
    )
}

#[test]
fn coordinator_only_calculation_keeps_its_scatter() {
    let q = r#"
steps:
  - { op: let, var: d, expr: "DOCUMENT('coll/1')" }
  - { op: for, var: x, collection: coll }
  - { op: return, expr: "[x, d]" }
"#;
    let out = optimize_yaml(q, &sharded_catalog(), OptimizerConfig::default()).unwrap();

    assert_eq!(
        shape(&out.plan),
        vec![
            NodeType::Singleton,
            NodeType::Calculation,
            NodeType::Scatter,
            NodeType::Remote,
            NodeType::EnumerateCollection,
            NodeType::Calculation,
            NodeType::Remote,
            NodeType::Gather,
            NodeType::Return
        ]
    );
    assert!(!out
        .plan
        .applied_rules()
        .iter()
        .any(|r| r == "remove-unnecessary-remote-scatter"));
}

#[test]
fn insert_fed_by_scan_of_same_collection_is_distributed() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: insert, collection: coll, doc: "x" }
"#;
    let out = optimize_yaml(q, &sharded_catalog(), OptimizerConfig::default()).unwrap();

    assert_eq!(
        shape(&out.plan),
        vec![
            NodeType::Singleton,
            NodeType::EnumerateCollection,
            NodeType::Remote,
            NodeType::Gather,
            NodeType::Distribute,
            NodeType::Remote,
            NodeType::Insert,
            NodeType::Remote,
            NodeType::Gather
        ]
    );
    assert_eq!(count(&out.plan, NodeType::Scatter), 0);
    let d = out.plan.find_nodes_of_type(&[NodeType::Distribute], true)[0];
    assert!(matches!(
        out.plan.kind(d).unwrap(),
        NodeKind::Distribute { create_keys: true, shards: 3, .. }
    ));
}

#[test]
fn remove_fed_by_scan_of_same_collection_stays_on_the_shards() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: filter, expr: "x.a == 1" }
  - { op: remove, collection: coll, key: "x" }
"#;
    let out = optimize_yaml(q, &sharded_catalog(), OptimizerConfig::default()).unwrap();

    assert_eq!(
        shape(&out.plan),
        vec![
            NodeType::Singleton,
            NodeType::EnumerateCollection,
            NodeType::Calculation,
            NodeType::Filter,
            NodeType::Remove,
            NodeType::Remote,
            NodeType::Gather
        ]
    );
    assert_eq!(count(&out.plan, NodeType::Distribute), 0);
    assert!(out
        .plan
        .applied_rules()
        .iter()
        .any(|r| r == "undistribute-remove-after-enum-coll"));
}

#[test]
fn or_of_equalities_is_served_by_one_index_lookup() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: filter, expr: "x.a == 1 || x.a == 2" }
  - { op: return, expr: "x" }
"#;
    let out = optimize_yaml(q, &indexed_catalog(), OptimizerConfig::default()).unwrap();

    assert_eq!(
        shape(&out.plan),
        vec![NodeType::Singleton, NodeType::IndexScan, NodeType::Return]
    );
    let scan = out.plan.find_nodes_of_type(&[NodeType::IndexScan], true)[0];
    let NodeKind::IndexScan(s) = out.plan.kind(scan).unwrap() else {
        panic!("expected an index scan");
    };
    assert_eq!(s.condition.len(), 1);
    assert_eq!(s.condition[0].value, serde_json::json!([1, 2]));
}
