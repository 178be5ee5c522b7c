//! Properties every plan and every optimizer run must hold.

use quarry::core::expr::Expr;
use quarry::core::id::NodeId;
use quarry::core::variable::VariableRegistry;
use quarry::plan::{
    verify_plan, CollectionInfo, CollectionScan, IndexDescriptor, MemoryCatalog, NodeKind,
    NodeType, Plan,
};
use quarry::rules::{RuleCatalog, RuleContext};
use quarry::{optimize_yaml, Error, OptimizerConfig, PlannerError};

fn catalog() -> MemoryCatalog {
    MemoryCatalog::new()
        .with_collection(
            "coll",
            CollectionInfo::new(10_000).with_index(IndexDescriptor::hash("idx_a", &["a"])),
        )
        .with_collection("other", CollectionInfo::new(500))
}

const QUERIES: &[&str] = &[
    r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: sort, keys: [ { expr: "x.b" } ] }
  - { op: sort, keys: [ { expr: "x.b" } ] }
  - { op: return, expr: "x" }
"#,
    r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: filter, expr: "x.a == 1 && x.b > 2" }
  - { op: return, expr: "x" }
"#,
    r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: for, var: y, collection: other }
  - { op: filter, expr: "x.a == y.a" }
  - { op: sort, keys: [ { expr: "y.n", desc: true } ] }
  - { op: limit, count: 20 }
  - { op: return, expr: "{ x: x, y: y }" }
"#,
];

/// Singleton -> EnumerateCollection -> Limit -> Return over `rows` documents.
fn limited_scan(vars: &mut VariableRegistry, rows: u64) -> (Plan, NodeId) {
    let x = vars.create_variable("x").id;
    let mut plan = Plan::new();
    let s = plan.create_node(NodeKind::Singleton);
    let scan = plan.create_node(NodeKind::EnumerateCollection(CollectionScan {
        collection: "coll".into(),
        out_var: x,
        document_count: rows,
        random: false,
        hint: None,
        restricted_shard: None,
    }));
    let limit = plan.create_node(NodeKind::Limit {
        offset: 0,
        limit: 10,
    });
    let ret = plan.create_node(NodeKind::Return { in_var: x });
    plan.add_dependency(scan, s).unwrap();
    plan.add_dependency(limit, scan).unwrap();
    plan.add_dependency(ret, limit).unwrap();
    plan.set_root(ret).unwrap();
    (plan, limit)
}

#[test]
fn optimized_plans_pass_verification() {
    for q in QUERIES {
        let out = optimize_yaml(q, &catalog(), OptimizerConfig::default()).unwrap();
        verify_plan(&out.plan).unwrap();
        assert_eq!(out.plan.node_type(out.plan.root().unwrap()).unwrap(), NodeType::Return);
    }
}

#[test]
fn optimization_is_deterministic() {
    for q in QUERIES {
        let a = optimize_yaml(q, &catalog(), OptimizerConfig::default()).unwrap();
        let b = optimize_yaml(q, &catalog(), OptimizerConfig::default()).unwrap();
        assert_eq!(a.plan.fingerprint().unwrap(), b.plan.fingerprint().unwrap());
        assert_eq!(a.stats, b.stats);
        assert_eq!(a.cost, b.cost);
    }
}

#[test]
fn optimized_plans_are_a_fixed_point() {
    let catalog = catalog();
    let rules = RuleCatalog::default();
    let config = OptimizerConfig::default();

    for q in &QUERIES[..2] {
        let mut out = optimize_yaml(q, &catalog, config.clone()).unwrap();
        for rule in rules.iter().filter(|r| !r.flags.cluster_only) {
            let mut ctx = RuleContext::new(&mut out.vars, &catalog, &catalog, &config);
            let copy = out.plan.clone_plan().unwrap().plan;
            let outputs = (rule.func)(&mut ctx, copy).unwrap();
            assert!(
                outputs.iter().all(|o| !o.modified),
                "{} still modifies the plan",
                rule.name
            );
        }
    }
}

#[test]
fn selected_plan_is_never_costlier_than_unoptimized() {
    let catalog = catalog();
    for q in QUERIES {
        let best = optimize_yaml(q, &catalog, OptimizerConfig::default()).unwrap();
        let mut config = OptimizerConfig::default().disable("all");
        config.required_rules_only = true;
        let plain = optimize_yaml(q, &catalog, config).unwrap();
        assert!(best.cost.cpu <= plain.cost.cpu, "{q}");
    }
}

#[test]
fn removing_a_limit_never_lowers_the_estimate() {
    let mut vars = VariableRegistry::new();
    let (mut plan, limit) = limited_scan(&mut vars, 1_000);
    let costs = OptimizerConfig::default().costs;

    let with_limit = plan.estimate_cost(&costs).unwrap();
    assert_eq!(with_limit.rows, 10);

    plan.unlink_node(limit, false).unwrap();
    let without = plan.estimate_cost(&costs).unwrap();
    assert_eq!(without.rows, 1_000);
    assert!(without.cpu > with_limit.cpu);
}

#[test]
fn clones_are_independent_and_densely_numbered() {
    let mut vars = VariableRegistry::new();
    let (plan, _) = limited_scan(&mut vars, 100);
    let before = plan.fingerprint().unwrap();

    let cloned = plan.clone_plan().unwrap();
    let mut copy = cloned.plan;
    let ids: Vec<u64> = copy.reachable_nodes().iter().map(|id| id.get()).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=plan.len() as u64).collect::<Vec<_>>());
    assert_eq!(copy.fingerprint().unwrap(), before);

    let limit = copy.find_nodes_of_type(&[NodeType::Limit], true)[0];
    copy.unlink_node(limit, false).unwrap();
    assert_eq!(plan.fingerprint().unwrap(), before);
    assert_ne!(copy.fingerprint().unwrap(), before);
}

#[test]
fn unlinking_a_join_point_is_refused() {
    let mut vars = VariableRegistry::new();
    let (mut plan, limit) = limited_scan(&mut vars, 100);
    let extra = plan.create_node(NodeKind::Singleton);
    plan.add_dependency(limit, extra).unwrap();

    assert!(matches!(plan.unlink_node(limit, false), Err(Error::Invariant(_))));
}

#[test]
fn reading_an_undefined_variable_fails_verification() {
    let mut vars = VariableRegistry::new();
    let (mut plan, limit) = limited_scan(&mut vars, 100);
    let ghost = vars.create_variable("ghost").id;
    let calc = plan.create_node(NodeKind::Calculation {
        out_var: vars.create_temporary().id,
        expr: Expr::reference(ghost),
    });
    plan.insert_after(limit, calc).unwrap();

    assert!(matches!(verify_plan(&plan), Err(Error::Invariant(_))));
}

#[test]
fn unusable_forced_index_is_an_error() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll, index: idx_a, force_index: true }
  - { op: filter, expr: "x.b == 1" }
  - { op: return, expr: "x" }
"#;
    let err = optimize_yaml(q, &catalog(), OptimizerConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        PlannerError::Plan(Error::ForcedIndexUnusable { ref index, .. }) if index == "idx_a"
    ));
}

#[test]
fn disabled_index_rule_keeps_the_full_scan() {
    let q = r#"
steps:
  - { op: for, var: x, collection: coll }
  - { op: filter, expr: "x.a == 1" }
  - { op: return, expr: "x" }
"#;
    let config = OptimizerConfig::default().disable("use-indexes");
    let out = optimize_yaml(q, &catalog(), config).unwrap();
    assert_eq!(
        out.plan
            .find_nodes_of_type(&[NodeType::IndexScan], true)
            .len(),
        0
    );
    assert_eq!(
        out.plan
            .find_nodes_of_type(&[NodeType::EnumerateCollection], true)
            .len(),
        1
    );
    assert_eq!(out.plan.find_nodes_of_type(&[NodeType::Filter], true).len(), 1);
}

#[test]
fn applied_rules_are_recorded_once_in_order() {
    let out = optimize_yaml(QUERIES[1], &catalog(), OptimizerConfig::default()).unwrap();
    let applied = out.plan.applied_rules();
    let mut unique = applied.to_vec();
    unique.dedup();
    assert_eq!(unique.len(), applied.len());
    let split = applied.iter().position(|r| r == "split-filters").unwrap();
    let index = applied.iter().position(|r| r == "use-indexes").unwrap();
    assert!(split < index);
}
