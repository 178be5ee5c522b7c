//! The level-by-level rule scheduler.
//!
//! Every candidate remembers the index of the next rule it has to pass
//! through. Each round picks the lowest level any candidate is still waiting
//! on and drives all waiting candidates (oldest first) through the rules of
//! that level. Branching rules add candidates behind the current one; once
//! the number of live candidates exceeds the configured cap the scheduler
//! stops running optional rules for the rest of the pass.

use std::collections::VecDeque;

use quarry_core::variable::VariableRegistry;
use quarry_core::{Error, OptimizerConfig, Result};
use quarry_plan::catalog::{IndexCatalog, Topology};
use quarry_plan::{verify_plan, CostEstimate, Plan};
use quarry_rules::{Rule, RuleCatalog, RuleContext, RuleOutput};
use serde::Serialize;

use crate::metrics;

/// Counters for one optimization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizerStats {
    /// Candidates ever created, the initial plan included.
    pub plans_created: usize,
    pub rule_invocations: usize,
    pub rules_skipped: usize,
    pub reruns: usize,
    /// Candidates dropped because a rule returned no plan.
    pub pruned: usize,
    /// Required-only mode was active at some point.
    pub required_only: bool,
    pub surviving_candidates: usize,
}

#[derive(Debug)]
pub struct OptimizeResult {
    pub plan: Plan,
    pub cost: CostEstimate,
    pub stats: OptimizerStats,
}

struct Candidate {
    seq: u64,
    plan: Plan,
    next_rule: usize,
    rerun_level: u32,
    reruns: usize,
}

impl Candidate {
    fn successor(&self, seq: u64, plan: Plan) -> Candidate {
        Candidate {
            seq,
            plan,
            next_rule: self.next_rule,
            rerun_level: self.rerun_level,
            reruns: self.reruns,
        }
    }
}

pub struct Optimizer {
    catalog: RuleCatalog,
    config: OptimizerConfig,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            catalog: RuleCatalog::default(),
            config: OptimizerConfig::default(),
        }
    }
}

impl Optimizer {
    /// Fails with `Error::Config` if the configuration names unknown rules.
    pub fn new(catalog: RuleCatalog, config: OptimizerConfig) -> Result<Self> {
        catalog.validate_config(&config)?;
        Ok(Self { catalog, config })
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn optimize(
        &self,
        plan: Plan,
        vars: &mut VariableRegistry,
        indexes: &dyn IndexCatalog,
        topology: &dyn Topology,
    ) -> Result<OptimizeResult> {
        let cap = self.config.max_candidate_plans;
        let mut stats = OptimizerStats {
            plans_created: 1,
            required_only: self.config.required_rules_only,
            ..OptimizerStats::default()
        };
        let mut required_only = self.config.required_rules_only;
        let mut next_seq = 1u64;
        let mut candidates = vec![Candidate {
            seq: 0,
            plan,
            next_rule: 0,
            rerun_level: 0,
            reruns: 0,
        }];
        let mut ctx = RuleContext::new(vars, indexes, topology, &self.config);

        while let Some(level) = self.pending_level(&candidates) {
            let level_start = self.catalog.first_index_of_level(level);
            let level_end = self.catalog.end_of_level(level);
            tracing::debug!(level, candidates = candidates.len(), "entering rule level");

            let (mut waiting, mut done): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|c| c.next_rule < level_end);
            waiting.sort_by_key(|c| c.seq);
            let mut queue: VecDeque<Candidate> = waiting.into();

            while let Some(mut cand) = queue.pop_front() {
                if cand.next_rule >= level_end {
                    done.push(cand);
                    continue;
                }
                let rule = *self.catalog.at(cand.next_rule).ok_or_else(|| {
                    Error::invariant(format!("rule index {} out of range", cand.next_rule))
                })?;
                if cand.rerun_level != level {
                    cand.rerun_level = level;
                    cand.reruns = 0;
                }

                if let Some(reason) = self.skip_reason(&rule, required_only, topology) {
                    tracing::trace!(rule = rule.name, candidate = cand.seq, reason, "rule skipped");
                    stats.rules_skipped += 1;
                    cand.next_rule += 1;
                    queue.push_front(cand);
                    continue;
                }

                let live = done.len() + queue.len() + 1;
                let room = cap.saturating_sub(live);
                let branching = rule.flags.can_create_additional_plans && !required_only;
                let baseline = if branching && !rule.is_mandatory() && room > 0 {
                    Some(cand.plan.clone_plan()?.plan)
                } else {
                    None
                };
                ctx.set_branch_budget(if branching { room } else { 0 });

                let Candidate {
                    seq,
                    plan,
                    next_rule,
                    rerun_level,
                    reruns,
                } = cand;
                let template = Candidate {
                    seq,
                    plan: Plan::new(),
                    next_rule: next_rule + 1,
                    rerun_level,
                    reruns,
                };
                stats.rule_invocations += 1;
                let outputs = (rule.func)(&mut ctx, plan)?;
                ctx.set_branch_budget(0);

                if outputs.is_empty() {
                    tracing::debug!(rule = rule.name, candidate = seq, "candidate pruned");
                    stats.pruned += 1;
                    continue;
                }
                tracing::debug!(
                    rule = rule.name,
                    candidate = seq,
                    outputs = outputs.len(),
                    modified = outputs.iter().any(|o| o.modified),
                    "rule applied"
                );
                let keep_baseline = outputs.iter().all(|o| o.modified);

                let mut produced = Vec::with_capacity(outputs.len() + 1);
                for (i, out) in outputs.into_iter().enumerate() {
                    let RuleOutput {
                        mut plan,
                        modified,
                        rerun,
                    } = out;
                    if modified {
                        plan.record_applied_rule(rule.name);
                    }
                    let seq = if i == 0 {
                        seq
                    } else {
                        stats.plans_created += 1;
                        next_seq += 1;
                        next_seq - 1
                    };
                    let mut next = template.successor(seq, plan);
                    if rerun || (rule.flags.fixed_point && modified) {
                        if next.reruns < self.config.max_level_reruns {
                            next.reruns += 1;
                            next.next_rule = level_start;
                            stats.reruns += 1;
                        } else {
                            tracing::debug!(
                                rule = rule.name,
                                candidate = seq,
                                "rerun limit reached"
                            );
                        }
                    }
                    produced.push(next);
                }
                if let Some(plan) = baseline.filter(|_| keep_baseline) {
                    stats.plans_created += 1;
                    next_seq += 1;
                    produced.push(template.successor(next_seq - 1, plan));
                }

                let mut produced = produced.into_iter();
                if let Some(first) = produced.next() {
                    queue.push_front(first);
                }
                queue.extend(produced);

                let live = done.len() + queue.len();
                if live > cap && !required_only {
                    required_only = true;
                    stats.required_only = true;
                    tracing::info!(
                        live,
                        cap,
                        "candidate cap exceeded; running required rules only"
                    );
                }
            }

            if done.is_empty() {
                return Err(Error::invariant("every candidate plan was pruned"));
            }
            candidates = done;
        }

        stats.surviving_candidates = candidates.len();
        let (plan, cost) = self.select(candidates)?;
        verify_plan(&plan)?;
        tracing::info!(
            cost = cost.cpu,
            rows = cost.rows,
            candidates = stats.surviving_candidates,
            "plan selected"
        );
        metrics::emit_stats(&stats);
        Ok(OptimizeResult { plan, cost, stats })
    }

    /// Lowest level any candidate still has a rule pending in.
    fn pending_level(&self, candidates: &[Candidate]) -> Option<u32> {
        candidates
            .iter()
            .filter_map(|c| self.catalog.at(c.next_rule).map(|r| r.level))
            .min()
    }

    fn skip_reason(
        &self,
        rule: &Rule,
        required_only: bool,
        topology: &dyn Topology,
    ) -> Option<&'static str> {
        if rule.flags.cluster_only && !topology.is_coordinator() {
            return Some("cluster only");
        }
        if rule.is_mandatory() || self.config.is_forced(rule.name) {
            return None;
        }
        if rule.flags.disabled_by_default {
            Some("disabled by default")
        } else if self.config.is_disabled(rule.name) {
            Some("disabled")
        } else if required_only {
            Some("required rules only")
        } else {
            None
        }
    }

    /// Cheapest candidate; equal costs go to the oldest candidate.
    fn select(&self, candidates: Vec<Candidate>) -> Result<(Plan, CostEstimate)> {
        let mut best: Option<(Candidate, CostEstimate)> = None;
        for cand in candidates {
            let cost = cand.plan.estimate_cost(&self.config.costs)?;
            let better = match &best {
                None => true,
                Some((b, bc)) => cost
                    .cpu
                    .total_cmp(&bc.cpu)
                    .then(cand.seq.cmp(&b.seq))
                    .is_lt(),
            };
            if better {
                best = Some((cand, cost));
            }
        }
        best.map(|(c, cost)| (c.plan, cost))
            .ok_or_else(|| Error::invariant("no candidate plan left to select"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_plan::catalog::{CollectionInfo, MemoryCatalog};
    use quarry_plan::{CollectionScan, NodeKind, NodeType};
    use quarry_rules::{single, RuleFlags};

    fn scan_plan(vars: &mut VariableRegistry) -> Plan {
        let x = vars.create_variable("x").id;
        let mut plan = Plan::new();
        let s = plan.create_node(NodeKind::Singleton);
        let scan = plan.create_node(NodeKind::EnumerateCollection(CollectionScan {
            collection: "c".into(),
            out_var: x,
            document_count: 100,
            random: false,
            hint: None,
            restricted_shard: None,
        }));
        plan.add_dependency(scan, s).unwrap();
        let ret = plan.create_node(NodeKind::Return { in_var: x });
        plan.add_dependency(ret, scan).unwrap();
        plan.set_root(ret).unwrap();
        plan
    }

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new().with_collection("c", CollectionInfo::new(100))
    }

    fn limits(plan: &Plan) -> usize {
        plan.find_nodes_of_type(&[NodeType::Limit], false).len()
    }

    fn noop(_ctx: &mut RuleContext<'_>, plan: Plan) -> Result<Vec<RuleOutput>> {
        single(plan, false)
    }

    fn prune(_ctx: &mut RuleContext<'_>, _plan: Plan) -> Result<Vec<RuleOutput>> {
        Ok(Vec::new())
    }

    /// Adds a Limit under the root until there are three.
    fn add_limit(_ctx: &mut RuleContext<'_>, mut plan: Plan) -> Result<Vec<RuleOutput>> {
        if limits(&plan) >= 3 {
            return single(plan, false);
        }
        let root = plan.root()?;
        let limit = plan.create_node(NodeKind::Limit {
            offset: 0,
            limit: 10,
        });
        plan.insert_dependency(root, limit)?;
        single(plan, true)
    }

    /// Every alternative it may create is the plan plus one Limit.
    fn branch(ctx: &mut RuleContext<'_>, plan: Plan) -> Result<Vec<RuleOutput>> {
        let mut out = Vec::new();
        while ctx.take_branch() {
            let mut alt = plan.clone_plan()?.plan;
            let root = alt.root()?;
            let limit = alt.create_node(NodeKind::Limit {
                offset: 0,
                limit: 1,
            });
            alt.insert_dependency(root, limit)?;
            out.push(RuleOutput::new(alt, true));
        }
        out.insert(0, RuleOutput::new(plan, true));
        Ok(out)
    }

    fn optimizer(rules: Vec<Rule>, config: OptimizerConfig) -> Optimizer {
        Optimizer::new(RuleCatalog::new(rules), config).unwrap()
    }

    fn run(opt: &Optimizer) -> Result<OptimizeResult> {
        let mut vars = VariableRegistry::new();
        let plan = scan_plan(&mut vars);
        let cat = catalog();
        opt.optimize(plan, &mut vars, &cat, &cat)
    }

    #[test]
    fn empty_catalog_returns_input() {
        let res = run(&optimizer(Vec::new(), OptimizerConfig::default())).unwrap();
        assert_eq!(res.plan.find_nodes_of_type(&[NodeType::EnumerateCollection], false).len(), 1);
        assert_eq!(res.stats.plans_created, 1);
        assert_eq!(res.stats.surviving_candidates, 1);
    }

    #[test]
    fn fixed_point_rule_reruns_until_unchanged() {
        let rules = vec![
            Rule::new("noop", 10, RuleFlags::DEFAULT, noop),
            Rule::new("add-limit", 10, RuleFlags::DEFAULT.fixed_point(), add_limit),
        ];
        let res = run(&optimizer(rules, OptimizerConfig::default())).unwrap();
        assert_eq!(limits(&res.plan), 3);
        assert_eq!(res.stats.reruns, 3);
        assert_eq!(res.plan.applied_rules(), ["add-limit".to_string()]);
    }

    #[test]
    fn reruns_are_bounded() {
        let rules = vec![Rule::new("add-limit", 10, RuleFlags::DEFAULT.fixed_point(), add_limit)];
        let mut cfg = OptimizerConfig::default();
        cfg.max_level_reruns = 1;
        let res = run(&optimizer(rules, cfg)).unwrap();
        assert_eq!(limits(&res.plan), 2);
        assert_eq!(res.stats.reruns, 1);
    }

    #[test]
    fn branching_respects_the_cap() {
        let rules = vec![Rule::new("branch", 10, RuleFlags::DEFAULT.creates_plans(), branch)];
        let res = run(&optimizer(rules, OptimizerConfig::default().with_max_candidate_plans(4)))
            .unwrap();
        // three alternatives fill the cap, the baseline goes over it
        assert_eq!(res.stats.surviving_candidates, 5);
        assert!(res.stats.required_only);
        // the Limit(1) alternatives are cheapest; the oldest one wins
        assert_eq!(limits(&res.plan), 1);
    }

    #[test]
    fn cap_of_one_never_branches() {
        let rules = vec![Rule::new("branch", 10, RuleFlags::DEFAULT.creates_plans(), branch)];
        let res = run(&optimizer(rules, OptimizerConfig::default().with_max_candidate_plans(1)))
            .unwrap();
        assert_eq!(res.stats.surviving_candidates, 1);
        assert_eq!(res.stats.plans_created, 1);
        assert!(!res.stats.required_only);
    }

    #[test]
    fn required_only_skips_optional_rules() {
        let rules = vec![
            Rule::new("add-limit", 10, RuleFlags::DEFAULT, add_limit),
            Rule::new("must", 20, RuleFlags::DEFAULT.mandatory(), add_limit),
        ];
        let mut cfg = OptimizerConfig::default();
        cfg.required_rules_only = true;
        let res = run(&optimizer(rules, cfg)).unwrap();
        assert_eq!(limits(&res.plan), 1);
        assert_eq!(res.stats.rules_skipped, 1);
    }

    #[test]
    fn forced_rule_overrides_disable_all() {
        let rules = vec![
            Rule::new("add-limit", 10, RuleFlags::DEFAULT, add_limit),
            Rule::new("other", 10, RuleFlags::DEFAULT.off_by_default(), add_limit),
        ];
        let cfg = OptimizerConfig::default().disable("all").force("other");
        let res = run(&optimizer(rules, cfg)).unwrap();
        assert_eq!(res.plan.applied_rules(), ["other".to_string()]);
    }

    #[test]
    fn cluster_rules_need_a_coordinator() {
        let rules = vec![Rule::new(
            "cluster",
            10,
            RuleFlags::DEFAULT.cluster_only().mandatory(),
            add_limit,
        )];
        let res = run(&optimizer(rules, OptimizerConfig::default())).unwrap();
        assert_eq!(limits(&res.plan), 0);
        assert_eq!(res.stats.rules_skipped, 1);
    }

    #[test]
    fn pruning_every_candidate_is_an_error() {
        let rules = vec![Rule::new("prune", 10, RuleFlags::DEFAULT, prune)];
        let err = run(&optimizer(rules, OptimizerConfig::default())).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn unknown_rule_in_config_is_rejected() {
        let cfg = OptimizerConfig::default().disable("nope");
        let err = Optimizer::new(RuleCatalog::default(), cfg).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn selection_is_deterministic() {
        let opt = Optimizer::default();
        let a = run(&opt).unwrap();
        let b = run(&opt).unwrap();
        assert_eq!(a.plan.fingerprint().unwrap(), b.plan.fingerprint().unwrap());
        assert_eq!(a.stats, b.stats);
    }
}
