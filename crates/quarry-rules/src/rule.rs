//! Rule descriptors and the context a rule body runs in.

use quarry_core::variable::VariableRegistry;
use quarry_core::{CostConstants, OptimizerConfig, Result};
use quarry_plan::catalog::{IndexCatalog, Topology};
use quarry_plan::Plan;
use serde::Serialize;

/// One plan handed back by a rule.
#[derive(Debug)]
pub struct RuleOutput {
    pub plan: Plan,
    pub modified: bool,
    /// Restart the current level on this plan.
    pub rerun: bool,
}

impl RuleOutput {
    pub fn new(plan: Plan, modified: bool) -> Self {
        Self {
            plan,
            modified,
            rerun: false,
        }
    }

    pub fn unchanged(plan: Plan) -> Self {
        Self::new(plan, false)
    }

    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }
}

/// A rule body. Returning no plan at all prunes the candidate.
pub type RuleFn = fn(&mut RuleContext<'_>, Plan) -> Result<Vec<RuleOutput>>;

/// Convenience for the common single-plan outcome.
pub fn single(plan: Plan, modified: bool) -> Result<Vec<RuleOutput>> {
    Ok(vec![RuleOutput::new(plan, modified)])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuleFlags {
    /// False for rules required for a correct plan.
    pub can_be_disabled: bool,
    /// Runs only when the topology reports a coordinator.
    pub cluster_only: bool,
    /// May return alternative plans.
    pub can_create_additional_plans: bool,
    /// A modifying run restarts the level, until nothing changes.
    pub fixed_point: bool,
    /// Runs only when forced.
    pub disabled_by_default: bool,
}

impl RuleFlags {
    pub const DEFAULT: RuleFlags = RuleFlags {
        can_be_disabled: true,
        cluster_only: false,
        can_create_additional_plans: false,
        fixed_point: false,
        disabled_by_default: false,
    };

    pub const fn mandatory(mut self) -> Self {
        self.can_be_disabled = false;
        self
    }

    pub const fn cluster_only(mut self) -> Self {
        self.cluster_only = true;
        self
    }

    pub const fn creates_plans(mut self) -> Self {
        self.can_create_additional_plans = true;
        self
    }

    pub const fn fixed_point(mut self) -> Self {
        self.fixed_point = true;
        self
    }

    pub const fn off_by_default(mut self) -> Self {
        self.disabled_by_default = true;
        self
    }
}

impl Default for RuleFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub level: u32,
    pub flags: RuleFlags,
    pub func: RuleFn,
}

impl Rule {
    pub const fn new(name: &'static str, level: u32, flags: RuleFlags, func: RuleFn) -> Self {
        Self {
            name,
            level,
            flags,
            func,
        }
    }

    pub fn is_mandatory(&self) -> bool {
        !self.flags.can_be_disabled
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Read-only collaborators plus the per-query variable registry.
pub struct RuleContext<'a> {
    pub variables: &'a mut VariableRegistry,
    pub indexes: &'a dyn IndexCatalog,
    pub topology: &'a dyn Topology,
    pub config: &'a OptimizerConfig,
    branch_budget: usize,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        variables: &'a mut VariableRegistry,
        indexes: &'a dyn IndexCatalog,
        topology: &'a dyn Topology,
        config: &'a OptimizerConfig,
    ) -> Self {
        Self {
            variables,
            indexes,
            topology,
            config,
            branch_budget: 0,
        }
    }

    pub fn costs(&self) -> &CostConstants {
        &self.config.costs
    }

    /// Number of extra plans the current rule invocation may still return.
    pub fn set_branch_budget(&mut self, budget: usize) {
        self.branch_budget = budget;
    }

    pub fn branch_budget(&self) -> usize {
        self.branch_budget
    }

    pub fn may_branch(&self) -> bool {
        self.branch_budget > 0
    }

    /// Claim one extra plan; false once the budget is spent.
    pub fn take_branch(&mut self) -> bool {
        if self.branch_budget == 0 {
            return false;
        }
        self.branch_budget -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_plan::catalog::MemoryCatalog;

    #[test]
    fn flags_compose() {
        let f = RuleFlags::DEFAULT.mandatory().cluster_only();
        assert!(!f.can_be_disabled);
        assert!(f.cluster_only);
        assert!(!f.fixed_point);
    }

    #[test]
    fn branch_budget_runs_out() {
        let mut vars = VariableRegistry::new();
        let cat = MemoryCatalog::new();
        let cfg = OptimizerConfig::default();
        let mut ctx = RuleContext::new(&mut vars, &cat, &cat, &cfg);
        assert!(!ctx.may_branch());
        ctx.set_branch_budget(1);
        assert!(ctx.take_branch());
        assert!(!ctx.take_branch());
    }
}
