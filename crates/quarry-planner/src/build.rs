//! Lowering a [`Query`] into the initial execution plan.
//!
//! Every scope starts at a Singleton. Expressions that are not a bare
//! variable get a Calculation of their own, so Filter, Sort, Return and the
//! modification nodes only ever read variables. A COLLECT with groups gets a
//! stable Sort on its group inputs in front of it.

use quarry_core::id::{NodeId, VariableId};
use quarry_core::variable::VariableRegistry;
use quarry_core::{Error, Result};
use quarry_plan::catalog::IndexCatalog;
use quarry_plan::{
    AggregateVar, Collect, CollectionScan, GroupVar, Modification, NodeKind, Plan, SortElement,
};

use crate::ast::{
    lookup, AstExpr, ForSource, LetValue, Modify, ModifyKind, Query, Scope, Statement,
};

pub struct PlanBuilder<'a> {
    vars: &'a mut VariableRegistry,
    catalog: &'a dyn IndexCatalog,
    plan: Plan,
}

/// Insertion point of the scope being built.
struct Cursor {
    last: NodeId,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(vars: &'a mut VariableRegistry, catalog: &'a dyn IndexCatalog) -> Self {
        Self {
            vars,
            catalog,
            plan: Plan::new(),
        }
    }

    pub fn build(mut self, query: &Query) -> Result<Plan> {
        let root = self.build_scope(query, &Scope::new(), true)?;
        self.plan.set_root(root)?;
        tracing::debug!(nodes = self.plan.len(), "initial plan built");
        Ok(self.plan)
    }

    /// Builds one scope and returns the id of its last node.
    fn build_scope(&mut self, query: &Query, inherited: &Scope, top_level: bool) -> Result<NodeId> {
        if query.statements.is_empty() {
            return Err(Error::Plan("query has no statements".into()));
        }
        let mut scope = inherited.clone();
        let singleton = self.plan.create_node(NodeKind::Singleton);
        let mut cur = Cursor { last: singleton };
        let mut finished = false;
        let mut ends_in_modification = false;

        for stmt in &query.statements {
            if finished {
                return Err(Error::Plan("statement after RETURN".into()));
            }
            ends_in_modification = false;
            match stmt {
                Statement::For { var, source } => {
                    let out_var = self.declare(&mut scope, var)?;
                    let kind = match source {
                        ForSource::Collection { name, hint } => {
                            NodeKind::EnumerateCollection(CollectionScan {
                                collection: name.clone(),
                                out_var,
                                document_count: self.catalog.document_count(name),
                                random: false,
                                hint: hint.clone(),
                                restricted_shard: None,
                            })
                        }
                        ForSource::List(expr) => {
                            let in_var = self.value_var(expr, &scope, &mut cur)?;
                            NodeKind::EnumerateList { in_var, out_var }
                        }
                    };
                    self.append(&mut cur, kind)?;
                }
                Statement::Let { var, value } => match value {
                    LetValue::Expr(expr) => {
                        let expr = expr.resolve(&scope)?;
                        let out_var = self.declare(&mut scope, var)?;
                        self.append(&mut cur, NodeKind::Calculation { out_var, expr })?;
                    }
                    LetValue::Subquery(sub) => {
                        let body = self.build_scope(sub, &scope, false)?;
                        let out_var = self.declare(&mut scope, var)?;
                        self.append(&mut cur, NodeKind::Subquery { body, out_var })?;
                    }
                },
                Statement::Filter(expr) => {
                    let in_var = self.value_var(expr, &scope, &mut cur)?;
                    self.append(&mut cur, NodeKind::Filter { in_var })?;
                }
                Statement::Sort(keys) => {
                    let mut elements = Vec::with_capacity(keys.len());
                    for key in keys {
                        let var = self.value_var(&key.expr, &scope, &mut cur)?;
                        elements.push(SortElement::new(var, key.ascending));
                    }
                    self.append(
                        &mut cur,
                        NodeKind::Sort {
                            elements,
                            stable: false,
                            limit: None,
                        },
                    )?;
                }
                Statement::Limit { offset, count } => {
                    self.append(
                        &mut cur,
                        NodeKind::Limit {
                            offset: *offset,
                            limit: *count,
                        },
                    )?;
                }
                Statement::Collect {
                    groups,
                    aggregates,
                    into,
                } => {
                    let mut group_vars = Vec::with_capacity(groups.len());
                    for (_, expr) in groups {
                        group_vars.push(self.value_var(expr, &scope, &mut cur)?);
                    }
                    let mut aggregate_inputs = Vec::with_capacity(aggregates.len());
                    for agg in aggregates {
                        let in_var = match &agg.expr {
                            Some(expr) => Some(self.value_var(expr, &scope, &mut cur)?),
                            None => None,
                        };
                        aggregate_inputs.push(in_var);
                    }
                    if !group_vars.is_empty() {
                        let elements = group_vars
                            .iter()
                            .map(|v| SortElement::new(*v, true))
                            .collect();
                        self.append(
                            &mut cur,
                            NodeKind::Sort {
                                elements,
                                stable: true,
                                limit: None,
                            },
                        )?;
                    }

                    // only the collect outputs survive, plus whatever the
                    // enclosing scope provided
                    scope = inherited.clone();
                    let mut collect = Collect {
                        groups: Vec::with_capacity(groups.len()),
                        aggregates: Vec::with_capacity(aggregates.len()),
                        into: None,
                    };
                    for ((name, _), in_var) in groups.iter().zip(group_vars) {
                        let out_var = self.declare(&mut scope, name)?;
                        collect.groups.push(GroupVar { out_var, in_var });
                    }
                    for (agg, in_var) in aggregates.iter().zip(aggregate_inputs) {
                        let out_var = self.declare(&mut scope, &agg.var)?;
                        collect.aggregates.push(AggregateVar {
                            out_var,
                            in_var,
                            function: agg.function,
                        });
                    }
                    if let Some(name) = into {
                        collect.into = Some(self.declare(&mut scope, name)?);
                    }
                    self.append(&mut cur, NodeKind::Collect(collect))?;
                }
                Statement::Modify(m) => {
                    let kind = self.modification(m, &mut scope, &mut cur)?;
                    self.append(&mut cur, kind)?;
                    ends_in_modification = true;
                }
                Statement::Return(expr) => {
                    let in_var = self.value_var(expr, &scope, &mut cur)?;
                    self.append(&mut cur, NodeKind::Return { in_var })?;
                    finished = true;
                }
            }
        }

        if !finished && !(top_level && ends_in_modification) {
            return Err(Error::Plan("query must end with RETURN".into()));
        }
        Ok(cur.last)
    }

    fn modification(
        &mut self,
        m: &Modify,
        scope: &mut Scope,
        cur: &mut Cursor,
    ) -> Result<NodeKind> {
        let in_var = self.value_var(&m.input, scope, cur)?;
        let key_var = match &m.key {
            Some(key) => Some(self.value_var(key, scope, cur)?),
            None => None,
        };
        let out_old = match &m.old {
            Some(name) => Some(self.declare(scope, name)?),
            None => None,
        };
        let out_new = match &m.new {
            Some(name) => Some(self.declare(scope, name)?),
            None => None,
        };
        let modification = Modification {
            collection: m.collection.clone(),
            in_var,
            key_var,
            out_old,
            out_new,
            options: m.options.clone(),
        };
        Ok(match m.kind {
            ModifyKind::Insert => NodeKind::Insert(modification),
            ModifyKind::Remove => NodeKind::Remove(modification),
            ModifyKind::Update => NodeKind::Update(modification),
            ModifyKind::Replace => NodeKind::Replace(modification),
        })
    }

    fn declare(&mut self, scope: &mut Scope, name: &str) -> Result<VariableId> {
        if scope.contains_key(name) {
            return Err(Error::Plan(format!("variable '{name}' is already declared")));
        }
        let id = self.vars.create_variable(name).id;
        scope.insert(name.to_string(), id);
        Ok(id)
    }

    fn append(&mut self, cur: &mut Cursor, kind: NodeKind) -> Result<NodeId> {
        let id = self.plan.create_node(kind);
        self.plan.add_dependency(id, cur.last)?;
        cur.last = id;
        Ok(id)
    }

    /// A variable holding the value of `expr`, computed by a new temporary
    /// calculation unless `expr` already names one.
    fn value_var(&mut self, expr: &AstExpr, scope: &Scope, cur: &mut Cursor) -> Result<VariableId> {
        if let AstExpr::Name(name) = expr {
            return lookup(scope, name);
        }
        let expr = expr.resolve(scope)?;
        let out_var = self.vars.create_temporary().id;
        self.append(cur, NodeKind::Calculation { out_var, expr })?;
        Ok(out_var)
    }
}

/// Build the initial plan for `query`.
pub fn build_plan(
    query: &Query,
    vars: &mut VariableRegistry,
    catalog: &dyn IndexCatalog,
) -> Result<Plan> {
    PlanBuilder::new(vars, catalog).build(query)
}
