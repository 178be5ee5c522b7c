//! YAML → `Query` parser.
//!
//! Example:
//! ```yaml
//! steps:
//!   - { op: for, var: u, collection: users, index: idx_age }
//!   - { op: filter, expr: "u.age >= 18" }
//!   - op: let
//!     var: friends
//!     steps:
//!       - { op: for, var: f, list: "u.friends" }
//!       - { op: return, expr: "f.name" }
//!   - { op: sort, keys: [ { expr: "u.name", desc: true } ] }
//!   - { op: limit, offset: 0, count: 10 }
//!   - { op: return, expr: "{ name: u.name, friends: friends }" }
//! ```

use serde::{Deserialize, Serialize};

use quarry_plan::{AggregateFunction, IndexHint, ModificationOptions};

use crate::ast::{
    Aggregate, AstExpr, ForSource, LetValue, Modify, ModifyKind, Query, SortKey, Statement,
};
use crate::dsl::expr::parse_expr;
use crate::error::{PlannerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDoc {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Step {
    For {
        var: String,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        list: Option<String>,
        #[serde(default)]
        index: Option<String>,
        #[serde(default)]
        force_index: bool,
    },
    Let {
        var: String,
        #[serde(default)]
        expr: Option<String>,
        #[serde(default)]
        steps: Option<Vec<Step>>,
    },
    Filter {
        expr: String,
    },
    Sort {
        keys: Vec<SortKeyDef>,
    },
    Limit {
        #[serde(default)]
        offset: u64,
        count: u64,
    },
    Collect {
        #[serde(default)]
        groups: Vec<GroupDef>,
        #[serde(default)]
        aggregates: Vec<AggregateDef>,
        #[serde(default)]
        into: Option<String>,
    },
    Insert {
        collection: String,
        doc: String,
        #[serde(default)]
        options: ModificationOptions,
        #[serde(default)]
        new: Option<String>,
    },
    Remove {
        collection: String,
        key: String,
        #[serde(default)]
        options: ModificationOptions,
        #[serde(default)]
        old: Option<String>,
    },
    Update(ModifyDef),
    Replace(ModifyDef),
    Return {
        expr: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortKeyDef {
    pub expr: String,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDef {
    pub var: String,
    pub expr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateDef {
    pub var: String,
    pub function: AggregateFunction,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyDef {
    pub collection: String,
    pub doc: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub options: ModificationOptions,
    #[serde(default)]
    pub old: Option<String>,
    #[serde(default)]
    pub new: Option<String>,
}

fn expr_at(step: usize, src: &str) -> Result<AstExpr> {
    parse_expr(src).map_err(|source| PlannerError::Expr { step, source })
}

fn step_error(step: usize, message: impl Into<String>) -> PlannerError {
    PlannerError::Step {
        step,
        message: message.into(),
    }
}

fn lower_steps(steps: Vec<Step>) -> Result<Query> {
    let mut statements = Vec::with_capacity(steps.len());
    for (i, step) in steps.into_iter().enumerate() {
        let n = i + 1;
        statements.push(match step {
            Step::For {
                var,
                collection,
                list,
                index,
                force_index,
            } => {
                let source = match (collection, list) {
                    (Some(name), None) => ForSource::Collection {
                        name,
                        hint: index.map(|index| IndexHint {
                            index,
                            forced: force_index,
                        }),
                    },
                    (None, Some(list)) => ForSource::List(expr_at(n, &list)?),
                    _ => return Err(step_error(n, "for needs exactly one of collection or list")),
                };
                Statement::For { var, source }
            }
            Step::Let { var, expr, steps } => {
                let value = match (expr, steps) {
                    (Some(expr), None) => LetValue::Expr(expr_at(n, &expr)?),
                    (None, Some(steps)) => LetValue::Subquery(lower_steps(steps)?),
                    _ => return Err(step_error(n, "let needs exactly one of expr or steps")),
                };
                Statement::Let { var, value }
            }
            Step::Filter { expr } => Statement::Filter(expr_at(n, &expr)?),
            Step::Sort { keys } => Statement::Sort(
                keys.iter()
                    .map(|k| {
                        Ok(SortKey {
                            expr: expr_at(n, &k.expr)?,
                            ascending: !k.desc,
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
            Step::Limit { offset, count } => Statement::Limit { offset, count },
            Step::Collect {
                groups,
                aggregates,
                into,
            } => {
                let groups = groups
                    .into_iter()
                    .map(|g| Ok((g.var, expr_at(n, &g.expr)?)))
                    .collect::<Result<_>>()?;
                let mut aggs = Vec::with_capacity(aggregates.len());
                for a in aggregates {
                    let expr = a.expr.as_deref().map(|e| expr_at(n, e)).transpose()?;
                    if expr.is_none() && a.function != AggregateFunction::Count {
                        return Err(step_error(n, format!("aggregate '{}' needs an expr", a.var)));
                    }
                    aggs.push(Aggregate {
                        var: a.var,
                        function: a.function,
                        expr,
                    });
                }
                Statement::Collect {
                    groups,
                    aggregates: aggs,
                    into,
                }
            }
            Step::Insert {
                collection,
                doc,
                options,
                new,
            } => Statement::Modify(Modify {
                kind: ModifyKind::Insert,
                collection,
                input: expr_at(n, &doc)?,
                key: None,
                options,
                old: None,
                new,
            }),
            Step::Remove {
                collection,
                key,
                options,
                old,
            } => Statement::Modify(Modify {
                kind: ModifyKind::Remove,
                collection,
                input: expr_at(n, &key)?,
                key: None,
                options,
                old,
                new: None,
            }),
            Step::Update(def) => Statement::Modify(lower_modify(n, ModifyKind::Update, def)?),
            Step::Replace(def) => Statement::Modify(lower_modify(n, ModifyKind::Replace, def)?),
            Step::Return { expr } => Statement::Return(expr_at(n, &expr)?),
        });
    }
    Ok(Query::new(statements))
}

fn lower_modify(step: usize, kind: ModifyKind, def: ModifyDef) -> Result<Modify> {
    Ok(Modify {
        kind,
        collection: def.collection,
        input: expr_at(step, &def.doc)?,
        key: def.key.as_deref().map(|k| expr_at(step, k)).transpose()?,
        options: def.options,
        old: def.old,
        new: def.new,
    })
}

/// Parse a YAML query document into a `Query`.
pub fn parse_yaml_query(yaml_src: &str) -> Result<Query> {
    let doc: QueryDoc = serde_yaml::from_str(yaml_src)?;
    lower_steps(doc.steps)
}
