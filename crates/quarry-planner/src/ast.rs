//! The query AST the plan builder consumes.
//!
//! Statements run top to bottom like an AQL query body. Expressions name
//! variables by their query-level names; the builder resolves them.

use std::collections::BTreeMap;

use quarry_core::expr::{BinaryOp, Expr, UnaryOp};
use quarry_core::id::VariableId;
use quarry_core::{Error, Result};
use quarry_plan::{AggregateFunction, IndexHint, ModificationOptions};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum AstExpr {
    Value(Value),
    Name(String),
    Attribute { base: Box<AstExpr>, name: String },
    Unary { op: UnaryOp, operand: Box<AstExpr> },
    Binary { op: BinaryOp, lhs: Box<AstExpr>, rhs: Box<AstExpr> },
    Call { name: String, args: Vec<AstExpr> },
    Array(Vec<AstExpr>),
    Object(Vec<(String, AstExpr)>),
}

/// Names visible at one point of the query.
pub type Scope = BTreeMap<String, VariableId>;

pub(crate) fn lookup(scope: &Scope, name: &str) -> Result<VariableId> {
    scope
        .get(name)
        .copied()
        .ok_or_else(|| Error::Plan(format!("variable '{name}' is not declared")))
}

impl AstExpr {
    pub fn name(n: impl Into<String>) -> Self {
        AstExpr::Name(n.into())
    }

    /// `var.p1.p2...`
    pub fn path(var: &str, path: &[&str]) -> Self {
        path.iter().fold(AstExpr::name(var), |base, p| AstExpr::Attribute {
            base: Box::new(base),
            name: (*p).to_string(),
        })
    }

    pub fn binary(op: BinaryOp, lhs: AstExpr, rhs: AstExpr) -> Self {
        AstExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Replace names by the variables they denote in `scope`.
    pub fn resolve(&self, scope: &Scope) -> Result<Expr> {
        Ok(match self {
            AstExpr::Value(v) => Expr::Value(v.clone()),
            AstExpr::Name(n) => Expr::Reference(lookup(scope, n)?),
            AstExpr::Attribute { base, name } => {
                Expr::attribute(base.resolve(scope)?, name.clone())
            }
            AstExpr::Unary { op, operand } => Expr::unary(*op, operand.resolve(scope)?),
            AstExpr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, lhs.resolve(scope)?, rhs.resolve(scope)?)
            }
            AstExpr::Call { name, args } => Expr::call(
                name.clone(),
                args.iter().map(|a| a.resolve(scope)).collect::<Result<_>>()?,
            ),
            AstExpr::Array(items) => Expr::Array(
                items
                    .iter()
                    .map(|i| i.resolve(scope))
                    .collect::<Result<_>>()?,
            ),
            AstExpr::Object(fields) => Expr::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(scope)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForSource {
    Collection {
        name: String,
        hint: Option<IndexHint>,
    },
    List(AstExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LetValue {
    Expr(AstExpr),
    Subquery(Query),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: AstExpr,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub var: String,
    pub function: AggregateFunction,
    /// `None` only for a bare count.
    pub expr: Option<AstExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyKind {
    Insert,
    Remove,
    Update,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Modify {
    pub kind: ModifyKind,
    pub collection: String,
    /// Document for insert/update/replace, key or document for remove.
    pub input: AstExpr,
    /// Explicit key for update/replace.
    pub key: Option<AstExpr>,
    pub options: ModificationOptions,
    /// Name bound to `OLD`.
    pub old: Option<String>,
    /// Name bound to `NEW`.
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    For { var: String, source: ForSource },
    Let { var: String, value: LetValue },
    Filter(AstExpr),
    Sort(Vec<SortKey>),
    Limit { offset: u64, count: u64 },
    Collect {
        groups: Vec<(String, AstExpr)>,
        aggregates: Vec<Aggregate>,
        into: Option<String>,
    },
    Modify(Modify),
    Return(AstExpr),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub statements: Vec<Statement>,
}

impl Query {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_maps_names_to_variables() {
        let mut scope = Scope::new();
        scope.insert("x".into(), VariableId::new(4));
        let e = AstExpr::binary(BinaryOp::Eq, AstExpr::path("x", &["a"]), AstExpr::Value(json!(1)));
        let resolved = e.resolve(&scope).unwrap();
        let cmp = resolved.as_attribute_comparison().unwrap();
        assert_eq!(cmp.var, VariableId::new(4));
        assert_eq!(cmp.path, vec!["a".to_string()]);
    }

    #[test]
    fn unknown_name_is_a_plan_error() {
        let err = AstExpr::name("nope").resolve(&Scope::new()).unwrap_err();
        assert!(matches!(err, Error::Plan(_)));
    }
}
