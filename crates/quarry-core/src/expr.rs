//! Expression trees carried by calculation nodes and index conditions.
//!
//! The planner hands expressions over already resolved to variable ids. The
//! optimizer only asks questions about them (which variables, deterministic,
//! can throw, constant value, attribute path) and rewrites variable
//! references; it never evaluates anything that depends on row data.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::id::VariableId;
use crate::variable::VariableRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "IN",
            BinaryOp::NotIn => "NOT IN",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    /// The index-usable comparison this operator corresponds to, if any.
    pub fn comparison(self) -> Option<ComparisonOp> {
        match self {
            BinaryOp::Eq => Some(ComparisonOp::Eq),
            BinaryOp::Lt => Some(ComparisonOp::Lt),
            BinaryOp::Le => Some(ComparisonOp::Le),
            BinaryOp::Gt => Some(ComparisonOp::Gt),
            BinaryOp::Ge => Some(ComparisonOp::Ge),
            BinaryOp::In => Some(ComparisonOp::In),
            _ => None,
        }
    }
}

/// Comparisons an index may be able to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    In,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    pub fn is_equality(self) -> bool {
        matches!(self, ComparisonOp::Eq | ComparisonOp::In)
    }

    pub fn is_range(self) -> bool {
        !self.is_equality()
    }

    /// `1 < x.a` is `x.a > 1`. `IN` has no mirrored form.
    fn flipped(self) -> Option<Self> {
        match self {
            ComparisonOp::Eq => Some(ComparisonOp::Eq),
            ComparisonOp::Lt => Some(ComparisonOp::Gt),
            ComparisonOp::Le => Some(ComparisonOp::Ge),
            ComparisonOp::Gt => Some(ComparisonOp::Lt),
            ComparisonOp::Ge => Some(ComparisonOp::Le),
            ComparisonOp::In => None,
        }
    }

    pub fn binary_op(self) -> BinaryOp {
        match self {
            ComparisonOp::Eq => BinaryOp::Eq,
            ComparisonOp::In => BinaryOp::In,
            ComparisonOp::Lt => BinaryOp::Lt,
            ComparisonOp::Le => BinaryOp::Le,
            ComparisonOp::Gt => BinaryOp::Gt,
            ComparisonOp::Ge => BinaryOp::Ge,
        }
    }
}

/// `var.path op constant`, normalized so the attribute is on the left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeComparison {
    pub var: VariableId,
    pub path: Vec<String>,
    pub op: ComparisonOp,
    pub value: Value,
}

impl AttributeComparison {
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }

    pub fn to_expr(&self) -> Expr {
        let mut lhs = Expr::Reference(self.var);
        for part in &self.path {
            lhs = Expr::attribute(lhs, part.clone());
        }
        Expr::binary(self.op.binary_op(), lhs, Expr::Value(self.value.clone()))
    }
}

/// Rule-local failure to render an expression for duplicate detection. The
/// rule skips the opportunity; this never aborts optimization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StringifyError {
    #[error("expression is longer than {limit} characters")]
    TooLong { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Value(Value),
    Reference(VariableId),
    Attribute {
        base: Box<Expr>,
        name: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, Copy)]
struct FunctionTraits {
    deterministic: bool,
    can_throw: bool,
    db_server: bool,
}

fn function_traits(name: &str) -> FunctionTraits {
    const PURE: FunctionTraits = FunctionTraits {
        deterministic: true,
        can_throw: false,
        db_server: true,
    };
    let upper = name.to_ascii_uppercase();
    // user-defined functions run on the coordinator only
    if upper.contains("::") {
        return FunctionTraits {
            deterministic: false,
            can_throw: true,
            db_server: false,
        };
    }
    match upper.as_str() {
        "RAND" | "RANDOM_TOKEN" | "UUID" | "DATE_NOW" => FunctionTraits {
            deterministic: false,
            ..PURE
        },
        "FAIL" => FunctionTraits {
            can_throw: true,
            ..PURE
        },
        "DOCUMENT" => FunctionTraits {
            db_server: false,
            ..PURE
        },
        "LENGTH" | "LOWER" | "UPPER" | "CONCAT" | "ABS" | "FLOOR" | "CEIL" | "ROUND"
        | "TO_NUMBER" | "TO_STRING" | "TO_BOOL" | "IS_NULL" | "NOT_NULL" | "CONTAINS"
        | "SUBSTRING" | "MIN" | "MAX" | "SUM" | "AVERAGE" | "FIRST" | "LAST" | "HAS"
        | "MERGE" | "KEEP" | "UNSET" | "ATTRIBUTES" | "VALUES" => PURE,
        _ => FunctionTraits {
            deterministic: false,
            can_throw: true,
            db_server: false,
        },
    }
}

impl Expr {
    pub fn value(v: impl Into<Value>) -> Self {
        Expr::Value(v.into())
    }

    pub fn reference(var: VariableId) -> Self {
        Expr::Reference(var)
    }

    pub fn attribute(base: Expr, name: impl Into<String>) -> Self {
        Expr::Attribute {
            base: Box::new(base),
            name: name.into(),
        }
    }

    /// `var.p1.p2...`
    pub fn attribute_path_of(var: VariableId, path: &[&str]) -> Self {
        path.iter()
            .fold(Expr::Reference(var), |acc, p| Expr::attribute(acc, *p))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::And, lhs, rhs)
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    /// AND-combine `parts`; an empty list is `true`.
    pub fn conjunction(parts: Vec<Expr>) -> Self {
        let mut iter = parts.into_iter();
        match iter.next() {
            None => Expr::Value(Value::Bool(true)),
            Some(first) => iter.fold(first, Expr::and),
        }
    }

    /// Variables referenced anywhere in the expression.
    pub fn variables(&self) -> BTreeSet<VariableId> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    pub fn collect_variables(&self, out: &mut BTreeSet<VariableId>) {
        match self {
            Expr::Value(_) => {}
            Expr::Reference(v) => {
                out.insert(*v);
            }
            Expr::Attribute { base, .. } => base.collect_variables(out),
            Expr::Unary { operand, .. } => operand.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Expr::Call { args, .. } | Expr::Array(args) => {
                for a in args {
                    a.collect_variables(out);
                }
            }
            Expr::Object(fields) => {
                for (_, v) in fields {
                    v.collect_variables(out);
                }
            }
        }
    }

    /// Rewrite references according to `map`. Returns whether anything changed.
    pub fn replace_variables(&mut self, map: &BTreeMap<VariableId, VariableId>) -> bool {
        match self {
            Expr::Value(_) => false,
            Expr::Reference(v) => match map.get(v) {
                Some(replacement) if replacement != v => {
                    *v = *replacement;
                    true
                }
                _ => false,
            },
            Expr::Attribute { base, .. } => base.replace_variables(map),
            Expr::Unary { operand, .. } => operand.replace_variables(map),
            Expr::Binary { lhs, rhs, .. } => {
                let l = lhs.replace_variables(map);
                let r = rhs.replace_variables(map);
                l || r
            }
            Expr::Call { args, .. } | Expr::Array(args) => {
                let mut changed = false;
                for a in args {
                    changed |= a.replace_variables(map);
                }
                changed
            }
            Expr::Object(fields) => {
                let mut changed = false;
                for (_, v) in fields {
                    changed |= v.replace_variables(map);
                }
                changed
            }
        }
    }

    /// Replace every reference to `var` by a copy of `replacement`.
    pub fn substitute(&mut self, var: VariableId, replacement: &Expr) -> bool {
        match self {
            Expr::Value(_) => false,
            Expr::Reference(v) if *v == var => {
                *self = replacement.clone();
                true
            }
            Expr::Reference(_) => false,
            Expr::Attribute { base, .. } => base.substitute(var, replacement),
            Expr::Unary { operand, .. } => operand.substitute(var, replacement),
            Expr::Binary { lhs, rhs, .. } => {
                let l = lhs.substitute(var, replacement);
                let r = rhs.substitute(var, replacement);
                l || r
            }
            Expr::Call { args, .. } | Expr::Array(args) => {
                let mut changed = false;
                for a in args {
                    changed |= a.substitute(var, replacement);
                }
                changed
            }
            Expr::Object(fields) => {
                let mut changed = false;
                for (_, v) in fields {
                    changed |= v.substitute(var, replacement);
                }
                changed
            }
        }
    }

    fn all_calls(&self, pred: &dyn Fn(FunctionTraits) -> bool) -> bool {
        match self {
            Expr::Value(_) | Expr::Reference(_) => true,
            Expr::Attribute { base, .. } => base.all_calls(pred),
            Expr::Unary { operand, .. } => operand.all_calls(pred),
            Expr::Binary { lhs, rhs, .. } => lhs.all_calls(pred) && rhs.all_calls(pred),
            Expr::Call { name, args } => {
                pred(function_traits(name)) && args.iter().all(|a| a.all_calls(pred))
            }
            Expr::Array(items) => items.iter().all(|a| a.all_calls(pred)),
            Expr::Object(fields) => fields.iter().all(|(_, v)| v.all_calls(pred)),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.all_calls(&|t| t.deterministic)
    }

    pub fn can_throw(&self) -> bool {
        !self.all_calls(&|t| !t.can_throw)
    }

    pub fn can_run_on_db_server(&self) -> bool {
        self.all_calls(&|t| t.db_server)
    }

    pub fn is_constant(&self) -> bool {
        self.constant_value().is_some()
    }

    /// Fold the expression if it does not depend on any row data.
    pub fn constant_value(&self) -> Option<Value> {
        match self {
            Expr::Value(v) => Some(v.clone()),
            Expr::Reference(_) => None,
            Expr::Attribute { base, name } => match base.constant_value()? {
                Value::Object(m) => Some(m.get(name).cloned().unwrap_or(Value::Null)),
                _ => Some(Value::Null),
            },
            Expr::Unary { op, operand } => {
                let v = operand.constant_value()?;
                Some(match op {
                    UnaryOp::Not => Value::Bool(!truthy(&v)),
                    UnaryOp::Minus => number_value(-to_number(&v)),
                })
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.constant_value()?;
                match op {
                    BinaryOp::And => {
                        if truthy(&l) {
                            rhs.constant_value()
                        } else {
                            Some(l)
                        }
                    }
                    BinaryOp::Or => {
                        if truthy(&l) {
                            Some(l)
                        } else {
                            rhs.constant_value()
                        }
                    }
                    _ => {
                        let r = rhs.constant_value()?;
                        Some(fold_binary(*op, &l, &r))
                    }
                }
            }
            Expr::Call { name, args } => {
                let traits = function_traits(name);
                if !traits.deterministic || traits.can_throw {
                    return None;
                }
                let values = args
                    .iter()
                    .map(|a| a.constant_value())
                    .collect::<Option<Vec<_>>>()?;
                fold_call(name, &values)
            }
            Expr::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|a| a.constant_value())
                    .collect::<Option<Vec<_>>>()?,
            )),
            Expr::Object(fields) => {
                let mut m = Map::new();
                for (k, v) in fields {
                    m.insert(k.clone(), v.constant_value()?);
                }
                Some(Value::Object(m))
            }
        }
    }

    pub fn is_true(&self) -> bool {
        self.constant_value().map(|v| truthy(&v)).unwrap_or(false)
    }

    pub fn is_false(&self) -> bool {
        self.constant_value().map(|v| !truthy(&v)).unwrap_or(false)
    }

    /// `var.a.b` resolves to `(var, ["a", "b"])`. A bare reference is not an
    /// attribute access.
    pub fn attribute_path(&self) -> Option<(VariableId, Vec<String>)> {
        let mut path = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Expr::Attribute { base, name } => {
                    path.push(name.clone());
                    cur = base;
                }
                Expr::Reference(v) if !path.is_empty() => {
                    path.reverse();
                    return Some((*v, path));
                }
                _ => return None,
            }
        }
    }

    pub fn is_attribute_access(&self) -> bool {
        self.attribute_path().is_some()
    }

    /// Operands of a (possibly nested) AND, left to right.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.push_conjuncts(&mut out);
        out
    }

    fn push_conjuncts<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match self {
            Expr::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            } => {
                lhs.push_conjuncts(out);
                rhs.push_conjuncts(out);
            }
            other => out.push(other),
        }
    }

    /// Operands of a (possibly nested) OR, left to right.
    pub fn disjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
            } => {
                let mut out = lhs.disjuncts();
                out.extend(rhs.disjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// A variable or one of its attributes.
    pub fn is_reference_or_attribute(&self) -> bool {
        matches!(self, Expr::Reference(_)) || self.is_attribute_access()
    }

    /// Recognize `var.path op constant` (or the mirrored form).
    pub fn as_attribute_comparison(&self) -> Option<AttributeComparison> {
        let Expr::Binary { op, lhs, rhs } = self else {
            return None;
        };
        let cmp = op.comparison()?;
        let (var, path, value, cmp) = if let Some((var, path)) = lhs.attribute_path() {
            (var, path, rhs.constant_value()?, cmp)
        } else if let Some((var, path)) = rhs.attribute_path() {
            (var, path, lhs.constant_value()?, cmp.flipped()?)
        } else {
            return None;
        };
        if cmp == ComparisonOp::In && !value.is_array() {
            return None;
        }
        Some(AttributeComparison {
            var,
            path,
            op: cmp,
            value,
        })
    }

    /// Render with variable names resolved through `vars`.
    pub fn display_with<'a>(&'a self, vars: &'a VariableRegistry) -> ExprDisplay<'a> {
        ExprDisplay {
            expr: self,
            vars: Some(vars),
        }
    }

    /// Canonical text used to detect identical expressions. Fails (locally)
    /// when the text would exceed `max_len`.
    pub fn stringify(&self, max_len: usize) -> Result<String, StringifyError> {
        let mut out = BoundedWriter {
            buf: String::new(),
            limit: max_len,
        };
        write_expr(&mut out, self, None)
            .map_err(|_| StringifyError::TooLong { limit: max_len })?;
        Ok(out.buf)
    }
}

/// `Display` adapter; references render as `$<id>` without a registry.
pub struct ExprDisplay<'a> {
    expr: &'a Expr,
    vars: Option<&'a VariableRegistry>,
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self.expr, self.vars)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self, None)
    }
}

struct BoundedWriter {
    buf: String,
    limit: usize,
}

impl fmt::Write for BoundedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.buf.len() + s.len() > self.limit {
            return Err(fmt::Error);
        }
        self.buf.push_str(s);
        Ok(())
    }
}

fn write_expr(
    out: &mut dyn fmt::Write,
    expr: &Expr,
    vars: Option<&VariableRegistry>,
) -> fmt::Result {
    match expr {
        Expr::Value(v) => {
            let text = serde_json::to_string(v).map_err(|_| fmt::Error)?;
            out.write_str(&text)
        }
        Expr::Reference(id) => match vars {
            Some(reg) => out.write_str(&reg.name_of(*id)),
            None => write!(out, "${}", id.get()),
        },
        Expr::Attribute { base, name } => {
            write_expr(out, base, vars)?;
            if is_identifier(name) {
                write!(out, ".{}", name)
            } else {
                write!(out, ".`{}`", name)
            }
        }
        Expr::Unary { op, operand } => {
            out.write_str(match op {
                UnaryOp::Not => "!",
                UnaryOp::Minus => "-",
            })?;
            out.write_str("(")?;
            write_expr(out, operand, vars)?;
            out.write_str(")")
        }
        Expr::Binary { op, lhs, rhs } => {
            out.write_str("(")?;
            write_expr(out, lhs, vars)?;
            write!(out, " {} ", op.symbol())?;
            write_expr(out, rhs, vars)?;
            out.write_str(")")
        }
        Expr::Call { name, args } => {
            write!(out, "{}(", name.to_ascii_uppercase())?;
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write_expr(out, a, vars)?;
            }
            out.write_str(")")
        }
        Expr::Array(items) => {
            out.write_str("[")?;
            for (i, a) in items.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write_expr(out, a, vars)?;
            }
            out.write_str("]")
        }
        Expr::Object(fields) => {
            out.write_str("{")?;
            for (i, (k, v)) in fields.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                let key = serde_json::to_string(k).map_err(|_| fmt::Error)?;
                write!(out, "{}: ", key)?;
                write_expr(out, v, vars)?;
            }
            out.write_str("}")
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Query-language truthiness: null, false, 0 and "" are false; arrays and
/// objects are always true.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            let n = x.len().max(y.len());
            for i in 0..n {
                let l = x.get(i).unwrap_or(&Value::Null);
                let r = y.get(i).unwrap_or(&Value::Null);
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        }
        (Value::Object(x), Value::Object(y)) => {
            let keys: BTreeSet<&String> = x.keys().chain(y.keys()).collect();
            for k in keys {
                let l = x.get(k).unwrap_or(&Value::Null);
                let r = y.get(k).unwrap_or(&Value::Null);
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}

fn to_number(v: &Value) -> f64 {
    match v {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Array(_) | Value::Object(_) => 0.0,
    }
}

fn to_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_value(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn fold_binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    let ord = || compare_values(l, r);
    match op {
        BinaryOp::Eq => Value::Bool(ord() == Ordering::Equal),
        BinaryOp::Ne => Value::Bool(ord() != Ordering::Equal),
        BinaryOp::Lt => Value::Bool(ord() == Ordering::Less),
        BinaryOp::Le => Value::Bool(ord() != Ordering::Greater),
        BinaryOp::Gt => Value::Bool(ord() == Ordering::Greater),
        BinaryOp::Ge => Value::Bool(ord() != Ordering::Less),
        BinaryOp::In | BinaryOp::NotIn => {
            let found = match r {
                Value::Array(items) => items
                    .iter()
                    .any(|x| compare_values(x, l) == Ordering::Equal),
                _ => false,
            };
            Value::Bool(if op == BinaryOp::In { found } else { !found })
        }
        BinaryOp::Add => number_value(to_number(l) + to_number(r)),
        BinaryOp::Sub => number_value(to_number(l) - to_number(r)),
        BinaryOp::Mul => number_value(to_number(l) * to_number(r)),
        BinaryOp::Div | BinaryOp::Mod => {
            let d = to_number(r);
            if d == 0.0 {
                Value::Null
            } else if op == BinaryOp::Div {
                number_value(to_number(l) / d)
            } else {
                number_value(to_number(l) % d)
            }
        }
        // short-circuit operators are folded by the caller
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

fn fold_call(name: &str, args: &[Value]) -> Option<Value> {
    let first = args.first();
    let numbers = |v: Option<&Value>| -> Option<Vec<f64>> {
        match v? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter(|x| !x.is_null())
                    .map(to_number)
                    .collect(),
            ),
            _ => None,
        }
    };
    let out = match name.to_ascii_uppercase().as_str() {
        "LENGTH" => match first? {
            Value::Null => Value::from(0),
            Value::Bool(b) => Value::from(u8::from(*b)),
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(a) => Value::from(a.len()),
            Value::Object(o) => Value::from(o.len()),
            n @ Value::Number(_) => Value::from(n.to_string().len()),
        },
        "LOWER" => Value::String(to_text(first?).to_lowercase()),
        "UPPER" => Value::String(to_text(first?).to_uppercase()),
        "CONCAT" => Value::String(args.iter().map(to_text).collect()),
        "ABS" => number_value(to_number(first?).abs()),
        "FLOOR" => number_value(to_number(first?).floor()),
        "CEIL" => number_value(to_number(first?).ceil()),
        "ROUND" => number_value(to_number(first?).round()),
        "TO_NUMBER" => number_value(to_number(first?)),
        "TO_STRING" => Value::String(to_text(first?)),
        "TO_BOOL" => Value::Bool(truthy(first?)),
        "IS_NULL" => Value::Bool(first?.is_null()),
        "NOT_NULL" => args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
        "FIRST" => match first? {
            Value::Array(a) => a.first().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "LAST" => match first? {
            Value::Array(a) => a.last().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "SUM" => number_value(numbers(first)?.iter().sum()),
        "MIN" => numbers(first)?
            .into_iter()
            .reduce(f64::min)
            .map(number_value)
            .unwrap_or(Value::Null),
        "MAX" => numbers(first)?
            .into_iter()
            .reduce(f64::max)
            .map(number_value)
            .unwrap_or(Value::Null),
        "AVERAGE" => {
            let ns = numbers(first)?;
            if ns.is_empty() {
                Value::Null
            } else {
                number_value(ns.iter().sum::<f64>() / ns.len() as f64)
            }
        }
        _ => return None,
    };
    Some(out)
}
