//! Text form of query expressions, e.g. `u.age >= 18 && LOWER(u.name) != "bob"`.
//!
//! Precedence from loosest to tightest: `||`/`OR`, `&&`/`AND`, comparisons
//! (`== != < <= > >= IN`, `NOT IN`), `+ -`, `* / %`, unary `! NOT -`, then
//! attribute access. Function names may carry a `NS::` namespace.

use quarry_core::expr::{BinaryOp, UnaryOp};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::ast::AstExpr;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse expression at offset {offset}: {message}")]
pub struct ExprSyntaxError {
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(Number),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const PUNCT2: [&str; 6] = ["==", "!=", "<=", ">=", "&&", "||"];
const PUNCT1: [&str; 16] = [
    "<", ">", "!", "+", "-", "*", "/", "%", ".", ",", "(", ")", "[", "]", "{", "}",
];

fn syntax(offset: usize, message: impl Into<String>) -> ExprSyntaxError {
    ExprSyntaxError {
        offset,
        message: message.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Tok)>, ExprSyntaxError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let mut float = false;
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                float = true;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                float = true;
                i += 1;
                if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                    i += 1;
                }
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text = &src[start..i];
            let num = if float {
                text.parse::<f64>().ok().and_then(Number::from_f64)
            } else {
                text.parse::<i64>().ok().map(Number::from)
            };
            let num = num.ok_or_else(|| syntax(start, format!("bad number '{text}'")))?;
            out.push((start, Tok::Num(num)));
        } else if c == b'"' || c == b'\'' {
            let quote = c as char;
            let mut s = String::new();
            let mut chars = src[i + 1..].char_indices();
            let mut closed = false;
            while let Some((off, ch)) = chars.next() {
                match ch {
                    '\\' => {
                        let (_, esc) = chars
                            .next()
                            .ok_or_else(|| syntax(start, "unterminated string"))?;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    ch if ch == quote => {
                        i = i + 1 + off + 1;
                        closed = true;
                        break;
                    }
                    ch => s.push(ch),
                }
            }
            if !closed {
                return Err(syntax(start, "unterminated string"));
            }
            out.push((start, Tok::Str(s)));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            loop {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                if src[i..].starts_with("::") {
                    i += 2;
                    continue;
                }
                break;
            }
            out.push((start, Tok::Ident(src[start..i].to_string())));
        } else if let Some(p) = PUNCT2.iter().find(|p| src[i..].starts_with(**p)) {
            out.push((start, Tok::Punct(*p)));
            i += 2;
        } else if let Some(p) = PUNCT1.iter().find(|p| src[i..].starts_with(**p)) {
            out.push((start, Tok::Punct(*p)));
            i += 1;
        } else if c == b':' {
            out.push((start, Tok::Punct(":")));
            i += 1;
        } else {
            let ch = src[i..].chars().next().unwrap_or('?');
            return Err(syntax(start, format!("unexpected character '{ch}'")));
        }
    }
    Ok(out)
}

struct Parser {
    toks: Vec<(usize, Tok)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.toks.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(_, t)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: &str) -> Result<(), ExprSyntaxError> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected '{p}'")))
        }
    }

    fn keyword_at(&self, pos: usize, kw: &str) -> bool {
        matches!(self.toks.get(pos), Some((_, Tok::Ident(s))) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.keyword_at(self.pos, kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let mut lhs = self.and()?;
        while self.eat("||") || self.eat_keyword("OR") {
            lhs = AstExpr::binary(BinaryOp::Or, lhs, self.and()?);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let mut lhs = self.comparison()?;
        while self.eat("&&") || self.eat_keyword("AND") {
            lhs = AstExpr::binary(BinaryOp::And, lhs, self.comparison()?);
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let lhs = self.additive()?;
        let op = if self.eat("==") {
            BinaryOp::Eq
        } else if self.eat("!=") {
            BinaryOp::Ne
        } else if self.eat("<=") {
            BinaryOp::Le
        } else if self.eat(">=") {
            BinaryOp::Ge
        } else if self.eat("<") {
            BinaryOp::Lt
        } else if self.eat(">") {
            BinaryOp::Gt
        } else if self.eat_keyword("IN") {
            BinaryOp::In
        } else if self.keyword_at(self.pos, "NOT") && self.keyword_at(self.pos + 1, "IN") {
            self.pos += 2;
            BinaryOp::NotIn
        } else {
            return Ok(lhs);
        };
        Ok(AstExpr::binary(op, lhs, self.additive()?))
    }

    fn additive(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat("+") {
                BinaryOp::Add
            } else if self.eat("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            lhs = AstExpr::binary(op, lhs, self.multiplicative()?);
        }
    }

    fn multiplicative(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat("*") {
                BinaryOp::Mul
            } else if self.eat("/") {
                BinaryOp::Div
            } else if self.eat("%") {
                BinaryOp::Mod
            } else {
                return Ok(lhs);
            };
            lhs = AstExpr::binary(op, lhs, self.unary()?);
        }
    }

    fn unary(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        if self.eat("!") || self.eat_keyword("NOT") {
            let operand = self.unary()?;
            return Ok(AstExpr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat("-") {
            let operand = self.unary()?;
            return Ok(match negate_literal(&operand) {
                Some(v) => AstExpr::Value(v),
                None => AstExpr::Unary {
                    op: UnaryOp::Minus,
                    operand: Box::new(operand),
                },
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let mut expr = self.primary()?;
        while self.eat(".") {
            let at = self.offset();
            match self.next() {
                Some(Tok::Ident(name)) => {
                    expr = AstExpr::Attribute {
                        base: Box::new(expr),
                        name,
                    }
                }
                _ => return Err(syntax(at, "expected attribute name after '.'")),
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<AstExpr, ExprSyntaxError> {
        let at = self.offset();
        match self.next() {
            Some(Tok::Num(n)) => Ok(AstExpr::Value(Value::Number(n))),
            Some(Tok::Str(s)) => Ok(AstExpr::Value(Value::String(s))),
            Some(Tok::Punct("(")) => {
                let inner = self.or()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Tok::Punct("[")) => {
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.or()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                Ok(AstExpr::Array(items))
            }
            Some(Tok::Punct("{")) => {
                let mut fields = Vec::new();
                if !self.eat("}") {
                    loop {
                        let key_at = self.offset();
                        let key = match self.next() {
                            Some(Tok::Ident(k)) | Some(Tok::Str(k)) => k,
                            _ => return Err(syntax(key_at, "expected object key")),
                        };
                        self.expect(":")?;
                        fields.push((key, self.or()?));
                        if self.eat("}") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                Ok(AstExpr::Object(fields))
            }
            Some(Tok::Ident(name)) => {
                if self.eat("(") {
                    let mut args = Vec::new();
                    if !self.eat(")") {
                        loop {
                            args.push(self.or()?);
                            if self.eat(")") {
                                break;
                            }
                            self.expect(",")?;
                        }
                    }
                    return Ok(AstExpr::Call {
                        name: name.to_ascii_uppercase(),
                        args,
                    });
                }
                Ok(match name.to_ascii_lowercase().as_str() {
                    "true" => AstExpr::Value(Value::Bool(true)),
                    "false" => AstExpr::Value(Value::Bool(false)),
                    "null" => AstExpr::Value(Value::Null),
                    _ => AstExpr::Name(name),
                })
            }
            Some(Tok::Punct(p)) => Err(syntax(at, format!("unexpected '{p}'"))),
            None => Err(syntax(at, "unexpected end of expression")),
        }
    }
}

fn negate_literal(expr: &AstExpr) -> Option<Value> {
    let AstExpr::Value(Value::Number(n)) = expr else {
        return None;
    };
    if let Some(i) = n.as_i64() {
        return i.checked_neg().map(Value::from);
    }
    n.as_f64().and_then(|f| Number::from_f64(-f)).map(Value::Number)
}

/// Parse one expression; trailing input is an error.
pub fn parse_expr(src: &str) -> Result<AstExpr, ExprSyntaxError> {
    let mut parser = Parser {
        toks: tokenize(src)?,
        pos: 0,
        end: src.len(),
    };
    let expr = parser.or()?;
    if parser.pos < parser.toks.len() {
        return Err(syntax(parser.offset(), "unexpected trailing input"));
    }
    Ok(expr)
}
