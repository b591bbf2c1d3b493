//! Frame predicate language.
//!
//! Manifests select and dispatch on streaming frames with small boolean
//! expressions:
//!
//! ```text
//! exists($.choices[*].delta)
//! $.type == 'content_block_delta' && $.delta.type == 'text_delta'
//! exists($.choices) || exists($.error)
//! $.usage != null
//! ```
//!
//! Expressions are parsed into an AST once when the pipeline is built.
//! `&&` binds tighter than `||`; both evaluate with short-circuit. An
//! absent path is falsey.

use crate::utils::json_path::JsonPath;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("empty predicate expression")]
    Empty,

    #[error("invalid predicate {expr:?}: {reason}")]
    Invalid { expr: String, reason: String },
}

/// A compiled predicate over a JSON frame.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `exists($.path)` — true when the path resolves to a non-null value
    Exists(JsonPath),
    /// `$.path == 'literal'`
    Eq(JsonPath, String),
    /// `$.path != 'literal'`
    Ne(JsonPath, String),
    /// `$.path != null`
    NotNull(JsonPath),
    /// `$.path == null`
    IsNull(JsonPath),
    /// Conjunction, short-circuit
    And(Vec<Predicate>),
    /// Disjunction, short-circuit
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Parse an expression. Precedence: comparisons, then `&&`, then `||`.
    pub fn parse(expr: &str) -> Result<Predicate, PredicateError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(PredicateError::Empty);
        }
        Self::parse_or(expr)
    }

    fn parse_or(expr: &str) -> Result<Predicate, PredicateError> {
        let parts = split_outside_quotes(expr, "||");
        if parts.len() > 1 {
            let terms = parts
                .into_iter()
                .map(|p| Self::parse_and(p.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Predicate::Or(terms));
        }
        Self::parse_and(expr)
    }

    fn parse_and(expr: &str) -> Result<Predicate, PredicateError> {
        let parts = split_outside_quotes(expr, "&&");
        if parts.len() > 1 {
            let terms = parts
                .into_iter()
                .map(|p| Self::parse_atom(p.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Predicate::And(terms));
        }
        Self::parse_atom(expr)
    }

    fn parse_atom(expr: &str) -> Result<Predicate, PredicateError> {
        if expr.is_empty() {
            return Err(PredicateError::Empty);
        }

        if let Some(rest) = expr.strip_prefix("exists(") {
            let inner = rest.strip_suffix(')').ok_or_else(|| PredicateError::Invalid {
                expr: expr.to_string(),
                reason: "unclosed exists(".to_string(),
            })?;
            let path = parse_path(inner.trim(), expr)?;
            return Ok(Predicate::Exists(path));
        }

        // != before == so "!=" is not mis-split at its '=' character
        if let Some((lhs, rhs)) = split_once_outside_quotes(expr, "!=") {
            let path = parse_path(lhs.trim(), expr)?;
            let rhs = rhs.trim();
            if rhs == "null" {
                return Ok(Predicate::NotNull(path));
            }
            return Ok(Predicate::Ne(path, parse_literal(rhs, expr)?));
        }

        if let Some((lhs, rhs)) = split_once_outside_quotes(expr, "==") {
            let path = parse_path(lhs.trim(), expr)?;
            let rhs = rhs.trim();
            if rhs == "null" {
                return Ok(Predicate::IsNull(path));
            }
            return Ok(Predicate::Eq(path, parse_literal(rhs, expr)?));
        }

        // Bare path: shorthand for exists()
        let path = parse_path(expr, expr)?;
        Ok(Predicate::Exists(path))
    }

    /// Evaluate against a frame.
    pub fn matches(&self, frame: &Value) -> bool {
        match self {
            Predicate::Exists(path) => path.exists(frame),
            Predicate::Eq(path, lit) => path
                .all(frame)
                .iter()
                .any(|v| value_equals_literal(v, lit)),
            Predicate::Ne(path, lit) => {
                // An absent path is falsey, so `!=` only holds for a present,
                // differing value.
                let values = path.all(frame);
                !values.is_empty() && values.iter().all(|v| !value_equals_literal(v, lit))
            }
            Predicate::NotNull(path) => path.exists(frame),
            Predicate::IsNull(path) => {
                let values = path.all(frame);
                !values.is_empty() && values.iter().all(|v| v.is_null())
            }
            Predicate::And(terms) => terms.iter().all(|t| t.matches(frame)),
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(frame)),
        }
    }
}

fn parse_path(s: &str, expr: &str) -> Result<JsonPath, PredicateError> {
    JsonPath::parse(s).map_err(|e| PredicateError::Invalid {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

fn parse_literal(s: &str, expr: &str) -> Result<String, PredicateError> {
    let s = s.trim();
    let unquoted = s
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|r| r.strip_suffix('"')));
    match unquoted {
        Some(lit) => Ok(lit.to_string()),
        // Bare numbers and booleans compare by their canonical rendering
        None if !s.is_empty() && !s.contains(char::is_whitespace) => Ok(s.to_string()),
        _ => Err(PredicateError::Invalid {
            expr: expr.to_string(),
            reason: format!("malformed literal {:?}", s),
        }),
    }
}

fn value_equals_literal(v: &Value, lit: &str) -> bool {
    match v {
        Value::String(s) => s == lit,
        Value::Number(n) => n.to_string() == lit,
        Value::Bool(b) => b.to_string() == lit,
        _ => false,
    }
}

/// Split on `sep` wherever it appears outside single/double quotes.
fn split_outside_quotes<'a>(expr: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let bytes = expr.as_bytes();
    let sep_bytes = sep.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if bytes[i..].starts_with(sep_bytes) => {
                parts.push(&expr[start..i]);
                i += sep_bytes.len();
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

fn split_once_outside_quotes<'a>(expr: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    let parts = split_outside_quotes(expr, sep);
    if parts.len() < 2 {
        return None;
    }
    let lhs = parts[0];
    let rhs = &expr[lhs.len() + sep.len()..];
    Some((lhs, rhs))
}
