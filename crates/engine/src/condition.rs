//! Edge condition evaluation.
//!
//! Conditions are evaluated through the [`ConditionEvaluator`] trait so a
//! richer expression language can be plugged in. The built-in
//! [`SimpleConditionEvaluator`] understands:
//!
//! - `path` / `!path`: truthiness of a context value
//! - `path OP operand` with `==`, `!=`, `>`, `>=`, `<`, `<=`
//! - operands: numbers, `'single'`/`"double"` quoted strings, `true`,
//!   `false`, `null`, or another path
//! - `&&` and `||` (`&&` binds tighter); no parentheses
//!
//! Paths are dotted (`order.total`) and address nested objects; a missing
//! path resolves to `null`.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    #[error("empty condition expression")]
    Empty,

    #[error("malformed condition '{0}'")]
    Malformed(String),

    #[error("cannot compare {left} with {right} using '{op}'")]
    Incomparable { left: Value, right: Value, op: String },
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Map<String, Value>) -> Result<bool, ConditionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleConditionEvaluator;

impl ConditionEvaluator for SimpleConditionEvaluator {
    fn evaluate(&self, expression: &str, context: &Map<String, Value>) -> Result<bool, ConditionError> {
        if expression.trim().is_empty() {
            return Err(ConditionError::Empty);
        }
        for disjunct in split_outside_quotes(expression, "||") {
            let mut all = true;
            for conjunct in split_outside_quotes(disjunct, "&&") {
                if !evaluate_atom(conjunct, context)? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

const OPERATORS: [&str; 6] = [">=", "<=", "==", "!=", ">", "<"];

fn evaluate_atom(atom: &str, context: &Map<String, Value>) -> Result<bool, ConditionError> {
    let atom = atom.trim();
    if atom.is_empty() {
        return Err(ConditionError::Malformed(atom.to_owned()));
    }

    if let Some((pos, op)) = find_operator(atom) {
        let left = atom[..pos].trim();
        let right = atom[pos + op.len()..].trim();
        if left.is_empty() || right.is_empty() {
            return Err(ConditionError::Malformed(atom.to_owned()));
        }
        let lhs = operand(left, context)?;
        let rhs = operand(right, context)?;
        return compare(&lhs, &rhs, op);
    }

    if let Some(rest) = atom.strip_prefix('!') {
        return evaluate_atom(rest, context).map(|v| !v);
    }

    if !is_path(atom) {
        return Err(ConditionError::Malformed(atom.to_owned()));
    }
    Ok(truthy(&resolve_path(atom, context)))
}

/// First comparison operator outside quotes; two-character operators win
/// over their one-character prefixes at the same position.
fn find_operator(atom: &str) -> Option<(usize, &'static str)> {
    let bytes = atom.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None => {
                for op in OPERATORS {
                    if atom[i..].starts_with(op) {
                        return Some((i, op));
                    }
                }
            }
        }
        i += 1;
    }
    None
}

fn split_outside_quotes<'a>(input: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut chars = input.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if input[idx..].starts_with(separator) => {
                parts.push(&input[start..idx]);
                start = idx + separator.len();
                for _ in 1..separator.len() {
                    chars.next();
                }
            }
            None => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn operand(raw: &str, context: &Map<String, Value>) -> Result<Value, ConditionError> {
    if let Some(literal) = parse_literal(raw) {
        return Ok(literal);
    }
    if is_path(raw) {
        return Ok(resolve_path(raw, context));
    }
    Err(ConditionError::Malformed(raw.to_owned()))
}

fn parse_literal(raw: &str) -> Option<Value> {
    match raw {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    for q in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            return Some(Value::String(raw[1..raw.len() - 1].to_owned()));
        }
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Some(Value::from(int));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Value::from)
}

fn is_path(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-'))
}

fn resolve_path(path: &str, context: &Map<String, Value>) -> Value {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Value::Null;
    };
    let mut current = match context.get(first) {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(lhs: &Value, rhs: &Value, op: &str) -> Result<bool, ConditionError> {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        "==" => Ok(ordering.map(|o| o == Ordering::Equal).unwrap_or(lhs == rhs)),
        "!=" => Ok(ordering.map(|o| o != Ordering::Equal).unwrap_or(lhs != rhs)),
        _ => {
            let Some(ordering) = ordering else {
                return Err(ConditionError::Incomparable {
                    left: lhs.clone(),
                    right: rhs.clone(),
                    op: op.to_owned(),
                });
            };
            Ok(match op {
                ">" => ordering == Ordering::Greater,
                ">=" => ordering != Ordering::Less,
                "<" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn eval(expr: &str, context: &Map<String, Value>) -> Result<bool, ConditionError> {
        SimpleConditionEvaluator.evaluate(expr, context)
    }

    #[test]
    fn numeric_comparisons() {
        let c = ctx(json!({ "x": 3, "y": 2.5 }));
        assert_eq!(eval("x > 0", &c), Ok(true));
        assert_eq!(eval("x >= 3", &c), Ok(true));
        assert_eq!(eval("x < 3", &c), Ok(false));
        assert_eq!(eval("y <= 2.5", &c), Ok(true));
        assert_eq!(eval("x == 3.0", &c), Ok(true));
        assert_eq!(eval("x != 3", &c), Ok(false));
        assert_eq!(eval("x > y", &c), Ok(true));
    }

    #[test]
    fn strings_booleans_and_null() {
        let c = ctx(json!({ "status": "approved", "flag": true, "empty": "" }));
        assert_eq!(eval("status == 'approved'", &c), Ok(true));
        assert_eq!(eval("status != \"rejected\"", &c), Ok(true));
        assert_eq!(eval("flag == true", &c), Ok(true));
        assert_eq!(eval("missing == null", &c), Ok(true));
        assert_eq!(eval("flag", &c), Ok(true));
        assert_eq!(eval("!flag", &c), Ok(false));
        assert_eq!(eval("empty", &c), Ok(false));
        assert_eq!(eval("!missing", &c), Ok(true));
    }

    #[test]
    fn nested_paths() {
        let c = ctx(json!({ "order": { "total": 120, "items": [ { "sku": "A1" } ] } }));
        assert_eq!(eval("order.total > 100", &c), Ok(true));
        assert_eq!(eval("order.items.0.sku == 'A1'", &c), Ok(true));
        assert_eq!(eval("order.missing.deep", &c), Ok(false));
    }

    #[test]
    fn boolean_connectives() {
        let c = ctx(json!({ "a": 1, "b": 0 }));
        assert_eq!(eval("a > 0 && b > 0", &c), Ok(false));
        assert_eq!(eval("a > 0 || b > 0", &c), Ok(true));
        assert_eq!(eval("b > 0 || a > 0 && b == 0", &c), Ok(true));
    }

    #[test]
    fn operators_inside_quotes_are_literal() {
        let c = ctx(json!({ "s": "a || b && c > d" }));
        assert_eq!(eval("s == 'a || b && c > d'", &c), Ok(true));
    }

    #[test]
    fn malformed_and_incomparable_expressions_are_errors() {
        let c = ctx(json!({ "s": "text", "n": 1 }));
        assert_eq!(eval("   ", &c), Err(ConditionError::Empty));
        assert!(matches!(eval("> 3", &c), Err(ConditionError::Malformed(_))));
        assert!(matches!(eval("a &&", &c), Err(ConditionError::Malformed(_))));
        assert!(matches!(eval("s > n", &c), Err(ConditionError::Incomparable { .. })));
    }
}
