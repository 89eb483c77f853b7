//! In-memory backend for the query AST.
//!
//! Evaluates a parsed query directly against a metadata document, with the
//! same list-field semantics as the SQL backend. Exists primarily so the
//! compiler can be tested independently of the storage backend, and doubles
//! as a reference implementation of the query semantics.

use std::cmp::Ordering;

use serde_json::Value;

use super::{Condition, Query};

impl Query {
    /// Evaluate this query against a metadata document.
    pub fn matches(&self, metadata: &Value) -> bool {
        match self {
            Query::And(queries) => queries.iter().all(|query| query.matches(metadata)),
            Query::Or(queries) => queries.iter().any(|query| query.matches(metadata)),
            Query::Not(query) => !query.matches(metadata),
            Query::Nor(queries) => !queries.iter().any(|query| query.matches(metadata)),
            Query::Field { path, condition } => condition.matches(lookup(metadata, path)),
        }
    }
}

fn lookup<'a>(metadata: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = metadata;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

impl Condition {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Condition::All(values) => match field {
                Some(Value::Array(members)) => values
                    .iter()
                    .all(|value| members.iter().any(|member| values_equal(member, value))),
                _ => false,
            },
            Condition::ElemMatch(inner) => match field {
                Some(Value::Array(members)) => members.iter().any(|member| inner.compare(member)),
                _ => false,
            },
            _ => match field {
                // A scalar condition on an array field tests for a matching member.
                Some(Value::Array(members)) => members.iter().any(|member| self.compare(member)),
                Some(value) => self.compare(value),
                // Missing fields match nothing, mirroring SQL NULL comparisons.
                None => false,
            },
        }
    }

    fn compare(&self, value: &Value) -> bool {
        match self {
            Condition::Eq(target) => values_equal(value, target),
            Condition::Ne(target) => !values_equal(value, target),
            Condition::In(targets) => targets.iter().any(|target| values_equal(value, target)),
            Condition::Nin(targets) => !targets.iter().any(|target| values_equal(value, target)),
            Condition::Gt(target) => compare_values(value, target) == Some(Ordering::Greater),
            Condition::Gte(target) => matches!(
                compare_values(value, target),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt(target) => compare_values(value, target) == Some(Ordering::Less),
            Condition::Lte(target) => matches!(
                compare_values(value, target),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::Glob(pattern) => match value {
                Value::String(text) => glob_match(pattern, text),
                // SQLite casts numbers to text before GLOB.
                Value::Number(number) => glob_match(pattern, &number.to_string()),
                _ => false,
            },
            // Array conditions never apply member-wise.
            Condition::All(_) | Condition::ElemMatch(_) => false,
        }
    }
}

/// Equality with numeric coercion (28 == 28.0), matching SQL comparison of
/// JSON-extracted values.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQLite-style GLOB matching: `*` any sequence, `?` one character,
/// `[...]`/`[^...]` character classes with ranges. Case-sensitive.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob(&pattern, &text)
}

fn glob(pattern: &[char], text: &[char]) -> bool {
    let Some(&first) = pattern.first() else {
        return text.is_empty();
    };

    match first {
        '*' => (0..=text.len()).any(|skip| glob(&pattern[1..], &text[skip..])),
        '?' => !text.is_empty() && glob(&pattern[1..], &text[1..]),
        '[' => {
            let Some(&current) = text.first() else {
                return false;
            };
            match match_class(&pattern[1..], current) {
                Some((consumed, matched)) => {
                    matched && glob(&pattern[1 + consumed..], &text[1..])
                }
                // No closing bracket: treat '[' as a literal.
                None => current == '[' && glob(&pattern[1..], &text[1..]),
            }
        }
        literal => text.first() == Some(&literal) && glob(&pattern[1..], &text[1..]),
    }
}

/// Match one character against a class body; returns (chars consumed
/// including the closing bracket, matched).
fn match_class(body: &[char], current: char) -> Option<(usize, bool)> {
    let mut index = 0;
    let negated = body.first() == Some(&'^');
    if negated {
        index += 1;
    }

    let mut matched = false;
    let mut first_member = true;
    loop {
        let &member = body.get(index)?;
        if member == ']' && !first_member {
            return Some((index + 1, matched != negated));
        }
        first_member = false;

        // Range like a-z (a trailing '-' is a literal).
        if body.get(index + 1) == Some(&'-') && body.get(index + 2).is_some_and(|&c| c != ']') {
            let &upper = body.get(index + 2)?;
            if member <= current && current <= upper {
                matched = true;
            }
            index += 3;
        } else {
            if member == current {
                matched = true;
            }
            index += 1;
        }
    }
}
