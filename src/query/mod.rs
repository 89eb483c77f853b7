//! Document-style metadata queries.
//!
//! Queries are MongoDB-like JSON documents describing a predicate over a
//! job's metadata. They are parsed once at the boundary into a first-class
//! AST, which two backends walk: [`sql`] emits the relational predicate
//! used by the index, [`eval`] evaluates directly against parsed metadata.
//!
//! # Supported syntax
//!
//! Top-level combinators: `$and`, `$or`, `$not`, `$nor`. A document with
//! several keys is an implicit conjunction. Any other key is a field
//! predicate on that metadata path.
//!
//! Leaf conditions: `$eq` (implicit for a scalar), `$ne`, `$in`, `$nin`,
//! `$gt`, `$gte`, `$lt`, `$lte`, `$glob`, `$all`, `$elemMatch`.
//!
//! When the referenced metadata value is an array, scalar conditions test
//! whether *some member* matches; `$all` and `$elemMatch` require an array.

use serde_json::Value;

use crate::error::{Error, Result};

mod eval;
mod sql;

/// Predicate over a metadata document.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    Nor(Vec<Query>),
    Field { path: String, condition: Condition },
}

/// Leaf condition applied to one metadata field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Glob(String),
    All(Vec<Value>),
    ElemMatch(Box<Condition>),
}

impl Query {
    /// Parse a query document.
    ///
    /// The empty document is the match-everything query.
    pub fn parse(document: &Value) -> Result<Query> {
        let Value::Object(map) = document else {
            return Err(Error::Invalid(format!(
                "query must be a document, got: {document}"
            )));
        };

        if map.len() > 1 {
            // Implicit conjunction.
            return Ok(Query::And(
                map.iter()
                    .map(|(key, value)| Self::parse_entry(key, value))
                    .collect::<Result<Vec<_>>>()?,
            ));
        }

        match map.iter().next() {
            Some((key, value)) => Self::parse_entry(key, value),
            None => Ok(Query::And(Vec::new())),
        }
    }

    fn parse_entry(key: &str, value: &Value) -> Result<Query> {
        match key {
            "$and" => Ok(Query::And(Self::parse_list(key, value)?)),
            "$or" => Ok(Query::Or(Self::parse_list(key, value)?)),
            "$nor" => Ok(Query::Nor(Self::parse_list(key, value)?)),
            "$not" => Ok(Query::Not(Box::new(Self::parse(value)?))),
            _ if key.starts_with('$') => {
                Err(Error::Invalid(format!("unsupported query operator: {key}")))
            }
            _ => Ok(Query::Field {
                path: key.to_string(),
                condition: Condition::parse(value)?,
            }),
        }
    }

    fn parse_list(operator: &str, value: &Value) -> Result<Vec<Query>> {
        let Value::Array(items) = value else {
            return Err(Error::Invalid(format!(
                "{operator} expects a list of sub-queries"
            )));
        };
        items.iter().map(Self::parse).collect()
    }
}

impl Condition {
    fn parse(value: &Value) -> Result<Condition> {
        let Value::Object(map) = value else {
            // A bare scalar (or list literal) is an implicit $eq.
            return Ok(Condition::Eq(value.clone()));
        };

        let has_operator = map.keys().any(|key| key.starts_with('$'));
        if !has_operator {
            // Equality against an object literal.
            return Ok(Condition::Eq(value.clone()));
        }

        if map.len() != 1 {
            return Err(Error::Invalid(format!("invalid condition: {value}")));
        }

        let (key, value) = map.iter().next().expect("map has exactly one entry");
        match key.as_str() {
            "$eq" => Ok(Condition::Eq(value.clone())),
            "$ne" => Ok(Condition::Ne(value.clone())),
            "$in" => Ok(Condition::In(Self::parse_values(key, value)?)),
            "$nin" => Ok(Condition::Nin(Self::parse_values(key, value)?)),
            "$gt" => Ok(Condition::Gt(value.clone())),
            "$gte" => Ok(Condition::Gte(value.clone())),
            "$lt" => Ok(Condition::Lt(value.clone())),
            "$lte" => Ok(Condition::Lte(value.clone())),
            "$glob" => match value {
                Value::String(pattern) => Ok(Condition::Glob(pattern.clone())),
                _ => Err(Error::Invalid(format!(
                    "$glob expects a string pattern, got: {value}"
                ))),
            },
            "$all" => Ok(Condition::All(Self::parse_values(key, value)?)),
            "$elemMatch" => {
                let inner = Self::parse(value)?;
                if matches!(inner, Condition::All(_) | Condition::ElemMatch(_)) {
                    return Err(Error::Invalid(
                        "$elemMatch expects a scalar condition".to_string(),
                    ));
                }
                Ok(Condition::ElemMatch(Box::new(inner)))
            }
            _ => Err(Error::Invalid(format!("unsupported query operator: {key}"))),
        }
    }

    fn parse_values(operator: &str, value: &Value) -> Result<Vec<Value>> {
        let Value::Array(items) = value else {
            return Err(Error::Invalid(format!("{operator} expects a list")));
        };
        Ok(items.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalar_is_implicit_eq() {
        let query = Query::parse(&json!({"dataset": "mnist"})).unwrap();
        assert_eq!(
            query,
            Query::Field {
                path: "dataset".to_string(),
                condition: Condition::Eq(json!("mnist")),
            }
        );
    }

    #[test]
    fn multi_key_document_is_implicit_and() {
        let query = Query::parse(&json!({"a": 1, "b": 2})).unwrap();
        let Query::And(parts) = query else {
            panic!("expected implicit conjunction");
        };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn empty_document_matches_everything() {
        assert_eq!(Query::parse(&json!({})).unwrap(), Query::And(Vec::new()));
    }

    #[test]
    fn nested_combinators() {
        let query = Query::parse(&json!({
            "$or": [
                {"$and": [{"a": 1}, {"b": 2}]},
                {"$not": {"c": 3}},
            ]
        }))
        .unwrap();
        let Query::Or(parts) = query else {
            panic!("expected $or");
        };
        assert!(matches!(parts[0], Query::And(_)));
        assert!(matches!(parts[1], Query::Not(_)));
    }

    #[test]
    fn unknown_top_level_operator_is_rejected() {
        let result = Query::parse(&json!({"$xor": [{"a": 1}]}));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn unknown_condition_operator_is_rejected() {
        let result = Query::parse(&json!({"a": {"$near": 1}}));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn mixed_operator_condition_is_rejected() {
        let result = Query::parse(&json!({"a": {"$gt": 1, "$lt": 5}}));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn in_requires_a_list() {
        let result = Query::parse(&json!({"a": {"$in": "x"}}));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn glob_requires_a_string() {
        let result = Query::parse(&json!({"a": {"$glob": 3}}));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn elem_match_parses_inner_condition() {
        let query = Query::parse(&json!({"sizes": {"$elemMatch": {"$gt": 28}}})).unwrap();
        assert_eq!(
            query,
            Query::Field {
                path: "sizes".to_string(),
                condition: Condition::ElemMatch(Box::new(Condition::Gt(json!(28)))),
            }
        );
    }

    #[test]
    fn elem_match_rejects_nested_array_conditions() {
        let result = Query::parse(&json!({"a": {"$elemMatch": {"$all": [1]}}}));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn non_document_query_is_rejected() {
        let result = Query::parse(&json!(["not", "a", "document"]));
        assert!(matches!(result, Err(Error::Invalid(_))));
    }
}
