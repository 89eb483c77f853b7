//! SQL backend for the query AST.
//!
//! Emits a predicate over the index's `jobs` table, where the metadata
//! document lives in a JSON column named `metadata`. The list-field
//! semantics are compiled into a runtime branch on
//! `json_type(metadata, '$.field')`: member-exists over `json_each` when
//! the field holds an array, plain comparison otherwise.
//!
//! String literals are rendered with quote doubling. Query documents come
//! from user-controlled metadata searches, so naive concatenation is not
//! acceptable even though the index is local.

use serde_json::Value;

use crate::error::{Error, Result};

use super::{Condition, Query};

impl Query {
    /// Compile this query into a SQL predicate over the `jobs` table.
    pub fn to_sql(&self) -> Result<String> {
        match self {
            Query::And(queries) if queries.is_empty() => Ok("1".to_string()),
            Query::And(queries) => join(queries, " AND "),
            Query::Or(queries) if queries.is_empty() => Ok("0".to_string()),
            Query::Or(queries) => join(queries, " OR "),
            Query::Not(query) => Ok(format!("NOT ({})", query.to_sql()?)),
            Query::Nor(queries) => Ok(format!(
                "NOT ({})",
                Query::Or(queries.clone()).to_sql()?
            )),
            Query::Field { path, condition } => condition.to_sql(path),
        }
    }
}

fn join(queries: &[Query], separator: &str) -> Result<String> {
    let parts = queries
        .iter()
        .map(|query| Ok(format!("({})", query.to_sql()?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(separator))
}

impl Condition {
    fn to_sql(&self, path: &str) -> Result<String> {
        let json_path = json_path_literal(path);
        let scalar = format!("metadata->>{json_path}");

        match self {
            Condition::All(values) => {
                let mut sql = format!("(json_type(metadata, {json_path}) = 'array'");
                for value in values {
                    sql.push_str(&format!(
                        " AND EXISTS (SELECT 1 FROM json_each(metadata, {json_path}) \
                         WHERE value = {})",
                        literal(value)?
                    ));
                }
                sql.push(')');
                Ok(sql)
            }
            Condition::ElemMatch(inner) => Ok(format!(
                "(json_type(metadata, {json_path}) = 'array' AND EXISTS \
                 (SELECT 1 FROM json_each(metadata, {json_path}) WHERE {}))",
                inner.comparison("value")?
            )),
            _ => Ok(format!(
                "(CASE WHEN json_type(metadata, {json_path}) = 'array' \
                 THEN EXISTS (SELECT 1 FROM json_each(metadata, {json_path}) WHERE {}) \
                 ELSE {} END)",
                self.comparison("value")?,
                self.comparison(&scalar)?
            )),
        }
    }

    /// Render this condition as a comparison of the given SQL expression.
    fn comparison(&self, expr: &str) -> Result<String> {
        match self {
            Condition::Eq(value) => Ok(format!("{expr} = {}", literal(value)?)),
            Condition::Ne(value) => Ok(format!("{expr} != {}", literal(value)?)),
            Condition::In(values) if values.is_empty() => Ok("1 = 0".to_string()),
            Condition::In(values) => Ok(format!("{expr} IN ({})", literals(values)?)),
            // NOT IN with an empty list matches every present value.
            Condition::Nin(values) if values.is_empty() => Ok(format!("{expr} IS NOT NULL")),
            Condition::Nin(values) => Ok(format!("{expr} NOT IN ({})", literals(values)?)),
            Condition::Gt(value) => Ok(format!("{expr} > {}", literal(value)?)),
            Condition::Gte(value) => Ok(format!("{expr} >= {}", literal(value)?)),
            Condition::Lt(value) => Ok(format!("{expr} < {}", literal(value)?)),
            Condition::Lte(value) => Ok(format!("{expr} <= {}", literal(value)?)),
            Condition::Glob(pattern) => {
                Ok(format!("{expr} GLOB {}", quote(pattern)))
            }
            Condition::All(_) | Condition::ElemMatch(_) => Err(Error::Invalid(
                "array condition cannot be used as a member comparison".to_string(),
            )),
        }
    }
}

fn json_path_literal(path: &str) -> String {
    format!("'$.{}'", path.replace('\'', "''"))
}

fn literals(values: &[Value]) -> Result<String> {
    let rendered = values.iter().map(literal).collect::<Result<Vec<_>>>()?;
    Ok(rendered.join(", "))
}

fn literal(value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(quote(text)),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) => Ok("0".to_string()),
        Value::Null => Ok("NULL".to_string()),
        Value::Array(_) | Value::Object(_) => Err(Error::Invalid(format!(
            "query literal must be a scalar, got: {value}"
        ))),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
