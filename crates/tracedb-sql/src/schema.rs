//! Schema validation for `CREATE PERFETTO TABLE`/`VIEW`/`FUNCTION` bodies.

use crate::parser::ArgumentDefinition;
use std::collections::HashSet;
use tracedb_core::status::{Result, TraceDbError};
use tracedb_core::value::Value;

/// Column storage kind a declared type maps to, mirroring §4.6's
/// declared-type-to-column-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int64,
    Double,
    String,
}

pub fn declared_type_to_column_kind(declared: &str) -> Result<ColumnKind> {
    match declared.to_ascii_uppercase().as_str() {
        "LONG" | "BOOL" | "BOOLEAN" => Ok(ColumnKind::Int64),
        "DOUBLE" | "FLOAT" => Ok(ColumnKind::Double),
        "STRING" | "TEXT" => Ok(ColumnKind::String),
        "BYTES" => Ok(ColumnKind::Int64),
        "ANY" => Err(TraceDbError::schema_mismatch(
            "ANY is not a valid type for a table column",
        )),
        other => Err(TraceDbError::schema_mismatch(format!(
            "unknown declared type '{other}'"
        ))),
    }
}

/// Validates a query's actual output column names against an optional
/// user-declared schema and returns the declared schema reordered to match
/// the actual column order. If `declared` is `None`, only the duplicate
/// check is performed and `actual` is echoed back with type `String`
/// for a best-effort default (callers that need no typed schema, such as
/// CREATE VIEW without one, pass `None`).
pub fn validate_schema(
    actual: &[String],
    declared: Option<&[ArgumentDefinition]>,
) -> Result<Vec<ArgumentDefinition>> {
    let mut seen = HashSet::new();
    for name in actual {
        if !seen.insert(name.clone()) {
            return Err(TraceDbError::schema_mismatch(format!(
                "multiple columns are named: {name}"
            )));
        }
    }
    let declared = match declared {
        None => {
            return Ok(actual
                .iter()
                .map(|n| ArgumentDefinition {
                    name: n.clone(),
                    declared_type: "STRING".into(),
                })
                .collect())
        }
        Some(d) => d,
    };

    let actual_set: HashSet<&str> = actual.iter().map(String::as_str).collect();
    let declared_set: HashSet<&str> = declared.iter().map(|d| d.name.as_str()).collect();

    let missing_from_query: Vec<&str> = declared_set.difference(&actual_set).copied().collect();
    let missing_from_schema: Vec<&str> = actual_set.difference(&declared_set).copied().collect();

    if !missing_from_query.is_empty() || !missing_from_schema.is_empty() {
        let mut msg = String::new();
        if !missing_from_query.is_empty() {
            let mut names = missing_from_query.clone();
            names.sort_unstable();
            msg.push_str(&format!(
                "the following columns are declared in the schema, but do not exist: {}",
                names.join(", ")
            ));
        }
        if !missing_from_schema.is_empty() {
            if !msg.is_empty() {
                msg.push_str("; and ");
            }
            let mut names = missing_from_schema.clone();
            names.sort_unstable();
            msg.push_str(&format!(
                "the following columns exist, but are not declared: {}",
                names.join(", ")
            ));
        }
        return Err(TraceDbError::schema_mismatch(msg));
    }

    let mut by_name: std::collections::HashMap<&str, &ArgumentDefinition> =
        declared.iter().map(|d| (d.name.as_str(), d)).collect();
    Ok(actual
        .iter()
        .map(|name| by_name.remove(name.as_str()).cloned().expect("validated above"))
        .collect())
}

/// Checks a single call-site argument against its declared scalar type
/// (§4.6/§4.7). Shared by table-valued function invocation
/// ([`crate::table_function`]) and scalar function registration
/// ([`crate::engine`]'s `CREATE PERFETTO FUNCTION` handling), which both
/// need the identical LONG/BOOL/DOUBLE/FLOAT/STRING/TEXT rule rather than
/// two copies of it.
pub fn type_check(value: &Value, expected: ColumnKind, arg_name: &str) -> Result<()> {
    let ok = match (value, expected) {
        (Value::Null, _) => true,
        (Value::Integer(_), ColumnKind::Int64) => true,
        (Value::Float(_), ColumnKind::Double) => true,
        (Value::Text(_), ColumnKind::String) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(TraceDbError::bad_argument(format!(
            "argument '{arg_name}' has the wrong type for this function"
        )))
    }
}

/// Validates that a column identifier is well-formed: non-empty, starts
/// with a letter or underscore, and contains only alphanumerics and
/// underscores thereafter.
pub fn validate_column_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(TraceDbError::schema_mismatch(format!(
                "column name '{name}' must start with a letter or underscore"
            )))
        }
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TraceDbError::schema_mismatch(format!(
            "column name '{name}' must be alphanumeric/underscore only"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(name: &str, ty: &str) -> ArgumentDefinition {
        ArgumentDefinition {
            name: name.into(),
            declared_type: ty.into(),
        }
    }

    #[test]
    fn schema_matching_actual_columns_succeeds() {
        let actual = vec!["x".to_string()];
        let declared = vec![arg("x", "LONG")];
        let result = validate_schema(&actual, Some(&declared)).unwrap();
        assert_eq!(result[0].name, "x");
    }

    #[test]
    fn schema_mismatch_reports_both_directions() {
        let actual = vec!["y".to_string()];
        let declared = vec![arg("x", "LONG")];
        let err = validate_schema(&actual, Some(&declared)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("declared in the schema, but do not exist: x"));
        assert!(msg.contains("exist, but are not declared: y"));
    }

    #[test]
    fn duplicate_actual_columns_rejected() {
        let actual = vec!["x".to_string(), "x".to_string()];
        let err = validate_schema(&actual, None).unwrap_err();
        assert!(err.to_string().contains("multiple columns are named"));
    }

    #[test]
    fn column_name_must_start_with_letter_or_underscore() {
        assert!(validate_column_name("_ok").is_ok());
        assert!(validate_column_name("ok_2").is_ok());
        assert!(validate_column_name("2bad").is_err());
    }
}
