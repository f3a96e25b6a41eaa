//! `CREATE PERFETTO MACRO` table and `name!(args)` textual expansion.

use std::collections::HashMap;
use tracedb_core::status::{Result, TraceDbError};

/// The closed set of syntactic categories a macro argument (or return type)
/// may declare. Anything else is rejected with `MacroError` at definition
/// time, matching the closed-category rule in the design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroArgKind {
    ColumnNameList,
    ProjectionFragment,
    TableNameList,
    ColumnName,
    Expr,
    TableOrSubquery,
}

impl MacroArgKind {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "ColumnNameList" => Some(Self::ColumnNameList),
            "_ProjectionFragment" => Some(Self::ProjectionFragment),
            "_TableNameList" => Some(Self::TableNameList),
            "ColumnName" => Some(Self::ColumnName),
            "Expr" => Some(Self::Expr),
            "TableOrSubquery" => Some(Self::TableOrSubquery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub name: String,
    pub args: Vec<(String, MacroArgKind)>,
    pub return_type: MacroArgKind,
    pub body: String,
}

/// Registry of `CREATE PERFETTO MACRO` definitions, keyed by name.
#[derive(Debug, Default)]
pub struct MacroTable {
    macros: HashMap<String, MacroDef>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: MacroDef, replace: bool) -> Result<()> {
        if !replace && self.macros.contains_key(&def.name) {
            return Err(TraceDbError::DuplicateDefinition {
                message: format!("macro {} already exists", def.name),
            });
        }
        self.macros.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MacroDef> {
        self.macros.get(name)
    }

    /// Expands every `name!(arg, arg, ...)` invocation found in `sql`,
    /// substituting the macro body with its arguments replaced positionally.
    /// Expansion is purely textual and is not recursive across calls beyond
    /// what a single pass naturally re-scans, mirroring the source engine's
    /// single-substitution macro semantics.
    pub fn expand(&self, sql: &str) -> Result<String> {
        let mut out = String::with_capacity(sql.len());
        let bytes = sql.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if is_ident_start(bytes[i]) {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                let ident = &sql[start..i];
                if i < bytes.len() && bytes[i] == b'!' && i + 1 < bytes.len() && bytes[i + 1] == b'(' {
                    let paren_start = i + 1;
                    let close = find_matching_paren(sql, paren_start)?;
                    let args_str = &sql[paren_start + 1..close];
                    let args = split_top_level(args_str);
                    let expanded = self.expand_one(ident, &args)?;
                    out.push_str(&expanded);
                    i = close + 1;
                    continue;
                }
                out.push_str(ident);
                continue;
            }
            out.push(bytes[i] as char);
            i += 1;
        }
        Ok(out)
    }

    fn expand_one(&self, name: &str, args: &[String]) -> Result<String> {
        let def = self
            .macros
            .get(name)
            .ok_or_else(|| TraceDbError::MacroError {
                message: format!("unknown macro {name}"),
            })?;
        if args.len() != def.args.len() {
            return Err(TraceDbError::MacroError {
                message: format!(
                    "macro {name} expects {} arguments, got {}",
                    def.args.len(),
                    args.len()
                ),
            });
        }
        let mut body = def.body.clone();
        for ((arg_name, _kind), value) in def.args.iter().zip(args.iter()) {
            body = body.replace(arg_name, value.trim());
        }
        Ok(format!("({body})"))
    }
}

pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

pub(crate) fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

pub(crate) fn find_matching_paren(sql: &str, open_idx: usize) -> Result<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0i32;
    let mut i = open_idx;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(TraceDbError::ParseError {
        message: "unterminated macro invocation".into(),
    })
}

pub(crate) fn split_top_level(s: &str) -> Vec<String> {
    if s.trim().is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_macro_with_single_argument() {
        let mut table = MacroTable::new();
        table
            .define(
                MacroDef {
                    name: "double_it".into(),
                    args: vec![("x".into(), MacroArgKind::Expr)],
                    return_type: MacroArgKind::Expr,
                    body: "x + x".into(),
                },
                false,
            )
            .unwrap();
        let out = table.expand("SELECT double_it!(5)").unwrap();
        assert_eq!(out, "SELECT (5 + 5)");
    }

    #[test]
    fn unknown_macro_errors() {
        let table = MacroTable::new();
        let err = table.expand("SELECT foo!(1)").unwrap_err();
        assert!(matches!(err, TraceDbError::MacroError { .. }));
    }

    #[test]
    fn redefining_without_replace_fails() {
        let mut table = MacroTable::new();
        let def = MacroDef {
            name: "m".into(),
            args: vec![],
            return_type: MacroArgKind::Expr,
            body: "1".into(),
        };
        table.define(def.clone(), false).unwrap();
        let err = table.define(def, false).unwrap_err();
        assert!(matches!(err, TraceDbError::DuplicateDefinition { .. }));
    }
}
