//! Statement splitting and classification (§4.5).

use tracedb_core::status::{Result, TraceDbError};

/// A column declared in a `(name TYPE, ...)` schema clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentDefinition {
    pub name: String,
    pub declared_type: String,
}

#[derive(Debug, Clone)]
pub struct CreateTableStmt {
    pub replace: bool,
    pub name: String,
    pub schema: Option<Vec<ArgumentDefinition>>,
    pub body_sql: String,
}

#[derive(Debug, Clone)]
pub struct CreateViewStmt {
    pub replace: bool,
    pub name: String,
    pub schema: Option<Vec<ArgumentDefinition>>,
    pub body_sql: String,
    pub full_text: String,
}

#[derive(Debug, Clone)]
pub enum FunctionReturn {
    Scalar(String),
    Table(Vec<ArgumentDefinition>),
}

#[derive(Debug, Clone)]
pub struct CreateFunctionStmt {
    pub replace: bool,
    pub name: String,
    pub args: Vec<ArgumentDefinition>,
    pub returns: FunctionReturn,
    pub body_sql: Option<String>,
    pub alias_of: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateMacroStmt {
    pub replace: bool,
    pub name: String,
    pub args: Vec<(String, String)>,
    pub return_type: String,
    pub body_sql: String,
}

#[derive(Debug, Clone)]
pub struct CreateIndexStmt {
    pub replace: bool,
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DropIndexStmt {
    pub index_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone)]
pub struct IncludeStmt {
    pub key: String,
}

/// One statement yielded by [`SqlParser`].
#[derive(Debug, Clone)]
pub enum Statement {
    SqliteSql(String),
    CreateTable(CreateTableStmt),
    CreateView(CreateViewStmt),
    CreateFunction(CreateFunctionStmt),
    CreateMacro(CreateMacroStmt),
    CreateIndex(CreateIndexStmt),
    DropIndex(DropIndexStmt),
    Include(IncludeStmt),
}

/// Splits a SQL source into top-level statements (on `;`, respecting quotes
/// and parens) and classifies each one. Consumed incrementally by the
/// engine's frame-stack execution loop (§4.6), which calls [`SqlParser::next`]
/// once per iteration rather than eagerly collecting a `Vec`, so that a
/// syntax error deep in a long source does not block inspection of earlier
/// statements' results.
///
/// Owns its source text (rather than borrowing it) so that a frame pushed
/// for an `INCLUDE`d module — whose SQL text is resolved at run time from
/// engine-owned state — can hold its own parser without fighting the
/// engine's `&mut self` borrow across the frame stack.
pub struct SqlParser {
    source: String,
    offset: usize,
}

impl SqlParser {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            offset: 0,
        }
    }

    /// True once every statement has been consumed.
    pub fn is_at_end(&self) -> bool {
        self.source[self.offset..].trim().is_empty()
    }

    /// Returns the next statement, or `Ok(None)` at end of input.
    pub fn next(&mut self) -> Result<Option<Statement>> {
        loop {
            let remainder = &self.source[self.offset..];
            let trimmed_start = remainder.len() - remainder.trim_start().len();
            self.offset += trimmed_start;
            let remainder = &self.source[self.offset..];
            if remainder.trim().is_empty() {
                return Ok(None);
            }
            let end = find_statement_end(remainder)?;
            let raw = remainder[..end].trim();
            self.offset += end + 1; // skip the ';'
            if raw.is_empty() {
                continue;
            }
            return Ok(Some(classify(raw)?));
        }
    }
}

/// Finds the index of the terminating `;` (or end-of-string) for the next
/// statement, skipping over string/identifier quoting and balanced parens so
/// that a `;` inside a literal or subquery does not split the statement.
fn find_statement_end(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    let mut i = 0usize;
    let mut depth = 0i32;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(TraceDbError::ParseError {
                        message: "unterminated string literal".into(),
                    });
                }
            }
            b'(' => depth += 1,
            b')' => depth -= 1,
            b';' if depth == 0 => return Ok(i),
            _ => {}
        }
        i += 1;
    }
    Ok(bytes.len())
}

fn classify(raw: &str) -> Result<Statement> {
    let upper: String = raw.to_ascii_uppercase();
    if upper.starts_with("INCLUDE PERFETTO MODULE") {
        let key = raw["INCLUDE PERFETTO MODULE".len()..].trim().trim_end_matches(';');
        return Ok(Statement::Include(IncludeStmt { key: key.to_string() }));
    }
    if upper.starts_with("DROP PERFETTO INDEX") {
        return parse_drop_index(raw);
    }
    let (replace, after_create) = strip_create_or_replace(raw, &upper)?;
    if let Some(after_create) = after_create {
        let after_upper = after_create.to_ascii_uppercase();
        if after_upper.trim_start().starts_with("PERFETTO TABLE") {
            return parse_create_table(replace, strip_prefix_ci(after_create, "PERFETTO TABLE"));
        }
        if after_upper.trim_start().starts_with("PERFETTO VIEW") {
            return parse_create_view(replace, strip_prefix_ci(after_create, "PERFETTO VIEW"), raw);
        }
        if after_upper.trim_start().starts_with("PERFETTO FUNCTION") {
            return parse_create_function(replace, strip_prefix_ci(after_create, "PERFETTO FUNCTION"));
        }
        if after_upper.trim_start().starts_with("PERFETTO MACRO") {
            return parse_create_macro(replace, strip_prefix_ci(after_create, "PERFETTO MACRO"));
        }
        if after_upper.trim_start().starts_with("PERFETTO INDEX") {
            return parse_create_index(replace, strip_prefix_ci(after_create, "PERFETTO INDEX"));
        }
    }
    Ok(Statement::SqliteSql(raw.to_string()))
}

fn strip_create_or_replace<'a>(raw: &'a str, upper: &str) -> Result<(bool, Option<&'a str>)> {
    if let Some(rest) = strip_prefix_ci_opt(upper, "CREATE OR REPLACE") {
        let byte_off = raw.len() - rest.len();
        return Ok((true, Some(raw[byte_off..].trim_start())));
    }
    if let Some(rest) = strip_prefix_ci_opt(upper, "CREATE") {
        let byte_off = raw.len() - rest.len();
        return Ok((false, Some(raw[byte_off..].trim_start())));
    }
    Ok((false, None))
}

fn strip_prefix_ci_opt<'a>(upper_haystack: &'a str, prefix: &str) -> Option<&'a str> {
    if upper_haystack.starts_with(prefix) {
        Some(&upper_haystack[prefix.len()..])
    } else {
        None
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> &'a str {
    s[prefix.len()..].trim_start()
}

fn parse_drop_index(raw: &str) -> Result<Statement> {
    let rest = strip_prefix_ci(raw, "DROP PERFETTO INDEX");
    let (index_name, rest) = take_identifier(rest)?;
    let rest = rest.trim_start();
    let rest = strip_prefix_ci_checked(rest, "ON")?;
    let (table_name, _) = take_identifier(rest)?;
    Ok(Statement::DropIndex(DropIndexStmt {
        index_name,
        table_name,
    }))
}

fn strip_prefix_ci_checked<'a>(s: &'a str, prefix: &str) -> Result<&'a str> {
    let trimmed = s.trim_start();
    if trimmed.len() >= prefix.len() && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Ok(trimmed[prefix.len()..].trim_start())
    } else {
        Err(TraceDbError::ParseError {
            message: format!("expected '{prefix}' in: {s}"),
        })
    }
}

fn take_identifier(s: &str) -> Result<(String, &str)> {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(s.len());
    if end == 0 {
        return Err(TraceDbError::ParseError {
            message: format!("expected identifier in: {s}"),
        });
    }
    Ok((s[..end].to_string(), &s[end..]))
}

/// Splits `name(args) AS body` / `name(args) RETURNS ... AS body` style
/// clauses, returning the head up to (excluding) the final top-level `AS`
/// and the body after it.
fn split_on_top_level_as(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && i + 2 <= bytes.len() {
            let rest = &s[i..];
            if rest.len() >= 2
                && rest[..2].eq_ignore_ascii_case("AS")
                && (i == 0 || !s.as_bytes()[i - 1].is_ascii_alphanumeric())
                && (rest.len() == 2 || !rest.as_bytes()[2].is_ascii_alphanumeric())
            {
                return Some((&s[..i], &s[i + 2..]));
            }
        }
        i += 1;
    }
    None
}

fn parse_schema_columns(paren_body: &str) -> Result<Vec<ArgumentDefinition>> {
    if paren_body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut cols = Vec::new();
    for part in split_top_level_commas(paren_body) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut iter = part.splitn(2, char::is_whitespace);
        let name = iter
            .next()
            .ok_or_else(|| TraceDbError::ParseError {
                message: "expected column name".into(),
            })?
            .to_string();
        let declared_type = iter.next().unwrap_or("").trim().to_string();
        cols.push(ArgumentDefinition { name, declared_type });
    }
    Ok(cols)
}

fn split_top_level_commas(s: &str) -> Vec<String> {
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

fn take_balanced_parens(s: &str) -> Option<(&str, &str)> {
    let s_trimmed = s.trim_start();
    if !s_trimmed.starts_with('(') {
        return None;
    }
    let bytes = s_trimmed.as_bytes();
    let mut depth = 0i32;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s_trimmed[1..i], &s_trimmed[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_create_table(replace: bool, rest: &str) -> Result<Statement> {
    let (name, rest) = take_identifier(rest)?;
    let rest = rest.trim_start();
    let (schema, rest) = match take_balanced_parens(rest) {
        Some((inside, after)) => (Some(parse_schema_columns(inside)?), after),
        None => (None, rest),
    };
    let (_, body) = split_on_top_level_as(rest).ok_or_else(|| TraceDbError::ParseError {
        message: "expected AS <select> in CREATE PERFETTO TABLE".into(),
    })?;
    Ok(Statement::CreateTable(CreateTableStmt {
        replace,
        name,
        schema,
        body_sql: body.trim().to_string(),
    }))
}

fn parse_create_view(replace: bool, rest: &str, full_text: &str) -> Result<Statement> {
    let (name, rest) = take_identifier(rest)?;
    let rest = rest.trim_start();
    let (schema, rest) = match take_balanced_parens(rest) {
        Some((inside, after)) => (Some(parse_schema_columns(inside)?), after),
        None => (None, rest),
    };
    let (_, body) = split_on_top_level_as(rest).ok_or_else(|| TraceDbError::ParseError {
        message: "expected AS <select> in CREATE PERFETTO VIEW".into(),
    })?;
    Ok(Statement::CreateView(CreateViewStmt {
        replace,
        name,
        schema,
        body_sql: body.trim().to_string(),
        full_text: full_text.to_string(),
    }))
}

fn parse_create_function(replace: bool, rest: &str) -> Result<Statement> {
    let (name, rest) = take_identifier(rest)?;
    let (args_str, rest) = take_balanced_parens(rest.trim_start()).ok_or_else(|| {
        TraceDbError::ParseError {
            message: "expected argument list in CREATE PERFETTO FUNCTION".into(),
        }
    })?;
    let args = parse_schema_columns(args_str)?;
    let rest = strip_prefix_ci_checked(rest, "RETURNS")?;
    let rest_upper = rest.trim_start().to_ascii_uppercase();
    if rest_upper.starts_with("TABLE") {
        let after_table = strip_prefix_ci(rest.trim_start(), "TABLE");
        let (cols_str, after_cols) = take_balanced_parens(after_table).ok_or_else(|| {
            TraceDbError::ParseError {
                message: "expected column list in RETURNS TABLE(...)".into(),
            }
        })?;
        let returns = FunctionReturn::Table(parse_schema_columns(cols_str)?);
        if let Some((_, body)) = split_on_top_level_as(after_cols) {
            return Ok(Statement::CreateFunction(CreateFunctionStmt {
                replace,
                name,
                args,
                returns,
                body_sql: Some(body.trim().to_string()),
                alias_of: None,
            }));
        }
        return Err(TraceDbError::ParseError {
            message: "expected AS <select> in table-valued CREATE PERFETTO FUNCTION".into(),
        });
    }
    // scalar
    let (type_tok, rest) = take_identifier(rest.trim_start())?;
    let rest_trim = rest.trim_start();
    let rest_upper2 = rest_trim.to_ascii_uppercase();
    if rest_upper2.starts_with("USING") {
        let alias_rest = strip_prefix_ci(rest_trim, "USING");
        let (alias_of, _) = take_identifier(alias_rest)?;
        return Ok(Statement::CreateFunction(CreateFunctionStmt {
            replace,
            name,
            args,
            returns: FunctionReturn::Scalar(type_tok),
            body_sql: None,
            alias_of: Some(alias_of),
        }));
    }
    let (_, body) = split_on_top_level_as(rest).ok_or_else(|| TraceDbError::ParseError {
        message: "expected AS <expr> in scalar CREATE PERFETTO FUNCTION".into(),
    })?;
    Ok(Statement::CreateFunction(CreateFunctionStmt {
        replace,
        name,
        args,
        returns: FunctionReturn::Scalar(type_tok),
        body_sql: Some(body.trim().to_string()),
        alias_of: None,
    }))
}

fn parse_create_macro(replace: bool, rest: &str) -> Result<Statement> {
    let (name, rest) = take_identifier(rest)?;
    let (args_str, rest) = take_balanced_parens(rest.trim_start()).ok_or_else(|| {
        TraceDbError::ParseError {
            message: "expected argument list in CREATE PERFETTO MACRO".into(),
        }
    })?;
    let mut args = Vec::new();
    for part in split_top_level_commas(args_str) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut iter = part.splitn(2, char::is_whitespace);
        let name = iter.next().unwrap_or_default().to_string();
        let kind = iter.next().unwrap_or_default().trim().to_string();
        args.push((name, kind));
    }
    let rest = strip_prefix_ci_checked(rest, "RETURNS")?;
    let (return_type, rest) = take_identifier(rest)?;
    let (_, body) = split_on_top_level_as(rest).ok_or_else(|| TraceDbError::ParseError {
        message: "expected AS <body> in CREATE PERFETTO MACRO".into(),
    })?;
    Ok(Statement::CreateMacro(CreateMacroStmt {
        replace,
        name,
        args,
        return_type,
        body_sql: body.trim().to_string(),
    }))
}

fn parse_create_index(replace: bool, rest: &str) -> Result<Statement> {
    let (index_name, rest) = take_identifier(rest)?;
    let rest = strip_prefix_ci_checked(rest, "ON")?;
    let (table_name, rest) = take_identifier(rest)?;
    let (cols_str, _) = take_balanced_parens(rest.trim_start()).ok_or_else(|| {
        TraceDbError::ParseError {
            message: "expected column list in CREATE PERFETTO INDEX".into(),
        }
    })?;
    let columns = split_top_level_commas(cols_str)
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    Ok(Statement::CreateIndex(CreateIndexStmt {
        replace,
        index_name,
        table_name,
        columns,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_two_statements_on_semicolon() {
        let mut parser = SqlParser::new("SELECT 1; SELECT 2;");
        let first = parser.next().unwrap().unwrap();
        let second = parser.next().unwrap().unwrap();
        assert!(parser.next().unwrap().is_none());
        match (first, second) {
            (Statement::SqliteSql(a), Statement::SqliteSql(b)) => {
                assert_eq!(a, "SELECT 1");
                assert_eq!(b, "SELECT 2");
            }
            _ => panic!("expected plain sql"),
        }
    }

    #[test]
    fn semicolon_inside_string_literal_does_not_split() {
        let mut parser = SqlParser::new("SELECT 'a;b'; SELECT 2;");
        let first = parser.next().unwrap().unwrap();
        match first {
            Statement::SqliteSql(s) => assert_eq!(s, "SELECT 'a;b'"),
            _ => panic!(),
        }
    }

    #[test]
    fn classifies_create_perfetto_table() {
        let mut parser = SqlParser::new("CREATE PERFETTO TABLE foo AS SELECT 42 AS bar;");
        let stmt = parser.next().unwrap().unwrap();
        match stmt {
            Statement::CreateTable(t) => {
                assert_eq!(t.name, "foo");
                assert_eq!(t.body_sql, "SELECT 42 AS bar");
                assert!(!t.replace);
                assert!(t.schema.is_none());
            }
            _ => panic!("expected CreateTable"),
        }
    }

    #[test]
    fn classifies_create_table_with_declared_schema() {
        let mut parser = SqlParser::new("CREATE PERFETTO TABLE foo(x INT) AS SELECT 1 AS y;");
        let stmt = parser.next().unwrap().unwrap();
        match stmt {
            Statement::CreateTable(t) => {
                let schema = t.schema.unwrap();
                assert_eq!(schema.len(), 1);
                assert_eq!(schema[0].name, "x");
                assert_eq!(schema[0].declared_type, "INT");
            }
            _ => panic!("expected CreateTable"),
        }
    }

    #[test]
    fn classifies_include_wildcard() {
        let mut parser = SqlParser::new("INCLUDE PERFETTO MODULE *;");
        let stmt = parser.next().unwrap().unwrap();
        match stmt {
            Statement::Include(i) => assert_eq!(i.key, "*"),
            _ => panic!("expected Include"),
        }
    }

    #[test]
    fn classifies_scalar_function_with_replace() {
        let mut parser =
            SqlParser::new("CREATE OR REPLACE PERFETTO FUNCTION f(x INT, y LONG) RETURNS INT AS SELECT $x + $y;");
        let stmt = parser.next().unwrap().unwrap();
        match stmt {
            Statement::CreateFunction(f) => {
                assert!(f.replace);
                assert_eq!(f.name, "f");
                assert_eq!(f.args.len(), 2);
                assert!(matches!(f.returns, FunctionReturn::Scalar(ref t) if t == "INT"));
                assert_eq!(f.body_sql.unwrap(), "SELECT $x + $y");
            }
            _ => panic!("expected CreateFunction"),
        }
    }

    #[test]
    fn classifies_table_valued_function() {
        let mut parser = SqlParser::new(
            "CREATE PERFETTO FUNCTION f(x INT) RETURNS TABLE(y INT) AS SELECT $x AS y;",
        );
        let stmt = parser.next().unwrap().unwrap();
        match stmt {
            Statement::CreateFunction(f) => match f.returns {
                FunctionReturn::Table(cols) => {
                    assert_eq!(cols.len(), 1);
                    assert_eq!(cols[0].name, "y");
                }
                _ => panic!("expected table return"),
            },
            _ => panic!("expected CreateFunction"),
        }
    }

    #[test]
    fn classifies_drop_index() {
        let mut parser = SqlParser::new("DROP PERFETTO INDEX idx_a ON foo;");
        let stmt = parser.next().unwrap().unwrap();
        match stmt {
            Statement::DropIndex(d) => {
                assert_eq!(d.index_name, "idx_a");
                assert_eq!(d.table_name, "foo");
            }
            _ => panic!("expected DropIndex"),
        }
    }
}
