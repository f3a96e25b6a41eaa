//! Runtime table-valued functions (component C7).
//!
//! A `CREATE PERFETTO FUNCTION ... RETURNS TABLE(...)` definition is
//! invoked with a fixed set of named, typed arguments and produces a
//! [`tracedb_core::runtime_table::Table`]. Argument binding follows the
//! source engine's convention exactly: every declared argument must be
//! supplied by name (`$name`), every declared argument must be used as an
//! equality constraint (there is no partial-application mode), and values
//! are type-checked against the function's declared argument types before
//! the body statement is bound and stepped.
//!
//! [`TableFunctionInvoker`] does this row-materialization work; it is
//! reused both by [`crate::engine::PerfettoSqlEngine::call_table_function`]
//! (a direct Rust call) and by [`TableFunctionVTab`]/[`TableFunctionCursor`]
//! below, which register the same logic as a real `rusqlite::vtab` module so
//! `FROM fn(a, b)` reaches it from arbitrary nested SQL (§4.7, §6.2). The
//! module is eponymous-only (`VTabKind::EponymousOnly`): there is no `CREATE
//! VIRTUAL TABLE` step, and every declared argument becomes a `HIDDEN`
//! column that `BestIndex` requires as a usable equality constraint, since
//! this function convention has no partial-application mode.

use rusqlite::types::ValueRef;
use rusqlite::vtab::{
    Context, CreateVTab, IndexConstraintOp, IndexInfo, VTab, VTabConnection, VTabCursor, VTabKind, Values,
};
use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::Arc;
use tracedb_core::runtime_table::{RuntimeTableBuilder, Table};
use tracedb_core::status::{Result, TraceDbError};
use tracedb_core::string_pool::StringPool;
use tracedb_core::value::Value;

use crate::engine_wrapper::SqlEngine;
use crate::parser::ArgumentDefinition;
use crate::schema::{declared_type_to_column_kind, type_check};
use crate::sync_cell::SyncCell;

/// A single function definition's invocation-time metadata.
#[derive(Debug, Clone)]
pub struct TableFunctionDef {
    pub name: String,
    pub args: Vec<ArgumentDefinition>,
    pub return_columns: Vec<ArgumentDefinition>,
    pub body_sql: String,
}

/// Drives a single `TableFunctionDef` invocation against the embedded
/// engine, mirroring the source's cursor lifecycle without the vtab
/// machinery: validate argument count and types, bind by `$name`, step to
/// completion, materialize into a [`Table`].
pub struct TableFunctionInvoker<'a> {
    def: &'a TableFunctionDef,
}

impl<'a> TableFunctionInvoker<'a> {
    pub fn new(def: &'a TableFunctionDef) -> Self {
        Self { def }
    }

    /// Invokes the function with `args` given in declared order, type-checks
    /// each against its declared scalar type (§4.7), binds by `$name`, runs
    /// the body to completion, and materializes the result.
    pub fn call(&self, sql: &SqlEngine, pool: &mut StringPool, args: &[Value]) -> Result<Table> {
        if args.len() != self.def.args.len() {
            return Err(TraceDbError::bad_argument(format!(
                "function {} expects {} arguments, got {}",
                self.def.name,
                self.def.args.len(),
                args.len()
            )));
        }
        for (arg_def, value) in self.def.args.iter().zip(args.iter()) {
            let expected_kind = declared_type_to_column_kind(&arg_def.declared_type)?;
            type_check(value, expected_kind, &arg_def.name)?;
        }
        self.call_checked(sql, pool, args)
    }

    /// Runs the body without re-checking argument count/types; used by the
    /// vtab cursor, which already validated arguments via `best_index`'s
    /// required-constraint set and `filter`'s per-argument type check.
    fn call_checked(&self, sql: &SqlEngine, pool: &mut StringPool, args: &[Value]) -> Result<Table> {

        let mut stmt = sql
            .connection()
            .prepare(&self.def.body_sql)
            .map_err(|e| TraceDbError::engine(format!("{e} while preparing: {}", self.def.body_sql)))?;

        let mut named: HashMap<String, Value> = HashMap::new();
        for (arg_def, value) in self.def.args.iter().zip(args.iter()) {
            named.insert(format!("${}", arg_def.name), *value);
        }
        for (name, value) in &named {
            if let Some(idx) = stmt
                .parameter_index(name)
                .map_err(|e| TraceDbError::engine(e.to_string()))?
            {
                bind_value(&mut stmt, idx, *value, pool)?;
            }
        }

        let actual_columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        if actual_columns.len() != self.def.return_columns.len() {
            return Err(TraceDbError::schema_mismatch(format!(
                "function {} declares {} return columns but body produces {}",
                self.def.name,
                self.def.return_columns.len(),
                actual_columns.len()
            )));
        }
        for (actual, declared) in actual_columns.iter().zip(self.def.return_columns.iter()) {
            if actual != &declared.name {
                return Err(TraceDbError::schema_mismatch(format!(
                    "function {} return column '{actual}' does not match declared name '{}'",
                    self.def.name, declared.name
                )));
            }
        }

        let mut builder = RuntimeTableBuilder::new(actual_columns.clone());
        let mut row_count = 0u32;
        let mut rows = stmt
            .query([])
            .map_err(|e| TraceDbError::engine(e.to_string()))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| TraceDbError::engine(e.to_string()))?
        {
            for i in 0..actual_columns.len() {
                let value_ref = row.get_ref(i).map_err(|e| TraceDbError::engine(e.to_string()))?;
                append_value_ref(&mut builder, i, value_ref, pool)?;
            }
            row_count += 1;
        }
        Ok(builder.finalize(row_count))
    }
}

pub(crate) fn bind_value(stmt: &mut rusqlite::Statement<'_>, idx: usize, value: Value, pool: &StringPool) -> Result<()> {
    let result = match value {
        Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
        Value::Integer(i) => stmt.raw_bind_parameter(idx, i),
        Value::Float(f) => stmt.raw_bind_parameter(idx, f),
        Value::Text(id) => stmt.raw_bind_parameter(idx, pool.resolve(id)),
    };
    result.map_err(|e| TraceDbError::engine(e.to_string()))
}

fn append_value_ref(
    builder: &mut RuntimeTableBuilder,
    idx: usize,
    value: ValueRef<'_>,
    pool: &mut StringPool,
) -> Result<()> {
    match value {
        ValueRef::Null => builder.append_null(idx),
        ValueRef::Integer(i) => builder.append_int(idx, i),
        ValueRef::Real(f) => builder.append_float(idx, f),
        ValueRef::Text(t) => {
            let s = std::str::from_utf8(t).map_err(|e| TraceDbError::engine(e.to_string()))?;
            builder.append_text(idx, s, pool)
        }
        ValueRef::Blob(_) => builder.append_null(idx),
    }
}

/// Aux data handed to every `TableFunctionVTab::connect` call: the
/// function's definition plus shared handles to the embedded connection and
/// string pool, so the vtab cursor can reuse [`TableFunctionInvoker`]
/// exactly as the direct-call path does.
pub struct TableFunctionAux {
    pub def: Arc<TableFunctionDef>,
    pub sql: Arc<SqlEngine>,
    pub pool: Arc<SyncCell<StringPool>>,
}

/// The `rusqlite::vtab::VTab` implementation backing `FROM fn(a, b)` for a
/// single registered table-valued function. Registered eponymous-only
/// (`VTabKind::EponymousOnly`): SQLite never issues `CREATE VIRTUAL TABLE`
/// for it, and the bare name only resolves inside a `FROM` clause with a
/// full call-argument list.
pub struct TableFunctionVTab {
    def: Arc<TableFunctionDef>,
    sql: Arc<SqlEngine>,
    pool: Arc<SyncCell<StringPool>>,
}

impl std::fmt::Debug for TableFunctionVTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFunctionVTab").field("name", &self.def.name).finish()
    }
}

/// Builds the `CREATE TABLE`-shaped schema string `connect` hands back to
/// SQLite: the declared return columns first, then one `HIDDEN` column per
/// argument (`in_<name>`), matching the source engine's hidden-column
/// convention for table-valued function call arguments (§4.7).
fn build_schema(def: &TableFunctionDef) -> String {
    let mut cols: Vec<String> = def
        .return_columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect();
    for arg in &def.args {
        cols.push(format!("\"in_{}\" HIDDEN", arg.name));
    }
    format!("CREATE TABLE x({})", cols.join(", "))
}

// SAFETY: `VTab` is an unsafe trait because the cursor/connect contract
// must uphold SQLite's virtual-table ABI invariants (the schema string
// returned by `connect` must describe exactly the columns `column` later
// serves, and `best_index` must only mark constraints `filter` actually
// consumes). Both are upheld below: `build_schema`/`filter`/`column` share
// the same column layout, and `best_index` only omits constraints it binds.
#[allow(unsafe_code)]
unsafe impl<'vtab> VTab<'vtab> for TableFunctionVTab {
    type Aux = TableFunctionAux;
    type Cursor = TableFunctionCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        _args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let aux = aux.ok_or_else(|| rusqlite::Error::ModuleError("missing table function aux data".into()))?;
        let schema = build_schema(&aux.def);
        Ok((
            schema,
            TableFunctionVTab {
                def: Arc::clone(&aux.def),
                sql: Arc::clone(&aux.sql),
                pool: Arc::clone(&aux.pool),
            },
        ))
    }

    /// Every `in_<arg>` hidden column must be supplied as a usable equality
    /// constraint — this calling convention has no partial application —
    /// and each is bound directly to its `argv` position in declaration
    /// order, so no `idxStr` encoding is needed (unlike rollup/pivot's
    /// filter columns, any subset of which may be present).
    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let n_args = self.def.args.len();
        let return_cols = self.def.return_columns.len();
        let mut satisfied = vec![false; n_args];
        for mut constraint_usage in info.constraints_and_usages() {
            let col = constraint_usage.constraint().column() as usize;
            if col < return_cols {
                continue;
            }
            let arg_idx = col - return_cols;
            if arg_idx >= n_args {
                continue;
            }
            if constraint_usage.constraint().operator() == IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
                && constraint_usage.constraint().usable()
            {
                constraint_usage.set_argv_index((arg_idx + 1) as c_int);
                constraint_usage.set_omit(true);
                satisfied[arg_idx] = true;
            }
        }
        if satisfied.iter().any(|ok| !ok) {
            return Err(rusqlite::Error::ModuleError(format!(
                "function {} requires every argument as an equality constraint",
                self.def.name
            )));
        }
        info.set_estimated_cost(1.0);
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<Self::Cursor> {
        Ok(TableFunctionCursor {
            def: Arc::clone(&self.def),
            sql: Arc::clone(&self.sql),
            pool: Arc::clone(&self.pool),
            table: None,
            row: 0,
            phantom: std::marker::PhantomData,
        })
    }
}

/// `create` is never called for an eponymous-only module — there is no
/// `CREATE VIRTUAL TABLE` step — so the default `connect` delegation never
/// runs in practice; it is only here to satisfy the trait.
impl<'vtab> CreateVTab<'vtab> for TableFunctionVTab {
    const KIND: VTabKind = VTabKind::EponymousOnly;
}

pub struct TableFunctionCursor<'vtab> {
    def: Arc<TableFunctionDef>,
    sql: Arc<SqlEngine>,
    pool: Arc<SyncCell<StringPool>>,
    table: Option<Table>,
    row: u32,
    phantom: std::marker::PhantomData<&'vtab TableFunctionVTab>,
}

impl std::fmt::Debug for TableFunctionCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFunctionCursor").field("row", &self.row).finish()
    }
}

fn scalar_err(e: TraceDbError) -> rusqlite::Error {
    rusqlite::Error::ModuleError(e.to_string())
}

#[allow(unsafe_code)]
unsafe impl VTabCursor for TableFunctionCursor<'_> {
    fn filter(&mut self, _idx_num: c_int, _idx_str: Option<&str>, args: &Values<'_>) -> rusqlite::Result<()> {
        let mut values = Vec::with_capacity(self.def.args.len());
        for i in 0..self.def.args.len() {
            let raw = args.get_raw(i).map_err(|e| rusqlite::Error::ModuleError(e.to_string()))?;
            values.push(value_ref_to_value(raw, self.pool.get_mut()).map_err(scalar_err)?);
        }
        for (arg_def, value) in self.def.args.iter().zip(values.iter()) {
            let expected = declared_type_to_column_kind(&arg_def.declared_type).map_err(scalar_err)?;
            type_check(value, expected, &arg_def.name).map_err(scalar_err)?;
        }
        let invoker = TableFunctionInvoker::new(&self.def);
        let table = invoker
            .call_checked(&self.sql, self.pool.get_mut(), &values)
            .map_err(scalar_err)?;
        self.table = Some(table);
        self.row = 0;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.row += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        match &self.table {
            Some(t) => self.row >= t.row_count(),
            None => true,
        }
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let table = self.table.as_ref().ok_or_else(|| rusqlite::Error::ModuleError("cursor not filtered".into()))?;
        let i = i as usize;
        if i >= self.def.return_columns.len() {
            // Hidden `in_*` columns are never read back by SQLite for an
            // omitted equality constraint; NULL is a safe default.
            return ctx.set_result(&rusqlite::types::Null);
        }
        set_context_result(ctx, table.value(self.row, i), self.pool.get())
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.row as i64)
    }
}

pub(crate) fn value_ref_to_value(value_ref: ValueRef<'_>, pool: &mut StringPool) -> Result<Value> {
    Ok(match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => {
            let s = std::str::from_utf8(t).map_err(|e| TraceDbError::engine(e.to_string()))?;
            Value::Text(pool.intern(s))
        }
        ValueRef::Blob(_) => Value::Null,
    })
}

fn set_context_result(ctx: &mut Context, value: Value, pool: &StringPool) -> rusqlite::Result<()> {
    match value {
        Value::Null => ctx.set_result(&rusqlite::types::Null),
        Value::Integer(i) => ctx.set_result(&i),
        Value::Float(f) => ctx.set_result(&f),
        Value::Text(id) => ctx.set_result(&pool.resolve(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invokes_scalar_body_and_materializes_single_row() {
        let sql = SqlEngine::open_in_memory().unwrap();
        let mut pool = StringPool::new();
        let def = TableFunctionDef {
            name: "f".into(),
            args: vec![
                ArgumentDefinition {
                    name: "x".into(),
                    declared_type: "LONG".into(),
                },
                ArgumentDefinition {
                    name: "y".into(),
                    declared_type: "LONG".into(),
                },
            ],
            return_columns: vec![ArgumentDefinition {
                name: "result".into(),
                declared_type: "LONG".into(),
            }],
            body_sql: "SELECT $x + $y AS result".into(),
        };
        let invoker = TableFunctionInvoker::new(&def);
        let table = invoker
            .call(&sql, &mut pool, &[Value::Integer(1), Value::Integer(2)])
            .unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.value(0, 0), Value::Integer(3));
    }

    #[test]
    fn wrong_argument_count_is_rejected() {
        let sql = SqlEngine::open_in_memory().unwrap();
        let mut pool = StringPool::new();
        let def = TableFunctionDef {
            name: "f".into(),
            args: vec![ArgumentDefinition {
                name: "x".into(),
                declared_type: "LONG".into(),
            }],
            return_columns: vec![ArgumentDefinition {
                name: "result".into(),
                declared_type: "LONG".into(),
            }],
            body_sql: "SELECT $x AS result".into(),
        };
        let invoker = TableFunctionInvoker::new(&def);
        let err = invoker.call(&sql, &mut pool, &[]).unwrap_err();
        assert!(matches!(err, TraceDbError::BadArgument { .. }));
    }

    #[test]
    fn empty_result_set_is_not_an_error() {
        let sql = SqlEngine::open_in_memory().unwrap();
        let mut pool = StringPool::new();
        let def = TableFunctionDef {
            name: "empty".into(),
            args: vec![],
            return_columns: vec![ArgumentDefinition {
                name: "x".into(),
                declared_type: "LONG".into(),
            }],
            body_sql: "SELECT 1 AS x WHERE 0".into(),
        };
        let invoker = TableFunctionInvoker::new(&def);
        let table = invoker.call(&sql, &mut pool, &[]).unwrap();
        assert_eq!(table.row_count(), 0);
    }
}
