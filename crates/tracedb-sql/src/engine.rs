//! The PerfettoSQL-style engine: top-level execution loop, `CREATE
//! PERFETTO ...` handlers, and module inclusion (component C6).
//!
//! The execution loop is built around an explicit frame stack rather than
//! recursing on `INCLUDE`, for the reason spelled out in the design notes:
//! an `INCLUDE` cascade can nest arbitrarily deep and a naive recursive
//! implementation is a latent stack-overflow bug.

use crate::config::EngineConfig;
use crate::engine_wrapper::SqlEngine;
use crate::modules::ModuleRegistry;
use crate::parser::macros::MacroTable;
use crate::parser::statement::{
    ArgumentDefinition, CreateFunctionStmt, CreateIndexStmt, CreateMacroStmt, CreateTableStmt,
    CreateViewStmt, DropIndexStmt, FunctionReturn, IncludeStmt, Statement,
};
use crate::parser::SqlParser;
use crate::pivot::{PivotAux, PivotRow, PivotTree, PivotVTab};
use crate::rollup::{ExpansionSpec, RollupAux, RollupRow, RollupTree, RollupVTab, SortSpec};
use crate::schema::{declared_type_to_column_kind, type_check, validate_column_name, validate_schema, ColumnKind};
use crate::sync_cell::SyncCell;
use crate::table_function::{
    bind_value, value_ref_to_value, TableFunctionAux, TableFunctionDef, TableFunctionInvoker, TableFunctionVTab,
};
use rusqlite::types::ValueRef;
use std::collections::HashMap;
use std::sync::Arc;
use tracedb_core::runtime_table::Table;
use tracedb_core::status::{Result, Traced, TraceDbError};
use tracedb_core::string_pool::StringPool;
use tracedb_core::value::Value;
use tracing::{debug, instrument};

/// Accumulated execution statistics, field names taken directly from the
/// source engine's `ExecutionStats` (`column_count`, `statement_count`,
/// `statement_count_with_output`), which the distilled spec only gestures
/// at ("Stats").
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub column_count: u64,
    pub statement_count: u64,
    pub statement_count_with_output: u64,
}

impl ExecutionStats {
    fn merge(&mut self, other: &ExecutionStats) {
        self.column_count += other.column_count;
        self.statement_count += other.statement_count;
        self.statement_count_with_output += other.statement_count_with_output;
    }
}

/// What a frame drives: the user-provided root source, an included
/// module's SQL, or a pending wildcard expansion.
enum FrameKind {
    Root,
    Include { key: String },
    Wildcard { remaining: Vec<String> },
}

struct Frame {
    kind: FrameKind,
    parser: Option<SqlParser>,
    stats: ExecutionStats,
}

/// A single `CREATE PERFETTO FUNCTION ... RETURNS <scalar type>` definition's
/// invocation-time metadata: the body is re-prepared and stepped on every
/// call rather than cached as a statement, mirroring
/// [`TableFunctionInvoker`]'s approach for the table-valued case.
#[derive(Debug, Clone)]
pub struct ScalarFunctionDef {
    pub name: String,
    pub args: Vec<ArgumentDefinition>,
    pub body_sql: String,
}

/// What a registered `CREATE PERFETTO FUNCTION` actually does once its
/// `USING` alias chain (if any) is resolved. Both variants are registered as
/// real SQLite callbacks at `CREATE PERFETTO FUNCTION` time — a scalar UDF
/// via [`SqlEngine::register_scalar_function`], a table-valued function as a
/// `rusqlite::vtab` module — so `HashMap` lookup here exists purely to
/// resolve `USING` aliases and to reject a table-valued call through the
/// scalar-only entry point (`call_table_function`), not to dispatch calls:
/// SQLite itself routes `fn(...)`/`FROM fn(...)` straight to the registered
/// callback/module.
#[derive(Debug, Clone)]
enum FunctionKind {
    Scalar(Arc<ScalarFunctionDef>),
    Table(Arc<TableFunctionDef>),
}

/// Registered function descriptor: enough to re-dispatch `CREATE ... USING
/// <existing>` aliases (§4.6.3).
#[derive(Debug, Clone)]
struct FunctionDef {
    args: Vec<ArgumentDefinition>,
    kind: FunctionKind,
}

/// A materialized `CREATE PERFETTO TABLE` result, kept around for
/// introspection even though the rows themselves live in a real SQLite
/// table (see the module-level note on the unsafe-free vtab substitution).
struct RegisteredTable {
    columns: Vec<String>,
}

/// The engine itself: owns the wrapped connection, the string pool, and
/// every piece of process-wide state (macros, modules, functions, named
/// indexes, registered tables).
pub struct PerfettoSqlEngine {
    sql: Arc<SqlEngine>,
    pool: Arc<SyncCell<StringPool>>,
    config: EngineConfig,
    macros: MacroTable,
    modules: ModuleRegistry,
    functions: HashMap<String, FunctionDef>,
    tables: HashMap<String, RegisteredTable>,
    indexes: HashMap<String, (String, Vec<String>)>,
}

impl PerfettoSqlEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = Self {
            sql: Arc::new(SqlEngine::open_in_memory()?),
            pool: Arc::new(SyncCell::new(StringPool::new())),
            config,
            macros: MacroTable::new(),
            modules: ModuleRegistry::new(),
            functions: HashMap::new(),
            tables: HashMap::new(),
            indexes: HashMap::new(),
        };
        engine.register_rollup_and_pivot_modules()?;
        Ok(engine)
    }

    /// Registers `__intrinsic_rollup_tree` and `__intrinsic_pivot` as real
    /// `rusqlite::vtab` modules (component C8, §4.8), once per engine
    /// instance: unlike `CREATE PERFETTO FUNCTION`'s per-call table-valued
    /// registration, these two names are fixed and always available.
    fn register_rollup_and_pivot_modules(&self) -> Result<()> {
        let rollup_aux = RollupAux {
            sql: Arc::clone(&self.sql),
            pool: Arc::clone(&self.pool),
            max_aggregates: self.config.max_rollup_aggregates,
        };
        self.sql.register_virtual_table_module(
            "__intrinsic_rollup_tree",
            rusqlite::vtab::read_only_module::<RollupVTab>(),
            rollup_aux,
        )?;
        let pivot_aux = PivotAux {
            sql: Arc::clone(&self.sql),
            pool: Arc::clone(&self.pool),
            max_aggregates: self.config.max_rollup_aggregates,
        };
        self.sql.register_virtual_table_module(
            "__intrinsic_pivot",
            rusqlite::vtab::read_only_module::<PivotVTab>(),
            pivot_aux,
        )?;
        Ok(())
    }

    pub fn sql_engine(&self) -> &SqlEngine {
        &self.sql
    }

    pub fn string_pool(&self) -> &StringPool {
        self.pool.get()
    }

    pub fn string_pool_mut(&mut self) -> &mut StringPool {
        self.pool.get_mut()
    }

    pub fn module_registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.modules
    }

    /// Executes every statement in `source`, discarding any rows, and
    /// returns accumulated statistics.
    #[instrument(skip(self, source))]
    pub fn execute(&mut self, source: &str) -> Result<ExecutionStats> {
        let (_, stats) = self.run(source, true)?;
        Ok(stats)
    }

    /// Executes every statement in `source` except the last, which is
    /// prepared and stepped exactly once so the caller can continue
    /// iterating its rows.
    #[instrument(skip(self, source))]
    pub fn execute_until_last_statement(
        &mut self,
        source: &str,
    ) -> Result<(Option<rusqlite::Statement<'_>>, ExecutionStats)> {
        let (last_sql, stats) = self.run(source, false)?;
        match last_sql {
            Some(sql) => {
                let stmt = self
                    .sql
                    .connection()
                    .prepare(&sql)
                    .map_err(|e| TraceDbError::engine(format!("{e} while preparing: {sql}")))?;
                Ok((Some(stmt), stats))
            }
            None => Ok((None, stats)),
        }
    }

    /// Drives the frame stack to completion. When `discard_last` is false,
    /// the final plain-SQL statement's (already macro-expanded, native-
    /// rewritten) text is returned instead of being executed, so the caller
    /// can step it themselves.
    fn run(&mut self, source: &str, discard_last: bool) -> Result<(Option<String>, ExecutionStats)> {
        let entry_depth = 0usize; // a fresh call always starts an empty stack
        let mut stack: Vec<Frame> = vec![Frame {
            kind: FrameKind::Root,
            parser: Some(SqlParser::new(source)),
            stats: ExecutionStats::default(),
        }];
        let mut total = ExecutionStats::default();
        let mut pending_last_sql: Option<String> = None;

        let result = loop {
            if stack.len() > self.config.max_include_depth {
                break Err(TraceDbError::Fatal {
                    message: "execution frame stack exceeded maximum include depth".into(),
                });
            }
            let Some(frame) = stack.last_mut() else {
                break Ok(());
            };
            match &mut frame.kind {
                FrameKind::Wildcard { remaining } => {
                    if let Some(next_key) = remaining.pop() {
                        stack.push(Frame {
                            kind: FrameKind::Include { key: next_key },
                            parser: None,
                            stats: ExecutionStats::default(),
                        });
                    } else {
                        let done = stack.pop().expect("just matched");
                        total.merge(&done.stats);
                    }
                }
                FrameKind::Root | FrameKind::Include { .. } => {
                    if frame.parser.is_none() {
                        let key = match &frame.kind {
                            FrameKind::Include { key } => key.clone(),
                            _ => unreachable!(),
                        };
                        let sql = match self.modules.resolve(&key) {
                            Ok(sql) => sql.to_string(),
                            Err(e) => break Err(e),
                        };
                        frame.parser = Some(SqlParser::new(sql));
                    }
                    let parser = frame.parser.as_mut().expect("initialized above");
                    match parser.next() {
                        Ok(Some(stmt)) => {
                            let is_last_frame_and_root =
                                stack.len() == 1 && matches!(stack[0].kind, FrameKind::Root);
                            let at_end = {
                                let p = stack.last().unwrap().parser.as_ref().unwrap();
                                p.is_at_end()
                            };
                            let discard_this =
                                !discard_last && is_last_frame_and_root && at_end;
                            match self.dispatch_statement(stmt, &mut stack) {
                                Ok(DispatchOutcome::Stats(s)) => {
                                    stack.last_mut().unwrap().stats.merge(&s);
                                }
                                Ok(DispatchOutcome::PlainSql(sql)) => {
                                    if discard_this {
                                        pending_last_sql = Some(sql);
                                    } else {
                                        match self.run_plain_sql(&sql) {
                                            Ok(s) => stack.last_mut().unwrap().stats.merge(&s),
                                            Err(e) => break Err(e),
                                        }
                                    }
                                }
                                Ok(DispatchOutcome::PushedFrame) => {}
                                Err(e) => break Err(e),
                            }
                        }
                        Ok(None) => {
                            let done = stack.pop().expect("frame present");
                            if matches!(done.kind, FrameKind::Include { .. })
                                && done.stats.statement_count_with_output > 0
                            {
                                break Err(TraceDbError::parse(
                                    "included module produced row output; modules must define, not query",
                                ));
                            }
                            if let FrameKind::Include { key } = &done.kind {
                                self.modules.mark_included(key);
                            }
                            if stack.is_empty() {
                                if matches!(done.kind, FrameKind::Root)
                                    && done.stats.statement_count == 0
                                {
                                    break Err(TraceDbError::parse("No valid SQL to run"));
                                }
                                total.merge(&done.stats);
                                break Ok(());
                            }
                            total.merge(&done.stats);
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let result = result.map_err(|e| Self::apply_include_tracebacks(&stack, e));

        while stack.len() > entry_depth {
            if let Some(frame) = stack.pop() {
                total.merge(&frame.stats);
            }
        }

        result.map(|()| (pending_last_sql, total))
    }

    /// Prefixes an error with "while including module '...'" for every
    /// `Include` frame still on the stack at the point of failure, innermost
    /// first, so a deep `INCLUDE PERFETTO MODULE` cascade reads as a
    /// traceback rather than a single opaque message. Uses `Traced`'s
    /// has-traceback bit so a frame never gets prefixed twice.
    fn apply_include_tracebacks(stack: &[Frame], err: TraceDbError) -> TraceDbError {
        let mut traced: Option<Traced> = None;
        for frame in stack.iter().rev() {
            if let FrameKind::Include { key } = &frame.kind {
                let prefix = format!("while including module '{key}'");
                traced = Some(match traced {
                    None => err.clone().with_traceback(&prefix),
                    Some(t) => t.prefix(&prefix),
                });
            }
        }
        match traced {
            Some(t) => t.error,
            None => err,
        }
    }

    fn run_plain_sql(&self, sql: &str) -> Result<ExecutionStats> {
        let mut stmt = self
            .sql
            .connection()
            .prepare(sql)
            .map_err(|e| TraceDbError::engine(format!("{e} while preparing: {sql}")))?;
        let column_count = stmt.column_count() as u64;
        let mut rows = stmt
            .query([])
            .map_err(|e| TraceDbError::engine(format!("{e} while executing: {sql}")))?;
        let mut produced_rows = false;
        while rows
            .next()
            .map_err(|e| TraceDbError::engine(e.to_string()))?
            .is_some()
        {
            produced_rows = true;
        }
        if sql.trim_start().to_ascii_uppercase().starts_with("COMMIT") {
            self.sql.notify_commit();
        } else if sql.trim_start().to_ascii_uppercase().starts_with("ROLLBACK") {
            self.sql.notify_rollback();
        }
        Ok(ExecutionStats {
            column_count,
            statement_count: 1,
            statement_count_with_output: u64::from(produced_rows),
        })
    }

    fn dispatch_statement(
        &mut self,
        stmt: Statement,
        stack: &mut Vec<Frame>,
    ) -> Result<DispatchOutcome> {
        match stmt {
            Statement::SqliteSql(sql) => {
                let expanded = self.macros.expand(&sql)?;
                Ok(DispatchOutcome::PlainSql(expanded))
            }
            Statement::CreateTable(t) => {
                self.execute_create_table(t)?;
                Ok(DispatchOutcome::Stats(ExecutionStats {
                    statement_count: 1,
                    ..Default::default()
                }))
            }
            Statement::CreateView(v) => {
                self.execute_create_view(v)?;
                Ok(DispatchOutcome::Stats(ExecutionStats {
                    statement_count: 1,
                    ..Default::default()
                }))
            }
            Statement::CreateFunction(f) => {
                self.execute_create_function(f)?;
                Ok(DispatchOutcome::Stats(ExecutionStats {
                    statement_count: 1,
                    ..Default::default()
                }))
            }
            Statement::CreateMacro(m) => {
                self.execute_create_macro(m)?;
                Ok(DispatchOutcome::Stats(ExecutionStats {
                    statement_count: 1,
                    ..Default::default()
                }))
            }
            Statement::CreateIndex(i) => {
                self.execute_create_index(i)?;
                Ok(DispatchOutcome::Stats(ExecutionStats {
                    statement_count: 1,
                    ..Default::default()
                }))
            }
            Statement::DropIndex(d) => {
                self.execute_drop_index(d)?;
                Ok(DispatchOutcome::Stats(ExecutionStats {
                    statement_count: 1,
                    ..Default::default()
                }))
            }
            Statement::Include(inc) => {
                self.execute_include(inc, stack)?;
                Ok(DispatchOutcome::PushedFrame)
            }
        }
    }

    fn execute_include(&mut self, inc: IncludeStmt, stack: &mut Vec<Frame>) -> Result<()> {
        if ModuleRegistry::is_wildcard(&inc.key) {
            let mut remaining = self.modules.expand_wildcard(&inc.key);
            remaining.reverse(); // consumed via `pop()`, so reverse to include in ascending order
            stack.push(Frame {
                kind: FrameKind::Wildcard { remaining },
                parser: None,
                stats: ExecutionStats::default(),
            });
            return Ok(());
        }
        if self.modules.is_included(&inc.key) {
            return Ok(());
        }
        stack.push(Frame {
            kind: FrameKind::Include { key: inc.key },
            parser: None,
            stats: ExecutionStats::default(),
        });
        Ok(())
    }

    #[instrument(skip(self, t))]
    fn execute_create_table(&mut self, t: CreateTableStmt) -> Result<()> {
        if !t.replace && self.tables.contains_key(&t.name) {
            return Err(TraceDbError::DuplicateDefinition {
                message: format!("table {} already exists", t.name),
            });
        }
        self.sql.with_savepoint(&format!("create_table_{}", t.name), || {
            let mut prepared = self
                .sql
                .connection()
                .prepare(&t.body_sql)
                .map_err(|e| TraceDbError::engine(format!("{e} while preparing: {}", t.body_sql)))?;
            let actual_columns: Vec<String> = prepared
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            for name in &actual_columns {
                validate_column_name(name)?;
            }
            let declared = validate_schema(&actual_columns, t.schema.as_deref())?;
            let kinds: Vec<ColumnKind> = declared
                .iter()
                .map(|d| declared_type_to_column_kind(&d.declared_type))
                .collect::<Result<_>>()?;

            let create_ddl = format!(
                "CREATE TABLE \"{}\" ({})",
                t.name,
                actual_columns
                    .iter()
                    .zip(kinds.iter())
                    .map(|(name, kind)| format!("\"{name}\" {}", sqlite_type_for(*kind)))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.sql.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", t.name))?;
            self.sql.execute_batch(&create_ddl)?;

            let placeholders = (1..=actual_columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let insert_sql = format!("INSERT INTO \"{}\" VALUES ({placeholders})", t.name);

            let mut rows = prepared
                .query([])
                .map_err(|e| TraceDbError::engine(format!("{e} while executing: {}", t.body_sql)))?;
            while let Some(row) = rows
                .next()
                .map_err(|e| TraceDbError::engine(e.to_string()))?
            {
                let mut insert_stmt = self
                    .sql
                    .connection()
                    .prepare_cached(&insert_sql)
                    .map_err(|e| TraceDbError::engine(e.to_string()))?;
                for i in 0..actual_columns.len() {
                    let value_ref = row
                        .get_ref(i)
                        .map_err(|e| TraceDbError::engine(e.to_string()))?;
                    bind_value_ref(&mut insert_stmt, i, value_ref)?;
                }
                insert_stmt
                    .raw_execute()
                    .map_err(|e| TraceDbError::engine(e.to_string()))?;
            }
            self.tables.insert(
                t.name.clone(),
                RegisteredTable {
                    columns: actual_columns,
                },
            );
            Ok(())
        })
    }

    fn execute_create_view(&mut self, v: CreateViewStmt) -> Result<()> {
        let mut prepared = self
            .sql
            .connection()
            .prepare(&v.body_sql)
            .map_err(|e| TraceDbError::engine(format!("{e} while preparing: {}", v.body_sql)))?;
        let actual_columns: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        for name in &actual_columns {
            validate_column_name(name)?;
        }
        validate_schema(&actual_columns, v.schema.as_deref())?;
        if self.config.extra_checks_on_create_view {
            let mut rows = prepared
                .query([])
                .map_err(|e| TraceDbError::engine(e.to_string()))?;
            // Materialize once purely to surface type errors early; rows
            // are discarded.
            while rows
                .next()
                .map_err(|e| TraceDbError::engine(e.to_string()))?
                .is_some()
            {}
        }
        if v.replace {
            self.sql
                .execute_batch(&format!("DROP VIEW IF EXISTS \"{}\"", v.name))?;
        }
        self.sql.execute_batch(&v.full_text)?;
        Ok(())
    }

    fn execute_create_function(&mut self, f: CreateFunctionStmt) -> Result<()> {
        if !f.replace && self.functions.contains_key(&f.name) {
            return Err(TraceDbError::DuplicateDefinition {
                message: format!("function {} already exists", f.name),
            });
        }
        if let Some(alias_of) = &f.alias_of {
            let target = self
                .functions
                .get(alias_of)
                .ok_or_else(|| TraceDbError::UnknownFunction {
                    name: alias_of.clone(),
                })?
                .clone();
            match &target.kind {
                FunctionKind::Scalar(def) => self.register_scalar_udf(&f.name, def)?,
                FunctionKind::Table(def) => self.register_table_vtab(&f.name, def)?,
            }
            self.functions.insert(f.name.clone(), target);
            return Ok(());
        }
        let body_sql = f.body_sql.clone().ok_or_else(|| {
            TraceDbError::bad_argument(format!(
                "function {} has neither a body nor a USING alias",
                f.name
            ))
        })?;
        let (kind, returns_table) = match &f.returns {
            FunctionReturn::Scalar(_) => {
                let def = Arc::new(ScalarFunctionDef {
                    name: f.name.clone(),
                    args: f.args.clone(),
                    body_sql,
                });
                self.register_scalar_udf(&f.name, &def)?;
                (FunctionKind::Scalar(def), false)
            }
            FunctionReturn::Table(return_columns) => {
                let def = Arc::new(TableFunctionDef {
                    name: f.name.clone(),
                    args: f.args.clone(),
                    return_columns: return_columns.clone(),
                    body_sql,
                });
                self.register_table_vtab(&f.name, &def)?;
                (FunctionKind::Table(def), true)
            }
        };
        self.functions.insert(
            f.name.clone(),
            FunctionDef {
                args: f.args.clone(),
                kind,
            },
        );
        debug!(function = %f.name, returns_table, "registered PerfettoSQL function");
        Ok(())
    }

    /// Registers `name` as a real SQLite scalar UDF backed by `def`'s body,
    /// so `name(...)` is reachable from arbitrary nested SQL the same way a
    /// built-in function is — including inside another function's body,
    /// which is why nesting (`inc(inc(inc(0)))`) needs no special handling
    /// here: SQLite evaluates the innermost call first regardless.
    fn register_scalar_udf(&self, name: &str, def: &Arc<ScalarFunctionDef>) -> Result<()> {
        let sql_handle = Arc::clone(&self.sql);
        let pool_handle = Arc::clone(&self.pool);
        let def_handle = Arc::clone(def);
        self.sql
            .register_scalar_function(name, def.args.len() as i32, true, move |ctx| {
                let mut args = Vec::with_capacity(def_handle.args.len());
                for i in 0..def_handle.args.len() {
                    let raw = ctx.get_raw(i);
                    let value = value_ref_to_value(raw, pool_handle.get_mut()).map_err(scalar_udf_err)?;
                    args.push(value);
                }
                let result =
                    invoke_scalar_function_body(&sql_handle, pool_handle.get_mut(), &def_handle, &args)
                        .map_err(scalar_udf_err)?;
                Ok(value_to_rusqlite_value(result, pool_handle.get()))
            })
    }

    /// Registers `name` as a real `rusqlite::vtab` module so `FROM
    /// name(a, b)` reaches [`TableFunctionVTab`]/[`TableFunctionCursor`]
    /// from arbitrary nested SQL (§4.7, §6.2).
    fn register_table_vtab(&self, name: &str, def: &Arc<TableFunctionDef>) -> Result<()> {
        let aux = TableFunctionAux {
            def: Arc::clone(def),
            sql: Arc::clone(&self.sql),
            pool: Arc::clone(&self.pool),
        };
        self.sql
            .register_virtual_table_module(name, rusqlite::vtab::eponymous_only_module::<TableFunctionVTab>(), aux)
    }

    /// Invokes a registered table-valued function directly. Kept alongside
    /// the real `FROM name(args)` vtab path for callers (and tests) that
    /// want a [`Table`] back without going through SQL at all.
    pub fn call_table_function(&mut self, name: &str, args: &[Value]) -> Result<Table> {
        let def = self
            .functions
            .get(name)
            .ok_or_else(|| TraceDbError::UnknownFunction { name: name.to_string() })?;
        let table_def = match &def.kind {
            FunctionKind::Table(t) => Arc::clone(t),
            FunctionKind::Scalar { .. } => {
                return Err(TraceDbError::bad_argument(format!(
                    "function {name} is scalar, not table-valued"
                )));
            }
        };
        TableFunctionInvoker::new(&table_def).call(&self.sql, self.pool.get_mut(), args)
    }

    /// Answers a `__intrinsic_rollup_tree` query directly, without going
    /// through SQL. Kept alongside the real `__intrinsic_rollup_tree` vtab
    /// module ([`RollupVTab`]), which [`Self::new`] registers once at
    /// construction, for callers that want a [`RollupRow`] list without a
    /// `CREATE VIRTUAL TABLE` round-trip.
    #[allow(clippy::too_many_arguments)]
    pub fn rollup_query(
        &mut self,
        source: &str,
        hierarchy_cols: &[String],
        aggregate_exprs: &[String],
        sort: Option<&str>,
        expanded_ids: Option<&str>,
        collapsed_ids: Option<&str>,
        min_depth: Option<u32>,
        max_depth: Option<u32>,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<RollupRow>> {
        let tree = RollupTree::build(
            &self.sql,
            self.pool.get_mut(),
            source,
            hierarchy_cols,
            aggregate_exprs,
            self.config.max_rollup_aggregates,
        )?;
        let sort_spec = match sort {
            Some(s) => SortSpec::parse(s)?,
            None => SortSpec::unspecified_default(),
        };
        let expansion = ExpansionSpec::from_constraints(expanded_ids, collapsed_ids);
        let rows = tree.flatten(self.pool.get(), &sort_spec, &expansion, min_depth, max_depth, offset, limit);
        Ok(rows.into_iter().map(RollupRow::from).collect())
    }

    /// Builds a `__intrinsic_pivot` tree and hands back the handle so a
    /// caller can page through it repeatedly without rebuilding or
    /// re-sorting on every page — the same lazy re-sort cache
    /// [`crate::pivot::PivotVTab`]'s cursor relies on.
    pub fn open_pivot(
        &mut self,
        source: &str,
        hierarchy_cols: &[String],
        aggregate_exprs: &[String],
    ) -> Result<PivotTree> {
        PivotTree::build(
            &self.sql,
            self.pool.get_mut(),
            source,
            hierarchy_cols,
            aggregate_exprs,
            self.config.max_rollup_aggregates,
        )
    }

    /// One-shot `__intrinsic_pivot` query: builds the tree and returns a
    /// single page. Callers that need to re-page against an unchanged sort
    /// (the lazy re-sort cache's intended use) should call [`Self::open_pivot`]
    /// instead and keep the returned [`PivotTree`] around.
    pub fn pivot_query(
        &mut self,
        source: &str,
        hierarchy_cols: &[String],
        aggregate_exprs: &[String],
        sort: &str,
        expanded_ids: Option<&str>,
        collapsed_ids: Option<&str>,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<PivotRow>> {
        let mut tree = self.open_pivot(source, hierarchy_cols, aggregate_exprs)?;
        let sort_spec = SortSpec::parse(sort)?;
        let expansion = ExpansionSpec::from_constraints(expanded_ids, collapsed_ids);
        let rows = tree.flatten(sort, &sort_spec, &expansion, offset, limit);
        Ok(rows.into_iter().map(PivotRow::from).collect())
    }

    fn execute_create_macro(&mut self, m: CreateMacroStmt) -> Result<()> {
        use crate::parser::macros::{MacroArgKind, MacroDef};
        let args = m
            .args
            .iter()
            .map(|(name, kind)| {
                MacroArgKind::parse(kind)
                    .map(|k| (name.clone(), k))
                    .ok_or_else(|| TraceDbError::MacroError {
                        message: format!("unknown macro argument category '{kind}'"),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let return_type = MacroArgKind::parse(&m.return_type).ok_or_else(|| TraceDbError::MacroError {
            message: format!("unknown macro return category '{}'", m.return_type),
        })?;
        self.macros.define(
            MacroDef {
                name: m.name,
                args,
                return_type,
                body: m.body_sql,
            },
            m.replace,
        )
    }

    fn execute_create_index(&mut self, i: CreateIndexStmt) -> Result<()> {
        if !self.tables.contains_key(&i.table_name) {
            return Err(TraceDbError::bad_argument(format!(
                "table {} does not exist",
                i.table_name
            )));
        }
        if !i.replace && self.indexes.contains_key(&i.index_name) {
            return Err(TraceDbError::DuplicateDefinition {
                message: format!("index {} already exists", i.index_name),
            });
        }
        if i.replace {
            self.sql
                .execute_batch(&format!("DROP INDEX IF EXISTS \"{}\"", i.index_name))?;
        }
        let ddl = format!(
            "CREATE INDEX \"{}\" ON \"{}\" ({})",
            i.index_name,
            i.table_name,
            i.columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.sql.execute_batch(&ddl)?;
        self.indexes
            .insert(i.index_name.clone(), (i.table_name.clone(), i.columns.clone()));
        Ok(())
    }

    fn execute_drop_index(&mut self, d: DropIndexStmt) -> Result<()> {
        match self.indexes.remove(&d.index_name) {
            Some(_) => {
                self.sql
                    .execute_batch(&format!("DROP INDEX IF EXISTS \"{}\"", d.index_name))?;
                Ok(())
            }
            None => Err(TraceDbError::UnknownIndex {
                name: d.index_name,
            }),
        }
    }
}

enum DispatchOutcome {
    Stats(ExecutionStats),
    PlainSql(String),
    PushedFrame,
}

fn sqlite_type_for(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Int64 => "INTEGER",
        ColumnKind::Double => "REAL",
        ColumnKind::String => "TEXT",
    }
}

fn bind_value_ref(stmt: &mut rusqlite::CachedStatement<'_>, idx: usize, value: ValueRef<'_>) -> Result<()> {
    stmt.raw_bind_parameter(idx + 1, value)
        .map_err(|e| TraceDbError::engine(e.to_string()))
}

/// Type-checks `args` against `def`'s declared argument types, prepares and
/// steps `def.body_sql` once with `$name` parameters bound, and returns the
/// single value the body's first result column produces for this call.
///
/// The `pool` borrow is held across the `query`/`next` call below. If
/// `def.body_sql` itself calls another registered scalar function — or
/// recursively calls `def` itself — that nested call reaches this same
/// function again through its own closure and asks `pool_handle.get_mut()`
/// for a second, simultaneous `&mut StringPool` (see [`crate::sync_cell`]).
/// This is a known, narrow limitation of the eager-UDF-registration design:
/// nested scalar function calls that only touch integer/float arguments
/// never intern a string and so never trip it, but a nested call chain that
/// interns through every level is unsound. Not fixed here; see DESIGN.md.
fn invoke_scalar_function_body(
    sql: &SqlEngine,
    pool: &mut StringPool,
    def: &ScalarFunctionDef,
    args: &[Value],
) -> Result<Value> {
    for (arg_def, value) in def.args.iter().zip(args.iter()) {
        let expected = declared_type_to_column_kind(&arg_def.declared_type)?;
        type_check(value, expected, &arg_def.name)?;
    }
    let mut stmt = sql
        .connection()
        .prepare(&def.body_sql)
        .map_err(|e| TraceDbError::engine(format!("{e} while preparing: {}", def.body_sql)))?;
    for (arg_def, value) in def.args.iter().zip(args.iter()) {
        let name = format!("${}", arg_def.name);
        if let Some(idx) = stmt
            .parameter_index(&name)
            .map_err(|e| TraceDbError::engine(e.to_string()))?
        {
            bind_value(&mut stmt, idx, *value, pool)?;
        }
    }
    let mut rows = stmt.query([]).map_err(|e| TraceDbError::engine(e.to_string()))?;
    let row = rows
        .next()
        .map_err(|e| TraceDbError::engine(e.to_string()))?
        .ok_or_else(|| TraceDbError::engine(format!("function {} body produced no rows", def.name)))?;
    let value_ref = row.get_ref(0).map_err(|e| TraceDbError::engine(e.to_string()))?;
    value_ref_to_value(value_ref, pool)
}

fn value_to_rusqlite_value(value: Value, pool: &StringPool) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(i) => rusqlite::types::Value::Integer(i),
        Value::Float(f) => rusqlite::types::Value::Real(f),
        Value::Text(id) => rusqlite::types::Value::Text(pool.resolve(id).to_string()),
    }
}

fn scalar_udf_err(e: TraceDbError) -> rusqlite::Error {
    rusqlite::Error::ModuleError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_perfetto_table_smoke() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO TABLE foo AS SELECT 42 AS bar;")
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT * FROM foo;")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let value: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn schema_mismatch_reports_both_columns() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        let err = engine
            .execute("CREATE PERFETTO TABLE foo(x INT) AS SELECT 1 AS y;")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("declared in the schema, but do not exist: x"));
        assert!(msg.contains("exist, but are not declared: y"));
    }

    #[test]
    fn empty_root_source_is_an_error() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        let err = engine.execute("   ").unwrap_err();
        assert!(matches!(err, TraceDbError::ParseError { .. }));
        assert!(err.to_string().contains("No valid SQL to run"));
    }

    #[test]
    fn wildcard_include_marks_modules_included_once() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        let mut foo_mods = std::collections::HashMap::new();
        foo_mods.insert("foo.a".to_string(), "SELECT 0 WHERE 0".to_string());
        engine.module_registry_mut().register_package("foo", foo_mods);
        engine.execute("INCLUDE PERFETTO MODULE *;").unwrap();
        assert!(engine.modules.is_included("foo.a"));
        // Re-including is a no-op, not an error.
        engine.execute("INCLUDE PERFETTO MODULE foo.a;").unwrap();
    }

    #[test]
    fn duplicate_table_without_replace_fails() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO TABLE foo AS SELECT 1 AS x;")
            .unwrap();
        let err = engine
            .execute("CREATE PERFETTO TABLE foo AS SELECT 2 AS x;")
            .unwrap_err();
        assert!(matches!(err, TraceDbError::DuplicateDefinition { .. }));
    }

    #[test]
    fn create_or_replace_table_succeeds() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO TABLE foo AS SELECT 1 AS x;")
            .unwrap();
        engine
            .execute("CREATE OR REPLACE PERFETTO TABLE foo AS SELECT 2 AS x;")
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT x FROM foo;")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let value: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn scalar_function_is_a_real_udf_reachable_from_sql() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION double_it(x LONG) RETURNS LONG AS SELECT $x + $x;")
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT double_it(21) AS v;")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let value: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn nested_scalar_function_calls_resolve_innermost_first() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION inc(x LONG) RETURNS LONG AS SELECT $x + 1;")
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT inc(inc(inc(0))) AS v;")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let value: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn table_valued_function_is_invoked_directly() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION doubled(x LONG) RETURNS TABLE(y LONG) AS SELECT $x * 2 AS y;")
            .unwrap();
        let table = engine
            .call_table_function("doubled", &[Value::Integer(5)])
            .unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.value(0, 0), Value::Integer(10));
    }

    #[test]
    fn table_valued_function_is_reachable_as_from_clause() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION doubled(x LONG) RETURNS TABLE(y LONG) AS SELECT $x * 2 AS y;")
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT y FROM doubled(5);")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let value: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 10);
    }

    #[test]
    fn rollup_tree_is_reachable_as_a_virtual_table() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute(
                "CREATE PERFETTO TABLE src AS \
                 SELECT 'x' AS a, 1 AS v UNION ALL SELECT 'x', 2 UNION ALL SELECT 'y', 3;\
                 CREATE VIRTUAL TABLE rt USING __intrinsic_rollup_tree(src, a, 'SUM(v)');",
            )
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT __id, __depth FROM rt WHERE __sort = 'agg_0 desc' AND __limit = 1;")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let (id, depth): (i64, i64) = stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?))).unwrap();
        assert_eq!(depth, 0);
        assert!(id >= 0);
    }

    #[test]
    fn pivot_tree_is_reachable_as_a_virtual_table() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute(
                "CREATE PERFETTO TABLE psrc AS SELECT 'x' AS a, 1 AS v UNION ALL SELECT 'y', 2;\
                 CREATE VIRTUAL TABLE pv USING __intrinsic_pivot(psrc, a, 'SUM(v)');",
            )
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT __has_children FROM pv WHERE __sort = '';")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let has_children: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert!(has_children == 0 || has_children == 1);
    }

    #[test]
    fn calling_a_scalar_function_as_table_valued_is_rejected() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION double_it(x LONG) RETURNS LONG AS SELECT $x + $x;")
            .unwrap();
        let err = engine
            .call_table_function("double_it", &[Value::Integer(1)])
            .unwrap_err();
        assert!(matches!(err, TraceDbError::BadArgument { .. }));
    }

    #[test]
    fn function_alias_via_using_shares_the_target_definition() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION double_it(x LONG) RETURNS LONG AS SELECT $x + $x;")
            .unwrap();
        engine
            .execute("CREATE PERFETTO FUNCTION twice(x LONG) RETURNS LONG USING double_it;")
            .unwrap();
        let (stmt, _) = engine
            .execute_until_last_statement("SELECT twice(10) AS v;")
            .unwrap();
        let mut stmt = stmt.unwrap();
        let value: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 20);
    }

    #[test]
    fn rollup_query_flattens_a_created_table() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute(
                "CREATE PERFETTO TABLE src AS \
                 SELECT 'x' AS a, 1 AS v UNION ALL SELECT 'x', 2 UNION ALL SELECT 'y', 3;",
            )
            .unwrap();
        let rows = engine
            .rollup_query(
                "src",
                &["a".to_string()],
                &["SUM(v)".to_string()],
                None,
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(rows[0].depth, 0);
        assert!(rows.len() > 1);
    }

    #[test]
    fn pivot_query_returns_string_coerced_cells() {
        let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
        engine
            .execute("CREATE PERFETTO TABLE psrc AS SELECT 'x' AS a, 1 AS v UNION ALL SELECT 'y', 2;")
            .unwrap();
        let rows = engine
            .pivot_query(
                "psrc",
                &["a".to_string()],
                &["SUM(v)".to_string()],
                "",
                None,
                None,
                None,
                None,
            )
            .unwrap();
        assert!(rows
            .iter()
            .any(|r| r.hierarchy_values.first().cloned().flatten().is_some()));
    }
}
