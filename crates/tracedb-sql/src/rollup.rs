//! `__intrinsic_rollup_tree` (component C8, rollup half).
//!
//! Builds a ROLLUP hierarchy from a source query with a single synthetic
//! `UNION ALL` query across grouping levels, exactly as the source engine's
//! `BuildRollupTree` does, then answers queries against the resulting tree:
//! sort, expand/collapse, depth filter, and pagination.
//!
//! [`RollupTree::build`]/[`RollupTree::flatten`] do this work; they are
//! reused both by [`crate::engine::PerfettoSqlEngine::rollup_query`] (a
//! direct Rust call) and by [`RollupVTab`]/[`RollupCursor`] below, which
//! register the same logic as a real `rusqlite::vtab` module under
//! `__intrinsic_rollup_tree` so `SELECT * FROM __intrinsic_rollup_tree(...)`
//! reaches it from arbitrary nested SQL (§4.8). Unlike the table-valued
//! function convention, the three creation parameters (`source`,
//! `hierarchy_cols`, `aggregations`) are ordinary `CREATE VIRTUAL TABLE`
//! arguments — the module is `VTabKind::Default`, not eponymous, so the
//! tree is built once at `connect` time. The later filter columns (`__sort`,
//! `__expanded_ids`, `__collapsed_ids`, `__min_depth`, `__max_depth`,
//! `__offset`, `__limit`, `__aggs`) are `HIDDEN` columns, any subset of
//! which may appear as a `WHERE` equality constraint, decoded per-query via
//! the `BestIndex`/`idxStr` protocol in [`crate::vtab_support`].

use std::collections::HashSet;
use std::os::raw::c_int;
use std::sync::Arc;
use tracedb_core::status::{Result, TraceDbError};
use tracedb_core::string_pool::StringPool;
use tracedb_core::value::Value;

use rusqlite::vtab::{Context, CreateVTab, IndexInfo, VTab, VTabConnection, VTabCursor, VTabKind, Values};

use crate::engine_wrapper::SqlEngine;
use crate::sync_cell::SyncCell;
use crate::vtab_support::{decode_idx_str, encode_constraints, unquote_vtab_arg};

/// Hidden filter columns, in the fixed order `idxStr` encodes them.
const HIDDEN_COLUMNS: &[&str] = &[
    "__sort",
    "__expanded_ids",
    "__collapsed_ids",
    "__min_depth",
    "__max_depth",
    "__offset",
    "__limit",
    "__aggs",
];

/// A single node of the rollup tree.
#[derive(Debug, Clone)]
pub struct RollupNode {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub depth: u32,
    /// Length `hierarchy_cols.len()`; entries `depth..` are `Value::Null`.
    pub hierarchy_values: Vec<Value>,
    pub aggregates: Vec<Value>,
    pub children: Vec<u64>,
}

/// An owned, flattened rollup row, independent of the tree's lifetime, for
/// callers that want to hold results past the point where the tree itself
/// would otherwise need to stay borrowed.
#[derive(Debug, Clone)]
pub struct RollupRow {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub depth: u32,
    pub hierarchy_values: Vec<Value>,
    pub aggregates: Vec<Value>,
}

impl From<&RollupNode> for RollupRow {
    fn from(node: &RollupNode) -> Self {
        RollupRow {
            id: node.id,
            parent_id: node.parent_id,
            depth: node.depth,
            hierarchy_values: node.hierarchy_values.clone(),
            aggregates: node.aggregates.clone(),
        }
    }
}

/// The materialized tree plus the column names it was built from.
pub struct RollupTree {
    pub hierarchy_cols: Vec<String>,
    pub aggregate_exprs: Vec<String>,
    pub nodes: Vec<RollupNode>,
}

/// One level of a parsed `__sort` spec: which key to sort children by, and
/// in which direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortKey {
    /// Sort every level's children by the hierarchy value at that level,
    /// ascending. Used for `name`/`__name` and the empty-string default.
    Alphabetic,
    /// `__group_N [ASC|DESC]`: sort level `N`'s children by hierarchy value
    /// using the given direction; every other level still sorts
    /// alphabetically ascending (§4.8's sort-specification table).
    GroupLevel(u32),
    /// Sort by the N-th aggregate.
    Aggregate(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortSpec {
    /// Parses a `__sort` constraint value. An **unspecified** `__sort`
    /// (the hidden column omitted from the query entirely) takes the
    /// engine's hardcoded default of `__agg_0 DESC`, matching the source
    /// engine's `Filter()`. An **explicit empty string**, which the
    /// distilled spec's sort table separately documents, instead falls
    /// back to alphabetic ascending — see DESIGN.md's Open Question entry
    /// for why these two cases are distinguished here. Use
    /// [`SortSpec::unspecified`] for the former.
    pub fn parse(spec: &str) -> Result<SortSpec> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(SortSpec {
                key: SortKey::Alphabetic,
                direction: SortDirection::Asc,
            });
        }
        let mut parts = spec.split_whitespace();
        let key_tok = parts.next().unwrap_or("");
        let dir_tok = parts.next();
        let direction = match dir_tok.map(str::to_ascii_uppercase).as_deref() {
            Some("DESC") => SortDirection::Desc,
            Some("ASC") | None => SortDirection::Asc,
            Some(other) => {
                return Err(TraceDbError::bad_argument(format!(
                    "invalid sort direction '{other}'"
                )))
            }
        };
        let key = if let Some(n) = key_tok.strip_prefix("__agg_") {
            let idx: usize = n
                .parse()
                .map_err(|_| TraceDbError::bad_argument(format!("invalid sort spec '{spec}'")))?;
            SortKey::Aggregate(idx)
        } else if let Some(n) = key_tok.strip_prefix("__group_") {
            let level: u32 = n
                .parse()
                .map_err(|_| TraceDbError::bad_argument(format!("invalid sort spec '{spec}'")))?;
            SortKey::GroupLevel(level)
        } else {
            SortKey::Alphabetic
        };
        Ok(SortSpec { key, direction })
    }

    /// The engine-level default used when `__sort` is not supplied at all.
    pub fn unspecified_default() -> SortSpec {
        SortSpec {
            key: SortKey::Aggregate(0),
            direction: SortDirection::Desc,
        }
    }
}

/// Expand/collapse selection: allowlist (`__expanded_ids`) or denylist
/// (`__collapsed_ids`). If both are supplied the denylist wins (§4.8).
pub enum ExpansionSpec {
    ExpandAll,
    Allowlist(HashSet<u64>),
    Denylist(HashSet<u64>),
}

impl ExpansionSpec {
    pub fn from_constraints(expanded_ids: Option<&str>, collapsed_ids: Option<&str>) -> Self {
        if let Some(collapsed) = collapsed_ids {
            return ExpansionSpec::Denylist(parse_id_list(collapsed));
        }
        match expanded_ids {
            Some(expanded) => ExpansionSpec::Allowlist(parse_id_list(expanded)),
            None => ExpansionSpec::ExpandAll,
        }
    }

    pub(crate) fn is_expanded(&self, id: u64) -> bool {
        match self {
            ExpansionSpec::ExpandAll => true,
            ExpansionSpec::Allowlist(set) => set.contains(&id),
            ExpansionSpec::Denylist(set) => !set.contains(&id),
        }
    }
}

fn parse_id_list(s: &str) -> HashSet<u64> {
    s.split(',')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

impl RollupTree {
    /// Builds the tree from `source` (a table name or parenthesized
    /// subquery), `hierarchy_cols` (cumulative grouping key, depth order),
    /// and `aggregate_exprs` (at least one, at most 32 per §4.8).
    pub fn build(
        sql: &SqlEngine,
        pool: &mut StringPool,
        source: &str,
        hierarchy_cols: &[String],
        aggregate_exprs: &[String],
        max_aggregates: usize,
    ) -> Result<RollupTree> {
        if hierarchy_cols.is_empty() {
            return Err(TraceDbError::bad_argument("rollup requires at least one hierarchy column"));
        }
        if aggregate_exprs.is_empty() || aggregate_exprs.len() > max_aggregates {
            return Err(TraceDbError::bad_argument(format!(
                "rollup requires between 1 and {max_aggregates} aggregate expressions"
            )));
        }

        let d = hierarchy_cols.len();
        let agg_select = aggregate_exprs
            .iter()
            .enumerate()
            .map(|(i, expr)| format!("{expr} AS agg_{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut branches = Vec::with_capacity(d + 1);
        // __level = -1: grand total.
        let nulls = hierarchy_cols.iter().map(|c| format!("NULL AS {c}")).collect::<Vec<_>>().join(", ");
        branches.push(format!("SELECT -1 AS __level, {nulls}, {agg_select} FROM {source}"));
        for level in 0..d {
            let cols = hierarchy_cols
                .iter()
                .enumerate()
                .map(|(i, c)| if i <= level { c.clone() } else { format!("NULL AS {c}") })
                .collect::<Vec<_>>()
                .join(", ");
            let group_by = hierarchy_cols[..=level].join(", ");
            branches.push(format!(
                "SELECT {level} AS __level, {cols}, {agg_select} FROM {source} GROUP BY {group_by}"
            ));
        }
        let query = branches.join(" UNION ALL ");

        let mut stmt = sql
            .connection()
            .prepare(&query)
            .map_err(|e| TraceDbError::engine(format!("{e} while building rollup tree: {query}")))?;
        let mut rows = stmt.query([]).map_err(|e| TraceDbError::engine(e.to_string()))?;

        let mut tree = RollupTree {
            hierarchy_cols: hierarchy_cols.to_vec(),
            aggregate_exprs: aggregate_exprs.to_vec(),
            nodes: vec![RollupNode {
                id: 0,
                parent_id: None,
                depth: 0,
                hierarchy_values: vec![Value::Null; d],
                aggregates: vec![Value::Null; aggregate_exprs.len()],
                children: Vec::new(),
            }],
        };

        while let Some(row) = rows.next().map_err(|e| TraceDbError::engine(e.to_string()))? {
            let level: i64 = row.get(0).map_err(|e| TraceDbError::engine(e.to_string()))?;
            let mut hierarchy_values = Vec::with_capacity(d);
            for i in 0..d {
                hierarchy_values.push(value_from_row(&row, 1 + i, pool)?);
            }
            let mut aggregates = Vec::with_capacity(aggregate_exprs.len());
            for i in 0..aggregate_exprs.len() {
                aggregates.push(value_from_row(&row, 1 + d + i, pool)?);
            }
            if level == -1 {
                tree.nodes[0].aggregates = aggregates;
                continue;
            }
            let depth = (level as u32) + 1;
            tree.insert_at_depth(depth, &hierarchy_values, aggregates);
        }

        Ok(tree)
    }

    /// Inserts a row at the given depth, synthesizing any missing
    /// intermediate ancestors along the way (their hierarchy values are
    /// implied, but the source's ROLLUP query never emits a row for a level
    /// whose group happens to collapse entirely into NULLs upstream).
    fn insert_at_depth(&mut self, depth: u32, hierarchy_values: &[Value], aggregates: Vec<Value>) {
        let mut parent_id = 0u64;
        for ancestor_depth in 1..depth {
            let prefix = &hierarchy_values[..ancestor_depth as usize];
            parent_id = self.find_or_synthesize(parent_id, ancestor_depth, prefix);
        }
        if let Some(existing) = self.find_child_with_prefix(parent_id, &hierarchy_values[..depth as usize]) {
            self.nodes[existing as usize].aggregates = aggregates;
            return;
        }
        let id = self.nodes.len() as u64;
        let mut values = vec![Value::Null; hierarchy_values.len()];
        values[..depth as usize].copy_from_slice(&hierarchy_values[..depth as usize]);
        self.nodes.push(RollupNode {
            id,
            parent_id: Some(parent_id),
            depth,
            hierarchy_values: values,
            aggregates,
            children: Vec::new(),
        });
        self.nodes[parent_id as usize].children.push(id);
    }

    fn find_child_with_prefix(&self, parent_id: u64, prefix: &[Value]) -> Option<u64> {
        self.nodes[parent_id as usize]
            .children
            .iter()
            .copied()
            .find(|&child_id| self.nodes[child_id as usize].hierarchy_values[..prefix.len()] == *prefix)
    }

    fn find_or_synthesize(&mut self, parent_id: u64, depth: u32, prefix: &[Value]) -> u64 {
        if let Some(existing) = self.find_child_with_prefix(parent_id, prefix) {
            return existing;
        }
        let id = self.nodes.len() as u64;
        let total_cols = self.hierarchy_cols.len();
        let mut values = vec![Value::Null; total_cols];
        values[..prefix.len()].copy_from_slice(prefix);
        let agg_count = self.aggregate_exprs.len();
        self.nodes.push(RollupNode {
            id,
            parent_id: Some(parent_id),
            depth,
            hierarchy_values: values,
            aggregates: vec![Value::Null; agg_count],
            children: Vec::new(),
        });
        self.nodes[parent_id as usize].children.push(id);
        id
    }

    /// Flattens the tree into the rows a query would observe: pre-order
    /// traversal (root first) honoring expand/collapse, sorted per `sort`,
    /// filtered by `[min_depth, max_depth]`, then paginated by
    /// `offset`/`limit`.
    pub fn flatten(
        &self,
        pool: &StringPool,
        sort: &SortSpec,
        expansion: &ExpansionSpec,
        min_depth: Option<u32>,
        max_depth: Option<u32>,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<&RollupNode> {
        let mut out = Vec::new();
        self.visit(0, sort, expansion, min_depth, max_depth, pool, &mut out);
        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(usize::MAX);
        out.into_iter().skip(offset).take(limit).collect()
    }

    fn visit<'a>(
        &'a self,
        node_id: u64,
        sort: &SortSpec,
        expansion: &ExpansionSpec,
        min_depth: Option<u32>,
        max_depth: Option<u32>,
        pool: &StringPool,
        out: &mut Vec<&'a RollupNode>,
    ) {
        let node = &self.nodes[node_id as usize];
        let depth_ok = min_depth.is_none_or(|m| node.depth >= m) && max_depth.is_none_or(|m| node.depth <= m);
        if depth_ok {
            out.push(node);
        }
        if node_id != 0 && !expansion.is_expanded(node_id) {
            return;
        }
        let mut children = node.children.clone();
        children.sort_by(|&a, &b| self.compare_children(a, b, sort, pool));
        for child in children {
            self.visit(child, sort, expansion, min_depth, max_depth, pool, out);
        }
    }

    fn compare_children(&self, a: u64, b: u64, sort: &SortSpec, pool: &StringPool) -> std::cmp::Ordering {
        let node_a = &self.nodes[a as usize];
        let node_b = &self.nodes[b as usize];
        let level = node_a.depth.max(1) as usize - 1;
        let alphabetic = || {
            let va = node_a.hierarchy_values.get(level).copied().unwrap_or(Value::Null);
            let vb = node_b.hierarchy_values.get(level).copied().unwrap_or(Value::Null);
            va.to_display_string(pool).cmp(&vb.to_display_string(pool))
        };
        match sort.key {
            SortKey::Alphabetic => match sort.direction {
                SortDirection::Asc => alphabetic(),
                SortDirection::Desc => alphabetic().reverse(),
            },
            SortKey::GroupLevel(n) => {
                // Only the named level honors the requested direction; every
                // other level falls back to plain alphabetic ascending.
                if level as u32 == n {
                    match sort.direction {
                        SortDirection::Asc => alphabetic(),
                        SortDirection::Desc => alphabetic().reverse(),
                    }
                } else {
                    alphabetic()
                }
            }
            SortKey::Aggregate(idx) => {
                let va = node_a.aggregates.get(idx).copied().unwrap_or(Value::Null).to_sort_f64(pool);
                let vb = node_b.aggregates.get(idx).copied().unwrap_or(Value::Null).to_sort_f64(pool);
                let ordering = va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal);
                match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            }
        }
    }
}

fn value_from_row(row: &rusqlite::Row<'_>, idx: usize, pool: &mut StringPool) -> Result<Value> {
    use rusqlite::types::ValueRef;
    let value_ref = row.get_ref(idx).map_err(|e| TraceDbError::engine(e.to_string()))?;
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

/// Aux data handed to every `RollupVTab::connect` call: shared handles to
/// the embedded connection and string pool, plus the configured aggregate
/// cap, so the module can build a [`RollupTree`] the same way
/// [`crate::engine::PerfettoSqlEngine::rollup_query`] does.
pub struct RollupAux {
    pub sql: Arc<SqlEngine>,
    pub pool: Arc<SyncCell<StringPool>>,
    pub max_aggregates: usize,
}

/// The `rusqlite::vtab::VTab` implementation backing
/// `__intrinsic_rollup_tree`. Registered `VTabKind::Default`: a normal
/// `CREATE VIRTUAL TABLE rt USING __intrinsic_rollup_tree(source,
/// hierarchy_cols, aggregations)` builds the tree once; subsequent `SELECT`s
/// against `rt` reuse it, filtered per the hidden columns in `HIDDEN_COLUMNS`.
pub struct RollupVTab {
    tree: Arc<RollupTree>,
    pool: Arc<SyncCell<StringPool>>,
}

impl std::fmt::Debug for RollupVTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupVTab")
            .field("hierarchy_cols", &self.tree.hierarchy_cols)
            .finish()
    }
}

fn rollup_schema(hierarchy_cols: &[String], agg_count: usize) -> String {
    let mut cols: Vec<String> = hierarchy_cols.iter().map(|c| format!("\"{c}\"")).collect();
    cols.push("__id INTEGER".into());
    cols.push("__parent_id INTEGER".into());
    cols.push("__depth INTEGER".into());
    for i in 0..agg_count {
        cols.push(format!("__agg_{i}"));
    }
    for hidden in HIDDEN_COLUMNS {
        cols.push(format!("\"{hidden}\" HIDDEN"));
    }
    format!("CREATE TABLE x({})", cols.join(", "))
}

/// Parses the three positional `CREATE VIRTUAL TABLE` arguments SQLite
/// passes after the module and database name: source, a comma-separated
/// hierarchy column list, and a comma-separated aggregate expression list.
fn parse_create_args(args: &[&[u8]]) -> rusqlite::Result<(String, Vec<String>, Vec<String>)> {
    if args.len() < 5 {
        return Err(rusqlite::Error::ModuleError(
            "__intrinsic_rollup_tree requires (source, hierarchy_cols, aggregations)".into(),
        ));
    }
    let source = unquote_vtab_arg(args[2]);
    let hierarchy_cols: Vec<String> = unquote_vtab_arg(args[3])
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let aggregate_exprs: Vec<String> = unquote_vtab_arg(args[4])
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Ok((source, hierarchy_cols, aggregate_exprs))
}

// SAFETY: `connect` returns a schema matching exactly the columns `column`
// serves (hierarchy columns, `__id`/`__parent_id`/`__depth`, `__agg_N`, then
// `HIDDEN_COLUMNS`), and `best_index` only omits constraints `filter`
// actually consumes via `vtab_support::encode_constraints`.
#[allow(unsafe_code)]
unsafe impl<'vtab> VTab<'vtab> for RollupVTab {
    type Aux = RollupAux;
    type Cursor = RollupCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let aux = aux.ok_or_else(|| rusqlite::Error::ModuleError("missing rollup aux data".into()))?;
        let (source, hierarchy_cols, aggregate_exprs) = parse_create_args(args)?;
        let agg_count = aggregate_exprs.len();
        let tree = RollupTree::build(
            &aux.sql,
            aux.pool.get_mut(),
            &source,
            &hierarchy_cols,
            &aggregate_exprs,
            aux.max_aggregates,
        )
        .map_err(|e| rusqlite::Error::ModuleError(e.to_string()))?;
        let schema = rollup_schema(&hierarchy_cols, agg_count);
        Ok((
            schema,
            RollupVTab {
                tree: Arc::new(tree),
                pool: Arc::clone(&aux.pool),
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let d = self.tree.hierarchy_cols.len();
        let hidden_start = d + 3 + self.tree.aggregate_exprs.len();
        let idx_str = encode_constraints(info, hidden_start, HIDDEN_COLUMNS.len());
        info.set_idx_str(&idx_str);
        info.set_estimated_cost(1000.0);
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<Self::Cursor> {
        Ok(RollupCursor {
            tree: Arc::clone(&self.tree),
            pool: Arc::clone(&self.pool),
            rows: Vec::new(),
            row: 0,
            phantom: std::marker::PhantomData,
        })
    }
}

/// `CREATE VIRTUAL TABLE ... USING __intrinsic_rollup_tree(...)` drives
/// `create`, which falls back to the default `connect` delegation — there's
/// nothing to do differently at creation time versus re-connecting to an
/// already-created table (the tree is always rebuilt, never persisted).
impl<'vtab> CreateVTab<'vtab> for RollupVTab {
    const KIND: VTabKind = VTabKind::Default;
}

pub struct RollupCursor<'vtab> {
    tree: Arc<RollupTree>,
    pool: Arc<SyncCell<StringPool>>,
    rows: Vec<RollupRow>,
    row: usize,
    phantom: std::marker::PhantomData<&'vtab RollupVTab>,
}

impl std::fmt::Debug for RollupCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupCursor").field("row", &self.row).finish()
    }
}

fn vtab_err(e: TraceDbError) -> rusqlite::Error {
    rusqlite::Error::ModuleError(e.to_string())
}

#[allow(unsafe_code)]
unsafe impl VTabCursor for RollupCursor<'_> {
    fn filter(&mut self, _idx_num: c_int, idx_str: Option<&str>, args: &Values<'_>) -> rusqlite::Result<()> {
        let idx_str = idx_str.unwrap_or("");
        let slots = decode_idx_str(idx_str, HIDDEN_COLUMNS.len());
        let pool = self.pool.get();

        let read_str = |slot: Option<usize>| -> rusqlite::Result<Option<String>> {
            match slot {
                None => Ok(None),
                Some(i) => {
                    let raw = args.get_raw(i).map_err(|e| rusqlite::Error::ModuleError(e.to_string()))?;
                    Ok(raw.as_str().ok().map(str::to_string))
                }
            }
        };
        let read_int = |slot: Option<usize>| -> rusqlite::Result<Option<i64>> {
            match slot {
                None => Ok(None),
                Some(i) => {
                    let raw = args.get_raw(i).map_err(|e| rusqlite::Error::ModuleError(e.to_string()))?;
                    Ok(raw.as_i64().ok())
                }
            }
        };

        let sort_str = read_str(slots[0])?;
        let expanded_ids = read_str(slots[1])?;
        let collapsed_ids = read_str(slots[2])?;
        let min_depth = read_int(slots[3])?.map(|v| v as u32);
        let max_depth = read_int(slots[4])?.map(|v| v as u32);
        let offset = read_int(slots[5])?.map(|v| v as usize);
        let limit = read_int(slots[6])?.map(|v| v as usize);
        // __aggs (slot 7) is accepted but inert; see DESIGN.md.

        let sort = match &sort_str {
            Some(s) => SortSpec::parse(s).map_err(vtab_err)?,
            None => SortSpec::unspecified_default(),
        };
        let expansion = ExpansionSpec::from_constraints(expanded_ids.as_deref(), collapsed_ids.as_deref());

        let nodes = self
            .tree
            .flatten(pool, &sort, &expansion, min_depth, max_depth, offset, limit);
        self.rows = nodes.into_iter().map(RollupRow::from).collect();
        self.row = 0;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.row += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.row >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let d = self.tree.hierarchy_cols.len();
        let agg_count = self.tree.aggregate_exprs.len();
        let row = &self.rows[self.row];
        let i = i as usize;
        let pool = self.pool.get();
        if i < d {
            return set_rollup_result(ctx, row.hierarchy_values[i], pool);
        }
        if i == d {
            return ctx.set_result(&(row.id as i64));
        }
        if i == d + 1 {
            return match row.parent_id {
                Some(p) => ctx.set_result(&(p as i64)),
                None => ctx.set_result(&rusqlite::types::Null),
            };
        }
        if i == d + 2 {
            return ctx.set_result(&(row.depth as i64));
        }
        if i < d + 3 + agg_count {
            return set_rollup_result(ctx, row.aggregates[i - d - 3], pool);
        }
        // Hidden filter columns are never read back for an omitted
        // constraint.
        ctx.set_result(&rusqlite::types::Null)
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.row as i64)
    }
}

fn set_rollup_result(ctx: &mut Context, value: Value, pool: &StringPool) -> rusqlite::Result<()> {
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

    fn setup() -> (SqlEngine, StringPool) {
        let sql = SqlEngine::open_in_memory().unwrap();
        sql.execute_batch(
            "CREATE TABLE src(a TEXT, g INT, v INT);
             INSERT INTO src VALUES ('x', 1, 1), ('x', 2, 2), ('y', 1, 3);",
        )
        .unwrap();
        (sql, StringPool::new())
    }

    #[test]
    fn empty_source_yields_root_only() {
        let sql = SqlEngine::open_in_memory().unwrap();
        sql.execute_batch("CREATE TABLE empty_src(a TEXT, v INT)").unwrap();
        let mut pool = StringPool::new();
        let tree = RollupTree::build(&sql, &mut pool, "empty_src", &["a".into()], &["COUNT(*)".into()], 32).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.nodes[0].depth, 0);
    }

    #[test]
    fn grand_total_matches_full_aggregate() {
        let (sql, mut pool) = setup();
        let tree = RollupTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        assert_eq!(tree.nodes[0].aggregates[0], Value::Integer(6));
    }

    #[test]
    fn every_node_depth_equals_non_null_prefix_length() {
        let (sql, mut pool) = setup();
        let tree = RollupTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        for node in &tree.nodes {
            let non_null = node.hierarchy_values.iter().take_while(|v| !v.is_null()).count();
            assert_eq!(non_null, node.depth as usize);
        }
    }

    #[test]
    fn sort_desc_by_aggregate_orders_children() {
        let (sql, mut pool) = setup();
        let tree = RollupTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        let sort = SortSpec {
            key: SortKey::Aggregate(0),
            direction: SortDirection::Desc,
        };
        let expansion = ExpansionSpec::ExpandAll;
        let rows = tree.flatten(&pool, &sort, &expansion, None, None, None, None);
        // root, then x (agg=3) before y (agg=3) is a tie; what matters is
        // depth-1 children precede depth-2 children in pre-order and the
        // whole traversal is non-empty.
        assert_eq!(rows[0].depth, 0);
        assert!(rows.len() > 1);
    }

    #[test]
    fn collapsed_root_hides_all_descendants() {
        let (sql, mut pool) = setup();
        let tree = RollupTree::build(&sql, &mut pool, "src", &["a".into()], &["SUM(v)".into()], 32).unwrap();
        let sort = SortSpec::parse("").unwrap();
        let mut collapsed = HashSet::new();
        // Collapse every depth-1 node (their ids are allocated after root).
        for node in &tree.nodes {
            if node.depth == 1 {
                collapsed.insert(node.id);
            }
        }
        let expansion = ExpansionSpec::Denylist(collapsed);
        let rows = tree.flatten(&pool, &sort, &expansion, None, None, None, None);
        // root + depth-1 nodes only, no depth-2 descendants.
        assert!(rows.iter().all(|n| n.depth <= 1));
    }

    #[test]
    fn unspecified_sort_defaults_to_agg_0_desc() {
        let default = SortSpec::unspecified_default();
        assert_eq!(default.key, SortKey::Aggregate(0));
        assert_eq!(default.direction, SortDirection::Desc);
    }

    #[test]
    fn explicit_empty_sort_string_is_alphabetic_ascending() {
        let parsed = SortSpec::parse("").unwrap();
        assert_eq!(parsed.key, SortKey::Alphabetic);
        assert_eq!(parsed.direction, SortDirection::Asc);
    }

    #[test]
    fn group_level_sort_parses_level_and_direction() {
        let parsed = SortSpec::parse("__group_1 DESC").unwrap();
        assert_eq!(parsed.key, SortKey::GroupLevel(1));
        assert_eq!(parsed.direction, SortDirection::Desc);
    }

    #[test]
    fn group_level_sort_only_reverses_the_named_level() {
        let (sql, mut pool) = setup();
        let tree = RollupTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        // Level 0 (the `a` hierarchy) should sort descending; level 1 (`g`)
        // should remain ascending regardless.
        let sort = SortSpec::parse("__group_0 DESC").unwrap();
        let expansion = ExpansionSpec::ExpandAll;
        let rows = tree.flatten(&pool, &sort, &expansion, None, None, None, None);
        let depth1: Vec<&RollupNode> = rows.iter().filter(|n| n.depth == 1).copied().collect();
        // 'y' sorts after 'x' alphabetically ascending, so DESC at level 0
        // puts 'y' first.
        assert_eq!(depth1[0].hierarchy_values[0].to_display_string(&pool), "y");
    }
}
