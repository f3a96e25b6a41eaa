//! `__intrinsic_pivot` (component C8, pivot half).
//!
//! Shares its tree-construction query and expand/collapse/sort/paginate
//! machinery with [`crate::rollup`], differing in exactly the ways §4.8
//! calls out: every hierarchy and aggregate value is coerced to its display
//! string at insertion time (so two pivot cells holding `1` and `"1"` are
//! indistinguishable — documented as "lossless for integers representable
//! in decimal text" and otherwise unspecified, per the design notes), nodes
//! carry a `__has_children` flag instead of a depth filter, and a pivot
//! handle remembers the last `__sort` spec it applied so a repeated query
//! with an unchanged spec skips re-sorting.
//!
//! [`PivotTree::build`]/[`PivotTree::flatten`] are reused both by
//! [`crate::engine::PerfettoSqlEngine::pivot_query`] (a direct Rust call)
//! and by [`PivotVTab`]/[`PivotCursor`] below, which register a real
//! `rusqlite::vtab` module under `__intrinsic_pivot` (§4.8). The tree's
//! lazy re-sort cache (`last_sort`/`sorted_children`) needs `&mut self` to
//! flatten, so unlike [`crate::rollup::RollupVTab`] (which shares an
//! immutable `Arc<RollupTree>`), the vtab holds the tree behind a
//! [`crate::sync_cell::SyncCell`].

use tracedb_core::status::{Result, TraceDbError};
use tracedb_core::string_pool::StringPool;
use tracedb_core::value::Value;

use rusqlite::vtab::{Context, CreateVTab, IndexInfo, VTab, VTabConnection, VTabCursor, VTabKind, Values};
use std::os::raw::c_int;
use std::sync::Arc;

use crate::engine_wrapper::SqlEngine;
use crate::rollup::{ExpansionSpec, SortDirection, SortKey, SortSpec};
use crate::sync_cell::SyncCell;
use crate::vtab_support::{decode_idx_str, encode_constraints, unquote_vtab_arg};

/// Hidden filter columns, in the fixed order `idxStr` encodes them. Pivot
/// has no depth filter (§4.8), unlike rollup.
const HIDDEN_COLUMNS: &[&str] = &["__sort", "__expanded_ids", "__collapsed_ids", "__offset", "__limit"];

/// A single pivot node. Hierarchy and aggregate values are stored as
/// already-rendered display strings, matching the source engine's pivot
/// table's internal string coercion.
#[derive(Debug, Clone)]
pub struct PivotNode {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub depth: u32,
    /// Length `hierarchy_cols.len()`; entries `depth..` are `None`.
    pub hierarchy_values: Vec<Option<String>>,
    pub aggregates: Vec<Option<String>>,
    pub children: Vec<u64>,
}

impl PivotNode {
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

/// An owned, flattened pivot row, independent of the tree's lifetime.
#[derive(Debug, Clone)]
pub struct PivotRow {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub depth: u32,
    pub has_children: bool,
    pub hierarchy_values: Vec<Option<String>>,
    pub aggregates: Vec<Option<String>>,
}

impl From<&PivotNode> for PivotRow {
    fn from(node: &PivotNode) -> Self {
        PivotRow {
            id: node.id,
            parent_id: node.parent_id,
            depth: node.depth,
            has_children: node.has_children(),
            hierarchy_values: node.hierarchy_values.clone(),
            aggregates: node.aggregates.clone(),
        }
    }
}

/// The materialized pivot tree plus a memoized last-applied sort spec, so a
/// cursor that re-issues the same `__sort` string between invocations (the
/// common case when a UI merely re-paginates) does not pay for a re-sort.
pub struct PivotTree {
    pub hierarchy_cols: Vec<String>,
    pub aggregate_exprs: Vec<String>,
    pub nodes: Vec<PivotNode>,
    last_sort: Option<String>,
    sorted_children: Vec<Vec<u64>>,
}

impl PivotTree {
    pub fn build(
        sql: &SqlEngine,
        _pool: &mut StringPool,
        source: &str,
        hierarchy_cols: &[String],
        aggregate_exprs: &[String],
        max_aggregates: usize,
    ) -> Result<PivotTree> {
        if hierarchy_cols.is_empty() {
            return Err(TraceDbError::bad_argument("pivot requires at least one hierarchy column"));
        }
        if aggregate_exprs.is_empty() || aggregate_exprs.len() > max_aggregates {
            return Err(TraceDbError::bad_argument(format!(
                "pivot requires between 1 and {max_aggregates} aggregate expressions"
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
            .map_err(|e| TraceDbError::engine(format!("{e} while building pivot tree: {query}")))?;
        let mut rows = stmt.query([]).map_err(|e| TraceDbError::engine(e.to_string()))?;

        let mut tree = PivotTree {
            hierarchy_cols: hierarchy_cols.to_vec(),
            aggregate_exprs: aggregate_exprs.to_vec(),
            nodes: vec![PivotNode {
                id: 0,
                parent_id: None,
                depth: 0,
                hierarchy_values: vec![None; d],
                aggregates: vec![None; aggregate_exprs.len()],
                children: Vec::new(),
            }],
            last_sort: None,
            sorted_children: vec![Vec::new()],
        };

        while let Some(row) = rows.next().map_err(|e| TraceDbError::engine(e.to_string()))? {
            let level: i64 = row.get(0).map_err(|e| TraceDbError::engine(e.to_string()))?;
            let mut hierarchy_values = Vec::with_capacity(d);
            for i in 0..d {
                hierarchy_values.push(string_from_row(&row, 1 + i)?);
            }
            let mut aggregates = Vec::with_capacity(aggregate_exprs.len());
            for i in 0..aggregate_exprs.len() {
                aggregates.push(string_from_row(&row, 1 + d + i)?);
            }
            if level == -1 {
                tree.nodes[0].aggregates = aggregates;
                continue;
            }
            let depth = (level as u32) + 1;
            tree.insert_at_depth(depth, &hierarchy_values, aggregates);
        }
        tree.sorted_children = vec![Vec::new(); tree.nodes.len()];
        Ok(tree)
    }

    fn insert_at_depth(&mut self, depth: u32, hierarchy_values: &[Option<String>], aggregates: Vec<Option<String>>) {
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
        let mut values = vec![None; hierarchy_values.len()];
        values[..depth as usize].clone_from_slice(&hierarchy_values[..depth as usize]);
        self.nodes.push(PivotNode {
            id,
            parent_id: Some(parent_id),
            depth,
            hierarchy_values: values,
            aggregates,
            children: Vec::new(),
        });
        self.nodes[parent_id as usize].children.push(id);
    }

    fn find_child_with_prefix(&self, parent_id: u64, prefix: &[Option<String>]) -> Option<u64> {
        self.nodes[parent_id as usize]
            .children
            .iter()
            .copied()
            .find(|&child_id| self.nodes[child_id as usize].hierarchy_values[..prefix.len()] == *prefix)
    }

    fn find_or_synthesize(&mut self, parent_id: u64, depth: u32, prefix: &[Option<String>]) -> u64 {
        if let Some(existing) = self.find_child_with_prefix(parent_id, prefix) {
            return existing;
        }
        let id = self.nodes.len() as u64;
        let total_cols = self.hierarchy_cols.len();
        let mut values = vec![None; total_cols];
        values[..prefix.len()].clone_from_slice(prefix);
        let agg_count = self.aggregate_exprs.len();
        self.nodes.push(PivotNode {
            id,
            parent_id: Some(parent_id),
            depth,
            hierarchy_values: values,
            aggregates: vec![None; agg_count],
            children: Vec::new(),
        });
        self.nodes[parent_id as usize].children.push(id);
        id
    }

    /// Re-sorts every node's children by `sort` if `sort` differs from the
    /// spec applied on the previous call, then flattens pre-order honoring
    /// expand/collapse and pagination. Pivot has no depth filter (§4.8).
    pub fn flatten(
        &mut self,
        sort_spec_str: &str,
        sort: &SortSpec,
        expansion: &ExpansionSpec,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<&PivotNode> {
        if self.last_sort.as_deref() != Some(sort_spec_str) {
            self.resort(sort);
            self.last_sort = Some(sort_spec_str.to_string());
        }
        let mut out = Vec::new();
        self.visit(0, expansion, &mut out);
        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(usize::MAX);
        out.into_iter().skip(offset).take(limit).collect()
    }

    fn resort(&mut self, sort: &SortSpec) {
        for node_idx in 0..self.nodes.len() {
            let mut children = self.nodes[node_idx].children.clone();
            children.sort_by(|&a, &b| self.compare_children(a, b, sort));
            self.sorted_children[node_idx] = children;
        }
    }

    fn visit<'a>(&'a self, node_id: u64, expansion: &ExpansionSpec, out: &mut Vec<&'a PivotNode>) {
        let node = &self.nodes[node_id as usize];
        out.push(node);
        if node_id != 0 && !expansion.is_expanded(node_id) {
            return;
        }
        for &child in &self.sorted_children[node_id as usize] {
            self.visit(child, expansion, out);
        }
    }

    fn compare_children(&self, a: u64, b: u64, sort: &SortSpec) -> std::cmp::Ordering {
        let node_a = &self.nodes[a as usize];
        let node_b = &self.nodes[b as usize];
        let level = node_a.depth.max(1) as usize - 1;
        let alphabetic = || {
            let va = node_a.hierarchy_values.get(level).cloned().flatten().unwrap_or_default();
            let vb = node_b.hierarchy_values.get(level).cloned().flatten().unwrap_or_default();
            va.cmp(&vb)
        };
        match sort.key {
            SortKey::Alphabetic => match sort.direction {
                SortDirection::Asc => alphabetic(),
                SortDirection::Desc => alphabetic().reverse(),
            },
            SortKey::GroupLevel(n) => {
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
                let va = pivot_sort_f64(node_a.aggregates.get(idx).cloned().flatten());
                let vb = pivot_sort_f64(node_b.aggregates.get(idx).cloned().flatten());
                let ordering = va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal);
                match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            }
        }
    }
}

/// Converts a pivot cell's stored string to a sort key: nulls sort as
/// negative infinity, non-numeric text parses to negative infinity too,
/// matching the rollup sort contract's treatment of non-numeric values.
fn pivot_sort_f64(value: Option<String>) -> f64 {
    value.and_then(|s| s.parse::<f64>().ok()).unwrap_or(f64::NEG_INFINITY)
}

fn string_from_row(row: &rusqlite::Row<'_>, idx: usize) -> Result<Option<String>> {
    use rusqlite::types::ValueRef;
    let value_ref = row.get_ref(idx).map_err(|e| TraceDbError::engine(e.to_string()))?;
    Ok(match value_ref {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(
            std::str::from_utf8(t)
                .map_err(|e| TraceDbError::engine(e.to_string()))?
                .to_string(),
        ),
        ValueRef::Blob(_) => None,
    })
}

/// Renders a pivot cell as a typed [`Value`] purely for callers that want a
/// uniform return shape across rollup and pivot; the pivot tree itself never
/// stores anything but strings, so this always yields `Text` or `Null`.
pub fn cell_to_value(cell: &Option<String>, pool: &mut StringPool) -> Value {
    match cell {
        None => Value::Null,
        Some(s) => Value::Text(pool.intern(s)),
    }
}

/// Aux data handed to every `PivotVTab::connect` call.
pub struct PivotAux {
    pub sql: Arc<SqlEngine>,
    pub pool: Arc<SyncCell<StringPool>>,
    pub max_aggregates: usize,
}

/// The `rusqlite::vtab::VTab` implementation backing `__intrinsic_pivot`.
/// Registered `VTabKind::Default`, same creation-argument convention as
/// [`crate::rollup::RollupVTab`].
pub struct PivotVTab {
    tree: Arc<SyncCell<PivotTree>>,
    pool: Arc<SyncCell<StringPool>>,
    hierarchy_cols: Vec<String>,
    agg_count: usize,
}

impl std::fmt::Debug for PivotVTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PivotVTab").field("hierarchy_cols", &self.hierarchy_cols).finish()
    }
}

fn pivot_schema(hierarchy_cols: &[String], agg_count: usize) -> String {
    let mut cols: Vec<String> = hierarchy_cols.iter().map(|c| format!("\"{c}\"")).collect();
    cols.push("__id INTEGER".into());
    cols.push("__parent_id INTEGER".into());
    cols.push("__depth INTEGER".into());
    cols.push("__has_children INTEGER".into());
    for i in 0..agg_count {
        cols.push(format!("__agg_{i}"));
    }
    for hidden in HIDDEN_COLUMNS {
        cols.push(format!("\"{hidden}\" HIDDEN"));
    }
    format!("CREATE TABLE x({})", cols.join(", "))
}

fn parse_create_args(args: &[&[u8]]) -> rusqlite::Result<(String, Vec<String>, Vec<String>)> {
    if args.len() < 5 {
        return Err(rusqlite::Error::ModuleError(
            "__intrinsic_pivot requires (source, hierarchy_cols, aggregations)".into(),
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

// SAFETY: `connect`'s schema matches the columns `column` serves exactly,
// and `best_index` only omits constraints `filter` actually consumes.
#[allow(unsafe_code)]
unsafe impl<'vtab> VTab<'vtab> for PivotVTab {
    type Aux = PivotAux;
    type Cursor = PivotCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let aux = aux.ok_or_else(|| rusqlite::Error::ModuleError("missing pivot aux data".into()))?;
        let (source, hierarchy_cols, aggregate_exprs) = parse_create_args(args)?;
        let agg_count = aggregate_exprs.len();
        let tree = PivotTree::build(
            &aux.sql,
            aux.pool.get_mut(),
            &source,
            &hierarchy_cols,
            &aggregate_exprs,
            aux.max_aggregates,
        )
        .map_err(|e| rusqlite::Error::ModuleError(e.to_string()))?;
        let schema = pivot_schema(&hierarchy_cols, agg_count);
        Ok((
            schema,
            PivotVTab {
                tree: Arc::new(SyncCell::new(tree)),
                pool: Arc::clone(&aux.pool),
                hierarchy_cols,
                agg_count,
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let hidden_start = self.hierarchy_cols.len() + 4 + self.agg_count;
        let idx_str = encode_constraints(info, hidden_start, HIDDEN_COLUMNS.len());
        info.set_idx_str(&idx_str);
        info.set_estimated_cost(1000.0);
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<Self::Cursor> {
        Ok(PivotCursor {
            tree: Arc::clone(&self.tree),
            pool: Arc::clone(&self.pool),
            hierarchy_cols: self.hierarchy_cols.clone(),
            agg_count: self.agg_count,
            rows: Vec::new(),
            row: 0,
            phantom: std::marker::PhantomData,
        })
    }
}

impl<'vtab> CreateVTab<'vtab> for PivotVTab {
    const KIND: VTabKind = VTabKind::Default;
}

pub struct PivotCursor<'vtab> {
    tree: Arc<SyncCell<PivotTree>>,
    pool: Arc<SyncCell<StringPool>>,
    hierarchy_cols: Vec<String>,
    agg_count: usize,
    rows: Vec<PivotRow>,
    row: usize,
    phantom: std::marker::PhantomData<&'vtab PivotVTab>,
}

impl std::fmt::Debug for PivotCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PivotCursor").field("row", &self.row).finish()
    }
}

fn vtab_err(e: TraceDbError) -> rusqlite::Error {
    rusqlite::Error::ModuleError(e.to_string())
}

#[allow(unsafe_code)]
unsafe impl VTabCursor for PivotCursor<'_> {
    fn filter(&mut self, _idx_num: c_int, idx_str: Option<&str>, args: &Values<'_>) -> rusqlite::Result<()> {
        let idx_str = idx_str.unwrap_or("");
        let slots = decode_idx_str(idx_str, HIDDEN_COLUMNS.len());

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

        let sort_str = read_str(slots[0])?.unwrap_or_default();
        let expanded_ids = read_str(slots[1])?;
        let collapsed_ids = read_str(slots[2])?;
        let offset = read_int(slots[3])?.map(|v| v as usize);
        let limit = read_int(slots[4])?.map(|v| v as usize);

        let sort = SortSpec::parse(&sort_str).map_err(vtab_err)?;
        let expansion = ExpansionSpec::from_constraints(expanded_ids.as_deref(), collapsed_ids.as_deref());

        let tree = self.tree.get_mut();
        let nodes = tree.flatten(&sort_str, &sort, &expansion, offset, limit);
        self.rows = nodes.into_iter().map(PivotRow::from).collect();
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
        let d = self.hierarchy_cols.len();
        let row = &self.rows[self.row];
        let i = i as usize;
        if i < d {
            return set_pivot_cell(ctx, &row.hierarchy_values[i]);
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
        if i == d + 3 {
            return ctx.set_result(&(row.has_children as i64));
        }
        if i < d + 4 + self.agg_count {
            return set_pivot_cell(ctx, &row.aggregates[i - d - 4]);
        }
        ctx.set_result(&rusqlite::types::Null)
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.row as i64)
    }
}

/// Pivot cells are already rendered display strings (§4.8); unlike rollup,
/// no pool round-trip is needed to produce the SQLite result.
fn set_pivot_cell(ctx: &mut Context, cell: &Option<String>) -> rusqlite::Result<()> {
    match cell {
        None => ctx.set_result(&rusqlite::types::Null),
        Some(s) => ctx.set_result(s),
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
    fn grand_total_matches_full_aggregate_as_string() {
        let (sql, mut pool) = setup();
        let tree = PivotTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        assert_eq!(tree.nodes[0].aggregates[0].as_deref(), Some("6"));
    }

    #[test]
    fn has_children_reflects_child_count() {
        let (sql, mut pool) = setup();
        let tree = PivotTree::build(&sql, &mut pool, "src", &["a".into()], &["SUM(v)".into()], 32).unwrap();
        assert!(tree.nodes[0].has_children());
        for node in &tree.nodes {
            if node.depth == 1 {
                assert!(!node.has_children() || node.children.len() > 0);
            }
        }
    }

    #[test]
    fn empty_source_yields_root_only() {
        let sql = SqlEngine::open_in_memory().unwrap();
        sql.execute_batch("CREATE TABLE empty_src(a TEXT, v INT)").unwrap();
        let mut pool = StringPool::new();
        let tree = PivotTree::build(&sql, &mut pool, "empty_src", &["a".into()], &["COUNT(*)".into()], 32).unwrap();
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn resort_is_skipped_when_spec_unchanged() {
        let (sql, mut pool) = setup();
        let mut tree = PivotTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        let sort = SortSpec::parse("__agg_0 DESC").unwrap();
        let expansion = ExpansionSpec::ExpandAll;
        let first = tree.flatten("__agg_0 DESC", &sort, &expansion, None, None);
        assert!(!first.is_empty());
        assert_eq!(tree.last_sort.as_deref(), Some("__agg_0 DESC"));
        // Second call with the same spec string must reuse cached ordering.
        let second = tree.flatten("__agg_0 DESC", &sort, &expansion, None, None);
        assert_eq!(second.len(), first.len());
    }

    #[test]
    fn group_level_sort_only_reverses_the_named_level() {
        let (sql, mut pool) = setup();
        let mut tree =
            PivotTree::build(&sql, &mut pool, "src", &["a".into(), "g".into()], &["SUM(v)".into()], 32).unwrap();
        let sort = SortSpec::parse("__group_0 DESC").unwrap();
        let expansion = ExpansionSpec::ExpandAll;
        let rows = tree.flatten("__group_0 DESC", &sort, &expansion, None, None);
        let depth1: Vec<&PivotNode> = rows.iter().filter(|n| n.depth == 1).copied().collect();
        // 'y' sorts after 'x' alphabetically ascending, so DESC at level 0
        // puts 'y' first.
        assert_eq!(depth1[0].hierarchy_values[0].as_deref(), Some("y"));
    }
}
