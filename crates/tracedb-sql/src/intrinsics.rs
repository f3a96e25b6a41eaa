//! Miscellaneous intrinsic operators (component C9): `interval_intersect`,
//! `graph_scan`/`graph_aggregating_scan`, `counter_intervals`, `struct`, and
//! `metadata_get*`. The source engine exposes these as SQLite table-valued
//! functions or scalar functions; the distilled spec documents them only at
//! the interface level ("consumed but described only at interface level"),
//! so they are implemented here as plain, directly testable Rust functions
//! rather than wired into the SQL surface — consistent with the rest of
//! this crate's vtab-avoidance stance (see `DESIGN.md`).

use std::collections::{HashMap, HashSet, VecDeque};
use tracedb_core::runtime_table::{RuntimeTableBuilder, Table};
use tracedb_core::status::{Result, TraceDbError};
use tracedb_core::string_pool::StringPool;
use tracedb_core::value::Value;

/// A single partitioned interval, as consumed by [`interval_intersect`]: a
/// start timestamp, a duration, and an opaque per-table row id.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    pub ts: i64,
    pub dur: i64,
    pub id: i64,
}

/// Multi-way intersection of two or more partitioned interval sets,
/// returning a runtime column table with columns `ts, dur, id_0, …,
/// id_{n-1}`. An empty input (zero tables, or any table with zero rows)
/// collapses the result to zero rows, matching §4.9.
pub fn interval_intersect(tables: &[Vec<Interval>]) -> Result<Table> {
    let mut col_names = vec!["ts".to_string(), "dur".to_string()];
    for i in 0..tables.len() {
        col_names.push(format!("id_{i}"));
    }
    let mut builder = RuntimeTableBuilder::new(col_names);
    if tables.is_empty() || tables.iter().any(|t| t.is_empty()) {
        return Ok(builder.finalize(0));
    }

    let mut sorted: Vec<Vec<Interval>> = tables.to_vec();
    for t in &mut sorted {
        t.sort_by_key(|iv| iv.ts);
    }

    let mut row_count = 0u32;
    // Naive sweep: for every interval of the first table, intersect against
    // every interval of every other table, keeping only the overlap.
    let mut frontier: Vec<(i64, i64, Vec<i64>)> = sorted[0]
        .iter()
        .map(|iv| (iv.ts, iv.ts + iv.dur, vec![iv.id]))
        .collect();
    for table in &sorted[1..] {
        let mut next_frontier = Vec::new();
        for (start, end, ids) in &frontier {
            for iv in table {
                let iv_start = iv.ts;
                let iv_end = iv.ts + iv.dur;
                let overlap_start = (*start).max(iv_start);
                let overlap_end = (*end).min(iv_end);
                if overlap_start < overlap_end {
                    let mut new_ids = ids.clone();
                    new_ids.push(iv.id);
                    next_frontier.push((overlap_start, overlap_end, new_ids));
                }
            }
        }
        frontier = next_frontier;
    }

    for (start, end, ids) in frontier {
        builder.append_int(0, start)?;
        builder.append_int(1, end - start)?;
        for (i, id) in ids.into_iter().enumerate() {
            builder.append_int(2 + i, id)?;
        }
        row_count += 1;
    }
    Ok(builder.finalize(row_count))
}

/// An adjacency-list graph edge: `source -> target`.
#[derive(Debug, Clone, Copy)]
pub struct GraphEdge {
    pub source: i64,
    pub target: i64,
}

/// A single fixpoint step function for [`graph_scan`]: given a node id and
/// its current row (the seed row for init nodes, or the most recently
/// produced row for a propagated node), returns zero or more successor rows
/// keyed by the target node.
pub type StepFn<'a> = dyn Fn(i64, &[Value]) -> Vec<Value> + 'a;

/// Fixpoint scan over a DAG: starting from `init` (node id, seed row)
/// pairs, repeatedly applies `step` along `graph`'s edges until no new rows
/// are produced for any node, matching §4.9's "repeats until no new rows"
/// description. `columns` names the row shape `step` must return.
pub fn graph_scan(
    graph: &[GraphEdge],
    init: &[(i64, Vec<Value>)],
    step: &StepFn<'_>,
    columns: &[String],
) -> Result<Table> {
    let mut col_names = vec!["node_id".to_string()];
    col_names.extend(columns.iter().cloned());
    let mut builder = RuntimeTableBuilder::new(col_names);

    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    for edge in graph {
        adjacency.entry(edge.source).or_default().push(edge.target);
    }

    let mut rows: HashMap<i64, Vec<Value>> = HashMap::new();
    let mut queue: VecDeque<i64> = VecDeque::new();
    for (node, seed) in init {
        rows.insert(*node, seed.clone());
        queue.push_back(*node);
    }

    while let Some(node) = queue.pop_front() {
        let current = rows.get(&node).cloned().unwrap_or_default();
        let Some(targets) = adjacency.get(&node) else {
            continue;
        };
        for &target in targets {
            let produced = step(target, &current);
            if produced.is_empty() {
                continue;
            }
            let changed = rows.get(&target) != Some(&produced);
            if changed {
                rows.insert(target, produced);
                queue.push_back(target);
            }
        }
    }

    let mut row_count = 0u32;
    let mut node_ids: Vec<i64> = rows.keys().copied().collect();
    node_ids.sort_unstable();
    for node in node_ids {
        let row = &rows[&node];
        builder.append_int(0, node)?;
        if row.len() != columns.len() {
            return Err(TraceDbError::schema_mismatch(format!(
                "graph_scan step produced {} values but {} columns were declared",
                row.len(),
                columns.len()
            )));
        }
        for (i, value) in row.iter().enumerate() {
            append_value(&mut builder, 1 + i, value)?;
        }
        row_count += 1;
    }
    Ok(builder.finalize(row_count))
}

/// Topologically orders `graph` by depth (roots first) and evaluates
/// `reduce` from deepest to shallowest, folding each node's children's
/// already-reduced values into its own, matching §4.9's "graph-aggregating"
/// description.
pub fn graph_aggregating_scan(
    graph: &[GraphEdge],
    init: &[(i64, Value)],
    reduce: &dyn Fn(i64, Value, &[Value]) -> Value,
) -> Result<Table> {
    let mut builder = RuntimeTableBuilder::new(vec!["node_id".to_string(), "value".to_string()]);

    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut all_nodes: HashSet<i64> = HashSet::new();
    for edge in graph {
        children.entry(edge.source).or_default().push(edge.target);
        all_nodes.insert(edge.source);
        all_nodes.insert(edge.target);
    }
    let mut values: HashMap<i64, Value> = HashMap::new();
    for (node, seed) in init {
        values.insert(*node, seed.clone());
        all_nodes.insert(*node);
    }

    let depth = compute_depths(&children, &all_nodes);
    let mut ordered: Vec<i64> = all_nodes.into_iter().collect();
    ordered.sort_by_key(|n| std::cmp::Reverse(depth.get(n).copied().unwrap_or(0)));

    for node in &ordered {
        let own = values.get(node).cloned().unwrap_or(Value::Null);
        let child_values: Vec<Value> = children
            .get(node)
            .map(|kids| kids.iter().filter_map(|k| values.get(k).cloned()).collect())
            .unwrap_or_default();
        let reduced = reduce(*node, own, &child_values);
        values.insert(*node, reduced);
    }

    let mut row_count = 0u32;
    ordered.sort_unstable();
    for node in ordered {
        builder.append_int(0, node)?;
        append_value(&mut builder, 1, &values[&node])?;
        row_count += 1;
    }
    Ok(builder.finalize(row_count))
}

fn compute_depths(children: &HashMap<i64, Vec<i64>>, nodes: &HashSet<i64>) -> HashMap<i64, u32> {
    let mut parents: HashMap<i64, Vec<i64>> = HashMap::new();
    for (&source, targets) in children {
        for &target in targets {
            parents.entry(target).or_default().push(source);
        }
    }
    let roots: Vec<i64> = nodes.iter().copied().filter(|n| !parents.contains_key(n)).collect();
    let mut depth: HashMap<i64, u32> = HashMap::new();
    let mut queue: VecDeque<i64> = VecDeque::new();
    for root in roots {
        depth.insert(root, 0);
        queue.push_back(root);
    }
    while let Some(node) = queue.pop_front() {
        let d = depth[&node];
        if let Some(kids) = children.get(&node) {
            for &kid in kids {
                if depth.get(&kid).is_none_or(|existing| *existing < d + 1) {
                    depth.insert(kid, d + 1);
                    queue.push_back(kid);
                }
            }
        }
    }
    depth
}

/// Direction a [`counter_intervals`] track is read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDirection {
    Forward,
    Reverse,
}

/// A single `(ts, track_id, value)` sample from a counter track.
#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    pub ts: i64,
    pub track_id: i64,
    pub value: f64,
}

/// Converts a sequence of instantaneous counter samples (partitioned by
/// `track_id`, already in `direction` order within each partition) into
/// typed intervals with columns `ts, dur, track_id, value, next_value,
/// delta_value`, where `dur` runs until the next sample on the same track
/// (or `trace_end` for the last one), matching §4.9.
pub fn counter_intervals(direction: CounterDirection, trace_end: i64, samples: &[CounterSample]) -> Result<Table> {
    let mut builder = RuntimeTableBuilder::new(vec![
        "ts".into(),
        "dur".into(),
        "track_id".into(),
        "value".into(),
        "next_value".into(),
        "delta_value".into(),
    ]);
    let mut by_track: HashMap<i64, Vec<CounterSample>> = HashMap::new();
    for sample in samples {
        by_track.entry(sample.track_id).or_default().push(*sample);
    }
    let mut tracks: Vec<i64> = by_track.keys().copied().collect();
    tracks.sort_unstable();

    let mut row_count = 0u32;
    for track_id in tracks {
        let mut track_samples = by_track.remove(&track_id).unwrap();
        track_samples.sort_by_key(|s| s.ts);
        if direction == CounterDirection::Reverse {
            track_samples.reverse();
        }
        for i in 0..track_samples.len() {
            let current = track_samples[i];
            let next = track_samples.get(i + 1);
            let dur = match next {
                Some(n) => (n.ts - current.ts).max(0),
                None => (trace_end - current.ts).max(0),
            };
            let next_value = next.map(|n| n.value);
            let delta = next_value.map(|v| v - current.value).unwrap_or(0.0);
            builder.append_int(0, current.ts)?;
            builder.append_int(1, dur)?;
            builder.append_int(2, track_id)?;
            builder.append_float(3, current.value)?;
            match next_value {
                Some(v) => builder.append_float(4, v)?,
                None => builder.append_null(4)?,
            }
            builder.append_float(5, delta)?;
            row_count += 1;
        }
    }
    Ok(builder.finalize(row_count))
}

/// An opaque struct value of up to a fixed number of key/value fields.
/// Keys must be text (enforced at construction); values are arbitrary
/// [`Value`]s, matching §4.9's "opaque struct" description.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    fields: Vec<(String, Value)>,
}

/// Largest number of fields a [`StructValue`] may carry, matching the
/// fixed-size bound §4.9 calls out.
pub const MAX_STRUCT_FIELDS: usize = 32;

impl StructValue {
    /// Builds a struct from alternating `(key, value)` pairs, e.g.
    /// `struct(k1, v1, k2, v2, …)`. `pool` resolves any `Value::Text` key to
    /// check it is non-empty.
    pub fn new(pairs: &[(Value, Value)], pool: &StringPool) -> Result<Self> {
        if pairs.len() > MAX_STRUCT_FIELDS {
            return Err(TraceDbError::bad_argument(format!(
                "struct() accepts at most {MAX_STRUCT_FIELDS} fields, got {}",
                pairs.len()
            )));
        }
        let mut fields = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let Value::Text(id) = key else {
                return Err(TraceDbError::bad_argument("struct() keys must be text"));
            };
            fields.push((pool.resolve(*id).to_string(), *value));
        }
        Ok(StructValue { fields })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single row of the external trace-metadata table `metadata_get*`
/// disambiguates over.
#[derive(Debug, Clone, Copy)]
pub struct MetadataRow {
    pub machine_id: Option<i64>,
    pub trace_id: Option<i64>,
    pub value: Value,
}

/// Looks up a metadata value, disambiguating across rows that match the
/// given `(machine_id, trace_id)` by preferring the row with the smallest
/// non-null `machine_id`, then the smallest non-null `trace_id`, matching
/// §4.9's "prefer smallest non-null" rule.
pub fn metadata_get(rows: &[MetadataRow], machine_id: Option<i64>, trace_id: Option<i64>) -> Option<Value> {
    rows.iter()
        .filter(|r| machine_id.is_none() || r.machine_id == machine_id)
        .filter(|r| trace_id.is_none() || r.trace_id == trace_id)
        .min_by_key(|r| (r.machine_id.unwrap_or(i64::MAX), r.trace_id.unwrap_or(i64::MAX)))
        .map(|r| r.value)
}

fn append_value(builder: &mut RuntimeTableBuilder, idx: usize, value: &Value) -> Result<()> {
    match value {
        Value::Null => builder.append_null(idx),
        Value::Integer(i) => builder.append_int(idx, *i),
        Value::Float(f) => builder.append_float(idx, *f),
        Value::Text(_) => Err(TraceDbError::bad_argument(
            "intrinsic graph operators do not support text-valued rows",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_intersect_of_two_overlapping_tables() {
        let a = vec![Interval { ts: 0, dur: 10, id: 1 }];
        let b = vec![Interval { ts: 5, dur: 10, id: 2 }];
        let table = interval_intersect(&[a, b]).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.value(0, 0), Value::Integer(5));
        assert_eq!(table.value(1, 0), Value::Integer(5));
    }

    #[test]
    fn interval_intersect_with_empty_table_yields_zero_rows() {
        let a = vec![Interval { ts: 0, dur: 10, id: 1 }];
        let b: Vec<Interval> = vec![];
        let table = interval_intersect(&[a, b]).unwrap();
        assert_eq!(table.row_count(), 0);
    }

    #[test]
    fn graph_scan_propagates_until_fixpoint() {
        let graph = vec![
            GraphEdge { source: 1, target: 2 },
            GraphEdge { source: 2, target: 3 },
        ];
        let init = vec![(1, vec![Value::Integer(10)])];
        let step = move |_target: i64, row: &[Value]| -> Vec<Value> {
            match row.first() {
                Some(Value::Integer(n)) => vec![Value::Integer(n + 1)],
                _ => vec![],
            }
        };
        let table = graph_scan(&graph, &init, &step, &["val".to_string()]).unwrap();
        assert_eq!(table.row_count(), 3);
        let idx = table.column_index("val").unwrap();
        assert_eq!(table.value(idx, 0), Value::Integer(10));
        assert_eq!(table.value(idx, 2), Value::Integer(12));
    }

    #[test]
    fn graph_aggregating_scan_folds_leaves_into_roots() {
        let graph = vec![
            GraphEdge { source: 1, target: 2 },
            GraphEdge { source: 1, target: 3 },
        ];
        let init = vec![
            (2, Value::Integer(5)),
            (3, Value::Integer(7)),
        ];
        let reduce = |_node: i64, own: Value, children: &[Value]| -> Value {
            let own_n = if let Value::Integer(n) = own { n } else { 0 };
            let sum: i64 = children
                .iter()
                .map(|v| if let Value::Integer(n) = v { *n } else { 0 })
                .sum();
            Value::Integer(own_n + sum)
        };
        let table = graph_aggregating_scan(&graph, &init, &reduce).unwrap();
        let idx = table.column_index("node_id").unwrap();
        let val_idx = table.column_index("value").unwrap();
        let root_row = (0..table.row_count() as usize)
            .find(|&r| table.value(idx, r) == Value::Integer(1))
            .unwrap();
        assert_eq!(table.value(val_idx, root_row), Value::Integer(12));
    }

    #[test]
    fn counter_intervals_duration_runs_to_next_sample() {
        let samples = vec![
            CounterSample { ts: 0, track_id: 1, value: 1.0 },
            CounterSample { ts: 10, track_id: 1, value: 2.0 },
        ];
        let table = counter_intervals(CounterDirection::Forward, 20, &samples).unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.value(0, 0), Value::Integer(0));
        assert_eq!(table.value(1, 0), Value::Integer(10));
        assert_eq!(table.value(1, 1), Value::Integer(10));
    }

    #[test]
    fn struct_value_rejects_non_text_keys() {
        let pool = StringPool::new();
        let pairs = vec![(Value::Integer(1), Value::Integer(2))];
        let err = StructValue::new(&pairs, &pool).unwrap_err();
        assert!(matches!(err, TraceDbError::BadArgument { .. }));
    }

    #[test]
    fn struct_value_round_trips_fields() {
        let mut pool = StringPool::new();
        let key = Value::Text(pool.intern("k"));
        let pairs = vec![(key, Value::Integer(42))];
        let s = StructValue::new(&pairs, &pool).unwrap();
        assert_eq!(s.get("k"), Some(Value::Integer(42)));
        assert_eq!(s.get("missing"), None);
    }

    #[test]
    fn metadata_get_prefers_smallest_non_null_machine_id() {
        let rows = vec![
            MetadataRow { machine_id: Some(2), trace_id: None, value: Value::Integer(1) },
            MetadataRow { machine_id: Some(1), trace_id: None, value: Value::Integer(2) },
        ];
        assert_eq!(metadata_get(&rows, None, None), Some(Value::Integer(2)));
    }
}
