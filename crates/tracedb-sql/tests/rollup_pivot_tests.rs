//! Integration tests for the rollup/pivot hierarchical-aggregation operators,
//! driven end to end through `PerfettoSqlEngine` rather than `rollup`/`pivot`
//! directly.

use tracedb_core::value::Value;
use tracedb_sql::config::EngineConfig;
use tracedb_sql::engine::PerfettoSqlEngine;

fn engine_with_two_level_source() -> PerfettoSqlEngine {
    let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
    engine
        .execute(
            "CREATE PERFETTO TABLE spans AS \
             SELECT 'gfx' AS thread, 'draw' AS slice, 10 AS dur \
             UNION ALL SELECT 'gfx', 'draw', 20 \
             UNION ALL SELECT 'gfx', 'swap', 5 \
             UNION ALL SELECT 'ui', 'layout', 7;",
        )
        .unwrap();
    engine
}

#[test]
fn rollup_root_aggregates_the_whole_source() {
    let mut engine = engine_with_two_level_source();
    let rows = engine
        .rollup_query(
            "spans",
            &["thread".to_string(), "slice".to_string()],
            &["SUM(dur)".to_string()],
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();
    let root = rows.iter().find(|r| r.depth == 0).unwrap();
    assert_eq!(root.aggregates[0], Value::Integer(42));
    // Two distinct threads, three distinct (thread, slice) pairs, plus root.
    assert_eq!(rows.len(), 1 + 2 + 3);
}

#[test]
fn rollup_collapsed_id_hides_its_descendants() {
    let mut engine = engine_with_two_level_source();
    // No expand/collapse constraints at all defaults to expand-all (§4.8).
    let expanded_all = engine
        .rollup_query(
            "spans",
            &["thread".to_string(), "slice".to_string()],
            &["SUM(dur)".to_string()],
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();
    let gfx_id = expanded_all
        .iter()
        .find(|r| r.depth == 1 && r.hierarchy_values[0].to_display_string(engine.string_pool()) == "gfx")
        .unwrap()
        .id;
    assert!(expanded_all.iter().any(|r| r.parent_id == Some(gfx_id)));

    // Collapsing `gfx` specifically should hide only its own descendants;
    // the denylist wins even though no allowlist was requested either.
    let collapsed = engine
        .rollup_query(
            "spans",
            &["thread".to_string(), "slice".to_string()],
            &["SUM(dur)".to_string()],
            None,
            None,
            Some(&gfx_id.to_string()),
            None,
            None,
            None,
            None,
        )
        .unwrap();
    assert!(collapsed.iter().any(|r| r.id == gfx_id));
    assert!(collapsed.iter().all(|r| r.parent_id != Some(gfx_id)));
}

#[test]
fn rollup_group_level_sort_only_reverses_its_own_level() {
    let mut engine = engine_with_two_level_source();
    let rows = engine
        .rollup_query(
            "spans",
            &["thread".to_string(), "slice".to_string()],
            &["SUM(dur)".to_string()],
            Some("__group_0 DESC"),
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();
    let depth1: Vec<_> = rows.iter().filter(|r| r.depth == 1).collect();
    // 'ui' sorts after 'gfx' alphabetically ascending, so DESC at level 0
    // puts 'ui' first even though level 1 (slice) still sorts ascending.
    assert_eq!(depth1[0].hierarchy_values[0].to_display_string(engine.string_pool()), "ui");
}

#[test]
fn pivot_query_coerces_every_cell_to_a_string() {
    let mut engine = engine_with_two_level_source();
    let rows = engine
        .pivot_query(
            "spans",
            &["thread".to_string()],
            &["SUM(dur)".to_string(), "COUNT(*)".to_string()],
            "",
            None,
            None,
            None,
            None,
        )
        .unwrap();
    assert!(!rows.is_empty());
    for row in &rows {
        for cell in row.aggregates.iter().flatten() {
            assert!(cell.parse::<f64>().is_ok() || cell.is_empty());
        }
    }
}
