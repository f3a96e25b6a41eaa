//! Integration tests for `CREATE PERFETTO INDEX` / `DROP PERFETTO INDEX`.

use tracedb_core::status::TraceDbError;
use tracedb_sql::config::EngineConfig;
use tracedb_sql::engine::PerfettoSqlEngine;

#[test]
fn create_or_replace_index_drops_the_existing_one_first() {
    let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
    engine
        .execute("CREATE PERFETTO TABLE t AS SELECT 1 AS a, 2 AS b UNION ALL SELECT 3, 4;")
        .unwrap();
    engine
        .execute("CREATE PERFETTO INDEX idx ON t(a);")
        .unwrap();
    // Without the fix this duplicates the underlying SQLite index and fails
    // with a raw engine error instead of replacing it cleanly.
    engine
        .execute("CREATE OR REPLACE PERFETTO INDEX idx ON t(b);")
        .unwrap();
}

#[test]
fn create_index_on_missing_table_is_a_bad_argument_not_unknown_function() {
    let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
    let err = engine
        .execute("CREATE PERFETTO INDEX idx ON no_such_table(a);")
        .unwrap_err();
    assert!(matches!(err, TraceDbError::BadArgument { .. }));
    assert!(err.to_string().contains("no_such_table"));
}

#[test]
fn create_index_without_replace_on_duplicate_name_fails() {
    let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
    engine
        .execute("CREATE PERFETTO TABLE t AS SELECT 1 AS a;")
        .unwrap();
    engine
        .execute("CREATE PERFETTO INDEX idx ON t(a);")
        .unwrap();
    let err = engine
        .execute("CREATE PERFETTO INDEX idx ON t(a);")
        .unwrap_err();
    assert!(matches!(err, TraceDbError::DuplicateDefinition { .. }));
}
