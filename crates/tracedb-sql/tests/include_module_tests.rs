//! Integration tests for `INCLUDE PERFETTO MODULE` wildcard resolution.

use std::collections::HashMap;
use tracedb_sql::config::EngineConfig;
use tracedb_sql::engine::PerfettoSqlEngine;

#[test]
fn wildcard_include_runs_modules_in_ascending_key_order() {
    let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
    engine
        .execute("CREATE PERFETTO TABLE log(v LONG) AS SELECT 0 AS v WHERE 0;")
        .unwrap();

    let mut modules = HashMap::new();
    modules.insert("seq.a".to_string(), "INSERT INTO log VALUES (1);".to_string());
    modules.insert("seq.b".to_string(), "INSERT INTO log VALUES (2);".to_string());
    modules.insert("seq.c".to_string(), "INSERT INTO log VALUES (3);".to_string());
    engine.module_registry_mut().register_package("seq", modules);

    engine.execute("INCLUDE PERFETTO MODULE seq.*;").unwrap();

    let (stmt, _) = engine
        .execute_until_last_statement("SELECT v FROM log ORDER BY rowid;")
        .unwrap();
    let mut stmt = stmt.unwrap();
    let values: Vec<i64> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn failure_inside_a_nested_include_is_prefixed_with_its_module_key() {
    let mut engine = PerfettoSqlEngine::new(EngineConfig::default()).unwrap();
    let mut outer = HashMap::new();
    outer.insert(
        "outer.entry".to_string(),
        "INCLUDE PERFETTO MODULE inner.broken;".to_string(),
    );
    engine.module_registry_mut().register_package("outer", outer);
    let mut inner = HashMap::new();
    inner.insert(
        "inner.broken".to_string(),
        "INSERT INTO table_that_does_not_exist VALUES (1);".to_string(),
    );
    engine.module_registry_mut().register_package("inner", inner);

    let err = engine
        .execute("INCLUDE PERFETTO MODULE outer.entry;")
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("while including module 'inner.broken'"));
    assert!(message.contains("table_that_does_not_exist"));
}
