//! Extended-SQL parser and PerfettoSQL-style execution engine layered on top
//! of an embedded relational engine (`rusqlite`/SQLite).
//!
//! This crate owns everything above the columnar value store in
//! `tracedb-core`: the dialect extensions (`CREATE PERFETTO TABLE/VIEW/
//! FUNCTION/MACRO/INDEX`, `INCLUDE PERFETTO MODULE`), the frame-stack
//! execution loop that drives them, runtime table-valued functions, and the
//! rollup/pivot hierarchical-aggregation operators.
//!
//! Scalar and table-valued `CREATE PERFETTO FUNCTION`s and the rollup/pivot
//! operators are all registered as real SQLite callbacks — a scalar UDF via
//! `rusqlite::functions`, table-valued functions and the rollup/pivot trees
//! as `rusqlite::vtab` modules — so every one of them is reachable from
//! arbitrary nested SQL (`FROM fn(...)`, `WHERE __sort = ...`), not just from
//! the direct Rust entry points each module also exposes. `rusqlite::vtab`'s
//! `VTab`/`VTabCursor` traits are `unsafe trait`s (they uphold SQLite's
//! virtual-table ABI contract), so this crate's lint policy narrows
//! `unsafe_code` from `forbid` to `deny` and each implementing file carries a
//! local `#[allow(unsafe_code)]` on just those impl blocks. See `DESIGN.md`
//! for the full rationale.
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod engine_wrapper;
pub mod intrinsics;
pub mod modules;
pub mod parser;
pub mod pivot;
pub mod rollup;
pub mod schema;
pub mod sync_cell;
pub mod table_function;
pub mod vtab_support;

pub use config::EngineConfig;
pub use engine::{ExecutionStats, PerfettoSqlEngine};
pub use tracedb_core::status::{Result, TraceDbError};
