//! String pool and runtime-typed column table used by the query engine.
//!
//! This crate has no SQL awareness: it is a standalone columnar value store
//! with late type promotion (see [`runtime_table`]) and a process-wide
//! string interning pool (see [`string_pool`]). The SQL engine in
//! `tracedb-sql` builds its materialized tables and table-valued function
//! results on top of these primitives.
#![allow(clippy::module_name_repetitions)]

pub mod runtime_table;
pub mod status;
pub mod string_pool;
pub mod value;

pub use status::{Result, TraceDbError};
pub use string_pool::{StringId, StringPool};
pub use value::Value;
