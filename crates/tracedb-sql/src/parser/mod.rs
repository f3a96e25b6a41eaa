//! Extended-SQL parser and preprocessor (component C5).
//!
//! Splits an input SQL source into a lazy sequence of [`Statement`]s,
//! classifying each as either a native construct the engine must handle
//! itself (`CREATE PERFETTO ...`, `INCLUDE PERFETTO MODULE ...`, `DROP
//! PERFETTO INDEX ...`) or plain SQL to forward unchanged to the embedded
//! engine. Macro invocations (`name!(args)`) are expanded textually before a
//! statement is classified.

pub mod macros;
pub mod statement;

pub use macros::{find_matching_paren, is_ident_continue, is_ident_start, split_top_level, MacroArgKind, MacroDef, MacroTable};
pub use statement::{
    ArgumentDefinition, CreateFunctionStmt, CreateIndexStmt, CreateMacroStmt, CreateTableStmt,
    CreateViewStmt, DropIndexStmt, FunctionReturn, IncludeStmt, SqlParser, Statement,
};
