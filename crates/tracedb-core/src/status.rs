//! Unified error model shared by every layer of the query engine.
//!
//! Mirrors the "Status" pattern used throughout the engine: operations return
//! `Result<T, TraceDbError>`, and a handful of variants carry a traceback flag
//! so that a message is never prefixed with a source location twice as it
//! propagates up through nested `Include` frames.

use std::fmt;
use thiserror::Error;

/// The unified result type returned by every fallible operation in the core
/// and the SQL engine built on top of it.
pub type Result<T> = std::result::Result<T, TraceDbError>;

/// Error kinds produced by the column store, string pool, and (via
/// `tracedb-sql`) the SQL engine itself.
#[derive(Error, Debug)]
pub enum TraceDbError {
    #[error("parse error: {message}")]
    ParseError { message: String },

    #[error("macro error: {message}")]
    MacroError { message: String },

    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    #[error("type coercion error: {message}")]
    TypeCoercion { message: String },

    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("unknown module: {key}")]
    UnknownModule { key: String },

    #[error("unknown index: {name}")]
    UnknownIndex { name: String },

    #[error("duplicate definition: {message}")]
    DuplicateDefinition { message: String },

    #[error("bad argument: {message}")]
    BadArgument { message: String },

    #[error("engine error: {message}")]
    EngineError { message: String },

    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl Clone for TraceDbError {
    fn clone(&self) -> Self {
        match self {
            Self::ParseError { message } => Self::ParseError {
                message: message.clone(),
            },
            Self::MacroError { message } => Self::MacroError {
                message: message.clone(),
            },
            Self::SchemaMismatch { message } => Self::SchemaMismatch {
                message: message.clone(),
            },
            Self::TypeCoercion { message } => Self::TypeCoercion {
                message: message.clone(),
            },
            Self::UnknownFunction { name } => Self::UnknownFunction { name: name.clone() },
            Self::UnknownModule { key } => Self::UnknownModule { key: key.clone() },
            Self::UnknownIndex { name } => Self::UnknownIndex { name: name.clone() },
            Self::DuplicateDefinition { message } => Self::DuplicateDefinition {
                message: message.clone(),
            },
            Self::BadArgument { message } => Self::BadArgument {
                message: message.clone(),
            },
            Self::EngineError { message } => Self::EngineError {
                message: message.clone(),
            },
            Self::Fatal { message } => Self::Fatal {
                message: message.clone(),
            },
        }
    }
}

impl TraceDbError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
        }
    }

    pub fn type_coercion(message: impl Into<String>) -> Self {
        Self::TypeCoercion {
            message: message.into(),
        }
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::BadArgument {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::EngineError {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Prepends a traceback prefix unless this error already carries one.
    /// `Include` frames call this exactly once as the error unwinds past
    /// them, so a deeply nested failure is not re-prefixed at every level.
    pub fn with_traceback(self, prefix: &str) -> Traced {
        Traced {
            error: self,
            has_traceback: false,
        }
        .prefix(prefix)
    }
}

/// Wraps a [`TraceDbError`] with the "already has a traceback" bit the spec
/// calls out as a reserved payload key, so repeated `Include` unwinding does
/// not stack the same location prefix over and over.
#[derive(Debug, Clone)]
pub struct Traced {
    pub error: TraceDbError,
    pub has_traceback: bool,
}

impl Traced {
    pub fn new(error: TraceDbError) -> Self {
        Self {
            error,
            has_traceback: false,
        }
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        if self.has_traceback {
            return self;
        }
        self.error = match self.error {
            TraceDbError::ParseError { message } => TraceDbError::ParseError {
                message: format!("{prefix}: {message}"),
            },
            other => {
                let msg = other.to_string();
                TraceDbError::EngineError {
                    message: format!("{prefix}: {msg}"),
                }
            }
        };
        self.has_traceback = true;
        self
    }
}

impl fmt::Display for Traced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Helper trait mirroring the `WithContext` convenience used across the SQL
/// layer: lets call sites attach an operation name without hand-writing a
/// `map_err` at every call site.
pub trait WithOperation<T> {
    fn with_operation(self, operation: &str) -> Result<T>;
}

impl<T, E> WithOperation<T> for std::result::Result<T, E>
where
    E: Into<TraceDbError>,
{
    fn with_operation(self, operation: &str) -> Result<T> {
        self.map_err(|e| {
            let error = e.into();
            match error {
                TraceDbError::ParseError { message } => TraceDbError::ParseError {
                    message: format!("{message} (during {operation})"),
                },
                TraceDbError::EngineError { message } => TraceDbError::EngineError {
                    message: format!("{message} (during {operation})"),
                },
                other => other,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_prefixed_exactly_once() {
        let err = TraceDbError::parse("unexpected token");
        let traced = err.with_traceback("module foo.bar");
        assert!(traced.has_traceback);
        let re_prefixed = traced.prefix("module baz");
        assert_eq!(re_prefixed.to_string(), "module foo.bar: unexpected token");
    }

    #[test]
    fn with_operation_annotates_message() {
        let result: std::result::Result<(), TraceDbError> =
            Err(TraceDbError::parse("bad token"));
        let annotated = result.with_operation("macro expansion");
        match annotated {
            Err(TraceDbError::ParseError { message }) => {
                assert!(message.contains("during macro expansion"));
            }
            _ => panic!("expected ParseError"),
        }
    }
}
