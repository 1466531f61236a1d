//! # Error Types
//!
//! Structured errors for the whole engine. Every failure carries a
//! [`StatusCode`] that drives programmatic handling, a human-readable
//! message, an optional source location (for syntax and build errors),
//! and an optional underlying cause (for wrapped virtual-table errors).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, QuereusError>;

/// Status codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// Success (never carried by an error; present for host FFI surfaces)
    Ok,
    /// Generic failure
    Error,
    /// Internal invariant breach; indicates a bug
    Internal,
    /// Unknown table, column, function, or module
    NotFound,
    /// A name resolved to more than one candidate
    Ambiguous,
    /// NOT NULL / CHECK / uniqueness violation
    Constraint,
    /// Type mismatch or failed conversion
    Mismatch,
    /// API misuse (bad parameter index, prepare of a multi-statement program)
    Misuse,
    /// Value out of range
    Range,
    /// Write attempted on a read-only table
    ReadOnly,
    /// Statement cancelled via the interrupt handle
    Cancelled,
    /// A captured schema object changed between emit and execute
    SchemaChanged,
    /// Recognized but unsupported construct
    Unsupported,
    /// Lexer/parser error
    Syntax,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Error => "ERROR",
            StatusCode::Internal => "INTERNAL",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::Ambiguous => "AMBIGUOUS",
            StatusCode::Constraint => "CONSTRAINT",
            StatusCode::Mismatch => "MISMATCH",
            StatusCode::Misuse => "MISUSE",
            StatusCode::Range => "RANGE",
            StatusCode::ReadOnly => "READONLY",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::SchemaChanged => "SCHEMA_CHANGED",
            StatusCode::Unsupported => "UNSUPPORTED",
            StatusCode::Syntax => "SYNTAX",
        };
        f.write_str(name)
    }
}

/// Source position of a syntax or build error (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// The engine's error type
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct QuereusError {
    /// Status code driving programmatic handling
    pub code: StatusCode,
    /// Human-readable description; includes the source location when known
    pub message: String,
    /// Underlying error (e.g. the original virtual-table failure)
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Original SQL location, when available
    pub location: Option<SourceLocation>,
}

impl QuereusError {
    /// Create an error with a code and message
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        QuereusError {
            code,
            message: message.into(),
            cause: None,
            location: None,
        }
    }

    /// Attach a source location; the rendered message gains a position suffix
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.message = format!("{} ({location})", self.message);
        self.location = Some(location);
        self
    }

    /// Attach an underlying cause
    pub fn caused_by(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Syntax error at a source position
    pub fn syntax(message: impl Into<String>, line: u32, column: u32) -> Self {
        QuereusError::new(StatusCode::Syntax, message).at(SourceLocation { line, column })
    }

    /// Internal invariant breach
    pub fn internal(message: impl Into<String>) -> Self {
        QuereusError::new(StatusCode::Internal, message)
    }

    /// Unknown table/column/function/module
    pub fn not_found(message: impl Into<String>) -> Self {
        QuereusError::new(StatusCode::NotFound, message)
    }

    /// Constraint violation
    pub fn constraint(message: impl Into<String>) -> Self {
        QuereusError::new(StatusCode::Constraint, message)
    }

    /// API misuse
    pub fn misuse(message: impl Into<String>) -> Self {
        QuereusError::new(StatusCode::Misuse, message)
    }

    /// Type mismatch or failed conversion
    pub fn mismatch(message: impl Into<String>) -> Self {
        QuereusError::new(StatusCode::Mismatch, message)
    }

    /// Recognized but unsupported construct
    pub fn unsupported(message: impl Into<String>) -> Self {
        QuereusError::new(StatusCode::Unsupported, message)
    }

    /// Wrap a virtual-table error with the offending table's name
    pub fn from_vtab(table: &str, cause: QuereusError) -> Self {
        QuereusError {
            code: cause.code,
            message: format!("table '{table}': {}", cause.message),
            cause: Some(Box::new(cause)),
            location: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = QuereusError::new(StatusCode::NotFound, "no such table: t");
        assert_eq!(err.to_string(), "NOT_FOUND: no such table: t");
    }

    #[test]
    fn test_syntax_error_carries_location() {
        let err = QuereusError::syntax("unexpected token", 3, 14);
        assert_eq!(err.code, StatusCode::Syntax);
        let loc = err.location.expect("location");
        assert_eq!(loc.line, 3);
        assert_eq!(loc.column, 14);
        assert!(err.to_string().contains("line 3, column 14"));
    }

    #[test]
    fn test_vtab_wrapping_preserves_code() {
        let inner = QuereusError::constraint("duplicate primary key");
        let wrapped = QuereusError::from_vtab("users", inner);
        assert_eq!(wrapped.code, StatusCode::Constraint);
        assert!(wrapped.message.contains("users"));
        assert!(std::error::Error::source(&wrapped).is_some());
    }
}
