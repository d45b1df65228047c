/// Error Types for the Pivot Engine and Its Collaborators
///
/// Stage failures inside the engine are carried as values (see
/// [`crate::query::Stage`]); these enums cover the fallible edges: parsing
/// filters, loading datasets and settings, and executing aggregation queries.

use thiserror::Error;

/// Errors raised while parsing a textual filter expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Unexpected character: {0}")]
    UnexpectedChar(char),

    #[error("Unterminated string")]
    UnterminatedString,

    #[error("Expected {expected}, got {found}")]
    Expected { expected: String, found: String },

    #[error("Unexpected token after expression: {0}")]
    TrailingInput(String),
}

/// Errors returned by an aggregation service.
///
/// Cloneable so a failed query can be reported by every stage that reads it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Unknown measure: {0}")]
    UnknownMeasure(String),

    #[error("Unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("Unknown column in filter: {0}")]
    UnknownColumn(String),

    #[error("Aggregation backend error: {0}")]
    Backend(String),
}

/// Crate-level errors for configuration and data loading.
#[derive(Error, Debug)]
pub enum PivotError {
    #[error("Invalid dataset: {0}")]
    Dataset(String),

    #[error("Invalid setting {name}: {message}")]
    Setting { name: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Filter error: {0}")]
    Filter(#[from] ExprError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, PivotError>;
