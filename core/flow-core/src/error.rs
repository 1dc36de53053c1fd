//! Error types for flow-core operations.
//!
//! Validation failures carry an [`ErrorKind`] so callers can map them to a
//! stable wire code without string matching.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Validation Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a rejected mutation.
///
/// `Conflict` covers identity collisions (duplicate ids, filename collisions,
/// unknown activity references); everything else is `BadRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BadRequest,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crate Error
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A managed flow file could not be parsed or failed validation.
    /// The store is left on disk untouched for inspection.
    #[error("Invalid flow config: {}{}: {message}", path.display(), location(*line, *column))]
    InvalidConfig {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FlowError {
    /// Stable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Validation(err) => err.kind.as_str(),
            FlowError::InvalidConfig { .. } => "invalid_config",
            FlowError::Io { .. } => "io_error",
            FlowError::Json { .. } => "json_error",
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            FlowError::Validation(err) => Some(err.kind),
            _ => None,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FlowError::Io {
            context: context.into(),
            source,
        }
    }
}

fn location(line: Option<usize>, column: Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(":{}:{}", line, column),
        (Some(line), None) => format!(":{}", line),
        _ => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
