//! Errors raised while resolving type layouts

use std::fmt;

use thiserror::Error;

/// Position inside a header unit, 1-based
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A problem reported by the header frontend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn new(location: SourceLocation, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: error: {}", self.location, self.message)
    }
}

/// Errors that can occur while resolving records
#[derive(Debug, Error)]
pub enum LayoutError {
    /// Header text did not compile; only that unit is affected
    #[error("{unit}: {} error(s) while parsing definitions", .diagnostics.len())]
    MalformedSource {
        unit: String,
        diagnostics: Vec<Diagnostic>,
    },

    /// No adapter knows this name
    #[error("Type '{0}' not found")]
    UnknownType(String),

    /// The frontend itself broke down; fatal to the whole pass
    #[error("{adapter} adapter failed: {message}")]
    AdapterFailure {
        adapter: &'static str,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("{record}.{member}: {width}-bit field at bit {bit_offset} does not fit one aligned load")]
    UnsupportedBitfield {
        record: String,
        member: String,
        bit_offset: usize,
        width: usize,
    },
}

impl LayoutError {
    pub fn adapter_failure(adapter: &'static str, message: impl Into<String>) -> Self {
        LayoutError::AdapterFailure {
            adapter,
            message: message.into(),
        }
    }

    /// Whether the error stops the resolution pass as a whole
    pub fn is_fatal(&self) -> bool {
        matches!(self, LayoutError::AdapterFailure { .. })
    }
}
