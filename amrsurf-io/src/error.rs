//! Error types for I/O operations

use amrsurf_core::Error;
use thiserror::Error;

/// Errors that can occur while reading or writing files
#[derive(Error, Debug)]
pub enum IoError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Parse error in {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Field '{field}' not found, available fields: {available:?}")]
    UnknownField { field: String, available: Vec<String> },
}

impl IoError {
    pub(crate) fn parse(path: impl std::fmt::Display, message: impl Into<String>) -> Self {
        IoError::ParseError {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Error::InvalidData(err.to_string())
    }
}
