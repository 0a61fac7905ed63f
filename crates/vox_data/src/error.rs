//! Error types for the data model

use crate::value::ValueKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by object, update, property and bus operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Overflow: {0}")]
    Overflow(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Type mismatch for property '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: String,
        found: ValueKind,
    },

    #[error("Property '{0}' is stored with a different definition")]
    DifferentDefinition(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("Update aborted: {0}")]
    UpdateAborted(String),
}

impl DataError {
    /// Shorthand for [`DataError::InvalidOperation`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Shorthand for [`DataError::InternalError`]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Stable dotted name of the error kind, used in status metadata
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidOperation(_) => "vox.InvalidOperation",
            Self::KeyNotFound(_) => "vox.KeyNotFound",
            Self::DuplicateKey(_) => "vox.DuplicateKey",
            Self::Overflow(_) => "vox.Overflow",
            Self::InternalError(_) => "vox.InternalError",
            Self::TypeMismatch { .. } => "vox.TypeMismatch",
            Self::DifferentDefinition(_) => "vox.DifferentPropertyDefinition",
            Self::ObjectNotFound(_) => "vox.ObjectNotFound",
            Self::CoordinatorUnavailable(_) => "vox.CoordinatorUnavailable",
            Self::UpdateAborted(_) => "vox.DataUpdateAborted",
        }
    }
}

/// Result type for data model operations
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors from loading a [`crate::config::DataModelConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        assert_eq!(DataError::invalid("x").name(), "vox.InvalidOperation");
        assert_eq!(DataError::Overflow("x".into()).name(), "vox.Overflow");
        assert_eq!(
            DataError::UpdateAborted("x".into()).name(),
            crate::update::UPDATE_ABORTED
        );
    }

    #[test]
    fn test_error_metadata_uses_name() {
        let err = DataError::DifferentDefinition("angles".into());
        let metadata = crate::update::error_metadata(&err);
        assert_eq!(metadata["Status"]["Error"]["Name"], err.name());
        assert_eq!(metadata["Status"]["Error"]["Message"], err.to_string());

        let aborted = crate::update::aborted_metadata();
        assert_eq!(
            aborted["Status"]["Error"]["Message"],
            "The update was not finished properly"
        );
    }

    #[test]
    fn test_error_display() {
        let err = DataError::TypeMismatch {
            key: "color".into(),
            expected: "Color".into(),
            found: ValueKind::Int,
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch for property 'color': expected Color, found Int"
        );
    }
}
