//! Structured error taxonomy for the build core.
//!
//! Every fallible operation in this crate returns [`CoreError`]. Each variant
//! corresponds to one of the five error kinds the build core distinguishes;
//! every variant carries the `operation` that failed and, where there is an
//! underlying cause, wraps it as `#[source]` so callers can match on kind
//! without losing the original failure.

use std::fmt;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// A structured build-core error.
///
/// Callers that need to distinguish failure categories (for example, to
/// decide whether a failure is retryable, which this crate never does
/// itself) can match on the variant rather than parsing message text.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An input or output value failed a schema or structural constraint:
    /// a malformed digest, an unsupported architecture, an oversize
    /// document, a missing required field.
    #[error("validation failed in {operation}: {message}")]
    Validation {
        /// The operation that performed the validation (e.g. `"validate_layer"`).
        operation: String,
        /// A human-readable description of the violated constraint.
        message: String,
    },

    /// A transformation step produced a result that downstream validation
    /// rejected.
    #[error("generation failed in {operation}")]
    Generation {
        /// The operation that was generating a document (e.g. `"generate_image_manifest"`).
        operation: String,
        /// The validation failure that caused generation to be aborted.
        #[source]
        cause: Box<CoreError>,
    },

    /// A hash computation could not complete because I/O on the source
    /// stream failed.
    #[error("digest computation failed in {operation}")]
    Digest {
        /// The operation computing a digest (e.g. `"create_layer"`).
        operation: String,
        /// The underlying I/O failure.
        #[source]
        cause: std::io::Error,
    },

    /// JSON encoding failed, or would have produced non-round-trippable
    /// output.
    #[error("serialization failed in {operation}")]
    Serialization {
        /// The operation serializing a document.
        operation: String,
        /// The underlying encoding failure.
        #[source]
        cause: serde_json::Error,
    },

    /// Tar read/write, compression, or filesystem materialization failed.
    #[error("layer I/O failed in {operation}{}", path_suffix(.path))]
    LayerIo {
        /// The operation performing layer I/O (e.g. `"extract_layer"`).
        operation: String,
        /// The path being materialized or read, when known.
        path: Option<String>,
        /// The underlying I/O failure.
        #[source]
        cause: std::io::Error,
    },
}

fn path_suffix(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(" (path: {p})"),
        None => String::new(),
    }
}

impl CoreError {
    /// Build a [`CoreError::Validation`].
    pub fn validation(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        CoreError::Validation {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Wrap a validation failure as a [`CoreError::Generation`].
    pub fn generation(operation: impl Into<String>, cause: CoreError) -> Self {
        CoreError::Generation {
            operation: operation.into(),
            cause: Box::new(cause),
        }
    }

    /// Build a [`CoreError::Digest`].
    pub fn digest(operation: impl Into<String>, cause: std::io::Error) -> Self {
        CoreError::Digest {
            operation: operation.into(),
            cause,
        }
    }

    /// Build a [`CoreError::Serialization`].
    pub fn serialization(operation: impl Into<String>, cause: serde_json::Error) -> Self {
        CoreError::Serialization {
            operation: operation.into(),
            cause,
        }
    }

    /// Build a [`CoreError::LayerIo`] with no specific path.
    pub fn layer_io(operation: impl Into<String>, cause: std::io::Error) -> Self {
        CoreError::LayerIo {
            operation: operation.into(),
            path: None,
            cause,
        }
    }

    /// Build a [`CoreError::LayerIo`] naming the offending path.
    pub fn layer_io_at(
        operation: impl Into<String>,
        path: impl Into<String>,
        cause: std::io::Error,
    ) -> Self {
        CoreError::LayerIo {
            operation: operation.into(),
            path: Some(path.into()),
            cause,
        }
    }
}
