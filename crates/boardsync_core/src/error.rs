use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::patch::Path;

/// Unified error type for boardsync operations
#[derive(Debug, Error)]
pub enum BoardsyncError {
    // Validation / programming errors: surfaced immediately, never swallowed
    #[error("Unknown resource collection '{0}'")]
    UnknownResource(String),

    #[error("No value at path '{0}'")]
    UnknownPath(Path),

    #[error("Resource in collection '{0}' has no string 'id' field")]
    ResourceWithoutId(String),

    #[error("Resources of '{0}' cannot be created through the batch API")]
    NotCreatable(String),

    #[error("Card '{id}' cannot change kind from '{from}' to '{to}'")]
    CardKindChanged {
        id: String,
        from: String,
        to: String,
    },

    #[error("Patch path '{0}' does not address a resource")]
    InvalidPatchPath(Path),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transport / application errors reported by the server
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Request aborted")]
    Aborted,

    #[error("Repo has been disposed")]
    Disposed,
}

/// Result type alias for boardsync operations
pub type Result<T> = std::result::Result<T, BoardsyncError>;

/// A server-reported error for one mutation group or one request.
///
/// Carried as a value inside batch results so the UI can surface it
/// (e.g. a transient notification); only transport-level failures are
/// converted into [`BoardsyncError::Api`].
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "bindings/")]
#[error("{message}")]
pub struct ApiError {
    /// HTTP-ish status code, if the server supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Human-readable error message.
    pub message: String,
}

impl ApiError {
    /// Create an error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create an error with a status code.
    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}
