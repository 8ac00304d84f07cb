//! Error types for embedded tool-server routing.

use crate::jsonrpc::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};
use tether_types::ToolError;
use thiserror::Error;

/// Failures while answering an embedded tool-server message.
///
/// Each maps to a JSON-RPC error code; none of them fail the surrounding
/// control request.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Server '{name}' not found")]
    ServerNotFound { name: String },

    #[error("Method '{method}' not found")]
    MethodNotFound { method: String },

    #[error("Tool '{name}' not found")]
    ToolNotFound { name: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ToolFailed(#[from] ToolError),
}

impl McpError {
    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::ServerNotFound { .. } | Self::MethodNotFound { .. } | Self::ToolNotFound { .. } => {
                METHOD_NOT_FOUND
            }
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::ToolFailed(_) => INTERNAL_ERROR,
        }
    }
}
