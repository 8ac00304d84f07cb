//! Error hierarchy for Tether.

use thiserror::Error;

/// Top-level error type for all control-protocol operations.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control request '{subtype}' timed out after {timeout_ms}ms")]
    Timeout { subtype: String, timeout_ms: u64 },

    #[error("Control request '{subtype}' cancelled")]
    Cancelled { subtype: String },

    #[error("Control request '{subtype}' aborted: {reason}")]
    Aborted { subtype: String, reason: String },

    #[error("Control request '{subtype}' failed: {message}")]
    Remote { subtype: String, message: String },

    #[error("Control requests require streaming mode")]
    NotStreaming,

    #[error("Message reader already started")]
    AlreadyStarted,

    #[error("Session is closed")]
    Closed,

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the line-delimited JSON transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn agent process '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON message exceeded maximum buffer size of {max_bytes} bytes")]
    BufferOverflow { max_bytes: usize },

    #[error("Agent process exited with code {code:?}")]
    ProcessExited { code: Option<i32> },

    #[error("Transport is not ready for writing")]
    NotReady,

    #[error("Transport message stream was already taken")]
    StreamTaken,
}

/// Failures while answering an inbound control request.
///
/// These never escape the dispatcher; they are converted into an error-tagged
/// `control_response` and written back to the agent process.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No hook callback found for ID: {id}")]
    UnknownCallback { id: String },

    #[error("Unknown hook event name: {name}")]
    UnknownHookEvent { name: String },

    #[error("Invalid control request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported control request subtype: {subtype}")]
    UnsupportedSubtype { subtype: String },

    #[error("canUseTool callback is not provided")]
    NoPermissionCallback,

    #[error("Callback failed: {0}")]
    Callback(#[from] CallbackError),
}

/// Error returned by caller-supplied permission and hook callbacks.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid callback output: {0}")]
    InvalidOutput(String),
}

impl CallbackError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from in-process tool handlers.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid input for tool '{tool}': {message}")]
    InvalidInput { tool: String, message: String },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
