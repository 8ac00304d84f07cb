//! Control-protocol envelopes exchanged with the agent process.
//!
//! Every line on the wire is a JSON object with a `type` discriminator. The
//! three control types carry request/response pairs; anything else is a data
//! message forwarded to the caller untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONTROL_REQUEST: &str = "control_request";
pub const CONTROL_RESPONSE: &str = "control_response";
pub const CONTROL_CANCEL_REQUEST: &str = "control_cancel_request";

/// `type` of the terminal data message that ends a turn.
pub const RESULT_MESSAGE: &str = "result";

/// Classification of an inbound JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ControlResponse,
    ControlRequest,
    ControlCancelRequest,
    /// A data message; `is_result` marks the terminal result marker.
    Data { is_result: bool },
}

impl MessageKind {
    /// Classify an inbound object by its `type` field.
    pub fn of(message: &Value) -> Self {
        match message.get("type").and_then(Value::as_str) {
            Some(CONTROL_RESPONSE) => Self::ControlResponse,
            Some(CONTROL_REQUEST) => Self::ControlRequest,
            Some(CONTROL_CANCEL_REQUEST) => Self::ControlCancelRequest,
            Some(RESULT_MESSAGE) => Self::Data { is_result: true },
            _ => Self::Data { is_result: false },
        }
    }
}

/// Permission mode of the agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "acceptEdits" => Ok(Self::AcceptEdits),
            "plan" => Ok(Self::Plan),
            "bypassPermissions" => Ok(Self::BypassPermissions),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}

/// Body of an outbound control request (the `request` field of the envelope).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    Initialize { hooks: Option<Value> },
    Interrupt,
    SetPermissionMode { mode: PermissionMode },
    SetModel { model: Option<String> },
    RewindFiles { user_message_id: String },
    McpStatus,
}

impl ControlRequest {
    /// Wire subtype, used to tag timeout and failure diagnostics.
    pub fn subtype(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Interrupt => "interrupt",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SetModel { .. } => "set_model",
            Self::RewindFiles { .. } => "rewind_files",
            Self::McpStatus => "mcp_status",
        }
    }
}

/// Full outbound `control_request` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ControlRequestEnvelope<'a> {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub request_id: &'a str,
    pub request: &'a ControlRequest,
}

impl<'a> ControlRequestEnvelope<'a> {
    pub fn new(request_id: &'a str, request: &'a ControlRequest) -> Self {
        Self {
            message_type: CONTROL_REQUEST,
            request_id,
            request,
        }
    }
}

/// An inbound `control_request` envelope. The body stays loosely typed until
/// its subtype has been checked.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundControlRequest {
    pub request_id: String,
    #[serde(default)]
    pub request: Value,
}

impl InboundControlRequest {
    pub fn subtype(&self) -> Option<&str> {
        self.request.get("subtype").and_then(Value::as_str)
    }
}

/// A control response, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponse {
    Success {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        #[serde(default)]
        error: String,
    },
}

impl ControlResponse {
    pub fn success(request_id: impl Into<String>, response: Value) -> Self {
        Self::Success {
            request_id: request_id.into(),
            response: Some(response),
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            request_id: request_id.into(),
            error: error.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }

    /// Parse the `response` field of an inbound `control_response` envelope.
    pub fn from_envelope(message: &Value) -> Result<Self, serde_json::Error> {
        let body = message.get("response").cloned().unwrap_or(Value::Null);
        serde_json::from_value(body)
    }

    /// Wrap into a full `control_response` envelope ready for the wire.
    pub fn into_envelope(self) -> Value {
        serde_json::json!({
            "type": CONTROL_RESPONSE,
            "response": self,
        })
    }
}
