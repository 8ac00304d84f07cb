//! Hook event, input and output types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_types::DispatchError;

/// Events a hook callback can be registered for.
///
/// Ordered so that callback identifiers are assigned deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PostToolUseFailure => "PostToolUseFailure",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
        }
    }
}

impl std::str::FromStr for HookEvent {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PreToolUse" => Ok(Self::PreToolUse),
            "PostToolUse" => Ok(Self::PostToolUse),
            "PostToolUseFailure" => Ok(Self::PostToolUseFailure),
            "UserPromptSubmit" => Ok(Self::UserPromptSubmit),
            "Stop" => Ok(Self::Stop),
            "SubagentStop" => Ok(Self::SubagentStop),
            "PreCompact" => Ok(Self::PreCompact),
            other => Err(DispatchError::UnknownHookEvent {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every hook input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseHookInput {
    pub session_id: String,
    pub transcript_path: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreToolUseInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostToolUseInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_response: Value,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostToolUseFailureInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub tool_name: String,
    pub tool_input: Value,
    pub error: String,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub is_interrupt: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPromptSubmitInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub stop_hook_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentStopInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub stop_hook_active: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_transcript_path: Option<String>,
}

/// What triggered a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactTrigger {
    Manual,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCompactInput {
    #[serde(flatten)]
    pub base: BaseHookInput,
    pub trigger: CompactTrigger,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

/// Typed hook input, reconstructed from the raw payload of a `hook_callback`
/// request.
#[derive(Debug, Clone, PartialEq)]
pub enum HookInput {
    PreToolUse(PreToolUseInput),
    PostToolUse(PostToolUseInput),
    PostToolUseFailure(PostToolUseFailureInput),
    UserPromptSubmit(UserPromptSubmitInput),
    Stop(StopInput),
    SubagentStop(SubagentStopInput),
    PreCompact(PreCompactInput),
}

impl HookInput {
    /// Rebuild a typed input from the raw payload, keyed on `hook_event_name`.
    ///
    /// An unrecognized event name is an error; the shape is never guessed.
    pub fn from_value(raw: Value) -> Result<Self, DispatchError> {
        let name = raw
            .get("hook_event_name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DispatchError::InvalidRequest("hook input is missing hook_event_name".into())
            })?;
        let event: HookEvent = name.parse()?;

        fn parse<T: serde::de::DeserializeOwned>(
            event: HookEvent,
            raw: Value,
        ) -> Result<T, DispatchError> {
            serde_json::from_value(raw).map_err(|e| {
                DispatchError::InvalidRequest(format!("malformed {event} hook input: {e}"))
            })
        }

        Ok(match event {
            HookEvent::PreToolUse => Self::PreToolUse(parse(event, raw)?),
            HookEvent::PostToolUse => Self::PostToolUse(parse(event, raw)?),
            HookEvent::PostToolUseFailure => Self::PostToolUseFailure(parse(event, raw)?),
            HookEvent::UserPromptSubmit => Self::UserPromptSubmit(parse(event, raw)?),
            HookEvent::Stop => Self::Stop(parse(event, raw)?),
            HookEvent::SubagentStop => Self::SubagentStop(parse(event, raw)?),
            HookEvent::PreCompact => Self::PreCompact(parse(event, raw)?),
        })
    }

    pub fn event(&self) -> HookEvent {
        match self {
            Self::PreToolUse(_) => HookEvent::PreToolUse,
            Self::PostToolUse(_) => HookEvent::PostToolUse,
            Self::PostToolUseFailure(_) => HookEvent::PostToolUseFailure,
            Self::UserPromptSubmit(_) => HookEvent::UserPromptSubmit,
            Self::Stop(_) => HookEvent::Stop,
            Self::SubagentStop(_) => HookEvent::SubagentStop,
            Self::PreCompact(_) => HookEvent::PreCompact,
        }
    }

    pub fn base(&self) -> &BaseHookInput {
        match self {
            Self::PreToolUse(i) => &i.base,
            Self::PostToolUse(i) => &i.base,
            Self::PostToolUseFailure(i) => &i.base,
            Self::UserPromptSubmit(i) => &i.base,
            Self::Stop(i) => &i.base,
            Self::SubagentStop(i) => &i.base,
            Self::PreCompact(i) => &i.base,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.base().session_id
    }

    /// Tool name, for the tool-related events.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::PreToolUse(i) => Some(&i.tool_name),
            Self::PostToolUse(i) => Some(&i.tool_name),
            Self::PostToolUseFailure(i) => Some(&i.tool_name),
            _ => None,
        }
    }
}

/// Block decision a hook may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDecision {
    Block,
}

/// Permission decision a `PreToolUse` hook may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPermissionDecision {
    Allow,
    Deny,
    Ask,
}

/// Event-specific part of a hook's output, tagged by `hookEventName`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "hookEventName")]
pub enum HookSpecificOutput {
    #[serde(rename_all = "camelCase")]
    PreToolUse {
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_decision: Option<HookPermissionDecision>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_decision_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    PostToolUse {
        #[serde(skip_serializing_if = "Option::is_none")]
        additional_context: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PostToolUseFailure {
        #[serde(skip_serializing_if = "Option::is_none")]
        additional_context: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserPromptSubmit {
        #[serde(skip_serializing_if = "Option::is_none")]
        additional_context: Option<String>,
    },
}

/// Output of a hook callback.
///
/// `Default` is "no opinion": the agent continues as if the hook was absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutput {
    /// Defer the decision; the agent proceeds without waiting.
    pub run_async: bool,
    /// Timeout for a deferred hook, in milliseconds.
    pub async_timeout_ms: Option<u64>,
    pub continue_: Option<bool>,
    pub suppress_output: bool,
    pub stop_reason: Option<String>,
    pub decision: Option<HookDecision>,
    pub system_message: Option<String>,
    pub reason: Option<String>,
    pub hook_specific_output: Option<HookSpecificOutput>,
}

impl HookOutput {
    /// Shorthand for a `PreToolUse` output denying the tool call.
    pub fn deny_tool(reason: impl Into<String>) -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput::PreToolUse {
                permission_decision: Some(HookPermissionDecision::Deny),
                permission_decision_reason: Some(reason.into()),
                updated_input: None,
            }),
            ..Self::default()
        }
    }

    /// Shorthand for an output that stops the agent.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            continue_: Some(false),
            stop_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Convert into the field names the agent process expects.
    ///
    /// An async output short-circuits: only `async` and `asyncTimeout` are sent.
    /// Unset and empty fields are omitted.
    pub fn to_wire(&self) -> Value {
        let mut out = Map::new();
        if self.run_async {
            out.insert("async".into(), Value::Bool(true));
            if let Some(ms) = self.async_timeout_ms {
                out.insert("asyncTimeout".into(), Value::from(ms));
            }
            return Value::Object(out);
        }

        if let Some(cont) = self.continue_ {
            out.insert("continue".into(), Value::Bool(cont));
        }
        if self.suppress_output {
            out.insert("suppressOutput".into(), Value::Bool(true));
        }
        insert_non_empty(&mut out, "stopReason", &self.stop_reason);
        if let Some(HookDecision::Block) = self.decision {
            out.insert("decision".into(), Value::from("block"));
        }
        insert_non_empty(&mut out, "systemMessage", &self.system_message);
        insert_non_empty(&mut out, "reason", &self.reason);
        if let Some(specific) = &self.hook_specific_output {
            // Serializing a plain tagged enum cannot fail.
            if let Ok(value) = serde_json::to_value(specific) {
                out.insert("hookSpecificOutput".into(), value);
            }
        }
        Value::Object(out)
    }
}

fn insert_non_empty(out: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
        out.insert(key.into(), Value::from(v));
    }
}
