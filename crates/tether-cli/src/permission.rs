//! Allow-list permission callback for `--allow-tool`.

use serde_json::Value;
use std::collections::BTreeSet;
use tether_hooks::{PermissionCallback, PermissionResult, ToolPermissionContext};
use tether_types::{BoxFuture, CallbackError};

/// Permits only the named tools; everything else is denied with a message
/// the agent can show.
pub struct AllowListPermissions {
    allowed: BTreeSet<String>,
}

impl AllowListPermissions {
    pub fn new(tools: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: tools.into_iter().collect(),
        }
    }

    fn decide(&self, tool_name: &str, input: &Value) -> PermissionResult {
        if self.allowed.contains(tool_name) {
            tracing::debug!("Allowing {tool_name} ({})", summarize_input(input));
            PermissionResult::allow()
        } else {
            tracing::info!("Denying {tool_name} ({})", summarize_input(input));
            PermissionResult::deny(format!(
                "{tool_name} is not in the allowed tool list ({})",
                self.allowed.iter().cloned().collect::<Vec<_>>().join(", ")
            ))
        }
    }
}

impl PermissionCallback for AllowListPermissions {
    fn can_use_tool<'a>(
        &'a self,
        tool_name: &'a str,
        input: &'a Value,
        context: ToolPermissionContext,
    ) -> BoxFuture<'a, Result<PermissionResult, CallbackError>> {
        if let Some(path) = &context.blocked_path {
            tracing::debug!("{tool_name} touches blocked path {path}");
        }
        let result = self.decide(tool_name, input);
        Box::pin(async move { Ok(result) })
    }
}

/// Create a brief summary of tool input for log lines.
fn summarize_input(input: &Value) -> String {
    match input {
        Value::Object(map) => map
            .iter()
            .take(3)
            .map(|(k, v)| {
                let val = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{k}: {}", truncate(&val, 60))
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => truncate(&other.to_string(), 60),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
