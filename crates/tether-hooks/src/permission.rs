//! Tool permission decisions for `can_use_tool` requests.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_types::{BoxFuture, CallbackError, PermissionMode};

/// Behavior a permission rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    Ask,
}

/// Where a permission update is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionDestination {
    UserSettings,
    ProjectSettings,
    LocalSettings,
    Session,
}

/// A rule naming a tool and an optional content pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRuleValue {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_content: Option<String>,
}

/// A change to the agent's permission settings, suggested by the agent or
/// returned by a permission callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PermissionUpdate {
    AddRules {
        rules: Vec<PermissionRuleValue>,
        behavior: PermissionBehavior,
        destination: PermissionDestination,
    },
    ReplaceRules {
        rules: Vec<PermissionRuleValue>,
        behavior: PermissionBehavior,
        destination: PermissionDestination,
    },
    RemoveRules {
        rules: Vec<PermissionRuleValue>,
        behavior: PermissionBehavior,
        destination: PermissionDestination,
    },
    SetMode {
        mode: PermissionMode,
        destination: PermissionDestination,
    },
    AddDirectories {
        directories: Vec<String>,
        destination: PermissionDestination,
    },
    RemoveDirectories {
        directories: Vec<String>,
        destination: PermissionDestination,
    },
}

/// Context passed alongside a permission check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPermissionContext {
    /// Updates the agent suggests applying if the call is allowed.
    pub suggestions: Vec<PermissionUpdate>,
    /// Path that triggered the check, when the agent reports one.
    pub blocked_path: Option<String>,
}

impl ToolPermissionContext {
    /// Build the context from raw request fields. Suggestions that do not
    /// parse are skipped rather than failing the whole request.
    pub fn from_raw(suggestions: Vec<Value>, blocked_path: Option<String>) -> Self {
        let suggestions = suggestions
            .into_iter()
            .filter_map(|s| match serde_json::from_value(s) {
                Ok(update) => Some(update),
                Err(e) => {
                    tracing::debug!("Skipping unrecognized permission suggestion: {e}");
                    None
                }
            })
            .collect();
        Self {
            suggestions,
            blocked_path,
        }
    }
}

/// Outcome of a permission callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionResult {
    Allow {
        /// Replacement input; the original input is used when `None`.
        updated_input: Option<Value>,
        updated_permissions: Vec<PermissionUpdate>,
    },
    Deny {
        message: String,
        /// Also interrupt the agent's current turn.
        interrupt: bool,
    },
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Convert into the response payload of a `can_use_tool` request.
    pub fn to_wire(&self, original_input: &Value) -> Result<Value, CallbackError> {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut out = json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.as_ref().unwrap_or(original_input),
                });
                if !updated_permissions.is_empty() {
                    out["updatedPermissions"] = serde_json::to_value(updated_permissions)
                        .map_err(|e| CallbackError::InvalidOutput(e.to_string()))?;
                }
                Ok(out)
            }
            Self::Deny { message, interrupt } => {
                let mut out = json!({"behavior": "deny", "message": message});
                if *interrupt {
                    out["interrupt"] = Value::Bool(true);
                }
                Ok(out)
            }
        }
    }
}

/// Decides whether the agent may use a tool.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility.
pub trait PermissionCallback: Send + Sync {
    fn can_use_tool<'a>(
        &'a self,
        tool_name: &'a str,
        input: &'a Value,
        context: ToolPermissionContext,
    ) -> BoxFuture<'a, Result<PermissionResult, CallbackError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_echoes_original_input() {
        let input = json!({"command": "ls"});
        let wire = PermissionResult::allow().to_wire(&input).unwrap();
        assert_eq!(wire, json!({"behavior": "allow", "updatedInput": {"command": "ls"}}));
    }

    #[test]
    fn allow_with_updates() {
        let result = PermissionResult::Allow {
            updated_input: Some(json!({"command": "ls -la"})),
            updated_permissions: vec![PermissionUpdate::AddRules {
                rules: vec![PermissionRuleValue {
                    tool_name: "Bash".into(),
                    rule_content: Some("ls:*".into()),
                }],
                behavior: PermissionBehavior::Allow,
                destination: PermissionDestination::Session,
            }],
        };
        let wire = result.to_wire(&json!({"command": "ls"})).unwrap();
        assert_eq!(wire["updatedInput"]["command"], "ls -la");
        let update = &wire["updatedPermissions"][0];
        assert_eq!(update["type"], "addRules");
        assert_eq!(update["rules"][0]["toolName"], "Bash");
        assert_eq!(update["rules"][0]["ruleContent"], "ls:*");
        assert_eq!(update["destination"], "session");
    }

    #[test]
    fn deny_omits_interrupt_unless_set() {
        let wire = PermissionResult::deny("no").to_wire(&json!({})).unwrap();
        assert_eq!(wire, json!({"behavior": "deny", "message": "no"}));

        let wire = PermissionResult::Deny {
            message: "stop".into(),
            interrupt: true,
        }
        .to_wire(&json!({}))
        .unwrap();
        assert_eq!(wire["interrupt"], true);
    }

    #[test]
    fn context_skips_unknown_suggestions() {
        let ctx = ToolPermissionContext::from_raw(
            vec![
                json!({"type": "setMode", "mode": "acceptEdits", "destination": "session"}),
                json!({"type": "somethingNew"}),
            ],
            Some("/etc/passwd".into()),
        );
        assert_eq!(ctx.suggestions.len(), 1);
        assert_eq!(
            ctx.suggestions[0],
            PermissionUpdate::SetMode {
                mode: PermissionMode::AcceptEdits,
                destination: PermissionDestination::Session,
            }
        );
        assert_eq!(ctx.blocked_path.as_deref(), Some("/etc/passwd"));
    }

    #[test]
    fn permission_callback_is_dyn_compatible() {
        fn _accept(_c: &dyn PermissionCallback) {}
    }
}
