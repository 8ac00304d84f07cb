//! Callback registry: assigns opaque identifiers to hook callbacks and
//! dispatches inbound `hook_callback` requests to them.

use crate::callback::{HookCallback, HookContext, HookRegistrations};
use crate::types::HookInput;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tether_types::DispatchError;

/// Immutable map from callback identifier to hook function.
///
/// Built once before the handshake; never mutated afterwards, so lookups need
/// no synchronization.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Arc<dyn HookCallback>>,
    handshake: Option<Value>,
}

impl CallbackRegistry {
    /// Assign `hook_<n>` identifiers to every callback and build the
    /// handshake's `hooks` payload.
    ///
    /// Events are visited in their declared order and callbacks in
    /// registration order, so identifiers are stable for a given setup.
    pub fn build(registrations: &HookRegistrations) -> Self {
        let mut callbacks = HashMap::new();
        let mut config = Map::new();
        let mut next_id = 0usize;

        for (event, matchers) in registrations {
            if matchers.is_empty() {
                continue;
            }
            let mut entries = Vec::with_capacity(matchers.len());
            for matcher in matchers {
                let ids: Vec<String> = matcher
                    .hooks
                    .iter()
                    .map(|callback| {
                        let id = format!("hook_{next_id}");
                        next_id += 1;
                        callbacks.insert(id.clone(), Arc::clone(callback));
                        id
                    })
                    .collect();

                let mut entry = json!({
                    "matcher": matcher.matcher,
                    "hookCallbackIds": ids,
                });
                if let Some(timeout) = matcher.timeout {
                    entry["timeout"] = json!(timeout.as_secs_f64());
                }
                entries.push(entry);
            }
            config.insert(event.as_str().to_string(), Value::Array(entries));
        }

        let handshake = (!config.is_empty()).then_some(Value::Object(config));
        Self {
            callbacks,
            handshake,
        }
    }

    /// The `hooks` field of the initialize request, or `None` when no hooks
    /// are registered.
    pub fn handshake_config(&self) -> Option<&Value> {
        self.handshake.as_ref()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Run the callback registered under `callback_id` and return its output
    /// in wire form.
    pub async fn invoke(
        &self,
        callback_id: &str,
        raw_input: Value,
        tool_use_id: Option<String>,
        ctx: HookContext,
    ) -> Result<Value, DispatchError> {
        let callback = self
            .callbacks
            .get(callback_id)
            .ok_or_else(|| DispatchError::UnknownCallback {
                id: callback_id.to_string(),
            })?;

        let input = HookInput::from_value(raw_input)?;
        tracing::debug!(
            "Invoking hook {} for {} (tool_use_id: {:?})",
            callback_id,
            input.event(),
            tool_use_id
        );
        let output = callback.call(input, tool_use_id, ctx).await?;
        Ok(output.to_wire())
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.callbacks.len())
            .field("handshake", &self.handshake)
            .finish()
    }
}
