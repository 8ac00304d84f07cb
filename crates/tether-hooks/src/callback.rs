//! Hook callback trait and matcher registration.

use crate::types::{HookEvent, HookInput, HookOutput};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{BoxFuture, CallbackError};
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a hook callback.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// Fires when the session is cancelled or closed. Advisory: the dispatcher
    /// does not abort a callback that ignores it.
    pub cancel: CancellationToken,
}

/// A locally registered hook function.
///
/// Implemented for any `Fn(HookInput, Option<String>, HookContext) -> Future`
/// closure; see [`HookMatcher::hook_fn`].
pub trait HookCallback: Send + Sync {
    fn call(
        &self,
        input: HookInput,
        tool_use_id: Option<String>,
        ctx: HookContext,
    ) -> BoxFuture<'_, Result<HookOutput, CallbackError>>;
}

impl<F, Fut> HookCallback for F
where
    F: Fn(HookInput, Option<String>, HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookOutput, CallbackError>> + Send + 'static,
{
    fn call(
        &self,
        input: HookInput,
        tool_use_id: Option<String>,
        ctx: HookContext,
    ) -> BoxFuture<'_, Result<HookOutput, CallbackError>> {
        Box::pin(self(input, tool_use_id, ctx))
    }
}

/// A matcher pattern and the callbacks that run when it matches.
///
/// Pattern matching happens in the agent process; the pattern is only
/// forwarded in the handshake.
#[derive(Clone, Default)]
pub struct HookMatcher {
    /// Tool-name pattern such as `"Bash"` or `"Write|Edit"`; `None` matches all.
    pub matcher: Option<String>,
    pub hooks: Vec<Arc<dyn HookCallback>>,
    /// Timeout hint forwarded to the agent.
    pub timeout: Option<Duration>,
}

impl HookMatcher {
    pub fn new(matcher: impl Into<String>) -> Self {
        Self {
            matcher: Some(matcher.into()),
            ..Self::default()
        }
    }

    /// A matcher without a pattern.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn hook(mut self, callback: impl HookCallback + 'static) -> Self {
        self.hooks.push(Arc::new(callback));
        self
    }

    /// Register a closure; pins down the closure's argument types for inference.
    pub fn hook_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(HookInput, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutput, CallbackError>> + Send + 'static,
    {
        self.hook(f)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for HookMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookMatcher")
            .field("matcher", &self.matcher)
            .field("hooks", &self.hooks.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// All hook registrations for a session, keyed by event.
pub type HookRegistrations = BTreeMap<HookEvent, Vec<HookMatcher>>;
