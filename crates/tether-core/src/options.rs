//! Session options for a [`Query`](crate::Query).

use std::sync::Arc;
use tether_config::ControlConfig;
use tether_hooks::{HookEvent, HookMatcher, HookRegistrations, PermissionCallback};
use tether_mcp::SdkMcpServer;

/// Everything a session needs besides its transport.
///
/// Hooks, the permission callback and tool servers are fixed at construction;
/// the session never mutates them afterwards.
#[derive(Clone)]
pub struct QueryOptions {
    /// Interactive session speaking the control protocol. Control requests
    /// fail and `initialize` is a no-op when this is `false`.
    pub streaming: bool,
    pub hooks: HookRegistrations,
    pub can_use_tool: Option<Arc<dyn PermissionCallback>>,
    pub mcp_servers: Vec<SdkMcpServer>,
    pub config: ControlConfig,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            hooks: HookRegistrations::new(),
            can_use_tool: None,
            mcp_servers: Vec::new(),
            config: ControlConfig::default(),
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Register a matcher for `event`. Matchers for the same event keep their
    /// registration order.
    pub fn hook(mut self, event: HookEvent, matcher: HookMatcher) -> Self {
        self.hooks.entry(event).or_default().push(matcher);
        self
    }

    pub fn can_use_tool(mut self, callback: impl PermissionCallback + 'static) -> Self {
        self.can_use_tool = Some(Arc::new(callback));
        self
    }

    pub fn mcp_server(mut self, server: SdkMcpServer) -> Self {
        self.mcp_servers.push(server);
        self
    }

    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("streaming", &self.streaming)
            .field("hooks", &self.hooks)
            .field("can_use_tool", &self.can_use_tool.is_some())
            .field("mcp_servers", &self.mcp_servers)
            .field("config", &self.config)
            .finish()
    }
}
