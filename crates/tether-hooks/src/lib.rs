//! Hook callbacks and permission decisions for Tether.
//!
//! Hook events: PreToolUse / PostToolUse / PostToolUseFailure / UserPromptSubmit /
//! Stop / SubagentStop / PreCompact
//! Permission results: allow (optionally rewriting input) / deny (optionally interrupting)

pub mod callback;
pub mod permission;
pub mod registry;
pub mod types;

pub use callback::{HookCallback, HookContext, HookMatcher, HookRegistrations};
pub use permission::*;
pub use registry::CallbackRegistry;
pub use types::*;
