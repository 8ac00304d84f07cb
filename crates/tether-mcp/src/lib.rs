//! In-process tool servers for Tether.
//!
//! The agent process reaches local tools through `mcp_message` control
//! requests carrying JSON-RPC 2.0 messages. The router answers `initialize`,
//! `tools/list`, `tools/call` and `notifications/initialized` against the
//! servers registered when the session was built.

pub mod error;
pub mod jsonrpc;
pub mod router;
pub mod server;

pub use error::McpError;
pub use router::{McpRouter, PROTOCOL_VERSION};
pub use server::{SdkMcpServer, SdkTool, ToolHandler};
