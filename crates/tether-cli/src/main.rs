//! Tether CLI: run an agent process and relay its messages as JSON lines.

mod permission;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{Stream, StreamExt, stream};
use permission::AllowListPermissions;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tether_config::ControlConfig;
use tether_core::{Query, QueryOptions, SubprocessTransport};
use tether_hooks::{HookEvent, HookInput, HookMatcher, HookOutput};
use tether_mcp::{SdkMcpServer, SdkTool};
use tether_types::{PermissionMode, ToolError, ToolOutput};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "tether", version, about = "Drive an agent process over the control protocol")]
struct Cli {
    /// Send a single prompt as the only user message (otherwise JSON messages
    /// are read from stdin, one per line)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Permission mode to switch to after the handshake
    /// (default, acceptEdits, plan, bypassPermissions)
    #[arg(long)]
    permission_mode: Option<PermissionMode>,

    /// Only permit these tools; may be repeated
    #[arg(long = "allow-tool", value_name = "NAME")]
    allow_tool: Vec<String>,

    /// Working directory for the agent process
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Agent command and its arguments
    #[arg(last = true, required = true, value_name = "AGENT")]
    agent: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }

    let config = ControlConfig::load().context("Failed to load configuration")?;

    let (command, args) = cli
        .agent
        .split_first()
        .context("No agent command given")?;
    let transport = SubprocessTransport::spawn(
        command,
        args,
        &HashMap::new(),
        cli.cwd.as_deref(),
        config.max_buffer_size,
    )
    .context("Failed to start agent process")?;

    let mut options = QueryOptions::new()
        .config(config)
        .hook(
            HookEvent::PreToolUse,
            HookMatcher::any().hook_fn(|input: HookInput, tool_use_id: Option<String>, _| async move {
                tracing::info!(
                    "Agent is about to use {} ({})",
                    input.tool_name().unwrap_or("unknown tool"),
                    tool_use_id.as_deref().unwrap_or("no id")
                );
                Ok(HookOutput::default())
            }),
        )
        .mcp_server(echo_server());
    if !cli.allow_tool.is_empty() {
        options = options.can_use_tool(AllowListPermissions::new(cli.allow_tool));
    }

    let query = Arc::new(Query::new(Arc::new(transport), options));
    query.start()?;
    let mut messages = query.messages()?;

    let token = query.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; shutting down");
            token.cancel();
        }
    });

    let outcome = run(&query, &mut messages, cli.prompt, cli.permission_mode).await;
    query.close().await?;
    outcome
}

async fn run(
    query: &Arc<Query>,
    messages: &mut tether_core::MessageStream,
    prompt: Option<String>,
    permission_mode: Option<PermissionMode>,
) -> Result<()> {
    query
        .initialize()
        .await
        .context("Handshake with agent failed")?;
    if let Some(mode) = permission_mode {
        query
            .set_permission_mode(mode)
            .await
            .context("Failed to set permission mode")?;
    }

    let input = tokio::spawn({
        let query = Arc::clone(query);
        async move {
            match prompt {
                Some(prompt) => {
                    query
                        .stream_input(stream::once(async move { user_message(&prompt) }))
                        .await
                }
                None => query.stream_input(stdin_messages()).await,
            }
        }
    });

    while let Some(message) = messages.next().await {
        let message = message.context("Agent session failed")?;
        println!("{message}");
    }

    match input.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Input stream failed: {e}"),
        Err(e) => tracing::warn!("Input task failed: {e}"),
    }
    Ok(())
}

/// A user turn in the shape the agent reads from its input.
fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": prompt},
        "parent_tool_use_id": null,
        "session_id": "default",
    })
}

/// JSON messages read from stdin, one per line. Lines that are not JSON are
/// sent as plain-text user messages.
fn stdin_messages() -> impl Stream<Item = Value> + Send {
    let lines = BufReader::new(tokio::io::stdin()).lines();
    stream::unfold(lines, |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let message = serde_json::from_str(&line).unwrap_or_else(|_| user_message(&line));
                    return Some((message, lines));
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {e}");
                    return None;
                }
            }
        }
    })
}

/// In-process tool server exposed to the agent as `tether`.
fn echo_server() -> SdkMcpServer {
    SdkMcpServer::new("tether", env!("CARGO_PKG_VERSION")).tool(SdkTool::from_fn(
        "echo",
        "Echo the given text back",
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        }),
        |args: Value| async move {
            match args.get("text").and_then(Value::as_str) {
                Some(text) => Ok(ToolOutput::text(text)),
                None => Err(ToolError::InvalidInput {
                    tool: "echo".to_string(),
                    message: "missing required field 'text'".to_string(),
                }),
            }
        },
    ))
}
