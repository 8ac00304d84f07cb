//! End-to-end tests for `Query` against an in-memory transport.
//!
//! The test side plays the agent process: it reads every line the session
//! writes and injects inbound objects (or a transport failure).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use tether_config::ControlConfig;
use tether_core::{Query, QueryOptions};
use tether_hooks::{
    HookEvent, HookInput, HookMatcher, HookOutput, PermissionCallback, PermissionResult,
    ToolPermissionContext,
};
use tether_mcp::{SdkMcpServer, SdkTool};
use tether_types::{
    BoxFuture, CallbackError, PermissionMode, TetherError, ToolError, ToolOutput, Transport,
    TransportError, TransportStream,
};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// A transport backed by channels. Written lines are parsed and handed to the
/// test; inbound items are whatever the test sends.
struct MockTransport {
    written: mpsc::UnboundedSender<Value>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<Value, TransportError>>>>,
    input_ended: AtomicBool,
    closes: AtomicUsize,
}

impl Transport for MockTransport {
    fn write<'a>(&'a self, line: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            assert!(line.ends_with('\n'), "line must be newline-terminated");
            let value: Value = serde_json::from_str(line.trim_end()).unwrap();
            self.written
                .send(value)
                .map_err(|_| TransportError::NotReady)
        })
    }

    fn read_messages(&self) -> Result<TransportStream, TransportError> {
        let rx = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::StreamTaken)?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn end_input(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.input_ended.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// The agent side of a [`MockTransport`].
struct Agent {
    to_client: mpsc::UnboundedSender<Result<Value, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Value>,
}

impl Agent {
    fn send(&self, message: Value) {
        self.to_client.send(Ok(message)).unwrap();
    }

    async fn recv(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for a client line")
            .expect("client side closed")
    }

    /// Read the next outbound control request and answer it with `payload`.
    async fn answer_next(&mut self, payload: Value) -> Value {
        let request = self.recv().await;
        assert_eq!(request["type"], "control_request");
        self.send(json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request["request_id"],
                "response": payload,
            }
        }));
        request
    }

    /// Send an inbound control request and return the client's response body.
    async fn call(&mut self, request_id: &str, request: Value) -> Value {
        self.send(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        }));
        let reply = self.recv().await;
        assert_eq!(reply["type"], "control_response");
        assert_eq!(reply["response"]["request_id"], request_id);
        reply["response"].clone()
    }
}

fn connect(options: QueryOptions) -> (Arc<Query>, Arc<MockTransport>, Agent) {
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        written: written_tx,
        inbound: Mutex::new(Some(inbound_rx)),
        input_ended: AtomicBool::new(false),
        closes: AtomicUsize::new(0),
    });
    let query = Arc::new(Query::new(transport.clone(), options));
    query.start().unwrap();
    let agent = Agent {
        to_client: inbound_tx,
        from_client: written_rx,
    };
    (query, transport, agent)
}

fn short_timeouts() -> ControlConfig {
    ControlConfig {
        request_timeout: Duration::from_millis(50),
        ..ControlConfig::default()
    }
}

fn pre_tool_use_input(tool_name: &str) -> Value {
    json!({
        "hook_event_name": "PreToolUse",
        "session_id": "sess-1",
        "transcript_path": "/tmp/t.jsonl",
        "cwd": "/work",
        "tool_name": tool_name,
        "tool_input": {"command": "rm -rf /tmp/x"},
    })
}

// ---------------------------------------------------------------------------
// Outbound requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_returns_response_payload() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());

    let status = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.mcp_status().await }
    });
    let request = agent.answer_next(json!({"servers": []})).await;

    assert_eq!(request["request"]["subtype"], "mcp_status");
    let id = request["request_id"].as_str().unwrap();
    assert!(id.starts_with("req_1_"), "unexpected id {id}");

    assert_eq!(status.await.unwrap().unwrap(), json!({"servers": []}));
    assert_eq!(query.pending_requests().await, 0);
}

#[tokio::test]
async fn success_without_payload_yields_empty_object() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());

    let status = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.mcp_status().await }
    });
    let request = agent.recv().await;
    agent.send(json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": request["request_id"]}
    }));
    assert_eq!(status.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn wrappers_send_their_subtypes() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());

    let calls = tokio::spawn({
        let query = Arc::clone(&query);
        async move {
            query.interrupt().await?;
            query.set_permission_mode(PermissionMode::Plan).await?;
            query.set_model(Some("fast-model")).await?;
            query.rewind_files("msg-42").await
        }
    });

    let r = agent.answer_next(json!({})).await;
    assert_eq!(r["request"], json!({"subtype": "interrupt"}));
    let r = agent.answer_next(json!({})).await;
    assert_eq!(r["request"], json!({"subtype": "set_permission_mode", "mode": "plan"}));
    let r = agent.answer_next(json!({})).await;
    assert_eq!(r["request"], json!({"subtype": "set_model", "model": "fast-model"}));
    let r = agent.answer_next(json!({})).await;
    assert_eq!(
        r["request"],
        json!({"subtype": "rewind_files", "user_message_id": "msg-42"})
    );

    calls.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_requests_resolve_by_id_not_order() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());

    let first = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.mcp_status().await }
    });
    let a = agent.recv().await;
    let second = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.mcp_status().await }
    });
    let b = agent.recv().await;
    assert_ne!(a["request_id"], b["request_id"]);

    for (request, tag) in [(&b, "second"), (&a, "first")] {
        agent.send(json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request["request_id"],
                "response": {"tag": tag},
            }
        }));
    }

    assert_eq!(first.await.unwrap().unwrap()["tag"], "first");
    assert_eq!(second.await.unwrap().unwrap()["tag"], "second");
}

#[tokio::test]
async fn interrupt_times_out_and_late_response_is_ignored() {
    let (query, _transport, mut agent) = connect(QueryOptions::new().config(short_timeouts()));
    let mut messages = query.messages().unwrap();

    let started = Instant::now();
    let result = query.interrupt().await;
    let elapsed = started.elapsed();

    match result {
        Err(TetherError::Timeout {
            subtype,
            timeout_ms,
        }) => {
            assert_eq!(subtype, "interrupt");
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("Expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(query.pending_requests().await, 0);

    // Late response for the abandoned id, then ordinary traffic still flows.
    let request = agent.recv().await;
    agent.send(json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": request["request_id"], "response": {}}
    }));
    agent.send(json!({"type": "assistant", "n": 1}));

    let next = messages.next().await.unwrap().unwrap();
    assert_eq!(next, json!({"type": "assistant", "n": 1}));
    assert_eq!(query.pending_requests().await, 0);
}

#[tokio::test]
async fn remote_error_carries_message() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());

    let model = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.set_model(None).await }
    });
    let request = agent.recv().await;
    assert!(request["request"]["model"].is_null());
    agent.send(json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": request["request_id"], "error": "unknown model"}
    }));

    match model.await.unwrap() {
        Err(TetherError::Remote { subtype, message }) => {
            assert_eq!(subtype, "set_model");
            assert_eq!(message, "unknown model");
        }
        other => panic!("Expected Remote, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_abandons_pending_request() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());

    let waiter = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.interrupt().await }
    });
    let _request = agent.recv().await;
    query.cancellation_token().cancel();

    match waiter.await.unwrap() {
        Err(TetherError::Cancelled { subtype }) => assert_eq!(subtype, "interrupt"),
        other => panic!("Expected Cancelled, got {other:?}"),
    }
    assert_eq!(query.pending_requests().await, 0);
}

#[tokio::test]
async fn non_streaming_session_rejects_control_requests() {
    let (query, _transport, _agent) = connect(QueryOptions::new().streaming(false));
    assert!(matches!(
        query.interrupt().await,
        Err(TetherError::NotStreaming)
    ));
    assert_eq!(query.initialize().await.unwrap(), None);
}

// ---------------------------------------------------------------------------
// Handshake & hooks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_sends_hook_handshake_and_retains_result() {
    let options = QueryOptions::new()
        .hook(
            HookEvent::PreToolUse,
            HookMatcher::new("Bash")
                .timeout(Duration::from_secs(30))
                .hook_fn(|_, _, _| async { Ok(HookOutput::default()) }),
        )
        .hook(
            HookEvent::Stop,
            HookMatcher::any().hook_fn(|_, _, _| async { Ok(HookOutput::default()) }),
        );
    let (query, _transport, mut agent) = connect(options);
    assert!(!query.is_initialized());

    let init = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.initialize().await }
    });
    let request = agent.answer_next(json!({"commands": ["help"]})).await;

    assert_eq!(request["request"]["subtype"], "initialize");
    assert_eq!(
        request["request"]["hooks"],
        json!({
            "PreToolUse": [{"matcher": "Bash", "hookCallbackIds": ["hook_0"], "timeout": 30.0}],
            "Stop": [{"matcher": null, "hookCallbackIds": ["hook_1"]}],
        })
    );

    let result = init.await.unwrap().unwrap();
    assert_eq!(result, Some(json!({"commands": ["help"]})));
    assert!(query.is_initialized());
    assert_eq!(
        query.initialization_result(),
        Some(&json!({"commands": ["help"]}))
    );
}

#[tokio::test]
async fn initialize_without_hooks_sends_null() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());
    let init = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.initialize().await }
    });
    let request = agent.answer_next(json!({})).await;
    assert!(request["request"]["hooks"].is_null());
    init.await.unwrap().unwrap();
}

#[tokio::test]
async fn hook_callback_invokes_matching_hook_once() {
    let seen: Arc<Mutex<Vec<(String, Value, String, Option<String>)>>> = Arc::default();
    let options = QueryOptions::new().hook(
        HookEvent::PreToolUse,
        HookMatcher::new("Bash").hook_fn({
            let seen = Arc::clone(&seen);
            move |input: HookInput, tool_use_id, _ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    let HookInput::PreToolUse(pre) = input else {
                        return Err(CallbackError::failed("wrong event"));
                    };
                    seen.lock().unwrap().push((
                        pre.tool_name,
                        pre.tool_input,
                        pre.base.session_id,
                        tool_use_id,
                    ));
                    Ok(HookOutput::deny_tool("no deleting"))
                }
            }
        }),
    );
    let (_query, _transport, mut agent) = connect(options);

    let response = agent
        .call(
            "cli_1",
            json!({
                "subtype": "hook_callback",
                "callback_id": "hook_0",
                "input": pre_tool_use_input("Bash"),
                "tool_use_id": "toolu_9",
            }),
        )
        .await;

    assert_eq!(response["subtype"], "success");
    assert_eq!(
        response["response"]["hookSpecificOutput"],
        json!({
            "hookEventName": "PreToolUse",
            "permissionDecision": "deny",
            "permissionDecisionReason": "no deleting",
        })
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (tool, input, session, tool_use_id) = &seen[0];
    assert_eq!(tool, "Bash");
    assert_eq!(input, &json!({"command": "rm -rf /tmp/x"}));
    assert_eq!(session, "sess-1");
    assert_eq!(tool_use_id.as_deref(), Some("toolu_9"));
}

#[tokio::test]
async fn unknown_hook_callback_is_an_error_response() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new());
    let response = agent
        .call(
            "cli_2",
            json!({
                "subtype": "hook_callback",
                "callback_id": "hook_7",
                "input": pre_tool_use_input("Bash"),
            }),
        )
        .await;
    assert_eq!(response["subtype"], "error");
    assert!(
        response["error"]
            .as_str()
            .unwrap()
            .contains("No hook callback found for ID: hook_7")
    );
}

#[tokio::test]
async fn failing_hook_does_not_stop_dispatch() {
    let options = QueryOptions::new().hook(
        HookEvent::PreToolUse,
        HookMatcher::any().hook_fn(|_, _, _| async { Err(CallbackError::failed("hook exploded")) }),
    );
    let (query, _transport, mut agent) = connect(options);
    let mut messages = query.messages().unwrap();

    let response = agent
        .call(
            "cli_3",
            json!({"subtype": "hook_callback", "callback_id": "hook_0", "input": pre_tool_use_input("Read")}),
        )
        .await;
    assert_eq!(response["subtype"], "error");
    assert!(response["error"].as_str().unwrap().contains("hook exploded"));

    agent.send(json!({"type": "system"}));
    assert_eq!(messages.next().await.unwrap().unwrap()["type"], "system");
}

// ---------------------------------------------------------------------------
// Permission callback
// ---------------------------------------------------------------------------

struct AllowList {
    allowed: Vec<&'static str>,
}

impl PermissionCallback for AllowList {
    fn can_use_tool<'a>(
        &'a self,
        tool_name: &'a str,
        input: &'a Value,
        context: ToolPermissionContext,
    ) -> BoxFuture<'a, Result<PermissionResult, CallbackError>> {
        Box::pin(async move {
            if !self.allowed.contains(&tool_name) {
                return Ok(PermissionResult::Deny {
                    message: format!("{tool_name} is not allowed"),
                    interrupt: context.blocked_path.is_some(),
                });
            }
            let mut updated = input.clone();
            updated["checked"] = json!(true);
            Ok(PermissionResult::Allow {
                updated_input: Some(updated),
                updated_permissions: context.suggestions,
            })
        })
    }
}

#[tokio::test]
async fn can_use_tool_allow_rewrites_input() {
    let options = QueryOptions::new().can_use_tool(AllowList {
        allowed: vec!["Read"],
    });
    let (_query, _transport, mut agent) = connect(options);

    let response = agent
        .call(
            "cli_4",
            json!({
                "subtype": "can_use_tool",
                "tool_name": "Read",
                "input": {"path": "a.txt"},
                "permission_suggestions": [
                    {"type": "setMode", "mode": "acceptEdits", "destination": "session"},
                    {"type": "somethingNew"}
                ],
            }),
        )
        .await;

    assert_eq!(response["subtype"], "success");
    assert_eq!(
        response["response"],
        json!({
            "behavior": "allow",
            "updatedInput": {"path": "a.txt", "checked": true},
            "updatedPermissions": [
                {"type": "setMode", "mode": "acceptEdits", "destination": "session"}
            ],
        })
    );
}

#[tokio::test]
async fn can_use_tool_deny() {
    let options = QueryOptions::new().can_use_tool(AllowList {
        allowed: vec!["Read"],
    });
    let (_query, _transport, mut agent) = connect(options);

    let response = agent
        .call(
            "cli_5",
            json!({
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "ls"},
                "blocked_path": "/etc",
            }),
        )
        .await;

    assert_eq!(
        response["response"],
        json!({"behavior": "deny", "message": "Bash is not allowed", "interrupt": true})
    );
}

#[tokio::test]
async fn can_use_tool_without_callback_fails() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new());
    let response = agent
        .call(
            "cli_6",
            json!({"subtype": "can_use_tool", "tool_name": "Bash", "input": {}}),
        )
        .await;
    assert_eq!(response["subtype"], "error");
    assert_eq!(response["error"], "canUseTool callback is not provided");
}

#[tokio::test]
async fn unsupported_subtype_is_an_error_response() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new());
    let response = agent.call("cli_7", json!({"subtype": "teleport"})).await;
    assert_eq!(response["subtype"], "error");
    assert_eq!(
        response["error"],
        "Unsupported control request subtype: teleport"
    );
}

#[tokio::test]
async fn control_request_without_subtype_is_an_error_response() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new());
    let response = agent.call("cli_x", json!({"tool_name": "Bash"})).await;
    assert_eq!(response["subtype"], "error");
    assert_eq!(
        response["error"],
        "Invalid control request: request has no subtype"
    );

    // Dispatch keeps going after the malformed request
    let response = agent.call("cli_y", json!({"subtype": "teleport"})).await;
    assert_eq!(response["subtype"], "error");
}

// ---------------------------------------------------------------------------
// Embedded tool servers
// ---------------------------------------------------------------------------

fn calculator() -> SdkMcpServer {
    SdkMcpServer::new("calc", "1.2.0")
        .tool(SdkTool::from_fn(
            "add",
            "Add two numbers",
            json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}),
            |args: Value| async move {
                let a = args["a"].as_f64().unwrap_or_default();
                let b = args["b"].as_f64().unwrap_or_default();
                Ok(ToolOutput::text(format!("{}", a + b)))
            },
        ))
        .tool(SdkTool::from_fn(
            "divide",
            "Divide two numbers",
            json!({"type": "object"}),
            |args: Value| async move {
                if args["b"] == json!(0) {
                    return Ok(ToolOutput::error("division by zero"));
                }
                Err(ToolError::ExecutionFailed("not implemented".into()))
            },
        ))
}

#[tokio::test]
async fn mcp_message_for_unknown_server_is_method_not_found() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new().mcp_server(calculator()));
    let response = agent
        .call(
            "cli_8",
            json!({
                "subtype": "mcp_message",
                "server_name": "ghost",
                "message": {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
            }),
        )
        .await;

    // The outer control response succeeds; the embedded reply carries the error.
    assert_eq!(response["subtype"], "success");
    let reply = &response["response"]["mcp_response"];
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["error"]["code"], -32601);
    assert!(reply["error"]["message"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn mcp_tools_call_round_trip() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new().mcp_server(calculator()));

    let response = agent
        .call(
            "cli_9",
            json!({
                "subtype": "mcp_message",
                "server_name": "calc",
                "message": {
                    "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                    "params": {"name": "add", "arguments": {"a": 2, "b": 3}}
                },
            }),
        )
        .await;
    assert_eq!(
        response["response"]["mcp_response"],
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"content": [{"type": "text", "text": "5"}]},
        })
    );

    let response = agent
        .call(
            "cli_10",
            json!({
                "subtype": "mcp_message",
                "server_name": "calc",
                "message": {
                    "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                    "params": {"name": "divide", "arguments": {"a": 1, "b": 0}}
                },
            }),
        )
        .await;
    let result = &response["response"]["mcp_response"]["result"];
    assert_eq!(result["isError"], true);
    assert_eq!(result["content"][0]["text"], "division by zero");

    let response = agent
        .call(
            "cli_11",
            json!({
                "subtype": "mcp_message",
                "server_name": "calc",
                "message": {
                    "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                    "params": {"name": "multiply", "arguments": {}}
                },
            }),
        )
        .await;
    let error = &response["response"]["mcp_response"]["error"];
    assert_eq!(error["code"], -32601);
    assert!(error["message"].as_str().unwrap().contains("multiply"));
}

#[tokio::test]
async fn mcp_initialize_reports_server_info() {
    let (_query, _transport, mut agent) = connect(QueryOptions::new().mcp_server(calculator()));
    let response = agent
        .call(
            "cli_12",
            json!({
                "subtype": "mcp_message",
                "server_name": "calc",
                "message": {"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}},
            }),
        )
        .await;
    let result = &response["response"]["mcp_response"]["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"], json!({"name": "calc", "version": "1.2.0"}));
}

// ---------------------------------------------------------------------------
// Data path & lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn result_latch_set_once_and_every_result_forwarded() {
    let (query, _transport, agent) = connect(QueryOptions::new());
    let mut messages = query.messages().unwrap();
    assert!(!query.result_observed());

    agent.send(json!({"type": "assistant"}));
    agent.send(json!({"type": "result", "n": 1}));
    agent.send(json!({"type": "result", "n": 2}));
    agent.send(json!({"type": "control_cancel_request", "request_id": "x"}));

    assert_eq!(messages.next().await.unwrap().unwrap()["type"], "assistant");
    assert_eq!(messages.next().await.unwrap().unwrap()["n"], 1);
    assert!(query.result_observed());
    assert_eq!(messages.next().await.unwrap().unwrap()["n"], 2);
    assert!(query.result_observed());
    assert!(query.wait_for_result(Duration::from_millis(10)).await);
}

#[tokio::test]
async fn transport_error_aborts_pending_and_ends_stream() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());
    let mut messages = query.messages().unwrap();

    let waiter = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.interrupt().await }
    });
    let _request = agent.recv().await;
    agent
        .to_client
        .send(Err(TransportError::ProcessExited { code: Some(1) }))
        .unwrap();

    match waiter.await.unwrap() {
        Err(TetherError::Aborted { subtype, reason }) => {
            assert_eq!(subtype, "interrupt");
            assert!(reason.contains("exited"), "reason: {reason}");
        }
        other => panic!("Expected Aborted, got {other:?}"),
    }
    match messages.next().await {
        Some(Err(TetherError::Transport(TransportError::ProcessExited { code }))) => {
            assert_eq!(code, Some(1))
        }
        other => panic!("Expected transport error, got {other:?}"),
    }
    assert!(messages.next().await.is_none());
}

#[tokio::test]
async fn stream_end_closes_data_channel() {
    let (query, _transport, agent) = connect(QueryOptions::new());
    let mut messages = query.messages().unwrap();
    agent.send(json!({"type": "user"}));
    drop(agent);

    assert!(messages.next().await.unwrap().is_ok());
    assert!(messages.next().await.is_none());
}

#[tokio::test]
async fn close_is_idempotent() {
    let (query, transport, _agent) = connect(QueryOptions::new());
    let mut messages = query.messages().unwrap();

    query.close().await.unwrap();
    query.close().await.unwrap();

    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    assert!(messages.next().await.is_none());
    assert!(matches!(
        query.mcp_status().await,
        Err(TetherError::Closed)
    ));
}

#[tokio::test]
async fn close_aborts_outstanding_requests() {
    let (query, _transport, mut agent) = connect(QueryOptions::new());
    let waiter = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.mcp_status().await }
    });
    let _request = agent.recv().await;
    query.close().await.unwrap();

    assert!(matches!(
        waiter.await.unwrap(),
        Err(TetherError::Cancelled { .. } | TetherError::Aborted { .. })
    ));
    assert_eq!(query.pending_requests().await, 0);
}

#[tokio::test]
async fn stream_input_without_callbacks_ends_input_immediately() {
    let (query, transport, mut agent) = connect(QueryOptions::new());

    let input = stream::iter(vec![json!({"type": "user", "n": 1}), json!({"type": "user", "n": 2})]);
    query.stream_input(input).await.unwrap();

    assert_eq!(agent.recv().await["n"], 1);
    assert_eq!(agent.recv().await["n"], 2);
    assert!(transport.input_ended.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stream_input_waits_for_result_when_hooks_registered() {
    let options = QueryOptions::new()
        .hook(
            HookEvent::Stop,
            HookMatcher::any().hook_fn(|_, _, _| async { Ok(HookOutput::default()) }),
        )
        .config(ControlConfig {
            stream_close_timeout: Duration::from_secs(5),
            ..ControlConfig::default()
        });
    let (query, transport, mut agent) = connect(options);

    let streaming = tokio::spawn({
        let query = Arc::clone(&query);
        async move {
            query
                .stream_input(stream::iter(vec![json!({"type": "user"})]))
                .await
        }
    });

    assert_eq!(agent.recv().await["type"], "user");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!transport.input_ended.load(Ordering::SeqCst));

    agent.send(json!({"type": "result", "subtype": "success"}));
    streaming.await.unwrap().unwrap();
    assert!(transport.input_ended.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stream_input_gives_up_after_close_timeout() {
    let options = QueryOptions::new()
        .mcp_server(calculator())
        .config(ControlConfig {
            stream_close_timeout: Duration::from_millis(30),
            ..ControlConfig::default()
        });
    let (query, transport, _agent) = connect(options);

    query.stream_input(stream::empty()).await.unwrap();
    assert!(!query.result_observed());
    assert!(transport.input_ended.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stream_input_ends_input_on_cancellation() {
    // Registered hooks would normally hold input open for a result
    let options = QueryOptions::new()
        .hook(
            HookEvent::Stop,
            HookMatcher::any().hook_fn(|_, _, _| async { Ok(HookOutput::default()) }),
        )
        .config(ControlConfig {
            stream_close_timeout: Duration::from_secs(30),
            ..ControlConfig::default()
        });
    let (query, transport, _agent) = connect(options);

    let streaming = tokio::spawn({
        let query = Arc::clone(&query);
        async move { query.stream_input(stream::pending::<Value>()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!transport.input_ended.load(Ordering::SeqCst));

    query.cancellation_token().cancel();
    tokio::time::timeout(Duration::from_secs(5), streaming)
        .await
        .expect("stream_input did not stop on cancellation")
        .unwrap()
        .unwrap();
    assert!(transport.input_ended.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stream_input_ends_input_when_a_write_fails() {
    let (query, transport, agent) = connect(QueryOptions::new());
    let Agent {
        to_client: _to_client,
        from_client,
    } = agent;
    drop(from_client);

    let result = query
        .stream_input(stream::iter(vec![json!({"type": "user"})]))
        .await;
    assert!(matches!(
        result,
        Err(TetherError::Transport(TransportError::NotReady))
    ));
    assert!(transport.input_ended.load(Ordering::SeqCst));
}
