//! Control dispatcher: classifies inbound objects and answers inbound
//! control requests.

use crate::query::{DataMessage, Shared};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tether_hooks::{HookContext, ToolPermissionContext};
use tether_types::{
    ControlResponse, DispatchError, InboundControlRequest, MessageKind, TetherError,
    TransportStream,
};
use tokio::sync::mpsc;

#[derive(Deserialize)]
struct CanUseToolRequest {
    tool_name: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    permission_suggestions: Option<Vec<Value>>,
    #[serde(default)]
    blocked_path: Option<String>,
}

#[derive(Deserialize)]
struct HookCallbackRequest {
    callback_id: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    tool_use_id: Option<String>,
}

#[derive(Deserialize)]
struct McpMessageRequest {
    server_name: String,
    message: Value,
}

/// Drive the classification loop until the transport ends, fails, or the
/// session is cancelled. Dropping `tx` on return closes the data channel.
pub(crate) async fn read_loop(
    shared: Arc<Shared>,
    mut stream: TransportStream,
    tx: mpsc::Sender<DataMessage>,
) {
    let mut abort_reason = "message stream ended".to_string();

    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => {
                abort_reason = "session cancelled".to_string();
                break;
            }
            next = stream.next() => next,
        };

        let message = match next {
            None => break,
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::warn!("Transport failed: {e}");
                abort_reason = e.to_string();
                let aborted = shared.pending.abort_all(&abort_reason).await;
                if aborted > 0 {
                    tracing::debug!("Aborted {aborted} pending control requests");
                }
                tokio::select! {
                    _ = shared.cancel.cancelled() => {}
                    _ = tx.send(Err(TetherError::Transport(e))) => {}
                }
                break;
            }
        };

        match MessageKind::of(&message) {
            MessageKind::ControlResponse => match ControlResponse::from_envelope(&message) {
                Ok(response) => {
                    let id = response.request_id().to_string();
                    if !shared.pending.resolve(response).await {
                        tracing::debug!("Discarding control response for unknown request {id}");
                    }
                }
                Err(e) => tracing::warn!("Malformed control response: {e}"),
            },
            MessageKind::ControlRequest => {
                match serde_json::from_value::<InboundControlRequest>(message) {
                    Ok(request) => {
                        tokio::spawn(handle_control_request(Arc::clone(&shared), request));
                    }
                    Err(e) => tracing::warn!("Malformed control request: {e}"),
                }
            }
            MessageKind::ControlCancelRequest => {
                tracing::debug!("Ignoring control_cancel_request");
            }
            MessageKind::Data { is_result } => {
                if is_result && shared.mark_result_observed() {
                    tracing::info!("First result message observed");
                }
                tokio::select! {
                    _ = shared.cancel.cancelled() => {
                        abort_reason = "session cancelled".to_string();
                        break;
                    }
                    sent = tx.send(Ok(message)) => {
                        if sent.is_err() {
                            tracing::debug!("Data receiver dropped; continuing control dispatch");
                        }
                    }
                }
            }
        }
    }

    // No response can arrive once the loop is gone.
    shared.pending.abort_all(&abort_reason).await;
    tracing::debug!("Message reader stopped: {abort_reason}");
}

/// Answer one inbound control request and write the response back.
///
/// Runs on its own task; failures are reported to the agent as an
/// error-tagged response and never reach the read loop.
pub(crate) async fn handle_control_request(shared: Arc<Shared>, request: InboundControlRequest) {
    let request_id = request.request_id.clone();
    let response = match answer(&shared, request).await {
        Ok(payload) => ControlResponse::success(request_id, payload),
        Err(e) => {
            tracing::debug!("Control request {request_id} failed: {e}");
            ControlResponse::error(request_id, e.to_string())
        }
    };

    match serde_json::to_string(&response.into_envelope()) {
        Ok(line) => {
            if let Err(e) = shared.transport.write(&format!("{line}\n")).await {
                tracing::warn!("Failed to send control response: {e}");
            }
        }
        Err(e) => tracing::error!("Failed to serialize control response: {e}"),
    }
}

/// Compute the success payload for an inbound control request.
pub(crate) async fn answer(
    shared: &Shared,
    request: InboundControlRequest,
) -> Result<Value, DispatchError> {
    let subtype = request
        .subtype()
        .ok_or_else(|| DispatchError::InvalidRequest("request has no subtype".into()))?
        .to_string();

    match subtype.as_str() {
        "can_use_tool" => {
            let req: CanUseToolRequest = parse_body(&subtype, request.request)?;
            let callback = shared
                .can_use_tool
                .as_ref()
                .ok_or(DispatchError::NoPermissionCallback)?;
            let context = ToolPermissionContext::from_raw(
                req.permission_suggestions.unwrap_or_default(),
                req.blocked_path,
            );
            let result = callback
                .can_use_tool(&req.tool_name, &req.input, context)
                .await?;
            Ok(result.to_wire(&req.input)?)
        }
        "hook_callback" => {
            let req: HookCallbackRequest = parse_body(&subtype, request.request)?;
            let ctx = HookContext {
                cancel: shared.cancel.child_token(),
            };
            shared
                .callbacks
                .invoke(&req.callback_id, req.input, req.tool_use_id, ctx)
                .await
        }
        "mcp_message" => {
            let req: McpMessageRequest = parse_body(&subtype, request.request)?;
            let reply = shared.router.handle(&req.server_name, req.message).await;
            Ok(json!({"mcp_response": reply}))
        }
        _ => Err(DispatchError::UnsupportedSubtype { subtype }),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(
    subtype: &str,
    body: Value,
) -> Result<T, DispatchError> {
    serde_json::from_value(body)
        .map_err(|e| DispatchError::InvalidRequest(format!("malformed {subtype} request: {e}")))
}
