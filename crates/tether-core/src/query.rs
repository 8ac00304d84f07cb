//! The control-protocol session: request/response engine plus lifecycle.

use crate::dispatch;
use crate::options::QueryOptions;
use crate::pending::PendingRequests;
use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tether_config::ControlConfig;
use tether_hooks::{CallbackRegistry, PermissionCallback};
use tether_mcp::McpRouter;
use tether_types::{
    ControlRequest, ControlRequestEnvelope, ControlResponse, PermissionMode, TetherError,
    Transport, TransportError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the data-message channel.
pub const DATA_CHANNEL_CAPACITY: usize = 100;

/// One item of the data-message sequence: a forwarded message, or the
/// terminal error that ended the session.
pub type DataMessage = Result<Value, TetherError>;

/// The caller-facing data-message sequence.
pub type MessageStream = Pin<Box<dyn Stream<Item = DataMessage> + Send>>;

/// State shared between the caller-facing [`Query`], the read loop and the
/// per-request handler tasks.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pending: PendingRequests,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) router: McpRouter,
    pub(crate) can_use_tool: Option<Arc<dyn PermissionCallback>>,
    pub(crate) config: ControlConfig,
    pub(crate) streaming: bool,
    pub(crate) cancel: CancellationToken,
    request_counter: AtomicU64,
    result_seen: watch::Sender<bool>,
}

impl Shared {
    /// Latch the "terminal result observed" flag. Returns `true` only for the
    /// call that flipped it.
    pub(crate) fn mark_result_observed(&self) -> bool {
        self.result_seen.send_if_modified(|seen| {
            if *seen {
                false
            } else {
                *seen = true;
                true
            }
        })
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("req_{n}_{:08x}", rand::random::<u32>())
    }
}

/// A control-protocol session with one agent process.
///
/// Call [`start`](Query::start) to begin reading, then
/// [`initialize`](Query::initialize) to perform the handshake. Data messages
/// are consumed through [`messages`](Query::messages); control operations
/// may be issued concurrently from any task holding a reference.
pub struct Query {
    shared: Arc<Shared>,
    messages_tx: Mutex<Option<mpsc::Sender<DataMessage>>>,
    messages_rx: Mutex<Option<mpsc::Receiver<DataMessage>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    init_result: OnceLock<Value>,
    closed: AtomicBool,
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

impl Query {
    pub fn new(transport: Arc<dyn Transport>, options: QueryOptions) -> Self {
        let callbacks = CallbackRegistry::build(&options.hooks);
        let router = McpRouter::new(options.mcp_servers);
        let (tx, rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (result_seen, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                transport,
                pending: PendingRequests::new(),
                callbacks,
                router,
                can_use_tool: options.can_use_tool,
                config: options.config,
                streaming: options.streaming,
                cancel: CancellationToken::new(),
                request_counter: AtomicU64::new(1),
                result_seen,
            }),
            messages_tx: Mutex::new(Some(tx)),
            messages_rx: Mutex::new(Some(rx)),
            reader: Mutex::new(None),
            initialized: AtomicBool::new(false),
            init_result: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Spawn the classification loop over the transport's inbound messages.
    pub fn start(&self) -> Result<(), TetherError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TetherError::Closed);
        }
        let tx = lock(&self.messages_tx)
            .take()
            .ok_or(TetherError::AlreadyStarted)?;
        let stream = match self.shared.transport.read_messages() {
            Ok(stream) => stream,
            Err(e) => {
                *lock(&self.messages_tx) = Some(tx);
                return Err(e.into());
            }
        };

        let handle = tokio::spawn(dispatch::read_loop(Arc::clone(&self.shared), stream, tx));
        *lock(&self.reader) = Some(handle);
        tracing::debug!("Message reader started");
        Ok(())
    }

    /// Take the data-message sequence. Available once per session.
    ///
    /// The stream ends when the session closes or the transport finishes; an
    /// abnormal end is reported as a final `Err` item.
    pub fn messages(&self) -> Result<MessageStream, TetherError> {
        let rx = lock(&self.messages_rx)
            .take()
            .ok_or(TetherError::Transport(TransportError::StreamTaken))?;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(Box::pin(stream))
    }

    /// Issue a control request and wait for its response.
    ///
    /// Exactly one of delivery, timeout or cancellation settles the request.
    /// Returns the response payload, or `{}` when the agent sent none.
    pub async fn request(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<Value, TetherError> {
        if !self.shared.streaming {
            return Err(TetherError::NotStreaming);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TetherError::Closed);
        }

        let subtype = request.subtype();
        let request_id = self.shared.next_request_id();
        let line = serde_json::to_string(&ControlRequestEnvelope::new(&request_id, &request))?;

        let rx = self.shared.pending.register(request_id.clone(), subtype).await;
        if let Err(e) = self.shared.transport.write(&format!("{line}\n")).await {
            self.shared.pending.remove(&request_id).await;
            return Err(e.into());
        }
        tracing::debug!("Sent control request {request_id} ({subtype})");

        let outcome = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => {
                self.shared.pending.remove(&request_id).await;
                return Err(TetherError::Cancelled {
                    subtype: subtype.to_string(),
                });
            }
            outcome = tokio::time::timeout(timeout, rx) => outcome,
        };

        match outcome {
            Err(_) => {
                self.shared.pending.remove(&request_id).await;
                tracing::warn!(
                    "Control request {request_id} ({subtype}) timed out after {:?}",
                    timeout
                );
                Err(TetherError::Timeout {
                    subtype: subtype.to_string(),
                    timeout_ms: millis(timeout),
                })
            }
            Ok(Err(_)) => Err(TetherError::Aborted {
                subtype: subtype.to_string(),
                reason: "response slot dropped".to_string(),
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(ControlResponse::Error { error, .. }))) => Err(TetherError::Remote {
                subtype: subtype.to_string(),
                message: error,
            }),
            Ok(Ok(Ok(ControlResponse::Success { response, .. }))) => {
                Ok(response.unwrap_or_else(|| json!({})))
            }
        }
    }

    /// Perform the initialize handshake, registering hook callback ids with
    /// the agent. Returns `None` outside streaming mode.
    pub async fn initialize(&self) -> Result<Option<Value>, TetherError> {
        if !self.shared.streaming {
            return Ok(None);
        }

        let request = ControlRequest::Initialize {
            hooks: self.shared.callbacks.handshake_config().cloned(),
        };
        let result = self
            .request(request, self.shared.config.initialize_timeout)
            .await?;

        // A repeated handshake keeps the first result.
        let _ = self.init_result.set(result.clone());
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            "Control protocol initialized ({} hook callbacks, tool servers: {:?})",
            self.shared.callbacks.len(),
            self.shared.router.server_names()
        );
        Ok(Some(result))
    }

    pub async fn interrupt(&self) -> Result<(), TetherError> {
        self.request(ControlRequest::Interrupt, self.shared.config.request_timeout)
            .await
            .map(drop)
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), TetherError> {
        self.request(
            ControlRequest::SetPermissionMode { mode },
            self.shared.config.request_timeout,
        )
        .await
        .map(drop)
    }

    /// Switch the agent's model; `None` restores its default.
    pub async fn set_model(&self, model: Option<&str>) -> Result<(), TetherError> {
        self.request(
            ControlRequest::SetModel {
                model: model.map(str::to_string),
            },
            self.shared.config.request_timeout,
        )
        .await
        .map(drop)
    }

    /// Rewind tracked files to their state at the given user message.
    pub async fn rewind_files(&self, user_message_id: &str) -> Result<(), TetherError> {
        self.request(
            ControlRequest::RewindFiles {
                user_message_id: user_message_id.to_string(),
            },
            self.shared.config.request_timeout,
        )
        .await
        .map(drop)
    }

    pub async fn mcp_status(&self) -> Result<Value, TetherError> {
        self.request(ControlRequest::McpStatus, self.shared.config.request_timeout)
            .await
    }

    /// Write one caller message to the agent.
    pub async fn send_message(&self, message: &Value) -> Result<(), TetherError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TetherError::Closed);
        }
        if !self.shared.transport.is_ready() {
            return Err(TransportError::NotReady.into());
        }
        let line = serde_json::to_string(message)?;
        self.shared.transport.write(&format!("{line}\n")).await?;
        Ok(())
    }

    /// Forward caller messages until `input` is exhausted or the session is
    /// cancelled, then end the agent's input.
    ///
    /// A failed write also ends the agent's input before the error is
    /// returned.
    ///
    /// With hooks or tool servers registered, exhaustion first waits up to the
    /// configured close timeout for a result so in-flight callback traffic is
    /// not cut off.
    pub async fn stream_input<S>(&self, input: S) -> Result<(), TetherError>
    where
        S: Stream<Item = Value> + Send,
    {
        let mut input = std::pin::pin!(input);
        let mut forwarded = 0usize;

        let cancelled = loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break true,
                next = input.next() => next,
            };
            match next {
                Some(message) => {
                    if let Err(e) = self.send_message(&message).await {
                        if let Err(end) = self.shared.transport.end_input().await {
                            tracing::warn!("Failed to end agent input: {end}");
                        }
                        return Err(e);
                    }
                    forwarded += 1;
                }
                None => break false,
            }
        };
        tracing::debug!("Input finished after {forwarded} messages (cancelled: {cancelled})");

        if !cancelled && (!self.shared.callbacks.is_empty() || !self.shared.router.is_empty()) {
            let timeout = self.shared.config.stream_close_timeout;
            if !self.wait_for_result(timeout).await {
                tracing::debug!("No result within {timeout:?}; ending input anyway");
            }
        }

        self.shared.transport.end_input().await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Payload returned by the agent for the initialize handshake.
    pub fn initialization_result(&self) -> Option<&Value> {
        self.init_result.get()
    }

    /// Whether a terminal `result` message has been observed.
    pub fn result_observed(&self) -> bool {
        *self.shared.result_seen.borrow()
    }

    /// Wait until a terminal result has been observed, the timeout elapses, or
    /// the session is cancelled. Returns whether the result was observed.
    pub async fn wait_for_result(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.result_seen.subscribe();
        let wait = async move { rx.wait_for(|seen| *seen).await.is_ok() };
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => self.result_observed(),
            seen = tokio::time::timeout(timeout, wait) => seen.unwrap_or(false),
        }
    }

    /// Token cancelled when the session closes; cancelling it externally
    /// abandons every suspended operation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Number of control requests still awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.len().await
    }

    /// Tear the session down. Safe to call more than once; only the first call
    /// does anything.
    pub async fn close(&self) -> Result<(), TetherError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.cancel.cancel();
        // Never started: close the data channel here instead.
        drop(lock(&self.messages_tx).take());

        let reader = lock(&self.reader).take();
        if let Some(handle) = reader {
            if let Err(e) = handle.await {
                tracing::warn!("Message reader task failed: {e}");
            }
        }

        self.shared.pending.abort_all("session closed").await;
        self.shared.transport.close().await?;
        tracing::debug!("Session closed");
        Ok(())
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("streaming", &self.shared.streaming)
            .field("callbacks", &self.shared.callbacks)
            .field("initialized", &self.is_initialized())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
