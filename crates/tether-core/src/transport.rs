//! Stdio transport to an agent subprocess.
//!
//! Spawns the agent and exchanges newline-delimited JSON over its
//! stdin/stdout through background reader and writer tasks.

use futures_util::stream;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_types::{BoxFuture, Transport, TransportError, TransportStream};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `close` waits for the agent to exit on its own before killing it.
const GRACEFUL_EXIT: Duration = Duration::from_secs(5);

/// How long the reader waits for an exit status after stdout closes.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

type Inbound = Result<Value, TransportError>;

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Async stdio transport for an agent process.
pub struct SubprocessTransport {
    write_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    child: Arc<tokio::sync::Mutex<Child>>,
}

impl SubprocessTransport {
    /// Spawn the agent process and start background reader/writer tasks.
    ///
    /// `max_buffer_size` caps a single inbound JSON message, including one
    /// split across several lines.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
        max_buffer_size: usize,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| TransportError::SpawnFailed {
            command: command.to_string(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdout was not piped"))?;
        let child = Arc::new(tokio::sync::Mutex::new(child));

        // Writer task: drains channel into child stdin
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = write_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::warn!("Failed to write to agent stdin: {e}");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    tracing::warn!("Failed to flush agent stdin: {e}");
                    break;
                }
            }
            // Dropping stdin closes the agent's input.
        });

        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(64);
        let reader_handle = tokio::spawn(read_stdout(
            stdout,
            inbound_tx,
            Arc::clone(&child),
            max_buffer_size,
        ));

        tracing::debug!("Spawned agent process '{command}'");
        Ok(Self {
            write_tx: Mutex::new(Some(write_tx)),
            inbound: Mutex::new(Some(inbound_rx)),
            reader_handle,
            writer_handle,
            child,
        })
    }
}

/// Reader task: split stdout into JSON objects and forward them.
async fn read_stdout(
    stdout: ChildStdout,
    tx: mpsc::Sender<Inbound>,
    child: Arc<tokio::sync::Mutex<Child>>,
    max_buffer_size: usize,
) {
    let mut reader = BufReader::new(stdout);
    let mut buffer = String::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        // Room for what the buffer can still take, the newline, and one byte
        // more so that an overlong line is detectable without reading it all.
        let limit = (max_buffer_size.saturating_sub(buffer.len()) + 2) as u64;
        match (&mut reader).take(limit).read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }

        let content = raw.strip_suffix(b"\n").unwrap_or(raw.as_slice());
        if buffer.len() + content.len() > max_buffer_size {
            let _ = tx
                .send(Err(TransportError::BufferOverflow {
                    max_bytes: max_buffer_size,
                }))
                .await;
            return;
        }

        let line = match std::str::from_utf8(content) {
            Ok(line) => line.trim(),
            Err(e) => {
                tracing::warn!("Skipping agent output that is not UTF-8: {e}");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        buffer.push_str(line);

        match serde_json::from_str::<Value>(&buffer) {
            Ok(message @ Value::Object(_)) => {
                buffer.clear();
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Ok(other) => {
                buffer.clear();
                tracing::debug!("Skipping non-object agent output: {other}");
            }
            // Object continues on the next line
            Err(e) if e.is_eof() => {}
            Err(e) => {
                tracing::warn!("Failed to parse agent output: {e}: {buffer}");
                buffer.clear();
            }
        }
    }

    let status = {
        let mut child = child.lock().await;
        tokio::time::timeout(EXIT_STATUS_WAIT, child.wait()).await
    };
    if let Ok(Ok(status)) = status {
        if !status.success() {
            let _ = tx
                .send(Err(TransportError::ProcessExited {
                    code: status.code(),
                }))
                .await;
        }
    }
}

impl Transport for SubprocessTransport {
    fn write<'a>(&'a self, line: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let tx = lock(&self.write_tx)
                .clone()
                .ok_or(TransportError::NotReady)?;
            tx.send(line.to_string())
                .await
                .map_err(|_| TransportError::NotReady)
        })
    }

    fn read_messages(&self) -> Result<TransportStream, TransportError> {
        let rx = lock(&self.inbound)
            .take()
            .ok_or(TransportError::StreamTaken)?;
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(Box::pin(stream))
    }

    fn end_input(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if lock(&self.write_tx).take().is_some() {
                tracing::debug!("Closed agent input");
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            drop(lock(&self.write_tx).take());

            let graceful = tokio::time::timeout(GRACEFUL_EXIT, async {
                let mut child = self.child.lock().await;
                child.wait().await
            })
            .await;

            match graceful {
                Ok(Ok(status)) => tracing::debug!("Agent process exited: {status}"),
                Ok(Err(e)) => tracing::warn!("Failed to wait for agent process: {e}"),
                Err(_) => {
                    tracing::warn!("Agent process did not exit in {GRACEFUL_EXIT:?}; killing");
                    let mut child = self.child.lock().await;
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill agent process: {e}");
                    }
                }
            }

            self.reader_handle.abort();
            self.writer_handle.abort();
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        lock(&self.write_tx).is_some() && !self.writer_handle.is_finished()
    }
}
