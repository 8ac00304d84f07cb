//! Pending-request table: correlates outbound control requests with their
//! eventual responses.

use std::collections::HashMap;
use tether_types::{ControlResponse, TetherError};
use tokio::sync::{Mutex, oneshot};

/// What a waiter eventually receives: the remote response, or an abort.
pub(crate) type Outcome = Result<ControlResponse, TetherError>;

struct PendingEntry {
    subtype: &'static str,
    tx: oneshot::Sender<Outcome>,
}

/// Map from request id to a one-shot delivery slot.
///
/// Every entry leaves the table exactly once: removal and lookup happen under
/// the same lock, so a response racing a timeout resolves at most one of them.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request and return the receiving half of its slot.
    pub async fn register(&self, id: String, subtype: &'static str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id, PendingEntry { subtype, tx });
        rx
    }

    /// Deliver a response to its waiter. Returns `false` when no request with
    /// that id is pending (already timed out, cancelled, or never issued).
    pub async fn resolve(&self, response: ControlResponse) -> bool {
        let entry = self.inner.lock().await.remove(response.request_id());
        match entry {
            Some(entry) => {
                // The waiter may have gone away between removal and send.
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Drop a request without resolving it. Returns whether it was present.
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.remove(id).is_some()
    }

    /// Fail every outstanding request with an abort carrying `reason`.
    pub async fn abort_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingEntry> = self.inner.lock().await.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(TetherError::Aborted {
                subtype: entry.subtype.to_string(),
                reason: reason.to_string(),
            }));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
