use std::collections::HashMap;
use std::sync::RwLock;

use sandboxd_wire::HostMessage;
use tokio::sync::oneshot;

/// Correlated-reply table: `request_id -> single-slot delivery channel`.
/// Preferred over a per-host FIFO because daemon replies are intentionally
/// out of order with respect to issuance (a long-running command can
/// interleave with a fast heartbeat-adjacent reply).
#[derive(Default)]
pub struct PendingRequests {
    inner: RwLock<HashMap<String, oneshot::Sender<HostMessage>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `request_id`, returning the receiving half.
    pub fn insert(&self, request_id: String) -> oneshot::Receiver<HostMessage> {
        let (tx, rx) = oneshot::channel();
        self.inner.write().unwrap().insert(request_id, tx);
        rx
    }

    pub fn remove(&self, request_id: &str) {
        self.inner.write().unwrap().remove(request_id);
    }

    /// Loads-and-deletes the waiter for `request_id` and delivers `msg`.
    /// Returns `false` (and drops `msg`) if no one is waiting, which the
    /// caller logs rather than treating as an error. The channel send never
    /// blocks: it is buffered for exactly one value.
    pub fn deliver(&self, request_id: &str, msg: HostMessage) -> bool {
        let waiter = self.inner.write().unwrap().remove(request_id);
        match waiter {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Removes a pending entry on drop so every exit path out of `SendAndWait`
/// (reply, timeout, or the caller's future being dropped) leaves
/// `pending_requests` empty for that id.
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    request_id: String,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests, request_id: String) -> Self {
        Self { pending, request_id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}
