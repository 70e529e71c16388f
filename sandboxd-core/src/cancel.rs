//! The Rust expression of spec.md's "caller context": every orchestrator
//! verb accepts a `CancelSignal` and threads it into `send_and_wait`'s
//! three-way race (`reply`, `ctx.Done()`, `timeout`). Built on
//! `tokio::sync::watch`, the same single-producer/many-consumer primitive
//! `StreamHandler` already uses for its own cancellation (`cancel_fns`).

use tokio::sync::watch;

/// The caller-held half: cancelling it resolves every clone of the
/// matching `CancelSignal`'s `cancelled()` future.
#[derive(Clone)]
pub struct Cancel(watch::Sender<bool>);

impl Cancel {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), CancelSignal(rx))
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// The callee-held half, passed into `send_and_wait` and every
/// orchestrator verb built on it.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires, for call sites with no caller context to
    /// propagate. Used by detached compensating commands (spec.md §9: "the
    /// caller's context must not control compensating commands").
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    /// Resolves once this signal (or any clone sharing its `Cancel`) is
    /// cancelled; never resolves otherwise.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow() {
                return;
            }
            if self.0.changed().await.is_err() {
                // The `Cancel` half was dropped without ever cancelling;
                // this signal can now never fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let (cancel, mut signal) = Cancel::new();
        let waited = tokio::spawn(async move {
            signal.cancelled().await;
        });
        cancel.cancel();
        waited.await.unwrap();
    }

    #[tokio::test]
    async fn clones_all_observe_cancellation() {
        let (cancel, signal) = Cancel::new();
        let mut a = signal.clone();
        let mut b = signal;
        cancel.cancel();
        a.cancelled().await;
        b.cancelled().await;
    }

    #[tokio::test]
    async fn none_never_resolves() {
        let mut signal = CancelSignal::none();
        let raced = tokio::select! {
            _ = signal.cancelled() => "cancelled",
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => "timeout",
        };
        assert_eq!(raced, "timeout");
    }
}
