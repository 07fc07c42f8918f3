//! Teardown acknowledgment protocol for destructive operations.
//!
//! Kill is fire-and-forget: [`crate::vm::Vm::kill`] returns as soon as the
//! asynchronous teardown task is started, and the task signals completion
//! by sending the instance id exactly once. Each kill invocation owns its
//! own channel (a [`KillBatch`]), so acknowledgments can never be stolen
//! by an unrelated kill that happens to be in flight at the same time.
//!
//! The wait loop is best effort: on timeout the unacknowledged ids are
//! returned for logging and the receiver is dropped. An instance may still
//! finish teardown afterwards; its late ack lands on a closed channel and
//! is discarded.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Default wait for teardown acknowledgments after a kill dispatch.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sending half handed to each instance targeted by a kill.
///
/// The producer contract is exactly one ack per initiated teardown, sent
/// when teardown completes (successfully or not).
#[derive(Debug, Clone)]
pub struct AckSender {
    tx: mpsc::UnboundedSender<u32>,
}

impl AckSender {
    /// Signal that the instance with `id` has finished tearing down.
    pub fn ack(&self, id: u32) {
        // The waiter may already have timed out and dropped the
        // receiver; a late ack is discarded.
        let _ = self.tx.send(id);
    }
}

/// Per-invocation acknowledgment channel for one kill dispatch.
#[derive(Debug)]
pub struct KillBatch {
    tx: mpsc::UnboundedSender<u32>,
    rx: mpsc::UnboundedReceiver<u32>,
}

impl KillBatch {
    /// Create a fresh acknowledgment channel.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Get a sender to hand to a targeted instance.
    pub fn ack_sender(&self) -> AckSender {
        AckSender {
            tx: self.tx.clone(),
        }
    }

    /// Receive acknowledgments until `pending` empties or `timeout`
    /// elapses, returning the ids that never acknowledged.
    ///
    /// Ids received that are not in `pending` are ignored. The deadline
    /// is fixed when the loop starts; it does not reset per ack.
    pub async fn wait(mut self, mut pending: HashSet<u32>, timeout: Duration) -> HashSet<u32> {
        // Drop our own sender so the channel closes once every teardown
        // task has released its clone.
        drop(self.tx);

        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(id)) => {
                    if pending.remove(&id) {
                        tracing::info!(id, "VM killed");
                    } else {
                        tracing::debug!(id, "ignoring acknowledgment for untracked VM");
                    }
                }
                Ok(None) => {
                    // Every sender is gone; nothing else can ack.
                    tracing::warn!(remaining = pending.len(), "ack channel closed early");
                    break;
                }
                Err(_) => {
                    tracing::error!("vm kill timeout");
                    break;
                }
            }
        }

        pending
    }
}

impl Default for KillBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_after_receiver_dropped_is_discarded() {
        let batch = KillBatch::new();
        let ack = batch.ack_sender();
        drop(batch);

        // Must not panic or block.
        ack.ack(3);
    }

    #[tokio::test]
    async fn wait_returns_once_all_acked() {
        let batch = KillBatch::new();
        let ack = batch.ack_sender();

        for id in [1, 2, 3] {
            ack.ack(id);
        }
        drop(ack);

        let pending: HashSet<u32> = [1, 2, 3].into();
        let unacked = batch.wait(pending, Duration::from_secs(5)).await;
        assert!(unacked.is_empty());
    }

    #[tokio::test]
    async fn wait_ignores_untracked_ids() {
        let batch = KillBatch::new();
        let ack = batch.ack_sender();

        ack.ack(99);
        ack.ack(1);
        drop(ack);

        let unacked = batch.wait([1].into(), Duration::from_secs(5)).await;
        assert!(unacked.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_and_reports_stragglers() {
        let batch = KillBatch::new();
        let ack = batch.ack_sender();

        ack.ack(1);

        let start = tokio::time::Instant::now();
        let unacked = batch.wait([1, 2].into(), Duration::from_millis(50)).await;
        drop(ack);

        assert_eq!(unacked, [2].into());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_stops_when_all_senders_drop() {
        let batch = KillBatch::new();
        let ack = batch.ack_sender();
        drop(ack);

        // No sender left: must return well before the timeout.
        let unacked = batch.wait([7].into(), Duration::from_secs(60)).await;
        assert_eq!(unacked, [7].into());
    }
}
