/// Pending Queue (spec C3, §4.7, §4.8): a bounded FIFO of requests whose
/// upstream task couldn't be sent yet because no agent was connected,
/// drained by a single long-running consumer task whenever a peer shows up.
/// Recovery (C8) reuses the same queue for reconnect replays, just without a
/// caller waiting on the outcome.
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tracing::{info, warn};
use uuid::Uuid;

use arena_bridge_common::error::BridgeError;
use arena_bridge_common::upstream::{Advisory, DoneMarker, ErrorAdvisory, FrameData};

use crate::state::AppState;

const QUEUE_CAPACITY: usize = 512;

pub enum PendingOutcome {
    Ready,
    Failed(BridgeError),
}

pub struct PendingEntry {
    pub request_id: Uuid,
    pub task_payload: serde_json::Value,
    pub deadline: Instant,
    /// `None` for reconnect replays, where nobody is awaiting the outcome
    /// directly — the original dispatcher task is already reading frames
    /// off the Response Channel instead.
    pub responder: Option<oneshot::Sender<PendingOutcome>>,
}

pub struct PendingQueue {
    tx: mpsc::Sender<PendingEntry>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<PendingEntry>>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Offers an entry onto the queue, itself bounded by `deadline` so a
    /// full queue doesn't block the caller forever.
    pub async fn offer(&self, entry: PendingEntry, deadline: Instant) -> Result<(), BridgeError> {
        match tokio::time::timeout_at(deadline.into(), self.tx.send(entry)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::RecoveryTimeout),
            Err(_) => Err(BridgeError::RecoveryTimeout),
        }
    }

    /// Takes ownership of the receiving half. Must be called exactly once,
    /// by the consumer task spawned in `main`.
    pub async fn take_receiver(&self) -> mpsc::Receiver<PendingEntry> {
        self.rx
            .lock()
            .await
            .take()
            .expect("pending queue receiver taken more than once")
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The single consumer task (spec §4.8: "a single replayer task that
/// activates on peer-connect"). Runs for the lifetime of the process.
pub async fn run_consumer(state: Arc<AppState>, mut rx: mpsc::Receiver<PendingEntry>) {
    while let Some(entry) = rx.recv().await {
        let outcome = dispatch_entry(&state, &entry).await;

        if let PendingOutcome::Failed(ref err) = outcome {
            warn!(request_id = %entry.request_id, error = %err, "pending entry failed, draining its channel");
            state
                .registry
                .put(
                    entry.request_id,
                    FrameData::Advisory(Advisory::Error(ErrorAdvisory {
                        error: err.to_string(),
                        final_error: true,
                    })),
                )
                .await;
            state.registry.put(entry.request_id, FrameData::Done(DoneMarker)).await;
        }

        if let Some(responder) = entry.responder {
            let _ = responder.send(outcome);
        }
    }
}

async fn dispatch_entry(state: &Arc<AppState>, entry: &PendingEntry) -> PendingOutcome {
    if Instant::now() >= entry.deadline {
        return PendingOutcome::Failed(BridgeError::RecoveryTimeout);
    }
    if !wait_for_peer_or_deadline(state, entry.deadline).await {
        return PendingOutcome::Failed(BridgeError::RecoveryTimeout);
    }
    match state.transport.send_task(entry.request_id, &entry.task_payload).await {
        Ok(()) => {
            info!(request_id = %entry.request_id, "pending entry sent to agent");
            PendingOutcome::Ready
        }
        Err(e) => PendingOutcome::Failed(e),
    }
}

async fn wait_for_peer_or_deadline(state: &Arc<AppState>, deadline: Instant) -> bool {
    // `Notify::notified()` only wakes waiters registered before the
    // corresponding `notify_waiters()` call, so a bare select! on it could
    // miss a connect that lands in the gap between `has_peer` and
    // `notified()`. A short poll interval closes that race without needing
    // a watch channel just for this.
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);
    loop {
        if state.transport.has_peer().await {
            return true;
        }
        tokio::select! {
            _ = state.transport.connected.notified() => continue,
            _ = tokio::time::sleep(POLL_INTERVAL) => continue,
            _ = sleep_until(deadline.into()) => return false,
        }
    }
}
