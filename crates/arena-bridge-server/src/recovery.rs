/// Disconnect recovery (spec C8, §4.8): when a new agent connection
/// replaces the old one, every Response Channel still open gets its
/// original upstream task re-offered onto the Pending Queue so the new
/// agent picks up where the old one left off. A request whose metadata has
/// already been evicted (or whose put-timeout expires) gets its channel
/// drained with an error instead of hanging forever.
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use arena_bridge_common::upstream::{Advisory, DoneMarker, ErrorAdvisory, FrameData};

use crate::pending::PendingEntry;
use crate::state::AppState;

/// Fired from the websocket handler every time a connection is accepted.
/// Spawns its own task so the handler isn't blocked re-offering a large
/// backlog before it starts reading inbound frames.
pub fn on_peer_reconnected(state: Arc<AppState>) {
    tokio::spawn(async move {
        state.verifying.store(false, std::sync::atomic::Ordering::SeqCst);
        let open_ids = state.registry.open_ids();
        if open_ids.is_empty() {
            return;
        }
        info!(count = open_ids.len(), "replaying in-flight requests to reconnected agent");
        for request_id in open_ids {
            let Some(task_payload) = state.registry.task_payload_for(request_id) else {
                continue;
            };
            let deadline = Instant::now() + state.config.pending_deadline();
            let entry = PendingEntry {
                request_id,
                task_payload,
                deadline,
                responder: None,
            };
            if state.pending.offer(entry, deadline).await.is_err() {
                warn!(request_id = %request_id, "put-timeout re-offering request onto the pending queue, draining with error");
                state
                    .registry
                    .put(
                        request_id,
                        FrameData::Advisory(Advisory::Error(ErrorAdvisory {
                            error: "could not replay request after reconnect".to_string(),
                            final_error: true,
                        })),
                    )
                    .await;
                state.registry.put(request_id, FrameData::Done(DoneMarker)).await;
                state.registry.close(request_id);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_bridge_common::config::AppConfig;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    #[tokio::test]
    async fn reconnect_resets_verifying_and_replays_open_requests() {
        let state = Arc::new(AppState::new(AppConfig::default()));
        state.verifying.store(true, Ordering::SeqCst);
        let request_id = Uuid::new_v4();
        state.registry.open(request_id, serde_json::json!({"task": true}));
        let mut pending_rx = state.pending.take_receiver().await;

        on_peer_reconnected(state.clone());

        let entry = pending_rx.recv().await.unwrap();
        assert_eq!(entry.request_id, request_id);
        assert!(entry.responder.is_none());
        assert!(!state.verifying.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reconnect_with_no_open_requests_is_a_no_op() {
        let state = Arc::new(AppState::new(AppConfig::default()));
        let mut pending_rx = state.pending.take_receiver().await;

        on_peer_reconnected(state.clone());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(pending_rx.try_recv().is_err());
        assert!(!state.verifying.load(Ordering::SeqCst));
    }
}
