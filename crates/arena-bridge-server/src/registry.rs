/// Response Channel Table + in-flight request metadata (spec C2, §9 "combine
/// channel and metadata under one lock to make cleanup atomic"). One
/// `std::sync::Mutex<HashMap<...>>` backs both the per-request mpsc sender and
/// everything recovery needs to replay a request, so opening, delivering to,
/// and closing a request's channel can never observe the two halves out of
/// sync with each other.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use arena_bridge_common::upstream::FrameData;

const CHANNEL_CAPACITY: usize = 256;

struct RequestEntry {
    tx: mpsc::Sender<FrameData>,
    /// The forward-translated upstream task, kept so a reconnect can re-send
    /// the exact frame that was already in flight (spec §4.8).
    task_payload: serde_json::Value,
    opened_at: Instant,
}

#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<Uuid, RequestEntry>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a Response Channel and records metadata in the same critical
    /// section. Returns the receiving half; the sender lives in the table.
    pub fn open(&self, request_id: Uuid, task_payload: serde_json::Value) -> mpsc::Receiver<FrameData> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let entry = RequestEntry {
            tx,
            task_payload,
            opened_at: Instant::now(),
        };
        let mut guard = self.inner.lock().expect("registry mutex poisoned");
        guard.insert(request_id, entry);
        rx
    }

    /// Delivers a frame to the request's channel. Returns `false` if the
    /// request is unknown (already closed, or never opened) — callers treat
    /// this as "drop the frame", never as an error.
    pub async fn put(&self, request_id: Uuid, frame: FrameData) -> bool {
        let sender = {
            let guard = self.inner.lock().expect("registry mutex poisoned");
            match guard.get(&request_id) {
                Some(entry) => entry.tx.clone(),
                None => return false,
            }
        };
        sender.send(frame).await.is_ok()
    }

    /// Removes the channel and its metadata atomically. Safe to call more
    /// than once; the second call is a no-op.
    pub fn close(&self, request_id: Uuid) {
        let mut guard = self.inner.lock().expect("registry mutex poisoned");
        guard.remove(&request_id);
    }

    pub fn task_payload_for(&self, request_id: Uuid) -> Option<serde_json::Value> {
        let guard = self.inner.lock().expect("registry mutex poisoned");
        guard.get(&request_id).map(|e| e.task_payload.clone())
    }

    /// Every request id still open, for recovery's reconnect sweep and the
    /// metadata sweeper.
    pub fn open_ids(&self) -> Vec<Uuid> {
        let guard = self.inner.lock().expect("registry mutex poisoned");
        guard.keys().copied().collect()
    }

    /// Evicts and returns ids whose metadata has outlived `timeout`, draining
    /// each one's channel with a timeout error first (spec §4.9 sweeper).
    pub async fn sweep_expired(&self, timeout: std::time::Duration) {
        let expired: Vec<Uuid> = {
            let guard = self.inner.lock().expect("registry mutex poisoned");
            guard
                .iter()
                .filter(|(_, e)| e.opened_at.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            warn!(request_id = %id, "evicting request whose metadata exceeded the timeout");
            self.put(
                id,
                FrameData::Advisory(arena_bridge_common::upstream::Advisory::Error(
                    arena_bridge_common::upstream::ErrorAdvisory {
                        error: "request metadata expired before completion".to_string(),
                        final_error: true,
                    },
                )),
            )
            .await;
            self.put(id, FrameData::Done(arena_bridge_common::upstream::DoneMarker))
                .await;
            self.close(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_put_close_round_trip() {
        let registry = RequestRegistry::new();
        let id = Uuid::new_v4();
        let mut rx = registry.open(id, serde_json::json!({"task": true}));

        assert!(registry.put(id, FrameData::Chunk("a0:\"hi\"\n".to_string())).await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, FrameData::Chunk("a0:\"hi\"\n".to_string()));

        assert_eq!(registry.task_payload_for(id), Some(serde_json::json!({"task": true})));
        registry.close(id);
        assert_eq!(registry.task_payload_for(id), None);
    }

    #[tokio::test]
    async fn put_to_unknown_request_returns_false() {
        let registry = RequestRegistry::new();
        assert!(!registry.put(Uuid::new_v4(), FrameData::Chunk("x".to_string())).await);
    }

    #[tokio::test]
    async fn sweep_expired_drains_and_closes() {
        let registry = RequestRegistry::new();
        let id = Uuid::new_v4();
        let mut rx = registry.open(id, serde_json::json!({}));

        registry.sweep_expired(std::time::Duration::from_secs(0)).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, FrameData::Advisory(_)));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, FrameData::Done(_)));
        assert_eq!(registry.task_payload_for(id), None);
    }
}

