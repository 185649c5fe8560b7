/// Transport Channel (spec C1): the single WebSocket the in-browser agent
/// holds open. A new connection always replaces whatever peer was previously
/// registered — there is only ever one agent, per spec §4.1 — and replacing
/// it is the signal Recovery (C8) uses to replay in-flight requests.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use arena_bridge_common::error::BridgeError;
use arena_bridge_common::upstream::FrameData;

use crate::state::AppState;

struct Peer {
    outbound: mpsc::UnboundedSender<Message>,
}

/// Holds at most one connected agent. `connected` is notified every time a
/// peer is accepted, which is what lets the Pending Queue consumer and
/// Recovery wake up instead of polling.
pub struct TransportChannel {
    peer: Mutex<Option<Peer>>,
    pub connected: Notify,
}

impl Default for TransportChannel {
    fn default() -> Self {
        Self {
            peer: Mutex::new(None),
            connected: Notify::new(),
        }
    }
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    request_id: Uuid,
    data: &'a serde_json::Value,
}

impl TransportChannel {
    pub async fn has_peer(&self) -> bool {
        self.peer.lock().await.is_some()
    }

    async fn accept(&self, outbound: mpsc::UnboundedSender<Message>) -> bool {
        let mut guard = self.peer.lock().await;
        let replaced = guard.is_some();
        *guard = Some(Peer { outbound });
        replaced
    }

    async fn clear_if_current(&self, outbound: &mpsc::UnboundedSender<Message>) {
        let mut guard = self.peer.lock().await;
        if let Some(peer) = guard.as_ref() {
            if peer.outbound.same_channel(outbound) {
                *guard = None;
            }
        }
    }

    /// Sends an upstream task frame to the connected agent. `NoPeer` if there
    /// is none right now; callers are responsible for parking via the
    /// Pending Queue when that happens.
    pub async fn send_task(&self, request_id: Uuid, task: &serde_json::Value) -> Result<(), BridgeError> {
        let guard = self.peer.lock().await;
        let peer = guard.as_ref().ok_or(BridgeError::NoPeer)?;
        let frame = OutboundFrame { request_id, data: task };
        let text = serde_json::to_string(&frame)
            .map_err(|e| BridgeError::TranslatorFailed(format!("encoding task frame: {e}")))?;
        peer.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| BridgeError::NoPeer)
    }

    /// Tells the connected agent to refresh the tab, used when the upstream
    /// page is showing an interstitial verification challenge (spec §4.6).
    pub async fn send_refresh_command(&self) -> Result<(), BridgeError> {
        let guard = self.peer.lock().await;
        let peer = guard.as_ref().ok_or(BridgeError::NoPeer)?;
        peer.outbound
            .send(Message::Text(r#"{"command":"refresh"}"#.into()))
            .map_err(|_| BridgeError::NoPeer)
    }

    /// Test-only door into `accept`, for exercising peer-connect behavior
    /// from other modules' test suites without standing up a real websocket.
    #[cfg(test)]
    pub async fn accept_for_test(&self, outbound: mpsc::UnboundedSender<Message>) -> bool {
        self.accept(outbound).await
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!(client_addr = %addr, "agent websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_connection(socket, addr, state))
}

async fn handle_connection(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let span = info_span!("agent_connection", client_addr = %addr);
    async move {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let replaced = state.transport.accept(tx.clone()).await;
        if replaced {
            info!("replacing previously connected agent");
        }
        state.transport.connected.notify_waiters();
        crate::recovery::on_peer_reconnected(state.clone());

        let mut send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            handle_inbound_text(&state, &text).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("agent closed the websocket");
                            break;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("ignoring unexpected binary frame from agent");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket receive error");
                            break;
                        }
                    }
                }
                _ = &mut send_task => {
                    debug!("outbound sender task ended");
                    break;
                }
            }
        }

        state.transport.clear_if_current(&tx).await;
        send_task.abort();
        info!("agent connection closed");
    }
    .instrument(span)
    .await
}

#[derive(serde::Deserialize)]
struct InboundFrame {
    request_id: Uuid,
    data: FrameData,
}

async fn handle_inbound_text(state: &Arc<AppState>, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "dropping malformed inbound frame");
            return;
        }
    };
    state.registry.put(frame.request_id, frame.data).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_reports_replaced_only_on_the_second_peer() {
        let transport = TransportChannel::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        assert!(!transport.accept(tx1).await);
        assert!(transport.has_peer().await);
        assert!(transport.accept(tx2).await);
    }

    #[tokio::test]
    async fn send_task_fails_with_no_peer_before_any_connection() {
        let transport = TransportChannel::default();
        let err = transport.send_task(Uuid::new_v4(), &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::NoPeer));
    }

    #[tokio::test]
    async fn send_task_delivers_the_request_id_and_payload_to_the_peer() {
        let transport = TransportChannel::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.accept(tx).await;

        let request_id = Uuid::new_v4();
        transport.send_task(request_id, &serde_json::json!({"hello": "world"})).await.unwrap();

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected a text frame");
        };
        let sent = text.to_string();
        assert!(sent.contains(&request_id.to_string()));
        assert!(sent.contains("hello"));
    }

    #[tokio::test]
    async fn send_refresh_command_sends_the_expected_command_frame() {
        let transport = TransportChannel::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.accept(tx).await;

        transport.send_refresh_command().await.unwrap();

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected a text frame");
        };
        assert_eq!(text.to_string(), r#"{"command":"refresh"}"#);
    }

    #[tokio::test]
    async fn clear_if_current_only_clears_the_matching_peer() {
        let transport = TransportChannel::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        transport.accept(tx1.clone()).await;

        transport.clear_if_current(&tx2).await;
        assert!(transport.has_peer().await, "clearing an unrelated sender must be a no-op");

        transport.clear_if_current(&tx1).await;
        assert!(!transport.has_peer().await);
    }
}
