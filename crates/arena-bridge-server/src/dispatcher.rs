/// Dispatcher (spec C7, §4.7): the axum handlers OpenAI-compatible clients
/// talk to. Resolves a session, translates the request, gets it to the
/// agent (directly or via the Pending Queue), then drives the Stream
/// Processor either into SSE chunks or one accumulated JSON response.
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use arena_bridge_common::error::BridgeError;
use arena_bridge_common::openai::{
    ChatCompletionChoice, ChatCompletionChunk, ChatCompletionChunkDelta, ChatCompletionRequest,
    ChatCompletionResponse, ChatCompletionResponseMessage, ModelInfo, ModelListResponse,
};
use arena_bridge_common::translator;

use crate::pending::{PendingEntry, PendingOutcome};
use crate::request_guard::OpenRequestGuard;
use crate::state::AppState;
use crate::stream_processor::{self, OutboundEvent};

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let names = state.config.models.all_model_names();
    Json(ModelListResponse {
        object: "list",
        data: names
            .into_iter()
            .map(|id| ModelInfo {
                id,
                object: "model",
                created: 0,
                owned_by: "arena-bridge",
            })
            .collect(),
    })
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let span = info_span!("chat_completion", model = %request.model);
    async move { dispatch(state, request, false).await }.instrument(span).await
}

#[derive(Debug, Deserialize)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageGenerationItem>,
}

#[derive(Debug, Serialize)]
pub struct ImageGenerationItem {
    pub url: String,
}

/// Routed through the same chat path as text requests, just with the
/// request reshaped into a single user turn first (spec §4.7: "image
/// generation is classified and forwarded through the identical pipeline").
pub async fn images_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ImageGenerationRequest>,
) -> Response {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let chat_request = ChatCompletionRequest {
        model: request.model,
        messages: vec![arena_bridge_common::openai::ChatMessage {
            role: "user".to_string(),
            content: arena_bridge_common::openai::MessageContent::Text(request.prompt),
        }],
        stream: false,
        temperature: None,
        max_tokens: None,
    };

    let span = info_span!("image_generation", model = %chat_request.model);
    async move { dispatch(state, chat_request, true).await }.instrument(span).await
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), BridgeError> {
    let Some(expected) = state.config.api_key.as_ref() else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(BridgeError::AuthFailed)
    }
}

async fn dispatch(state: Arc<AppState>, request: ChatCompletionRequest, as_image_response: bool) -> Response {
    let request_id = Uuid::new_v4();
    let created = unix_timestamp();
    let model = request.model.clone();
    let want_stream = request.stream && !as_image_response;

    let session = match state.resolver.resolve(&request.model, &state.config.models) {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let translation = match translator::translate_forward(&request, &session, &state.config.models, &state.config.bypass) {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let task_payload = match serde_json::to_value(&translation.task) {
        Ok(v) => v,
        Err(e) => return BridgeError::TranslatorFailed(e.to_string()).into_response(),
    };

    let rx = state.registry.open(request_id, task_payload.clone());
    let guard = OpenRequestGuard::new(state.clone(), request_id);

    if !state.transport.has_peer().await {
        if !state.config.enable_auto_retry {
            drop(guard);
            return BridgeError::NoPeer.into_response();
        }
        if let Err(e) = park_and_wait(&state, request_id, task_payload.clone()).await {
            drop(guard);
            return e.into_response();
        }
    } else if let Err(e) = state.transport.send_task(request_id, &task_payload).await {
        // Lost the race with a disconnecting peer; one re-park attempt.
        if !state.config.enable_auto_retry {
            drop(guard);
            return e.into_response();
        }
        if let Err(e) = park_and_wait(&state, request_id, task_payload.clone()).await {
            drop(guard);
            return e.into_response();
        }
    }

    info!(request_id = %request_id, "request dispatched to agent");

    if want_stream {
        stream_response(state, guard, request_id, created, model, rx)
    } else {
        accumulate_response(state, guard, request_id, created, model, rx, as_image_response).await
    }
}

async fn park_and_wait(state: &Arc<AppState>, request_id: Uuid, task_payload: serde_json::Value) -> Result<(), BridgeError> {
    let (responder, receiver) = oneshot::channel();
    let deadline = Instant::now() + state.config.retry_timeout();
    let entry = PendingEntry {
        request_id,
        task_payload,
        deadline,
        responder: Some(responder),
    };
    state.pending.offer(entry, deadline).await?;
    match tokio::time::timeout_at(deadline.into(), receiver).await {
        Ok(Ok(PendingOutcome::Ready)) => Ok(()),
        Ok(Ok(PendingOutcome::Failed(e))) => Err(e),
        Ok(Err(_)) => Err(BridgeError::RecoveryTimeout),
        Err(_) => Err(BridgeError::RecoveryTimeout),
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn stream_response(
    state: Arc<AppState>,
    guard: OpenRequestGuard,
    request_id: Uuid,
    created: i64,
    model: String,
    rx: tokio::sync::mpsc::Receiver<arena_bridge_common::upstream::FrameData>,
) -> Response {
    let completion_id = format!("chatcmpl-{request_id}");
    let events = stream_processor::process(state, request_id, rx);

    let sse_stream = futures::stream::unfold(
        SseStage::Streaming(events.boxed(), Some(guard), false),
        move |stage| {
            let completion_id = completion_id.clone();
            let model = model.clone();
            async move {
                match stage {
                    SseStage::Streaming(mut events, guard, mut role_sent) => {
                        let Some(event) = events.next().await else {
                            // Upstream stream ended without an explicit Finish/Error;
                            // still owe the client a `[DONE]` before closing.
                            return Some((done_event(), SseStage::Done));
                        };
                        let chunk = match event {
                            OutboundEvent::ContentDelta(text) => {
                                let delta = ChatCompletionChunkDelta {
                                    role: (!role_sent).then_some("assistant"),
                                    content: Some(text),
                                    reasoning_content: None,
                                };
                                role_sent = true;
                                ChatCompletionChunk::new(&completion_id, created, &model, delta)
                            }
                            OutboundEvent::ReasoningDelta(text) => {
                                let delta = ChatCompletionChunkDelta {
                                    role: (!role_sent).then_some("assistant"),
                                    content: None,
                                    reasoning_content: Some(text),
                                };
                                role_sent = true;
                                ChatCompletionChunk::new(&completion_id, created, &model, delta)
                            }
                            OutboundEvent::Finish(reason) => {
                                let sse = Event::default().data(
                                    serde_json::to_string(&ChatCompletionChunk::final_chunk(&completion_id, created, &model, reason))
                                        .unwrap_or_default(),
                                );
                                return Some((Ok::<_, Infallible>(sse), SseStage::Done));
                            }
                            OutboundEvent::Error(envelope) => {
                                let sse = Event::default().data(serde_json::to_string(&envelope).unwrap_or_default());
                                return Some((Ok::<_, Infallible>(sse), SseStage::Done));
                            }
                        };
                        let sse = Event::default().data(serde_json::to_string(&chunk).unwrap_or_default());
                        Some((Ok::<_, Infallible>(sse), SseStage::Streaming(events, guard, role_sent)))
                    }
                    // Spec §7: both a normal finish and a terminal error are followed
                    // by the `[DONE]` sentinel, same as every other OpenAI-compatible
                    // streaming endpoint.
                    SseStage::Done => Some((done_event(), SseStage::Finished)),
                    SseStage::Finished => None,
                }
            }
        },
    );

    Sse::new(sse_stream).keep_alive(KeepAlive::default()).into_response()
}

type BoxedEventStream = std::pin::Pin<Box<dyn futures::Stream<Item = OutboundEvent> + Send>>;

enum SseStage {
    Streaming(BoxedEventStream, Option<OpenRequestGuard>, bool),
    /// Terminal chunk already emitted; `guard` has been dropped (the Response
    /// Channel is closed), one more poll owes the client `[DONE]`.
    Done,
    Finished,
}

fn done_event() -> Result<Event, Infallible> {
    Ok(Event::default().data("[DONE]"))
}

async fn accumulate_response(
    state: Arc<AppState>,
    guard: OpenRequestGuard,
    request_id: Uuid,
    created: i64,
    model: String,
    rx: tokio::sync::mpsc::Receiver<arena_bridge_common::upstream::FrameData>,
    as_image_response: bool,
) -> Response {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason = "stop";

    let mut events = Box::pin(stream_processor::process(state, request_id, rx));
    while let Some(event) = events.next().await {
        match event {
            OutboundEvent::ContentDelta(text) => content.push_str(&text),
            OutboundEvent::ReasoningDelta(text) => reasoning.push_str(&text),
            OutboundEvent::Finish(reason) => {
                finish_reason = reason;
                break;
            }
            OutboundEvent::Error(envelope) => {
                drop(guard);
                return (StatusCode::BAD_GATEWAY, Json(envelope)).into_response();
            }
        }
    }
    drop(guard);

    if as_image_response {
        let urls = extract_markdown_image_urls(&content);
        return Json(ImageGenerationResponse {
            created,
            data: urls.into_iter().map(|url| ImageGenerationItem { url }).collect(),
        })
        .into_response();
    }

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion",
        created,
        model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatCompletionResponseMessage {
                role: "assistant",
                content,
                reasoning_content: if reasoning.is_empty() { None } else { Some(reasoning) },
            },
            finish_reason,
        }],
        usage: None,
    };
    Json(response).into_response()
}

fn extract_markdown_image_urls(content: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(start) = line.find("](") {
            if let Some(end) = line[start..].find(')') {
                urls.push(line[start + 2..start + end].to_string());
            }
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_bridge_common::config::AppConfig;
    use arena_bridge_common::openai::{ChatMessage, MessageContent};
    use arena_bridge_common::session::ModelClass;
    use arena_bridge_common::upstream::FrameData;

    fn text_request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text("hi".to_string()),
            }],
            stream: false,
            temperature: None,
            max_tokens: None,
        }
    }

    fn configured_state(enable_auto_retry: bool) -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.session_id = "s1".to_string();
        config.message_id = "m1".to_string();
        config.enable_auto_retry = enable_auto_retry;
        config.models.insert("m1", "upstream-1", ModelClass::Text);
        Arc::new(AppState::new(config))
    }

    #[tokio::test]
    async fn no_peer_with_auto_retry_off_returns_service_unavailable_immediately() {
        let state = configured_state(false);
        let response = dispatch(state.clone(), text_request("m1"), false).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.registry.open_ids().is_empty(), "guard must close the channel on this exit path");
    }

    #[tokio::test]
    async fn unknown_model_returns_bad_request() {
        let state = configured_state(false);
        let response = dispatch(state, text_request("does-not-exist"), false).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// No peer connected at dispatch time, auto-retry on: the request parks
    /// on the Pending Queue, a peer connects shortly after (simulated here by
    /// directly registering one, the way `TransportChannel::accept` would),
    /// the consumer delivers it, and the handler completes successfully
    /// instead of timing out. This is the non-streaming analogue of seed
    /// scenario 4 (disconnect/reconnect with auto-retry on).
    #[tokio::test]
    async fn parks_then_completes_once_a_peer_connects() {
        let state = configured_state(true);
        let rx = state.pending.take_receiver().await;
        tokio::spawn(crate::pending::run_consumer(state.clone(), rx));

        let connect_state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let (tx, mut agent_inbound) = tokio::sync::mpsc::unbounded_channel();
            connect_state.transport.accept_for_test(tx).await;
            connect_state.transport.connected.notify_waiters();

            // Drain whatever the dispatcher sends and answer it so the
            // handler under test doesn't hang waiting on the Response Channel.
            if let Some(msg) = agent_inbound.recv().await {
                if let axum::extract::ws::Message::Text(text) = msg {
                    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                    let request_id: uuid::Uuid =
                        serde_json::from_value(frame["request_id"].clone()).unwrap();
                    connect_state
                        .registry
                        .put(request_id, FrameData::Chunk("a0:\"hi there\"\nad:{}\n".to_string()))
                        .await;
                }
            }
        });

        let response = dispatch(state, text_request("m1"), false).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
