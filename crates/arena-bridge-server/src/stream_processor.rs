/// Stream Processor (spec C6, §4.6): drains the Response Channel for one
/// request, turning the upstream's tagged-line protocol into a sequence of
/// content/reasoning deltas a caller can either forward as SSE chunks or
/// accumulate into a single non-streaming response.
use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use arena_bridge_common::config::ReasoningMode;
use arena_bridge_common::error::BridgeError;
use arena_bridge_common::openai::OpenAiErrorEnvelope;
use arena_bridge_common::upstream::{self, Advisory, FrameData, ImageDescriptor, Record};

use crate::state::AppState;

#[derive(Debug, Clone)]
pub enum OutboundEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    /// Terminal: the upstream finished normally with this OpenAI
    /// `finish_reason`.
    Finish(&'static str),
    /// Terminal: something went wrong; no `Finish` follows.
    Error(OpenAiErrorEnvelope),
}

/// Drains `rx` for one request and yields `OutboundEvent`s until a terminal
/// event is produced. The returned stream always ends with exactly one
/// `Finish` or one `Error`.
pub fn process(
    state: Arc<AppState>,
    request_id: uuid::Uuid,
    mut rx: mpsc::Receiver<FrameData>,
) -> impl Stream<Item = OutboundEvent> {
    stream! {
        let mut buffer = String::new();
        let mut reasoning_buffer = String::new();
        let mut reasoning_open = false;
        let mut content_started = false;
        let mut seen_images: HashSet<String> = HashSet::new();
        let read_timeout = state.config.channel_read_timeout();
        let reasoning_mode = state.config.reasoning_mode;
        let show_retry_info = state.config.empty_response_retry.show_retry_info_to_client;

        loop {
            let frame = match tokio::time::timeout(read_timeout, rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    warn!(request_id = %request_id, "response channel closed without an end marker");
                    if !content_started {
                        yield terminal_error(&BridgeError::UpstreamEmpty);
                    } else {
                        yield OutboundEvent::Finish("stop");
                    }
                    return;
                }
                Err(_) => {
                    warn!(request_id = %request_id, "timed out waiting for the next upstream fragment");
                    yield terminal_error(&BridgeError::ChannelTimeout);
                    return;
                }
            };

            match frame {
                FrameData::Chunk(text) => {
                    buffer.push_str(&text);
                    if upstream::contains_interstitial_signature(&buffer) {
                        warn!(request_id = %request_id, "upstream interstitial detected mid-stream");
                        signal_interstitial(&state);
                        yield terminal_error(&BridgeError::UpstreamInterstitial);
                        return;
                    }

                    for record in upstream::drain_records(&mut buffer) {
                        match record {
                            Record::Text(text) => {
                                if reasoning_open && reasoning_mode == ReasoningMode::ThinkTags {
                                    yield OutboundEvent::ContentDelta("</think>".to_string());
                                    reasoning_open = false;
                                } else if reasoning_open && reasoning_mode == ReasoningMode::Buffered {
                                    yield OutboundEvent::ReasoningDelta(std::mem::take(&mut reasoning_buffer));
                                    reasoning_open = false;
                                }
                                content_started = true;
                                yield OutboundEvent::ContentDelta(text);
                            }
                            Record::Reasoning(text) => {
                                match reasoning_mode {
                                    ReasoningMode::Streamed => {
                                        yield OutboundEvent::ReasoningDelta(text);
                                    }
                                    ReasoningMode::Buffered => {
                                        reasoning_buffer.push_str(&text);
                                        reasoning_open = true;
                                    }
                                    ReasoningMode::ThinkTags => {
                                        if !reasoning_open {
                                            yield OutboundEvent::ContentDelta("<think>".to_string());
                                            reasoning_open = true;
                                        }
                                        yield OutboundEvent::ContentDelta(text);
                                    }
                                }
                            }
                            Record::Image(descriptor) => {
                                match resolve_image(&state, descriptor).await {
                                    Ok(url) => {
                                        if seen_images.insert(url.clone()) {
                                            content_started = true;
                                            yield OutboundEvent::ContentDelta(format!("\n![image]({url})\n"));
                                        }
                                    }
                                    Err(e) => {
                                        warn!(request_id = %request_id, error = %e, "image resolution failed, continuing without it");
                                    }
                                }
                            }
                            Record::End { metadata } => {
                                info!(request_id = %request_id, ?metadata, "upstream signalled end of turn");
                                if reasoning_open && reasoning_mode == ReasoningMode::ThinkTags {
                                    yield OutboundEvent::ContentDelta("</think>".to_string());
                                }
                                if reasoning_mode == ReasoningMode::Buffered && !reasoning_buffer.is_empty() {
                                    yield OutboundEvent::ReasoningDelta(std::mem::take(&mut reasoning_buffer));
                                }
                                yield OutboundEvent::Finish("stop");
                                return;
                            }
                            Record::Unknown { tag, .. } => {
                                warn!(request_id = %request_id, tag, "ignoring unrecognized upstream record");
                            }
                        }
                    }
                }
                FrameData::Advisory(Advisory::Retry(retry)) => {
                    info!(request_id = %request_id, attempt = retry.retry_info.attempt, reason = ?retry.retry_info.reason, "upstream empty-response retry in progress");
                    if show_retry_info {
                        yield OutboundEvent::ContentDelta(format!(
                            "\n[retrying upstream, attempt {}]\n",
                            retry.retry_info.attempt
                        ));
                    }
                }
                FrameData::Advisory(Advisory::Error(advisory)) => {
                    if advisory.final_error {
                        yield terminal_error(&BridgeError::UpstreamError { message: advisory.error });
                        return;
                    }
                    info!(request_id = %request_id, error = advisory.error, "non-final upstream error advisory");
                }
                FrameData::Done(_) => {
                    if !content_started {
                        yield terminal_error(&BridgeError::UpstreamEmpty);
                    } else {
                        yield OutboundEvent::Finish("stop");
                    }
                    return;
                }
            }
        }
    }
}

fn terminal_error(err: &BridgeError) -> OutboundEvent {
    OutboundEvent::Error(OpenAiErrorEnvelope::new(err.to_string(), err.openai_error_type()))
}

fn signal_interstitial(state: &Arc<AppState>) {
    if !state.verifying.swap(true, std::sync::atomic::Ordering::SeqCst) {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = state.transport.send_refresh_command().await {
                warn!(error = %e, "could not signal agent to refresh past the interstitial");
            }
        });
    }
}

async fn resolve_image(state: &Arc<AppState>, descriptor: ImageDescriptor) -> Result<String, BridgeError> {
    use arena_bridge_common::config::ImageFormat;
    match (descriptor, state.config.image_return_format) {
        (ImageDescriptor::Url(url), ImageFormat::Url) => Ok(url),
        (ImageDescriptor::Url(url), ImageFormat::Base64) => {
            let encoded = state.download_pool.fetch_base64(&url).await?;
            Ok(format!("data:image/png;base64,{encoded}"))
        }
        (ImageDescriptor::Base64(data_uri), _) => Ok(data_uri),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_bridge_common::config::AppConfig;
    use futures::StreamExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(AppConfig::default()))
    }

    #[tokio::test]
    async fn text_streaming_success_emits_content_then_finish() {
        let state = test_state();
        let request_id = uuid::Uuid::new_v4();
        let rx = state.registry.open(request_id, serde_json::json!({}));
        state
            .registry
            .put(request_id, FrameData::Chunk("a0:\"Hello\"\na0:\" world\"\nad:{}\n".to_string()))
            .await;

        let events: Vec<_> = process(state, request_id, rx).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], OutboundEvent::ContentDelta(t) if t == "Hello"));
        assert!(matches!(&events[1], OutboundEvent::ContentDelta(t) if t == " world"));
        assert!(matches!(&events[2], OutboundEvent::Finish("stop")));
    }

    #[tokio::test]
    async fn reasoning_then_content_in_streamed_mode() {
        let mut config = AppConfig::default();
        config.reasoning_mode = ReasoningMode::Streamed;
        let state = Arc::new(AppState::new(config));
        let request_id = uuid::Uuid::new_v4();
        let rx = state.registry.open(request_id, serde_json::json!({}));
        state
            .registry
            .put(request_id, FrameData::Chunk("ag:\"thinking\"\na0:\"answer\"\nad:{}\n".to_string()))
            .await;

        let events: Vec<_> = process(state, request_id, rx).collect().await;
        assert!(matches!(&events[0], OutboundEvent::ReasoningDelta(t) if t == "thinking"));
        assert!(matches!(&events[1], OutboundEvent::ContentDelta(t) if t == "answer"));
        assert!(matches!(&events[2], OutboundEvent::Finish("stop")));
    }

    #[tokio::test]
    async fn buffered_reasoning_flushes_before_first_content_delta() {
        let mut config = AppConfig::default();
        config.reasoning_mode = ReasoningMode::Buffered;
        let state = Arc::new(AppState::new(config));
        let request_id = uuid::Uuid::new_v4();
        let rx = state.registry.open(request_id, serde_json::json!({}));
        state
            .registry
            .put(
                request_id,
                FrameData::Chunk("ag:\"Think\"\nag:\"ing\"\na0:\"Answer\"\nad:{}\n".to_string()),
            )
            .await;

        let events: Vec<_> = process(state, request_id, rx).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], OutboundEvent::ReasoningDelta(t) if t == "Thinking"));
        assert!(matches!(&events[1], OutboundEvent::ContentDelta(t) if t == "Answer"));
        assert!(matches!(&events[2], OutboundEvent::Finish("stop")));
    }

    #[tokio::test]
    async fn empty_final_buffer_surfaces_as_error() {
        let state = test_state();
        let request_id = uuid::Uuid::new_v4();
        let rx = state.registry.open(request_id, serde_json::json!({}));
        state
            .registry
            .put(request_id, FrameData::Done(arena_bridge_common::upstream::DoneMarker))
            .await;

        let events: Vec<_> = process(state, request_id, rx).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], OutboundEvent::Error(_)));
    }

    #[tokio::test]
    async fn final_error_advisory_terminates_with_error() {
        let state = test_state();
        let request_id = uuid::Uuid::new_v4();
        let rx = state.registry.open(request_id, serde_json::json!({}));
        state
            .registry
            .put(
                request_id,
                FrameData::Advisory(Advisory::Error(arena_bridge_common::upstream::ErrorAdvisory {
                    error: "upstream exploded".to_string(),
                    final_error: true,
                })),
            )
            .await;

        let events: Vec<_> = process(state, request_id, rx).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], OutboundEvent::Error(_)));
    }

    #[tokio::test]
    async fn non_final_retry_advisory_does_not_terminate() {
        let state = test_state();
        let request_id = uuid::Uuid::new_v4();
        let rx = state.registry.open(request_id, serde_json::json!({}));
        state
            .registry
            .put(
                request_id,
                FrameData::Advisory(Advisory::Retry(arena_bridge_common::upstream::RetryAdvisory {
                    retry_info: arena_bridge_common::upstream::RetryInfo {
                        attempt: 1,
                        reason: Some("empty".to_string()),
                    },
                })),
            )
            .await;
        state
            .registry
            .put(request_id, FrameData::Chunk("a0:\"ok\"\nad:{}\n".to_string()))
            .await;

        let events: Vec<_> = process(state, request_id, rx).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], OutboundEvent::ContentDelta(t) if t == "ok"));
        assert!(matches!(&events[1], OutboundEvent::Finish("stop")));
    }
}
