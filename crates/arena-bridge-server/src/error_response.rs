/// Maps `BridgeError` onto HTTP status codes and OpenAI-shaped error bodies
/// (spec §7). This is the one place a `BridgeError` turns into a wire
/// response; the SSE terminal-chunk path builds the same envelope directly
/// via `OpenAiErrorEnvelope::new` in `stream_processor`.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use arena_bridge_common::error::BridgeError;
use arena_bridge_common::openai::OpenAiErrorEnvelope;

pub fn status_code_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::InvalidSession(_) => StatusCode::BAD_REQUEST,
        BridgeError::AuthFailed => StatusCode::UNAUTHORIZED,
        BridgeError::NoPeer | BridgeError::UpstreamInterstitial => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::RecoveryTimeout | BridgeError::ChannelTimeout => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::TranslatorFailed(_) => StatusCode::BAD_REQUEST,
        BridgeError::Cancelled => StatusCode::BAD_REQUEST,
        BridgeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BridgeError::UpstreamEmpty
        | BridgeError::UpstreamMalformed(_)
        | BridgeError::UpstreamError { .. }
        | BridgeError::DownloadFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = status_code_for(&self);
        let body = OpenAiErrorEnvelope::new(self.to_string(), self.openai_error_type());
        (status, Json(body)).into_response()
    }
}
