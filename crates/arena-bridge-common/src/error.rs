/// Error taxonomy shared between the translator, the stream processor, and the
/// dispatcher (spec §7). Each variant maps to exactly one propagation policy;
/// `arena-bridge-server` is responsible for turning a `BridgeError` into an
/// HTTP response or an SSE error chunk — this crate only classifies failures.

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no agent is connected")]
    NoPeer,

    #[error("invalid session: {0}")]
    InvalidSession(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("upstream returned an empty response")]
    UpstreamEmpty,

    #[error("upstream is showing an interstitial verification page")]
    UpstreamInterstitial,

    #[error("upstream record malformed: {0}")]
    UpstreamMalformed(String),

    #[error("upstream error: {message}")]
    UpstreamError { message: String },

    #[error("failed to translate request: {0}")]
    TranslatorFailed(String),

    #[error("recovery timed out before a peer reconnected")]
    RecoveryTimeout,

    #[error("channel read timed out")]
    ChannelTimeout,

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// The `type` field of the OpenAI-shaped error body.
    pub fn openai_error_type(&self) -> &'static str {
        match self {
            BridgeError::InvalidSession(_) => "invalid_request_error",
            BridgeError::AuthFailed => "authentication_error",
            BridgeError::NoPeer
            | BridgeError::RecoveryTimeout
            | BridgeError::ChannelTimeout => "service_unavailable_error",
            BridgeError::UpstreamInterstitial => "content_filter_error",
            BridgeError::Cancelled => "cancelled",
            _ => "server_error",
        }
    }
}
