/// Payload Translator, forward direction (spec §4.5, C5). Turns an OpenAI
/// chat-completion request into the upstream task shape. The reverse
/// direction (upstream stream → OpenAI chunks) is embodied by the Stream
/// Processor in `arena-bridge-server` since it needs channel/state-machine
/// plumbing this crate intentionally doesn't have.
use std::collections::HashMap;

use serde::Serialize;

use crate::config::{BypassConfig, ModelRegistry};
use crate::error::BridgeError;
use crate::openai::{ChatCompletionRequest, ChatMessage};
use crate::session::{ModelClass, SessionTuple};

/// One OpenAI message translated into the upstream's template shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
    #[serde(rename = "participantPosition")]
    pub participant_position: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental_attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "contentType")]
    pub content_type: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpstreamTask {
    pub is_image_request: bool,
    pub message_templates: Vec<MessageTemplate>,
    pub target_model_id: String,
    pub session_id: String,
    pub message_id: String,
}

/// Markdown image syntax produced by a prior assistant turn, e.g.
/// `![alt](https://example.com/a.png)`, so the model can "see" its own
/// earlier output on the next turn (spec §4.5).
fn markdown_image_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'!' && i + 1 < bytes.len() && bytes[i + 1] == b'[' {
            if let Some(close_bracket) = text[i + 2..].find(']') {
                let after_bracket = i + 2 + close_bracket + 1;
                if text[after_bracket..].starts_with('(') {
                    if let Some(close_paren) = text[after_bracket + 1..].find(')') {
                        let url = &text[after_bracket + 1..after_bracket + 1 + close_paren];
                        if !url.is_empty() {
                            urls.push(url.to_string());
                        }
                        i = after_bracket + 1 + close_paren;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    urls
}

fn content_type_for(url: &str) -> &'static str {
    if url.starts_with("data:image/png") || url.ends_with(".png") {
        "image/png"
    } else if url.starts_with("data:image/gif") || url.ends_with(".gif") {
        "image/gif"
    } else if url.starts_with("data:image/webp") || url.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Whether bypass should be appended for this model class, given the global
/// toggle and the per-class overrides. Global off always wins; absent a
/// per-class entry, `image`/`search` default to off (spec §4.5).
pub fn bypass_applies(class: ModelClass, cfg: &BypassConfig) -> bool {
    if !cfg.bypass_enabled {
        return false;
    }
    match cfg.bypass_settings.get(&class) {
        Some(explicit) => *explicit,
        None => matches!(class, ModelClass::Text),
    }
}

pub struct ForwardTranslation {
    pub task: UpstreamTask,
}

/// Forward-translate an OpenAI request into the upstream task shape.
///
/// `session` is the tuple the resolver (C4) already picked; this function is
/// purely about message/attachment shape, not session selection.
pub fn translate_forward(
    request: &ChatCompletionRequest,
    session: &SessionTuple,
    registry: &ModelRegistry,
    bypass: &BypassConfig,
) -> Result<ForwardTranslation, BridgeError> {
    let class = registry
        .class_of(&request.model)
        .ok_or_else(|| BridgeError::TranslatorFailed(format!("unknown model: {}", request.model)))?;
    let target_model_id = registry
        .target_id_of(&request.model)
        .ok_or_else(|| BridgeError::TranslatorFailed(format!("unknown model: {}", request.model)))?
        .to_string();

    let mut templates = Vec::with_capacity(request.messages.len() + 1);
    for message in &request.messages {
        templates.push(translate_message(message, session)?);
    }

    if bypass_applies(class, bypass) {
        if let Some(preset) = bypass.active_preset() {
            templates.push(MessageTemplate {
                role: "user".to_string(),
                content: preset.to_string(),
                participant_position: position_str(session),
                experimental_attachments: None,
            });
        }
    }

    Ok(ForwardTranslation {
        task: UpstreamTask {
            is_image_request: matches!(class, ModelClass::Image),
            message_templates: templates,
            target_model_id,
            session_id: session.session_id.clone(),
            message_id: session.message_id.clone(),
        },
    })
}

fn position_str(session: &SessionTuple) -> &'static str {
    match session.position {
        crate::session::ParticipantPosition::A => "a",
        crate::session::ParticipantPosition::B => "b",
    }
}

fn translate_message(
    message: &ChatMessage,
    session: &SessionTuple,
) -> Result<MessageTemplate, BridgeError> {
    let text = message.content.as_text();
    let mut image_urls = message.content.image_urls();

    if message.role == "assistant" {
        image_urls.extend(markdown_image_urls(&text));
    }

    let attachments = if image_urls.is_empty() {
        None
    } else {
        Some(
            image_urls
                .iter()
                .map(|url| Attachment {
                    url: url.clone(),
                    content_type: content_type_for(url),
                })
                .collect(),
        )
    };

    Ok(MessageTemplate {
        role: message.role.clone(),
        content: text,
        participant_position: position_str(session),
        experimental_attachments: attachments,
    })
}

/// Used by tests and by the resolver to validate a `HashMap<ModelClass,
/// bool>` config shape without pulling `config.rs` into scope everywhere.
pub type BypassSettings = HashMap<ModelClass, bool>;
