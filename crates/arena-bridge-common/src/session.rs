/// Session tuple and model-routing data model (spec §3 "Session Mapping
/// Entry", §4.4 Session/Model Resolver).
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DirectChat,
    Battle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantPosition {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, std::hash::Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Text,
    Image,
    Search,
}

/// The handle the upstream UI needs to retry a chat turn (spec glossary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTuple {
    pub session_id: String,
    pub message_id: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_position")]
    pub position: ParticipantPosition,
}

fn default_mode() -> Mode {
    Mode::DirectChat
}

fn default_position() -> ParticipantPosition {
    ParticipantPosition::A
}

impl SessionTuple {
    pub fn is_valid(&self) -> bool {
        !self.session_id.trim().is_empty() && !self.message_id.trim().is_empty()
    }
}

/// Either a single default tuple, or an ordered per-model round-robin pool.
/// Mirrors spec §3's "Session Mapping Entry" data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionMapping {
    Single(SessionTuple),
    Pool(Vec<SessionTuple>),
}
