/// Typed, validated configuration (spec §6 "Configuration surface", §9
/// "Configuration as enumerated effects"). Loading a config file is named as
/// an out-of-scope external collaborator, but the structure it feeds — and
/// validating it at load time — is core ambient engineering, so this module
/// follows the teacher's `Config::from_env` pattern (explicit env lookups,
/// explicit defaults) but layered on top of a `serde::Deserialize` file for
/// the larger nested shapes spec §6 lists.
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::BridgeError;
use crate::session::{ModelClass, SessionMapping, SessionTuple};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session_id: String,
    pub message_id: String,
    pub id_updater_last_mode: crate::session::Mode,
    pub id_updater_battle_target: crate::session::ParticipantPosition,
    pub api_key: Option<String>,

    pub models: ModelRegistry,

    pub enable_auto_retry: bool,
    pub retry_timeout_seconds: u64,

    pub empty_response_retry: EmptyResponseRetryConfig,

    pub bypass: BypassConfig,
    pub image_attachment_bypass_enabled: bool,

    pub save_images_locally: bool,
    pub local_save_format: ImageFormat,
    pub image_return_format: ImageFormat,

    pub file_bed: FileBedConfig,

    pub max_concurrent_downloads: usize,
    pub download_timeout: DownloadTimeoutConfig,
    pub connection_pool: ConnectionPoolConfig,

    pub memory_management: MemoryManagementConfig,
    pub metadata_timeout_minutes: u64,

    pub channel_read_timeout_seconds: u64,
    pub pending_deadline_seconds: u64,

    pub reasoning_mode: ReasoningMode,

    pub log_dir: String,
}

/// How reasoning (`ag:`) deltas are surfaced to the client (spec §4.6: "either
/// as a dedicated field, or wrapped in `<think>...</think>` tags —
/// mode-selectable"). `Buffered` additionally controls whether reasoning
/// deltas stream progressively or collapse into one chunk at the first
/// non-reasoning record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    Streamed,
    Buffered,
    ThinkTags,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            message_id: String::new(),
            id_updater_last_mode: crate::session::Mode::DirectChat,
            id_updater_battle_target: crate::session::ParticipantPosition::A,
            api_key: None,
            models: ModelRegistry::default(),
            enable_auto_retry: true,
            retry_timeout_seconds: 60,
            empty_response_retry: EmptyResponseRetryConfig::default(),
            bypass: BypassConfig::default(),
            image_attachment_bypass_enabled: false,
            save_images_locally: false,
            local_save_format: ImageFormat::Url,
            image_return_format: ImageFormat::Url,
            file_bed: FileBedConfig::default(),
            max_concurrent_downloads: 50,
            download_timeout: DownloadTimeoutConfig::default(),
            connection_pool: ConnectionPoolConfig::default(),
            memory_management: MemoryManagementConfig::default(),
            metadata_timeout_minutes: 30,
            channel_read_timeout_seconds: 360,
            pending_deadline_seconds: 10,
            reasoning_mode: ReasoningMode::Streamed,
            log_dir: "./logs".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from an optional JSON config file, falling back to defaults, then
    /// apply secret-bearing env var overrides the way
    /// `OpenAiClientConfig::from_env` layers `OPENAI_*` vars over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, BridgeError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| BridgeError::Config(format!("reading {}: {e}", p.display())))?;
                Self::from_json_str(&raw)?
            }
            _ => AppConfig::default(),
        };

        if let Ok(key) = std::env::var("BRIDGE_API_KEY") {
            config.api_key = Some(key);
        }
        if let Ok(sid) = std::env::var("BRIDGE_SESSION_ID") {
            config.session_id = sid;
        }
        if let Ok(mid) = std::env::var("BRIDGE_MESSAGE_ID") {
            config.message_id = mid;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_json_str(raw: &str) -> Result<Self, BridgeError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| BridgeError::Config(format!("invalid JSON: {e}")))?;
        warn_on_unknown_keys(&value);
        serde_json::from_value(value).map_err(|e| BridgeError::Config(format!("{e}")))
    }

    /// Rejects invalid combinations at load time (spec §9).
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.file_bed.enabled && self.file_bed.endpoints.is_empty() {
            return Err(BridgeError::Config(
                "file_bed_enabled is true but file_bed_endpoints is empty".to_string(),
            ));
        }
        if self.bypass.bypass_enabled && self.bypass.active_preset().is_none() {
            return Err(BridgeError::Config(
                "bypass_enabled is true but no active bypass preset is configured".to_string(),
            ));
        }
        for (model, tuples) in self.models.sessions.iter() {
            if let SessionMapping::Pool(list) = tuples {
                if list.is_empty() {
                    return Err(BridgeError::Config(format!(
                        "model {model} has an empty session pool"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn channel_read_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_read_timeout_seconds)
    }

    pub fn pending_deadline(&self) -> Duration {
        Duration::from_secs(self.pending_deadline_seconds)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_seconds)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_minutes * 60)
    }

    pub fn default_session(&self) -> SessionTuple {
        SessionTuple {
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            mode: self.id_updater_last_mode,
            position: self.id_updater_battle_target,
        }
    }
}

fn warn_on_unknown_keys(value: &serde_json::Value) {
    const KNOWN_TOP_LEVEL: &[&str] = &[
        "session_id",
        "message_id",
        "id_updater_last_mode",
        "id_updater_battle_target",
        "api_key",
        "models",
        "enable_auto_retry",
        "retry_timeout_seconds",
        "empty_response_retry",
        "bypass",
        "image_attachment_bypass_enabled",
        "save_images_locally",
        "local_save_format",
        "image_return_format",
        "file_bed",
        "max_concurrent_downloads",
        "download_timeout",
        "connection_pool",
        "memory_management",
        "metadata_timeout_minutes",
        "channel_read_timeout_seconds",
        "pending_deadline_seconds",
        "reasoning_mode",
        "log_dir",
    ];
    if let serde_json::Value::Object(map) = value {
        let unknown: Vec<&String> = map
            .keys()
            .filter(|k| !KNOWN_TOP_LEVEL.contains(&k.as_str()))
            .collect();
        if !unknown.is_empty() {
            warn!(?unknown, "ignoring unrecognized top-level config keys");
        }
    }
}

/// Model name -> (target upstream model id, class, session mapping).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelRegistry {
    #[serde(default)]
    target_ids: HashMap<String, String>,
    #[serde(default)]
    classes: HashMap<String, ModelClass>,
    #[serde(default)]
    sessions: HashMap<String, SessionMapping>,
}

impl ModelRegistry {
    pub fn insert(&mut self, model: &str, target_id: &str, class: ModelClass) {
        self.target_ids.insert(model.to_string(), target_id.to_string());
        self.classes.insert(model.to_string(), class);
    }

    pub fn insert_session_mapping(&mut self, model: &str, mapping: SessionMapping) {
        self.sessions.insert(model.to_string(), mapping);
    }

    pub fn class_of(&self, model: &str) -> Option<ModelClass> {
        self.classes.get(model).copied()
    }

    pub fn target_id_of(&self, model: &str) -> Option<&str> {
        self.target_ids.get(model).map(|s| s.as_str())
    }

    pub fn session_mapping_of(&self, model: &str) -> Option<&SessionMapping> {
        self.sessions.get(model)
    }

    pub fn all_model_names(&self) -> Vec<String> {
        self.target_ids.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmptyResponseRetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub show_retry_info_to_client: bool,
}

impl Default for EmptyResponseRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            show_retry_info_to_client: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BypassPreset {
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    pub bypass_enabled: bool,
    pub bypass_settings: HashMap<ModelClass, bool>,
    pub active_preset: Option<String>,
    pub presets: HashMap<String, BypassPreset>,
}

impl BypassConfig {
    pub fn active_preset(&self) -> Option<&str> {
        let name = self.active_preset.as_ref()?;
        self.presets.get(name).map(|p| p.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Url,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileBedSelectionStrategy {
    Random,
    RoundRobin,
    Failover,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileBedConfig {
    pub enabled: bool,
    pub selection_strategy: FileBedSelectionStrategy,
    pub endpoints: Vec<String>,
}

impl Default for FileBedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            selection_strategy: FileBedSelectionStrategy::RoundRobin,
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadTimeoutConfig {
    pub connect_ms: u64,
    pub sock_read_ms: u64,
    pub total_ms: u64,
}

impl Default for DownloadTimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            sock_read_ms: 15_000,
            total_ms: 30_000,
        }
    }
}

impl DownloadTimeoutConfig {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub total_limit: usize,
    pub per_host_limit: usize,
    pub keepalive_timeout_secs: u64,
    pub dns_cache_ttl_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            total_limit: 100,
            per_host_limit: 20,
            keepalive_timeout_secs: 90,
            dns_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryManagementConfig {
    pub gc_threshold_mb: u64,
    pub image_cache_max_size: usize,
    pub image_cache_ttl_seconds: u64,
}

impl Default for MemoryManagementConfig {
    fn default() -> Self {
        Self {
            gc_threshold_mb: 512,
            image_cache_max_size: 500,
            image_cache_ttl_seconds: 3_600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry_timeout_seconds, 60);
        assert_eq!(cfg.metadata_timeout_minutes, 30);
        assert_eq!(cfg.channel_read_timeout_seconds, 360);
        assert_eq!(cfg.pending_deadline_seconds, 10);
        assert_eq!(cfg.max_concurrent_downloads, 50);
        assert_eq!(cfg.empty_response_retry.max_retries, 5);
        assert_eq!(cfg.empty_response_retry.base_delay_ms, 1_000);
        assert_eq!(cfg.empty_response_retry.max_delay_ms, 30_000);
    }

    #[test]
    fn rejects_file_bed_enabled_without_endpoints() {
        let mut cfg = AppConfig::default();
        cfg.file_bed.enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bypass_enabled_without_preset() {
        let mut cfg = AppConfig::default();
        cfg.bypass.bypass_enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_session_pool() {
        let mut cfg = AppConfig::default();
        cfg.models
            .insert_session_mapping("m-rr", SessionMapping::Pool(vec![]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let mut cfg = AppConfig::default();
        cfg.session_id = "s".into();
        cfg.message_id = "m".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_from_json_with_unknown_keys_ignored() {
        let raw = r#"{
            "session_id": "s1",
            "message_id": "m1",
            "totally_unknown_future_key": 42
        }"#;
        let cfg = AppConfig::from_json_str(raw).unwrap();
        assert_eq!(cfg.session_id, "s1");
        assert_eq!(cfg.message_id, "m1");
    }
}
