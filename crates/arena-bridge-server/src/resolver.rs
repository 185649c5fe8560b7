/// Session/Model Resolver (spec C4, §4.4): turns a model name into a
/// concrete `SessionTuple` to send upstream, round-robining across any
/// per-model pool with a process-wide cursor.
use std::collections::HashMap;
use std::sync::Mutex;

use arena_bridge_common::config::AppConfig;
use arena_bridge_common::error::BridgeError;
use arena_bridge_common::session::{SessionMapping, SessionTuple};

pub struct SessionResolver {
    default_session: SessionTuple,
    cursors: Mutex<HashMap<String, usize>>,
}

impl SessionResolver {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            default_session: config.default_session(),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `model` to a session tuple. A per-model pool round-robins
    /// fairly across its entries; a per-model single override is used as-is;
    /// absent either, falls back to the globally configured default.
    pub fn resolve(&self, model: &str, registry: &arena_bridge_common::config::ModelRegistry) -> Result<SessionTuple, BridgeError> {
        let tuple = match registry.session_mapping_of(model) {
            Some(SessionMapping::Single(tuple)) => tuple.clone(),
            Some(SessionMapping::Pool(pool)) => {
                if pool.is_empty() {
                    return Err(BridgeError::InvalidSession(format!(
                        "model {model} has an empty session pool"
                    )));
                }
                let mut cursors = self.cursors.lock().expect("resolver mutex poisoned");
                let cursor = cursors.entry(model.to_string()).or_insert(0);
                let index = *cursor % pool.len();
                *cursor = cursor.wrapping_add(1);
                pool[index].clone()
            }
            None => self.default_session.clone(),
        };

        if !tuple.is_valid() {
            return Err(BridgeError::InvalidSession(format!(
                "resolved session for model {model} has an empty session_id or message_id"
            )));
        }
        Ok(tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_bridge_common::config::ModelRegistry;
    use arena_bridge_common::session::{Mode, ParticipantPosition};

    fn tuple(id: &str) -> SessionTuple {
        SessionTuple {
            session_id: id.to_string(),
            message_id: format!("{id}-msg"),
            mode: Mode::DirectChat,
            position: ParticipantPosition::A,
        }
    }

    #[test]
    fn round_robins_fairly_across_a_pool() {
        let mut config = AppConfig::default();
        config.session_id = "default-s".into();
        config.message_id = "default-m".into();
        let mut registry = ModelRegistry::default();
        registry.insert_session_mapping(
            "m-pool",
            SessionMapping::Pool(vec![tuple("one"), tuple("two"), tuple("three")]),
        );
        let resolver = SessionResolver::new(&config);

        let picks: Vec<String> = (0..6)
            .map(|_| resolver.resolve("m-pool", &registry).unwrap().session_id)
            .collect();
        assert_eq!(
            picks,
            vec!["one", "two", "three", "one", "two", "three"]
        );
    }

    #[test]
    fn falls_back_to_global_default_when_unmapped() {
        let mut config = AppConfig::default();
        config.session_id = "default-s".into();
        config.message_id = "default-m".into();
        let registry = ModelRegistry::default();
        let resolver = SessionResolver::new(&config);
        let resolved = resolver.resolve("unmapped-model", &registry).unwrap();
        assert_eq!(resolved.session_id, "default-s");
    }

    #[test]
    fn rejects_empty_pool_at_resolve_time() {
        let config = AppConfig::default();
        let mut registry = ModelRegistry::default();
        registry.insert_session_mapping("m-empty", SessionMapping::Pool(vec![]));
        let resolver = SessionResolver::new(&config);
        assert!(resolver.resolve("m-empty", &registry).is_err());
    }
}
