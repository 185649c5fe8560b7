/// RAII guard that guarantees a request's Response Channel and metadata are
/// removed from the registry on every exit path out of the dispatcher,
/// including early returns and panics unwinding through it — the async
/// equivalent of the teacher's explicit cleanup-on-every-branch pattern,
/// done once instead of at every return site.
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::state::AppState;

pub struct OpenRequestGuard {
    state: Arc<AppState>,
    request_id: Uuid,
}

impl OpenRequestGuard {
    pub fn new(state: Arc<AppState>, request_id: Uuid) -> Self {
        Self { state, request_id }
    }
}

impl Drop for OpenRequestGuard {
    fn drop(&mut self) {
        debug!(request_id = %self.request_id, "closing response channel");
        self.state.registry.close(self.request_id);
    }
}
