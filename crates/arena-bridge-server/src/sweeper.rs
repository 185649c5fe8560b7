/// Background sweepers: evicts Response Channel metadata that outlived the
/// configured timeout (spec §4.9) so a request whose agent never answers
/// doesn't pin memory (or an HTTP connection) forever, and reclaims stale
/// image cache entries on the same tick.
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run_metadata_sweeper(state: Arc<AppState>) {
    let timeout = state.config.metadata_timeout();
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        debug!("running metadata sweep");
        state.registry.sweep_expired(timeout).await;
        state.download_pool.evict_stale().await;
    }
}
