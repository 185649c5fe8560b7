use std::sync::atomic::AtomicBool;

use arena_bridge_common::config::AppConfig;

use crate::download_pool::DownloadPool;
use crate::pending::PendingQueue;
use crate::registry::RequestRegistry;
use crate::resolver::SessionResolver;
use crate::transport::TransportChannel;

/// Everything a request handler needs, bundled behind one `Arc` the way the
/// teacher bundles its node-wide collaborators into `SharedState`.
pub struct AppState {
    pub config: AppConfig,
    pub transport: TransportChannel,
    pub registry: RequestRegistry,
    pub pending: PendingQueue,
    pub resolver: SessionResolver,
    pub download_pool: DownloadPool,
    /// Set while an interstitial-recovery refresh command has been sent and
    /// not yet resolved by a fresh connection, so concurrent requests that
    /// all hit the same interstitial page don't each fire their own refresh.
    pub verifying: AtomicBool,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let resolver = SessionResolver::new(&config);
        let download_pool = DownloadPool::new(&config);
        Self {
            transport: TransportChannel::default(),
            registry: RequestRegistry::new(),
            pending: PendingQueue::new(),
            resolver,
            download_pool,
            verifying: AtomicBool::new(false),
            config,
        }
    }
}
