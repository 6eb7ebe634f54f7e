use std::{fmt, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sitelens_config::Config;
use sitelens_core::broadcast::LiveBroadcast;
use sitelens_core::orchestration::ScanRuntime;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runtime: ScanRuntime,
    pub live: LiveBroadcast,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("site", &self.config.scan.site)
            .field("observers", &self.live.observer_count())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(config: Arc<Config>, runtime: ScanRuntime) -> Self {
        Self {
            config,
            runtime,
            live: LiveBroadcast::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Relays route snapshots from the scan's event bus to WebSocket
    /// observers until `shutdown` fires.
    pub fn start_live_forwarder(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.live.spawn_forwarder(self.runtime.subscribe(), shutdown)
    }

    /// Queue capacity handed to each new WebSocket observer.
    pub fn observer_queue(&self) -> usize {
        self.runtime.config().broadcast.observer_queue
    }
}
