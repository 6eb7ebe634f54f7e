use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sitelens_config::Config;
use sitelens_core::discovery::definitions::StaticRouteTable;
use sitelens_core::history::{InMemoryScanHistory, ScanHistoryStore};
use sitelens_core::orchestration::ScanRuntime;

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scan::pipeline=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Picks the scan history backend: PostgreSQL when compiled in and
/// `DATABASE_URL` is set, otherwise in-process.
pub async fn history_store() -> anyhow::Result<Arc<dyn ScanHistoryStore>> {
    #[cfg(feature = "postgres")]
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let store = sitelens_core::history::PostgresScanHistory::connect(&url)
            .await
            .context("failed to connect scan history database")?;
        info!("scan history stored in PostgreSQL");
        return Ok(Arc::new(store));
    }

    Ok(Arc::new(InMemoryScanHistory::new()))
}

/// Wires a runtime with the production collaborators.
pub async fn build_runtime(
    config: &Config,
    history: Arc<dyn ScanHistoryStore>,
) -> anyhow::Result<ScanRuntime> {
    let mut builder = ScanRuntime::builder(config.scan.clone()).history_store(history);
    if !config.routes.is_empty() {
        let table = StaticRouteTable::new(config.routes.iter().cloned())
            .context("invalid route definitions")?;
        info!(definitions = table.len(), "route definitions loaded");
        builder = builder.route_matcher(Arc::new(table));
    }
    builder.build().await.map_err(anyhow::Error::from)
}
