#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sitelens_config::{Config, ConfigMetadata, ConfigSource, ServerConfig};
use sitelens_core::history::InMemoryScanHistory;
use sitelens_core::orchestration::ScanRuntime;
use sitelens_core::orchestration::config::{PoolConfig, RetryConfig, ScanConfig};
use sitelens_core::testing::{FakeBrowserDriver, ScriptedAuditEngine, StaticSiteFetcher};
use sitelens_server::{AppState, create_app};

pub const SITE: &str = "https://example.com";

pub fn page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<a href="{href}">{href}</a>"#))
        .collect();
    format!("<html><head><title>{title}</title></head><body>{anchors}</body></html>")
}

pub fn site(paths: &[&str]) -> StaticSiteFetcher {
    let urls: String = paths
        .iter()
        .map(|path| format!("<url><loc>{SITE}{path}</loc></url>"))
        .collect();
    let mut fetcher = StaticSiteFetcher::new().with_page(
        &format!("{SITE}/sitemap.xml"),
        format!("<urlset>{urls}</urlset>"),
    );
    for path in paths {
        fetcher = fetcher.with_page(&format!("{SITE}{path}"), page(path, &["/"]));
    }
    fetcher
}

pub fn scan_config(dir: &TempDir) -> ScanConfig {
    let mut scan = ScanConfig::for_site(SITE);
    scan.pool = PoolConfig {
        min_instances: 1,
        max_instances: 2,
        ..PoolConfig::default()
    };
    scan.pipeline.max_concurrency = 2;
    scan.retry = RetryConfig {
        max_attempts: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        jitter_ratio: 0.0,
        jitter_min_ms: 0,
    };
    scan.cache.root = dir.path().join("cache");
    scan.budget.insert("performance".into(), 80);
    scan
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub runtime: ScanRuntime,
    pub audit: ScriptedAuditEngine,
    pub shutdown: CancellationToken,
    _dir: TempDir,
}

impl TestApp {
    pub async fn wait_until_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.runtime.wait_until_idle())
            .await
            .expect("scan should go idle");
    }
}

/// Runs a scan over `fetcher` to completion and serves it.
pub async fn finished_app(
    fetcher: StaticSiteFetcher,
    audit: ScriptedAuditEngine,
    configure: impl FnOnce(&mut ScanConfig),
) -> TestApp {
    let dir = TempDir::new().unwrap();
    let mut scan = scan_config(&dir);
    configure(&mut scan);

    let runtime = ScanRuntime::builder(scan.clone())
        .driver(Arc::new(FakeBrowserDriver::new()))
        .audit_engine(Arc::new(audit.clone()))
        .fetcher(Arc::new(fetcher))
        .history_store(Arc::new(InMemoryScanHistory::new()))
        .build()
        .await
        .unwrap();

    let config = Config {
        server: ServerConfig::default(),
        scan,
        routes: Vec::new(),
        metadata: ConfigMetadata {
            source: ConfigSource::Defaults,
            env_file_loaded: false,
            overrides: Vec::new(),
        },
    };
    let state = AppState::new(Arc::new(config), runtime.clone());
    let shutdown = CancellationToken::new();
    state.start_live_forwarder(shutdown.clone());

    tokio::time::timeout(Duration::from_secs(10), runtime.run())
        .await
        .expect("scan should finish")
        .unwrap();

    let server = TestServer::builder()
        .http_transport()
        .build(create_app(state.clone()))
        .expect("test server should start");

    TestApp {
        server,
        state,
        runtime,
        audit,
        shutdown,
        _dir: dir,
    }
}
