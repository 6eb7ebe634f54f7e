use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::config::{DiscoveryMode, PoolConfig, RetryConfig, ScanConfig};
use super::events::{PipelineEvent, PipelineEventPayload};
use super::scheduler::ScanRuntime;
use crate::error::ScanError;
use crate::history::{InMemoryScanHistory, RouteHistoryStatus};
use crate::testing::{FakeBrowserDriver, ScriptedAuditEngine, ScriptedFailure, StaticSiteFetcher};
use crate::types::{Route, RouteId, ScanStatus, TaskName, TaskStatus};

const SITE: &str = "https://example.com";

fn page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<a href="{href}">{href}</a>"#))
        .collect();
    format!(
        r#"<html><head><title>{title}</title><meta name="description" content="{title} page"></head><body>{anchors}</body></html>"#
    )
}

fn sitemap(paths: &[&str]) -> String {
    let urls: String = paths
        .iter()
        .map(|path| format!("<url><loc>{SITE}{path}</loc></url>"))
        .collect();
    format!("<urlset>{urls}</urlset>")
}

fn three_page_site() -> StaticSiteFetcher {
    StaticSiteFetcher::new()
        .with_page(
            "https://example.com/sitemap.xml",
            sitemap(&["/", "/about", "/blog"]),
        )
        .with_page("https://example.com/", page("Home", &["/about", "/blog"]))
        .with_page("https://example.com/about", page("About", &["/"]))
        .with_page("https://example.com/blog", page("Blog", &["/"]))
}

fn config(cache_root: &Path) -> ScanConfig {
    let mut config = ScanConfig::for_site(SITE);
    config.pool = PoolConfig {
        min_instances: 1,
        max_instances: 2,
        ..PoolConfig::default()
    };
    config.pipeline.max_concurrency = 2;
    config.retry = RetryConfig {
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        jitter_ratio: 0.0,
        jitter_min_ms: 0,
    };
    config.cache.root = cache_root.to_path_buf();
    config
}

async fn runtime(
    config: ScanConfig,
    fetcher: StaticSiteFetcher,
    audit: &ScriptedAuditEngine,
    driver: &FakeBrowserDriver,
) -> ScanRuntime {
    ScanRuntime::builder(config)
        .driver(Arc::new(driver.clone()))
        .audit_engine(Arc::new(audit.clone()))
        .fetcher(Arc::new(fetcher))
        .build()
        .await
        .unwrap()
}

async fn run_to_completion(runtime: &ScanRuntime) -> crate::types::ScanSession {
    tokio::time::timeout(Duration::from_secs(10), runtime.run())
        .await
        .expect("scan should finish")
        .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn report_for(runtime: &ScanRuntime, path: &str) -> crate::types::RouteReport {
    runtime
        .report(&RouteId::from_path(path))
        .unwrap_or_else(|| panic!("no report for {path}"))
}

fn route_at(path: &str, url: &str) -> Route {
    Route {
        id: RouteId::from_path(path),
        url: url.to_string(),
        path: path.to_string(),
        dynamic: false,
        definition: None,
    }
}

fn single_page_site() -> StaticSiteFetcher {
    StaticSiteFetcher::new()
        .with_page("https://example.com/sitemap.xml", sitemap(&["/"]))
        .with_page("https://example.com/", page("Home", &[]))
}

#[tokio::test]
async fn sitemap_scan_completes_every_route() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;
    let mut events = runtime.subscribe();

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.route_count, 3);
    assert_eq!(session.scanned_count, 3);
    assert_eq!(session.failed_count, 0);
    assert!(session.completed_at.is_some());

    let reports = runtime.reports();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.is_complete() && !r.from_cache));
    for report in &reports {
        for task in TaskName::CHAIN {
            assert_eq!(report.task_status(task), Some(TaskStatus::Complete), "{task}");
        }
    }
    let about = report_for(&runtime, "/about");
    assert_eq!(about.seo.as_ref().unwrap().title.as_deref(), Some("About"));
    assert_eq!(about.category_score("performance"), Some(0.9));

    let events = drain(&mut events);
    let finished: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.payload {
            PipelineEventPayload::WorkerFinished { category_means, .. } => Some(category_means),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].get("performance"), Some(&90));

    runtime.shutdown().await;
}

#[tokio::test]
async fn route_events_arrive_in_task_order() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;
    let mut events = runtime.subscribe();
    run_to_completion(&runtime).await;

    let events = drain(&mut events);
    assert!(events.windows(2).all(|w| w[0].meta.sequence < w[1].meta.sequence));

    let about = RouteId::from_path("/about");
    let labels: Vec<String> = events
        .iter()
        .filter(|event| event.payload.report().map(|r| r.id()) == Some(&about))
        .map(|event| match &event.payload {
            PipelineEventPayload::TaskAdded { .. } => "added".to_string(),
            PipelineEventPayload::TaskStarted { task, .. } => format!("start:{task}"),
            PipelineEventPayload::TaskComplete { task, .. } => format!("done:{task}"),
            PipelineEventPayload::TaskFailed { task, .. } => format!("fail:{task}"),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        labels,
        vec![
            "added",
            "start:html-inspect",
            "done:html-inspect",
            "start:link-extract",
            "done:link-extract",
            "start:audit-execute",
            "done:audit-execute",
            "start:finalize",
            "done:finalize",
        ]
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn audit_timeouts_are_retried_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new().fail_times("/about", 2, ScriptedFailure::Timeout);
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.failed_count, 0);

    let about = report_for(&runtime, "/about");
    let state = &about.tasks[&TaskName::AuditExecute];
    assert_eq!(state.status, TaskStatus::Complete);
    assert_eq!(state.attempts, 3);
    assert_eq!(audit.calls("/about"), 3);
    // Each timed-out browser is thrown away rather than reused.
    assert_eq!(runtime.pool_stats().discarded_total, 2);
    runtime.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_route() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new().fail_times("/blog", 3, ScriptedFailure::Crash);
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.scanned_count, 2);
    assert_eq!(session.failed_count, 1);

    let blog = report_for(&runtime, "/blog");
    assert!(blog.has_failed());
    let state = &blog.tasks[&TaskName::AuditExecute];
    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.last_error.as_deref().unwrap().contains("crashed"));
    assert_eq!(blog.task_status(TaskName::Finalize), None);
    assert!(report_for(&runtime, "/about").is_complete());
    runtime.shutdown().await;
}

#[tokio::test]
async fn non_retryable_inspect_failure_skips_the_audit() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = StaticSiteFetcher::new()
        .with_page("https://example.com/sitemap.xml", sitemap(&["/missing"]))
        .with_page("https://example.com/", page("Home", &[]));
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), fetcher, &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.scanned_count, 1);
    assert_eq!(session.failed_count, 1);

    let missing = report_for(&runtime, "/missing");
    let state = &missing.tasks[&TaskName::HtmlInspect];
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempts, 1);
    assert_eq!(audit.calls("/missing"), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn failed_browser_launch_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.pool.min_instances = 0;
    config.pool.max_instances = 1;
    config.pipeline.max_concurrency = 1;
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new().failing_launches(1);
    let runtime = runtime(config, single_page_site(), &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.scanned_count, 1);
    assert_eq!(session.failed_count, 0);

    let home = report_for(&runtime, "/");
    let state = &home.tasks[&TaskName::HtmlInspect];
    assert_eq!(state.status, TaskStatus::Complete);
    assert_eq!(state.attempts, 2);
    assert!(home.is_complete());
    assert_eq!(driver.launch_count(), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn repeated_launch_failures_exhaust_the_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.pool.min_instances = 0;
    config.pool.max_instances = 1;
    config.pipeline.max_concurrency = 1;
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new().failing_launches(3);
    let runtime = runtime(config, single_page_site(), &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.failed_count, 1);

    let home = report_for(&runtime, "/");
    let state = &home.tasks[&TaskName::HtmlInspect];
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempts, 3);
    assert!(state.last_error.as_deref().unwrap().contains("fake launch failure"));
    assert_eq!(audit.calls("/"), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn unparseable_route_url_fails_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = single_page_site().with_page("not a url", page("Odd", &[]));
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), fetcher, &audit, &driver).await;
    assert!(runtime.enqueue(route_at("/odd", "not a url")));

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.scanned_count, 1);
    assert_eq!(session.failed_count, 1);

    let odd = report_for(&runtime, "/odd");
    let state = &odd.tasks[&TaskName::HtmlInspect];
    assert_eq!(state.status, TaskStatus::Failed);
    assert!(state.last_error.as_deref().unwrap().contains("route url"));
    assert_eq!(audit.calls("/odd"), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn browser_launches_stay_within_pool_max() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ["/a", "/b", "/c", "/d", "/e", "/f"];
    let mut fetcher = StaticSiteFetcher::new()
        .with_page("https://example.com/sitemap.xml", sitemap(&paths))
        .with_page("https://example.com/", page("Home", &[]));
    for path in paths {
        fetcher = fetcher.with_page(&format!("{SITE}{path}"), page(path, &[]));
    }
    let mut config = config(dir.path());
    config.pipeline.max_concurrency = 4;
    let audit = ScriptedAuditEngine::new().with_delay(Duration::from_millis(5));
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config, fetcher, &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.scanned_count, 7);
    assert!(driver.launch_count() <= 2);
    assert!(runtime.pool_stats().live() <= 2);
    assert_eq!(runtime.pool_stats().busy, 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn rescan_bypasses_cache_and_produces_a_newer_audit() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;
    run_to_completion(&runtime).await;

    let id = RouteId::from_path("/about");
    let before = report_for(&runtime, "/about");
    let first_audit = before.audited_at.unwrap();

    let reset = runtime.rescan_route(&id).unwrap();
    assert!(
        reset
            .tasks
            .values()
            .all(|state| state.status == TaskStatus::Queued)
    );
    tokio::time::timeout(Duration::from_secs(10), runtime.wait_until_idle())
        .await
        .unwrap();

    let after = report_for(&runtime, "/about");
    assert!(after.is_complete());
    assert!(!after.from_cache);
    assert!(after.audited_at.unwrap() > first_audit);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(audit.calls("/about"), 2);

    let session = runtime.session();
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.scanned_count, 3);
    runtime.shutdown().await;
}

#[tokio::test]
async fn rescan_of_unknown_route_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;
    run_to_completion(&runtime).await;

    let err = runtime
        .rescan_route(&RouteId::from_path("/nope"))
        .unwrap_err();
    assert!(matches!(err, ScanError::NotFound(_)));
    runtime.shutdown().await;
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeBrowserDriver::new();

    let first_audit = ScriptedAuditEngine::new();
    let first = runtime(config(dir.path()), three_page_site(), &first_audit, &driver).await;
    run_to_completion(&first).await;
    first.shutdown().await;
    assert_eq!(first_audit.total_calls(), 3);

    let second_audit = ScriptedAuditEngine::new();
    let second = runtime(config(dir.path()), three_page_site(), &second_audit, &driver).await;
    let session = run_to_completion(&second).await;
    assert_eq!(session.scanned_count, 3);
    assert_eq!(second_audit.total_calls(), 0);
    let reports = second.reports();
    assert!(reports.iter().all(|r| r.from_cache && r.is_complete()));
    assert_eq!(
        report_for(&second, "/blog").seo.unwrap().title.as_deref(),
        Some("Blog")
    );
    second.shutdown().await;
}

#[tokio::test]
async fn crawl_mode_feeds_links_back_under_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = StaticSiteFetcher::new()
        .with_page("https://example.com/", page("Home", &["/a", "/b", "/c", "/d"]))
        .with_page("https://example.com/a", page("A", &["/e", "https://other.org/x"]))
        .with_page("https://example.com/b", page("B", &[]))
        .with_page("https://example.com/c", page("C", &[]))
        .with_page("https://example.com/d", page("D", &[]))
        .with_page("https://example.com/e", page("E", &[]));
    let mut config = config(dir.path());
    config.discovery.mode = DiscoveryMode::Crawl;
    config.discovery.max_routes = 3;
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config, fetcher, &audit, &driver).await;

    let session = run_to_completion(&runtime).await;
    assert_eq!(session.status, ScanStatus::Complete);
    assert_eq!(session.route_count, 3);
    assert_eq!(runtime.reports().len(), 3);
    let paths: Vec<String> = runtime
        .reports()
        .into_iter()
        .map(|r| r.route.path)
        .collect();
    assert_eq!(paths, vec!["/", "/a", "/b"]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn external_enqueue_respects_the_route_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.discovery.max_routes = 2;
    let audit = ScriptedAuditEngine::new();
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config, single_page_site(), &audit, &driver).await;

    assert!(runtime.enqueue(route_at("/a", "https://example.com/a")));
    assert!(runtime.enqueue(route_at("/b", "https://example.com/b")));
    assert!(!runtime.enqueue(route_at("/c", "https://example.com/c")));
    assert!(!runtime.enqueue(route_at("/a", "https://example.com/a")));

    let paths: Vec<String> = runtime
        .reports()
        .into_iter()
        .map(|r| r.route.path)
        .collect();
    assert_eq!(paths, vec!["/a", "/b"]);
}

#[tokio::test]
async fn cancel_abandons_in_flight_routes_and_releases_browsers() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new().with_delay(Duration::from_secs(30));
    let driver = FakeBrowserDriver::new();
    let runtime = runtime(config(dir.path()), three_page_site(), &audit, &driver).await;
    let mut events = runtime.subscribe();
    runtime.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PipelineEvent {
                payload:
                    PipelineEventPayload::TaskStarted {
                        task: TaskName::AuditExecute,
                        ..
                    },
                ..
            }) = events.recv().await
            {
                break;
            }
        }
    })
    .await
    .unwrap();

    runtime.cancel();
    let session = tokio::time::timeout(Duration::from_secs(5), runtime.wait_for_completion())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, ScanStatus::Cancelled);

    runtime.shutdown().await;
    let stats = runtime.pool_stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.live(), 0);

    let abandoned: Vec<_> = runtime
        .reports()
        .into_iter()
        .filter(|r| r.task_status(TaskName::AuditExecute) == Some(TaskStatus::Failed))
        .collect();
    assert!(!abandoned.is_empty());
    assert!(abandoned.iter().all(|r| {
        r.tasks[&TaskName::AuditExecute]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("cancelled"))
    }));
    assert_eq!(runtime.session().scanned_count, 0);
    assert!(matches!(
        runtime.rescan_route(&RouteId::from_path("/")),
        Err(ScanError::Cancelled(_))
    ));
}

#[tokio::test]
async fn history_store_sees_the_whole_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryScanHistory::new());
    let runtime = ScanRuntime::builder(config(dir.path()))
        .driver(Arc::new(FakeBrowserDriver::new()))
        .audit_engine(Arc::new(ScriptedAuditEngine::new()))
        .fetcher(Arc::new(three_page_site()))
        .history_store(store.clone())
        .build()
        .await
        .unwrap();

    let session = run_to_completion(&runtime).await;
    runtime.shutdown().await;

    let record = store.scan(session.id).unwrap();
    assert_eq!(record.session.status, ScanStatus::Complete);
    assert_eq!(record.session.scanned_count, 3);
    assert_eq!(record.routes.len(), 3);
    assert!(
        record
            .routes
            .values()
            .all(|row| row.status == RouteHistoryStatus::Complete)
    );
    assert_eq!(record.category_means.get("seo"), Some(&90));
}

#[tokio::test]
async fn invalid_config_records_a_failed_session() {
    let store = Arc::new(InMemoryScanHistory::new());
    let err = ScanRuntime::builder(ScanConfig::for_site("not a url"))
        .driver(Arc::new(FakeBrowserDriver::new()))
        .audit_engine(Arc::new(ScriptedAuditEngine::new()))
        .fetcher(Arc::new(StaticSiteFetcher::new()))
        .history_store(store.clone())
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::ConfigValidation(_)));

    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, ScanStatus::Failed);
    assert!(sessions[0].completed_at.is_some());
}

#[tokio::test]
async fn javascript_rendering_needs_a_page_capable_driver() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.pipeline.render_javascript = true;

    let err = ScanRuntime::builder(config.clone())
        .driver(Arc::new(FakeBrowserDriver::new()))
        .audit_engine(Arc::new(ScriptedAuditEngine::new()))
        .fetcher(Arc::new(StaticSiteFetcher::new()))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::ConfigValidation(_)));

    let driver = FakeBrowserDriver::with_pages([(
        "https://example.com/",
        page("Rendered home", &[]),
    )]);
    let runtime = ScanRuntime::builder(config)
        .driver(Arc::new(driver))
        .audit_engine(Arc::new(ScriptedAuditEngine::new()))
        .fetcher(Arc::new(StaticSiteFetcher::new()))
        .build()
        .await
        .unwrap();
    let session = run_to_completion(&runtime).await;
    assert_eq!(session.scanned_count, 1);
    assert_eq!(
        report_for(&runtime, "/").seo.unwrap().title.as_deref(),
        Some("Rendered home")
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn budget_evaluates_the_finished_report_set() {
    let dir = tempfile::tempdir().unwrap();
    let audit = ScriptedAuditEngine::new()
        .with_scores("/", &[("performance", 0.9)])
        .with_scores("/about", &[("performance", 0.7)])
        .with_scores("/blog", &[]);
    let driver = FakeBrowserDriver::new();
    let mut config = config(dir.path());
    config.budget.insert("performance".into(), 75);
    config.budget.insert("seo".into(), 90);
    let runtime = runtime(config, three_page_site(), &audit, &driver).await;
    run_to_completion(&runtime).await;

    let result = runtime.evaluate_budget();
    assert!(result.passed);
    assert_eq!(result.categories[0].actual_mean, Some(80));
    assert_eq!(result.coverage_gaps(), vec!["seo"]);
    runtime.shutdown().await;
}
