use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::config::ScanConfig;
use super::events::{EventMeta, PipelineEvent, PipelineEventPayload};
use super::registry::ReportRegistry;
use super::retry::RetryPolicy;
use super::runtime::InProcPipelineBus;
use crate::audit::{AuditEngine, AuditOptions};
use crate::browser::{BrowserLease, BrowserPool};
use crate::cache::{ArtifactCache, AuditArtifact, CacheFingerprint, PageSnapshot, RouteArtifacts};
use crate::cache::store::{audit_key, page_key};
use crate::discovery::RouteDiscovery;
use crate::error::{Result, ScanError};
use crate::fetch::DocumentFetcher;
use crate::html;
use crate::types::{
    Route, RouteId, RouteOutcome, RouteReport, ScanId, ScoreSummary, TaskName, TaskStatus,
};

const OUTER_HTML_SCRIPT: &str = "document.documentElement.outerHTML";

/// Stamps events with the scan id and a runtime-wide sequence number.
#[derive(Debug)]
pub struct EventEmitter {
    bus: Arc<InProcPipelineBus>,
    scan_id: ScanId,
    sequence: AtomicU64,
}

impl EventEmitter {
    pub fn new(bus: Arc<InProcPipelineBus>, scan_id: ScanId) -> Self {
        Self {
            bus,
            scan_id,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, payload: PipelineEventPayload) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.bus.emit(PipelineEvent {
            meta: EventMeta::new(self.scan_id, sequence),
            payload,
        });
    }
}

/// Result of one pass through a route's task chain.
#[derive(Debug, Default)]
pub struct RouteRun {
    /// `None` when the scan was cancelled mid-route.
    pub outcome: Option<RouteOutcome>,
    /// New routes found by link extraction (crawl mode only).
    pub discovered: Vec<Route>,
}

enum Settled<T> {
    Done(T),
    Retry,
    Failed(ScanError),
}

/// Shared collaborators of every pipeline worker.
#[derive(Debug)]
pub struct RoutePipeline {
    pub(crate) config: Arc<ScanConfig>,
    pub(crate) registry: Arc<ReportRegistry>,
    pub(crate) pool: BrowserPool,
    pub(crate) audit: Arc<dyn AuditEngine>,
    pub(crate) fetcher: Arc<dyn DocumentFetcher>,
    pub(crate) cache: Option<ArtifactCache>,
    pub(crate) discovery: Arc<RouteDiscovery>,
    pub(crate) retry: RetryPolicy,
    pub(crate) events: Arc<EventEmitter>,
    pub(crate) audit_options: AuditOptions,
}

impl RoutePipeline {
    fn fingerprint(&self, route: &Route) -> CacheFingerprint {
        CacheFingerprint::compute(
            &route.path,
            self.audit_options.device,
            self.audit_options.throttle,
            &self.audit_options.categories,
        )
    }

    /// Runs html-inspect → link-extract → audit-execute → finalize for one
    /// route. Failures are recorded on the route's report and never escape.
    pub async fn run(&self, id: &RouteId, bypass_cache: bool, cancel: &CancellationToken) -> RouteRun {
        let Some(report) = self.registry.get(id) else {
            warn!(target: "scan::pipeline", route = %id, "route vanished from registry");
            return RouteRun::default();
        };
        let route = report.route.clone();
        let fingerprint = self.fingerprint(&route);

        if !bypass_cache
            && !self.config.cache.force_audit
            && let Some(cache) = &self.cache
            && let Some(artifacts) = cache.get(id, &fingerprint).await
        {
            return self.complete_from_cache(&route, artifacts);
        }

        match self.run_chain(&route, &fingerprint, bypass_cache, cancel).await {
            Ok(discovered) => RouteRun {
                outcome: Some(RouteOutcome::Scanned),
                discovered,
            },
            Err(ScanError::Cancelled(_)) => RouteRun::default(),
            Err(err) => {
                info!(target: "scan::pipeline", route = %route.path, error = %err, "route failed");
                RouteRun {
                    outcome: Some(RouteOutcome::Failed),
                    discovered: Vec::new(),
                }
            }
        }
    }

    fn complete_from_cache(&self, route: &Route, artifacts: RouteArtifacts) -> RouteRun {
        let id = &route.id;
        let links = artifacts
            .page
            .as_ref()
            .map(|page| page.links.clone())
            .unwrap_or_default();

        self.registry.update(id, |report| {
            report.from_cache = true;
            report.seo = artifacts.page.as_ref().map(|page| page.seo.clone());
            report.score = Some(ScoreSummary::from_categories(artifacts.audit.scores.clone()));
            report.audited_at = Some(artifacts.audit.audited_at);
            report.artifacts.html_key = artifacts.page.as_ref().map(|_| page_key(id));
            report.artifacts.audit_key = Some(audit_key(id, &artifacts.fingerprint));
            report.artifacts.fingerprint = Some(artifacts.fingerprint.to_string());
        });
        for task in TaskName::CHAIN {
            self.transition(id, task, TaskStatus::Complete, None);
        }

        debug!(target: "scan::pipeline", route = %route.path, "completed from cache");
        RouteRun {
            outcome: Some(RouteOutcome::Scanned),
            discovered: self.discovery.offer_links(&links),
        }
    }

    async fn run_chain(
        &self,
        route: &Route,
        fingerprint: &CacheFingerprint,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Route>> {
        let id = &route.id;
        let mut lease = None;

        let page = self
            .inspect(route, &mut lease, bypass_cache, cancel)
            .await?;

        self.transition(id, TaskName::LinkExtract, TaskStatus::Running, None);
        let discovered = self.discovery.offer_links(&page.links);
        self.transition(id, TaskName::LinkExtract, TaskStatus::Complete, None);

        let audit = self.audit(route, &mut lease, cancel).await?;
        // The browser goes back before finalize.
        drop(lease);

        self.finalize(route, fingerprint, page, audit).await;
        Ok(discovered)
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<BrowserLease> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ScanError::Cancelled("scan cancelled".into())),
            lease = self.pool.acquire() => lease,
        }
    }

    /// Borrows a browser unless one is already held. A failed launch counts
    /// as a failed attempt of the current task.
    async fn ensure_lease(
        &self,
        lease: &mut Option<BrowserLease>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if lease.is_none() {
            *lease = Some(self.acquire(cancel).await?);
        }
        Ok(())
    }

    async fn inspect(
        &self,
        route: &Route,
        lease: &mut Option<BrowserLease>,
        bypass_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<PageSnapshot> {
        let id = &route.id;
        let task = TaskName::HtmlInspect;
        self.transition(id, task, TaskStatus::Running, None);

        if !bypass_cache
            && let Some(cache) = &self.cache
            && let Some(page) = cache.get_page(id).await
        {
            debug!(target: "scan::pipeline", route = %route.path, "reusing cached html");
            self.record_page(id, &page, true);
            self.transition(id, task, TaskStatus::Complete, None);
            return Ok(page);
        }

        let timeout = self.config.pipeline.inspect_timeout();
        let mut attempt = 0;
        let html = loop {
            attempt += 1;
            let result = match self.ensure_lease(lease, cancel).await {
                Ok(()) => {
                    self.attempt(
                        cancel,
                        timeout,
                        || ScanError::NavigationTimeout(route.url.clone()),
                        self.fetch_html(route, lease.as_ref()),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match self.settle(route, task, attempt, result, cancel).await {
                Settled::Done(html) => break html,
                Settled::Retry => {
                    // Rendered retries start from a fresh browser.
                    if self.config.pipeline.render_javascript
                        && let Some(old) = lease.take()
                    {
                        old.discard();
                    }
                }
                Settled::Failed(err) => return Err(err),
            }
        };

        let base = match Url::parse(&route.url) {
            Ok(base) => base,
            Err(e) => {
                let err = ScanError::Internal(format!("route url {}: {e}", route.url));
                return Err(self.fail(route, task, err));
            }
        };
        let page = PageSnapshot {
            seo: html::extract_seo(&html, &base),
            links: html::extract_links(&html, &base),
            html,
            fetched_at: Utc::now(),
        };
        let mut stored = false;
        if let Some(cache) = &self.cache {
            match cache.put_page(id, &page).await {
                Ok(()) => stored = true,
                Err(err) => {
                    warn!(target: "scan::pipeline", route = %route.path, error = %err, "html cache write failed")
                }
            }
        }
        self.record_page(id, &page, stored);
        self.transition(id, task, TaskStatus::Complete, None);
        Ok(page)
    }

    fn record_page(&self, id: &RouteId, page: &PageSnapshot, cached: bool) {
        self.registry.update(id, |report| {
            report.seo = Some(page.seo.clone());
            report.artifacts.html_key = cached.then(|| page_key(id));
        });
    }

    async fn fetch_html(&self, route: &Route, lease: Option<&BrowserLease>) -> Result<String> {
        if self.config.pipeline.render_javascript {
            let lease = lease.ok_or_else(|| ScanError::Internal("no browser lease held".into()))?;
            let page = lease.handle().new_page().await?;
            let result = async {
                page.goto(&route.url).await?;
                let value = page.evaluate(OUTER_HTML_SCRIPT).await?;
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ScanError::Http(format!("{}: page returned no html", route.url)))
            }
            .await;
            if let Err(err) = page.close().await {
                debug!(target: "scan::pipeline", error = %err, "page close failed");
            }
            return result;
        }

        let doc = self.fetcher.fetch(&route.url).await?;
        if !doc.is_success() {
            return Err(ScanError::Http(format!("{} returned {}", route.url, doc.status)));
        }
        if !doc.is_html() {
            return Err(ScanError::Http(format!(
                "{} is not an html document ({})",
                route.url,
                doc.content_type.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(doc.body)
    }

    async fn audit(
        &self,
        route: &Route,
        lease: &mut Option<BrowserLease>,
        cancel: &CancellationToken,
    ) -> Result<AuditArtifact> {
        let task = TaskName::AuditExecute;
        self.transition(&route.id, task, TaskStatus::Running, None);

        let timeout = self.audit_options.timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.ensure_lease(lease, cancel).await {
                Ok(()) => {
                    let port = lease.as_ref().map(BrowserLease::port).unwrap_or_default();
                    let run = async {
                        let output =
                            self.audit.run_audit(&route.url, &self.audit_options, port).await?;
                        let scores = output.category_scores()?;
                        Ok(AuditArtifact {
                            scores,
                            report_json: output.json,
                            report_html: output.html,
                            audited_at: Utc::now(),
                        })
                    };
                    self.attempt(cancel, timeout, || ScanError::AuditTimeout(timeout), run)
                        .await
                }
                Err(err) => Err(err),
            };

            if let Err(err) = &result
                && err.poisons_instance()
                && let Some(broken) = lease.take()
            {
                warn!(target: "scan::pipeline", route = %route.path, instance = broken.id(), error = %err, "discarding browser after audit failure");
                broken.discard();
            }

            match self.settle(route, task, attempt, result, cancel).await {
                Settled::Done(artifact) => {
                    self.transition(&route.id, task, TaskStatus::Complete, None);
                    return Ok(artifact);
                }
                Settled::Retry => {}
                Settled::Failed(err) => return Err(err),
            }
        }
    }

    async fn finalize(
        &self,
        route: &Route,
        fingerprint: &CacheFingerprint,
        page: PageSnapshot,
        audit: AuditArtifact,
    ) {
        let id = &route.id;
        self.transition(id, TaskName::Finalize, TaskStatus::Running, None);

        let artifacts = RouteArtifacts {
            route_path: route.path.clone(),
            fingerprint: fingerprint.clone(),
            page: Some(page),
            audit,
        };
        let mut audit_cache_key = None;
        if let Some(cache) = &self.cache {
            match cache.put(id, &artifacts).await {
                Ok(()) => audit_cache_key = Some(audit_key(id, fingerprint)),
                Err(err) => {
                    warn!(target: "scan::pipeline", route = %route.path, error = %err, "artifact cache write failed")
                }
            }
        }

        self.registry.update(id, |report| {
            report.from_cache = false;
            report.score = Some(ScoreSummary::from_categories(artifacts.audit.scores.clone()));
            report.audited_at = Some(artifacts.audit.audited_at);
            report.artifacts.audit_key = audit_cache_key;
            report.artifacts.fingerprint = Some(fingerprint.to_string());
        });
        self.transition(id, TaskName::Finalize, TaskStatus::Complete, None);
        info!(target: "scan::pipeline", route = %route.path, "route audited");
    }

    /// Runs one attempt under the task timeout, racing cancellation.
    async fn attempt<T>(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
        on_timeout: impl FnOnce() -> ScanError,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ScanError::Cancelled("scan cancelled".into())),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(on_timeout()),
            },
        }
    }

    /// Decides what happens after an attempt: done, retry after backoff
    /// (the task stays `running`), or fail the task.
    async fn settle<T>(
        &self,
        route: &Route,
        task: TaskName,
        attempt: u32,
        result: Result<T>,
        cancel: &CancellationToken,
    ) -> Settled<T> {
        let err = match result {
            Ok(value) => return Settled::Done(value),
            Err(err) => err,
        };
        if matches!(err, ScanError::Cancelled(_)) || !self.retry.should_retry(&err, attempt) {
            return Settled::Failed(self.fail(route, task, err));
        }

        let delay = self.retry.delay_for(attempt);
        debug!(
            target: "scan::pipeline",
            route = %route.path,
            %task,
            attempt,
            ?delay,
            error = %err,
            "transient failure, retrying"
        );
        self.registry
            .update(&route.id, |report| report.record_attempt(task, Some(err.to_string())));

        tokio::select! {
            _ = cancel.cancelled() => {
                Settled::Failed(self.fail(route, task, ScanError::Cancelled("scan cancelled".into())))
            }
            _ = tokio::time::sleep(delay) => Settled::Retry,
        }
    }

    fn fail(&self, route: &Route, task: TaskName, err: ScanError) -> ScanError {
        if matches!(err, ScanError::Cancelled(_)) {
            debug!(target: "scan::pipeline", route = %route.path, %task, "task cancelled");
        } else {
            warn!(target: "scan::pipeline", route = %route.path, %task, error = %err, "task failed");
        }
        self.transition(&route.id, task, TaskStatus::Failed, Some(err.to_string()));
        err
    }

    /// Applies a task transition and emits the matching event.
    pub(crate) fn transition(
        &self,
        id: &RouteId,
        task: TaskName,
        status: TaskStatus,
        error: Option<String>,
    ) -> Option<RouteReport> {
        let error_text = error.clone();
        let (changed, snapshot) = self
            .registry
            .update(id, |report| report.transition(task, status, error))?;
        if !changed {
            return None;
        }
        let payload = match status {
            TaskStatus::Queued => return Some(snapshot),
            TaskStatus::Running => PipelineEventPayload::TaskStarted {
                task,
                report: snapshot.clone(),
            },
            TaskStatus::Complete => PipelineEventPayload::TaskComplete {
                task,
                report: snapshot.clone(),
            },
            TaskStatus::Failed => PipelineEventPayload::TaskFailed {
                task,
                error: error_text.unwrap_or_default(),
                report: snapshot.clone(),
            },
        };
        self.events.emit(payload);
        Some(snapshot)
    }
}
