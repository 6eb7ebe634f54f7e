use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::config::ScanConfig;
use super::events::{PipelineEvent, PipelineEventPayload};
use super::pipeline::{EventEmitter, RoutePipeline};
use super::queue::RouteQueue;
use super::registry::ReportRegistry;
use super::retry::RetryPolicy;
use super::runtime::InProcPipelineBus;
use crate::audit::{AuditEngine, AuditOptions, ProcessAuditEngine};
use crate::browser::{BrowserDriver, BrowserPool, ChromeProcessDriver, PoolStats};
use crate::budget::{self, BudgetResult};
use crate::cache::ArtifactCache;
use crate::discovery::{Admission, RouteDefinitionMatcher, RouteDiscovery, RouteNormalizer};
use crate::error::{Result, ScanError};
use crate::fetch::{DocumentFetcher, HttpDocumentFetcher};
use crate::history::{ScanHistoryRecorder, ScanHistoryStore};
use crate::types::{Route, RouteId, RouteOutcome, RouteReport, ScanSession, ScanStatus};

/// Assembles a [`ScanRuntime`]. Every collaborator has a production default
/// so callers only override what they need to fake.
pub struct ScanRuntimeBuilder {
    config: ScanConfig,
    driver: Option<Arc<dyn BrowserDriver>>,
    audit: Option<Arc<dyn AuditEngine>>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
    matcher: Option<Arc<dyn RouteDefinitionMatcher>>,
    history: Option<Arc<dyn ScanHistoryStore>>,
}

impl fmt::Debug for ScanRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRuntimeBuilder")
            .field("site", &self.config.site)
            .field("custom_driver", &self.driver.is_some())
            .field("custom_audit", &self.audit.is_some())
            .field("custom_fetcher", &self.fetcher.is_some())
            .field("route_matcher", &self.matcher.is_some())
            .field("history", &self.history.is_some())
            .finish()
    }
}

impl ScanRuntimeBuilder {
    pub fn driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn audit_engine(mut self, audit: Arc<dyn AuditEngine>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn route_matcher(mut self, matcher: Arc<dyn RouteDefinitionMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn history_store(mut self, history: Arc<dyn ScanHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Validates the configuration and wires the runtime. A rejected
    /// configuration still produces a failed session in the history store.
    pub async fn build(self) -> Result<ScanRuntime> {
        let ScanRuntimeBuilder {
            config,
            driver,
            audit,
            fetcher,
            matcher,
            history,
        } = self;

        let mut session = ScanSession::start(config.site.clone(), config.fingerprint());
        let driver: Arc<dyn BrowserDriver> = driver.unwrap_or_else(|| {
            Arc::new(ChromeProcessDriver::new(
                config.pool.chrome_path.clone(),
                config.pool.chrome_args.clone(),
                config.pool.launch_timeout(),
            ))
        });

        let validated = config.validate().and_then(|()| {
            if config.pipeline.render_javascript && !driver.supports_pages() {
                return Err(ScanError::ConfigValidation(
                    "pipeline.render_javascript requires a browser driver with page support"
                        .into(),
                ));
            }
            config.site_url()
        });
        let site = match validated {
            Ok(site) => site,
            Err(err) => {
                warn!(target: "scan::pipeline", site = %config.site, error = %err, "scan configuration rejected");
                session.fail();
                if let Some(history) = &history {
                    record_rejected_session(history.as_ref(), &session).await;
                }
                return Err(err);
            }
        };

        let fetcher: Arc<dyn DocumentFetcher> = match fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpDocumentFetcher::new(config.discovery.fetch_timeout())?),
        };
        let audit: Arc<dyn AuditEngine> =
            audit.unwrap_or_else(|| Arc::new(ProcessAuditEngine::from_config(&config.audit)));

        let mut normalizer = RouteNormalizer::new(site).keep_query(config.discovery.keep_query);
        if let Some(matcher) = matcher {
            normalizer = normalizer.with_matcher(matcher);
        }
        let discovery = Arc::new(RouteDiscovery::new(
            &config.discovery,
            normalizer,
            Arc::clone(&fetcher),
        )?);

        let cache = config.cache.enabled.then(|| {
            ArtifactCache::new(config.cache.root.clone()).with_max_age(config.cache.max_age())
        });
        let bus = Arc::new(InProcPipelineBus::new(config.broadcast.event_capacity));
        let events = Arc::new(EventEmitter::new(Arc::clone(&bus), session.id));
        let registry = Arc::new(ReportRegistry::new());
        let pool = BrowserPool::new(driver, config.pool.clone());
        let audit_options = AuditOptions::from_config(&config.audit, config.pipeline.audit_timeout());
        let config = Arc::new(config);

        let pipeline = Arc::new(RoutePipeline {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            pool: pool.clone(),
            audit,
            fetcher,
            cache,
            discovery,
            retry: RetryPolicy::new(config.retry),
            events: Arc::clone(&events),
            audit_options,
        });

        let (session, _) = watch::channel(session);
        Ok(ScanRuntime {
            inner: Arc::new(RuntimeInner {
                config,
                pipeline,
                registry,
                pool,
                queue: RouteQueue::new(),
                bus,
                events,
                session,
                outcomes: DashMap::new(),
                bypass_cache: DashSet::new(),
                history,
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                shutdown: CancellationToken::new(),
                drain_lock: Mutex::new(()),
                rescan_lock: parking_lot::Mutex::new(()),
                handles: Mutex::new(Vec::new()),
            }),
        })
    }
}

async fn record_rejected_session(history: &dyn ScanHistoryStore, session: &ScanSession) {
    if let Err(err) = history.create_scan(session).await {
        warn!(target: "scan::history", scan = %session.id, error = %err, "failed to record rejected scan");
        return;
    }
    if let Err(err) = history.update_scan(session).await {
        warn!(target: "scan::history", scan = %session.id, error = %err, "failed to record rejected scan");
    }
}

struct RuntimeInner {
    config: Arc<ScanConfig>,
    pipeline: Arc<RoutePipeline>,
    registry: Arc<ReportRegistry>,
    pool: BrowserPool,
    queue: RouteQueue,
    bus: Arc<InProcPipelineBus>,
    events: Arc<EventEmitter>,
    session: watch::Sender<ScanSession>,
    /// Counted outcome per route, taken back on rescan.
    outcomes: DashMap<RouteId, RouteOutcome>,
    bypass_cache: DashSet<RouteId>,
    history: Option<Arc<dyn ScanHistoryStore>>,
    started: AtomicBool,
    /// Scan-level cancellation seen by workers and in-flight tasks.
    cancel: CancellationToken,
    /// Stops background helpers (sweeper, history recorder).
    shutdown: CancellationToken,
    /// Held while a worker finishes a route, so drain handling is never
    /// observed half done.
    drain_lock: Mutex<()>,
    rescan_lock: parking_lot::Mutex<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns one scan: discovery, the worker set, the browser pool and the
/// session lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct ScanRuntime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for ScanRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session.borrow();
        f.debug_struct("ScanRuntime")
            .field("scan_id", &session.id)
            .field("site", &self.inner.config.site)
            .field("status", &session.status)
            .field("routes", &self.inner.registry.len())
            .field("pending", &self.inner.queue.pending_len())
            .field("inflight", &self.inner.queue.inflight_len())
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl ScanRuntime {
    pub fn builder(config: ScanConfig) -> ScanRuntimeBuilder {
        ScanRuntimeBuilder {
            config,
            driver: None,
            audit: None,
            fetcher: None,
            matcher: None,
            history: None,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.inner.config
    }

    /// Starts workers, warms the pool and seeds the queue from discovery.
    /// Returns once the initial route set is enqueued.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(ScanError::Conflict("scan already started".into()));
        }

        let mut handles = Vec::new();
        if let Some(history) = &inner.history {
            let recorder = ScanHistoryRecorder::new(Arc::clone(history));
            handles.push(recorder.spawn(inner.bus.subscribe(), inner.shutdown.clone()));
        }

        let session = inner.session.borrow().clone();
        info!(
            target: "scan::pipeline",
            scan = %session.id,
            site = %session.site,
            workers = inner.config.pipeline.max_concurrency,
            "scan started"
        );
        inner
            .events
            .emit(PipelineEventPayload::ScanStarted { session });

        inner.pool.set_scan_active(true);
        let warmed = inner.pool.warm().await;
        debug!(target: "scan::pool", warmed, "browser pool warmed");
        handles.push(inner.pool.start_sweeper(inner.shutdown.clone()));

        inner.queue.begin_seeding();
        for worker in 0..inner.config.pipeline.max_concurrency.max(1) {
            let runtime = Arc::clone(inner);
            let span = info_span!("scan_worker", worker);
            handles.push(tokio::spawn(runtime.worker_loop(worker).instrument(span)));
        }
        inner.handles.lock().await.extend(handles);

        let routes = inner.pipeline.discovery.discover().await;
        for route in routes {
            inner.enqueue(route);
        }

        let _guard = inner.drain_lock.lock().await;
        if inner.queue.end_seeding() {
            inner.on_drained();
        }
        Ok(())
    }

    /// Starts the scan and waits until its session closes.
    pub async fn run(&self) -> Result<ScanSession> {
        self.start().await?;
        self.wait_for_completion().await
    }

    /// Adds a route discovered outside the runtime. Returns false for
    /// duplicates, once `discovery.max_routes` is reached and once the
    /// session has closed.
    pub fn enqueue(&self, route: Route) -> bool {
        if self.inner.pipeline.discovery.frontier().force_admit(&route) == Admission::CapReached {
            debug!(target: "scan::discovery", route = %route.path, "route cap reached, not enqueued");
            return false;
        }
        self.inner.enqueue(route)
    }

    /// Resets the route's tasks to queued and runs it again, bypassing the
    /// cache.
    pub fn rescan_route(&self, id: &RouteId) -> Result<RouteReport> {
        self.inner.rescan(id)
    }

    /// Rescans every route that is not already queued or running.
    pub fn rescan_all(&self) -> Result<Vec<RouteReport>> {
        let mut accepted = Vec::new();
        for id in self.inner.registry.ids() {
            match self.inner.rescan(&id) {
                Ok(report) => accepted.push(report),
                Err(ScanError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(accepted)
    }

    /// Signals every worker to stop. In-flight routes are abandoned at their
    /// next suspension point and their browsers go back to the pool.
    pub fn cancel(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.cancel.cancel();
        let closed = inner.session.send_if_modified(|session| session.cancel());
        if closed {
            let session = inner.session.borrow().clone();
            info!(target: "scan::pipeline", scan = %session.id, "scan cancelled");
            inner
                .events
                .emit(PipelineEventPayload::SessionUpdated { session });
        }
        inner.pool.set_scan_active(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the session leaves `running`.
    pub async fn wait_for_completion(&self) -> Result<ScanSession> {
        let mut rx = self.inner.session.subscribe();
        let session = rx
            .wait_for(|session| session.status.is_closed())
            .await
            .map_err(|_| ScanError::Internal("scan session channel closed".into()))?
            .clone();
        // Drain handling may still be emitting `worker_finished`.
        drop(self.inner.drain_lock.lock().await);
        Ok(session)
    }

    /// Resolves once nothing is queued or in flight and drain handling
    /// (completion, `worker_finished`) has run.
    pub async fn wait_until_idle(&self) {
        let mut idle = self.inner.queue.subscribe_idle();
        if idle.wait_for(|idle| *idle).await.is_err() {
            return;
        }
        drop(self.inner.drain_lock.lock().await);
    }

    pub fn session(&self) -> ScanSession {
        self.inner.session.borrow().clone()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<ScanSession> {
        self.inner.session.subscribe()
    }

    pub fn reports(&self) -> Vec<RouteReport> {
        self.inner.registry.list()
    }

    pub fn report(&self, id: &RouteId) -> Option<RouteReport> {
        self.inner.registry.get(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<InProcPipelineBus> {
        Arc::clone(&self.inner.bus)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Evaluates the configured budget against the current report set.
    pub fn evaluate_budget(&self) -> BudgetResult {
        budget::evaluate(&self.inner.registry.list(), &self.inner.config.budget)
    }

    /// Cancels the scan if still running, joins workers and background
    /// helpers, and closes every browser.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        self.cancel();
        inner.pool.shutdown().await;
        inner.shutdown.cancel();

        let handles = std::mem::take(&mut *inner.handles.lock().await);
        for handle in handles {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                warn!(target: "scan::pipeline", error = %err, "scan task panicked");
            }
        }
        info!(target: "scan::pipeline", scan = %inner.session.borrow().id, "scan runtime shut down");
    }
}

impl RuntimeInner {
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(target: "scan::pipeline", worker, "worker started");
        while let Some(id) = self.queue.pop(&self.cancel).await {
            let bypass = self.bypass_cache.remove(&id).is_some();
            let run = self.pipeline.run(&id, bypass, &self.cancel).await;

            // Crawl feedback goes in before this route counts as finished,
            // otherwise the queue could look drained too early.
            for route in run.discovered {
                self.enqueue(route);
            }
            if let Some(outcome) = run.outcome {
                self.record_outcome(&id, outcome);
            }

            let _guard = self.drain_lock.lock().await;
            if self.queue.finish(&id) {
                self.on_drained();
            }
        }
        debug!(target: "scan::pipeline", worker, "worker stopped");
    }

    fn enqueue(&self, route: Route) -> bool {
        if self.cancel.is_cancelled() || self.session.borrow().status.is_closed() {
            return false;
        }
        let (report, created) = self.registry.insert_if_absent(route);
        if !created {
            return false;
        }
        self.session
            .send_modify(|session| session.record_route_added());
        debug!(target: "scan::pipeline", route = %report.route.path, "route enqueued");
        let id = report.id().clone();
        self.events
            .emit(PipelineEventPayload::TaskAdded { report });
        self.queue.push(id)
    }

    fn rescan(&self, id: &RouteId) -> Result<RouteReport> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled("scan was cancelled".into()));
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(ScanError::Conflict("scan has not started".into()));
        }

        let _guard = self.rescan_lock.lock();
        if !self.registry.contains(id) {
            return Err(ScanError::NotFound(format!("route {id}")));
        }
        if self.queue.is_pending_or_inflight(id) {
            return Err(ScanError::Conflict(format!("route {id} is already queued")));
        }

        let previous = self.outcomes.remove(id).map(|(_, outcome)| outcome);
        self.session
            .send_modify(|session| session.reopen_route(previous));
        let (_, report) = self
            .registry
            .update(id, RouteReport::reset_for_rescan)
            .ok_or_else(|| ScanError::NotFound(format!("route {id}")))?;

        self.bypass_cache.insert(id.clone());
        self.pool.set_scan_active(true);
        info!(target: "scan::pipeline", route = %report.route.path, "rescan requested");
        self.events.emit(PipelineEventPayload::TaskAdded {
            report: report.clone(),
        });
        self.queue.push(id.clone());
        Ok(report)
    }

    fn record_outcome(&self, id: &RouteId, outcome: RouteOutcome) {
        self.outcomes.insert(id.clone(), outcome);
        self.session
            .send_modify(|session| session.record_outcome(outcome));
        let session = self.session.borrow().clone();
        self.events
            .emit(PipelineEventPayload::SessionUpdated { session });
    }

    /// Runs when the queue is empty and nothing is in flight.
    fn on_drained(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let reports = self.registry.list();
        let category_means = budget::category_means(&reports);
        let all_terminal = reports.iter().all(RouteReport::is_terminal);

        let closed = self.session.send_if_modified(|session| {
            if session.status != ScanStatus::Running {
                return false;
            }
            if all_terminal {
                session.complete()
            } else {
                session.fail()
            }
        });
        let session = self.session.borrow().clone();
        if !all_terminal {
            warn!(target: "scan::pipeline", scan = %session.id, "queue drained with unfinished routes");
        }

        info!(
            target: "scan::pipeline",
            scan = %session.id,
            status = session.status.as_str(),
            scanned = session.scanned_count,
            failed = session.failed_count,
            "workers finished"
        );
        self.events.emit(PipelineEventPayload::WorkerFinished {
            session: session.clone(),
            category_means,
        });
        if closed {
            self.events
                .emit(PipelineEventPayload::SessionUpdated { session });
        }
        self.pool.set_scan_active(false);
    }
}
