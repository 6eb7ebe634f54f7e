//! In-process fakes for the browser, audit engine and HTTP fetcher, so the
//! full pipeline can run in tests without Chrome or the network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::audit::{AuditEngine, AuditOptions, AuditOutput};
use crate::browser::{BrowserDriver, BrowserHandle, BrowserPage};
use crate::error::{Result, ScanError};
use crate::fetch::{DocumentFetcher, FetchedDocument};

const FAKE_BASE_PORT: u16 = 9222;

#[derive(Debug, Default)]
struct FakeDriverState {
    launched: AtomicUsize,
    failing_launches: AtomicUsize,
    alive: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Browser driver whose handles are flags. Clones share state, so a test
/// can keep one clone to inspect launches after handing the other to a pool.
#[derive(Debug, Clone, Default)]
pub struct FakeBrowserDriver {
    state: Arc<FakeDriverState>,
    pages: Option<Arc<HashMap<String, String>>>,
}

impl FakeBrowserDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page-capable variant: `goto(url)` followed by an `evaluate` returns
    /// the html registered for `url`.
    pub fn with_pages<I, K, V>(pages: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            state: Arc::default(),
            pages: Some(Arc::new(
                pages
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            )),
        }
    }

    /// The next `count` launches fail with [`ScanError::BrowserCrash`].
    pub fn failing_launches(self, count: usize) -> Self {
        self.state.failing_launches.store(count, Ordering::SeqCst);
        self
    }

    /// Successful launches so far.
    pub fn launch_count(&self) -> usize {
        self.state.launched.load(Ordering::SeqCst)
    }

    /// Marks every launched instance as dead.
    pub fn kill_all(&self) {
        for flag in self.state.alive.lock().iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeBrowserDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>> {
        let failing = self
            .state
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(ScanError::BrowserCrash("fake launch failure".into()));
        }
        let index = self.state.launched.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.alive.lock().push(Arc::clone(&alive));
        Ok(Box::new(FakeHandle {
            port: FAKE_BASE_PORT.wrapping_add(index as u16),
            alive,
            pages: self.pages.clone(),
        }))
    }

    fn supports_pages(&self) -> bool {
        self.pages.is_some()
    }
}

#[derive(Debug)]
struct FakeHandle {
    port: u16,
    alive: Arc<AtomicBool>,
    pages: Option<Arc<HashMap<String, String>>>,
}

#[async_trait]
impl BrowserHandle for FakeHandle {
    fn port(&self) -> u16 {
        self.port
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        let pages = self
            .pages
            .clone()
            .ok_or_else(|| ScanError::Unsupported("fake driver without pages".into()))?;
        Ok(Box::new(FakePage {
            pages,
            current: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct FakePage {
    pages: Arc<HashMap<String, String>>,
    current: Mutex<Option<String>>,
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, url: &str) -> Result<()> {
        if !self.pages.contains_key(url) {
            return Err(ScanError::Http(format!("{url} returned 404")));
        }
        *self.current.lock() = Some(url.to_string());
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
        let current = self.current.lock().clone();
        let html = current
            .and_then(|url| self.pages.get(&url).cloned())
            .ok_or_else(|| ScanError::Internal("no page loaded".into()))?;
        Ok(serde_json::Value::String(html))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Failure injected into a scripted audit run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    Timeout,
    Crash,
    Error(String),
}

impl ScriptedFailure {
    fn into_error(self, timeout: Duration) -> ScanError {
        match self {
            ScriptedFailure::Timeout => ScanError::AuditTimeout(timeout),
            ScriptedFailure::Crash => ScanError::BrowserCrash("scripted crash".into()),
            ScriptedFailure::Error(message) => ScanError::Audit(message),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    scores: Mutex<HashMap<String, BTreeMap<String, f64>>>,
    failures: Mutex<HashMap<String, VecDeque<ScriptedFailure>>>,
    calls: Mutex<HashMap<String, usize>>,
    ports: Mutex<Vec<u16>>,
    delay: Mutex<Option<Duration>>,
}

/// Audit engine returning canned scores per route path. Unconfigured
/// paths score 0.9 in every requested category.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAuditEngine {
    state: Arc<ScriptState>,
}

pub const DEFAULT_SCRIPTED_SCORE: f64 = 0.9;

impl ScriptedAuditEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scores(self, path: &str, scores: &[(&str, f64)]) -> Self {
        self.state.scores.lock().insert(
            path.to_string(),
            scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        );
        self
    }

    /// The next `times` runs for `path` fail with `failure`.
    pub fn fail_times(self, path: &str, times: usize, failure: ScriptedFailure) -> Self {
        self.state
            .failures
            .lock()
            .entry(path.to_string())
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
        self
    }

    /// Every run sleeps this long first.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock() = Some(delay);
        self
    }

    pub fn calls(&self, path: &str) -> usize {
        self.state.calls.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().values().sum()
    }

    /// Debugging ports seen, in call order.
    pub fn ports(&self) -> Vec<u16> {
        self.state.ports.lock().clone()
    }
}

#[async_trait]
impl AuditEngine for ScriptedAuditEngine {
    async fn run_audit(&self, url: &str, options: &AuditOptions, port: u16) -> Result<AuditOutput> {
        let path = Url::parse(url)
            .map(|parsed| parsed.path().to_string())
            .map_err(|e| ScanError::Audit(format!("bad url {url}: {e}")))?;
        *self.state.calls.lock().entry(path.clone()).or_default() += 1;
        self.state.ports.lock().push(port);

        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .state
            .failures
            .lock()
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        if let Some(failure) = failure {
            return Err(failure.into_error(options.timeout));
        }

        let scores = self
            .state
            .scores
            .lock()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| {
                options
                    .categories
                    .iter()
                    .map(|category| (category.clone(), DEFAULT_SCRIPTED_SCORE))
                    .collect()
            });
        let categories: serde_json::Map<String, serde_json::Value> = scores
            .into_iter()
            .map(|(id, score)| (id, serde_json::json!({ "score": score })))
            .collect();

        Ok(AuditOutput {
            html: format!("<html><body>audit of {url}</body></html>"),
            json: serde_json::json!({ "finalUrl": url, "categories": categories }).to_string(),
        })
    }
}

/// Offline [`DocumentFetcher`] serving registered bodies; anything else is
/// a 404.
#[derive(Debug, Clone, Default)]
pub struct StaticSiteFetcher {
    documents: Arc<Mutex<HashMap<String, FetchedDocument>>>,
    fetches: Arc<Mutex<HashMap<String, usize>>>,
}

impl StaticSiteFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, body: impl Into<String>) -> Self {
        let content_type = guess_content_type(url);
        self.with_document(url, 200, content_type, body)
    }

    pub fn with_document(
        self,
        url: &str,
        status: u16,
        content_type: &str,
        body: impl Into<String>,
    ) -> Self {
        self.documents.lock().insert(
            url.to_string(),
            FetchedDocument {
                url: url.to_string(),
                status,
                content_type: Some(content_type.to_string()),
                body: body.into(),
            },
        );
        self
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().get(url).copied().unwrap_or(0)
    }
}

fn guess_content_type(url: &str) -> &'static str {
    if url.ends_with(".xml") {
        "application/xml"
    } else if url.ends_with(".txt") {
        "text/plain"
    } else {
        "text/html; charset=utf-8"
    }
}

#[async_trait]
impl DocumentFetcher for StaticSiteFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
        *self.fetches.lock().entry(url.to_string()).or_default() += 1;
        let found = self.documents.lock().get(url).cloned();
        Ok(found.unwrap_or_else(|| FetchedDocument {
            url: url.to_string(),
            status: 404,
            content_type: Some("text/html".into()),
            body: String::new(),
        }))
    }
}
