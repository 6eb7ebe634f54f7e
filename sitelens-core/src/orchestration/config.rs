use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::discovery::filters::RouteFilter;
use crate::discovery::sampling::RouteSampler;
use crate::error::{Result, ScanError};

/// Everything a scan needs to know, loaded once before the first enqueue.
///
/// All sections carry defaults so a config file only has to name the site
/// and whatever it wants to override.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScanConfig {
    /// Root URL of the site to audit.
    pub site: String,
    /// How routes are found and narrowed down.
    pub discovery: DiscoveryConfig,
    /// Headless browser pool sizing and eviction.
    pub pool: PoolConfig,
    /// Worker count and per-task timeouts.
    pub pipeline: PipelineConfig,
    /// Retry/backoff policy for transient task failures.
    pub retry: RetryConfig,
    /// Audit engine invocation settings.
    pub audit: AuditConfig,
    /// Artifact cache location and freshness.
    pub cache: CacheConfig,
    /// Minimum acceptable mean score (0-100) per audit category.
    pub budget: BTreeMap<String, u8>,
    /// Event fan-out sizing.
    pub broadcast: BroadcastConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    #[default]
    Sitemap,
    Crawl,
    StaticDefinitions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Sitemap locations relative to the site root, in addition to the ones
    /// announced in robots.txt.
    pub sitemap_paths: Vec<String>,
    /// Concrete URLs always added to the route set.
    pub urls: Vec<String>,
    /// Glob or regex patterns; empty means everything.
    pub include: Vec<String>,
    /// Glob or regex patterns; wins over `include`.
    pub exclude: Vec<String>,
    /// Hard cap on routes per scan, crawl feedback included.
    pub max_routes: usize,
    /// Pattern -> maximum number of matching routes.
    pub sampling: BTreeMap<String, usize>,
    /// Per-definition cap for dynamic routes not covered by `sampling`.
    pub dynamic_sampling: Option<usize>,
    /// Keep (sorted) query strings as part of the canonical path.
    pub keep_query: bool,
    pub fetch_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Sitemap,
            sitemap_paths: vec!["/sitemap.xml".to_string()],
            urls: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            max_routes: 200,
            sampling: BTreeMap::new(),
            dynamic_sampling: None,
            keep_query: false,
            fetch_timeout_secs: 15,
        }
    }
}

impl DiscoveryConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    /// Idle instances older than this are evicted (down to `min_instances`).
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub launch_timeout_secs: u64,
    /// Browser executable; falls back to `$CHROME_PATH` and common names.
    pub chrome_path: Option<PathBuf>,
    pub chrome_args: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 2,
            idle_timeout_secs: 60,
            sweep_interval_secs: 15,
            launch_timeout_secs: 30,
            chrome_path: None,
            chrome_args: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of parallel route workers.
    pub max_concurrency: usize,
    pub inspect_timeout_secs: u64,
    pub audit_timeout_secs: u64,
    /// Inspect through a browser page instead of a plain HTTP fetch.
    pub render_javascript: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            inspect_timeout_secs: 30,
            audit_timeout_secs: 120,
            render_javascript: false,
        }
    }
}

impl PipelineConfig {
    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per task, the first one included.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Mobile,
    Desktop,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Mobile => "mobile",
            Device::Desktop => "desktop",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Throttle {
    /// Simulated slow-4G throttling applied by the audit engine.
    #[default]
    Simulate,
    Devtools,
    Off,
}

impl Throttle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Throttle::Simulate => "simulate",
            Throttle::Devtools => "devtools",
            Throttle::Off => "off",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Audit CLI executable.
    pub binary: PathBuf,
    pub device: Device,
    pub throttle: Throttle,
    pub categories: Vec<String>,
    pub extra_args: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("lighthouse"),
            device: Device::Mobile,
            throttle: Throttle::Simulate,
            categories: vec![
                "performance".to_string(),
                "accessibility".to_string(),
                "best-practices".to_string(),
                "seo".to_string(),
            ],
            extra_args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub root: PathBuf,
    /// Re-run audits even when a fresh artifact exists (HTML is still reused).
    pub force_audit: bool,
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from(".sitelens/cache"),
            force_audit: false,
            max_age_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Capacity of the in-process pipeline event bus.
    pub event_capacity: usize,
    /// Outbound frames buffered per live observer before frames are dropped.
    pub observer_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            observer_queue: 64,
        }
    }
}

impl ScanConfig {
    pub fn for_site(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Self::default()
        }
    }

    pub fn site_url(&self) -> Result<Url> {
        let url = Url::parse(self.site.trim()).map_err(|e| {
            ScanError::ConfigValidation(format!("site `{}` is not a valid URL: {e}", self.site))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ScanError::ConfigValidation(format!(
                "site `{}` must be an http(s) URL with a host",
                self.site
            )));
        }
        Ok(url)
    }

    /// Rejects configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.site_url()?;

        if self.pool.max_instances == 0 {
            return Err(ScanError::ConfigValidation(
                "pool.max_instances must be at least 1".into(),
            ));
        }
        if self.pool.min_instances > self.pool.max_instances {
            return Err(ScanError::ConfigValidation(format!(
                "pool.min_instances ({}) exceeds pool.max_instances ({})",
                self.pool.min_instances, self.pool.max_instances
            )));
        }
        if self.pipeline.max_concurrency == 0 {
            return Err(ScanError::ConfigValidation(
                "pipeline.max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScanError::ConfigValidation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.discovery.max_routes == 0 {
            return Err(ScanError::ConfigValidation(
                "discovery.max_routes must be at least 1".into(),
            ));
        }
        if self.audit.categories.is_empty() {
            return Err(ScanError::ConfigValidation(
                "audit.categories must name at least one category".into(),
            ));
        }
        if let Some((category, threshold)) = self.budget.iter().find(|(_, t)| **t > 100) {
            return Err(ScanError::ConfigValidation(format!(
                "budget.{category} = {threshold} is outside 0..=100"
            )));
        }
        if self.broadcast.event_capacity == 0 || self.broadcast.observer_queue == 0 {
            return Err(ScanError::ConfigValidation(
                "broadcast capacities must be non-zero".into(),
            ));
        }

        RouteFilter::new(&self.discovery.include, &self.discovery.exclude)?;
        RouteSampler::new(&self.discovery.sampling, self.discovery.dynamic_sampling)?;
        Ok(())
    }

    /// Hash of the settings that change what a scan produces. Stored on the
    /// session so runs with different settings can be told apart.
    pub fn fingerprint(&self) -> String {
        let relevant = serde_json::json!({
            "site": self.site,
            "discovery": self.discovery,
            "audit": {
                "device": self.audit.device,
                "throttle": self.audit.throttle,
                "categories": self.audit.categories,
            },
            "render_javascript": self.pipeline.render_javascript,
        });
        let digest = Sha256::digest(relevant.to_string().as_bytes());
        hex::encode(digest)
    }
}
