use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::fingerprint::CacheFingerprint;
use crate::error::{Result, ScanError};
use crate::types::{RouteId, SeoMeta};

const KEY_PREFIX: &str = "routes/v1";

/// Output of the html-inspect stage. Cached independently of the audit
/// fingerprint so a forced re-audit can still reuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub html: String,
    pub seo: SeoMeta,
    pub links: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Output of the audit-execute stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditArtifact {
    pub scores: BTreeMap<String, f64>,
    pub report_json: String,
    pub report_html: String,
    pub audited_at: DateTime<Utc>,
}

/// Everything needed to complete a route's pipeline without a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteArtifacts {
    pub route_path: String,
    pub fingerprint: CacheFingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageSnapshot>,
    pub audit: AuditArtifact,
}

/// Stored under the audit key; the page lives under its own key.
#[derive(Debug, Serialize, Deserialize)]
struct AuditEntry {
    route_path: String,
    fingerprint: CacheFingerprint,
    audit: AuditArtifact,
}

/// Typed wrapper over `cacache`.
///
/// Every failure degrades to a miss with a warning; a corrupt entry is
/// removed so the next `put` rewrites it.
#[derive(Clone, Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    max_age: Option<Duration>,
}

pub fn page_key(route_id: &RouteId) -> String {
    format!("{KEY_PREFIX}/{route_id}/html")
}

pub fn audit_key(route_id: &RouteId, fingerprint: &CacheFingerprint) -> String {
    format!("{KEY_PREFIX}/{route_id}/audit/{fingerprint}")
}

fn route_prefix(route_id: &RouteId) -> String {
    format!("{KEY_PREFIX}/{route_id}/")
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full artifact set for `(route_id, fingerprint)`, or `None` on miss.
    pub async fn get(
        &self,
        route_id: &RouteId,
        fingerprint: &CacheFingerprint,
    ) -> Option<RouteArtifacts> {
        let entry: AuditEntry = self.read_entry(&audit_key(route_id, fingerprint)).await?;
        if &entry.fingerprint != fingerprint {
            warn!(target: "scan::cache", %route_id, "fingerprint mismatch in cached entry");
            return None;
        }
        let page = self.get_page(route_id).await;
        debug!(target: "scan::cache", %route_id, "audit cache hit");
        Some(RouteArtifacts {
            route_path: entry.route_path,
            fingerprint: entry.fingerprint,
            page,
            audit: entry.audit,
        })
    }

    pub async fn get_page(&self, route_id: &RouteId) -> Option<PageSnapshot> {
        self.read_entry(&page_key(route_id)).await
    }

    /// Writes the audit entry and, when present, the page snapshot.
    pub async fn put(&self, route_id: &RouteId, artifacts: &RouteArtifacts) -> Result<()> {
        if let Some(page) = &artifacts.page {
            self.put_page(route_id, page).await?;
        }
        let entry = AuditEntry {
            route_path: artifacts.route_path.clone(),
            fingerprint: artifacts.fingerprint.clone(),
            audit: artifacts.audit.clone(),
        };
        self.write_entry(&audit_key(route_id, &artifacts.fingerprint), &entry)
            .await
    }

    pub async fn put_page(&self, route_id: &RouteId, page: &PageSnapshot) -> Result<()> {
        self.write_entry(&page_key(route_id), page).await
    }

    /// Drops every artifact of the route at `path`. Returns the number of
    /// index entries removed.
    pub async fn invalidate(&self, path: &str) -> Result<usize> {
        let route_id = RouteId::from_path(path);
        self.invalidate_route(&route_id).await
    }

    pub async fn invalidate_route(&self, route_id: &RouteId) -> Result<usize> {
        let prefix = route_prefix(route_id);
        let root = self.root.clone();
        let keys = tokio::task::spawn_blocking(move || {
            cacache::list_sync(&root)
                .filter_map(|entry| entry.ok())
                .map(|meta| meta.key)
                .filter(|key| key.starts_with(&prefix))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ScanError::Cache(format!("cache listing task failed: {e}")))?;

        for key in &keys {
            self.remove(key).await?;
        }
        debug!(target: "scan::cache", %route_id, removed = keys.len(), "route cache invalidated");
        Ok(keys.len())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        cacache::index::RemoveOpts::new()
            .remove_fully(true)
            .remove(&self.root, key)
            .await
            .map_err(|e| ScanError::Cache(format!("cacache remove failed: {e}")))
    }

    async fn write_entry<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        cacache::write(&self.root, key, bytes)
            .await
            .map_err(|e| ScanError::Cache(format!("cacache write failed: {e}")))?;
        Ok(())
    }

    async fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(max_age) = self.max_age {
            match cacache::metadata(&self.root, key).await {
                Ok(Some(meta)) => {
                    // `cacache` records unix millis in `time`.
                    let millis = u64::try_from(meta.time).unwrap_or(u64::MAX);
                    let written_at = UNIX_EPOCH + Duration::from_millis(millis);
                    let age = SystemTime::now()
                        .duration_since(written_at)
                        .unwrap_or_default();
                    if age > max_age {
                        debug!(target: "scan::cache", key, ?age, "cache entry expired");
                        return None;
                    }
                }
                Ok(None) => return None,
                Err(err) => {
                    warn!(target: "scan::cache", key, error = %err, "cache metadata lookup failed");
                    return None;
                }
            }
        }

        let bytes = match cacache::read(&self.root, key).await {
            Ok(bytes) => bytes,
            Err(cacache::Error::EntryNotFound(_, _)) => return None,
            Err(
                err @ (cacache::Error::IntegrityError(_) | cacache::Error::SizeMismatch(_, _)),
            ) => {
                warn!(target: "scan::cache", key, error = %err, "corrupt cache entry, discarding");
                self.discard(key).await;
                return None;
            }
            Err(err @ (cacache::Error::IoError(_, _) | cacache::Error::SerdeError(_, _))) => {
                warn!(target: "scan::cache", key, error = %err, "cache read failed");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(target: "scan::cache", key, error = %err, "undecodable cache entry, discarding");
                self.discard(key).await;
                None
            }
        }
    }

    async fn discard(&self, key: &str) {
        if let Err(err) = self.remove(key).await {
            warn!(target: "scan::cache", key, error = %err, "failed to remove corrupt entry");
        }
    }
}
