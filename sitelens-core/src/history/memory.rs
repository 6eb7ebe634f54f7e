use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::{RouteHistoryStatus, ScanHistoryStore};
use crate::error::{Result, ScanError};
use crate::types::{RouteId, RouteReport, ScanId, ScanSession};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRouteRecord {
    pub route_id: RouteId,
    pub path: String,
    pub status: RouteHistoryStatus,
    pub scores: BTreeMap<String, f64>,
    pub from_cache: bool,
    pub updated_at: DateTime<Utc>,
}

impl ScanRouteRecord {
    fn from_report(report: &RouteReport) -> Self {
        Self {
            route_id: report.id().clone(),
            path: report.route.path.clone(),
            status: RouteHistoryStatus::of(report),
            scores: report
                .score
                .as_ref()
                .map(|score| score.categories.clone())
                .unwrap_or_default(),
            from_cache: report.from_cache,
            updated_at: report.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRecord {
    pub session: ScanSession,
    pub routes: BTreeMap<RouteId, ScanRouteRecord>,
    pub category_means: BTreeMap<String, u8>,
}

/// Process-local history, the default when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryScanHistory {
    scans: RwLock<HashMap<ScanId, ScanRecord>>,
}

impl InMemoryScanHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&self, id: ScanId) -> Option<ScanRecord> {
        self.scans.read().get(&id).cloned()
    }

    /// Sessions newest first.
    pub fn sessions(&self) -> Vec<ScanSession> {
        let mut sessions: Vec<ScanSession> = self
            .scans
            .read()
            .values()
            .map(|record| record.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    fn with_scan<R>(&self, id: ScanId, f: impl FnOnce(&mut ScanRecord) -> R) -> Result<R> {
        let mut scans = self.scans.write();
        let record = scans
            .get_mut(&id)
            .ok_or_else(|| ScanError::NotFound(format!("scan {id}")))?;
        Ok(f(record))
    }
}

#[async_trait]
impl ScanHistoryStore for InMemoryScanHistory {
    async fn create_scan(&self, session: &ScanSession) -> Result<()> {
        let mut scans = self.scans.write();
        if scans.contains_key(&session.id) {
            return Err(ScanError::Conflict(format!("scan {} already recorded", session.id)));
        }
        scans.insert(
            session.id,
            ScanRecord {
                session: session.clone(),
                routes: BTreeMap::new(),
                category_means: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn add_scan_route(&self, scan_id: ScanId, report: &RouteReport) -> Result<()> {
        self.with_scan(scan_id, |record| {
            record
                .routes
                .insert(report.id().clone(), ScanRouteRecord::from_report(report));
        })
    }

    async fn update_scan(&self, session: &ScanSession) -> Result<()> {
        self.with_scan(session.id, |record| record.session = session.clone())
    }

    async fn update_scan_route(&self, scan_id: ScanId, report: &RouteReport) -> Result<()> {
        self.with_scan(scan_id, |record| {
            match record.routes.get_mut(report.id()) {
                Some(row) => *row = ScanRouteRecord::from_report(report),
                None => {
                    return Err(ScanError::NotFound(format!(
                        "route {} in scan {scan_id}",
                        report.id()
                    )));
                }
            }
            Ok(())
        })?
    }

    async fn update_scan_scores(
        &self,
        scan_id: ScanId,
        means: &BTreeMap<String, u8>,
    ) -> Result<()> {
        self.with_scan(scan_id, |record| record.category_means = means.clone())
    }
}
