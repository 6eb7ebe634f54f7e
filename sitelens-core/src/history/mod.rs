//! Durable record of scan sessions and their routes.
//!
//! The runtime never writes history directly: [`ScanHistoryRecorder`]
//! follows the pipeline event bus and forwards transitions to a
//! [`ScanHistoryStore`], logging (and otherwise ignoring) storage errors.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod recorder;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryScanHistory;
#[cfg(feature = "postgres")]
pub use postgres::PostgresScanHistory;
pub use recorder::ScanHistoryRecorder;

use crate::error::Result;
use crate::types::{RouteReport, ScanId, ScanSession, TaskStatus};

#[async_trait]
pub trait ScanHistoryStore: Send + Sync + fmt::Debug {
    async fn create_scan(&self, session: &ScanSession) -> Result<()>;

    /// Upserts the route row; a rescan re-adds an existing route.
    async fn add_scan_route(&self, scan_id: ScanId, report: &RouteReport) -> Result<()>;

    async fn update_scan(&self, session: &ScanSession) -> Result<()>;

    async fn update_scan_route(&self, scan_id: ScanId, report: &RouteReport) -> Result<()>;

    async fn update_scan_scores(&self, scan_id: ScanId, means: &BTreeMap<String, u8>)
    -> Result<()>;
}

/// Coarse route state stored alongside each history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteHistoryStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

impl RouteHistoryStatus {
    pub fn of(report: &RouteReport) -> Self {
        if report.has_failed() {
            RouteHistoryStatus::Failed
        } else if report.is_complete() {
            RouteHistoryStatus::Complete
        } else if report
            .tasks
            .values()
            .any(|state| state.status != TaskStatus::Queued)
        {
            RouteHistoryStatus::Running
        } else {
            RouteHistoryStatus::Queued
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteHistoryStatus::Queued => "queued",
            RouteHistoryStatus::Running => "running",
            RouteHistoryStatus::Complete => "complete",
            RouteHistoryStatus::Failed => "failed",
        }
    }
}
