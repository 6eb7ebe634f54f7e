use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ScanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Complete,
    Cancelled,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Complete => "complete",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, ScanStatus::Running)
    }
}

/// Terminal outcome of one route within a session, used to keep the
/// counters consistent across rescans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Scanned,
    Failed,
}

/// One scan run over a site.
///
/// `scanned_count + failed_count <= route_count` holds after every mutation,
/// and `completed_at` is written at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: ScanId,
    pub site: String,
    pub config_fingerprint: String,
    pub status: ScanStatus,
    pub route_count: u32,
    pub scanned_count: u32,
    pub failed_count: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    pub fn start(site: impl Into<String>, config_fingerprint: impl Into<String>) -> Self {
        Self {
            id: ScanId::new(),
            site: site.into(),
            config_fingerprint: config_fingerprint.into(),
            status: ScanStatus::Running,
            route_count: 0,
            scanned_count: 0,
            failed_count: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn record_route_added(&mut self) {
        self.route_count = self.route_count.saturating_add(1);
    }

    pub fn record_outcome(&mut self, outcome: RouteOutcome) {
        if self.scanned_count + self.failed_count >= self.route_count {
            return;
        }
        match outcome {
            RouteOutcome::Scanned => self.scanned_count += 1,
            RouteOutcome::Failed => self.failed_count += 1,
        }
    }

    /// Takes back a previously counted outcome when a route is rescanned.
    pub fn reopen_route(&mut self, previous: Option<RouteOutcome>) {
        match previous {
            Some(RouteOutcome::Scanned) => {
                self.scanned_count = self.scanned_count.saturating_sub(1)
            }
            Some(RouteOutcome::Failed) => self.failed_count = self.failed_count.saturating_sub(1),
            None => {}
        }
    }

    pub fn pending_count(&self) -> u32 {
        self.route_count
            .saturating_sub(self.scanned_count + self.failed_count)
    }

    pub fn complete(&mut self) -> bool {
        self.close(ScanStatus::Complete)
    }

    pub fn cancel(&mut self) -> bool {
        self.close(ScanStatus::Cancelled)
    }

    pub fn fail(&mut self) -> bool {
        self.close(ScanStatus::Failed)
    }

    fn close(&mut self, status: ScanStatus) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }
}
