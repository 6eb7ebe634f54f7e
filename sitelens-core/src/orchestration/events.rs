use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RouteReport, ScanId, ScanSession, TaskName};

/// Metadata envelope attached to every pipeline event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub scan_id: ScanId,
    /// Monotonic per runtime; observers use it to drop stale snapshots.
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(scan_id: ScanId, sequence: u64) -> Self {
        Self {
            version: 1,
            scan_id,
            sequence,
            emitted_at: Utc::now(),
        }
    }
}

/// Lifecycle transitions emitted by the scheduler and pipeline workers.
///
/// Route-level variants carry the full report snapshot taken right after
/// the transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEventPayload {
    ScanStarted {
        session: ScanSession,
    },
    /// A route entered the queue (first enqueue or rescan).
    TaskAdded {
        report: RouteReport,
    },
    TaskStarted {
        task: TaskName,
        report: RouteReport,
    },
    TaskComplete {
        task: TaskName,
        report: RouteReport,
    },
    TaskFailed {
        task: TaskName,
        error: String,
        report: RouteReport,
    },
    /// Queue drained and nothing in flight.
    WorkerFinished {
        session: ScanSession,
        category_means: BTreeMap<String, u8>,
    },
    SessionUpdated {
        session: ScanSession,
    },
}

impl PipelineEventPayload {
    pub fn report(&self) -> Option<&RouteReport> {
        match self {
            PipelineEventPayload::TaskAdded { report }
            | PipelineEventPayload::TaskStarted { report, .. }
            | PipelineEventPayload::TaskComplete { report, .. }
            | PipelineEventPayload::TaskFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub meta: EventMeta,
    pub payload: PipelineEventPayload,
}
