use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ScanHistoryStore;
use crate::error::Result;
use crate::orchestration::events::{PipelineEvent, PipelineEventPayload};

/// Bus subscriber that mirrors scan lifecycle into a [`ScanHistoryStore`].
#[derive(Debug, Clone)]
pub struct ScanHistoryRecorder {
    store: Arc<dyn ScanHistoryStore>,
}

impl ScanHistoryRecorder {
    pub fn new(store: Arc<dyn ScanHistoryStore>) -> Self {
        Self { store }
    }

    /// Drains `events` until the bus closes or `shutdown` fires. Pending
    /// events are handled before a shutdown is honoured.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<PipelineEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Ok(event) => self.record(&event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "scan::history", skipped, "history recorder lagged; rows may be stale");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!(target: "scan::history", "history recorder stopped");
        })
    }

    /// Forwards one event. Storage failures are logged and swallowed.
    pub async fn record(&self, event: &PipelineEvent) {
        if let Err(err) = self.apply(event).await {
            warn!(
                target: "scan::history",
                scan = %event.meta.scan_id,
                sequence = event.meta.sequence,
                error = %err,
                "history write failed"
            );
        }
    }

    async fn apply(&self, event: &PipelineEvent) -> Result<()> {
        let scan_id = event.meta.scan_id;
        match &event.payload {
            PipelineEventPayload::ScanStarted { session } => self.store.create_scan(session).await,
            PipelineEventPayload::TaskAdded { report } => {
                self.store.add_scan_route(scan_id, report).await
            }
            PipelineEventPayload::TaskStarted { report, .. }
            | PipelineEventPayload::TaskComplete { report, .. }
            | PipelineEventPayload::TaskFailed { report, .. } => {
                self.store.update_scan_route(scan_id, report).await
            }
            PipelineEventPayload::SessionUpdated { session } => {
                self.store.update_scan(session).await
            }
            PipelineEventPayload::WorkerFinished {
                session,
                category_means,
            } => {
                self.store
                    .update_scan_scores(scan_id, category_means)
                    .await?;
                self.store.update_scan(session).await
            }
        }
    }
}
