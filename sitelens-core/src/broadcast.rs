use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::orchestration::events::PipelineEvent;
use crate::types::RouteReport;

/// Wire frame pushed to live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFrame {
    pub response: RouteReport,
}

/// Fan-out of route snapshots to connected observers.
///
/// Each observer owns a bounded queue. A full queue drops that observer's
/// frame and a closed one is pruned; neither affects anyone else.
#[derive(Clone, Default)]
pub struct LiveBroadcast {
    observers: Arc<DashMap<Uuid, mpsc::Sender<ReportFrame>>>,
}

impl fmt::Debug for LiveBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveBroadcast")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

/// Delivery counts for one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

impl LiveBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer with a queue of `capacity` frames.
    pub fn connect(&self, capacity: usize) -> (Uuid, mpsc::Receiver<ReportFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        self.observers.insert(id, tx);
        tracing::debug!(target: "scan::broadcast", observer = %id, "observer connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: &Uuid) {
        if self.observers.remove(id).is_some() {
            tracing::debug!(target: "scan::broadcast", observer = %id, "observer disconnected");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn broadcast(&self, report: &RouteReport) -> Delivery {
        let frame = ReportFrame {
            response: report.clone(),
        };
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();

        for entry in self.observers.iter() {
            match entry.value().try_send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    tracing::debug!(target: "scan::broadcast", observer = %entry.key(), "observer queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.observers.remove(&id);
            delivery.pruned += 1;
        }
        delivery
    }

    /// Forwards route-level pipeline events until the bus closes or
    /// `shutdown` fires. Lagging skips ahead; observers resync from the
    /// report list.
    pub fn spawn_forwarder(
        &self,
        mut events: broadcast::Receiver<PipelineEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Some(report) = event.payload.report() {
                                this.broadcast(report);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(target: "scan::broadcast", skipped, "broadcast forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orchestration::events::{EventMeta, PipelineEventPayload};
    use crate::orchestration::runtime::InProcPipelineBus;
    use crate::types::{Route, RouteId, ScanId, TaskName};

    fn report(path: &str) -> RouteReport {
        RouteReport::new(Route {
            id: RouteId::from_path(path),
            url: format!("https://example.com{path}"),
            path: path.into(),
            dynamic: false,
            definition: None,
        })
    }

    #[tokio::test]
    async fn closed_observer_does_not_affect_others() {
        let live = LiveBroadcast::new();
        let (_, mut healthy) = live.connect(4);
        let (_, gone) = live.connect(4);
        drop(gone);

        let delivery = live.broadcast(&report("/about"));
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.pruned, 1);
        assert_eq!(live.observer_count(), 1);

        let frame = healthy.recv().await.unwrap();
        assert_eq!(frame.response.route.path, "/about");
    }

    #[tokio::test]
    async fn full_queue_drops_only_that_frame() {
        let live = LiveBroadcast::new();
        let (_, mut slow) = live.connect(1);

        live.broadcast(&report("/a"));
        let delivery = live.broadcast(&report("/b"));
        assert_eq!(delivery.dropped, 1);
        assert_eq!(live.observer_count(), 1);
        assert_eq!(slow.recv().await.unwrap().response.route.path, "/a");
    }

    #[test]
    fn frames_serialize_under_response_key() {
        let frame = ReportFrame {
            response: report("/"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["response"]["route"]["path"], "/");
    }

    #[tokio::test]
    async fn forwarder_relays_route_events() {
        let bus = InProcPipelineBus::new(16);
        let live = LiveBroadcast::new();
        let (_, mut rx) = live.connect(8);
        let shutdown = CancellationToken::new();
        let handle = live.spawn_forwarder(bus.subscribe(), shutdown.clone());

        bus.emit(PipelineEvent {
            meta: EventMeta::new(ScanId::new(), 1),
            payload: PipelineEventPayload::TaskStarted {
                task: TaskName::HtmlInspect,
                report: report("/pricing"),
            },
        });

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.response.route.path, "/pricing");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
