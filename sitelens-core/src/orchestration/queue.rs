use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::types::RouteId;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<RouteId>,
    queued: HashSet<RouteId>,
    inflight: HashSet<RouteId>,
    seeding: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_empty() && !self.seeding
    }
}

/// FIFO of routes waiting for a worker, plus the in-flight set used to
/// detect when the scan has drained.
#[derive(Debug)]
pub struct RouteQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    idle: watch::Sender<bool>,
}

impl Default for RouteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteQueue {
    pub fn new() -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            idle,
        }
    }

    /// Queues a route. Returns false if it is already queued or running.
    pub fn push(&self, id: RouteId) -> bool {
        {
            let mut state = self.state.lock();
            if state.queued.contains(&id) || state.inflight.contains(&id) {
                return false;
            }
            state.queued.insert(id.clone());
            state.pending.push_back(id);
            self.idle.send_replace(false);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next route; `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<RouteId> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let popped = {
                let mut state = self.state.lock();
                let next = state.pending.pop_front();
                if let Some(id) = &next {
                    state.queued.remove(id);
                    state.inflight.insert(id.clone());
                }
                next.map(|id| (id, !state.pending.is_empty()))
            };
            if let Some((id, more)) = popped {
                // Pass the wake-up on so parked workers see remaining work.
                if more {
                    self.notify.notify_one();
                }
                return Some(id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Marks a route done. Returns true when this call drained the queue.
    pub fn finish(&self, id: &RouteId) -> bool {
        let mut state = self.state.lock();
        if !state.inflight.remove(id) {
            return false;
        }
        let drained = state.is_idle();
        if drained {
            self.idle.send_replace(true);
        }
        drained
    }

    /// Holds the queue open while the initial route set is being produced.
    pub fn begin_seeding(&self) {
        let mut state = self.state.lock();
        state.seeding = true;
        self.idle.send_replace(false);
    }

    pub fn end_seeding(&self) -> bool {
        let mut state = self.state.lock();
        state.seeding = false;
        let drained = state.is_idle();
        if drained {
            self.idle.send_replace(true);
        }
        drained
    }

    pub fn is_pending_or_inflight(&self, id: &RouteId) -> bool {
        let state = self.state.lock();
        state.queued.contains(id) || state.inflight.contains(id)
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.idle.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drains_once_everything_finished() {
        let queue = RouteQueue::new();
        let cancel = CancellationToken::new();
        let a = RouteId::from_path("/a");
        let b = RouteId::from_path("/b");
        assert!(queue.push(a.clone()));
        assert!(!queue.push(a.clone()));
        assert!(queue.push(b.clone()));

        assert_eq!(queue.pop(&cancel).await, Some(a.clone()));
        assert!(queue.is_pending_or_inflight(&a));
        assert!(!queue.push(a.clone()));
        assert_eq!(queue.pop(&cancel).await, Some(b.clone()));
        assert!(!queue.finish(&a));
        assert!(queue.finish(&b));
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn seeding_holds_the_queue_open() {
        let queue = RouteQueue::new();
        let cancel = CancellationToken::new();
        queue.begin_seeding();
        let id = RouteId::from_path("/");
        queue.push(id.clone());
        queue.pop(&cancel).await;
        assert!(!queue.finish(&id));
        assert!(queue.end_seeding());
    }

    #[tokio::test]
    async fn parked_worker_wakes_on_push_and_cancel() {
        let queue = Arc::new(RouteQueue::new());
        let cancel = CancellationToken::new();
        let worker = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(RouteId::from_path("/late"));
        assert_eq!(
            worker.await.unwrap(),
            Some(RouteId::from_path("/late"))
        );

        let parked = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(parked.await.unwrap(), None);
    }
}
